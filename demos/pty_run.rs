//! Runs a command under a pseudo-terminal and streams its output.
//!
//! `cargo run --example pty_run -- ls -l` (defaults to `/bin/sh -c date`).

use std::io::Write;
use std::sync::OnceLock;

use devio::{Control, DevId, Handler, PtyFlags, Reactor, StopReason, Stopper};

static STOPPER: OnceLock<Stopper> = OnceLock::new();

extern "C" fn on_sigint(_sig: libc::c_int) {
    if let Some(stopper) = STOPPER.get() {
        stopper.request(StopReason::Termination);
    }
}

struct Tee;

impl Handler for Tee {
    fn on_read(&mut self, _reactor: &mut Reactor, _dev: DevId, data: &[u8]) -> Control {
        std::io::stdout().write_all(data).ok();
        Control::Continue
    }

    fn on_close(&mut self, _reactor: &mut Reactor, _dev: DevId, _side: devio::Side) {
        println!(">> pty closed");
    }
}

fn main() -> devio::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (argv, flags): (Vec<&str>, PtyFlags) = if args.is_empty() {
        (vec!["date"], PtyFlags::SHELL)
    } else {
        (args.iter().map(String::as_str).collect(), PtyFlags::empty())
    };

    let mut reactor = Reactor::new()?;
    let (_dev, pid) = reactor.make_pty(&argv, flags, Box::new(Tee))?;
    println!(">> child pid {}", pid);

    STOPPER.set(reactor.stopper()).ok();
    let handler = on_sigint as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }

    reactor.run()?;
    reactor.close();
    Ok(())
}
