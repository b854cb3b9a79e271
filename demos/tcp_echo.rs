//! A TCP echo server on the reactor.
//!
//! Run with `cargo run --example tcp_echo`, then try it out with
//! `nc 127.0.0.1 9000`. Ctrl-C stops the reactor through its self-pipe.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::OnceLock;

use devio::{Control, DevId, Handler, Reactor, Side, StopReason, Stopper};

static STOPPER: OnceLock<Stopper> = OnceLock::new();

extern "C" fn on_sigint(_sig: libc::c_int) {
    // Stopper::request is async-signal-safe: one atomic store and one
    // one-byte write to the reactor's self-pipe.
    if let Some(stopper) = STOPPER.get() {
        stopper.request(StopReason::Termination);
    }
}

struct Acceptor;

impl Handler for Acceptor {
    fn on_accept(
        &mut self,
        reactor: &mut Reactor,
        _dev: DevId,
        conn: OwnedFd,
        peer: SocketAddr,
    ) -> Control {
        println!("accepted connection from {}", peer);
        if let Err(err) = reactor.make_stream_from(conn, Box::new(Echo)) {
            eprintln!("cannot wrap connection: {}", err);
        }
        Control::Continue
    }
}

struct Echo;

impl Handler for Echo {
    fn on_read(&mut self, reactor: &mut Reactor, dev: DevId, data: &[u8]) -> Control {
        if data.is_empty() {
            // EOF; the reactor tears the stream down by itself.
            return Control::Continue;
        }
        match reactor.write(dev, data, 0) {
            Ok(()) => Control::Continue,
            Err(_) => Control::Halt,
        }
    }

    fn on_close(&mut self, _reactor: &mut Reactor, _dev: DevId, _side: Side) {
        println!("connection closed");
    }
}

fn main() -> devio::Result<()> {
    env_logger::init();

    let mut reactor = Reactor::new()?;
    let addr = "127.0.0.1:9000".parse().unwrap();
    let (_listener, bound) = reactor.make_listener(addr, 128, Box::new(Acceptor))?;
    println!("listening on {}", bound);

    STOPPER.set(reactor.stopper()).ok();
    let handler = on_sigint as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let reason = reactor.run()?;
    println!("reactor stopped: {:?}", reason);
    reactor.close();
    Ok(())
}
