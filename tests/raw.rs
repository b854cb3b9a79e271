use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use devio::{Control, DevId, ErrorKind, Handler, RawFlags, Reactor, Readiness, Side};

mod util;
use util::{init_with_reactor, new_log, run_until, Ev, Log};

struct Recording {
    log: Log,
}

impl Handler for Recording {
    fn on_read(&mut self, _r: &mut Reactor, _dev: DevId, data: &[u8]) -> Control {
        self.log.borrow_mut().push(Ev::Read(data.to_vec()));
        Control::Continue
    }

    fn on_write(
        &mut self,
        _r: &mut Reactor,
        _dev: DevId,
        wrlen: Option<usize>,
        ctx: usize,
    ) -> Control {
        self.log.borrow_mut().push(Ev::Write(wrlen, ctx));
        Control::Continue
    }

    fn on_ready(&mut self, _r: &mut Reactor, _dev: DevId, ready: Readiness) -> Control {
        if ready.readable {
            self.log.borrow_mut().push(Ev::Ready);
        }
        Control::Continue
    }

    fn on_close(&mut self, _r: &mut Reactor, _dev: DevId, side: Side) {
        self.log.borrow_mut().push(Ev::Close(side));
    }
}

#[test]
fn adopted_handle_streams_reads_and_writes() {
    let mut reactor = init_with_reactor();
    let log = new_log();

    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let dev = reactor
        .adopt(
            OwnedFd::from(ours),
            RawFlags::empty(),
            Box::new(Recording { log: log.clone() }),
        )
        .unwrap();

    theirs.write_all(b"raw bytes").unwrap();
    run_until(&mut reactor, Duration::from_secs(2), || {
        log.borrow().contains(&Ev::Read(b"raw bytes".to_vec()))
    });

    reactor.write(dev, b"reply", 5).unwrap();
    run_until(&mut reactor, Duration::from_secs(2), || {
        log.borrow().contains(&Ev::Write(Some(5), 5))
    });

    use std::io::Read;
    let mut buf = [0u8; 16];
    let n = theirs.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"reply");

    // Peer hangup ends the device.
    drop(theirs);
    reactor.run().unwrap();
    assert!(log.borrow().contains(&Ev::Close(Side::Whole)));
    assert_eq!(reactor.device_count(), 0);
}

#[test]
fn notify_only_reports_readiness_without_io() {
    let mut reactor = init_with_reactor();
    let log = new_log();

    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let dev = reactor
        .adopt(
            OwnedFd::from(ours),
            RawFlags::NOTIFY_ONLY | RawFlags::DISABLE_OUT,
            Box::new(Recording { log: log.clone() }),
        )
        .unwrap();

    theirs.write_all(b"wake").unwrap();
    run_until(&mut reactor, Duration::from_secs(2), || {
        log.borrow().contains(&Ev::Ready)
    });
    // No stream I/O happened: the bytes are still in the socket and no
    // on_read was delivered.
    assert!(!log.borrow().iter().any(|ev| matches!(ev, Ev::Read(..))));

    // The write protocol is unavailable in notify-only mode.
    let err = reactor.write(dev, b"nope", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);

    reactor.halt(dev);
    reactor.run().unwrap();
}

#[test]
fn disable_in_never_reads() {
    let mut reactor = init_with_reactor();
    let log = new_log();

    let (ours, mut theirs) = UnixStream::pair().unwrap();
    reactor
        .adopt(
            OwnedFd::from(ours),
            RawFlags::DISABLE_IN,
            Box::new(Recording { log: log.clone() }),
        )
        .unwrap();

    theirs.write_all(b"invisible").unwrap();
    for _ in 0..5 {
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
    assert!(!log.borrow().iter().any(|ev| matches!(ev, Ev::Read(..))));
}
