use std::fs::File;
use std::io::{Read, Write};
use std::time::Duration;

use devio::{Control, DevId, Handler, ErrorKind, Reactor, Side};

mod util;
use util::{count_closes, init_with_reactor, new_log, positions, run_until, Ev, Log};

const ECHO_CTX: usize = 0xABCD;

struct Echo {
    log: Log,
}

impl Handler for Echo {
    fn on_read(&mut self, r: &mut Reactor, dev: DevId, data: &[u8]) -> Control {
        self.log.borrow_mut().push(Ev::Read(data.to_vec()));
        if !data.is_empty() {
            r.write(dev, data, ECHO_CTX).unwrap();
        }
        Control::Continue
    }

    fn on_write(
        &mut self,
        r: &mut Reactor,
        dev: DevId,
        wrlen: Option<usize>,
        ctx: usize,
    ) -> Control {
        self.log.borrow_mut().push(Ev::Write(wrlen, ctx));
        r.halt(dev);
        Control::Continue
    }

    fn on_close(&mut self, _r: &mut Reactor, _dev: DevId, side: Side) {
        self.log.borrow_mut().push(Ev::Close(side));
    }
}

#[test]
fn echo_roundtrip_and_close_order() {
    let mut reactor = init_with_reactor();
    let log = new_log();
    let (pipe, peer) = reactor.make_pipe(Box::new(Echo { log: log.clone() })).unwrap();
    let _ = pipe;

    let mut input = File::from(peer.input);
    input.write_all(b"hello").unwrap();

    reactor.run().unwrap();

    assert_eq!(
        log.borrow().as_slice(),
        &[
            Ev::Read(b"hello".to_vec()),
            Ev::Write(Some(5), ECHO_CTX),
            Ev::Close(Side::In),
            Ev::Close(Side::Out),
            Ev::Close(Side::Whole),
        ]
    );
    assert_eq!(reactor.device_count(), 0);

    let mut echoed = Vec::new();
    let mut output = File::from(peer.output);
    output.read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, b"hello");
}

struct HaltInRead {
    log: Log,
}

impl Handler for HaltInRead {
    fn on_read(&mut self, r: &mut Reactor, dev: DevId, data: &[u8]) -> Control {
        self.log.borrow_mut().push(Ev::Read(data.to_vec()));
        // Queue a write that can never drain, then halt ourselves. The
        // chunk must be flushed with `wrlen = None`.
        r.write(dev, b"never sent", 7).unwrap();
        r.halt(dev);
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

    fn on_close(&mut self, _r: &mut Reactor, _dev: DevId, side: Side) {
        self.log.borrow_mut().push(Ev::Close(side));
    }
}

#[test]
fn halt_inside_on_read_flushes_pending_writes() {
    let mut reactor = init_with_reactor();
    let log = new_log();
    let (_pipe, peer) = reactor
        .make_pipe(Box::new(HaltInRead { log: log.clone() }))
        .unwrap();

    // More than one read buffer's worth, so a second read would happen if
    // the halt did not stop the batch.
    let mut input = File::from(peer.input);
    input.write_all(&vec![b'a'; 6000]).unwrap();

    reactor.run().unwrap();

    let events = log.borrow();
    // Exactly one read: halting in the callback stops the batch.
    let reads: Vec<usize> = events
        .iter()
        .filter_map(|ev| match ev {
            Ev::Read(data) => Some(data.len()),
            _ => None,
        })
        .collect();
    assert_eq!(reads, vec![4096]);
    assert!(events.contains(&Ev::Write(None, 7)), "events: {:?}", events);
    drop(events);
    assert_eq!(count_closes(&log), 3);
}

struct CountWrites {
    log: Log,
    expected: usize,
}

impl Handler for CountWrites {
    fn on_write(
        &mut self,
        r: &mut Reactor,
        dev: DevId,
        wrlen: Option<usize>,
        ctx: usize,
    ) -> Control {
        self.log.borrow_mut().push(Ev::Write(wrlen, ctx));
        let done = self
            .log
            .borrow()
            .iter()
            .filter(|ev| matches!(ev, Ev::Write(..)))
            .count();
        if done == self.expected {
            r.halt(dev);
        }
        Control::Continue
    }

    fn on_close(&mut self, _r: &mut Reactor, _dev: DevId, side: Side) {
        self.log.borrow_mut().push(Ev::Close(side));
    }
}

#[test]
fn backpressure_completes_chunks_in_enqueue_order() {
    const CHUNKS: usize = 10;
    const CHUNK_LEN: usize = 64 * 1024;

    let mut reactor = init_with_reactor();
    let log = new_log();
    let (pipe, peer) = reactor
        .make_pipe(Box::new(CountWrites {
            log: log.clone(),
            expected: CHUNKS,
        }))
        .unwrap();

    // A slow consumer on the peer end keeps the pipe full.
    let reader = std::thread::spawn(move || {
        let mut output = File::from(peer.output);
        let mut sink = vec![0u8; 8192];
        let mut total = 0usize;
        loop {
            match output.read(&mut sink) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => panic!("peer read failed: {}", err),
            }
        }
        total
    });

    let payload: Vec<u8> = (0..CHUNK_LEN).map(|_| rand::random::<u8>()).collect();
    for i in 0..CHUNKS {
        reactor.write(pipe, &payload, i).unwrap();
    }

    reactor.run().unwrap();
    drop(peer.input); // unblock the reader with EOF

    let total = reader.join().unwrap();
    assert_eq!(total, CHUNKS * CHUNK_LEN);

    let writes: Vec<usize> = log
        .borrow()
        .iter()
        .filter_map(|ev| match ev {
            Ev::Write(Some(len), ctx) => {
                assert_eq!(*len, CHUNK_LEN);
                Some(*ctx)
            }
            _ => None,
        })
        .collect();
    assert_eq!(writes, (0..CHUNKS).collect::<Vec<_>>());
}

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

    fn on_close(&mut self, _r: &mut Reactor, _dev: DevId, side: Side) {
        self.log.borrow_mut().push(Ev::Close(side));
    }
}

#[test]
fn close_side_leaves_the_other_alive() {
    let mut reactor = init_with_reactor();
    let log = new_log();
    let (pipe, peer) = reactor
        .make_pipe(Box::new(Recording { log: log.clone() }))
        .unwrap();

    reactor.close_side(pipe, Side::In).unwrap();
    run_until(&mut reactor, Duration::from_secs(2), || {
        log.borrow().contains(&Ev::Close(Side::In))
    });
    assert_eq!(count_closes(&log), 1);

    // The writing side still works.
    reactor.write(pipe, b"still here", 3).unwrap();
    run_until(&mut reactor, Duration::from_secs(2), || {
        log.borrow().contains(&Ev::Write(Some(10), 3))
    });

    let mut output = File::from(peer.output);
    let mut buf = [0u8; 32];
    let n = output.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"still here");

    reactor.halt(pipe);
    reactor.run().unwrap();
    let order: Vec<Ev> = log
        .borrow()
        .iter()
        .filter(|ev| matches!(ev, Ev::Close(..)))
        .cloned()
        .collect();
    assert_eq!(
        order,
        vec![Ev::Close(Side::In), Ev::Close(Side::Out), Ev::Close(Side::Whole)]
    );
}

#[test]
fn shutdown_sentinel_closes_write_side() {
    let mut reactor = init_with_reactor();
    let log = new_log();
    let (pipe, peer) = reactor
        .make_pipe(Box::new(Recording { log: log.clone() }))
        .unwrap();

    reactor.write(pipe, b"last words", 1).unwrap();
    reactor.write(pipe, b"", 2).unwrap();

    // Nothing more may be queued behind the sentinel.
    let err = reactor.write(pipe, b"x", 3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PipeClosed);

    run_until(&mut reactor, Duration::from_secs(2), || {
        log.borrow().contains(&Ev::Close(Side::Out))
    });
    assert!(log.borrow().contains(&Ev::Write(Some(10), 1)));
    assert!(log.borrow().contains(&Ev::Write(Some(0), 2)));

    let mut read_back = Vec::new();
    let mut output = File::from(peer.output);
    output.read_to_end(&mut read_back).unwrap();
    assert_eq!(read_back, b"last words");

    // The reading side survives the half-close.
    let mut input = File::from(peer.input);
    input.write_all(b"ping").unwrap();
    run_until(&mut reactor, Duration::from_secs(2), || {
        log.borrow().contains(&Ev::Read(b"ping".to_vec()))
    });
}

#[test]
fn halt_twice_closes_once() {
    let mut reactor = init_with_reactor();
    let log = new_log();
    let (pipe, _peer) = reactor
        .make_pipe(Box::new(Recording { log: log.clone() }))
        .unwrap();

    reactor.halt(pipe);
    reactor.halt(pipe);
    reactor.run().unwrap();

    assert_eq!(count_closes(&log), 3); // In, Out, Whole -- each exactly once
    let whole = positions(&log, |ev| matches!(ev, Ev::Close(Side::Whole)));
    assert_eq!(whole.len(), 1);
}

#[test]
fn kill_drops_pending_writes_without_notification() {
    let mut reactor = init_with_reactor();
    let log = new_log();
    let (pipe, _peer) = reactor
        .make_pipe(Box::new(Recording { log: log.clone() }))
        .unwrap();

    reactor.write(pipe, b"doomed", 9).unwrap();
    reactor.kill(pipe);
    reactor.run().unwrap();

    let events = log.borrow();
    assert!(
        !events.iter().any(|ev| matches!(ev, Ev::Write(..))),
        "kill must not notify pending writes: {:?}",
        events
    );
    drop(events);
    assert_eq!(count_closes(&log), 3);
}

#[test]
fn stale_id_is_rejected_after_reap() {
    let mut reactor = init_with_reactor();
    let log = new_log();
    let (pipe, _peer) = reactor
        .make_pipe(Box::new(Recording { log: log.clone() }))
        .unwrap();

    reactor.halt(pipe);
    reactor.run().unwrap();

    let err = reactor.write(pipe, b"late", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadHandle);
    // halt of a stale id is a no-op, not a panic
    reactor.halt(pipe);
}
