use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use devio::{DevId, Handler, Reactor, Service, Side, StopReason};

mod util;
use util::{init_with_reactor, new_log, Log};

struct Quiet {
    log: Log,
}

impl Handler for Quiet {
    fn on_close(&mut self, _r: &mut Reactor, _dev: DevId, side: Side) {
        self.log.borrow_mut().push(util::Ev::Close(side));
    }
}

#[test]
fn stopper_unblocks_a_waiting_run() {
    let mut reactor = init_with_reactor();
    let log = new_log();
    // A device keeps the loop alive but never becomes ready.
    let (_pipe, _peer) = reactor
        .make_pipe(Box::new(Quiet { log: log.clone() }))
        .unwrap();

    let stopper = reactor.stopper();
    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        stopper.request(StopReason::Normal);
    });

    let start = Instant::now();
    let reason = reactor.run().unwrap();
    waker.join().unwrap();

    assert_eq!(reason, StopReason::Normal);
    assert_eq!(reactor.stop_reason(), StopReason::Normal);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "run did not unblock promptly"
    );
}

#[test]
fn first_stop_reason_wins_across_stoppers() {
    let mut reactor = init_with_reactor();
    let (_pipe, _peer) = reactor.make_pipe(Box::new(Quiet { log: new_log() })).unwrap();

    let stopper = reactor.stopper();
    stopper.request(StopReason::Termination);
    stopper.request(StopReason::Error);

    let reason = reactor.run().unwrap();
    assert_eq!(reason, StopReason::Termination);
}

#[test]
fn stop_from_a_callback_exits_after_the_sweeps() {
    struct StopOnRead;

    impl Handler for StopOnRead {
        fn on_read(&mut self, r: &mut Reactor, dev: DevId, _data: &[u8]) -> devio::Control {
            r.halt(dev);
            r.stop(StopReason::Canceled);
            devio::Control::Continue
        }
    }

    let mut reactor = init_with_reactor();
    let (_pipe, peer) = reactor.make_pipe(Box::new(StopOnRead)).unwrap();

    use std::io::Write;
    let mut input = std::fs::File::from(peer.input);
    input.write_all(b"go").unwrap();

    let reason = reactor.run().unwrap();
    assert_eq!(reason, StopReason::Canceled);
    // The halt was swept before the loop exited.
    assert_eq!(reactor.device_count(), 0);
}

struct RecordingService {
    seen: Rc<RefCell<Option<StopReason>>>,
}

impl Service for RecordingService {
    fn on_stop(&mut self, _reactor: &mut Reactor, reason: StopReason) {
        *self.seen.borrow_mut() = Some(reason);
    }
}

#[test]
fn services_hear_the_stop_reason_at_close() {
    let mut reactor = init_with_reactor();
    let seen = Rc::new(RefCell::new(None));
    reactor.register_service(Box::new(RecordingService { seen: seen.clone() }));

    reactor.stop(StopReason::Termination);
    reactor.close();

    assert_eq!(*seen.borrow(), Some(StopReason::Termination));
}

#[test]
fn deregistered_service_is_not_stopped() {
    let mut reactor = init_with_reactor();
    let seen = Rc::new(RefCell::new(None));
    let id = reactor.register_service(Box::new(RecordingService { seen: seen.clone() }));

    assert!(reactor.deregister_service(id).is_some());
    reactor.close();
    assert_eq!(*seen.borrow(), None);
}
