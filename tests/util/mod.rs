// Not all helpers are used by every test binary.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use devio::{Reactor, Side};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn init_with_reactor() -> Reactor {
    init();
    Reactor::new().expect("unable to open reactor")
}

/// Everything a test handler can observe, in observation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ev {
    Read(Vec<u8>),
    Write(Option<usize>, usize),
    Close(Side),
    CloseWithError(Side, Option<devio::ErrorKind>),
    Connect,
    Ready,
}

pub type Log = Rc<RefCell<Vec<Ev>>>;

pub fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// Drives the reactor in bounded steps until `done` holds; panics if it
/// does not within `deadline`.
pub fn run_until(reactor: &mut Reactor, deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(
            start.elapsed() < deadline,
            "reactor did not reach the expected state in {:?}",
            deadline
        );
        reactor
            .run_once(Some(Duration::from_millis(20)))
            .expect("loop iteration failed");
    }
}

/// Positions of `needle` events inside `log`, for order assertions.
pub fn positions(log: &Log, pred: impl Fn(&Ev) -> bool) -> Vec<usize> {
    log.borrow()
        .iter()
        .enumerate()
        .filter(|(_, ev)| pred(ev))
        .map(|(i, _)| i)
        .collect()
}

pub fn count_closes(log: &Log) -> usize {
    log.borrow()
        .iter()
        .filter(|ev| matches!(ev, Ev::Close(..) | Ev::CloseWithError(..)))
        .count()
}
