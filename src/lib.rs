//! Device-oriented non-blocking I/O reactor.
//!
//! A [`Reactor`] owns a single-threaded event loop, a readiness selector, a
//! timer heap and a set of *devices*: objects wrapping one or more kernel
//! handles together with user callbacks. Devices are created through the
//! `make_*` constructors, addressed by [`DevId`], and driven entirely from
//! the loop: the reactor reads for them, drains their write queues, arms
//! their deadlines and walks them through an orderly teardown, from
//! `halt`/`kill` through a zombie phase to exactly one `on_close`, never
//! destroying a device from inside a callback stack.
//!
//! # Example
//!
//! An echo over a pipe device:
//!
//! ```
//! use std::io::Write;
//! use devio::{Control, DevId, Handler, Reactor};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_read(&mut self, r: &mut Reactor, dev: DevId, data: &[u8]) -> Control {
//!         if !data.is_empty() {
//!             r.write(dev, data, 0).unwrap();
//!         }
//!         Control::Continue
//!     }
//!
//!     fn on_write(&mut self, r: &mut Reactor, dev: DevId,
//!                 _wrlen: Option<usize>, _ctx: usize) -> Control {
//!         r.halt(dev);
//!         Control::Continue
//!     }
//! }
//!
//! let mut reactor = Reactor::new().unwrap();
//! let (pipe, peer) = reactor.make_pipe(Box::new(Echo)).unwrap();
//! # let _ = pipe;
//!
//! let mut input = std::fs::File::from(peer.input);
//! input.write_all(b"hello").unwrap();
//!
//! reactor.run().unwrap();
//! ```
//!
//! # Scheduling model
//!
//! One reactor, one thread. Callbacks, timer handlers and service hooks all
//! run on the thread driving [`Reactor::run`]; none of them may block.
//! Blocking work belongs in a thread device, which bridges a worker thread
//! into the loop through a pair of pipes.
//!
//! Only Unix (`epoll`) targets are supported.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_debug_implementations)]

#[cfg(not(unix))]
compile_error!("devio only supports unix targets");

#[macro_use]
mod macros;

mod dev;
mod device;
mod error;
mod interest;
mod queue;
mod reactor;
mod sys;
mod timer;
mod token;

pub mod logger;

pub use dev::PipePeer;
pub use device::{Control, DevId, Handler, RawFlags, Readiness, Side};
pub use error::{Error, ErrorKind, Result};
pub use reactor::{Config, Reactor, Service, ServiceId, StopReason, Stopper};
pub use timer::TimerId;

cfg_thread_device! {
    pub use dev::ThrIoPair;
}

cfg_pty_device! {
    pub use device::PtyFlags;
}

/// # Features
///
/// The device subsystems can be compiled out:
///
/// * `net` (default): stream, listener and datagram socket devices.
/// * `thread-device` (default): worker-thread pipe devices.
/// * `pty-device` (default): pseudo-terminal devices.
///
/// The reactor core (pipe devices, raw-handle devices, timers, services)
/// is always available.
pub mod features {}
