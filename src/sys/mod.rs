//! OS-specific plumbing.
//!
//! Only the `epoll(7)` family of targets is supported; everything above this
//! module goes through the `Selector`/`Waker` surface and a handful of raw
//! I/O helpers.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use self::unix::*;
