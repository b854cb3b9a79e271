use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::interest::Interest;
use crate::token::Token;

use super::{pipe_pair, read, write, Selector};

/// Waker backed by an internal self-pipe registered with the selector.
///
/// A write to the sending end unblocks a pending `Selector::select`. The
/// sending end can be duplicated and handed to other threads (or a signal
/// handler); one `write(2)` of one byte is all a wake takes.
#[derive(Debug)]
pub(crate) struct Waker {
    sender: OwnedFd,
    receiver: OwnedFd,
}

impl Waker {
    pub(crate) fn new(selector: &Selector, token: Token) -> io::Result<Waker> {
        let (receiver, sender) = pipe_pair()?;
        selector.register(receiver.as_raw_fd(), token, Some(Interest::READABLE))?;
        Ok(Waker { sender, receiver })
    }

    /// Duplicates the sending end, e.g. for a [`Stopper`].
    ///
    /// [`Stopper`]: crate::Stopper
    pub(crate) fn clone_sender(&self) -> io::Result<OwnedFd> {
        self.sender.try_clone()
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        match write(self.sender.as_raw_fd(), &[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The pipe buffer is full, so the loop has a wake pending
                // already; nothing more to do.
                Ok(())
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// Empties the pipe after the loop observed the readable event.
    pub(crate) fn drain(&self) {
        let mut buf = [0; 64];
        loop {
            match read(self.receiver.as_raw_fd(), &mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }

    /// Writes one byte to a duplicated sending end. Only async-signal-safe
    /// calls happen here; failures are ignored because a full pipe already
    /// means a wake is pending.
    pub(crate) fn wake_raw(sender: RawFd) {
        let byte = 1u8;
        unsafe {
            let _ = libc::write(sender, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}
