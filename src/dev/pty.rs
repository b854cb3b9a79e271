use crate::device::{Base, DevId, Device, Handler, Kind, PtyFlags, PtyState};
use crate::error::Result;
use crate::reactor::Reactor;
use crate::sys::pty;

impl Reactor {
    /// Spawns `argv` under a pseudo-terminal and wraps the pty master as a
    /// device. Child output arrives through `on_read`; writes feed the
    /// child's terminal input.
    ///
    /// On teardown the child is sent `SIGTERM`, then `SIGKILL` after a
    /// short grace, and reaped, unless the forget flags say otherwise.
    /// Returns the device and the child pid.
    pub fn make_pty(
        &mut self,
        argv: &[&str],
        flags: PtyFlags,
        handler: Box<dyn Handler>,
    ) -> Result<(DevId, i32)> {
        let (fd, child) = match pty::spawn(argv, flags.contains(PtyFlags::SHELL)) {
            Ok(out) => out,
            Err(err) => return self.fail_io(err),
        };
        let id = self.install_device(Device {
            base: Base::new(),
            kind: Kind::Pty(PtyState { fd, child, flags }),
            handler: Some(handler),
        })?;
        Ok((id, child as i32))
    }

    /// Sends `SIGKILL` to the child of a pty device right away, without
    /// waiting for the teardown sequence.
    pub fn pty_kill_child(&mut self, dev: DevId) -> Result<()> {
        match self.arena.get(dev).map(|d| &d.kind) {
            Some(Kind::Pty(p)) => {
                pty::kill_hard(p.child);
                Ok(())
            }
            Some(_) => self.fail(crate::error::ErrorKind::NotSupported),
            None => self.fail(crate::error::ErrorKind::BadHandle),
        }
    }
}
