use std::os::fd::{AsRawFd, OwnedFd};

use crate::device::{Base, DevId, Device, Handler, Kind, RawFlags, RawState};
use crate::error::Result;
use crate::reactor::Reactor;
use crate::sys;

impl Reactor {
    /// Adopts a pre-existing handle as a device.
    ///
    /// Stream mode (the default) gives the handle the full read/write
    /// protocol; [`RawFlags::NOTIFY_ONLY`] reduces it to readiness
    /// notifications through `on_ready`. The handle is closed on reap
    /// unless [`RawFlags::KEEP_OPEN`] is set.
    ///
    /// The handle is switched to non-blocking in stream mode; notify-only
    /// handles are left untouched.
    pub fn adopt(
        &mut self,
        fd: OwnedFd,
        flags: RawFlags,
        handler: Box<dyn Handler>,
    ) -> Result<DevId> {
        if !flags.contains(RawFlags::NOTIFY_ONLY) {
            if let Err(err) = sys::set_nonblocking(fd.as_raw_fd()) {
                return self.fail_io(err);
            }
        }
        let mut base = Base::new();
        base.read_enabled = !flags.contains(RawFlags::DISABLE_IN);
        self.install_device(Device {
            base,
            kind: Kind::Raw(RawState {
                fd: Some(fd),
                flags,
            }),
            handler: Some(handler),
        })
    }
}
