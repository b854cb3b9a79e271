use std::os::fd::OwnedFd;

use crate::device::{Base, Composite, DevId, Device, Dir, Half, Handler, Kind, Side};
use crate::error::Result;
use crate::reactor::Reactor;
use crate::sys;

/// The far ends of a pipe device, for handing to a peer: a child process,
/// another thread, or a test harness.
///
/// Bytes written to `input` surface through the device's `on_read`; bytes
/// the device writes come out of `output`. Both ends are non-blocking.
#[derive(Debug)]
pub struct PipePeer {
    pub input: OwnedFd,
    pub output: OwnedFd,
}

impl Reactor {
    /// Creates a pipe device: a master with an `In` slave the application
    /// reads through and an `Out` slave it writes through, plus the peer
    /// ends of both pipes.
    ///
    /// Halting the master closes `In`, then `Out`, then reports the master
    /// itself (`Side::Whole`). Closing a single side with
    /// [`close_side`] leaves the other alive.
    ///
    /// [`close_side`]: Reactor::close_side
    pub fn make_pipe(&mut self, handler: Box<dyn Handler>) -> Result<(DevId, PipePeer)> {
        let (in_rd, in_wr) = match sys::pipe_pair() {
            Ok(pair) => pair,
            Err(err) => return self.fail_io(err),
        };
        let (out_rd, out_wr) = match sys::pipe_pair() {
            Ok(pair) => pair,
            Err(err) => return self.fail_io(err),
        };

        let master = self.install_device(Device {
            base: Base::new(),
            kind: Kind::PipeMaster(Composite {
                slaves: [None, None],
            }),
            handler: Some(handler),
        })?;

        let slave_in = self.install_device(Device {
            base: Base::new(),
            kind: Kind::Half(Half {
                fd: in_rd,
                side: Side::In,
                dir: Dir::Read,
                master,
            }),
            handler: None,
        });
        let slave_in = match slave_in {
            Ok(id) => id,
            Err(err) => {
                self.arena.remove(master);
                return Err(err);
            }
        };

        let slave_out = self.install_device(Device {
            base: Base::new(),
            kind: Kind::Half(Half {
                fd: out_wr,
                side: Side::Out,
                dir: Dir::Write,
                master,
            }),
            handler: None,
        });
        let slave_out = match slave_out {
            Ok(id) => id,
            Err(err) => {
                self.arena.remove(slave_in);
                self.arena.remove(master);
                return Err(err);
            }
        };

        if let Some(device) = self.arena.get_mut(master) {
            if let Kind::PipeMaster(comp) = &mut device.kind {
                comp.slaves = [Some(slave_in), Some(slave_out)];
            }
        }

        Ok((
            master,
            PipePeer {
                input: in_wr,
                output: out_rd,
            },
        ))
    }
}
