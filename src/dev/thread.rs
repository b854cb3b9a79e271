use std::os::fd::{AsRawFd, OwnedFd};
use std::thread;

use crate::device::{
    Base, Composite, DevId, Device, Dir, Half, Handler, Kind, Side, ThreadState,
};
use crate::error::Result;
use crate::reactor::Reactor;
use crate::sys;

/// The worker's two blocking handles: `rfd` reads what the application
/// wrote into the device, `wfd` feeds the application's `on_read`.
///
/// The pair is dropped when the worker function returns; the reactor
/// observes EOF on its side and tears the device down. Note that `wfd` can
/// raise `SIGPIPE` if the application closes its reading side first;
/// programs using thread devices normally ignore that signal.
#[derive(Debug)]
pub struct ThrIoPair {
    pub rfd: OwnedFd,
    pub wfd: OwnedFd,
}

impl Reactor {
    /// Runs `work` on a spawned worker thread, bridged into the reactor
    /// through a pair of pipes.
    ///
    /// The device's `In` slave carries application writes to the worker,
    /// the `Out` slave carries worker output back. The worker receives only
    /// the [`ThrIoPair`] and its context; it must not touch the reactor.
    /// When the worker returns, EOF on the `Out` slave halts the whole
    /// device and the reap joins the thread before `on_close(Whole)`.
    pub fn make_thread(
        &mut self,
        work: impl FnOnce(ThrIoPair) + Send + 'static,
        handler: Box<dyn Handler>,
    ) -> Result<DevId> {
        // Worker-facing ends stay blocking; only the reactor-facing ends
        // are switched to non-blocking.
        let (worker_rd, app_wr) = match sys::blocking_pipe_pair() {
            Ok(pair) => pair,
            Err(err) => return self.fail_io(err),
        };
        let (app_rd, worker_wr) = match sys::blocking_pipe_pair() {
            Ok(pair) => pair,
            Err(err) => return self.fail_io(err),
        };
        if let Err(err) = sys::set_nonblocking(app_wr.as_raw_fd())
            .and_then(|()| sys::set_nonblocking(app_rd.as_raw_fd()))
        {
            return self.fail_io(err);
        }

        let master = self.install_device(Device {
            base: Base::new(),
            kind: Kind::ThreadMaster(ThreadState {
                comp: Composite {
                    slaves: [None, None],
                },
                join: None,
            }),
            handler: Some(handler),
        })?;

        let slave_in = self.install_device(Device {
            base: Base::new(),
            kind: Kind::Half(Half {
                fd: app_wr,
                side: Side::In,
                dir: Dir::Write,
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
                fd: app_rd,
                side: Side::Out,
                dir: Dir::Read,
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

        let pair = ThrIoPair {
            rfd: worker_rd,
            wfd: worker_wr,
        };
        let join = thread::spawn(move || work(pair));

        if let Some(device) = self.arena.get_mut(master) {
            if let Kind::ThreadMaster(thr) = &mut device.kind {
                thr.comp.slaves = [Some(slave_in), Some(slave_out)];
                thr.join = Some(join);
            }
        }

        Ok(master)
    }
}
