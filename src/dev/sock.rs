use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use crate::device::{Base, DatagramState, DevId, Device, Handler, Kind, ListenerState, StreamState};
use crate::error::Result;
use crate::reactor::Reactor;
use crate::sys;
use crate::timer::TimerTag;

impl Reactor {
    /// Starts a non-blocking stream connect to `addr`. Completion is
    /// reported through `on_connect`; a failed connect tears the device
    /// down with the mapped error (`connection_refused`, ...). When
    /// `connect_timeout` is given, a connect that does not resolve in time
    /// halts the device with `timed_out`.
    pub fn make_stream(
        &mut self,
        addr: SocketAddr,
        connect_timeout: Option<Duration>,
        handler: Box<dyn Handler>,
    ) -> Result<DevId> {
        let (fd, _in_progress) = match sys::net::stream_connect(&addr) {
            Ok(out) => out,
            Err(err) => return self.fail_io(err),
        };
        // Even an instantly successful connect is resolved through the
        // first writable event, so `on_connect` always fires from the loop
        // and never from inside this call.
        let id = self.install_device(Device {
            base: Base::new(),
            kind: Kind::Stream(StreamState {
                fd,
                connecting: true,
            }),
            handler: Some(handler),
        })?;
        if let Some(timeout) = connect_timeout {
            let at = self.arm_time() + timeout;
            let timer = self.timers.insert(at, TimerTag::WriteDeadline(id));
            if let Some(device) = self.arena.get_mut(id) {
                device.base.wr_timer = Some(timer);
            }
        }
        Ok(id)
    }

    /// Wraps an already-connected stream handle, e.g. one handed out by
    /// `on_accept`.
    pub fn make_stream_from(&mut self, fd: OwnedFd, handler: Box<dyn Handler>) -> Result<DevId> {
        if let Err(err) = sys::set_nonblocking(fd.as_raw_fd()) {
            return self.fail_io(err);
        }
        self.install_device(Device {
            base: Base::new(),
            kind: Kind::Stream(StreamState {
                fd,
                connecting: false,
            }),
            handler: Some(handler),
        })
    }

    /// Binds a listening stream socket. Accepted connections are handed to
    /// `on_accept` as raw handles. Returns the device and the bound
    /// address (useful when `addr` asked for port 0).
    pub fn make_listener(
        &mut self,
        addr: SocketAddr,
        backlog: u32,
        handler: Box<dyn Handler>,
    ) -> Result<(DevId, SocketAddr)> {
        let fd = match sys::net::stream_listen(&addr, backlog) {
            Ok(fd) => fd,
            Err(err) => return self.fail_io(err),
        };
        let local = match sys::net::local_addr(fd.as_raw_fd()) {
            Ok(local) => local,
            Err(err) => return self.fail_io(err),
        };
        let id = self.install_device(Device {
            base: Base::new(),
            kind: Kind::Listener(ListenerState { fd }),
            handler: Some(handler),
        })?;
        Ok((id, local))
    }

    /// Creates a connected datagram socket. Each datagram arrives whole in
    /// `on_read`; writes send whole datagrams and are never partial.
    /// Returns the device and its bound local address.
    pub fn make_datagram(
        &mut self,
        bind: Option<SocketAddr>,
        peer: SocketAddr,
        handler: Box<dyn Handler>,
    ) -> Result<(DevId, SocketAddr)> {
        let fd = match sys::net::datagram_connect(bind.as_ref(), &peer) {
            Ok(fd) => fd,
            Err(err) => return self.fail_io(err),
        };
        let local = match sys::net::local_addr(fd.as_raw_fd()) {
            Ok(local) => local,
            Err(err) => return self.fail_io(err),
        };
        let id = self.install_device(Device {
            base: Base::new(),
            kind: Kind::Datagram(DatagramState { fd }),
            handler: Some(handler),
        })?;
        Ok((id, local))
    }
}
