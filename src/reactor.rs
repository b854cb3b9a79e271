//! The reactor: device registry, event loop, sweeps and stop machinery.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::device::{
    Arena, Control, DevId, Device, Handler, Kind, RawFlags, Readiness, Side, State,
};
use crate::error::{Error, ErrorKind, Result};
use crate::interest::Interest;
use crate::queue::Chunk;
use crate::sys::{self, event};
use crate::timer::{TimerHeap, TimerId, TimerTag};
use crate::token::Token;

/// Token reserved for the internal self-pipe waker.
const WAKER: Token = Token(usize::MAX);

/// Why the loop was asked to stop. `None` means no stop was requested.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StopReason {
    None = 0,
    Normal = 1,
    Termination = 2,
    Canceled = 3,
    Error = 4,
}

impl StopReason {
    fn from_u8(v: u8) -> StopReason {
        match v {
            1 => StopReason::Normal,
            2 => StopReason::Termination,
            3 => StopReason::Canceled,
            4 => StopReason::Error,
            _ => StopReason::None,
        }
    }
}

/// Runtime tunables, validated by [`Reactor::open`].
#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub(crate) read_buf_size: usize,
    pub(crate) max_write_len: usize,
    pub(crate) read_fair_cap: usize,
    pub(crate) event_capacity: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            read_buf_size: 4096,
            max_write_len: 16 * 1024 * 1024,
            read_fair_cap: 16,
            event_capacity: 1024,
        }
    }
}

impl Config {
    /// Size of the buffer each read into a device uses. Minimum 512.
    pub fn read_buf_size(mut self, bytes: usize) -> Config {
        self.read_buf_size = bytes;
        self
    }

    /// Upper bound on a single write chunk. Minimum 64 KiB.
    pub fn max_write_len(mut self, bytes: usize) -> Config {
        self.max_write_len = bytes;
        self
    }

    /// How many reads (or accepts) one device may perform per loop
    /// iteration before yielding to its siblings.
    pub fn read_fair_cap(mut self, reads: usize) -> Config {
        self.read_fair_cap = reads;
        self
    }

    /// Capacity of the readiness event batch.
    pub fn event_capacity(mut self, events: usize) -> Config {
        self.event_capacity = events;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.read_buf_size < 512
            || self.max_write_len < 64 * 1024
            || self.read_fair_cap == 0
            || self.event_capacity == 0
        {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        Ok(())
    }
}

/// A long-lived object registered with the reactor, told when the reactor
/// closes.
pub trait Service {
    fn on_stop(&mut self, reactor: &mut Reactor, reason: StopReason);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServiceId(usize);

struct StopState {
    requested: AtomicBool,
    reason: AtomicU8,
}

/// Thread-safe (and async-signal-safe) stop request handle.
///
/// `request` performs one atomic store and one one-byte `write(2)` to the
/// reactor's self-pipe, so it may be called from another thread or from a
/// signal handler. The first reason requested wins.
#[derive(Clone)]
pub struct Stopper {
    state: Arc<StopState>,
    sender: Arc<OwnedFd>,
}

impl Stopper {
    pub fn request(&self, reason: StopReason) {
        let reason = match reason {
            StopReason::None => StopReason::Normal,
            other => other,
        };
        let _ = self.state.reason.compare_exchange(
            StopReason::None as u8,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.state.requested.store(true, Ordering::Release);
        sys::Waker::wake_raw(self.sender.as_raw_fd());
    }
}

/// The single-threaded event loop and everything it owns: the readiness
/// selector, the timer heap, the device arena and the zombie queue.
///
/// All device operations, callbacks, timer handlers and service hooks run on
/// the thread driving [`run`]. Devices are owned by the reactor from
/// creation until they are reaped; user code refers to them by [`DevId`].
///
/// [`run`]: Reactor::run
pub struct Reactor {
    pub(crate) selector: sys::Selector,
    events: sys::Events,
    waker: sys::Waker,
    stop_state: Arc<StopState>,
    waker_sender: Arc<OwnedFd>,
    stopped: bool,
    stop_reason: StopReason,
    pub(crate) timers: TimerHeap,
    tasks: Vec<Option<Box<dyn FnOnce(&mut Reactor)>>>,
    free_tasks: Vec<u32>,
    pub(crate) arena: Arena,
    pending_halt: VecDeque<DevId>,
    zombies: VecDeque<DevId>,
    services: Vec<Option<Box<dyn Service>>>,
    last_err: Option<Error>,
    now: Instant,
    pub(crate) cfg: Config,
    read_buf: Vec<u8>,
    expired: Vec<TimerTag>,
    in_loop: bool,
    closed: bool,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Reactor::open(Config::default())
    }

    pub fn open(cfg: Config) -> Result<Reactor> {
        cfg.validate()?;
        let selector = sys::Selector::new().map_err(Error::from_io)?;
        let waker = sys::Waker::new(&selector, WAKER).map_err(Error::from_io)?;
        let waker_sender = Arc::new(waker.clone_sender().map_err(Error::from_io)?);
        Ok(Reactor {
            selector,
            events: Vec::with_capacity(cfg.event_capacity),
            waker,
            stop_state: Arc::new(StopState {
                requested: AtomicBool::new(false),
                reason: AtomicU8::new(StopReason::None as u8),
            }),
            waker_sender,
            stopped: false,
            stop_reason: StopReason::None,
            timers: TimerHeap::new(),
            tasks: Vec::new(),
            free_tasks: Vec::new(),
            arena: Arena::new(),
            pending_halt: VecDeque::new(),
            zombies: VecDeque::new(),
            services: Vec::new(),
            last_err: None,
            now: Instant::now(),
            cfg,
            read_buf: vec![0; cfg.read_buf_size],
            expired: Vec::new(),
            in_loop: false,
            closed: false,
        })
    }

    /// The failure recorded by the most recent reactor operation, or the
    /// failure that tore a device down while its `on_close` runs.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_err.as_ref()
    }

    /// The effective stop reason; `StopReason::None` until a stop request
    /// is absorbed.
    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    /// The loop iteration's cached monotonic time. Every deadline
    /// comparison within one iteration uses this one value.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Number of devices not yet reaped, slaves and masters included.
    pub fn device_count(&self) -> usize {
        self.arena.len()
    }

    /// Requests a stop from inside a callback or between iterations. The
    /// loop exits at the end of the current iteration, after the sweeps.
    /// The first reason requested wins.
    pub fn stop(&mut self, reason: StopReason) {
        if self.stop_reason == StopReason::None {
            self.stop_reason = match reason {
                StopReason::None => StopReason::Normal,
                other => other,
            };
        }
        self.stopped = true;
    }

    /// A handle for stopping the reactor from another thread or a signal
    /// handler.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            state: Arc::clone(&self.stop_state),
            sender: Arc::clone(&self.waker_sender),
        }
    }

    fn absorb_stop_request(&mut self) {
        if self.stop_state.requested.load(Ordering::Acquire) {
            let reason = StopReason::from_u8(self.stop_state.reason.load(Ordering::Acquire));
            self.stop(reason);
        }
    }

    pub(crate) fn fail<T>(&mut self, kind: ErrorKind) -> Result<T> {
        let err = Error::new(kind);
        self.last_err = Some(err.clone());
        Err(err)
    }

    pub(crate) fn fail_io<T>(&mut self, err: io::Error) -> Result<T> {
        let err = Error::from_io(err);
        self.last_err = Some(err.clone());
        Err(err)
    }

    /// Monotonic time for arming deadlines: the iteration's cached value
    /// inside the loop, refreshed outside of it.
    pub(crate) fn arm_time(&mut self) -> Instant {
        if !self.in_loop {
            self.now = Instant::now();
        }
        self.now
    }

    /*
     *
     * ===== Timers and services =====
     *
     */

    /// Runs `f` once `delay` from now has passed. A zero (or elapsed) delay
    /// fires on the next loop iteration, never inside this call.
    pub fn schedule_after(
        &mut self,
        delay: Duration,
        f: impl FnOnce(&mut Reactor) + 'static,
    ) -> TimerId {
        let at = self.arm_time() + delay;
        let slot = match self.free_tasks.pop() {
            Some(slot) => {
                self.tasks[slot as usize] = Some(Box::new(f));
                slot
            }
            None => {
                self.tasks.push(Some(Box::new(f)));
                (self.tasks.len() - 1) as u32
            }
        };
        self.timers.insert(at, TimerTag::Task(slot))
    }

    /// Disarms a scheduled task. Returns whether it was still pending.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        match self.timers.cancel(id) {
            Some(TimerTag::Task(slot)) => {
                self.tasks[slot as usize] = None;
                self.free_tasks.push(slot);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn register_service(&mut self, svc: Box<dyn Service>) -> ServiceId {
        self.services.push(Some(svc));
        ServiceId(self.services.len() - 1)
    }

    pub fn deregister_service(&mut self, id: ServiceId) -> Option<Box<dyn Service>> {
        self.services.get_mut(id.0)?.take()
    }

    /*
     *
     * ===== Device operations =====
     *
     */

    /// Enables or disables read-side dispatch. Any armed read deadline is
    /// cancelled.
    pub fn read(&mut self, dev: DevId, enabled: bool) -> Result<()> {
        self.read_inner(dev, enabled, None)
    }

    /// Like [`read`], and additionally arms a read deadline: if no bytes
    /// arrive within `timeout` the device halts with `timed_out`.
    ///
    /// [`read`]: Reactor::read
    pub fn timed_read(&mut self, dev: DevId, enabled: bool, timeout: Duration) -> Result<()> {
        self.read_inner(dev, enabled, Some(timeout))
    }

    fn read_inner(&mut self, dev: DevId, enabled: bool, timeout: Option<Duration>) -> Result<()> {
        let target = self.route_read(dev)?;
        let at = timeout.map(|t| self.arm_time() + t);

        let device = match self.arena.get_mut(target) {
            Some(device) if device.base.is_live() => device,
            _ => return self.fail(ErrorKind::InvalidArgument),
        };
        device.base.read_enabled = enabled;
        let old = device.base.rd_timer.take();
        if let Some(old) = old {
            self.timers.cancel(old);
        }
        if enabled {
            if let Some(at) = at {
                let id = self.timers.insert(at, TimerTag::ReadDeadline(target));
                // The borrow of the arena ended above; re-fetch to store.
                if let Some(device) = self.arena.get_mut(target) {
                    device.base.rd_timer = Some(id);
                }
            }
        }
        self.update_interest(target)
    }

    /// Appends a write chunk; completion is reported through `on_write`
    /// with `ctx`. A zero-length `data` is the shutdown-write sentinel on
    /// device kinds that support it.
    pub fn write(&mut self, dev: DevId, data: &[u8], ctx: usize) -> Result<()> {
        self.write_inner(dev, data, None, ctx)
    }

    /// Like [`write`], with a per-chunk deadline: if the chunk has not
    /// fully drained within `timeout` the device halts with `timed_out`.
    ///
    /// [`write`]: Reactor::write
    pub fn timed_write(
        &mut self,
        dev: DevId,
        data: &[u8],
        timeout: Duration,
        ctx: usize,
    ) -> Result<()> {
        self.write_inner(dev, data, Some(timeout), ctx)
    }

    fn write_inner(
        &mut self,
        dev: DevId,
        data: &[u8],
        timeout: Option<Duration>,
        ctx: usize,
    ) -> Result<()> {
        let target = self.route_write(dev)?;
        if data.len() > self.cfg.max_write_len {
            return self.fail(ErrorKind::InvalidArgument);
        }
        let deadline = timeout.map(|t| self.arm_time() + t);

        let device = match self.arena.get_mut(target) {
            Some(device) if device.base.is_live() => device,
            _ => return self.fail(ErrorKind::InvalidArgument),
        };
        if let Kind::Raw(raw) = &device.kind {
            if raw.flags.contains(RawFlags::NOTIFY_ONLY) {
                return self.fail(ErrorKind::NotSupported);
            }
        }
        if device.base.write_closed || device.base.shutdown_pending {
            return self.fail(ErrorKind::PipeClosed);
        }
        if data.is_empty() {
            if !device.supports_shutdown_write() {
                return self.fail(ErrorKind::InvalidArgument);
            }
            device.base.shutdown_pending = true;
        }
        let was_empty = device.base.wq.is_empty();
        device.base.wq.push(Chunk::new(data, ctx, deadline));
        trace!(
            "queued {} bytes on {:?}, {} chunk(s) / {} byte(s) pending",
            data.len(),
            target,
            device.base.wq.len(),
            device.base.wq.pending_bytes(),
        );
        if was_empty {
            self.rearm_write_timer(target);
        }
        self.update_interest(target)
    }

    /// Cooperative teardown: queued writes are failed (`on_write(None)`),
    /// the device is torn down at the end of the current loop iteration.
    /// Idempotent; a stale id is ignored.
    pub fn halt(&mut self, dev: DevId) {
        self.halt_inner(dev, false, None);
    }

    /// Emergency teardown: like [`halt`] but pending writes are dropped
    /// without failure notifications.
    ///
    /// [`halt`]: Reactor::halt
    pub fn kill(&mut self, dev: DevId) {
        self.halt_inner(dev, true, None);
    }

    /// Halts one slave of a composite device, leaving the other alive.
    /// `Side::Whole` halts the master (same as [`halt`]).
    ///
    /// [`halt`]: Reactor::halt
    pub fn close_side(&mut self, dev: DevId, side: Side) -> Result<()> {
        let device = match self.arena.get(dev) {
            Some(device) => device,
            None => return self.fail(ErrorKind::BadHandle),
        };
        if side == Side::Whole {
            self.halt(dev);
            return Ok(());
        }
        let slave = match &device.kind {
            Kind::PipeMaster(comp) => comp.slave(side),
            #[cfg(feature = "thread-device")]
            Kind::ThreadMaster(thr) => thr.comp.slave(side),
            _ => return self.fail(ErrorKind::NotSupported),
        };
        match slave {
            Some(slave) => {
                self.halt_slave_only(slave);
                Ok(())
            }
            None => Ok(()), // that side is already gone
        }
    }

    /// The kernel handle behind a device, e.g. for `setsockopt`. Composite
    /// masters have none.
    pub fn raw_handle(&mut self, dev: DevId) -> Result<RawFd> {
        match self.arena.get(dev) {
            Some(device) => match device.raw_fd() {
                Some(fd) => Ok(fd),
                None => self.fail(ErrorKind::NotSupported),
            },
            None => self.fail(ErrorKind::BadHandle),
        }
    }

    fn halt_inner(&mut self, id: DevId, kill: bool, fail: Option<ErrorKind>) {
        let (already_down, slaves, thread_out_master) = {
            let device = match self.arena.get_mut(id) {
                Some(device) => device,
                None => return,
            };
            if kill {
                device.base.killed = true;
            }
            if let Some(kind) = fail {
                device.base.note_failure(kind);
            }
            let already_down = !device.base.is_live();
            let mut slaves: [Option<DevId>; 2] = [None, None];
            let mut thread_out_master: Option<DevId> = None;
            if !already_down {
                device.base.state = State::Halting;
                match &device.kind {
                    Kind::PipeMaster(comp) => slaves = comp.slaves,
                    #[cfg(feature = "thread-device")]
                    Kind::ThreadMaster(thr) => slaves = thr.comp.slaves,
                    #[cfg(feature = "thread-device")]
                    Kind::Half(half) if half.side == Side::Out => {
                        // A thread device is useless without its output
                        // side; take the whole device down with it.
                        thread_out_master = Some(half.master);
                    }
                    _ => {}
                }
            }
            (already_down, slaves, thread_out_master)
        };
        if already_down {
            return;
        }

        debug!("halting device {:?} (kill={})", id, kill);
        self.pending_halt.push_back(id);
        for slave in slaves.iter().flatten() {
            self.halt_inner(*slave, kill, None);
        }

        #[cfg(feature = "thread-device")]
        if let Some(master) = thread_out_master {
            if matches!(
                self.arena.get(master).map(|d| &d.kind),
                Some(Kind::ThreadMaster(..))
            ) {
                self.halt_inner(master, kill, None);
            }
        }
        #[cfg(not(feature = "thread-device"))]
        let _ = thread_out_master;
    }

    /// Halts one composite slave without the thread-device whole-halt
    /// cascade.
    fn halt_slave_only(&mut self, id: DevId) {
        let device = match self.arena.get_mut(id) {
            Some(device) if device.base.is_live() => device,
            _ => return,
        };
        device.base.state = State::Halting;
        self.pending_halt.push_back(id);
    }

    /*
     *
     * ===== Routing and interest =====
     *
     */

    /// Resolves the device a read-side operation acts on: the app-read
    /// slave for composite masters, the device itself otherwise.
    fn route_read(&mut self, id: DevId) -> Result<DevId> {
        let device = match self.arena.get(id) {
            Some(device) => device,
            None => return self.fail(ErrorKind::BadHandle),
        };
        match &device.kind {
            Kind::PipeMaster(comp) => match comp.slave(Side::In) {
                Some(slave) => Ok(slave),
                None => self.fail(ErrorKind::PipeClosed),
            },
            #[cfg(feature = "thread-device")]
            Kind::ThreadMaster(thr) => match thr.comp.slave(Side::Out) {
                Some(slave) => Ok(slave),
                None => self.fail(ErrorKind::PipeClosed),
            },
            _ => Ok(id),
        }
    }

    /// Resolves the device a write-side operation acts on: the app-write
    /// slave for composite masters, the device itself otherwise.
    fn route_write(&mut self, id: DevId) -> Result<DevId> {
        let device = match self.arena.get(id) {
            Some(device) => device,
            None => return self.fail(ErrorKind::BadHandle),
        };
        match &device.kind {
            Kind::PipeMaster(comp) => match comp.slave(Side::Out) {
                Some(slave) => Ok(slave),
                None => self.fail(ErrorKind::PipeClosed),
            },
            #[cfg(feature = "thread-device")]
            Kind::ThreadMaster(thr) => match thr.comp.slave(Side::In) {
                Some(slave) => Ok(slave),
                None => self.fail(ErrorKind::PipeClosed),
            },
            _ => Ok(id),
        }
    }

    /// The device whose handler serves callbacks for `id`: the master for
    /// composite slaves, `id` itself otherwise.
    fn handler_owner(&self, id: DevId) -> DevId {
        match self.arena.get(id).map(|d| &d.kind) {
            Some(Kind::Half(half)) => half.master,
            _ => id,
        }
    }

    fn desired_interest(device: &Device) -> Option<Interest> {
        let base = &device.base;
        let mut readable = base.read_enabled && !base.eof;
        let mut writable = !base.wq.is_empty();
        match &device.kind {
            Kind::Half(half) => match half.dir {
                crate::device::Dir::Read => writable = false,
                crate::device::Dir::Write => readable = false,
            },
            Kind::Raw(raw) => {
                if raw.flags.contains(RawFlags::NOTIFY_ONLY) {
                    writable = !raw.flags.contains(RawFlags::DISABLE_OUT);
                }
                if raw.flags.contains(RawFlags::DISABLE_IN) {
                    readable = false;
                }
                if raw.flags.contains(RawFlags::DISABLE_OUT) {
                    writable = false;
                }
            }
            #[cfg(feature = "net")]
            Kind::Stream(stream) => {
                if stream.connecting {
                    readable = false;
                    writable = true;
                }
            }
            #[cfg(feature = "net")]
            Kind::Listener(..) => writable = false,
            _ => {}
        }
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Reconciles the selector registration with the device's current
    /// wishes. Masters have no handle and are skipped.
    pub(crate) fn update_interest(&mut self, id: DevId) -> Result<()> {
        let (fd, desired, current) = {
            let device = match self.arena.get(id) {
                Some(device) => device,
                None => return Ok(()),
            };
            if device.base.state != State::Live {
                return Ok(());
            }
            let fd = match device.raw_fd() {
                Some(fd) => fd,
                None => return Ok(()),
            };
            (fd, Self::desired_interest(device), device.base.registered)
        };

        let token = Token(id.idx as usize);
        let outcome = match current {
            Some(current) if current == desired => return Ok(()),
            Some(_) => self.selector.reregister(fd, token, desired),
            None => self.selector.register(fd, token, desired),
        };
        match outcome {
            Ok(()) => {
                if let Some(device) = self.arena.get_mut(id) {
                    device.base.registered = Some(desired);
                }
                Ok(())
            }
            Err(err) => {
                warn!("interest update failed for {:?}: {}", id, err);
                self.fail_io(err)
            }
        }
    }

    /// Puts a freshly built device under reactor management and arms its
    /// initial interest.
    pub(crate) fn install_device(&mut self, device: Device) -> Result<DevId> {
        if self.closed {
            return self.fail(ErrorKind::InvalidArgument);
        }
        let id = self.arena.insert(device);
        match self.update_interest(id) {
            Ok(()) => {
                trace!("device {:?} installed", id);
                Ok(id)
            }
            Err(err) => {
                self.arena.remove(id);
                Err(err)
            }
        }
    }

    /// Arms (or disarms) the write-side deadline from the head chunk.
    /// Devices with a connect deadline keep it until the connect resolves.
    pub(crate) fn rearm_write_timer(&mut self, id: DevId) {
        let (old, at) = {
            let device = match self.arena.get_mut(id) {
                Some(device) => device,
                None => return,
            };
            #[cfg(feature = "net")]
            if let Kind::Stream(stream) = &device.kind {
                if stream.connecting {
                    return;
                }
            }
            (
                device.base.wr_timer.take(),
                device.base.wq.head().and_then(|c| c.deadline),
            )
        };
        if let Some(old) = old {
            self.timers.cancel(old);
        }
        if let Some(at) = at {
            let timer = self.timers.insert(at, TimerTag::WriteDeadline(id));
            if let Some(device) = self.arena.get_mut(id) {
                device.base.wr_timer = Some(timer);
            }
        }
    }

    /*
     *
     * ===== Callback plumbing =====
     *
     */

    /// Runs a hook with the handler temporarily moved out of its slot, so
    /// the hook can re-enter the reactor.
    fn with_handler<R>(
        &mut self,
        owner: DevId,
        f: impl FnOnce(&mut dyn Handler, &mut Reactor) -> R,
    ) -> Option<R> {
        let mut handler = self.arena.get_mut(owner)?.handler.take()?;
        let out = f(handler.as_mut(), self);
        if let Some(device) = self.arena.get_mut(owner) {
            device.handler = Some(handler);
        }
        Some(out)
    }

    fn deliver_read(&mut self, id: DevId, data: &[u8]) -> Control {
        let owner = self.handler_owner(id);
        self.with_handler(owner, |h, r| h.on_read(r, owner, data))
            .unwrap_or(Control::Continue)
    }

    fn deliver_write(&mut self, id: DevId, wrlen: Option<usize>, ctx: usize) -> Control {
        let owner = self.handler_owner(id);
        self.with_handler(owner, |h, r| h.on_write(r, owner, wrlen, ctx))
            .unwrap_or(Control::Continue)
    }

    /*
     *
     * ===== The loop =====
     *
     */

    /// Runs until a stop request is absorbed or no work remains (no
    /// devices, no timers). Returns the effective stop reason,
    /// `StopReason::None` when the loop simply ran out of work.
    pub fn run(&mut self) -> Result<StopReason> {
        loop {
            self.absorb_stop_request();
            if self.stopped {
                break;
            }
            if !self.has_work() {
                break;
            }
            self.run_once(None)?;
            if self.stopped {
                break;
            }
        }
        Ok(self.stop_reason)
    }

    /// One loop iteration: expired timers, one readiness wait (bounded by
    /// `max_wait`), event dispatch, then the halt and reap sweeps. Returns
    /// whether work remains.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<bool> {
        if self.in_loop {
            return self.fail(ErrorKind::InvalidArgument);
        }
        self.in_loop = true;
        let out = self.iterate(max_wait);
        self.in_loop = false;
        out
    }

    fn has_work(&self) -> bool {
        self.arena.len() > 0 || !self.timers.is_empty()
    }

    fn iterate(&mut self, max_wait: Option<Duration>) -> Result<bool> {
        self.now = Instant::now();

        // Timer phase. Every entry due now fires before any I/O dispatch,
        // observing pre-I/O state.
        let mut expired = mem::take(&mut self.expired);
        self.timers.pop_expired(self.now, &mut expired);
        for tag in expired.drain(..) {
            match tag {
                TimerTag::ReadDeadline(dev) => {
                    if let Some(device) = self.arena.get_mut(dev) {
                        device.base.rd_timer = None;
                    }
                    debug!("read deadline expired on {:?}", dev);
                    self.halt_inner(dev, false, Some(ErrorKind::TimedOut));
                }
                TimerTag::WriteDeadline(dev) => {
                    if let Some(device) = self.arena.get_mut(dev) {
                        device.base.wr_timer = None;
                    }
                    debug!("write deadline expired on {:?}", dev);
                    self.halt_inner(dev, false, Some(ErrorKind::TimedOut));
                }
                TimerTag::Task(slot) => {
                    if let Some(task) = self.tasks.get_mut(slot as usize).and_then(Option::take)
                    {
                        self.free_tasks.push(slot);
                        task(self);
                    }
                }
            }
        }
        self.expired = expired;

        self.absorb_stop_request();

        // A pending stop or teardown must not be delayed by a blocking
        // wait; devices halted in the timer phase reach their sweep in this
        // iteration.
        let timeout = if self.stopped
            || !self.pending_halt.is_empty()
            || !self.zombies.is_empty()
        {
            Some(Duration::ZERO)
        } else {
            let next = self
                .timers
                .next_deadline()
                .map(|at| at.saturating_duration_since(self.now));
            match (next, max_wait) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, b) => b,
            }
        };
        if timeout.is_none() && self.arena.len() == 0 {
            // Nothing to wait on at all.
            return Ok(false);
        }

        let mut events = mem::take(&mut self.events);
        let res = self.selector.select(&mut events, timeout);
        match res {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => events.clear(),
            Err(err) => {
                self.events = events;
                return self.fail_io(err);
            }
        }

        trace!("dispatching {} readiness events", events.len());
        for ev in events.iter() {
            self.dispatch(ev);
        }
        self.events = events;

        self.sweep();

        self.absorb_stop_request();
        Ok(self.has_work())
    }

    fn dispatch(&mut self, ev: &sys::Event) {
        let token = event::token(ev);
        if token == WAKER {
            self.waker.drain();
            self.absorb_stop_request();
            return;
        }

        let id = match self.arena.by_index(token.0) {
            Some(id) => id,
            None => {
                trace!("event for vacated slot {}", token.0);
                return;
            }
        };

        // Readiness-only devices get the raw snapshot and nothing else.
        if let Some(device) = self.arena.get(id) {
            if let Kind::Raw(raw) = &device.kind {
                if raw.flags.contains(RawFlags::NOTIFY_ONLY) {
                    let ready = Readiness {
                        readable: event::is_readable(ev),
                        writable: event::is_writable(ev),
                        error: event::is_error(ev),
                        hup: event::is_read_closed(ev),
                    };
                    let verdict = self
                        .with_handler(id, |h, r| h.on_ready(r, id, ready))
                        .unwrap_or(Control::Continue);
                    if verdict.is_halt() {
                        self.halt(id);
                    }
                    return;
                }
            }
        }

        if event::is_error(ev) && self.dispatch_error(id) {
            return;
        }

        if event::is_readable(ev) || event::is_read_closed(ev) {
            self.dispatch_readable(id);
        }
        if self.is_live(id) && event::is_writable(ev) {
            self.dispatch_writable(id);
        }
    }

    fn is_live(&self, id: DevId) -> bool {
        self.arena.get(id).map_or(false, |d| d.base.is_live())
    }

    /// Handles an `EPOLLERR` condition. Returns `true` when the event is
    /// fully consumed (the device halted).
    fn dispatch_error(&mut self, id: DevId) -> bool {
        #[cfg(feature = "net")]
        {
            let socket_fd = match self.arena.get(id).map(|d| &d.kind) {
                Some(Kind::Stream(s)) => Some(s.fd.as_raw_fd()),
                Some(Kind::Datagram(d)) => Some(d.fd.as_raw_fd()),
                _ => None,
            };
            if let Some(fd) = socket_fd {
                let kind = match sys::net::take_socket_error(fd) {
                    Ok(Some(err)) => Error::from_io(err).kind(),
                    Ok(None) => return false, // spurious; let I/O decide
                    Err(err) => Error::from_io(err).kind(),
                };
                self.halt_inner(id, false, Some(kind));
                return true;
            }
        }
        // A pipe-like handle whose peer vanished.
        self.halt_inner(id, false, Some(ErrorKind::PipeClosed));
        true
    }

    fn dispatch_readable(&mut self, id: DevId) {
        #[cfg(feature = "net")]
        if matches!(self.arena.get(id).map(|d| &d.kind), Some(Kind::Listener(..))) {
            self.dispatch_accept(id);
            return;
        }

        // Fairness cap: a chatty device yields to its siblings; the
        // level-triggered selector redelivers what is left next iteration.
        for _ in 0..self.cfg.read_fair_cap {
            let fd = match self.arena.get(id) {
                Some(device) if device.base.is_live() && device.base.read_enabled => {
                    match device.raw_fd() {
                        Some(fd) => fd,
                        None => return,
                    }
                }
                _ => return,
            };

            let mut buf = mem::take(&mut self.read_buf);
            let res = sys::read(fd, &mut buf);
            match res {
                Ok(0) => {
                    self.read_buf = buf;
                    self.handle_eof(id);
                    return;
                }
                Ok(n) => {
                    let verdict = self.deliver_read(id, &buf[..n]);
                    self.read_buf = buf;
                    if verdict.is_halt() {
                        let owner = self.handler_owner(id);
                        self.halt(owner);
                        return;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.read_buf = buf;
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.read_buf = buf;
                }
                Err(err) => {
                    self.read_buf = buf;
                    // A pty master reports EIO once the slave side is gone;
                    // that is its way of saying EOF.
                    #[cfg(feature = "pty-device")]
                    if err.raw_os_error() == Some(libc::EIO)
                        && matches!(self.arena.get(id).map(|d| &d.kind), Some(Kind::Pty(..)))
                    {
                        self.handle_eof(id);
                        return;
                    }
                    let kind = Error::from_io(err).kind();
                    self.halt_inner(id, false, Some(kind));
                    return;
                }
            }
        }
    }

    /// EOF: deliver the empty read, then tear down kinds that treat EOF as
    /// terminal. Datagram sockets never get here with a true EOF (a
    /// zero-length datagram is delivered as an empty read and the device
    /// stays up).
    fn handle_eof(&mut self, id: DevId) {
        let terminal = match self.arena.get(id) {
            Some(device) => device.eof_is_terminal(),
            None => return,
        };
        if !terminal {
            let verdict = self.deliver_read(id, &[]);
            if verdict.is_halt() {
                let owner = self.handler_owner(id);
                self.halt(owner);
            }
            return;
        }

        if let Some(device) = self.arena.get_mut(id) {
            device.base.eof = true;
            device.base.read_enabled = false;
        }
        let _ = self.deliver_read(id, &[]);
        debug!("eof on {:?}", id);
        // Pipe halves go down alone; everything else (and the thread-device
        // output side, via the halt cascade) takes the device with it.
        self.halt(id);
    }

    cfg_net! {
        fn dispatch_accept(&mut self, id: DevId) {
            for _ in 0..self.cfg.read_fair_cap {
                let fd = match self.arena.get(id) {
                    Some(device) if device.base.is_live() && device.base.read_enabled => {
                        match device.raw_fd() {
                            Some(fd) => fd,
                            None => return,
                        }
                    }
                    _ => return,
                };
                match sys::net::accept(fd) {
                    Ok((conn, peer)) => {
                        trace!("accepted {} on {:?}", peer, id);
                        let verdict = self
                            .with_handler(id, |h, r| h.on_accept(r, id, conn, peer))
                            .unwrap_or(Control::Continue);
                        if verdict.is_halt() {
                            self.halt(id);
                            return;
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(ref err) if err.raw_os_error() == Some(libc::ECONNABORTED) => {
                        // The peer gave up while queued; not our failure.
                    }
                    Err(err) => {
                        let kind = Error::from_io(err).kind();
                        self.halt_inner(id, false, Some(kind));
                        return;
                    }
                }
            }
        }
    }

    fn dispatch_writable(&mut self, id: DevId) {
        #[cfg(feature = "net")]
        if matches!(
            self.arena.get(id).map(|d| &d.kind),
            Some(Kind::Stream(s)) if s.connecting
        ) {
            if !self.finish_connect(id) {
                return;
            }
        }

        loop {
            let (fd, head_len, sentinel) = {
                let device = match self.arena.get_mut(id) {
                    Some(device) if device.base.is_live() => device,
                    _ => return,
                };
                match device.base.wq.head() {
                    Some(head) => {
                        let fd = match device.raw_fd() {
                            Some(fd) => fd,
                            None => return,
                        };
                        (fd, head.len(), head.is_sentinel())
                    }
                    None => {
                        let _ = self.update_interest(id);
                        return;
                    }
                }
            };

            if sentinel {
                self.complete_shutdown_write(id, fd);
                return;
            }

            let res = {
                let device = match self.arena.get_mut(id) {
                    Some(device) => device,
                    None => return,
                };
                let head = match device.base.wq.head_mut() {
                    Some(head) => head,
                    None => return,
                };
                sys::write(fd, head.remaining())
            };

            match res {
                Ok(n) => {
                    let done = {
                        let device = match self.arena.get_mut(id) {
                            Some(device) => device,
                            None => return,
                        };
                        let head = match device.base.wq.head_mut() {
                            Some(head) => head,
                            None => return,
                        };
                        head.advance(n);
                        head.is_done()
                    };
                    if done {
                        let chunk = match self
                            .arena
                            .get_mut(id)
                            .and_then(|d| d.base.wq.pop())
                        {
                            Some(chunk) => chunk,
                            None => return,
                        };
                        self.rearm_write_timer(id);
                        let verdict =
                            self.deliver_write(id, Some(head_len), chunk.ctx);
                        if verdict.is_halt() {
                            let owner = self.handler_owner(id);
                            self.halt(owner);
                            return;
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    let kind = Error::from_io(err).kind();
                    self.halt_inner(id, false, Some(kind));
                    return;
                }
            }
        }
    }

    /// The queue drained down to the shutdown sentinel: close the writing
    /// side half-duplex and report the sentinel's completion.
    fn complete_shutdown_write(&mut self, id: DevId, fd: RawFd) {
        let (ctx, is_half) = {
            let device = match self.arena.get_mut(id) {
                Some(device) => device,
                None => return,
            };
            let chunk = match device.base.wq.pop() {
                Some(chunk) => chunk,
                None => return,
            };
            device.base.shutdown_pending = false;
            device.base.write_closed = true;
            (chunk.ctx, matches!(device.kind, Kind::Half(..)))
        };
        self.rearm_write_timer(id);
        debug!("write side of {:?} shut down", id);
        let _ = self.deliver_write(id, Some(0), ctx);

        if is_half {
            // A pipe half is one direction; closing it means closing the
            // fd, which means halting the half.
            self.halt_slave_only(id);
        } else {
            let _ = sys::shutdown_write(fd);
            let _ = self.update_interest(id);
        }
    }

    cfg_net! {
        /// Resolves an in-progress connect via `SO_ERROR`. Returns whether
        /// the device may continue with its write queue.
        fn finish_connect(&mut self, id: DevId) -> bool {
            let fd = {
                let device = match self.arena.get(id) {
                    Some(device) if device.base.is_live() => device,
                    _ => return false,
                };
                match device.raw_fd() {
                    Some(fd) => fd,
                    None => return false,
                }
            };
            match sys::net::take_socket_error(fd) {
                Ok(None) => {
                    let old = {
                        let device = match self.arena.get_mut(id) {
                            Some(device) => device,
                            None => return false,
                        };
                        if let Kind::Stream(stream) = &mut device.kind {
                            stream.connecting = false;
                        }
                        device.base.wr_timer.take()
                    };
                    if let Some(old) = old {
                        // The connect deadline; write deadlines re-arm from
                        // the queue below.
                        self.timers.cancel(old);
                    }
                    self.rearm_write_timer(id);
                    debug!("connect finished on {:?}", id);
                    let verdict = self
                        .with_handler(id, |h, r| h.on_connect(r, id))
                        .unwrap_or(Control::Continue);
                    if verdict.is_halt() {
                        self.halt(id);
                        return false;
                    }
                    let _ = self.update_interest(id);
                    self.is_live(id)
                }
                Ok(Some(err)) | Err(err) => {
                    let kind = Error::from_io(err).kind();
                    debug!("connect failed on {:?}: {:?}", id, kind);
                    self.halt_inner(id, false, Some(kind));
                    false
                }
            }
        }
    }

    /*
     *
     * ===== Sweeps =====
     *
     */

    /// End-of-iteration teardown. The halt sweep demotes HALTING devices to
    /// zombies (deregister, cancel timers, fail pending writes); the reap
    /// sweep fires `on_close` and frees each zombie. Close hooks may halt
    /// further devices, so the two alternate until both queues drain.
    fn sweep(&mut self) {
        loop {
            self.halt_sweep();
            match self.zombies.pop_front() {
                Some(id) => self.reap(id),
                None => {
                    if self.pending_halt.is_empty() {
                        return;
                    }
                }
            }
        }
    }

    fn halt_sweep(&mut self) {
        while let Some(id) = self.pending_halt.pop_front() {
            let (fd, registered, rd_timer, wr_timer, killed) = {
                let device = match self.arena.get_mut(id) {
                    Some(device) if device.base.state == State::Halting => device,
                    _ => continue,
                };
                (
                    device.raw_fd(),
                    device.base.registered.take(),
                    device.base.rd_timer.take(),
                    device.base.wr_timer.take(),
                    device.base.killed,
                )
            };

            if let (Some(fd), Some(_)) = (fd, registered) {
                if let Err(err) = self.selector.deregister(fd) {
                    warn!("deregister failed for {:?}: {}", id, err);
                }
            }
            if let Some(timer) = rd_timer {
                self.timers.cancel(timer);
            }
            if let Some(timer) = wr_timer {
                self.timers.cancel(timer);
            }

            // Fail the writes a cooperative halt leaves behind; a kill
            // drops them silently.
            loop {
                let chunk = match self.arena.get_mut(id) {
                    Some(device) => device.base.wq.pop(),
                    None => None,
                };
                let chunk = match chunk {
                    Some(chunk) => chunk,
                    None => break,
                };
                if !killed {
                    let _ = self.deliver_write(id, None, chunk.ctx);
                }
            }

            let defer_master = {
                let device = match self.arena.get_mut(id) {
                    Some(device) => device,
                    None => continue,
                };
                let waiting = match &device.kind {
                    Kind::PipeMaster(comp) => comp.alive() > 0,
                    #[cfg(feature = "thread-device")]
                    Kind::ThreadMaster(thr) => thr.comp.alive() > 0,
                    _ => false,
                };
                if !waiting {
                    device.base.state = State::Zombie;
                }
                waiting
            };
            if defer_master {
                // The master stays HALTING until its last slave is reaped.
                continue;
            }
            trace!("device {:?} is now a zombie", id);
            self.zombies.push_back(id);
        }
    }

    /// Fires `on_close` exactly once, releases handles, frees the slot.
    fn reap(&mut self, id: DevId) {
        let (owner, side) = {
            let device = match self.arena.get(id) {
                Some(device) => device,
                None => return,
            };
            match &device.kind {
                Kind::Half(half) => (half.master, half.side),
                _ => (id, Side::Whole),
            }
        };

        // Surface the failure that brought the device down for the
        // duration of on_close.
        self.last_err = self
            .arena
            .get(id)
            .and_then(|d| d.base.fail)
            .map(Error::new);

        // A thread master joins its worker before announcing the close; by
        // now both slaves are gone, so the worker has seen EOF on its ends
        // and is on its way out if not already.
        #[cfg(feature = "thread-device")]
        {
            let join = match self.arena.get_mut(id).map(|d| &mut d.kind) {
                Some(Kind::ThreadMaster(thr)) => thr.join.take(),
                _ => None,
            };
            if let Some(join) = join {
                if join.join().is_err() {
                    warn!("worker of {:?} panicked", id);
                }
            }
        }

        // Child teardown happens before on_close so the hook observes a
        // fully settled device.
        #[cfg(feature = "pty-device")]
        self.settle_pty_child(id);

        debug!("closing device {:?} ({:?})", owner, side);
        self.with_handler(owner, |h, r| h.on_close(r, owner, side));
        self.last_err = None;

        let device = match self.arena.remove(id) {
            Some(device) => device,
            None => return,
        };
        match device.kind {
            Kind::Raw(mut raw) => {
                if raw.flags.contains(RawFlags::KEEP_OPEN) {
                    if let Some(fd) = raw.fd.take() {
                        use std::os::fd::IntoRawFd;
                        let _ = fd.into_raw_fd();
                    }
                }
            }
            Kind::Half(half) => {
                drop(half.fd);
                self.slave_reaped(half.master, half.side);
            }
            _ => {}
        }
    }

    /// A slave slot was freed; when the master has no slaves left it
    /// becomes a zombie itself (halting it first if the sides were closed
    /// one by one).
    fn slave_reaped(&mut self, master: DevId, side: Side) {
        let remaining = {
            let device = match self.arena.get_mut(master) {
                Some(device) => device,
                None => return,
            };
            let comp = match &mut device.kind {
                Kind::PipeMaster(comp) => comp,
                #[cfg(feature = "thread-device")]
                Kind::ThreadMaster(thr) => &mut thr.comp,
                _ => return,
            };
            comp.clear(side);
            comp.alive()
        };
        if remaining > 0 {
            return;
        }
        let state = match self.arena.get_mut(master) {
            Some(device) => {
                let state = device.base.state;
                device.base.state = State::Zombie;
                state
            }
            None => return,
        };
        if state != State::Zombie {
            trace!("master {:?} follows its slaves", master);
            self.zombies.push_back(master);
        }
    }

    cfg_pty_device! {
        /// SIGTERM, a short grace, then SIGKILL and reap, honoring the
        /// forget flags.
        fn settle_pty_child(&mut self, id: DevId) {
            use crate::device::PtyFlags;
            use crate::sys::pty;

            let (child, flags) = match self.arena.get(id).map(|d| &d.kind) {
                Some(Kind::Pty(p)) => (p.child, p.flags),
                _ => return,
            };
            if flags.contains(PtyFlags::FORGET_CHILD) {
                return;
            }
            pty::terminate(child);
            for _ in 0..20 {
                match pty::try_reap(child) {
                    Ok(true) => return,
                    Ok(false) => std::thread::sleep(Duration::from_millis(10)),
                    Err(_) => return,
                }
            }
            pty::kill_hard(child);
            if flags.contains(PtyFlags::FORGET_DIEHARD_CHILD) {
                return;
            }
            pty::reap(child);
        }
    }

    /*
     *
     * ===== Shutdown =====
     *
     */

    /// Stops registered services, halts every device and drains the sweeps
    /// until each one has seen its `on_close`. Idempotent; also invoked on
    /// drop. Must not be called from inside a callback; request a stop
    /// instead and close after [`run`] returns.
    ///
    /// [`run`]: Reactor::run
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!("closing reactor ({} devices)", self.arena.len());

        let reason = match self.stop_reason {
            StopReason::None => StopReason::Normal,
            other => other,
        };
        for i in 0..self.services.len() {
            if let Some(mut svc) = self.services[i].take() {
                svc.on_stop(self, reason);
            }
        }
        self.services.clear();

        self.closed = true;
        while self.arena.len() > 0 {
            for id in self.arena.ids() {
                self.halt(id);
            }
            self.sweep();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("devices", &self.arena.len())
            .field("stopped", &self.stopped)
            .field("stop_reason", &self.stop_reason)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Stopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stopper")
            .field(
                "requested",
                &self.state.requested.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}
