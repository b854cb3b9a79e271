//! Device identity, lifecycle state and the per-device callback surface.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::error::ErrorKind;
use crate::interest::Interest;
use crate::queue::WriteQueue;
use crate::reactor::Reactor;
use crate::timer::TimerId;

/// Stable identity of a reactor-managed device.
///
/// A `DevId` is an arena index paired with a generation counter, so an id
/// kept across the device's teardown can never alias a newer device in the
/// recycled slot; operations on a stale id fail with `bad_handle`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DevId {
    pub(crate) idx: u32,
    pub(crate) gen: u32,
}

/// Which part of a device a close notification is about.
///
/// Composite (pipe and thread) devices report their slaves as [`Side::In`] /
/// [`Side::Out`] and the master itself as [`Side::Whole`]; every other
/// device kind always reports [`Side::Whole`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Whole,
    In,
    Out,
}

/// A callback's say over its device: keep going or tear the device down.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Control {
    Continue,
    Halt,
}

impl Control {
    pub(crate) fn is_halt(self) -> bool {
        matches!(self, Control::Halt)
    }
}

/// Readiness snapshot passed to notify-only raw-handle devices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hup: bool,
}

/// Per-device event callbacks.
///
/// All hooks run on the reactor thread and may freely call back into the
/// reactor they are handed, including halting their own device or any
/// sibling; actual teardown is deferred to the end of the loop iteration.
/// Hooks must not block, one stalled callback stalls the entire loop.
#[allow(unused_variables)]
pub trait Handler {
    /// Delivered bytes, in arrival order. An empty slice signals EOF; device
    /// kinds that treat EOF as terminal halt right after this call returns.
    fn on_read(&mut self, reactor: &mut Reactor, dev: DevId, data: &[u8]) -> Control {
        Control::Continue
    }

    /// One completed (or abandoned) write chunk. `wrlen` is `Some(n)` when
    /// the whole chunk went out and `None` when the chunk was flushed
    /// unwritten because the device halted. `ctx` is the value given to
    /// `write`.
    fn on_write(
        &mut self,
        reactor: &mut Reactor,
        dev: DevId,
        wrlen: Option<usize>,
        ctx: usize,
    ) -> Control {
        Control::Continue
    }

    /// Fired exactly once per device (and once per slave of a composite
    /// device), strictly after its last `on_read`/`on_write`. The failure
    /// that tore the device down, if any, is readable through
    /// [`Reactor::last_error`] for the duration of this call.
    fn on_close(&mut self, reactor: &mut Reactor, dev: DevId, side: Side) {}

    /// A stream socket finished its non-blocking connect.
    fn on_connect(&mut self, reactor: &mut Reactor, dev: DevId) -> Control {
        Control::Continue
    }

    /// A listener accepted `conn` from `peer`. Wrap the fd with
    /// [`Reactor::make_stream_from`] to manage it; dropping it refuses the
    /// connection.
    fn on_accept(
        &mut self,
        reactor: &mut Reactor,
        dev: DevId,
        conn: OwnedFd,
        peer: SocketAddr,
    ) -> Control {
        Control::Continue
    }

    /// Raw readiness for notify-only devices; no I/O has been performed.
    fn on_ready(&mut self, reactor: &mut Reactor, dev: DevId, ready: Readiness) -> Control {
        Control::Continue
    }
}

/// Lifecycle of a device slot. `REAPED` has no variant: a reaped device's
/// slot is freed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Live,
    Halting,
    Zombie,
}

/// Shared base record of every device kind.
pub(crate) struct Base {
    pub(crate) state: State,
    pub(crate) killed: bool,
    pub(crate) read_enabled: bool,
    pub(crate) eof: bool,
    pub(crate) wq: WriteQueue,
    /// Set once the writing side is closed (sentinel completed or the user
    /// half-closed); later writes fail with `pipe_closed`.
    pub(crate) write_closed: bool,
    /// A shutdown sentinel is queued but has not drained yet.
    pub(crate) shutdown_pending: bool,
    pub(crate) rd_timer: Option<TimerId>,
    pub(crate) wr_timer: Option<TimerId>,
    /// Interest currently armed with the selector; `Some(None)` means the
    /// handle is registered with no interest.
    pub(crate) registered: Option<Option<Interest>>,
    /// First failure observed; surfaced as the reactor's last error while
    /// `on_close` runs.
    pub(crate) fail: Option<ErrorKind>,
}

impl Base {
    pub(crate) fn new() -> Base {
        Base {
            state: State::Live,
            killed: false,
            read_enabled: true,
            eof: false,
            wq: WriteQueue::new(),
            write_closed: false,
            shutdown_pending: false,
            rd_timer: None,
            wr_timer: None,
            registered: None,
            fail: None,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state == State::Live
    }

    pub(crate) fn note_failure(&mut self, kind: ErrorKind) {
        if self.fail.is_none() {
            self.fail = Some(kind);
        }
    }
}

/// Bookkeeping of a composite (pipe/thread) master over its two slaves,
/// indexed `[In, Out]`. A slot goes back to `None` when the slave is reaped;
/// the master follows once both are gone.
pub(crate) struct Composite {
    pub(crate) slaves: [Option<DevId>; 2],
}

impl Composite {
    pub(crate) fn slave(&self, side: Side) -> Option<DevId> {
        match side {
            Side::In => self.slaves[0],
            Side::Out => self.slaves[1],
            Side::Whole => None,
        }
    }

    pub(crate) fn clear(&mut self, side: Side) {
        match side {
            Side::In => self.slaves[0] = None,
            Side::Out => self.slaves[1] = None,
            Side::Whole => {}
        }
    }

    pub(crate) fn alive(&self) -> usize {
        self.slaves.iter().flatten().count()
    }
}

/// I/O direction of a composite half, independent of its [`Side`] label:
/// a pipe's `In` slave is the application's reading end, while a thread
/// device's `In` slave is the application's writing end (input to the
/// worker).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

/// One direction of a composite device; owns the actual handle.
pub(crate) struct Half {
    pub(crate) fd: OwnedFd,
    pub(crate) side: Side,
    pub(crate) dir: Dir,
    pub(crate) master: DevId,
}

/// Flags for [`Reactor::adopt`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RawFlags(u8);

impl RawFlags {
    /// Leave the handle open when the device is reaped.
    pub const KEEP_OPEN: RawFlags = RawFlags(1 << 0);
    /// Never arm readable interest.
    pub const DISABLE_IN: RawFlags = RawFlags(1 << 1);
    /// Never arm writable interest.
    pub const DISABLE_OUT: RawFlags = RawFlags(1 << 2);
    /// No stream I/O at all: readiness is reported through `on_ready` and
    /// the write queue is unavailable.
    pub const NOTIFY_ONLY: RawFlags = RawFlags(1 << 3);

    pub fn empty() -> RawFlags {
        RawFlags(0)
    }

    pub fn contains(self, other: RawFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RawFlags {
    type Output = RawFlags;

    fn bitor(self, other: RawFlags) -> RawFlags {
        RawFlags(self.0 | other.0)
    }
}

cfg_pty_device! {
    /// Flags for [`Reactor::make_pty`].
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PtyFlags(u8);

    impl PtyFlags {
        /// Run the command line through `/bin/sh -c`.
        pub const SHELL: PtyFlags = PtyFlags(1 << 0);
        /// Perform no child teardown at all. Set this when the application
        /// reaps children itself, e.g. with `SIGCHLD` set to `SIG_IGN`.
        pub const FORGET_CHILD: PtyFlags = PtyFlags(1 << 1);
        /// Send the kill sequence but do not wait for a child that survives
        /// `SIGKILL`.
        pub const FORGET_DIEHARD_CHILD: PtyFlags = PtyFlags(1 << 2);

        pub fn empty() -> PtyFlags {
            PtyFlags(0)
        }

        pub fn contains(self, other: PtyFlags) -> bool {
            self.0 & other.0 == other.0
        }
    }

    impl std::ops::BitOr for PtyFlags {
        type Output = PtyFlags;

        fn bitor(self, other: PtyFlags) -> PtyFlags {
            PtyFlags(self.0 | other.0)
        }
    }
}

pub(crate) struct RawState {
    /// `None` after a keep-open reap released the handle to the caller.
    pub(crate) fd: Option<OwnedFd>,
    pub(crate) flags: RawFlags,
}

cfg_net! {
    pub(crate) struct StreamState {
        pub(crate) fd: OwnedFd,
        pub(crate) connecting: bool,
    }

    pub(crate) struct ListenerState {
        pub(crate) fd: OwnedFd,
    }

    pub(crate) struct DatagramState {
        pub(crate) fd: OwnedFd,
    }
}

cfg_thread_device! {
    pub(crate) struct ThreadState {
        pub(crate) comp: Composite,
        pub(crate) join: Option<std::thread::JoinHandle<()>>,
    }
}

cfg_pty_device! {
    pub(crate) struct PtyState {
        pub(crate) fd: OwnedFd,
        pub(crate) child: libc::pid_t,
        pub(crate) flags: PtyFlags,
    }
}

/// The tagged variant over device kinds; per-kind raw I/O dispatches by
/// matching on this.
pub(crate) enum Kind {
    PipeMaster(Composite),
    Half(Half),
    Raw(RawState),
    #[cfg(feature = "net")]
    Stream(StreamState),
    #[cfg(feature = "net")]
    Listener(ListenerState),
    #[cfg(feature = "net")]
    Datagram(DatagramState),
    #[cfg(feature = "thread-device")]
    ThreadMaster(ThreadState),
    #[cfg(feature = "pty-device")]
    Pty(PtyState),
}

pub(crate) struct Device {
    pub(crate) base: Base,
    pub(crate) kind: Kind,
    /// Taken out for the duration of a callback so the hook can re-enter
    /// the reactor; slaves have no handler of their own, their master's is
    /// used.
    pub(crate) handler: Option<Box<dyn Handler>>,
}

impl Device {
    /// The kernel handle this device polls, if it has one. Composite
    /// masters do not.
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        match &self.kind {
            Kind::PipeMaster(..) => None,
            Kind::Half(half) => Some(half.fd.as_raw_fd()),
            Kind::Raw(raw) => raw.fd.as_ref().map(|fd| fd.as_raw_fd()),
            #[cfg(feature = "net")]
            Kind::Stream(s) => Some(s.fd.as_raw_fd()),
            #[cfg(feature = "net")]
            Kind::Listener(l) => Some(l.fd.as_raw_fd()),
            #[cfg(feature = "net")]
            Kind::Datagram(d) => Some(d.fd.as_raw_fd()),
            #[cfg(feature = "thread-device")]
            Kind::ThreadMaster(..) => None,
            #[cfg(feature = "pty-device")]
            Kind::Pty(p) => Some(p.fd.as_raw_fd()),
        }
    }

    /// Whether EOF on the reading side tears the device down.
    pub(crate) fn eof_is_terminal(&self) -> bool {
        match &self.kind {
            Kind::Half(..) => true,
            Kind::Raw(raw) => !raw.flags.contains(RawFlags::NOTIFY_ONLY),
            #[cfg(feature = "net")]
            Kind::Stream(..) => true,
            #[cfg(feature = "net")]
            Kind::Datagram(..) => false,
            #[cfg(feature = "net")]
            Kind::Listener(..) => false,
            #[cfg(feature = "pty-device")]
            Kind::Pty(..) => true,
            _ => false,
        }
    }

    /// Whether a zero-length write means "drain, then close the writing
    /// side". Kinds without that behavior reject empty writes.
    pub(crate) fn supports_shutdown_write(&self) -> bool {
        match &self.kind {
            Kind::Half(..) => true,
            #[cfg(feature = "net")]
            Kind::Stream(..) => true,
            _ => false,
        }
    }
}

struct Slot {
    gen: u32,
    dev: Option<Device>,
}

/// Generational arena of device slots. Freed slots are recycled with a
/// bumped generation, which is what invalidates stale `DevId`s.
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub(crate) fn new() -> Arena {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, dev: Device) -> DevId {
        match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                debug_assert!(slot.dev.is_none());
                slot.dev = Some(dev);
                DevId { idx, gen: slot.gen }
            }
            None => {
                self.slots.push(Slot { gen: 0, dev: Some(dev) });
                DevId {
                    idx: (self.slots.len() - 1) as u32,
                    gen: 0,
                }
            }
        }
    }

    pub(crate) fn get(&self, id: DevId) -> Option<&Device> {
        let slot = self.slots.get(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.dev.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: DevId) -> Option<&mut Device> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.dev.as_mut()
    }

    /// Resolves a selector token back to the device occupying that slot.
    pub(crate) fn by_index(&self, idx: usize) -> Option<DevId> {
        let slot = self.slots.get(idx)?;
        slot.dev.as_ref()?;
        Some(DevId {
            idx: idx as u32,
            gen: slot.gen,
        })
    }

    /// Frees the slot, returning the device for final teardown.
    pub(crate) fn remove(&mut self, id: DevId) -> Option<Device> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let dev = slot.dev.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.idx);
        Some(dev)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn ids(&self) -> Vec<DevId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.dev.is_some())
            .map(|(idx, s)| DevId {
                idx: idx as u32,
                gen: s.gen,
            })
            .collect()
    }
}
