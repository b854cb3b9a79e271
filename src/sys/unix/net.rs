use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Creates a non-blocking socket of the given type for `addr`'s family.
fn new_socket(addr: &SocketAddr, ty: libc::c_int) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    let fd = syscall!(socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0))?;
    // SAFETY: `socket(2)` just handed us the fd.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn from_socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(ref addr) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sin },
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(ref addr) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
            };
            (
                SocketAddrCRepr { v6: sin6 },
                size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// A `sockaddr_in` or `sockaddr_in6` by value, passable as `*const sockaddr`.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const SocketAddrCRepr as *const libc::sockaddr
    }
}

/// `storage` must hold a `sockaddr_in` or `sockaddr_in6` written by the OS.
unsafe fn to_socket_addr(storage: *const libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = &*(storage as *const libc::sockaddr_in);
            let ip = std::net::Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(std::net::SocketAddrV4::new(
                ip,
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr = &*(storage as *const libc::sockaddr_in6);
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(std::net::SocketAddrV6::new(
                ip,
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// Starts a non-blocking stream connect. Returns the socket plus whether the
/// connect is still in progress (`EINPROGRESS`).
pub(crate) fn stream_connect(addr: &SocketAddr) -> io::Result<(OwnedFd, bool)> {
    use std::os::fd::AsRawFd;

    let socket = new_socket(addr, libc::SOCK_STREAM)?;
    let (raw_addr, raw_addr_len) = from_socket_addr(addr);
    match syscall!(connect(socket.as_raw_fd(), raw_addr.as_ptr(), raw_addr_len)) {
        Ok(_) => Ok((socket, false)),
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok((socket, true)),
        Err(err) => Err(err),
    }
}

/// Binds and listens a non-blocking stream socket.
pub(crate) fn stream_listen(addr: &SocketAddr, backlog: u32) -> io::Result<OwnedFd> {
    use std::os::fd::AsRawFd;

    let socket = new_socket(addr, libc::SOCK_STREAM)?;
    let yes: libc::c_int = 1;
    syscall!(setsockopt(
        socket.as_raw_fd(),
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &yes as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    let (raw_addr, raw_addr_len) = from_socket_addr(addr);
    syscall!(bind(socket.as_raw_fd(), raw_addr.as_ptr(), raw_addr_len))?;
    syscall!(listen(socket.as_raw_fd(), backlog as libc::c_int))?;
    Ok(socket)
}

/// Accepts one pending connection; the returned socket is non-blocking and
/// close-on-exec.
pub(crate) fn accept(listener: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = syscall!(accept4(
        listener,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    // SAFETY: `accept4(2)` handed us the fd and filled the address in.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };
    let peer = unsafe { to_socket_addr(storage.as_ptr())? };
    Ok((socket, peer))
}

/// Creates a connected datagram socket, optionally bound first.
pub(crate) fn datagram_connect(
    bind: Option<&SocketAddr>,
    peer: &SocketAddr,
) -> io::Result<OwnedFd> {
    use std::os::fd::AsRawFd;

    let socket = new_socket(peer, libc::SOCK_DGRAM)?;
    if let Some(bind) = bind {
        let (raw_addr, raw_addr_len) = from_socket_addr(bind);
        syscall!(bind(socket.as_raw_fd(), raw_addr.as_ptr(), raw_addr_len))?;
    }
    let (raw_addr, raw_addr_len) = from_socket_addr(peer);
    syscall!(connect(socket.as_raw_fd(), raw_addr.as_ptr(), raw_addr_len))?;
    Ok(socket)
}

/// Reads back the result of an in-progress connect from `SO_ERROR`.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut errno: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut errno as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ))?;
    if errno == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(errno)))
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
    ))?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}
