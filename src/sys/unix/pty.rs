use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::{set_cloexec, set_nonblocking};

/// Opens a pty pair, forks, wires the slave to the child's stdio and execs
/// `argv`. Returns the master fd (non-blocking, close-on-exec) and the child
/// pid.
///
/// `via_shell` runs the command line through `/bin/sh -c` instead of
/// exec'ing `argv[0]` directly.
pub(crate) fn spawn(argv: &[&str], via_shell: bool) -> io::Result<(OwnedFd, libc::pid_t)> {
    if argv.is_empty() {
        return Err(io::ErrorKind::InvalidInput.into());
    }

    let argv_c = build_argv(argv, via_shell)?;

    let raw = syscall!(posix_openpt(libc::O_RDWR | libc::O_NOCTTY))?;
    // SAFETY: `posix_openpt(3)` just handed us the fd.
    let master = unsafe { OwnedFd::from_raw_fd(raw) };
    syscall!(grantpt(master.as_raw_fd()))?;
    syscall!(unlockpt(master.as_raw_fd()))?;

    let mut name = [0 as libc::c_char; 64];
    // `ptsname_r(3)` returns the errno instead of setting it.
    let rc = unsafe { libc::ptsname_r(master.as_raw_fd(), name.as_mut_ptr(), name.len()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    let slave_raw = syscall!(open(name.as_ptr(), libc::O_RDWR | libc::O_NOCTTY))?;
    // SAFETY: `open(2)` just handed us the fd.
    let slave = unsafe { OwnedFd::from_raw_fd(slave_raw) };

    let pid = syscall!(fork())?;
    if pid == 0 {
        // Child. Only async-signal-safe calls from here to exec.
        unsafe {
            libc::close(master.as_raw_fd());
            libc::setsid();
            libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY, 0);
            libc::dup2(slave.as_raw_fd(), 0);
            libc::dup2(slave.as_raw_fd(), 1);
            libc::dup2(slave.as_raw_fd(), 2);
            if slave.as_raw_fd() > 2 {
                libc::close(slave.as_raw_fd());
            }

            let mut args: Vec<*const libc::c_char> =
                argv_c.iter().map(|a| a.as_ptr()).collect();
            args.push(std::ptr::null());
            libc::execvp(args[0], args.as_ptr());
            libc::_exit(127);
        }
    }

    drop(slave);
    set_nonblocking(master.as_raw_fd())?;
    set_cloexec(master.as_raw_fd())?;
    Ok((master, pid))
}

fn build_argv(argv: &[&str], via_shell: bool) -> io::Result<Vec<CString>> {
    let to_c = |s: &str| {
        CString::new(s).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
    };
    if via_shell {
        Ok(vec![
            to_c("/bin/sh")?,
            to_c("-c")?,
            to_c(&argv.join(" "))?,
        ])
    } else {
        argv.iter().map(|a| to_c(a)).collect()
    }
}

/// Non-blocking check whether `pid` has exited; reaps it if so.
pub(crate) fn try_reap(pid: libc::pid_t) -> io::Result<bool> {
    let mut status: libc::c_int = 0;
    match syscall!(waitpid(pid, &mut status, libc::WNOHANG)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        // Someone else (e.g. a SIGCHLD reaper) got there first.
        Err(ref err) if err.raw_os_error() == Some(libc::ECHILD) => Ok(true),
        Err(err) => Err(err),
    }
}

/// Blocking reap of `pid`, ignoring `ECHILD`.
pub(crate) fn reap(pid: libc::pid_t) {
    let mut status: libc::c_int = 0;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
}

pub(crate) fn terminate(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

pub(crate) fn kill_hard(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}
