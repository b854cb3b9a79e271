#![allow(unused_macros)]

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

macro_rules! cfg_net {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "net")]
            #[cfg_attr(docsrs, doc(cfg(feature = "net")))]
            $item
        )*
    }
}

macro_rules! cfg_thread_device {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "thread-device")]
            #[cfg_attr(docsrs, doc(cfg(feature = "thread-device")))]
            $item
        )*
    }
}

macro_rules! cfg_pty_device {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "pty-device")]
            #[cfg_attr(docsrs, doc(cfg(feature = "pty-device")))]
            $item
        )*
    }
}
