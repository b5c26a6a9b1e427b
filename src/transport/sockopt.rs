use std::io;
use std::net::TcpStream;

/// Tags the socket's packets with `mark` for kernel-side policy routing.
/// Requires CAP_NET_ADMIN.
#[cfg(target_os = "linux")]
pub fn set_mark(stream: &TcpStream, mark: u32) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    unsafe {
        self::linux::setsockopt(stream.as_raw_fd(), ::libc::SOL_SOCKET, ::libc::SO_MARK, mark)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_mark(_stream: &TcpStream, mark: u32) -> io::Result<()> {
    debug!("connection marking unsupported on this platform; mark={:#x}", mark);
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn set_reuse_addr(stream: &TcpStream) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    unsafe {
        self::linux::setsockopt(
            stream.as_raw_fd(),
            ::libc::SOL_SOCKET,
            ::libc::SO_REUSEADDR,
            1,
        )
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_reuse_addr(_stream: &TcpStream) -> io::Result<()> {
    debug!("SO_REUSEADDR unsupported on this platform");
    Ok(())
}

/// Lets the socket bind to an address not assigned to any local
/// interface. Requires CAP_NET_ADMIN.
#[cfg(target_os = "linux")]
pub fn set_transparent(stream: &TcpStream) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    unsafe {
        self::linux::setsockopt(
            stream.as_raw_fd(),
            ::libc::IPPROTO_IP,
            ::libc::IP_TRANSPARENT,
            1,
        )
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_transparent(_stream: &TcpStream) -> io::Result<()> {
    debug!("IP_TRANSPARENT unsupported on this platform");
    Ok(())
}

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::mem;
    use std::os::unix::io::RawFd;

    pub unsafe fn setsockopt(
        fd: RawFd,
        level: ::libc::c_int,
        name: ::libc::c_int,
        val: u32,
    ) -> io::Result<()> {
        let rc = ::libc::setsockopt(
            fd,
            level,
            name,
            &val as *const u32 as *const ::libc::c_void,
            mem::size_of::<u32>() as ::libc::socklen_t,
        );
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
