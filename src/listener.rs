//! Frontend listener: socket creation, the composed bind-option set, and
//! accept(), grounded on the original's `tcp_bind_listener` (`proto_tcp.c`).

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Socket, Type};

use crate::error::BindStatus;

/// The socket options a listener may be configured with, independent of any
/// one platform actually supporting all of them.
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    pub reuse_addr: bool,
    pub reuse_port: bool,
    pub no_linger: bool,
    /// Seconds to defer `accept()` until data arrives (`TCP_DEFER_ACCEPT`).
    pub defer_accept: Option<u32>,
    pub mss: Option<u32>,
    pub quickack_off: bool,
    pub bind_to_device: Option<String>,
    pub transparent: bool,
    pub backlog: i32,
}

/// Create, configure and bind one listening socket. Returns the raw fd (left
/// non-blocking, not yet `listen()`ing — callers that want to bind many
/// listeners before opening the floodgates can do so) plus the
/// best-effort-applied option failures folded into [`BindStatus`].
///
/// Mirrors `tcp_bind_listener`'s structure: socket/fcntl failures are fatal,
/// `SO_REUSEADDR`/`SO_BINDTODEVICE`/`TCP_MAXSEG`/`TCP_DEFER_ACCEPT` failures
/// are reported but non-fatal, and `bind`/`listen` failures are retryable.
pub fn bind_listener(
    addr: SocketAddr,
    opts: &ListenerOptions,
    fd_count: usize,
    maxsock: usize,
) -> Result<(RawFd, BindStatus), (BindStatus, io::Error)> {
    let mut status = BindStatus::OK;

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(|e| {
        (BindStatus { retryable: true, alert: true, ..BindStatus::OK }, e)
    })?;

    if fd_count >= maxsock {
        return Err((
            BindStatus { fatal: true, abort: true, alert: true, ..BindStatus::OK },
            io::Error::new(io::ErrorKind::Other, "not enough free sockets (raise the fd limit)"),
        ));
    }

    if let Err(e) = socket.set_nonblocking(true) {
        return Err((BindStatus { fatal: true, alert: true, ..BindStatus::OK }, e));
    }

    if opts.reuse_addr {
        if socket.set_reuse_address(true).is_err() {
            status.alert = true;
        }
    }
    if opts.no_linger {
        let _ = socket.set_linger(Some(std::time::Duration::ZERO));
    }
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "openbsd"))]
    if opts.reuse_port {
        // Old Linux libc versions may reject this; ignore failures silently,
        // matching the original's "might return an error that we will
        // silently ignore".
        let _ = socket.set_reuse_port(true);
    }

    if opts.transparent {
        if apply_transparent(&socket).is_err() {
            status.alert = true;
        }
    }

    #[cfg(target_os = "linux")]
    if let Some(iface) = &opts.bind_to_device {
        if socket.bind_device(Some(iface.as_bytes())).is_err() {
            status.warn = true;
        }
    }

    if let Some(mss) = opts.mss {
        if set_tcp_int_opt(&socket, libc::TCP_MAXSEG, mss as libc::c_int).is_err() {
            status.warn = true;
        }
    }

    #[cfg(target_os = "linux")]
    if let Some(secs) = opts.defer_accept {
        if set_tcp_int_opt(&socket, libc::TCP_DEFER_ACCEPT, secs as libc::c_int).is_err() {
            status.warn = true;
        }
    }

    if let Err(e) = socket.bind(&addr.into()) {
        return Err((BindStatus { retryable: true, alert: true, ..status }, e));
    }

    let backlog = if opts.backlog > 0 { opts.backlog } else { 1024 };
    if let Err(e) = socket.listen(backlog) {
        return Err((BindStatus { retryable: true, alert: true, ..status }, e));
    }

    if opts.quickack_off {
        #[cfg(target_os = "linux")]
        let _ = set_tcp_int_opt(&socket, libc::TCP_QUICKACK, 0);
    }

    Ok((socket.into_raw_fd(), status))
}

fn apply_transparent(socket: &Socket) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let fd = socket.as_raw_fd();
        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_IP,
                libc::IP_TRANSPARENT,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of_val(&on) as libc::socklen_t,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        const IP_FREEBIND: libc::c_int = 15;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_IP,
                IP_FREEBIND,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of_val(&on) as libc::socklen_t,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        Err(io::Error::last_os_error())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = socket;
        Err(io::Error::new(io::ErrorKind::Unsupported, "transparent bind unavailable"))
    }
}

#[cfg(target_os = "linux")]
fn set_tcp_int_opt(socket: &Socket, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            opt,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_int_opt(_socket: &Socket, _opt: libc::c_int, _value: libc::c_int) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "option unavailable on this platform"))
}

/// Accept one connection off a bound, listening, non-blocking socket.
/// Returns `Ok(None)` on `EAGAIN`/`EWOULDBLOCK` (nothing pending right now).
pub fn accept(listener_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    use std::mem::MaybeUninit;

    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "openbsd"
    ))]
    let fd = unsafe {
        libc::accept4(
            listener_fd,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        )
    };
    #[cfg(not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "openbsd"
    )))]
    let fd = unsafe {
        let fd = libc::accept(listener_fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len);
        if fd >= 0 {
            libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        fd
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(None),
            _ => Err(err),
        };
    }

    let addr = unsafe { sockaddr_to_std(&storage.assume_init(), len) }?;
    Ok(Some((fd, addr)))
}

unsafe fn sockaddr_to_std(
    storage: &libc::sockaddr_storage,
    _len: libc::socklen_t,
) -> io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: libc::sockaddr_in = std::ptr::read(storage as *const _ as *const _);
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: libc::sockaddr_in6 = std::ptr::read(storage as *const _ as *const _);
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, addr.sin6_flowinfo, addr.sin6_scope_id)))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported address family")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_accept_loopback() {
        let opts = ListenerOptions { reuse_addr: true, backlog: 16, ..ListenerOptions::default() };
        let (fd, status) =
            bind_listener("127.0.0.1:0".parse().unwrap(), &opts, 0, 1024).expect("bind");
        assert!(status.is_ok());
        assert!(fd >= 0);
        assert_eq!(accept(fd).unwrap(), None);
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn fd_count_at_maxsock_is_fatal_and_aborts() {
        let opts = ListenerOptions::default();
        let err = bind_listener("127.0.0.1:0".parse().unwrap(), &opts, 10, 10).unwrap_err();
        assert!(err.0.fatal);
        assert!(err.0.abort);
    }
}
