//! Outbound connector: socket creation, source-address binding and
//! non-blocking connect initiation, grounded on the original's
//! `tcp_connect_server` (`proto_tcp.c`).

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{IntoRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::ConnectError;

/// Which address a new outbound socket binds to before connecting.
#[derive(Debug, Clone, Copy)]
pub enum SourceBindPolicy {
    /// Let the kernel pick both address and (unless a range is configured)
    /// port.
    Plain,
    /// Bind to the client's address, kernel-picked port.
    ClientAddress,
    /// Bind to the client's address and port (requires the transparent-proxy
    /// socket option, since the port is normally already in use by the
    /// client's own socket).
    ClientAddressAndPort,
    /// Bind to a backend-computed foreign address.
    DynamicForeign(IpAddr),
}

#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub base: u16,
    pub len: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    pub source: Option<SourceBindPolicy>,
    pub port_range: Option<PortRange>,
    pub transparent: bool,
    pub freebind: bool,
    pub keepalive: bool,
    pub no_linger: bool,
}

impl Default for SourceBindPolicy {
    fn default() -> SourceBindPolicy {
        SourceBindPolicy::Plain
    }
}

const PORT_RANGE_RETRIES: usize = 10;

/// Tracks which source ports from a configured [`PortRange`] are currently
/// in use, so a failed or closed connection can release its port for reuse.
#[derive(Default)]
pub struct PortAllocator {
    in_use: HashSet<u16>,
}

impl PortAllocator {
    pub fn new() -> PortAllocator {
        PortAllocator::default()
    }

    fn try_allocate(&mut self, range: PortRange, attempt: usize) -> Option<u16> {
        if range.len == 0 {
            return None;
        }
        // Deterministic probing order rather than random: acceptable since
        // collisions are rare and we retry up to PORT_RANGE_RETRIES times.
        let port = range.base.wrapping_add((attempt as u16) % range.len);
        if self.in_use.contains(&port) {
            None
        } else {
            self.in_use.insert(port);
            Some(port)
        }
    }

    pub fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

fn apply_foreign_bind(socket: &Socket, opts: &ConnectOptions) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = socket.as_raw_fd();
        if opts.transparent {
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
        }
        if opts.freebind {
            const IP_FREEBIND: libc::c_int = 15;
            let on: libc::c_int = 1;
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
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = socket;
    }
    // Neither kernel option worked (or neither is configured): the legacy
    // NAT-assist fallback this comment refers to in the original is not
    // carried here (it depends on an out-of-tree kernel module); callers
    // must treat foreign binding as unavailable.
    Err(io::Error::new(io::ErrorKind::Unsupported, "foreign bind unavailable"))
}

fn resolve_source(policy: SourceBindPolicy, client_addr: Option<SocketAddr>) -> Option<IpAddr> {
    match policy {
        SourceBindPolicy::Plain => None,
        SourceBindPolicy::ClientAddress | SourceBindPolicy::ClientAddressAndPort => {
            client_addr.map(|a| a.ip())
        }
        SourceBindPolicy::DynamicForeign(ip) => Some(ip),
    }
}

fn bind_socket(
    socket: &Socket,
    ip: IpAddr,
    port: u16,
    foreign: bool,
    opts: &ConnectOptions,
) -> io::Result<()> {
    if foreign {
        apply_foreign_bind(socket, opts)?;
    }
    socket.bind(&SocketAddr::new(ip, port).into())
}

/// Create a non-blocking socket, apply source binding per `opts`, and
/// initiate `connect()` toward `target`. Returns the raw fd on success (the
/// connect may still be in progress; caller registers write-interest and a
/// connect-timeout deadline) or a [`ConnectError`] classifying the failure.
pub fn connect(
    target: SocketAddr,
    client_addr: Option<SocketAddr>,
    opts: &ConnectOptions,
    fd_count: usize,
    maxsock: usize,
    allocator: &mut PortAllocator,
) -> Result<RawFd, ConnectError> {
    if fd_count >= maxsock {
        return Err(ConnectError::ProxyCondition);
    }

    let domain = if target.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|_| ConnectError::Resource)?;
    socket.set_nonblocking(true).map_err(|_| ConnectError::Internal("nonblocking"))?;
    let _ = socket.set_nodelay(true);
    if opts.keepalive {
        let _ = socket.set_keepalive(true);
    }
    if opts.no_linger {
        let _ = socket.set_linger(Some(std::time::Duration::ZERO));
    }

    let policy = opts.source.unwrap_or(SourceBindPolicy::Plain);
    let source_ip = resolve_source(policy, client_addr);
    let foreign = matches!(
        policy,
        SourceBindPolicy::ClientAddressAndPort | SourceBindPolicy::DynamicForeign(_)
    );
    let source_port = match policy {
        SourceBindPolicy::ClientAddressAndPort => client_addr.map(|a| a.port()),
        _ => None,
    };

    let mut allocated_port = None;
    if let Some(ip) = source_ip {
        let bind_result = if let Some(range) = opts.port_range {
            let mut last_err = None;
            let mut ok = false;
            for attempt in 0..PORT_RANGE_RETRIES {
                let Some(port) = allocator.try_allocate(range, attempt) else {
                    continue;
                };
                match bind_socket(&socket, ip, port, foreign, opts) {
                    Ok(()) => {
                        allocated_port = Some(port);
                        ok = true;
                        break;
                    }
                    Err(err) => {
                        allocator.release(port);
                        last_err = Some(err);
                    }
                }
            }
            if ok {
                Ok(())
            } else {
                Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "port range exhausted")))
            }
        } else {
            bind_socket(&socket, ip, source_port.unwrap_or(0), foreign, opts)
        };

        if let Err(err) = bind_result {
            if let Some(port) = allocated_port {
                allocator.release(port);
            }
            return Err(if foreign { ConnectError::Resource } else { ConnectError::Internal("bind") });
        }
    }

    match socket.connect(&target.into()) {
        Ok(()) => Ok(socket.into_raw_fd()),
        Err(err) => match classify_connect_error(&err) {
            Ok(()) => Ok(socket.into_raw_fd()),
            Err(ce) => {
                // Release the port on every connect failure, matching "release
                // the port on failure or on socket close".
                if let Some(port) = allocated_port {
                    allocator.release(port);
                }
                Err(ce)
            }
        },
    }
}

/// Translate a raw `connect()` failure into the compact taxonomy the stream
/// interface reacts to. `Ok(())` means "treat as success" (in-progress,
/// already-connecting, already-connected).
fn classify_connect_error(err: &io::Error) -> Result<(), ConnectError> {
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EISCONN) => Ok(()),
        Some(libc::EAGAIN) | Some(libc::EADDRINUSE) => Err(ConnectError::Resource),
        Some(libc::ETIMEDOUT) => Err(ConnectError::ServerTimeout),
        _ => Err(ConnectError::ServerClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{bind_listener, ListenerOptions};

    fn loopback_listener() -> (RawFd, SocketAddr) {
        let opts = ListenerOptions { reuse_addr: true, backlog: 16, ..ListenerOptions::default() };
        let (fd, status) = bind_listener("127.0.0.1:0".parse().unwrap(), &opts, 0, 1024).expect("bind");
        assert!(status.is_ok());
        let local = unsafe {
            let sock = socket2::Socket::from_raw_fd(fd);
            let addr = sock.local_addr().expect("local_addr").as_socket().expect("ipv4/6");
            std::mem::forget(sock);
            addr
        };
        (fd, local)
    }

    #[test]
    fn connect_to_loopback_listener_succeeds_or_is_in_progress() {
        use std::os::unix::io::FromRawFd;
        let (listener_fd, addr) = loopback_listener();
        let mut allocator = PortAllocator::new();
        let opts = ConnectOptions::default();
        let fd = connect(addr, None, &opts, 0, 1024, &mut allocator).expect("connect");
        assert!(fd >= 0);
        unsafe {
            libc::close(fd);
            libc::close(listener_fd);
        }
    }

    #[test]
    fn fd_count_at_maxsock_is_rejected_before_any_syscall() {
        let mut allocator = PortAllocator::new();
        let opts = ConnectOptions::default();
        let err = connect("127.0.0.1:1".parse().unwrap(), None, &opts, 10, 10, &mut allocator).unwrap_err();
        assert_eq!(err, ConnectError::ProxyCondition);
    }

    #[test]
    fn port_allocator_reuses_released_ports() {
        let range = PortRange { base: 20000, len: 4 };
        let mut allocator = PortAllocator::new();
        let first = allocator.try_allocate(range, 0).expect("first port");
        assert!(allocator.try_allocate(range, 0).is_none(), "same port reused while held");
        allocator.release(first);
        let second = allocator.try_allocate(range, 0).expect("port available again after release");
        assert_eq!(first, second);
    }

    #[test]
    fn classify_connect_error_maps_in_progress_to_ok() {
        let err = io::Error::from_raw_os_error(libc::EINPROGRESS);
        assert!(classify_connect_error(&err).is_ok());
        let err = io::Error::from_raw_os_error(libc::ETIMEDOUT);
        assert_eq!(classify_connect_error(&err), Err(ConnectError::ServerTimeout));
        let err = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert_eq!(classify_connect_error(&err), Err(ConnectError::ServerClosed));
    }
}
