//! Owned non-blocking stream sockets.
//!
//! Thin wrapper over `socket2::Socket` restricted to the IPv4 stream
//! sockets this server deals in. The wrapper owns the descriptor (closed
//! exactly once on drop), keeps all the option-setting in one place, and
//! sends with `MSG_NOSIGNAL` so a dead peer surfaces as `EPIPE` instead of
//! a signal.

use socket2::{Domain, Protocol, SockAddr, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::debug;

/// Move-only owner of a TCP socket descriptor.
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a fresh AF_INET stream socket.
    pub fn new() -> io::Result<Self> {
        let inner = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        debug!(fd = inner.as_raw_fd(), "socket created");
        Ok(Self { inner })
    }

    fn from_accepted(inner: socket2::Socket) -> Self {
        Self { inner }
    }

    /// Raw descriptor, still owned by this socket.
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Bind to an IPv4 address and port.
    ///
    /// An empty address or `0.0.0.0` binds to `INADDR_ANY`.
    pub fn bind(&self, address: &str, port: u16) -> io::Result<()> {
        let ip = parse_ipv4(address)?;
        let addr = SockAddr::from(SocketAddrV4::new(ip, port));
        self.inner.bind(&addr)
    }

    /// Start listening with the given backlog.
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Listen with the kernel default backlog.
    pub fn listen_default(&self) -> io::Result<()> {
        self.listen(libc::SOMAXCONN)
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` when the accept queue is empty (would-block)
    /// rather than an error, so callers can loop until drained.
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        match self.inner.accept() {
            Ok((sock, addr)) => {
                let peer = addr
                    .as_socket()
                    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                Ok(Some((Socket::from_accepted(sock), peer)))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Connect to an IPv4 address and port.
    pub fn connect(&self, address: &str, port: u16) -> io::Result<()> {
        let ip = parse_ipv4(address)?;
        let addr = SockAddr::from(SocketAddrV4::new(ip, port));
        self.inner.connect(&addr)
    }

    /// Send bytes, suppressing SIGPIPE delivery for this call.
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send_with_flags(data, libc::MSG_NOSIGNAL)
    }

    /// Receive bytes into `buf`.
    pub fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        // recv only writes into the slice; viewing initialized memory as
        // MaybeUninit is sound.
        let uninit =
            unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        self.inner.recv(uninit)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(nonblocking)
    }

    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        self.inner.set_reuse_address(reuse)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    /// Close only the write half, leaving reads open to observe the peer's
    /// close.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(std::net::Shutdown::Write)
    }

    /// Pending socket error (`SO_ERROR`), cleared by reading it.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    /// Local address as `ip:port`, or a placeholder when unavailable.
    pub fn local_addr_string(&self) -> String {
        format_addr(self.inner.local_addr())
    }

    /// Peer address as `ip:port`, or a placeholder when unavailable.
    pub fn peer_addr_string(&self) -> String {
        format_addr(self.inner.peer_addr())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn parse_ipv4(address: &str) -> io::Result<Ipv4Addr> {
    if address.is_empty() || address == "0.0.0.0" {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    address.parse::<Ipv4Addr>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid IPv4 address '{address}'"),
        )
    })
}

fn format_addr(addr: io::Result<SockAddr>) -> String {
    match addr.ok().and_then(|a| a.as_socket()) {
        Some(a) => a.to_string(),
        None => "unknown:0".to_string(),
    }
}
