use std::mem;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::thread;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::select::{select, FdSet};
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};
use nix::sys::time::{TimeVal, TimeValLike};

use crate::error::{ErrorKind, NetResult};
use crate::event::Peer;
use crate::socket::Transport;
use crate::POLL_INTERVAL;

// Socket write timeout in seconds.
const SEND_TIMEOUT_SECS: i64 = 3;
// Connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: i64 = 5;
// Max queue length for pending connections.
const CONNECTION_BACKLOG: usize = 3;

const KEEPALIVE_COUNT: u32 = 1;
const KEEPALIVE_SECS: u32 = 3;
const LINGER_SECS: libc::c_int = 10;

/// Opens an IPv4 descriptor of the right kind for the transport.
pub(crate) fn open(transport: Transport) -> NetResult<RawFd> {
    let kind = match transport {
        Transport::Datagram => SockType::Datagram,
        _ => SockType::Stream,
    };

    socket::socket(AddressFamily::Inet, kind, SockFlag::empty(), None).map_err(|_| ErrorKind::Open)
}

pub(crate) fn close_quietly(fd: RawFd) {
    let _ = nix::unistd::close(fd);
}

/// Applies the option set shared by connecting and accepted stream sockets:
/// bounded send timeout, aggressive keepalive and no coalescing delay.
/// Option failures are not surfaced, the socket works without them.
pub(crate) fn tune_stream(fd: RawFd) {
    let _ = socket::setsockopt(fd, sockopt::SendTimeout, &TimeVal::seconds(SEND_TIMEOUT_SECS));
    let _ = socket::setsockopt(fd, sockopt::KeepAlive, &true);
    let _ = socket::setsockopt(fd, sockopt::TcpKeepCount, &KEEPALIVE_COUNT);
    let _ = socket::setsockopt(fd, sockopt::TcpKeepIdle, &KEEPALIVE_SECS);
    let _ = socket::setsockopt(fd, sockopt::TcpKeepInterval, &KEEPALIVE_SECS);
    let _ = socket::setsockopt(fd, sockopt::TcpNoDelay, &true);
}

pub(crate) fn set_reuse_addr(fd: RawFd) {
    let _ = socket::setsockopt(fd, sockopt::ReuseAddr, &true);
}

pub(crate) fn set_broadcast(fd: RawFd) {
    let _ = socket::setsockopt(fd, sockopt::Broadcast, &true);
}

pub(crate) fn set_nonblocking(fd: RawFd) {
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        let _ = fcntl(fd, FcntlArg::F_SETFL(flags));
    }
}

fn set_tcp_option(fd: RawFd, option: libc::c_int, value: libc::c_int) {
    unsafe {
        let _ = libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Brackets a frame so the length prefix and body travel as one segment.
pub(crate) fn set_cork(fd: RawFd, enabled: bool) {
    set_tcp_option(fd, libc::TCP_CORK, enabled as libc::c_int);
}

/// Bounds the FIN_WAIT2 lifetime of accepted sockets.
pub(crate) fn set_linger(fd: RawFd) {
    set_tcp_option(fd, libc::TCP_LINGER2, LINGER_SECS);
}

pub(crate) fn receive_timeout(fd: RawFd) -> Option<TimeVal> {
    socket::getsockopt(fd, sockopt::ReceiveTimeout).ok()
}

pub(crate) fn set_receive_timeout(fd: RawFd, timeout: TimeVal) {
    let _ = socket::setsockopt(fd, sockopt::ReceiveTimeout, &timeout);
}

pub(crate) fn connect_timeout() -> TimeVal {
    TimeVal::seconds(CONNECT_TIMEOUT_SECS)
}

pub(crate) fn any_address(port: u16) -> SockaddrIn {
    SockaddrIn::new(0, 0, 0, 0, port)
}

pub(crate) fn broadcast_address(port: u16) -> SockaddrIn {
    SockaddrIn::new(255, 255, 255, 255, port)
}

/// Resolves a hostname to its first IPv4 address.
pub(crate) fn resolve(host: &str, port: u16) -> NetResult<SockaddrIn> {
    let addrs = (host, port).to_socket_addrs().map_err(|_| ErrorKind::Address)?;

    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(SockaddrIn::from(v4));
        }
    }

    Err(ErrorKind::Address)
}

pub(crate) fn bind_any(fd: RawFd, port: u16) -> NetResult<()> {
    socket::bind(fd, &any_address(port)).map_err(|_| ErrorKind::Bind)
}

pub(crate) fn start_listen(fd: RawFd) -> NetResult<()> {
    socket::listen(fd, CONNECTION_BACKLOG).map_err(|_| ErrorKind::Listen)
}

/// Connects the descriptor, retrying interrupted attempts. A connect that
/// already completed under a retry reports success through `EISCONN`.
pub(crate) fn start_connect(fd: RawFd, addr: &SockaddrIn) -> NetResult<()> {
    loop {
        match socket::connect(fd, addr) {
            Ok(()) => return Ok(()),
            Err(Errno::EISCONN) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(_) => return Err(ErrorKind::Connect),
        }
    }
}

/// Waits up to one poll interval for the descriptor to become readable, so
/// the surrounding loop can observe the stop flag between waits.
pub(crate) fn wait_readable(fd: RawFd) -> bool {
    let mut fds = FdSet::new();
    fds.insert(fd);

    let mut timeout = TimeVal::milliseconds(POLL_INTERVAL.as_millis() as i64);

    match select(None, &mut fds, None, None, &mut timeout) {
        Ok(ready) if ready > 0 => fds.contains(fd),
        Ok(_) => false,
        Err(_) => {
            // A dead descriptor would otherwise spin the caller.
            thread::sleep(POLL_INTERVAL);
            false
        }
    }
}

pub(crate) fn peer_of(addr: &SockaddrIn) -> Peer {
    Peer {
        addr: Ipv4Addr::from(addr.ip()),
        port: addr.port(),
    }
}

/// Peer of an accepted descriptor. Falls back to the unspecified address when
/// the peer vanished between accept and the lookup.
pub(crate) fn peer_of_fd(fd: RawFd) -> Peer {
    socket::getpeername::<SockaddrIn>(fd)
        .map(|addr| peer_of(&addr))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ipv4_literal() {
        let addr = resolve("127.0.0.1", 3000).unwrap();

        assert_eq!(peer_of(&addr).addr, Ipv4Addr::LOCALHOST);
        assert_eq!(peer_of(&addr).port, 3000);
    }

    #[test]
    fn test_resolve_failure() {
        let result = resolve("host.invalid.", 3000);

        assert_eq!(result.unwrap_err(), ErrorKind::Address);
    }

    #[test]
    fn test_broadcast_address() {
        let peer = peer_of(&broadcast_address(3000));

        assert_eq!(peer.addr, Ipv4Addr::BROADCAST);
        assert_eq!(peer.port, 3000);
    }

    #[test]
    fn test_wait_readable_pipe() {
        let (reader, writer) = nix::unistd::pipe().unwrap();

        assert!(!wait_readable(reader));

        nix::unistd::write(writer, b"x").unwrap();

        assert!(wait_readable(reader));

        close_quietly(reader);
        close_quietly(writer);
    }
}
