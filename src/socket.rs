use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use nix::sys::socket::{self, MsgFlags, Shutdown};
use nix::unistd;

use crate::cipher::Cipher;
use crate::error::{ErrorKind, NetResult};
use crate::event::{Disposition, Event};
use crate::logging::{self, Logger};
use crate::sockopt;
use crate::wire;
use crate::worker;
use crate::{UDP_PAYLOAD_SIZE, WORKER_STACK_SIZE};

/// Wire behavior of a socket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transport {
    /// Raw byte stream, user-defined boundaries.
    Stream,
    /// Length-prefixed frames over a reliable stream.
    Message,
    /// Unreliable datagrams.
    Datagram,
}

/// Active state of the worker thread.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Mode {
    Unknown = 0,
    Idle = 1,
    Read = 2,
    Receive = 3,
    Listen = 4,
}

impl Mode {
    pub(crate) fn from_u8(value: u8) -> Mode {
        match value {
            1 => Mode::Idle,
            2 => Mode::Read,
            3 => Mode::Receive,
            4 => Mode::Listen,
            _ => Mode::Unknown,
        }
    }
}

pub(crate) type Callback = Box<dyn FnMut(&Link, Event) -> Disposition + Send>;

/// State shared between the owning socket handle, its worker thread and any
/// callback-held links.
pub(crate) struct Shared {
    pub(crate) transport: Transport,
    fd: AtomicI32,
    mode: AtomicU8,
    stop: AtomicBool,
    stopped: AtomicBool,
    sent: AtomicU64,
    received: AtomicU64,
    pub(crate) cipher: RwLock<Option<Cipher>>,
    pub(crate) callback: Mutex<Callback>,
    // Serializes senders so frames from concurrent callers cannot interleave.
    tx: Mutex<()>,
    pub(crate) log: Logger,
}

impl Shared {
    pub(crate) fn fd(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fd(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::SeqCst);
    }

    pub(crate) fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn add_sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn add_received(&self, count: u64) {
        self.received.fetch_add(count, Ordering::SeqCst);
    }

    /// Half-closes and closes the descriptor. The descriptor is taken out of
    /// the socket first so it cannot be closed twice. Closing a socket that
    /// is already closed is not an error.
    pub(crate) fn disconnect(&self) -> NetResult<()> {
        let fd = self.fd.swap(-1, Ordering::SeqCst);

        if fd < 0 {
            return Ok(());
        }

        let _ = socket::shutdown(fd, Shutdown::Both);
        unistd::close(fd).map_err(|_| ErrorKind::Disconnect)
    }
}

/// Borrowed view of a socket handed to event callbacks, also cloneable into
/// other threads for concurrent sending. A link keeps the shared socket state
/// alive but does not own the worker.
#[derive(Clone)]
pub struct Link {
    pub(crate) shared: Arc<Shared>,
}

impl Link {
    pub(crate) fn new(shared: Arc<Shared>) -> Link {
        Link { shared }
    }

    pub fn transport(&self) -> Transport {
        self.shared.transport
    }

    /// Total payload bytes handed to the kernel so far. Advisory.
    pub fn bytes_sent(&self) -> u64 {
        self.shared.sent.load(Ordering::SeqCst)
    }

    /// Total payload bytes received off the wire so far. Advisory.
    pub fn bytes_received(&self) -> u64 {
        self.shared.received.load(Ordering::SeqCst)
    }

    pub fn is_keyed(&self) -> bool {
        self.shared
            .cipher
            .read()
            .expect("cipher lock poisoned")
            .is_some()
    }

    /// Sends one payload. With a cipher set the payload is padded and
    /// encrypted first and the counters measure the padded length. Datagram
    /// payloads go out as one send and are capped at `UDP_PAYLOAD_SIZE`;
    /// stream and message payloads are written in full, with the message
    /// length prefix and body coalesced into one segment.
    pub fn send(&self, buf: &[u8]) -> NetResult<()> {
        let shared = &self.shared;

        let encrypted = {
            let cipher = shared.cipher.read().expect("cipher lock poisoned");
            match cipher.as_ref() {
                Some(cipher) => Some(cipher.encrypt(buf)?),
                None => None,
            }
        };
        let payload: &[u8] = encrypted.as_deref().unwrap_or(buf);

        let _tx = shared.tx.lock().expect("send lock poisoned");
        let fd = shared.fd();

        match shared.transport {
            Transport::Datagram => {
                if payload.len() > UDP_PAYLOAD_SIZE {
                    return Err(ErrorKind::Send);
                }

                match socket::send(fd, payload, MsgFlags::empty()) {
                    Ok(count) if count == payload.len() => {
                        shared.add_sent(payload.len() as u64);
                        Ok(())
                    }
                    _ => Err(ErrorKind::Send),
                }
            }
            transport => {
                sockopt::set_cork(fd, true);
                let result = Self::send_framed(fd, transport, payload);
                sockopt::set_cork(fd, false);

                result?;
                shared.add_sent(payload.len() as u64);
                Ok(())
            }
        }
    }

    fn send_framed(fd: RawFd, transport: Transport, payload: &[u8]) -> NetResult<()> {
        let mut writer = wire::Fd(fd);

        match transport {
            Transport::Message => wire::write_frame(&mut writer, payload),
            _ => wire::write_all(&mut writer, payload).map_err(|_| ErrorKind::Closed),
        }
    }
}

/// An event-driven socket. All inbound traffic is delivered through the
/// callback on a dedicated worker thread; the handle stays usable from any
/// thread for setup and sending. Dropping the handle stops and joins the
/// worker.
pub struct Socket {
    link: Link,
    worker: Option<thread::JoinHandle<()>>,
}

impl Socket {
    /// Creates a socket of the given transport and spawns its worker. The
    /// worker parks until `listen`, `connect` or `adopt` selects a mode.
    pub fn new<'a, L, F>(transport: Transport, callback: F, log: L) -> NetResult<Socket>
    where
        L: Into<Option<&'a Logger>>,
        F: FnMut(&Link, Event) -> Disposition + Send + 'static,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("transport" => format!("{:?}", transport))),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        let shared = Arc::new(Shared {
            transport,
            fd: AtomicI32::new(-1),
            mode: AtomicU8::new(Mode::Unknown as u8),
            stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            cipher: RwLock::new(None),
            callback: Mutex::new(Box::new(callback)),
            tx: Mutex::new(()),
            log,
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("tether-worker".into())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || worker::run(worker_shared))
            .map_err(|_| ErrorKind::Thread)?;

        Ok(Socket {
            link: Link::new(shared),
            worker: Some(worker),
        })
    }

    /// Replaces the cipher context. `None` or an empty key disables
    /// encryption; any other key derives a fresh context.
    pub fn passphrase(&self, key: Option<&[u8]>) -> NetResult<()> {
        let mut slot = self.link.shared.cipher.write().expect("cipher lock poisoned");

        *slot = None;

        if let Some(key) = key {
            if !key.is_empty() {
                *slot = Some(Cipher::new(key)?);
            }
        }

        Ok(())
    }

    /// Binds the socket to `port` on all local IPv4 addresses and moves the
    /// worker into its accept loop (stream and message transports) or its
    /// datagram receive loop.
    pub fn listen(&self, port: u16) -> NetResult<()> {
        self.activate_guard()?;

        if port == 0 {
            return Err(ErrorKind::Listen);
        }

        let shared = &self.link.shared;
        let fd = sockopt::open(shared.transport)?;

        if shared.transport != Transport::Datagram {
            sockopt::set_reuse_addr(fd);
        }
        sockopt::set_nonblocking(fd);

        if let Err(kind) = sockopt::bind_any(fd, port) {
            sockopt::close_quietly(fd);
            return Err(kind);
        }

        if shared.transport != Transport::Datagram {
            if let Err(kind) = sockopt::start_listen(fd) {
                sockopt::close_quietly(fd);
                return Err(kind);
            }
        }

        let mode = match shared.transport {
            Transport::Datagram => Mode::Receive,
            _ => Mode::Listen,
        };

        shared.set_fd(fd);
        shared.set_mode(mode);

        logging::debug!(shared.log, "listening"; "port" => port, "fd" => fd);

        Ok(())
    }

    /// Connects to `host:port`, resolving the first IPv4 address of the
    /// hostname. A `None` host on a datagram socket selects limited
    /// broadcast; on stream and message transports it is an error. The
    /// worker moves into its read loop (stream and message) or idles
    /// (datagram client).
    pub fn connect(&self, host: Option<&str>, port: u16) -> NetResult<()> {
        self.activate_guard()?;

        if port == 0 {
            return Err(ErrorKind::Connect);
        }

        let shared = &self.link.shared;
        let stream = shared.transport != Transport::Datagram;

        if host.is_none() && stream {
            return Err(ErrorKind::Connect);
        }

        let fd = sockopt::open(shared.transport)?;

        if stream {
            sockopt::tune_stream(fd);
        } else if host.is_none() {
            sockopt::set_broadcast(fd);
        }

        let addr = match host {
            Some(host) => match sockopt::resolve(host, port) {
                Ok(addr) => addr,
                Err(kind) => {
                    sockopt::close_quietly(fd);
                    return Err(kind);
                }
            },
            None => sockopt::broadcast_address(port),
        };

        // Shorten the receive timeout for the duration of the connect and
        // restore the previous value afterwards.
        let saved = if stream {
            let saved = sockopt::receive_timeout(fd);
            sockopt::set_receive_timeout(fd, sockopt::connect_timeout());
            saved
        } else {
            None
        };

        if let Err(kind) = sockopt::start_connect(fd, &addr) {
            sockopt::close_quietly(fd);
            return Err(kind);
        }

        if let Some(saved) = saved {
            sockopt::set_receive_timeout(fd, saved);
        }

        let mode = match shared.transport {
            Transport::Datagram => Mode::Idle,
            _ => Mode::Read,
        };

        shared.set_fd(fd);
        shared.set_mode(mode);

        logging::debug!(shared.log, "connected"; "port" => port, "fd" => fd);

        Ok(())
    }

    /// Takes over a descriptor freshly produced by an `Accept` event, applies
    /// the accepted-socket option set and moves the worker into its read
    /// loop.
    pub fn adopt(&self, fd: RawFd) -> NetResult<()> {
        self.activate_guard()?;

        let shared = &self.link.shared;

        if shared.transport != Transport::Datagram {
            sockopt::tune_stream(fd);
            sockopt::set_linger(fd);
        }

        shared.set_fd(fd);
        shared.set_mode(Mode::Read);

        logging::debug!(shared.log, "adopted descriptor"; "fd" => fd);

        Ok(())
    }

    /// Half-closes both directions and closes the descriptor. The worker
    /// notices and finishes its current mode.
    pub fn disconnect(&self) -> NetResult<()> {
        self.link.shared.disconnect()
    }

    /// See [`Link::send`].
    pub fn send(&self, buf: &[u8]) -> NetResult<()> {
        self.link.send(buf)
    }

    /// A cloneable view of this socket for callbacks and sender threads.
    pub fn link(&self) -> Link {
        self.link.clone()
    }

    pub fn transport(&self) -> Transport {
        self.link.transport()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.link.bytes_sent()
    }

    pub fn bytes_received(&self) -> u64 {
        self.link.bytes_received()
    }

    /// True while the worker is in an active mode. Setup operations refuse
    /// an active socket with `Busy`.
    pub fn is_active(&self) -> bool {
        self.link.shared.mode() != Mode::Unknown
    }

    /// True once the worker thread has terminated, either through drop or a
    /// `Disposition::Delete` returned from the callback.
    pub fn is_stopped(&self) -> bool {
        self.link.shared.stopped()
    }

    fn activate_guard(&self) -> NetResult<()> {
        let shared = &self.link.shared;

        if shared.stop() || shared.stopped() || shared.mode() != Mode::Unknown {
            return Err(ErrorKind::Busy);
        }

        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let shared = &self.link.shared;

        shared.request_stop();
        let _ = shared.disconnect();

        if let Ok(mut cipher) = shared.cipher.write() {
            *cipher = None;
        }

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        logging::debug!(shared.log, "socket deleted");
    }
}
