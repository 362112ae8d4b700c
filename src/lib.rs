//! `tether` presents a uniform, event-driven abstraction over three IPv4
//! transport modes: a raw byte stream, length-framed messages over a stream,
//! and unreliable datagrams. Every socket is driven by a dedicated worker
//! thread that delivers inbound traffic to a user callback; payloads can be
//! transparently encrypted per socket with a Blowfish block cipher.
//!
//! A socket acts as a server (`listen`) or a client (`connect`); a listening
//! stream socket publishes accepted descriptors through `Accept` events which
//! the callback moves into fresh sockets with `adopt`. Callbacks return a
//! [`Disposition`] telling the worker whether to keep going, close the
//! connection, or tear the socket down entirely.

use std::sync::Once;
use std::time::Duration;

use nix::sys::signal::{signal, SigHandler, Signal};

pub mod cipher;
pub mod error;
pub mod event;
pub mod logging;
pub mod socket;
pub mod wire;

mod sockopt;
mod worker;

pub use crate::cipher::Cipher;
pub use crate::error::{ErrorKind, NetResult};
pub use crate::event::{Disposition, Event, Peer};
pub use crate::socket::{Link, Socket, Transport};

/// Largest payload accepted on a datagram socket.
pub const UDP_PAYLOAD_SIZE: usize = 1 << 16; // 64 KB

/// Initial size of the per-socket scratch buffer in read mode.
pub(crate) const INITIAL_PAYLOAD_SIZE: usize = 1 << 12; // 4 KB

/// Cadence at which workers poll for cancellation while waiting.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Stack size for worker threads.
pub(crate) const WORKER_STACK_SIZE: usize = 4 * 65536; // 256 KB

static INIT: Once = Once::new();

/// Process-wide setup. Ignores broken-pipe signals so that a write to a
/// closed peer returns an error to the caller instead of terminating the
/// process. Idempotent; call it once before creating sockets.
pub fn init() {
    INIT.call_once(|| unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    });
}
