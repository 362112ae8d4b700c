use std::error;
use std::fmt;

pub type NetResult<T> = Result<T, ErrorKind>;

/// The closed set of failure conditions surfaced by the library, either as the
/// return value of a public operation or inside an `Event::Error` delivered to
/// the socket callback.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Socket creation failed.
    Open,
    /// Connect failed, or a broadcast request was made on a stream transport.
    Connect,
    /// Listen failed, or the requested port was 0.
    Listen,
    /// Bind failed.
    Bind,
    /// Accept failed.
    Accept,
    /// Read or recvfrom returned an unrecoverable error.
    Receive,
    /// Write or send failed, or the datagram was too large.
    Send,
    /// The peer closed the connection.
    Closed,
    /// Buffer allocation failed.
    Buffer,
    /// Hostname resolution failed.
    Address,
    /// Closing the descriptor failed.
    Disconnect,
    /// Transport mismatch (reserved).
    Protocol,
    /// The worker thread could not be spawned.
    Thread,
    /// Timed-out operation (reserved).
    Timeout,
    /// The worker is already in an active mode.
    Busy,
    /// Encryption or decryption failed, including bad padding.
    Cipher,
}

impl ErrorKind {
    /// Stable human-readable message for the error kind.
    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::Open => "couldn't open socket",
            ErrorKind::Connect => "connecting to remote socket failed",
            ErrorKind::Listen => "error while listening on socket",
            ErrorKind::Bind => "couldn't bind to socket",
            ErrorKind::Accept => "error while accepting connection",
            ErrorKind::Receive => "couldn't read from socket",
            ErrorKind::Send => "failed to send datagram",
            ErrorKind::Closed => "peer closed connection",
            ErrorKind::Buffer => "out of memory",
            ErrorKind::Address => "hostname resolution failed",
            ErrorKind::Disconnect => "error while closing socket",
            ErrorKind::Protocol => "protocol mismatch",
            ErrorKind::Thread => "could not start worker thread",
            ErrorKind::Timeout => "timeout error",
            ErrorKind::Busy => "socket already in use",
            ErrorKind::Cipher => "could not (de)cipher payload",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl error::Error for ErrorKind {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_stable() {
        assert_eq!(ErrorKind::Closed.message(), "peer closed connection");
        assert_eq!(ErrorKind::Busy.message(), "socket already in use");
        assert_eq!(ErrorKind::Cipher.message(), "could not (de)cipher payload");
        assert_eq!(ErrorKind::Send.to_string(), "failed to send datagram");
    }
}
