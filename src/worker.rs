use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;

use byteorder::{BigEndian, ByteOrder};
use nix::errno::Errno;
use nix::sys::socket::{self, SockaddrIn};
use nix::unistd;

use crate::error::ErrorKind;
use crate::event::{Disposition, Event, Peer};
use crate::logging;
use crate::socket::{Link, Mode, Shared, Transport};
use crate::sockopt;
use crate::wire;
use crate::{INITIAL_PAYLOAD_SIZE, POLL_INTERVAL, UDP_PAYLOAD_SIZE};

/// How a dispatched mode ended.
enum Exit {
    /// The mode finished with nothing left to report.
    Clean,
    /// The mode finished with a captured error.
    Error(ErrorKind),
    /// The callback asked for worker-side teardown.
    Delete,
}

/// What an in-loop event delivery decided for the surrounding loop.
enum Flow {
    Continue,
    Exit(Exit),
}

/// Worker thread body. Parks until a setup call selects a mode, dispatches
/// it, reports a captured error as an event and restarts, so the same socket
/// can be reused for another `listen`/`connect` cycle. The stop flag is
/// polled at every wait, bounding shutdown latency.
pub(crate) fn run(shared: Arc<Shared>) {
    loop {
        loop {
            if shared.stop() {
                shared.set_stopped();
                return;
            }

            if shared.mode() != Mode::Unknown {
                break;
            }

            thread::sleep(POLL_INTERVAL);
        }

        let mode = shared.mode();

        logging::debug!(shared.log, "worker dispatching"; "mode" => format!("{:?}", mode));

        let exit = match mode {
            Mode::Read => read_loop(&shared),
            Mode::Receive => receive_loop(&shared),
            Mode::Listen => listen_loop(&shared),
            _ => idle_loop(&shared),
        };

        // The mode is released only after a captured error has been reported
        // and its disposition applied; a reconnect racing with the disconnect
        // below would otherwise hand the worker a fresh descriptor to close.
        let deleted = match exit {
            Exit::Clean => false,
            Exit::Error(kind) => {
                if shared.stop() {
                    false
                } else {
                    logging::debug!(shared.log, "worker captured error"; "kind" => %kind);

                    match deliver(&shared, Event::Error(kind)) {
                        Disposition::Continue => false,
                        Disposition::Close => {
                            let _ = shared.disconnect();
                            false
                        }
                        Disposition::Delete => true,
                    }
                }
            }
            Exit::Delete => true,
        };

        shared.set_mode(Mode::Unknown);

        if deleted {
            teardown(&shared);
            return;
        }
    }
}

/// Invokes the user callback with a borrowed link to the socket.
fn deliver(shared: &Arc<Shared>, event: Event) -> Disposition {
    let link = Link::new(shared.clone());
    let mut callback = shared.callback.lock().expect("callback lock poisoned");

    (callback)(&link, event)
}

fn dispose(shared: &Arc<Shared>, disposition: Disposition) -> Flow {
    match disposition {
        Disposition::Continue => Flow::Continue,
        Disposition::Close => {
            let _ = shared.disconnect();
            Flow::Exit(Exit::Clean)
        }
        Disposition::Delete => Flow::Exit(Exit::Delete),
    }
}

/// Worker-side socket teardown, requested by `Disposition::Delete`. After
/// this the thread ends and a later drop of the owning handle joins without
/// blocking.
fn teardown(shared: &Arc<Shared>) {
    shared.request_stop();
    let _ = shared.disconnect();

    if let Ok(mut cipher) = shared.cipher.write() {
        *cipher = None;
    }

    shared.set_stopped();

    logging::debug!(shared.log, "worker tore down socket");
}

/// Decrypts the inbound payload in place when a cipher is set and delivers
/// the resulting event. Cipher failures surface as an error event; the loop
/// keeps running either way.
fn deliver_payload(shared: &Arc<Shared>, buffer: &mut [u8], peer: Option<Peer>) -> Flow {
    let decrypted = {
        let cipher = shared.cipher.read().expect("cipher lock poisoned");

        match cipher.as_ref() {
            Some(cipher) => cipher.decrypt(buffer).map(Some),
            None => Ok(None),
        }
    };

    let disposition = match decrypted {
        Ok(stripped) => {
            let length = stripped.unwrap_or_else(|| buffer.len());
            deliver(
                shared,
                Event::Receive {
                    peer,
                    data: &buffer[..length],
                },
            )
        }
        Err(kind) => deliver(shared, Event::Error(kind)),
    };

    dispose(shared, disposition)
}

/// Connected datagram clients have nothing to drive; hold the thread until
/// the socket goes away.
fn idle_loop(shared: &Arc<Shared>) -> Exit {
    while !shared.stop() {
        thread::sleep(POLL_INTERVAL);
    }

    Exit::Clean
}

/// Blocking receive loop for connected stream and message sockets.
fn read_loop(shared: &Arc<Shared>) -> Exit {
    let fd = shared.fd();
    let mut buffer = Vec::new();

    if grow(&mut buffer, INITIAL_PAYLOAD_SIZE).is_err() {
        return Exit::Error(ErrorKind::Buffer);
    }

    while !shared.stop() {
        let length = match shared.transport {
            Transport::Stream => read_stream(fd, &mut buffer),
            Transport::Message => read_message(fd, &mut buffer),
            Transport::Datagram => return Exit::Clean,
        };

        let length = match length {
            Ok(length) => length,
            Err(kind) => return Exit::Error(kind),
        };

        if shared.stop() {
            return Exit::Clean;
        }

        shared.add_received(length as u64);

        match deliver_payload(shared, &mut buffer[..length], None) {
            Flow::Continue => {}
            Flow::Exit(exit) => return exit,
        }
    }

    Exit::Clean
}

/// One raw read of whatever the peer sent.
fn read_stream(fd: RawFd, buffer: &mut Vec<u8>) -> Result<usize, ErrorKind> {
    loop {
        match unistd::read(fd, &mut buffer[..]) {
            Ok(0) => return Err(ErrorKind::Closed),
            Ok(received) => return Ok(received),
            Err(Errno::EINTR) => continue,
            Err(_) => return Err(ErrorKind::Receive),
        }
    }
}

/// One length-prefixed frame: exactly four header bytes, then exactly the
/// announced number of payload bytes. The scratch buffer grows to twice the
/// announced length when it is too small.
fn read_message(fd: RawFd, buffer: &mut Vec<u8>) -> Result<usize, ErrorKind> {
    let mut header = [0u8; wire::HEADER_SIZE];
    read_exact(fd, &mut header)?;

    let length = BigEndian::read_u32(&header) as usize;

    if length > buffer.len() {
        grow(buffer, length * 2)?;
    }

    read_exact(fd, &mut buffer[..length])?;

    Ok(length)
}

fn read_exact(fd: RawFd, buffer: &mut [u8]) -> Result<(), ErrorKind> {
    let mut filled = 0;

    while filled < buffer.len() {
        match unistd::read(fd, &mut buffer[filled..]) {
            Ok(0) => return Err(ErrorKind::Closed),
            Ok(received) => filled += received,
            Err(Errno::EINTR) => continue,
            Err(_) => return Err(ErrorKind::Receive),
        }
    }

    Ok(())
}

/// Datagram receive loop. The descriptor is non-blocking; a short select
/// guards every recvfrom so the stop flag stays responsive. Receive errors
/// are reported per datagram and the loop keeps going.
fn receive_loop(shared: &Arc<Shared>) -> Exit {
    let mut buffer = Vec::new();

    if grow(&mut buffer, UDP_PAYLOAD_SIZE).is_err() {
        return Exit::Error(ErrorKind::Buffer);
    }

    while !shared.stop() {
        // a disconnect from outside ends the mode
        let fd = shared.fd();
        if fd < 0 {
            return Exit::Clean;
        }

        if !sockopt::wait_readable(fd) {
            continue;
        }

        if shared.stop() {
            return Exit::Clean;
        }

        let (received, peer) = match socket::recvfrom::<SockaddrIn>(fd, &mut buffer[..]) {
            Ok((received, addr)) => {
                let peer = addr.as_ref().map(sockopt::peer_of).unwrap_or_default();
                (received, peer)
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(_) => {
                match dispose(shared, deliver(shared, Event::Error(ErrorKind::Receive))) {
                    Flow::Continue => continue,
                    Flow::Exit(exit) => return exit,
                }
            }
        };

        shared.add_received(received as u64);

        match deliver_payload(shared, &mut buffer[..received], Some(peer)) {
            Flow::Continue => {}
            Flow::Exit(exit) => return exit,
        }
    }

    Exit::Clean
}

/// Accept loop for listening stream and message sockets. Every accepted
/// descriptor is published through an `Accept` event; the callback is
/// expected to move it into a fresh socket with `adopt`.
fn listen_loop(shared: &Arc<Shared>) -> Exit {
    while !shared.stop() {
        // a disconnect from outside ends the mode
        let fd = shared.fd();
        if fd < 0 {
            return Exit::Clean;
        }

        if !sockopt::wait_readable(fd) {
            continue;
        }

        if shared.stop() {
            return Exit::Clean;
        }

        let disposition = match socket::accept(fd) {
            Ok(client) => {
                let peer = sockopt::peer_of_fd(client);
                let addr = peer.addr;

                logging::debug!(shared.log, "connection accepted";
                                "fd" => client,
                                "peer" => %addr,
                                "port" => peer.port);

                deliver(shared, Event::Accept { peer, fd: client })
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(_) => deliver(shared, Event::Error(ErrorKind::Accept)),
        };

        match dispose(shared, disposition) {
            Flow::Continue => {}
            Flow::Exit(exit) => return exit,
        }
    }

    Exit::Clean
}

fn grow(buffer: &mut Vec<u8>, size: usize) -> Result<(), ErrorKind> {
    if buffer.len() >= size {
        return Ok(());
    }

    buffer
        .try_reserve_exact(size - buffer.len())
        .map_err(|_| ErrorKind::Buffer)?;
    buffer.resize(size, 0);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_is_monotonic() {
        let mut buffer = Vec::new();

        grow(&mut buffer, 16).unwrap();
        assert_eq!(buffer.len(), 16);

        grow(&mut buffer, 8).unwrap();
        assert_eq!(buffer.len(), 16);

        grow(&mut buffer, 64).unwrap();
        assert_eq!(buffer.len(), 64);
    }

    #[test]
    fn test_read_exact_collects_partial_reads() {
        let (reader, writer) = nix::unistd::pipe().unwrap();

        let feeder = thread::spawn(move || {
            for chunk in [&b"ab"[..], &b"cd"[..], &b"ef"[..]].iter() {
                nix::unistd::write(writer, chunk).unwrap();
                thread::sleep(POLL_INTERVAL);
            }
            sockopt::close_quietly(writer);
        });

        let mut buffer = [0u8; 6];
        read_exact(reader, &mut buffer).unwrap();

        assert_eq!(&buffer, b"abcdef");

        // the write side is gone now, a further read reports the close
        assert_eq!(read_exact(reader, &mut buffer).unwrap_err(), ErrorKind::Closed);

        sockopt::close_quietly(reader);
        feeder.join().unwrap();
    }

    #[test]
    fn test_read_stream_reports_close() {
        let (reader, writer) = nix::unistd::pipe().unwrap();
        sockopt::close_quietly(writer);

        let mut buffer = vec![0u8; 16];

        assert_eq!(read_stream(reader, &mut buffer).unwrap_err(), ErrorKind::Closed);

        sockopt::close_quietly(reader);
    }

    #[test]
    fn test_read_message_parses_prefix() {
        let (reader, writer) = nix::unistd::pipe().unwrap();

        nix::unistd::write(writer, &[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']).unwrap();

        let mut buffer = Vec::new();
        grow(&mut buffer, 4).unwrap();

        let length = read_message(reader, &mut buffer).unwrap();

        assert_eq!(length, 5);
        assert_eq!(&buffer[..5], b"hello");
        // the undersized buffer was reallocated to twice the frame length
        assert_eq!(buffer.len(), 10);

        sockopt::close_quietly(reader);
        sockopt::close_quietly(writer);
    }
}
