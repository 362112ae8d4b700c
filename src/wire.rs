use std::io;
use std::io::Write;
use std::os::unix::io::RawFd;

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::{ErrorKind, NetResult};

/// Size of the length prefix on message-mode frames.
pub const HEADER_SIZE: usize = 4;

/// Writes the whole of `buf` to the destination, restarting interrupted
/// writes. A zero-byte write or any other error yields `Send`.
pub fn write_all<W: Write>(writer: &mut W, buf: &[u8]) -> NetResult<()> {
    let mut remaining = buf;

    while !remaining.is_empty() {
        match writer.write(remaining) {
            Ok(0) => return Err(ErrorKind::Send),
            Ok(written) => remaining = &remaining[written..],
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return Err(ErrorKind::Send),
        }
    }

    Ok(())
}

/// Writes one message-mode frame: the payload length as a 4-byte big-endian
/// prefix, then the payload itself. Any write failure is reported as `Closed`
/// since a framed peer that stops accepting bytes is gone.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> NetResult<()> {
    let mut header = [0u8; HEADER_SIZE];
    (&mut header[..])
        .write_u32::<BigEndian>(payload.len() as u32)
        .expect("Error writing frame header");

    write_all(writer, &header).map_err(|_| ErrorKind::Closed)?;
    write_all(writer, payload).map_err(|_| ErrorKind::Closed)?;

    Ok(())
}

/// Minimal `io::Write` view of a raw descriptor, so the frame writers can be
/// driven by mock channels in tests and by sockets in production.
pub(crate) struct Fd(pub(crate) RawFd);

impl io::Write for Fd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        nix::unistd::write(self.0, buf).map_err(|err| io::Error::from_raw_os_error(err as i32))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Writer that accepts at most `chunk` bytes per call and injects an
    /// interrupt before every `interrupt_every`-th write.
    struct MockChannel {
        data: Vec<u8>,
        chunk: usize,
        interrupt_every: usize,
        writes: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(chunk: usize, interrupt_every: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data: Vec::new(),
                chunk,
                interrupt_every,
                writes: 0,
                max_size,
            }
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;

            if self.interrupt_every > 0 && self.writes % self.interrupt_every == 0 {
                return Err(io::ErrorKind::Interrupted.into());
            }

            if self.data.len() == self.max_size {
                return Ok(0);
            }

            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_all_survives_short_writes_and_interrupts() {
        let payload: Vec<u8> = (0..4096).map(|i| i as u8).collect();
        let mut channel = MockChannel::new(7, 3, usize::max_value());

        write_all(&mut channel, &payload).unwrap();

        assert_eq!(channel.data, payload);
    }

    #[test]
    fn test_write_all_fails_on_zero_write() {
        let mut channel = MockChannel::new(16, 0, 32);

        let result = write_all(&mut channel, &[1u8; 64]);

        assert_eq!(result.unwrap_err(), ErrorKind::Send);
        assert_eq!(channel.data.len(), 32);
    }

    #[test]
    fn test_frame_layout() {
        let mut frame = Vec::new();

        write_frame(&mut frame, b"abc").unwrap();

        assert_eq!(frame, &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_frame_layout_empty_payload() {
        let mut frame = Vec::new();

        write_frame(&mut frame, b"").unwrap();

        assert_eq!(frame, &[0, 0, 0, 0]);
    }

    #[test]
    fn test_frame_is_prefix_plus_payload() {
        let payload: Vec<u8> = (0..48).map(|i| i as u8).collect();
        let mut channel = MockChannel::new(5, 4, usize::max_value());

        write_frame(&mut channel, &payload).unwrap();

        assert_eq!(channel.data.len(), HEADER_SIZE + payload.len());
        assert_eq!(&channel.data[..HEADER_SIZE], &[0, 0, 0, 48]);
        assert_eq!(&channel.data[HEADER_SIZE..], &payload[..]);
    }

    #[test]
    fn test_frame_failure_is_reported_as_closed() {
        let mut channel = MockChannel::new(16, 0, 2);

        let result = write_frame(&mut channel, &[9u8; 64]);

        assert_eq!(result.unwrap_err(), ErrorKind::Closed);
    }
}
