//! Conventional length-prefixed framing over a non-blocking Unix-domain
//! stream socket — the sibling transport mentioned alongside the
//! shared-memory one, kept thin since the interesting work lives there.
//!
//! Frame on the wire: a 4-byte little-endian length prefix followed by
//! that many content bytes. No other framing, no compression, no
//! encryption — callers needing those layer them on top.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;

use super::{MessageView, MessageWriter, Transport};
use crate::error::TransportError;

const LENGTH_PREFIX_SIZE: usize = 4;

pub struct UdsTransport {
    socket: UnixStream,
    max_message_size: usize,
    read_buf: Vec<u8>,
    writer_outstanding: bool,
}

impl UdsTransport {
    pub fn init(socket: UnixStream, max_message_size: usize) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(UdsTransport {
            socket,
            max_message_size,
            read_buf: Vec::new(),
            writer_outstanding: false,
        })
    }

    #[inline]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Attempts to extend `read_buf` with whatever is currently available
    /// without blocking. `Ok(true)` means the peer closed the connection.
    fn pump_socket(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Pulls one complete length-prefixed frame out of `read_buf`, if one
    /// has fully arrived.
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.read_buf.len() < LENGTH_PREFIX_SIZE {
            return None;
        }
        let len = u32::from_le_bytes(self.read_buf[..LENGTH_PREFIX_SIZE].try_into().unwrap()) as usize;
        if self.read_buf.len() < LENGTH_PREFIX_SIZE + len {
            return None;
        }
        let frame = self.read_buf[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len].to_vec();
        self.read_buf.drain(..LENGTH_PREFIX_SIZE + len);
        Some(frame)
    }
}

impl<'a> Transport<'a> for UdsTransport {
    type Writer = UdsWriter<'a>;
    type Message = UdsMessage;

    fn message_init(&'a mut self) -> Result<Option<UdsWriter<'a>>, TransportError> {
        if self.writer_outstanding {
            return Err(TransportError::WriterAlreadyOutstanding);
        }
        self.writer_outstanding = true;
        let capacity = self.max_message_size;
        Ok(Some(UdsWriter {
            transport: self,
            buf: Vec::with_capacity(capacity),
        }))
    }

    fn receive(&'a mut self) -> Result<Option<UdsMessage>, TransportError> {
        self.pump_socket()?;
        Ok(self.take_frame().map(|bytes| UdsMessage { bytes }))
    }

    fn destroy(self) {
        // UnixStream closes its fd on drop.
    }
}

pub struct UdsWriter<'a> {
    transport: &'a mut UdsTransport,
    buf: Vec<u8>,
}

impl<'a> MessageWriter for UdsWriter<'a> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.buf.len() + bytes.len() > self.transport.max_message_size {
            return Err(TransportError::MessageTooLarge {
                capacity: self.transport.max_message_size as u64,
                attempted: (self.buf.len() + bytes.len()) as u64,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn written_len(&self) -> usize {
        self.buf.len()
    }

    fn capacity(&self) -> usize {
        self.transport.max_message_size
    }

    fn send(self) -> Result<(), TransportError> {
        let len = (self.buf.len() as u32).to_le_bytes();
        self.transport.socket.write_all(&len)?;
        self.transport.socket.write_all(&self.buf)?;
        self.transport.writer_outstanding = false;
        Ok(())
    }

    fn cancel(self) -> Result<(), TransportError> {
        self.transport.writer_outstanding = false;
        Ok(())
    }
}

pub struct UdsMessage {
    bytes: Vec<u8>,
}

impl MessageView for UdsMessage {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn release(self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_receive_round_trips_one_frame() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut a = UdsTransport::init(a, 4096).unwrap();
        let mut b = UdsTransport::init(b, 4096).unwrap();

        let mut writer = a.message_init().unwrap().unwrap();
        writer.write_bytes(b"ping").unwrap();
        writer.send().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let message = b.receive().unwrap().unwrap();
        assert_eq!(message.bytes(), b"ping");
    }

    #[test]
    fn receive_without_data_returns_none() {
        let (_a, b) = UnixStream::pair().unwrap();
        let mut b = UdsTransport::init(b, 4096).unwrap();
        assert!(b.receive().unwrap().is_none());
    }
}
