//! Pairs a write arena this process owns as producer with a read arena
//! owned by the peer, plus the event coordinator that wakes and is woken
//! by that peer.

use std::os::fd::RawFd;

use super::{MessageView, MessageWriter, Transport};
use crate::arena::Arena;
use crate::error::TransportError;
use crate::event::{EventCoordinator, Handled};
use crate::offset::Offset;

/// A single manager id is enough here: one [`ShmTransport`] owns exactly
/// one ring and multiplexes only its own read arena's futex.
const MANAGER_ID: u32 = 0;

/// Default ring depth for the coordinator a transport builds internally.
const DEFAULT_RING_ENTRIES: u32 = 32;

/// Default buffer size (bytes after the `ArenaHeader`) used by callers
/// that don't have a sizing opinion of their own.
pub const DEFAULT_BUFFER_SIZE: u64 = 1 << 20;

/// Default largest message content size, again for callers with no
/// sizing opinion of their own.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 4096;

/// Creates the anonymous shared-memory file a future `init` call expects,
/// sized to hold one arena's header, allocator header and block region.
pub fn create_mapping(name: &str, buffer_size: u64) -> std::io::Result<std::os::fd::OwnedFd> {
    crate::mmap::create_mapping(name, buffer_size)
}

pub struct ShmTransport {
    name: String,
    write_arena: Arena,
    read_arena: Arena,
    max_message_size: u64,
    events: EventCoordinator,
    writer_outstanding: bool,
}

impl ShmTransport {
    /// Maps both arenas, initializing the write side and attaching to the
    /// (already-initialized, peer-owned) read side. Fails if the write
    /// mapping is too small for `max_message_size`.
    pub fn init(
        name: &str,
        read_fd: RawFd,
        write_fd: RawFd,
        max_message_size: u64,
    ) -> Result<Self, TransportError> {
        let write_buffer_size = crate::mmap::get_mapping_size(write_fd)?;
        let required = Arena::required_buffer_size(
            max_message_size + Arena::message_header_size(),
        );
        if write_buffer_size < required {
            return Err(TransportError::MappingTooSmall {
                required,
                found: write_buffer_size,
            });
        }

        let write_map = crate::mmap::map_shared(write_fd)?;
        let write_mapping_len = write_map.len() as u64;
        let leaked_name: &'static str = Box::leak(name.to_string().into_boxed_str());
        let write_arena = Arena::create(
            write_map,
            write_mapping_len,
            max_message_size + Arena::message_header_size(),
            leaked_name,
        );

        let read_map = crate::mmap::map_shared(read_fd)?;
        let read_arena = Arena::attach(read_map, leaked_name);

        let events = EventCoordinator::new(DEFAULT_RING_ENTRIES)?;

        Ok(ShmTransport {
            name: name.to_string(),
            write_arena,
            read_arena,
            max_message_size,
            events,
            writer_outstanding: false,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn max_message_size(&self) -> u64 {
        self.max_message_size
    }

    /// Submits a futex-wait on the read arena's message count, for a
    /// caller driving its own completion-ring event loop.
    pub fn wait_for_messages(&mut self) -> Result<(), TransportError> {
        self.events
            .wait_messages(MANAGER_ID, &self.read_arena)
            .map_err(TransportError::from)
    }

    /// Blocks for the next completion on this transport's ring and
    /// dispatches it. Pair with [`wait_for_messages`](Self::wait_for_messages):
    /// submit the wait, then call this to drive it to a result.
    /// `Handled::MessageReady` means `receive` can now be called; any other
    /// outcome means the wait has already been (or need not be) resubmitted
    /// and the caller should poll again.
    pub fn poll_completion(&mut self) -> Result<Handled, TransportError> {
        let completion = self.events.wait_for_completion()?;
        let read_arena = &self.read_arena;
        self.events
            .handle_event(completion, |id| {
                (id == MANAGER_ID).then(|| &read_arena.arena_header().num_messages as *const _)
            })
            .map_err(TransportError::from)
    }
}

impl<'a> Transport<'a> for ShmTransport {
    type Writer = ShmWriter<'a>;
    type Message = ShmMessage<'a>;

    fn message_init(&'a mut self) -> Result<Option<ShmWriter<'a>>, TransportError> {
        if self.writer_outstanding {
            return Err(TransportError::WriterAlreadyOutstanding);
        }
        let capacity = self.max_message_size;
        let block_payload = match self.write_arena.alloc() {
            Ok(offset) => offset,
            Err(crate::error::AllocatorError::Full) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(transport = self.name.as_str(), "message_init: write arena full");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        // SAFETY: block_payload was just returned by alloc, a live
        // ALLOCATED block this process owns exclusively until send/cancel.
        unsafe {
            self.write_arena
                .write_message_capacity(block_payload, capacity + Arena::message_header_size());
        }
        self.writer_outstanding = true;
        Ok(Some(ShmWriter {
            transport: self,
            message_offset: block_payload,
            capacity: capacity as usize,
            written: 0,
        }))
    }

    fn receive(&'a mut self) -> Result<Option<ShmMessage<'a>>, TransportError> {
        let message_offset = self.read_arena.dequeue()?;
        if message_offset.is_null() {
            return Ok(None);
        }
        Ok(Some(ShmMessage {
            transport: self,
            message_offset,
        }))
    }

    fn destroy(self) {
        // Arena::drop unmaps; EventCoordinator has no explicit teardown
        // beyond dropping the ring. Nothing else to release here.
    }
}

pub struct ShmWriter<'a> {
    transport: &'a mut ShmTransport,
    message_offset: Offset,
    capacity: usize,
    written: usize,
}

impl<'a> MessageWriter for ShmWriter<'a> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.written + bytes.len() > self.capacity {
            return Err(TransportError::MessageTooLarge {
                capacity: self.capacity as u64,
                attempted: (self.written + bytes.len()) as u64,
            });
        }
        // SAFETY: message_offset names the message header this writer
        // installed in `message_init`; written + bytes.len() <= capacity
        // was just checked, so the copy stays inside the reserved block.
        unsafe {
            let dst = self
                .transport
                .write_arena
                .message_content_ptr(self.message_offset)
                .add(self.written);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        self.written += bytes.len();
        Ok(())
    }

    fn written_len(&self) -> usize {
        self.written
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn send(self) -> Result<(), TransportError> {
        let used = Arena::message_header_size() + self.written as u64;
        // SAFETY: message_offset names the message header this writer owns.
        unsafe {
            self.transport
                .write_arena
                .finalize_message_size(self.message_offset, used);
        }
        self.transport.write_arena.trim(self.message_offset, used)?;
        self.transport.write_arena.enqueue(self.message_offset)?;
        self.transport.writer_outstanding = false;
        self.transport
            .events
            .signal_new_message(MANAGER_ID, &self.transport.write_arena)
            .map_err(TransportError::from)
    }

    fn cancel(self) -> Result<(), TransportError> {
        self.transport.write_arena.free(self.message_offset)?;
        self.transport.writer_outstanding = false;
        Ok(())
    }
}

pub struct ShmMessage<'a> {
    transport: &'a mut ShmTransport,
    message_offset: Offset,
}

impl<'a> MessageView for ShmMessage<'a> {
    fn bytes(&self) -> &[u8] {
        // SAFETY: message_offset came from a successful `dequeue` on this
        // arena and has not yet been released.
        unsafe {
            let len = self.transport.read_arena.message_content_len(self.message_offset) as usize;
            let ptr = self.transport.read_arena.message_content_ptr(self.message_offset);
            std::slice::from_raw_parts(ptr, len)
        }
    }

    fn release(self) -> Result<(), TransportError> {
        self.transport
            .read_arena
            .free(self.message_offset)
            .map_err(TransportError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, IntoRawFd};

    fn make_pair(name: &str, buffer_size: u64, max_message_size: u64) -> (ShmTransport, ShmTransport) {
        let a_fd = create_mapping(&format!("{name}-a"), buffer_size).unwrap();
        let b_fd = create_mapping(&format!("{name}-b"), buffer_size).unwrap();
        let a_raw = a_fd.into_raw_fd();
        let b_raw = b_fd.into_raw_fd();

        let dup = |fd: RawFd| unsafe { libc::dup(fd) };

        let a = ShmTransport::init(name, dup(b_raw), a_raw, max_message_size).unwrap();
        let b = ShmTransport::init(name, dup(a_raw), b_raw, max_message_size).unwrap();
        (a, b)
    }

    #[test]
    fn cancel_restores_free_size() {
        let (mut a, _b) = make_pair("shm-cancel", 4096, 128);
        let before = a.write_arena.allocator_header().free_size.load(core::sync::atomic::Ordering::Acquire);
        let writer = a.message_init().unwrap().unwrap();
        writer.cancel().unwrap();
        let after = a.write_arena.allocator_header().free_size.load(core::sync::atomic::Ordering::Acquire);
        assert_eq!(before, after);
    }

    #[test]
    fn send_then_receive_round_trips_bytes() {
        let (mut a, mut b) = make_pair("shm-roundtrip", 4096, 128);
        let mut writer = a.message_init().unwrap().unwrap();
        writer.write_bytes(b"hello world").unwrap();
        writer.send().unwrap();

        let message = b.receive().unwrap().unwrap();
        assert_eq!(message.bytes(), b"hello world");
        message.release().unwrap();
    }
}
