//! A shared-memory arena: an [`ArenaHeader`], an embedded [`AllocatorHeader`]
//! and its block region, navigated exclusively through offsets.
//!
//! `Arena` is the single abstraction that mediates every unsafe offset
//! lookup under the allocator futex. Nothing outside this module ever
//! turns an [`Offset`] into a pointer.

pub mod allocator;
pub mod header;
pub mod queue;

use core::sync::atomic::Ordering;
use std::io;

use memmap2::MmapRaw;

use crate::error::AllocatorError;
use crate::offset::Offset;

pub use header::{AllocatorHeader, ArenaHeader, BlockFooter, BlockHeader, MessageHeader, Tag};

const ARENA_HEADER_SIZE: u64 = core::mem::size_of::<ArenaHeader>() as u64;
const ALLOCATOR_HEADER_SIZE: u64 = core::mem::size_of::<AllocatorHeader>() as u64;
const BLOCK_HEADER_SIZE: u64 = core::mem::size_of::<BlockHeader>() as u64;
const BLOCK_FOOTER_SIZE: u64 = core::mem::size_of::<BlockFooter>() as u64;

/// Offset, from the arena base, of the first byte of the block region.
const BLOCK_REGION_OFFSET: u64 = ARENA_HEADER_SIZE + ALLOCATOR_HEADER_SIZE;

/// A mapped shared-memory arena, owned by one process's local handle.
///
/// Two handles (one per process) may point at the same underlying mapping;
/// `Arena` itself carries no notion of "producer" or "write" vs. "read" —
/// that distinction belongs to [`crate::transport::shm::ShmTransport`],
/// which pairs two of these together.
pub struct Arena {
    map: MmapRaw,
    name: &'static str,
}

// SAFETY: every mutation to shared fields is either a plain atomic op or
// is performed while holding the allocator futex; `Arena` is designed to
// be used from two processes concurrently, so it must also tolerate being
// used from multiple threads within one process.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// The smallest buffer (everything after `ArenaHeader`) that can hold
    /// one block sized for `max_payload` bytes of content. Transports use
    /// this to validate a peer-supplied mapping before calling `create`.
    pub(crate) fn required_buffer_size(max_payload: u64) -> u64 {
        let max_payload = header::align_up(max_payload, header::BLOCK_ALIGN);
        let block_size = header::align_up(
            BLOCK_HEADER_SIZE + max_payload + BLOCK_FOOTER_SIZE,
            header::BLOCK_ALIGN,
        )
        .max(header::MIN_BLOCK_SIZE);
        ALLOCATOR_HEADER_SIZE + block_size
    }

    /// Initializes a freshly mapped region: one [`ArenaHeader`], one
    /// [`AllocatorHeader`], and a single FREE block spanning the rest.
    ///
    /// `mapping_len` is the mapping's total length, i.e. `size_of::<ArenaHeader>()
    /// + buffer_size` as produced by [`crate::mmap::create_mapping`].
    /// `max_payload` is the largest payload in bytes any `alloc()` will ever
    /// be asked to satisfy — callers that layer a message header on top
    /// must add that header's size in first.
    pub fn create(map: MmapRaw, mapping_len: u64, max_payload: u64, name: &'static str) -> Self {
        assert!(
            mapping_len >= BLOCK_REGION_OFFSET + header::MIN_BLOCK_SIZE,
            "mapping too small to hold even one minimum-size block"
        );
        let arena = Self { map, name };
        let buffer_size = mapping_len - ARENA_HEADER_SIZE;
        let block_region_size = buffer_size - ALLOCATOR_HEADER_SIZE;
        let max_payload = header::align_up(max_payload, header::BLOCK_ALIGN);

        arena.arena_header().init(buffer_size);
        arena.allocator_header().init(
            block_region_size,
            max_payload,
            Offset::new(BLOCK_REGION_OFFSET),
        );

        // SAFETY: BLOCK_REGION_OFFSET + block_region_size == mapping_len,
        // which was just asserted to fit within the mapping.
        unsafe {
            let header = arena.block_header_mut(Offset::new(BLOCK_REGION_OFFSET));
            header.write(block_region_size, Tag::Free, Offset::NULL);
            let footer = arena.block_footer_mut(Offset::new(BLOCK_REGION_OFFSET), block_region_size);
            footer.write(block_region_size, Tag::Free);
        }

        arena
    }

    /// Attaches to an already-initialized region — the peer-side view.
    /// Does not touch any shared field.
    pub fn attach(map: MmapRaw, name: &'static str) -> Self {
        Self { map, name }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    #[inline]
    pub fn arena_header(&self) -> &ArenaHeader {
        // SAFETY: the mapping is at least ARENA_HEADER_SIZE bytes (checked
        // at construction time by `create`, guaranteed by the peer for
        // `attach` since it maps an already-initialized region) and
        // ArenaHeader's alignment requirement (64) is satisfied because
        // mmap returns page-aligned memory.
        unsafe { &*(self.base() as *const ArenaHeader) }
    }

    #[inline]
    pub fn allocator_header(&self) -> &AllocatorHeader {
        // SAFETY: see `arena_header`; AllocatorHeader immediately follows it.
        unsafe { &*(self.base().add(ARENA_HEADER_SIZE as usize) as *const AllocatorHeader) }
    }

    /// # Safety
    /// `offset` must point at a live [`BlockHeader`] fully contained in the
    /// block region.
    #[inline]
    unsafe fn block_header(&self, offset: Offset) -> &BlockHeader {
        &*(self.base().add(offset.get() as usize) as *const BlockHeader)
    }

    /// # Safety
    /// See [`Arena::block_header`].
    #[inline]
    unsafe fn block_header_mut(&self, offset: Offset) -> &mut BlockHeader {
        &mut *(self.base().add(offset.get() as usize) as *mut BlockHeader)
    }

    /// # Safety
    /// `offset` must be a block start and `block_size` must be that
    /// block's true total size, so the footer lies within the mapping.
    #[inline]
    unsafe fn block_footer_mut(&self, offset: Offset, block_size: u64) -> &mut BlockFooter {
        let footer_offset = offset.get() + block_size - BLOCK_FOOTER_SIZE;
        &mut *(self.base().add(footer_offset as usize) as *mut BlockFooter)
    }

    /// # Safety
    /// See [`Arena::block_footer_mut`].
    #[inline]
    unsafe fn block_footer(&self, offset: Offset, block_size: u64) -> &BlockFooter {
        let footer_offset = offset.get() + block_size - BLOCK_FOOTER_SIZE;
        &*(self.base().add(footer_offset as usize) as *const BlockFooter)
    }

    /// Payload pointer for a block starting at `offset`.
    ///
    /// # Safety
    /// `offset` must be the start of a live block.
    #[inline]
    unsafe fn payload_ptr(&self, offset: Offset) -> *mut u8 {
        self.base().add(offset.get() as usize + BLOCK_HEADER_SIZE as usize)
    }

    /// # Safety
    /// `offset` must point at a live [`MessageHeader`].
    #[inline]
    unsafe fn message_header(&self, offset: Offset) -> &MessageHeader {
        &*(self.base().add(offset.get() as usize) as *const MessageHeader)
    }

    /// # Safety
    /// See [`Arena::message_header`].
    #[inline]
    unsafe fn message_header_mut(&self, offset: Offset) -> &mut MessageHeader {
        &mut *(self.base().add(offset.get() as usize) as *mut MessageHeader)
    }

    /// Byte size of a [`MessageHeader`], for callers that need to convert
    /// between a block's payload capacity and the content bytes available
    /// after the header.
    #[inline]
    pub(crate) fn message_header_size() -> u64 {
        core::mem::size_of::<MessageHeader>() as u64
    }

    /// Writes a fresh [`MessageHeader`] at the start of a just-allocated
    /// block's payload, with `size` set to the block's full payload
    /// capacity (not yet the bytes actually used) and no successor.
    ///
    /// # Safety
    /// `payload` must be the payload offset of a block this process just
    /// received from `alloc`.
    pub(crate) unsafe fn write_message_capacity(&self, payload: Offset, capacity: u64) {
        self.message_header_mut(payload).write(capacity, Offset::NULL);
    }

    /// Updates a message header's `size` field to the actual bytes used
    /// (header included), called once the writer knows its final length.
    ///
    /// # Safety
    /// `payload` must name a live message header installed by
    /// `write_message_capacity`.
    pub(crate) unsafe fn finalize_message_size(&self, payload: Offset, used_size: u64) {
        self.message_header_mut(payload).size = used_size;
    }

    /// Mutable pointer to the content bytes following a message header.
    ///
    /// # Safety
    /// `payload` must name a live message header.
    #[inline]
    pub(crate) unsafe fn message_content_ptr(&self, payload: Offset) -> *mut u8 {
        self.base()
            .add(payload.get() as usize + Self::message_header_size() as usize)
    }

    /// Reads a message's content length, i.e. `header.size` minus the
    /// header's own size.
    ///
    /// # Safety
    /// `payload` must name a live message header.
    #[inline]
    pub(crate) unsafe fn message_content_len(&self, payload: Offset) -> u64 {
        self.message_header(payload).size - Self::message_header_size()
    }

    /// Lower bound of the block region, used to guard the "is there a
    /// physically previous block at all" check during coalescing.
    #[inline]
    fn block_region_start(&self) -> u64 {
        BLOCK_REGION_OFFSET
    }

    #[inline]
    fn block_region_end(&self) -> u64 {
        BLOCK_REGION_OFFSET + self.allocator_header().total_size.load(Ordering::Acquire)
    }

    fn corrupt(&self, offset: u64, detail: &'static str) -> AllocatorError {
        AllocatorError::Corrupt {
            arena: self.name,
            offset,
            detail,
        }
    }

    fn futex_acquire(&self) -> Result<(), AllocatorError> {
        let word = &self.allocator_header().futex;
        loop {
            if word
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            #[cfg(target_os = "linux")]
            {
                #[cfg(feature = "tracing")]
                tracing::debug!(arena = self.name, "allocator futex contended, waiting");
                crate::futex::futex_wait(word, 1).map_err(|e| AllocatorError::Futex {
                    op: "wait",
                    errno: e.raw_os_error().unwrap_or(-1),
                })?;
            }
            #[cfg(not(target_os = "linux"))]
            {
                std::thread::yield_now();
            }
        }
    }

    fn futex_release(&self) -> Result<(), AllocatorError> {
        let word = &self.allocator_header().futex;
        word.store(0, Ordering::Release);
        #[cfg(target_os = "linux")]
        {
            crate::futex::futex_wake_all(word).map_err(|e| AllocatorError::Futex {
                op: "wake",
                errno: e.raw_os_error().unwrap_or(-1),
            })?;
        }
        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // MmapRaw unmaps on drop; nothing to release in the shared region
        // itself beyond allocations the caller already freed.
    }
}

impl From<io::Error> for AllocatorError {
    fn from(e: io::Error) -> Self {
        AllocatorError::Futex {
            op: "syscall",
            errno: e.raw_os_error().unwrap_or(-1),
        }
    }
}
