//! Cross-process allocator with boundary-tag coalescing, implemented over
//! the layout from [`super::header`].
//!
//! The free list is scanned first-fit rather than best-fit: the first
//! block large enough to satisfy a request is taken, not the smallest
//! such block. All requests in this arena are the same size, so the
//! distinction is moot in practice and first-fit is the cheaper scan.

use core::sync::atomic::Ordering;

use super::{Arena, Tag, BLOCK_FOOTER_SIZE, BLOCK_HEADER_SIZE};
use crate::error::AllocatorError;
use crate::offset::Offset;

impl Arena {
    /// Allocates a block sized for this arena's `max_message_size` and
    /// returns the offset of its payload. `Err(Full)` is ordinary
    /// back-pressure, not a fault.
    pub fn alloc(&self) -> Result<Offset, AllocatorError> {
        let required = self.required_block_size();

        self.futex_acquire()?;
        let found = self.find_first_fit(required);
        let result = match found {
            Some(offset) => {
                self.unlink_free(offset)?;
                // SAFETY: offset was just found in the free list, so it
                // names a live block.
                let block_size = unsafe { self.block_header(offset).size };
                unsafe {
                    self.block_header_mut(offset)
                        .write(block_size, Tag::Allocated, Offset::NULL);
                    self.block_footer_mut(offset, block_size)
                        .write(block_size, Tag::Allocated);
                }
                self.allocator_header()
                    .free_size
                    .fetch_sub(block_size, Ordering::AcqRel);
                Ok(Offset::new(offset.get() + BLOCK_HEADER_SIZE))
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::trace!(arena = self.name(), "alloc: arena full");
                Err(AllocatorError::Full)
            }
        };
        self.futex_release()?;
        result
    }

    /// Returns a block's payload to the allocator, eagerly coalescing with
    /// any physically adjacent FREE blocks.
    pub fn free(&self, payload: Offset) -> Result<(), AllocatorError> {
        let block_offset = Offset::new(payload.get() - BLOCK_HEADER_SIZE);

        self.futex_acquire()?;
        let result = self.free_locked(block_offset);
        self.futex_release()?;
        result
    }

    fn free_locked(&self, block_offset: Offset) -> Result<(), AllocatorError> {
        // SAFETY: caller (free/trim) passes the offset of a block it holds
        // a live ALLOCATED handle to.
        let original_size = unsafe { self.block_header(block_offset).size };

        let mut merged_offset = block_offset;
        let mut merged_size = original_size;

        // Previous physical neighbor: only if one exists at all.
        if merged_offset.get() > self.block_region_start() {
            let prev_footer_offset = merged_offset.get() - BLOCK_FOOTER_SIZE;
            // SAFETY: within the block region per the guard above.
            let prev = unsafe { self.read_footer_size_and_tag(prev_footer_offset) };
            if let Some((prev_size, Tag::Free)) = prev {
                let prev_offset = Offset::new(merged_offset.get() - prev_size);
                self.unlink_free(prev_offset)?;
                merged_offset = prev_offset;
                merged_size += prev_size;
            }
        }

        // Next physical neighbor.
        let next_offset = merged_offset.get() + merged_size;
        if next_offset < self.block_region_end() {
            // SAFETY: next_offset < block_region_end, so it names a live
            // block header within the mapping.
            let next_header = unsafe { self.block_header(Offset::new(next_offset)) };
            if matches!(Tag::from_raw(next_header.tag), Some(Tag::Free)) {
                let next_size = next_header.size;
                self.unlink_free(Offset::new(next_offset))?;
                merged_size += next_size;
            }
        }

        // SAFETY: merged_offset/merged_size describe a block fully
        // contained in the block region, established above.
        unsafe {
            self.block_header_mut(merged_offset)
                .write(merged_size, Tag::Free, Offset::NULL);
            self.block_footer_mut(merged_offset, merged_size)
                .write(merged_size, Tag::Free);
        }
        self.push_free(merged_offset)?;
        self.allocator_header()
            .free_size
            .fetch_add(original_size, Ordering::AcqRel);
        Ok(())
    }

    /// Splits an allocated block down to the smallest aligned block that
    /// holds `new_payload_size` bytes, returning the freed tail to the
    /// free list. `new_payload_size` is a payload byte count, not
    /// including the block's own header/footer.
    ///
    /// No-ops if the residual tail would be smaller than the minimum
    /// block size.
    pub fn trim(&self, payload: Offset, new_payload_size: u64) -> Result<(), AllocatorError> {
        let block_offset = Offset::new(payload.get() - BLOCK_HEADER_SIZE);

        self.futex_acquire()?;
        let result = self.trim_locked(block_offset, new_payload_size);
        self.futex_release()?;
        result
    }

    fn trim_locked(&self, block_offset: Offset, new_payload_size: u64) -> Result<(), AllocatorError> {
        // SAFETY: caller holds a live ALLOCATED block at this offset.
        let total_size = unsafe { self.block_header(block_offset).size };

        let head_size = super::header::align_up(
            BLOCK_HEADER_SIZE + new_payload_size + BLOCK_FOOTER_SIZE,
            super::header::BLOCK_ALIGN,
        )
        .max(super::header::MIN_BLOCK_SIZE);

        if head_size >= total_size || total_size - head_size < super::header::MIN_BLOCK_SIZE {
            return Ok(());
        }

        let tail_offset = Offset::new(block_offset.get() + head_size);
        let tail_size = total_size - head_size;

        // SAFETY: head_size + tail_size == total_size, which fits within
        // the mapping because the original block did.
        unsafe {
            self.block_header_mut(block_offset)
                .write(head_size, Tag::Allocated, Offset::NULL);
            self.block_footer_mut(block_offset, head_size)
                .write(head_size, Tag::Allocated);
            self.block_header_mut(tail_offset)
                .write(tail_size, Tag::Free, Offset::NULL);
            self.block_footer_mut(tail_offset, tail_size)
                .write(tail_size, Tag::Free);
        }
        self.push_free(tail_offset)?;
        self.allocator_header()
            .free_size
            .fetch_add(tail_size, Ordering::AcqRel);
        Ok(())
    }

    /// Smallest block size that can hold this arena's configured
    /// `max_message_size` payload.
    fn required_block_size(&self) -> u64 {
        let max_payload = self
            .allocator_header()
            .max_message_size
            .load(Ordering::Acquire);
        super::header::align_up(
            BLOCK_HEADER_SIZE + max_payload + BLOCK_FOOTER_SIZE,
            super::header::BLOCK_ALIGN,
        )
        .max(super::header::MIN_BLOCK_SIZE)
    }

    /// First-fit scan of the free list. Caller must hold the allocator
    /// futex.
    fn find_first_fit(&self, required: u64) -> Option<Offset> {
        let mut current = Offset::new(
            self.allocator_header()
                .next_free_block_offset
                .load(Ordering::Acquire),
        );
        while !current.is_null() {
            // SAFETY: every offset reachable from next_free_block_offset
            // names a live FREE block (invariant I3), assuming no prior
            // corruption.
            let header = unsafe { self.block_header(current) };
            if header.size >= required {
                return Some(current);
            }
            current = Offset::new(header.next_free_offset);
        }
        None
    }

    /// Removes the block at `offset` from the free list. Caller must hold
    /// the allocator futex and know the block is actually free-listed.
    fn unlink_free(&self, offset: Offset) -> Result<(), AllocatorError> {
        let header = &self.allocator_header().next_free_block_offset;
        let mut prev: Option<Offset> = None;
        let mut current = Offset::new(header.load(Ordering::Acquire));

        while !current.is_null() {
            // SAFETY: free-list traversal, invariant I3.
            let current_header = unsafe { self.block_header(current) };
            if current == offset {
                let next = Offset::new(current_header.next_free_offset);
                match prev {
                    None => header.store(next.get(), Ordering::Release),
                    Some(prev_offset) => unsafe {
                        self.block_header_mut(prev_offset).next_free_offset = next.get();
                    },
                }
                return Ok(());
            }
            prev = Some(current);
            current = Offset::new(current_header.next_free_offset);
        }

        Err(self.corrupt(
            offset.get(),
            "block expected to be on the free list was not found there",
        ))
    }

    /// Pushes `offset` onto the head of the free list in O(1). Caller must
    /// hold the allocator futex and have already tagged the block FREE.
    fn push_free(&self, offset: Offset) -> Result<(), AllocatorError> {
        let head = &self.allocator_header().next_free_block_offset;
        let old_head = Offset::new(head.load(Ordering::Acquire));
        // SAFETY: offset was just written as a FREE block by the caller.
        unsafe {
            self.block_header_mut(offset).next_free_offset = old_head.get();
        }
        head.store(offset.get(), Ordering::Release);
        Ok(())
    }

    /// Reads the footer located at raw byte offset `footer_offset`,
    /// returning its `(size, tag)` if the tag decodes to a known value.
    ///
    /// # Safety
    /// `footer_offset` must lie within the mapping.
    unsafe fn read_footer_size_and_tag(&self, footer_offset: u64) -> Option<(u64, Tag)> {
        let footer = &*(self.base().add(footer_offset as usize) as *const super::BlockFooter);
        Tag::from_raw(footer.tag).map(|tag| (footer.size, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::super::header::MIN_BLOCK_SIZE;
    use super::*;
    use memmap2::MmapOptions;

    fn test_arena(name: &'static str, buffer_size: u64, max_message_size: u64) -> Arena {
        let total_len = core::mem::size_of::<super::super::ArenaHeader>() as u64 + buffer_size;
        let map = MmapOptions::new()
            .len(total_len as usize)
            .map_anon()
            .unwrap()
            .into();
        Arena::create(map, total_len, max_message_size, name)
    }

    #[test]
    fn alloc_free_restores_free_size() {
        let arena = test_arena("t1", 4096, 64);
        let before = arena.allocator_header().free_size.load(Ordering::Acquire);
        let p = arena.alloc().unwrap();
        let mid = arena.allocator_header().free_size.load(Ordering::Acquire);
        assert!(mid < before);
        arena.free(p).unwrap();
        let after = arena.allocator_header().free_size.load(Ordering::Acquire);
        assert_eq!(before, after);
    }

    #[test]
    fn alloc_until_full_then_null() {
        let arena = test_arena("t2", 768, 128);
        let mut allocated = Vec::new();
        loop {
            match arena.alloc() {
                Ok(p) => allocated.push(p),
                Err(AllocatorError::Full) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(!allocated.is_empty());
        assert!(matches!(arena.alloc(), Err(AllocatorError::Full)));
    }

    #[test]
    fn free_coalesces_adjacent_blocks() {
        let arena = test_arena("t3", 4096, 64);
        let a = arena.alloc().unwrap();
        let b = arena.alloc().unwrap();
        let c = arena.alloc().unwrap();
        arena.free(a).unwrap();
        arena.free(c).unwrap();
        arena.free(b).unwrap();
        // Everything should have merged back into a single free block
        // spanning the whole region.
        let total = arena.allocator_header().total_size.load(Ordering::Acquire);
        let free = arena.allocator_header().free_size.load(Ordering::Acquire);
        assert_eq!(total, free);
        let head = Offset::new(
            arena
                .allocator_header()
                .next_free_block_offset
                .load(Ordering::Acquire),
        );
        assert!(!head.is_null());
        let next = unsafe { arena.block_header(head).next_free_offset };
        assert_eq!(next, crate::offset::NULL_OFFSET);
    }

    #[test]
    fn trim_noop_when_tail_too_small() {
        let arena = test_arena("t4", 4096, 512);
        let p = arena.alloc().unwrap();
        let before = unsafe { arena.block_header(Offset::new(p.get() - BLOCK_HEADER_SIZE)).size };
        // Ask to trim down to just a few bytes less than the whole block,
        // so the would-be tail is under MIN_BLOCK_SIZE.
        arena.trim(p, before - BLOCK_HEADER_SIZE - BLOCK_FOOTER_SIZE - 1).unwrap();
        let after = unsafe { arena.block_header(Offset::new(p.get() - BLOCK_HEADER_SIZE)).size };
        assert_eq!(before, after);
    }

    #[test]
    fn trim_splits_and_frees_tail() {
        let arena = test_arena("t5", 8192, 2048);
        let p = arena.alloc().unwrap();
        let free_before = arena.allocator_header().free_size.load(Ordering::Acquire);
        arena.trim(p, 16).unwrap();
        let free_after = arena.allocator_header().free_size.load(Ordering::Acquire);
        assert!(free_after > free_before);
        let block = unsafe { arena.block_header(Offset::new(p.get() - BLOCK_HEADER_SIZE)) };
        assert!(block.size >= MIN_BLOCK_SIZE);
    }
}
