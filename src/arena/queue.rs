//! Intrusive singly-linked FIFO of message records threaded through
//! [`MessageHeader::next_message_offset`](super::MessageHeader), one per
//! arena, single-producer/single-consumer.

use core::sync::atomic::Ordering;

use super::Arena;
use crate::error::AllocatorError;
use crate::offset::Offset;

impl Arena {
    /// Links the message header at `message_offset` onto the tail of this
    /// arena's FIFO.
    ///
    /// Reuses the allocator futex: the queue mutates arena-header fields
    /// that must stay consistent with the same lock producer/free/trim
    /// already take. `num_messages` is incremented only after the futex is
    /// released, so a consumer that observes the new count is guaranteed
    /// to also observe the updated list — reordering this would let a
    /// consumer see a stale tail.
    pub fn enqueue(&self, message_offset: Offset) -> Result<(), AllocatorError> {
        self.futex_acquire()?;
        let header = self.arena_header();
        let last = header.last_message();
        if last.is_null() {
            header
                .first_message_offset
                .store(message_offset.get(), Ordering::Relaxed);
        } else {
            // SAFETY: `last` came from `last_message_offset`, which always
            // names a live message header while the futex is held.
            unsafe {
                self.message_header_mut(last).next_message_offset = message_offset.get();
            }
        }
        header
            .last_message_offset
            .store(message_offset.get(), Ordering::Relaxed);
        self.futex_release()?;

        header.num_messages.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Unlinks and returns the FIFO head, or [`Offset::NULL`] if the queue
    /// is empty.
    ///
    /// Checks `num_messages` first so an empty queue never touches the
    /// futex; single-consumer semantics make this race-free: only this
    /// side ever decrements the counter or advances the head.
    pub fn dequeue(&self) -> Result<Offset, AllocatorError> {
        let header = self.arena_header();
        if header.num_messages.load(Ordering::Acquire) == 0 {
            return Ok(Offset::NULL);
        }

        self.futex_acquire()?;
        let head = header.first_message();
        if head.is_null() {
            self.futex_release()?;
            return Err(self.corrupt(
                0,
                "num_messages > 0 but first_message_offset is null",
            ));
        }
        // SAFETY: head names a live message header; I6 guarantees its
        // block is ALLOCATED and its payload starts with a valid header.
        let next = unsafe { self.message_header(head).next() };
        header
            .first_message_offset
            .store(next.get(), Ordering::Relaxed);
        if next.is_null() {
            header
                .last_message_offset
                .store(Offset::NULL.get(), Ordering::Relaxed);
        }
        self.futex_release()?;

        header.num_messages.fetch_sub(1, Ordering::Release);
        Ok(head)
    }
}
