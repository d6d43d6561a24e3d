use std::collections::HashMap;
use std::sync::atomic::AtomicU32;

use io_uring::{cqueue, opcode, types, IoUring};

use super::{EventKind, EventTag, Handled};
use crate::arena::Arena;
use crate::error::EventError;

// IORING_OP_FUTEX_WAIT/WAKE operate on a futex2-style word; bitset
// FUTEX_BITSET_MATCH_ANY matches any waiter regardless of bitmask, and
// FUTEX2_SIZE_U32 tells the kernel the word is 32 bits wide (this crate's
// arena/allocator futex words are always `AtomicU32`).
const FUTEX_BITSET_MATCH_ANY: u64 = 0xffff_ffff;
const FUTEX2_SIZE_U32: u32 = 0x02;

/// Per-manager bookkeeping the coordinator needs to re-submit a wait after
/// a spurious wakeup.
struct ManagerWait {
    futex: *const AtomicU32,
}

// SAFETY: the pointer is into a shared-memory mapping that outlives the
// coordinator by construction (callers register a manager only after
// attaching its arena, and drop the coordinator before the arena).
unsafe impl Send for ManagerWait {}

/// Owns one `io_uring` instance and the futex-wait/wake submissions made
/// on behalf of every registered manager.
pub struct EventCoordinator {
    ring: IoUring,
    waits: HashMap<u32, ManagerWait>,
}

impl EventCoordinator {
    pub fn new(entries: u32) -> Result<Self, EventError> {
        let ring = IoUring::new(entries)?;
        Ok(EventCoordinator {
            ring,
            waits: HashMap::new(),
        })
    }

    /// Submits a futex-wait on `arena`'s `num_messages` word, expecting it
    /// to still be `0`. Completion means the count moved away from zero,
    /// or a spurious wake — [`handle_event`](Self::handle_event)
    /// distinguishes the two.
    pub fn wait_messages(&mut self, manager_id: u32, arena: &Arena) -> Result<(), EventError> {
        let word = &arena.arena_header().num_messages;
        self.waits.insert(
            manager_id,
            ManagerWait {
                futex: word as *const AtomicU32,
            },
        );
        self.submit_wait(manager_id, word)
    }

    fn submit_wait(&mut self, manager_id: u32, word: &AtomicU32) -> Result<(), EventError> {
        let tag = EventTag {
            manager_id,
            kind: EventKind::Read,
        }
        .pack();
        let entry = opcode::FutexWait::new(
            word as *const AtomicU32 as *const u32,
            0,
            FUTEX_BITSET_MATCH_ANY,
            FUTEX2_SIZE_U32,
        )
        .build()
        .user_data(tag);

        // SAFETY: `word` lives inside the arena's shared mapping, which
        // outlives this submission (enforced by the caller keeping the
        // arena alive for the coordinator's lifetime).
        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .map_err(|_| EventError::Ring(std::io::Error::from_raw_os_error(libc::EBUSY)))?;
        }
        self.ring.submit()?;
        Ok(())
    }

    /// Submits a futex-wake targeting one waiter on `arena`'s
    /// `num_messages` word (the peer that is blocked in `wait_messages`),
    /// and waits synchronously for this one submission's completion.
    pub fn signal_new_message(&mut self, manager_id: u32, arena: &Arena) -> Result<(), EventError> {
        let word = &arena.arena_header().num_messages;
        let tag = EventTag {
            manager_id,
            kind: EventKind::Write,
        }
        .pack();
        let entry = opcode::FutexWake::new(
            word as *const AtomicU32 as *const u32,
            1,
            FUTEX_BITSET_MATCH_ANY,
            FUTEX2_SIZE_U32,
        )
        .build()
        .user_data(tag);

        // SAFETY: see `submit_wait`.
        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .map_err(|_| EventError::Ring(std::io::Error::from_raw_os_error(libc::EBUSY)))?;
        }
        self.ring.submit_and_wait(1)?;
        let _ = self
            .ring
            .completion()
            .next()
            .ok_or_else(|| EventError::Ring(std::io::Error::from_raw_os_error(libc::EIO)))?;
        Ok(())
    }

    /// Registers interest in readiness on a plain socket fd, for the UDS
    /// transport; tagged `EventKind::Read`.
    pub fn wait_readable(&mut self, manager_id: u32, fd: i32) -> Result<(), EventError> {
        let tag = EventTag {
            manager_id,
            kind: EventKind::Read,
        }
        .pack();
        let entry = opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32)
            .build()
            .user_data(tag);
        // SAFETY: fd is kept open by the caller for at least as long as
        // this submission is outstanding.
        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .map_err(|_| EventError::Ring(std::io::Error::from_raw_os_error(libc::EBUSY)))?;
        }
        self.ring.submit()?;
        Ok(())
    }

    /// Blocks until at least one completion is available and returns it.
    pub fn wait_for_completion(&mut self) -> Result<cqueue::Entry, EventError> {
        self.ring.submit_and_wait(1)?;
        self.ring
            .completion()
            .next()
            .ok_or_else(|| EventError::Ring(std::io::Error::from_raw_os_error(libc::EIO)))
    }

    /// Interprets one completion's tag and re-submits the wait if it was a
    /// spurious futex wakeup.
    pub fn handle_event(
        &mut self,
        completion: cqueue::Entry,
        arena_for: impl FnOnce(u32) -> Option<*const AtomicU32>,
    ) -> Result<Handled, EventError> {
        let tag = EventTag::unpack(completion.user_data());
        let result = completion.result();

        if result < 0 {
            let errno = -result;
            if errno == libc::EAGAIN || errno == libc::EINTR {
                if let EventKind::Read = tag.kind {
                    if let Some(word_ptr) = arena_for(tag.manager_id) {
                        // SAFETY: the caller-provided lookup returns a
                        // pointer into a still-live arena mapping.
                        let word = unsafe { &*word_ptr };
                        self.submit_wait(tag.manager_id, word)?;
                    }
                }
                return Ok(Handled::Retry);
            }
            return Err(EventError::Futex {
                op: "completion",
                errno,
            });
        }

        match tag.kind {
            EventKind::Read => Ok(Handled::MessageReady {
                manager_id: tag.manager_id,
            }),
            EventKind::Write => Ok(Handled::WakeAcked {
                manager_id: tag.manager_id,
            }),
        }
    }
}
