//! Error types for every component.
//!
//! Five kinds of failure exist in this crate (see the top-level crate docs
//! for the rationale behind each): back-pressure, which is not an error and
//! is represented as `Ok(None)`/`Option::None`, never a `Result::Err`;
//! peer-side transient conditions, which are swallowed and retried inside
//! the event coordinator; construction-time configuration errors, which are
//! returned to the caller as `Err`; fatal syscall failures and memory
//! corruption, which are logged and then abort the process — they have no
//! `Result` representation because there is nothing a caller could safely
//! do with them.
//!
//! Each enum below gets a hand-written `Display`/`std::error::Error`
//! instead of a derive macro, matching how this arena's types have always
//! reported errors.

use core::fmt;

/// Errors that can surface from the arena allocator.
///
/// `Full` is the only variant a caller can reasonably recover from by
/// retrying or dropping the request; everything else indicates the shared
/// region is no longer trustworthy and the caller must log it and abort.
#[derive(Debug)]
pub enum AllocatorError {
    /// No free block is large enough to satisfy the request. Not logged at
    /// error level — this is ordinary back-pressure.
    Full,
    /// A `futex(2)` call failed with something other than `EAGAIN`/`EINTR`.
    Futex { op: &'static str, errno: i32 },
    /// Header/footer disagreement, an out-of-range offset, or any other
    /// sign that the shared region's bookkeeping no longer matches reality.
    Corrupt {
        arena: &'static str,
        offset: u64,
        detail: &'static str,
    },
}

impl fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorError::Full => write!(f, "allocation failed because the arena is full"),
            AllocatorError::Futex { op, errno } => {
                write!(f, "futex {op} failed: errno {errno}")
            }
            AllocatorError::Corrupt {
                arena,
                offset,
                detail,
            } => write!(
                f,
                "corruption detected in arena '{arena}' at offset {offset}: {detail}"
            ),
        }
    }
}

impl std::error::Error for AllocatorError {}

impl AllocatorError {
    /// Whether this error indicates the arena is no longer safe to use.
    ///
    /// Call sites that observe `true` must log and call
    /// [`std::process::abort`]; there is no recoverable path once the
    /// shared region's bookkeeping is known to be wrong.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AllocatorError::Full)
    }
}

/// Errors from the event coordinator.
#[derive(Debug)]
pub enum EventError {
    /// The completion ring rejected a submission (usually because it is
    /// full) or a submit/wait syscall failed.
    Ring(std::io::Error),
    /// A futex wait/wake failed with something other than `EAGAIN`/`EINTR`.
    Futex { op: &'static str, errno: i32 },
    /// A completion carried a user-data tag this coordinator did not
    /// submit — indicates a bug in the owning event loop, not a transport
    /// failure.
    UnknownTag(u64),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Ring(e) => write!(f, "completion ring error: {e}"),
            EventError::Futex { op, errno } => write!(f, "futex {op} failed: errno {errno}"),
            EventError::UnknownTag(tag) => write!(f, "completion carried unknown tag {tag:#x}"),
        }
    }
}

impl std::error::Error for EventError {}

impl From<std::io::Error> for EventError {
    fn from(e: std::io::Error) -> Self {
        EventError::Ring(e)
    }
}

/// Errors from constructing or tearing down a transport.
///
/// These are the only `Transport` failures a caller is expected to recover
/// from — once a transport is successfully constructed, its steady-state
/// operations (`send`/`receive`/`release`) do not fail except by process
/// abort on detected corruption.
#[derive(Debug)]
pub enum TransportError {
    /// The write-side mapping is smaller than `max_message_size` requires.
    MappingTooSmall { required: u64, found: u64 },
    /// A syscall (`memfd_create`, `ftruncate`, `mmap`, `fstat`, ...) failed.
    Io(std::io::Error),
    /// The allocator could not be initialized or attached to.
    Allocator(AllocatorError),
    /// The event coordinator could not be constructed.
    Event(EventError),
    /// A writer was asked to append more bytes than its reserved capacity.
    MessageTooLarge { capacity: u64, attempted: u64 },
    /// `message_init` was called again before the previous writer was
    /// sent or cancelled. Each write arena has exactly one producer.
    WriterAlreadyOutstanding,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::MappingTooSmall { required, found } => write!(
                f,
                "mapping too small: need at least {required} bytes, found {found}"
            ),
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
            TransportError::Allocator(e) => write!(f, "allocator error: {e}"),
            TransportError::Event(e) => write!(f, "event coordinator error: {e}"),
            TransportError::MessageTooLarge {
                capacity,
                attempted,
            } => write!(
                f,
                "message content exceeds reserved capacity: attempted {attempted} bytes, capacity {capacity}"
            ),
            TransportError::WriterAlreadyOutstanding => {
                write!(f, "message_init called while a writer is still outstanding")
            }
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<AllocatorError> for TransportError {
    fn from(e: AllocatorError) -> Self {
        TransportError::Allocator(e)
    }
}

impl From<EventError> for TransportError {
    fn from(e: EventError) -> Self {
        TransportError::Event(e)
    }
}

/// Log a corruption error and abort the process.
///
/// There is no recovery path for a corrupted arena: the bookkeeping that
/// would be needed to repair it is exactly the bookkeeping that is now
/// known to be wrong.
#[cold]
#[inline(never)]
pub fn abort_on_corruption(err: &AllocatorError) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!(error = %err, "shared-memory arena corruption detected, aborting");
    #[cfg(not(feature = "tracing"))]
    eprintln!("fatal: shared-memory arena corruption detected: {err}");
    std::process::abort()
}
