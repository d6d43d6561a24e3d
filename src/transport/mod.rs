//! The transport abstraction both concrete transports implement, and that
//! the RPC layer is generic over.
//!
//! The original implementation expresses a transport as a struct of
//! function pointers; here that becomes a trait with an associated writer
//! type, so `send`/`cancel`/`write_*` are methods on the value they act on
//! instead of callbacks threaded through a context pointer.

// The event coordinator `ShmTransport` relies on for its futex wakeups only
// exists on Linux (see `crate::event`); the non-Linux build carries no stub
// surface wide enough to keep it compiling, so the whole module is gated.
#[cfg(target_os = "linux")]
pub mod shm;
pub mod uds;

use crate::error::TransportError;

/// A handle to a message being built, returned by [`Transport::message_init`].
pub trait MessageWriter {
    /// Appends bytes to the message content, failing if they would not
    /// fit in the reserved capacity.
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Bytes written so far.
    fn written_len(&self) -> usize;

    /// Total content capacity reserved for this message.
    fn capacity(&self) -> usize;

    /// Finalizes the message at its current length, links it onto the
    /// transport's outgoing queue, and wakes the peer.
    fn send(self) -> Result<(), TransportError>;

    /// Abandons the message, returning its block to the allocator.
    fn cancel(self) -> Result<(), TransportError>;
}

/// A handle to a received message, returned by [`Transport::receive`].
pub trait MessageView {
    /// The message's content bytes.
    fn bytes(&self) -> &[u8];

    /// Frees the underlying block. Consumers that drop the handle without
    /// calling this leak the block until the next restart of that arena.
    fn release(self) -> Result<(), TransportError>;
}

/// A bidirectional channel carrying discrete, self-describing messages
/// between two local peers.
///
/// Parameterized over the borrow lifetime `'a` of the writer/message
/// handles it returns: both hand back a reference into the transport
/// itself (the arena and event coordinator they act on), so one
/// outstanding writer or message handle exclusively borrows the
/// transport until it is sent/cancelled/released.
pub trait Transport<'a> {
    type Writer: MessageWriter + 'a;
    type Message: MessageView + 'a;

    /// Reserves a new outgoing message, or `Ok(None)` if the outgoing
    /// side is full (ordinary back-pressure, not an error).
    fn message_init(&'a mut self) -> Result<Option<Self::Writer>, TransportError>;

    /// Pulls the next message off the incoming side, or `Ok(None)` if
    /// none is currently queued.
    fn receive(&'a mut self) -> Result<Option<Self::Message>, TransportError>;

    /// Tears the transport down: unmaps/closes whatever it owns.
    fn destroy(self);
}
