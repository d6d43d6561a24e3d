//! A local process-to-process messaging substrate.
//!
//! Two flavors of transport carry discrete messages between peers on the
//! same host: [`transport::shm`] over shared memory, allocated from a
//! boundary-tag [`arena::Arena`] and synchronized with a futex; and
//! [`transport::uds`] over a length-prefixed Unix-domain stream socket,
//! for peers that don't share a mapping. [`event`] multiplexes both kinds
//! of wakeup, futex and socket readiness alike, into one `io_uring`
//! completion queue. [`rpc`] layers request/response pairing on top of
//! either transport.
//!
//! # Error handling
//!
//! Four kinds of failure exist here, not one:
//!
//! - Back-pressure ("no free block", "nothing queued yet") is not an
//!   error. It's `Ok(None)`.
//! - Construction-time configuration problems (a mapping too small for
//!   the requested message size, a ring that failed to build) are
//!   returned to the caller as `Err` via [`error::TransportError`] and
//!   [`error::EventError`].
//! - A `futex(2)` or `io_uring` syscall failing with anything other than
//!   `EAGAIN`/`EINTR` is also returned as `Err`, since the caller is
//!   generally able to retry the whole operation.
//! - Shared-region corruption — a header/footer size mismatch, an
//!   out-of-range offset — has no `Result` representation at all.
//!   [`error::abort_on_corruption`] logs and calls
//!   [`std::process::abort`]; there is no repair path once the
//!   bookkeeping itself is known to be wrong.
//!
//! # Logging
//!
//! Enable the `tracing` feature to route the one truly exceptional event,
//! corruption, through [`tracing::error!`]; without it the same message
//! goes to stderr. Nothing in the steady-state send/receive path logs,
//! since back-pressure and transient futex returns are both ordinary
//! control flow rather than something an operator needs to see.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod arena;
pub mod error;
pub mod event;
mod futex;
mod mmap;
mod offset;
pub mod rpc;
pub mod transport;

pub use mmap::{create_mapping, get_mapping_size};
pub use offset::Offset;
