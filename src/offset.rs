//! Offset-based addressing into a shared-memory arena.
//!
//! Every cross-process reference in this crate is a byte distance from the
//! start of an [`crate::arena::Arena`], never a host pointer — two peers map
//! the same file at two different base addresses, so a raw pointer stored in
//! shared memory would be meaningless to whichever process didn't write it.
//! `Offset` exists so that invariant is enforced by the type system instead
//! of by convention: nothing outside `arena::Arena` is allowed to turn an
//! `Offset` into a pointer.

use core::fmt;

/// Sentinel meaning "no block"/"no message" — the maximum representable
/// offset, since no real arena is anywhere near `u64::MAX` bytes.
pub const NULL_OFFSET: u64 = u64::MAX;

/// A byte distance from the start of an arena's `ArenaHeader`.
///
/// Portable across processes: two peers that mapped the same shared region
/// at different base addresses still agree on what `Offset(n)` means.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Offset(pub u64);

impl Offset {
    pub const NULL: Offset = Offset(NULL_OFFSET);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Offset(raw)
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_OFFSET
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Default for Offset {
    #[inline]
    fn default() -> Self {
        Offset::NULL
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Offset(NULL)")
        } else {
            write!(f, "Offset({})", self.0)
        }
    }
}

impl From<u64> for Offset {
    #[inline]
    fn from(raw: u64) -> Self {
        Offset(raw)
    }
}
