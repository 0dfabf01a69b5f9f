//! Opaque handles and handle allocation.
//!
//! A [`GameHandle`] identifies anything the composition core addresses by id:
//! game objects, modules, and (through the event transport) external
//! collaborators. Handle `0` is reserved as [`GameHandle::NULL`].

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// GameHandle
// ---------------------------------------------------------------------------

/// A unique, opaque 64-bit identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct GameHandle(u64);

impl GameHandle {
    /// The "no handle" value. Never handed out by a [`HandleAllocator`].
    pub const NULL: GameHandle = GameHandle(0);

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Whether this is [`GameHandle::NULL`].
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for GameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "GameHandle(NULL)")
        } else {
            write!(f, "GameHandle({})", self.0)
        }
    }
}

impl fmt::Display for GameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// HandleAllocator
// ---------------------------------------------------------------------------

/// Hands out monotonically increasing, never-reused handles.
///
/// Handles are not recycled: a destroyed object's handle stays dead forever,
/// which is what makes [`Environment::exists`](crate::environment::Environment::exists)
/// a reliable staleness check.
#[derive(Debug, Clone)]
pub struct HandleAllocator {
    next: u64,
}

impl HandleAllocator {
    /// Create an allocator whose first handle is `1`.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate a fresh handle.
    pub fn allocate(&mut self) -> GameHandle {
        let handle = GameHandle(self.next);
        self.next += 1;
        handle
    }

    /// Make sure future allocations never collide with `handle`.
    ///
    /// Used when handles come from an external source (e.g. a loader that
    /// assigns its own ids).
    pub fn reserve(&mut self, handle: GameHandle) {
        if handle.0 >= self.next {
            self.next = handle.0 + 1;
        }
    }

    /// Number of handles allocated (or reserved past) so far.
    pub fn allocated_count(&self) -> u64 {
        self.next - 1
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_zero() {
        assert!(GameHandle::NULL.is_null());
        assert_eq!(GameHandle::NULL.to_raw(), 0);
        assert_eq!(GameHandle::default(), GameHandle::NULL);
    }

    #[test]
    fn allocator_never_returns_null() {
        let mut alloc = HandleAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(!a.is_null());
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn reserve_skips_external_handles() {
        let mut alloc = HandleAllocator::new();
        alloc.reserve(GameHandle::from_raw(41));
        assert_eq!(alloc.allocate(), GameHandle::from_raw(42));
        // Reserving something already passed is a no-op.
        alloc.reserve(GameHandle::from_raw(3));
        assert_eq!(alloc.allocate(), GameHandle::from_raw(43));
        assert_eq!(alloc.allocated_count(), 43);
    }

    #[test]
    fn debug_format() {
        assert_eq!(format!("{:?}", GameHandle::from_raw(7)), "GameHandle(7)");
        assert_eq!(format!("{:?}", GameHandle::NULL), "GameHandle(NULL)");
        assert_eq!(format!("{}", GameHandle::from_raw(7)), "#7");
    }
}
