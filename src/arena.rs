// Memory arena: a bump allocator over a caller-supplied range with
// marker/reset rollback.
//
// Grounded on this repository's `memory/arena.rs` and
// `memory/allocator/arena_allocator.rs` bump-pointer style, generalized from a
// `System`-backed chunk allocator to a fixed-range, host-or-device typed
// arena with an atomic `next_offset`.

use crate::common::MemoryDomain;
use crate::error::{PalError, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Bump allocator over `[start, start + size)`. `NextOffset` only moves forward
/// except via `reset_to_marker`.
#[derive(Debug)]
pub struct Arena {
    id: u64,
    kind: MemoryDomain,
    /// Host address of offset 0, meaningful only when `kind == Host`.
    host_base: usize,
    size: usize,
    next_offset: AtomicUsize,
}

/// Captures `(arena, offset)`. Resetting to a marker drops `NextOffset` back to
/// that value, invalidating every allocation made after the marker was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    arena_id: u64,
    offset: usize,
}

impl Arena {
    pub fn new(kind: MemoryDomain, host_base: usize, size: usize) -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            host_base,
            size,
            next_offset: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> MemoryDomain {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn next_offset(&self) -> usize {
        self.next_offset.load(Ordering::Relaxed)
    }

    /// Advance `NextOffset` to the next multiple of `alignment`, then by `size`.
    /// `alignment` must be a non-zero power of two.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<usize> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(PalError::InvalidArgument(format!(
                "alignment {alignment} is not a non-zero power of two"
            )));
        }
        let mut current = self.next_offset.load(Ordering::Relaxed);
        loop {
            let aligned = (current + alignment - 1) & !(alignment - 1);
            let new_offset = aligned
                .checked_add(size)
                .ok_or_else(|| PalError::ArenaExhausted { requested: size, available: 0 })?;
            if new_offset > self.size {
                return Err(PalError::ArenaExhausted {
                    requested: size,
                    available: self.size.saturating_sub(aligned),
                });
            }
            match self.next_offset.compare_exchange_weak(
                current,
                new_offset,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(aligned),
                Err(observed) => current = observed,
            }
        }
    }

    /// Host address corresponding to an offset previously returned by `allocate`.
    /// Only valid for host-typed arenas.
    pub fn host_address(&self, offset: usize) -> Result<usize> {
        if self.kind != MemoryDomain::Host {
            return Err(PalError::InvalidArgument(
                "host_address is only valid for host-typed arenas".into(),
            ));
        }
        Ok(self.host_base + offset)
    }

    pub fn mark(&self) -> Marker {
        Marker {
            arena_id: self.id,
            offset: self.next_offset.load(Ordering::Relaxed),
        }
    }

    /// Clamp `NextOffset` back to the marker's offset, invalidating later allocations.
    pub fn reset_to_marker(&self, marker: Marker) -> Result<()> {
        self.check_owner(marker)?;
        self.next_offset.store(marker.offset, Ordering::Relaxed);
        Ok(())
    }

    /// Host address the marker pointed at. Only valid for host-typed arenas.
    pub fn marker_to_host_address(&self, marker: Marker) -> Result<usize> {
        self.check_owner(marker)?;
        self.host_address(marker.offset)
    }

    /// `|m1.offset - m2.offset|`. Both markers must be from the same arena.
    pub fn marker_difference(m1: Marker, m2: Marker) -> Result<usize> {
        if m1.arena_id != m2.arena_id {
            return Err(PalError::InvalidArgument(
                "markers must be from the same arena".into(),
            ));
        }
        Ok(m1.offset.abs_diff(m2.offset))
    }

    fn check_owner(&self, marker: Marker) -> Result<()> {
        if marker.arena_id != self.id {
            return Err(PalError::InvalidArgument(
                "marker does not belong to this arena".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_respects_alignment_and_advances() {
        let arena = Arena::new(MemoryDomain::Host, 0x1000, 4096);
        let a = arena.allocate(10, 16).unwrap();
        assert_eq!(a % 16, 0);
        let b = arena.allocate(10, 16).unwrap();
        assert!(b >= a + 10);
        assert_eq!(b % 16, 0);
    }

    #[test]
    fn allocate_fails_past_max_offset() {
        let arena = Arena::new(MemoryDomain::Host, 0, 64);
        assert!(arena.allocate(32, 8).is_ok());
        assert!(arena.allocate(32, 8).is_ok());
        assert!(arena.allocate(1, 8).is_err());
    }

    #[test]
    fn allocate_rejects_non_power_of_two_alignment() {
        let arena = Arena::new(MemoryDomain::Host, 0, 64);
        assert!(arena.allocate(8, 3).is_err());
    }

    /// allocate*; mark; allocate*; reset leaves `next_offset == marker.offset`.
    #[test]
    fn reset_to_marker_restores_next_offset() {
        let arena = Arena::new(MemoryDomain::Host, 0, 4096);
        arena.allocate(64, 8).unwrap();
        let marker = arena.mark();
        arena.allocate(64, 8).unwrap();
        arena.allocate(128, 16).unwrap();
        arena.reset_to_marker(marker).unwrap();
        assert_eq!(arena.next_offset(), marker.offset);
    }

    #[test]
    fn marker_difference_requires_same_arena() {
        let a = Arena::new(MemoryDomain::Host, 0, 64);
        let b = Arena::new(MemoryDomain::Host, 0, 64);
        let ma = a.mark();
        let mb = b.mark();
        assert!(Arena::marker_difference(ma, mb).is_err());
    }

    #[test]
    fn device_arena_rejects_host_address() {
        let arena = Arena::new(MemoryDomain::Device, 0, 64);
        let offset = arena.allocate(8, 8).unwrap();
        assert!(arena.host_address(offset).is_err());
    }
}
