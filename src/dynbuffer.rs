// Dynamic buffer: a growable typed array over a reserve/commit region.
//
// A growable typed array over a single reserved virtual-memory range: `ensure`
// grows the committed prefix in quantum-sized steps, `shrink` decommits the
// unused suffix, `append`/`truncate`/`resize` move the logical element count
// without touching committed pages beyond what `ensure` already guarantees.
// Grounded on this repository's `memory/large_object.rs` reserve/commit split,
// reused here through the `vm::HostAllocationPool` single-slot case.

use crate::error::{PalError, Result};
use crate::vm::{round_up, AccessFlags, VirtualMemory};

/// Growable array of fixed-size elements over one reserved address range.
#[derive(Debug)]
pub struct DynamicBuffer<V: VirtualMemory> {
    vm: V,
    base: usize,
    element_size: usize,
    element_count_max: usize,
    growth_quantum_elements: usize,
    capacity_elements: usize,
    count: usize,
}

impl<V: VirtualMemory> DynamicBuffer<V> {
    /// Reserves `element_size * element_count_max` bytes (rounded to the
    /// allocation granularity) without committing anything.
    pub fn new(
        vm: V,
        element_size: usize,
        element_count_max: usize,
        growth_quantum_elements: usize,
    ) -> Result<Self> {
        if element_size == 0 {
            return Err(PalError::InvalidArgument("element_size must be non-zero".into()));
        }
        if growth_quantum_elements == 0 {
            return Err(PalError::InvalidArgument(
                "growth_quantum_elements must be non-zero".into(),
            ));
        }
        let granularity = vm.allocation_granularity();
        let reserve_size = round_up(element_size * element_count_max, granularity);
        let base = vm.reserve_and_commit(reserve_size, 0, AccessFlags::READ | AccessFlags::WRITE)?;
        Ok(Self {
            vm,
            base,
            element_size,
            element_count_max,
            growth_quantum_elements,
            capacity_elements: 0,
            count: 0,
        })
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity_elements(&self) -> usize {
        self.capacity_elements
    }

    pub fn begin_address(&self) -> usize {
        self.base
    }

    pub fn end_address(&self) -> usize {
        self.base + self.count * self.element_size
    }

    pub fn element_address(&self, index: usize) -> Result<usize> {
        if index >= self.count {
            return Err(PalError::InvalidArgument(format!(
                "index {index} out of range (count {})",
                self.count
            )));
        }
        Ok(self.base + index * self.element_size)
    }

    /// Grow committed capacity, in `growth_quantum_elements`-sized steps, until
    /// `capacity_elements >= requested`.
    pub fn ensure(&mut self, requested: usize) -> Result<()> {
        if requested > self.element_count_max {
            return Err(PalError::BufferExhausted {
                requested,
                max: self.element_count_max,
            });
        }
        if requested <= self.capacity_elements {
            return Ok(());
        }
        let quantum = self.growth_quantum_elements;
        let new_capacity = round_up(requested, quantum).min(self.element_count_max);
        let commit_bytes = round_up(new_capacity * self.element_size, self.vm.page_size());
        self.vm.commit(self.base, commit_bytes, AccessFlags::READ | AccessFlags::WRITE)?;
        self.capacity_elements = commit_bytes / self.element_size;
        Ok(())
    }

    /// Decommit every page beyond the end of the currently used range.
    pub fn shrink(&mut self) -> Result<()> {
        let used_bytes = round_up(self.count * self.element_size, self.vm.page_size());
        let committed_bytes = self.capacity_elements * self.element_size;
        if committed_bytes <= used_bytes {
            return Ok(());
        }
        let tail_base = self.base + used_bytes;
        let tail_size = committed_bytes - used_bytes;
        self.vm.decommit(tail_base, tail_size)?;
        self.capacity_elements = used_bytes / self.element_size;
        Ok(())
    }

    pub fn resize(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.count = n;
        Ok(())
    }

    /// Copy `element_count` elements of `element_size` bytes each from `src`
    /// to the buffer's tail, then advance the logical count.
    pub fn append(&mut self, src: &[u8], element_count: usize, element_size: usize) -> Result<()> {
        if element_size != self.element_size {
            return Err(PalError::InvalidArgument(format!(
                "append element_size {element_size} does not match buffer element_size {}",
                self.element_size
            )));
        }
        let byte_len = element_count
            .checked_mul(element_size)
            .ok_or_else(|| PalError::InvalidArgument("element_count * element_size overflow".into()))?;
        if src.len() < byte_len {
            return Err(PalError::InvalidArgument(
                "src shorter than element_count * element_size".into(),
            ));
        }
        let new_count = self.count + element_count;
        self.ensure(new_count)?;
        let dst_offset = self.count * self.element_size;
        unsafe {
            let dst = (self.base + dst_offset) as *mut u8;
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, byte_len);
        }
        self.count = new_count;
        Ok(())
    }

    /// Decrease the logical count without decommitting anything.
    pub fn truncate(&mut self, n: usize) -> Result<()> {
        if n > self.count {
            return Err(PalError::InvalidArgument(format!(
                "truncate target {n} exceeds current count {}",
                self.count
            )));
        }
        self.count = n;
        Ok(())
    }
}

impl<V: VirtualMemory> Drop for DynamicBuffer<V> {
    fn drop(&mut self) {
        let reserve_size = round_up(self.element_size * self.element_count_max, self.vm.allocation_granularity());
        let _ = self.vm.release(self.base, reserve_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::default_virtual_memory;

    fn buffer() -> DynamicBuffer<impl VirtualMemory> {
        DynamicBuffer::new(default_virtual_memory(), 8, 1 << 16, 64).unwrap()
    }

    #[test]
    fn ensure_grows_in_quantum_steps() {
        let mut b = buffer();
        b.ensure(10).unwrap();
        assert!(b.capacity_elements() >= 10);
        assert_eq!(b.capacity_elements() % 64, 0);
    }

    #[test]
    fn ensure_past_max_fails() {
        let mut b = buffer();
        assert!(b.ensure((1 << 16) + 1).is_err());
    }

    #[test]
    fn append_advances_count_and_copies_bytes() {
        let mut b = buffer();
        let data: [u64; 4] = [1, 2, 3, 4];
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(&data))
        };
        b.append(bytes, 4, 8).unwrap();
        assert_eq!(b.count(), 4);
        let addr = b.element_address(2).unwrap();
        let value = unsafe { *(addr as *const u64) };
        assert_eq!(value, 3);
    }

    #[test]
    fn append_rejects_mismatched_element_size() {
        let mut b = buffer();
        let data = [0u8; 16];
        assert!(b.append(&data, 2, 4).is_err());
    }

    #[test]
    fn truncate_rejects_growth() {
        let mut b = buffer();
        b.resize(4).unwrap();
        assert!(b.truncate(5).is_err());
        b.truncate(1).unwrap();
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn resize_then_shrink_decommits_tail() {
        let mut b = buffer();
        b.resize(1000).unwrap();
        let grown = b.capacity_elements();
        b.truncate(1).unwrap();
        b.shrink().unwrap();
        assert!(b.capacity_elements() < grown);
    }
}
