// Host memory primitives.
//
// Wraps the OS reserve/commit/decommit/release distinction behind a small
// `VirtualMemory` trait with `reserve`, `commit`, `decommit`, `release`, and
// `flush_icache`, with one implementation per platform selected by `cfg`.
// Grounded on this repository's own `memory/large_object.rs`
// (mmap/munmap/madvise) and `io/windows_iocp.rs` (windows-sys usage style,
// `cfg(windows)` / fallback split).

use crate::error::{PalError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Minimal hand-rolled bitflags macro. The corpus doesn't carry a `bitflags`
/// dependency for this crate; this keeps the same ergonomics without adding one.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn contains(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub const fn union(self, other: Self) -> Self {
                $name(self.0 | other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }
    };
}

bitflags_like! {
    /// Access flags requested for a host allocation.
    pub struct AccessFlags: u8 {
        const READ    = 0b0001;
        const WRITE   = 0b0010;
        const EXECUTE = 0b0100;
        /// Place a non-accessible guard page immediately after the committed range.
        const GUARD   = 0b1000;
    }
}

/// A reserved+partially-committed process address range.
#[derive(Debug)]
pub struct HostAllocation {
    /// Allocation-granularity aligned base address.
    base: usize,
    reserved: usize,
    committed: usize,
    flags: AccessFlags,
    /// Index of the pool record this allocation was produced from; `None` for
    /// allocations created directly via `VirtualMemory` rather than through a pool.
    pool_slot: Option<usize>,
}

impl HostAllocation {
    pub fn base_address(&self) -> usize {
        self.base
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed
    }

    pub fn flags(&self) -> AccessFlags {
        self.flags
    }

    /// # Safety
    /// Valid only while `committed_bytes()` covers the requested range.
    pub unsafe fn as_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }
}

/// OS-specific reserve/commit/decommit/release/flush-icache primitive.
pub trait VirtualMemory: Send + Sync {
    /// Allocation granularity (e.g. 64KiB on Windows, the page size elsewhere).
    fn allocation_granularity(&self) -> usize;
    /// OS page size.
    fn page_size(&self) -> usize;

    /// Reserve `reserve_size` bytes of address space and commit the first
    /// `commit_size` bytes under `flags`. Both sizes are rounded up by the
    /// caller (`HostAllocationPool::allocate`) before this is invoked.
    fn reserve_and_commit(
        &self,
        reserve_size: usize,
        commit_size: usize,
        flags: AccessFlags,
    ) -> Result<usize>;

    /// Increase the committed range of an existing reservation to `new_commit_size`
    /// total bytes. `new_commit_size` must be `<= reserve_size`.
    fn commit(&self, base: usize, new_commit_size: usize, flags: AccessFlags) -> Result<()>;

    /// Decommit the full committed range (physical pages returned to the OS,
    /// address space remains reserved).
    fn decommit(&self, base: usize, committed_size: usize) -> Result<()>;

    /// Decommit and free all address space for the reservation.
    fn release(&self, base: usize, reserved_size: usize) -> Result<()>;

    /// Instruction-cache-coherence barrier over a committed, executable range.
    fn flush_icache(&self, base: usize, size: usize);
}

pub fn round_up(value: usize, multiple: usize) -> usize {
    debug_assert!(multiple.is_power_of_two());
    (value + multiple - 1) & !(multiple - 1)
}

#[cfg(unix)]
mod platform {
    use super::*;

    #[derive(Clone, Copy)]
    pub struct UnixVirtualMemory {
        page_size: usize,
    }

    impl UnixVirtualMemory {
        pub fn new() -> Self {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            Self { page_size }
        }

        fn prot_flags(flags: AccessFlags) -> libc::c_int {
            let mut prot = 0;
            if flags.contains(AccessFlags::READ) {
                prot |= libc::PROT_READ;
            }
            if flags.contains(AccessFlags::WRITE) {
                prot |= libc::PROT_WRITE;
            }
            if flags.contains(AccessFlags::EXECUTE) {
                prot |= libc::PROT_EXEC;
            }
            prot
        }
    }

    impl Default for UnixVirtualMemory {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VirtualMemory for UnixVirtualMemory {
        fn allocation_granularity(&self) -> usize {
            self.page_size
        }

        fn page_size(&self) -> usize {
            self.page_size
        }

        fn reserve_and_commit(
            &self,
            reserve_size: usize,
            commit_size: usize,
            flags: AccessFlags,
        ) -> Result<usize> {
            debug_assert!(commit_size <= reserve_size);
            // Reserve as PROT_NONE so unrequested pages never fault in, then commit
            // the prefix with the requested protection, preserving the OS
            // reserve/commit distinction in the public contract.
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    reserve_size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                let reason = std::io::Error::last_os_error().to_string();
                warn!(reserve_size, %reason, "mmap reservation failed");
                return Err(PalError::HostAllocFailed { reason });
            }
            let base = base as usize;
            if commit_size > 0 {
                if let Err(e) = self.commit(base, commit_size, flags) {
                    unsafe {
                        libc::munmap(base as *mut libc::c_void, reserve_size);
                    }
                    return Err(e);
                }
            }
            debug!(base, reserve_size, commit_size, "reserved host allocation");
            Ok(base)
        }

        fn commit(&self, base: usize, new_commit_size: usize, flags: AccessFlags) -> Result<()> {
            let prot = Self::prot_flags(flags);
            let rc = unsafe {
                libc::mprotect(base as *mut libc::c_void, new_commit_size, prot)
            };
            if rc != 0 {
                let reason = std::io::Error::last_os_error().to_string();
                warn!(base, new_commit_size, %reason, "mprotect commit failed");
                return Err(PalError::HostAllocFailed { reason });
            }
            Ok(())
        }

        fn decommit(&self, base: usize, committed_size: usize) -> Result<()> {
            let rc = unsafe {
                libc::madvise(base as *mut libc::c_void, committed_size, libc::MADV_DONTNEED)
            };
            if rc != 0 {
                let reason = std::io::Error::last_os_error().to_string();
                return Err(PalError::HostAllocFailed { reason });
            }
            let rc = unsafe {
                libc::mprotect(base as *mut libc::c_void, committed_size, libc::PROT_NONE)
            };
            if rc != 0 {
                let reason = std::io::Error::last_os_error().to_string();
                return Err(PalError::HostAllocFailed { reason });
            }
            Ok(())
        }

        fn release(&self, base: usize, reserved_size: usize) -> Result<()> {
            let rc = unsafe { libc::munmap(base as *mut libc::c_void, reserved_size) };
            if rc != 0 {
                let reason = std::io::Error::last_os_error().to_string();
                return Err(PalError::HostAllocFailed { reason });
            }
            debug!(base, reserved_size, "released host allocation");
            Ok(())
        }

        fn flush_icache(&self, base: usize, size: usize) {
            #[cfg(target_arch = "aarch64")]
            unsafe {
                // __builtin___clear_cache equivalent; on x86_64 instruction fetch is
                // coherent with data stores so this is a no-op there.
                let start = base as *mut libc::c_char;
                let end = (base + size) as *mut libc::c_char;
                extern "C" {
                    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
                }
                __clear_cache(start, end);
            }
            #[cfg(not(target_arch = "aarch64"))]
            {
                let _ = (base, size);
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE,
        MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    };

    #[derive(Clone, Copy)]
    pub struct WindowsVirtualMemory {
        page_size: usize,
        allocation_granularity: usize,
    }

    impl WindowsVirtualMemory {
        pub fn new() -> Self {
            use windows_sys::Win32::System::SystemInformation::GetSystemInfo;
            use windows_sys::Win32::System::SystemInformation::SYSTEM_INFO;
            let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
            unsafe { GetSystemInfo(&mut info) };
            Self {
                page_size: info.dwPageSize as usize,
                allocation_granularity: info.dwAllocationGranularity as usize,
            }
        }

        fn page_protect(flags: AccessFlags) -> u32 {
            if flags.contains(AccessFlags::EXECUTE) {
                PAGE_EXECUTE_READWRITE
            } else if flags.contains(AccessFlags::WRITE) {
                PAGE_READWRITE
            } else if flags.contains(AccessFlags::READ) {
                PAGE_READONLY
            } else {
                PAGE_NOACCESS
            }
        }
    }

    impl Default for WindowsVirtualMemory {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VirtualMemory for WindowsVirtualMemory {
        fn allocation_granularity(&self) -> usize {
            self.allocation_granularity
        }

        fn page_size(&self) -> usize {
            self.page_size
        }

        fn reserve_and_commit(
            &self,
            reserve_size: usize,
            commit_size: usize,
            flags: AccessFlags,
        ) -> Result<usize> {
            let base = unsafe {
                VirtualAlloc(
                    std::ptr::null(),
                    reserve_size,
                    MEM_RESERVE,
                    PAGE_NOACCESS,
                )
            };
            if base.is_null() {
                let reason = std::io::Error::last_os_error().to_string();
                return Err(PalError::HostAllocFailed { reason });
            }
            let base = base as usize;
            if commit_size > 0 {
                if let Err(e) = self.commit(base, commit_size, flags) {
                    unsafe { VirtualFree(base as *mut _, 0, MEM_RELEASE) };
                    return Err(e);
                }
            }
            Ok(base)
        }

        fn commit(&self, base: usize, new_commit_size: usize, flags: AccessFlags) -> Result<()> {
            let protect = Self::page_protect(flags);
            let ptr = unsafe {
                VirtualAlloc(base as *const _, new_commit_size, MEM_COMMIT, protect)
            };
            if ptr.is_null() {
                let reason = std::io::Error::last_os_error().to_string();
                return Err(PalError::HostAllocFailed { reason });
            }
            Ok(())
        }

        fn decommit(&self, base: usize, committed_size: usize) -> Result<()> {
            let ok = unsafe { VirtualFree(base as *mut _, committed_size, MEM_DECOMMIT) };
            if ok == 0 {
                let reason = std::io::Error::last_os_error().to_string();
                return Err(PalError::HostAllocFailed { reason });
            }
            Ok(())
        }

        fn release(&self, base: usize, _reserved_size: usize) -> Result<()> {
            let ok = unsafe { VirtualFree(base as *mut _, 0, MEM_RELEASE) };
            if ok == 0 {
                let reason = std::io::Error::last_os_error().to_string();
                return Err(PalError::HostAllocFailed { reason });
            }
            Ok(())
        }

        fn flush_icache(&self, base: usize, size: usize) {
            unsafe {
                windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache(
                    windows_sys::Win32::System::Threading::GetCurrentProcess(),
                    base as *const _,
                    size,
                );
            }
        }
    }
}

pub use platform::*;

#[cfg(unix)]
pub fn default_virtual_memory() -> UnixVirtualMemory {
    UnixVirtualMemory::new()
}

#[cfg(windows)]
pub fn default_virtual_memory() -> WindowsVirtualMemory {
    WindowsVirtualMemory::new()
}

// ============================================================================
// Host-allocation pool
// ============================================================================

struct PoolRecord {
    allocation: Option<HostAllocation>,
    next_free: Option<usize>,
}

/// A fixed-capacity freelist of allocation records sharing a cap on total
/// committed bytes.
pub struct HostAllocationPool<V: VirtualMemory> {
    vm: V,
    records: Mutex<Vec<PoolRecord>>,
    free_head: Mutex<Option<usize>>,
    max_total_commitment: u64,
    min_commit_size: usize,
    total_committed: AtomicU64,
}

impl<V: VirtualMemory> HostAllocationPool<V> {
    pub fn new(vm: V, capacity: usize, max_total_commitment: u64, min_commit_size: usize) -> Self {
        let mut records = Vec::with_capacity(capacity);
        for i in 0..capacity {
            records.push(PoolRecord {
                allocation: None,
                next_free: if i + 1 < capacity { Some(i + 1) } else { None },
            });
        }
        Self {
            vm,
            records: Mutex::new(records),
            free_head: Mutex::new(if capacity > 0 { Some(0) } else { None }),
            max_total_commitment,
            min_commit_size,
            total_committed: AtomicU64::new(0),
        }
    }

    pub fn virtual_memory(&self) -> &V {
        &self.vm
    }

    pub fn total_committed(&self) -> u64 {
        self.total_committed.load(Ordering::Relaxed)
    }

    /// Take a record off the freelist and reserve+commit under the pool's caps.
    pub fn allocate(
        &self,
        reserve_size: usize,
        commit_size: usize,
        flags: AccessFlags,
    ) -> Result<usize> {
        let granularity = self.vm.allocation_granularity();
        let page = self.vm.page_size();
        let reserve_size = round_up(reserve_size, granularity);
        let commit_size = round_up(commit_size.max(self.min_commit_size), page);

        let new_total = self.total_committed.load(Ordering::Relaxed) + commit_size as u64;
        if new_total > self.max_total_commitment {
            return Err(PalError::PoolExhausted(format!(
                "commit of {commit_size} bytes would exceed MaxTotalCommitment ({})",
                self.max_total_commitment
            )));
        }

        let slot = {
            let mut head = self.free_head.lock();
            let slot = head.ok_or_else(|| PalError::PoolExhausted("no free allocation records".into()))?;
            let mut records = self.records.lock();
            *head = records[slot].next_free.take();
            slot
        };

        let base = match self.vm.reserve_and_commit(reserve_size, commit_size, flags) {
            Ok(base) => base,
            Err(e) => {
                let mut head = self.free_head.lock();
                let mut records = self.records.lock();
                records[slot].next_free = *head;
                *head = Some(slot);
                return Err(e);
            }
        };

        self.total_committed.fetch_add(commit_size as u64, Ordering::Relaxed);
        let mut records = self.records.lock();
        records[slot].allocation = Some(HostAllocation {
            base,
            reserved: reserve_size,
            committed: commit_size,
            flags,
            pool_slot: Some(slot),
        });
        Ok(slot)
    }

    /// Increase the total commitment of an active allocation.
    pub fn increase_commitment(&self, slot: usize, new_total: usize) -> Result<()> {
        let page = self.vm.page_size();
        let new_total = round_up(new_total, page);
        let mut records = self.records.lock();
        let alloc = records[slot]
            .allocation
            .as_mut()
            .ok_or_else(|| PalError::InvalidArgument("slot not active".into()))?;
        if new_total <= alloc.committed {
            return Ok(());
        }
        if new_total > alloc.reserved {
            return Err(PalError::InvalidArgument(
                "commitment cannot exceed reservation".into(),
            ));
        }
        let delta = (new_total - alloc.committed) as u64;
        let new_grand_total = self.total_committed.load(Ordering::Relaxed) + delta;
        if new_grand_total > self.max_total_commitment {
            return Err(PalError::PoolExhausted(
                "commit increase would exceed MaxTotalCommitment".into(),
            ));
        }
        self.vm.commit(alloc.base, new_total, alloc.flags)?;
        alloc.committed = new_total;
        self.total_committed.fetch_add(delta, Ordering::Relaxed);
        Ok(())
    }

    /// Return a record to the freelist and decommit/release its range.
    pub fn release(&self, slot: usize) -> Result<()> {
        let mut records = self.records.lock();
        let alloc = records[slot]
            .allocation
            .take()
            .ok_or_else(|| PalError::InvalidArgument("slot not active".into()))?;
        self.vm.release(alloc.base, alloc.reserved)?;
        self.total_committed.fetch_sub(alloc.committed as u64, Ordering::Relaxed);
        let mut head = self.free_head.lock();
        records[slot].next_free = *head;
        *head = Some(slot);
        Ok(())
    }

    /// Release every active allocation and rewind the freelist.
    pub fn reset(&self) -> Result<()> {
        let active: Vec<usize> = {
            let records = self.records.lock();
            records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.allocation.is_some())
                .map(|(i, _)| i)
                .collect()
        };
        for slot in active {
            self.release(slot)?;
        }
        Ok(())
    }

    pub fn with_allocation<R>(&self, slot: usize, f: impl FnOnce(&HostAllocation) -> R) -> Option<R> {
        let records = self.records.lock();
        records[slot].allocation.as_ref().map(f)
    }

    /// Flush instruction cache for an executable allocation.
    pub fn flush_icache(&self, slot: usize) {
        let records = self.records.lock();
        if let Some(alloc) = &records[slot].allocation {
            self.vm.flush_icache(alloc.base, alloc.committed);
        }
    }
}
