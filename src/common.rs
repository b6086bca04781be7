// Small cross-cutting types shared by the allocator family.
//
// `MemoryDomain` is the host/device tag carried on arenas and block
// descriptors; device (GPU) memory allocation beyond the enum tag itself is
// out of scope for this crate.

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemoryDomain {
    Host,
    Device,
}

/// Emitted by every successful allocator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockDescriptor {
    pub size: usize,
    pub offset: usize,
    /// `None` for device allocations; `Some` for host allocations.
    pub host_address: Option<usize>,
    pub domain: MemoryDomain,
    pub tag: u32,
}
