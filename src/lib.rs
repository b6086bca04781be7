// Platform abstraction layer: host virtual memory, the arena/buddy/buffer
// allocator family, the generation-tagged handle table, and the
// work-stealing fork-join task scheduler built on top of them.

pub mod arena;
pub mod buddy;
pub mod common;
pub mod dynbuffer;
pub mod error;
pub mod handle;
pub mod layout;
pub mod scheduler;
pub mod task;
pub mod task_pool;
pub mod vm;

pub use arena::{Arena, Marker};
pub use buddy::BuddyAllocator;
pub use common::{BlockDescriptor, MemoryDomain};
pub use dynbuffer::DynamicBuffer;
pub use error::{HandleInvalidReason, PalError, Result};
pub use handle::{ChunkInfo, ChunkIter, Handle, HandleTable, TableFlags};
pub use layout::{MemoryLayout, View, MAX_STREAMS};
pub use scheduler::{
    PoolFlags, PoolKind, PoolTypeDescriptor, SchedulerConfig, TaskScheduler, WorkerInit,
};
pub use task::{
    CompletionType, TaskComplete, TaskDescriptor, TaskFlags, TaskId, TaskMain,
    MAX_PERMITS_PER_TASK, NO_PERMITS_LIST, PERMITS_LIST_CAPACITY,
};
pub use task_pool::{
    TaskPool, PERMITS_LIST_COUNT, SLOTS_PER_TASK_POOL, TASK_CHUNK_COUNT, TASK_CHUNK_SLOTS,
};
pub use vm::{
    default_virtual_memory, round_up, AccessFlags, HostAllocation, HostAllocationPool,
    VirtualMemory,
};
