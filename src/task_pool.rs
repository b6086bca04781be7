// Per-thread task storage: slot arena, free ring, ready-to-run deque, and
// wake mailbox.
//
// The ready deque is a Chase-Lev single-owner/multi-stealer deque grounded
// on this repository's `concurrent/work_stealing.rs` (`WorkStealingDeque`),
// narrowed from that module's growable buffer to a fixed 65536-entry array
// and renamed to this crate's own `ReadyPrivatePos`/`ReadyPublicPos`
// terminology; the orderings are release on push/bottom-store, acquire on
// steal/top-load, seq-cst on the emptiness-race CAS.
//
// The free ring is grounded on `io/ring_buffer.rs`'s lock-free ring buffer,
// narrowed to a fixed MPSC shape: one ring for task slots (capacity 65536)
// and one for permits-list records (capacity 1024), both built from the same
// `FreeRing` type since the protocol is identical up to capacity.
//
// Task closures (`main`/`complete`) are `Option<Box<dyn FnOnce>>`, which
// cannot be placed in raw VM-committed pages without unsafe placement-new
// and no compile-time drop safety, so the per-slot bookkeeping
// (`TaskBookkeeping`) lives in ordinary Rust allocations rather than inside
// the VM-backed region itself. It is still committed lazily in
// `TASK_CHUNK_SLOTS`-sized chunks, the same chunk-of-slots shape
// `handle.rs` uses for its `dense`/`state` payload: the outer `Vec<Option<
// Chunk>>` is pre-sized to `TASK_CHUNK_COUNT` cheap `None` placeholders, and
// each chunk's `Box<[TaskBookkeeping]>` (and its backing `HostAllocationPool`
// slot, used only to gate the commit count against `MaxTotalCommitment`) is
// allocated on first use. A chunk's `Box` never moves or frees for the
// pool's lifetime, so a slot reference taken from it stays valid across the
// `chunk_commit` lock. See `DESIGN.md` "Open Question Decisions".

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::{PalError, Result};
use crate::task::{
    CompletionType, TaskComplete, TaskDescriptor, TaskFlags, TaskId, TaskMain,
    MAX_PERMITS_PER_TASK, NO_PERMITS_LIST, PERMITS_LIST_CAPACITY,
};
use crate::vm::{AccessFlags, HostAllocationPool, VirtualMemory};

pub const SLOTS_PER_TASK_POOL: usize = 65536;
pub const TASK_CHUNK_SLOTS: usize = 1024;
pub const TASK_CHUNK_COUNT: usize = SLOTS_PER_TASK_POOL / TASK_CHUNK_SLOTS;
pub const PERMITS_LIST_COUNT: usize = 1024;

// ============================================================================
// FreeRing: MPSC ring of packed (slot_index<<16|generation)-style u32s.
// Shared shape for the task-slot free ring (capacity 65536) and the
// permits-list free ring (capacity 1024).
// ============================================================================

struct FreeRing {
    entries: Box<[UnsafeCell<u32>]>,
    mask: u64,
    /// Owner-visible republished count ("AllocCount").
    alloc_count: AtomicU64,
    /// Owner-only extraction cursor ("AllocNext"); kept atomic only so the
    /// type remains `Sync` for sharing behind `Arc`, not because more than
    /// one thread writes it.
    alloc_next: AtomicU64,
    /// Producer cursor, CAS-advanced by any completing thread ("FreeCount").
    free_count: AtomicU64,
}

unsafe impl Sync for FreeRing {}
unsafe impl Send for FreeRing {}

impl FreeRing {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let entries = (0..capacity)
            .map(|_| UnsafeCell::new(0u32))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            entries,
            mask: (capacity - 1) as u64,
            alloc_count: AtomicU64::new(0),
            alloc_next: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
        }
    }

    /// Owner-thread-only: append freshly committed entries directly, as if
    /// they had just been freed. Used when a new 1024-slot chunk is committed.
    fn seed(&self, values: impl Iterator<Item = u32>) {
        for v in values {
            let pos = self.free_count.load(Ordering::Relaxed);
            unsafe {
                *self.entries[(pos & self.mask) as usize].get() = v;
            }
            self.free_count.store(pos + 1, Ordering::Release);
        }
    }

    /// Any completing thread: push one freed entry by writing the packed
    /// value at the free-count cursor, then CAS-advancing it.
    fn push(&self, packed: u32) {
        loop {
            let pos = self.free_count.load(Ordering::Relaxed);
            unsafe {
                *self.entries[(pos & self.mask) as usize].get() = packed;
            }
            if self
                .free_count
                .compare_exchange_weak(pos, pos + 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Owner thread only: take one entry, republishing from `free_count`
    /// into `alloc_count` if the owner has drained its previously claimed
    /// range: when the owner has drained its previously claimed range, it
    /// atomically swaps `alloc_count <- free_count`.
    fn pop(&self) -> Option<u32> {
        let next = self.alloc_next.load(Ordering::Relaxed);
        let mut count = self.alloc_count.load(Ordering::Acquire);
        if next == count {
            let free = self.free_count.load(Ordering::Acquire);
            if free == count {
                return None;
            }
            self.alloc_count.store(free, Ordering::Release);
            count = free;
        }
        debug_assert!(next < count);
        let value = unsafe { *self.entries[(next & self.mask) as usize].get() };
        self.alloc_next.store(next + 1, Ordering::Relaxed);
        Some(value)
    }
}

// ============================================================================
// ReadyDeque: Chase-Lev single-owner/multi-stealer deque of TaskId.
// ============================================================================

struct ReadyDeque {
    entries: Box<[UnsafeCell<u32>]>,
    mask: i64,
    /// `ReadyPrivatePos` (bottom): owner push/take.
    private_pos: AtomicI64,
    /// `ReadyPublicPos` (top): stealer take.
    public_pos: AtomicI64,
}

unsafe impl Sync for ReadyDeque {}
unsafe impl Send for ReadyDeque {}

impl ReadyDeque {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let entries = (0..capacity)
            .map(|_| UnsafeCell::new(0u32))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            entries,
            mask: (capacity - 1) as i64,
            private_pos: AtomicI64::new(0),
            public_pos: AtomicI64::new(0),
        }
    }

    /// Owner push.
    fn push(&self, id: TaskId) {
        let pos = self.private_pos.load(Ordering::Relaxed);
        unsafe {
            *self.entries[(pos & self.mask) as usize].get() = id.raw();
        }
        // Release: the write above must be visible before a stealer can
        // observe the new bottom.
        self.private_pos.store(pos + 1, Ordering::Release);
    }

    /// Owner take, from the bottom. Races a concurrent stealer only when
    /// exactly one item remains.
    fn take(&self) -> Option<TaskId> {
        let pos = self.private_pos.load(Ordering::Relaxed);
        let new_pos = pos - 1;
        self.private_pos.store(new_pos, Ordering::Relaxed);
        // Seq-cst fence: this store must be visible to stealers before we
        // read `public_pos`, and vice versa -- the standard Chase-Lev
        // emptiness race guard.
        fence(Ordering::SeqCst);
        let top = self.public_pos.load(Ordering::Relaxed);
        if top > new_pos {
            // Deque was already empty; restore bottom.
            self.private_pos.store(pos, Ordering::Relaxed);
            return None;
        }
        let value = unsafe { *self.entries[(new_pos & self.mask) as usize].get() };
        if top == new_pos {
            // Last element: race a stealer for it.
            if self
                .public_pos
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                self.private_pos.store(pos, Ordering::Relaxed);
                return None;
            }
            self.private_pos.store(new_pos + 1, Ordering::Relaxed);
        }
        Some(TaskId::from_raw(value))
    }

    /// Stealer take, from the top.
    fn steal(&self) -> Option<TaskId> {
        let top = self.public_pos.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let pos = self.private_pos.load(Ordering::Acquire);
        if top >= pos {
            return None;
        }
        let value = unsafe { *self.entries[(top & self.mask) as usize].get() };
        if self
            .public_pos
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Some(TaskId::from_raw(value))
        } else {
            None
        }
    }

    fn approx_len(&self) -> i64 {
        (self.private_pos.load(Ordering::Relaxed) - self.public_pos.load(Ordering::Relaxed)).max(0)
    }
}

// ============================================================================
// ParkSemaphore: a per-pool blocking wait/post primitive the owner thread
// parks on between steal attempts.
// ============================================================================

pub(crate) struct ParkSemaphore {
    permits: Mutex<u32>,
    cond: Condvar,
}

impl ParkSemaphore {
    fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

    pub(crate) fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cond.notify_one();
    }
}

// ============================================================================
// Per-slot bookkeeping: work_count, state_tag, permits.
// ============================================================================

/// `state_tag` packs completion/cancellation/generation/permit-refcount per
/// Only the completion bit is used here; cancellation and priority classes
/// are out of scope for this crate, so the remaining bits are reserved.
const STATE_COMPLETE_BIT: u32 = 1 << 0;

struct TaskBookkeeping {
    main: UnsafeCell<Option<TaskMain>>,
    complete: UnsafeCell<Option<TaskComplete>>,
    task_id: UnsafeCell<TaskId>,
    parent_id: UnsafeCell<Option<TaskId>>,
    completion_type: UnsafeCell<CompletionType>,
    flags: UnsafeCell<TaskFlags>,
    /// Self (1) plus one per published child; completion fires at zero.
    work_count: AtomicI64,
    state_tag: AtomicU32,
    generation: AtomicU8,
    /// Packed `(pool_index << 16) | permits_list_slot` pointers;
    /// `NO_PERMITS_LIST` marks an empty entry.
    permits: UnsafeCell<[u32; MAX_PERMITS_PER_TASK]>,
    permits_len: AtomicU8,
}

unsafe impl Sync for TaskBookkeeping {}

impl TaskBookkeeping {
    fn new() -> Self {
        Self {
            main: UnsafeCell::new(None),
            complete: UnsafeCell::new(None),
            task_id: UnsafeCell::new(TaskId::invalid()),
            parent_id: UnsafeCell::new(None),
            completion_type: UnsafeCell::new(CompletionType::Automatic),
            flags: UnsafeCell::new(TaskFlags::NONE),
            work_count: AtomicI64::new(0),
            state_tag: AtomicU32::new(0),
            generation: AtomicU8::new(0),
            permits: UnsafeCell::new([NO_PERMITS_LIST; MAX_PERMITS_PER_TASK]),
            permits_len: AtomicU8::new(0),
        }
    }
}

fn decode_permits_key(key: u32) -> (usize, u16) {
    ((key >> 16) as usize, (key & 0xFFFF) as u16)
}

fn encode_permits_key(pool_index: usize, slot: u16) -> u32 {
    ((pool_index as u32) << 16) | slot as u32
}

/// A permits-list record: a wait set released in one shot when `wait_count`
/// reaches zero.
struct PermitsList {
    tasks: UnsafeCell<[TaskId; PERMITS_LIST_CAPACITY]>,
    len: UnsafeCell<u8>,
    wait_count: AtomicU32,
}

unsafe impl Sync for PermitsList {}

impl PermitsList {
    fn new() -> Self {
        Self {
            tasks: UnsafeCell::new([TaskId::invalid(); PERMITS_LIST_CAPACITY]),
            len: UnsafeCell::new(0),
            wait_count: AtomicU32::new(0),
        }
    }
}

/// One committed chunk's slot storage: `TASK_CHUNK_SLOTS` bookkeeping
/// entries, boxed so the allocation's address is stable for the pool's
/// lifetime regardless of how the owning `Vec<Option<Chunk>>` reallocates.
struct Chunk {
    pool_slot: usize,
    slots: Box<[TaskBookkeeping]>,
}

/// Per-thread slot arena, ready-deque, free-ring, and wake mailbox
pub struct TaskPool<V: VirtualMemory> {
    pool_index: usize,
    host_pool: HostAllocationPool<V>,
    chunk_commit: Mutex<Vec<Option<Chunk>>>,
    committed_chunks: AtomicU32,
    free_ring: FreeRing,
    permits: Box<[PermitsList]>,
    permits_free: FreeRing,
    ready: ReadyDeque,
    wakeup_task_id: AtomicU32,
    park: ParkSemaphore,
    bound_thread: Mutex<Option<std::thread::ThreadId>>,
}

impl<V: VirtualMemory> TaskPool<V> {
    pub fn new(vm: V, pool_index: usize, pre_commit_tasks: usize) -> Result<Self> {
        if pool_index > u8::MAX as usize {
            return Err(PalError::InvalidArgument("pool index exceeds 8 bits".into()));
        }
        let chunk_bytes = TASK_CHUNK_SLOTS * std::mem::size_of::<TaskBookkeeping>();
        let host_pool = HostAllocationPool::new(vm, TASK_CHUNK_COUNT, u64::MAX, chunk_bytes);

        let permits = (0..PERMITS_LIST_COUNT)
            .map(|_| PermitsList::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let pool = Self {
            pool_index,
            host_pool,
            chunk_commit: Mutex::new((0..TASK_CHUNK_COUNT).map(|_| None).collect()),
            committed_chunks: AtomicU32::new(0),
            free_ring: FreeRing::new(SLOTS_PER_TASK_POOL),
            permits,
            permits_free: FreeRing::new(PERMITS_LIST_COUNT),
            ready: ReadyDeque::new(SLOTS_PER_TASK_POOL),
            wakeup_task_id: AtomicU32::new(0),
            park: ParkSemaphore::new(),
            bound_thread: Mutex::new(None),
        };

        pool.permits_free
            .seed((0..PERMITS_LIST_COUNT as u32).map(|i| i));

        let initial_chunks = pre_commit_tasks.div_ceil(TASK_CHUNK_SLOTS).min(TASK_CHUNK_COUNT);
        for _ in 0..initial_chunks {
            pool.commit_next_chunk()?;
        }
        Ok(pool)
    }

    pub fn pool_index(&self) -> usize {
        self.pool_index
    }

    /// Record the calling OS thread as this pool's current owner, for
    /// diagnostics only; this does not enforce exclusivity.
    pub fn bind(&self) {
        *self.bound_thread.lock() = Some(std::thread::current().id());
    }

    pub fn unbind(&self) {
        *self.bound_thread.lock() = None;
    }

    /// Number of `TASK_CHUNK_SLOTS`-sized chunks actually committed so far.
    pub(crate) fn committed_chunk_count(&self) -> u32 {
        self.committed_chunks.load(Ordering::Acquire)
    }

    fn commit_next_chunk(&self) -> Result<bool> {
        let mut commit = self.chunk_commit.lock();
        let c = match commit.iter().position(|slot| slot.is_none()) {
            Some(c) => c,
            None => return Ok(false),
        };
        let chunk_bytes = TASK_CHUNK_SLOTS * std::mem::size_of::<TaskBookkeeping>();
        let pool_slot = self.host_pool.allocate(
            chunk_bytes,
            chunk_bytes,
            AccessFlags::READ | AccessFlags::WRITE,
        )?;
        let slots = (0..TASK_CHUNK_SLOTS)
            .map(|_| TaskBookkeeping::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        commit[c] = Some(Chunk { pool_slot, slots });
        drop(commit);
        self.committed_chunks.fetch_add(1, Ordering::Release);

        let base = c * TASK_CHUNK_SLOTS;
        self.free_ring.seed((0..TASK_CHUNK_SLOTS as u32).map(|i| {
            let slot = base as u32 + i;
            let generation = self.slot(slot as u16).generation.load(Ordering::Relaxed);
            (slot << 4) | generation as u32
        }));
        Ok(true)
    }

    /// Resolve a global slot index to its bookkeeping entry. The chunk
    /// holding `idx` must already be committed — every caller reaches a
    /// slot only via an id minted by `claim_slot`, which never hands out an
    /// index outside a chunk it just committed.
    fn slot(&self, idx: u16) -> &TaskBookkeeping {
        let chunk_idx = idx as usize / TASK_CHUNK_SLOTS;
        let offset = idx as usize % TASK_CHUNK_SLOTS;
        let commit = self.chunk_commit.lock();
        let chunk = commit[chunk_idx]
            .as_ref()
            .expect("slot index refers to an uncommitted chunk");
        let ptr: *const TaskBookkeeping = &chunk.slots[offset];
        drop(commit);
        // SAFETY: a chunk's `slots` boxed allocation is created once in
        // `commit_next_chunk` and never moved or freed while the pool
        // lives, so this pointer stays valid after the lock is released.
        unsafe { &*ptr }
    }

    /// Owner-thread-only: claim a free slot, committing a new chunk if the
    /// ring is empty and fewer than 64 chunks are committed.
    fn claim_slot(&self) -> Result<(u16, u8)> {
        loop {
            if let Some(packed) = self.free_ring.pop() {
                let slot = (packed >> 4) as u16;
                let generation = (packed & 0xF) as u8;
                return Ok((slot, generation));
            }
            if self.committed_chunks.load(Ordering::Acquire) as usize >= TASK_CHUNK_COUNT {
                return Err(PalError::PoolExhausted(
                    "task pool has committed all 64 chunks (65536 slots)".into(),
                ));
            }
            self.commit_next_chunk()?;
        }
    }

    /// Create a task slot from `descriptor`; returns its id. The slot is
    /// not runnable until `TaskScheduler::publish`.
    pub fn create_task(&self, descriptor: TaskDescriptor) -> Result<TaskId> {
        let (slot, generation) = self.claim_slot()?;
        let id = TaskId::pack(self.pool_index as u8, slot, generation);
        let bk = self.slot(slot);
        unsafe {
            *bk.main.get() = Some(descriptor.main);
            *bk.complete.get() = descriptor.complete;
            *bk.task_id.get() = id;
            *bk.parent_id.get() = descriptor.parent_id;
            *bk.completion_type.get() = descriptor.completion_type;
            *bk.flags.get() = descriptor.flags;
            *bk.permits.get() = [NO_PERMITS_LIST; MAX_PERMITS_PER_TASK];
        }
        bk.permits_len.store(0, Ordering::Relaxed);
        bk.work_count.store(1, Ordering::Relaxed);
        bk.state_tag.store(0, Ordering::Relaxed);
        Ok(id)
    }

    pub(crate) fn completion_type(&self, id: TaskId) -> CompletionType {
        unsafe { *self.slot(id.slot()).completion_type.get() }
    }

    pub(crate) fn parent_id(&self, id: TaskId) -> Option<TaskId> {
        unsafe { *self.slot(id.slot()).parent_id.get() }
    }

    /// Take and run `main_fn`. Only the owning thread calls this, once per
    /// task's lifetime (function-call granularity, not preemptible).
    pub(crate) fn run_main(&self, id: TaskId) {
        let bk = self.slot(id.slot());
        let f = unsafe { (*bk.main.get()).take() };
        if let Some(f) = f {
            f(id);
        }
    }

    pub(crate) fn run_complete_callback(&self, id: TaskId) {
        let bk = self.slot(id.slot());
        let f = unsafe { (*bk.complete.get()).take() };
        if let Some(f) = f {
            f(id);
        }
    }

    /// Atomic fetch-sub on `work_count`; returns the post-decrement value.
    pub(crate) fn decrement_work_count(&self, id: TaskId, by: i64) -> i64 {
        self.slot(id.slot())
            .work_count
            .fetch_sub(by, Ordering::AcqRel)
            - by
    }

    pub(crate) fn increment_work_count(&self, id: TaskId) {
        self.slot(id.slot())
            .work_count
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Mark a slot's current occupant complete. Paired with `is_complete`'s
    /// generation check so a later publish against a stale id never reads a
    /// since-recycled slot's bit as "this id is complete".
    pub(crate) fn mark_complete(&self, id: TaskId) {
        self.slot(id.slot())
            .state_tag
            .fetch_or(STATE_COMPLETE_BIT, Ordering::Release);
    }

    /// True if `id`'s task has finished (or its slot has since been freed
    /// and recycled, which can only happen after it finished).
    pub(crate) fn is_complete(&self, id: TaskId) -> bool {
        let bk = self.slot(id.slot());
        if bk.generation.load(Ordering::Acquire) != id.generation() {
            return true;
        }
        bk.state_tag.load(Ordering::Acquire) & STATE_COMPLETE_BIT != 0
    }

    /// Allocate a permits-list record from this pool's 1024-slot region.
    pub(crate) fn alloc_permits_list(&self) -> Result<u16> {
        self.permits_free
            .pop()
            .map(|v| v as u16)
            .ok_or_else(|| PalError::PoolExhausted("permits-list region exhausted".into()))
    }

    pub(crate) fn free_permits_list(&self, index: u16) {
        let list = &self.permits[index as usize];
        unsafe {
            *list.len.get() = 0;
        }
        list.wait_count.store(0, Ordering::Relaxed);
        self.permits_free.push(index as u32);
    }

    pub(crate) fn permits_list_init(&self, index: u16, waiters: &[TaskId]) {
        let list = &self.permits[index as usize];
        unsafe {
            let tasks = &mut *list.tasks.get();
            for (slot, &w) in tasks.iter_mut().zip(waiters) {
                *slot = w;
            }
            *list.len.get() = waiters.len() as u8;
        }
        list.wait_count.store(waiters.len() as u32, Ordering::Release);
    }

    /// Decrement a permits list's wait count; if it reaches zero, returns
    /// the tasks it held (the caller wakes each one).
    pub(crate) fn permits_list_release_one(&self, index: u16) -> Option<Vec<TaskId>> {
        let list = &self.permits[index as usize];
        if list.wait_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }
        let tasks = unsafe {
            let len = *list.len.get() as usize;
            (*list.tasks.get())[..len].to_vec()
        };
        self.free_permits_list(index);
        Some(tasks)
    }

    /// Append a permits-list pointer (`owner_pool_index`, its local slot) to
    /// a dependency's bookkeeping while publishing a dependent task.
    pub(crate) fn push_permits_pointer(
        &self,
        id: TaskId,
        owner_pool_index: usize,
        permits_slot: u16,
    ) -> Result<()> {
        let bk = self.slot(id.slot());
        let len = bk.permits_len.load(Ordering::Relaxed) as usize;
        if len >= MAX_PERMITS_PER_TASK {
            return Err(PalError::InvalidArgument(
                "task already holds the maximum 15 permits-list pointers".into(),
            ));
        }
        unsafe {
            (*bk.permits.get())[len] = encode_permits_key(owner_pool_index, permits_slot);
        }
        bk.permits_len.store((len + 1) as u8, Ordering::Relaxed);
        Ok(())
    }

    /// The `(owner_pool_index, permits_slot)` pairs attached to `id`.
    pub(crate) fn permits_pointers(&self, id: TaskId) -> Vec<(usize, u16)> {
        let bk = self.slot(id.slot());
        let len = bk.permits_len.load(Ordering::Relaxed) as usize;
        unsafe { (*bk.permits.get())[..len].iter().map(|&k| decode_permits_key(k)).collect() }
    }

    /// Release a completed task's slot back to the free ring, advancing its
    /// generation mod 16.
    pub(crate) fn free_task(&self, id: TaskId) {
        let bk = self.slot(id.slot());
        let next_gen = (bk.generation.fetch_add(1, Ordering::AcqRel) + 1) & 0xF;
        self.free_ring.push(((id.slot() as u32) << 4) | next_gen as u32);
    }

    // -- Ready deque -------------------------------------------------------

    pub(crate) fn push_ready(&self, id: TaskId) {
        self.ready.push(id);
    }

    /// Owner-thread-only local take, draining locally queued work before
    /// parking, draining locally queued work before the owner reparks.
    pub(crate) fn local_take(&self) -> Option<TaskId> {
        self.ready.take()
    }

    pub(crate) fn steal_ready(&self) -> Option<TaskId> {
        self.ready.steal()
    }

    pub(crate) fn approx_ready_len(&self) -> i64 {
        self.ready.approx_len()
    }

    // -- Wake mailbox / park -------------------------------------------------

    pub(crate) fn set_wakeup_task(&self, id: TaskId) {
        self.wakeup_task_id.store(id.raw(), Ordering::Release);
    }

    pub(crate) fn take_wakeup_task(&self) -> TaskId {
        TaskId::from_raw(self.wakeup_task_id.swap(0, Ordering::Acquire))
    }

    pub(crate) fn park(&self) {
        self.park.wait();
    }

    pub(crate) fn unpark(&self) {
        self.park.post();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::default_virtual_memory;

    fn pool() -> TaskPool<impl VirtualMemory> {
        TaskPool::new(default_virtual_memory(), 0, 1).unwrap()
    }

    #[test]
    fn create_task_assigns_increasing_generation_zero_initially() {
        let p = pool();
        let id = p
            .create_task(TaskDescriptor::new(CompletionType::Automatic, Box::new(|_| {})))
            .unwrap();
        assert_eq!(id.generation(), 0);
        assert_eq!(id.pool(), 0);
    }

    /// Freeing N permits-list records and reallocating N more reuses the
    /// same indices in the order they were freed, since the underlying free
    /// ring is FIFO.
    #[test]
    fn permits_list_recycle_matches_free_order() {
        let p = pool();
        let mut allocated = Vec::new();
        for _ in 0..16 {
            allocated.push(p.alloc_permits_list().unwrap());
        }
        for &idx in &allocated {
            p.free_permits_list(idx);
        }
        let mut reallocated = Vec::new();
        for _ in 0..16 {
            reallocated.push(p.alloc_permits_list().unwrap());
        }
        assert_eq!(allocated, reallocated);
    }

    #[test]
    fn ready_deque_owner_push_then_take_round_trips() {
        let p = pool();
        let id = TaskId::pack(0, 5, 0);
        p.push_ready(id);
        assert_eq!(p.local_take(), Some(id));
        assert_eq!(p.local_take(), None);
    }

    #[test]
    fn ready_deque_stealer_can_take_pushed_item() {
        let p = pool();
        let id = TaskId::pack(0, 7, 0);
        p.push_ready(id);
        assert_eq!(p.steal_ready(), Some(id));
        assert_eq!(p.local_take(), None);
    }

    #[test]
    fn free_task_then_create_advances_generation() {
        let p = pool();
        let id = p
            .create_task(TaskDescriptor::new(CompletionType::Automatic, Box::new(|_| {})))
            .unwrap();
        p.free_task(id);
        let id2 = p
            .create_task(TaskDescriptor::new(CompletionType::Automatic, Box::new(|_| {})))
            .unwrap();
        assert_eq!(id2.slot(), id.slot());
        assert_eq!(id2.generation(), 1);
    }

    /// With no pre-commit request, a fresh pool holds zero chunks until the
    /// first `create_task` forces one; bookkeeping storage for later chunks
    /// stays unallocated until their own first use.
    #[test]
    fn chunks_commit_lazily_on_first_use() {
        let p = TaskPool::new(default_virtual_memory(), 0, 0).unwrap();
        assert_eq!(p.committed_chunk_count(), 0);
        p.create_task(TaskDescriptor::new(CompletionType::Automatic, Box::new(|_| {})))
            .unwrap();
        assert_eq!(p.committed_chunk_count(), 1);
        for _ in 0..(TASK_CHUNK_SLOTS - 1) {
            p.create_task(TaskDescriptor::new(CompletionType::Automatic, Box::new(|_| {})))
                .unwrap();
        }
        assert_eq!(p.committed_chunk_count(), 1);
        p.create_task(TaskDescriptor::new(CompletionType::Automatic, Box::new(|_| {})))
            .unwrap();
        assert_eq!(p.committed_chunk_count(), 2);
    }

    #[test]
    fn committing_more_than_64_chunks_is_rejected() {
        let p = pool();
        // Drain every slot across all 64 chunks; the 65537th create should
        // fail with PoolExhausted since no chunk remains to commit.
        let mut ids = Vec::new();
        for _ in 0..SLOTS_PER_TASK_POOL {
            ids.push(
                p.create_task(TaskDescriptor::new(CompletionType::Automatic, Box::new(|_| {})))
                    .unwrap(),
            );
        }
        let err = p.create_task(TaskDescriptor::new(CompletionType::Automatic, Box::new(|_| {})));
        assert!(matches!(err, Err(PalError::PoolExhausted(_))));
    }
}
