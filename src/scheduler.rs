// Pool directory, worker threads, park/wake, and steal coordination.
//
// The parked-pool LIFO (`ParkedPoolIds` + its top-of-stack counter) is a
// bounded array-based CAS stack of pool indices, grounded on this
// repository's `concurrent/stack.rs` Treiber stack, simplified since indices
// need no epoch-based reclamation: the backing array lives as long as the
// scheduler does. The two-phase park (scan -> re-check event counter ->
// CAS-push -> sleep) is encapsulated behind a single method returning a
// tagged outcome (`ParkOutcome`) so callers never see the semaphore.
//
// The shared I/O completion port for aio workers is grounded on
// `io/windows_iocp.rs` on Windows (real IOCP via `windows-sys`); elsewhere
// it is a `parking_lot`-guarded queue, since a shared wake/shutdown-sentinel
// channel is all that's needed here, not real file I/O.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PalError, Result};
use crate::task::{CompletionType, TaskDescriptor, TaskId};
use crate::task_pool::TaskPool;
use crate::vm::VirtualMemory;

// ============================================================================
// Shared I/O completion port
// ============================================================================

#[cfg(windows)]
mod completion_port {
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::IO::{
        CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
        OVERLAPPED,
    };

    /// Shutdown sentinel key posted to every aio worker.
    pub const SHUTDOWN_KEY: usize = 0;

    pub struct CompletionPort(HANDLE);

    unsafe impl Send for CompletionPort {}
    unsafe impl Sync for CompletionPort {}

    impl CompletionPort {
        pub fn new() -> Self {
            let handle = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) };
            Self(handle)
        }

        pub fn post(&self, key: usize) {
            unsafe {
                PostQueuedCompletionStatus(self.0, 0, key, std::ptr::null_mut());
            }
        }

        /// Blocks (`INFINITE` timeout) until a completion key is posted.
        pub fn wait(&self) -> usize {
            let mut bytes = 0u32;
            let mut key: usize = 0;
            let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
            unsafe {
                GetQueuedCompletionStatus(self.0, &mut bytes, &mut key, &mut overlapped, u32::MAX);
            }
            key
        }
    }

    impl Drop for CompletionPort {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

#[cfg(not(windows))]
mod completion_port {
    use parking_lot::{Condvar, Mutex};
    use std::collections::VecDeque;

    pub const SHUTDOWN_KEY: usize = 0;

    /// A shared multi-consumer blocking queue standing in for the real
    /// completion port: every aio worker thread calls `wait()` on the same
    /// instance, matching IOCP's multi-thread `GetQueuedCompletionStatus`
    /// fan-out without reaching for `io_uring`/`epoll` plumbing this crate
    /// has no other use for.
    pub struct CompletionPort {
        queue: Mutex<VecDeque<usize>>,
        cond: Condvar,
    }

    impl CompletionPort {
        pub fn new() -> Self {
            Self {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
            }
        }

        pub fn post(&self, key: usize) {
            let mut q = self.queue.lock();
            q.push_back(key);
            self.cond.notify_one();
        }

        pub fn wait(&self) -> usize {
            let mut q = self.queue.lock();
            while q.is_empty() {
                self.cond.wait(&mut q);
            }
            q.pop_front().unwrap()
        }
    }
}

use completion_port::{CompletionPort, SHUTDOWN_KEY};

// ============================================================================
// Parked-pool LIFO
// ============================================================================

struct ParkedStack {
    entries: Box<[AtomicUsize]>,
    /// `ParkedPoolToS`.
    tos: AtomicUsize,
}

impl ParkedStack {
    fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity.max(1)).map(|_| AtomicUsize::new(usize::MAX)).collect(),
            tos: AtomicUsize::new(0),
        }
    }

    fn push(&self, pool_index: usize) {
        loop {
            let tos = self.tos.load(Ordering::Acquire);
            self.entries[tos].store(pool_index, Ordering::Release);
            if self
                .tos
                .compare_exchange(tos, tos + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pops the top entry. The value is read *before* the CAS that commits
    /// the pop, so the wake-mailbox target named by a winning caller is
    /// always the value actually removed.
    fn pop(&self) -> Option<usize> {
        loop {
            let tos = self.tos.load(Ordering::Acquire);
            if tos == 0 {
                return None;
            }
            let value = self.entries[tos - 1].load(Ordering::Acquire);
            if self
                .tos
                .compare_exchange(tos, tos - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(value);
            }
        }
    }
}

// ============================================================================
// Pool type / scheduler configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Main,
    AioWorker,
    CpuWorker,
    User(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolFlags(pub u8);

impl PoolFlags {
    pub const CREATE: PoolFlags = PoolFlags(0b00001);
    pub const PUBLISH: PoolFlags = PoolFlags(0b00010);
    pub const EXECUTE: PoolFlags = PoolFlags(0b00100);
    pub const COMPLETE: PoolFlags = PoolFlags(0b01000);
    pub const STEAL: PoolFlags = PoolFlags(0b10000);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PoolFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        PoolFlags(self.0 | rhs.0)
    }
}

/// One entry of the scheduler configuration's pool-type table.
pub struct PoolTypeDescriptor {
    pub type_id: PoolKind,
    pub pool_count: usize,
    pub pool_flags: PoolFlags,
    pub pre_commit_tasks: usize,
    /// `MANUAL` bind flag: opt out of automatic OS-thread-id binding at
    /// acquire time.
    pub manual_bind: bool,
}

impl PoolTypeDescriptor {
    pub fn new(type_id: PoolKind, pool_count: usize) -> Self {
        Self {
            type_id,
            pool_count,
            pool_flags: PoolFlags::CREATE | PoolFlags::PUBLISH | PoolFlags::EXECUTE | PoolFlags::COMPLETE | PoolFlags::STEAL,
            pre_commit_tasks: 1024,
            manual_bind: false,
        }
    }

    /// A `CpuWorker` pool sized to the number of logical cores.
    pub fn cpu_workers_default() -> Self {
        Self::new(PoolKind::CpuWorker, num_cpus::get())
    }
}

pub type WorkerInit = Arc<dyn Fn(usize) -> std::result::Result<(), String> + Send + Sync>;

pub struct SchedulerConfig {
    pub pool_types: Vec<PoolTypeDescriptor>,
    pub worker_init: Option<WorkerInit>,
    pub worker_stack_size: usize,
    pub max_async_io_requests: usize,
    pub max_steal_list: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_types: Vec::new(),
            worker_init: None,
            worker_stack_size: 2 * 1024 * 1024,
            max_async_io_requests: 256,
            max_steal_list: 4,
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

enum ParkOutcome {
    Shutdown,
    WakeTask(TaskId),
    TrySteal(Vec<usize>),
}

/// Top-level object coordinating pools, threads, and wake/steal.
pub struct TaskScheduler<V: VirtualMemory> {
    pools: Vec<Arc<TaskPool<V>>>,
    pool_kind: Vec<PoolKind>,
    /// `ReadyEventCount`: bumped on every wake, read-compared by parkers to
    /// detect a race between "scan found nothing" and "someone just woke
    /// something up".
    ready_event_count: AtomicU64,
    parked: ParkedStack,
    /// `TaskPoolERTR`: an *estimate*, deliberately not strictly ordered
    /// against the ready deque itself.
    ertr: Vec<AtomicI32>,
    shutdown: AtomicBool,
    completion_port: CompletionPort,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_steal_list: usize,
}

impl<V: VirtualMemory + Clone + Send + Sync + 'static> TaskScheduler<V> {
    /// Reserves pools for every configured type, spawns CPU/aio worker
    /// threads, and waits for each to report ready or fail init. Fails the
    /// whole create if any worker errors.
    pub fn create(vm: V, config: SchedulerConfig) -> Result<Arc<Self>> {
        let mut pools = Vec::new();
        let mut kinds = Vec::new();
        for desc in &config.pool_types {
            for _ in 0..desc.pool_count {
                let idx = pools.len();
                pools.push(Arc::new(TaskPool::new(vm.clone(), idx, desc.pre_commit_tasks)?));
                kinds.push(desc.type_id);
            }
        }
        let n = pools.len();
        info!(pool_count = n, "creating task scheduler");

        let scheduler = Arc::new(Self {
            pools,
            pool_kind: kinds,
            ready_event_count: AtomicU64::new(0),
            parked: ParkedStack::new(n),
            ertr: (0..n).map(|_| AtomicI32::new(0)).collect(),
            shutdown: AtomicBool::new(false),
            completion_port: CompletionPort::new(),
            workers: Mutex::new(Vec::new()),
            max_steal_list: config.max_steal_list.max(1),
        });

        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();
        let mut handles = Vec::new();
        let mut pool_index = 0usize;
        for desc in &config.pool_types {
            for _ in 0..desc.pool_count {
                let kind = desc.type_id;
                let manual_bind = desc.manual_bind;
                if matches!(kind, PoolKind::CpuWorker | PoolKind::AioWorker) {
                    let scheduler = scheduler.clone();
                    let init = config.worker_init.clone();
                    let tx = ready_tx.clone();
                    let idx = pool_index;
                    let name = format!("pal-{kind:?}-{idx}");
                    let builder = std::thread::Builder::new()
                        .name(name)
                        .stack_size(config.worker_stack_size);
                    let handle = builder
                        .spawn(move || {
                            if !manual_bind {
                                scheduler.pools[idx].bind();
                            }
                            if let Some(init) = &init {
                                if let Err(e) = init(idx) {
                                    warn!(pool = idx, error = %e, "worker init failed");
                                    let _ = tx.send(Err(e));
                                    return;
                                }
                            }
                            let _ = tx.send(Ok(()));
                            match kind {
                                PoolKind::CpuWorker => scheduler.cpu_worker_loop(idx),
                                PoolKind::AioWorker => scheduler.aio_worker_loop(idx),
                                _ => unreachable!(),
                            }
                            scheduler.pools[idx].unbind();
                        })
                        .map_err(|e| PalError::WorkerInitFailed(e.to_string()))?;
                    handles.push(handle);
                } else {
                    // Main/User pools are addressable immediately; the
                    // caller drives them directly rather than a
                    // scheduler-owned loop.
                    let _ = ready_tx.send(Ok(()));
                }
                pool_index += 1;
            }
        }
        drop(ready_tx);

        for _ in 0..pool_index {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => {
                    scheduler.shutdown_internal(handles);
                    return Err(PalError::WorkerInitFailed(reason));
                }
                Err(_) => break,
            }
        }
        *scheduler.workers.lock() = handles;
        Ok(scheduler)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pool_kind(&self, pool_index: usize) -> PoolKind {
        self.pool_kind[pool_index]
    }

    fn pool(&self, pool_index: usize) -> &Arc<TaskPool<V>> {
        &self.pools[pool_index]
    }

    /// Create a task slot bound to `pool_index` (state transition
    /// `FREE -> CLAIMED`). Not runnable until `publish`.
    pub fn create_task(&self, pool_index: usize, descriptor: TaskDescriptor) -> Result<TaskId> {
        let parent_id = descriptor.parent_id;
        let id = self.pool(pool_index).create_task(descriptor)?;
        if let Some(parent_id) = parent_id {
            self.pool(parent_id.pool() as usize).increment_work_count(parent_id);
        }
        Ok(id)
    }

    /// Publish a task, optionally behind a dependency set. `local_pool` is
    /// the calling thread's own pool (where a
    /// permits record, if needed, is allocated, and where the task lands
    /// if no parked worker is available to hand it straight to).
    pub fn publish(&self, local_pool: usize, id: TaskId, dependencies: &[TaskId]) -> Result<()> {
        let unfinished: Vec<TaskId> = dependencies
            .iter()
            .copied()
            .filter(|d| !self.pool(d.pool() as usize).is_complete(*d))
            .collect();

        if unfinished.is_empty() {
            self.wake_worker(Some(id), local_pool);
            return Ok(());
        }

        let owner = local_pool;
        let permits_slot = self.pool(owner).alloc_permits_list()?;
        self.pool(owner).permits_list_init(permits_slot, &[id]);
        for dep in &unfinished {
            let dep_pool = dep.pool() as usize;
            self.pool(dep_pool).push_permits_pointer(*dep, owner, permits_slot)?;
        }
        Ok(())
    }

    /// Decrement a task's `work_count` by one unit; on reaching zero, runs
    /// its completion callback, releases any permits lists it was
    /// referenced by, frees its slot, and recurses into its parent's
    /// `work_count`.
    pub fn complete(&self, local_pool: usize, id: TaskId) {
        self.complete_units(local_pool, id, 1);
    }

    fn complete_units(&self, local_pool: usize, id: TaskId, units: i64) {
        let owner = id.pool() as usize;
        let remaining = self.pool(owner).decrement_work_count(id, units);
        if remaining > 0 {
            return;
        }
        debug_assert_eq!(remaining, 0, "work_count underflow for {id:?}");

        self.pool(owner).mark_complete(id);
        self.pool(owner).run_complete_callback(id);

        for (permits_pool, permits_slot) in self.pool(owner).permits_pointers(id) {
            if let Some(waiters) = self.pool(permits_pool).permits_list_release_one(permits_slot) {
                for waiter in waiters {
                    self.wake_worker(Some(waiter), local_pool);
                }
            }
        }

        let parent = self.pool(owner).parent_id(id);
        self.pool(owner).free_task(id);
        debug!(task = ?id, "task completed");
        if let Some(parent_id) = parent {
            self.complete_units(local_pool, parent_id, 1);
        }
    }

    /// Hand a task to a parked worker if one exists; otherwise push it onto
    /// the caller's own ready deque and bump its `ERTR` estimate.
    fn wake_worker(&self, give_task: Option<TaskId>, local_pool: usize) {
        if let Some(popped) = self.parked.pop() {
            if let Some(task) = give_task {
                self.pool(popped).set_wakeup_task(task);
            }
            match self.pool_kind[popped] {
                PoolKind::AioWorker => self.completion_port.post(give_task.map(|t| t.raw() as usize).unwrap_or(1)),
                _ => self.pool(popped).unpark(),
            }
        } else if let Some(task) = give_task {
            self.pool(local_pool).push_ready(task);
            self.ertr[local_pool].fetch_add(1, Ordering::Relaxed);
        }
        self.ready_event_count.fetch_add(1, Ordering::SeqCst);
    }

    fn scan_steal_candidates(&self, exclude: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.max_steal_list);
        for i in 0..self.ertr.len() {
            if i == exclude {
                continue;
            }
            if self.ertr[i].load(Ordering::Relaxed) > 0 {
                out.push(i);
                if out.len() >= self.max_steal_list {
                    break;
                }
            }
        }
        out
    }

    /// The two-phase park idiom (Design Note §9): scan for steal
    /// candidates; if none, re-check `ready_event_count` hasn't moved since
    /// the scan (guards against a wake racing the decision to park), then
    /// push onto the parked stack and block.
    fn park_or_steal(&self, pool_index: usize) -> ParkOutcome {
        loop {
            let before = self.ready_event_count.load(Ordering::SeqCst);
            let candidates = self.scan_steal_candidates(pool_index);
            if !candidates.is_empty() {
                return ParkOutcome::TrySteal(candidates);
            }
            let after = self.ready_event_count.load(Ordering::SeqCst);
            if after != before {
                continue;
            }
            self.parked.push(pool_index);
            self.pool(pool_index).park();
            if self.shutdown.load(Ordering::Acquire) {
                return ParkOutcome::Shutdown;
            }
            return ParkOutcome::WakeTask(self.pool(pool_index).take_wakeup_task());
        }
    }

    /// Walk `steal_list` starting from `*start_index`; on success,
    /// decrements the victim's `ERTR` and remembers where to resume next
    /// time. Exhaustion resets `*start_index` for the next park cycle.
    fn steal_from(&self, steal_list: &[usize], start_index: &mut usize) -> Option<TaskId> {
        if steal_list.is_empty() {
            return None;
        }
        for i in 0..steal_list.len() {
            let idx = (*start_index + i) % steal_list.len();
            let candidate = steal_list[idx];
            if let Some(task) = self.pool(candidate).steal_ready() {
                self.ertr[candidate].fetch_sub(1, Ordering::Relaxed);
                *start_index = idx;
                return Some(task);
            }
        }
        *start_index = 0;
        None
    }

    /// CPU worker loop: park or steal, run to completion, drain local work.
    fn cpu_worker_loop(self: &Arc<Self>, pool_index: usize) {
        let mut start_index = 0usize;
        loop {
            let mut current = match self.park_or_steal(pool_index) {
                ParkOutcome::Shutdown => return,
                ParkOutcome::WakeTask(t) if t.is_valid() => Some(t),
                ParkOutcome::WakeTask(_) => None,
                ParkOutcome::TrySteal(list) => self.steal_from(&list, &mut start_index),
            };
            while let Some(task) = current {
                // A task's bookkeeping (main/complete closures, completion
                // type) lives in its *home* pool (`task.pool()`), which can
                // differ from the executing worker's own `pool_index` once
                // the task has been stolen or handed to a woken worker.
                let home = self.pool(task.pool() as usize);
                home.run_main(task);
                if matches!(home.completion_type(task), CompletionType::Automatic) {
                    self.complete(pool_index, task);
                }
                current = self.pool(pool_index).local_take();
            }
        }
    }

    /// Simplified aio worker loop: the shared completion port plays the
    /// role `park()`/`unpark()` plays for CPU workers. A posted key equal
    /// to a valid `TaskId::raw()` is a direct wakeup; `SHUTDOWN_KEY` (0)
    /// ends the loop; any other nonzero key is a steal hint prompting a
    /// normal scan (mirrors `WAKE_TASK` vs `TRY_STEAL` in the CPU variant).
    fn aio_worker_loop(self: &Arc<Self>, pool_index: usize) {
        let mut start_index = 0usize;
        loop {
            let key = self.completion_port.wait();
            if key == SHUTDOWN_KEY {
                return;
            }
            let mut current = if key == 1 {
                let candidates = self.scan_steal_candidates(pool_index);
                self.steal_from(&candidates, &mut start_index)
            } else {
                Some(TaskId::from_raw(key as u32))
            };
            while let Some(task) = current {
                let home = self.pool(task.pool() as usize);
                home.run_main(task);
                if matches!(home.completion_type(task), CompletionType::Automatic) {
                    self.complete(pool_index, task);
                }
                current = self.pool(pool_index).local_take();
            }
        }
    }

    /// Sets the shutdown flag, posts one wake per worker, and joins every
    /// worker thread.
    pub fn shutdown(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.workers.lock());
        self.shutdown_internal(handles);
        Ok(())
    }

    fn shutdown_internal(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown.store(true, Ordering::Release);
        info!("scheduler shutdown requested");
        for (idx, kind) in self.pool_kind.iter().enumerate() {
            match kind {
                PoolKind::CpuWorker => self.pool(idx).unpark(),
                PoolKind::AioWorker => self.completion_port.post(SHUTDOWN_KEY),
                _ => {}
            }
        }
        for h in handles {
            let name = h.thread().name().unwrap_or("<unnamed>").to_string();
            if let Err(panic) = h.join() {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                warn!(worker = %name, reason = %reason, "worker thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::default_virtual_memory;
    use std::time::{Duration, Instant};

    fn single_cpu_worker_scheduler() -> Arc<TaskScheduler<impl VirtualMemory + Clone + Send + Sync + 'static>> {
        let config = SchedulerConfig {
            pool_types: vec![PoolTypeDescriptor::new(PoolKind::CpuWorker, 1)],
            ..Default::default()
        };
        TaskScheduler::create(default_virtual_memory(), config).unwrap()
    }

    /// One worker, one automatic task; both main and completion callbacks
    /// run, main before completion.
    #[test]
    fn single_task_autocompletes_in_order() {
        let scheduler = single_cpu_worker_scheduler();
        let timestamps: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new((Mutex::new(false), parking_lot::Condvar::new()));

        let ts_main = timestamps.clone();
        let ts_complete = timestamps.clone();
        let done_complete = done.clone();

        let descriptor = TaskDescriptor::new(
            CompletionType::Automatic,
            Box::new(move |_id| {
                ts_main.lock().push("main");
            }),
        )
        .with_complete(Box::new(move |_id| {
            ts_complete.lock().push("complete");
            let (lock, cvar) = &*done_complete;
            *lock.lock() = true;
            cvar.notify_all();
        }));

        let id = scheduler.create_task(0, descriptor).unwrap();
        scheduler.publish(0, id, &[]).unwrap();

        let (lock, cvar) = &*done;
        let mut guard = lock.lock();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !*guard {
            if cvar.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        assert!(*guard, "completion callback never ran");
        assert_eq!(*timestamps.lock(), vec!["main", "complete"]);
        scheduler.shutdown().unwrap();
    }

    /// A parent task's completion always observes its child's completion
    /// first, since parent `work_count` cannot hit zero until the child's
    /// unit is subtracted.
    #[test]
    fn parent_completes_after_child() {
        let scheduler = single_cpu_worker_scheduler();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let barrier_done = Arc::new((Mutex::new(false), parking_lot::Condvar::new()));

        let order_parent = order.clone();
        let parent_descriptor = TaskDescriptor::new(CompletionType::Automatic, Box::new(move |_| {}))
            .with_complete({
                let order_parent = order_parent.clone();
                let done = barrier_done.clone();
                Box::new(move |_id| {
                    order_parent.lock().push("parent");
                    let (lock, cvar) = &*done;
                    *lock.lock() = true;
                    cvar.notify_all();
                })
            });
        let parent_id = scheduler.create_task(0, parent_descriptor).unwrap();

        let order_child = order.clone();
        let child_descriptor = TaskDescriptor::new(
            CompletionType::Automatic,
            Box::new(move |_| {
                order_child.lock().push("child");
            }),
        )
        .with_parent(parent_id);
        // Parent starts with work_count = 1 (itself); creating the child
        // bumps it to 2 before either task is published, so the parent can
        // never observe a zero work_count until the child's unit lands.
        let child_id = scheduler.create_task(0, child_descriptor).unwrap();
        scheduler.publish(0, parent_id, &[]).unwrap();
        scheduler.publish(0, child_id, &[]).unwrap();

        // Busy-wait briefly for both callbacks (single worker drains its
        // own ready deque before reparking, so this converges quickly).
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if order.lock().len() == 2 || Instant::now() > deadline {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(*order.lock(), vec!["child", "parent"]);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn parked_stack_pops_in_lifo_order() {
        let stack = ParkedStack::new(4);
        stack.push(0);
        stack.push(1);
        stack.push(2);
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), Some(0));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn wake_with_no_parked_worker_pushes_to_local_deque() {
        let scheduler = single_cpu_worker_scheduler();
        scheduler.shutdown().unwrap();
        // After shutdown no worker is parked; wake_worker should fall back
        // to pushing onto the local pool's ready deque.
        let id = TaskId::pack(0, 1, 0);
        scheduler.wake_worker(Some(id), 0);
        assert_eq!(scheduler.pool(0).local_take(), Some(id));
    }
}
