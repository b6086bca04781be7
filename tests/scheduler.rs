// Cross-module scheduler scenarios that exercise the worker pool directory,
// stealing across pools, and the `Internal` completion path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pal::{default_virtual_memory, CompletionType, PoolKind, PoolTypeDescriptor, SchedulerConfig, TaskDescriptor, TaskScheduler};

fn wait_until(deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::yield_now();
    }
    done()
}

#[test]
fn task_published_on_one_pool_can_be_stolen_by_another() {
    let config = SchedulerConfig {
        pool_types: vec![PoolTypeDescriptor::new(PoolKind::CpuWorker, 4)],
        ..Default::default()
    };
    let scheduler = TaskScheduler::create(default_virtual_memory(), config).unwrap();

    let ran: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let mut ids = Vec::new();
    for i in 0..64 {
        let ran = ran.clone();
        let descriptor = TaskDescriptor::new(
            CompletionType::Automatic,
            Box::new(move |_id| {
                ran.lock().push(i);
            }),
        );
        let id = scheduler.create_task(0, descriptor).unwrap();
        scheduler.publish(0, id, &[]).unwrap();
        ids.push(id);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    assert!(
        wait_until(deadline, || ran.lock().len() == 64),
        "not every task ran within the deadline: {} of 64",
        ran.lock().len()
    );

    let mut seen = ran.lock().clone();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 64, "every task must run exactly once even when stolen");

    scheduler.shutdown().unwrap();
}

#[test]
fn internal_completion_task_only_finishes_when_explicitly_completed() {
    let config = SchedulerConfig {
        pool_types: vec![PoolTypeDescriptor::new(PoolKind::CpuWorker, 1)],
        ..Default::default()
    };
    let scheduler = TaskScheduler::create(default_virtual_memory(), config).unwrap();

    let completed = Arc::new((Mutex::new(false), Condvar::new()));
    let completed_complete = completed.clone();

    let scheduler_for_main = scheduler.clone();
    let descriptor = TaskDescriptor::new(
        CompletionType::Internal,
        Box::new(move |id| {
            // Completion is signalled explicitly, from inside main, not by
            // the worker loop returning.
            scheduler_for_main.complete(0, id);
        }),
    )
    .with_complete(Box::new(move |_id| {
        let (lock, cvar) = &*completed_complete;
        *lock.lock() = true;
        cvar.notify_all();
    }));

    let id = scheduler.create_task(0, descriptor).unwrap();
    scheduler.publish(0, id, &[]).unwrap();

    let (lock, cvar) = &*completed;
    let mut guard = lock.lock();
    if !*guard {
        cvar.wait_for(&mut guard, Duration::from_secs(5));
    }
    assert!(*guard, "completion callback never ran for an Internal-completion task");

    scheduler.shutdown().unwrap();
}

#[test]
fn publish_with_satisfied_dependency_wakes_immediately() {
    let config = SchedulerConfig {
        pool_types: vec![PoolTypeDescriptor::new(PoolKind::CpuWorker, 1)],
        ..Default::default()
    };
    let scheduler = TaskScheduler::create(default_virtual_memory(), config).unwrap();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let order_dep = order.clone();
    let dep_descriptor = TaskDescriptor::new(
        CompletionType::Automatic,
        Box::new(move |_id| {
            order_dep.lock().push("dependency");
        }),
    );
    let dep_id = scheduler.create_task(0, dep_descriptor).unwrap();
    scheduler.publish(0, dep_id, &[]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    assert!(wait_until(deadline, || order.lock().len() == 1));

    let order_dependent = order.clone();
    let dependent_descriptor = TaskDescriptor::new(
        CompletionType::Automatic,
        Box::new(move |_id| {
            order_dependent.lock().push("dependent");
        }),
    );
    let dependent_id = scheduler.create_task(0, dependent_descriptor).unwrap();
    // dep_id is already complete by now, so publish should wake the
    // dependent immediately rather than parking it behind a permits list.
    scheduler.publish(0, dependent_id, &[dep_id]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    assert!(wait_until(deadline, || order.lock().len() == 2));
    assert_eq!(*order.lock(), vec!["dependency", "dependent"]);

    scheduler.shutdown().unwrap();
}
