//! Tests for tracked tasks on priority executors and resource pools.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::wait_until;
use docket::executor::{PriorityExecutorService, TaskContext, TaskError};
use docket::pool::ResourcePool;
use docket::processable::{
    CollectionListener, ProcessableCollection, ProcessableExecutor, ProcessableFactory,
    ProcessableRegistry, ProcessableStatus, ProcessableTask, ProgressReporter, Unit,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn single_thread_executor() -> ProcessableExecutor {
    let service = PriorityExecutorService::new("test", 1).unwrap();
    ProcessableExecutor::new(Arc::new(service), None)
}

/// Occupy the only worker of `executor` until the returned sender fires.
fn block_worker(executor: &ProcessableExecutor) -> mpsc::Sender<()> {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel();
    executor
        .submit(Unit::runnable("gate", move |_ctx: &TaskContext| {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }))
        .unwrap();
    started_rx.recv_timeout(TIMEOUT).unwrap();
    release_tx
}

#[test]
fn test_plain_unit_reports_no_progress() {
    let executor = single_thread_executor();
    let supplier = executor
        .submit(Unit::callable("plain", |_ctx: &TaskContext| Ok(42)))
        .unwrap();
    assert!(!supplier.task().capability().is_progressive());
    assert_eq!(supplier.progress(), None);
    assert_eq!(supplier.progress_text(), None);
    assert!(!supplier.add_progress_listener(Arc::new(
        |_progress: Option<u8>, _text: Option<&str>| {}
    )));

    supplier.wait();
    assert_eq!(supplier.status(), ProcessableStatus::Successful);
    assert_eq!(supplier.progress(), None);
    assert_eq!(supplier.get().unwrap(), 42);
}

#[test]
fn test_progressive_unit_reports_live_progress() {
    let executor = single_thread_executor();
    let reporter = ProgressReporter::new();
    let (halfway_tx, halfway_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    let worker_reporter = reporter.clone();
    let unit = Unit::callable("download", move |_ctx: &TaskContext| {
        worker_reporter.update(Some(50), Some("halfway".to_string()));
        halfway_tx.send(()).unwrap();
        resume_rx.recv()?;
        worker_reporter.set_progress(100);
        Ok("done")
    })
    .with_listenable_progress(reporter.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let supplier = executor.submit(unit).unwrap();
    {
        let seen = seen.clone();
        assert!(supplier.add_progress_listener(Arc::new(
            move |progress: Option<u8>, _text: Option<&str>| {
                seen.lock().unwrap().push(progress);
            },
        )));
    }

    halfway_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(supplier.status(), ProcessableStatus::Processing);
    assert_eq!(supplier.progress(), Some(50));
    assert_eq!(supplier.progress_text(), Some("halfway".to_string()));

    resume_tx.send(()).unwrap();
    supplier.wait();
    assert_eq!(supplier.progress(), Some(100));
    assert_eq!(seen.lock().unwrap().last(), Some(&Some(100)));
    assert_eq!(supplier.get().unwrap(), "done");
}

#[test]
fn test_cancel_before_start_never_runs() {
    let executor = single_thread_executor();
    let release = block_worker(&executor);

    let ran = Arc::new(AtomicUsize::new(0));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let supplier = {
        let ran = ran.clone();
        executor
            .submit(Unit::runnable("queued", move |_ctx: &TaskContext| {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap()
    };
    {
        let statuses = statuses.clone();
        supplier.add_status_listener(Arc::new(
            move |_task: &ProcessableTask, status: ProcessableStatus| {
                statuses.lock().unwrap().push(status);
            },
        ));
    }

    assert!(supplier.cancel(false));
    assert!(supplier.is_done());
    assert!(supplier.is_cancelled());
    assert_eq!(supplier.status(), ProcessableStatus::Canceled);
    assert!(!supplier.cancel(true), "already terminal");

    release.send(()).unwrap();
    executor.service().shutdown();
    executor.service().await_termination();

    assert!(matches!(supplier.get(), Err(TaskError::Cancelled)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(*statuses.lock().unwrap(), vec![ProcessableStatus::Canceled]);
}

#[test]
fn test_cancel_while_running_marks_canceled() {
    let executor = single_thread_executor();
    let (started_tx, started_rx) = mpsc::channel();
    let supplier = executor
        .submit(Unit::<()>::callable("long", move |ctx: &TaskContext| {
            started_tx.send(()).unwrap();
            while !ctx.is_interrupted() {
                thread::sleep(Duration::from_millis(5));
            }
            anyhow::bail!("interrupted")
        }))
        .unwrap();

    started_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(supplier.status(), ProcessableStatus::Processing);
    assert!(supplier.cancel(true));

    let task = supplier.task().clone();
    assert!(matches!(supplier.get(), Err(TaskError::Cancelled)));
    assert!(wait_until(TIMEOUT, || {
        task.status() == ProcessableStatus::Canceled
    }));
    assert!(task.finished_at().is_some());
}

#[test]
fn test_panicking_unit_is_failed() {
    let executor = single_thread_executor();
    let supplier = executor
        .submit(Unit::callable("boom", |_ctx: &TaskContext| -> anyhow::Result<()> {
            panic!("boom")
        }))
        .unwrap();
    let task = supplier.task().clone();

    match supplier.get() {
        Err(TaskError::Panicked(message)) => assert!(message.contains("boom")),
        other => panic!("unexpected outcome {:?}", other.map(|_| ())),
    }
    assert_eq!(task.status(), ProcessableStatus::Failed);
    assert_eq!(task.error().as_deref(), Some("task panicked"));

    // The worker survives the panic
    let next = executor
        .submit(Unit::callable("after", |_ctx: &TaskContext| Ok(1)))
        .unwrap();
    assert_eq!(next.get().unwrap(), 1);
}

#[test]
fn test_failing_unit_keeps_error() {
    let executor = single_thread_executor();
    let supplier = executor
        .submit(Unit::callable("fails", |_ctx: &TaskContext| -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }))
        .unwrap();
    let task = supplier.task().clone();

    assert!(matches!(supplier.get(), Err(TaskError::Failed(_))));
    assert_eq!(task.status(), ProcessableStatus::Failed);
    assert_eq!(task.error().as_deref(), Some("disk full"));
    assert!(task.started_at().is_some());
}

#[test]
fn test_higher_priority_runs_first() {
    let executor = single_thread_executor();
    let release = block_worker(&executor);

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut suppliers = Vec::new();
    for (name, priority) in [("low", -1), ("default", 0), ("high", 5), ("high2", 5)] {
        let order = order.clone();
        let unit = Unit::runnable(name, move |_ctx: &TaskContext| {
            order.lock().unwrap().push(name);
        });
        suppliers.push(executor.submit_with_priority(unit, priority).unwrap());
    }

    release.send(()).unwrap();
    for supplier in suppliers {
        supplier.get().unwrap();
    }
    assert_eq!(
        *order.lock().unwrap(),
        vec!["high", "high2", "default", "low"]
    );
}

#[derive(Default)]
struct CountingListener {
    added: AtomicUsize,
    removed: AtomicUsize,
}

impl CollectionListener for CountingListener {
    fn on_added(&self, _collection: &ProcessableCollection, _task: &Arc<ProcessableTask>) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn on_removed(&self, _collection: &ProcessableCollection, _task: &Arc<ProcessableTask>) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_tracked_tasks_leave_collection_when_done() {
    let registry = Arc::new(ProcessableRegistry::new());
    let factory = ProcessableFactory::new(registry.clone());
    let service = factory.new_pool("tracked", 2).unwrap();
    let executor = factory.new_tracked_executor(service.clone(), "imports");

    let collection = registry.get("imports").unwrap();
    collection.set_property("source", "tests");
    let listener = Arc::new(CountingListener::default());
    collection.add_listener(listener.clone());

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Arc::new(Mutex::new(release_rx));
    let mut suppliers = Vec::new();
    for n in 0..5 {
        let release_rx = release_rx.clone();
        suppliers.push(
            executor
                .submit(Unit::callable(format!("import {}", n), move |_ctx: &TaskContext| {
                    release_rx.lock().unwrap().recv()?;
                    Ok(n)
                }))
                .unwrap(),
        );
    }
    assert_eq!(collection.len(), 5);
    assert_eq!(registry.live_tasks().len(), 5);
    assert!(suppliers
        .iter()
        .all(|supplier| collection.contains(supplier.id())));

    for _ in 0..5 {
        release_tx.send(()).unwrap();
    }
    let mut results: Vec<i32> = suppliers
        .into_iter()
        .map(|supplier| supplier.get().unwrap())
        .collect();
    results.sort();
    assert_eq!(results, vec![0, 1, 2, 3, 4]);

    assert!(wait_until(TIMEOUT, || collection.is_empty()));
    assert_eq!(listener.added.load(Ordering::SeqCst), 5);
    assert_eq!(listener.removed.load(Ordering::SeqCst), 5);
    assert_eq!(collection.property("source").as_deref(), Some("tests"));
}

#[test]
fn test_registry_close_cancels_live_tasks() {
    let registry = Arc::new(ProcessableRegistry::new());
    let factory = ProcessableFactory::new(registry.clone());
    let service = factory.new_pool("closing", 1).unwrap();
    let executor = factory.new_tracked_executor(service.clone(), "work");
    let release = block_worker(&executor);

    let queued = executor
        .submit(Unit::runnable("queued", |_ctx: &TaskContext| {}))
        .unwrap();
    assert_eq!(registry.live_tasks().len(), 2);

    assert_eq!(registry.close(false), 2);
    assert_eq!(queued.status(), ProcessableStatus::Canceled);
    assert!(registry.live_tasks().is_empty());

    // Without interruption the gate keeps running until released
    release.send(()).unwrap();
    service.shutdown();
    service.await_termination();
    assert!(queued.is_cancelled());
}

#[test]
fn test_pool_bounds_concurrent_leases() {
    let created = Arc::new(AtomicUsize::new(0));
    let pool = {
        let created = created.clone();
        Arc::new(ResourcePool::new(2, move || {
            Ok(created.fetch_add(1, Ordering::SeqCst))
        }))
    };
    let in_use = Arc::new(AtomicUsize::new(0));
    let max_in_use = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let in_use = in_use.clone();
            let max_in_use = max_in_use.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    let _lease = pool.lease().unwrap();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_use.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    in_use.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(max_in_use.load(Ordering::SeqCst) <= 2);
    assert!(created.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.created(), created.load(Ordering::SeqCst));
    assert_eq!(pool.idle(), pool.created());
}
