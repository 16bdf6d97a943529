//! Worker pool behaviour against the in-process queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use relq::{Job, JobRegistry, MemoryQueue, PoolError, Priority, Queue, Worker, WorkerConfig};

/// Counts jobs inside `perform` and holds them until released.
#[derive(Debug)]
struct Gate {
    active: AtomicUsize,
    max_active: AtomicUsize,
    finished: AtomicUsize,
    release: Semaphore,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            release: Semaphore::new(0),
        })
    }
}

#[derive(Debug)]
struct Gated(Arc<Gate>);

#[async_trait]
impl Job for Gated {
    fn job_type(&self) -> &str {
        "Gated"
    }

    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn perform(&self) -> anyhow::Result<()> {
        let gate = &self.0;
        let now = gate.active.fetch_add(1, Ordering::SeqCst) + 1;
        gate.max_active.fetch_max(now, Ordering::SeqCst);

        gate.release.acquire().await?.forget();

        gate.active.fetch_sub(1, Ordering::SeqCst);
        gate.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Succeeds, fails or panics depending on its payload.
#[derive(Debug)]
struct Scripted {
    outcome: String,
    done: Arc<AtomicUsize>,
}

#[async_trait]
impl Job for Scripted {
    fn job_type(&self) -> &str {
        "Scripted"
    }

    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.outcome.clone().into_bytes())
    }

    async fn perform(&self) -> anyhow::Result<()> {
        match self.outcome.as_str() {
            "fail" => anyhow::bail!("scripted failure"),
            "panic" => panic!("scripted panic"),
            _ => {
                self.done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

/// Type with no decoder registered anywhere.
#[derive(Debug)]
struct Unknown;

#[async_trait]
impl Job for Unknown {
    fn job_type(&self) -> &str {
        "Unknown"
    }

    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn perform(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn gated_queue(gate: &Arc<Gate>) -> Arc<MemoryQueue> {
    let registry = JobRegistry::new();
    let gate = Arc::clone(gate);
    registry.register_decoder("Gated", move |_| {
        Ok(Box::new(Gated(Arc::clone(&gate))) as Box<dyn Job>)
    });
    Arc::new(MemoryQueue::new(Arc::new(registry)))
}

fn scripted_queue(done: &Arc<AtomicUsize>) -> Arc<MemoryQueue> {
    let registry = JobRegistry::new();
    let done = Arc::clone(done);
    registry.register_decoder("Scripted", move |payload| {
        Ok(Box::new(Scripted {
            outcome: String::from_utf8(payload.to_vec())?,
            done: Arc::clone(&done),
        }) as Box<dyn Job>)
    });
    Arc::new(MemoryQueue::new(Arc::new(registry)))
}

/// Like `scripted_queue`, but the decoder itself panics on a "bad" payload.
fn panicking_decoder_queue(done: &Arc<AtomicUsize>) -> Arc<MemoryQueue> {
    let registry = JobRegistry::new();
    let done = Arc::clone(done);
    registry.register_decoder("Scripted", move |payload| {
        let outcome = String::from_utf8(payload.to_vec())?;
        if outcome == "bad" {
            panic!("decoder cannot handle payload");
        }
        Ok(Box::new(Scripted {
            outcome,
            done: Arc::clone(&done),
        }) as Box<dyn Job>)
    });
    Arc::new(MemoryQueue::new(Arc::new(registry)))
}

async fn enqueue_scripted(queue: &MemoryQueue, outcome: &str) {
    let job = Scripted {
        outcome: outcome.to_string(),
        done: Arc::new(AtomicUsize::new(0)),
    };
    queue.enqueue(&job, Priority::Medium, None).await.unwrap();
}

/// Polls `condition` every 5ms for up to 5s.
async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn spawn_run(worker: &Arc<Worker>) -> tokio::task::JoinHandle<Result<(), PoolError>> {
    let worker = Arc::clone(worker);
    tokio::spawn(async move { worker.run().await })
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let gate = Gate::new();
    let queue = gated_queue(&gate);
    for _ in 0..8 {
        queue.enqueue(&Gated(Arc::clone(&gate)), Priority::Medium, None).await.unwrap();
    }

    let worker = Arc::new(Worker::new(
        queue.clone(),
        WorkerConfig::new(3).with_block_timeout(Duration::from_millis(20)),
    ));
    let handle = spawn_run(&worker);

    eventually(|| gate.active.load(Ordering::SeqCst) == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gate.active.load(Ordering::SeqCst), 3);
    assert_eq!(worker.stats().active_jobs, 3);

    gate.release.add_permits(8);
    eventually(|| gate.finished.load(Ordering::SeqCst) == 8).await;

    worker.stop(true).await;
    handle.await.unwrap().unwrap();

    assert_eq!(gate.max_active.load(Ordering::SeqCst), 3);
    assert!(queue.is_empty());
    assert!(queue.processing_jobs().is_empty());

    let stats = worker.stats();
    assert_eq!(stats.num_units, 3);
    assert_eq!(stats.jobs_completed, 8);
    assert_eq!(stats.jobs_failed, 0);
}

#[tokio::test]
async fn test_failures_do_not_stop_units() {
    let done = Arc::new(AtomicUsize::new(0));
    let queue = scripted_queue(&done);
    for outcome in ["fail", "ok", "panic", "ok", "ok"] {
        enqueue_scripted(&queue, outcome).await;
    }

    let worker = Arc::new(Worker::new(
        queue.clone(),
        WorkerConfig::new(1).with_block_timeout(Duration::from_millis(20)),
    ));
    let handle = spawn_run(&worker);

    eventually(|| done.load(Ordering::SeqCst) == 3).await;
    eventually(|| worker.stats().total_processed() == 5).await;

    worker.stop(true).await;
    handle.await.unwrap().unwrap();

    let stats = worker.stats();
    assert_eq!(stats.jobs_completed, 3);
    assert_eq!(stats.jobs_failed, 2);
    // Failed jobs are left for the recovery monitor.
    assert_eq!(queue.processing_jobs().len(), 2);
}

#[tokio::test]
async fn test_unknown_job_type_does_not_stop_unit() {
    let done = Arc::new(AtomicUsize::new(0));
    let queue = scripted_queue(&done);
    let unknown = queue.enqueue(&Unknown, Priority::High, None).await.unwrap();
    enqueue_scripted(&queue, "ok").await;

    let worker = Arc::new(Worker::new(
        queue.clone(),
        WorkerConfig::new(1).with_block_timeout(Duration::from_millis(20)),
    ));
    let handle = spawn_run(&worker);

    eventually(|| done.load(Ordering::SeqCst) == 1).await;
    worker.stop(true).await;
    handle.await.unwrap().unwrap();

    assert!(queue.is_empty());
    assert_eq!(queue.processing_jobs(), vec![unknown]);
    assert_eq!(worker.stats().jobs_completed, 1);
    assert_eq!(worker.stats().jobs_failed, 0);
}

#[tokio::test]
async fn test_panicking_decoder_does_not_stop_unit() {
    let done = Arc::new(AtomicUsize::new(0));
    let queue = panicking_decoder_queue(&done);
    enqueue_scripted(&queue, "bad").await;
    enqueue_scripted(&queue, "ok").await;

    let worker = Arc::new(Worker::new(
        queue.clone(),
        WorkerConfig::new(1).with_block_timeout(Duration::from_millis(20)),
    ));
    let handle = spawn_run(&worker);

    eventually(|| done.load(Ordering::SeqCst) == 1).await;
    tokio::time::timeout(Duration::from_secs(5), worker.stop(true))
        .await
        .unwrap();
    handle.await.unwrap().unwrap();

    assert!(!worker.is_running());
    assert!(queue.is_empty());
    assert_eq!(queue.processing_jobs().len(), 1);
    assert_eq!(worker.stats().jobs_completed, 1);
}

#[tokio::test]
async fn test_panicking_decoder_in_polling_mode() {
    let done = Arc::new(AtomicUsize::new(0));
    let queue = panicking_decoder_queue(&done);
    for outcome in ["bad", "ok", "bad", "ok"] {
        enqueue_scripted(&queue, outcome).await;
    }

    let worker = Arc::new(Worker::new(
        queue.clone(),
        WorkerConfig::new(2)
            .with_average_polling_interval(Duration::from_millis(10))
            .with_block_timeout(Duration::from_millis(10)),
    ));
    let handle = spawn_run(&worker);

    eventually(|| done.load(Ordering::SeqCst) == 2).await;
    tokio::time::timeout(Duration::from_secs(5), worker.stop(true))
        .await
        .unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(queue.processing_jobs().len(), 2);
}

#[tokio::test]
async fn test_polling_mode_processes_jobs() {
    let done = Arc::new(AtomicUsize::new(0));
    let queue = scripted_queue(&done);
    for _ in 0..4 {
        enqueue_scripted(&queue, "ok").await;
    }

    let worker = Arc::new(Worker::new(
        queue.clone(),
        WorkerConfig::new(2).with_average_polling_interval(Duration::from_millis(10)),
    ));
    let handle = spawn_run(&worker);

    eventually(|| done.load(Ordering::SeqCst) == 4).await;
    worker.stop(true).await;
    handle.await.unwrap().unwrap();

    assert!(queue.is_empty());
    assert!(queue.processing_jobs().is_empty());
}

#[tokio::test]
async fn test_stop_cuts_long_polling_sleep_short() {
    let queue = scripted_queue(&Arc::new(AtomicUsize::new(0)));
    let worker = Arc::new(Worker::new(
        queue,
        WorkerConfig::new(2).with_average_polling_interval(Duration::from_secs(3600)),
    ));
    let handle = spawn_run(&worker);
    eventually(|| worker.is_running()).await;

    tokio::time::timeout(Duration::from_secs(5), worker.stop(true))
        .await
        .unwrap();
    handle.await.unwrap().unwrap();
    assert!(!worker.is_running());
}

#[tokio::test]
async fn test_stop_waits_for_running_job() {
    let gate = Gate::new();
    let queue = gated_queue(&gate);
    queue.enqueue(&Gated(Arc::clone(&gate)), Priority::High, None).await.unwrap();

    let worker = Arc::new(Worker::new(
        queue,
        WorkerConfig::new(1).with_block_timeout(Duration::from_millis(20)),
    ));
    let handle = spawn_run(&worker);
    eventually(|| gate.active.load(Ordering::SeqCst) == 1).await;

    let stopping = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.stop(true).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished());

    gate.release.add_permits(1);
    stopping.await.unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(gate.finished.load(Ordering::SeqCst), 1);
    assert_eq!(worker.stats().jobs_completed, 1);
}

#[tokio::test]
async fn test_run_twice_is_rejected() {
    let queue = scripted_queue(&Arc::new(AtomicUsize::new(0)));
    let worker = Arc::new(Worker::new(
        queue,
        WorkerConfig::new(1).with_block_timeout(Duration::from_millis(20)),
    ));
    let handle = spawn_run(&worker);
    eventually(|| worker.is_running()).await;

    assert!(matches!(worker.run().await, Err(PoolError::AlreadyRunning)));

    worker.stop(true).await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_zero_units_is_raised_to_one() {
    let queue = scripted_queue(&Arc::new(AtomicUsize::new(0)));
    let mut config = WorkerConfig::default();
    config.max_concurrent_jobs = 0;

    let worker = Worker::new(queue, config);
    assert_eq!(worker.config().max_concurrent_jobs, 1);
    assert_eq!(worker.stats().num_units, 1);
}
