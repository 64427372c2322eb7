use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use mediapub_core::models::{TaskOptions, TaskPayload, TaskStatus, TaskType};
use mediapub_core::TaskError;
use mediapub_worker::{
    Broker, HandlerContext, MemoryBroker, ResultChannel, TaskBus, TaskBusConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Job {
    id: u32,
}

impl TaskPayload for Job {
    fn task_type() -> TaskType {
        TaskType::from_static("test:job")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobDone {
    id: u32,
    attempts: u32,
}

impl TaskPayload for JobDone {
    fn task_type() -> TaskType {
        TaskType::from_static("test:job:result")
    }
}

fn fast_config() -> TaskBusConfig {
    TaskBusConfig {
        poll_interval_ms: 10,
        stats_interval_secs: 0,
        stale_task_reap_interval_secs: 0,
        shutdown_grace_secs: 5,
        ..TaskBusConfig::default()
    }
}

fn bus_with(broker: Arc<MemoryBroker>, config: TaskBusConfig) -> Arc<TaskBus> {
    Arc::new(
        TaskBus::new(broker, config).with_default_retry_delay(Arc::new(|_, _, _| Duration::ZERO)),
    )
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn run(bus: &Arc<TaskBus>) -> tokio::task::JoinHandle<()> {
    let bus = bus.clone();
    tokio::spawn(async move {
        bus.start_handlers().await.unwrap();
    })
}

#[tokio::test]
async fn handler_failing_until_nth_attempt_succeeds_once() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = bus_with(broker.clone(), fast_config());
    let calls = Arc::new(AtomicU32::new(0));
    let successes = Arc::new(AtomicU32::new(0));

    let (c, s) = (calls.clone(), successes.clone());
    bus.add_handler(move |_ctx, _job: Job| {
        let (c, s) = (c.clone(), s.clone());
        async move {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                anyhow::bail!("transient failure {n}");
            }
            s.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    })
    .unwrap();

    let id = bus
        .put_payload(&Job { id: 1 }, TaskOptions::default().max_retry(5))
        .await
        .unwrap();
    let handle = run(&bus);

    let b = broker.clone();
    let task_id = id.clone();
    wait_for(move || {
        let b = b.clone();
        let task_id = task_id.clone();
        async move {
            matches!(b.get(&task_id).await.unwrap(), Some(t) if t.status == TaskStatus::Completed)
        }
    })
    .await;

    bus.shutdown();
    tokio_test::assert_ok!(handle.await);

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    let task = broker.get(&id).await.unwrap().unwrap();
    assert_eq!(task.retried, 2);
}

#[tokio::test]
async fn skip_retry_error_is_never_reinvoked() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = bus_with(broker.clone(), fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    let c = calls.clone();
    bus.add_handler(move |_ctx, _job: Job| {
        let c = c.clone();
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::Error::from(TaskError::skip_retry(anyhow::anyhow!(
                "unreadable media"
            ))))
        }
    })
    .unwrap();

    let id = bus
        .put_payload(&Job { id: 2 }, TaskOptions::default().max_retry(10))
        .await
        .unwrap();
    let handle = run(&bus);

    let b = broker.clone();
    let task_id = id.clone();
    wait_for(move || {
        let b = b.clone();
        let task_id = task_id.clone();
        async move {
            matches!(b.get(&task_id).await.unwrap(), Some(t) if t.status == TaskStatus::Failed)
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    bus.shutdown();
    handle.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let task = broker.get(&id).await.unwrap().unwrap();
    assert_eq!(task.retried, 0);
    assert!(task.last_error.unwrap().contains("unreadable media"));
}

#[tokio::test]
async fn retries_exhausted_archives_as_failed() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = bus_with(broker.clone(), fast_config());
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let a = attempts.clone();
    bus.add_handler(move |ctx: HandlerContext, _job: Job| {
        let a = a.clone();
        async move {
            a.lock().await.push((ctx.retried, ctx.is_last_attempt()));
            Err::<(), _>(anyhow::anyhow!("always fails"))
        }
    })
    .unwrap();

    let id = bus
        .put_payload(&Job { id: 3 }, TaskOptions::default().max_retry(2))
        .await
        .unwrap();
    let handle = run(&bus);

    let b = broker.clone();
    let task_id = id.clone();
    wait_for(move || {
        let b = b.clone();
        let task_id = task_id.clone();
        async move {
            matches!(b.get(&task_id).await.unwrap(), Some(t) if t.status == TaskStatus::Failed)
        }
    })
    .await;

    bus.shutdown();
    handle.await.unwrap();

    assert_eq!(
        *attempts.lock().await,
        vec![(0, false), (1, false), (2, true)]
    );
}

#[tokio::test]
async fn handler_timeout_counts_as_failure() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = bus_with(broker.clone(), fast_config());

    bus.add_handler(|_ctx, _job: Job| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<(), anyhow::Error>(())
    })
    .unwrap();

    let id = bus
        .put_payload(
            &Job { id: 4 },
            TaskOptions::default()
                .max_retry(0)
                .timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    let handle = run(&bus);

    let b = broker.clone();
    let task_id = id.clone();
    wait_for(move || {
        let b = b.clone();
        let task_id = task_id.clone();
        async move {
            matches!(b.get(&task_id).await.unwrap(), Some(t) if t.status == TaskStatus::Failed)
        }
    })
    .await;

    bus.shutdown();
    handle.await.unwrap();

    let task = broker.get(&id).await.unwrap().unwrap();
    assert!(task.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn unknown_task_type_is_failed() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = bus_with(broker.clone(), fast_config());

    let id = bus
        .put(
            TaskType::from_static("test:nobody"),
            &serde_json::json!({}),
            TaskOptions::default(),
        )
        .await
        .unwrap();
    let handle = run(&bus);

    let b = broker.clone();
    let task_id = id.clone();
    wait_for(move || {
        let b = b.clone();
        let task_id = task_id.clone();
        async move {
            matches!(b.get(&task_id).await.unwrap(), Some(t) if t.status == TaskStatus::Failed)
        }
    })
    .await;

    bus.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn result_channel_delivers_to_second_handler() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = bus_with(broker.clone(), fast_config());
    let channel: ResultChannel<JobDone> = ResultChannel::new(bus.producer());
    let received = Arc::new(Mutex::new(Vec::new()));

    bus.add_handler(move |ctx: HandlerContext, job: Job| {
        let channel = channel.clone();
        async move {
            channel
                .send(
                    &ctx.task_id,
                    &JobDone {
                        id: job.id,
                        attempts: ctx.retried + 1,
                    },
                )
                .await?;
            Ok::<(), anyhow::Error>(())
        }
    })
    .unwrap();

    let r = received.clone();
    bus.add_handler(move |_ctx, done: JobDone| {
        let r = r.clone();
        async move {
            r.lock().await.push((done.id, done.attempts));
            Ok::<(), anyhow::Error>(())
        }
    })
    .unwrap();

    bus.put_payload(&Job { id: 7 }, TaskOptions::default())
        .await
        .unwrap();
    let handle = run(&bus);

    let r = received.clone();
    wait_for(move || {
        let r = r.clone();
        async move { !r.lock().await.is_empty() }
    })
    .await;

    bus.shutdown();
    handle.await.unwrap();

    assert_eq!(*received.lock().await, vec![(7, 1)]);
    let stats = broker.stats().await.unwrap();
    assert_eq!(stats.completed, 2);
}

#[tokio::test]
async fn shutdown_aborts_handlers_after_grace_period() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = bus_with(
        broker.clone(),
        TaskBusConfig {
            shutdown_grace_secs: 0,
            ..fast_config()
        },
    );
    let started = Arc::new(AtomicU32::new(0));

    let s = started.clone();
    bus.add_handler(move |_ctx, _job: Job| {
        let s = s.clone();
        async move {
            s.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), anyhow::Error>(())
        }
    })
    .unwrap();

    bus.put_payload(&Job { id: 9 }, TaskOptions::default())
        .await
        .unwrap();
    let handle = run(&bus);

    let s = started.clone();
    wait_for(move || {
        let s = s.clone();
        async move { s.load(Ordering::SeqCst) == 1 }
    })
    .await;

    bus.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker pool did not stop")
        .unwrap();

    let stats = broker.stats().await.unwrap();
    assert_eq!(stats.active, 1);
}
