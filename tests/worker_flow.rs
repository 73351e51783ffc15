//! End-to-end worker behaviour against the in-memory broker

use async_trait::async_trait;
use chrono::Utc;
use redis_task_queue::{
    Broker, Handler, MemoryBroker, RetryPolicy, ServeMux, Task, TaskClient, TaskContext, TaskError,
    TaskOption, TaskState, Worker, WorkerConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

fn fast_config(concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        concurrency,
        queues: HashMap::from([("default".to_string(), 1)]),
        shutdown_timeout: Duration::from_secs(2),
        scheduler_interval: Duration::from_millis(20),
        recoverer_interval: Duration::from_millis(20),
        poll_interval: Duration::from_millis(5),
        max_poll_interval: Duration::from_millis(20),
        retry_policy: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40), 0.0),
        ..WorkerConfig::default()
    }
}

fn start<H: Handler + 'static>(worker: &Arc<Worker>, handler: H) -> JoinHandle<()> {
    let worker = worker.clone();
    tokio::spawn(async move { worker.run(handler).await.unwrap() })
}

/// Poll `$cond` every 10ms for up to three seconds
macro_rules! wait_for {
    ($what:expr, $cond:expr) => {{
        let mut met = false;
        for _ in 0..300 {
            if $cond {
                met = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(met, "timed out waiting for {}", $what);
    }};
}

async fn idle(broker: &MemoryBroker) -> bool {
    let stats = broker.stats().await.unwrap();
    stats.pending_total() == 0 && stats.scheduled == 0 && stats.active == 0
}

struct Counting {
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for Counting {
    async fn process_task(&self, _ctx: TaskContext, _task: Task) -> anyhow::Result<()> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn email_task_is_delivered_exactly_once() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    let task = Task::new("email:deliver", br#"{"user_id":42,"template_id":"welcome"}"#.to_vec());
    let result = client.enqueue(&task, &[]).await.unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let mut mux = ServeMux::new();
    mux.handle("email:deliver", Counting { hits: hits.clone() });

    let worker = Arc::new(Worker::new(fast_config(4), broker.clone()).unwrap());
    let handle = start(&worker, mux);

    wait_for!("task acked", idle(&broker).await && hits.load(Ordering::SeqCst) == 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.signal_shutdown();
    handle.await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(client.task_info(result.id).await.unwrap().is_none());
    assert!(client.dead_letters(10).await.unwrap().is_empty());
    let stats = worker.get_stats().await;
    assert_eq!(stats.tasks_successful, 1);
    assert_eq!(stats.tasks_failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_hand_out_a_task_twice() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    for i in 0..200 {
        client
            .enqueue(&Task::new("email:deliver", format!("{{\"n\":{}}}", i).into_bytes()), &[])
            .await
            .unwrap();
    }

    let mut claimers = Vec::new();
    for _ in 0..16 {
        let broker = broker.clone();
        claimers.push(tokio::spawn(async move {
            let queues = vec!["default".to_string()];
            let mut ids = Vec::new();
            let lease = Utc::now() + chrono::Duration::seconds(30);
            while let Some(msg) = broker.dequeue(&queues, lease).await.unwrap() {
                ids.push(msg.id);
            }
            ids
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut total = 0;
    for claimer in claimers {
        for id in claimer.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "task {} claimed twice", id);
        }
    }
    assert_eq!(total, 200);
    assert_eq!(broker.stats().await.unwrap().active, 200);
}

#[tokio::test]
async fn weighted_queues_are_served_six_three_one() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    for queue in ["critical", "default", "low"] {
        for _ in 0..100 {
            client
                .enqueue(&Task::new("noop", b"{}".to_vec()), &[TaskOption::Queue(queue.to_string())])
                .await
                .unwrap();
        }
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut mux = ServeMux::new();
    let recorded = order.clone();
    mux.handle_func("noop", move |ctx: TaskContext, _task| {
        let recorded = recorded.clone();
        async move {
            recorded.lock().unwrap().push(ctx.queue);
            Ok(())
        }
    });

    let config = WorkerConfig {
        queues: HashMap::from([
            ("critical".to_string(), 6),
            ("default".to_string(), 3),
            ("low".to_string(), 1),
        ]),
        ..fast_config(1)
    };
    let worker = Arc::new(Worker::new(config, broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("first hundred tasks", order.lock().unwrap().len() >= 100);
    worker.signal_shutdown();
    handle.await.unwrap();

    let first: Vec<String> = order.lock().unwrap().iter().take(100).cloned().collect();
    let count = |q: &str| first.iter().filter(|name| name.as_str() == q).count();
    assert!((58..=62).contains(&count("critical")), "critical {}", count("critical"));
    assert!((28..=32).contains(&count("default")), "default {}", count("default"));
    assert!((8..=12).contains(&count("low")), "low {}", count("low"));
}

#[tokio::test]
async fn failing_task_is_retried_then_dead_lettered() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    let task = Task::new("email:deliver", b"{}".to_vec());
    let result = client.enqueue(&task, &[TaskOption::MaxRetry(2)]).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let mut mux = ServeMux::new();
    let counter = attempts.clone();
    mux.handle_func("email:deliver", move |_ctx, _task| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("smtp server unreachable"))
        }
    });

    let worker = Arc::new(Worker::new(fast_config(2), broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("dead letter", broker.stats().await.unwrap().dead == 1);
    worker.signal_shutdown();
    handle.await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let info = client.task_info(result.id).await.unwrap().unwrap();
    assert_eq!(info.state, TaskState::Dead);
    assert_eq!(info.message.retry_count, 2);
    let dead = client.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0]
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("smtp server unreachable"));
    assert!(dead[0].last_failed_at.is_some());

    let stats = worker.get_stats().await;
    assert_eq!(stats.tasks_retried, 2);
    assert_eq!(stats.tasks_dead_lettered, 1);
}

#[tokio::test]
async fn skip_retry_and_unknown_types_are_dead_lettered_immediately() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut mux = ServeMux::new();
    let counter = attempts.clone();
    mux.handle_func("image:resize", move |_ctx, _task| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::Error::from(TaskError::skip_retry("source image is corrupt")))
        }
    });

    client.enqueue(&Task::new("image:resize", b"{}".to_vec()), &[]).await.unwrap();
    client.enqueue(&Task::new("video:encode", b"{}".to_vec()), &[]).await.unwrap();

    let worker = Arc::new(Worker::new(fast_config(2), broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("both dead", broker.stats().await.unwrap().dead == 2);
    worker.signal_shutdown();
    handle.await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let dead = client.dead_letters(10).await.unwrap();
    let errors: Vec<String> = dead.iter().filter_map(|m| m.last_error.clone()).collect();
    assert!(errors.iter().any(|e| e.contains("source image is corrupt")));
    assert!(errors.iter().any(|e| e.contains("video:encode")));
    assert!(dead.iter().all(|m| m.retry_count == 0));
}

#[tokio::test]
async fn slow_handler_times_out_and_sees_cancellation() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    client
        .enqueue(
            &Task::new("image:resize", b"{}".to_vec()),
            &[TaskOption::Timeout(Duration::from_millis(50)), TaskOption::MaxRetry(0)],
        )
        .await
        .unwrap();

    let mut mux = ServeMux::new();
    mux.handle_func("image:resize", |ctx: TaskContext, _task| async move {
        assert!(ctx.deadline.is_some());
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    });

    let worker = Arc::new(Worker::new(fast_config(1), broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("timeout dead letter", broker.stats().await.unwrap().dead == 1);
    worker.signal_shutdown();
    handle.await.unwrap();

    let dead = client.dead_letters(1).await.unwrap();
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("timed out"));
}

#[tokio::test]
async fn task_past_its_deadline_is_not_run() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    client
        .enqueue(
            &Task::new("email:deliver", b"{}".to_vec()),
            &[
                TaskOption::ProcessIn(Duration::from_millis(150)),
                TaskOption::Deadline(Utc::now() + chrono::Duration::milliseconds(50)),
            ],
        )
        .await
        .unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let mut mux = ServeMux::new();
    mux.handle("email:deliver", Counting { hits: hits.clone() });

    let worker = Arc::new(Worker::new(fast_config(1), broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("deadline dead letter", broker.stats().await.unwrap().dead == 1);
    worker.signal_shutdown();
    handle.await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let dead = client.dead_letters(1).await.unwrap();
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("Deadline exceeded"));
}

#[tokio::test]
async fn task_abandoned_by_a_crashed_worker_is_redelivered() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    let result = client
        .enqueue(&Task::new("email:deliver", b"{}".to_vec()), &[])
        .await
        .unwrap();

    // A worker claims it and dies without ever renewing the lease.
    let lost = broker
        .dequeue(&["default".to_string()], Utc::now() + chrono::Duration::milliseconds(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lost.id, result.id);

    let retries = Arc::new(Mutex::new(Vec::new()));
    let mut mux = ServeMux::new();
    let seen = retries.clone();
    mux.handle_func("email:deliver", move |ctx: TaskContext, _task| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push((ctx.task_id, ctx.retry_count));
            Ok(())
        }
    });

    let worker = Arc::new(Worker::new(fast_config(1), broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("redelivery", idle(&broker).await && !retries.lock().unwrap().is_empty());
    worker.signal_shutdown();
    handle.await.unwrap();

    assert_eq!(*retries.lock().unwrap(), vec![(result.id, 0)]);
}

#[tokio::test]
async fn delayed_task_runs_no_earlier_than_requested() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    let result = client
        .enqueue(
            &Task::new("email:deliver", b"{}".to_vec()),
            &[TaskOption::ProcessIn(Duration::from_millis(200))],
        )
        .await
        .unwrap();
    assert_eq!(result.state, TaskState::Scheduled);

    let ran_at = Arc::new(Mutex::new(None));
    let mut mux = ServeMux::new();
    let slot = ran_at.clone();
    mux.handle_func("email:deliver", move |_ctx, _task| {
        let slot = slot.clone();
        async move {
            *slot.lock().unwrap() = Some(Utc::now());
            Ok(())
        }
    });

    let worker = Arc::new(Worker::new(fast_config(1), broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("delayed run", ran_at.lock().unwrap().is_some());
    worker.signal_shutdown();
    handle.await.unwrap();

    let ran_at = ran_at.lock().unwrap().unwrap();
    assert!(ran_at >= result.process_at);
    assert!(ran_at - result.process_at < chrono::Duration::seconds(2));
}

#[tokio::test]
async fn shutdown_lets_in_flight_tasks_finish() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    client
        .enqueue(&Task::new("image:resize", b"{}".to_vec()), &[])
        .await
        .unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let mut mux = ServeMux::new();
    let (s, f) = (started.clone(), finished.clone());
    mux.handle_func("image:resize", move |_ctx, _task| {
        let (s, f) = (s.clone(), f.clone());
        async move {
            s.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let worker = Arc::new(Worker::new(fast_config(2), broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("task started", started.load(Ordering::SeqCst) == 1);
    worker.signal_shutdown();
    handle.await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(idle(&broker).await);
}

#[tokio::test]
async fn shutdown_abandons_tasks_that_outlive_the_grace_period() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    let result = client
        .enqueue(&Task::new("image:resize", b"{}".to_vec()), &[])
        .await
        .unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let mut mux = ServeMux::new();
    let s = started.clone();
    mux.handle_func("image:resize", move |_ctx, _task| {
        let s = s.clone();
        async move {
            s.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    });

    let config = WorkerConfig {
        shutdown_timeout: Duration::from_millis(100),
        ..fast_config(1)
    };
    let worker = Arc::new(Worker::new(config, broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("task started", started.load(Ordering::SeqCst) == 1);
    worker.signal_shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stopped after grace period")
        .unwrap();

    // Still leased; the recoverer hands it out again once the lease runs out.
    let info = client.task_info(result.id).await.unwrap().unwrap();
    assert_eq!(info.state, TaskState::Active);
    assert!(client.dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn handler_outliving_its_lease_keeps_renewing() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    client
        .enqueue(&Task::new("image:resize", b"{}".to_vec()), &[])
        .await
        .unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let mut mux = ServeMux::new();
    let h = hits.clone();
    mux.handle_func("image:resize", move |_ctx, _task| {
        let h = h.clone();
        async move {
            h.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        }
    });

    let config = WorkerConfig {
        lease_duration: Duration::from_millis(90),
        recoverer_interval: Duration::from_millis(10),
        ..fast_config(2)
    };
    let worker = Arc::new(Worker::new(config, broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("task started", hits.load(Ordering::SeqCst) == 1);
    wait_for!("task acked", idle(&broker).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.signal_shutdown();
    handle.await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let stats = broker.stats().await.unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.pending_total(), 0);
    let stats = worker.get_stats().await;
    assert_eq!(stats.tasks_successful, 1);
    assert_eq!(stats.tasks_failed, 0);
}

#[tokio::test]
async fn lost_lease_abandons_the_attempt_without_ack() {
    let broker = Arc::new(MemoryBroker::new());
    let client = TaskClient::from_broker(broker.clone());
    let result = client
        .enqueue(&Task::new("image:resize", b"{}".to_vec()), &[])
        .await
        .unwrap();

    let attempts = Arc::new(Mutex::new(Vec::<TaskContext>::new()));
    let mut mux = ServeMux::new();
    let seen = attempts.clone();
    mux.handle_func("image:resize", move |ctx: TaskContext, _task| {
        let seen = seen.clone();
        async move {
            let first = {
                let mut seen = seen.lock().unwrap();
                seen.push(ctx.clone());
                seen.len() == 1
            };
            if first {
                ctx.cancelled().await;
                anyhow::bail!("first attempt cancelled");
            }
            Ok(())
        }
    });

    let config = WorkerConfig {
        lease_duration: Duration::from_millis(90),
        ..fast_config(1)
    };
    let worker = Arc::new(Worker::new(config, broker.clone()).unwrap());
    let handle = start(&worker, mux);
    wait_for!("first attempt", attempts.lock().unwrap().len() == 1);

    // Another process decides the claim is dead and hands the task out again.
    let recovered = broker
        .recover_expired(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    wait_for!("second attempt", attempts.lock().unwrap().len() == 2);
    wait_for!("task acked", idle(&broker).await);
    worker.signal_shutdown();
    handle.await.unwrap();

    let attempts = attempts.lock().unwrap().clone();
    assert!(attempts[0].is_cancelled());
    assert!(!attempts[1].is_cancelled());
    assert!(attempts.iter().all(|ctx| ctx.task_id == result.id && ctx.retry_count == 0));
    assert!(client.task_info(result.id).await.unwrap().is_none());
    assert!(client.dead_letters(10).await.unwrap().is_empty());
    let stats = worker.get_stats().await;
    assert_eq!(stats.tasks_processed, 1);
    assert_eq!(stats.tasks_successful, 1);
    assert_eq!(stats.tasks_failed, 0);
    assert_eq!(stats.tasks_retried, 0);
}
