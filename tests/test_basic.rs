//! Integration tests.
//!
//! Requires a Redis server on 127.0.0.1:6379; tests use database 7 under the
//! `testResque` namespace and flush it between tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::{json, Value};

use rusque::application::{stat, status};
use rusque::models::job::{Envelope, Status};
use rusque::{
    Event, HandlerError, HookData, HookFlow, Job, JobHandler, MatchSpec, Queue, RusqueError,
    Worker,
};

use crate::support::*;

mod support;

/// Handler that counts its invocations.
struct CountingJob {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for CountingJob {
    async fn perform(&self, _job: &Job) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler that always fails.
struct FailingJob;

#[async_trait]
impl JobHandler for FailingJob {
    async fn perform(&self, _job: &Job) -> Result<(), HandlerError> {
        Err("boom".into())
    }
}

/// Handler that crashes its child execution outright.
struct PanickingJob;

#[async_trait]
impl JobHandler for PanickingJob {
    async fn perform(&self, _job: &Job) -> Result<(), HandlerError> {
        panic!("handler exploded");
    }
}

/// Handler that appends a tag to a shared log, for ordering assertions.
struct RecordingJob {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl JobHandler for RecordingJob {
    async fn perform(&self, _job: &Job) -> Result<(), HandlerError> {
        self.log.lock().unwrap().push(self.tag);
        Ok(())
    }
}

fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn enqueue_and_process_success() {
    let (_guard, mut context) = init().await;
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        context
            .registry
            .register("J", move || CountingJob { calls: calls.clone() });
    }
    let context = Arc::new(context);

    let id = context
        .enqueue("jobs", "J", Some(json!({"k": 1})), true)
        .await
        .unwrap()
        .unwrap();

    let mut worker = Worker::new(context.clone(), queues(&["jobs"])).unwrap();
    let worker_id = worker.id().to_string();
    worker.work(0).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut conn = raw_conn().await;
    let keys = test_keys();
    assert_eq!(stat::get(&mut conn, &keys, "processed").await.unwrap(), 1);
    assert_eq!(stat::get(&mut conn, &keys, "failed").await.unwrap(), 0);
    assert_eq!(
        status::get(&mut conn, &keys, &id).await.unwrap(),
        Some(Status::Complete)
    );

    let current: Option<String> = conn.get(keys.worker(&worker_id)).await.unwrap();
    assert!(current.is_none());
    let failed: Option<String> = conn.get(keys.failed(&id)).await.unwrap();
    assert!(failed.is_none());

    // single-shot run unregisters the worker on exit
    assert!(Worker::all(&mut conn, &keys).await.unwrap().is_empty());
    let started: Option<String> = conn.get(keys.worker_started(&worker_id)).await.unwrap();
    assert!(started.is_none());
}

#[tokio::test]
async fn handler_failure_is_recorded() {
    let (_guard, mut context) = init().await;
    context.registry.register("F", || FailingJob);
    let context = Arc::new(context);

    let id = context
        .enqueue("jobs", "F", Some(json!({"k": 1})), true)
        .await
        .unwrap()
        .unwrap();

    let mut worker = Worker::new(context.clone(), queues(&["jobs"])).unwrap();
    let worker_id = worker.id().to_string();
    worker.work(0).await.unwrap();

    let mut conn = raw_conn().await;
    let keys = test_keys();
    assert_eq!(stat::get(&mut conn, &keys, "failed").await.unwrap(), 1);
    assert_eq!(stat::get(&mut conn, &keys, "processed").await.unwrap(), 0);
    assert_eq!(
        status::get(&mut conn, &keys, &id).await.unwrap(),
        Some(Status::Failed)
    );

    let raw: String = conn.get(keys.failed(&id)).await.unwrap();
    let record: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["exception"], "HandlerError");
    assert!(record["error"].as_str().unwrap().contains("boom"));
    assert!(!record["backtrace"].as_array().unwrap().is_empty());
    assert_eq!(record["queue"], "jobs");
    assert_eq!(record["worker"], worker_id.as_str());
    assert_eq!(record["payload"]["class"], "F");

    // failure records carry a bounded lifetime
    let ttl: i64 = conn.ttl(keys.failed(&id)).await.unwrap();
    assert!(ttl > 0 && ttl <= 14 * 24 * 60 * 60);
}

#[tokio::test]
async fn dont_perform_skips_handler() {
    let (_guard, mut context) = init().await;
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        context
            .registry
            .register("J", move || CountingJob { calls: calls.clone() });
    }
    context.events.listen(
        Event::BeforePerform,
        Arc::new(|_: &HookData| -> rusque::RusqueResult<HookFlow> {
            Ok(HookFlow::DontPerform)
        }),
    );
    let context = Arc::new(context);

    context
        .enqueue("jobs", "J", Some(json!({"k": 1})), false)
        .await
        .unwrap()
        .unwrap();

    let mut worker = Worker::new(context.clone(), queues(&["jobs"])).unwrap();
    worker.work(0).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let mut conn = raw_conn().await;
    let keys = test_keys();
    assert_eq!(stat::get(&mut conn, &keys, "processed").await.unwrap(), 0);
    assert_eq!(stat::get(&mut conn, &keys, "failed").await.unwrap(), 0);
}

#[tokio::test]
async fn selective_dequeue_by_class_and_id() {
    let (_guard, context) = init().await;
    let context = Arc::new(context);

    for (class, id) in [("A", "1"), ("B", "2"), ("C", "3")] {
        context
            .enqueue("jobs", class, Some(json!({ "id": id })), false)
            .await
            .unwrap()
            .unwrap();
    }

    let removed = context
        .dequeue(
            "jobs",
            &[MatchSpec::ClassWithId {
                class: "B".to_string(),
                id: "2".to_string(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let mut conn = raw_conn().await;
    let keys = test_keys();
    let queue = Queue::new(&keys, "jobs");
    let first = queue.pop(&mut conn).await.unwrap().unwrap();
    assert_eq!((first.class.as_str(), first.id.as_str()), ("A", "1"));
    let second = queue.pop(&mut conn).await.unwrap().unwrap();
    assert_eq!((second.class.as_str(), second.id.as_str()), ("C", "3"));
    assert!(queue.pop(&mut conn).await.unwrap().is_none());
}

#[tokio::test]
async fn selective_dequeue_preserves_survivor_order() {
    let (_guard, context) = init().await;
    let context = Arc::new(context);

    for (class, id) in [("X", "1"), ("Y", "2"), ("X", "3"), ("Z", "4"), ("X", "5")] {
        context
            .enqueue("jobs", class, Some(json!({ "id": id })), false)
            .await
            .unwrap()
            .unwrap();
    }

    let removed = context
        .dequeue("jobs", &[MatchSpec::Class("X".to_string())])
        .await
        .unwrap();
    assert_eq!(removed, 3);

    let mut conn = raw_conn().await;
    let keys = test_keys();
    let queue = Queue::new(&keys, "jobs");
    let survivors: Vec<String> = vec![
        queue.pop(&mut conn).await.unwrap().unwrap().class,
        queue.pop(&mut conn).await.unwrap().unwrap().class,
    ];
    assert_eq!(survivors, vec!["Y", "Z"]);
    assert!(queue.pop(&mut conn).await.unwrap().is_none());
}

#[tokio::test]
async fn dequeue_with_no_specs_clears_queue() {
    let (_guard, context) = init().await;
    let context = Arc::new(context);

    for _ in 0..3 {
        context
            .enqueue("jobs", "J", Some(json!({"k": 1})), false)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(context.dequeue("jobs", &[]).await.unwrap(), 3);
    assert_eq!(context.size("jobs").await.unwrap(), 0);
}

#[tokio::test]
async fn prune_removes_only_dead_local_workers() {
    let (_guard, context) = init().await;
    let context = Arc::new(context);
    let mut worker = Worker::new(context.clone(), queues(&["jobs"])).unwrap();

    let mut conn = raw_conn().await;
    let keys = test_keys();
    let host = hostname::get().unwrap().to_string_lossy().into_owned();

    // a live entry (this process), a dead local entry, and a remote entry
    let dead = format!("{}:1:jobs", host);
    let remote = "elsewhere:999:jobs";
    let _: () = conn.sadd(keys.workers(), worker.id()).await.unwrap();
    let _: () = conn.sadd(keys.workers(), &dead).await.unwrap();
    let _: () = conn.sadd(keys.workers(), remote).await.unwrap();

    worker.prune_dead_workers().await.unwrap();

    let mut remaining = Worker::all(&mut conn, &keys).await.unwrap();
    remaining.sort();
    let mut expected = vec![worker.id().to_string(), remote.to_string()];
    expected.sort();
    assert_eq!(remaining, expected);
}

#[tokio::test]
async fn queue_priority_order() {
    let (_guard, mut context) = init().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    for tag in ["H", "M", "L"] {
        let log = log.clone();
        context.registry.register(tag, move || RecordingJob {
            tag,
            log: log.clone(),
        });
    }
    let context = Arc::new(context);

    // pushed out of priority order
    for (queue, class) in [("low", "L"), ("high", "H"), ("medium", "M")] {
        context
            .enqueue(queue, class, Some(json!({"k": 1})), false)
            .await
            .unwrap()
            .unwrap();
    }

    let mut worker = Worker::new(context.clone(), queues(&["high", "medium", "low"])).unwrap();
    worker.work(0).await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["H", "M", "L"]);
}

#[tokio::test]
async fn wildcard_worker_polls_queues_alphabetically() {
    let (_guard, mut context) = init().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    for tag in ["A", "B"] {
        let log = log.clone();
        context.registry.register(tag, move || RecordingJob {
            tag,
            log: log.clone(),
        });
    }
    let context = Arc::new(context);

    context
        .enqueue("beta", "B", Some(json!({"k": 1})), false)
        .await
        .unwrap()
        .unwrap();
    context
        .enqueue("alpha", "A", Some(json!({"k": 1})), false)
        .await
        .unwrap()
        .unwrap();

    let mut worker = Worker::new(context.clone(), queues(&["*"])).unwrap();
    worker.work(0).await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
}

#[tokio::test]
async fn push_pop_fifo_and_size() {
    let (_guard, _context) = init().await;
    let mut conn = raw_conn().await;
    let keys = test_keys();
    let queue = Queue::new(&keys, "jobs");

    for n in 0..5u64 {
        let envelope = Envelope::new("J", Some(json!({ "n": n })), n.to_string());
        queue.push(&mut conn, &envelope).await.unwrap();
        assert_eq!(queue.size(&mut conn).await.unwrap(), n + 1);
    }

    for n in 0..5u64 {
        let envelope = queue.pop(&mut conn).await.unwrap().unwrap();
        assert_eq!(envelope.id, n.to_string());
        assert_eq!(queue.size(&mut conn).await.unwrap(), 4 - n);
    }
    assert!(queue.pop(&mut conn).await.unwrap().is_none());
}

#[tokio::test]
async fn reserved_arguments_match_enqueued() {
    let (_guard, context) = init().await;
    let context = Arc::new(context);

    let args = json!({"a": 1, "b": "two", "c": [1, 2, 3], "d": {"x": true}});
    context
        .enqueue("jobs", "J", Some(args.clone()), false)
        .await
        .unwrap()
        .unwrap();

    let mut conn = raw_conn().await;
    let keys = test_keys();
    let job = Job::reserve(&mut conn, &keys, "jobs").await.unwrap().unwrap();
    assert_eq!(job.arguments(), &args);
    assert_eq!(job.class(), "J");
    assert_eq!(job.queue, "jobs");
}

#[tokio::test]
async fn recreate_mints_new_tracked_id() {
    let (_guard, context) = init().await;
    let context = Arc::new(context);

    let id = context
        .enqueue("jobs", "J", Some(json!({"k": 1})), true)
        .await
        .unwrap()
        .unwrap();

    let mut conn = raw_conn().await;
    let keys = test_keys();
    let job = Job::reserve(&mut conn, &keys, "jobs").await.unwrap().unwrap();
    let new_id = job.recreate(&mut conn, &keys).await.unwrap();

    assert_ne!(new_id, id);
    assert_eq!(
        status::get(&mut conn, &keys, &new_id).await.unwrap(),
        Some(Status::Waiting)
    );

    let requeued = Job::reserve(&mut conn, &keys, "jobs").await.unwrap().unwrap();
    assert_eq!(requeued.id(), new_id);
    assert_eq!(requeued.class(), "J");
    assert_eq!(requeued.arguments(), job.arguments());
}

#[tokio::test]
async fn paused_worker_processes_nothing() {
    let (_guard, mut context) = init().await;
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        context
            .registry
            .register("J", move || CountingJob { calls: calls.clone() });
    }
    let context = Arc::new(context);

    context
        .enqueue("jobs", "J", Some(json!({"k": 1})), false)
        .await
        .unwrap()
        .unwrap();

    let mut worker = Worker::new(context.clone(), queues(&["jobs"])).unwrap();
    worker.pause_processing();
    worker.work(0).await.unwrap();

    let mut conn = raw_conn().await;
    let keys = test_keys();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(stat::get(&mut conn, &keys, "processed").await.unwrap(), 0);
    assert_eq!(context.size("jobs").await.unwrap(), 1);

    worker.unpause_processing();
    worker.work(0).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stat::get(&mut conn, &keys, "processed").await.unwrap(), 1);
}

#[tokio::test]
async fn panicking_handler_records_dirty_exit() {
    let (_guard, mut context) = init().await;
    context.registry.register("P", || PanickingJob);
    let context = Arc::new(context);

    let id = context
        .enqueue("jobs", "P", Some(json!({"k": 1})), true)
        .await
        .unwrap()
        .unwrap();

    let mut worker = Worker::new(context.clone(), queues(&["jobs"])).unwrap();
    worker.work(0).await.unwrap();

    let mut conn = raw_conn().await;
    let keys = test_keys();
    assert_eq!(stat::get(&mut conn, &keys, "failed").await.unwrap(), 1);
    assert_eq!(stat::get(&mut conn, &keys, "processed").await.unwrap(), 0);
    assert_eq!(
        status::get(&mut conn, &keys, &id).await.unwrap(),
        Some(Status::Failed)
    );

    let raw: String = conn.get(keys.failed(&id)).await.unwrap();
    let record: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["exception"], "DirtyExitError");
    assert!(record["error"].as_str().unwrap().contains("panicked"));
}

#[tokio::test]
async fn unknown_handler_class_fails_job() {
    let (_guard, context) = init().await;
    let context = Arc::new(context);

    let id = context
        .enqueue("jobs", "Unknown", Some(json!({"k": 1})), true)
        .await
        .unwrap()
        .unwrap();

    let mut worker = Worker::new(context.clone(), queues(&["jobs"])).unwrap();
    worker.work(0).await.unwrap();

    let mut conn = raw_conn().await;
    let keys = test_keys();
    assert_eq!(stat::get(&mut conn, &keys, "failed").await.unwrap(), 1);
    let raw: String = conn.get(keys.failed(&id)).await.unwrap();
    let record: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["exception"], "HandlerNotFound");
}

#[tokio::test]
async fn before_enqueue_listener_aborts_enqueue() {
    let (_guard, context) = init().await;
    context.events.listen(
        Event::BeforeEnqueue,
        Arc::new(|_: &HookData| -> rusque::RusqueResult<HookFlow> {
            Ok(HookFlow::DontPerform)
        }),
    );
    let context = Arc::new(context);

    let id = context
        .enqueue("jobs", "J", Some(json!({"k": 1})), false)
        .await
        .unwrap();
    assert!(id.is_none());
    assert_eq!(context.size("jobs").await.unwrap(), 0);
}

#[tokio::test]
async fn non_mapping_args_are_rejected() {
    let (_guard, context) = init().await;
    let context = Arc::new(context);

    let result = context
        .enqueue("jobs", "J", Some(json!([1, 2, 3])), false)
        .await;
    assert!(matches!(result, Err(RusqueError::InvalidArgument(_))));
    assert_eq!(context.size("jobs").await.unwrap(), 0);
}

#[tokio::test]
async fn status_records_carry_a_ttl() {
    let (_guard, context) = init().await;
    let context = Arc::new(context);

    let id = context
        .enqueue("jobs", "J", Some(json!({"k": 1})), true)
        .await
        .unwrap()
        .unwrap();

    let mut conn = raw_conn().await;
    let keys = test_keys();
    assert_eq!(
        status::get(&mut conn, &keys, &id).await.unwrap(),
        Some(Status::Waiting)
    );
    let ttl: i64 = conn.ttl(keys.status(&id)).await.unwrap();
    assert!(ttl > 0 && ttl <= 24 * 60 * 60);

    status::stop(&mut conn, &keys, &id).await.unwrap();
    assert_eq!(status::get(&mut conn, &keys, &id).await.unwrap(), None);
    assert!(!status::is_tracking(&mut conn, &keys, &id).await.unwrap());
}

#[tokio::test]
async fn queue_set_tracks_pushed_queues() {
    let (_guard, context) = init().await;
    let context = Arc::new(context);

    for queue in ["beta", "alpha"] {
        context
            .enqueue(queue, "J", Some(json!({"k": 1})), false)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(context.queues().await.unwrap(), vec!["alpha", "beta"]);
    assert_eq!(context.size("alpha").await.unwrap(), 1);
}
