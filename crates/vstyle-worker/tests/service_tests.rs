//! Queue service integration tests, run against the in-process backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use vstyle_models::{JobId, JobRecord, JobStatus, QueueName};
use vstyle_queue::{BackendMode, MemoryBackend, QueueBackend, QueueResult, RedisConfig};
use vstyle_worker::{
    work_fn, AdmissionPolicy, BackoffPolicy, ProgressReporter, QueueService, QueueServiceBuilder,
    QueueSettings, ServiceError, SubmitRequest, WorkError, WorkFunction, WorkResult, WorkerConfig,
};

fn test_config() -> WorkerConfig {
    let fast = BackoffPolicy::new(Duration::from_millis(20), Duration::from_millis(200));
    WorkerConfig {
        poll_wait: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
    .with_queue("analysis", QueueSettings::new(2, 3, fast))
    .with_queue("render", QueueSettings::new(1, 2, fast))
}

fn builder(config: WorkerConfig) -> QueueServiceBuilder {
    QueueService::builder(config).with_backend(Arc::new(MemoryBackend::new()))
}

async fn wait_terminal(service: &QueueService, id: &JobId) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let record = service.get_status(id).await.expect("status");
        if record.is_terminal() {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {}",
            id,
            record.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_status(service: &QueueService, id: &JobId, status: JobStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.get_status(id).await.expect("status").status != status {
        assert!(tokio::time::Instant::now() < deadline, "job {} never became {}", id, status);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Analysis work that requires a `videoId`.
struct Extract;

#[async_trait]
impl WorkFunction for Extract {
    async fn run(&self, payload: Value, progress: ProgressReporter) -> WorkResult<Value> {
        progress.report(30)?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        progress.report(70)?;
        Ok(json!({ "videoId": payload["videoId"], "style": "noir" }))
    }

    fn validate(&self, payload: &Value) -> Result<(), String> {
        match payload.get("videoId").and_then(Value::as_str) {
            Some(_) => Ok(()),
            None => Err("videoId is required".to_string()),
        }
    }
}

/// Broker shared by several services in one test, keeping record snapshots
/// the way the Redis backend does.
#[derive(Default)]
struct SharedBroker {
    queue: MemoryBackend,
    snapshots: Mutex<HashMap<JobId, JobRecord>>,
}

impl SharedBroker {
    fn snapshot(&self, id: &JobId) -> Option<JobRecord> {
        self.snapshots.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl QueueBackend for SharedBroker {
    fn mode(&self) -> BackendMode {
        BackendMode::Durable
    }

    async fn enqueue(&self, record: &JobRecord) -> QueueResult<()> {
        self.store_snapshot(record).await?;
        self.queue.enqueue(record).await
    }

    async fn dequeue(&self, queue: &QueueName, wait: Duration) -> QueueResult<Option<JobRecord>> {
        let dequeued = self.queue.dequeue(queue, wait).await?;
        Ok(dequeued.map(|record| self.snapshot(&record.id).unwrap_or(record)))
    }

    async fn ack(&self, id: &JobId) -> QueueResult<()> {
        self.queue.ack(id).await
    }

    async fn requeue_after(&self, id: &JobId, delay: Duration) -> QueueResult<()> {
        self.queue.requeue_after(id, delay).await
    }

    async fn len(&self, queue: &QueueName) -> QueueResult<u64> {
        self.queue.len(queue).await
    }

    async fn store_snapshot(&self, record: &JobRecord) -> QueueResult<()> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_snapshot(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        Ok(self.snapshot(id))
    }
}

/// A submit-only service and a worker service sharing one broker.
async fn api_and_worker(
    broker: &Arc<SharedBroker>,
    work: impl WorkFunction + 'static,
) -> (QueueService, QueueService) {
    let fast = BackoffPolicy::new(Duration::from_millis(20), Duration::from_millis(200));
    let api_config = WorkerConfig {
        poll_wait: Duration::from_millis(50),
        ..Default::default()
    }
    .with_queue("analysis", QueueSettings::new(0, 3, fast));

    let api = QueueService::builder(api_config)
        .with_backend(Arc::clone(broker) as Arc<dyn QueueBackend>)
        .register("analysis", "extract", work_fn(|payload, _| async move { Ok(payload) }))
        .start()
        .await
        .unwrap();
    let worker = QueueService::builder(test_config())
        .with_backend(Arc::clone(broker) as Arc<dyn QueueBackend>)
        .register("analysis", "extract", work)
        .start()
        .await
        .unwrap();
    (api, worker)
}

struct DenyAll;

#[async_trait]
impl AdmissionPolicy for DenyAll {
    async fn may_submit(&self, _owner: Option<&str>, _queue: &QueueName) -> bool {
        false
    }
}

#[tokio::test]
async fn test_end_to_end_extract() {
    let gate = Arc::new(Semaphore::new(0));
    let held = Arc::clone(&gate);
    let service = builder(test_config())
        .register("analysis", "extract", Extract)
        .register(
            "analysis",
            "hold",
            work_fn(move |_, _| {
                let held = Arc::clone(&held);
                async move {
                    held.acquire().await.map_err(|e| WorkError::failed(e.to_string()))?.forget();
                    Ok(json!(null))
                }
            }),
        )
        .start()
        .await
        .unwrap();

    // Occupy both analysis slots so the extract job stays queued.
    let mut holders = Vec::new();
    for _ in 0..2 {
        let holder = service
            .submit(SubmitRequest::new("analysis", "hold", json!({})))
            .await
            .unwrap();
        wait_status(&service, &holder, JobStatus::Active).await;
        holders.push(holder);
    }

    let id = service
        .submit(SubmitRequest::new("analysis", "extract", json!({"videoId": "v1"})).with_priority(5))
        .await
        .unwrap();

    let queued = service.get_status(&id).await.unwrap();
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.queue, QueueName::analysis());
    assert_eq!(queued.priority, 5);
    assert_eq!(queued.attempt, 0);
    assert_eq!(queued.progress, 0);

    gate.add_permits(2);

    let done = wait_terminal(&service, &id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.attempt, 1);
    assert_eq!(done.result, Some(json!({"videoId": "v1", "style": "noir"})));
    assert!(done.error.is_none());
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());

    for holder in &holders {
        assert_eq!(wait_terminal(&service, holder).await.status, JobStatus::Completed);
    }

    let stats = service.stats().await.unwrap();
    let analysis = stats
        .iter()
        .find(|s| s.queue == QueueName::analysis())
        .unwrap();
    assert_eq!(analysis.workers, 2);
    assert_eq!(analysis.depth, 0);
    assert_eq!(analysis.records.completed, 3);

    service.shutdown().await;
}

#[tokio::test]
async fn test_status_follows_job_run_by_another_process() {
    let broker = Arc::new(SharedBroker::default());
    let (api, worker) = api_and_worker(&broker, work_fn(|payload: Value, _| async move {
        Ok(json!({ "videoId": payload["videoId"], "style": "noir" }))
    }))
    .await;

    let id = api
        .submit(SubmitRequest::new("analysis", "extract", json!({"videoId": "v7"})))
        .await
        .unwrap();

    let done = wait_terminal(&api, &id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempt, 1);
    assert_eq!(done.result, Some(json!({"videoId": "v7", "style": "noir"})));
    assert_eq!(worker.store().get(&id).unwrap().status, JobStatus::Completed);

    api.shutdown().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_cancel_from_another_process_discards_result() {
    let broker = Arc::new(SharedBroker::default());
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    let (api, worker) = api_and_worker(&broker, work_fn(move |_, _| {
        let flag = Arc::clone(&flag);
        async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(json!({"style": "late"}))
        }
    }))
    .await;

    let id = api
        .submit(SubmitRequest::new("analysis", "extract", json!({})))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while broker.snapshot(&id).map(|r| r.status) != Some(JobStatus::Active) {
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    api.cancel(&id).await.unwrap();

    // The running process notices the shared cancel well before the work ends.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while worker.store().get(&id).unwrap().status != JobStatus::Cancelled {
        assert!(tokio::time::Instant::now() < deadline, "cancel never reached the worker");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert!(!finished.load(Ordering::SeqCst));

    let snapshot = broker.snapshot(&id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert!(snapshot.result.is_none());
    assert_eq!(api.get_status(&id).await.unwrap().status, JobStatus::Cancelled);

    api.shutdown().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_redis_falls_back_to_in_process() {
    let config = WorkerConfig {
        redis: Some(RedisConfig {
            redis_url: "redis://127.0.0.1:1".to_string(),
            probe_timeout: Duration::from_millis(300),
            ..Default::default()
        }),
        ..test_config()
    };

    let service = QueueService::builder(config)
        .register("analysis", "extract", Extract)
        .start()
        .await
        .unwrap();
    assert_eq!(service.backend_mode(), BackendMode::InProcess);

    let id = service
        .submit(SubmitRequest::new("analysis", "extract", json!({"videoId": "v1"})))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&service, &id).await.status, JobStatus::Completed);

    service.shutdown().await;
}

#[tokio::test]
async fn test_retry_bound() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let service = builder(test_config())
        .register(
            "analysis",
            "extract",
            work_fn(move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Err(WorkError::transient("upstream unavailable")) }
            }),
        )
        .start()
        .await
        .unwrap();

    let id = service
        .submit(SubmitRequest::new("analysis", "extract", json!({})).with_max_attempts(3))
        .await
        .unwrap();

    let failed = wait_terminal(&service, &id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempt, 3);
    assert_eq!(failed.attempt, failed.max_attempts);
    assert!(failed.error.unwrap().contains("upstream unavailable"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    service.shutdown().await;
}

#[tokio::test]
async fn test_fatal_error_is_not_retried() {
    let service = builder(test_config())
        .register(
            "analysis",
            "extract",
            work_fn(|_, _| async { Err(WorkError::failed("corrupt container")) }),
        )
        .start()
        .await
        .unwrap();

    let id = service
        .submit(SubmitRequest::new("analysis", "extract", json!({})))
        .await
        .unwrap();

    let failed = wait_terminal(&service, &id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempt, 1);
    assert!(failed.result.is_none());

    service.shutdown().await;
}

#[tokio::test]
async fn test_timeout_is_retried_until_exhausted() {
    let config = WorkerConfig {
        job_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let service = builder(config)
        .register(
            "render",
            "template",
            work_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            }),
        )
        .start()
        .await
        .unwrap();

    let id = service
        .submit(SubmitRequest::new("render", "template", json!({})))
        .await
        .unwrap();

    let failed = wait_terminal(&service, &id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempt, 2);
    assert!(failed.error.unwrap().contains("Timed out"));

    service.shutdown().await;
}

#[tokio::test]
async fn test_render_pool_runs_one_job_at_a_time() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

    let service = builder(test_config())
        .register(
            "render",
            "template",
            work_fn(move |_, _| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        )
        .start()
        .await
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(
            service
                .submit(SubmitRequest::new("render", "template", json!({})))
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        assert_eq!(wait_terminal(&service, id).await.status, JobStatus::Completed);
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_priority_then_submission_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);

    let service = builder(test_config())
        .register(
            "render",
            "template",
            work_fn(move |payload: Value, _| {
                let seen = Arc::clone(&seen);
                async move {
                    if payload["block"].as_bool() == Some(true) {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    } else {
                        seen.lock().unwrap().push(payload["name"].as_str().unwrap().to_string());
                    }
                    Ok(json!(null))
                }
            }),
        )
        .start()
        .await
        .unwrap();

    // Occupy the single render slot so the next three queue up together.
    let blocker = service
        .submit(SubmitRequest::new("render", "template", json!({"block": true})))
        .await
        .unwrap();
    wait_status(&service, &blocker, JobStatus::Active).await;

    let mut ids = Vec::new();
    for (name, priority) in [("first", 5), ("urgent", 1), ("second", 5)] {
        ids.push(
            service
                .submit(
                    SubmitRequest::new("render", "template", json!({"name": name}))
                        .with_priority(priority),
                )
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        wait_terminal(&service, id).await;
    }

    assert_eq!(*order.lock().unwrap(), vec!["urgent", "first", "second"]);
    service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_while_active_discards_result() {
    let service = builder(test_config())
        .register(
            "analysis",
            "extract",
            work_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(json!({"style": "late"}))
            }),
        )
        .start()
        .await
        .unwrap();

    let id = service
        .submit(SubmitRequest::new("analysis", "extract", json!({})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    service.cancel(&id).await.unwrap();

    let cancelled = service.get_status(&id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // Past the point the work would have finished.
    tokio::time::sleep(Duration::from_millis(2000)).await;
    let after = service.get_status(&id).await.unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
    assert!(after.result.is_none());
    assert!(after.error.is_some());

    service.shutdown().await;
}

#[tokio::test]
async fn test_late_progress_after_cancel_is_ignored() {
    let service = builder(test_config())
        .register(
            "analysis",
            "extract",
            work_fn(|_, progress: ProgressReporter| async move {
                progress.report(10)?;
                progress.cancelled().await;
                // Cancelled: this update must not land.
                progress.report(90)?;
                Ok(json!(null))
            }),
        )
        .start()
        .await
        .unwrap();

    let id = service
        .submit(SubmitRequest::new("analysis", "extract", json!({})))
        .await
        .unwrap();
    wait_status(&service, &id, JobStatus::Active).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    service.cancel(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record = service.get_status(&id).await.unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.progress, 10);

    service.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_queued_job_never_runs() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&runs);
    let service = builder(test_config())
        .register(
            "render",
            "template",
            work_fn(move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(json!(null))
                }
            }),
        )
        .start()
        .await
        .unwrap();

    let blocker = service
        .submit(SubmitRequest::new("render", "template", json!({})))
        .await
        .unwrap();
    wait_status(&service, &blocker, JobStatus::Active).await;

    let waiting = service
        .submit(SubmitRequest::new("render", "template", json!({})))
        .await
        .unwrap();
    service.cancel(&waiting).await.unwrap();

    assert_eq!(wait_terminal(&service, &blocker).await.status, JobStatus::Completed);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(service.get_status(&waiting).await.unwrap().status, JobStatus::Cancelled);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_outcomes() {
    let service = builder(test_config())
        .register("analysis", "extract", Extract)
        .start()
        .await
        .unwrap();

    let id = service
        .submit(SubmitRequest::new("analysis", "extract", json!({"videoId": "v1"})))
        .await
        .unwrap();
    wait_terminal(&service, &id).await;

    let err = service.cancel(&id).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::AlreadyTerminal {
            status: JobStatus::Completed,
            ..
        }
    ));

    let err = service.cancel(&JobId::new()).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let service = builder(test_config())
        .register(
            "render",
            "template",
            work_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(json!(null))
            }),
        )
        .start()
        .await
        .unwrap();

    let id = service
        .submit(SubmitRequest::new("render", "template", json!({})))
        .await
        .unwrap();
    tokio_test::assert_ok!(service.cancel(&id).await);
    tokio_test::assert_ok!(service.cancel(&id).await);

    assert_eq!(service.get_status(&id).await.unwrap().status, JobStatus::Cancelled);
    service.shutdown().await;
}

#[tokio::test]
async fn test_submit_rejections() {
    let service = builder(test_config())
        .register("analysis", "extract", Extract)
        .start()
        .await
        .unwrap();

    let err = service
        .submit(SubmitRequest::new("transcode", "h264", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnknownQueue(_)));

    let err = service
        .submit(SubmitRequest::new("analysis", "transcribe", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnknownKind { .. }));

    let err = service
        .submit(SubmitRequest::new("analysis", "extract", json!({"video": 1})))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidPayload(_)));

    service.shutdown().await;

    let gated = builder(test_config())
        .register("analysis", "extract", Extract)
        .with_admission(DenyAll)
        .start()
        .await
        .unwrap();
    let err = gated
        .submit(
            SubmitRequest::new("analysis", "extract", json!({"videoId": "v1"})).with_owner("user-1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::QuotaExceeded(_)));
    assert!(gated.store().is_empty());

    gated.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_work() {
    let service = builder(test_config())
        .register(
            "analysis",
            "extract",
            work_fn(|_, _| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!("done"))
            }),
        )
        .start()
        .await
        .unwrap();

    let id = service
        .submit(SubmitRequest::new("analysis", "extract", json!({})))
        .await
        .unwrap();
    wait_status(&service, &id, JobStatus::Active).await;

    service.shutdown().await;
    assert_eq!(
        service.get_status(&id).await.unwrap().status,
        JobStatus::Completed
    );
}
