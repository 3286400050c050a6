//! End-to-end orchestration tests over the in-memory store: idempotent
//! creation, claiming, cancellation, retries, the stuck-job sweep, named
//! locks and the worker loop itself.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman::{
    CancelOutcome, CreateJob, ErrorKind, HandlerRegistry, JobContext, JobEventKind, JobHandler,
    JobManager, JobParams, JobPriority, JobRunner, JobStatus, JobType, MemoryJobStore,
    RetryOutcome, Worker, WorkerConfig,
};

fn setup() -> (Arc<MemoryJobStore>, Arc<JobManager>) {
    let store = Arc::new(MemoryJobStore::new());
    let manager = Arc::new(JobManager::new(store.clone()));
    (store, manager)
}

fn parse_request(org: Uuid) -> CreateJob {
    CreateJob::builder()
        .org_id(org)
        .params(JobParams::ParseDocuments {
            document_ids: vec![Uuid::nil()],
            force: false,
        })
        .build()
}

fn report_request(org: Uuid) -> CreateJob {
    CreateJob::builder()
        .org_id(org)
        .params(JobParams::GenerateReport {
            template: "annual".into(),
            sections: vec!["summary".into()],
            request_id: None,
        })
        .build()
}

// ---------------------------------------------------------------------------
// Idempotent creation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_requests_resolve_to_one_job() {
    let (_, manager) = setup();
    let org = Uuid::new_v4();

    let (first, first_existed) = manager.create_job(parse_request(org)).await.unwrap();
    let (second, second_existed) = manager.create_job(parse_request(org)).await.unwrap();

    assert!(!first_existed);
    assert!(second_existed);
    assert_eq!(first.id, second.id);

    let jobs = manager
        .list_jobs(&foreman::JobFilter::for_org(org))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn volatile_params_do_not_defeat_deduplication() {
    let (_, manager) = setup();
    let org = Uuid::new_v4();

    let force_off = CreateJob::builder()
        .org_id(org)
        .params(JobParams::ParseDocuments {
            document_ids: vec![Uuid::nil()],
            force: false,
        })
        .build();
    let force_on = CreateJob::builder()
        .org_id(org)
        .params(JobParams::ParseDocuments {
            document_ids: vec![Uuid::nil()],
            force: true,
        })
        .build();

    let (a, _) = manager.create_job(force_off).await.unwrap();
    let (b, existed) = manager.create_job(force_on).await.unwrap();
    assert!(existed);
    assert_eq!(a.id, b.id);
}

#[tokio::test]
async fn key_frees_up_after_terminal_state() {
    let (_, manager) = setup();
    let org = Uuid::new_v4();

    let (first, _) = manager.create_job(parse_request(org)).await.unwrap();
    manager.claim_next("w1", None).await.unwrap();
    manager
        .mark_completed(first.id, serde_json::json!({"pages": 3}), vec![])
        .await
        .unwrap();

    let (second, existed) = manager.create_job(parse_request(org)).await.unwrap();
    assert!(!existed);
    assert_ne!(first.id, second.id);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_job_cancels_immediately() {
    let (_, manager) = setup();
    let (job, _) = manager.create_job(parse_request(Uuid::new_v4())).await.unwrap();

    let outcome = manager.cancel_job(job.id, "ops").await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Cancelled));

    let job = manager.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.cancel_requested_by.as_deref(), Some("ops"));
}

/// A handler that polls for cancellation and stops early.
struct CooperativeHandler;

#[async_trait]
impl JobHandler for CooperativeHandler {
    async fn run(&self, _params: JobParams, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        for step in 0..50 {
            if ctx.check_cancelled().await? {
                return Ok(serde_json::json!({"stopped_at": step}));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(serde_json::json!({"stopped_at": 50}))
    }
}

#[tokio::test]
async fn running_job_cancels_cooperatively() {
    let (_, manager) = setup();
    let registry = Arc::new(
        HandlerRegistry::new().register(JobType::ParseDocuments, Arc::new(CooperativeHandler)),
    );
    let runner = JobRunner::new(manager.clone(), registry, Duration::from_secs(15));

    let (job, _) = manager.create_job(parse_request(Uuid::new_v4())).await.unwrap();
    let claimed = manager.claim_next("w1", None).await.unwrap().unwrap();

    let handle = {
        let shutdown = CancellationToken::new();
        tokio::spawn(async move { runner.run(claimed, shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let outcome = manager.cancel_job(job.id, "ops").await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Requested));

    handle.await.unwrap().unwrap();

    // The handler returned Ok, but a requested cancellation finishes the
    // job as cancelled, not completed.
    let job = manager.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.error_kind.is_none());
}

#[tokio::test]
async fn cancel_refused_once_terminal() {
    let (_, manager) = setup();
    let (job, _) = manager.create_job(parse_request(Uuid::new_v4())).await.unwrap();
    manager.claim_next("w1", None).await.unwrap();
    manager
        .mark_completed(job.id, serde_json::json!({}), vec![])
        .await
        .unwrap();

    let outcome = manager.cancel_job(job.id, "ops").await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Refused(_)));

    // A refused cancellation leaves no trace on the terminal row.
    let events = manager
        .get_events(job.id, Some(&[JobEventKind::CancelRequested]), 0)
        .await
        .unwrap();
    assert!(events.is_empty());
    let job = manager.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.cancel_requested_by.is_none());
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

async fn failed_job(manager: &JobManager, org: Uuid) -> foreman::Job {
    let (job, _) = manager.create_job(parse_request(org)).await.unwrap();
    manager.claim_next("w1", None).await.unwrap();
    manager
        .mark_failed(
            job.id,
            foreman::JobError::new(ErrorKind::Timeout, "upstream timed out"),
        )
        .await
        .unwrap();
    manager.get_job(job.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn retry_creates_linked_fresh_job() {
    let (_, manager) = setup();
    let original = failed_job(&manager, Uuid::new_v4()).await;

    let outcome = manager.retry_job(original.id, "ops", false).await.unwrap();
    let RetryOutcome::Retried(retry) = outcome else {
        panic!("expected a retry");
    };

    assert_ne!(retry.id, original.id);
    assert_eq!(retry.retry_of, Some(original.id));
    assert_eq!(retry.retry_count, 1);
    assert_eq!(retry.status, JobStatus::Queued);
    assert_eq!(retry.progress_percent, 0);
    assert!(retry.error_kind.is_none());
    // Same request, distinct key, so the retry can coexist with the
    // failed original.
    assert_ne!(retry.idempotency_key, original.idempotency_key);

    let events = manager
        .get_events(original.id, Some(&[JobEventKind::RetryScheduled]), 0)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn retry_chain_stays_flat() {
    let (_, manager) = setup();
    let original = failed_job(&manager, Uuid::new_v4()).await;

    let RetryOutcome::Retried(first) = manager.retry_job(original.id, "ops", false).await.unwrap()
    else {
        panic!("expected a retry");
    };
    manager.claim_next("w1", None).await.unwrap();
    manager
        .mark_failed(
            first.id,
            foreman::JobError::new(ErrorKind::Timeout, "again"),
        )
        .await
        .unwrap();

    let RetryOutcome::Retried(second) = manager.retry_job(first.id, "ops", false).await.unwrap()
    else {
        panic!("expected a retry");
    };
    // Each retry points at the job it retried; counts accumulate.
    assert_eq!(second.retry_of, Some(first.id));
    assert_eq!(second.retry_count, 2);
}

#[tokio::test]
async fn retry_limit_enforced_unless_forced() {
    let (_, manager) = setup();
    let org = Uuid::new_v4();

    let mut request = parse_request(org);
    request.max_retries = 0;
    let (job, _) = manager.create_job(request).await.unwrap();
    manager.claim_next("w1", None).await.unwrap();
    manager
        .mark_failed(
            job.id,
            foreman::JobError::new(ErrorKind::Internal, "boom"),
        )
        .await
        .unwrap();

    let refused = manager.retry_job(job.id, "ops", false).await.unwrap();
    assert!(matches!(refused, RetryOutcome::Refused(_)));

    let forced = manager.retry_job(job.id, "ops", true).await.unwrap();
    assert!(matches!(forced, RetryOutcome::Retried(_)));
}

#[tokio::test]
async fn concurrent_retry_is_deduplicated() {
    let (_, manager) = setup();
    let original = failed_job(&manager, Uuid::new_v4()).await;

    let first = manager.retry_job(original.id, "ops", false).await.unwrap();
    assert!(matches!(first, RetryOutcome::Retried(_)));
    // The first retry is still active and holds the derived key.
    let second = manager.retry_job(original.id, "ops", false).await.unwrap();
    assert!(matches!(second, RetryOutcome::Refused(_)));
}

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_claims_never_share_a_job() {
    let (_, manager) = setup();
    let org = Uuid::new_v4();

    for i in 0..20 {
        let request = CreateJob::builder()
            .org_id(org)
            .params(JobParams::ParseDocuments {
                document_ids: vec![Uuid::from_u128(i as u128 + 1)],
                force: false,
            })
            .build();
        manager.create_job(request).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w{w}");
            let mut claimed = Vec::new();
            while let Some(job) = manager.claim_next(&worker_id, None).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all: Vec<Uuid> = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 20);
}

#[tokio::test]
async fn higher_priority_claims_first() {
    let (_, manager) = setup();
    let org = Uuid::new_v4();

    manager.create_job(parse_request(org)).await.unwrap();
    let critical = CreateJob::builder()
        .org_id(org)
        .params(JobParams::GenerateArchive {
            include_attachments: true,
            request_id: None,
        })
        .priority(JobPriority::Critical)
        .build();
    let (critical, _) = manager.create_job(critical).await.unwrap();

    let first = manager.claim_next("w1", None).await.unwrap().unwrap();
    assert_eq!(first.id, critical.id);
}

// ---------------------------------------------------------------------------
// Stuck-job sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_fails_stale_jobs_as_worker_lost() {
    let (store, manager) = setup();
    let (job, _) = manager.create_job(parse_request(Uuid::new_v4())).await.unwrap();
    manager.claim_next("w1", None).await.unwrap();

    store.backdate_heartbeat(job.id, Utc::now() - chrono::Duration::minutes(10));

    let reclaimed = manager.sweep_stale(Duration::from_secs(300)).await.unwrap();
    assert_eq!(reclaimed, vec![job.id]);

    let job = manager.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(ErrorKind::WorkerLost));
    // worker_lost failures are retryable like any other failure.
    let retried = manager.retry_job(job.id, "sweeper", false).await.unwrap();
    assert!(matches!(retried, RetryOutcome::Retried(_)));
}

#[tokio::test]
async fn sweep_spares_heartbeating_jobs() {
    let (_, manager) = setup();
    manager.create_job(parse_request(Uuid::new_v4())).await.unwrap();
    let job = manager.claim_next("w1", None).await.unwrap().unwrap();
    manager.heartbeat(job.id).await.unwrap();

    let reclaimed = manager.sweep_stale(Duration::from_secs(300)).await.unwrap();
    assert!(reclaimed.is_empty());
}

// ---------------------------------------------------------------------------
// Worker end to end
// ---------------------------------------------------------------------------

/// A handler exercising the full context surface.
struct ReportHandler;

#[async_trait]
impl JobHandler for ReportHandler {
    async fn run(&self, _params: JobParams, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        ctx.set_stage("render").await?;
        ctx.update_progress(0, Some("starting"), None).await?;
        ctx.warn("one section had no data").await?;
        ctx.update_progress(
            50,
            None,
            Some(&serde_json::json!({"sections_rendered": 1})),
        )
        .await?;
        ctx.update_progress(100, Some("rendered"), None).await?;
        Ok(serde_json::json!({"pages": 12}))
    }
}

#[tokio::test]
async fn worker_runs_job_to_completion() {
    let (_, manager) = setup();
    let registry =
        Arc::new(HandlerRegistry::new().register(JobType::GenerateReport, Arc::new(ReportHandler)));

    let mut config = WorkerConfig::with_worker_id("w-test");
    config.poll_interval = Duration::from_millis(10);
    config.concurrency = 2;
    let worker = Arc::new(Worker::new(manager.clone(), registry, config));
    let shutdown = worker.shutdown_token();
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let (job, _) = manager.create_job(report_request(Uuid::new_v4())).await.unwrap();

    let mut finished = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = manager.get_job(job.id).await.unwrap().unwrap();
        if current.is_terminal() {
            finished = Some(current);
            break;
        }
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let job = finished.expect("job did not finish in time");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_percent, 100);
    assert_eq!(job.result, Some(serde_json::json!({"pages": 12})));
    assert_eq!(
        job.warnings,
        Some(serde_json::json!(["one section had no data"]))
    );
    assert_eq!(job.stage.as_deref(), Some("render"));
    assert_eq!(job.counters, serde_json::json!({"sections_rendered": 1}));
    assert_eq!(job.worker_id.as_deref(), Some("w-test"));

    let progress = manager
        .get_events(job.id, Some(&[JobEventKind::Progress]), 0)
        .await
        .unwrap();
    let percents: Vec<i16> = progress.iter().filter_map(|e| e.percent).collect();
    assert_eq!(percents, vec![0, 50, 100]);
}

/// Reads back its own accumulated warnings mid-run.
struct WarningAuditHandler;

#[async_trait]
impl JobHandler for WarningAuditHandler {
    async fn run(&self, _params: JobParams, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        ctx.warn("attachment missing").await?;
        ctx.warn("page truncated").await?;
        Ok(serde_json::json!({"observed": ctx.warnings()}))
    }
}

#[tokio::test]
async fn handlers_can_read_accumulated_warnings() {
    let (_, manager) = setup();
    let registry = Arc::new(
        HandlerRegistry::new().register(JobType::GenerateArchive, Arc::new(WarningAuditHandler)),
    );
    let runner = JobRunner::new(manager.clone(), registry, Duration::from_secs(15));

    let request = CreateJob::builder()
        .org_id(Uuid::new_v4())
        .params(JobParams::GenerateArchive {
            include_attachments: true,
            request_id: None,
        })
        .build();
    let (job, _) = manager.create_job(request).await.unwrap();
    let claimed = manager.claim_next("w1", None).await.unwrap().unwrap();
    runner.run(claimed, CancellationToken::new()).await.unwrap();

    let job = manager.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let expected = serde_json::json!(["attachment missing", "page truncated"]);
    // The snapshot the handler saw matches what lands on the row.
    assert_eq!(job.result, Some(serde_json::json!({"observed": expected})));
    assert_eq!(job.warnings, Some(expected));
}

/// Never checks for cancellation; only the drain abort can stop it.
struct StubbornHandler;

#[async_trait]
impl JobHandler for StubbornHandler {
    async fn run(
        &self,
        _params: JobParams,
        _ctx: &JobContext,
    ) -> anyhow::Result<serde_json::Value> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(serde_json::json!({}))
    }
}

#[tokio::test]
async fn drain_timeout_finalizes_abandoned_jobs() {
    let (_, manager) = setup();
    let registry = Arc::new(
        HandlerRegistry::new().register(JobType::ParseDocuments, Arc::new(StubbornHandler)),
    );

    let mut config = WorkerConfig::with_worker_id("w-abort");
    config.poll_interval = Duration::from_millis(10);
    config.heartbeat_interval = Duration::from_millis(20);
    config.drain_timeout = Duration::from_millis(100);
    let worker = Arc::new(Worker::new(manager.clone(), registry, config));
    let shutdown = worker.shutdown_token();
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let (job, _) = manager.create_job(parse_request(Uuid::new_v4())).await.unwrap();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = manager.get_job(job.id).await.unwrap().unwrap();
        if current.status == JobStatus::Running {
            break;
        }
    }

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    // The handler never yielded to cancellation, so the drain aborted its
    // task; the job must still come out closed, not stuck running.
    let job = manager.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_kind, Some(ErrorKind::WorkerShutdown));

    // And the per-job heartbeat loop died with the runner: the row stays
    // untouched afterwards.
    let heartbeat_at = job.heartbeat_at;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = manager.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.heartbeat_at, heartbeat_at);
}

/// Blocks until told to stop, heartbeating through the context.
struct BlockingHandler {
    release: CancellationToken,
}

#[async_trait]
impl JobHandler for BlockingHandler {
    async fn run(&self, _params: JobParams, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        loop {
            if ctx.check_cancelled().await? {
                return Ok(serde_json::json!({}));
            }
            tokio::select! {
                _ = self.release.cancelled() => return Ok(serde_json::json!({})),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}

#[tokio::test]
async fn shutdown_cancels_in_flight_jobs_as_worker_shutdown() {
    let (_, manager) = setup();
    let release = CancellationToken::new();
    let registry = Arc::new(HandlerRegistry::new().register(
        JobType::ParseDocuments,
        Arc::new(BlockingHandler {
            release: release.clone(),
        }),
    ));

    let mut config = WorkerConfig::with_worker_id("w-drain");
    config.poll_interval = Duration::from_millis(10);
    let worker = Arc::new(Worker::new(manager.clone(), registry, config));
    let shutdown = worker.shutdown_token();
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let (job, _) = manager.create_job(parse_request(Uuid::new_v4())).await.unwrap();

    // Wait for the worker to pick it up.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = manager.get_job(job.id).await.unwrap().unwrap();
        if current.status == JobStatus::Running {
            break;
        }
    }

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let job = manager.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_kind, Some(ErrorKind::WorkerShutdown));
}

#[tokio::test]
async fn unregistered_type_fails_as_no_handler() {
    let (_, manager) = setup();
    let registry = Arc::new(HandlerRegistry::new());
    let runner = JobRunner::new(manager.clone(), registry, Duration::from_secs(15));

    manager.create_job(parse_request(Uuid::new_v4())).await.unwrap();
    let claimed = manager.claim_next("w1", None).await.unwrap().unwrap();
    let job_id = claimed.id;
    runner.run(claimed, CancellationToken::new()).await.unwrap();

    let job = manager.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(ErrorKind::NoHandler));

    // And this failure is flagged non-retryable without force.
    let outcome = manager.retry_job(job_id, "ops", false).await.unwrap();
    assert!(matches!(outcome, RetryOutcome::Refused(_)));
}

// ---------------------------------------------------------------------------
// Named locks and child jobs through the context
// ---------------------------------------------------------------------------

/// Two jobs contend for the same named lock; only one may hold it at a time.
struct LockingHandler {
    holds: Arc<AtomicUsize>,
    max_observed: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for LockingHandler {
    async fn run(&self, _params: JobParams, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        while !ctx
            .acquire_lock("report:annual", Duration::from_secs(60), Some("rendering"))
            .await?
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let holding = self.holds.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(holding, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.holds.fetch_sub(1, Ordering::SeqCst);
        ctx.release_lock("report:annual").await?;
        Ok(serde_json::json!({}))
    }
}

#[tokio::test]
async fn named_lock_serializes_contending_jobs() {
    let (_, manager) = setup();
    let holds = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(HandlerRegistry::new().register(
        JobType::GenerateReport,
        Arc::new(LockingHandler {
            holds: holds.clone(),
            max_observed: max_observed.clone(),
        }),
    ));

    let mut config = WorkerConfig::with_worker_id("w-lock");
    config.poll_interval = Duration::from_millis(10);
    config.concurrency = 4;
    let worker = Arc::new(Worker::new(manager.clone(), registry, config));
    let shutdown = worker.shutdown_token();
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let mut ids = Vec::new();
    for i in 0..3 {
        let request = CreateJob::builder()
            .org_id(Uuid::new_v4())
            .params(JobParams::GenerateReport {
                template: format!("t{i}"),
                sections: vec![],
                request_id: None,
            })
            .build();
        let (job, _) = manager.create_job(request).await.unwrap();
        ids.push(job.id);
    }

    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut done = 0;
        for id in &ids {
            if manager.get_job(*id).await.unwrap().unwrap().is_terminal() {
                done += 1;
            }
        }
        if done == ids.len() {
            break;
        }
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    for id in ids {
        assert_eq!(
            manager.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
    assert_eq!(max_observed.load(Ordering::SeqCst), 1);
}

/// Spawns a child job inheriting the parent's scope.
struct SpawningHandler;

#[async_trait]
impl JobHandler for SpawningHandler {
    async fn run(&self, _params: JobParams, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let (child, _) = ctx
            .create_child_job(
                JobParams::GenerateArchive {
                    include_attachments: false,
                    request_id: None,
                },
                JobPriority::Low,
            )
            .await?;
        Ok(serde_json::json!({"child_job_id": child.id}))
    }
}

#[tokio::test]
async fn child_jobs_inherit_scope_and_link_to_parent() {
    let (_, manager) = setup();
    let registry = Arc::new(
        HandlerRegistry::new().register(JobType::EvaluateDocuments, Arc::new(SpawningHandler)),
    );
    let runner = JobRunner::new(manager.clone(), registry, Duration::from_secs(15));

    let org = Uuid::new_v4();
    let entity = Uuid::new_v4();
    let request = CreateJob::builder()
        .org_id(org)
        .entity_id(entity)
        .fiscal_year(2025)
        .params(JobParams::EvaluateDocuments {
            submission_id: Uuid::new_v4(),
            rubric: "standard".into(),
            force: false,
        })
        .build();
    let (parent, _) = manager.create_job(request).await.unwrap();
    let claimed = manager.claim_next("w1", None).await.unwrap().unwrap();
    runner.run(claimed, CancellationToken::new()).await.unwrap();

    let parent = manager.get_job(parent.id).await.unwrap().unwrap();
    assert_eq!(parent.status, JobStatus::Completed);

    let children = manager
        .get_events(parent.id, Some(&[JobEventKind::ChildCreated]), 0)
        .await
        .unwrap();
    assert_eq!(children.len(), 1);

    let child_id: Uuid = serde_json::from_value(
        children[0].data.as_ref().unwrap()["child_job_id"].clone(),
    )
    .unwrap();
    let child = manager.get_job(child_id).await.unwrap().unwrap();
    assert_eq!(child.org_id, org);
    assert_eq!(child.entity_id, Some(entity));
    assert_eq!(child.fiscal_year, Some(2025));
    assert_eq!(child.parent_id, Some(parent.id));
    assert_eq!(child.created_by, Some(format!("job:{}", parent.id)));
    assert_eq!(child.status, JobStatus::Queued);
}
