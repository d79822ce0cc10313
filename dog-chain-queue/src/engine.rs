use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backoff::BackoffPolicy,
    clock::{Clock, SystemClock},
    idempotency::{derive_idempotency_key, IdempotencyIndex},
    processor::{ProcessResult, Processor},
    sink::{panic_message, EventSink, ListenerId},
    store::{JobStore, MemoryJobStore},
    JobEvent, JobEventKind, JobId, JobRecord, JobStatus, QueueConfig, QueueError, QueueResult,
    QueueStats,
};

/// Counts for one `process_jobs` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    /// Jobs this pass claimed and ran
    pub selected: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead: usize,

    /// Stalled `PROCESSING` jobs whose lease ran out, counted as failed attempts
    pub reclaimed: usize,
}

enum Outcome {
    /// Another pass claimed the job first, or it is gone
    Skipped,
    Finished(JobEventKind),
    /// The lease was reclaimed while the processor ran; the result was dropped
    LeaseLost,
}

/// Idempotent, attempt-bounded job queue.
///
/// The engine is the only writer of its store and index. Every
/// read-modify-write sequence runs under `gate`, which also holds the ids of
/// jobs this engine is currently invoking. The gate is never held across an
/// `.await`. Lifecycle events are queued on the sink while the gate is held,
/// so their order matches the order of the transitions, and delivered after
/// it is released, so handlers may call back into the engine.
pub struct QueueEngine {
    config: QueueConfig,
    backoff: BackoffPolicy,
    store: Arc<dyn JobStore>,
    index: IdempotencyIndex,
    events: EventSink,
    clock: Arc<dyn Clock>,
    gate: Mutex<HashSet<JobId>>,
}

/// A job marked `PROCESSING` by this engine.
///
/// Dropping an armed claim (the pass future was dropped mid-invocation)
/// puts the job back to `PENDING` and gives the attempt back.
struct Claim<'a> {
    engine: &'a QueueEngine,
    job: JobRecord,
    armed: bool,
}

impl Claim<'_> {
    fn disarm(mut self) -> JobRecord {
        self.armed = false;
        self.job.clone()
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.engine.abandon(&self.job);
        }
    }
}

impl QueueEngine {
    /// Create an engine backed by the in-memory store and the system clock
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: QueueConfig) -> Self {
        Self {
            backoff: config.backoff(),
            config,
            store: Arc::new(MemoryJobStore::new()),
            index: IdempotencyIndex::new(),
            events: EventSink::new(),
            clock: Arc::new(SystemClock),
            gate: Mutex::new(HashSet::new()),
        }
    }

    /// Create engine with a custom time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create engine over an existing store.
    ///
    /// The idempotency index is rebuilt from the store's live jobs. Records
    /// left in `PROCESSING` by a previous process are reclaimed once their
    /// lease runs out.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        let index = IdempotencyIndex::new();
        for job in store.list_all() {
            if job.status.is_live() {
                index.bind(job.idempotency_key.clone(), job.id.clone());
            }
        }
        self.store = store;
        self.index = index;
        self
    }

    /// Submit work. Returns the id of the job holding the resolved key.
    ///
    /// When `idempotency_key` is absent or blank it is derived from
    /// `job_type` and `payload`. A duplicate of a live job returns the
    /// existing id and emits nothing.
    #[instrument(skip(self, payload))]
    pub fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> QueueResult<JobId> {
        if job_type.trim().is_empty() {
            return Err(QueueError::validation("job type is required"));
        }
        if payload.is_null() {
            return Err(QueueError::validation("payload is required"));
        }

        let key = match idempotency_key.map(str::trim).filter(|key| !key.is_empty()) {
            Some(key) => key.to_string(),
            None => derive_idempotency_key(job_type, &payload)?,
        };

        let job = {
            let _gate = self.gate.lock();

            if let Some(existing) = self.live_job_for_key(&key) {
                debug!(job_id = %existing, "Duplicate submission collapsed onto existing job");
                return Ok(existing);
            }

            let now = self.clock.now();
            let job = JobRecord::new(
                job_type.to_string(),
                payload,
                key.clone(),
                self.config.max_attempts,
                now,
            );
            self.store.put(job.clone());
            self.index.bind(key, job.id.clone());
            self.events.queue(JobEventKind::Enqueued, &job, now);
            job
        };

        info!(job_id = %job.id, "Enqueued job of type {}", job.job_type);
        self.events.flush();
        Ok(job.id)
    }

    /// Run one attempt for every job eligible right now.
    ///
    /// The eligible ids are snapshotted at the start; each job is claimed
    /// (`PROCESSING`) only when its own attempt starts, so a concurrent pass
    /// never runs it twice. Jobs that fail are rescheduled, not retried within
    /// this call. Failures are recorded on the jobs, never returned.
    ///
    /// Dropping the returned future releases any claim it holds.
    #[instrument(skip_all)]
    pub async fn process_jobs<P>(&self, processor: &P) -> ProcessSummary
    where
        P: Processor + ?Sized,
    {
        let (eligible, reclaimed) = self.select_eligible();
        let mut summary = ProcessSummary {
            reclaimed,
            ..ProcessSummary::default()
        };
        if eligible.is_empty() {
            return summary;
        }
        debug!(count = eligible.len(), "Selected eligible jobs");

        let outcomes: Vec<Outcome> = futures::stream::iter(eligible)
            .map(|id| self.run_attempt(processor, id))
            .buffered(self.config.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Skipped => continue,
                Outcome::LeaseLost => {}
                Outcome::Finished(JobEventKind::Completed) => summary.completed += 1,
                Outcome::Finished(JobEventKind::Retry) => summary.retried += 1,
                Outcome::Finished(JobEventKind::Dead) => summary.dead += 1,
                Outcome::Finished(JobEventKind::Enqueued) => {}
            }
            summary.selected += 1;
        }
        summary
    }

    /// Reclaim stalled jobs, then snapshot the ids of eligible ones
    fn select_eligible(&self) -> (Vec<JobId>, usize) {
        let reclaimed = {
            let in_flight = self.gate.lock();
            let now = self.clock.now();
            let mut reclaimed = 0;

            for mut job in self.store.list_by_status(JobStatus::Processing) {
                if in_flight.contains(&job.id) || !job.is_lease_expired(now) {
                    continue;
                }
                job.record_failure("processing lease expired".to_string(), now);
                let kind = if job.attempts >= job.max_attempts {
                    job.mark_dead(now);
                    self.index.release_if_bound(&job.idempotency_key, &job.id);
                    JobEventKind::Dead
                } else {
                    job.schedule_retry(now, now);
                    JobEventKind::Retry
                };
                warn!(job_id = %job.id, attempt = job.attempts, "Reclaimed stalled job ({})", kind);
                self.store.put(job.clone());
                self.events.queue(kind, &job, now);
                reclaimed += 1;
            }
            reclaimed
        };
        if reclaimed > 0 {
            self.events.flush();
        }

        let now = self.clock.now();
        let eligible = self
            .store
            .list_by_status(JobStatus::Pending)
            .into_iter()
            .filter(|job| job.is_eligible(now))
            .map(|job| job.id)
            .collect();
        (eligible, reclaimed)
    }

    /// Mark one job `PROCESSING` if it is still eligible
    fn claim(&self, id: &JobId) -> Option<Claim<'_>> {
        let mut in_flight = self.gate.lock();
        let now = self.clock.now();

        let mut job = self.store.get(id).filter(|job| job.is_eligible(now))?;
        job.start_processing(now, instant_after(now, self.config.processing_timeout));
        self.store.put(job.clone());
        in_flight.insert(job.id.clone());

        Some(Claim {
            engine: self,
            job,
            armed: true,
        })
    }

    /// Release a claim whose pass was dropped before the attempt finished
    fn abandon(&self, claimed: &JobRecord) {
        let mut in_flight = self.gate.lock();
        in_flight.remove(&claimed.id);

        match self.store.get(&claimed.id) {
            Some(mut job)
                if job.status == JobStatus::Processing && job.lease_until == claimed.lease_until =>
            {
                job.release_claim(self.clock.now());
                self.store.put(job);
                warn!(job_id = %claimed.id, "Processing pass dropped mid-attempt, job released");
            }
            _ => {}
        }
    }

    async fn run_attempt<P>(&self, processor: &P, id: JobId) -> Outcome
    where
        P: Processor + ?Sized,
    {
        let claim = match self.claim(&id) {
            Some(claim) => claim,
            None => return Outcome::Skipped,
        };
        let result = self.invoke(processor, &claim.job).await;
        self.finish_attempt(claim.disarm(), result)
    }

    /// Race the processor against the timeout. Panics count as failures.
    async fn invoke<P>(&self, processor: &P, job: &JobRecord) -> ProcessResult
    where
        P: Processor + ?Sized,
    {
        let timeout = self.config.processing_timeout;
        let attempt = AssertUnwindSafe(processor.process(job)).catch_unwind();

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => ProcessResult::failure(format!(
                "processor panicked: {}",
                panic_message(panic.as_ref())
            )),
            Err(_) => ProcessResult::failure(format!(
                "processing timed out after {}ms",
                timeout.as_millis()
            )),
        }
    }

    fn finish_attempt(&self, claimed: JobRecord, result: ProcessResult) -> Outcome {
        let (job, kind) = {
            let mut in_flight = self.gate.lock();
            in_flight.remove(&claimed.id);
            let now = self.clock.now();

            // Another engine sharing the store may have reclaimed an expired lease
            let mut job = match self.store.get(&claimed.id) {
                Some(job)
                    if job.status == JobStatus::Processing
                        && job.lease_until == claimed.lease_until =>
                {
                    job
                }
                _ => {
                    warn!(job_id = %claimed.id, "Lease lost before the attempt finished, result dropped");
                    return Outcome::LeaseLost;
                }
            };

            let kind = if result.success {
                job.complete(result.transaction_hash, now);
                JobEventKind::Completed
            } else {
                job.record_failure(result.error_message(), now);
                if !result.retryable || job.attempts >= job.max_attempts {
                    job.mark_dead(now);
                    self.index.release_if_bound(&job.idempotency_key, &job.id);
                    JobEventKind::Dead
                } else {
                    let delay = self.backoff.next_delay(job.attempts);
                    job.schedule_retry(instant_after(now, delay), now);
                    JobEventKind::Retry
                }
            };
            self.store.put(job.clone());
            self.events.queue(kind, &job, now);
            (job, kind)
        };

        match kind {
            JobEventKind::Completed => info!(
                job_id = %job.id,
                transaction_hash = ?job.transaction_hash,
                "Job completed on attempt {}",
                job.attempts
            ),
            JobEventKind::Retry => warn!(
                job_id = %job.id,
                attempt = job.attempts,
                retry_at = %job.next_attempt_at,
                "Job failed, will retry: {}",
                job.last_error.as_deref().unwrap_or_default()
            ),
            _ => error!(
                job_id = %job.id,
                attempts = job.attempts,
                "Job moved to dead-letter queue: {}",
                job.last_error.as_deref().unwrap_or_default()
            ),
        }

        self.events.flush();
        Outcome::Finished(kind)
    }

    /// Id of the live job holding `key`. Drops stale bindings. Caller holds the gate.
    fn live_job_for_key(&self, key: &str) -> Option<JobId> {
        let id = self.index.reserve(key)?;
        match self.store.get(&id) {
            Some(job) if job.status.is_live() => Some(id),
            _ => {
                self.index.release_if_bound(key, &id);
                None
            }
        }
    }

    pub fn get_job(&self, id: &JobId) -> Option<JobRecord> {
        self.store.get(id)
    }

    pub fn get_jobs_by_status(&self, status: JobStatus) -> Vec<JobRecord> {
        self.store.list_by_status(status)
    }

    /// All `DEAD` jobs, oldest first
    pub fn get_dead_letter_queue(&self) -> Vec<JobRecord> {
        self.store.list_by_status(JobStatus::Dead)
    }

    pub fn get_stats(&self) -> QueueStats {
        QueueStats::from_records(&self.store.list_all())
    }

    /// Move a dead job back to `PENDING` with a fresh attempt budget.
    ///
    /// Returns false for unknown or non-dead ids, and when the job's key has
    /// meanwhile been taken by a newer live job.
    pub fn retry_dead_letter(&self, id: &JobId) -> bool {
        let _gate = self.gate.lock();

        let mut job = match self.store.get(id) {
            Some(job) if job.status == JobStatus::Dead => job,
            _ => return false,
        };

        if let Some(holder) = self.live_job_for_key(&job.idempotency_key) {
            warn!(
                job_id = %id,
                holder = %holder,
                "Refusing to reinstate dead job, its key is held by a live job"
            );
            return false;
        }

        job.reinstate(self.clock.now());
        self.index.bind(job.idempotency_key.clone(), job.id.clone());
        self.store.put(job);
        info!(job_id = %id, "Reinstated job from dead-letter queue");
        true
    }

    /// Remove `COMPLETED` jobs that finished at least `older_than` ago.
    /// Other statuses are never touched.
    pub fn prune_completed(&self, older_than: Duration) -> usize {
        let _gate = self.gate.lock();
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut removed = 0;
        for job in self.store.list_by_status(JobStatus::Completed) {
            if job.completed_at.is_some_and(|at| at <= cutoff) {
                self.store.remove(&job.id);
                self.index.release_if_bound(&job.idempotency_key, &job.id);
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Pruned completed jobs");
        }
        removed
    }

    /// Drop a dead job for good. Returns false for unknown or non-dead ids.
    pub fn purge_dead(&self, id: &JobId) -> bool {
        let _gate = self.gate.lock();
        match self.store.get(id) {
            Some(job) if job.status == JobStatus::Dead => {
                self.store.remove(id);
                info!(job_id = %id, "Purged dead job");
                true
            }
            _ => false,
        }
    }

    /// Register a lifecycle handler
    pub fn on<F>(&self, kind: JobEventKind, handler: F) -> ListenerId
    where
        F: Fn(&JobEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Current time as seen by this engine
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn instant_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

static DEFAULT_ENGINE: Lazy<RwLock<Option<Arc<QueueEngine>>>> = Lazy::new(|| RwLock::new(None));

/// Process-wide engine, built on first use from `QueueConfig::from_env()`.
///
/// Explicit construction through [`QueueEngine::new`] is always available;
/// this is a convenience for hosts with a single queue.
pub fn default_engine() -> Arc<QueueEngine> {
    if let Some(engine) = DEFAULT_ENGINE.read().as_ref() {
        return engine.clone();
    }

    let mut slot = DEFAULT_ENGINE.write();
    slot.get_or_insert_with(|| {
        let config = QueueConfig::from_env().unwrap_or_else(|e| {
            warn!("Ignoring queue environment overrides: {}", e);
            QueueConfig::default()
        });
        Arc::new(QueueEngine::build(config))
    })
    .clone()
}

/// Install a host-built engine as the default, returning the previous one
pub fn set_default(engine: Arc<QueueEngine>) -> Option<Arc<QueueEngine>> {
    DEFAULT_ENGINE.write().replace(engine)
}

/// Forget the default engine so the next `default_engine()` builds a fresh one
pub fn reset_default() -> Option<Arc<QueueEngine>> {
    DEFAULT_ENGINE.write().take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn create_test_engine(max_attempts: u32) -> (QueueEngine, ManualClock) {
        let clock = ManualClock::new();
        let config = QueueConfig::default()
            .with_max_attempts(max_attempts)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(2.0);
        let engine = QueueEngine::new(config)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (engine, clock)
    }

    async fn always_fail(_job: JobRecord) -> ProcessResult {
        ProcessResult::failure("rpc unavailable")
    }

    async fn always_succeed(_job: JobRecord) -> ProcessResult {
        ProcessResult::success("0x123")
    }

    async fn exploding(_job: JobRecord) -> ProcessResult {
        panic!("signer exploded")
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let result = QueueEngine::new(QueueConfig::default().with_max_attempts(0));
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn test_enqueue_validates_arguments() {
        let (engine, _) = create_test_engine(3);

        let blank = engine.enqueue("  ", json!({ "a": 1 }), None);
        assert!(matches!(blank, Err(QueueError::Validation(_))));

        let null = engine.enqueue("MINT_TOKEN", Value::Null, None);
        assert!(matches!(null, Err(QueueError::Validation(_))));

        assert_eq!(engine.get_stats().total, 0);
    }

    #[test]
    fn test_blank_key_falls_back_to_derived_key() {
        let (engine, _) = create_test_engine(3);
        let payload = json!({ "batchId": "b-1" });

        let first = engine.enqueue("REGISTER_EVENT", payload.clone(), Some(" ")).unwrap();
        let second = engine.enqueue("REGISTER_EVENT", payload.clone(), None).unwrap();

        assert_eq!(first, second);
        let job = engine.get_job(&first).unwrap();
        assert_eq!(
            job.idempotency_key,
            derive_idempotency_key("REGISTER_EVENT", &payload).unwrap()
        );
    }

    #[tokio::test]
    async fn test_future_jobs_are_not_selected() {
        let (engine, clock) = create_test_engine(3);
        let id = engine.enqueue("MINT_TOKEN", json!({ "n": 1 }), None).unwrap();

        engine.process_jobs(&always_fail).await;
        assert_eq!(engine.get_job(&id).unwrap().attempts, 1);

        // Backoff is 100ms, nothing is eligible yet
        clock.advance_ms(99);
        let summary = engine.process_jobs(&always_fail).await;
        assert_eq!(summary.selected, 0);

        clock.advance_ms(1);
        let summary = engine.process_jobs(&always_fail).await;
        assert_eq!(summary.selected, 1);
        assert_eq!(engine.get_job(&id).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_schedule_follows_backoff() {
        let (engine, clock) = create_test_engine(4);
        let id = engine.enqueue("MINT_TOKEN", json!({ "n": 1 }), None).unwrap();

        for (attempt, expected_ms) in [(1, 100), (2, 200), (3, 400)] {
            let failed_at = clock.now();
            engine.process_jobs(&always_fail).await;

            let job = engine.get_job(&id).unwrap();
            assert_eq!(job.attempts, attempt);
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!((job.next_attempt_at - failed_at).num_milliseconds(), expected_ms);
            assert_eq!(job.last_error.as_deref(), Some("rpc unavailable"));

            clock.advance_ms(expected_ms);
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_remaining_attempts() {
        let (engine, _) = create_test_engine(5);
        let id = engine.enqueue("WHITELIST_ENTITY", json!({ "e": 1 }), None).unwrap();

        let summary = engine
            .process_jobs(&|_job: JobRecord| async { ProcessResult::permanent("contract reverted") })
            .await;

        assert_eq!(summary.dead, 1);
        let job = engine.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.attempts, 1);
        assert!(job.dead_at.is_some());
    }

    #[tokio::test]
    async fn test_processor_panic_is_a_failure() {
        let (engine, _) = create_test_engine(3);
        let id = engine.enqueue("MINT_TOKEN", json!({ "n": 1 }), None).unwrap();

        let summary = engine.process_jobs(&exploding).await;

        assert_eq!(summary.retried, 1);
        let job = engine.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some("processor panicked: signer exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_failure() {
        let config = QueueConfig::default()
            .with_max_attempts(1)
            .with_processing_timeout(Duration::from_millis(50));
        let engine = QueueEngine::new(config).unwrap();
        let id = engine.enqueue("MINT_TOKEN", json!({ "n": 1 }), None).unwrap();

        let summary = engine
            .process_jobs(&|_job: JobRecord| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ProcessResult::success("0xlate")
            })
            .await;

        assert_eq!(summary.dead, 1);
        let job = engine.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.transaction_hash, None);
        assert_eq!(job.last_error.as_deref(), Some("processing timed out after 50ms"));
    }

    #[tokio::test]
    async fn test_dead_job_releases_key() {
        let (engine, _) = create_test_engine(1);
        let dead_id = engine.enqueue("MINT_TOKEN", json!({ "n": 1 }), Some("op-1")).unwrap();
        engine.process_jobs(&always_fail).await;
        assert_eq!(engine.get_job(&dead_id).unwrap().status, JobStatus::Dead);

        let fresh_id = engine.enqueue("MINT_TOKEN", json!({ "n": 1 }), Some("op-1")).unwrap();
        assert_ne!(fresh_id, dead_id);
        assert_eq!(engine.get_stats().total, 2);

        // The key now belongs to the fresh job
        assert!(!engine.retry_dead_letter(&dead_id));
        assert_eq!(engine.get_job(&dead_id).unwrap().status, JobStatus::Dead);
    }

    #[tokio::test]
    async fn test_completed_job_keeps_key_until_pruned() {
        let (engine, clock) = create_test_engine(3);
        let id = engine.enqueue("REGISTER_EVENT", json!({ "b": 1 }), Some("op-2")).unwrap();
        engine.process_jobs(&always_succeed).await;

        assert_eq!(engine.enqueue("REGISTER_EVENT", json!({ "b": 1 }), Some("op-2")).unwrap(), id);

        clock.advance_ms(1_000);
        assert_eq!(engine.prune_completed(Duration::from_secs(1)), 1);
        assert!(engine.get_job(&id).is_none());

        let resubmitted = engine.enqueue("REGISTER_EVENT", json!({ "b": 1 }), Some("op-2")).unwrap();
        assert_ne!(resubmitted, id);
    }

    #[tokio::test]
    async fn test_prune_respects_retention_window() {
        let (engine, clock) = create_test_engine(3);
        engine.enqueue("REGISTER_EVENT", json!({ "b": 1 }), None).unwrap();
        engine.process_jobs(&always_succeed).await;

        clock.advance_ms(500);
        assert_eq!(engine.prune_completed(Duration::from_secs(1)), 0);
        assert_eq!(engine.get_stats().completed, 1);

        // Exactly at the cutoff counts as old enough
        clock.advance_ms(500);
        assert_eq!(engine.prune_completed(Duration::from_secs(1)), 1);
        assert_eq!(engine.get_stats().completed, 0);
    }

    #[tokio::test]
    async fn test_purge_dead_only_removes_dead_jobs() {
        let (engine, _) = create_test_engine(1);
        let dead = engine.enqueue("MINT_TOKEN", json!({ "n": 1 }), None).unwrap();
        engine.process_jobs(&always_fail).await;
        let pending = engine.enqueue("MINT_TOKEN", json!({ "n": 2 }), None).unwrap();

        assert!(!engine.purge_dead(&pending));
        assert!(engine.purge_dead(&dead));
        assert!(!engine.purge_dead(&dead));
        assert!(engine.get_dead_letter_queue().is_empty());
        assert_eq!(engine.get_stats().total, 1);
    }

    #[tokio::test]
    async fn test_with_store_rebuilds_index() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let first = QueueEngine::new(QueueConfig::default())
            .unwrap()
            .with_store(store.clone());
        let id = first.enqueue("MINT_TOKEN", json!({ "n": 1 }), Some("op-3")).unwrap();

        let second = QueueEngine::new(QueueConfig::default())
            .unwrap()
            .with_store(store);
        assert_eq!(second.enqueue("MINT_TOKEN", json!({ "n": 1 }), Some("op-3")).unwrap(), id);
    }

    fn create_stalled_store(clock: &ManualClock, max_attempts: u32) -> (Arc<dyn JobStore>, JobId) {
        let now = clock.now();
        let mut job = JobRecord::new(
            "MINT_TOKEN".to_string(),
            json!({ "n": 1 }),
            "op-stalled".to_string(),
            max_attempts,
            now,
        );
        // Claimed by a process that went away
        job.start_processing(now, now + chrono::Duration::seconds(30));
        let id = job.id.clone();

        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        store.put(job);
        (store, id)
    }

    #[tokio::test]
    async fn test_stalled_job_is_reclaimed_after_lease() {
        let clock = ManualClock::new();
        let (store, id) = create_stalled_store(&clock, 3);
        let engine = QueueEngine::new(QueueConfig::default())
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
            .with_store(store);

        clock.advance_ms(10_000);
        let summary = engine.process_jobs(&always_succeed).await;
        assert_eq!(summary, ProcessSummary::default());
        assert_eq!(engine.get_job(&id).unwrap().status, JobStatus::Processing);

        clock.advance_ms(20_000);
        let summary = engine.process_jobs(&always_succeed).await;
        assert_eq!(summary.reclaimed, 1);
        assert_eq!(summary.completed, 1);

        let job = engine.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("processing lease expired"));
    }

    #[tokio::test]
    async fn test_stalled_job_on_last_attempt_is_dead_lettered() {
        let clock = ManualClock::new();
        let (store, id) = create_stalled_store(&clock, 1);
        let engine = QueueEngine::new(QueueConfig::default())
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
            .with_store(store);

        clock.advance_ms(30_000);
        let summary = engine.process_jobs(&always_succeed).await;

        assert_eq!(summary.reclaimed, 1);
        assert_eq!(summary.selected, 0);
        assert_eq!(engine.get_job(&id).unwrap().status, JobStatus::Dead);
        // Key released with the death
        assert_ne!(engine.enqueue("MINT_TOKEN", json!({ "n": 1 }), Some("op-stalled")).unwrap(), id);
    }

    #[tokio::test]
    async fn test_own_in_flight_job_is_not_reclaimed() {
        let (engine, clock) = create_test_engine(3);
        let engine = Arc::new(engine);
        let id = engine.enqueue("MINT_TOKEN", json!({ "n": 1 }), None).unwrap();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let started_tx = Mutex::new(Some(started_tx));
        let release_rx = Mutex::new(Some(release_rx));

        let pass = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let processor = move |_job: JobRecord| {
                    let started = started_tx.lock().take();
                    let release = release_rx.lock().take();
                    async move {
                        if let Some(started) = started {
                            let _ = started.send(());
                        }
                        if let Some(release) = release {
                            let _ = release.await;
                        }
                        ProcessResult::success("0xslow")
                    }
                };
                engine.process_jobs(&processor).await
            })
        };

        started_rx.await.unwrap();
        // Well past the lease, but this engine is still waiting on the processor
        clock.advance_ms(120_000);
        let other = engine.process_jobs(&always_fail).await;
        assert_eq!(other.reclaimed, 0);
        assert_eq!(engine.get_job(&id).unwrap().status, JobStatus::Processing);

        release_tx.send(()).unwrap();
        let summary = pass.await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(engine.get_job(&id).unwrap().attempts, 1);
    }

    #[test]
    fn test_instant_after_saturates() {
        let now = Utc::now();
        assert_eq!(instant_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            instant_after(now, Duration::from_millis(5)) - now,
            chrono::Duration::milliseconds(5)
        );
    }
}
