//! Transcode worker pool.
//!
//! A fixed set of workers drains a bounded queue of [`TranscodeTask`]s. The
//! per-track processing state map is the only thing that keeps two workers
//! off the same track: a task is queued only after [`WorkerPool::try_acquire`]
//! inserted its state, and the state is removed when the job finishes.
//!
//! Transient failures are retried with exponential backoff up to
//! `max_retries` attempts; after that the failure is permanent and the state
//! is cleared. Finished jobs leave a [`JobOutcome`] for status queries until
//! the sweeper expires it.
//!
//! The sweeper only expires states that no worker is running: a state still
//! waiting in the queue past `max_processing_age`, or one whose worker died
//! without finishing. A running job is bounded by the transcode and download
//! deadlines instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use encore_core::config::PoolConfig;
use encore_core::events::{EventBus, EventPayload};
use encore_core::{Error, Result, TrackId};
use encore_hls::ManifestRegistry;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::publisher::{PublishFailure, PublishReport, SegmentPublisher};
use crate::source::SourceResolver;
use crate::task::TranscodeTask;

/// Upper bound for the delay between attempts.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Snapshot of a track's processing state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingStatus {
    pub track_id: TrackId,
    pub is_processing: bool,
    /// Failed attempts so far.
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Admission {
    /// The task was queued; this caller owns the processing state.
    Enqueued,
    /// Another job for the track is active.
    AlreadyProcessing(ProcessingStatus),
    /// The stream is already complete; nothing was queued.
    AlreadyAvailable,
}

/// How a finished job ended.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub track_id: TrackId,
    /// Present when a stream was published (fully, or partially when
    /// `partial` is set).
    pub report: Option<PublishReport>,
    /// The error of the last attempt, as the worker saw it.
    #[serde(serialize_with = "error_message")]
    pub error: Option<Error>,
    pub attempts: u32,
    pub partial: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.report.is_some()
    }
}

fn error_message<S: Serializer>(
    error: &Option<Error>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Admitted, waiting for a worker.
    Queued,
    /// A worker owns the job.
    Running,
    /// No worker will pick this state up again.
    Closed,
}

#[derive(Debug)]
struct SlotState {
    phase: Phase,
    retry_count: u32,
    started_at: DateTime<Utc>,
    /// Refreshed when a worker picks the job up and at every attempt.
    heartbeat: Instant,
    last_error: Option<String>,
}

/// Live processing state of one track.
#[derive(Debug)]
struct Slot {
    track_id: TrackId,
    max_retries: u32,
    state: Mutex<SlotState>,
    done: watch::Sender<Option<JobOutcome>>,
}

impl Slot {
    fn new(track_id: TrackId, max_retries: u32) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            track_id,
            max_retries,
            state: Mutex::new(SlotState {
                phase: Phase::Queued,
                retry_count: 0,
                started_at: Utc::now(),
                heartbeat: Instant::now(),
                last_error: None,
            }),
            done,
        }
    }

    fn status(&self) -> ProcessingStatus {
        let state = self.state.lock();
        ProcessingStatus {
            track_id: self.track_id.clone(),
            is_processing: self.done.borrow().is_none(),
            retry_count: state.retry_count,
            max_retries: self.max_retries,
            started_at: state.started_at,
            last_error: state.last_error.clone(),
        }
    }

    fn age(&self) -> Duration {
        self.state.lock().heartbeat.elapsed()
    }

    /// Claim the job for a worker. `None` if it expired while queued.
    fn begin(&self) -> Option<Running<'_>> {
        let mut state = self.state.lock();
        if state.phase != Phase::Queued || self.done.borrow().is_some() {
            return None;
        }
        state.phase = Phase::Running;
        state.heartbeat = Instant::now();
        Some(Running(self))
    }

    fn touch(&self) {
        self.state.lock().heartbeat = Instant::now();
    }

    /// Close the state if no worker holds it and it has been idle longer
    /// than `max_age`, or its worker is gone. Checked and closed under one
    /// lock, so a worker cannot start in between.
    fn expire(&self, max_age: Duration) -> bool {
        let mut state = self.state.lock();
        let stale = match state.phase {
            Phase::Running => false,
            Phase::Queued => state.heartbeat.elapsed() > max_age,
            Phase::Closed => true,
        };
        if stale {
            state.phase = Phase::Closed;
        }
        stale
    }
}

/// Held by the worker running a slot's job. Closes the slot when dropped,
/// including on panic, so the sweeper can clear what was left behind.
struct Running<'a>(&'a Slot);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.state.lock().phase = Phase::Closed;
    }
}

struct Inner {
    config: PoolConfig,
    slots: DashMap<TrackId, Arc<Slot>>,
    outcomes: DashMap<TrackId, JobOutcome>,
    publisher: Arc<SegmentPublisher>,
    resolver: Arc<dyn SourceResolver>,
    registry: Arc<ManifestRegistry>,
    events: Arc<EventBus>,
}

/// A task travels with the state it was admitted under.
type Queued = (TranscodeTask, Arc<Slot>);

/// Bounded pool of transcode workers with per-track exclusivity.
pub struct WorkerPool {
    inner: Arc<Inner>,
    tx: Mutex<Option<flume::Sender<Queued>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("active", &self.inner.slots.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawn the workers and the stale-state sweeper.
    pub fn start(
        config: PoolConfig,
        publisher: Arc<SegmentPublisher>,
        resolver: Arc<dyn SourceResolver>,
        registry: Arc<ManifestRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        let workers = config.effective_workers(num_cpus::get());
        let (tx, rx) = flume::bounded(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let sweep_interval = config.sweep_interval();
        let inner = Arc::new(Inner {
            config,
            slots: DashMap::new(),
            outcomes: DashMap::new(),
            publisher,
            resolver,
            registry,
            events,
        });

        let mut handles = Vec::with_capacity(workers + 1);
        for id in 0..workers {
            handles.push(tokio::spawn(run_worker(
                inner.clone(),
                rx.clone(),
                cancel.clone(),
                id,
            )));
        }
        handles.push(tokio::spawn(run_sweeper(
            inner.clone(),
            sweep_interval,
            cancel.clone(),
        )));
        tracing::info!(workers, "Transcode worker pool started");

        Self {
            inner,
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            cancel,
        }
    }

    /// The exclusivity gate. Inserts a processing state for `track` unless an
    /// active one exists; returns the state and whether this call created it.
    pub fn try_acquire(&self, track: &TrackId) -> (ProcessingStatus, bool) {
        match self.acquire(track) {
            Ok(slot) => (slot.status(), true),
            Err(status) => (status, false),
        }
    }

    fn acquire(&self, track: &TrackId) -> std::result::Result<Arc<Slot>, ProcessingStatus> {
        let max_retries = self.inner.config.max_retries.max(1);
        match self.inner.slots.entry(track.clone()) {
            Entry::Occupied(mut e) => {
                let status = e.get().status();
                if status.is_processing {
                    return Err(status);
                }
                let slot = Arc::new(Slot::new(track.clone(), max_retries));
                e.insert(slot.clone());
                Ok(slot)
            }
            Entry::Vacant(e) => {
                let slot = Arc::new(Slot::new(track.clone(), max_retries));
                e.insert(slot.clone());
                Ok(slot)
            }
        }
    }

    /// Acquire `task.track_id` and queue the task. Waits for queue capacity.
    pub async fn submit(&self, task: TranscodeTask) -> Result<Admission> {
        let track = task.track_id.clone();
        let slot = match self.acquire(&track) {
            Ok(slot) => slot,
            Err(status) => {
                tracing::debug!(track_id = %track, "Track already processing");
                return Ok(Admission::AlreadyProcessing(status));
            }
        };
        self.inner.outcomes.remove(&track);

        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            self.release(&track);
            return Err(Error::Internal("worker pool is shut down".into()));
        };
        if tx.send_async((task, slot)).await.is_err() {
            self.release(&track);
            return Err(Error::Internal("worker pool is shut down".into()));
        }
        self.inner.events.publish(EventPayload::TranscodeQueued {
            track_id: track.clone(),
        });
        tracing::debug!(track_id = %track, queued = tx.len(), "Transcode queued");
        Ok(Admission::Enqueued)
    }

    /// Block until the active job for `track` finishes or `timeout` elapses.
    ///
    /// Without an active job, the last recorded outcome is returned.
    pub async fn wait(&self, track: &TrackId, timeout: Duration) -> Result<JobOutcome> {
        let rx = match self.inner.slots.get(track) {
            Some(slot) => slot.done.subscribe(),
            None => return self.last_outcome(track),
        };

        let finished = async move {
            let mut rx = rx;
            rx.wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|outcome| outcome.clone())
        };
        match tokio::time::timeout(timeout, finished).await {
            Ok(Some(outcome)) => Ok(outcome),
            // The slot was dropped without a result; fall back to the record.
            Ok(None) => self.last_outcome(track),
            Err(_) => Err(Error::timeout(format!("transcode of {track}"), timeout)),
        }
    }

    /// Drop the processing state of `track` without recording an outcome.
    pub fn release(&self, track: &TrackId) -> bool {
        self.inner.slots.remove(track).is_some()
    }

    /// Active state if the track is processing, otherwise the state derived
    /// from its last outcome.
    pub fn status(&self, track: &TrackId) -> Option<ProcessingStatus> {
        if let Some(slot) = self.inner.slots.get(track) {
            return Some(slot.status());
        }
        self.inner.outcomes.get(track).map(|o| ProcessingStatus {
            track_id: o.track_id.clone(),
            is_processing: false,
            retry_count: o.attempts.saturating_sub(u32::from(o.is_success())),
            max_retries: self.inner.config.max_retries.max(1),
            started_at: o.started_at,
            last_error: o.error.as_ref().map(ToString::to_string),
        })
    }

    pub fn outcome(&self, track: &TrackId) -> Option<JobOutcome> {
        self.inner.outcomes.get(track).map(|o| o.value().clone())
    }

    pub fn is_processing(&self, track: &TrackId) -> bool {
        self.inner
            .slots
            .get(track)
            .is_some_and(|s| s.done.borrow().is_none())
    }

    pub fn active_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Run one sweep now. Returns (stale states removed, outcomes expired).
    pub fn sweep(&self) -> (usize, usize) {
        self.inner.sweep()
    }

    /// Stop accepting work, let running jobs finish, and fail whatever was
    /// still queued.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tx.lock().take();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker task ended abnormally");
            }
        }

        let leftover: Vec<Arc<Slot>> = self
            .inner
            .slots
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for slot in leftover {
            let error = Error::Internal("worker pool shut down".into());
            let outcome = failed_outcome(&slot, error, 0);
            self.inner.finish(&slot, outcome);
        }
        tracing::info!("Transcode worker pool stopped");
    }

    fn last_outcome(&self, track: &TrackId) -> Result<JobOutcome> {
        self.outcome(track)
            .ok_or_else(|| Error::not_found("transcode job", track))
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    rx: flume::Receiver<Queued>,
    cancel: CancellationToken,
    id: usize,
) {
    tracing::debug!(worker = id, "Transcode worker started");
    loop {
        let (task, slot) = tokio::select! {
            _ = cancel.cancelled() => break,
            queued = rx.recv_async() => match queued {
                Ok(queued) => queued,
                Err(_) => break,
            },
        };
        inner.process(task, slot, id).await;
    }
    tracing::debug!(worker = id, "Transcode worker stopped");
}

async fn run_sweeper(inner: Arc<Inner>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (stale, expired) = inner.sweep();
                if stale > 0 || expired > 0 {
                    tracing::info!(stale, expired, "Swept processing state");
                }
            }
        }
    }
}

fn failed_outcome(slot: &Slot, error: Error, attempts: u32) -> JobOutcome {
    JobOutcome {
        track_id: slot.track_id.clone(),
        report: None,
        error: Some(error),
        attempts,
        partial: false,
        started_at: slot.state.lock().started_at,
        finished_at: Utc::now(),
    }
}

/// Delay before attempt `attempt + 1`: `base * 2^(attempt - 1)`, capped.
fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
}

impl Inner {
    async fn process(&self, task: TranscodeTask, slot: Arc<Slot>, worker: usize) {
        let track = task.track_id.clone();
        let Some(_running) = slot.begin() else {
            tracing::warn!(track_id = %track, "Processing state expired while queued, dropping task");
            return;
        };

        let max_attempts = slot.max_retries;
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            slot.touch();
            self.events.publish(EventPayload::TranscodeStarted {
                track_id: track.clone(),
                attempt,
            });
            tracing::info!(track_id = %track, worker, attempt, "Transcode started");
            let started = Instant::now();

            let failure = match self.run_once(&task).await {
                Ok(report) => {
                    tracing::info!(
                        track_id = %track,
                        attempt,
                        segments = report.segment_count,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Transcode completed"
                    );
                    self.events.publish(EventPayload::TranscodeCompleted {
                        track_id: track.clone(),
                        segments: report.segment_count,
                        duration_secs: report.total_duration,
                    });
                    break JobOutcome {
                        track_id: track.clone(),
                        report: Some(report),
                        error: None,
                        attempts: attempt,
                        partial: false,
                        started_at: slot.state.lock().started_at,
                        finished_at: Utc::now(),
                    };
                }
                Err(failure) => failure,
            };

            let message = failure.source.to_string();
            {
                let mut state = slot.state.lock();
                state.retry_count = attempt;
                state.last_error = Some(message.clone());
            }

            if failure.source.is_transient() && attempt < max_attempts {
                let backoff = retry_backoff(self.config.retry_backoff(), attempt);
                tracing::warn!(
                    track_id = %track,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %message,
                    "Transcode attempt failed, retrying"
                );
                self.events.publish(EventPayload::TranscodeFailed {
                    track_id: track.clone(),
                    error: message,
                    permanent: false,
                });
                tokio::time::sleep(backoff).await;
                continue;
            }

            break self.fail_permanently(&task, &slot, failure, attempt).await;
        };

        self.finish(&slot, outcome);
    }

    /// Resolve the source into a private work directory and publish it. The
    /// work directory is deleted when this returns.
    async fn run_once(&self, task: &TranscodeTask) -> std::result::Result<PublishReport, PublishFailure> {
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .map_err(|e| PublishFailure::before_start(e.into()))?;
        let work = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.config.work_dir)
            .map_err(|e| PublishFailure::before_start(e.into()))?;

        let input = self
            .resolver
            .resolve(task, work.path())
            .await
            .map_err(PublishFailure::before_start)?;

        self.publisher
            .publish(&task.track_id, &input, &task.output_dir)
            .await
    }

    async fn fail_permanently(
        &self,
        task: &TranscodeTask,
        slot: &Slot,
        failure: PublishFailure,
        attempts: u32,
    ) -> JobOutcome {
        let track = &task.track_id;
        let stream = task.stream_id();
        let message = failure.source.to_string();

        if self.config.accept_partial_streams && failure.report.segment_count > 0 {
            let report = self.publisher.finalize_stream(&stream).await;
            tracing::warn!(
                track_id = %track,
                attempts,
                segments = report.segment_count,
                error = %message,
                "Keeping partial stream"
            );
            self.events.publish(EventPayload::TranscodeCompleted {
                track_id: track.clone(),
                segments: report.segment_count,
                duration_secs: report.total_duration,
            });
            return JobOutcome {
                track_id: track.clone(),
                report: Some(report),
                error: Some(failure.source),
                attempts,
                partial: true,
                started_at: slot.state.lock().started_at,
                finished_at: Utc::now(),
            };
        }

        self.registry.remove(&stream);
        tracing::error!(
            track_id = %track,
            attempts,
            error = %message,
            "Transcode failed permanently"
        );
        self.events.publish(EventPayload::TranscodeFailed {
            track_id: track.clone(),
            error: message,
            permanent: true,
        });
        failed_outcome(slot, failure.source, attempts)
    }

    /// Record the outcome, wake waiters, and clear the processing state.
    /// Only the first outcome of a slot is kept.
    fn finish(&self, slot: &Arc<Slot>, outcome: JobOutcome) {
        let recorded = slot.done.send_if_modified(|done| {
            if done.is_some() {
                return false;
            }
            *done = Some(outcome.clone());
            true
        });
        if recorded {
            self.outcomes.insert(slot.track_id.clone(), outcome);
        }
        self.slots
            .remove_if(&slot.track_id, |_, current| Arc::ptr_eq(current, slot));
    }

    fn sweep(&self) -> (usize, usize) {
        let max_age = self.config.max_processing_age();
        let slots: Vec<Arc<Slot>> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut stale = 0;
        for slot in slots.iter().filter(|s| s.expire(max_age)) {
            stale += 1;
            tracing::warn!(
                track_id = %slot.track_id,
                idle_secs = slot.age().as_secs(),
                "Clearing stale processing state"
            );
            let attempts = slot.state.lock().retry_count;
            let error = Error::Internal("processing state expired".into());
            self.finish(slot, failed_outcome(slot, error, attempts));
        }

        let ttl = self.config.outcome_ttl();
        let now = Utc::now();
        let before = self.outcomes.len();
        self.outcomes
            .retain(|_, o| (now - o.finished_at).to_std().map_or(true, |age| age < ttl));
        (stale, before.saturating_sub(self.outcomes.len()))
    }
}
