//! Preheat scheduler: start transcoding a context's next track before the
//! listener gets there.
//!
//! Every tick, each active playback context is checked. When it is playing
//! and near the end of its track (little time left, or most of it played),
//! the next queued track is submitted through the same path as an on-demand
//! play. The worker pool's exclusivity check absorbs races with real play
//! requests. Preheat flags are cleared wholesale on a slow timer.
//!
//! Failures are logged and dropped here; they never reach the on-demand path.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use encore_core::config::PreheatConfig;
use encore_core::events::{EventBus, EventPayload};
use encore_core::{ContextId, Result, TrackId};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pool::Admission;

/// Where a playback context currently is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub track_id: TrackId,
    pub position_secs: f64,
    pub duration_secs: f64,
    pub is_playing: bool,
}

/// The track queued after the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextTrack {
    pub track_id: TrackId,
    pub source: String,
    pub is_external: bool,
}

/// Read access to playback state (rooms and individual listeners).
#[async_trait]
pub trait PlaybackSource: Send + Sync {
    async fn active_contexts(&self) -> Result<Vec<ContextId>>;

    async fn snapshot(&self, context: &ContextId) -> Result<Option<PlaybackSnapshot>>;

    async fn next_track(&self, context: &ContextId) -> Result<Option<NextTrack>>;
}

/// What the scheduler warms up.
#[async_trait]
pub trait PreheatTarget: Send + Sync {
    /// The stream is already complete somewhere in the cache tiers.
    async fn is_available(&self, track: &TrackId) -> bool;

    /// Start fetching and transcoding `next` without waiting for it.
    async fn preheat(&self, next: &NextTrack) -> Result<Admission>;
}

/// Whether `snapshot` is close enough to the end of its track.
pub fn should_preheat(snapshot: &PlaybackSnapshot, config: &PreheatConfig) -> bool {
    if !snapshot.is_playing || snapshot.duration_secs <= 0.0 {
        return false;
    }
    let remaining = (snapshot.duration_secs - snapshot.position_secs).max(0.0);
    let played = snapshot.position_secs / snapshot.duration_secs;
    remaining <= config.remaining_threshold_secs || played >= config.played_fraction_threshold
}

#[derive(Debug, Clone, Copy, Default)]
struct PreheatRecord {
    preheated: bool,
    in_progress: bool,
}

struct Inner {
    config: PreheatConfig,
    playback: Arc<dyn PlaybackSource>,
    target: Arc<dyn PreheatTarget>,
    records: DashMap<TrackId, PreheatRecord>,
    events: Arc<EventBus>,
}

pub struct PreheatScheduler {
    inner: Arc<Inner>,
    running: Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
}

impl std::fmt::Debug for PreheatScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreheatScheduler")
            .field("config", &self.inner.config)
            .field("records", &self.inner.records.len())
            .finish_non_exhaustive()
    }
}

impl PreheatScheduler {
    pub fn new(
        config: PreheatConfig,
        playback: Arc<dyn PlaybackSource>,
        target: Arc<dyn PreheatTarget>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                playback,
                target,
                records: DashMap::new(),
                events,
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn the tick and flag-reset loops. No-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(run_ticker(self.inner.clone(), cancel.clone())),
            tokio::spawn(run_flag_reset(self.inner.clone(), cancel.clone())),
        ];
        *running = Some((cancel, handles));
        tracing::info!(
            tick_secs = self.inner.config.tick_interval_secs,
            "Preheat scheduler started"
        );
    }

    pub async fn stop(&self) {
        let Some((cancel, handles)) = self.running.lock().take() else {
            return;
        };
        cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("Preheat scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Check every active context once. Returns how many preheats started.
    pub async fn tick(&self) -> usize {
        self.inner.tick().await
    }

    /// Check one context and preheat its next track if due. Returns the
    /// track that was submitted.
    pub async fn preheat_next(&self, context: &ContextId) -> Result<Option<TrackId>> {
        self.inner.preheat_next(context).await
    }

    pub fn is_preheated(&self, track: &TrackId) -> bool {
        self.inner
            .records
            .get(track)
            .is_some_and(|r| r.preheated)
    }

    pub fn reset_flags(&self) {
        self.inner.records.clear();
    }
}

async fn run_ticker(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                inner.tick().await;
            }
        }
    }
}

async fn run_flag_reset(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.flag_reset_interval());
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let cleared = inner.records.len();
                inner.records.clear();
                tracing::debug!(cleared, "Cleared preheat flags");
            }
        }
    }
}

impl Inner {
    async fn tick(&self) -> usize {
        let contexts = match self.playback.active_contexts().await {
            Ok(contexts) => contexts,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list playback contexts");
                return 0;
            }
        };
        let results = join_all(contexts.iter().map(|ctx| self.preheat_next(ctx))).await;
        contexts
            .iter()
            .zip(results)
            .filter(|(context, result)| match result {
                Ok(triggered) => triggered.is_some(),
                Err(e) => {
                    tracing::warn!(context_id = %context, error = %e, "Preheat failed");
                    false
                }
            })
            .count()
    }

    async fn preheat_next(&self, context: &ContextId) -> Result<Option<TrackId>> {
        let Some(snapshot) = self.playback.snapshot(context).await? else {
            return Ok(None);
        };
        if !should_preheat(&snapshot, &self.config) {
            return Ok(None);
        }
        let Some(next) = self.playback.next_track(context).await? else {
            return Ok(None);
        };
        let track = next.track_id.clone();

        // Claim the track; a set flag means another pass already handled it.
        match self.records.entry(track.clone()) {
            Entry::Occupied(mut e) => {
                let record = e.get_mut();
                if record.preheated || record.in_progress {
                    return Ok(None);
                }
                record.in_progress = true;
            }
            Entry::Vacant(e) => {
                e.insert(PreheatRecord {
                    preheated: false,
                    in_progress: true,
                });
            }
        }

        if self.target.is_available(&track).await {
            self.set_record(&track, true);
            tracing::debug!(context_id = %context, track_id = %track, "Next track already available");
            return Ok(None);
        }

        match self.target.preheat(&next).await {
            Ok(Admission::Enqueued) => {
                self.set_record(&track, true);
                tracing::info!(
                    context_id = %context,
                    track_id = %track,
                    position_secs = snapshot.position_secs,
                    duration_secs = snapshot.duration_secs,
                    "Preheating next track"
                );
                self.events.publish(EventPayload::PreheatTriggered {
                    context_id: context.clone(),
                    track_id: track.clone(),
                });
                Ok(Some(track))
            }
            Ok(admission) => {
                self.set_record(&track, true);
                tracing::debug!(
                    context_id = %context,
                    track_id = %track,
                    ?admission,
                    "Next track needs no preheat"
                );
                Ok(None)
            }
            Err(e) => {
                self.set_record(&track, false);
                Err(e)
            }
        }
    }

    fn set_record(&self, track: &TrackId, preheated: bool) {
        self.records.insert(
            track.clone(),
            PreheatRecord {
                preheated,
                in_progress: false,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use encore_core::Error;

    fn config() -> PreheatConfig {
        PreheatConfig::default()
    }

    fn snap(position: f64, duration: f64, playing: bool) -> PlaybackSnapshot {
        PlaybackSnapshot {
            track_id: TrackId::new("current"),
            position_secs: position,
            duration_secs: duration,
            is_playing: playing,
        }
    }

    #[test]
    fn due_near_the_end_or_past_half() {
        let c = config();
        // 200 s track: 25 s left.
        assert!(should_preheat(&snap(175.0, 200.0, true), &c));
        // Half played.
        assert!(should_preheat(&snap(100.0, 200.0, true), &c));
        // Early on.
        assert!(!should_preheat(&snap(20.0, 200.0, true), &c));
        // Paused.
        assert!(!should_preheat(&snap(190.0, 200.0, false), &c));
        // Unknown duration.
        assert!(!should_preheat(&snap(10.0, 0.0, true), &c));
    }

    struct Rooms {
        snapshots: HashMap<ContextId, PlaybackSnapshot>,
        next: HashMap<ContextId, NextTrack>,
    }

    #[async_trait]
    impl PlaybackSource for Rooms {
        async fn active_contexts(&self) -> Result<Vec<ContextId>> {
            let mut ids: Vec<_> = self.snapshots.keys().cloned().collect();
            ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            Ok(ids)
        }

        async fn snapshot(&self, context: &ContextId) -> Result<Option<PlaybackSnapshot>> {
            Ok(self.snapshots.get(context).cloned())
        }

        async fn next_track(&self, context: &ContextId) -> Result<Option<NextTrack>> {
            Ok(self.next.get(context).cloned())
        }
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicU32,
        available: bool,
        fail: bool,
        /// Answer as if a play request already queued the track.
        busy: bool,
    }

    #[async_trait]
    impl PreheatTarget for Counting {
        async fn is_available(&self, _track: &TrackId) -> bool {
            self.available
        }

        async fn preheat(&self, next: &NextTrack) -> Result<Admission> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::source_unavailable(&next.track_id, "catalog down"));
            }
            if self.busy {
                return Ok(Admission::AlreadyAvailable);
            }
            Ok(Admission::Enqueued)
        }
    }

    fn room(position: f64) -> Rooms {
        let ctx = ContextId::new("room-1");
        Rooms {
            snapshots: HashMap::from([(ctx.clone(), snap(position, 200.0, true))]),
            next: HashMap::from([(
                ctx,
                NextTrack {
                    track_id: TrackId::new("next"),
                    source: "https://cdn.example.com/next.mp3".into(),
                    is_external: true,
                },
            )]),
        }
    }

    fn scheduler(rooms: Rooms, target: Arc<Counting>) -> PreheatScheduler {
        PreheatScheduler::new(config(), Arc::new(rooms), target, Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn preheats_once_per_track() {
        let target = Arc::new(Counting::default());
        let s = scheduler(room(180.0), target.clone());
        let ctx = ContextId::new("room-1");

        assert_eq!(s.preheat_next(&ctx).await.unwrap(), Some(TrackId::new("next")));
        assert_eq!(s.preheat_next(&ctx).await.unwrap(), None);
        assert_eq!(s.tick().await, 0);
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
        assert!(s.is_preheated(&TrackId::new("next")));

        s.reset_flags();
        assert_eq!(s.tick().await, 1);
        assert_eq!(target.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn not_due_does_nothing() {
        let target = Arc::new(Counting::default());
        let s = scheduler(room(10.0), target.clone());
        assert_eq!(s.tick().await, 0);
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn available_streams_are_skipped() {
        let target = Arc::new(Counting {
            available: true,
            ..Counting::default()
        });
        let s = scheduler(room(180.0), target.clone());
        assert_eq!(s.tick().await, 0);
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
        assert!(s.is_preheated(&TrackId::new("next")));
    }

    #[tokio::test]
    async fn track_queued_elsewhere_is_not_counted() {
        let target = Arc::new(Counting {
            busy: true,
            ..Counting::default()
        });
        let events = Arc::new(EventBus::default());
        let s = PreheatScheduler::new(config(), Arc::new(room(180.0)), target.clone(), events.clone());

        assert_eq!(s.tick().await, 0);
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
        assert!(s.is_preheated(&TrackId::new("next")));
        assert!(!events
            .recent_events(10)
            .iter()
            .any(|e| matches!(e.payload, EventPayload::PreheatTriggered { .. })));
    }

    #[tokio::test]
    async fn failures_are_dropped_and_retried_next_tick() {
        let target = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        let s = scheduler(room(180.0), target.clone());
        assert_eq!(s.tick().await, 0);
        assert_eq!(s.tick().await, 0);
        assert_eq!(target.calls.load(Ordering::SeqCst), 2);
        assert!(!s.is_preheated(&TrackId::new("next")));
    }

    #[tokio::test]
    async fn start_and_stop() {
        let target = Arc::new(Counting::default());
        let s = scheduler(room(180.0), target.clone());
        s.start();
        s.start();
        assert!(s.is_running());

        for _ in 0..50 {
            if target.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        s.stop().await;
        assert!(!s.is_running());
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }
}
