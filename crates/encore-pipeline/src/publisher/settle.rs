//! Stability tracking for segment files the transcoder is writing.
//!
//! A file is "settled" once its size and mtime have not changed for the
//! stability window and it is non-empty. Settled files move to the
//! dispatched set and are never reported again.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone)]
struct Observation {
    size: u64,
    modified: Option<SystemTime>,
    last_change: Instant,
    /// Whether the file has been stat'ed at least once.
    seen: bool,
}

/// Pending and dispatched segment file names of one publish run.
#[derive(Debug)]
pub(crate) struct SettleTracker {
    pending: HashMap<String, Observation>,
    dispatched: HashSet<String>,
    window: Duration,
}

impl SettleTracker {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            dispatched: HashSet::new(),
            window,
        }
    }

    /// Note that `name` exists or changed. Already dispatched names are
    /// ignored.
    pub(crate) fn touch(&mut self, name: &str, now: Instant) {
        if self.dispatched.contains(name) {
            return;
        }
        self.pending
            .entry(name.to_string())
            .and_modify(|o| o.last_change = now)
            .or_insert(Observation {
                size: 0,
                modified: None,
                last_change: now,
                seen: false,
            });
    }

    /// Record a stat of a pending file. Any difference from the previous
    /// stat restarts its stability window.
    pub(crate) fn observe(
        &mut self,
        name: &str,
        size: u64,
        modified: Option<SystemTime>,
        now: Instant,
    ) {
        if let Some(o) = self.pending.get_mut(name) {
            if !o.seen || o.size != size || o.modified != modified {
                o.size = size;
                o.modified = modified;
                o.last_change = now;
                o.seen = true;
            }
        }
    }

    /// Stop tracking a file that disappeared.
    pub(crate) fn forget(&mut self, name: &str) {
        self.pending.remove(name);
    }

    pub(crate) fn is_pending(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    pub(crate) fn pending_names(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    /// Move every settled file to the dispatched set and return their names.
    pub(crate) fn take_settled(&mut self, now: Instant) -> Vec<String> {
        let window = self.window;
        let mut settled = Vec::new();
        self.pending.retain(|name, o| {
            let stable = o.seen && o.size > 0 && now.duration_since(o.last_change) >= window;
            if stable {
                settled.push(name.clone());
            }
            !stable
        });
        for name in &settled {
            self.dispatched.insert(name.clone());
        }
        settled
    }

    /// Claim `name` for dispatch outside the settle rules (final
    /// reconciliation). Returns `false` if it was already dispatched.
    pub(crate) fn claim(&mut self, name: &str) -> bool {
        self.pending.remove(name);
        self.dispatched.insert(name.to_string())
    }

    /// Undo a dispatch that did not go through, so a later scan or
    /// reconciliation picks `name` up again.
    pub(crate) fn release(&mut self, name: &str) {
        self.dispatched.remove(name);
    }

    pub(crate) fn is_dispatched(&self, name: &str) -> bool {
        self.dispatched.contains(name)
    }

    pub(crate) fn dispatched_count(&self) -> usize {
        self.dispatched.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn settles_after_window() {
        let mut t = SettleTracker::new(WINDOW);
        let t0 = Instant::now();
        t.touch("segment_000.ts", t0);
        t.observe("segment_000.ts", 1000, None, t0);

        assert!(t.take_settled(t0 + Duration::from_millis(50)).is_empty());
        assert_eq!(
            t.take_settled(t0 + Duration::from_millis(100)),
            vec!["segment_000.ts".to_string()]
        );
        assert!(t.is_dispatched("segment_000.ts"));
        assert!(t.pending_names().is_empty());
    }

    #[test]
    fn growth_restarts_window() {
        let mut t = SettleTracker::new(WINDOW);
        let t0 = Instant::now();
        t.touch("segment_001.ts", t0);
        t.observe("segment_001.ts", 100, None, t0);
        t.observe("segment_001.ts", 200, None, t0 + Duration::from_millis(80));

        assert!(t.take_settled(t0 + Duration::from_millis(150)).is_empty());
        assert_eq!(t.take_settled(t0 + Duration::from_millis(180)).len(), 1);
    }

    #[test]
    fn empty_files_never_settle() {
        let mut t = SettleTracker::new(WINDOW);
        let t0 = Instant::now();
        t.touch("segment_002.ts", t0);
        t.observe("segment_002.ts", 0, None, t0);
        assert!(t.take_settled(t0 + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn unseen_files_never_settle() {
        let mut t = SettleTracker::new(WINDOW);
        let t0 = Instant::now();
        t.touch("segment_003.ts", t0);
        assert!(t.take_settled(t0 + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn released_name_can_be_claimed_again() {
        let mut t = SettleTracker::new(WINDOW);
        assert!(t.claim("segment_001.ts"));
        assert!(!t.claim("segment_001.ts"));
        t.release("segment_001.ts");
        assert!(!t.is_dispatched("segment_001.ts"));
        assert!(t.claim("segment_001.ts"));
    }

    #[test]
    fn dispatched_names_are_not_tracked_again() {
        let mut t = SettleTracker::new(WINDOW);
        let t0 = Instant::now();
        t.touch("segment_000.ts", t0);
        t.observe("segment_000.ts", 10, None, t0);
        assert_eq!(t.take_settled(t0 + WINDOW).len(), 1);

        t.touch("segment_000.ts", t0 + WINDOW);
        assert!(t.pending_names().is_empty());
        assert!(!t.claim("segment_000.ts"));
        assert!(t.claim("segment_001.ts"));
        assert_eq!(t.dispatched_count(), 2);
    }
}
