//! Change detection for a scratch directory: filesystem notifications when
//! available, directory scans otherwise.

use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use encore_hls::SegmentNaming;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use walkdir::WalkDir;

use super::settle::SettleTracker;

/// A segment file found by a directory scan.
#[derive(Debug, Clone)]
pub(crate) struct ScannedFile {
    pub name: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Start a notify watcher that touches segment names in `tracker`.
///
/// Returns `None` when notifications are unavailable; the caller then
/// falls back to scanning.
pub(crate) fn start_watcher(
    dir: &Path,
    tracker: Arc<Mutex<SettleTracker>>,
    naming: SegmentNaming,
) -> Option<RecommendedWatcher> {
    let handler = move |res: notify::Result<Event>| {
        let Ok(event) = res else {
            return;
        };
        if !(event.kind.is_create() || event.kind.is_modify()) {
            return;
        }
        let now = Instant::now();
        let mut tracker = tracker.lock();
        for path in &event.paths {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if naming.is_segment(name) {
                    tracker.touch(name, now);
                }
            }
        }
    };

    let mut watcher = match notify::recommended_watcher(handler) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "File notifications unavailable, polling instead");
            return None;
        }
    };
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to watch scratch directory, polling instead");
        return None;
    }
    Some(watcher)
}

/// List finished-name segment files directly inside `dir`.
pub(crate) fn scan_segments(dir: &Path, naming: &SegmentNaming) -> Vec<ScannedFile> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            if !naming.is_segment(&name) {
                return None;
            }
            let meta = e.metadata().ok()?;
            Some(ScannedFile {
                name,
                size: meta.len(),
                modified: meta.modified().ok(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn scan_ignores_playlist_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("segment_000.ts"), b"a").unwrap();
        std::fs::write(dir.path().join("segment_001.ts.tmp"), b"b").unwrap();
        std::fs::write(dir.path().join("index.m3u8"), b"#EXTM3U").unwrap();
        std::fs::create_dir(dir.path().join("segment_002.ts")).unwrap();

        let found = scan_segments(dir.path(), &SegmentNaming::default());
        let names: Vec<&str> = found.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["segment_000.ts"]);
        assert_eq!(found[0].size, 1);
    }

    #[tokio::test]
    async fn watcher_touches_new_segments() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(Mutex::new(SettleTracker::new(Duration::from_millis(100))));
        let Some(_watcher) = start_watcher(dir.path(), tracker.clone(), SegmentNaming::default())
        else {
            // No notification backend on this platform.
            return;
        };

        std::fs::write(dir.path().join("segment_000.ts"), b"data").unwrap();
        std::fs::write(dir.path().join("index.m3u8"), b"#EXTM3U").unwrap();

        for _ in 0..100 {
            if !tracker.lock().pending_names().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tracker.lock().pending_names(), vec!["segment_000.ts".to_string()]);
    }
}
