//! End-to-end runs against the real `ffmpeg`. Skipped when it is not
//! installed.

use std::path::Path;

use encore_av::{ToolCommand, ToolRegistry};
use encore_core::config::{Config, ToolsConfig};
use encore_core::{StreamId, TrackId};
use encore_pipeline::{Collaborators, ManifestLookup, StreamingService};

fn ffmpeg() -> Option<std::path::PathBuf> {
    let tools = ToolRegistry::discover(&ToolsConfig::default());
    let ffmpeg = tools.require("ffmpeg").ok()?.to_path_buf();
    tools.require("ffprobe").ok()?;
    Some(ffmpeg)
}

async fn sine_source(ffmpeg: &Path, dest: &Path, secs: u32) {
    let lavfi = format!("sine=frequency=440:duration={secs}");
    ToolCommand::new(ffmpeg.to_path_buf())
        .args([
            "-hide_banner",
            "-nostdin",
            "-y",
            "-f",
            "lavfi",
            "-i",
            lavfi.as_str(),
            "-c:a",
            "pcm_s16le",
        ])
        .arg(dest.to_string_lossy().into_owned())
        .execute()
        .await
        .expect("generate source");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transcodes_a_real_file() {
    let Some(ffmpeg) = ffmpeg() else {
        eprintln!("ffmpeg not found, skipping");
        return;
    };
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("sine.wav");
    sine_source(&ffmpeg, &source, 12).await;

    let mut config = Config::default();
    config.pool.work_dir = root.path().join("work");
    config.cache.durable_root = Some(root.path().join("durable"));
    config.transcode.normalize_loudness = false;
    config.preheat.enabled = false;

    let collaborators = Collaborators::from_config(&config).unwrap();
    let service = StreamingService::start(config, collaborators);
    let track = TrackId::new("sine");

    let report = service
        .submit_and_wait(track.clone(), source.to_string_lossy(), None, false)
        .await
        .unwrap()
        .unwrap();
    assert!(report.segment_count >= 3, "{report:?}");
    assert!((report.total_duration - 12.0).abs() <= 4.0, "{report:?}");

    let stream = StreamId::from(&track);
    let ManifestLookup::Ready { text } = service.get_manifest(&stream).await.unwrap() else {
        panic!("manifest not ready");
    };
    assert!(text.contains("#EXT-X-ENDLIST"));
    let seg = service.get_segment(&stream, "segment_000.ts").await.unwrap();
    assert!(!seg.bytes.is_empty());

    // The final manifest was persisted to the durable store.
    assert!(root
        .path()
        .join("durable/streams/sine/index.m3u8")
        .exists());
    service.shutdown().await;
}
