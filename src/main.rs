mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use encore_av::{FfmpegTranscoder, ToolRegistry, Transcoder};
use encore_core::events::EventPayload;
use encore_core::TrackId;
use encore_pipeline::{Collaborators, StreamingService};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "encore=trace,encore_pipeline=trace,encore_cache=trace,encore_hls=debug,encore_av=debug"
                .to_string()
        } else {
            "encore=debug,encore_pipeline=debug,encore_cache=info,encore_hls=info,encore_av=info"
                .to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Transcode {
            input,
            track,
            output,
            json,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(transcode(
                &input,
                track,
                output,
                json,
                cli.config.as_deref(),
            ))
        }
        Commands::Probe { file, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&file, json, cli.config.as_deref()))
        }
        Commands::CheckTools => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(check_tools(cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("encore {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Track id for a CLI transcode: explicit, else the input's file stem.
fn track_for(input: &str, explicit: Option<String>) -> TrackId {
    if let Some(id) = explicit {
        return TrackId::new(id);
    }
    let path = input.split(['?', '#']).next().unwrap_or(input);
    let stem = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("track");
    TrackId::new(stem)
}

async fn transcode(
    input: &str,
    track: Option<String>,
    output: Option<PathBuf>,
    json: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let external = is_url(input);
    if !external && !Path::new(input).exists() {
        anyhow::bail!("Input file does not exist: {:?}", input);
    }

    let mut config = config::load_config_or_default(config_path)?;
    // A one-shot run has no listeners to preheat for.
    config.preheat.enabled = false;

    let track = track_for(input, track);
    let collaborators =
        Collaborators::from_config(&config).context("Failed to set up the pipeline")?;
    let service = StreamingService::start(config, collaborators);

    let mut events = service.events().subscribe();
    let progress = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event.payload {
                EventPayload::SegmentPublished {
                    index,
                    duration_secs,
                    ..
                } => eprintln!("  segment {index:>3} ({duration_secs:.2}s)"),
                EventPayload::StreamPlayable { stream_id } => {
                    eprintln!("  stream {stream_id} is playable")
                }
                EventPayload::TranscodeFailed {
                    error, permanent, ..
                } => eprintln!(
                    "  attempt failed{}: {error}",
                    if permanent { " permanently" } else { "" }
                ),
                _ => {}
            }
        }
    });

    let result = service
        .submit_and_wait(track.clone(), input, output, external)
        .await;
    service.shutdown().await;
    progress.abort();

    let report = result.with_context(|| format!("Transcode of {track} failed"))?;
    match report {
        Some(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
        Some(report) => {
            println!("Track: {track}");
            println!("Segments: {}", report.segment_count);
            println!("Duration: {:.2}s", report.total_duration);
            if let Some(ms) = report.first_segment_after_ms {
                println!("First segment after: {ms} ms");
            }
        }
        None => println!("Stream {track} is already available"),
    }
    Ok(())
}

async fn probe_file(file: &Path, json: bool, config_path: Option<&Path>) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }
    let config = config::load_config_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools);
    let transcoder = FfmpegTranscoder::from_registry(&tools)?;
    let duration = transcoder.probe_duration(file).await?;

    if json {
        let value = serde_json::json!({
            "file": file,
            "duration_secs": duration,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        let secs = duration as u64;
        println!("File: {}", file.display());
        println!(
            "Duration: {:02}:{:02}:{:02} ({duration:.3}s)",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
    }
    Ok(())
}

async fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = config::load_config_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools).check_all().await;
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install ffmpeg to enable transcoding.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let (config, source) = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            (config::load_config(p)?, p.display().to_string())
        }
        None => match config::find_default_config() {
            Some(p) => {
                println!("Validating config: {:?}", p);
                (config::load_config(&p)?, p.display().to_string())
            }
            None => {
                println!("No config file specified, using defaults");
                (encore_core::config::Config::default(), "defaults".to_string())
            }
        },
    };

    let warnings = config.validate();
    println!("✓ Configuration is valid ({source})");
    println!(
        "  Workers: {}",
        config.pool.effective_workers(num_cpus::get())
    );
    println!("  Max retries: {}", config.pool.max_retries);
    println!(
        "  Segments: {}s {} @ {}",
        config.transcode.segment_duration_secs, config.transcode.codec, config.transcode.bitrate
    );
    println!(
        "  Fast cache: {}",
        config.cache.redis_url.as_deref().unwrap_or("in-process")
    );
    println!(
        "  Durable store: {}",
        config
            .cache
            .durable_root
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in-memory".to_string())
    );
    println!("  Preheat enabled: {}", config.preheat.enabled);
    for warning in &warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}
