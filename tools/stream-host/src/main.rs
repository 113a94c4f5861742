//! vs-host
//!
//! Headless host for the video session engine. Starts one session per stream
//! URL, pulls every session's latest frame at a fixed render rate the way a
//! compositor would, and prints the engine metrics as JSON on exit.

mod demo;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vs_engine::{
    CodecBackend, EngineConfig, HeadlessSurface, SessionId, SessionManager, SyntheticBackend,
};

/// vs-host - run low-latency video sessions against a headless render surface
#[derive(Parser, Debug)]
#[command(name = "vs-host")]
#[command(about = "Headless host for the low-latency video session engine")]
#[command(version)]
struct Args {
    /// Stream addresses (tcp://host:port), one session each
    urls: Vec<String>,

    /// Sessions to open per URL
    #[arg(long, default_value = "1")]
    sessions: usize,

    /// Render-pull rate in frames per second
    #[arg(long, default_value = "60")]
    fps: u32,

    /// Stop after this many seconds
    #[arg(long, default_value = "10")]
    duration_secs: u64,

    /// Use the synthetic test-pattern codec (streams locally when no URL is given)
    #[arg(long)]
    synthetic: bool,

    /// JSON file with engine settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between per-session status lines (0 disables them)
    #[arg(long, default_value = "2")]
    stats_interval_secs: u64,
}

#[derive(Debug, Default)]
struct RenderStats {
    pulls: u64,
    frames: u64,
    dims: Option<(u32, u32)>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let config = load_config(args.config.as_deref())?;
    config.validate().context("Invalid engine configuration")?;

    let surface = Arc::new(HeadlessSurface::new());

    if args.synthetic {
        let backend = Arc::new(SyntheticBackend::new(640, 360));
        return run(backend, surface, config, &args);
    }

    #[cfg(feature = "ffmpeg")]
    {
        let backend = Arc::new(vs_engine::FfmpegBackend::new().context("FFmpeg initialization failed")?);
        run(backend, surface, config, &args)
    }

    #[cfg(not(feature = "ffmpeg"))]
    {
        bail!("vs-host was built without the `ffmpeg` feature; rebuild with it or pass --synthetic")
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    info!(path = %path.display(), "Loaded engine config");
    Ok(config)
}

fn run<B: CodecBackend>(
    backend: Arc<B>,
    surface: Arc<HeadlessSurface>,
    config: EngineConfig,
    args: &Args,
) -> Result<()> {
    let manager = SessionManager::new(backend, surface.clone(), config)
        .context("Failed to create session manager")?;

    let mut urls = args.urls.clone();
    if urls.is_empty() {
        if !args.synthetic {
            bail!("No stream URLs given");
        }
        urls.push(demo::spawn_demo_stream(640, 360, args.fps)?);
    }

    let sessions = args.sessions.max(1);
    let mut started = Vec::new();
    for url in &urls {
        for n in 0..sessions {
            // Every demo streamer serves a single client.
            let target = if args.urls.is_empty() && n > 0 {
                demo::spawn_demo_stream(640, 360, args.fps)?
            } else {
                url.clone()
            };
            match manager.start(&target) {
                Ok(id) => {
                    info!(session = %id, url = %target, "Session started");
                    started.push(id);
                }
                Err(e) => error!(url = %target, "Failed to start session: {}", e),
            }
        }
    }
    if started.is_empty() {
        bail!("No session could be started");
    }

    render_loop(&manager, &surface, args);

    manager.stop_all();
    manager.shutdown();

    let snapshot = manager.metrics();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Pull every session at the render rate and copy each frame out, the way a
/// compositor uploads it into a texture.
fn render_loop<B: CodecBackend>(manager: &SessionManager<B>, surface: &HeadlessSurface, args: &Args) {
    let frame_interval = Duration::from_secs_f64(1.0 / args.fps.max(1) as f64);
    let stats_interval = Duration::from_secs(args.stats_interval_secs);
    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);

    let mut stats: HashMap<SessionId, RenderStats> = HashMap::new();
    let mut scratch = Vec::new();
    let mut last_stats = Instant::now();
    let mut next_tick = Instant::now();

    while Instant::now() < deadline {
        let ids = manager.session_ids();
        if ids.is_empty() {
            warn!("All sessions are gone, stopping render loop");
            break;
        }

        for id in ids {
            let entry = stats.entry(id).or_default();
            entry.pulls += 1;
            if let Some(view) = manager.pull(id) {
                view.copy_to(&mut scratch);
                entry.frames += 1;
                entry.dims = Some((view.width(), view.height()));
            }
        }

        if !stats_interval.is_zero() && last_stats.elapsed() >= stats_interval {
            log_stats(manager, surface, &stats);
            last_stats = Instant::now();
        }

        next_tick += frame_interval;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    log_stats(manager, surface, &stats);
}

fn log_stats<B: CodecBackend>(
    manager: &SessionManager<B>,
    surface: &HeadlessSurface,
    stats: &HashMap<SessionId, RenderStats>,
) {
    let mut ids: Vec<_> = stats.keys().copied().collect();
    ids.sort();
    for id in ids {
        let entry = &stats[&id];
        let notified = manager
            .surface_id(id)
            .and_then(|surface_id| surface.notifications(surface_id));
        info!(
            session = %id,
            phase = ?manager.phase(id),
            end = ?manager.end_reason(id),
            dims = ?entry.dims,
            pulls = entry.pulls,
            frames = entry.frames,
            notified = ?notified,
            "Render stats"
        );
    }
}
