//! camstreamd - AI camera streaming daemon
//!
//! This daemon:
//! 1. Starts the capture process and its frame/metadata workers
//! 2. Logs a health line at a fixed interval
//! 3. Restarts capture after an out-of-band exit (after a delay)
//! 4. Optionally exports a replay clip when detections become active
//! 5. Stops capture cleanly on Ctrl-C / SIGTERM

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use camstream::{frame::unix_millis, EngineConfig, StreamingEngine};

const TICK: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream frames and detections from an AI camera")]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "CAMSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for replay clips; replays are disabled when unset.
    #[arg(long, env = "CAMSTREAM_REPLAY_DIR")]
    replay_dir: Option<PathBuf>,

    /// Seconds of buffered footage per replay clip.
    #[arg(long, default_value_t = 30)]
    replay_seconds: u64,

    /// Minimum seconds between two replay exports.
    #[arg(long, default_value_t = 60)]
    replay_cooldown_secs: u64,

    /// Seconds between health log lines.
    #[arg(long, default_value_t = 30)]
    health_interval_secs: u64,

    /// Seconds to wait before restarting a capture process that exited.
    #[arg(long, default_value_t = 5)]
    restart_delay_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = EngineConfig::load_from(args.config.as_deref())?;
    if let Some(dir) = &args.replay_dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow!("failed to create replay dir {}: {}", dir.display(), e))?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let engine = Arc::new(StreamingEngine::new(cfg));
    engine.start().context("failed to start capture")?;
    log::info!(
        "camstreamd running ({}x{} @ {}fps)",
        engine.config().capture.width,
        engine.config().capture.height,
        engine.config().capture.framerate
    );

    let health_interval = Duration::from_secs(args.health_interval_secs.max(1));
    let restart_delay = Duration::from_secs(args.restart_delay_secs);
    let replay_cooldown = Duration::from_secs(args.replay_cooldown_secs);

    let mut last_health = Instant::now();
    let mut down_since: Option<Instant> = None;
    let mut was_active = false;
    let mut last_replay: Option<Instant> = None;
    let mut replay_job: Option<JoinHandle<()>> = None;

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(TICK);

        if engine.is_running() {
            down_since = None;
        } else {
            let since = *down_since.get_or_insert_with(|| {
                log::warn!("capture is not running; restarting in {}s", restart_delay.as_secs());
                Instant::now()
            });
            if since.elapsed() >= restart_delay {
                match engine.start() {
                    Ok(()) => log::info!("capture restarted"),
                    Err(err) => log::error!("capture restart failed: {:#}", anyhow!(err)),
                }
                down_since = None;
            }
        }

        let stats = engine.stats();
        if last_health.elapsed() >= health_interval {
            last_health = Instant::now();
            let frame_age_ms = stats
                .last_frame_ms
                .map(|ts| unix_millis().saturating_sub(ts));
            log::info!(
                "health: running={} frames={} buffered={} ({} KiB) records={} skipped={} \
                 dropped_bytes={} active={} frame_age_ms={:?}",
                stats.running,
                stats.frames_captured,
                stats.frames_buffered,
                stats.buffer_bytes / 1024,
                stats.records_processed,
                stats.records_skipped,
                stats.bytes_dropped,
                stats.debounce_active,
                frame_age_ms
            );
        }

        let became_active = stats.debounce_active && !was_active;
        was_active = stats.debounce_active;
        let Some(dir) = &args.replay_dir else {
            continue;
        };
        if !became_active {
            continue;
        }
        if last_replay.is_some_and(|at| at.elapsed() < replay_cooldown) {
            log::debug!("replay skipped: cooldown");
            continue;
        }
        if replay_job.as_ref().is_some_and(|job| !job.is_finished()) {
            log::debug!("replay skipped: previous export still running");
            continue;
        }
        last_replay = Some(Instant::now());
        let output = dir.join(format!("replay-{}.mp4", unix_millis()));
        let seconds = args.replay_seconds;
        let engine = Arc::clone(&engine);
        replay_job = Some(std::thread::spawn(move || {
            match engine.export_replay(seconds, &output) {
                Ok(video) => log::info!(
                    "replay written: {} ({} frames, {}s)",
                    video.path.display(),
                    video.frame_count,
                    video.duration_seconds
                ),
                Err(err) => log::error!("replay export failed: {:#}", anyhow!(err)),
            }
        }));
    }

    log::info!("shutdown signal received, stopping capture...");
    if let Some(job) = replay_job {
        let _ = job.join();
    }
    engine.stop();
    Ok(())
}
