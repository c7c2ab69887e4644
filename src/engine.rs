//! Streaming engine: capture process, frame loop, metadata loop, and the
//! shared slots callers read from.
//!
//! Two worker threads run per capture session:
//! - the frame loop splits the process's stdout into JPEG frames and writes
//!   the latest-frame slot and the replay ring;
//! - the metadata loop tails the metadata side file, decodes each record's
//!   tensor, debounces, and replaces the detections slot.
//!
//! Readers always get whole values (a complete frame, a complete detection
//! list); slots are replaced under a lock and never mutated in place.

use std::io::Read;
use std::path::Path;
use std::process::ChildStdout;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::Serialize;
use serde_json::Value;

use crate::config::{BufferSettings, EngineConfig, MetadataSettings};
use crate::detect::{DebounceState, Detection, TemporalDebouncer, TensorDecoder};
use crate::encode::{encode_frames, EncodeOptions, EncodedVideo};
use crate::error::{CaptureError, EncodeError, MetadataError};
use crate::frame::{unix_millis, Frame, FrameRingBuffer};
use crate::ingest::{MetadataTailReader, MjpegStream};
use crate::lock_unpoisoned;
use crate::supervisor::{CaptureCommand, ProcessSupervisor, SupervisorPhase};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Slots shared between the worker threads and callers.
pub struct EngineState {
    latest_frame: Mutex<Option<Frame>>,
    detections: Mutex<Vec<Detection>>,
    ring: Mutex<FrameRingBuffer>,
    debounce_active: AtomicBool,
    frames_captured: AtomicU64,
    bytes_dropped: AtomicU64,
    records_processed: AtomicU64,
    records_skipped: AtomicU64,
}

impl EngineState {
    pub fn new(buffer: &BufferSettings) -> Self {
        Self {
            latest_frame: Mutex::new(None),
            detections: Mutex::new(Vec::new()),
            ring: Mutex::new(FrameRingBuffer::new(buffer.capacity, buffer.max_age)),
            debounce_active: AtomicBool::new(false),
            frames_captured: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
            records_skipped: AtomicU64::new(0),
        }
    }

    /// Replace the latest-frame slot and append to the replay ring.
    pub fn publish_frame(&self, frame: Frame) {
        lock_unpoisoned(&self.ring).push(frame.clone());
        *lock_unpoisoned(&self.latest_frame) = Some(frame);
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace the detections slot with one record's debounced output.
    pub fn publish_detections(&self, detections: Vec<Detection>, state: DebounceState) {
        *lock_unpoisoned(&self.detections) = detections;
        self.debounce_active
            .store(state == DebounceState::Active, Ordering::Relaxed);
        self.records_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped_bytes(&self, total: u64) {
        self.bytes_dropped.fetch_max(total, Ordering::Relaxed);
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        lock_unpoisoned(&self.latest_frame).clone()
    }

    pub fn detections(&self) -> Vec<Detection> {
        lock_unpoisoned(&self.detections).clone()
    }

    /// Buffered frames with `timestamp_ms >= cutoff_ms`, oldest first.
    pub fn frames_since(&self, cutoff_ms: u64) -> Vec<Frame> {
        lock_unpoisoned(&self.ring).snapshot_since(cutoff_ms)
    }

    /// Clear the per-session slots. The replay ring is kept so footage from
    /// before a restart stays exportable.
    pub fn reset_session(&self) {
        *lock_unpoisoned(&self.latest_frame) = None;
        lock_unpoisoned(&self.detections).clear();
        self.debounce_active.store(false, Ordering::Relaxed);
        self.bytes_dropped.store(0, Ordering::Relaxed);
    }

    fn snapshot_counters(&self) -> (usize, usize) {
        let ring = lock_unpoisoned(&self.ring);
        (ring.len(), ring.memory_bytes())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub phase: String,
    pub pid: Option<u32>,
    pub frames_captured: u64,
    pub frames_buffered: usize,
    pub buffer_bytes: usize,
    pub bytes_dropped: u64,
    pub records_processed: u64,
    pub records_skipped: u64,
    pub debounce_active: bool,
    pub last_frame_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

/// Split `reader` into frames and publish each one, stamped by `clock`.
///
/// Returns at end-of-stream or once `running` is cleared. A read error while
/// still running is returned.
pub fn run_frame_loop<R, C>(
    reader: R,
    state: &EngineState,
    running: &AtomicBool,
    mut clock: C,
) -> Result<(), CaptureError>
where
    R: Read,
    C: FnMut() -> u64,
{
    let mut stream = MjpegStream::new(reader);
    while running.load(Ordering::SeqCst) {
        let next = stream.read_next_jpeg();
        state.record_dropped_bytes(stream.splitter().bytes_dropped());
        match next {
            Ok(Some(jpeg)) => state.publish_frame(Frame::new(clock(), jpeg)),
            Ok(None) => {
                log::info!("capture stream ended");
                return Ok(());
            }
            Err(err) if running.load(Ordering::SeqCst) => {
                return Err(CaptureError::StreamRead(err));
            }
            Err(_) => return Ok(()),
        }
    }
    Ok(())
}

/// Tensor decoding plus debouncing for one capture session.
pub struct DetectionPipeline {
    decoder: TensorDecoder,
    debouncer: TemporalDebouncer,
}

impl DetectionPipeline {
    pub fn new(decoder: TensorDecoder, debouncer: TemporalDebouncer) -> Self {
        Self { decoder, debouncer }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let detection = &config.detection;
        Self::new(
            TensorDecoder::new(
                detection.schema.clone(),
                detection.labels.clone(),
                detection.filter.clone(),
            ),
            TemporalDebouncer::new(config.debounce.window, config.debounce.min_consecutive),
        )
    }

    /// Decode and debounce one record. A record that cannot be decoded is
    /// returned as an error and leaves the debounce history untouched.
    pub fn process(&mut self, record: &Value) -> Result<Vec<Detection>, MetadataError> {
        let raw = self.decoder.decode_record(record)?;
        Ok(self.debouncer.observe(raw))
    }

    pub fn state(&self) -> DebounceState {
        self.debouncer.state()
    }

    /// Run `process` and publish the outcome into `state`.
    pub fn process_into(&mut self, record: &Value, state: &EngineState) {
        match self.process(record) {
            Ok(detections) => state.publish_detections(detections, self.state()),
            Err(err) => {
                log::debug!("skipping metadata record: {}", err);
                state.record_skipped();
            }
        }
    }
}

/// Tail the metadata file until `running` is cleared.
pub fn run_metadata_loop(
    mut reader: MetadataTailReader,
    mut pipeline: DetectionPipeline,
    state: &EngineState,
    running: &AtomicBool,
    settings: &MetadataSettings,
) {
    while running.load(Ordering::SeqCst) {
        match reader.poll() {
            Ok(records) => {
                for record in &records {
                    pipeline.process_into(record, state);
                }
                std::thread::sleep(settings.poll_interval);
            }
            Err(err) => {
                log::warn!("metadata read failed ({}): {}", reader.path().display(), err);
                std::thread::sleep(settings.retry_interval);
            }
        }
    }
    log::debug!(
        "metadata loop exiting after {} records ({} fragments skipped)",
        reader.records_read(),
        reader.fragments_skipped()
    );
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct StreamingEngine {
    config: EngineConfig,
    state: Arc<EngineState>,
    supervisor: ProcessSupervisor,
}

impl StreamingEngine {
    /// Engine driving `rpicam-vid` as configured.
    pub fn new(config: EngineConfig) -> Self {
        let command = CaptureCommand::rpicam(&config.capture);
        Self::with_command(config, command)
    }

    /// Engine driving an arbitrary capture command that writes MJPEG to
    /// stdout and metadata to `config.capture.metadata_path`.
    pub fn with_command(config: EngineConfig, command: CaptureCommand) -> Self {
        let supervisor = ProcessSupervisor::new(command, config.capture.stop_grace)
            .with_scratch_file(config.capture.metadata_path.clone());
        Self {
            state: Arc::new(EngineState::new(&config.buffer)),
            config,
            supervisor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared slots, for callers that want to read without going through the
    /// engine's running check.
    pub fn state(&self) -> Arc<EngineState> {
        Arc::clone(&self.state)
    }

    /// Spawn the capture process and worker threads. No-op when running.
    pub fn start(&self) -> Result<(), CaptureError> {
        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        self.supervisor.start(move |stdout, running| {
            state.reset_session();
            spawn_workers(stdout, running, state, config)
        })
    }

    /// Stop the capture process and join the workers. Safe to repeat.
    pub fn stop(&self) {
        self.supervisor.stop();
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Most recent complete frame; `None` before the first frame or when not
    /// running.
    pub fn get_frame(&self) -> Option<Frame> {
        if !self.is_running() {
            return None;
        }
        self.state.latest_frame()
    }

    /// Debounced detections from the latest metadata record; empty when not
    /// running.
    pub fn get_detections(&self) -> Vec<Detection> {
        if !self.is_running() {
            return Vec::new();
        }
        self.state.detections()
    }

    /// Buffered frames from the last `seconds` seconds, oldest first.
    pub fn get_recent_frames(&self, seconds: u64) -> Vec<Frame> {
        let cutoff = unix_millis().saturating_sub(seconds.saturating_mul(1000));
        self.state.frames_since(cutoff)
    }

    /// Encode the last `seconds` seconds of buffered frames into `output`.
    pub fn export_replay(&self, seconds: u64, output: &Path) -> Result<EncodedVideo, EncodeError> {
        let frames = self.get_recent_frames(seconds);
        log::info!(
            "exporting {} frames ({}s) to {}",
            frames.len(),
            seconds,
            output.display()
        );
        encode_frames(&frames, output, &EncodeOptions::from(&self.config.replay))
    }

    pub fn stats(&self) -> EngineStats {
        let running = self.is_running();
        let (frames_buffered, buffer_bytes) = self.state.snapshot_counters();
        let phase = match self.supervisor.phase() {
            SupervisorPhase::Stopped => "stopped",
            SupervisorPhase::Starting => "starting",
            SupervisorPhase::Running => "running",
            SupervisorPhase::Stopping => "stopping",
        };
        EngineStats {
            running,
            phase: phase.to_string(),
            pid: self.supervisor.pid(),
            frames_captured: self.state.frames_captured.load(Ordering::Relaxed),
            frames_buffered,
            buffer_bytes,
            bytes_dropped: self.state.bytes_dropped.load(Ordering::Relaxed),
            records_processed: self.state.records_processed.load(Ordering::Relaxed),
            records_skipped: self.state.records_skipped.load(Ordering::Relaxed),
            debounce_active: self.state.debounce_active.load(Ordering::Relaxed),
            last_frame_ms: self.state.latest_frame().map(|f| f.timestamp_ms()),
        }
    }
}

fn spawn_workers(
    stdout: ChildStdout,
    running: Arc<AtomicBool>,
    state: Arc<EngineState>,
    config: EngineConfig,
) -> Result<Vec<JoinHandle<()>>, CaptureError> {
    let frame_state = Arc::clone(&state);
    let frame_running = Arc::clone(&running);
    let frames = std::thread::Builder::new()
        .name("camstream-frames".to_string())
        .spawn(move || {
            match run_frame_loop(stdout, &frame_state, &frame_running, unix_millis) {
                Ok(()) => {}
                Err(err) => log::error!("frame loop failed: {}", err),
            }
            frame_running.store(false, Ordering::SeqCst);
        })
        .map_err(CaptureError::Worker)?;

    let pipeline = DetectionPipeline::from_config(&config);
    let reader = MetadataTailReader::new(config.capture.metadata_path.clone());
    let settings = config.metadata.clone();
    let metadata = std::thread::Builder::new()
        .name("camstream-metadata".to_string())
        .spawn(move || run_metadata_loop(reader, pipeline, &state, &running, &settings));
    match metadata {
        Ok(metadata) => Ok(vec![frames, metadata]),
        Err(err) => {
            // The supervisor only joins what it is handed; the frame thread
            // exits on its own once the process is stopped.
            Err(CaptureError::Worker(err))
        }
    }
}
