//! camstream
//!
//! Live capture from a Raspberry Pi AI camera (IMX500 sensor with on-chip
//! object detection) driven through an external `rpicam-vid` process.
//!
//! # Architecture
//!
//! ```text
//! rpicam-vid ──stdout (MJPEG)──> frame loop ──> latest frame + replay ring
//!            └─metadata file──> metadata loop ──> tensor decode ──> debounce ──> detections
//! ```
//!
//! - The capture process is supervised as a unit: started, stopped (with a
//!   SIGTERM grace period), and observed for out-of-band exits.
//! - Detections are published only after several consecutive records agree.
//! - The replay ring holds recent JPEG frames for export as MP4.
//!
//! # Module Structure
//!
//! - `frame`: Frame and the bounded replay ring buffer
//! - `ingest`: MJPEG stream splitting and metadata file tailing
//! - `detect`: Tensor decoding, label table, and temporal debouncing
//! - `supervisor`: Capture process lifecycle
//! - `engine`: Worker loops and the public streaming API
//! - `encode`: Replay export through ffmpeg
//! - `config`: File and environment configuration

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod detect;
pub mod encode;
pub mod engine;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod supervisor;

pub use config::EngineConfig;
pub use detect::{DebounceState, Detection, TemporalDebouncer, TensorDecoder};
pub use encode::{encode_frames, EncodeOptions, EncodedVideo};
pub use engine::{EngineState, EngineStats, StreamingEngine};
pub use error::{CaptureError, EncodeError, MetadataError};
pub use frame::{Frame, FrameRingBuffer};
pub use supervisor::{CaptureCommand, ProcessSupervisor, SupervisorPhase};

/// Lock a mutex, recovering the data if a worker panicked while holding it.
/// Every slot guarded this way is replaced wholesale, so a poisoned value is
/// still a complete one.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
