//! Error taxonomy for the capture pipeline.
//!
//! Only process spawning and replay encoding surface errors to callers.
//! Stream and metadata errors are handled inside the worker loops: a stream
//! read failure ends the frame loop (and `is_running()` turns false), a
//! malformed metadata record is skipped.

use std::io;
use std::process::ExitStatus;

use thiserror::Error;

/// Errors from the external capture process.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to spawn capture process '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("capture process has no stdout pipe")]
    MissingStdout,
    #[error("capture stream read failed")]
    StreamRead(#[source] io::Error),
    #[error("failed to start worker thread")]
    Worker(#[source] io::Error),
}

/// A single metadata record that could not be turned into detections.
///
/// Never fatal: the record is skipped and the metadata loop continues.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid metadata json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata record is not a json object")]
    NotAnObject,
    #[error("metadata record has no '{0}' array")]
    MissingTensor(String),
    #[error("tensor value at index {0} is not a number")]
    NonNumeric(usize),
    #[error("tensor too short: {len} values, schema needs {needed}")]
    TensorTooShort { len: usize, needed: usize },
}

/// Errors from encoding a replay with the external encoder.
///
/// No partial output file is left behind when one of these is returned.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("no frames to encode")]
    NoFrames,
    #[error("replay fps must be greater than zero")]
    InvalidFps,
    #[error("replay io failed")]
    Io(#[from] io::Error),
    #[error("failed to spawn encoder '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("encoder exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
    #[error("encoder timed out after {0}s")]
    Timeout(u64),
    #[error("encoder produced an empty file")]
    EmptyOutput,
}
