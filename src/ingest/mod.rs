//! Capture process output ingestion.
//!
//! The capture process produces two streams:
//! - stdout: bare concatenated JPEG images (`mjpeg`)
//! - a metadata file: newline-delimited JSON, one object per frame (`metadata`)
//!
//! Both readers are incremental and never hold a lock; the engine's worker
//! loops own them and publish their output.

pub mod metadata;
pub mod mjpeg;

pub use metadata::MetadataTailReader;
pub use mjpeg::{MjpegFrameSplitter, MjpegStream};
