//! Replay export: buffered JPEG frames to an H.264 MP4 via an external
//! encoder (`ffmpeg`).
//!
//! Frames are written to a private temporary directory as a numbered image
//! sequence, the encoder writes to a hidden sibling of the destination, and
//! the result is renamed into place only on success. Every failure path
//! leaves neither the temporary frames nor a partial output behind.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ReplaySettings;
use crate::error::EncodeError;
use crate::frame::Frame;

const FRAME_PATTERN: &str = "frame_%05d.jpg";
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct EncodeOptions {
    pub fps: u32,
    pub program: String,
    /// Arguments placed before the encoder arguments (`replay.encoder_args`).
    pub program_args: Vec<String>,
    pub timeout: Duration,
}

impl From<&ReplaySettings> for EncodeOptions {
    fn from(settings: &ReplaySettings) -> Self {
        Self {
            fps: settings.fps,
            program: settings.encoder_program.clone(),
            program_args: settings.encoder_args.clone(),
            timeout: settings.timeout,
        }
    }
}

/// Summary of a finished export.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EncodedVideo {
    pub path: PathBuf,
    /// `frame_count / fps`, rounded down.
    pub duration_seconds: u64,
    pub frame_count: usize,
    pub file_size_bytes: u64,
    /// Timestamp of the first frame, seconds since the epoch.
    pub start_timestamp: u64,
}

/// Encode `frames` (oldest first) into `output`.
pub fn encode_frames(
    frames: &[Frame],
    output: &Path,
    options: &EncodeOptions,
) -> Result<EncodedVideo, EncodeError> {
    let first = frames.first().ok_or(EncodeError::NoFrames)?;
    if options.fps == 0 {
        return Err(EncodeError::InvalidFps);
    }

    let workdir = tempfile::Builder::new().prefix("camstream-replay").tempdir()?;
    for (index, frame) in frames.iter().enumerate() {
        let name = format!("frame_{:05}.jpg", index);
        std::fs::write(workdir.path().join(name), frame.bytes())?;
    }

    let partial = PartialOutput::new(output);
    let mut child = Command::new(&options.program)
        .args(&options.program_args)
        .args(["-hide_banner", "-loglevel", "error"])
        .arg("-framerate")
        .arg(options.fps.to_string())
        .arg("-i")
        .arg(workdir.path().join(FRAME_PATTERN))
        .args(["-c:v", "libx264", "-preset", "fast", "-crf", "23"])
        .args(["-pix_fmt", "yuv420p", "-movflags", "+faststart"])
        .args(["-f", "mp4", "-y"])
        .arg(partial.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| EncodeError::Spawn {
            program: options.program.clone(),
            source,
        })?;

    let stderr = child.stderr.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut text = String::new();
            let _ = pipe.read_to_string(&mut text);
            text
        })
    });

    let deadline = Instant::now() + options.timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            log::warn!(
                "encoder exceeded {}s, killing",
                options.timeout.as_secs()
            );
            let _ = child.kill();
            let _ = child.wait();
            return Err(EncodeError::Timeout(options.timeout.as_secs()));
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    };
    let stderr = stderr
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    if !status.success() {
        return Err(EncodeError::Failed {
            status,
            stderr: stderr.trim().to_string(),
        });
    }

    let file_size_bytes = match std::fs::metadata(partial.path()) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => return Err(err.into()),
    };
    if file_size_bytes == 0 {
        return Err(EncodeError::EmptyOutput);
    }
    partial.commit()?;

    let video = EncodedVideo {
        path: output.to_path_buf(),
        duration_seconds: frames.len() as u64 / u64::from(options.fps),
        frame_count: frames.len(),
        file_size_bytes,
        start_timestamp: first.timestamp_secs(),
    };
    log::info!(
        "encoded {} frames ({}s, {} bytes) to {}",
        video.frame_count,
        video.duration_seconds,
        video.file_size_bytes,
        output.display()
    );
    Ok(video)
}

/// Encoder output path that is removed on drop unless committed.
struct PartialOutput {
    partial: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl PartialOutput {
    fn new(target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "replay.mp4".to_string());
        Self {
            partial: target.with_file_name(format!(".{}.partial", name)),
            target: target.to_path_buf(),
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.partial
    }

    fn commit(mut self) -> std::io::Result<()> {
        std::fs::rename(&self.partial, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}
