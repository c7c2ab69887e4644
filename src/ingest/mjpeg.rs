//! MJPEG byte-stream framing.
//!
//! The capture process writes a bare concatenation of JPEG images to stdout.
//! The only framing is the JPEG start-of-image (`FF D8`) and end-of-image
//! (`FF D9`) markers, so frames are cut on those markers alone. Nothing here
//! decodes image data.
//!
//! The splitter never rescans bytes it has already searched, and it keeps its
//! unconsumed buffer under `max_buffered` bytes by discarding the oldest data
//! when a stream stops producing valid markers.

use std::io::{self, Read};

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// Default cap on unconsumed bytes.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = MAX_JPEG_BYTES * 2;

const READ_CHUNK_BYTES: usize = 4096;

/// Incremental JPEG frame extractor.
///
/// Feed chunks with [`extend`](Self::extend) and drain complete frames with
/// [`next_frame`](Self::next_frame) or [`frames`](Self::frames). Chunk
/// boundaries do not matter: a frame split across any number of chunks is
/// emitted once, byte-identical, when its end marker arrives.
///
/// Recovery rules:
/// - bytes before a start marker (including a stray end marker) are dropped;
/// - a start marker seen before the current frame's end marker means the
///   current frame was truncated; it is dropped and scanning resumes at the
///   new start marker;
/// - when the buffer exceeds `max_buffered`, the pending partial frame is
///   dropped with a warning.
pub struct MjpegFrameSplitter {
    buffer: Vec<u8>,
    /// Offset from which the next marker search resumes. When `buffer` holds
    /// a frame candidate, `buffer[..2]` is its start marker.
    scan_from: usize,
    max_buffered: usize,
    frames_emitted: u64,
    bytes_dropped: u64,
}

impl MjpegFrameSplitter {
    pub fn new() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED_BYTES)
    }

    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            scan_from: 0,
            max_buffered: max_buffered.max(4),
            frames_emitted: 0,
            bytes_dropped: 0,
        }
    }

    /// Append a chunk of stream bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Cut the next complete frame out of the buffer, if one is available.
    ///
    /// Returns `None` when more data is needed; pending bytes stay buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if !self.buffer.starts_with(&SOI) {
                if !self.resync() {
                    self.enforce_cap();
                    return None;
                }
            }

            match find_marker_pair(&self.buffer, self.scan_from.max(2)) {
                Some((end, Marker::End)) => {
                    let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
                    self.scan_from = 0;
                    self.frames_emitted += 1;
                    return Some(frame);
                }
                Some((restart, Marker::Start)) => {
                    log::debug!(
                        "mjpeg: start marker inside unterminated frame, dropping {} bytes",
                        restart
                    );
                    self.drop_front(restart);
                }
                None => {
                    // Keep the final byte searchable: it may be the 0xFF of a
                    // marker whose second byte has not arrived yet.
                    self.scan_from = self.buffer.len().saturating_sub(1).max(2);
                    self.enforce_cap();
                    return None;
                }
            }
        }
    }

    /// Lazily drain every complete frame currently buffered.
    pub fn frames(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }

    /// Append a chunk and collect the frames it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.extend(chunk);
        self.frames().collect()
    }

    /// Unconsumed bytes currently held.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Bytes discarded by resync or overflow.
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped
    }

    /// Align the buffer on the next start marker. Returns false when none is
    /// buffered yet.
    fn resync(&mut self) -> bool {
        match find_marker(&self.buffer, 0, SOI) {
            Some(start) => {
                if start > 0 {
                    log::debug!("mjpeg: skipping {} bytes before start marker", start);
                    self.drop_front(start);
                }
                true
            }
            None => {
                // Nothing usable; keep a trailing 0xFF that may begin a marker.
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let drop_len = self.buffer.len() - keep;
                if drop_len > 0 {
                    self.drop_front(drop_len);
                }
                false
            }
        }
    }

    fn enforce_cap(&mut self) {
        if self.buffer.len() <= self.max_buffered {
            return;
        }
        // The pending frame cannot complete within the cap, and the caller has
        // already searched the whole buffer for a later start marker. Keep
        // only a trailing 0xFF that may begin the next one.
        let keep = usize::from(self.buffer.last() == Some(&0xFF));
        let drop_len = self.buffer.len() - keep;
        log::warn!(
            "mjpeg: unconsumed buffer exceeded {} bytes, dropping {} oldest bytes",
            self.max_buffered,
            drop_len
        );
        self.drop_front(drop_len);
    }

    fn drop_front(&mut self, len: usize) {
        self.buffer.drain(..len);
        self.bytes_dropped += len as u64;
        self.scan_from = 0;
    }
}

impl Default for MjpegFrameSplitter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Marker {
    Start,
    End,
}

/// First start or end marker at or after `from`.
fn find_marker_pair(buffer: &[u8], from: usize) -> Option<(usize, Marker)> {
    let mut i = from;
    while i + 1 < buffer.len() {
        if buffer[i] == 0xFF {
            match buffer[i + 1] {
                0xD9 => return Some((i, Marker::End)),
                0xD8 => return Some((i, Marker::Start)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn find_marker(buffer: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    let mut i = from;
    while i + 1 < buffer.len() {
        if buffer[i] == marker[0] && buffer[i + 1] == marker[1] {
            return Some(i);
        }
        i += 1;
    }
    None
}

// ----------------------------------------------------------------------------
// Reader adapter
// ----------------------------------------------------------------------------

/// Pulls JPEG frames out of a blocking byte reader (the capture stdout).
pub struct MjpegStream<R> {
    reader: R,
    splitter: MjpegFrameSplitter,
    chunk: Vec<u8>,
}

impl<R: Read> MjpegStream<R> {
    pub fn new(reader: R) -> Self {
        Self::with_splitter(reader, MjpegFrameSplitter::new())
    }

    pub fn with_splitter(reader: R, splitter: MjpegFrameSplitter) -> Self {
        Self {
            reader,
            splitter,
            chunk: vec![0u8; READ_CHUNK_BYTES],
        }
    }

    /// Block until the next complete frame. `Ok(None)` means the stream ended.
    pub fn read_next_jpeg(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.splitter.next_frame() {
                return Ok(Some(frame));
            }
            let read = match self.reader.read(&mut self.chunk) {
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            if read == 0 {
                if self.splitter.buffered() > 0 {
                    log::debug!(
                        "mjpeg: stream ended with {} unterminated bytes",
                        self.splitter.buffered()
                    );
                }
                return Ok(None);
            }
            self.splitter.extend(&self.chunk[..read]);
        }
    }

    pub fn splitter(&self) -> &MjpegFrameSplitter {
        &self.splitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut out = SOI.to_vec();
        out.extend_from_slice(body);
        out.extend_from_slice(&EOI);
        out
    }

    #[test]
    fn extracts_single_frame() {
        let mut splitter = MjpegFrameSplitter::new();
        let frames = splitter.push(&jpeg(b"hello"));
        assert_eq!(frames, vec![jpeg(b"hello")]);
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn waits_for_end_marker() {
        let mut splitter = MjpegFrameSplitter::new();
        let frame = jpeg(b"partial-frame");
        assert!(splitter.push(&frame[..6]).is_empty());
        assert_eq!(splitter.buffered(), 6);
        assert_eq!(splitter.push(&frame[6..]), vec![frame]);
    }

    #[test]
    fn marker_split_across_chunks() {
        let mut splitter = MjpegFrameSplitter::new();
        let frame = jpeg(b"abc");
        let (head, tail) = frame.split_at(frame.len() - 1);
        assert!(splitter.push(head).is_empty());
        assert_eq!(splitter.push(tail), vec![frame]);
    }

    #[test]
    fn drops_garbage_and_stray_end_marker() {
        let mut splitter = MjpegFrameSplitter::new();
        let mut stream = b"junk".to_vec();
        stream.extend_from_slice(&EOI);
        stream.extend_from_slice(&jpeg(b"ok"));
        assert_eq!(splitter.push(&stream), vec![jpeg(b"ok")]);
        assert_eq!(splitter.bytes_dropped(), 6);
    }

    #[test]
    fn truncated_frame_is_not_concatenated() {
        let mut splitter = MjpegFrameSplitter::new();
        let mut stream = SOI.to_vec();
        stream.extend_from_slice(b"cut-short");
        stream.extend_from_slice(&jpeg(b"whole"));
        assert_eq!(splitter.push(&stream), vec![jpeg(b"whole")]);
    }

    #[test]
    fn overflow_drops_oldest_bytes() {
        let mut splitter = MjpegFrameSplitter::with_max_buffered(64);
        let mut stream = SOI.to_vec();
        stream.extend(std::iter::repeat(0x11).take(100));
        assert!(splitter.push(&stream).is_empty());
        assert!(splitter.buffered() <= 64);
        assert!(splitter.bytes_dropped() > 0);

        assert_eq!(splitter.push(&jpeg(b"next")), vec![jpeg(b"next")]);
    }

    #[test]
    fn overflow_keeps_marker_prefix_at_the_cut() {
        let mut splitter = MjpegFrameSplitter::with_max_buffered(64);
        let mut stream = SOI.to_vec();
        stream.extend(std::iter::repeat(0x11).take(100));
        stream.push(0xFF);
        assert!(splitter.push(&stream).is_empty());
        assert_eq!(splitter.buffered(), 1);
        assert_eq!(splitter.bytes_dropped(), 102);

        // The kept 0xFF completes the next start marker.
        let next = jpeg(b"next");
        assert_eq!(splitter.push(&next[1..]), vec![next]);
    }

    #[test]
    fn noise_without_markers_is_bounded() {
        let mut splitter = MjpegFrameSplitter::with_max_buffered(32);
        for _ in 0..100 {
            assert!(splitter.push(&[0x42; 50]).is_empty());
        }
        assert!(splitter.buffered() <= 1);
    }

    #[test]
    fn stream_adapter_reads_until_eof() {
        let mut data = jpeg(b"one");
        data.extend_from_slice(&jpeg(b"two"));
        let mut stream = MjpegStream::new(data.as_slice());
        assert_eq!(stream.read_next_jpeg().unwrap(), Some(jpeg(b"one")));
        assert_eq!(stream.read_next_jpeg().unwrap(), Some(jpeg(b"two")));
        assert_eq!(stream.read_next_jpeg().unwrap(), None);
    }
}
