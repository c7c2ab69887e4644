//! Metadata side-channel tailing.
//!
//! The capture process appends one JSON object per captured frame to a
//! metadata file, framed as a JSON array written incrementally:
//!
//! ```text
//! [
//! {"SensorTimestamp": 1, "CnnOutputTensor": [...]},
//! {"SensorTimestamp": 2, "CnnOutputTensor": [...]},
//! ```
//!
//! `MetadataTailReader` remembers a byte offset and on every poll decodes only
//! what was appended since. The offset advances past complete lines only, so
//! a record still being written is picked up again by the next poll.

use serde_json::Value;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::MetadataError;

/// Incremental reader for an append-only newline-delimited JSON file.
pub struct MetadataTailReader {
    path: PathBuf,
    offset: u64,
    appeared: bool,
    records_read: u64,
    fragments_skipped: u64,
}

impl MetadataTailReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            appeared: false,
            records_read: 0,
            fragments_skipped: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset just past the last consumed line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True once the file has been seen at least once.
    pub fn has_appeared(&self) -> bool {
        self.appeared
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Complete lines that were dropped because they did not decode.
    pub fn fragments_skipped(&self) -> u64 {
        self.fragments_skipped
    }

    /// Decode the objects appended since the previous poll.
    ///
    /// A missing file yields no records. A file shorter than the current
    /// offset was recreated; reading restarts from its beginning.
    pub fn poll(&mut self) -> io::Result<Vec<Value>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if self.appeared {
                    log::debug!("metadata file {} disappeared", self.path.display());
                    self.appeared = false;
                    self.offset = 0;
                }
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        if !self.appeared {
            log::info!(
                "metadata file {} appeared (accelerator firmware loaded)",
                self.path.display()
            );
            self.appeared = true;
        }

        let len = file.metadata()?.len();
        if len < self.offset {
            log::info!(
                "metadata file {} shrank from {} to {} bytes, rereading",
                self.path.display(),
                self.offset,
                len
            );
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut appended = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut appended)?;

        let (records, consumed) = self.decode_appended(&appended);
        self.offset += consumed as u64;
        self.records_read += records.len() as u64;
        Ok(records)
    }

    /// Returns the decoded records and how many bytes they account for.
    fn decode_appended(&mut self, appended: &[u8]) -> (Vec<Value>, usize) {
        let mut records = Vec::new();
        let mut consumed = 0usize;

        while let Some(newline) = appended[consumed..].iter().position(|b| *b == b'\n') {
            let line = &appended[consumed..consumed + newline];
            consumed += newline + 1;
            match decode_fragment(line) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => {
                    self.fragments_skipped += 1;
                    log::debug!("skipping metadata line: {}", err);
                }
            }
        }

        // An unterminated tail is consumed only when it already decodes.
        let tail = &appended[consumed..];
        if !tail.is_empty() {
            if let Ok(Some(record)) = decode_fragment(tail) {
                records.push(record);
                consumed = appended.len();
            }
        }

        (records, consumed)
    }
}

/// Decode one line, ignoring whitespace and the array framing around it.
///
/// `Ok(None)` means the line carried no record (blank, `[` or `]`).
pub fn decode_fragment(line: &[u8]) -> Result<Option<Value>, MetadataError> {
    let text = String::from_utf8_lossy(line);
    let fragment = text
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(|c: char| c == ',' || c == ']' || c.is_whitespace())
        .trim();
    if fragment.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(fragment)?;
    if !value.is_object() {
        return Err(MetadataError::NotAnObject);
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open metadata");
        file.write_all(text.as_bytes()).expect("append metadata");
    }

    #[test]
    fn missing_file_yields_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut reader = MetadataTailReader::new(dir.path().join("absent.json"));
        assert!(reader.poll().unwrap().is_empty());
        assert!(!reader.has_appeared());
    }

    #[test]
    fn reads_only_new_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.json");
        append(&path, "[\n{\"a\": 1},\n");
        let mut reader = MetadataTailReader::new(&path);
        let first = reader.poll().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0]["a"], 1);

        assert!(reader.poll().unwrap().is_empty());

        append(&path, "{\"a\": 2},\n{\"a\": 3},\n");
        let next = reader.poll().unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[1]["a"], 3);
        assert_eq!(reader.records_read(), 3);
    }

    #[test]
    fn partial_line_is_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.json");
        append(&path, "{\"a\": 1},\n{\"a\": ");
        let mut reader = MetadataTailReader::new(&path);
        assert_eq!(reader.poll().unwrap().len(), 1);
        let offset = reader.offset();

        append(&path, "2},\n");
        let next = reader.poll().unwrap();
        assert!(reader.offset() > offset);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0]["a"], 2);
    }

    #[test]
    fn unterminated_complete_record_is_consumed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.json");
        append(&path, "{\"a\": 1}");
        let mut reader = MetadataTailReader::new(&path);
        assert_eq!(reader.poll().unwrap().len(), 1);
        append(&path, ",\n]\n");
        assert!(reader.poll().unwrap().is_empty());
    }

    #[test]
    fn corrupt_complete_line_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.json");
        append(&path, "{not json},\n[1, 2],\n{\"a\": 5}\n");
        let mut reader = MetadataTailReader::new(&path);
        let records = reader.poll().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["a"], 5);
        assert_eq!(reader.fragments_skipped(), 2);
    }

    #[test]
    fn recreated_file_is_reread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.json");
        append(&path, "{\"a\": 1},\n{\"a\": 2},\n");
        let mut reader = MetadataTailReader::new(&path);
        assert_eq!(reader.poll().unwrap().len(), 2);

        std::fs::remove_file(&path).unwrap();
        assert!(reader.poll().unwrap().is_empty());
        append(&path, "{\"a\": 9},\n");
        let records = reader.poll().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["a"], 9);
    }

    #[test]
    fn array_framing_is_ignored() {
        assert!(decode_fragment(b"[").unwrap().is_none());
        assert!(decode_fragment(b"]").unwrap().is_none());
        assert!(decode_fragment(b"  ").unwrap().is_none());
        assert!(decode_fragment(b"[{\"a\": 1},").unwrap().is_some());
        assert!(decode_fragment(b"{\"a\": 1}]").unwrap().is_some());
    }
}
