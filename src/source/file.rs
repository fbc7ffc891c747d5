//! C3 — the file source: batch indexing of a complete DLT log file and
//! live tailing of a still-growing one, both sharing the same
//! corruption-recovery scan (spec §4.3).

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memmap2::Mmap;
use rayon::prelude::*;

use crate::codec::{decode_frame, find_next_sync, DecodeOutcome, DltMessage};
use crate::source::{PollOutcome, Source, SourceError};

/// Consecutive empty polls tolerated in live mode before giving up —
/// resolves the dual-termination-signal Open Question in favor of one
/// cooperative token plus a single inactivity bound (60s at the
/// 100ms poll interval used by `tail`'s caller).
pub const MAX_EMPTY_POLLS: u32 = 600;

/// Bytes scanned per corruption-recovery attempt, matching
/// `cDLTFile._find_next_header`'s 1 KiB chunking.
const SCAN_CHUNK: usize = 1024;

/// Shared cooperative cancellation flag for a live [`FileSource`],
/// also reachable from `Broker::stop()`.
#[derive(Clone, Debug, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Builds an index of frame-start offsets in `data`, skipping
/// corrupt bytes by scanning forward for the next sync pattern — the
/// batch-mode counterpart of `DltFile::build_index`/`generate_index`.
fn build_index(data: &[u8]) -> (Vec<u64>, u64) {
    let mut index = Vec::new();
    let mut pos = 0usize;
    let mut corrupt_bytes = 0u64;

    while pos < data.len() {
        match decode_frame(&data[pos..], true) {
            DecodeOutcome::Frame { consumed, .. } => {
                index.push(pos as u64);
                pos += consumed;
            }
            DecodeOutcome::Incomplete => break,
            DecodeOutcome::Corrupt { skip } => {
                corrupt_bytes += skip as u64;
                match find_next_sync(data, pos + skip) {
                    Some(next) => pos = next,
                    None => break,
                }
            }
        }
    }

    (index, corrupt_bytes)
}

/// A DLT log file, opened either for one-shot batch access (all
/// messages indexed up front) or live tailing (spec §4.3).
pub struct FileSource {
    path: PathBuf,
    file: File,
    mmap: Option<Mmap>,
    index: Vec<u64>,
    next: usize,
    corrupt_frames: u64,
    live: bool,
    consumed_len: usize,
    stop: StopToken,
    empty_polls: u32,
}

impl FileSource {
    /// Opens `path` and indexes every complete frame currently present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = if file.metadata()?.len() > 0 {
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };
        let (index, corrupt_frames) = mmap
            .as_deref()
            .map(build_index)
            .unwrap_or((Vec::new(), 0));
        let consumed_len = mmap.as_deref().map(|m| m.len()).unwrap_or(0);

        Ok(FileSource {
            path,
            file,
            mmap,
            index,
            next: 0,
            corrupt_frames,
            live: false,
            consumed_len,
            stop: StopToken::new(),
            empty_polls: 0,
        })
    }

    /// Opens `path` for live tailing: indexes what is already there,
    /// then [`Source::poll`] continues reading appended bytes until
    /// `stop` is signalled or too many consecutive empty polls elapse.
    pub fn tail(path: impl AsRef<Path>, stop: StopToken) -> Result<Self, SourceError> {
        let mut source = Self::open(path)?;
        source.live = true;
        source.stop = stop;
        Ok(source)
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of frames skipped during corruption recovery so far.
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames
    }

    fn frame_bytes(&self, idx: usize) -> &[u8] {
        let mmap = self.mmap.as_deref().expect("index implies a mapped file");
        let start = self.index[idx] as usize;
        let end = self
            .index
            .get(idx + 1)
            .map(|&o| o as usize)
            .unwrap_or(self.consumed_len);
        &mmap[start..end]
    }

    /// Decodes a single message by index.
    pub fn get(&self, idx: usize) -> Result<DltMessage, SourceError> {
        let bytes = self.frame_bytes(idx);
        match decode_frame(bytes, true) {
            DecodeOutcome::Frame { message, .. } => Ok(message),
            _ => Err(SourceError::Codec(crate::codec::CodecError::LengthMismatch {
                declared: 0,
                available: bytes.len(),
            })),
        }
    }

    /// Decodes `[start, start+count)` in parallel, matching
    /// `DltFile::get_messages`'s rayon fan-out.
    pub fn get_range(&self, start: usize, count: usize) -> Result<Vec<DltMessage>, SourceError> {
        let end = (start + count).min(self.index.len());
        (start..end).into_par_iter().map(|idx| self.get(idx)).collect()
    }

    /// Remaps the file and extends the index over any bytes appended
    /// since the last poll, the live-mode growth path.
    fn refresh(&mut self) -> Result<bool, SourceError> {
        let new_len = self.file.metadata()?.len() as usize;
        if new_len <= self.consumed_len {
            return Ok(false);
        }

        self.mmap = Some(unsafe { Mmap::map(&self.file)? });
        let data = self.mmap.as_deref().unwrap();

        let mut pos = self.consumed_len;
        let mut grew = false;
        while pos < data.len() {
            match decode_frame(&data[pos..], true) {
                DecodeOutcome::Frame { consumed, .. } => {
                    self.index.push(pos as u64);
                    pos += consumed;
                    grew = true;
                }
                DecodeOutcome::Incomplete => break,
                DecodeOutcome::Corrupt { skip } => {
                    self.corrupt_frames += skip as u64;
                    match find_next_sync(data, pos + skip) {
                        Some(next) => pos = next,
                        None => break,
                    }
                }
            }
        }
        self.consumed_len = pos;
        Ok(grew)
    }
}

impl Source for FileSource {
    fn poll(&mut self) -> Result<PollOutcome, SourceError> {
        if self.next < self.index.len() {
            let message = self.get(self.next)?;
            self.next += 1;
            self.empty_polls = 0;
            return Ok(PollOutcome::Message(message));
        }

        if !self.live {
            return Ok(PollOutcome::Done);
        }

        if self.stop.is_stopped() {
            return Ok(PollOutcome::Done);
        }

        if self.refresh()? {
            self.empty_polls = 0;
            if self.next < self.index.len() {
                let message = self.get(self.next)?;
                self.next += 1;
                return Ok(PollOutcome::Message(message));
            }
        }

        self.empty_polls += 1;
        if self.empty_polls >= MAX_EMPTY_POLLS {
            return Ok(PollOutcome::Done);
        }

        std::thread::sleep(Duration::from_millis(100));
        Ok(PollOutcome::Pending)
    }

    fn stop(&mut self) {
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FourCc, StorageHeader};
    use std::io::Write;

    fn frame(apid: &str) -> Vec<u8> {
        let mut storage = Vec::new();
        StorageHeader::now(FourCc::new("ECU1")).encode(&mut storage);

        let extended_len = crate::codec::header::EXTENDED_HEADER_LEN;
        let total_len = (4 + extended_len) as u16;
        let mut frame = Vec::new();
        frame.push(0x01); // UEH only
        frame.push(0);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.push(0x01); // msin: verbose
        frame.push(0);
        frame.extend_from_slice(FourCc::new(apid).as_bytes());
        frame.extend_from_slice(FourCc::new("CTX1").as_bytes());

        storage.extend_from_slice(&frame);
        storage
    }

    #[test]
    fn batch_open_indexes_all_frames() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&frame("APP1")).unwrap();
        file.write_all(&frame("APP2")).unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.get(0).unwrap().apid().to_string(), "APP1");
        assert_eq!(source.get(1).unwrap().apid().to_string(), "APP2");
    }

    #[test]
    fn batch_skips_corrupt_bytes_between_frames() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&frame("APP1")).unwrap();
        file.write_all(b"\xde\xad\xbe\xef").unwrap();
        file.write_all(&frame("APP2")).unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.len(), 2);
        assert!(source.corrupt_frames() > 0);
    }

    #[test]
    fn live_tail_picks_up_appended_frame() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&frame("APP1")).unwrap();
        file.flush().unwrap();

        let stop = StopToken::new();
        let mut source = FileSource::tail(file.path(), stop.clone()).unwrap();

        match source.poll().unwrap() {
            PollOutcome::Message(m) => assert_eq!(m.apid().to_string(), "APP1"),
            _ => panic!("expected first frame"),
        }

        file.write_all(&frame("APP2")).unwrap();
        file.flush().unwrap();

        // One refresh poll should observe the new bytes.
        let mut saw_second = false;
        for _ in 0..5 {
            if let PollOutcome::Message(m) = source.poll().unwrap() {
                assert_eq!(m.apid().to_string(), "APP2");
                saw_second = true;
                break;
            }
        }
        assert!(saw_second, "did not observe appended frame");

        stop.stop();
        assert!(matches!(source.poll().unwrap(), PollOutcome::Done));
    }
}
