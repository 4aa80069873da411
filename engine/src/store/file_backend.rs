//! File backend collaborator (design §4.3, §6).
//!
//! Adapted from the teacher's `fs::file::TorrentFile` (single-file
//! `OpenOptions` wrapper) and `fs::mod::read_piece` (walking a file list by
//! byte-range overlap): generalized into a `FileBackend` trait so the engine
//! never touches `std::fs` directly, plus a `FileSet` that builds the
//! interval index the design calls for and lazily upgrades handles from
//! read-only to read-write on first write.

use std::collections::HashMap;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// One file's role in the flat byte-addressed torrent layout.
#[derive(Debug, Clone)]
pub struct FileSpan {
    pub path: PathBuf,
    pub length: u64,
}

/// A single open file, in either read-only or read-write mode.
pub trait FileHandle: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn is_writable(&self) -> bool;
}

/// Collaborator that opens and inspects files by path. The core never picks
/// paths or creation policy; that's the embedder's job.
pub trait FileBackend: Send {
    fn open(&mut self, path: &Path, writable: bool) -> io::Result<Box<dyn FileHandle>>;
    fn exists(&self, path: &Path) -> bool;
    fn getsize(&self, path: &Path) -> io::Result<u64>;
}

/// `std::fs`-backed implementation, grounded in the teacher's
/// `fs::file::TorrentFile::new`.
pub struct StdFileBackend {
    root: PathBuf,
}

impl StdFileBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

struct StdFileHandle {
    handle: std::fs::File,
    writable: bool,
}

impl FileHandle for StdFileHandle {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        self.handle.seek(SeekFrom::Start(offset))?;
        self.handle.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        self.handle.seek(SeekFrom::Start(offset))?;
        self.handle.write_all(buf)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.handle.set_len(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        use std::io::Write;
        self.handle.flush()
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

impl FileBackend for StdFileBackend {
    fn open(&mut self, path: &Path, writable: bool) -> io::Result<Box<dyn FileHandle>> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let handle = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(writable)
            .open(&full)?;
        Ok(Box::new(StdFileHandle { handle, writable }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    fn getsize(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(self.resolve(path))?.len())
    }
}

/// One triple of the interval index: `byte_range` bytes of the request land
/// in `file_idx` starting at `file_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_idx: usize,
    pub file_offset: u64,
    pub len: u64,
}

/// Multi-file byte-addressed storage: the interval index plus lazily
/// upgraded handles and the `tops` table `was_preallocated` consults.
pub struct FileSet {
    backend: Box<dyn FileBackend>,
    spans: Vec<FileSpan>,
    /// Absolute byte offset each file starts at in the flattened layout.
    starts: Vec<u64>,
    /// Size observed on open, before any truncation -- used by
    /// `was_preallocated`.
    tops: Vec<u64>,
    handles: HashMap<usize, Box<dyn FileHandle>>,
}

impl FileSet {
    /// Opens every non-empty file, truncating any that exceed their
    /// declared length and recording the pre-truncation size as `tops`.
    pub fn open(mut backend: Box<dyn FileBackend>, spans: Vec<FileSpan>) -> io::Result<Self> {
        let mut starts = Vec::with_capacity(spans.len());
        let mut tops = Vec::with_capacity(spans.len());
        let mut offset = 0u64;
        for span in &spans {
            starts.push(offset);
            offset += span.length;

            if span.length == 0 {
                tops.push(0);
                continue;
            }
            if backend.exists(&span.path) {
                let observed = backend.getsize(&span.path)?;
                tops.push(observed);
                if observed > span.length {
                    let mut h = backend.open(&span.path, true)?;
                    h.truncate(span.length)?;
                }
            } else {
                tops.push(0);
            }
        }
        Ok(Self { backend, spans, starts, tops, handles: HashMap::new() })
    }

    pub fn total_len(&self) -> u64 {
        self.starts.last().copied().unwrap_or(0) + self.spans.last().map(|s| s.length).unwrap_or(0)
    }

    /// Every `(file, offset_in_file, bytes_here)` triple covering
    /// `[offset, offset+length)`, skipping zero-length files.
    pub fn intersect(&self, offset: u64, length: u64) -> Vec<FileSlice> {
        let end = offset + length;
        let mut out = Vec::new();
        for (i, span) in self.spans.iter().enumerate() {
            if span.length == 0 {
                continue;
            }
            let file_start = self.starts[i];
            let file_end = file_start + span.length;
            if file_end <= offset || file_start >= end {
                continue;
            }
            let lo = offset.max(file_start);
            let hi = end.min(file_end);
            out.push(FileSlice {
                file_idx: i,
                file_offset: lo - file_start,
                len: hi - lo,
            });
        }
        out
    }

    /// True iff every file overlapping `[offset, offset+length)` was at
    /// least its declared length when opened.
    pub fn was_preallocated(&self, offset: u64, length: u64) -> bool {
        self.intersect(offset, length)
            .iter()
            .all(|slice| self.tops[slice.file_idx] >= slice.file_offset + slice.len)
    }

    fn handle(&mut self, file_idx: usize, writable: bool) -> io::Result<&mut Box<dyn FileHandle>> {
        let need_upgrade = self
            .handles
            .get(&file_idx)
            .map(|h| writable && !h.is_writable())
            .unwrap_or(true);
        if need_upgrade {
            let h = self.backend.open(&self.spans[file_idx].path, writable)?;
            self.handles.insert(file_idx, h);
        }
        Ok(self.handles.get_mut(&file_idx).unwrap())
    }

    pub fn read(&mut self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; length as usize];
        let mut written = 0usize;
        for slice in self.intersect(offset, length) {
            let h = self.handle(slice.file_idx, false)?;
            h.read_at(slice.file_offset, &mut out[written..written + slice.len as usize])?;
            written += slice.len as usize;
        }
        Ok(out)
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut consumed = 0usize;
        for slice in self.intersect(offset, data.len() as u64) {
            let h = self.handle(slice.file_idx, true)?;
            h.write_at(slice.file_offset, &data[consumed..consumed + slice.len as usize])?;
            consumed += slice.len as usize;
        }
        Ok(())
    }

    /// Flushes and downgrades every write handle back to read-only.
    pub fn set_readonly(&mut self) -> io::Result<()> {
        for idx in 0..self.spans.len() {
            if let Some(h) = self.handles.get_mut(&idx) {
                if h.is_writable() {
                    h.flush()?;
                }
            }
        }
        for idx in 0..self.spans.len() {
            if self.handles.get(&idx).map(|h| h.is_writable()).unwrap_or(false) {
                let h = self.backend.open(&self.spans[idx].path, false)?;
                self.handles.insert(idx, h);
            }
        }
        Ok(())
    }

    pub fn piece_byte_range(&self, offset: u64, length: u64) -> Range<u64> {
        offset..offset + length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn intersect_splits_a_request_across_files() {
        let dir = tempdir().unwrap();
        let backend = StdFileBackend::new(dir.path().to_path_buf());
        let spans = vec![
            FileSpan { path: PathBuf::from("a"), length: 10 },
            FileSpan { path: PathBuf::from("b"), length: 20 },
        ];
        let set = FileSet::open(Box::new(backend), spans).unwrap();
        let slices = set.intersect(5, 10);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0], FileSlice { file_idx: 0, file_offset: 5, len: 5 });
        assert_eq!(slices[1], FileSlice { file_idx: 1, file_offset: 0, len: 5 });
    }

    #[test]
    fn zero_length_files_are_skipped() {
        let dir = tempdir().unwrap();
        let backend = StdFileBackend::new(dir.path().to_path_buf());
        let spans = vec![
            FileSpan { path: PathBuf::from("empty"), length: 0 },
            FileSpan { path: PathBuf::from("full"), length: 10 },
        ];
        let set = FileSet::open(Box::new(backend), spans).unwrap();
        let slices = set.intersect(0, 10);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].file_idx, 1);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let backend = StdFileBackend::new(dir.path().to_path_buf());
        let spans = vec![
            FileSpan { path: PathBuf::from("a"), length: 4 },
            FileSpan { path: PathBuf::from("b"), length: 4 },
        ];
        let mut set = FileSet::open(Box::new(backend), spans).unwrap();
        set.write(2, b"abcd").unwrap();
        let data = set.read(0, 8).unwrap();
        assert_eq!(&data[2..6], b"abcd");
    }

    #[test]
    fn preexisting_oversized_file_is_truncated_but_tops_remembers_it() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![1u8; 20]).unwrap();
        let backend = StdFileBackend::new(dir.path().to_path_buf());
        let spans = vec![FileSpan { path: PathBuf::from("a"), length: 10 }];
        let set = FileSet::open(Box::new(backend), spans).unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("a")).unwrap().len(), 10);
        assert!(set.was_preallocated(0, 10));
    }

    #[test]
    fn missing_file_is_not_preallocated() {
        let dir = tempdir().unwrap();
        let backend = StdFileBackend::new(dir.path().to_path_buf());
        let spans = vec![FileSpan { path: PathBuf::from("missing"), length: 10 }];
        let set = FileSet::open(Box::new(backend), spans).unwrap();
        assert!(!set.was_preallocated(0, 10));
    }
}
