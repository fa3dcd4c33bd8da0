//! Segment file I/O.
//!
//! Each 16-bit segment id maps to one backing file named by the decimal
//! representation of the id. Page `k` of a segment occupies bytes
//! `[k * PAGE_SIZE, (k + 1) * PAGE_SIZE)` of its file. Reads and writes are
//! exact-size positional block operations; files are grown on demand to
//! cover the highest addressed page before any read.

use corten_common::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An open segment file.
///
/// Block reads and writes to disjoint ranges run concurrently under the
/// shared latch; the latch is taken exclusively only to resize the file.
pub struct SegmentFile {
    file: File,
    latch: RwLock<()>,
    fsync_enabled: bool,
}

impl SegmentFile {
    /// Opens (or lazily creates) the backing file for a segment.
    pub fn open(dir: &Path, segment_id: u16, fsync_enabled: bool) -> Result<Self> {
        let path = dir.join(segment_id.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        Ok(Self {
            file,
            latch: RwLock::new(()),
            fsync_enabled,
        })
    }

    /// Returns the current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Grows the file to at least `min_size` bytes.
    ///
    /// Double-checks under the exclusive latch so concurrent growers resize
    /// only once.
    pub fn ensure_size(&self, min_size: u64) -> Result<()> {
        if self.size()? >= min_size {
            return Ok(());
        }

        let _latch = self.latch.write();
        if self.size()? < min_size {
            self.file.set_len(min_size)?;
        }
        Ok(())
    }

    /// Reads an exact-size block at the given byte offset.
    ///
    /// The file must already cover `offset + buf.len()`.
    pub fn read_block(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let _latch = self.latch.read();
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Writes an exact-size block at the given byte offset.
    pub fn write_block(&self, buf: &[u8], offset: u64) -> Result<()> {
        let _latch = self.latch.read();
        self.file.write_all_at(buf, offset)?;
        if self.fsync_enabled {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// Registry of open segment files, keyed by segment id.
pub struct SegmentManager {
    base_dir: PathBuf,
    fsync_enabled: bool,
    segments: RwLock<HashMap<u16, Arc<SegmentFile>>>,
}

impl SegmentManager {
    /// Creates a segment manager rooted at the given directory.
    pub fn new(base_dir: impl Into<PathBuf>, fsync_enabled: bool) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;

        Ok(Self {
            base_dir,
            fsync_enabled,
            segments: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the directory containing the segment files.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the file for a segment, opening it on first use.
    pub fn segment(&self, segment_id: u16) -> Result<Arc<SegmentFile>> {
        {
            let segments = self.segments.read();
            if let Some(segment) = segments.get(&segment_id) {
                return Ok(Arc::clone(segment));
            }
        }

        let mut segments = self.segments.write();
        // Someone may have opened it between the two lock acquisitions.
        if let Some(segment) = segments.get(&segment_id) {
            return Ok(Arc::clone(segment));
        }

        let segment = Arc::new(SegmentFile::open(
            &self.base_dir,
            segment_id,
            self.fsync_enabled,
        )?);
        segments.insert(segment_id, Arc::clone(&segment));
        Ok(segment)
    }
}
