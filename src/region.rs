//! Region acquisition: where segments come from.
//!
//! A region owns the memory behind exactly one segment and lends out
//! [`Segment`] handles. [`ShmRegion`] maps a keyed file (on Linux under
//! `/dev/shm`) so several processes can inherit the same segment;
//! [`HeapRegion`] backs a segment with process-local memory for embedders
//! and tests. The allocator itself never owns a mapping.

use crate::error::RegionError;
use crate::layout::{Word, WORD_SIZE};
use crate::segment::Segment;

#[cfg(not(target_os = "windows"))]
use std::fs;
#[cfg(not(target_os = "windows"))]
use std::io;
#[cfg(not(target_os = "windows"))]
use std::path::{Path, PathBuf};

#[cfg(not(target_os = "windows"))]
use memmap2::MmapMut;

#[cfg(not(target_os = "windows"))]
use crate::layout::{SegmentHeader, SEGMENT_MAGIC, SEGMENT_VERSION};

/// A process-local segment in heap memory.
///
/// Word-backed so the base is always word aligned.
pub struct HeapRegion {
    buf: Vec<Word>,
}

impl HeapRegion {
    /// Allocate and initialize a local segment of `size` bytes.
    ///
    /// The key of a local segment is 0.
    pub fn create(size: usize) -> Result<Self, RegionError> {
        let words = size / WORD_SIZE as usize;
        let mut region = HeapRegion {
            buf: vec![0; words],
        };
        region.segment().init(0)?;
        Ok(region)
    }

    /// The segment handle. Exclusive while borrowed.
    pub fn segment(&mut self) -> Segment<'_> {
        let bytes = (self.buf.len() * WORD_SIZE as usize) as u64;
        unsafe { Segment::from_raw(self.buf.as_mut_ptr() as *mut u8, bytes) }
    }
}

/// Where the keyed segment files live.
#[cfg(not(target_os = "windows"))]
fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        // macOS and other Unix: use TMPDIR
        std::env::temp_dir().join("stratadb")
    }
}

#[cfg(not(target_os = "windows"))]
fn segment_path(key: Word) -> PathBuf {
    shm_dir().join(format!("stratadb-{key}.seg"))
}

/// A keyed, file-backed shared-memory segment.
///
/// Multiple processes attaching the same key map the same file and see
/// the same segment; each holds its own `ShmRegion`.
#[cfg(not(target_os = "windows"))]
pub struct ShmRegion {
    mmap: MmapMut,
    path: PathBuf,
}

#[cfg(not(target_os = "windows"))]
impl ShmRegion {
    /// Create a fresh segment of `size` bytes under `key`, replacing any
    /// previous file.
    pub fn create(key: Word, size: usize) -> Result<Self, RegionError> {
        let dir = shm_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = segment_path(key);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        // Safety: the file was just created and is owned exclusively here.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(0);

        let mut region = ShmRegion { mmap, path };
        region.segment().init(key)?;
        region.mmap.flush()?;
        Ok(region)
    }

    /// Attach to an existing segment under `key`.
    pub fn attach(key: Word) -> Result<Self, RegionError> {
        Self::open_path(&segment_path(key))
    }

    fn open_path(path: &Path) -> Result<Self, RegionError> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        if mmap.len() < core::mem::size_of::<SegmentHeader>() {
            return Err(RegionError::BadSegment("file smaller than a segment header"));
        }
        let header = unsafe { &*(mmap.as_ptr() as *const SegmentHeader) };
        if header.magic != SEGMENT_MAGIC {
            return Err(RegionError::BadSegment("bad magic"));
        }
        if header.version != SEGMENT_VERSION {
            return Err(RegionError::BadSegment("unsupported segment version"));
        }
        if header.size as usize > mmap.len() {
            return Err(RegionError::BadSegment("mapping shorter than the segment"));
        }

        Ok(ShmRegion {
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// Attach when a matching segment exists under `key`, create otherwise.
    pub fn create_or_attach(key: Word, size: usize) -> Result<Self, RegionError> {
        let path = segment_path(key);
        if path.exists() {
            match Self::open_path(&path) {
                Ok(region) if region.header().size == size as Word => return Ok(region),
                // size mismatch or a stale file: recreate
                _ => {}
            }
        }
        Self::create(key, size)
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.mmap.as_ptr() as *const SegmentHeader) }
    }

    /// The segment handle. Exclusive while borrowed; cross-process callers
    /// serialize through the segment's rwlock.
    pub fn segment(&mut self) -> Segment<'_> {
        let len = self.mmap.len() as u64;
        unsafe { Segment::from_raw(self.mmap.as_mut_ptr(), len) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the backing file.
    pub fn unlink(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}
