//! Allocator core of an embeddable, shared-memory database engine.
//!
//! One pre-sized, fixed-length memory segment (mapped or inherited by
//! several processes via a key) holds all persistent data structures.
//! Everything inside the segment is addressed by byte offsets from the
//! segment base, never by raw pointers, so the segment can be re-mapped
//! at any base address; offset 0 is the reserved null.
//!
//! The segment starts with a header embedding one allocation area per
//! object kind. Fixed-length areas (list cells, short strings, words,
//! double words, index nodes, index descriptors) hand out class-sized
//! slots off a LIFO free list. Variable-length areas (data records, long
//! strings) run a segregated-fit allocator with boundary tags, exact and
//! log-scale size buckets, a cached "designated victim" block, and
//! bidirectional coalescing on free. Areas grow on demand by carving
//! power-of-two sub-areas off a monotonic bump pointer.
//!
//! Access is cooperative: all mutating calls take `&mut` and the caller
//! serializes between processes, typically via the rwlock stored in the
//! segment's sync block.
//!
//! ```
//! use stratadb::{FixedArea, HeapRegion, VarArea};
//!
//! let mut region = HeapRegion::create(1 << 20)?;
//! let mut seg = region.segment();
//! let cell = seg.alloc_fixed(FixedArea::ListCell)?;
//! let tuple = seg.alloc_var(VarArea::DataRec, 10)?;
//! seg.free_var(VarArea::DataRec, tuple)?;
//! seg.free_fixed(FixedArea::ListCell, cell);
//! # Ok::<(), anyhow::Error>(())
//! ```

mod error;
mod fixed;
mod layout;
mod region;
mod segment;
mod var;
mod view;

pub mod check;

#[cfg(not(target_os = "windows"))]
mod lock;

pub use error::{AllocError, CheckError, FreeError, RegionError};
pub use layout::{
    AreaHeader, HashAreaHeader, IndexControlBlock, IndexHeader, ListCell, LogBlock, SegmentHeader,
    SentinelMark, SubArea, SyncBlock, TreeNode, Word, CACHEBUCKETS_NR, DVBUCKET, DVSIZEBUCKET,
    EXACTBUCKETS_NR, FREEBUCKETS_NR, INITIAL_STRHASH_LENGTH, INITIAL_SUBAREA_SIZE,
    MAX_INDEXED_FIELDNR, MAX_INDEX_FIELDS, MAX_LOCKS, MINIMAL_SUBAREA_SIZE, MIN_VARLENOBJ_SIZE,
    SEGMENT_MAGIC, SEGMENT_VERSION, SHORTSTR_SIZE, SUBAREA_ALIGNMENT_BYTES, SUBAREA_ARRAY_SIZE,
    SYN_VAR_PADDING, TNODE_ARRAY_SIZE, VARBUCKETS_NR, WORD_SIZE,
};
pub use region::HeapRegion;
pub use segment::{FixedArea, Segment, VarArea};
pub use var::bucket_index;

#[cfg(not(target_os = "windows"))]
pub use lock::{SegReadGuard, SegRwLock, SegWriteGuard};
#[cfg(not(target_os = "windows"))]
pub use region::ShmRegion;
