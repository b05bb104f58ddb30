//! Typed allocator errors and the single diagnostic sink.
//!
//! Every allocation failure is reported exactly once, as one line through
//! the `log` facade, at the point where it is first detected. Corruption
//! class errors indicate undefined behavior upstream; there is no
//! recovery.

use thiserror::Error;

use crate::layout::Word;

/// Errors surfaced by the allocation and bootstrap paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("segment does not have enough space for a chunk of {0} bytes")]
    SegmentFull(Word),
    #[error("requested subarea size {0} is below the allowed minimum")]
    SubareaTooSmall(Word),
    #[error("no more subarea slots available for object size {0}")]
    SubareaSlotsExhausted(Word),
    #[error("no free fixed-length objects available for size {0}")]
    FixedPoolExhausted(Word),
    #[error("requested size {0} does not fit any free bucket")]
    BucketOverflow(Word),
    #[error("cannot allocate an empty object")]
    EmptyRequest,
    #[error("cannot extend area for a request of {0} bytes")]
    ExtendFailed(Word),
    #[error("free object chain is corrupt at offset {0}")]
    CorruptFreeObject(Word),
    #[error("cannot initialize synchronization storage")]
    SyncInit,
    #[error("child segments are not supported")]
    Unsupported,
}

/// Errors surfaced by [`crate::Segment::free_var`].
///
/// The numeric contract codes engine collaborators persist are available
/// through [`FreeError::code`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FreeError {
    #[error("offset is not an object in this segment")]
    NotSegmentAddress,
    #[error("object is already free")]
    DoubleFree,
    #[error("object size is below the variable-length minimum")]
    SizeTooSmall,
    #[error("neighboring object tags are inconsistent")]
    Corruption,
}

impl FreeError {
    /// The stable negative code for this error.
    pub fn code(&self) -> i64 {
        match self {
            FreeError::NotSegmentAddress => -1,
            FreeError::DoubleFree => -2,
            FreeError::SizeTooSmall => -3,
            FreeError::Corruption => -4,
        }
    }
}

/// Errors raised while creating or attaching a region.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("segment rejected: {0}")]
    BadSegment(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Init(#[from] AllocError),
}

/// Invariant violations found by [`crate::check::verify_segment`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error("bad or misplaced sentinel at offset {0}")]
    BadSentinel(Word),
    #[error("object at offset {0} does not tile its subarea")]
    BrokenTiling(Word),
    #[error("free object at offset {0} has a mismatched footer")]
    FooterMismatch(Word),
    #[error("adjacent free objects at offsets {0} and {1}")]
    AdjacentFree(Word, Word),
    #[error("wrong prev-free flag on object at offset {0}")]
    PrevFlagWrong(Word),
    #[error("second designated victim at offset {0}")]
    DuplicateVictim(Word),
    #[error("victim cache slots disagree with the object at offset {0}")]
    VictimSlotMismatch(Word),
    #[error("object at offset {0} is chained into bucket {1} it does not belong to")]
    WrongBucket(Word, usize),
    #[error("bucket chain broken at offset {0}")]
    BrokenChain(Word),
    #[error("fixed freelist entry {0} escapes its subareas")]
    FreelistEscape(Word),
}

/// Report an allocation failure through the diagnostic sink and pass it on.
pub(crate) fn fail<T>(err: AllocError) -> Result<T, AllocError> {
    log::error!("segment allocator: {err}");
    Err(err)
}

/// Report a free failure through the diagnostic sink and pass it on.
pub(crate) fn fail_free<T>(err: FreeError) -> Result<T, FreeError> {
    log::error!("segment allocator: {err}");
    Err(err)
}
