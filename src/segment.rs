//! The segment handle: bootstrap, bump carving, and the allocation surface.
//!
//! A [`Segment`] wraps the base pointer of one mapped segment. All mutating
//! operations go through `&mut self`; serializing access between processes
//! is the caller's business, typically via the rwlock stored in the
//! segment's sync block.

use core::marker::PhantomData;
use core::mem::size_of;

use crate::error::{fail, AllocError, FreeError};
use crate::layout::{
    align_up, AreaHeader, ListCell, SegmentHeader, SentinelMark, TreeNode, Word,
    IndexHeader as IndexHeaderRec, DVBUCKET, DVSIZEBUCKET, EXACTBUCKETS_NR, INITIAL_STRHASH_LENGTH,
    INITIAL_SUBAREA_SIZE, MINIMAL_SUBAREA_SIZE, MIN_VARLENOBJ_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION,
    SHORTSTR_SIZE, SUBAREA_ALIGNMENT_BYTES, SYN_VAR_PADDING, VARBUCKETS_NR, WORD_SIZE,
};
use crate::view::SegView;
use crate::{fixed, var};

/// Fixed-length allocation classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixedArea {
    ListCell,
    ShortStr,
    Word,
    DoubleWord,
    TreeNode,
    IndexHeader,
}

impl FixedArea {
    pub const ALL: [FixedArea; 6] = [
        FixedArea::ListCell,
        FixedArea::ShortStr,
        FixedArea::Word,
        FixedArea::DoubleWord,
        FixedArea::TreeNode,
        FixedArea::IndexHeader,
    ];

    /// Object size of this class in bytes.
    pub fn class_size(self) -> Word {
        match self {
            FixedArea::ListCell => size_of::<ListCell>() as Word,
            FixedArea::ShortStr => SHORTSTR_SIZE,
            FixedArea::Word => WORD_SIZE,
            FixedArea::DoubleWord => 2 * WORD_SIZE,
            FixedArea::TreeNode => size_of::<TreeNode>() as Word,
            FixedArea::IndexHeader => size_of::<IndexHeaderRec>() as Word,
        }
    }

    // Index lookup data takes up relatively little space, so the index
    // header area starts with the smallest chunk allowed.
    fn initial_subarea_size(self) -> Word {
        match self {
            FixedArea::IndexHeader => MINIMAL_SUBAREA_SIZE,
            _ => INITIAL_SUBAREA_SIZE,
        }
    }
}

/// Variable-length allocation pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarArea {
    DataRec,
    LongStr,
}

impl VarArea {
    pub const ALL: [VarArea; 2] = [VarArea::DataRec, VarArea::LongStr];
}

/// Mutable handle to one mapped segment.
pub struct Segment<'a> {
    view: SegView,
    region_size: Word,
    _region: PhantomData<&'a mut [u8]>,
}

impl<'a> Segment<'a> {
    /// Wrap a raw, host-acquired mapping of `size` bytes.
    ///
    /// # Safety
    ///
    /// `base` must point to the start of a readable and writable mapping of
    /// at least `size` bytes that outlives `'a` and is not accessed through
    /// any other path while the handle exists.
    pub unsafe fn from_raw(base: *mut u8, size: u64) -> Segment<'a> {
        Segment {
            view: SegView::new(base),
            region_size: size,
            _region: PhantomData,
        }
    }

    pub(crate) fn view(&self) -> SegView {
        self.view
    }

    /// Base pointer of the mapping.
    pub fn base_ptr(&self) -> *const u8 {
        self.view.base()
    }

    /// The segment header. Meaningful only after [`Segment::init`] or on an
    /// attached segment.
    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*self.view.header_ptr() }
    }

    fn header_mut(&mut self) -> &mut SegmentHeader {
        unsafe { &mut *self.view.header_ptr() }
    }

    /// Whether the mapping starts with a valid segment header.
    pub fn is_valid(&self) -> bool {
        let h = self.header();
        h.magic == SEGMENT_MAGIC && h.version == SEGMENT_VERSION
    }

    /// Total segment size in bytes.
    pub fn size(&self) -> Word {
        self.header().size
    }

    /// Current bump pointer: the next unallocated byte.
    pub fn free_offset(&self) -> Word {
        self.header().free
    }

    pub(crate) fn fixed_area_ptr(&self, area: FixedArea) -> *mut AreaHeader {
        let h = self.view.header_ptr();
        unsafe {
            match area {
                FixedArea::ListCell => &mut (*h).listcell as *mut AreaHeader,
                FixedArea::ShortStr => &mut (*h).shortstr as *mut AreaHeader,
                FixedArea::Word => &mut (*h).word as *mut AreaHeader,
                FixedArea::DoubleWord => &mut (*h).doubleword as *mut AreaHeader,
                FixedArea::TreeNode => &mut (*h).tnode as *mut AreaHeader,
                FixedArea::IndexHeader => &mut (*h).indexhdr as *mut AreaHeader,
            }
        }
    }

    pub(crate) fn var_area_ptr(&self, area: VarArea) -> *mut AreaHeader {
        let h = self.view.header_ptr();
        unsafe {
            match area {
                VarArea::DataRec => &mut (*h).datarec as *mut AreaHeader,
                VarArea::LongStr => &mut (*h).longstr as *mut AreaHeader,
            }
        }
    }

    /// Initialize a freshly mapped segment under `key`.
    ///
    /// Writes the header, bootstraps every area with its first sub-area,
    /// carves the string-hash table, reserves synchronization storage and
    /// clears the index control and logging blocks. Partial state is left
    /// as-is on failure.
    pub fn init(&mut self, key: Word) -> Result<(), AllocError> {
        let first_free = align_up(size_of::<SegmentHeader>() as Word, SUBAREA_ALIGNMENT_BYTES);
        if self.region_size <= first_free {
            return fail(AllocError::SegmentFull(self.region_size));
        }
        if (self.view.base() as usize) % SUBAREA_ALIGNMENT_BYTES as usize != 0 {
            log::warn!("segment base pointer has bad alignment (ignoring)");
        }

        let size = self.region_size;
        let base_addr = self.view.base() as usize as Word;
        let h = self.header_mut();
        h.magic = SEGMENT_MAGIC;
        h.version = SEGMENT_VERSION;
        h.size = size;
        h.initial_addr = base_addr;
        h.key = key;
        h.parent = 0;
        h.free = first_free;

        for area in VarArea::ALL {
            self.init_var_area(area)?;
        }
        for area in FixedArea::ALL {
            self.init_fixed_area(area)?;
        }
        self.init_hash_area(INITIAL_STRHASH_LENGTH)?;
        self.init_sync_block()?;
        self.init_index_control();
        self.init_log_block()?;
        Ok(())
    }

    fn init_var_area(&mut self, area: VarArea) -> Result<(), AllocError> {
        let areah = self.var_area_ptr(area);
        unsafe {
            init_subarea(self.view, areah, 0, INITIAL_SUBAREA_SIZE)?;
            (*areah).fixed_length = 0;
            (*areah).obj_length = 0;
            var::init_area_buckets(areah);
            var::init_subarea_freespace(self.view, areah, 0)
        }
    }

    fn init_fixed_area(&mut self, area: FixedArea) -> Result<(), AllocError> {
        let areah = self.fixed_area_ptr(area);
        unsafe {
            init_subarea(self.view, areah, 0, area.initial_subarea_size())?;
            (*areah).fixed_length = 1;
            (*areah).obj_length = area.class_size();
            fixed::make_subarea_freelist(self.view, areah, 0);
        }
        Ok(())
    }

    /// Carve and zero the string-hash offset table.
    fn init_hash_area(&mut self, array_length: Word) -> Result<(), AllocError> {
        let view = self.view;
        // over-allocate by two alignment units so the aligned start fits
        let asize = (array_length + 1) * WORD_SIZE + 2 * SUBAREA_ALIGNMENT_BYTES;
        let chunk = carve_chunk(view, asize)?;
        let array_start = align_up(chunk, SUBAREA_ALIGNMENT_BYTES);
        let h = self.header_mut();
        h.strhash.offset = chunk;
        h.strhash.size = asize;
        h.strhash.array_length = array_length;
        h.strhash.array_start = array_start;
        for slot in 0..array_length {
            view.store(array_start + slot * WORD_SIZE, 0);
        }
        Ok(())
    }

    /// Record the aligned lock storage offset and set up the lock there.
    fn init_sync_block(&mut self) -> Result<(), AllocError> {
        let view = self.view;
        let h = self.header_mut();
        let storage_off = view.offset_of(h.locks.storage.as_ptr());
        let aligned = align_up(storage_off, SYN_VAR_PADDING as Word);
        h.locks.global_lock = aligned;
        #[cfg(not(target_os = "windows"))]
        if unsafe { crate::lock::install_rwlock(view, aligned) }.is_err() {
            return fail(AllocError::SyncInit);
        }
        Ok(())
    }

    fn init_index_control(&mut self) {
        let h = self.header_mut();
        h.index_control.index_count = 0;
        h.index_control.index_table = [0; crate::layout::MAX_INDEXED_FIELDNR + 1];
    }

    fn init_log_block(&mut self) -> Result<(), AllocError> {
        let first = carve_chunk(self.view, INITIAL_SUBAREA_SIZE)?;
        let h = self.header_mut();
        h.logging.first_offset = first;
        h.logging.log_offset = first;
        h.logging.counter = 0;
        h.logging.write_log = 1;
        h.logging.file_open = 0;
        Ok(())
    }

    /// Allocate one object of the area's class size.
    pub fn alloc_fixed(&mut self, area: FixedArea) -> Result<Word, AllocError> {
        let areah = self.fixed_area_ptr(area);
        unsafe { fixed::alloc_object(self.view, areah) }
    }

    /// Push an object back onto the area's freelist.
    ///
    /// No validation is performed; `offset` must come from
    /// [`Segment::alloc_fixed`] on the same area.
    pub fn free_fixed(&mut self, area: FixedArea, offset: Word) {
        let areah = self.fixed_area_ptr(area);
        unsafe { fixed::free_object(self.view, areah, offset) }
    }

    /// Allocate `words` engine words from a variable-length pool.
    pub fn alloc_var(&mut self, area: VarArea, words: Word) -> Result<Word, AllocError> {
        let areah = self.var_area_ptr(area);
        unsafe { var::alloc_words(self.view, areah, words) }
    }

    /// Free a variable-length object, coalescing with free neighbors.
    pub fn free_var(&mut self, area: VarArea, offset: Word) -> Result<(), FreeError> {
        let areah = self.var_area_ptr(area);
        unsafe { var::free_object(self.view, areah, offset) }
    }

    /// The designated victim of a pool: `(offset, byte size)`, `(0, 0)`
    /// when there is none.
    pub fn victim(&self, area: VarArea) -> (Word, Word) {
        let areah = self.var_area_ptr(area);
        unsafe {
            (
                (*areah).freebuckets[DVBUCKET],
                (*areah).freebuckets[DVSIZEBUCKET],
            )
        }
    }

    /// Head of one free bucket chain; `None` for an out-of-range index.
    pub fn bucket_head(&self, area: VarArea, bucket: usize) -> Option<Word> {
        if bucket >= EXACTBUCKETS_NR + VARBUCKETS_NR {
            return None;
        }
        let areah = self.var_area_ptr(area);
        unsafe { Some((*areah).freebuckets[bucket]) }
    }

    /// Size of the free object at `offset`, or `None` when the offset does
    /// not carry a free tag.
    pub fn free_object_size(&self, offset: Word) -> Option<Word> {
        if offset == 0 || offset % WORD_SIZE != 0 || offset + MIN_VARLENOBJ_SIZE > self.size() {
            return None;
        }
        let tag = self.view.fetch(offset);
        crate::layout::is_free(tag).then(|| crate::layout::tag_size(tag))
    }

    /// Sentinel mark of the special-used object at `offset`, if any.
    pub fn sentinel_mark(&self, offset: Word) -> Option<SentinelMark> {
        if offset == 0 || offset % WORD_SIZE != 0 || offset + MIN_VARLENOBJ_SIZE > self.size() {
            return None;
        }
        let tag = self.view.fetch(offset);
        if !crate::layout::is_special_used(tag) {
            return None;
        }
        SentinelMark::from_word(self.view.fetch(offset + WORD_SIZE))
    }

    /// Offset and length of the string-hash offset table, for the
    /// string-interning collaborator.
    pub fn strhash_array(&self) -> (Word, Word) {
        let h = self.header();
        (h.strhash.array_start, h.strhash.array_length)
    }

    /// Read one slot of the string-hash table; 0 when out of range.
    pub fn strhash_entry(&self, index: Word) -> Word {
        let (start, length) = self.strhash_array();
        if index >= length {
            return 0;
        }
        self.view.fetch(start + index * WORD_SIZE)
    }

    /// Write one slot of the string-hash table; ignored when out of range.
    pub fn set_strhash_entry(&mut self, index: Word, value: Word) {
        let (start, length) = self.strhash_array();
        if index < length {
            self.view.store(start + index * WORD_SIZE, value);
        }
    }

    /// Record that out-of-segment references belong to the segment mapped
    /// at `parent_base`.
    ///
    /// Callers must use the same delta when encoding external references.
    pub fn set_parent(&mut self, parent_base: *const u8) {
        let delta =
            (parent_base as usize as Word).wrapping_sub(self.view.base() as usize as Word);
        self.header_mut().parent = delta;
    }

    /// Byte delta to the parent segment; 0 when there is none.
    pub fn parent_delta(&self) -> Word {
        self.header().parent
    }

    /// Carve a nested child segment out of this one.
    pub fn create_child_segment(&mut self, _size: Word) -> Result<Word, AllocError> {
        fail(AllocError::Unsupported)
    }

    /// Handle to the process-shared lock reserved in the sync block.
    #[cfg(not(target_os = "windows"))]
    pub fn rwlock(&self) -> crate::lock::SegRwLock {
        crate::lock::SegRwLock::new(self.view, self.header().locks.global_lock)
    }
}

/// Carve the next `size` bytes off the segment's bump pointer.
///
/// The returned offset is aligned to `SUBAREA_ALIGNMENT_BYTES`; on failure
/// nothing changes and the caller may retry with a smaller size.
pub(crate) fn carve_chunk(view: SegView, size: Word) -> Result<Word, AllocError> {
    let h = unsafe { &mut *view.header_ptr() };
    let last_free = h.free;
    let next_free = align_up(last_free + size, SUBAREA_ALIGNMENT_BYTES);
    if next_free >= h.size {
        return fail(AllocError::SegmentFull(size));
    }
    h.free = next_free;
    Ok(last_free)
}

/// Record a newly carved sub-area in slot `index` of an area.
///
/// # Safety
///
/// `areah` must point to an area header embedded in the segment behind
/// `view`, and `index` must be below `SUBAREA_ARRAY_SIZE`.
pub(crate) unsafe fn init_subarea(
    view: SegView,
    areah: *mut AreaHeader,
    index: usize,
    size: Word,
) -> Result<(), AllocError> {
    if size < MINIMAL_SUBAREA_SIZE {
        return fail(AllocError::SubareaTooSmall(size));
    }
    let chunk = carve_chunk(view, size)?;
    let aligned_offset = align_up(chunk, SUBAREA_ALIGNMENT_BYTES);
    let usable = size - (aligned_offset - chunk);
    let sub = &mut (*areah).subarea_array[index];
    sub.size = size;
    sub.offset = chunk;
    sub.aligned_offset = aligned_offset;
    sub.aligned_size = usable - usable % MIN_VARLENOBJ_SIZE;
    (*areah).last_subarea_index = index as Word;
    (*areah).freelist = 0;
    Ok(())
}
