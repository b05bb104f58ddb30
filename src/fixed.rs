//! Fixed-length object pools.
//!
//! Each class keeps a LIFO free list threaded through the first word of
//! every free slot. An exhausted class grows by carving a new sub-area,
//! twice the previous size, retried once at the previous size.

use crate::error::{fail, AllocError};
use crate::layout::{AreaHeader, Word, SUBAREA_ARRAY_SIZE};
use crate::segment::init_subarea;
use crate::view::SegView;

/// Pop the freelist head, extending the area once if the list is empty.
///
/// # Safety
///
/// `areah` must point to a fixed-length area header embedded in the
/// segment behind `view`.
pub(crate) unsafe fn alloc_object(
    view: SegView,
    areah: *mut AreaHeader,
) -> Result<Word, AllocError> {
    let mut freelist = (*areah).freelist;
    if freelist == 0 {
        extend_area(view, areah)?;
        freelist = (*areah).freelist;
        if freelist == 0 {
            return fail(AllocError::FixedPoolExhausted((*areah).obj_length));
        }
    }
    (*areah).freelist = view.fetch(freelist);
    Ok(freelist)
}

/// Push a slot back onto the freelist. No validation.
///
/// # Safety
///
/// `areah` must point to a fixed-length area header embedded in the
/// segment behind `view`; `offset` must have come from [`alloc_object`]
/// on the same area.
pub(crate) unsafe fn free_object(view: SegView, areah: *mut AreaHeader, offset: Word) {
    view.store(offset, (*areah).freelist);
    (*areah).freelist = offset;
}

/// Thread sub-area `index` into a fresh freelist.
///
/// # Safety
///
/// `areah` must point to a fixed-length area header with a populated
/// sub-area at `index`.
pub(crate) unsafe fn make_subarea_freelist(view: SegView, areah: *mut AreaHeader, index: usize) {
    let obj_length = (*areah).obj_length;
    let sub = (*areah).subarea_array[index];
    let offset = sub.aligned_offset;
    let last = (offset + sub.aligned_size) - 2 * obj_length;
    let mut at = offset;
    while at <= last {
        view.store(at, at + obj_length);
        at += obj_length;
    }
    view.store(at, 0);
    (*areah).freelist = offset;
}

/// Grow the area by one sub-area and rebuild the freelist from it.
///
/// # Safety
///
/// `areah` must point to a fixed-length area header embedded in the
/// segment behind `view`.
unsafe fn extend_area(view: SegView, areah: *mut AreaHeader) -> Result<(), AllocError> {
    let last = (*areah).last_subarea_index as usize;
    if last + 1 >= SUBAREA_ARRAY_SIZE {
        return fail(AllocError::SubareaSlotsExhausted((*areah).obj_length));
    }
    let prev_size = (*areah).subarea_array[last].size;
    if init_subarea(view, areah, last + 1, prev_size * 2).is_err() {
        // the doubled size did not fit; retry at the last size
        init_subarea(view, areah, last + 1, prev_size)?;
    }
    make_subarea_freelist(view, areah, last + 1);
    Ok(())
}
