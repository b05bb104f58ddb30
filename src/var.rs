//! Variable-length object pools.
//!
//! A segregated-fit allocator over raw offset arithmetic: an exact-size
//! bucket bank for small objects, log-scale buckets above, and a cached
//! "designated victim" block that new allocations are carved off
//! preferentially. Objects carry boundary tags (size + flags in the first
//! and last word) so freeing coalesces with both neighbors in O(1).
//!
//! Free objects of one size class form a doubly linked chain through
//! their second and third words. The back link of the chain head holds
//! the segment offset of the bucket slot itself, so every chain member
//! has a non-null back link.

use crate::error::{fail, fail_free, AllocError, FreeError};
use crate::layout::{
    is_free, is_normal_used, is_prev_free, is_special_used, make_free, make_special_used,
    make_used_prev_free, make_used_prev_used, tag_size, AreaHeader, SegmentHeader, SentinelMark,
    Word, DVBUCKET, DVSIZEBUCKET, EXACTBUCKETS_NR, FREEBUCKETS_NR, MIN_VARLENOBJ_SIZE,
    SEGMENT_MAGIC, SUBAREA_ALIGNMENT_BYTES, SUBAREA_ARRAY_SIZE, VARBUCKETS_NR, WORD_SIZE,
};
use crate::segment::init_subarea;
use crate::view::SegView;

/// Freebucket index for an object of `size` bytes.
///
/// Sizes below `EXACTBUCKETS_NR` map to the bucket of that exact size;
/// larger sizes go to log-scale buckets (256..511, 512..1023, and so on).
/// Returns `None` when the size is beyond the last bucket.
pub fn bucket_index(size: Word) -> Option<usize> {
    if (size as usize) < EXACTBUCKETS_NR {
        return Some(size as usize);
    }
    let mut cursize = (EXACTBUCKETS_NR * 2) as Word;
    for i in 0..VARBUCKETS_NR {
        if size < cursize {
            return Some(EXACTBUCKETS_NR + i);
        }
        cursize *= 2;
    }
    None
}

/// Round a byte request up to a legal object size: at least
/// `MIN_VARLENOBJ_SIZE` and a multiple of the free-object granularity.
fn round_up_request(wanted: Word) -> Word {
    if wanted <= MIN_VARLENOBJ_SIZE {
        MIN_VARLENOBJ_SIZE
    } else {
        crate::layout::align_up(wanted, 8)
    }
}

/// Segment offset of one bucket slot inside the area header.
unsafe fn bucket_slot_offset(view: SegView, areah: *mut AreaHeader, bucket: usize) -> Word {
    view.offset_of((*areah).freebuckets.as_ptr().add(bucket))
}

/// Link `object` (already tagged free, footer written) at the head of
/// `bucket`.
unsafe fn push_bucket(view: SegView, areah: *mut AreaHeader, bucket: usize, object: Word) {
    let head = (*areah).freebuckets[bucket];
    if head != 0 {
        view.store(head + 2 * WORD_SIZE, object);
    }
    view.store(object + WORD_SIZE, head);
    view.store(object + 2 * WORD_SIZE, bucket_slot_offset(view, areah, bucket));
    (*areah).freebuckets[bucket] = object;
}

/// Unlink and return the head of `bucket`, re-pointing the new head's
/// back link at the bucket slot.
unsafe fn pop_bucket_head(view: SegView, areah: *mut AreaHeader, bucket: usize) -> Word {
    let object = (*areah).freebuckets[bucket];
    let next = view.fetch(object + WORD_SIZE);
    (*areah).freebuckets[bucket] = next;
    if next != 0 {
        view.store(next + 2 * WORD_SIZE, bucket_slot_offset(view, areah, bucket));
    }
    object
}

/// Unlink a free object of `size` bytes from its bucket chain, handling
/// both the head and interior positions.
unsafe fn unlink_free(
    view: SegView,
    areah: *mut AreaHeader,
    object: Word,
    size: Word,
) -> Result<(), FreeError> {
    let next = view.fetch(object + WORD_SIZE);
    let prev = view.fetch(object + 2 * WORD_SIZE);
    let bucket = match bucket_index(size) {
        Some(b) => b,
        None => return fail_free(FreeError::Corruption),
    };
    if (*areah).freebuckets[bucket] == object {
        (*areah).freebuckets[bucket] = next;
    } else {
        // interior: the back link names the chain predecessor
        view.store(prev + WORD_SIZE, next);
    }
    if next != 0 {
        view.store(next + 2 * WORD_SIZE, prev);
    }
    Ok(())
}

/// Zero every bucket and cache slot of a fresh area.
///
/// # Safety
///
/// `areah` must point to an area header embedded in a segment.
pub(crate) unsafe fn init_area_buckets(areah: *mut AreaHeader) {
    (*areah).freebuckets = [0; FREEBUCKETS_NR];
}

/// Write one boundary sentinel: a minimal special-used object whose
/// second word carries the mark and whose last word repeats the size.
unsafe fn write_sentinel(view: SegView, offset: Word, mark: SentinelMark) {
    view.store(offset, make_special_used(MIN_VARLENOBJ_SIZE));
    view.store(offset + WORD_SIZE, mark.as_word());
    view.store(offset + 2 * WORD_SIZE, 0);
    view.store(offset + MIN_VARLENOBJ_SIZE - WORD_SIZE, MIN_VARLENOBJ_SIZE);
}

/// Mark up sub-area `index` for variable-length use: begin and end
/// sentinels around one big free block that becomes the designated victim.
///
/// A victim left over from an older sub-area is pushed onto its bucket
/// first, so the cache slots always describe the newest sub-area's block.
///
/// # Safety
///
/// `areah` must point to a variable-length area header embedded in the
/// segment behind `view`, with a populated sub-area at `index`.
pub(crate) unsafe fn init_subarea_freespace(
    view: SegView,
    areah: *mut AreaHeader,
    index: usize,
) -> Result<(), AllocError> {
    let sub = (*areah).subarea_array[index];
    let offset = sub.aligned_offset;
    let size = sub.aligned_size;

    if index > 0 {
        let dv = (*areah).freebuckets[DVBUCKET];
        let dv_size = (*areah).freebuckets[DVSIZEBUCKET];
        if dv != 0 && dv_size >= MIN_VARLENOBJ_SIZE {
            let bucket = match bucket_index(dv_size) {
                Some(b) => b,
                None => return fail(AllocError::BucketOverflow(dv_size)),
            };
            view.store(dv, make_free(dv_size));
            view.store(dv + dv_size - WORD_SIZE, make_free(dv_size));
            push_bucket(view, areah, bucket, dv);
        }
    }

    write_sentinel(view, offset, SentinelMark::SubareaStart);
    write_sentinel(
        view,
        offset + size - MIN_VARLENOBJ_SIZE,
        SentinelMark::SubareaEnd,
    );

    // everything between the sentinels becomes the new victim; it is
    // marked special-used, not free, and sits in no bucket
    let free_offset = offset + MIN_VARLENOBJ_SIZE;
    let free_size = size - 2 * MIN_VARLENOBJ_SIZE;
    view.store(free_offset, make_special_used(free_size));
    view.store(free_offset + WORD_SIZE, SentinelMark::Victim.as_word());
    (*areah).freebuckets[DVBUCKET] = free_offset;
    (*areah).freebuckets[DVSIZEBUCKET] = free_size;
    Ok(())
}

/// Split the head of `bucket`: the prefix becomes a used object of `used`
/// bytes, the remainder goes back to the bucket of its own size.
///
/// The head must be free and large enough to leave a remainder of at
/// least `MIN_VARLENOBJ_SIZE`.
unsafe fn split_free(
    view: SegView,
    areah: *mut AreaHeader,
    used: Word,
    bucket: usize,
) -> Result<(), AllocError> {
    let object = (*areah).freebuckets[bucket];
    let head_tag = view.fetch(object);
    if !is_free(head_tag) {
        return fail(AllocError::CorruptFreeObject(object));
    }
    let old_size = tag_size(head_tag);
    // a chain head has no free physical predecessor, so the allocated
    // prefix is tagged prev-used
    view.store(object, make_used_prev_used(used));
    let next = view.fetch(object + WORD_SIZE);
    (*areah).freebuckets[bucket] = next;
    if next != 0 {
        view.store(next + 2 * WORD_SIZE, bucket_slot_offset(view, areah, bucket));
    }

    let split_size = old_size - used;
    let split_object = object + used;
    let split_bucket = match bucket_index(split_size) {
        Some(b) => b,
        None => return fail(AllocError::BucketOverflow(split_size)),
    };
    view.store(split_object, make_free(split_size));
    view.store(split_object + split_size - WORD_SIZE, make_free(split_size));
    push_bucket(view, areah, split_bucket, split_object);
    Ok(())
}

/// Allocate `words` engine words from the area.
///
/// Search order: the exact-size bucket, the three nearest larger exact
/// buckets, the designated victim, the remaining exact buckets, the
/// log-scale buckets, and finally sub-area extension followed by a retry.
///
/// # Safety
///
/// `areah` must point to a variable-length area header embedded in the
/// segment behind `view`.
pub(crate) unsafe fn alloc_words(
    view: SegView,
    areah: *mut AreaHeader,
    words: Word,
) -> Result<Word, AllocError> {
    if words == 0 {
        return fail(AllocError::EmptyRequest);
    }
    let wanted = match words.checked_mul(WORD_SIZE) {
        Some(w) => w,
        None => return fail(AllocError::BucketOverflow(Word::MAX)),
    };
    let used = round_up_request(wanted);

    // an exact-size chain head fits as-is
    if (used as usize) < EXACTBUCKETS_NR && (*areah).freebuckets[used as usize] != 0 {
        let object = pop_bucket_head(view, areah, used as usize);
        view.store(object, make_used_prev_used(used));
        return Ok(object);
    }

    // a nearby exact bucket whose head leaves a usable remainder
    let mut bucket = used + 1;
    let mut tried = 0;
    while (bucket as usize) < EXACTBUCKETS_NR && tried < 3 {
        let head = (*areah).freebuckets[bucket as usize];
        if head != 0 && tag_size(view.fetch(head)) >= used + MIN_VARLENOBJ_SIZE {
            split_free(view, areah, used, bucket as usize)?;
            return Ok(head);
        }
        bucket += 1;
        tried += 1;
    }

    // carve off the beginning of the designated victim
    let dv = (*areah).freebuckets[DVBUCKET];
    let dv_size = (*areah).freebuckets[DVSIZEBUCKET];
    if used <= dv_size && dv != 0 {
        if used == dv_size {
            // exactly right: the victim is used up and disappears
            (*areah).freebuckets[DVBUCKET] = 0;
            (*areah).freebuckets[DVSIZEBUCKET] = 0;
            view.store(dv, make_used_prev_used(used));
            return Ok(dv);
        } else if used + MIN_VARLENOBJ_SIZE <= dv_size {
            // take the head, keep the tail as the victim
            view.store(dv + used, make_special_used(dv_size - used));
            view.store(dv + used + WORD_SIZE, SentinelMark::Victim.as_word());
            (*areah).freebuckets[DVBUCKET] = dv + used;
            (*areah).freebuckets[DVSIZEBUCKET] = dv_size - used;
            view.store(dv, make_used_prev_used(used));
            return Ok(dv);
        }
    }

    // any remaining exact bucket whose head can be split
    let mut bucket = used + 1;
    while (bucket as usize) < EXACTBUCKETS_NR {
        let head = (*areah).freebuckets[bucket as usize];
        if head != 0 && tag_size(view.fetch(head)) >= used + MIN_VARLENOBJ_SIZE {
            split_free(view, areah, used, bucket as usize)?;
            return Ok(head);
        }
        bucket += 1;
    }

    // log-scale buckets, smallest class first
    let first = match bucket_index(used) {
        Some(b) => b,
        None => return fail(AllocError::BucketOverflow(used)),
    };
    for bucket in first..EXACTBUCKETS_NR + VARBUCKETS_NR {
        let head = (*areah).freebuckets[bucket];
        if head == 0 {
            continue;
        }
        let size = tag_size(view.fetch(head));
        if size == used {
            let object = pop_bucket_head(view, areah, bucket);
            view.store(object, make_used_prev_used(used));
            return Ok(object);
        } else if size >= used + MIN_VARLENOBJ_SIZE {
            split_free(view, areah, used, bucket)?;
            return Ok(head);
        }
    }

    // nothing fits: grow the area, then retry with the fresh victim
    extend_area(view, areah, used)?;
    alloc_words(view, areah, words)
}

/// Add a sub-area able to hold at least `min_bytes`, doubling from the
/// previous sub-area size, and mark it up for variable-length use.
///
/// # Safety
///
/// `areah` must point to a variable-length area header embedded in the
/// segment behind `view`.
unsafe fn extend_area(
    view: SegView,
    areah: *mut AreaHeader,
    min_bytes: Word,
) -> Result<(), AllocError> {
    let last = (*areah).last_subarea_index as usize;
    if last + 1 >= SUBAREA_ARRAY_SIZE {
        return fail(AllocError::SubareaSlotsExhausted(min_bytes));
    }
    let prev_size = (*areah).subarea_array[last].size;
    // room for the alignment slack and both sentinels on top of the request
    let needed = min_bytes + SUBAREA_ALIGNMENT_BYTES + 2 * MIN_VARLENOBJ_SIZE;
    let mut new_size = prev_size * 2;
    while new_size < needed {
        new_size *= 2;
    }
    if init_subarea(view, areah, last + 1, new_size).is_err() {
        if prev_size < needed {
            return fail(AllocError::ExtendFailed(min_bytes));
        }
        init_subarea(view, areah, last + 1, prev_size)?;
    }
    init_subarea_freespace(view, areah, last + 1)
}

/// Free the object at `object`, merging with free neighbors and the
/// designated victim, and promoting a large enough merge to become the
/// new victim.
///
/// # Safety
///
/// `areah` must point to a variable-length area header embedded in the
/// segment behind `view`.
pub(crate) unsafe fn free_object(
    view: SegView,
    areah: *mut AreaHeader,
    mut object: Word,
) -> Result<(), FreeError> {
    let header = &*view.header_ptr();
    if header.magic != SEGMENT_MAGIC {
        return fail_free(FreeError::NotSegmentAddress);
    }
    if object < core::mem::size_of::<SegmentHeader>() as Word
        || object + MIN_VARLENOBJ_SIZE > header.size
        || object % WORD_SIZE != 0
    {
        return fail_free(FreeError::NotSegmentAddress);
    }
    let object_tag = view.fetch(object);
    if is_free(object_tag) {
        return fail_free(FreeError::DoubleFree);
    }
    if is_special_used(object_tag) {
        // sentinels and the designated victim are never freed
        return fail_free(FreeError::Corruption);
    }
    let mut size = tag_size(object_tag);
    if size < MIN_VARLENOBJ_SIZE {
        return fail_free(FreeError::SizeTooSmall);
    }
    if object + size > header.size {
        return fail_free(FreeError::Corruption);
    }

    // merge backward into a free predecessor, found through its footer
    if is_prev_free(object_tag) {
        let prev_size = tag_size(view.fetch(object - WORD_SIZE));
        if prev_size < MIN_VARLENOBJ_SIZE || prev_size > object {
            return fail_free(FreeError::Corruption);
        }
        let prev_object = object - prev_size;
        let prev_tag = view.fetch(prev_object);
        if !is_free(prev_tag) || tag_size(prev_tag) != prev_size {
            return fail_free(FreeError::Corruption);
        }
        unlink_free(view, areah, prev_object, prev_size)?;
        object = prev_object;
        size += prev_size;
    } else if (*areah).freebuckets[DVBUCKET] + (*areah).freebuckets[DVSIZEBUCKET] == object {
        // the victim ends exactly where this object starts: grow it over
        // the object and stay out of the buckets
        let dv = (*areah).freebuckets[DVBUCKET];
        size += (*areah).freebuckets[DVSIZEBUCKET];
        (*areah).freebuckets[DVSIZEBUCKET] = size;
        view.store(dv, make_special_used(size));
        view.store(dv + WORD_SIZE, SentinelMark::Victim.as_word());
        return Ok(());
    }

    // merge forward with a free successor, absorb a trailing victim, or
    // flag a used successor as following a free object
    let next_object = object + size;
    let next_tag = view.fetch(next_object);
    if is_free(next_tag) {
        unlink_free(view, areah, next_object, tag_size(next_tag))?;
        size += tag_size(next_tag);
    } else if is_special_used(next_tag) && next_object == (*areah).freebuckets[DVBUCKET] {
        size += (*areah).freebuckets[DVSIZEBUCKET];
        (*areah).freebuckets[DVBUCKET] = object;
        (*areah).freebuckets[DVSIZEBUCKET] = size;
        view.store(object, make_special_used(size));
        view.store(object + WORD_SIZE, SentinelMark::Victim.as_word());
        return Ok(());
    } else if is_normal_used(next_tag) {
        view.store(next_object, make_used_prev_free(next_tag));
    }
    // an end sentinel needs no action

    // a merge bigger than the current victim takes its place; the old
    // victim then goes to a bucket like any freed object
    if size > (*areah).freebuckets[DVSIZEBUCKET] {
        let dv = (*areah).freebuckets[DVBUCKET];
        let dv_size = (*areah).freebuckets[DVSIZEBUCKET];
        (*areah).freebuckets[DVBUCKET] = object;
        (*areah).freebuckets[DVSIZEBUCKET] = size;
        view.store(object, make_special_used(size));
        view.store(object + WORD_SIZE, SentinelMark::Victim.as_word());
        let after_new = view.fetch(object + size);
        if is_normal_used(after_new) {
            view.store(object + size, make_used_prev_used(after_new));
        }
        if dv == 0 {
            return Ok(());
        }
        let after_old = view.fetch(dv + dv_size);
        if is_normal_used(after_old) {
            view.store(dv + dv_size, make_used_prev_free(after_old));
        }
        object = dv;
        size = dv_size;
    }

    let bucket = match bucket_index(size) {
        Some(b) => b,
        None => return fail_free(FreeError::Corruption),
    };
    view.store(object, make_free(size));
    view.store(object + size - WORD_SIZE, make_free(size));
    push_bucket(view, areah, bucket, object);
    Ok(())
}
