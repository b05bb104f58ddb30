//! Segment consistency verification.
//!
//! Walks every sub-area of every area and checks the structural rules the
//! allocator maintains: sentinel placement, object tiling, boundary-tag
//! mirrors, no adjacent free objects, accurate prev-free flags, a single
//! designated victim matching its cache slots, and well-formed bucket
//! chains. Meant for tests and for debugging suspected corruption; a pass
//! over a large segment is not cheap.

use crate::error::CheckError;
use crate::layout::{
    is_free, is_prev_free, is_special_used, tag_size, SentinelMark, Word, DVBUCKET, DVSIZEBUCKET,
    EXACTBUCKETS_NR, MIN_VARLENOBJ_SIZE, VARBUCKETS_NR, WORD_SIZE,
};
use crate::segment::{FixedArea, Segment, VarArea};
use crate::var::bucket_index;

/// Verify every area of the segment. Returns the first violation found.
pub fn verify_segment(seg: &Segment) -> Result<(), CheckError> {
    for area in FixedArea::ALL {
        verify_fixed_area(seg, area)?;
    }
    for area in VarArea::ALL {
        verify_var_area(seg, area)?;
    }
    Ok(())
}

/// Every freelist entry must name a properly aligned slot inside one of
/// the area's sub-areas.
fn verify_fixed_area(seg: &Segment, area: FixedArea) -> Result<(), CheckError> {
    let view = seg.view();
    let areah = unsafe { &*seg.fixed_area_ptr(area) };
    let obj_length = areah.obj_length;
    let last = areah.last_subarea_index as usize;

    let slot_count: Word = (0..=last)
        .map(|i| areah.subarea_array[i].aligned_size / obj_length)
        .sum();

    let mut at = areah.freelist;
    let mut steps: Word = 0;
    while at != 0 {
        steps += 1;
        if steps > slot_count {
            return Err(CheckError::BrokenChain(at));
        }
        let inside = (0..=last).any(|i| {
            let sub = areah.subarea_array[i];
            at >= sub.aligned_offset
                && at + obj_length <= sub.aligned_offset + sub.aligned_size
                && (at - sub.aligned_offset) % obj_length == 0
        });
        if !inside {
            return Err(CheckError::FreelistEscape(at));
        }
        at = view.fetch(at);
    }
    Ok(())
}

fn verify_var_area(seg: &Segment, area: VarArea) -> Result<(), CheckError> {
    let view = seg.view();
    let areah = unsafe { &*seg.var_area_ptr(area) };
    let last = areah.last_subarea_index as usize;
    let dv = areah.freebuckets[DVBUCKET];
    let dv_size = areah.freebuckets[DVSIZEBUCKET];
    let mut victim_seen = false;

    for index in 0..=last {
        let sub = areah.subarea_array[index];
        let start = sub.aligned_offset;
        let end = start + sub.aligned_size;

        if seg.sentinel_mark(start) != Some(SentinelMark::SubareaStart)
            || tag_size(view.fetch(start)) != MIN_VARLENOBJ_SIZE
        {
            return Err(CheckError::BadSentinel(start));
        }
        let end_mark = end - MIN_VARLENOBJ_SIZE;
        if seg.sentinel_mark(end_mark) != Some(SentinelMark::SubareaEnd)
            || tag_size(view.fetch(end_mark)) != MIN_VARLENOBJ_SIZE
        {
            return Err(CheckError::BadSentinel(end_mark));
        }

        let mut at = start;
        let mut prev_free_at: Option<Word> = None;
        while at < end {
            let tag = view.fetch(at);
            let size = tag_size(tag);
            if size < MIN_VARLENOBJ_SIZE || at + size > end {
                return Err(CheckError::BrokenTiling(at));
            }
            if is_free(tag) {
                if let Some(prev) = prev_free_at {
                    return Err(CheckError::AdjacentFree(prev, at));
                }
                if view.fetch(at + size - WORD_SIZE) != tag {
                    return Err(CheckError::FooterMismatch(at));
                }
                prev_free_at = Some(at);
            } else if is_special_used(tag) {
                match SentinelMark::from_word(view.fetch(at + WORD_SIZE)) {
                    Some(SentinelMark::SubareaStart) if at == start => {}
                    Some(SentinelMark::SubareaEnd) if at == end_mark => {}
                    Some(SentinelMark::Victim) => {
                        if victim_seen {
                            return Err(CheckError::DuplicateVictim(at));
                        }
                        victim_seen = true;
                        if dv != at || dv_size != size {
                            return Err(CheckError::VictimSlotMismatch(at));
                        }
                    }
                    _ => return Err(CheckError::BadSentinel(at)),
                }
                prev_free_at = None;
            } else {
                if is_prev_free(tag) != prev_free_at.is_some() {
                    return Err(CheckError::PrevFlagWrong(at));
                }
                prev_free_at = None;
            }
            at += size;
        }
        if at != end {
            return Err(CheckError::BrokenTiling(at));
        }
    }

    if dv != 0 && !victim_seen {
        return Err(CheckError::VictimSlotMismatch(dv));
    }

    verify_buckets(seg, area)
}

/// Every chain member must be free, belong to the bucket it is chained
/// into, and be linked symmetrically; the head's back link names the
/// bucket slot itself.
fn verify_buckets(seg: &Segment, area: VarArea) -> Result<(), CheckError> {
    let view = seg.view();
    let areah_ptr = seg.var_area_ptr(area);
    let areah = unsafe { &*areah_ptr };
    let limit = seg.size() / MIN_VARLENOBJ_SIZE + 1;

    for bucket in 0..EXACTBUCKETS_NR + VARBUCKETS_NR {
        let slot_off =
            view.offset_of(unsafe { (*areah_ptr).freebuckets.as_ptr().add(bucket) });
        let mut back = slot_off;
        let mut at = areah.freebuckets[bucket];
        let mut steps: Word = 0;
        while at != 0 {
            steps += 1;
            if steps > limit {
                return Err(CheckError::BrokenChain(at));
            }
            let tag = view.fetch(at);
            if !is_free(tag) || bucket_index(tag_size(tag)) != Some(bucket) {
                return Err(CheckError::WrongBucket(at, bucket));
            }
            if view.fetch(at + 2 * WORD_SIZE) != back {
                return Err(CheckError::BrokenChain(at));
            }
            back = at;
            at = view.fetch(at + WORD_SIZE);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::make_free;
    use crate::region::HeapRegion;

    #[test]
    fn fresh_segment_verifies() {
        let mut region = HeapRegion::create(1 << 20).unwrap();
        assert_eq!(verify_segment(&region.segment()), Ok(()));
    }

    #[test]
    fn corrupted_footer_is_detected() {
        let mut region = HeapRegion::create(1 << 20).unwrap();
        let mut seg = region.segment();
        let a = seg.alloc_var(VarArea::DataRec, 10).unwrap();
        let _guard = seg.alloc_var(VarArea::DataRec, 10).unwrap();
        seg.free_var(VarArea::DataRec, a).unwrap();
        let size = seg.free_object_size(a).unwrap();
        seg.view().store(a + size - WORD_SIZE, make_free(size + 8));
        assert_eq!(
            verify_segment(&seg),
            Err(CheckError::FooterMismatch(a))
        );
    }

    #[test]
    fn stale_prev_flag_is_detected() {
        let mut region = HeapRegion::create(1 << 20).unwrap();
        let mut seg = region.segment();
        let a = seg.alloc_var(VarArea::DataRec, 10).unwrap();
        let b = seg.alloc_var(VarArea::DataRec, 10).unwrap();
        let _guard = seg.alloc_var(VarArea::DataRec, 10).unwrap();
        seg.free_var(VarArea::DataRec, a).unwrap();
        // claim b's predecessor is used even though a is free
        let tag = seg.view().fetch(b);
        seg.view().store(b, crate::layout::make_used_prev_used(tag));
        assert_eq!(verify_segment(&seg), Err(CheckError::PrevFlagWrong(b)));
    }
}
