//! Variable-length pool behavior driven through the public surface.

use anyhow::Result;
use stratadb::check::verify_segment;
use stratadb::{
    bucket_index, AllocError, HeapRegion, Segment, SentinelMark, VarArea, EXACTBUCKETS_NR,
    MIN_VARLENOBJ_SIZE, VARBUCKETS_NR, WORD_SIZE,
};

const SEGMENT_SIZE: usize = 1 << 20;

/// Bucket heads with their sizes, for spotting merged blocks.
fn bucket_heads(seg: &Segment, area: VarArea) -> Vec<(u64, u64)> {
    (0..EXACTBUCKETS_NR + VARBUCKETS_NR)
        .filter_map(|bucket| {
            let head = seg.bucket_head(area, bucket)?;
            (head != 0).then(|| (head, seg.free_object_size(head).unwrap()))
        })
        .collect()
}

#[test]
fn allocations_walk_the_subarea_monotonically() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    let offsets: Vec<u64> = (0..4)
        .map(|_| seg.alloc_var(VarArea::DataRec, 10))
        .collect::<Result<_, _>>()?;
    assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(offsets.iter().all(|o| o % WORD_SIZE == 0));
    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn freeing_adjacent_objects_merges_them() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    let offsets: Vec<u64> = (0..4)
        .map(|_| seg.alloc_var(VarArea::DataRec, 10))
        .collect::<Result<_, _>>()?;

    seg.free_var(VarArea::DataRec, offsets[1])?;
    verify_segment(&seg)?;
    seg.free_var(VarArea::DataRec, offsets[2])?;
    verify_segment(&seg)?;

    // the two 80-byte objects coalesced into one block
    let merged = bucket_heads(&seg, VarArea::DataRec)
        .iter()
        .any(|&(_, size)| size >= 160);
    assert!(merged);
    Ok(())
}

#[test]
fn alloc_then_free_restores_the_victim() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    let victim_before = seg.victim(VarArea::DataRec);
    let heads_before = bucket_heads(&seg, VarArea::DataRec);

    let a = seg.alloc_var(VarArea::DataRec, 10)?;
    let b = seg.alloc_var(VarArea::DataRec, 12)?;
    seg.free_var(VarArea::DataRec, b)?;
    seg.free_var(VarArea::DataRec, a)?;

    assert_eq!(seg.victim(VarArea::DataRec), victim_before);
    assert_eq!(bucket_heads(&seg, VarArea::DataRec), heads_before);
    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn freeing_before_the_victim_absorbs_it() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    let (dv_before, size_before) = seg.victim(VarArea::DataRec);
    let a = seg.alloc_var(VarArea::DataRec, 10)?;
    assert_eq!(a, dv_before);

    let (dv_carved, size_carved) = seg.victim(VarArea::DataRec);
    assert_eq!(dv_carved, a + 80);
    assert_eq!(size_carved, size_before - 80);

    seg.free_var(VarArea::DataRec, a)?;
    let (dv_after, size_after) = seg.victim(VarArea::DataRec);
    assert_eq!(dv_after, a);
    assert_eq!(size_after, 80 + size_carved);
    assert_eq!(seg.sentinel_mark(dv_after), Some(SentinelMark::Victim));
    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn double_free_is_rejected_without_mutation() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    let o = seg.alloc_var(VarArea::DataRec, 5)?;
    let _guard = seg.alloc_var(VarArea::DataRec, 5)?;
    seg.free_var(VarArea::DataRec, o)?;

    let victim = seg.victim(VarArea::DataRec);
    let heads = bucket_heads(&seg, VarArea::DataRec);

    let err = seg.free_var(VarArea::DataRec, o).unwrap_err();
    assert_eq!(err.code(), -2);
    assert_eq!(seg.victim(VarArea::DataRec), victim);
    assert_eq!(bucket_heads(&seg, VarArea::DataRec), heads);
    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn large_requests_extend_the_area_and_refresh_the_victim() -> Result<()> {
    let mut region = HeapRegion::create(4 << 20)?;
    let mut seg = region.segment();

    // each request outgrows the ~8K victim of a fresh subarea
    for _ in 0..5 {
        let offset = seg.alloc_var(VarArea::DataRec, 1024)?;
        assert_ne!(offset, 0);
    }
    assert!(seg.header().datarec.last_subarea_index >= 1);

    let (dv, dv_size) = seg.victim(VarArea::DataRec);
    assert_ne!(dv, 0);
    assert!(dv_size >= MIN_VARLENOBJ_SIZE);
    assert_eq!(seg.sentinel_mark(dv), Some(SentinelMark::Victim));
    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn log_bucket_blocks_are_found_and_split() -> Result<()> {
    let mut region = HeapRegion::create(4 << 20)?;
    let mut seg = region.segment();

    // requests of 1024 words route through the log-scale bank
    let request_bytes = (EXACTBUCKETS_NR * 4) as u64 * WORD_SIZE;
    assert!(bucket_index(request_bytes).unwrap() >= EXACTBUCKETS_NR);

    // force an extension; the first subarea's victim lands in a log bucket
    let (dv0, dv0_size) = seg.victim(VarArea::DataRec);
    let big = seg.alloc_var(VarArea::DataRec, 1500)?;
    assert!(big > dv0 + dv0_size);

    let bucket = bucket_index(dv0_size).unwrap();
    assert!(bucket >= EXACTBUCKETS_NR);
    assert_eq!(seg.bucket_head(VarArea::DataRec, bucket), Some(dv0));

    // a request below that block's size is served by splitting it
    let o = seg.alloc_var(VarArea::DataRec, 1000)?;
    assert_eq!(o, dv0);
    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn zero_and_oversized_requests_are_rejected() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    assert_eq!(
        seg.alloc_var(VarArea::DataRec, 0),
        Err(AllocError::EmptyRequest)
    );
    let beyond_last_bucket = ((EXACTBUCKETS_NR as u64) << VARBUCKETS_NR) / WORD_SIZE;
    assert!(matches!(
        seg.alloc_var(VarArea::DataRec, beyond_last_bucket),
        Err(AllocError::BucketOverflow(_))
    ));
    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn pools_do_not_share_free_space() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    let datarec_victim = seg.victim(VarArea::DataRec);
    let s = seg.alloc_var(VarArea::LongStr, 20)?;
    assert_eq!(seg.victim(VarArea::DataRec), datarec_victim);
    seg.free_var(VarArea::LongStr, s)?;
    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn randomized_alloc_free_soak() -> Result<()> {
    use xorshift::{Rng, SeedableRng};
    let mut rng =
        xorshift::Xoroshiro128::from_seed(&[0x9e3779b97f4a7c15u64, 0x6a09e667f3bcc909, 3, 4]);

    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();
    let mut live: Vec<u64> = Vec::new();

    for round in 0..2000u32 {
        let free_next = !live.is_empty() && (live.len() > 64 || rng.gen_range(0u32, 3) == 0);
        if free_next {
            let idx = rng.gen_range(0, live.len() as u64) as usize;
            let offset = live.swap_remove(idx);
            seg.free_var(VarArea::DataRec, offset)?;
        } else {
            let words = rng.gen_range(1u64, 200);
            live.push(seg.alloc_var(VarArea::DataRec, words)?);
        }
        if round % 256 == 0 {
            verify_segment(&seg)?;
        }
    }
    for offset in live.drain(..) {
        seg.free_var(VarArea::DataRec, offset)?;
    }
    verify_segment(&seg)?;
    Ok(())
}
