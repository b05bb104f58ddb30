//! Fixed-length pool behavior driven through the public surface.

use anyhow::Result;
use stratadb::check::verify_segment;
use stratadb::{FixedArea, HeapRegion, INITIAL_SUBAREA_SIZE, WORD_SIZE};

const SEGMENT_SIZE: usize = 1 << 20;

#[test]
fn freed_slots_come_back_in_lifo_order() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    let a = seg.alloc_fixed(FixedArea::ListCell)?;
    let b = seg.alloc_fixed(FixedArea::ListCell)?;
    let c = seg.alloc_fixed(FixedArea::ListCell)?;
    assert!(a < b && b < c);

    seg.free_fixed(FixedArea::ListCell, b);
    assert_eq!(seg.alloc_fixed(FixedArea::ListCell)?, b);

    seg.free_fixed(FixedArea::ListCell, a);
    seg.free_fixed(FixedArea::ListCell, c);
    assert_eq!(seg.alloc_fixed(FixedArea::ListCell)?, c);
    assert_eq!(seg.alloc_fixed(FixedArea::ListCell)?, a);

    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn exhausting_the_freelist_doubles_the_subarea() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    let class = FixedArea::ListCell.class_size();
    let capacity = seg.header().listcell.subarea_array[0].aligned_size / class;
    for _ in 0..capacity {
        seg.alloc_fixed(FixedArea::ListCell)?;
    }
    assert_eq!(seg.header().listcell.last_subarea_index, 0);

    // the freelist is empty now; the next request grows the area
    let extra = seg.alloc_fixed(FixedArea::ListCell)?;
    assert_ne!(extra, 0);
    let header = seg.header();
    assert_eq!(header.listcell.last_subarea_index, 1);
    assert_eq!(
        header.listcell.subarea_array[1].size,
        2 * INITIAL_SUBAREA_SIZE
    );

    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn classes_allocate_independently() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    let w = seg.alloc_fixed(FixedArea::Word)?;
    let d = seg.alloc_fixed(FixedArea::DoubleWord)?;
    let t = seg.alloc_fixed(FixedArea::TreeNode)?;
    let i = seg.alloc_fixed(FixedArea::IndexHeader)?;
    let s = seg.alloc_fixed(FixedArea::ShortStr)?;

    // freeing one class leaves the others alone
    seg.free_fixed(FixedArea::Word, w);
    assert_eq!(seg.alloc_fixed(FixedArea::Word)?, w);
    assert_ne!(seg.alloc_fixed(FixedArea::DoubleWord)?, d);
    assert_ne!(seg.alloc_fixed(FixedArea::TreeNode)?, t);
    assert_ne!(seg.alloc_fixed(FixedArea::IndexHeader)?, i);
    assert_ne!(seg.alloc_fixed(FixedArea::ShortStr)?, s);

    verify_segment(&seg)?;
    Ok(())
}

#[test]
fn slots_are_word_aligned_and_class_spaced() -> Result<()> {
    let mut region = HeapRegion::create(SEGMENT_SIZE)?;
    let mut seg = region.segment();

    let first = seg.alloc_fixed(FixedArea::ShortStr)?;
    let second = seg.alloc_fixed(FixedArea::ShortStr)?;
    assert_eq!(first % WORD_SIZE, 0);
    assert_eq!(second - first, FixedArea::ShortStr.class_size());
    Ok(())
}
