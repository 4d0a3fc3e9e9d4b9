//! Data segment layout.
//!
//! ```text
//! offset  size  field
//!      0     4  alive entries count
//!      4     4  hash suffix
//!      8     1  hash suffix depth
//!   9..16        reserved
//!  16..          slot array of (key: i32, value: i32) pairs
//! ```
//!
//! A segment sits at file offset `index * segment_size` (index >= 1; index 0
//! is the header region).

use bytemuck::{Pod, Zeroable};

use crate::byte_store::MMapFile;
use crate::error::{MapError, Result};
use crate::probe::{suffix_mask, SlotTable};

const ALIVE_COUNT_OFFSET: usize = 0;
const HASH_SUFFIX_OFFSET: usize = 4;
const SUFFIX_DEPTH_OFFSET: usize = 8;

/// Bytes before the slot array starts.
pub(crate) const SEGMENT_HEADER_SIZE: usize = 16;

/// One open-addressing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct Slot {
    pub key: i32,
    pub value: i32,
}

pub(crate) const SLOT_SIZE: usize = std::mem::size_of::<Slot>();

/// Slots that fit into one segment of the given size.
pub(crate) fn entries_per_segment(segment_size: usize) -> usize {
    (segment_size - SEGMENT_HEADER_SIZE) / SLOT_SIZE
}

/// Reads a segment's alive count with a single integer read, without
/// constructing a view. `size()`, `is_empty()` and the empty-segment skip
/// in `for_each` stay cheap through this.
pub(crate) fn alive_entries_count(
    store: &MMapFile,
    index: u32,
    segment_size: usize,
) -> Result<u32> {
    store.read_u32(index as u64 * segment_size as u64 + ALIVE_COUNT_OFFSET as u64)
}

/// Arena handle for a physical segment: just its index and byte offset.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment {
    index: u32,
    offset: u64,
}

impl Segment {
    pub fn new(index: u32, segment_size: usize) -> Self {
        debug_assert!(index >= 1, "segment index 0 is the header region");
        Self {
            index,
            offset: index as u64 * segment_size as u64,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Borrowed view over one segment's bytes. Lives only for the duration of
/// a single operation; nothing caches it across storage growth.
pub(crate) struct SegmentView<'a> {
    buf: &'a mut [u8],
    index: u32,
}

impl<'a> SegmentView<'a> {
    pub fn new(store: &'a mut MMapFile, segment: Segment, segment_size: usize) -> Result<Self> {
        let buf = store.slice_mut(segment.offset(), segment_size)?;
        Ok(Self {
            buf,
            index: segment.index(),
        })
    }

    pub fn hash_suffix(&self) -> u32 {
        self.read_u32_at(HASH_SUFFIX_OFFSET)
    }

    pub fn hash_suffix_depth(&self) -> u8 {
        self.buf[SUFFIX_DEPTH_OFFSET]
    }

    pub fn hash_suffix_mask(&self) -> u32 {
        suffix_mask(self.hash_suffix_depth())
    }

    /// Re-tags the segment with the hash suffix it owns and that suffix's
    /// depth. The suffix may not have bits set above the depth.
    pub fn update_hash_suffix(&mut self, suffix: u32, depth: u8) -> Result<()> {
        if depth >= 32 {
            return Err(MapError::InvalidArgument(format!(
                "suffix depth({depth}) must be in [0, 32)"
            )));
        }
        if suffix & !suffix_mask(depth) != 0 {
            return Err(MapError::InvalidArgument(format!(
                "hash suffix({suffix:#b}) has bits set above depth({depth})"
            )));
        }
        self.write_u32_at(HASH_SUFFIX_OFFSET, suffix);
        self.buf[SUFFIX_DEPTH_OFFSET] = depth;
        Ok(())
    }

    fn slots(&self) -> &[Slot] {
        let end = SEGMENT_HEADER_SIZE + entries_per_segment(self.buf.len()) * SLOT_SIZE;
        bytemuck::cast_slice(&self.buf[SEGMENT_HEADER_SIZE..end])
    }

    fn slots_mut(&mut self) -> &mut [Slot] {
        let end = SEGMENT_HEADER_SIZE + entries_per_segment(self.buf.len()) * SLOT_SIZE;
        bytemuck::cast_slice_mut(&mut self.buf[SEGMENT_HEADER_SIZE..end])
    }

    fn read_u32_at(&self, offset: usize) -> u32 {
        let b = &self.buf[offset..offset + 4];
        u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }

    fn write_u32_at(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }
}

impl SlotTable for SegmentView<'_> {
    fn table_index(&self) -> u32 {
        self.index
    }

    fn entries_count(&self) -> usize {
        entries_per_segment(self.buf.len())
    }

    fn alive_entries_count(&self) -> u32 {
        self.read_u32_at(ALIVE_COUNT_OFFSET)
    }

    fn set_alive_entries_count(&mut self, count: u32) {
        self.write_u32_at(ALIVE_COUNT_OFFSET, count);
    }

    fn entry_key(&self, slot: usize) -> i32 {
        self.slots()[slot].key
    }

    fn entry_value(&self, slot: usize) -> i32 {
        self.slots()[slot].value
    }

    fn update_entry(&mut self, slot: usize, key: i32, value: i32) {
        self.slots_mut()[slot] = Slot { key, value };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe;
    use tempfile::tempdir;

    const SEGMENT_SIZE: usize = 128;

    fn open_store() -> (tempfile::TempDir, MMapFile) {
        let dir = tempdir().unwrap();
        let mut store = MMapFile::open(&dir.path().join("map.bin"), 4096).unwrap();
        store.ensure_mapped(4 * SEGMENT_SIZE as u64).unwrap();
        (dir, store)
    }

    #[test]
    fn test_capacity_formula() {
        assert_eq!(entries_per_segment(128), 14);
        assert_eq!(entries_per_segment(1 << 15), 4094);
    }

    #[test]
    fn test_segment_offsets() {
        let segment = Segment::new(3, 128);
        assert_eq!(segment.index(), 3);
        assert_eq!(segment.offset(), 384);
    }

    #[test]
    fn test_header_fields_round_trip() {
        let (_dir, mut store) = open_store();
        let segment = Segment::new(1, SEGMENT_SIZE);
        let mut view = SegmentView::new(&mut store, segment, SEGMENT_SIZE).unwrap();

        view.update_hash_suffix(0b101, 3).unwrap();
        view.set_alive_entries_count(7);

        assert_eq!(view.hash_suffix(), 0b101);
        assert_eq!(view.hash_suffix_depth(), 3);
        assert_eq!(view.hash_suffix_mask(), 0b111);
        assert_eq!(view.alive_entries_count(), 7);
        assert_eq!(view.entries_count(), 14);
    }

    #[test]
    fn test_update_hash_suffix_validation() {
        let (_dir, mut store) = open_store();
        let segment = Segment::new(1, SEGMENT_SIZE);
        let mut view = SegmentView::new(&mut store, segment, SEGMENT_SIZE).unwrap();

        assert!(matches!(
            view.update_hash_suffix(0, 32),
            Err(MapError::InvalidArgument(_))
        ));
        // suffix 0b100 needs at least 3 bits of depth
        assert!(matches!(
            view.update_hash_suffix(0b100, 2),
            Err(MapError::InvalidArgument(_))
        ));
        assert!(view.update_hash_suffix(0b100, 3).is_ok());
    }

    #[test]
    fn test_static_alive_count_matches_view() {
        let (_dir, mut store) = open_store();
        let segment = Segment::new(2, SEGMENT_SIZE);
        {
            let mut view = SegmentView::new(&mut store, segment, SEGMENT_SIZE).unwrap();
            probe::put(&mut view, 10, 100).unwrap();
            probe::put(&mut view, 11, 110).unwrap();
        }
        assert_eq!(alive_entries_count(&store, 2, SEGMENT_SIZE).unwrap(), 2);
        assert_eq!(alive_entries_count(&store, 1, SEGMENT_SIZE).unwrap(), 0);
    }

    #[test]
    fn test_entries_live_in_the_slot_region() {
        let (_dir, mut store) = open_store();
        let segment = Segment::new(1, SEGMENT_SIZE);
        let mut view = SegmentView::new(&mut store, segment, SEGMENT_SIZE).unwrap();

        view.update_entry(0, 5, 50);
        view.update_entry(13, -1, -2);
        assert_eq!(view.entry_key(0), 5);
        assert_eq!(view.entry_value(0), 50);
        assert_eq!(view.entry_key(13), -1);
        assert_eq!(view.entry_value(13), -2);
        // segment header untouched by slot writes
        assert_eq!(view.alive_entries_count(), 0);
        assert_eq!(view.hash_suffix(), 0);
    }
}
