//! Header region: the first segment of the file.
//!
//! ```text
//! offset  size  field
//!      0     4  magic word
//!      4     4  format version
//!      8     4  segment size (bytes)
//!     12     4  actual segments count
//!     16     1  global hash-suffix depth
//!     17     1  file health flag (1 = properly closed, 0 = opened)
//!  18..80        reserved
//!  80..          segment directory, one u16 physical segment index
//!                per hash suffix, 2^globalDepth entries used
//! ```

use crate::byte_store::MMapFile;
use crate::error::{MapError, Result};
use crate::probe::suffix_mask;

pub(crate) const MAGIC_WORD: u32 = u32::from_le_bytes(*b"EXHM");
pub(crate) const FORMAT_VERSION: u32 = 1;

const MAGIC_WORD_OFFSET: u64 = 0;
const FORMAT_VERSION_OFFSET: u64 = 4;
const SEGMENT_SIZE_OFFSET: u64 = 8;
const SEGMENTS_COUNT_OFFSET: u64 = 12;
const GLOBAL_DEPTH_OFFSET: u64 = 16;
const FILE_STATUS_OFFSET: u64 = 17;

/// Bytes before the segment directory starts.
pub(crate) const STATIC_HEADER_SIZE: usize = 80;
const SEGMENTS_TABLE_OFFSET: u64 = STATIC_HEADER_SIZE as u64;

pub(crate) const FILE_STATUS_PROPERLY_CLOSED: u8 = 1;
pub(crate) const FILE_STATUS_OPENED: u8 = 0;

/// Largest directory entry: physical segment indexes must fit in a u16
/// and index 0 is the header region itself.
const MAX_SEGMENT_INDEX: u32 = u16::MAX as u32;

/// Accessors for the header region. Holds only the region size; every
/// read/write borrows the storage for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    header_size: usize,
}

impl Header {
    pub fn new(header_size: usize) -> Result<Self> {
        if header_size <= STATIC_HEADER_SIZE {
            return Err(MapError::InvalidArgument(format!(
                "header_size({header_size}) must be > {STATIC_HEADER_SIZE}"
            )));
        }
        Ok(Self { header_size })
    }

    /// Max directory entries that fit in the header region.
    pub fn max_segments_table_size(&self) -> usize {
        (self.header_size - STATIC_HEADER_SIZE) / 2
    }

    pub fn magic_word(&self, store: &MMapFile) -> Result<u32> {
        store.read_u32(MAGIC_WORD_OFFSET)
    }

    pub fn set_magic_word(&self, store: &mut MMapFile, value: u32) -> Result<()> {
        write_u32(store, MAGIC_WORD_OFFSET, value)
    }

    pub fn format_version(&self, store: &MMapFile) -> Result<u32> {
        store.read_u32(FORMAT_VERSION_OFFSET)
    }

    pub fn set_format_version(&self, store: &mut MMapFile, value: u32) -> Result<()> {
        write_u32(store, FORMAT_VERSION_OFFSET, value)
    }

    pub fn segment_size(&self, store: &MMapFile) -> Result<u32> {
        store.read_u32(SEGMENT_SIZE_OFFSET)
    }

    pub fn set_segment_size(&self, store: &mut MMapFile, value: u32) -> Result<()> {
        write_u32(store, SEGMENT_SIZE_OFFSET, value)
    }

    /// Segments allocated so far, excluding the header region.
    pub fn segments_count(&self, store: &MMapFile) -> Result<u32> {
        store.read_u32(SEGMENTS_COUNT_OFFSET)
    }

    pub fn set_segments_count(&self, store: &mut MMapFile, value: u32) -> Result<()> {
        write_u32(store, SEGMENTS_COUNT_OFFSET, value)
    }

    pub fn global_depth(&self, store: &MMapFile) -> Result<u8> {
        read_u8(store, GLOBAL_DEPTH_OFFSET)
    }

    pub fn set_global_depth(&self, store: &mut MMapFile, depth: u8) -> Result<()> {
        if depth >= 32 {
            return Err(MapError::InvalidArgument(format!(
                "global depth({depth}) must be in [0, 32)"
            )));
        }
        write_u8(store, GLOBAL_DEPTH_OFFSET, depth)
    }

    pub fn file_status(&self, store: &MMapFile) -> Result<u8> {
        read_u8(store, FILE_STATUS_OFFSET)
    }

    pub fn set_file_status(&self, store: &mut MMapFile, status: u8) -> Result<()> {
        write_u8(store, FILE_STATUS_OFFSET, status)
    }

    /// Directory entries in use: 2^globalDepth.
    pub fn segments_table_size(&self, store: &MMapFile) -> Result<usize> {
        Ok(1usize << self.global_depth(store)?)
    }

    /// Resolves a hash to the physical index of the owning segment.
    pub fn segment_index_by_hash(&self, store: &MMapFile, hash: u32) -> Result<u32> {
        let depth = self.global_depth(store)?;
        let slot = (hash & suffix_mask(depth)) as usize;
        self.segment_index(store, slot)
    }

    /// Reads directory slot `slot`. Entries below 1 mean the directory
    /// points into the header region, which only a corrupted file can do.
    pub fn segment_index(&self, store: &MMapFile, slot: usize) -> Result<u32> {
        let bytes = store.slice(SEGMENTS_TABLE_OFFSET + (slot as u64) * 2, 2)?;
        let index = u16::from_ne_bytes([bytes[0], bytes[1]]) as u32;
        if index < 1 {
            return Err(MapError::Corrupted(format!(
                "directory slot {slot} holds segment index {index} (must be >= 1)"
            )));
        }
        Ok(index)
    }

    pub fn update_segment_index(
        &self,
        store: &mut MMapFile,
        slot: usize,
        segment_index: u32,
    ) -> Result<()> {
        if segment_index < 1 || segment_index > MAX_SEGMENT_INDEX {
            return Err(MapError::InvalidArgument(format!(
                "segment index({segment_index}) must be in [1, {MAX_SEGMENT_INDEX}]"
            )));
        }
        let bytes = store.slice_mut(SEGMENTS_TABLE_OFFSET + (slot as u64) * 2, 2)?;
        bytes.copy_from_slice(&(segment_index as u16).to_ne_bytes());
        Ok(())
    }

    /// Doubles the directory: the first half is copied verbatim into the
    /// second half and the global depth is incremented. Fails when the
    /// doubled table would no longer fit in the header region.
    pub fn double_segments_table(&self, store: &mut MMapFile) -> Result<u8> {
        let depth = self.global_depth(store)?;
        let old_size = 1usize << depth;
        let new_size = old_size * 2;
        if new_size > self.max_segments_table_size() {
            return Err(MapError::CapacityExceeded {
                requested: new_size,
                max: self.max_segments_table_size(),
            });
        }
        let bytes = store.slice_mut(SEGMENTS_TABLE_OFFSET, new_size * 2)?;
        let table: &mut [u16] = bytemuck::cast_slice_mut(bytes);
        table.copy_within(0..old_size, old_size);
        self.set_global_depth(store, depth + 1)?;
        Ok(depth + 1)
    }
}

fn write_u32(store: &mut MMapFile, offset: u64, value: u32) -> Result<()> {
    store.slice_mut(offset, 4)?.copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

fn read_u8(store: &MMapFile, offset: u64) -> Result<u8> {
    Ok(store.slice(offset, 1)?[0])
}

fn write_u8(store: &mut MMapFile, offset: u64, value: u8) -> Result<()> {
    store.slice_mut(offset, 1)?[0] = value;
    Ok(())
}
