mod byte_store;
mod error;
mod ext_map;
mod header;
mod probe;
mod segment;

pub use error::{MapError, Result};
pub use ext_map::{
    slot_indexes_for_segment, ExtendibleHashMap, SegmentState, DEFAULT_PAGE_SIZE,
    DEFAULT_SEGMENT_SIZE, DEFAULT_SEGMENTS_PER_PAGE,
};
pub use probe::NO_VALUE;
