use std::io;
use thiserror::Error;

/// Errors that can occur when working with an extendible hash map
#[derive(Error, Debug)]
pub enum MapError {
    /// IO errors when creating, growing or flushing the backing file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid caller input: zero key/value, bad sizes, out-of-range depths
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted on a map whose storage was already closed
    #[error("Storage is already closed: {0}")]
    Closed(String),

    /// On-disk data does not match the expected format
    #[error("Corrupted storage: {0}")]
    Corrupted(String),

    /// Segment directory can't grow any further within the header region
    #[error(
        "Segments table capacity exceeded: doubled size {requested} > max {max} \
         (try a larger segment size)"
    )]
    CapacityExceeded { requested: usize, max: usize },

    /// Probe run exhausted a segment that still reports alive entries.
    /// Either a logic defect or external corruption; not recoverable.
    #[error("Segment {segment} overflowed: no free slot in a full probe run")]
    SegmentOverflow { segment: u32 },
}

pub type Result<T> = std::result::Result<T, MapError>;
