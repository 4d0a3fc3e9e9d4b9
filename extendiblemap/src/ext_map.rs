//! Durable multimap from non-zero i32 keys to sets of non-zero i32 values.
//!
//! Extendible hashing: a directory of 2^globalDepth slots resolves the low
//! bits of a key's hash to a physical segment. An overfull segment splits in
//! O(segment capacity); when the splitting segment already owns globalDepth
//! bits, the directory doubles first. There is never a full rehash.

use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::byte_store::MMapFile;
use crate::error::{MapError, Result};
use crate::header::{
    Header, FILE_STATUS_OPENED, FILE_STATUS_PROPERLY_CLOSED, FORMAT_VERSION, MAGIC_WORD,
    STATIC_HEADER_SIZE,
};
use crate::probe::{self, hash, suffix_mask, SlotTable, NO_VALUE};
use crate::segment::{self, Segment, SegmentView};

/// 32K segments: the header region addresses (32K - 80) / 2 ~= 16K segments,
/// and each segment holds (32K - 16) / 8 ~= 4K slots, i.e. ~2K useful pairs
/// at load factor 0.5.
pub const DEFAULT_SEGMENT_SIZE: usize = 1 << 15;
pub const DEFAULT_SEGMENTS_PER_PAGE: usize = 32;
/// 1M storage page ~= 128K slots.
pub const DEFAULT_PAGE_SIZE: usize = DEFAULT_SEGMENT_SIZE * DEFAULT_SEGMENTS_PER_PAGE;

/// Snapshot of one segment's header, for diagnostics and structural checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentState {
    pub index: u32,
    pub hash_suffix: u32,
    pub suffix_depth: u8,
    pub alive_entries: u32,
}

/// Directory slots owned by a segment with the given suffix and depth, in a
/// directory of 2^global_depth slots: every index whose low `segment_depth`
/// bits equal the suffix. Live segments partition the directory through this.
pub fn slot_indexes_for_segment(suffix: u32, segment_depth: u8, global_depth: u8) -> Vec<u32> {
    debug_assert!(segment_depth <= global_depth);
    debug_assert_eq!(
        suffix & !suffix_mask(segment_depth),
        0,
        "suffix {suffix:#b} carries bits above its depth {segment_depth}"
    );
    let count = 1u32 << (global_depth - segment_depth);
    (0..count).map(|prefix| (prefix << segment_depth) | suffix).collect()
}

/// File-backed extendible hash multimap.
///
/// Thread-safe but not concurrent: one coarse lock guards every operation.
/// Callers that need parallelism shard across several maps/files.
///
/// Call [`close`](Self::close) before dropping: an unclosed map leaves the
/// file health flag in the "opened" state, which the next
/// [`was_properly_closed`](Self::was_properly_closed) reports as an unclean
/// shutdown.
pub struct ExtendibleHashMap {
    inner: Mutex<Inner>,
    was_properly_closed: bool,
}

impl ExtendibleHashMap {
    /// Opens (creating if absent) a map with the default segment/page sizes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, DEFAULT_SEGMENT_SIZE, DEFAULT_PAGE_SIZE)
    }

    /// Opens (creating if absent) a map with explicit sizes. `segment_size`
    /// must be a power of two larger than the static header, at most
    /// `page_size`, and dividing `page_size` evenly. An existing file must
    /// match the magic word, format version and segment size.
    pub fn open_with(path: impl AsRef<Path>, segment_size: usize, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        validate_sizes(segment_size, page_size)?;
        let storage = MMapFile::open(path, page_size)?;
        let header = Header::new(segment_size)?;
        let file_is_empty = storage.actual_file_size() == 0;

        let mut inner = Inner {
            storage,
            header,
            segment_size,
            dirty: true,
            segments: FxHashMap::default(),
        };
        let was_properly_closed = if file_is_empty {
            inner.init_empty_map()?;
            debug!(path = %path.display(), segment_size, "created new map file");
            true
        } else {
            let was_closed = inner.validate_existing()?;
            debug!(
                path = %path.display(),
                was_properly_closed = was_closed,
                "opened existing map file"
            );
            was_closed
        };
        // the file stays marked "opened" until the next flush/close
        inner
            .header
            .set_file_status(&mut inner.storage, FILE_STATUS_OPENED)?;

        Ok(Self {
            inner: Mutex::new(inner),
            was_properly_closed,
        })
    }

    /// Whether the file carried the properly-closed mark when this instance
    /// opened it. False after a crash or a drop without `close()`.
    /// A just-created map reports true.
    pub fn was_properly_closed(&self) -> bool {
        self.was_properly_closed
    }

    /// Inserts the pair. Returns false (and changes nothing) when the exact
    /// pair is already present.
    pub fn put(&self, key: i32, value: i32) -> Result<bool> {
        self.inner.lock().put(key, value)
    }

    /// Returns the first value under `key` accepted by `acceptor`.
    pub fn lookup<F: FnMut(i32) -> bool>(&self, key: i32, mut acceptor: F) -> Result<Option<i32>> {
        self.inner.lock().lookup(key, &mut acceptor)
    }

    /// Looks up an accepted value under `key`; when none is found, inserts
    /// `value_factory(key)` and returns it.
    pub fn lookup_or_insert<F, G>(&self, key: i32, mut acceptor: F, value_factory: G) -> Result<i32>
    where
        F: FnMut(i32) -> bool,
        G: FnOnce(i32) -> i32,
    {
        self.inner.lock().lookup_or_insert(key, &mut acceptor, value_factory)
    }

    /// True if the exact (key, value) pair is present.
    pub fn has(&self, key: i32, value: i32) -> Result<bool> {
        self.inner.lock().has(key, value)
    }

    /// True if any value is stored under `key`.
    pub fn contains_key(&self, key: i32) -> Result<bool> {
        Ok(self.inner.lock().lookup(key, &mut |_| true)?.is_some())
    }

    /// Removes the exact (key, value) pair.
    pub fn remove(&self, key: i32, value: i32) -> Result<bool> {
        self.inner.lock().remove(key, value)
    }

    /// Replaces (key, old_value) with (key, new_value). When new_value is
    /// already stored under the key, the old pair is just removed so values
    /// stay a set. Returns false if (key, old_value) was absent.
    pub fn replace(&self, key: i32, old_value: i32, new_value: i32) -> Result<bool> {
        self.inner.lock().replace(key, old_value, new_value)
    }

    /// Visits every (key, value) pair. The processor returning false stops
    /// the walk; the call then returns false.
    pub fn for_each<F: FnMut(i32, i32) -> bool>(&self, mut processor: F) -> Result<bool> {
        self.inner.lock().for_each(&mut processor)
    }

    /// Total alive pairs. O(#segments), one integer read per segment.
    pub fn size(&self) -> Result<usize> {
        self.inner.lock().size()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.inner.lock().is_empty()
    }

    /// Resets the map to the single-segment empty state. The file keeps its
    /// length. A no-op when the map is already empty and unsplit.
    pub fn clear(&self) -> Result<()> {
        self.inner.lock().clear()
    }

    /// When there are unflushed modifications: marks the file properly
    /// closed and flushes the mapping. Does nothing otherwise.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().flush()
    }

    /// True while modifications have not been flushed.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Flushes state, marks the file properly closed and unmaps it.
    /// Idempotent. Every operation after this fails with a closed error.
    pub fn close(&self) -> Result<()> {
        self.inner.lock().close()
    }

    /// Closes the map and deletes the backing file.
    pub fn close_and_clean(&self) -> Result<()> {
        self.inner.lock().close_and_clean()
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.lock().storage.is_open()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().storage.path().to_path_buf()
    }

    /// log2 of the current directory size.
    pub fn global_depth(&self) -> Result<u8> {
        let inner = self.inner.lock();
        inner.check_not_closed()?;
        inner.header.global_depth(&inner.storage)
    }

    /// Per-segment header snapshot, in physical order.
    pub fn segment_states(&self) -> Result<Vec<SegmentState>> {
        self.inner.lock().segment_states()
    }
}

impl fmt::Debug for ExtendibleHashMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ExtendibleHashMap")
            .field("path", &inner.storage.path())
            .field("open", &inner.storage.is_open())
            .field("dirty", &inner.dirty)
            .finish()
    }
}

struct Inner {
    storage: MMapFile,
    header: Header,
    segment_size: usize,
    dirty: bool,
    // arena of segment handles keyed by physical index, dropped wholesale
    // on clear() and close()
    segments: FxHashMap<u32, Segment>,
}

impl Inner {
    fn init_empty_map(&mut self) -> Result<()> {
        self.storage.ensure_mapped(2 * self.segment_size as u64)?;
        self.header.set_magic_word(&mut self.storage, MAGIC_WORD)?;
        self.header.set_format_version(&mut self.storage, FORMAT_VERSION)?;
        self.header.set_segment_size(&mut self.storage, self.segment_size as u32)?;
        self.header.set_segments_count(&mut self.storage, 0)?;
        self.header.set_global_depth(&mut self.storage, 0)?;
        let first = self.allocate_segment(0, 0)?;
        self.header.update_segment_index(&mut self.storage, 0, first.index())?;
        Ok(())
    }

    /// Validates the header of a non-empty file and reads the health flag.
    fn validate_existing(&mut self) -> Result<bool> {
        let magic = self.header.magic_word(&self.storage)?;
        if magic != MAGIC_WORD {
            return Err(MapError::Corrupted(format!(
                "magic word {magic:#010x} != expected {MAGIC_WORD:#010x}: \
                 not an extendible hash map file"
            )));
        }
        let version = self.header.format_version(&self.storage)?;
        if version != FORMAT_VERSION {
            return Err(MapError::Corrupted(format!(
                "format version {version} != supported {FORMAT_VERSION}"
            )));
        }
        let stored_segment_size = self.header.segment_size(&self.storage)?;
        if stored_segment_size != self.segment_size as u32 {
            return Err(MapError::Corrupted(format!(
                "segment size {stored_segment_size} != configured {}",
                self.segment_size
            )));
        }
        let depth = self.header.global_depth(&self.storage)?;
        if depth >= 32 {
            return Err(MapError::Corrupted(format!(
                "global depth {depth} is out of [0, 32)"
            )));
        }
        // a directory wider than the header region would alias segment 1
        let table_size = 1usize << depth;
        if table_size > self.header.max_segments_table_size() {
            return Err(MapError::Corrupted(format!(
                "global depth {depth} needs {table_size} directory slots, \
                 only {} fit the header region",
                self.header.max_segments_table_size()
            )));
        }
        let status = self.header.file_status(&self.storage)?;
        Ok(status == FILE_STATUS_PROPERLY_CLOSED)
    }

    fn check_not_closed(&self) -> Result<()> {
        if !self.storage.is_open() {
            return Err(MapError::Closed(format!(
                "map {} is closed",
                self.storage.path().display()
            )));
        }
        Ok(())
    }

    /// First mutation after open/flush: remember it and mark the file.
    fn mark_modified(&mut self) -> Result<()> {
        if !self.dirty {
            self.dirty = true;
            self.header.set_file_status(&mut self.storage, FILE_STATUS_OPENED)?;
        }
        Ok(())
    }

    fn segment_handle(&mut self, index: u32) -> Segment {
        let segment_size = self.segment_size;
        *self
            .segments
            .entry(index)
            .or_insert_with(|| Segment::new(index, segment_size))
    }

    fn segment_for_key(&mut self, key: i32) -> Result<Segment> {
        let index = self.header.segment_index_by_hash(&self.storage, hash(key))?;
        Ok(self.segment_handle(index))
    }

    /// Appends a fresh segment (physical index = count + 1, since index 0 is
    /// the header region), growing the file when needed.
    fn allocate_segment(&mut self, suffix: u32, depth: u8) -> Result<Segment> {
        let count = self.header.segments_count(&self.storage)?;
        let index = count + 1;
        let segment = Segment::new(index, self.segment_size);
        self.storage
            .ensure_mapped(segment.offset() + self.segment_size as u64)?;
        {
            let mut view = SegmentView::new(&mut self.storage, segment, self.segment_size)?;
            view.update_hash_suffix(suffix, depth)?;
        }
        self.header.set_segments_count(&mut self.storage, index)?;
        self.segments.insert(index, segment);
        Ok(segment)
    }

    fn put(&mut self, key: i32, value: i32) -> Result<bool> {
        self.check_not_closed()?;
        let segment = self.segment_for_key(key)?;
        self.put_and_split_if_needed(segment, key, value)
    }

    fn put_and_split_if_needed(&mut self, segment: Segment, key: i32, value: i32) -> Result<bool> {
        let (inserted, split_needed) = {
            let mut view = SegmentView::new(&mut self.storage, segment, self.segment_size)?;
            let inserted = probe::put(&mut view, key, value)?;
            (inserted, probe::needs_split(&view))
        };
        if inserted {
            self.mark_modified()?;
        }
        if split_needed {
            self.split_and_rearrange(segment)?;
        }
        Ok(inserted)
    }

    /// Splits an overfull segment, doubling the directory first when the
    /// segment already owns all globalDepth bits.
    fn split_and_rearrange(&mut self, old: Segment) -> Result<()> {
        let (old_suffix, old_depth) = {
            let view = SegmentView::new(&mut self.storage, old, self.segment_size)?;
            (view.hash_suffix(), view.hash_suffix_depth())
        };
        let mut global_depth = self.header.global_depth(&self.storage)?;
        if old_depth == global_depth {
            global_depth = self.header.double_segments_table(&mut self.storage)?;
            debug!(global_depth, "doubled segment directory");
        }
        debug_assert!(global_depth > old_depth);

        let new_depth = old_depth + 1;
        let new_suffix = old_suffix | (1u32 << old_depth);
        let new_segment = self.allocate_segment(new_suffix, new_depth)?;
        debug!(
            old_segment = old.index(),
            new_segment = new_segment.index(),
            new_depth,
            "splitting segment"
        );

        // deepen the old segment, then move every entry whose hash suffix no
        // longer matches it; moved entries leave tombstones behind
        let moved = {
            let mut view = SegmentView::new(&mut self.storage, old, self.segment_size)?;
            view.update_hash_suffix(old_suffix, new_depth)?;
            let mask = view.hash_suffix_mask();
            let mut moved = Vec::new();
            for slot in 0..view.entries_count() {
                let slot_key = view.entry_key(slot);
                if slot_key != NO_VALUE && hash(slot_key) & mask != old_suffix {
                    moved.push((slot_key, view.entry_value(slot)));
                    probe::mark_entry_as_deleted(&mut view, slot);
                }
            }
            moved
        };
        {
            let mut view = SegmentView::new(&mut self.storage, new_segment, self.segment_size)?;
            for (key, value) in moved {
                let inserted = probe::put(&mut view, key, value)?;
                debug_assert!(inserted, "pair moved by a split can't already be present");
            }
        }

        // redirect exactly the directory slots now owned by the new segment
        for slot in slot_indexes_for_segment(new_suffix, new_depth, global_depth) {
            let current = self.header.segment_index(&self.storage, slot as usize)?;
            debug_assert_eq!(
                current,
                old.index(),
                "directory slot {slot} must point at the segment being split"
            );
            self.header
                .update_segment_index(&mut self.storage, slot as usize, new_segment.index())?;
        }
        Ok(())
    }

    fn lookup<F: FnMut(i32) -> bool>(&mut self, key: i32, acceptor: &mut F) -> Result<Option<i32>> {
        self.check_not_closed()?;
        let segment = self.segment_for_key(key)?;
        let view = SegmentView::new(&mut self.storage, segment, self.segment_size)?;
        probe::lookup(&view, key, acceptor)
    }

    fn lookup_or_insert<F, G>(&mut self, key: i32, acceptor: &mut F, value_factory: G) -> Result<i32>
    where
        F: FnMut(i32) -> bool,
        G: FnOnce(i32) -> i32,
    {
        self.check_not_closed()?;
        let segment = self.segment_for_key(key)?;
        let found = {
            let view = SegmentView::new(&mut self.storage, segment, self.segment_size)?;
            probe::lookup(&view, key, acceptor)?
        };
        if let Some(value) = found {
            return Ok(value);
        }
        let new_value = value_factory(key);
        let inserted = self.put_and_split_if_needed(segment, key, new_value)?;
        debug_assert!(inserted, "freshly created value for key {key} must insert");
        Ok(new_value)
    }

    fn has(&mut self, key: i32, value: i32) -> Result<bool> {
        self.check_not_closed()?;
        let segment = self.segment_for_key(key)?;
        let view = SegmentView::new(&mut self.storage, segment, self.segment_size)?;
        probe::has(&view, key, value)
    }

    fn remove(&mut self, key: i32, value: i32) -> Result<bool> {
        self.check_not_closed()?;
        let segment = self.segment_for_key(key)?;
        let removed = {
            let mut view = SegmentView::new(&mut self.storage, segment, self.segment_size)?;
            probe::remove(&mut view, key, value)?
        };
        if removed {
            self.mark_modified()?;
        }
        Ok(removed)
    }

    fn replace(&mut self, key: i32, old_value: i32, new_value: i32) -> Result<bool> {
        self.check_not_closed()?;
        let segment = self.segment_for_key(key)?;
        let replaced = {
            let mut view = SegmentView::new(&mut self.storage, segment, self.segment_size)?;
            probe::replace(&mut view, key, old_value, new_value)?
        };
        if replaced {
            self.mark_modified()?;
        }
        Ok(replaced)
    }

    fn for_each<F: FnMut(i32, i32) -> bool>(&mut self, processor: &mut F) -> Result<bool> {
        self.check_not_closed()?;
        let count = self.header.segments_count(&self.storage)?;
        for index in 1..=count {
            // skip empty segments without building a view
            if segment::alive_entries_count(&self.storage, index, self.segment_size)? == 0 {
                continue;
            }
            let handle = self.segment_handle(index);
            let view = SegmentView::new(&mut self.storage, handle, self.segment_size)?;
            if !probe::for_each(&view, processor)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn size(&self) -> Result<usize> {
        self.check_not_closed()?;
        let count = self.header.segments_count(&self.storage)?;
        let mut total = 0usize;
        for index in 1..=count {
            total += segment::alive_entries_count(&self.storage, index, self.segment_size)? as usize;
        }
        Ok(total)
    }

    fn is_empty(&self) -> Result<bool> {
        self.check_not_closed()?;
        let count = self.header.segments_count(&self.storage)?;
        for index in 1..=count {
            if segment::alive_entries_count(&self.storage, index, self.segment_size)? > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn clear(&mut self) -> Result<()> {
        self.check_not_closed()?;
        let count = self.header.segments_count(&self.storage)?;
        if count == 1 && self.is_empty()? {
            return Ok(());
        }
        self.segments.clear();
        self.storage.zeroize_till_eof(self.segment_size as u64)?;
        self.init_empty_map()?;
        self.mark_modified()?;
        debug!(path = %self.storage.path().display(), "cleared map");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.check_not_closed()?;
        if self.dirty {
            self.header
                .set_file_status(&mut self.storage, FILE_STATUS_PROPERLY_CLOSED)?;
            self.storage.flush()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.storage.is_open() {
            return Ok(());
        }
        if self.dirty {
            self.header
                .set_file_status(&mut self.storage, FILE_STATUS_PROPERLY_CLOSED)?;
            self.dirty = false;
        }
        self.storage.close()?;
        self.segments.clear();
        Ok(())
    }

    fn close_and_clean(&mut self) -> Result<()> {
        self.close()?;
        self.storage.close_and_clean()
    }

    fn segment_states(&mut self) -> Result<Vec<SegmentState>> {
        self.check_not_closed()?;
        let count = self.header.segments_count(&self.storage)?;
        let mut states = Vec::with_capacity(count as usize);
        for index in 1..=count {
            let handle = self.segment_handle(index);
            let view = SegmentView::new(&mut self.storage, handle, self.segment_size)?;
            states.push(SegmentState {
                index,
                hash_suffix: view.hash_suffix(),
                suffix_depth: view.hash_suffix_depth(),
                alive_entries: view.alive_entries_count(),
            });
        }
        Ok(states)
    }
}

fn validate_sizes(segment_size: usize, page_size: usize) -> Result<()> {
    if !segment_size.is_power_of_two() {
        return Err(MapError::InvalidArgument(format!(
            "segment_size({segment_size}) must be a power of 2"
        )));
    }
    if segment_size <= STATIC_HEADER_SIZE {
        return Err(MapError::InvalidArgument(format!(
            "segment_size({segment_size}) must be > {STATIC_HEADER_SIZE} \
             to fit the header region"
        )));
    }
    if segment_size > page_size {
        return Err(MapError::InvalidArgument(format!(
            "segment_size({segment_size}) must be <= page_size({page_size})"
        )));
    }
    if page_size % segment_size != 0 {
        return Err(MapError::InvalidArgument(format!(
            "page_size({page_size}) must be a multiple of segment_size({segment_size})"
        )));
    }
    Ok(())
}
