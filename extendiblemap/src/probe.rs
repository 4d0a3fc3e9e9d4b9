//! Linear-probing algorithm over a fixed-size slot table.
//!
//! Slot conventions (a slot is a `(key, value)` pair of i32):
//! - `(NO_VALUE, NO_VALUE)`: free slot, terminates a probe run;
//! - `(NO_VALUE, value != NO_VALUE)`: tombstone, probing continues;
//! - `(key != NO_VALUE, value != NO_VALUE)`: occupied.
//!
//! The logic here is stateless and knows nothing about files or segments;
//! it runs over anything implementing [`SlotTable`].

use crate::error::{MapError, Result};

/// Reserved sentinel: a 0 key or value can never be stored.
pub const NO_VALUE: i32 = 0;

/// A segment splits once it is more than half full.
pub(crate) const LOAD_FACTOR: f32 = 0.5;

/// Fibonacci scrambling of the key; low bits select the directory slot,
/// the whole hash positions the probe inside a segment.
pub(crate) fn hash(key: i32) -> u32 {
    let h = (key as u32).wrapping_mul(0x9E37_79B9);
    h ^ (h >> 16)
}

/// Mask keeping the lowest `depth` bits of a hash.
pub(crate) fn suffix_mask(depth: u8) -> u32 {
    if depth >= 32 {
        u32::MAX
    } else {
        (1u32 << depth) - 1
    }
}

/// Fixed-capacity table of (key, value) slots with an alive-entries count.
pub(crate) trait SlotTable {
    /// Physical index, for error reporting only.
    fn table_index(&self) -> u32;
    fn entries_count(&self) -> usize;
    fn alive_entries_count(&self) -> u32;
    fn set_alive_entries_count(&mut self, count: u32);
    fn entry_key(&self, slot: usize) -> i32;
    fn entry_value(&self, slot: usize) -> i32;
    fn update_entry(&mut self, slot: usize, key: i32, value: i32);
}

/// Probes for `key` and returns the first value the acceptor takes.
pub(crate) fn lookup<T, F>(table: &T, key: i32, acceptor: &mut F) -> Result<Option<i32>>
where
    T: SlotTable,
    F: FnMut(i32) -> bool,
{
    check_not_no_value("key", key)?;
    let capacity = table.entries_count();
    let start = hash(key) as usize % capacity;
    for probe in 0..capacity {
        let slot = (start + probe) % capacity;
        let slot_key = table.entry_key(slot);
        let slot_value = table.entry_value(slot);
        if slot_key == key {
            debug_assert_ne!(slot_value, NO_VALUE, "occupied slot {slot} with NO_VALUE value");
            if acceptor(slot_value) {
                return Ok(Some(slot_value));
            }
        } else if slot_key == NO_VALUE && slot_value == NO_VALUE {
            break;
        }
    }
    Ok(None)
}

/// True if the exact (key, value) pair is present.
pub(crate) fn has<T: SlotTable>(table: &T, key: i32, value: i32) -> Result<bool> {
    check_not_no_value("key", key)?;
    check_not_no_value("value", value)?;
    let capacity = table.entries_count();
    let start = hash(key) as usize % capacity;
    for probe in 0..capacity {
        let slot = (start + probe) % capacity;
        let slot_key = table.entry_key(slot);
        let slot_value = table.entry_value(slot);
        if slot_key == key && slot_value == value {
            return Ok(true);
        }
        if slot_key == NO_VALUE && slot_value == NO_VALUE {
            break;
        }
    }
    Ok(false)
}

/// Inserts the pair unless it is already present. Returns true if the table
/// changed. The first tombstone of the probe run is reused when the run ends
/// at a free slot or exhausts the table.
pub(crate) fn put<T: SlotTable>(table: &mut T, key: i32, value: i32) -> Result<bool> {
    check_not_no_value("key", key)?;
    check_not_no_value("value", value)?;
    put_checked(table, key, value, true)
}

fn put_checked<T: SlotTable>(
    table: &mut T,
    key: i32,
    value: i32,
    wipe_retry: bool,
) -> Result<bool> {
    let capacity = table.entries_count();
    let start = hash(key) as usize % capacity;
    let mut first_tombstone: Option<usize> = None;
    for probe in 0..capacity {
        let slot = (start + probe) % capacity;
        let slot_key = table.entry_key(slot);
        let slot_value = table.entry_value(slot);
        if slot_key == key && slot_value == value {
            return Ok(false);
        }
        if slot_key == NO_VALUE {
            if slot_value != NO_VALUE {
                // tombstone: remember the first one, keep probing
                if first_tombstone.is_none() {
                    first_tombstone = Some(slot);
                }
            } else {
                // free slot ends the run; the pair is definitely absent
                let insert_at = first_tombstone.unwrap_or(slot);
                table.update_entry(insert_at, key, value);
                bump_alive(table, 1);
                return Ok(true);
            }
        }
    }
    // the whole table was probed without hitting a free slot
    if table.alive_entries_count() == 0 && wipe_retry {
        // nothing but tombstones left: reclaim them all and insert afresh
        for slot in 0..capacity {
            table.update_entry(slot, NO_VALUE, NO_VALUE);
        }
        return put_checked(table, key, value, false);
    }
    if let Some(slot) = first_tombstone {
        table.update_entry(slot, key, value);
        bump_alive(table, 1);
        return Ok(true);
    }
    // splits must fire well before a segment fills up
    Err(MapError::SegmentOverflow {
        segment: table.table_index(),
    })
}

/// Removes the exact (key, value) pair, leaving a tombstone.
pub(crate) fn remove<T: SlotTable>(table: &mut T, key: i32, value: i32) -> Result<bool> {
    check_not_no_value("key", key)?;
    check_not_no_value("value", value)?;
    let capacity = table.entries_count();
    let start = hash(key) as usize % capacity;
    for probe in 0..capacity {
        let slot = (start + probe) % capacity;
        let slot_key = table.entry_key(slot);
        let slot_value = table.entry_value(slot);
        if slot_key == key && slot_value == value {
            // only one copy of the pair can exist
            mark_entry_as_deleted(table, slot);
            return Ok(true);
        }
        if slot_key == NO_VALUE && slot_value == NO_VALUE {
            break;
        }
    }
    Ok(false)
}

/// Replaces (key, oldValue) with (key, newValue), keeping the values of a
/// key a set: when newValue is already present the old slot is tombstoned
/// instead of rewritten. The whole probe run is scanned before deciding.
pub(crate) fn replace<T: SlotTable>(
    table: &mut T,
    key: i32,
    old_value: i32,
    new_value: i32,
) -> Result<bool> {
    check_not_no_value("key", key)?;
    check_not_no_value("oldValue", old_value)?;
    check_not_no_value("newValue", new_value)?;
    let capacity = table.entries_count();
    let start = hash(key) as usize % capacity;
    let mut old_value_slot: Option<usize> = None;
    let mut new_value_exists = false;
    for probe in 0..capacity {
        let slot = (start + probe) % capacity;
        let slot_key = table.entry_key(slot);
        let slot_value = table.entry_value(slot);
        if slot_key == key {
            if slot_value == old_value {
                old_value_slot = Some(slot);
            } else if slot_value == new_value {
                new_value_exists = true;
            }
        }
        if slot_key == NO_VALUE && slot_value == NO_VALUE {
            break;
        }
    }
    match old_value_slot {
        Some(slot) => {
            if new_value_exists {
                mark_entry_as_deleted(table, slot);
            } else {
                table.update_entry(slot, key, new_value);
            }
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Visits occupied slots in physical order; a processor returning false
/// stops the walk early and makes the whole call return false.
pub(crate) fn for_each<T, F>(table: &T, processor: &mut F) -> Result<bool>
where
    T: SlotTable,
    F: FnMut(i32, i32) -> bool,
{
    let capacity = table.entries_count();
    for slot in 0..capacity {
        let key = table.entry_key(slot);
        if key != NO_VALUE {
            let value = table.entry_value(slot);
            debug_assert_ne!(value, NO_VALUE, "occupied slot {slot} with NO_VALUE value");
            if !processor(key, value) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

pub(crate) fn needs_split<T: SlotTable>(table: &T) -> bool {
    table.alive_entries_count() as f32 > table.entries_count() as f32 * LOAD_FACTOR
}

/// Tombstones the slot: key reset, value kept as the deletion marker.
pub(crate) fn mark_entry_as_deleted<T: SlotTable>(table: &mut T, slot: usize) {
    let value = table.entry_value(slot);
    debug_assert_ne!(value, NO_VALUE, "deleting slot {slot} that is not occupied");
    table.update_entry(slot, NO_VALUE, value);
    bump_alive(table, -1);
}

fn bump_alive<T: SlotTable>(table: &mut T, delta: i64) {
    let alive = table.alive_entries_count() as i64 + delta;
    debug_assert!(alive >= 0, "alive entries count dropped below 0");
    table.set_alive_entries_count(alive as u32);
}

fn check_not_no_value(param: &str, value: i32) -> Result<()> {
    if value == NO_VALUE {
        return Err(MapError::InvalidArgument(format!(
            "{param} can't be {NO_VALUE}: it is reserved as NO_VALUE"
        )));
    }
    Ok(())
}
