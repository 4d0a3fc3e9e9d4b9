use extendiblemap::{slot_indexes_for_segment, ExtendibleHashMap};
use tempfile::TempDir;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Extendible Hash Multimap Demo ===\n");

    let dir = TempDir::new()?;

    // Example 1: several values under one key
    demo_multimap_basics(&dir)?;

    // Example 2: segment splits and directory doubling
    demo_splits(&dir)?;

    // Example 3: durability and the file health flag
    demo_durability(&dir)?;

    println!("=== Demo Complete ===");
    Ok(())
}

fn demo_multimap_basics(dir: &TempDir) -> Result<(), Box<dyn std::error::Error>> {
    println!("1. Multimap basics:");
    let map = ExtendibleHashMap::open(dir.path().join("basics.map"))?;

    // a key maps to a set of values
    map.put(42, 100)?;
    map.put(42, 200)?;
    map.put(42, 300)?;
    let duplicate = map.put(42, 100)?;
    println!("   3 values under key 42, duplicate put returned {duplicate}");

    let mut values = Vec::new();
    map.lookup(42, |v| {
        values.push(v);
        false // keep scanning
    })?;
    values.sort_unstable();
    println!("   lookup collected {values:?}");

    let even = map.lookup(42, |v| v % 200 == 0)?;
    println!("   first value divisible by 200: {even:?}");

    map.remove(42, 200)?;
    map.replace(42, 300, 301)?;
    println!(
        "   after remove(42, 200) and replace(42, 300, 301): size = {}",
        map.size()?
    );
    assert!(map.has(42, 100)?);
    assert!(map.has(42, 301)?);
    assert!(!map.has(42, 200)?);

    map.close()?;
    println!();
    Ok(())
}

fn demo_splits(dir: &TempDir) -> Result<(), Box<dyn std::error::Error>> {
    println!("2. Segment splits (256-byte segments, ~15 pairs each):");
    let map = ExtendibleHashMap::open_with(dir.path().join("splits.map"), 256, 4096)?;

    for key in 1..=100 {
        map.put(key, key * 10)?;
    }
    println!("   inserted 100 pairs, size = {}", map.size()?);

    let global_depth = map.global_depth()?;
    println!("   global depth = {global_depth}, directory slots = {}", 1 << global_depth);
    for state in map.segment_states()? {
        let slots = slot_indexes_for_segment(state.hash_suffix, state.suffix_depth, global_depth);
        println!(
            "   segment {}: suffix {:0width$b} (depth {}), {} alive, owns {} directory slot(s)",
            state.index,
            state.hash_suffix,
            state.suffix_depth,
            state.alive_entries,
            slots.len(),
            width = state.suffix_depth as usize
        );
    }

    for key in 1..=100 {
        assert!(map.has(key, key * 10)?);
    }
    println!("   every pair still retrievable after the splits");

    map.close()?;
    println!();
    Ok(())
}

fn demo_durability(dir: &TempDir) -> Result<(), Box<dyn std::error::Error>> {
    println!("3. Durability and the health flag:");
    let path = dir.path().join("durable.map");

    {
        let map = ExtendibleHashMap::open(&path)?;
        map.put(1, 10)?;
        map.put(1, 20)?;
        map.close()?;
    }
    let map = ExtendibleHashMap::open(&path)?;
    println!(
        "   reopened after close: was_properly_closed = {}, has(1, 10) = {}",
        map.was_properly_closed(),
        map.has(1, 10)?
    );
    map.put(2, 30)?;
    drop(map); // no close(): the file keeps its "opened" mark

    let map = ExtendibleHashMap::open(&path)?;
    println!(
        "   reopened after a dropped instance: was_properly_closed = {}",
        map.was_properly_closed()
    );
    map.close_and_clean()?;
    println!("   close_and_clean removed {}", path.display());

    println!();
    Ok(())
}
