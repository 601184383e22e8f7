//! End-to-end scenarios over real storage files.

use filespace::{FileStorage, StorageError, HEADER_SIZE, MIN_BLOCK_SIZE};
use std::io::Write;
use tempfile::tempdir;

#[test]
fn test_small_allocations_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("small.fsm");

    let mut storage = FileStorage::open(&path, true).unwrap();
    let mut spaces = Vec::new();
    for _ in 0..10 {
        let (space, accessor) = storage.allocate_space(100).unwrap();
        assert!(accessor.len() >= 100);
        accessor[..100].fill(0xAB);
        spaces.push(space);
    }

    spaces.sort_unstable();
    spaces.windows(2).for_each(|w| assert_ne!(w[0], w[1]));
    storage.close().unwrap();

    let mut storage = FileStorage::open(&path, false).unwrap();
    for &space in &spaces {
        let accessor = storage.access_space(space);
        assert!(accessor.len() >= 100);
        assert!(accessor[..100].iter().all(|&b| b == 0xAB));
    }
    storage.close().unwrap();
}

#[test]
fn test_large_allocation_is_block_aligned() {
    let dir = tempdir().unwrap();
    let mut storage = FileStorage::open(dir.path().join("large.fsm"), true).unwrap();

    let want = (1 << 20) + 1;
    let (space, accessor) = storage.allocate_space(want).unwrap();
    assert_eq!(space % MIN_BLOCK_SIZE as i64, 0);
    assert!(accessor.len() >= want);
    assert_eq!(accessor.len(), 1 << 21); // next power of two up

    storage.free_space(space);
    storage.close().unwrap();
}

#[test]
fn test_primary_space_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("primary.fsm");

    let mut storage = FileStorage::open(&path, true).unwrap();
    assert_eq!(storage.primary_space(), -1);

    let payload: Vec<u8> = (0..1000u32).flat_map(|n| n.to_be_bytes()).collect();
    let (space, accessor) = storage.allocate_space(payload.len()).unwrap();
    accessor[..payload.len()].copy_from_slice(&payload);
    storage.set_primary_space(space);
    storage.close().unwrap();

    let mut storage = FileStorage::open(&path, false).unwrap();
    let space = storage.primary_space();
    assert_ne!(space, -1);
    assert_eq!(&storage.access_space(space)[..payload.len()], &payload[..]);
    storage.free_space(space);
    storage.close().unwrap();
}

#[test]
fn test_bad_signature_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.fsm");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&vec![0x5A; 2 * HEADER_SIZE]).unwrap();
    drop(file);

    assert!(matches!(
        FileStorage::open(&path, false),
        Err(StorageError::BadFileSignature)
    ));
}

#[test]
fn test_mapping_shrinks_as_the_tail_frees() {
    let dir = tempdir().unwrap();
    let mut storage = FileStorage::open(dir.path().join("shrink.fsm"), true).unwrap();

    const MIB: usize = 1 << 20;
    let mut spaces = Vec::new();
    for _ in 0..8 {
        let (space, _) = storage.allocate_space(MIB).unwrap();
        spaces.push(space);
    }
    assert_eq!(storage.stats().used_size, 8 * MIB);
    assert_eq!(storage.stats().mapped_size, 8 * MIB);

    // Free from the top; the mapping halves whenever the used size drops
    // below half of it.
    for &space in spaces.iter().rev() {
        storage.free_space(space);
    }
    assert_eq!(storage.stats().used_size, 0);
    assert_eq!(storage.stats().mapped_size, 0);

    // Spot-check the halving threshold with a fresh tail.
    let mut spaces = Vec::new();
    for _ in 0..8 {
        let (space, _) = storage.allocate_space(MIB).unwrap();
        spaces.push(space);
    }
    storage.free_space(spaces[7]);
    storage.free_space(spaces[6]);
    storage.free_space(spaces[5]);
    assert_eq!(storage.stats().used_size, 5 * MIB);
    assert_eq!(storage.stats().mapped_size, 8 * MIB);
    storage.free_space(spaces[4]);
    storage.free_space(spaces[3]);
    assert_eq!(storage.stats().used_size, 3 * MIB);
    assert_eq!(storage.stats().mapped_size, 4 * MIB);

    for &space in spaces[..3].iter().rev() {
        storage.free_space(space);
    }
    storage.close().unwrap();
}

#[test]
fn test_zero_size_allocation_is_usable() {
    let dir = tempdir().unwrap();
    let mut storage = FileStorage::open(dir.path().join("zero.fsm"), true).unwrap();

    let (space, accessor) = storage.allocate_space(0).unwrap();
    assert_eq!(accessor.len(), 8);
    storage.free_space(space);
    storage.close().unwrap();
}

#[test]
fn test_chunk_threshold_routes_to_whole_blocks() {
    let dir = tempdir().unwrap();
    let mut storage = FileStorage::open(dir.path().join("threshold.fsm"), true).unwrap();

    // Just above the largest chunk payload: served as a whole aligned block.
    let (space, accessor) = storage.allocate_space(4043).unwrap();
    assert_eq!(space % MIN_BLOCK_SIZE as i64, 0);
    assert_eq!(accessor.len(), MIN_BLOCK_SIZE);

    // At the threshold: served as a chunk, offset inside a block.
    let (chunk_space, _) = storage.allocate_space(4042).unwrap();
    assert_ne!(chunk_space % MIN_BLOCK_SIZE as i64, 0);

    storage.free_space(space);
    storage.free_space(chunk_space);
    storage.close().unwrap();
}

#[test]
#[should_panic(expected = "invalid chunk")]
fn test_double_free_panics() {
    let dir = tempdir().unwrap();
    let mut storage = FileStorage::open(dir.path().join("double.fsm"), true).unwrap();

    let (space, _) = storage.allocate_space(100).unwrap();
    let _keeps_block_alive = storage.allocate_space(100).unwrap().0;
    storage.free_space(space);
    storage.free_space(space);
}

#[test]
#[should_panic(expected = "Block too large")]
fn test_oversized_request_panics() {
    let dir = tempdir().unwrap();
    let mut storage = FileStorage::open(dir.path().join("huge.fsm"), true).unwrap();
    let _ = storage.allocate_space(filespace::MAX_BLOCK_SIZE + 1);
}
