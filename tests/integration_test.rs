use anyhow::Result;
use quartzdb::access::btree::iterator::BTreeScan;
use quartzdb::access::btree::key::KeyType;
use quartzdb::access::{BTreeIndex, HeapFile, HeapScan, Rid};
use quartzdb::storage::buffer::lru::LruReplacer;
use quartzdb::storage::{
    BufferPoolManager, DiskManager, PageId, StorageError, INVALID_PAGE_NO,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const KEY_LEN: usize = 800; // int keys this wide give a tree order of 4

fn setup(dir: &Path, pool_size: usize) -> (Arc<DiskManager>, Arc<BufferPoolManager>) {
    let disk = Arc::new(DiskManager::new(dir.join("db.log")));
    let pool = Arc::new(BufferPoolManager::new(
        pool_size,
        Arc::clone(&disk),
        Box::new(LruReplacer::new(pool_size)),
    ));
    (disk, pool)
}

fn int_key(value: i32) -> Vec<u8> {
    let mut key = vec![0u8; KEY_LEN];
    key[..4].copy_from_slice(&value.to_le_bytes());
    key
}

#[test]
fn heap_round_trip_with_slot_reuse() -> Result<()> {
    let dir = tempdir()?;
    let (disk, pool) = setup(dir.path(), 8);
    let path = dir.path().join("t.db");

    // 1000-byte records: four slots per page
    HeapFile::create(&disk, &path, 1000)?;
    let heap = HeapFile::open(Arc::clone(&disk), pool, &path)?;

    let a = heap.insert_record(&[b'A'; 1000])?;
    let b = heap.insert_record(&[b'B'; 1000])?;
    let c = heap.insert_record(&[b'C'; 1000])?;
    assert_eq!((a, b, c), (Rid::new(1, 0), Rid::new(1, 1), Rid::new(1, 2)));

    heap.delete_record(b)?;
    let d = heap.insert_record(&[b'D'; 1000])?;
    assert_eq!(d, Rid::new(1, 1)); // freed slot is reused

    let mut scan = HeapScan::new(&heap)?;
    let mut seen = Vec::new();
    while !scan.is_end() {
        seen.push(heap.get_record(scan.rid())?.data[0]);
        scan.next()?;
    }
    assert_eq!(seen, vec![b'A', b'D', b'C']);

    heap.close()?;
    Ok(())
}

#[test]
fn heap_free_list_promotion() -> Result<()> {
    let dir = tempdir()?;
    let (disk, pool) = setup(dir.path(), 8);
    let path = dir.path().join("t.db");

    HeapFile::create(&disk, &path, 1000)?;
    let heap = HeapFile::open(Arc::clone(&disk), pool, &path)?;
    assert_eq!(heap.header().num_records_per_page, 4);

    // filling page 1 removes it from the free list
    for i in 0..4u8 {
        heap.insert_record(&[i; 1000])?;
    }
    assert_eq!(heap.header().first_free_page_no, INVALID_PAGE_NO);

    // the fifth record allocates page 2, which heads the list
    assert_eq!(heap.insert_record(&[4u8; 1000])?, Rid::new(2, 0));
    assert_eq!(heap.header().first_free_page_no, 2);

    // deleting from the full page prepends it: 1 -> 2
    heap.delete_record(Rid::new(1, 0))?;
    assert_eq!(heap.header().first_free_page_no, 1);

    heap.close()?;
    Ok(())
}

#[test]
fn lru_eviction_prefers_least_recently_unpinned() -> Result<()> {
    let dir = tempdir()?;
    let (disk, pool) = setup(dir.path(), 2);
    let path = dir.path().join("raw.db");
    disk.create_file(&path)?;
    let file_id = disk.open_file(&path)?;

    let (a, page_a) = pool.new_page(file_id)?;
    page_a.data_mut()[0] = b'a';
    drop(page_a);
    let (b, page_b) = pool.new_page(file_id)?;
    page_b.data_mut()[0] = b'b';
    drop(page_b);

    // unpin a first: it is the older candidate
    assert!(pool.unpin_page(a, true));
    assert!(pool.unpin_page(b, true));

    // c takes a's frame
    let (c, page_c) = pool.new_page(file_id)?;
    page_c.data_mut()[0] = b'c';
    drop(page_c);

    // b is still resident; a comes back from disk with its bytes intact
    let page_b = pool.fetch_page(b)?;
    assert_eq!(page_b.data()[0], b'b');
    drop(page_b);
    assert!(pool.unpin_page(b, false));

    assert!(pool.unpin_page(c, true));
    let page_a = pool.fetch_page(a)?;
    assert_eq!(page_a.data()[0], b'a');
    drop(page_a);
    assert!(pool.unpin_page(a, false));

    Ok(())
}

#[test]
fn all_frames_pinned_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let (disk, pool) = setup(dir.path(), 2);
    let path = dir.path().join("raw.db");
    disk.create_file(&path)?;
    let file_id = disk.open_file(&path)?;

    let (a, _page_a) = pool.new_page(file_id)?;
    let (_b, _page_b) = pool.new_page(file_id)?;

    assert!(matches!(
        pool.fetch_page(PageId::new(file_id, 0)),
        Err(StorageError::PoolExhausted)
    ));

    assert!(pool.unpin_page(a, true));
    assert!(pool.fetch_page(a).is_ok());
    Ok(())
}

#[test]
fn double_unpin_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let (disk, pool) = setup(dir.path(), 4);
    let path = dir.path().join("raw.db");
    disk.create_file(&path)?;
    let file_id = disk.open_file(&path)?;

    let (page_id, page) = pool.new_page(file_id)?;
    drop(page);
    assert!(pool.unpin_page(page_id, false));
    assert!(!pool.unpin_page(page_id, false));
    Ok(())
}

#[test]
fn btree_split_and_range_scan() -> Result<()> {
    let dir = tempdir()?;
    let (disk, pool) = setup(dir.path(), 32);
    let path = dir.path().join("t.idx");

    BTreeIndex::create(&disk, &path, KeyType::Int, KEY_LEN)?;
    let index = BTreeIndex::open(Arc::clone(&disk), pool, &path)?;
    let root_before = index.header().root_page;

    // four inserts split the root leaf
    for value in 1..=4 {
        assert!(index.insert_entry(&int_key(value), Rid::new(value as u32, 0))?);
    }
    assert_ne!(index.header().root_page, root_before);

    // three more split the right leaf again
    for value in 5..=7 {
        assert!(index.insert_entry(&int_key(value), Rid::new(value as u32, 0))?);
    }

    let begin = index.lower_bound(&int_key(2))?;
    let end = index.upper_bound(&int_key(6))?;
    let mut scan = BTreeScan::new(&index, begin, end);
    let mut seen = Vec::new();
    while !scan.is_end() {
        seen.push(scan.rid()?.page_no);
        scan.next()?;
    }
    assert_eq!(seen, vec![2, 3, 4, 5, 6]);

    index.close()?;
    Ok(())
}

#[test]
fn btree_coalesce_restores_single_leaf() -> Result<()> {
    let dir = tempdir()?;
    let (disk, pool) = setup(dir.path(), 32);
    let path = dir.path().join("t.idx");

    BTreeIndex::create(&disk, &path, KeyType::Int, KEY_LEN)?;
    let index = BTreeIndex::open(Arc::clone(&disk), pool, &path)?;

    for value in 1..=7 {
        assert!(index.insert_entry(&int_key(value), Rid::new(value as u32, 0))?);
    }
    for value in 1..=4 {
        assert!(index.delete_entry(&int_key(value))?);
    }

    // underflow merges collapsed the tree back to one root leaf
    let header = index.header();
    assert_eq!(header.root_page, header.first_leaf);
    assert_eq!(header.first_leaf, header.last_leaf);

    let mut scan = BTreeScan::new(&index, index.leaf_begin()?, index.leaf_end()?);
    let mut seen = Vec::new();
    while !scan.is_end() {
        seen.push(scan.rid()?.page_no);
        scan.next()?;
    }
    assert_eq!(seen, vec![5, 6, 7]);

    for value in 1..=4 {
        assert_eq!(index.get_value(&int_key(value))?, None);
    }

    index.close()?;
    Ok(())
}

#[test]
fn heap_and_index_together() -> Result<()> {
    let dir = tempdir()?;
    let (disk, pool) = setup(dir.path(), 32);
    let heap_path = dir.path().join("t.db");
    let index_path = dir.path().join("t.idx");

    HeapFile::create(&disk, &heap_path, 16)?;
    BTreeIndex::create(&disk, &index_path, KeyType::Int, KEY_LEN)?;
    let heap = HeapFile::open(Arc::clone(&disk), Arc::clone(&pool), &heap_path)?;
    let index = BTreeIndex::open(Arc::clone(&disk), Arc::clone(&pool), &index_path)?;

    // index every record by its integer prefix
    for value in [42, 7, 19, 3, 88, 61, 54, 26, 70, 11] {
        let mut record = vec![0u8; 16];
        record[..4].copy_from_slice(&(value as i32).to_le_bytes());
        let rid = heap.insert_record(&record)?;
        assert!(index.insert_entry(&int_key(value), rid)?);
    }

    // a range scan drives ordered point reads through the heap
    let begin = index.lower_bound(&int_key(10))?;
    let end = index.upper_bound(&int_key(61))?;
    let mut scan = BTreeScan::new(&index, begin, end);
    let mut seen = Vec::new();
    while !scan.is_end() {
        let record = heap.get_record(scan.rid()?)?;
        seen.push(i32::from_le_bytes([
            record.data[0],
            record.data[1],
            record.data[2],
            record.data[3],
        ]));
        scan.next()?;
    }
    assert_eq!(seen, vec![11, 19, 26, 42, 54, 61]);

    // delete through the index, then through the heap
    let victim = index.get_value(&int_key(42))?.expect("42 is indexed");
    assert!(index.delete_entry(&int_key(42))?);
    heap.delete_record(victim)?;
    assert_eq!(index.get_value(&int_key(42))?, None);
    assert!(matches!(
        heap.get_record(victim),
        Err(StorageError::RecordNotFound { .. })
    ));

    index.close()?;
    heap.close()?;
    Ok(())
}

#[test]
fn positional_insert_replays_like_recovery() -> Result<()> {
    let dir = tempdir()?;
    let (disk, pool) = setup(dir.path(), 8);
    let path = dir.path().join("t.db");

    HeapFile::create(&disk, &path, 8)?;
    let heap = HeapFile::open(Arc::clone(&disk), pool, &path)?;

    // replay installs records at recorded rids, growing the file
    heap.insert_record_at(Rid::new(1, 3), b"redo-one")?;
    heap.insert_record_at(Rid::new(2, 0), b"redo-two")?;

    assert_eq!(heap.get_record(Rid::new(1, 3))?.data, b"redo-one");
    assert_eq!(heap.get_record(Rid::new(2, 0))?.data, b"redo-two");
    assert!(!heap.is_record(Rid::new(1, 0))?);

    heap.close()?;
    Ok(())
}

#[test]
fn log_appends_and_reads_back() -> Result<()> {
    let dir = tempdir()?;
    let (disk, _pool) = setup(dir.path(), 4);

    disk.write_log(b"BEGIN;")?;
    disk.write_log(b"INSERT;")?;
    disk.write_log(b"COMMIT;")?;

    // walk the log the way the recovery driver does: offset from the
    // previous read's end
    let mut contents = Vec::new();
    let mut prev_end = 0u64;
    let mut chunk = [0u8; 5];
    while disk.read_log(&mut chunk, 0, prev_end)? {
        contents.extend_from_slice(&chunk);
        prev_end += chunk.len() as u64;
    }
    assert!(contents.starts_with(b"BEGIN;INSERT;COMMIT;"));

    Ok(())
}

#[test]
fn flush_evict_refetch_is_byte_identical() -> Result<()> {
    let dir = tempdir()?;
    let (disk, pool) = setup(dir.path(), 2);
    let path = dir.path().join("raw.db");
    disk.create_file(&path)?;
    let file_id = disk.open_file(&path)?;

    let (target, page) = pool.new_page(file_id)?;
    {
        let mut data = page.data_mut();
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 13) as u8;
        }
    }
    drop(page);
    assert!(pool.unpin_page(target, true));
    assert!(pool.flush_page(target)?);

    // force the target out of the pool
    for _ in 0..3 {
        let (id, page) = pool.new_page(file_id)?;
        drop(page);
        assert!(pool.unpin_page(id, true));
    }

    let page = pool.fetch_page(target)?;
    for (i, byte) in page.data().iter().enumerate() {
        assert_eq!(*byte, (i % 13) as u8);
    }
    drop(page);
    assert!(pool.unpin_page(target, false));
    Ok(())
}
