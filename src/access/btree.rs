pub mod iterator;
pub mod key;
pub mod node;

use crate::access::record::Rid;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::{DiskManager, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageId, INVALID_PAGE_NO};
use iterator::Iid;
use key::KeyType;
use node::{init_node_buf, BTreeNode, NodeFormat};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// File header stored at page 0 of every index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexFileHeader {
    pub key_type: KeyType,
    pub col_len: u32,
    pub num_pages: u32,
    pub root_page: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
}

impl IndexFileHeader {
    pub const SIZE: usize = 24;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.key_type.to_u32().to_le_bytes());
        bytes[4..8].copy_from_slice(&self.col_len.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.num_pages.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.root_page.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.first_leaf.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.last_leaf.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let read = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        Self {
            key_type: KeyType::from_u32(read(0)),
            col_len: read(4),
            num_pages: read(8),
            root_page: read(12),
            first_leaf: read(16),
            last_leaf: read(20),
        }
    }

    fn format(&self) -> NodeFormat {
        NodeFormat::new(self.key_type, self.col_len as usize)
    }
}

/// B+-tree index over fixed-width keys. Every non-root node keeps
/// between `min_size` and `max_size - 1` keys, leaves form a doubly
/// linked chain in key order, and each internal separator equals the
/// smallest key of its subtree.
///
/// All public operations serialize on one tree latch, which doubles as
/// the lock on the in-memory file header.
pub struct BTreeIndex {
    buffer_pool: Arc<BufferPoolManager>,
    disk: Arc<DiskManager>,
    file_id: FileId,
    fmt: NodeFormat,
    root_latch: Mutex<IndexFileHeader>,
}

impl BTreeIndex {
    /// Create an index file: a header page and an empty root leaf.
    pub fn create(
        disk: &DiskManager,
        path: &Path,
        key_type: KeyType,
        col_len: usize,
    ) -> StorageResult<()> {
        assert!(col_len > 0 && NodeFormat::order_for(col_len) >= 4, "key too wide for a page");
        let header = IndexFileHeader {
            key_type,
            col_len: col_len as u32,
            num_pages: 2,
            root_page: 1,
            first_leaf: 1,
            last_leaf: 1,
        };
        disk.create_file(path)?;
        let file_id = disk.open_file(path)?;
        disk.write_page(file_id, 0, &header.to_bytes())?;
        let mut root = Box::new([0u8; PAGE_SIZE]);
        init_node_buf(&mut root, true);
        disk.write_page(file_id, 1, &root[..])?;
        disk.close_file(file_id)?;
        Ok(())
    }

    pub fn open(
        disk: Arc<DiskManager>,
        buffer_pool: Arc<BufferPoolManager>,
        path: &Path,
    ) -> StorageResult<Self> {
        let file_id = disk.open_file(path)?;
        let mut bytes = [0u8; IndexFileHeader::SIZE];
        disk.read_page(file_id, 0, &mut bytes)?;
        let header = IndexFileHeader::from_bytes(&bytes);
        // header num_pages shrinks on node deletion, so resume allocation
        // past every page the file physically holds
        let on_disk = (DiskManager::file_size(path)? / PAGE_SIZE as u64) as u32;
        disk.set_page_counter(file_id, on_disk.max(header.num_pages))?;
        let fmt = header.format();
        Ok(Self {
            buffer_pool,
            disk,
            file_id,
            fmt,
            root_latch: Mutex::new(header),
        })
    }

    /// Persist the header, flush the file's pages and close the fd.
    pub fn close(self) -> StorageResult<()> {
        let header = *self.root_latch.lock();
        self.disk.write_page(self.file_id, 0, &header.to_bytes())?;
        self.buffer_pool.flush_all_pages(self.file_id)?;
        self.disk.close_file(self.file_id)?;
        Ok(())
    }

    /// Remove a closed index file from disk.
    pub fn destroy(disk: &DiskManager, path: &Path) -> StorageResult<()> {
        disk.destroy_file(path)
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn header(&self) -> IndexFileHeader {
        *self.root_latch.lock()
    }

    /// Point lookup: the rid stored under `key`, if any.
    pub fn get_value(&self, key: &[u8]) -> StorageResult<Option<Rid>> {
        let header = self.root_latch.lock();
        if header.root_page == INVALID_PAGE_NO {
            return Ok(None);
        }
        let leaf = self.find_leaf(&header, key)?;
        let result = leaf.leaf_lookup(key);
        self.unpin_node(&leaf, false);
        Ok(result)
    }

    /// Insert `key -> rid`. Returns false on a duplicate key.
    pub fn insert_entry(&self, key: &[u8], rid: Rid) -> StorageResult<bool> {
        assert_eq!(key.len(), self.fmt.col_len);
        let mut header = self.root_latch.lock();
        if header.root_page == INVALID_PAGE_NO {
            // the tree was emptied by deletes; start over with a root leaf
            let root = self.create_node(&mut header)?;
            root.init(true);
            header.root_page = root.page_no;
            header.first_leaf = root.page_no;
            header.last_leaf = root.page_no;
            self.unpin_node(&root, true);
        }
        let leaf = self.find_leaf(&header, key)?;
        let before = leaf.num_key();
        let after = leaf.insert(key, rid);
        if after == before {
            self.unpin_node(&leaf, false);
            return Ok(false);
        }
        self.maintain_parent(&leaf)?;
        if after >= self.fmt.max_size() {
            let new_node = self.split(&mut header, &leaf)?;
            if header.last_leaf == leaf.page_no {
                header.last_leaf = new_node.page_no;
            }
            let split_key = new_node.key(0);
            self.insert_into_parent(&mut header, &leaf, &split_key, &new_node)?;
            self.unpin_node(&new_node, true);
        }
        self.unpin_node(&leaf, true);
        Ok(true)
    }

    /// Delete the entry under `key`. Returns false if it is absent.
    pub fn delete_entry(&self, key: &[u8]) -> StorageResult<bool> {
        assert_eq!(key.len(), self.fmt.col_len);
        let mut header = self.root_latch.lock();
        if header.root_page == INVALID_PAGE_NO {
            return Ok(false);
        }
        let leaf = self.find_leaf(&header, key)?;
        let before = leaf.num_key();
        let after = leaf.remove(key);
        if after == before {
            self.unpin_node(&leaf, false);
            return Ok(false);
        }
        if leaf.num_key() > 0 {
            self.maintain_parent(&leaf)?;
        }
        let unlinked = self.coalesce_or_redistribute(&mut header, &leaf)?;
        self.unpin_node(&leaf, true);
        if unlinked {
            self.release_node(&mut header, leaf.page_no)?;
        }
        Ok(true)
    }

    /// Position of the first entry with key >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> StorageResult<Iid> {
        let header = self.root_latch.lock();
        if header.root_page == INVALID_PAGE_NO {
            return Ok(Iid::new(INVALID_PAGE_NO, 0));
        }
        let leaf = self.find_leaf(&header, key)?;
        let iid = Self::leaf_position(&leaf, leaf.lower_bound(key));
        self.unpin_node(&leaf, false);
        Ok(iid)
    }

    /// Position one past the last entry with key <= `key`.
    pub fn upper_bound(&self, key: &[u8]) -> StorageResult<Iid> {
        let header = self.root_latch.lock();
        if header.root_page == INVALID_PAGE_NO {
            return Ok(Iid::new(INVALID_PAGE_NO, 0));
        }
        let leaf = self.find_leaf(&header, key)?;
        let iid = Self::leaf_position(&leaf, leaf.upper_bound(key));
        self.unpin_node(&leaf, false);
        Ok(iid)
    }

    /// Turn a node-level slot into an iteration position. A slot one
    /// past the leaf's keys names the next leaf's first entry, so that
    /// bounds falling in the gap between two leaves stay usable; in the
    /// last leaf it is the end position itself.
    fn leaf_position(leaf: &BTreeNode, pos: usize) -> Iid {
        let pos = pos.min(leaf.num_key());
        if pos == leaf.num_key() && leaf.next_leaf() != INVALID_PAGE_NO {
            Iid::new(leaf.next_leaf(), 0)
        } else {
            Iid::new(leaf.page_no, pos as u32)
        }
    }

    /// Position of the first entry of the index.
    pub fn leaf_begin(&self) -> StorageResult<Iid> {
        let header = self.root_latch.lock();
        Ok(Iid::new(header.first_leaf, 0))
    }

    /// Position one past the last entry of the index.
    pub fn leaf_end(&self) -> StorageResult<Iid> {
        let header = self.root_latch.lock();
        self.leaf_end_inner(&header)
    }

    /// The heap rid stored at an index position.
    pub fn get_rid(&self, iid: Iid) -> StorageResult<Rid> {
        let _header = self.root_latch.lock();
        if iid.page_no == INVALID_PAGE_NO {
            return Err(StorageError::IndexEntryNotFound);
        }
        let node = self.fetch_node(iid.page_no)?;
        if iid.slot_no as usize >= node.num_key() {
            self.unpin_node(&node, false);
            return Err(StorageError::IndexEntryNotFound);
        }
        let rid = node.rid(iid.slot_no as usize);
        self.unpin_node(&node, false);
        Ok(rid)
    }

    /// Descend from the root to the leaf that owns `key`. The leaf comes
    /// back pinned; the caller unpins.
    fn find_leaf(&self, header: &IndexFileHeader, key: &[u8]) -> StorageResult<BTreeNode> {
        let mut node = self.fetch_node(header.root_page)?;
        while !node.is_leaf() {
            let child = node.internal_lookup(key);
            self.unpin_node(&node, false);
            node = self.fetch_node(child)?;
        }
        Ok(node)
    }

    /// Split `node`, moving its upper half into a fresh right sibling.
    /// Both nodes stay pinned; the caller unpins the new one.
    fn split(&self, header: &mut IndexFileHeader, node: &BTreeNode) -> StorageResult<BTreeNode> {
        let new_node = self.create_node(header)?;
        new_node.init(node.is_leaf());
        new_node.set_parent(node.parent());
        let total = node.num_key();
        let mid = total / 2;
        new_node.append_from(node, mid, total - mid);
        node.truncate(mid);
        if node.is_leaf() {
            new_node.set_prev_leaf(node.page_no);
            new_node.set_next_leaf(node.next_leaf());
            if node.next_leaf() != INVALID_PAGE_NO {
                let next = self.fetch_node(node.next_leaf())?;
                next.set_prev_leaf(new_node.page_no);
                self.unpin_node(&next, true);
            }
            node.set_next_leaf(new_node.page_no);
        } else {
            for pos in 0..new_node.num_key() {
                self.maintain_child(&new_node, pos)?;
            }
        }
        Ok(new_node)
    }

    /// Register `new_node` (the right half of a split of `old`) with the
    /// parent, growing a new root or recursing on parent overflow.
    fn insert_into_parent(
        &self,
        header: &mut IndexFileHeader,
        old: &BTreeNode,
        key: &[u8],
        new_node: &BTreeNode,
    ) -> StorageResult<()> {
        if header.root_page == old.page_no {
            let root = self.create_node(header)?;
            root.init(false);
            root.insert_pair(0, &old.key(0), Rid::new(old.page_no, 0));
            root.insert_pair(1, key, Rid::new(new_node.page_no, 0));
            header.root_page = root.page_no;
            old.set_parent(root.page_no);
            new_node.set_parent(root.page_no);
            self.unpin_node(&root, true);
            return Ok(());
        }
        let parent = self.fetch_node(old.parent())?;
        let pos = parent.find_child(old.page_no);
        parent.insert_pair(pos + 1, key, Rid::new(new_node.page_no, 0));
        new_node.set_parent(parent.page_no);
        if parent.num_key() >= self.fmt.max_size() {
            let new_parent = self.split(header, &parent)?;
            let split_key = new_parent.key(0);
            self.insert_into_parent(header, &parent, &split_key, &new_parent)?;
            self.unpin_node(&new_parent, true);
        }
        self.unpin_node(&parent, true);
        Ok(())
    }

    /// Rebalance `node` after a removal. Returns whether `node` was
    /// unlinked from the tree; the caller still holds its pin and must
    /// release the page afterwards. Merges with the `index == 0` right
    /// sibling unlink the sibling instead, which is released here.
    fn coalesce_or_redistribute(
        &self,
        header: &mut IndexFileHeader,
        node: &BTreeNode,
    ) -> StorageResult<bool> {
        if node.page_no == header.root_page {
            return self.adjust_root(header, node);
        }
        if node.num_key() >= self.fmt.min_size() {
            return Ok(false);
        }
        let parent = self.fetch_node(node.parent())?;
        let index = parent.find_child(node.page_no);
        // prefer the left sibling; only the leftmost child takes the right
        let neighbor = if index > 0 {
            self.fetch_node(parent.child(index - 1))?
        } else {
            self.fetch_node(parent.child(1))?
        };

        if neighbor.num_key() + node.num_key() >= 2 * self.fmt.min_size() {
            self.redistribute(&neighbor, node, &parent, index)?;
            self.unpin_node(&neighbor, true);
            self.unpin_node(&parent, true);
            return Ok(false);
        }

        let unlinked = if index == 0 {
            // node is leftmost: the right sibling merges into it
            self.coalesce(header, node, &neighbor, &parent, 1)?;
            self.unpin_node(&neighbor, true);
            self.release_node(header, neighbor.page_no)?;
            false
        } else {
            self.coalesce(header, &neighbor, node, &parent, index)?;
            self.unpin_node(&neighbor, true);
            true
        };

        let parent_unlinked = self.coalesce_or_redistribute(header, &parent)?;
        self.unpin_node(&parent, true);
        if parent_unlinked {
            self.release_node(header, parent.page_no)?;
        }
        Ok(unlinked)
    }

    /// Merge `right` into `left` and drop `right`'s separator from the
    /// parent. `right` leaves the tree; the caller releases its page.
    fn coalesce(
        &self,
        header: &mut IndexFileHeader,
        left: &BTreeNode,
        right: &BTreeNode,
        parent: &BTreeNode,
        right_index: usize,
    ) -> StorageResult<()> {
        let at = left.num_key();
        let moved = right.num_key();
        left.append_from(right, 0, moved);
        if !left.is_leaf() {
            for pos in at..at + moved {
                self.maintain_child(left, pos)?;
            }
        }
        if right.is_leaf() {
            self.erase_leaf(header, right)?;
        }
        parent.erase_pair(right_index);
        Ok(())
    }

    /// Borrow one pair from `neighbor` into the underflowing `node` and
    /// fix the separator in `parent`. `index` is node's position in the
    /// parent; 0 means the neighbor is the right sibling.
    fn redistribute(
        &self,
        neighbor: &BTreeNode,
        node: &BTreeNode,
        parent: &BTreeNode,
        index: usize,
    ) -> StorageResult<()> {
        if index == 0 {
            let key = neighbor.key(0);
            let rid = neighbor.rid(0);
            neighbor.erase_pair(0);
            let pos = node.num_key();
            node.insert_pair(pos, &key, rid);
            if !node.is_leaf() {
                self.maintain_child(node, pos)?;
            }
            parent.set_key(1, &neighbor.key(0));
        } else {
            let last = neighbor.num_key() - 1;
            let key = neighbor.key(last);
            let rid = neighbor.rid(last);
            neighbor.erase_pair(last);
            node.insert_pair(0, &key, rid);
            if !node.is_leaf() {
                self.maintain_child(node, 0)?;
            }
            parent.set_key(index, &node.key(0));
        }
        Ok(())
    }

    /// Shrink the root after a removal: promote the only child of an
    /// internal root, or clear the tree when a root leaf runs empty.
    /// Returns whether the old root left the tree.
    fn adjust_root(
        &self,
        header: &mut IndexFileHeader,
        old_root: &BTreeNode,
    ) -> StorageResult<bool> {
        if !old_root.is_leaf() && old_root.num_key() == 1 {
            let child_page_no = old_root.remove_and_return_only_child();
            let child = self.fetch_node(child_page_no)?;
            child.set_parent(INVALID_PAGE_NO);
            self.unpin_node(&child, true);
            header.root_page = child_page_no;
            return Ok(true);
        }
        if old_root.is_leaf() && old_root.num_key() == 0 {
            header.root_page = INVALID_PAGE_NO;
            header.first_leaf = INVALID_PAGE_NO;
            header.last_leaf = INVALID_PAGE_NO;
            return Ok(true);
        }
        Ok(false)
    }

    /// Walk upward from `node`, correcting each ancestor's separator to
    /// the first key of the updated subtree until one already matches.
    fn maintain_parent(&self, node: &BTreeNode) -> StorageResult<()> {
        let mut child_page_no = node.page_no;
        let mut child_key = node.key(0);
        let mut parent_page_no = node.parent();
        while parent_page_no != INVALID_PAGE_NO {
            let parent = self.fetch_node(parent_page_no)?;
            let pos = parent.find_child(child_page_no);
            if parent.key(pos) == child_key {
                self.unpin_node(&parent, true);
                break;
            }
            parent.set_key(pos, &child_key);
            child_page_no = parent.page_no;
            child_key = parent.key(0);
            parent_page_no = parent.parent();
            self.unpin_node(&parent, true);
        }
        Ok(())
    }

    /// Point the parent back-reference of `node`'s `pos`-th child at
    /// `node`.
    fn maintain_child(&self, node: &BTreeNode, pos: usize) -> StorageResult<()> {
        if !node.is_leaf() {
            let child = self.fetch_node(node.child(pos))?;
            child.set_parent(node.page_no);
            self.unpin_node(&child, true);
        }
        Ok(())
    }

    /// Splice a leaf out of the chain, fixing `first_leaf`/`last_leaf`
    /// when the leaf sat at either end.
    fn erase_leaf(&self, header: &mut IndexFileHeader, leaf: &BTreeNode) -> StorageResult<()> {
        if leaf.prev_leaf() != INVALID_PAGE_NO {
            let prev = self.fetch_node(leaf.prev_leaf())?;
            prev.set_next_leaf(leaf.next_leaf());
            self.unpin_node(&prev, true);
        } else {
            header.first_leaf = leaf.next_leaf();
        }
        if leaf.next_leaf() != INVALID_PAGE_NO {
            let next = self.fetch_node(leaf.next_leaf())?;
            next.set_prev_leaf(leaf.prev_leaf());
            self.unpin_node(&next, true);
        } else {
            header.last_leaf = leaf.prev_leaf();
        }
        Ok(())
    }

    /// Pin the node page `page_no`; the caller unpins.
    pub(crate) fn fetch_node(&self, page_no: u32) -> StorageResult<BTreeNode> {
        let page = self.buffer_pool.fetch_page(self.page_id(page_no))?;
        Ok(BTreeNode::new(page_no, page, self.fmt))
    }

    /// Allocate a fresh node page, pinned. The caller initializes and
    /// unpins it.
    fn create_node(&self, header: &mut IndexFileHeader) -> StorageResult<BTreeNode> {
        header.num_pages += 1;
        let (page_id, page) = self.buffer_pool.new_page(self.file_id)?;
        Ok(BTreeNode::new(page_id.page_no, page, self.fmt))
    }

    /// Return an unlinked node's frame to the pool. Page numbers are not
    /// recycled; only the live-node count shrinks.
    fn release_node(&self, header: &mut IndexFileHeader, page_no: u32) -> StorageResult<()> {
        let deleted = self.buffer_pool.delete_page(self.page_id(page_no))?;
        assert!(deleted, "released node page {} is still pinned", page_no);
        header.num_pages -= 1;
        Ok(())
    }

    pub(crate) fn unpin_node(&self, node: &BTreeNode, is_dirty: bool) {
        let unpinned = self.buffer_pool.unpin_page(self.page_id(node.page_no), is_dirty);
        assert!(unpinned, "node page {} was not pinned", node.page_no);
    }

    fn leaf_end_inner(&self, header: &IndexFileHeader) -> StorageResult<Iid> {
        if header.last_leaf == INVALID_PAGE_NO {
            return Ok(Iid::new(INVALID_PAGE_NO, 0));
        }
        let node = self.fetch_node(header.last_leaf)?;
        let iid = Iid::new(header.last_leaf, node.num_key() as u32);
        self.unpin_node(&node, false);
        Ok(iid)
    }

    fn page_id(&self, page_no: u32) -> PageId {
        PageId::new(self.file_id, page_no)
    }
}
