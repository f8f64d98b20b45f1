use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, VfsError},
    namespace::NodeId,
};

/// Ownership state of one block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// On the free list
    Free,
    /// Holds segment `segment` of file `file`
    Owned {
        /// Owning file node
        file: NodeId,
        /// Index of the segment in the file's segment list
        segment: usize,
    },
}

/// A contiguous run of a file's bytes, stored at offset 0 of one block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Block holding the bytes
    pub block_id: usize,
    /// Number of bytes used in that block
    pub len: usize,
}

/// One row of the memory map
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block id
    pub id: usize,
    /// Ownership
    pub status: BlockStatus,
    /// Bytes in use
    pub used: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Block {
    pub status: BlockStatus,
    pub used: usize,
    pub data: Vec<u8>,
}

impl Block {
    fn empty(block_size: usize) -> Self {
        Self {
            status: BlockStatus::Free,
            used: 0,
            data: vec![0; block_size],
        }
    }
}

/// Fixed-capacity linear storage split into equally sized blocks
#[derive(Clone, Debug)]
pub struct BlockStore {
    block_size: usize,
    blocks: Vec<Block>,
    // free ids, handed out lowest first
    recycled: BTreeSet<usize>,
    // pre-images of blocks touched since the last checkpoint
    journal: Option<BTreeMap<usize, Block>>,
}

impl BlockStore {
    /// Create a store of `block_count` free blocks of `block_size` bytes
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            blocks: (0..block_count).map(|_| Block::empty(block_size)).collect(),
            recycled: (0..block_count).collect(),
            journal: None,
        }
    }

    /// Rebuild a store from persisted blocks; the free list is derived from the statuses
    pub(crate) fn from_blocks(block_size: usize, blocks: Vec<Block>) -> Self {
        let recycled = blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.status == BlockStatus::Free)
            .map(|(id, _)| id)
            .collect();
        Self {
            block_size,
            blocks,
            recycled,
            journal: None,
        }
    }

    pub(crate) fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Capacity of every block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks on the free list
    pub fn free_blocks(&self) -> usize {
        self.recycled.len()
    }

    /// Bytes that can still be allocated
    pub fn free_bytes(&self) -> usize {
        self.recycled.len() * self.block_size
    }

    /// Blocks needed to hold `n_bytes`
    pub fn blocks_needed(&self, n_bytes: usize) -> usize {
        n_bytes.div_ceil(self.block_size)
    }

    /// Start recording block pre-images so the next changes can be undone
    pub(crate) fn checkpoint(&mut self) {
        self.journal = Some(BTreeMap::new());
    }

    /// Keep every change made since the checkpoint
    pub(crate) fn release_checkpoint(&mut self) {
        self.journal = None;
    }

    /// Put every block touched since the checkpoint back as it was
    pub(crate) fn restore_checkpoint(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        log::debug!("restore {} blocks", journal.len());
        for (id, block) in journal {
            if block.status == BlockStatus::Free {
                self.recycled.insert(id);
            } else {
                self.recycled.remove(&id);
            }
            self.blocks[id] = block;
        }
    }

    fn touch(&mut self, id: usize) {
        if let (Some(journal), Some(block)) = (self.journal.as_mut(), self.blocks.get(id)) {
            journal.entry(id).or_insert_with(|| block.clone());
        }
    }

    /// Allocate zeroed blocks for `n_bytes` on behalf of `file`.
    ///
    /// Segment indices are assigned from `first_segment` upwards. Blocks come
    /// from the free list lowest id first, so the result is fragmented
    /// whenever the free list is. Nothing is taken unless everything fits.
    pub fn allocate(
        &mut self,
        n_bytes: usize,
        file: NodeId,
        first_segment: usize,
    ) -> Result<Vec<Segment>> {
        let needed = self.blocks_needed(n_bytes);
        if needed > self.recycled.len() {
            return Err(VfsError::OutOfSpace {
                requested: n_bytes,
                available: self.free_bytes(),
            });
        }
        let picked: Vec<usize> = self.recycled.iter().take(needed).copied().collect();
        let mut remaining = n_bytes;
        let mut segments = Vec::with_capacity(needed);
        for (i, block_id) in picked.into_iter().enumerate() {
            self.touch(block_id);
            self.recycled.remove(&block_id);
            let len = remaining.min(self.block_size);
            remaining -= len;
            let block = &mut self.blocks[block_id];
            block.status = BlockStatus::Owned {
                file,
                segment: first_segment + i,
            };
            block.used = len;
            block.data.fill(0);
            segments.push(Segment { block_id, len });
        }
        log::debug!(
            "alloc {}B for file {} -> {:?}",
            n_bytes,
            file,
            segments.iter().map(|s| s.block_id).collect::<Vec<_>>()
        );
        Ok(segments)
    }

    /// Return blocks to the free list; ids already free or out of range are skipped
    pub fn free(&mut self, ids: impl IntoIterator<Item = usize>) {
        for id in ids {
            match self.status(id) {
                None => {
                    log::warn!("free of unknown block {}", id);
                    continue;
                }
                Some(BlockStatus::Free) => continue,
                Some(_) => self.touch(id),
            }
            let block = &mut self.blocks[id];
            block.status = BlockStatus::Free;
            block.used = 0;
            block.data.fill(0);
            self.recycled.insert(id);
            log::debug!("free block {}", id);
        }
    }

    /// Re-tag the blocks of `segments` as segment 0.. of `file`
    pub fn assign(&mut self, file: NodeId, segments: &[Segment]) {
        for (segment, seg) in segments.iter().enumerate() {
            self.touch(seg.block_id);
            if let Some(block) = self.blocks.get_mut(seg.block_id) {
                block.status = BlockStatus::Owned { file, segment };
            }
        }
    }

    fn check(&self, block_id: usize, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len);
        if block_id >= self.blocks.len() || end.map_or(true, |end| end > self.block_size) {
            return Err(VfsError::BlockBoundsError {
                block_id,
                offset,
                end: end.unwrap_or(usize::MAX),
                capacity: self.block_size,
            });
        }
        Ok(())
    }

    /// Copy `bytes` into block `block_id` at `offset`
    pub fn write(&mut self, block_id: usize, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(block_id, offset, bytes.len())?;
        self.touch(block_id);
        self.blocks[block_id].data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Borrow `len` bytes of block `block_id` starting at `offset`
    pub fn read(&self, block_id: usize, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(block_id, offset, len)?;
        Ok(&self.blocks[block_id].data[offset..offset + len])
    }

    /// Cut the used part of a block down to `new_len`, zeroing the rest
    pub fn shrink(&mut self, block_id: usize, new_len: usize) -> Result<()> {
        self.check(block_id, 0, new_len)?;
        self.touch(block_id);
        let block = &mut self.blocks[block_id];
        block.used = new_len;
        block.data[new_len..].fill(0);
        Ok(())
    }

    /// Status of one block
    pub fn status(&self, block_id: usize) -> Option<BlockStatus> {
        self.blocks.get(block_id).map(|b| b.status)
    }

    /// Every block in ascending id order
    pub fn snapshot(&self) -> Vec<BlockInfo> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(id, b)| BlockInfo {
                id,
                status: b.status,
                used: b.used,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_fills_lowest_ids_first() {
        let mut store = BlockStore::new(4, 8);
        let segs = store.allocate(10, 7, 0).unwrap();
        assert_eq!(
            segs,
            vec![
                Segment { block_id: 0, len: 4 },
                Segment { block_id: 1, len: 4 },
                Segment { block_id: 2, len: 2 },
            ]
        );
        assert_eq!(
            store.status(2),
            Some(BlockStatus::Owned { file: 7, segment: 2 })
        );
        assert_eq!(store.free_blocks(), 5);
    }

    #[test]
    fn alloc_reuses_holes() {
        let mut store = BlockStore::new(4, 6);
        store.allocate(16, 1, 0).unwrap();
        store.free([1, 3]);
        let segs = store.allocate(8, 2, 0).unwrap();
        let ids: Vec<_> = segs.iter().map(|s| s.block_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn alloc_out_of_space_takes_nothing() {
        let mut store = BlockStore::new(4, 2);
        let err = store.allocate(9, 1, 0).unwrap_err();
        assert!(matches!(
            err,
            VfsError::OutOfSpace {
                requested: 9,
                available: 8
            }
        ));
        assert_eq!(store.free_blocks(), 2);
        assert!(store.allocate(8, 1, 0).is_ok());
        assert!(store.allocate(1, 1, 0).is_err());
    }

    #[test]
    fn free_is_idempotent() {
        let mut store = BlockStore::new(4, 4);
        store.allocate(4, 1, 0).unwrap();
        store.free([0]);
        store.free([0, 0, 2, 99]);
        assert_eq!(store.free_blocks(), 4);
        assert!(store.snapshot().iter().all(|b| b.status == BlockStatus::Free));
    }

    #[test]
    fn bounds_are_checked() {
        let mut store = BlockStore::new(4, 2);
        assert!(store.write(0, 2, b"ab").is_ok());
        assert!(matches!(
            store.write(0, 3, b"ab"),
            Err(VfsError::BlockBoundsError { end: 5, .. })
        ));
        assert!(store.read(2, 0, 1).is_err());
        assert_eq!(store.read(0, 2, 2).unwrap(), b"ab");
        assert!(matches!(
            store.read(0, usize::MAX, 2),
            Err(VfsError::BlockBoundsError { end: usize::MAX, .. })
        ));
        assert!(store.write(1, 1, &[]).is_ok());
    }

    #[test]
    fn huge_requests_do_not_overflow() {
        let mut store = BlockStore::new(4, 2);
        assert_eq!(store.blocks_needed(usize::MAX), usize::MAX / 4 + 1);
        assert!(matches!(
            store.allocate(usize::MAX, 1, 0),
            Err(VfsError::OutOfSpace { requested: usize::MAX, available: 8 })
        ));
    }

    #[test]
    fn restore_checkpoint_undoes_every_change() {
        let mut store = BlockStore::new(4, 6);
        let kept = store.allocate(8, 1, 0).unwrap();
        store.write(kept[0].block_id, 0, b"keep").unwrap();
        let before = store.snapshot();
        let data: Vec<_> = (0..6).map(|id| store.read(id, 0, 4).unwrap().to_vec()).collect();

        store.checkpoint();
        let fresh = store.allocate(5, 2, 0).unwrap();
        store.write(fresh[0].block_id, 0, b"new!").unwrap();
        store.shrink(kept[0].block_id, 1).unwrap();
        store.free([kept[1].block_id]);
        store.assign(3, &kept[..1]);
        store.restore_checkpoint();

        assert_eq!(store.snapshot(), before);
        assert_eq!(store.free_blocks(), 4);
        for (id, bytes) in data.iter().enumerate() {
            assert_eq!(store.read(id, 0, 4).unwrap(), &bytes[..]);
        }
        // the free list is back in step: the next allocation reuses the same holes
        let again = store.allocate(5, 2, 0).unwrap();
        assert_eq!(again, fresh);
    }

    #[test]
    fn released_checkpoint_keeps_changes() {
        let mut store = BlockStore::new(4, 2);
        store.checkpoint();
        store.allocate(4, 1, 0).unwrap();
        store.release_checkpoint();
        store.restore_checkpoint();
        assert_eq!(store.free_blocks(), 1);
    }

    #[test]
    fn freed_blocks_come_back_zeroed() {
        let mut store = BlockStore::new(4, 1);
        let seg = store.allocate(4, 1, 0).unwrap()[0];
        store.write(seg.block_id, 0, b"wxyz").unwrap();
        store.free([seg.block_id]);
        let seg = store.allocate(3, 2, 0).unwrap()[0];
        assert_eq!(store.read(seg.block_id, 0, 4).unwrap(), &[0, 0, 0, 0]);
    }
}
