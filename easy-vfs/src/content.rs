use serde::{Deserialize, Serialize};

use crate::{
    block_store::{BlockStore, Segment},
    error::{Result, VfsError},
    namespace::NodeId,
};

/// Logical content of a file: segments in left-to-right order
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileContent {
    segments: Vec<Segment>,
}

impl FileContent {
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn size(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Copy `[start, start + len)` out of the store; the range must lie inside the file
    fn copy_out(&self, store: &BlockStore, start: usize, len: usize) -> Result<Vec<u8>> {
        let end = start + len;
        let mut buf = Vec::with_capacity(len);
        let mut seg_start = 0;
        for seg in self.segments.iter() {
            let seg_end = seg_start + seg.len;
            if seg_end > start && seg_start < end {
                let from = start.max(seg_start) - seg_start;
                let to = end.min(seg_end) - seg_start;
                buf.extend_from_slice(store.read(seg.block_id, from, to - from)?);
            }
            if seg_end >= end {
                break;
            }
            seg_start = seg_end;
        }
        Ok(buf)
    }

    pub fn read_all(&self, store: &BlockStore) -> Result<Vec<u8>> {
        self.copy_out(store, 0, self.size())
    }

    /// Read up to `len` bytes at `start`; an over-long request is clamped to the file end
    pub fn read_range(&self, store: &BlockStore, start: usize, len: usize) -> Result<Vec<u8>> {
        let size = self.size();
        if start > size {
            return Err(VfsError::RangeError(format!(
                "start {start} beyond file size {size}"
            )));
        }
        self.copy_out(store, start, len.min(size - start))
    }

    /// Append `zeros` zero bytes followed by `bytes` in freshly allocated blocks
    fn extend(
        &mut self,
        store: &mut BlockStore,
        file: NodeId,
        zeros: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let total = zeros
            .checked_add(bytes.len())
            .ok_or(VfsError::OutOfSpace {
                requested: usize::MAX,
                available: store.free_bytes(),
            })?;
        if total == 0 {
            return Ok(());
        }
        let new = store.allocate(total, file, self.segments.len())?;
        overwrite(store, &new, zeros, bytes)?;
        self.segments.extend(new);
        Ok(())
    }

    pub fn write_append(&mut self, store: &mut BlockStore, file: NodeId, bytes: &[u8]) -> Result<()> {
        self.extend(store, file, 0, bytes)
    }

    /// Overwrite `[index, index + bytes.len())`, zero-filling any gap past the end
    pub fn write_at(
        &mut self,
        store: &mut BlockStore,
        file: NodeId,
        index: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let size = self.size();
        let end = index.checked_add(bytes.len()).ok_or_else(|| {
            VfsError::RangeError(format!("write of {} bytes at {index} overflows", bytes.len()))
        })?;
        let gap = index.saturating_sub(size);
        let in_place = end.min(size).saturating_sub(index);
        let (head, tail) = bytes.split_at(in_place);
        // grow first: a failed allocation must leave the old bytes untouched
        self.extend(store, file, gap, tail)?;
        overwrite(store, &self.segments, index, head)
    }

    pub fn truncate(&mut self, store: &mut BlockStore, file: NodeId, new_size: usize) -> Result<()> {
        let size = self.size();
        if new_size > size {
            return self.extend(store, file, new_size - size, &[]);
        }
        if new_size == size {
            return Ok(());
        }
        let mut keep = 0;
        let mut acc = 0;
        for i in 0..self.segments.len() {
            let seg = self.segments[i];
            if acc + seg.len <= new_size {
                acc += seg.len;
                keep = i + 1;
                continue;
            }
            let inner = new_size - acc;
            if inner > 0 {
                store.shrink(seg.block_id, inner)?;
                self.segments[i].len = inner;
                keep = i + 1;
            }
            break;
        }
        let dropped: Vec<_> = self.segments.drain(keep..).map(|s| s.block_id).collect();
        store.free(dropped);
        Ok(())
    }

    /// Make sure a segment starts exactly at `pos`, copying the tail of a block
    /// into a new one if `pos` falls inside it. Returns that segment's index.
    fn split_at(&mut self, store: &mut BlockStore, file: NodeId, pos: usize) -> Result<usize> {
        let mut acc = 0;
        for i in 0..self.segments.len() {
            let seg = self.segments[i];
            if acc == pos {
                return Ok(i);
            }
            if pos < acc + seg.len {
                let inner = pos - acc;
                let tail_len = seg.len - inner;
                let tail = store.allocate(tail_len, file, i + 1)?[0];
                let bytes = store.read(seg.block_id, inner, tail_len)?.to_vec();
                store.write(tail.block_id, 0, &bytes)?;
                store.shrink(seg.block_id, inner)?;
                self.segments[i].len = inner;
                self.segments.insert(i + 1, tail);
                store.assign(file, &self.segments);
                log::debug!(
                    "file {}: split block {} at {} into {}",
                    file,
                    seg.block_id,
                    inner,
                    tail.block_id
                );
                return Ok(i + 1);
            }
            acc += seg.len;
        }
        Ok(self.segments.len())
    }

    /// Move `[start, start + length)` so that it begins at `target`, where
    /// `target` is an offset into the content with the range already removed.
    pub fn move_within(
        &mut self,
        store: &mut BlockStore,
        file: NodeId,
        start: usize,
        length: usize,
        target: usize,
    ) -> Result<()> {
        let size = self.size();
        if start > size || length > size - start {
            return Err(VfsError::RangeError(format!(
                "range [{start}, {}) outside file size {size}",
                start.saturating_add(length)
            )));
        }
        if target > size - length {
            return Err(VfsError::RangeError(format!(
                "target {target} beyond {} (size without the moved range)",
                size - length
            )));
        }
        if length == 0 || target == start {
            return Ok(());
        }
        let first = self.split_at(store, file, start)?;
        let last = self.split_at(store, file, start + length)?;
        let moved: Vec<_> = self.segments.drain(first..last).collect();
        let at = self.split_at(store, file, target)?;
        self.segments.splice(at..at, moved);
        store.assign(file, &self.segments);
        Ok(())
    }

    /// Free every block and leave the file empty
    pub fn release(&mut self, store: &mut BlockStore) {
        store.free(self.segments.drain(..).map(|s| s.block_id));
    }
}

/// Overwrite bytes at logical `offset` of `segments`; the range must already exist
fn overwrite(store: &mut BlockStore, segments: &[Segment], offset: usize, bytes: &[u8]) -> Result<()> {
    let mut written = 0;
    let mut seg_start = 0;
    for seg in segments {
        if written == bytes.len() {
            break;
        }
        let pos = offset + written;
        let seg_end = seg_start + seg.len;
        if pos >= seg_start && pos < seg_end {
            let inner = pos - seg_start;
            let n = (seg.len - inner).min(bytes.len() - written);
            store.write(seg.block_id, inner, &bytes[written..written + n])?;
            written += n;
        }
        seg_start = seg_end;
    }
    Ok(())
}
