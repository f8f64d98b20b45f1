use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    block_store::{Block, BlockStatus, BlockStore},
    error::{Result, VfsError},
    namespace::{check_name, Namespace, Node, NodeId, NodeKind, ROOT},
};

/// Magic number for sanity check
const VFS_MAGIC: u32 = 0x3b800002;
/// Bumped whenever the encoded layout changes
const FORMAT_VERSION: u32 = 1;

/// Header of a persisted image
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct SuperBlock {
    magic: u32,
    version: u32,
    block_size: u64,
    block_count: u64,
}

// Encoding side borrows the live state; decoding owns it. Field order must match.
#[derive(Serialize)]
struct ImageRef<'a> {
    super_block: SuperBlock,
    blocks: &'a [Block],
    nodes: &'a BTreeMap<NodeId, Node>,
    next_id: NodeId,
    cwd: NodeId,
}

#[derive(Deserialize)]
struct Image {
    super_block: SuperBlock,
    blocks: Vec<Block>,
    nodes: BTreeMap<NodeId, Node>,
    next_id: NodeId,
    cwd: NodeId,
}

fn corrupt(msg: impl Into<String>) -> VfsError {
    VfsError::CorruptImage(msg.into())
}

/// Serialize the whole state into one image
pub(crate) fn encode(store: &BlockStore, ns: &Namespace) -> Result<Vec<u8>> {
    let image = ImageRef {
        super_block: SuperBlock {
            magic: VFS_MAGIC,
            version: FORMAT_VERSION,
            block_size: store.block_size() as u64,
            block_count: store.block_count() as u64,
        },
        blocks: store.blocks(),
        nodes: ns.nodes(),
        next_id: ns.next_id(),
        cwd: ns.cwd(),
    };
    bincode::serialize(&image).map_err(|e| VfsError::Io(std::io::Error::other(e)))
}

/// Rebuild a state from an image, refusing anything inconsistent
pub(crate) fn decode(bytes: &[u8]) -> Result<(BlockStore, Namespace)> {
    let image: Image = bincode::deserialize(bytes).map_err(|e| corrupt(e.to_string()))?;
    let sb = image.super_block;
    if sb.magic != VFS_MAGIC {
        return Err(corrupt(format!("bad magic {:#x}", sb.magic)));
    }
    if sb.version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {}", sb.version)));
    }
    if sb.block_count != image.blocks.len() as u64 {
        return Err(corrupt(format!(
            "header says {} blocks, image holds {}",
            sb.block_count,
            image.blocks.len()
        )));
    }
    let store = BlockStore::from_blocks(sb.block_size as usize, image.blocks);
    let ns = Namespace::from_parts(image.nodes, image.next_id, image.cwd);
    check_consistency(&store, &ns)?;
    Ok((store, ns))
}

/// Verify every structural invariant of a store and its namespace
pub(crate) fn check_consistency(store: &BlockStore, ns: &Namespace) -> Result<()> {
    let block_size = store.block_size();
    if block_size == 0 {
        return Err(corrupt("zero block size"));
    }
    for (id, block) in store.blocks().iter().enumerate() {
        if block.data.len() != block_size || block.used > block_size {
            return Err(corrupt(format!("block {id} has a bad shape")));
        }
        if block.status == BlockStatus::Free && block.used != 0 {
            return Err(corrupt(format!("free block {id} claims {} used bytes", block.used)));
        }
    }

    let nodes = ns.nodes();
    match nodes.get(&ROOT) {
        Some(Node {
            parent: None,
            kind: NodeKind::Directory(_),
            ..
        }) => {}
        _ => return Err(corrupt("missing or malformed root directory")),
    }
    if nodes.keys().any(|&id| id >= ns.next_id()) {
        return Err(corrupt("node id beyond the id counter"));
    }

    for (&id, node) in nodes.iter().filter(|&(&id, _)| id != ROOT) {
        check_name(&node.name).map_err(|_| corrupt(format!("node {id} has an invalid name")))?;
        let linked = node
            .parent
            .and_then(|p| ns.children(p))
            .is_some_and(|children| children.contains(&id));
        if !linked {
            return Err(corrupt(format!("node {id} is not linked from its parent")));
        }
    }

    // walk from the root; every node must be reached exactly once
    let mut visited = BTreeSet::new();
    let mut stack = vec![ROOT];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            return Err(corrupt(format!("node {id} reachable twice")));
        }
        let Some(children) = ns.children(id) else {
            continue;
        };
        let mut names = BTreeSet::new();
        for &child in children {
            let node = nodes
                .get(&child)
                .ok_or_else(|| corrupt(format!("directory {id} lists missing node {child}")))?;
            if node.parent != Some(id) {
                return Err(corrupt(format!("node {child} has a wrong parent")));
            }
            if !names.insert(node.name.as_str()) {
                return Err(corrupt(format!("duplicate name '{}' in directory {id}", node.name)));
            }
            stack.push(child);
        }
    }
    if visited.len() != nodes.len() {
        return Err(corrupt("unreachable nodes"));
    }

    let mut claimed = BTreeSet::new();
    for (&id, node) in nodes {
        let NodeKind::File(content) = &node.kind else {
            continue;
        };
        for (segment, seg) in content.segments().iter().enumerate() {
            let block = store
                .blocks()
                .get(seg.block_id)
                .ok_or_else(|| corrupt(format!("file {id} references missing block {}", seg.block_id)))?;
            if block.status != (BlockStatus::Owned { file: id, segment }) {
                return Err(corrupt(format!(
                    "block {} is not owned by file {id} segment {segment}",
                    seg.block_id
                )));
            }
            if seg.len == 0 || block.used != seg.len {
                return Err(corrupt(format!("block {} length mismatch", seg.block_id)));
            }
            if !claimed.insert(seg.block_id) {
                return Err(corrupt(format!("block {} shared by two segments", seg.block_id)));
            }
        }
    }
    let owned = store
        .blocks()
        .iter()
        .filter(|b| b.status != BlockStatus::Free)
        .count();
    if owned != claimed.len() {
        return Err(corrupt("owned blocks without a segment"));
    }

    if ns.children(ns.cwd()).is_none() {
        return Err(corrupt("cwd is not a directory"));
    }
    Ok(())
}
