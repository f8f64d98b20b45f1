use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    block_store::BlockStore,
    content::FileContent,
    error::{Result, VfsError},
};

/// Handle of a node in the namespace
pub type NodeId = u32;

/// The root directory is always node 0
pub(crate) const ROOT: NodeId = 0;
/// The max length of an entry name
const NAME_LENGTH_LIMIT: usize = 255;

/// Kind of a directory entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum NodeKind {
    File(FileContent),
    // children in insertion order
    Directory(Vec<NodeId>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Node {
    pub name: String,
    // non-owning back reference
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn entry_kind(&self) -> EntryKind {
        match self.kind {
            NodeKind::File(_) => EntryKind::File,
            NodeKind::Directory(_) => EntryKind::Directory,
        }
    }
}

/// Directory tree plus the current working directory
#[derive(Clone, Debug)]
pub(crate) struct Namespace {
    nodes: BTreeMap<NodeId, Node>,
    next_id: NodeId,
    cwd: NodeId,
}

pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.len() > NAME_LENGTH_LIMIT
    {
        return Err(VfsError::InvalidName(name.to_owned()));
    }
    Ok(())
}

impl Namespace {
    pub fn new() -> Self {
        let root = Node {
            name: String::new(),
            parent: None,
            kind: NodeKind::Directory(Vec::new()),
        };
        Self {
            nodes: BTreeMap::from([(ROOT, root)]),
            next_id: ROOT + 1,
            cwd: ROOT,
        }
    }

    pub fn from_parts(nodes: BTreeMap<NodeId, Node>, next_id: NodeId, cwd: NodeId) -> Self {
        Self {
            nodes,
            next_id,
            cwd,
        }
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, Node> {
        &self.nodes
    }

    pub fn next_id(&self) -> NodeId {
        self.next_id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn cwd(&self) -> NodeId {
        self.cwd
    }

    fn is_dir(&self, id: NodeId) -> bool {
        matches!(
            self.nodes.get(&id).map(|n| &n.kind),
            Some(NodeKind::Directory(_))
        )
    }

    pub fn children(&self, id: NodeId) -> Option<&[NodeId]> {
        match &self.nodes.get(&id)?.kind {
            NodeKind::Directory(children) => Some(children),
            NodeKind::File(_) => None,
        }
    }

    fn lookup(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.children(dir)?
            .iter()
            .copied()
            .find(|c| self.nodes.get(c).is_some_and(|n| n.name == name))
    }

    /// Resolve an absolute or cwd-relative path; `..` at the root stays at the root
    pub fn resolve(&self, path: &str) -> Result<NodeId> {
        let mut curr = if path.starts_with('/') { ROOT } else { self.cwd };
        for name in path.split('/').filter(|s| !s.is_empty()) {
            curr = match name {
                "." => curr,
                ".." => self.nodes.get(&curr).and_then(|n| n.parent).unwrap_or(ROOT),
                _ => self
                    .lookup(curr, name)
                    .ok_or_else(|| VfsError::NotFound(path.to_owned()))?,
            };
        }
        Ok(curr)
    }

    /// Split a path into its (existing) parent directory and final name
    fn split_parent(&self, path: &str) -> Result<(NodeId, String)> {
        let trimmed = path.trim_end_matches('/');
        let (parent_path, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
            None => ("", trimmed),
        };
        check_name(name)?;
        let parent = self.resolve(parent_path)?;
        if !self.is_dir(parent) {
            return Err(VfsError::NotADirectory(parent_path.to_owned()));
        }
        Ok((parent, name.to_owned()))
    }

    /// Path from the root, `/` for the root itself
    pub fn path_of(&self, id: NodeId) -> String {
        let components = self.components(id);
        if components.is_empty() {
            return "/".into();
        }
        components.iter().fold(String::new(), |mut s, c| {
            s.push('/');
            s.push_str(c);
            s
        })
    }

    /// Names from the root down to `id`
    pub fn components(&self, mut id: NodeId) -> Vec<String> {
        let mut v = Vec::new();
        while let Some(node) = self.nodes.get(&id) {
            let Some(parent) = node.parent else {
                break;
            };
            v.push(node.name.clone());
            id = parent;
        }
        v.reverse();
        v
    }

    /// Is `a` equal to `b` or one of its ancestors?
    pub fn is_ancestor(&self, a: NodeId, mut b: NodeId) -> bool {
        loop {
            if a == b {
                return true;
            }
            match self.nodes.get(&b).and_then(|n| n.parent) {
                Some(p) => b = p,
                None => return false,
            }
        }
    }

    fn insert(&mut self, path: &str, kind: NodeKind) -> Result<NodeId> {
        let (parent, name) = self.split_parent(path)?;
        if self.lookup(parent, &name).is_some() {
            return Err(VfsError::AlreadyExists(path.to_owned()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                name,
                parent: Some(parent),
                kind,
            },
        );
        if let Some(NodeKind::Directory(children)) = self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            children.push(id);
        }
        Ok(id)
    }

    pub fn create_file(&mut self, path: &str) -> Result<NodeId> {
        self.insert(path, NodeKind::File(FileContent::default()))
    }

    pub fn mkdir(&mut self, path: &str) -> Result<NodeId> {
        self.insert(path, NodeKind::Directory(Vec::new()))
    }

    fn detach(&mut self, id: NodeId) {
        let Some(parent) = self.nodes.get(&id).and_then(|n| n.parent) else {
            return;
        };
        if let Some(NodeKind::Directory(children)) = self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            children.retain(|&c| c != id);
        }
    }

    fn remove_subtree(&mut self, id: NodeId, store: &mut BlockStore) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        match node.kind {
            NodeKind::File(mut content) => content.release(store),
            NodeKind::Directory(children) => {
                for child in children {
                    self.remove_subtree(child, store);
                }
            }
        }
    }

    /// Delete a file or a whole directory subtree, freeing every block it owns
    pub fn delete(&mut self, path: &str, store: &mut BlockStore) -> Result<()> {
        let id = self.resolve(path)?;
        if id == ROOT {
            return Err(VfsError::ProtectedEntry(path.to_owned()));
        }
        let parent = self.nodes.get(&id).and_then(|n| n.parent).unwrap_or(ROOT);
        if self.is_ancestor(id, self.cwd) {
            self.cwd = parent;
        }
        self.detach(id);
        self.remove_subtree(id, store);
        Ok(())
    }

    /// Move `src` to `dst`; an existing directory `dst` receives `src` under its own name
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let id = self.resolve(src)?;
        if id == ROOT {
            return Err(VfsError::ProtectedEntry(src.to_owned()));
        }
        let (new_parent, new_name) = match self.resolve(dst) {
            // onto itself
            Ok(d) if d == id => return Ok(()),
            Ok(d) if self.is_dir(d) => {
                let name = self.nodes.get(&id).map(|n| n.name.clone()).unwrap_or_default();
                (d, name)
            }
            Ok(_) => return Err(VfsError::AlreadyExists(dst.to_owned())),
            Err(VfsError::NotFound(_)) => self.split_parent(dst)?,
            Err(e) => return Err(e),
        };
        if self.is_ancestor(id, new_parent) {
            return Err(VfsError::InvalidMove {
                src: src.to_owned(),
                dst: dst.to_owned(),
            });
        }
        if let Some(existing) = self.lookup(new_parent, &new_name) {
            if existing == id {
                return Ok(());
            }
            return Err(VfsError::AlreadyExists(dst.to_owned()));
        }
        self.detach(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.name = new_name;
            node.parent = Some(new_parent);
        }
        if let Some(NodeKind::Directory(children)) =
            self.nodes.get_mut(&new_parent).map(|n| &mut n.kind)
        {
            children.push(id);
        }
        Ok(())
    }

    /// Change the cwd; a file or a missing path leaves it untouched
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let id = self.resolve(path)?;
        if !self.is_dir(id) {
            return Err(VfsError::NotADirectory(path.to_owned()));
        }
        self.cwd = id;
        Ok(())
    }

    /// Immediate children of a directory, in insertion order
    pub fn list(&self, path: &str) -> Result<Vec<(String, EntryKind)>> {
        let id = self.resolve(path)?;
        let children = self
            .children(id)
            .ok_or_else(|| VfsError::NotADirectory(path.to_owned()))?;
        Ok(children
            .iter()
            .filter_map(|c| self.nodes.get(c))
            .map(|n| (n.name.clone(), n.entry_kind()))
            .collect())
    }

    /// Mutable content of the file at `id`
    pub fn file_mut(&mut self, id: NodeId) -> Option<&mut FileContent> {
        match &mut self.nodes.get_mut(&id)?.kind {
            NodeKind::File(content) => Some(content),
            NodeKind::Directory(_) => None,
        }
    }

    pub fn file(&self, id: NodeId) -> Option<&FileContent> {
        match &self.nodes.get(&id)?.kind {
            NodeKind::File(content) => Some(content),
            NodeKind::Directory(_) => None,
        }
    }
}
