use std::sync::Arc;

use crate::{
    block_store::{BlockInfo, BlockStatus, BlockStore},
    content::FileContent,
    error::{Result, VfsError},
    image::ImageDevice,
    layout,
    namespace::{EntryKind, Namespace, NodeId, NodeKind, ROOT},
    BLOCK_COUNT, BLOCK_SZ,
};

/// Geometry of a freshly formatted store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsConfig {
    /// Bytes per block
    pub block_size: usize,
    /// Number of blocks; fixed for the life of the image
    pub block_count: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SZ,
            block_count: BLOCK_COUNT,
        }
    }
}

/// Summary of one entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    /// Absolute path
    pub path: String,
    /// File or directory
    pub kind: EntryKind,
    /// Logical size in bytes, or number of children for a directory
    pub size: usize,
    /// Blocks backing a file, in logical order
    pub blocks: Vec<usize>,
}

/// The engine: namespace, block store and the device they persist to
pub struct VirtualFs {
    store: BlockStore,
    ns: Namespace,
    device: Arc<dyn ImageDevice>,
}

impl VirtualFs {
    /// Format a new empty file system on `device`, overwriting whatever it held
    pub fn format(device: Arc<dyn ImageDevice>, config: FsConfig) -> Result<Self> {
        if config.block_size == 0 {
            return Err(VfsError::InvalidSize(0));
        }
        let fs = Self {
            store: BlockStore::new(config.block_size, config.block_count),
            ns: Namespace::new(),
            device,
        };
        fs.save()?;
        log::info!(
            "formatted: {} blocks of {}B",
            config.block_count,
            config.block_size
        );
        Ok(fs)
    }

    /// Load the image stored on `device`
    pub fn load(device: Arc<dyn ImageDevice>) -> Result<Self> {
        let bytes = device
            .load()?
            .ok_or_else(|| VfsError::CorruptImage("no image stored".into()))?;
        Self::from_image(device, &bytes)
    }

    fn from_image(device: Arc<dyn ImageDevice>, bytes: &[u8]) -> Result<Self> {
        let (store, ns) = layout::decode(bytes)?;
        log::info!(
            "loaded: {} nodes, {}/{} blocks in use",
            ns.nodes().len(),
            store.block_count() - store.free_blocks(),
            store.block_count()
        );
        Ok(Self { store, ns, device })
    }

    /// Load the stored image, or format one with `config` if the device is empty
    pub fn mount(device: Arc<dyn ImageDevice>, config: FsConfig) -> Result<Self> {
        let Some(bytes) = device.load()? else {
            return Self::format(device, config);
        };
        let fs = Self::from_image(device, &bytes)?;
        if fs.config() != config {
            log::warn!(
                "image geometry {:?} differs from requested {:?}; using the image",
                fs.config(),
                config
            );
        }
        Ok(fs)
    }

    /// Flush one last time and drop the engine
    pub fn close(self) -> Result<()> {
        self.save()
    }

    /// Write the current state to the device
    pub fn save(&self) -> Result<()> {
        let bytes = layout::encode(&self.store, &self.ns)?;
        self.device.store(&bytes)?;
        log::debug!("saved {}B image", bytes.len());
        Ok(())
    }

    /// Geometry of the underlying store
    pub fn config(&self) -> FsConfig {
        FsConfig {
            block_size: self.store.block_size(),
            block_count: self.store.block_count(),
        }
    }

    /// Read-only view of the block store
    pub fn block_store(&self) -> &BlockStore {
        &self.store
    }

    /// Check every structural invariant of the live state
    pub fn fsck(&self) -> Result<()> {
        layout::check_consistency(&self.store, &self.ns)
    }

    /// Run a mutating operation and persist it; on any failure the state
    /// reverts to what it was before the call.
    ///
    /// The block store journals only the blocks the operation touches; the
    /// namespace holds metadata alone and is copied whole.
    fn commit<T>(
        &mut self,
        op: impl FnOnce(&mut BlockStore, &mut Namespace) -> Result<T>,
    ) -> Result<T> {
        let ns = self.ns.clone();
        self.store.checkpoint();
        let result = op(&mut self.store, &mut self.ns).and_then(|v| self.save().map(|_| v));
        match &result {
            Ok(_) => self.store.release_checkpoint(),
            Err(e) => {
                log::warn!("rolled back: {}", e);
                self.store.restore_checkpoint();
                self.ns = ns;
            }
        }
        result
    }

    fn modify_file<T>(
        &mut self,
        id: NodeId,
        op: impl FnOnce(&mut FileContent, &mut BlockStore) -> Result<T>,
    ) -> Result<T> {
        self.commit(|store, ns| {
            let path = ns.path_of(id);
            let content = ns.file_mut(id).ok_or(VfsError::NotAFile(path))?;
            op(content, store)
        })
    }

    /// Create an empty file
    pub fn create(&mut self, path: &str) -> Result<()> {
        self.commit(|_, ns| ns.create_file(path).map(|_| ()))
    }

    /// Create an empty directory
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.commit(|_, ns| ns.mkdir(path).map(|_| ()))
    }

    /// Delete a file, or a directory with everything below it
    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.commit(|store, ns| ns.delete(path, store))
    }

    /// Move or rename an entry
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        self.commit(|_, ns| ns.rename(src, dst))
    }

    /// Change the current directory; not persisted on its own
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        self.ns.chdir(path)
    }

    /// Names from the root to the current directory
    pub fn cwd(&self) -> Vec<String> {
        self.ns.components(self.ns.cwd())
    }

    /// Current directory as an absolute path
    pub fn pwd(&self) -> String {
        self.ns.path_of(self.ns.cwd())
    }

    /// Children of a directory, in insertion order
    pub fn list(&self, path: &str) -> Result<Vec<(String, EntryKind)>> {
        self.ns.list(path)
    }

    /// Open a file for content operations
    pub fn open(&mut self, path: &str) -> Result<FileHandle<'_>> {
        let id = self.ns.resolve(path)?;
        if self.ns.file(id).is_none() {
            return Err(VfsError::NotAFile(path.to_owned()));
        }
        Ok(FileHandle { fs: self, id })
    }

    /// Describe one entry
    pub fn stat(&self, path: &str) -> Result<Stat> {
        let id = self.ns.resolve(path)?;
        let node = self
            .ns
            .node(id)
            .ok_or_else(|| VfsError::NotFound(path.to_owned()))?;
        let (size, blocks) = match &node.kind {
            NodeKind::File(content) => (
                content.size(),
                content.segments().iter().map(|s| s.block_id).collect(),
            ),
            NodeKind::Directory(children) => (children.len(), Vec::new()),
        };
        Ok(Stat {
            path: self.ns.path_of(id),
            kind: node.entry_kind(),
            size,
            blocks,
        })
    }

    /// Every block with its status, ascending by id
    pub fn snapshot(&self) -> Vec<BlockInfo> {
        self.store.snapshot()
    }

    /// Human-readable block ownership table
    pub fn memory_map(&self) -> String {
        let used = self.store.block_count() - self.store.free_blocks();
        let mut out = format!(
            "Memory map: {}B blocks, {}/{} in use",
            self.store.block_size(),
            used,
            self.store.block_count()
        );
        for info in self.store.snapshot() {
            let line = match info.status {
                BlockStatus::Free => format!("\n[{:>4}] free", info.id),
                BlockStatus::Owned { file, segment } => format!(
                    "\n[{:>4}] {} #{} ({}/{})",
                    info.id,
                    self.ns.path_of(file),
                    segment,
                    info.used,
                    self.store.block_size()
                ),
            };
            out.push_str(&line);
        }
        out
    }

    /// Indented listing of the whole namespace
    pub fn tree(&self) -> String {
        let mut out = String::from("/");
        self.tree_at(ROOT, 0, &mut out);
        out
    }

    fn tree_at(&self, id: NodeId, depth: usize, out: &mut String) {
        let Some(children) = self.ns.children(id) else {
            return;
        };
        for &child in children {
            let Some(node) = self.ns.node(child) else {
                continue;
            };
            out.push('\n');
            for _ in 0..depth {
                out.push_str("    ");
            }
            let entry = match &node.kind {
                NodeKind::Directory(_) => format!("+-- {}/", node.name),
                NodeKind::File(content) => format!(
                    "+-- {} {}B [{} blocks]",
                    node.name,
                    content.size(),
                    content.segments().len()
                ),
            };
            out.push_str(&entry);
            self.tree_at(child, depth + 1, out);
        }
    }
}

/// An open file; every mutation is persisted before it returns
pub struct FileHandle<'a> {
    fs: &'a mut VirtualFs,
    id: NodeId,
}

impl FileHandle<'_> {
    fn content(&self) -> Result<&FileContent> {
        self.fs
            .ns
            .file(self.id)
            .ok_or_else(|| VfsError::NotAFile(self.path()))
    }

    /// Absolute path of the file
    pub fn path(&self) -> String {
        self.fs.ns.path_of(self.id)
    }

    /// Logical size in bytes
    pub fn size(&self) -> Result<usize> {
        Ok(self.content()?.size())
    }

    /// Whole content
    pub fn read(&self) -> Result<Vec<u8>> {
        self.content()?.read_all(&self.fs.store)
    }

    /// Up to `len` bytes from `start`; clamped at the end of the file
    pub fn read_range(&self, start: usize, len: usize) -> Result<Vec<u8>> {
        self.content()?.read_range(&self.fs.store, start, len)
    }

    /// Append bytes in new blocks, leaving existing blocks alone
    pub fn write_append(&mut self, bytes: &[u8]) -> Result<()> {
        let id = self.id;
        self.fs
            .modify_file(id, |c, store| c.write_append(store, id, bytes))
    }

    /// Overwrite at `index`, zero-filling any gap past the end
    pub fn write_at(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        let id = self.id;
        self.fs
            .modify_file(id, |c, store| c.write_at(store, id, index, bytes))
    }

    /// Shrink or zero-extend to `size` bytes
    pub fn truncate(&mut self, size: usize) -> Result<()> {
        let id = self.id;
        self.fs
            .modify_file(id, |c, store| c.truncate(store, id, size))
    }

    /// Move `[start, start + len)` to `target`, measured with the range removed
    pub fn move_within(&mut self, start: usize, len: usize, target: usize) -> Result<()> {
        let id = self.id;
        self.fs
            .modify_file(id, |c, store| c.move_within(store, id, start, len, target))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::{HostImage, MemoryImage};

    fn fresh(block_size: usize, block_count: usize) -> (VirtualFs, Arc<MemoryImage>) {
        let img = Arc::new(MemoryImage::new());
        let fs = VirtualFs::format(
            img.clone(),
            FsConfig {
                block_size,
                block_count,
            },
        )
        .unwrap();
        (fs, img)
    }

    fn read_string(fs: &mut VirtualFs, path: &str) -> String {
        String::from_utf8(fs.open(path).unwrap().read().unwrap()).unwrap()
    }

    fn names(fs: &VirtualFs, path: &str) -> Vec<String> {
        fs.list(path).unwrap().into_iter().map(|(n, _)| n).collect()
    }

    /// Device whose stores can be made to fail
    #[derive(Default)]
    struct FlakyImage {
        inner: MemoryImage,
        fail: AtomicBool,
        loads: AtomicUsize,
    }

    impl ImageDevice for FlakyImage {
        fn load(&self) -> Result<Option<Vec<u8>>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load()
        }

        fn store(&self, bytes: &[u8]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("disk on fire").into());
            }
            self.inner.store(bytes)
        }
    }

    #[test]
    fn content_scenarios() {
        let (mut fs, _) = fresh(4, 64);
        fs.create("a.txt").unwrap();
        let mut f = fs.open("a.txt").unwrap();
        f.write_append(b"hello").unwrap();
        assert_eq!(f.read().unwrap(), b"hello");
        f.write_at(2, b"XY").unwrap();
        assert_eq!(f.read().unwrap(), b"heXYo");
        f.truncate(3).unwrap();
        assert_eq!(f.read().unwrap(), b"heX");
        f.truncate(6).unwrap();
        assert_eq!(f.read().unwrap(), b"heX\0\0\0");
        assert_eq!(f.read_range(6, 4).unwrap(), b"");
        f.truncate(0).unwrap();
        assert_eq!(f.size().unwrap(), 0);
        f.write_append(b"abcdef").unwrap();
        f.move_within(1, 2, 3).unwrap();
        assert_eq!(f.read().unwrap(), b"adebcf");
        fs.fsck().unwrap();
    }

    #[test]
    fn move_between_directories() {
        let (mut fs, _) = fresh(8, 32);
        fs.mkdir("docs").unwrap();
        fs.chdir("docs").unwrap();
        assert_eq!(fs.cwd(), vec!["docs"]);
        fs.create("notes.txt").unwrap();
        assert_eq!(names(&fs, "."), vec!["notes.txt"]);
        fs.rename("notes.txt", "/notes.txt").unwrap();
        assert!(names(&fs, ".").is_empty());
        assert_eq!(names(&fs, "/"), vec!["docs", "notes.txt"]);
        assert_eq!(fs.pwd(), "/docs");
        fs.fsck().unwrap();
    }

    #[test]
    fn open_errors() {
        let (mut fs, _) = fresh(8, 8);
        fs.mkdir("d").unwrap();
        assert!(matches!(fs.open("d"), Err(VfsError::NotAFile(_))));
        assert!(matches!(fs.open("nope"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn out_of_space_leaves_state_untouched() {
        let (mut fs, img) = fresh(4, 4);
        fs.create("f").unwrap();
        fs.open("f").unwrap().write_append(b"0123456789").unwrap();
        let before = img.bytes();
        let map = fs.memory_map();
        let err = fs.open("f").unwrap().write_at(8, b"abcdefghij").unwrap_err();
        assert!(matches!(err, VfsError::OutOfSpace { .. }));
        assert_eq!(read_string(&mut fs, "f"), "0123456789");
        assert_eq!(fs.memory_map(), map);
        assert_eq!(img.bytes(), before);
        fs.fsck().unwrap();
    }

    #[test]
    fn failed_save_rolls_back() {
        let img = Arc::new(FlakyImage::default());
        let mut fs = VirtualFs::format(img.clone(), FsConfig::default()).unwrap();
        fs.create("keep").unwrap();
        img.fail.store(true, Ordering::SeqCst);
        assert!(matches!(fs.create("lost"), Err(VfsError::Io(_))));
        assert!(fs.open("keep").unwrap().write_append(b"zz").is_err());
        assert_eq!(names(&fs, "/"), vec!["keep"]);
        assert_eq!(fs.open("keep").unwrap().size().unwrap(), 0);
        assert_eq!(fs.block_store().free_blocks(), BLOCK_COUNT);
        img.fail.store(false, Ordering::SeqCst);
        let fs = VirtualFs::load(img).unwrap();
        assert_eq!(names(&fs, "/"), vec!["keep"]);
    }

    #[test]
    fn mount_reads_the_device_once() {
        let img = Arc::new(FlakyImage::default());
        let mut fs = VirtualFs::mount(img.clone(), FsConfig::default()).unwrap();
        assert_eq!(img.loads.load(Ordering::SeqCst), 1);
        fs.create("f").unwrap();
        let fs = VirtualFs::mount(img.clone(), FsConfig::default()).unwrap();
        assert_eq!(img.loads.load(Ordering::SeqCst), 2);
        assert_eq!(names(&fs, "/"), vec!["f"]);
    }

    #[test]
    fn huge_offsets_are_errors_not_panics() {
        let (mut fs, img) = fresh(4, 16);
        fs.create("f").unwrap();
        fs.open("f").unwrap().write_append(b"ab").unwrap();
        let before = img.bytes();
        let mut f = fs.open("f").unwrap();
        assert!(matches!(f.truncate(usize::MAX), Err(VfsError::OutOfSpace { .. })));
        assert!(matches!(f.write_at(usize::MAX, b"xy"), Err(VfsError::RangeError(_))));
        assert!(matches!(
            f.read_range(usize::MAX, 1),
            Err(VfsError::RangeError(_))
        ));
        assert_eq!(f.read().unwrap(), b"ab");
        assert_eq!(img.bytes(), before);
        fs.fsck().unwrap();
    }

    #[test]
    fn failed_content_op_restores_touched_blocks() {
        let (mut fs, img) = fresh(4, 6);
        fs.create("a").unwrap();
        fs.create("b").unwrap();
        fs.open("a").unwrap().write_append(b"aaaaaaaaa").unwrap();
        fs.open("b").unwrap().write_append(b"0123").unwrap();
        fs.delete("a").unwrap();
        fs.create("c").unwrap();
        fs.open("c").unwrap().write_append(b"cc").unwrap();
        fs.open("b").unwrap().write_append(b"456789").unwrap();
        assert_eq!(fs.block_store().free_blocks(), 2);
        let map = fs.memory_map();
        let before = img.bytes();
        // three cuts inside blocks need three fresh blocks; two are free
        let mut f = fs.open("b").unwrap();
        assert!(matches!(
            f.move_within(1, 2, 4),
            Err(VfsError::OutOfSpace { .. })
        ));
        assert_eq!(f.read().unwrap(), b"0123456789");
        assert_eq!(fs.memory_map(), map);
        assert_eq!(img.bytes(), before);
        assert_eq!(fs.block_store().free_blocks(), 2);
        fs.fsck().unwrap();
        // the same cuts with the target on a segment boundary fit
        fs.open("b").unwrap().move_within(1, 2, 2).unwrap();
        assert_eq!(read_string(&mut fs, "b"), "0312456789");
        fs.fsck().unwrap();
    }

    #[test]
    fn every_mutation_is_durable() {
        let (mut fs, img) = fresh(4, 64);
        fs.mkdir("d").unwrap();
        fs.create("d/f").unwrap();
        fs.open("d/f").unwrap().write_append(b"persist me").unwrap();
        fs.chdir("d").unwrap();
        // no explicit save: the last content op already flushed
        let mut again = VirtualFs::load(img.clone()).unwrap();
        assert_eq!(read_string(&mut again, "/d/f"), "persist me");
        assert_eq!(again.snapshot(), fs.snapshot());
        assert_eq!(again.tree(), fs.tree());
    }

    #[test]
    fn round_trip_through_host_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!("easy-vfs-{}.img", rand::random::<u64>()));
        let device = Arc::new(HostImage::new(&path));
        let mut fs = VirtualFs::mount(device.clone(), FsConfig::default())?;
        fs.mkdir("a")?;
        fs.mkdir("a/b")?;
        fs.create("a/b/c.txt")?;
        fs.open("a/b/c.txt")?.write_append(&[7u8; 200])?;
        fs.create("top")?;
        fs.open("top")?.write_at(3, b"xyz")?;
        fs.open("a/b/c.txt")?.move_within(10, 50, 100)?;
        fs.chdir("a/b")?;
        fs.save()?;

        let mut back = VirtualFs::mount(device, FsConfig { block_size: 8, block_count: 1 })?;
        assert_eq!(back.config(), FsConfig::default());
        assert_eq!(back.tree(), fs.tree());
        assert_eq!(back.snapshot(), fs.snapshot());
        assert_eq!(back.open("/top")?.read()?, b"\0\0\0xyz");
        assert_eq!(back.open("c.txt")?.read()?, vec![7u8; 200]);
        back.fsck()?;
        back.close()?;
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn corrupt_image_is_rejected() {
        let img = Arc::new(MemoryImage::with_bytes(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(matches!(VirtualFs::load(img), Err(VfsError::CorruptImage(_))));
        assert!(matches!(
            VirtualFs::load(Arc::new(MemoryImage::new())),
            Err(VfsError::CorruptImage(_))
        ));
    }

    #[test]
    fn delete_directory_frees_all_blocks() {
        let (mut fs, _) = fresh(4, 32);
        fs.mkdir("d").unwrap();
        fs.mkdir("d/e").unwrap();
        for (i, p) in ["d/x", "d/e/y", "d/e/z"].into_iter().enumerate() {
            fs.create(p).unwrap();
            fs.open(p).unwrap().write_append(&vec![b'a'; 5 * (i + 1)]).unwrap();
        }
        fs.create("keep").unwrap();
        fs.open("keep").unwrap().write_append(b"kk").unwrap();
        fs.delete("d").unwrap();
        assert_eq!(fs.block_store().free_blocks(), 31);
        assert_eq!(names(&fs, "/"), vec!["keep"]);
        assert!(matches!(fs.delete("/"), Err(VfsError::ProtectedEntry(_))));
        fs.fsck().unwrap();
    }

    #[test]
    fn memory_map_reports_owners() {
        let (mut fs, _) = fresh(4, 3);
        fs.mkdir("docs").unwrap();
        fs.create("docs/a.txt").unwrap();
        fs.open("docs/a.txt").unwrap().write_append(b"hello").unwrap();
        assert_eq!(
            fs.memory_map(),
            "Memory map: 4B blocks, 2/3 in use\n\
             [   0] /docs/a.txt #0 (4/4)\n\
             [   1] /docs/a.txt #1 (1/4)\n\
             [   2] free"
        );
    }

    #[test]
    fn no_block_is_aliased_after_random_ops() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let (mut fs, _) = fresh(3, 2048);
        let files = ["f0", "f1", "f2", "f3"];
        for f in files {
            fs.create(f).unwrap();
        }
        for _ in 0..200 {
            let f = files[rng.gen_range(0..files.len())];
            let mut h = fs.open(f).unwrap();
            let size = h.size().unwrap();
            match rng.gen_range(0..4) {
                0 => h.write_append(&vec![b'x'; rng.gen_range(0..10)]).unwrap(),
                1 => h.write_at(rng.gen_range(0..=size + 4), b"abcde").unwrap(),
                2 => h.truncate(rng.gen_range(0..=size + 2)).unwrap(),
                _ => {
                    let start = rng.gen_range(0..=size);
                    let len = rng.gen_range(0..=size - start);
                    let target = rng.gen_range(0..=size - len);
                    h.move_within(start, len, target).unwrap();
                }
            }
            fs.fsck().unwrap();
            let mut owners = std::collections::BTreeSet::new();
            for info in fs.snapshot() {
                if let BlockStatus::Owned { file, segment } = info.status {
                    assert!(owners.insert((file, segment)));
                }
            }
        }
    }
}
