use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::error::Result;

/// Durable home of a serialized file system image
pub trait ImageDevice: Send + Sync {
    /// Read the last stored image, `None` if nothing was stored yet
    fn load(&self) -> Result<Option<Vec<u8>>>;
    /// Replace the stored image; either the old or the new image survives a failure
    fn store(&self, bytes: &[u8]) -> Result<()>;
}

/// Image kept in a file on the host
#[derive(Debug, Clone)]
pub struct HostImage {
    path: PathBuf,
}

impl HostImage {
    /// Use `path` as the image file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the image file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut p = OsString::from(self.path.as_os_str());
        p.push(".tmp");
        p.into()
    }
}

impl ImageDevice for HostImage {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, bytes: &[u8]) -> Result<()> {
        let tmp = self.tmp_path();
        {
            let mut f = File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        // readers see either the old or the new image, never a torn one
        fs::rename(&tmp, &self.path)?;
        log::trace!("image: {}B -> {}", bytes.len(), self.path.display());
        Ok(())
    }
}

/// Image held in process memory
#[derive(Debug, Default)]
pub struct MemoryImage(Mutex<Option<Vec<u8>>>);

impl MemoryImage {
    /// An empty image
    pub fn new() -> Self {
        Self::default()
    }

    /// An image preloaded with `bytes`
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self(Mutex::new(Some(bytes)))
    }

    /// Copy of the stored bytes
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.0.lock().ok().and_then(|g| g.clone())
    }
}

impl ImageDevice for MemoryImage {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        let guard = self
            .0
            .lock()
            .map_err(|_| io::Error::other("memory image lock poisoned"))?;
        Ok(guard.clone())
    }

    fn store(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| io::Error::other("memory image lock poisoned"))?;
        *guard = Some(bytes.to_vec());
        Ok(())
    }
}
