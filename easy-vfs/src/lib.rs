//!An easy virtual file system over a simulated block store
#![deny(missing_docs)]

/// Default block size of a fresh store, in bytes
pub const BLOCK_SZ: usize = 32;
/// Default number of blocks of a fresh store
pub const BLOCK_COUNT: usize = 256;

mod block_store;
mod content;
mod error;
mod image;
mod layout;
mod namespace;
mod vfs;

pub use block_store::{BlockInfo, BlockStatus, BlockStore, Segment};
pub use error::{Result, VfsError};
pub use image::{HostImage, ImageDevice, MemoryImage};
pub use namespace::{EntryKind, NodeId};
pub use vfs::{FileHandle, FsConfig, Stat, VirtualFs};
