use thiserror::Error;

/// Everything an engine call can fail with
#[derive(Error, Debug)]
pub enum VfsError {
    /// The path does not resolve
    #[error("'{0}' not found")]
    NotFound(String),
    /// A sibling with that name exists already
    #[error("'{0}' already exists")]
    AlreadyExists(String),
    /// The root directory cannot be deleted or moved
    #[error("'{0}' is protected and cannot be removed or moved")]
    ProtectedEntry(String),
    /// The destination lies inside the entry being moved
    #[error("cannot move '{src}' into '{dst}': destination is inside the source")]
    InvalidMove {
        /// Path being moved
        src: String,
        /// Requested destination
        dst: String,
    },
    /// A path component or target is a file where a directory is needed
    #[error("'{0}' is not a directory")]
    NotADirectory(String),
    /// A content operation was issued on a directory
    #[error("'{0}' is not a file")]
    NotAFile(String),
    /// The name is empty, a dot entry, or contains a separator
    #[error("invalid name '{0}'")]
    InvalidName(String),
    /// Offset or length outside the file
    #[error("range error: {0}")]
    RangeError(String),
    /// Requested file size is not representable
    #[error("invalid size {0}")]
    InvalidSize(i64),
    /// The block store cannot hold the request
    #[error("out of space: {requested} bytes requested, {available} bytes free")]
    OutOfSpace {
        /// Bytes the operation needed
        requested: usize,
        /// Bytes still free in the store
        available: usize,
    },
    /// Access past the capacity of a block; always an engine bug
    #[error("block {block_id}: access [{offset}, {end}) beyond capacity {capacity}")]
    BlockBoundsError {
        /// Block addressed
        block_id: usize,
        /// First byte addressed
        offset: usize,
        /// One past the last byte addressed
        end: usize,
        /// Block capacity
        capacity: usize,
    },
    /// The persisted image does not describe a consistent file system
    #[error("corrupt image: {0}")]
    CorruptImage(String),
    /// Host I/O failed while persisting
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the engine
pub type Result<T> = core::result::Result<T, VfsError>;
