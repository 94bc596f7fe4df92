use thiserror::Error;

use crate::Ref;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AllocError {
    /// Couldn't open the backing file
    #[error("Opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file
    #[error("Failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize to the backing file
    #[error("Synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't resize the backing file
    #[error(
        "Can't resize the backing file. Have 0x{size:x} bytes, wanted to get 0x{requested:x} bytes"
    )]
    ResizeFailed {
        size: usize,
        requested: usize,
        source: std::io::Error,
    },
    /// Couldn't allocate any more space
    #[error("Can't allocate any more memory map space. Tried to get 0x{requested:x} bytes")]
    AllocFailed {
        requested: usize,
        source: std::io::Error,
    },
    /// The allocator is out of addressable space and cannot grow further
    #[error("Out of memory: tried to allocate {0} bytes")]
    OutOfMemory(usize),
    /// A ref was translated against a region the allocator doesn't own
    #[error("Invalid ref 0x{0:x}: not within baseline or any known slab")]
    InvalidRef(Ref),
    /// `free()` was called with a ref/size pair that doesn't match any live allocation
    #[error("Tried to free ref 0x{0:x}, which was never allocated as described")]
    UnownedFree(Ref),
    /// The database or memory buffer doesn't look like a valid database
    #[error("Invalid database: {0}")]
    InvalidDatabase(&'static str),
    /// The mapping's decryption layer rejected a page on first touch
    #[error("Decryption failed for the mapped region")]
    DecryptionFailed,
    /// Other, miscellaneous errors
    #[error("Other: {0}")]
    Other(&'static str),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NodeError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// Index was outside `[0, size)`
    #[error("Index {index} out of bounds for node of size {size}")]
    IndexOutOfBounds { index: usize, size: usize },
    /// The node's header failed a basic sanity check
    #[error("Node data corrupted: {0}")]
    DataCorruption(&'static str),
    /// Attempted to mutate a node through a read-only ref without `copy_on_write()`
    #[error("Attempted to write through a read-only ref")]
    NotWritable,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ColumnError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// Index was outside `[0, size)`
    #[error("Index {index} out of bounds for column of size {size}")]
    IndexOutOfBounds { index: usize, size: usize },
    /// A value was too large to be written into this column's encoding
    #[error("Value too large to store: {0}")]
    ValueTooLarge(&'static str),
    /// A `Value` variant didn't match the column's declared type
    #[error("Value type does not match this column's declared type")]
    TypeMismatch,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GroupError {
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// No table with the given name exists
    #[error("No such table: {0}")]
    NoSuchTable(String),
    /// A table with the given name already exists
    #[error("Table already exists: {0}")]
    TableExists(String),
    /// An accessor was used after the structure it observed changed underneath it
    #[error("Accessor is stale: the table/column layout changed since it was created")]
    StaleAccessor,
    /// A durability mode that isn't implemented yet was requested
    #[error("Unsupported durability mode: {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransactLogError {
    /// The log stream ended or contained a byte sequence that doesn't decode
    #[error("Malformed transaction log: {0}")]
    Malformed(&'static str),
    /// An opcode byte didn't correspond to any known instruction
    #[error("Unrecognized transaction log opcode: {0}")]
    UnknownOpcode(u8),
    /// Replaying an instruction against the sink failed
    #[error(transparent)]
    Apply(#[from] GroupError),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SharedGroupError {
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    TransactLog(#[from] TransactLogError),
    /// The on-disk format version doesn't match what this build understands
    #[error("Invalid database: {0}")]
    InvalidDatabase(&'static str),
    /// The lockfile layout didn't match `format_version`
    #[error("Lockfile format mismatch: expected version {expected}, found {found}")]
    LockfileVersion { expected: u32, found: u32 },
    /// The previous `write_mutex` holder died without releasing it
    #[error("Previous writer died holding the write lock; state has been recovered")]
    DeadOwner,
    /// The robust mutex is permanently poisoned and cannot be recovered
    #[error("Write lock is not recoverable")]
    NotRecoverable,
    /// `compact()` was called while other readers were still attached
    #[error("Cannot compact while other readers are attached")]
    ReadersAttached,
    /// Misuse of the transaction API (e.g. committing a transaction twice)
    #[error("Logic error: {0}")]
    LogicError(&'static str),
}
