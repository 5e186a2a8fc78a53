/**
 * Vault configuration, loaded from TOML.
 */
pub mod config;
/**
 * Cryptographic types and operations.
 *  - The vault key and ChaCha20-Poly1305 sealing
 *  - The entry cipher the tree is constructed with
 */
pub mod crypto;
/**
 * Plain value objects that cross the crypto
 *  boundary, and version timestamps.
 */
pub mod entry;
/**
 * Path-oriented façade over the tree, what
 *  a shell talks to.
 */
pub mod internal_fs;
/**
 * Flat blob directories, on disk or in memory.
 */
pub mod storage;
/**
 * The versioned node graph, its compressed
 *  index snapshots and load-time crash recovery.
 */
pub mod tree;

pub mod prelude {
    pub use crate::config::{OrphanPolicy, VaultConfig};
    pub use crate::crypto::{EntryCipher, Secret, SecretCipher};
    pub use crate::entry::{Entry, EntryType, Timestamp, ROOT_ID};
    pub use crate::internal_fs::{ChangeOptions, FsError, InternalFs, MakeOptions, RemoveOptions};
    pub use crate::storage::{BlobStorage, FsStorage, MemoryStorage, StorageError};
    pub use crate::tree::{Alert, AlertKind, Tree, TreeError, TreeStatus};
}
