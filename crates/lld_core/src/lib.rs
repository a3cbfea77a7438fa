//! # LLD Core
//!
//! Sector key-value engine for chain state.
//!
//! This crate provides:
//! - Bloom filters over a fixed bit array for fast negative lookups
//! - Keychains indexing keys to sector locations (hashmap and filemap)
//! - Bounded value caches (LRU and LFU)
//! - Sector databases with journaled transactions and crash recovery
//! - A context of named instances with two-phase global commit
//!
//! ## Example
//!
//! ```rust
//! use lld_core::{Lld, LldConfig};
//! use lld_storage::MemoryVolume;
//! use std::sync::Arc;
//!
//! let lld = Lld::open_volume(
//!     Arc::new(MemoryVolume::new()),
//!     LldConfig::new().bucket_count(64).bloom(1_000, 0.01),
//! )
//! .unwrap();
//! let ledger = lld.ledger().unwrap();
//! ledger.write(b"height", b"42").unwrap();
//! assert_eq!(ledger.read(b"height").unwrap().as_deref(), Some(&b"42"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bloom;
pub mod cache;
mod codec;
mod config;
mod context;
pub mod coordinator;
#[cfg(feature = "std")]
mod dir;
mod error;
mod hash;
mod key;
pub mod keychain;
pub mod sector;
mod stats;
mod types;

pub use bloom::{BitArray, BloomFilter};
pub use cache::{LfuCache, LruCache, ValueCache};
pub use codec::{from_cbor, to_cbor};
pub use config::{
    BloomConfig, CacheConfig, CachePolicy, KeychainConfig, KeychainKind, LldConfig, SectorConfig,
    DEFAULT_BUCKETS, DEFAULT_CACHE_BYTES, DEFAULT_MAX_SECTOR_FILE_SIZE,
};
pub use context::{open_sector, Lld, Sector};
pub use coordinator::{
    CommitRecord, Coordinator, Instance, InstanceSet, Participant, RecoveryReport,
};
#[cfg(feature = "std")]
pub use dir::ContextDir;
pub use error::{CoreError, CoreResult};
pub use hash::{compute_crc32, xxh64};
pub use key::{SectorHeader, SectorKey, SectorState, MAX_KEY_LEN, SECTOR_KEY_HEADER};
pub use keychain::{FilemapKeychain, HashmapKeychain, KeyIndex};
pub use sector::{DatabaseInfo, Recovery, SectorDatabase};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use types::{SectorLocation, TransactionId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
