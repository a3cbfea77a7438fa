//! # LLD Storage
//!
//! Storage backends and volumes for the LLD sector engine.
//!
//! This crate is the lowest layer of LLD. Backends are **opaque byte
//! stores**: they never interpret sector, keychain or journal formats.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, append, overwrite, flush)
//! - A [`Volume`] hands out backends by file name and owns renames/removals
//! - Everything is `Send + Sync` for concurrent access
//! - The engine owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Available Volumes
//!
//! - [`MemoryVolume`] - Named in-memory files that survive a simulated restart
//! - [`DirVolume`] - A directory on disk
//!
//! ## Example
//!
//! ```rust
//! use lld_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! backend.write_at(offset, b"HELLO").unwrap();
//! assert_eq!(&backend.read_at(offset, 11).unwrap(), b"HELLO world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod volume;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use volume::{DirVolume, MemoryVolume, Volume};
