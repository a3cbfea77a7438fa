//! # LLD Testkit
//!
//! Test utilities for LLD.
//!
//! This crate provides:
//! - Test fixtures and context helpers
//! - Property-based test generators using proptest
//! - Crash injection over in-memory volumes
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust
//! use lld_testkit::prelude::*;
//!
//! with_temp_context(|lld| {
//!     let ledger = lld.ledger().unwrap();
//!     ledger.write(b"height", b"1").unwrap();
//!     assert_eq!(ledger.read(b"height").unwrap(), Some(b"1".to_vec()));
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::{snapshot, ContextSnapshot, CrashRecoveryHarness, CrashVolume};
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
