//! Sector database instances.
//!
//! - [`SectorDatabase`] - the per-instance façade
//! - `files` - `_block.NNNNN` value storage
//! - [`journal`] - the commit journal and its recovery classification
//! - `txn` - buffered state of an open transaction

mod database;
mod files;
pub mod journal;
mod txn;

pub use database::{DatabaseInfo, Recovery, SectorDatabase, BLOOM_SNAPSHOT};
pub use files::sector_file_name;
pub use journal::{JournalOp, JournalState, JOURNAL_FILE};
pub use txn::TxnPhase;
