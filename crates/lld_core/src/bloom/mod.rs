//! Probabilistic key membership.
//!
//! Every instance keeps a [`BloomFilter`] in front of its keychain so that
//! reads of absent keys never touch the disk. The filter is written to
//! `_bloom.snapshot` on clean close and consumed on open; when the snapshot
//! is missing it is rebuilt from the keychain.

mod bits;
mod filter;

pub use bits::BitArray;
pub use filter::BloomFilter;
