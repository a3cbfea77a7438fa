//! Core type definitions.

use std::fmt;

/// Unique identifier for a transaction.
///
/// Per-instance transactions and global transactions draw from separate
/// counters; a journal records both so recovery can match it to a global
/// commit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Location of a value inside an instance's sector files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorLocation {
    /// Sector file number (`_block.NNNNN`).
    pub file: u16,
    /// Byte offset within the file.
    pub offset: u32,
    /// Length of the value in bytes.
    pub len: u32,
}

impl fmt::Display for SectorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.file, self.offset, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(TransactionId::new(7).to_string(), "txn:7");
        let loc = SectorLocation {
            file: 2,
            offset: 64,
            len: 5,
        };
        assert_eq!(loc.to_string(), "2@64+5");
    }
}
