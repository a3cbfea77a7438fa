//! Property-based test generators using proptest.
//!
//! Provides strategies for generating keys, values and operation
//! sequences that stay inside the engine's limits.

use lld_core::{CoreResult, Instance, InstanceSet, KeyIndex, Lld, SectorDatabase, ValueCache};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for keys drawn from a small pool, so operations collide.
pub fn pooled_key_strategy(pool: u8) -> impl Strategy<Value = Vec<u8>> {
    (0..pool.max(1)).prop_map(|i| format!("key:{i:03}").into_bytes())
}

/// Strategy for arbitrary keys up to `max_len` bytes.
pub fn key_strategy(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=max_len.max(1))
}

/// Strategy for values, including empty ones.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Strategy for a single instance.
pub fn instance_strategy() -> impl Strategy<Value = Instance> {
    prop::sample::select(Instance::ALL.to_vec())
}

/// Strategy for a non-empty instance set.
pub fn instance_set_strategy() -> impl Strategy<Value = InstanceSet> {
    prop::collection::vec(instance_strategy(), 1..=Instance::ALL.len())
        .prop_map(|instances| instances.into_iter().collect())
}

/// One step against a sector database.
#[derive(Debug, Clone)]
pub enum SectorOperation {
    /// Write a value
    Write {
        /// Key
        key: Vec<u8>,
        /// Value
        value: Vec<u8>,
    },
    /// Write a key with an empty value
    WriteKey {
        /// Key
        key: Vec<u8>,
    },
    /// Erase a key
    Erase {
        /// Key
        key: Vec<u8>,
    },
    /// Read a key
    Read {
        /// Key
        key: Vec<u8>,
    },
}

/// Strategy for generating sector operations over a pool of keys.
pub fn sector_operation_strategy(pool: u8) -> impl Strategy<Value = SectorOperation> {
    prop_oneof![
        4 => (pooled_key_strategy(pool), value_strategy())
            .prop_map(|(key, value)| SectorOperation::Write { key, value }),
        1 => pooled_key_strategy(pool).prop_map(|key| SectorOperation::WriteKey { key }),
        2 => pooled_key_strategy(pool).prop_map(|key| SectorOperation::Erase { key }),
        2 => pooled_key_strategy(pool).prop_map(|key| SectorOperation::Read { key }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    pool: u8,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<SectorOperation>> {
    prop::collection::vec(sector_operation_strategy(pool), min_ops..max_ops)
}

/// Applies `op` to both `db` and a model map, returning what a read saw
/// and what the model expected.
///
/// # Errors
///
/// Returns the database error that stopped the operation.
pub fn apply_operation<K: KeyIndex, C: ValueCache>(
    db: &SectorDatabase<K, C>,
    model: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    op: &SectorOperation,
) -> CoreResult<Option<(Option<Vec<u8>>, Option<Vec<u8>>)>> {
    match op {
        SectorOperation::Write { key, value } => {
            db.write(key, value)?;
            model.insert(key.clone(), value.clone());
        }
        SectorOperation::WriteKey { key } => {
            db.write_key(key)?;
            model.insert(key.clone(), Vec::new());
        }
        SectorOperation::Erase { key } => {
            let erased = db.erase(key)?;
            let expected = model.remove(key).is_some();
            if erased != expected {
                return Ok(Some((
                    Some(vec![u8::from(erased)]),
                    Some(vec![u8::from(expected)]),
                )));
            }
        }
        SectorOperation::Read { key } => {
            return Ok(Some((db.read(key)?, model.get(key).cloned())));
        }
    }
    Ok(None)
}

/// Writes one entry into every instance in `scope` inside a global
/// transaction.
///
/// # Errors
///
/// Returns the first begin, write or commit error.
pub fn write_across(lld: &Lld, scope: InstanceSet, key: &[u8], value: &[u8]) -> CoreResult<()> {
    lld.txn_begin(scope)?;
    for instance in scope.iter() {
        if let Err(e) = lld.instance(instance).and_then(|db| db.write(key, value)) {
            lld.txn_abort()?;
            return Err(e);
        }
    }
    lld.txn_commit()
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{small_config, TestContext};

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn pooled_keys_stay_in_pool(key in pooled_key_strategy(5)) {
            let text = String::from_utf8(key).unwrap();
            prop_assert!(["key:000", "key:001", "key:002", "key:003", "key:004"].contains(&text.as_str()));
        }

        #[test]
        fn instance_sets_are_not_empty(set in instance_set_strategy()) {
            prop_assert!(!set.is_empty());
        }

        #[test]
        fn ledger_matches_model(ops in operation_sequence_strategy(12, 1, 60)) {
            let ctx = TestContext::memory_with(small_config(InstanceSet::empty().with(Instance::Ledger)));
            let ledger = ctx.ledger().unwrap();
            let mut model = BTreeMap::new();
            for op in &ops {
                if let Some((seen, expected)) = apply_operation(&**ledger, &mut model, op).unwrap() {
                    prop_assert_eq!(seen, expected);
                }
            }
        }

        #[test]
        fn global_writes_reach_every_instance(scope in instance_set_strategy()) {
            let ctx = TestContext::memory();
            write_across(&ctx, scope, b"shared", b"v").unwrap();
            for instance in Instance::ALL {
                let seen = ctx.instance(instance).unwrap().read(b"shared").unwrap();
                prop_assert_eq!(seen.is_some(), scope.contains(instance));
            }
        }
    }
}
