//! Stress tests for LLD.
//!
//! These helpers drive a sector database or a whole context under heavy
//! load and concurrent access.

use lld_core::{CoreError, InstanceSet, Lld, Sector};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Size of each value in bytes.
    pub value_size: usize,
    /// Number of distinct keys.
    pub key_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            value_size: 256,
            key_count: 1_000,
        }
    }
}

fn stress_key(i: usize) -> Vec<u8> {
    format!("stress:{i:08}").into_bytes()
}

/// Writes every key once, returning how many writes failed.
fn populate(db: &Sector, config: &StressConfig) -> usize {
    let value = vec![0xABu8; config.value_size];
    (0..config.key_count)
        .filter(|&i| db.write(&stress_key(i), &value).is_err())
        .count()
}

/// Run a sequential write stress test.
pub fn stress_sequential_writes(db: &Sector, config: &StressConfig) -> StressTestResult {
    let value = vec![0xABu8; config.value_size];

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        match db.write(&stress_key(i % config.key_count.max(1)), &value) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a sequential read stress test.
///
/// Failed populate writes count as failed operations.
pub fn stress_sequential_reads(db: &Sector, config: &StressConfig) -> StressTestResult {
    let mut failed = populate(db, config);

    let start = Instant::now();
    let mut successful = 0usize;

    for i in 0..config.operations {
        match db.read(&stress_key(i % config.key_count.max(1))) {
            Ok(Some(_)) => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a mixed write, read and erase stress test.
pub fn stress_mixed_operations(db: &Sector, config: &StressConfig) -> StressTestResult {
    let value = vec![0xABu8; config.value_size];

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let key = stress_key(i % config.key_count.max(1));
        let result = match i % 3 {
            0 => db.write(&key, &value),
            1 => db.read(&key).map(|_| ()),
            _ => db.erase(&key).map(|_| ()),
        };

        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run readers on several threads while one thread rewrites every key.
///
/// A read fails if it returns anything other than one of the two values
/// the writer alternates between.
pub fn stress_concurrent_reads(db: Arc<Sector>, config: &StressConfig) -> StressTestResult {
    let populate_failures = populate(&db, config);
    let old = vec![0xABu8; config.value_size];
    let new = vec![0xCDu8; config.value_size + 7];

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(populate_failures));
    let ops_per_thread = config.operations / config.threads.max(1);
    let key_count = config.key_count.max(1);

    let start = Instant::now();

    let writer = {
        let db = Arc::clone(&db);
        let new = new.clone();
        thread::spawn(move || {
            for i in 0..key_count {
                let _ = db.write(&stress_key(i), &new);
            }
        })
    };

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let db = Arc::clone(&db);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let (old, new) = (old.clone(), new.clone());

            thread::spawn(move || {
                for i in 0..ops_per_thread {
                    let key = stress_key((t * ops_per_thread + i) % key_count);
                    match db.read(&key) {
                        Ok(Some(value)) if value == old || value == new => {
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    writer.join().expect("Writer panicked");
    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run a transaction abort stress test.
pub fn stress_transaction_aborts(db: &Sector, config: &StressConfig) -> StressTestResult {
    let value = vec![0xABu8; config.value_size];

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        // Every other transaction is abandoned on purpose.
        let should_fail = i % 2 == 0;

        let result = db.txn_begin().and_then(|_| {
            db.write(&stress_key(i % config.key_count.max(1)), &value)?;
            if should_fail {
                db.txn_abort()?;
                Err(CoreError::txn_conflict("intentional"))
            } else {
                db.txn_commit()
            }
        });

        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run global transactions that write one key into every instance of
/// `scope`.
pub fn stress_global_transactions(
    lld: &Lld,
    scope: InstanceSet,
    config: &StressConfig,
) -> StressTestResult {
    let value = vec![0xABu8; config.value_size];
    let batch_size = 10;

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for batch in 0..(config.operations / batch_size) {
        let result = lld.txn_begin(scope).and_then(|_| {
            for i in 0..batch_size {
                let key = stress_key((batch * batch_size + i) % config.key_count.max(1));
                for instance in scope.iter() {
                    if let Err(e) = lld.instance(instance).and_then(|db| db.write(&key, &value)) {
                        lld.txn_abort()?;
                        return Err(e);
                    }
                }
            }
            lld.txn_commit()
        });

        match result {
            Ok(()) => successful += batch_size,
            Err(_) => failed += batch_size,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestContext;
    use lld_core::Instance;

    #[test]
    fn test_sequential_writes() {
        let ctx = TestContext::memory();
        let config = StressConfig {
            operations: 1_000,
            key_count: 200,
            value_size: 64,
            ..Default::default()
        };

        let result = stress_sequential_writes(ctx.ledger().unwrap(), &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 1_000);
    }

    #[test]
    fn test_sequential_reads() {
        let ctx = TestContext::memory();
        let config = StressConfig {
            operations: 1_000,
            key_count: 100,
            value_size: 64,
            ..Default::default()
        };

        let result = stress_sequential_reads(ctx.register().unwrap(), &config);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_failed_populate_is_counted() {
        let ctx = TestContext::memory();
        let ledger = ctx.ledger().unwrap();
        let config = StressConfig {
            operations: 10,
            key_count: 10,
            value_size: 16,
            ..Default::default()
        };

        // Another thread's transaction rejects every write from this one
        std::thread::scope(|s| {
            s.spawn(|| ledger.txn_begin().unwrap());
        });
        let result = stress_sequential_reads(ledger, &config);
        assert_eq!(result.successful_ops, 0);
        assert_eq!(result.failed_ops, 20);
    }

    #[test]
    fn test_mixed_operations() {
        let ctx = TestContext::memory();
        let config = StressConfig {
            operations: 1_000,
            key_count: 100,
            value_size: 64,
            ..Default::default()
        };

        let result = stress_mixed_operations(ctx.contract().unwrap(), &config);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_concurrent_reads() {
        let ctx = TestContext::memory();
        let config = StressConfig {
            operations: 2_000,
            threads: 4,
            key_count: 100,
            value_size: 64,
        };

        let result = stress_concurrent_reads(Arc::clone(ctx.ledger().unwrap()), &config);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_transaction_aborts() {
        let ctx = TestContext::memory();
        let config = StressConfig {
            operations: 100,
            value_size: 64,
            ..Default::default()
        };

        let result = stress_transaction_aborts(ctx.local().unwrap(), &config);
        // Half should succeed, half should fail (intentionally)
        assert_eq!(result.successful_ops, 50);
        assert_eq!(result.failed_ops, 50);
    }

    #[test]
    fn test_global_transactions() {
        let ctx = TestContext::memory();
        let scope = InstanceSet::empty()
            .with(Instance::Register)
            .with(Instance::Ledger);
        let config = StressConfig {
            operations: 200,
            key_count: 50,
            value_size: 32,
            ..Default::default()
        };

        let result = stress_global_transactions(&ctx, scope, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(ctx.register().unwrap().len().unwrap(), 50);
        assert_eq!(ctx.ledger().unwrap().len().unwrap(), 50);
    }
}
