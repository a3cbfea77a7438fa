//! Verify command implementation.

use super::{display_key, open_context, present_instances};
use crate::Geometry;
use lld_core::sector::{journal, JournalState, BLOOM_SNAPSHOT};
use lld_core::{BloomFilter, CommitRecord, Instance, InstanceSet};
use lld_storage::{DirVolume, Volume};
use std::path::Path;

/// Verification result for one instance.
#[derive(Debug)]
pub struct VerifyResult {
    /// Number of values read back.
    pub values_checked: usize,
    /// Number of keys whose value could not be read.
    pub unreadable: usize,
    /// Problems that need `lld recover` rather than repair.
    pub pending: Vec<String>,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn new() -> Self {
        Self {
            values_checked: 0,
            unreadable: 0,
            pending: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn is_ok(&self) -> bool {
        self.unreadable == 0 && self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, geometry: Geometry, deep: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying context at {:?}", path);
    println!();

    let instances = present_instances(path);
    if instances.is_empty() {
        return Err(format!("No LLD instances found at {}", path.display()).into());
    }

    let root = DirVolume::open(path, false)?;
    let mut all_ok = true;
    match CommitRecord::read(&root) {
        Ok(Some(record)) => {
            println!(
                "Global commit record {} covering {} (run `lld recover`)",
                record.global, record.scope
            );
        }
        Ok(None) => {}
        Err(e) => {
            println!("✗ Global commit record unreadable: {e}");
            all_ok = false;
        }
    }

    let mut results = Vec::new();
    for instance in instances.iter() {
        let volume = DirVolume::open(&path.join(instance.dir_name()), false)?;
        results.push((instance, verify_files(&volume)?));
    }

    if deep {
        // Opening read-only leaves journals and snapshots in place.
        let lld = open_context(path, geometry, instances, false)?;
        for (instance, result) in &mut results {
            verify_values(&lld, *instance, result)?;
        }
        lld.close()?;
    }

    for (instance, result) in &results {
        print_result(*instance, result);
        all_ok &= result.is_ok();
    }

    println!();
    if all_ok {
        println!("✓ Context verification passed");
        Ok(())
    } else {
        println!("✗ Context verification failed");
        Err("Verification failed".into())
    }
}

fn verify_files(volume: &dyn Volume) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::new();

    match journal::read(volume) {
        Ok(JournalState::Absent) => {}
        Ok(JournalState::Incomplete { records }) => result.pending.push(format!(
            "torn journal with {records} records will be discarded"
        )),
        Ok(JournalState::Complete(committed)) => {
            let owner = committed
                .global
                .map_or_else(String::new, |g| format!(" of global transaction {g}"));
            result.pending.push(format!(
                "committed journal{owner} with {} operations awaits recovery",
                committed.ops.len()
            ));
        }
        Err(e) => result.errors.push(format!("journal unreadable: {e}")),
    }

    if let Some(data) = volume.read_file(BLOOM_SNAPSHOT)? {
        if let Err(e) = BloomFilter::decode(&data) {
            result
                .pending
                .push(format!("bloom snapshot rejected ({e}); filter will be rebuilt"));
        }
    }

    Ok(result)
}

fn verify_values(
    lld: &lld_core::Lld,
    instance: Instance,
    result: &mut VerifyResult,
) -> Result<(), Box<dyn std::error::Error>> {
    let sector = lld.instance(instance)?;
    if sector.is_corrupt() {
        result.errors.push("keychain reported corruption".to_string());
    }
    let keys = match sector.keys() {
        Ok(keys) => keys,
        Err(e) => {
            result.errors.push(format!("keys unreadable: {e}"));
            return Ok(());
        }
    };
    for key in keys {
        result.values_checked += 1;
        match sector.read(&key) {
            Ok(Some(_)) => {}
            Ok(None) => {
                result.unreadable += 1;
                result
                    .errors
                    .push(format!("listed key {} has no value", display_key(&key)));
            }
            Err(e) => {
                result.unreadable += 1;
                result
                    .errors
                    .push(format!("key {} unreadable: {e}", display_key(&key)));
            }
        }
    }
    Ok(())
}

fn print_result(instance: Instance, result: &VerifyResult) {
    let status = if result.is_ok() { "✓" } else { "✗" };
    println!("{status} {instance}");
    if result.values_checked > 0 {
        println!("    Values checked: {}", result.values_checked);
    }
    if result.unreadable > 0 {
        println!("    Unreadable: {}", result.unreadable);
    }
    for pending in &result.pending {
        println!("    Pending: {pending}");
    }
    for error in result.errors.iter().take(10) {
        println!("    Error: {error}");
    }
    if result.errors.len() > 10 {
        println!("    ... and {} more errors", result.errors.len() - 10);
    }
}
