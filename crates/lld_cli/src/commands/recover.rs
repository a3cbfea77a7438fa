//! Recover command implementation.

use super::{open_context, present_instances};
use crate::Geometry;
use lld_core::sector::{journal, JournalState};
use lld_core::{CommitRecord, Instance, InstanceSet};
use lld_storage::DirVolume;
use std::path::Path;

/// What recovery will do with one instance's journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Nothing to recover.
    Clean,
    /// Replay a committed journal.
    RollForward {
        /// Operations in the journal.
        ops: usize,
    },
    /// Delete a journal without applying it.
    Discard,
}

/// Decides the fate of a journal given the root commit record.
#[must_use]
pub fn plan(instance: Instance, state: &JournalState, record: Option<&CommitRecord>) -> Plan {
    match state {
        JournalState::Absent => Plan::Clean,
        JournalState::Incomplete { .. } => Plan::Discard,
        JournalState::Complete(committed) => match committed.global {
            None => Plan::RollForward {
                ops: committed.ops.len(),
            },
            Some(global) => {
                if record.is_some_and(|r| r.global == global && r.scope.contains(instance)) {
                    Plan::RollForward {
                        ops: committed.ops.len(),
                    }
                } else {
                    Plan::Discard
                }
            }
        },
    }
}

/// Runs the recover command.
pub fn run(path: &Path, geometry: Geometry, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let instances = present_instances(path);
    if instances.is_empty() {
        return Err(format!("No LLD instances found at {}", path.display()).into());
    }

    let root = DirVolume::open(path, false)?;
    let record = CommitRecord::read(&root)?;
    match &record {
        Some(record) => println!(
            "Global commit record: transaction {} over {}",
            record.global, record.scope
        ),
        None => println!("Global commit record: none"),
    }

    let mut pending = 0;
    for instance in instances.iter() {
        let volume = DirVolume::open(&path.join(instance.dir_name()), false)?;
        let state = journal::read(&volume)?;
        let action = plan(instance, &state, record.as_ref());
        match action {
            Plan::Clean => println!("  {instance}: clean"),
            Plan::RollForward { ops } => {
                pending += 1;
                println!("  {instance}: roll forward {ops} operations");
            }
            Plan::Discard => {
                pending += 1;
                println!("  {instance}: discard journal");
            }
        }
    }

    if let Some(record) = &record {
        let missing: InstanceSet = record
            .scope
            .iter()
            .filter(|i| !instances.contains(*i))
            .collect();
        if !missing.is_empty() {
            println!("Commit record names missing instances {missing}; it will be kept");
        }
    }

    if dry_run {
        println!();
        println!("Dry run: {pending} instances need recovery");
        return Ok(());
    }

    if pending == 0 && record.is_none() {
        println!();
        println!("✓ Nothing to recover");
        return Ok(());
    }

    // A writable open replays or discards every journal.
    let lld = open_context(path, geometry, instances, true)?;
    lld.close()?;

    let mut remaining = 0;
    for instance in instances.iter() {
        let volume = DirVolume::open(&path.join(instance.dir_name()), false)?;
        if journal::read(&volume)? != JournalState::Absent {
            remaining += 1;
            println!("  {instance}: journal still present");
        }
    }

    println!();
    if remaining == 0 {
        println!("✓ Recovery complete");
        Ok(())
    } else {
        println!("✗ Recovery left {remaining} journals");
        Err("Recovery incomplete".into())
    }
}
