//! Inspect command implementation.

use super::{open_context, present_instances};
use crate::Geometry;
use lld_core::coordinator::COMMIT_RECORD_FILE;
use lld_core::{DatabaseInfo, Instance, InstanceSet};
use serde::Serialize;
use std::path::Path;

/// Context inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Context path.
    pub path: String,
    /// Whether a global commit record is present.
    pub commit_record_present: bool,
    /// Bytes in sector files across instances.
    pub total_sector_bytes: u64,
    /// Per-instance summaries.
    pub instances: Vec<DatabaseInfo>,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    geometry: Geometry,
    only: Option<Instance>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut instances = present_instances(path);
    if let Some(instance) = only {
        if !instances.contains(instance) {
            return Err(format!("Instance {instance} not found at {}", path.display()).into());
        }
        instances = InstanceSet::empty().with(instance);
    }

    let lld = open_context(path, geometry, instances, false)?;
    let infos = lld.info()?;
    let result = InspectResult {
        path: path.display().to_string(),
        commit_record_present: path.join(COMMIT_RECORD_FILE).exists(),
        total_sector_bytes: infos.iter().map(|i| i.sector_bytes).sum(),
        instances: infos,
    };
    lld.close()?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("LLD Context Inspection");
    println!("======================");
    println!();
    println!("Path: {}", result.path);
    println!("Sector data: {}", format_size(result.total_sector_bytes));
    if result.commit_record_present {
        println!("Global commit record present: run `lld recover`");
    }

    for info in &result.instances {
        println!();
        println!("[{}]", info.name);
        println!("  Keychain:      {}", info.keychain);
        println!("  Keys:          {}", info.keys);
        println!(
            "  Sector files:  {} ({})",
            info.sector_files,
            format_size(info.sector_bytes)
        );
        println!("  Cache:         {}", info.cache_policy);
        println!(
            "  Bloom:         {} bits, {} hashes, ~{:.4} false positives",
            info.bloom_bits, info.bloom_hashes, info.bloom_false_positive_rate
        );
        if info.journal_present {
            println!("  Journal:       present");
        }
        if info.corrupt {
            println!("  Status:        CORRUPT");
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
