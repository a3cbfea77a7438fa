//! Keys command implementation.

use super::{display_key, open_context, present_instances};
use crate::Geometry;
use lld_core::{Instance, InstanceSet};
use std::path::Path;

/// Runs the keys command.
pub fn run(
    path: &Path,
    geometry: Geometry,
    instance: Instance,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    if !present_instances(path).contains(instance) {
        return Err(format!("Instance {instance} not found at {}", path.display()).into());
    }
    let lld = open_context(path, geometry, InstanceSet::empty().with(instance), false)?;
    let mut keys = lld.instance(instance)?.keys()?;
    lld.close()?;

    keys.sort();
    let total = keys.len();
    for key in keys.iter().take(limit.unwrap_or(usize::MAX)) {
        println!("{}", display_key(key));
    }
    if limit.is_some_and(|limit| limit < total) {
        println!("... {} more", total - limit.unwrap_or(0));
    }
    Ok(())
}
