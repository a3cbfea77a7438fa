//! Get command implementation.

use super::{open_context, parse_key, present_instances, to_hex};
use crate::Geometry;
use lld_core::{Instance, InstanceSet};
use std::path::Path;

/// Runs the get command.
pub fn run(
    path: &Path,
    geometry: Geometry,
    instance: Instance,
    key: &str,
    hex: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !present_instances(path).contains(instance) {
        return Err(format!("Instance {instance} not found at {}", path.display()).into());
    }
    let key = parse_key(key)?;
    let lld = open_context(path, geometry, InstanceSet::empty().with(instance), false)?;
    let value = lld.instance(instance)?.read(&key)?;
    lld.close()?;

    match value {
        Some(value) if hex => println!("{}", to_hex(&value)),
        Some(value) => println!("{}", String::from_utf8_lossy(&value)),
        None => return Err("Key not found".into()),
    }
    Ok(())
}
