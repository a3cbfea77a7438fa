//! CLI command implementations.

pub mod get;
pub mod inspect;
pub mod keys;
pub mod recover;
pub mod verify;

use crate::Geometry;
use lld_core::{Instance, InstanceSet, KeychainKind, Lld, LldConfig};
use std::fmt::Write as _;
use std::path::Path;
use tracing::debug;

/// Instances with a sector file under `path`.
pub fn present_instances(path: &Path) -> InstanceSet {
    Instance::ALL
        .into_iter()
        .filter(|i| path.join(i.dir_name()).join("_block.00000").exists())
        .collect()
}

/// Keychain an instance directory was created with.
pub fn keychain_kind(path: &Path, instance: Instance) -> KeychainKind {
    if path.join(instance.dir_name()).join("_filemap.00000").exists() {
        KeychainKind::Filemap
    } else {
        KeychainKind::Hashmap
    }
}

/// Opens the instances present under `path`.
pub fn open_context(
    path: &Path,
    geometry: Geometry,
    instances: InstanceSet,
    write: bool,
) -> Result<Lld, Box<dyn std::error::Error>> {
    if instances.is_empty() {
        return Err(format!("No LLD instances found at {}", path.display()).into());
    }
    debug!(path = %path.display(), %instances, write, "opening context");
    let mut config = LldConfig::new()
        .instances(InstanceSet::empty())
        .create(false)
        .write(write);
    for instance in instances.iter() {
        let sector = LldConfig::default_for(instance)
            .keychain(keychain_kind(path, instance))
            .bucket_count(geometry.buckets)
            .max_key_size(geometry.max_key_size)
            .create(false)
            .write(write);
        config = config.instance(instance, sector);
    }
    Ok(Lld::open(path, config)?)
}

/// Parses a key given as text or as `0x`-prefixed hex.
pub fn parse_key(text: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let Some(hex) = text.strip_prefix("0x") else {
        return Ok(text.as_bytes().to_vec());
    };
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(format!("malformed hex key {text:?}").into());
    }
    let mut key = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|e| format!("bad hex key {text:?}: {e}"))?;
        key.push(byte);
    }
    Ok(key)
}

/// Formats bytes as lowercase hex.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Renders a key as text when printable, otherwise as `0x` hex.
pub fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => format!("0x{}", to_hex(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_parse_as_text_or_hex() {
        assert_eq!(parse_key("block").unwrap(), b"block");
        assert_eq!(parse_key("0x00ff10").unwrap(), vec![0x00, 0xff, 0x10]);
        assert!(parse_key("0xabc").is_err());
        assert!(parse_key("0xzz").is_err());
    }

    #[test]
    fn keys_display_readably() {
        assert_eq!(display_key(b"height"), "height");
        assert_eq!(display_key(&[0, 1, 0xab]), "0x0001ab");
    }
}
