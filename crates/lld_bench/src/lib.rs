//! Benchmark utilities.

use lld_core::{KeychainKind, LldConfig, Sector, SectorConfig};
use lld_storage::{DirVolume, MemoryVolume, Volume};
use rand::Rng;
use std::path::Path;
use std::sync::Arc;

/// Generate random value data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` random keys of 8 to 40 bytes.
pub fn random_keys(count: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let len = rng.gen_range(8..=40);
            (0..len).map(|_| rng.gen()).collect()
        })
        .collect()
}

/// Generate keys paired with random values of `value_size` bytes.
pub fn generate_entries(count: usize, value_size: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    random_keys(count)
        .into_iter()
        .map(|key| (key, random_data(value_size)))
        .collect()
}

/// Sector configuration used by the database benchmarks.
pub fn bench_config(kind: KeychainKind) -> SectorConfig {
    SectorConfig::new("bench")
        .keychain(kind)
        .bucket_count(16_384)
        .bloom(100_000, 0.01)
}

/// Opens a sector database over memory.
pub fn memory_sector(kind: KeychainKind) -> Sector {
    let volume: Arc<dyn Volume> = Arc::new(MemoryVolume::new());
    lld_core::open_sector(volume, bench_config(kind)).expect("open memory sector")
}

/// Opens a sector database in `dir`.
pub fn dir_sector(dir: &Path, kind: KeychainKind) -> Sector {
    let volume: Arc<dyn Volume> = Arc::new(DirVolume::open(dir, true).expect("open directory"));
    lld_core::open_sector(volume, bench_config(kind)).expect("open directory sector")
}

/// Context configuration for the coordinator benchmarks.
pub fn bench_context_config() -> LldConfig {
    LldConfig::new().bucket_count(4_096)
}
