//! Instance configuration.

use crate::coordinator::{Instance, InstanceSet};
use crate::error::{CoreError, CoreResult};
use crate::key::SECTOR_KEY_HEADER;
use std::collections::BTreeMap;

/// Default number of hashmap buckets.
pub const DEFAULT_BUCKETS: u32 = 77_773;

/// Default largest sector file before a new one is started.
pub const DEFAULT_MAX_SECTOR_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// Default in-memory cache budget.
pub const DEFAULT_CACHE_BYTES: usize = 1024 * 1024;

/// Which keychain an instance indexes its keys with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeychainKind {
    /// Bucketed hash table with fixed-width slots.
    #[default]
    Hashmap,
    /// Sequential record log with an in-memory ordered map.
    Filemap,
}

/// Which eviction policy the value cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Least recently used.
    #[default]
    Lru,
    /// Least frequently used.
    Lfu,
}

/// Keychain settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeychainConfig {
    /// Keychain implementation.
    pub kind: KeychainKind,
    /// Width of the hashmap table.
    pub bucket_count: u32,
    /// Largest key a hashmap slot can hold.
    pub max_key_size: u16,
    /// Overflow layers a single bucket may use.
    pub max_layers: u32,
}

impl Default for KeychainConfig {
    fn default() -> Self {
        Self {
            kind: KeychainKind::Hashmap,
            bucket_count: DEFAULT_BUCKETS,
            max_key_size: 64,
            max_layers: 16,
        }
    }
}

impl KeychainConfig {
    /// Bytes occupied by one hashmap slot.
    #[must_use]
    pub const fn slot_size(&self) -> usize {
        SECTOR_KEY_HEADER + self.max_key_size as usize
    }
}

/// Value cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Eviction policy.
    pub policy: CachePolicy,
    /// Byte budget, counting keys, values and node overhead.
    pub max_bytes: usize,
    /// Entry budget; `usize::MAX` leaves only the byte budget.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy: CachePolicy::Lru,
            max_bytes: DEFAULT_CACHE_BYTES,
            max_entries: usize::MAX,
        }
    }
}

/// Bloom filter sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomConfig {
    /// Expected number of distinct keys.
    pub expected_keys: u64,
    /// Target false positive rate at `expected_keys`.
    pub false_positive_rate: f64,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            expected_keys: 1_000_000,
            false_positive_rate: 0.01,
        }
    }
}

/// Configuration for opening one sector database instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SectorConfig {
    /// Instance name; also the directory name under a context root.
    pub name: String,
    /// Create missing files instead of failing.
    pub create: bool,
    /// Allow mutations.
    pub write: bool,
    /// Never overwrite values in place.
    pub append: bool,
    /// Size after which a new sector file is started.
    pub max_sector_file_size: u64,
    /// Keychain settings.
    pub keychain: KeychainConfig,
    /// Cache settings.
    pub cache: CacheConfig,
    /// Bloom filter settings.
    pub bloom: BloomConfig,
}

impl Default for SectorConfig {
    fn default() -> Self {
        Self {
            name: "sector".to_string(),
            create: true,
            write: true,
            append: false,
            max_sector_file_size: DEFAULT_MAX_SECTOR_FILE_SIZE,
            keychain: KeychainConfig::default(),
            cache: CacheConfig::default(),
            bloom: BloomConfig::default(),
        }
    }
}

impl SectorConfig {
    /// Creates a configuration with default values for the named instance.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets whether missing files are created.
    #[must_use]
    pub fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }

    /// Sets whether mutations are allowed.
    #[must_use]
    pub fn write(mut self, value: bool) -> Self {
        self.write = value;
        self
    }

    /// Sets append-only mode.
    #[must_use]
    pub fn append(mut self, value: bool) -> Self {
        self.append = value;
        self
    }

    /// Sets the maximum sector file size.
    #[must_use]
    pub fn max_sector_file_size(mut self, size: u64) -> Self {
        self.max_sector_file_size = size;
        self
    }

    /// Selects the keychain implementation.
    #[must_use]
    pub fn keychain(mut self, kind: KeychainKind) -> Self {
        self.keychain.kind = kind;
        self
    }

    /// Sets the hashmap bucket count.
    #[must_use]
    pub fn bucket_count(mut self, buckets: u32) -> Self {
        self.keychain.bucket_count = buckets;
        self
    }

    /// Sets the largest key a hashmap slot can hold.
    #[must_use]
    pub fn max_key_size(mut self, size: u16) -> Self {
        self.keychain.max_key_size = size;
        self
    }

    /// Sets the number of overflow layers per bucket.
    #[must_use]
    pub fn max_layers(mut self, layers: u32) -> Self {
        self.keychain.max_layers = layers;
        self
    }

    /// Selects the cache eviction policy.
    #[must_use]
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache.policy = policy;
        self
    }

    /// Sets the cache byte budget.
    #[must_use]
    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache.max_bytes = bytes;
        self
    }

    /// Sets the cache entry budget.
    #[must_use]
    pub fn cache_entries(mut self, entries: usize) -> Self {
        self.cache.max_entries = entries;
        self
    }

    /// Sets bloom filter sizing.
    #[must_use]
    pub fn bloom(mut self, expected_keys: u64, false_positive_rate: f64) -> Self {
        self.bloom.expected_keys = expected_keys;
        self.bloom.false_positive_rate = false_positive_rate;
        self
    }

    /// Checks the configuration for values the on-disk formats cannot hold.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first bad value.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(CoreError::invalid_config(format!(
                "instance name {:?} is not a plain file name",
                self.name
            )));
        }
        if self.keychain.bucket_count == 0 {
            return Err(CoreError::invalid_config("bucket count must be non-zero"));
        }
        if self.keychain.max_key_size == 0 {
            return Err(CoreError::invalid_config("max key size must be non-zero"));
        }
        if self.keychain.max_layers == 0 {
            return Err(CoreError::invalid_config("max layers must be non-zero"));
        }
        if self.max_sector_file_size == 0 || self.max_sector_file_size > u64::from(u32::MAX) {
            return Err(CoreError::invalid_config(format!(
                "max sector file size {} is outside 1..=u32::MAX",
                self.max_sector_file_size
            )));
        }
        if self.bloom.expected_keys == 0 {
            return Err(CoreError::invalid_config("bloom expected keys must be non-zero"));
        }
        let rate = self.bloom.false_positive_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return Err(CoreError::invalid_config(format!(
                "bloom false positive rate {rate} is outside (0, 1)"
            )));
        }
        Ok(())
    }
}

/// Configuration for opening an [`Lld`](crate::Lld) context.
///
/// Every instance starts from [`LldConfig::default_for`]; the context-wide
/// flags and sizing below are applied on top, and an explicit
/// [`LldConfig::instance`] override replaces all of it for that instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LldConfig {
    /// Instances to open.
    pub instances: InstanceSet,
    /// Create missing directories and files.
    pub create: bool,
    /// Allow mutations.
    pub write: bool,
    /// Never overwrite values in place.
    pub append: bool,
    /// Bucket count for every hashmap keychain.
    pub bucket_count: Option<u32>,
    /// Bloom sizing for every instance.
    pub bloom: Option<BloomConfig>,
    /// Sector file size limit for every instance.
    pub max_sector_file_size: Option<u64>,
    overrides: BTreeMap<Instance, SectorConfig>,
}

impl Default for LldConfig {
    fn default() -> Self {
        Self {
            instances: InstanceSet::all(),
            create: true,
            write: true,
            append: false,
            bucket_count: None,
            bloom: None,
            max_sector_file_size: None,
            overrides: BTreeMap::new(),
        }
    }
}

impl LldConfig {
    /// Creates a configuration opening every instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration of one instance.
    ///
    /// Register and ledger get a 2 MiB cache. Overflow depth follows the
    /// expected key population: 512 layers for the ledger, 256 for
    /// contract and register, 128 for legacy and a handful for the small
    /// node-local and trust instances.
    #[must_use]
    pub fn default_for(instance: Instance) -> SectorConfig {
        let (layers, cache) = match instance {
            Instance::Contract => (256, DEFAULT_CACHE_BYTES),
            Instance::Register => (256, 2 * DEFAULT_CACHE_BYTES),
            Instance::Ledger => (512, 2 * DEFAULT_CACHE_BYTES),
            Instance::Local | Instance::Trust => (4, DEFAULT_CACHE_BYTES),
            Instance::Client => (8, DEFAULT_CACHE_BYTES),
            Instance::Legacy => (128, DEFAULT_CACHE_BYTES),
        };
        SectorConfig::new(instance.name())
            .max_layers(layers)
            .cache_size(cache)
    }

    /// Selects the instances to open.
    #[must_use]
    pub fn instances(mut self, instances: InstanceSet) -> Self {
        self.instances = instances;
        self
    }

    /// Sets whether missing files are created.
    #[must_use]
    pub fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }

    /// Sets whether mutations are allowed.
    #[must_use]
    pub fn write(mut self, value: bool) -> Self {
        self.write = value;
        self
    }

    /// Sets append-only mode for every instance.
    #[must_use]
    pub fn append(mut self, value: bool) -> Self {
        self.append = value;
        self
    }

    /// Sets the hashmap bucket count of every instance.
    #[must_use]
    pub fn bucket_count(mut self, buckets: u32) -> Self {
        self.bucket_count = Some(buckets);
        self
    }

    /// Sets bloom filter sizing of every instance.
    #[must_use]
    pub fn bloom(mut self, expected_keys: u64, false_positive_rate: f64) -> Self {
        self.bloom = Some(BloomConfig {
            expected_keys,
            false_positive_rate,
        });
        self
    }

    /// Sets the sector file size limit of every instance.
    #[must_use]
    pub fn max_sector_file_size(mut self, size: u64) -> Self {
        self.max_sector_file_size = Some(size);
        self
    }

    /// Replaces the whole configuration of one instance and adds it to
    /// the set to open. Its name is forced to the instance name.
    #[must_use]
    pub fn instance(mut self, instance: Instance, config: SectorConfig) -> Self {
        self.instances = self.instances.with(instance);
        self.overrides.insert(instance, config);
        self
    }

    /// Resolved configuration of one instance.
    #[must_use]
    pub fn sector_config(&self, instance: Instance) -> SectorConfig {
        if let Some(config) = self.overrides.get(&instance) {
            let mut config = config.clone();
            config.name = instance.name().to_string();
            return config;
        }
        let mut config = Self::default_for(instance)
            .create(self.create)
            .write(self.write)
            .append(self.append);
        if let Some(buckets) = self.bucket_count {
            config = config.bucket_count(buckets);
        }
        if let Some(bloom) = &self.bloom {
            config.bloom = bloom.clone();
        }
        if let Some(size) = self.max_sector_file_size {
            config = config.max_sector_file_size(size);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SectorConfig::default();
        assert!(config.create);
        assert!(config.write);
        assert!(!config.append);
        assert_eq!(config.keychain.bucket_count, DEFAULT_BUCKETS);
        assert_eq!(config.keychain.slot_size(), 13 + 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = SectorConfig::new("ledger")
            .create(false)
            .bucket_count(16)
            .cache_policy(CachePolicy::Lfu)
            .cache_entries(2)
            .keychain(KeychainKind::Filemap)
            .bloom(100, 0.05);

        assert_eq!(config.name, "ledger");
        assert!(!config.create);
        assert_eq!(config.keychain.bucket_count, 16);
        assert_eq!(config.keychain.kind, KeychainKind::Filemap);
        assert_eq!(config.cache.policy, CachePolicy::Lfu);
        assert_eq!(config.cache.max_entries, 2);
        assert_eq!(config.bloom.expected_keys, 100);
    }

    #[test]
    fn validate_rejects_unaddressable_values() {
        assert!(SectorConfig::new("x").bucket_count(0).validate().is_err());
        assert!(SectorConfig::new("x").max_key_size(0).validate().is_err());
        assert!(SectorConfig::new("x")
            .max_sector_file_size(u64::from(u32::MAX) + 1)
            .validate()
            .is_err());
        assert!(SectorConfig::new("x").bloom(10, 1.5).validate().is_err());
        assert!(SectorConfig::new("a/b").validate().is_err());
    }

    #[test]
    fn instance_defaults() {
        let ledger = LldConfig::default_for(Instance::Ledger);
        assert_eq!(ledger.name, "ledger");
        assert_eq!(ledger.keychain.max_layers, 512);
        assert_eq!(ledger.cache.max_bytes, 2 * DEFAULT_CACHE_BYTES);
        assert_eq!(LldConfig::default_for(Instance::Trust).keychain.max_layers, 4);
        assert_eq!(
            LldConfig::default_for(Instance::Client).cache.max_bytes,
            DEFAULT_CACHE_BYTES
        );
    }

    #[test]
    fn context_settings_apply_to_every_instance() {
        let config = LldConfig::new()
            .write(false)
            .bucket_count(31)
            .bloom(500, 0.02)
            .instance(
                Instance::Local,
                SectorConfig::new("ignored").keychain(KeychainKind::Filemap),
            );

        let trust = config.sector_config(Instance::Trust);
        assert!(!trust.write);
        assert_eq!(trust.keychain.bucket_count, 31);
        assert_eq!(trust.bloom.expected_keys, 500);
        assert_eq!(trust.keychain.max_layers, 4);

        let local = config.sector_config(Instance::Local);
        assert_eq!(local.name, "local");
        assert_eq!(local.keychain.kind, KeychainKind::Filemap);
        assert!(local.write);
    }
}
