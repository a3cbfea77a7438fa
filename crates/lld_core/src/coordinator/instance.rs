//! Named database instances and sets of them.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// One of the named instances a context can hold.
///
/// The declaration order is the canonical order in which global
/// transactions visit instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Instance {
    /// Contract execution state.
    Contract,
    /// Object registers.
    Register,
    /// Blocks and ledger transactions.
    Ledger,
    /// Node-local indices.
    Local,
    /// Light-client data.
    Client,
    /// Trust and stake records.
    Trust,
    /// Legacy transactions.
    Legacy,
}

impl Instance {
    /// Every instance in canonical order.
    pub const ALL: [Self; 7] = [
        Self::Contract,
        Self::Register,
        Self::Ledger,
        Self::Local,
        Self::Client,
        Self::Trust,
        Self::Legacy,
    ];

    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Register => "register",
            Self::Ledger => "ledger",
            Self::Local => "local",
            Self::Client => "client",
            Self::Trust => "trust",
            Self::Legacy => "legacy",
        }
    }

    /// Directory of the instance under a context root.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Contract => "_CONTRACT",
            Self::Register => "_REGISTER",
            Self::Ledger => "_LEDGER",
            Self::Local => "_LOCAL",
            Self::Client => "_CLIENT",
            Self::Trust => "_TRUST",
            Self::Legacy => "_LEGACY",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Instance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|i| i.name().eq_ignore_ascii_case(s) || i.dir_name() == s)
            .ok_or_else(|| format!("unknown instance {s:?}"))
    }
}

/// A set of instances, iterated in canonical order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InstanceSet(u8);

impl InstanceSet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every instance.
    #[must_use]
    pub const fn all() -> Self {
        Self(0x7F)
    }

    /// Instances holding chain state: contract, register, ledger, trust
    /// and legacy.
    #[must_use]
    pub const fn consensus() -> Self {
        Self::empty()
            .with(Instance::Contract)
            .with(Instance::Register)
            .with(Instance::Ledger)
            .with(Instance::Trust)
            .with(Instance::Legacy)
    }

    /// Node-local instances: local and client.
    #[must_use]
    pub const fn local() -> Self {
        Self::empty().with(Instance::Local).with(Instance::Client)
    }

    /// Returns the set with `instance` added.
    #[must_use]
    pub const fn with(self, instance: Instance) -> Self {
        Self(self.0 | instance.bit())
    }

    /// Returns the set with `instance` removed.
    #[must_use]
    pub const fn without(self, instance: Instance) -> Self {
        Self(self.0 & !instance.bit())
    }

    /// Returns the union of two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns true if `instance` is in the set.
    #[must_use]
    pub const fn contains(self, instance: Instance) -> bool {
        self.0 & instance.bit() != 0
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of instances in the set.
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Instances in canonical order.
    pub fn iter(self) -> impl Iterator<Item = Instance> {
        Instance::ALL.into_iter().filter(move |i| self.contains(*i))
    }

    /// Compact encoding used in the global commit record.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.0
    }

    /// Decodes [`Self::to_byte`], rejecting unknown bits.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        if b & !0x7F == 0 {
            Some(Self(b))
        } else {
            None
        }
    }
}

impl FromIterator<Instance> for InstanceSet {
    fn from_iter<I: IntoIterator<Item = Instance>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl fmt::Debug for InstanceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for InstanceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Instance::name).collect();
        write!(f, "[{}]", names.join(","))
    }
}
