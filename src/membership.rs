//! Cluster membership: server addresses and configurations.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

use crate::types::ServerId;

/// Network identity of one replica: its id plus the opaque address string the
/// transport needs to reach it.
///
/// Identity is the id alone: two values with the same id compare equal even
/// when their `addr` strings differ, so an address set can never hold two
/// entries for one replica.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerAddress {
    pub id: ServerId,
    pub addr: String,
}

impl ServerAddress {
    pub fn new(id: ServerId, addr: impl Into<String>) -> Self {
        Self { id, addr: addr.into() }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServerAddress {}

impl PartialOrd for ServerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for ServerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// A set of server addresses, keyed by server id.
pub type AddressSet = BTreeSet<ServerAddress>;

/// Whether `set` holds an address for `id`.
pub(crate) fn contains_id(set: &AddressSet, id: ServerId) -> bool {
    set.contains(&ServerAddress { id, addr: String::new() })
}

/// Membership of the cluster: the current address set, plus the previous one
/// while a joint configuration is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Configuration {
    pub current: AddressSet,
    pub previous: AddressSet,
}

impl Configuration {
    pub fn new(current: AddressSet) -> Self {
        Self {
            current,
            previous: AddressSet::new(),
        }
    }

    /// A configuration is joint while both address sets are populated.
    pub fn is_joint(&self) -> bool {
        !self.previous.is_empty()
    }

    /// Union of current and previous: everything the transport must be able
    /// to reach while this configuration is active.
    pub fn address_set(&self) -> AddressSet {
        self.current.union(&self.previous).cloned().collect()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        contains_id(&self.current, id) || contains_id(&self.previous, id)
    }

    /// Joiners and leavers of `target` relative to the current address set.
    pub fn diff(&self, target: &AddressSet) -> ConfigurationDiff {
        diff_address_sets(&self.current, target)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{current: [")?;
        for (i, addr) in self.current.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", addr)?;
        }
        if self.is_joint() {
            write!(f, "], previous: [")?;
            for (i, addr) in self.previous.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", addr)?;
            }
        }
        write!(f, "]}}")
    }
}

/// Membership delta between two address sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationDiff {
    pub joining: AddressSet,
    pub leaving: AddressSet,
}

impl ConfigurationDiff {
    pub fn is_empty(&self) -> bool {
        self.joining.is_empty() && self.leaving.is_empty()
    }
}

pub(crate) fn diff_address_sets(prev: &AddressSet, current: &AddressSet) -> ConfigurationDiff {
    let mut diff = ConfigurationDiff::default();
    for addr in current {
        if !prev.contains(addr) {
            diff.joining.insert(addr.clone());
        }
    }
    for addr in prev {
        if !current.contains(addr) {
            diff.leaving.insert(addr.clone());
        }
    }
    diff
}
