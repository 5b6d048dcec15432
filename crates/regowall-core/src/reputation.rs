//! IP reputation index: address -> expiration, split by address family.
//!
//! Backed by two persistent radix trees. `insert` returns a new index and
//! never mutates the receiver, so an index captured in a compiled snapshot
//! can be read from request handlers while a newer one is being built.
//!
//! Expired entries are not evicted on their own: `is_active` treats them as
//! absent and `compact` rebuilds the index without them.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{RegowallError, Result};
use crate::radix::RadixTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Parse `address` and return its family and canonical text.
///
/// IPv4-mapped IPv6 addresses (`::ffff:1.2.3.4`) canonicalize to IPv4 so a
/// client is found no matter which socket family reported it.
pub fn canonicalize(address: &str) -> Result<(AddressFamily, String)> {
    let ip: IpAddr = address
        .trim()
        .parse()
        .map_err(|_| RegowallError::InvalidAddress(address.to_string()))?;
    let canonical = ip.to_canonical().to_string();

    let family = if canonical.contains(':') {
        AddressFamily::V6
    } else if canonical.matches('.').count() == 3 {
        AddressFamily::V4
    } else {
        return Err(RegowallError::InvalidAddress(address.to_string()));
    };
    Ok((family, canonical))
}

/// Flat view of an index, for introspection endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlatExport {
    pub ipv4: BTreeMap<String, DateTime<Utc>>,
    pub ipv6: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ReputationIndex {
    v4: RadixTree<DateTime<Utc>>,
    v6: RadixTree<DateTime<Utc>>,
}

impl ReputationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return a new index with `address` expiring at `expires_at`.
    pub fn insert(&self, address: &str, expires_at: DateTime<Utc>) -> Result<Self> {
        let (family, key) = canonicalize(address)?;
        let mut next = self.clone();
        match family {
            AddressFamily::V4 => next.v4 = self.v4.insert(key.as_bytes(), expires_at).0,
            AddressFamily::V6 => next.v6 = self.v6.insert(key.as_bytes(), expires_at).0,
        }
        Ok(next)
    }

    /// Raw expiration for `address`, ignoring whether it has passed.
    /// Malformed addresses are simply absent.
    pub fn lookup(&self, address: &str) -> Option<DateTime<Utc>> {
        let (family, key) = canonicalize(address).ok()?;
        let tree = match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        };
        tree.get(key.as_bytes()).copied()
    }

    /// Present and not yet expired at `now`.
    pub fn is_active(&self, address: &str, now: DateTime<Utc>) -> bool {
        self.lookup(address).is_some_and(|expires_at| expires_at > now)
    }

    pub fn export(&self) -> FlatExport {
        FlatExport {
            ipv4: flatten(&self.v4),
            ipv6: flatten(&self.v6),
        }
    }

    /// Rebuild without the entries that expired at or before `now`.
    pub fn compact(&self, now: DateTime<Utc>) -> Self {
        Self {
            v4: keep_active(&self.v4, now),
            v6: keep_active(&self.v6, now),
        }
    }
}

fn flatten(tree: &RadixTree<DateTime<Utc>>) -> BTreeMap<String, DateTime<Utc>> {
    tree.entries()
        .into_iter()
        .map(|(k, v)| (String::from_utf8_lossy(&k).into_owned(), *v))
        .collect()
}

fn keep_active(tree: &RadixTree<DateTime<Utc>>, now: DateTime<Utc>) -> RadixTree<DateTime<Utc>> {
    tree.entries()
        .into_iter()
        .filter(|(_, expires_at)| **expires_at > now)
        .fold(RadixTree::new(), |acc, (k, v)| acc.insert(&k, *v).0)
}
