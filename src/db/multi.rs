//! Staged multi-trees and the per-version commit summary.
//!
//! A [`MultiTree`] carries one staged or snapshot [`Tree`] per database tree
//! in name order. [`CommitInfo`] lists each tree's root hash and folds them
//! into one hash with [`aggregate_hash`].

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::tree::Tree;
use crate::types::Hash;

/// One staged [`Tree`] per store of a database, all at the same version.
pub struct MultiTree {
    pub(crate) version: u32,
    pub(crate) names: Arc<[String]>,
    pub(crate) trees: Vec<Tree>,
}

impl MultiTree {
    /// Version the trees stage (or show, for snapshots).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Store names in name order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Tree of store `name`.
    pub fn tree(&self, name: &str) -> Option<&Tree> {
        let pos = self.position(name)?;
        self.trees.get(pos)
    }

    /// Mutable tree of store `name`.
    pub fn tree_mut(&mut self, name: &str) -> Option<&mut Tree> {
        let pos = self.position(name)?;
        self.trees.get_mut(pos)
    }

    /// `(name, tree)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tree)> {
        self.names.iter().map(String::as_str).zip(self.trees.iter())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.binary_search_by(|candidate| candidate.as_str().cmp(name)).ok()
    }
}

/// Root of one store after a commit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoreInfo {
    /// Store name.
    pub name: String,
    /// Root hash of the store.
    #[serde(with = "hex_hash")]
    pub hash: Hash,
    /// Committed version.
    pub version: u32,
}

/// Outcome of a database commit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CommitInfo {
    /// Committed version.
    pub version: u32,
    /// Aggregate hash over every store.
    #[serde(with = "hex_hash")]
    pub hash: Hash,
    /// Per-store roots in name order.
    pub stores: Vec<StoreInfo>,
}

impl CommitInfo {
    pub(crate) fn new(version: u32, stores: Vec<StoreInfo>) -> Self {
        Self {
            version,
            hash: aggregate_hash(&stores),
            stores,
        }
    }
}

/// `SHA256(name_1 ‖ hash_1 ‖ … ‖ name_n ‖ hash_n)` with stores in name order.
pub fn aggregate_hash(stores: &[StoreInfo]) -> Hash {
    let mut sorted: Vec<&StoreInfo> = stores.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let mut hasher = Sha256::new();
    for store in sorted {
        hasher.update(store.name.as_bytes());
        hasher.update(store.hash);
    }
    hasher.finalize().into()
}

mod hex_hash {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(hash: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(name: &str, byte: u8) -> StoreInfo {
        StoreInfo {
            name: name.to_string(),
            hash: [byte; 32],
            version: 1,
        }
    }

    #[test]
    fn aggregate_ignores_input_order() {
        let forward = aggregate_hash(&[store("acc", 1), store("bank", 2)]);
        let backward = aggregate_hash(&[store("bank", 2), store("acc", 1)]);
        assert_eq!(forward, backward);

        let mut manual = Sha256::new();
        manual.update(b"acc");
        manual.update([1u8; 32]);
        manual.update(b"bank");
        manual.update([2u8; 32]);
        let expected: Hash = manual.finalize().into();
        assert_eq!(forward, expected);
    }

    #[test]
    fn trees_are_found_by_name() {
        let names: Arc<[String]> = vec!["a".to_string(), "c".to_string()].into();
        let mut multi = MultiTree {
            version: 1,
            names,
            trees: vec![Tree::staged(None, 1), Tree::staged(None, 1)],
        };
        assert!(multi.tree("c").is_some());
        assert!(multi.tree("b").is_none());
        assert!(multi.tree_mut("a").is_some());
        assert_eq!(multi.iter().count(), 2);
    }
}
