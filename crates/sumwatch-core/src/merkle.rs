//! Merkle tree primitives for the checksum-database log.
//!
//! The log is an append-only binary Merkle tree over SHA-256. Leaves are
//! hashed as `H(0x00 ‖ leaf)`, interior nodes as `H(0x01 ‖ left ‖ right)`,
//! and the empty tree as `H("")`.
//!
//! [`CollapsedTree`] is the O(log n) incremental representation: it keeps
//! one subtree root per set bit of the tree size, which is exactly the
//! state needed to append further leaves and to compute the current root.
//! It serializes to JSON so it can be checkpointed to storage and compared
//! for optimistic-concurrency checks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size of a tree hash in bytes.
pub const HASH_LEN: usize = 32;

/// A SHA-256 tree hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(#[serde(with = "base64_bytes")] pub [u8; HASH_LEN]);

impl Hash {
    /// Returns the hash as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the standard base64 encoding of the hash.
    #[must_use]
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Parses a hash from a byte slice, which must be exactly 32 bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; HASH_LEN]>::try_from(bytes).ok().map(Hash)
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Hash of the empty tree: `H("")`.
#[must_use]
pub fn hash_nothing() -> Hash {
    Hash(Sha256::digest([]).into())
}

/// Hash of a leaf: `H(0x00 ‖ leaf)`.
#[must_use]
pub fn hash_leaf(leaf: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(leaf);
    Hash(hasher.finalize().into())
}

/// Hash of an interior node: `H(0x01 ‖ left ‖ right)`.
#[must_use]
pub fn hash_children(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

/// Incremental Merkle tree state with an O(log n) frontier.
///
/// After `n` appends the frontier holds `n.count_ones()` subtree roots,
/// ordered from the largest subtree to the smallest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollapsedTree {
    size: u64,
    nodes: Vec<Hash>,
}

impl CollapsedTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves appended so far.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends a leaf hash. Amortized O(1): each trailing one-bit of the
    /// new size merges two equal-height subtrees.
    pub fn add(&mut self, leaf_hash: Hash) {
        let mut hash = leaf_hash;
        self.size += 1;
        let mut size = self.size;
        while size % 2 == 0 {
            let left = self
                .nodes
                .pop()
                .expect("collapsed tree frontier out of sync with size");
            hash = hash_children(&left, &hash);
            size /= 2;
        }
        self.nodes.push(hash);
    }

    /// Computes the root of the tree as it stands, padding the unbalanced
    /// frontier upward. O(log n).
    #[must_use]
    pub fn calculate_root(&self) -> Hash {
        let mut nodes = self.nodes.iter().rev();
        let Some(first) = nodes.next() else {
            return hash_nothing();
        };
        nodes.fold(*first, |acc, left| hash_children(left, &acc))
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::HASH_LEN;

    pub fn serialize<S>(bytes: &[u8; HASH_LEN], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; HASH_LEN], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let decoded = STANDARD.decode(&s).map_err(serde::de::Error::custom)?;
        <[u8; HASH_LEN]>::try_from(decoded.as_slice())
            .map_err(|_| serde::de::Error::custom("hash must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference implementation: full recursive tree over the leaf hashes.
    fn naive_root(leaves: &[Hash]) -> Hash {
        match leaves.len() {
            0 => hash_nothing(),
            1 => leaves[0],
            n => {
                // Split at the largest power of two strictly less than n.
                let mut split = 1;
                while split * 2 < n {
                    split *= 2;
                }
                hash_children(&naive_root(&leaves[..split]), &naive_root(&leaves[split..]))
            },
        }
    }

    #[test]
    fn empty_tree_root_is_hash_of_nothing() {
        let tree = CollapsedTree::new();
        assert_eq!(tree.size(), 0);
        assert_eq!(tree.calculate_root(), hash_nothing());
    }

    #[test]
    fn collapsed_root_matches_naive_root() {
        let mut tree = CollapsedTree::new();
        let mut leaves = Vec::new();
        for i in 0u32..130 {
            let leaf = hash_leaf(&i.to_be_bytes());
            leaves.push(leaf);
            tree.add(leaf);
            assert_eq!(tree.size(), u64::from(i) + 1);
            assert_eq!(tree.calculate_root(), naive_root(&leaves), "at size {}", i + 1);
        }
    }

    #[test]
    fn frontier_length_is_popcount_of_size() {
        let mut tree = CollapsedTree::new();
        for i in 0u64..300 {
            tree.add(hash_leaf(&i.to_be_bytes()));
            let n = tree.size();
            assert_eq!(tree.nodes.len(), n.count_ones() as usize, "at size {n}");
        }
    }

    #[test]
    fn json_round_trip_preserves_equality() {
        let mut tree = CollapsedTree::new();
        for i in 0u64..37 {
            tree.add(hash_leaf(&i.to_be_bytes()));
        }
        let encoded = serde_json::to_string(&tree).unwrap();
        let decoded: CollapsedTree = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, tree);
        assert_eq!(decoded.calculate_root(), tree.calculate_root());
    }

    #[test]
    fn two_leaf_root_is_interior_hash() {
        let a = hash_leaf(b"a");
        let b = hash_leaf(b"b");
        let mut tree = CollapsedTree::new();
        tree.add(a);
        tree.add(b);
        assert_eq!(tree.calculate_root(), hash_children(&a, &b));
    }
}
