use crate::hash::{double_sha256, Hash};

/// Merkle tree over transaction ids, built bottom-up with the usual
/// odd-node duplication rule.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// Nodes at each level of the tree (leaves at level 0).
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Creates a new merkle tree from a list of transaction ids.
    pub fn from_hashes(hashes: Vec<Hash>) -> Self {
        if hashes.is_empty() {
            return Self { levels: vec![] };
        }

        let mut levels = Vec::new();
        levels.push(hashes);

        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let current = levels.last().cloned().unwrap_or_default();
            let mut next = Vec::with_capacity(current.len().div_ceil(2));

            for chunk in current.chunks(2) {
                let left = chunk[0];
                let right = if chunk.len() == 2 { chunk[1] } else { left };
                next.push(hash_pair(&left, &right));
            }

            levels.push(next);
        }

        Self { levels }
    }

    /// Returns the merkle root.
    pub fn root(&self) -> Hash {
        self.levels.last().and_then(|level| level.first()).copied().unwrap_or_default()
    }
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(left.as_bytes());
    bytes[32..].copy_from_slice(right.as_bytes());
    double_sha256(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u64) -> Hash {
        Hash::from_le_u64([n, 0, 0, 0])
    }

    #[test]
    fn single_leaf_is_the_root() {
        let tree = MerkleTree::from_hashes(vec![h(1)]);
        assert_eq!(tree.root(), h(1));
    }

    #[test]
    fn two_leaves_hash_together() {
        let tree = MerkleTree::from_hashes(vec![h(1), h(2)]);
        assert_eq!(tree.root(), hash_pair(&h(1), &h(2)));
    }

    #[test]
    fn odd_level_duplicates_last() {
        let tree = MerkleTree::from_hashes(vec![h(1), h(2), h(3)]);
        let expected = hash_pair(&hash_pair(&h(1), &h(2)), &hash_pair(&h(3), &h(3)));
        assert_eq!(tree.root(), expected);
    }

    #[test]
    fn empty_tree_has_zero_root() {
        assert_eq!(MerkleTree::from_hashes(vec![]).root(), Hash::default());
    }

    #[test]
    fn root_depends_on_order() {
        let a = MerkleTree::from_hashes(vec![h(1), h(2)]).root();
        let b = MerkleTree::from_hashes(vec![h(2), h(1)]).root();
        assert_ne!(a, b);
    }
}
