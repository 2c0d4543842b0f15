//! Merkle Digest for Purged Spans
//!
//! When retention discards a ledger prefix, the removed entry hashes are
//! folded into a Merkle root that is kept in the retention anchor. Anyone
//! holding an archive of the removed entries can recompute it.
//!
//! Interior nodes hash the concatenated hex strings of their children; an
//! odd node at the end of a level is paired with itself.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::LedgerError;

fn hash_pair(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Get Merkle root over a list of entry hashes
pub fn get_merkle_root(hashes: &[String]) -> Result<String, LedgerError> {
    if hashes.is_empty() {
        return Err(LedgerError::ValidationError(
            "Cannot build Merkle tree from empty span".to_string(),
        ));
    }

    let mut level: Vec<String> = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                hash_pair(left, pair.get(1).unwrap_or(left))
            })
            .collect();
    }

    let root = level.remove(0);
    debug!("Merkle root over {} hashes: {}", hashes.len(), root);
    Ok(root)
}

/// Verify Merkle root against a list of entry hashes
pub fn verify_merkle_root(hashes: &[String], claimed_root: &str) -> Result<bool, LedgerError> {
    Ok(get_merkle_root(hashes)? == claimed_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| hex::encode(Sha256::digest(format!("entry-{}", i).as_bytes())))
            .collect()
    }

    #[test]
    fn test_single_hash_is_its_own_root() {
        let span = hashes(1);
        assert_eq!(get_merkle_root(&span).unwrap(), span[0]);
    }

    #[test]
    fn test_two_hashes() {
        let span = hashes(2);
        assert_eq!(get_merkle_root(&span).unwrap(), hash_pair(&span[0], &span[1]));
    }

    #[test]
    fn test_odd_count_duplicates_last() {
        let span = hashes(3);
        let expected = hash_pair(&hash_pair(&span[0], &span[1]), &hash_pair(&span[2], &span[2]));
        assert_eq!(get_merkle_root(&span).unwrap(), expected);
    }

    #[test]
    fn test_root_verification() {
        let span = hashes(8);
        let root = get_merkle_root(&span).unwrap();

        assert_eq!(root.len(), 64);
        assert!(verify_merkle_root(&span, &root).unwrap());
        assert!(!verify_merkle_root(&span[1..], &root).unwrap());

        let mut reordered = span.clone();
        reordered.swap(0, 1);
        assert!(!verify_merkle_root(&reordered, &root).unwrap());
    }

    #[test]
    fn test_empty_span_is_rejected() {
        assert!(get_merkle_root(&[]).is_err());
    }
}
