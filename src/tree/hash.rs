//! Merkle hashing of leaves and branches.

use sha2::{Digest, Sha256};

use crate::primitives::bytes::var;
use crate::types::{Hash, HASH_LEN};

/// Hash of a tree with no root: SHA-256 of the empty string.
pub fn empty_hash() -> Hash {
    Sha256::digest(b"").into()
}

/// Leaf hash: height 0 and size 1 as zig-zag varints, the version, the
/// length-prefixed key and the length-prefixed SHA-256 of the value.
pub fn leaf_hash(version: u32, key: &[u8], value: &[u8]) -> Hash {
    let mut buf = Vec::with_capacity(key.len() + HASH_LEN + 16);
    var::encode_i64(0, &mut buf);
    var::encode_i64(1, &mut buf);
    var::encode_i64(i64::from(version), &mut buf);
    var::encode_u64(key.len() as u64, &mut buf);
    buf.extend_from_slice(key);
    var::encode_u64(HASH_LEN as u64, &mut buf);
    buf.extend_from_slice(&Sha256::digest(value));
    Sha256::digest(&buf).into()
}

/// Branch hash over height, size, version and both child hashes.
pub fn branch_hash(height: u8, size: i64, version: u32, left: &Hash, right: &Hash) -> Hash {
    let mut buf = Vec::with_capacity(2 * HASH_LEN + 24);
    var::encode_i64(i64::from(height), &mut buf);
    var::encode_i64(size, &mut buf);
    var::encode_i64(i64::from(version), &mut buf);
    var::encode_u64(HASH_LEN as u64, &mut buf);
    buf.extend_from_slice(left);
    var::encode_u64(HASH_LEN as u64, &mut buf);
    buf.extend_from_slice(right);
    Sha256::digest(&buf).into()
}
