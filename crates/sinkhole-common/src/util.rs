use sha2::Digest as _;

/// SHA-256 of `data`, hex-encoded.
pub fn hash_to_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(sha2::Sha256::digest(data))
}
