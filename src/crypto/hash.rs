//! Cryptographic hashing utilities
//!
//! Provides the SHA-256, RIPEMD-160 and HMAC-SHA512 compositions used for
//! script hashes, transaction IDs, Base58Check checksums and BIP32 child
//! key derivation.

use ripemd::Ripemd160;
use ring::hmac;
use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for transaction IDs and Base58Check checksums
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Computes RIPEMD-160 of SHA-256 (Bitcoin's HASH160)
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha256(data));
    ripemd.finalize().into()
}

/// Computes HMAC-SHA512 of `data` keyed with `key`
pub fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let key = hmac::Key::new(hmac::HMAC_SHA512, key);
    let tag = hmac::sign(&key, data);
    let mut out = [0u8; 64];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Encodes a payload as Base58Check (payload || first 4 bytes of double SHA-256)
pub fn base58check_encode(payload: &[u8]) -> String {
    let checksum = double_sha256(payload);
    let mut bytes = Vec::with_capacity(payload.len() + 4);
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(&checksum[..4]);
    bs58::encode(bytes).into_string()
}

/// Decodes a Base58Check string, returning the payload when the checksum matches
pub fn base58check_decode(encoded: &str) -> Option<Vec<u8>> {
    let mut bytes = bs58::decode(encoded).into_vec().ok()?;
    if bytes.len() < 4 {
        return None;
    }
    let checksum = bytes.split_off(bytes.len() - 4);
    if double_sha256(&bytes)[..4] != checksum[..] {
        return None;
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        let hash = sha256(data);
        assert_eq!(hash.len(), 32);
        assert_eq!(
            hex::encode(hash),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hash160_of_empty_input() {
        assert_eq!(
            hex::encode(hash160(b"")),
            "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb"
        );
    }

    #[test]
    fn test_hmac_sha512_rfc4231_case2() {
        let mac = hmac_sha512(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "164b7a7bfcf819e2e395fbe73b56e0a387bd64222e831fd610270cd7ea250554\
             9758bf75c05a994a6d034f65f8f0e6fdcaeab1a34d4a6b4b636e070a38bce737"
        );
    }

    #[test]
    fn test_base58check_roundtrip_and_corruption() {
        let payload = [0x00u8, 1, 2, 3, 4, 5];
        let encoded = base58check_encode(&payload);
        assert_eq!(base58check_decode(&encoded).unwrap(), payload);

        let mut corrupted = encoded.clone();
        let last = corrupted.pop().unwrap();
        corrupted.push(if last == '1' { '2' } else { '1' });
        assert!(base58check_decode(&corrupted).is_none());
    }
}
