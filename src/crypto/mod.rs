//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 / HASH160 / HMAC-SHA512 hashing
//! - Base58Check encoding
//! - BIP32 extended public keys (watch-only derivation)

pub mod hash;
pub mod keys;

pub use hash::{
    base58check_decode, base58check_encode, double_sha256, hash160, hmac_sha512, sha256,
};
pub use keys::{ExtendedPubKey, KeyError, HARDENED_KEY_START_INDEX};
