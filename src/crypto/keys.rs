//! BIP32 extended public keys
//!
//! Watch-only key handling: parsing and encoding `xpub`/`tpub` strings and
//! deriving non-hardened children (CKDpub) on the secp256k1 curve.

use std::fmt;
use std::sync::OnceLock;

use secp256k1::{PublicKey, Scalar, Secp256k1, VerifyOnly};
use thiserror::Error;

use super::hash::{base58check_decode, base58check_encode, hash160, hmac_sha512};
use crate::core::Network;

/// First hardened child index (2^31)
pub const HARDENED_KEY_START_INDEX: u32 = 0x8000_0000;

/// Serialized length of an extended key (without checksum)
const EXTENDED_KEY_LEN: usize = 78;

/// Errors that can occur during key operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid Base58Check encoding")]
    InvalidEncoding,
    #[error("Invalid extended key length: {0}")]
    InvalidLength(usize),
    #[error("Extended key version {0:08x} does not belong to network {1}")]
    WrongNetwork(u32, Network),
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Cannot derive hardened child {0} from a public key")]
    HardenedDerivation(u32),
    #[error("Child derivation produced an invalid key at index {0}")]
    InvalidChild(u32),
}

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static SECP: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::verification_only)
}

/// Watch-only extended public key
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ExtendedPubKey {
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
    pub chain_code: [u8; 32],
    pub public_key: PublicKey,
}

impl ExtendedPubKey {
    /// Create a master-level (depth 0) extended key
    pub fn new(public_key: PublicKey, chain_code: [u8; 32]) -> Self {
        Self {
            depth: 0,
            parent_fingerprint: [0; 4],
            child_number: 0,
            chain_code,
            public_key,
        }
    }

    /// Parse an `xpub`/`tpub` string for the given network
    pub fn parse(encoded: &str, network: Network) -> Result<Self, KeyError> {
        let data = base58check_decode(encoded).ok_or(KeyError::InvalidEncoding)?;
        if data.len() != EXTENDED_KEY_LEN {
            return Err(KeyError::InvalidLength(data.len()));
        }

        let version = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if version != network.xpub_version() {
            return Err(KeyError::WrongNetwork(version, network));
        }

        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&data[5..9]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[13..45]);
        let public_key =
            PublicKey::from_slice(&data[45..78]).map_err(|_| KeyError::InvalidPublicKey)?;

        Ok(Self {
            depth: data[4],
            parent_fingerprint,
            child_number: u32::from_be_bytes([data[9], data[10], data[11], data[12]]),
            chain_code,
            public_key,
        })
    }

    /// Encode as Base58Check using the network's version bytes
    pub fn encode(&self, network: Network) -> String {
        let mut data = Vec::with_capacity(EXTENDED_KEY_LEN);
        data.extend_from_slice(&network.xpub_version().to_be_bytes());
        data.push(self.depth);
        data.extend_from_slice(&self.parent_fingerprint);
        data.extend_from_slice(&self.child_number.to_be_bytes());
        data.extend_from_slice(&self.chain_code);
        data.extend_from_slice(&self.public_key.serialize());
        base58check_encode(&data)
    }

    /// Compressed SEC1 encoding of the public key
    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public_key.serialize()
    }

    /// First four bytes of HASH160 of the public key
    pub fn fingerprint(&self) -> [u8; 4] {
        let id = hash160(&self.public_key.serialize());
        [id[0], id[1], id[2], id[3]]
    }

    /// Derive a non-hardened child key (BIP32 CKDpub)
    pub fn derive_child(&self, index: u32) -> Result<ExtendedPubKey, KeyError> {
        if index >= HARDENED_KEY_START_INDEX {
            return Err(KeyError::HardenedDerivation(index));
        }

        let mut data = [0u8; 37];
        data[..33].copy_from_slice(&self.public_key.serialize());
        data[33..].copy_from_slice(&index.to_be_bytes());
        let i = hmac_sha512(&self.chain_code, &data);

        let mut tweak = [0u8; 32];
        tweak.copy_from_slice(&i[..32]);
        let tweak = Scalar::from_be_bytes(tweak).map_err(|_| KeyError::InvalidChild(index))?;
        let public_key = self
            .public_key
            .add_exp_tweak(secp(), &tweak)
            .map_err(|_| KeyError::InvalidChild(index))?;

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&i[32..]);

        Ok(ExtendedPubKey {
            depth: self.depth.wrapping_add(1),
            parent_fingerprint: self.fingerprint(),
            child_number: index,
            chain_code,
            public_key,
        })
    }

    /// Derive along a path of non-hardened indices
    pub fn derive_path(&self, path: &[u32]) -> Result<ExtendedPubKey, KeyError> {
        path.iter()
            .try_fold(self.clone(), |key, index| key.derive_child(*index))
    }
}

impl fmt::Debug for ExtendedPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPubKey")
            .field("depth", &self.depth)
            .field("child_number", &self.child_number)
            .field("public_key", &hex::encode(self.public_key.serialize()))
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    // BIP32 test vector 1, chain m
    const TV1_M_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
    // BIP32 test vector 1, chain m/0H/1 and its parent m/0H
    const TV1_0H_XPUB: &str = "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw";
    const TV1_0H_1_XPUB: &str = "xpub6ASuArnXKPbfEwhqN6e3mwBcDTgzisQN1wXN9BJcM47sSikHjJf3UFHKkNAWbWMiGj7Wf5uMash7SyYq527Hqck2AxYysAA7xmALppuCkwQ";

    #[test]
    fn test_parse_encode_roundtrip() {
        let key = ExtendedPubKey::parse(TV1_M_XPUB, Network::Main).unwrap();
        assert_eq!(key.depth, 0);
        assert_eq!(key.encode(Network::Main), TV1_M_XPUB);
    }

    #[test]
    fn test_public_derivation_matches_bip32_vector() {
        let parent = ExtendedPubKey::parse(TV1_0H_XPUB, Network::Main).unwrap();
        let child = parent.derive_child(1).unwrap();
        assert_eq!(child.encode(Network::Main), TV1_0H_1_XPUB);
    }

    #[test]
    fn test_wrong_network_rejected() {
        let err = ExtendedPubKey::parse(TV1_M_XPUB, Network::Test).unwrap_err();
        assert!(matches!(err, KeyError::WrongNetwork(0x0488_b21e, Network::Test)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(
            ExtendedPubKey::parse("xpubnotakey", Network::Main).unwrap_err(),
            KeyError::InvalidEncoding
        );
    }

    #[test]
    fn test_hardened_derivation_rejected() {
        let key = test_keys::xpub(1);
        assert_eq!(
            key.derive_child(HARDENED_KEY_START_INDEX).unwrap_err(),
            KeyError::HardenedDerivation(HARDENED_KEY_START_INDEX)
        );
    }

    #[test]
    fn test_public_derivation_matches_private_derivation() {
        // CKDpub(K) must equal point(CKDpriv(k)) for non-hardened indices
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let chain_code = [4u8; 32];
        let parent = ExtendedPubKey::new(PublicKey::from_secret_key(&secp, &secret), chain_code);

        let mut data = [0u8; 37];
        data[..33].copy_from_slice(&parent.public_key.serialize());
        data[33..].copy_from_slice(&5u32.to_be_bytes());
        let i = hmac_sha512(&chain_code, &data);
        let mut tweak = [0u8; 32];
        tweak.copy_from_slice(&i[..32]);
        let child_secret = secret
            .add_tweak(&Scalar::from_be_bytes(tweak).unwrap())
            .unwrap();

        let child = parent.derive_child(5).unwrap();
        assert_eq!(child.public_key, PublicKey::from_secret_key(&secp, &child_secret));
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_fingerprint, parent.fingerprint());
    }
}
