//! Script templates for output locking conditions
//!
//! Builds and classifies the standard Bitcoin output scripts a derivation
//! scheme can produce, and renders them as addresses for a network.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use super::network::Network;
use crate::crypto::{base58check_encode, hash160, sha256};

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_0: u8 = 0x00;
pub const OP_PUSHBYTES_20: u8 = 0x14;
pub const OP_PUSHBYTES_32: u8 = 0x20;
pub const OP_PUSHBYTES_33: u8 = 0x21;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

/// Largest key count a bare CHECKMULTISIG template can express
pub const MAX_MULTISIG_KEYS: usize = 16;

// =============================================================================
// Script Errors
// =============================================================================

/// Script-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Invalid multisig threshold: {0} of {1}")]
    InvalidThreshold(usize, usize),
    #[error("Too many keys for multisig: {0} (max: {1})")]
    TooManyKeys(usize, usize),
    #[error("Invalid script hex: {0}")]
    InvalidHex(String),
}

// =============================================================================
// Script Types
// =============================================================================

/// Standard output template recognised in a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptType {
    /// OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    P2PKH,
    /// OP_HASH160 <20> OP_EQUAL
    P2SH,
    /// OP_0 <20>
    P2WPKH,
    /// OP_0 <32>
    P2WSH,
    /// OP_M <pubkeys> OP_N OP_CHECKMULTISIG
    MultiSig,
    NonStandard,
}

impl ScriptType {
    /// Check if this is a SegWit script type
    pub fn is_segwit(&self) -> bool {
        matches!(self, ScriptType::P2WPKH | ScriptType::P2WSH)
    }
}

// =============================================================================
// Script
// =============================================================================

/// Raw script bytes
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Script(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, ScriptError> {
        hex::decode(s)
            .map(Script)
            .map_err(|_| ScriptError::InvalidHex(s.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Pay to public key hash of a compressed key
    pub fn p2pkh(public_key: &[u8]) -> Self {
        let mut bytes = vec![OP_DUP, OP_HASH160, OP_PUSHBYTES_20];
        bytes.extend_from_slice(&hash160(public_key));
        bytes.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        Script(bytes)
    }

    /// Native segwit v0 pay to witness public key hash
    pub fn p2wpkh(public_key: &[u8]) -> Self {
        let mut bytes = vec![OP_0, OP_PUSHBYTES_20];
        bytes.extend_from_slice(&hash160(public_key));
        Script(bytes)
    }

    /// Pay to script hash: HASH160 of the redeem script
    pub fn p2sh(redeem: &Script) -> Self {
        let mut bytes = vec![OP_HASH160, OP_PUSHBYTES_20];
        bytes.extend_from_slice(&hash160(&redeem.0));
        bytes.push(OP_EQUAL);
        Script(bytes)
    }

    /// Native segwit v0 pay to witness script hash: SHA-256 of the witness script
    pub fn p2wsh(witness_script: &Script) -> Self {
        let mut bytes = vec![OP_0, OP_PUSHBYTES_32];
        bytes.extend_from_slice(&sha256(&witness_script.0));
        Script(bytes)
    }

    /// `OP_M <key>... OP_N OP_CHECKMULTISIG` over compressed keys, in the given order
    pub fn multisig(threshold: usize, public_keys: &[[u8; 33]]) -> Result<Self, ScriptError> {
        let total = public_keys.len();
        if total > MAX_MULTISIG_KEYS {
            return Err(ScriptError::TooManyKeys(total, MAX_MULTISIG_KEYS));
        }
        if threshold == 0 || threshold > total {
            return Err(ScriptError::InvalidThreshold(threshold, total));
        }

        let mut bytes = Vec::with_capacity(3 + total * 34);
        bytes.push(small_int(threshold));
        for key in public_keys {
            bytes.push(OP_PUSHBYTES_33);
            bytes.extend_from_slice(key);
        }
        bytes.push(small_int(total));
        bytes.push(OP_CHECKMULTISIG);
        Ok(Script(bytes))
    }

    /// Classify the script against the standard templates
    pub fn script_type(&self) -> ScriptType {
        let b = &self.0;
        match b.len() {
            25 if b[0] == OP_DUP
                && b[1] == OP_HASH160
                && b[2] == OP_PUSHBYTES_20
                && b[23] == OP_EQUALVERIFY
                && b[24] == OP_CHECKSIG =>
            {
                ScriptType::P2PKH
            }
            23 if b[0] == OP_HASH160 && b[1] == OP_PUSHBYTES_20 && b[22] == OP_EQUAL => {
                ScriptType::P2SH
            }
            22 if b[0] == OP_0 && b[1] == OP_PUSHBYTES_20 => ScriptType::P2WPKH,
            34 if b[0] == OP_0 && b[1] == OP_PUSHBYTES_32 => ScriptType::P2WSH,
            _ if self.multisig_keys().is_some() => ScriptType::MultiSig,
            _ => ScriptType::NonStandard,
        }
    }

    /// Threshold and keys of a bare multisig script
    pub fn multisig_keys(&self) -> Option<(usize, Vec<[u8; 33]>)> {
        let b = &self.0;
        if b.len() < 3 || *b.last()? != OP_CHECKMULTISIG {
            return None;
        }
        let threshold = from_small_int(b[0])?;
        let total = from_small_int(b[b.len() - 2])?;
        if b.len() != 3 + total * 34 || threshold > total {
            return None;
        }

        let mut keys = Vec::with_capacity(total);
        for chunk in b[1..b.len() - 2].chunks(34) {
            if chunk[0] != OP_PUSHBYTES_33 {
                return None;
            }
            let mut key = [0u8; 33];
            key.copy_from_slice(&chunk[1..]);
            keys.push(key);
        }
        Some((threshold, keys))
    }

    /// Render the script as an address, if it follows an addressable template
    pub fn address(&self, network: Network) -> Option<String> {
        let b = &self.0;
        match self.script_type() {
            ScriptType::P2PKH => {
                let mut payload = vec![network.p2pkh_prefix()];
                payload.extend_from_slice(&b[3..23]);
                Some(base58check_encode(&payload))
            }
            ScriptType::P2SH => {
                let mut payload = vec![network.p2sh_prefix()];
                payload.extend_from_slice(&b[2..22]);
                Some(base58check_encode(&payload))
            }
            ScriptType::P2WPKH | ScriptType::P2WSH => {
                bech32::segwit::encode_v0(network.bech32_hrp(), &b[2..]).ok()
            }
            ScriptType::MultiSig | ScriptType::NonStandard => None,
        }
    }
}

fn small_int(n: usize) -> u8 {
    OP_1 + (n as u8) - 1
}

fn from_small_int(op: u8) -> Option<usize> {
    if (OP_1..=OP_16).contains(&op) {
        Some((op - OP_1) as usize + 1)
    } else {
        None
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", self.to_hex())
    }
}

impl Serialize for Script {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Script {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Script::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Generator point G, compressed
    const G: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn g() -> [u8; 33] {
        let mut key = [0u8; 33];
        key.copy_from_slice(&hex::decode(G).unwrap());
        key
    }

    #[test]
    fn test_p2pkh_address() {
        let script = Script::p2pkh(&g());
        assert_eq!(script.script_type(), ScriptType::P2PKH);
        assert_eq!(
            script.to_hex(),
            "76a914751e76e8199196d454941c45d1b3a323f1433bd688ac"
        );
        assert_eq!(
            script.address(Network::Main).unwrap(),
            "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"
        );
    }

    #[test]
    fn test_p2wpkh_address() {
        let script = Script::p2wpkh(&g());
        assert_eq!(script.script_type(), ScriptType::P2WPKH);
        assert!(script.script_type().is_segwit());
        assert_eq!(
            script.address(Network::Main).unwrap(),
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"
        );
    }

    #[test]
    fn test_multisig_template() {
        let script = Script::multisig(1, &[g(), g()]).unwrap();
        assert_eq!(script.script_type(), ScriptType::MultiSig);
        assert_eq!(script.as_bytes()[0], OP_1);
        assert_eq!(script.as_bytes()[script.len() - 2], OP_1 + 1);
        let (threshold, keys) = script.multisig_keys().unwrap();
        assert_eq!(threshold, 1);
        assert_eq!(keys.len(), 2);
        assert!(script.address(Network::Main).is_none());
    }

    #[test]
    fn test_multisig_rejects_bad_threshold() {
        assert_eq!(
            Script::multisig(3, &[g(), g()]).unwrap_err(),
            ScriptError::InvalidThreshold(3, 2)
        );
        assert_eq!(
            Script::multisig(0, &[g()]).unwrap_err(),
            ScriptError::InvalidThreshold(0, 1)
        );
    }

    #[test]
    fn test_wrappers() {
        let redeem = Script::multisig(1, &[g()]).unwrap();
        let p2sh = Script::p2sh(&redeem);
        let p2wsh = Script::p2wsh(&redeem);
        assert_eq!(p2sh.script_type(), ScriptType::P2SH);
        assert_eq!(p2wsh.script_type(), ScriptType::P2WSH);
        assert!(p2sh.address(Network::Test).unwrap().starts_with('2'));
        assert!(p2wsh.address(Network::Regtest).unwrap().starts_with("bcrt1q"));
    }

    #[test]
    fn test_serde_as_hex() {
        let script = Script::p2wpkh(&g());
        let json = serde_json::to_string(&script).unwrap();
        assert_eq!(json, format!("\"{}\"", script.to_hex()));
        let back: Script = serde_json::from_str(&json).unwrap();
        assert_eq!(back, script);
    }
}
