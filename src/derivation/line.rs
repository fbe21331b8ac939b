//! Script derivation along a feature subtree
//!
//! A [`DerivationLine`] fixes (scheme, feature) and caches the feature-level
//! child keys, so deriving index `i` costs one child derivation per key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::scheme::{DerivationScheme, KeyOrdering, SchemeVariant, ScriptKind};
use crate::core::{Script, ScriptError};
use crate::crypto::{ExtendedPubKey, KeyError};

/// Errors raised while deriving scripts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    #[error("Key derivation failed: {0}")]
    Key(#[from] KeyError),
    #[error("Script construction failed: {0}")]
    Script(#[from] ScriptError),
}

// =============================================================================
// Feature
// =============================================================================

/// Independent derivation subtree of a scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// External (receive) addresses, subtree 0
    Deposit,
    /// Internal (change) addresses, subtree 1
    Change,
}

impl Feature {
    pub const ALL: [Feature; 2] = [Feature::Deposit, Feature::Change];

    /// Child index of the subtree under the scheme's keys
    pub fn index(&self) -> u32 {
        match self {
            Feature::Deposit => 0,
            Feature::Change => 1,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Feature::Deposit),
            1 => Some(Feature::Change),
            _ => None,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Deposit => f.write_str("deposit"),
            Feature::Change => f.write_str("change"),
        }
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deposit" | "0" => Ok(Feature::Deposit),
            "change" | "1" => Ok(Feature::Change),
            other => Err(format!("unknown feature: {}", other)),
        }
    }
}

// =============================================================================
// Derived Output
// =============================================================================

/// Script derived for (scheme, feature, index)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedOutput {
    /// Canonical string of the originating scheme
    pub scheme: String,
    pub feature: Feature,
    pub index: u32,
    pub script_pubkey: Script,
    /// Redeem script for P2SH variants, witness script for P2WSH variants
    pub redeem: Option<Script>,
}

// =============================================================================
// Derivation Line
// =============================================================================

/// Derivation of one (scheme, feature) sequence
#[derive(Debug, Clone)]
pub struct DerivationLine<'a> {
    scheme: &'a DerivationScheme,
    feature: Feature,
    keys: Vec<ExtendedPubKey>,
}

impl<'a> DerivationLine<'a> {
    pub(crate) fn new(
        scheme: &'a DerivationScheme,
        feature: Feature,
    ) -> Result<Self, DerivationError> {
        let keys = scheme
            .keys()
            .into_iter()
            .map(|key| key.derive_child(feature.index()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            scheme,
            feature,
            keys,
        })
    }

    pub fn feature(&self) -> Feature {
        self.feature
    }

    pub fn scheme(&self) -> &DerivationScheme {
        self.scheme
    }

    /// Derive the output script at `index`
    pub fn derive(&self, index: u32) -> Result<DerivedOutput, DerivationError> {
        let public_keys = self
            .keys
            .iter()
            .map(|key| key.derive_child(index).map(|child| child.public_key_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let (script_pubkey, redeem) = match self.scheme.variant() {
            SchemeVariant::Direct { script, .. } => {
                let key = &public_keys[0];
                match script {
                    ScriptKind::Legacy => (Script::p2pkh(key), None),
                    ScriptKind::Segwit => (Script::p2wpkh(key), None),
                    ScriptKind::P2shSegwit => {
                        let redeem = Script::p2wpkh(key);
                        (Script::p2sh(&redeem), Some(redeem))
                    }
                }
            }
            SchemeVariant::Multisig {
                threshold,
                script,
                ordering,
                ..
            } => {
                let mut public_keys = public_keys;
                if *ordering == KeyOrdering::Lexicographic {
                    public_keys.sort();
                }
                let multisig = Script::multisig(*threshold, &public_keys)?;
                let script_pubkey = match script {
                    ScriptKind::Legacy => Script::p2sh(&multisig),
                    ScriptKind::Segwit => Script::p2wsh(&multisig),
                    ScriptKind::P2shSegwit => Script::p2sh(&Script::p2wsh(&multisig)),
                };
                (script_pubkey, Some(multisig))
            }
        };

        Ok(DerivedOutput {
            scheme: self.scheme.as_str().to_string(),
            feature: self.feature,
            index,
            script_pubkey,
            redeem,
        })
    }

    /// Derive every index in `range`
    pub fn derive_range(
        &self,
        range: std::ops::Range<u32>,
    ) -> Result<Vec<DerivedOutput>, DerivationError> {
        range.map(|index| self.derive(index)).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Network, ScriptType};
    use crate::crypto::keys::test_keys;
    use crate::derivation::SchemeParser;
    use std::collections::HashSet;

    const TOTO: &str = "xpub661MyMwAqRbcFqyJE6zy5jMF7bjUtvNHgHJPbENEZtEQKRrukKWJP5xLMKntBaNya7CLMLL6u1KEk8GnrEv8pur5DFSgEMf1hRGjsJrcQKS";
    const TATA: &str = "xpub661MyMwAqRbcFiadHioAunPTeic3C17HKPABCBvURz3W2ivn63jzEYYXWpDePLGncjLuRvQKx7jrKweSkoEvgQTvAo5zw4z8HPGC8Y4E4Wr";
    const TOTO_0_1: &str = "03d15f88de692693e0c25cec27b68da49ae4c29805efbe08154c4acfdf951ccb54";
    const TATA_0_1: &str = "025ca59b2007a67f24fdd26acefbe8feb5e8849c207d504b16d4801a8290fe9409";

    fn main_parser() -> SchemeParser {
        SchemeParser::new(Network::Main)
    }

    fn child_key(xpub: &str, path: &[u32]) -> [u8; 33] {
        ExtendedPubKey::parse(xpub, Network::Main)
            .unwrap()
            .derive_path(path)
            .unwrap()
            .public_key_bytes()
    }

    #[test]
    fn test_direct_legacy() {
        let scheme = main_parser().parse(&format!("{}-[legacy]", TOTO)).unwrap();
        let out = scheme.derive(Feature::Deposit, 1).unwrap();
        assert_eq!(out.script_pubkey, Script::p2pkh(&child_key(TOTO, &[0, 1])));
        assert!(out.redeem.is_none());
        assert_eq!(out.scheme, scheme.as_str());
    }

    #[test]
    fn test_direct_segwit() {
        let scheme = main_parser().parse(TOTO).unwrap();
        let out = scheme.derive(Feature::Deposit, 1).unwrap();
        assert_eq!(out.script_pubkey, Script::p2wpkh(&child_key(TOTO, &[0, 1])));
        assert!(out.redeem.is_none());
    }

    #[test]
    fn test_direct_p2sh_segwit() {
        let scheme = main_parser().parse(&format!("{}-[p2sh]", TOTO)).unwrap();
        let out = scheme.derive(Feature::Deposit, 1).unwrap();
        let witness_program = Script::p2wpkh(&child_key(TOTO, &[0, 1]));
        assert_eq!(out.script_pubkey, Script::p2sh(&witness_program));
        assert_eq!(out.redeem, Some(witness_program));
    }

    #[test]
    fn test_multisig_lexicographic_order() {
        let scheme = main_parser()
            .parse(&format!("2-of-{}-{}-[legacy]", TOTO, TATA))
            .unwrap();
        let out = scheme.derive(Feature::Deposit, 1).unwrap();
        let redeem = out.redeem.unwrap();
        let (threshold, keys) = redeem.multisig_keys().unwrap();
        assert_eq!(threshold, 2);
        assert_eq!(hex::encode(keys[0]), TATA_0_1);
        assert_eq!(hex::encode(keys[1]), TOTO_0_1);
        assert_eq!(out.script_pubkey, Script::p2sh(&redeem));
    }

    #[test]
    fn test_multisig_keeporder() {
        let scheme = main_parser()
            .parse(&format!("2-of-{}-{}-[legacy]-[keeporder]", TOTO, TATA))
            .unwrap();
        let redeem = scheme.derive(Feature::Deposit, 1).unwrap().redeem.unwrap();
        let (_, keys) = redeem.multisig_keys().unwrap();
        assert_eq!(hex::encode(keys[0]), TOTO_0_1);
        assert_eq!(hex::encode(keys[1]), TATA_0_1);
    }

    #[test]
    fn test_sorted_multisig_ignores_declaration_order() {
        let ab = main_parser().parse(&format!("2-of-{}-{}", TOTO, TATA)).unwrap();
        let ba = main_parser().parse(&format!("2-of-{}-{}", TATA, TOTO)).unwrap();
        assert_ne!(ab, ba);
        for index in 0..5 {
            assert_eq!(
                ab.derive(Feature::Change, index).unwrap().redeem,
                ba.derive(Feature::Change, index).unwrap().redeem
            );
        }
    }

    #[test]
    fn test_multisig_script_families() {
        let p2wsh = main_parser().parse(&format!("2-of-{}-{}", TOTO, TATA)).unwrap();
        let out = p2wsh.derive(Feature::Deposit, 1).unwrap();
        assert_eq!(out.script_pubkey.script_type(), ScriptType::P2WSH);
        assert_eq!(out.redeem.as_ref().unwrap().script_type(), ScriptType::MultiSig);
        assert_eq!(out.script_pubkey, Script::p2wsh(out.redeem.as_ref().unwrap()));

        let wrapped = main_parser()
            .parse(&format!("2-of-{}-{}-[p2sh]", TOTO, TATA))
            .unwrap();
        let out = wrapped.derive(Feature::Deposit, 1).unwrap();
        assert_eq!(out.script_pubkey.script_type(), ScriptType::P2SH);
        let redeem = out.redeem.unwrap();
        assert_eq!(redeem.script_type(), ScriptType::MultiSig);
        assert_eq!(out.script_pubkey, Script::p2sh(&Script::p2wsh(&redeem)));
    }

    #[test]
    fn test_derivation_is_deterministic_and_injective() {
        let scheme = SchemeParser::new(Network::Regtest)
            .parse(&test_keys::xpub(5).encode(Network::Regtest))
            .unwrap();
        let line = scheme.line(Feature::Deposit).unwrap();
        let outputs = line.derive_range(0..50).unwrap();
        let again = line.derive_range(0..50).unwrap();
        assert_eq!(outputs, again);

        let distinct: HashSet<_> = outputs.iter().map(|o| o.script_pubkey.clone()).collect();
        assert_eq!(distinct.len(), 50);

        let change = scheme.derive(Feature::Change, 0).unwrap();
        assert_ne!(change.script_pubkey, outputs[0].script_pubkey);
    }

    #[test]
    fn test_feature_parsing() {
        assert_eq!("deposit".parse::<Feature>().unwrap(), Feature::Deposit);
        assert_eq!("1".parse::<Feature>().unwrap(), Feature::Change);
        assert!("savings".parse::<Feature>().is_err());
        assert_eq!(Feature::from_index(1), Some(Feature::Change));
        assert_eq!(Feature::Change.to_string(), "change");
    }
}
