//! Derivation scheme descriptors
//!
//! A scheme is written as `[M-of-]Key[-Key...][-[legacy|p2sh]][-[keeporder]]`.
//! Native segwit is the default script family; `legacy` selects the
//! pre-segwit templates and `p2sh` wraps the segwit program in P2SH.
//! Multisig keys are sorted before building the redeem script unless
//! `keeporder` is given.
//!
//! Schemes are identified by their canonical string: two schemes are equal
//! exactly when they serialize to the same text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

use super::line::{DerivationError, DerivationLine, DerivedOutput, Feature};
use crate::core::{Network, MAX_MULTISIG_KEYS};
use crate::crypto::{ExtendedPubKey, KeyError};

const TAG_LEGACY: &str = "legacy";
const TAG_P2SH: &str = "p2sh";
const TAG_KEEP_ORDER: &str = "keeporder";

// =============================================================================
// Errors
// =============================================================================

/// Malformed scheme descriptor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemeParseError {
    #[error("Empty derivation scheme")]
    Empty,
    #[error("Malformed derivation scheme: {0}")]
    Malformed(String),
    #[error("Unknown tag [{0}]")]
    UnknownTag(String),
    #[error("Tag [{0}] given more than once")]
    DuplicateTag(String),
    #[error("Tags [legacy] and [p2sh] cannot be combined")]
    ConflictingTags,
    #[error("Tag [keeporder] only applies to multisig schemes")]
    KeepOrderWithoutMultisig,
    #[error("Invalid threshold {0} for {1} keys")]
    InvalidThreshold(String, usize),
    #[error("Too many keys: {0} (max: {1})")]
    TooManyKeys(usize, usize),
    #[error("Invalid extended public key {key}: {source}")]
    InvalidKey {
        key: String,
        #[source]
        source: KeyError,
    },
}

// =============================================================================
// Scheme Variants
// =============================================================================

/// Script family a scheme produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptKind {
    /// P2PKH for single keys, P2SH(multisig) for multisig
    Legacy,
    /// P2WPKH for single keys, P2WSH(multisig) for multisig
    Segwit,
    /// The segwit program wrapped in P2SH
    P2shSegwit,
}

impl ScriptKind {
    fn tag(&self) -> Option<&'static str> {
        match self {
            ScriptKind::Legacy => Some(TAG_LEGACY),
            ScriptKind::Segwit => None,
            ScriptKind::P2shSegwit => Some(TAG_P2SH),
        }
    }
}

/// How multisig keys are arranged in the redeem script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyOrdering {
    /// Keys sorted by serialized bytes (BIP67)
    Lexicographic,
    /// Keys kept in declaration order
    Declared,
}

/// The closed set of scheme shapes
#[derive(Debug, Clone)]
pub enum SchemeVariant {
    Direct {
        key: ExtendedPubKey,
        script: ScriptKind,
    },
    Multisig {
        threshold: usize,
        keys: Vec<ExtendedPubKey>,
        script: ScriptKind,
        ordering: KeyOrdering,
    },
}

// =============================================================================
// Derivation Scheme
// =============================================================================

/// Immutable, canonically serialized derivation scheme
#[derive(Debug, Clone)]
pub struct DerivationScheme {
    network: Network,
    canonical: String,
    variant: SchemeVariant,
}

impl DerivationScheme {
    /// Build a single-key scheme
    pub fn direct(key: ExtendedPubKey, script: ScriptKind, network: Network) -> Self {
        let variant = SchemeVariant::Direct { key, script };
        Self::from_variant(variant, network)
    }

    /// Build a threshold multisig scheme
    pub fn multisig(
        threshold: usize,
        keys: Vec<ExtendedPubKey>,
        script: ScriptKind,
        ordering: KeyOrdering,
        network: Network,
    ) -> Result<Self, SchemeParseError> {
        validate_multisig(threshold, keys.len())?;
        let variant = SchemeVariant::Multisig {
            threshold,
            keys,
            script,
            ordering,
        };
        Ok(Self::from_variant(variant, network))
    }

    fn from_variant(variant: SchemeVariant, network: Network) -> Self {
        let canonical = canonical_string(&variant, network);
        Self {
            network,
            canonical,
            variant,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn variant(&self) -> &SchemeVariant {
        &self.variant
    }

    /// Canonical descriptor string; the scheme's identity
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn script_kind(&self) -> ScriptKind {
        match &self.variant {
            SchemeVariant::Direct { script, .. } | SchemeVariant::Multisig { script, .. } => {
                *script
            }
        }
    }

    /// Signatures required to spend (1 for single-key schemes)
    pub fn threshold(&self) -> usize {
        match &self.variant {
            SchemeVariant::Direct { .. } => 1,
            SchemeVariant::Multisig { threshold, .. } => *threshold,
        }
    }

    /// Extended keys in declaration order
    pub fn keys(&self) -> Vec<&ExtendedPubKey> {
        match &self.variant {
            SchemeVariant::Direct { key, .. } => vec![key],
            SchemeVariant::Multisig { keys, .. } => keys.iter().collect(),
        }
    }

    pub fn is_multisig(&self) -> bool {
        matches!(self.variant, SchemeVariant::Multisig { .. })
    }

    /// Prepare derivation along one feature subtree
    pub fn line(&self, feature: Feature) -> Result<DerivationLine, DerivationError> {
        DerivationLine::new(self, feature)
    }

    /// Derive the output at (feature, index)
    pub fn derive(&self, feature: Feature, index: u32) -> Result<DerivedOutput, DerivationError> {
        self.line(feature)?.derive(index)
    }
}

impl PartialEq for DerivationScheme {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for DerivationScheme {}

impl Hash for DerivationScheme {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for DerivationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

fn validate_multisig(threshold: usize, total: usize) -> Result<(), SchemeParseError> {
    if total > MAX_MULTISIG_KEYS {
        return Err(SchemeParseError::TooManyKeys(total, MAX_MULTISIG_KEYS));
    }
    if threshold == 0 || threshold > total {
        return Err(SchemeParseError::InvalidThreshold(threshold.to_string(), total));
    }
    Ok(())
}

fn canonical_string(variant: &SchemeVariant, network: Network) -> String {
    let mut out = String::new();
    let (script, keep_order) = match variant {
        SchemeVariant::Direct { key, script } => {
            out.push_str(&key.encode(network));
            (*script, false)
        }
        SchemeVariant::Multisig {
            threshold,
            keys,
            script,
            ordering,
        } => {
            out.push_str(&format!("{}-of-", threshold));
            let encoded: Vec<String> = keys.iter().map(|k| k.encode(network)).collect();
            out.push_str(&encoded.join("-"));
            (*script, *ordering == KeyOrdering::Declared)
        }
    };
    if let Some(tag) = script.tag() {
        out.push_str(&format!("-[{}]", tag));
    }
    if keep_order {
        out.push_str(&format!("-[{}]", TAG_KEEP_ORDER));
    }
    out
}

// =============================================================================
// Parser
// =============================================================================

/// Parses scheme descriptors for one network
#[derive(Debug, Clone, Copy)]
pub struct SchemeParser {
    network: Network,
}

impl SchemeParser {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Parse a descriptor string
    pub fn parse(&self, input: &str) -> Result<DerivationScheme, SchemeParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SchemeParseError::Empty);
        }

        let mut pieces = input.split("-[");
        let body = pieces.next().unwrap_or_default();
        let mut legacy = false;
        let mut p2sh = false;
        let mut keep_order = false;
        for piece in pieces {
            let tag = piece
                .strip_suffix(']')
                .filter(|tag| !tag.contains(['[', ']', '-']))
                .ok_or_else(|| SchemeParseError::Malformed(input.to_string()))?;
            let flag = match tag {
                TAG_LEGACY => &mut legacy,
                TAG_P2SH => &mut p2sh,
                TAG_KEEP_ORDER => &mut keep_order,
                other => return Err(SchemeParseError::UnknownTag(other.to_string())),
            };
            if *flag {
                return Err(SchemeParseError::DuplicateTag(tag.to_string()));
            }
            *flag = true;
        }

        let script = match (legacy, p2sh) {
            (true, true) => return Err(SchemeParseError::ConflictingTags),
            (true, false) => ScriptKind::Legacy,
            (false, true) => ScriptKind::P2shSegwit,
            (false, false) => ScriptKind::Segwit,
        };

        match body.split_once("-of-") {
            Some((threshold, keys)) => {
                let keys = keys
                    .split('-')
                    .map(|k| self.parse_key(k))
                    .collect::<Result<Vec<_>, _>>()?;
                let threshold: usize = threshold.parse().map_err(|_| {
                    SchemeParseError::InvalidThreshold(threshold.to_string(), keys.len())
                })?;
                let ordering = if keep_order {
                    KeyOrdering::Declared
                } else {
                    KeyOrdering::Lexicographic
                };
                DerivationScheme::multisig(threshold, keys, script, ordering, self.network)
            }
            None => {
                if keep_order {
                    return Err(SchemeParseError::KeepOrderWithoutMultisig);
                }
                if body.contains('-') {
                    return Err(SchemeParseError::Malformed(input.to_string()));
                }
                let key = self.parse_key(body)?;
                Ok(DerivationScheme::direct(key, script, self.network))
            }
        }
    }

    fn parse_key(&self, key: &str) -> Result<ExtendedPubKey, SchemeParseError> {
        if key.is_empty() {
            return Err(SchemeParseError::Malformed(key.to_string()));
        }
        ExtendedPubKey::parse(key, self.network).map_err(|source| SchemeParseError::InvalidKey {
            key: key.to_string(),
            source,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::test_keys;

    fn encoded(seed: u8) -> String {
        test_keys::xpub(seed).encode(Network::Regtest)
    }

    fn parser() -> SchemeParser {
        SchemeParser::new(Network::Regtest)
    }

    #[test]
    fn test_parse_direct_variants() {
        let a = encoded(1);
        let segwit = parser().parse(&a).unwrap();
        assert_eq!(segwit.script_kind(), ScriptKind::Segwit);
        assert!(!segwit.is_multisig());
        assert_eq!(segwit.as_str(), a);

        let legacy = parser().parse(&format!("{}-[legacy]", a)).unwrap();
        assert_eq!(legacy.script_kind(), ScriptKind::Legacy);

        let p2sh = parser().parse(&format!("{}-[p2sh]", a)).unwrap();
        assert_eq!(p2sh.script_kind(), ScriptKind::P2shSegwit);
        assert_eq!(p2sh.threshold(), 1);
    }

    #[test]
    fn test_parse_multisig() {
        let (a, b, c) = (encoded(1), encoded(2), encoded(3));
        let scheme = parser()
            .parse(&format!("2-of-{}-{}-{}-[legacy]-[keeporder]", a, b, c))
            .unwrap();
        assert!(scheme.is_multisig());
        assert_eq!(scheme.threshold(), 2);
        assert_eq!(scheme.keys().len(), 3);
        assert_eq!(scheme.script_kind(), ScriptKind::Legacy);
        match scheme.variant() {
            SchemeVariant::Multisig { ordering, .. } => {
                assert_eq!(*ordering, KeyOrdering::Declared)
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_canonical_roundtrip() {
        let (a, b) = (encoded(1), encoded(2));
        for text in [
            a.clone(),
            format!("{}-[legacy]", a),
            format!("{}-[p2sh]", a),
            format!("1-of-{}-{}", a, b),
            format!("2-of-{}-{}-[p2sh]", a, b),
            format!("2-of-{}-{}-[legacy]-[keeporder]", a, b),
        ] {
            let scheme = parser().parse(&text).unwrap();
            assert_eq!(scheme.to_string(), text);
            assert_eq!(parser().parse(scheme.as_str()).unwrap(), scheme);
        }
    }

    #[test]
    fn test_tags_in_any_order_canonicalize() {
        let (a, b) = (encoded(1), encoded(2));
        let shuffled = parser()
            .parse(&format!("2-of-{}-{}-[keeporder]-[legacy]", a, b))
            .unwrap();
        assert_eq!(
            shuffled.as_str(),
            format!("2-of-{}-{}-[legacy]-[keeporder]", a, b)
        );
    }

    #[test]
    fn test_equality_is_by_canonical_string() {
        let a = encoded(1);
        let one = parser().parse(&a).unwrap();
        let two = parser().parse(&format!("  {}  ", a)).unwrap();
        assert_eq!(one, two);
        assert_ne!(one, parser().parse(&format!("{}-[legacy]", a)).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        let (a, b) = (encoded(1), encoded(2));
        assert_eq!(parser().parse("").unwrap_err(), SchemeParseError::Empty);
        assert_eq!(
            parser().parse(&format!("{}-[segwit]", a)).unwrap_err(),
            SchemeParseError::UnknownTag("segwit".to_string())
        );
        assert_eq!(
            parser().parse(&format!("{}-[legacy]-[p2sh]", a)).unwrap_err(),
            SchemeParseError::ConflictingTags
        );
        assert_eq!(
            parser().parse(&format!("{}-[legacy]-[legacy]", a)).unwrap_err(),
            SchemeParseError::DuplicateTag("legacy".to_string())
        );
        assert_eq!(
            parser().parse(&format!("{}-[keeporder]", a)).unwrap_err(),
            SchemeParseError::KeepOrderWithoutMultisig
        );
        assert!(matches!(
            parser().parse(&format!("3-of-{}-{}", a, b)).unwrap_err(),
            SchemeParseError::InvalidThreshold(_, 2)
        ));
        assert!(matches!(
            parser().parse(&format!("x-of-{}-{}", a, b)).unwrap_err(),
            SchemeParseError::InvalidThreshold(_, 2)
        ));
        assert!(matches!(
            parser().parse("2-of-foo-bar").unwrap_err(),
            SchemeParseError::InvalidKey { .. }
        ));
        assert!(matches!(
            parser().parse(&format!("{}-{}", a, b)).unwrap_err(),
            SchemeParseError::Malformed(_)
        ));
    }

    #[test]
    fn test_mainnet_key_rejected_on_regtest() {
        let main_key = test_keys::xpub(1).encode(Network::Main);
        assert!(matches!(
            parser().parse(&main_key).unwrap_err(),
            SchemeParseError::InvalidKey {
                source: KeyError::WrongNetwork(_, Network::Regtest),
                ..
            }
        ));
    }

    #[test]
    fn test_too_many_keys() {
        let keys: Vec<String> = (1..=17).map(encoded).collect();
        let text = format!("2-of-{}", keys.join("-"));
        assert_eq!(
            parser().parse(&text).unwrap_err(),
            SchemeParseError::TooManyKeys(17, MAX_MULTISIG_KEYS)
        );
    }
}
