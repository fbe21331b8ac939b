//! Derivation engine
//!
//! Pure functions turning a parsed derivation scheme and a
//! (feature, index) pair into a concrete output script:
//! - Scheme descriptors (direct and threshold multisig, three script families)
//! - Canonical string form used as the scheme's identity on disk and on the wire
//! - Per-feature derivation lines

pub mod line;
pub mod scheme;

pub use line::{DerivationError, DerivationLine, DerivedOutput, Feature};
pub use scheme::{
    DerivationScheme, KeyOrdering, SchemeParseError, SchemeParser, SchemeVariant, ScriptKind,
};
