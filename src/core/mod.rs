//! Core chain primitives
//!
//! This module contains the fundamental building blocks:
//! - Network parameters (address and extended key encodings)
//! - Scripts (P2PKH, P2WPKH, P2SH, P2WSH, MultiSig templates)
//! - Transactions (outpoints, outputs, txid computation)

pub mod network;
pub mod script;
pub mod transaction;

pub use network::Network;
pub use script::{Script, ScriptError, ScriptType, MAX_MULTISIG_KEYS};
pub use transaction::{
    BlockHash, OutPoint, Transaction, TransactionError, TxIn, TxOut, Txid, SEQUENCE_FINAL,
    TX_VERSION,
};
