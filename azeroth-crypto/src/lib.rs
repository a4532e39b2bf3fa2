//! azeroth-crypto
//!
//! Cryptographic primitives for Azeroth shielded transfers on an EVM chain.
//!
//! Everything here is pure and synchronous:
//! - [`field`]: arithmetic over the BN254 scalar field plus hex/decimal codecs
//! - [`curve`]: the twisted-Edwards curve embedded in that field
//! - [`mimc`]: the MiMC7 permutation and hash used for commitments and key derivation
//! - [`encryption`]: the symmetric ledger cipher (sCT) and the dual-recipient public-key cipher (pCT)
//! - [`keys`]: audit key, user public key triple and user key derivation
//!
//! The arithmetic must stay bit-compatible with the transfer circuit: commitments, nullifiers
//! and ciphertexts produced here are checked on-chain against the same fixed-function math.

pub mod curve;
pub mod encryption;
pub mod field;
pub mod keys;
pub mod mimc;

use thiserror::Error;

pub use curve::{base_point_mul, AffinePoint, TwistedEdwardsCurve};
pub use encryption::{
    PublicKeyCiphertext, PublicKeyEncryption, PublicKeyEncryptionResult, SymmetricCiphertext,
    SymmetricKeyEncryption,
};
pub use field::Fr;
pub use keys::{AuditKey, StoredAuditKey, StoredUpk, StoredUserKey, UserKey, Upk};
pub use mimc::MiMC7;

/// Errors raised by the primitives.
///
/// All of these are "invalid cryptographic input" in the wallet's taxonomy: the caller must
/// discard the note/event or abort the transfer, never retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("point not on curve: ({x}, {y})")]
    PointNotOnCurve { x: String, y: String },

    #[error("division by zero in field arithmetic")]
    DivisionByZero,

    #[error("invalid hex value: {0}")]
    InvalidHex(String),

    #[error("value out of range: {0}")]
    ValueOutOfRange(String),

    #[error("invalid ciphertext length: expected {expected}, got {actual}")]
    InvalidCiphertextLength { expected: usize, actual: usize },

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
