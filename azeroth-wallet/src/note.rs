//! Notes and receive-side ownership detection.
//!
//! A note commits to `H(open, token_address, token_id, amount, addr)`; it is spent by publishing
//! its nullifier `H(commitment, sk)`. Incoming notes arrive as a pCT list in `LogZkTransfer`
//! events and are claimed with [`NoteOwnership::is_owner`].

use azeroth_crypto::field::{fr_from_u128, fr_to_u128, serde_fr_hex, Fr};
use azeroth_crypto::{MiMC7, PublicKeyCiphertext, PublicKeyEncryption};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chain::AzerothChain;
use crate::error::Result;
use crate::types::{address_to_fr, fr_to_address, Address};

/// Current version of persisted notes.
pub const NOTE_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "StoredNote", try_from = "StoredNote")]
pub struct Note {
    pub open: Fr,
    /// 40-digit, lower-case, `0x`-prefixed.
    pub token_address: Address,
    pub token_id: Fr,
    pub amount: u128,
    /// Owner's ena.
    pub addr: Fr,
    pub commitment: Fr,
    /// Leaf position in the note tree.
    pub index: u64,
    pub is_spent: bool,
}

impl Note {
    /// Build a note and compute its commitment.
    pub fn new(
        open: Fr,
        token_address: Address,
        token_id: Fr,
        amount: u128,
        addr: Fr,
        index: u64,
    ) -> Self {
        let commitment = commit(&open, &address_to_fr(&token_address), &token_id, amount, &addr);
        Self {
            open,
            token_address,
            token_id,
            amount,
            addr,
            commitment,
            index,
            is_spent: false,
        }
    }

    /// The stored commitment matches the committed fields.
    pub fn is_valid(&self) -> bool {
        self.commitment
            == commit(
                &self.open,
                &address_to_fr(&self.token_address),
                &self.token_id,
                self.amount,
                &self.addr,
            )
    }

    /// `H(commitment, sk)`.
    pub fn nullifier(&self, sk: &Fr) -> Fr {
        nullifier(&self.commitment, sk)
    }
}

fn commit(open: &Fr, token_address: &Fr, token_id: &Fr, amount: u128, addr: &Fr) -> Fr {
    MiMC7::new().hash(&[*open, *token_address, *token_id, fr_from_u128(amount), *addr])
}

pub fn nullifier(commitment: &Fr, sk: &Fr) -> Fr {
    MiMC7::new().hash(&[*commitment, *sk])
}

/// Whether the note with `commitment` has been spent by the holder of `sk`.
pub async fn is_spent_note(chain: &dyn AzerothChain, sk: &Fr, commitment: &Fr) -> Result<bool> {
    chain.is_nullified(&nullifier(commitment, sk)).await
}

// ═══════════════════════════════════════════════════════════════════════════════
// OWNERSHIP
// ═══════════════════════════════════════════════════════════════════════════════

/// Tries event ciphertexts against one account secret.
#[derive(Clone, Debug)]
pub struct NoteOwnership {
    sk: Fr,
    pke: PublicKeyEncryption,
}

/// A decrypted note whose tree position is not known yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedNote {
    pub open: Fr,
    pub token_address: Address,
    pub token_id: Fr,
    pub amount: u128,
    pub addr: Fr,
    pub commitment: Fr,
}

impl OwnedNote {
    /// Place the note at leaf `num_leaves - 1`, the leaf its own transaction appended.
    pub fn into_note(self, num_leaves: u64) -> Note {
        let index = match num_leaves.checked_sub(1) {
            Some(index) => index,
            None => {
                warn!(commitment = ?self.commitment, "event reports zero leaves, placing note at 0");
                0
            }
        };
        Note {
            open: self.open,
            token_address: self.token_address,
            token_id: self.token_id,
            amount: self.amount,
            addr: self.addr,
            commitment: self.commitment,
            index,
            is_spent: false,
        }
    }
}

impl NoteOwnership {
    pub fn new(sk: Fr) -> Self {
        Self {
            sk,
            pke: PublicKeyEncryption::new(),
        }
    }

    /// The secret notes are claimed with; also what their nullifiers are derived from.
    pub fn secret(&self) -> &Fr {
        &self.sk
    }

    /// Decrypt `ct` (the event's pCT list) with the user secret and check the result against
    /// `commitment`. Anything that fails along the way means "not ours".
    pub fn is_owner(&self, ct: &[Fr], commitment: &Fr) -> Option<OwnedNote> {
        let pct = PublicKeyCiphertext::from_list(ct).ok()?;
        let msg = match self.pke.decrypt(&pct, &self.sk, false) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "pct decryption failed");
                return None;
            }
        };
        let [open, token_address, token_id, amount, addr] = msg.get(..5)? else {
            return None;
        };

        let hashed = MiMC7::new().hash(&[*open, *token_address, *token_id, *amount, *addr]);
        if hashed != *commitment {
            return None;
        }

        Some(OwnedNote {
            open: *open,
            token_address: fr_to_address(token_address)?,
            token_id: *token_id,
            amount: fr_to_u128(amount)?,
            addr: *addr,
            commitment: *commitment,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PERSISTED SCHEMA
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNote {
    pub version: u32,
    #[serde(with = "serde_fr_hex")]
    pub open: Fr,
    pub token_address: Address,
    #[serde(with = "serde_fr_hex")]
    pub token_id: Fr,
    /// Decimal string.
    pub amount: String,
    #[serde(with = "serde_fr_hex")]
    pub addr: Fr,
    #[serde(with = "serde_fr_hex")]
    pub commitment: Fr,
    pub index: u64,
    pub is_spent: bool,
}

impl From<Note> for StoredNote {
    fn from(note: Note) -> Self {
        Self {
            version: NOTE_SCHEMA_VERSION,
            open: note.open,
            token_address: note.token_address,
            token_id: note.token_id,
            amount: note.amount.to_string(),
            addr: note.addr,
            commitment: note.commitment,
            index: note.index,
            is_spent: note.is_spent,
        }
    }
}

impl TryFrom<StoredNote> for Note {
    type Error = String;

    fn try_from(stored: StoredNote) -> std::result::Result<Self, Self::Error> {
        if stored.version != NOTE_SCHEMA_VERSION {
            return Err(format!("unsupported note record version {}", stored.version));
        }
        let amount = stored
            .amount
            .parse::<u128>()
            .map_err(|e| format!("invalid note amount {}: {e}", stored.amount))?;
        Ok(Self {
            open: stored.open,
            token_address: stored.token_address,
            token_id: stored.token_id,
            amount,
            addr: stored.addr,
            commitment: stored.commitment,
            index: stored.index,
            is_spent: stored.is_spent,
        })
    }
}
