//! Key derivation.
//!
//! An account secret `sk` (below the curve subgroup order) determines everything else:
//! `pk_own = H(sk)`, `pk_enc = sk·G`, `ena = H(pk_own, pk_enc.x, pk_enc.y)`.
//!
//! Persisted records use an explicit, versioned schema (`Stored*`) with `0x`-prefixed hex fields.

use halo2curves_axiom::ff::Field;
use serde::{Deserialize, Serialize};

use crate::curve::{base_point_mul, AffinePoint};
use crate::field::{fr_from_be_bytes_mod_order, random_subgroup_scalar, serde_fr_hex, Fr};
use crate::mimc::MiMC7;
use crate::{CryptoError, Result};

/// Current version of every persisted key record.
pub const KEY_SCHEMA_VERSION: u32 = 1;

fn check_version(kind: &str, version: u32) -> Result<()> {
    if version == KEY_SCHEMA_VERSION {
        Ok(())
    } else {
        Err(CryptoError::Serialization(format!(
            "unsupported {kind} record version {version}"
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIT KEY
// ═══════════════════════════════════════════════════════════════════════════════

/// The global auditor key. Its public half is part of every transfer statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditKey {
    pub pk: AffinePoint,
    pub sk: Fr,
}

impl AuditKey {
    pub fn key_gen() -> Result<Self> {
        Self::recover(random_subgroup_scalar())
    }

    pub fn recover(sk: Fr) -> Result<Self> {
        Ok(Self {
            pk: base_point_mul(&sk)?,
            sk,
        })
    }

    /// Public half only, as fetched from the contract; `sk` is zero.
    pub fn public_only(pk: AffinePoint) -> Self {
        Self { pk, sk: Fr::ZERO }
    }

    pub fn to_stored(&self) -> StoredAuditKey {
        StoredAuditKey {
            version: KEY_SCHEMA_VERSION,
            pk: self.pk,
            sk: self.sk,
        }
    }

    pub fn from_stored(stored: StoredAuditKey) -> Result<Self> {
        check_version("audit key", stored.version)?;
        Ok(Self {
            pk: stored.pk,
            sk: stored.sk,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// USER PUBLIC KEY
// ═══════════════════════════════════════════════════════════════════════════════

/// User public key triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upk {
    /// Shielded account identifier; also the index of the account's balance ledger.
    pub ena: Fr,
    pub pk_own: Fr,
    pub pk_enc: AffinePoint,
}

impl Upk {
    /// What the contract returns for an address that never registered.
    pub fn empty() -> Self {
        Self {
            ena: Fr::ZERO,
            pk_own: Fr::ZERO,
            pk_enc: AffinePoint::new(Fr::ZERO, Fr::ZERO),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ena == Fr::ZERO || self.pk_own == Fr::ZERO
    }

    pub fn to_stored(&self) -> StoredUpk {
        StoredUpk {
            version: KEY_SCHEMA_VERSION,
            ena: self.ena,
            pk_own: self.pk_own,
            pk_enc: self.pk_enc,
        }
    }

    pub fn from_stored(stored: StoredUpk) -> Result<Self> {
        check_version("upk", stored.version)?;
        Ok(Self {
            ena: stored.ena,
            pk_own: stored.pk_own,
            pk_enc: stored.pk_enc,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// USER KEY
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserKey {
    pub pk: Upk,
    pub sk: Fr,
}

impl UserKey {
    pub fn key_gen() -> Result<Self> {
        Self::recover_from_user_sk(random_subgroup_scalar())
    }

    pub fn recover_from_user_sk(sk: Fr) -> Result<Self> {
        let mimc = MiMC7::new();
        let pk_own = mimc.hash(&[sk]);
        let pk_enc = base_point_mul(&sk)?;
        let ena = mimc.hash(&[pk_own, pk_enc.x, pk_enc.y]);
        Ok(Self {
            pk: Upk {
                ena,
                pk_own,
                pk_enc,
            },
            sk,
        })
    }

    /// Derive the shielded key of a wallet from its EVM signing key: `usk = H(key mod p)`.
    pub fn from_eth_private_key(private_key_hex: &str) -> Result<Self> {
        let digits = private_key_hex
            .strip_prefix("0x")
            .unwrap_or(private_key_hex);
        let bytes =
            hex::decode(digits).map_err(|_| CryptoError::InvalidHex(private_key_hex.to_string()))?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidHex(private_key_hex.to_string()));
        }
        let key = fr_from_be_bytes_mod_order(&bytes);
        Self::recover_from_user_sk(MiMC7::new().hash(&[key]))
    }

    pub fn ena(&self) -> Fr {
        self.pk.ena
    }

    pub fn to_stored(&self) -> StoredUserKey {
        StoredUserKey {
            version: KEY_SCHEMA_VERSION,
            pk: self.pk.to_stored(),
            sk: self.sk,
        }
    }

    pub fn from_stored(stored: StoredUserKey) -> Result<Self> {
        check_version("user key", stored.version)?;
        Ok(Self {
            pk: Upk::from_stored(stored.pk)?,
            sk: stored.sk,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.to_stored())
            .map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let stored: StoredUserKey =
            serde_json::from_str(json).map_err(|e| CryptoError::Serialization(e.to_string()))?;
        Self::from_stored(stored)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PERSISTED SCHEMA
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAuditKey {
    pub version: u32,
    pub pk: AffinePoint,
    #[serde(with = "serde_fr_hex")]
    pub sk: Fr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUpk {
    pub version: u32,
    #[serde(with = "serde_fr_hex")]
    pub ena: Fr,
    #[serde(with = "serde_fr_hex")]
    pub pk_own: Fr,
    pub pk_enc: AffinePoint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUserKey {
    pub version: u32,
    pub pk: StoredUpk,
    #[serde(with = "serde_fr_hex")]
    pub sk: Fr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::fr_from_hex;

    #[test]
    fn test_recover_from_sk_seven() {
        let key = UserKey::recover_from_user_sk(Fr::from(7u64)).unwrap();
        let expected_pk_own =
            fr_from_hex("0x2bff32c568d5fe53972bf7e4de6b976235084c87756e0ebcf419eee7f1ba1dde")
                .unwrap();
        let expected_ena =
            fr_from_hex("0x1f8f42984e86e701ce4a84ae89c9cf7bdf81feb4132e18ff6029102d539ffa02")
                .unwrap();
        assert_eq!(key.pk.pk_own, expected_pk_own);
        assert_eq!(key.pk.ena, expected_ena);
        assert!(!key.pk.is_empty());
    }

    #[test]
    fn test_key_gen_is_consistent() {
        let key = UserKey::key_gen().unwrap();
        let again = UserKey::recover_from_user_sk(key.sk).unwrap();
        assert_eq!(key, again);
    }

    #[test]
    fn test_empty_upk() {
        assert!(Upk::empty().is_empty());
        let mut upk = UserKey::recover_from_user_sk(Fr::from(3u64)).unwrap().pk;
        upk.pk_own = Fr::ZERO;
        assert!(upk.is_empty());
    }

    #[test]
    fn test_public_only_audit_key() {
        let audit = AuditKey::recover(Fr::from(5u64)).unwrap();
        let public = AuditKey::public_only(audit.pk);
        assert_eq!(public.pk, audit.pk);
        assert_eq!(public.sk, Fr::ZERO);
    }

    #[test]
    fn test_from_eth_private_key() {
        let hex_key = format!("0x{}", "00".repeat(31) + "07");
        let key = UserKey::from_eth_private_key(&hex_key).unwrap();
        let usk = MiMC7::new().hash(&[Fr::from(7u64)]);
        assert_eq!(key.sk, usk);
        assert!(UserKey::from_eth_private_key("0x1234").is_err());
    }

    #[test]
    fn test_stored_roundtrip_and_version_check() {
        let key = UserKey::recover_from_user_sk(Fr::from(7u64)).unwrap();
        let json = key.to_json().unwrap();
        assert!(json.contains("\"version\":1"));
        assert_eq!(UserKey::from_json(&json).unwrap(), key);

        let mut stored = key.to_stored();
        stored.version = 2;
        assert!(matches!(
            UserKey::from_stored(stored),
            Err(CryptoError::Serialization(_))
        ));
    }
}
