//! Ledger and note ciphers.
//!
//! - [`SymmetricKeyEncryption`] protects one encrypted balance slot (sCT) under the account secret.
//! - [`PublicKeyEncryption`] encrypts a new note to a receiver and, in parallel, to the auditor (pCT).

use halo2curves_axiom::ff::Field;
use serde::{Deserialize, Serialize};

use crate::curve::{base_point_mul, AffinePoint, TwistedEdwardsCurve};
use crate::field::{random_field_element, serde_fr_hex, serde_fr_vec, Fr};
use crate::keys::Upk;
use crate::mimc::MiMC7;
use crate::{CryptoError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// SYMMETRIC (sCT)
// ═══════════════════════════════════════════════════════════════════════════════

/// Symmetric ciphertext over `[token_address, token_id, balance]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricCiphertext {
    #[serde(with = "serde_fr_hex")]
    pub r: Fr,
    #[serde(with = "serde_fr_vec")]
    pub ct: Vec<Fr>,
}

impl SymmetricCiphertext {
    pub fn new(r: Fr, ct: Vec<Fr>) -> Self {
        Self { r, ct }
    }

    /// The ciphertext of an account that has never touched the token: `r = 0, ct = [0, 0, 0]`.
    pub fn empty() -> Self {
        Self {
            r: Fr::ZERO,
            ct: vec![Fr::ZERO; 3],
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }

    /// `[r, ct0, ct1, ct2]`, the layout used by the circuit and the contract.
    pub fn to_list(&self) -> Vec<Fr> {
        std::iter::once(self.r).chain(self.ct.iter().copied()).collect()
    }
}

/// `ct[i] = m[i] + H(sk, r + i)`.
#[derive(Clone, Debug)]
pub struct SymmetricKeyEncryption {
    sk: Fr,
    mimc: MiMC7,
}

impl SymmetricKeyEncryption {
    pub fn new(sk: Fr) -> Self {
        Self {
            sk,
            mimc: MiMC7::new(),
        }
    }

    fn mask(&self, r: &Fr, i: usize) -> Fr {
        self.mimc.hash(&[self.sk, *r + Fr::from(i as u64)])
    }

    pub fn encrypt(&self, msg: &[Fr]) -> SymmetricCiphertext {
        self.encrypt_with_randomness(msg, random_field_element())
    }

    /// Deterministic variant; `r` must be fresh per encryption.
    pub fn encrypt_with_randomness(&self, msg: &[Fr], r: Fr) -> SymmetricCiphertext {
        let ct = msg
            .iter()
            .enumerate()
            .map(|(i, m)| *m + self.mask(&r, i))
            .collect();
        SymmetricCiphertext { r, ct }
    }

    pub fn decrypt(&self, sct: &SymmetricCiphertext) -> Vec<Fr> {
        sct.ct
            .iter()
            .enumerate()
            .map(|(i, c)| *c - self.mask(&sct.r, i))
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC KEY (pCT)
// ═══════════════════════════════════════════════════════════════════════════════

/// Dual-recipient ciphertext: `c0 = r·G`, `c1 = K + r·pkEnc`, `c2 = K + r·apk`, `c3 = SE_K(msg)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyCiphertext {
    pub c0: AffinePoint,
    pub c1: AffinePoint,
    pub c2: AffinePoint,
    #[serde(with = "serde_fr_vec")]
    pub c3: Vec<Fr>,
}

impl PublicKeyCiphertext {
    /// Number of field elements taken by the three points.
    pub const POINT_ELEMENTS: usize = 6;

    /// `[c0.x, c0.y, c1.x, c1.y, c2.x, c2.y, c3...]`, the on-chain event layout.
    pub fn to_list(&self) -> Vec<Fr> {
        let mut list = Vec::with_capacity(Self::POINT_ELEMENTS + self.c3.len());
        list.extend(self.c0.to_array());
        list.extend(self.c1.to_array());
        list.extend(self.c2.to_array());
        list.extend(self.c3.iter().copied());
        list
    }

    /// Inverse of [`to_list`](Self::to_list); at least one message element is required.
    pub fn from_list(list: &[Fr]) -> Result<Self> {
        if list.len() <= Self::POINT_ELEMENTS {
            return Err(CryptoError::InvalidCiphertextLength {
                expected: Self::POINT_ELEMENTS + 1,
                actual: list.len(),
            });
        }
        Ok(Self {
            c0: AffinePoint::new(list[0], list[1]),
            c1: AffinePoint::new(list[2], list[3]),
            c2: AffinePoint::new(list[4], list[5]),
            c3: list[Self::POINT_ELEMENTS..].to_vec(),
        })
    }
}

/// Output of [`PublicKeyEncryption::encrypt`]: the ciphertext plus the witness values the circuit
/// needs (the raw randomness `r` and the shared point `K`).
#[derive(Clone, Debug)]
pub struct PublicKeyEncryptionResult {
    pub ciphertext: PublicKeyCiphertext,
    pub r: Fr,
    pub k: AffinePoint,
}

#[derive(Clone, Debug, Default)]
pub struct PublicKeyEncryption {
    mimc: MiMC7,
}

impl PublicKeyEncryption {
    pub fn new() -> Self {
        Self::default()
    }

    fn mask(&self, k: &AffinePoint, i: usize) -> Fr {
        self.mimc.hash(&[k.x, Fr::from(i as u64)])
    }

    pub fn encrypt(&self, apk: &AffinePoint, upk: &Upk, msg: &[Fr]) -> Result<PublicKeyEncryptionResult> {
        self.encrypt_with_randomness(apk, upk, msg, random_field_element(), random_field_element())
    }

    /// Deterministic variant used by fixtures.
    pub fn encrypt_with_randomness(
        &self,
        apk: &AffinePoint,
        upk: &Upk,
        msg: &[Fr],
        r: Fr,
        k: Fr,
    ) -> Result<PublicKeyEncryptionResult> {
        let curve = TwistedEdwardsCurve::alt_bn128();

        let shared = base_point_mul(&k)?;
        let to_user = curve.compute_scalar_mul(&upk.pk_enc, &r)?;
        let to_auditor = curve.compute_scalar_mul(apk, &r)?;

        let c0 = base_point_mul(&r)?;
        let c1 = curve.add_affine_point(&shared, &to_user)?;
        let c2 = curve.add_affine_point(&shared, &to_auditor)?;
        let c3 = msg
            .iter()
            .enumerate()
            .map(|(i, m)| *m + self.mask(&shared, i))
            .collect();

        Ok(PublicKeyEncryptionResult {
            ciphertext: PublicKeyCiphertext { c0, c1, c2, c3 },
            r,
            k: shared,
        })
    }

    /// Recover the message with the user secret (`audit = false`, via `c1`) or the auditor secret
    /// (`audit = true`, via `c2`).
    pub fn decrypt(&self, pct: &PublicKeyCiphertext, sk: &Fr, audit: bool) -> Result<Vec<Fr>> {
        let curve = TwistedEdwardsCurve::alt_bn128();
        let shared_with_sk = curve.compute_scalar_mul(&pct.c0, sk)?;
        let masked = if audit { &pct.c2 } else { &pct.c1 };
        let k = curve.sub_affine_point(masked, &shared_with_sk)?;

        Ok(pct
            .c3
            .iter()
            .enumerate()
            .map(|(i, c)| *c - self.mask(&k, i))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{AuditKey, UserKey};

    #[test]
    fn test_symmetric_roundtrip() {
        let se = SymmetricKeyEncryption::new(Fr::from(7u64));
        let msg = vec![Fr::from(0u64), Fr::from(0u64), Fr::from(150u64)];
        let sct = se.encrypt(&msg);
        assert_eq!(sct.ct.len(), 3);
        assert_eq!(se.decrypt(&sct), msg);
    }

    #[test]
    fn test_symmetric_wrong_key_garbles() {
        let msg = vec![Fr::from(1u64), Fr::from(2u64), Fr::from(3u64)];
        let sct = SymmetricKeyEncryption::new(Fr::from(7u64)).encrypt(&msg);
        let other = SymmetricKeyEncryption::new(Fr::from(8u64));
        assert_ne!(other.decrypt(&sct), msg);
    }

    #[test]
    fn test_empty_sct() {
        let empty = SymmetricCiphertext::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.to_list(), vec![Fr::ZERO; 4]);
    }

    #[test]
    fn test_public_key_roundtrip_user_and_auditor() {
        let audit = AuditKey::recover(Fr::from(11u64)).unwrap();
        let user = UserKey::recover_from_user_sk(Fr::from(7u64)).unwrap();
        let msg: Vec<Fr> = (1u64..=5).map(Fr::from).collect();

        let pke = PublicKeyEncryption::new();
        let out = pke.encrypt(&audit.pk, &user.pk, &msg).unwrap();

        assert_eq!(pke.decrypt(&out.ciphertext, &user.sk, false).unwrap(), msg);
        assert_eq!(pke.decrypt(&out.ciphertext, &audit.sk, true).unwrap(), msg);
        assert_eq!(out.ciphertext.c0, base_point_mul(&out.r).unwrap());
    }

    #[test]
    fn test_list_layout() {
        let audit = AuditKey::recover(Fr::from(11u64)).unwrap();
        let user = UserKey::recover_from_user_sk(Fr::from(7u64)).unwrap();
        let msg: Vec<Fr> = (1u64..=5).map(Fr::from).collect();
        let pct = PublicKeyEncryption::new()
            .encrypt(&audit.pk, &user.pk, &msg)
            .unwrap()
            .ciphertext;

        let list = pct.to_list();
        assert_eq!(list.len(), 11);
        assert_eq!(list[0], pct.c0.x);
        assert_eq!(list[5], pct.c2.y);
        assert_eq!(PublicKeyCiphertext::from_list(&list).unwrap(), pct);
        assert!(matches!(
            PublicKeyCiphertext::from_list(&list[..6]),
            Err(CryptoError::InvalidCiphertextLength { actual: 6, .. })
        ));
    }

    #[test]
    fn test_sct_json_is_prefixed_hex() {
        let sct = SymmetricCiphertext::new(Fr::from(1u64), vec![Fr::from(2u64)]);
        let json = serde_json::to_value(&sct).unwrap();
        assert_eq!(
            json["r"],
            "0x0000000000000000000000000000000000000000000000000000000000000001"
        );
        let back: SymmetricCiphertext = serde_json::from_value(json).unwrap();
        assert_eq!(back, sct);
    }
}
