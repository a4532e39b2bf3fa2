//! Proving service seam and the Groth16 proof shape handed to the contract.

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WalletError};

/// External prover. Inputs and outputs are the JSON documents the circuit library speaks.
#[async_trait]
pub trait ProvingService: Send + Sync {
    /// Prove the transfer circuit for `circuit_args` (`{"statement": .., "witnesses": ..}`).
    /// Returns the raw proof document `{"A": [..], "B": [..], "C": [..]}`.
    async fn run_proof(&self, circuit_args: &str) -> Result<String>;

    async fn run_verify(&self, raw_proof: &str, statement: &str) -> Result<bool>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub a: Vec<String>,
    pub b: Vec<String>,
    pub c: Vec<String>,
}

#[derive(Deserialize)]
struct RawProof {
    #[serde(rename = "A")]
    a: Vec<String>,
    #[serde(rename = "B")]
    b: Vec<String>,
    #[serde(rename = "C")]
    c: Vec<String>,
}

impl Proof {
    /// Parse the prover's output. The library emits each G2 coordinate pair in the opposite order
    /// to the pairing precompile, so B becomes `[B1, B0, B3, B2]`.
    pub fn from_library(raw_proof: &str) -> Result<Self> {
        let raw: RawProof = serde_json::from_str(raw_proof)?;
        if raw.b.len() != 4 {
            return Err(WalletError::Prover(format!(
                "expected 4 elements in B, got {}",
                raw.b.len()
            )));
        }
        let b = vec![
            raw.b[1].clone(),
            raw.b[0].clone(),
            raw.b[3].clone(),
            raw.b[2].clone(),
        ];
        Ok(Self { a: raw.a, b, c: raw.c })
    }

    /// Parse an already-ordered proof document.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawProof = serde_json::from_str(json)?;
        Ok(Self {
            a: raw.a,
            b: raw.b,
            c: raw.c,
        })
    }

    /// `a ++ b ++ c` as integers.
    pub fn to_uint_list(&self) -> Result<Vec<BigUint>> {
        self.a
            .iter()
            .chain(&self.b)
            .chain(&self.c)
            .map(|s| {
                parse_uint(s)
                    .ok_or_else(|| WalletError::Prover(format!("bad proof element {s}")))
            })
            .collect()
    }
}

/// `0x`-prefixed hex or decimal.
fn parse_uint(s: &str) -> Option<BigUint> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => BigUint::parse_bytes(digits.as_bytes(), 16),
        None => BigUint::parse_bytes(s.as_bytes(), 10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = r#"{"A": ["0x1", "0x2"], "B": ["0x3", "0x4", "0x5", "0x6"], "C": ["7", "8"]}"#;

    #[test]
    fn test_from_library_swaps_b() {
        let proof = Proof::from_library(RAW).unwrap();
        assert_eq!(proof.b, vec!["0x4", "0x3", "0x6", "0x5"]);
        assert_eq!(proof.a, vec!["0x1", "0x2"]);
    }

    #[test]
    fn test_from_json_keeps_order() {
        let proof = Proof::from_json(RAW).unwrap();
        assert_eq!(proof.b, vec!["0x3", "0x4", "0x5", "0x6"]);
    }

    #[test]
    fn test_uint_list() {
        let proof = Proof::from_library(RAW).unwrap();
        let list: Vec<u64> = proof
            .to_uint_list()
            .unwrap()
            .iter()
            .map(|v| v.to_u64_digits().first().copied().unwrap_or(0))
            .collect();
        assert_eq!(list, vec![1, 2, 4, 3, 6, 5, 7, 8]);
    }

    #[test]
    fn test_malformed_b_rejected() {
        let bad = r#"{"A": [], "B": ["1"], "C": []}"#;
        assert!(matches!(
            Proof::from_library(bad),
            Err(WalletError::Prover(_))
        ));
    }
}
