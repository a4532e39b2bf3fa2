//! MiMC7 permutation and hash.
//!
//! Round constants come from iterated Keccak-256 of the seed `"mimc7_seed"`: round 0 uses the
//! constant zero, round `i` uses `keccak256(c_{i-1})` with `c_0 = keccak256(seed)`. The round
//! function is `(msg + key + c)^7`. These are protocol constants shared with the circuit.

use halo2curves_axiom::ff::Field;
use once_cell::sync::Lazy;
use sha3::{Digest, Keccak256};

use crate::field::{fr_from_be_bytes_mod_order, mod_pow, Fr};

/// Domain-separation seed.
pub const MIMC7_SEED: &str = "mimc7_seed";

/// Number of rounds, including the zero-constant first round.
pub const MIMC7_ROUNDS: usize = 91;

static ROUND_CONSTANTS: Lazy<Vec<Fr>> = Lazy::new(|| round_constants(MIMC7_SEED, MIMC7_ROUNDS));

fn round_constants(seed: &str, rounds: usize) -> Vec<Fr> {
    let mut constants = Vec::with_capacity(rounds);
    constants.push(Fr::ZERO);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Keccak256::digest(seed.as_bytes()));
    for _ in 1..rounds {
        let next = Keccak256::digest(digest);
        digest.copy_from_slice(&next);
        constants.push(fr_from_be_bytes_mod_order(&digest));
    }
    constants
}

/// MiMC7 over the BN254 scalar field.
#[derive(Clone, Copy, Debug, Default)]
pub struct MiMC7;

impl MiMC7 {
    pub fn new() -> Self {
        Self
    }

    fn round(msg: &Fr, key: &Fr, constant: &Fr) -> Fr {
        mod_pow(&(*msg + *key + *constant), 7)
    }

    /// Keyed permutation `E_k(x)`.
    pub fn encrypt(&self, msg: &Fr, key: &Fr) -> Fr {
        let mut result = *msg;
        for constant in ROUND_CONSTANTS.iter() {
            result = Self::round(&result, key, constant);
        }
        result + *key
    }

    /// Two-to-one compression `E_r(l) + l + r`.
    pub fn hash2(&self, left: &Fr, right: &Fr) -> Fr {
        self.encrypt(left, right) + *left + *right
    }

    /// `hash(a)` is `h(a, a)`; longer inputs fold left to right: `h(h(a, b), c), ...`.
    ///
    /// An empty slice hashes to zero.
    pub fn hash(&self, inputs: &[Fr]) -> Fr {
        match inputs {
            [] => Fr::ZERO,
            [single] => self.hash2(single, single),
            [first, second, rest @ ..] => rest
                .iter()
                .fold(self.hash2(first, second), |acc, next| self.hash2(&acc, next)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::fr_from_hex;

    #[test]
    fn test_round_constant_chain() {
        assert_eq!(ROUND_CONSTANTS.len(), MIMC7_ROUNDS);
        assert_eq!(ROUND_CONSTANTS[0], Fr::ZERO);
        // keccak256(keccak256("mimc7_seed")) reduced
        let expected =
            fr_from_hex("0x2fd3f713342a30b6442ee1f0fd68277ad3a132d8e16c2941ec7b174a3cd5a8e8")
                .unwrap();
        assert_eq!(ROUND_CONSTANTS[1], expected);
    }

    #[test]
    fn test_hash_pair_is_encrypt_plus_inputs() {
        let mimc = MiMC7::new();
        let (l, r) = (Fr::from(1u64), Fr::from(2u64));
        assert_eq!(mimc.hash(&[l, r]), mimc.encrypt(&l, &r) + l + r);
    }

    #[test]
    fn test_single_input_hashes_with_itself() {
        let mimc = MiMC7::new();
        let a = Fr::from(42u64);
        assert_eq!(mimc.hash(&[a]), mimc.hash(&[a, a]));
    }

    #[test]
    fn test_fold_order() {
        let mimc = MiMC7::new();
        let (a, b, c) = (Fr::from(1u64), Fr::from(2u64), Fr::from(3u64));
        assert_eq!(mimc.hash(&[a, b, c]), mimc.hash2(&mimc.hash2(&a, &b), &c));
        assert_ne!(mimc.hash(&[a, b, c]), mimc.hash(&[c, b, a]));
    }
}
