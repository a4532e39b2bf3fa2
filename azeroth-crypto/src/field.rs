//! BN254 scalar field helpers.
//!
//! Field elements are `halo2curves` [`Fr`] values, so every operation is already reduced modulo
//! the prime. This module adds what the wallet needs on top: integer conversions, the fixed-width
//! hex codecs used by the contract and the circuit tool, and uniform sampling below an arbitrary
//! modulus.

use halo2curves_axiom::ff::{Field, PrimeField};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use rand::RngCore;

use crate::{CryptoError, Result};

pub use halo2curves_axiom::bn256::Fr;

/// The field prime, decimal.
pub const FIELD_PRIME_DEC: &str =
    "21888242871839275222246405745257275088548364400416034343698204186575808495617";

/// Order of the prime-order subgroup of the embedded curve, decimal.
pub const SUBGROUP_ORDER_DEC: &str =
    "2736030358979909402780800718157159386074658810754251464600343418943805806723";

pub static FIELD_PRIME: Lazy<BigUint> = Lazy::new(|| parse_const(FIELD_PRIME_DEC));

pub static SUBGROUP_ORDER: Lazy<BigUint> = Lazy::new(|| parse_const(SUBGROUP_ORDER_DEC));

fn parse_const(dec: &str) -> BigUint {
    BigUint::parse_bytes(dec.as_bytes(), 10).unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════════
// ARITHMETIC
// ═══════════════════════════════════════════════════════════════════════════════

pub fn add(a: &Fr, b: &Fr) -> Fr {
    *a + *b
}

pub fn sub(a: &Fr, b: &Fr) -> Fr {
    *a - *b
}

pub fn mul(a: &Fr, b: &Fr) -> Fr {
    *a * *b
}

/// Multiplicative inverse. Zero has none.
pub fn mod_inv(a: &Fr) -> Result<Fr> {
    Option::<Fr>::from(a.invert()).ok_or(CryptoError::DivisionByZero)
}

/// `base^exp` for a small public exponent.
pub fn mod_pow(base: &Fr, exp: u64) -> Fr {
    base.pow_vartime([exp])
}

/// `a / b`.
pub fn div(a: &Fr, b: &Fr) -> Result<Fr> {
    Ok(*a * mod_inv(b)?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTEGER CONVERSIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Canonical integer value of a field element.
pub fn fr_to_biguint(value: &Fr) -> BigUint {
    BigUint::from_bytes_le(value.to_repr().as_ref())
}

/// Strict conversion: values `>= p` are rejected.
pub fn fr_from_biguint(value: &BigUint) -> Result<Fr> {
    if value >= &*FIELD_PRIME {
        return Err(CryptoError::ValueOutOfRange(format!(
            "{value} is not below the field prime"
        )));
    }
    let le = value.to_bytes_le();
    let mut repr = <Fr as PrimeField>::Repr::default();
    repr.as_mut()[..le.len()].copy_from_slice(&le);
    Option::<Fr>::from(Fr::from_repr(repr))
        .ok_or_else(|| CryptoError::ValueOutOfRange(value.to_string()))
}

/// Reducing conversion: `value mod p`.
pub fn fr_from_biguint_mod(value: &BigUint) -> Fr {
    let reduced = value % &*FIELD_PRIME;
    // reduced < p, so the strict path cannot fail
    fr_from_biguint(&reduced).unwrap_or(Fr::ZERO)
}

/// Interpret big-endian bytes as an integer and reduce modulo p.
pub fn fr_from_be_bytes_mod_order(bytes: &[u8]) -> Fr {
    fr_from_biguint_mod(&BigUint::from_bytes_be(bytes))
}

/// Big-endian 32-byte encoding (the EVM word layout).
pub fn fr_to_be_bytes(value: &Fr) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(value.to_repr().as_ref());
    bytes.reverse();
    bytes
}

pub fn fr_from_u128(value: u128) -> Fr {
    Fr::from_u128(value)
}

/// Small integers only; `None` when the element does not fit in 128 bits.
pub fn fr_to_u128(value: &Fr) -> Option<u128> {
    let repr = value.to_repr();
    let bytes = repr.as_ref();
    if bytes[16..].iter().any(|b| *b != 0) {
        return None;
    }
    let mut le = [0u8; 16];
    le.copy_from_slice(&bytes[..16]);
    Some(u128::from_le_bytes(le))
}

/// Bit length of the canonical integer; zero has bit length 1.
pub fn bit_length(value: &Fr) -> usize {
    (fr_to_biguint(value).bits() as usize).max(1)
}

/// Bit `i` (little-endian) of the canonical integer.
pub fn bit(value: &Fr, i: usize) -> bool {
    let repr = value.to_repr();
    let bytes = repr.as_ref();
    i < 256 && (bytes[i / 8] >> (i % 8)) & 1 == 1
}

// ═══════════════════════════════════════════════════════════════════════════════
// HEX / DECIMAL CODECS
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimal lower-case hex without prefix (`"0"` for zero).
pub fn fr_to_hex(value: &Fr) -> String {
    fr_to_biguint(value).to_str_radix(16)
}

/// Lower-case hex without prefix, left-padded with zeros to `width` digits.
pub fn fr_to_padded_hex(value: &Fr, width: usize) -> String {
    format!("{:0>width$}", fr_to_hex(value), width = width)
}

/// `0x` + 64 hex digits, the persisted form of a field element.
pub fn fr_to_prefixed_hex(value: &Fr) -> String {
    format!("0x{}", fr_to_padded_hex(value, 64))
}

/// Parse hex with or without `0x`. Values `>= p` are rejected.
pub fn fr_from_hex(s: &str) -> Result<Fr> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if digits.is_empty() {
        return Ok(Fr::ZERO);
    }
    if digits.len() > 64 {
        return Err(CryptoError::InvalidHex(s.to_string()));
    }
    let value = BigUint::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| CryptoError::InvalidHex(s.to_string()))?;
    fr_from_biguint(&value)
}

pub fn fr_to_decimal(value: &Fr) -> String {
    fr_to_biguint(value).to_str_radix(10)
}

pub fn fr_from_decimal(s: &str) -> Result<Fr> {
    let value = BigUint::parse_bytes(s.as_bytes(), 10)
        .ok_or_else(|| CryptoError::ValueOutOfRange(s.to_string()))?;
    fr_from_biguint(&value)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SAMPLING
// ═══════════════════════════════════════════════════════════════════════════════

/// Draw `ceil(bits(modulus) / 8)` random bytes and reduce them modulo `modulus`.
pub fn random_below(modulus: &BigUint) -> Fr {
    let byte_len = ((modulus.bits() + 7) / 8) as usize;
    let mut bytes = vec![0u8; byte_len];
    rand::thread_rng().fill_bytes(&mut bytes);
    let value = BigUint::from_bytes_be(&bytes) % modulus;
    fr_from_biguint_mod(&value)
}

/// Uniform element of the field.
pub fn random_field_element() -> Fr {
    random_below(&FIELD_PRIME)
}

/// Uniform scalar below the curve subgroup order (secret keys).
pub fn random_subgroup_scalar() -> Fr {
    random_below(&SUBGROUP_ORDER)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERDE
// ═══════════════════════════════════════════════════════════════════════════════

/// Serialize a field element as `0x` + 64 hex digits.
pub mod serde_fr_hex {
    use super::*;
    use serde::{de, Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(fr: &Fr, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&fr_to_prefixed_hex(fr))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Fr, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FrVisitor;

        impl de::Visitor<'_> for FrVisitor {
            type Value = Fr;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a hex string below the field prime (with or without 0x prefix)")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                fr_from_hex(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(FrVisitor)
    }
}

/// Serialize a list of field elements as `0x`-prefixed hex strings.
pub mod serde_fr_vec {
    use super::*;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(values: &[Fr], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(values.iter().map(fr_to_prefixed_hex))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<Fr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| fr_from_hex(s).map_err(de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prime_matches_fr_modulus() {
        // p - 1 is the largest element; p itself must be rejected
        let p_minus_one = &*FIELD_PRIME - 1u32;
        let fr = fr_from_biguint(&p_minus_one).unwrap();
        assert_eq!(fr, -Fr::ONE);
        assert!(fr_from_biguint(&FIELD_PRIME).is_err());
    }

    #[test]
    fn test_negative_normalization() {
        let a = Fr::from(3u64);
        let b = Fr::from(5u64);
        let diff = sub(&a, &b);
        assert_eq!(fr_to_biguint(&diff), &*FIELD_PRIME - 2u32);
        assert_eq!(add(&diff, &b), a);
        assert_eq!(fr_from_decimal(&fr_to_decimal(&diff)).unwrap(), diff);
    }

    #[test]
    fn test_hex_roundtrip_and_padding() {
        let v = Fr::from(0xabcdu64);
        assert_eq!(fr_to_hex(&v), "abcd");
        assert_eq!(fr_to_padded_hex(&v, 8), "0000abcd");
        assert_eq!(fr_from_hex("0xabcd").unwrap(), v);
        assert_eq!(fr_from_hex("abcd").unwrap(), v);
        assert_eq!(fr_to_hex(&Fr::ZERO), "0");
        assert_eq!(fr_from_hex("0x").unwrap(), Fr::ZERO);
        assert!(fr_from_hex("0xzz").is_err());
    }

    #[test]
    fn test_mod_inv_of_zero_fails() {
        assert_eq!(mod_inv(&Fr::ZERO), Err(CryptoError::DivisionByZero));
        let three = Fr::from(3u64);
        assert_eq!(mul(&three, &mod_inv(&three).unwrap()), Fr::ONE);
    }

    #[test]
    fn test_serde_fr_vec_wire_format() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Wrapper {
            #[serde(with = "serde_fr_vec")]
            values: Vec<Fr>,
        }

        let wrapper = Wrapper {
            values: vec![Fr::from(0xabu64), Fr::ZERO],
        };
        let json = serde_json::to_value(&wrapper).unwrap();
        assert_eq!(json["values"][0], format!("0x{:0>64}", "ab"));
        assert_eq!(json["values"][1], format!("0x{}", "0".repeat(64)));
        let back: Wrapper = serde_json::from_value(json).unwrap();
        assert_eq!(back, wrapper);

        let lenient: Wrapper = serde_json::from_str(r#"{"values":["ab","0x"]}"#).unwrap();
        assert_eq!(lenient, wrapper);
        assert!(serde_json::from_str::<Wrapper>(r#"{"values":["0xzz"]}"#).is_err());
    }

    #[test]
    fn test_mod_pow() {
        assert_eq!(mod_pow(&Fr::from(2u64), 7), Fr::from(128u64));
    }

    #[test]
    fn test_bits() {
        let v = Fr::from(5u64);
        assert_eq!(bit_length(&v), 3);
        assert!(bit(&v, 0));
        assert!(!bit(&v, 1));
        assert!(bit(&v, 2));
        assert_eq!(bit_length(&Fr::ZERO), 1);
    }

    #[test]
    fn test_u128_conversions() {
        let v = fr_from_u128(u128::MAX);
        assert_eq!(fr_to_u128(&v), Some(u128::MAX));
        assert_eq!(fr_to_u128(&-Fr::ONE), None);
    }

    #[test]
    fn test_random_below_subgroup_order() {
        for _ in 0..16 {
            let s = random_subgroup_scalar();
            assert!(fr_to_biguint(&s) < *SUBGROUP_ORDER);
        }
    }

    #[test]
    fn test_be_bytes() {
        let v = Fr::from(1u64);
        let bytes = fr_to_be_bytes(&v);
        assert_eq!(bytes[31], 1);
        assert_eq!(fr_from_be_bytes_mod_order(&bytes), v);
    }
}
