//! Twisted-Edwards curve `a·x² + y² = 1 + d·x²·y²` over the BN254 scalar field.
//!
//! Scalar multiplication deliberately reproduces the doubling-table construction used by the
//! circuit tooling (sum of selected table entries, seeded with and then corrected by the top
//! entry) so that every derived point is bit-identical.

use halo2curves_axiom::ff::Field;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::field::{self, fr_from_decimal, fr_to_hex, serde_fr_hex, Fr};
use crate::{CryptoError, Result};

const COEF_D_DEC: &str =
    "9706598848417545097372247223557719406784115219466060233080913168975159366771";
const GENERATOR_X_DEC: &str =
    "19698561148652590122159747500897617769866003486955115824547446575314762165298";
const GENERATOR_Y_DEC: &str =
    "19298250018296453272277890825869354524455968081175474282777126169995084727839";

/// The curve every Azeroth key and ciphertext lives on.
pub static ALT_BN128: Lazy<TwistedEdwardsCurve> = Lazy::new(|| TwistedEdwardsCurve {
    coef_a: Fr::ONE,
    coef_d: fr_from_decimal(COEF_D_DEC).unwrap_or(Fr::ZERO),
    generator: AffinePoint {
        x: fr_from_decimal(GENERATOR_X_DEC).unwrap_or(Fr::ZERO),
        y: fr_from_decimal(GENERATOR_Y_DEC).unwrap_or(Fr::ZERO),
    },
});

/// Affine point; coordinates persist as `0x`-prefixed 64-digit hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinePoint {
    #[serde(with = "serde_fr_hex")]
    pub x: Fr,
    #[serde(with = "serde_fr_hex")]
    pub y: Fr,
}

impl AffinePoint {
    pub fn new(x: Fr, y: Fr) -> Self {
        Self { x, y }
    }

    /// Neutral element `(0, 1)`.
    pub fn identity() -> Self {
        Self { x: Fr::ZERO, y: Fr::ONE }
    }

    pub fn to_array(&self) -> [Fr; 2] {
        [self.x, self.y]
    }
}

impl std::fmt::Display for AffinePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{},0x{}", fr_to_hex(&self.x), fr_to_hex(&self.y))
    }
}

/// Curve parameters plus the group law.
#[derive(Clone, Debug)]
pub struct TwistedEdwardsCurve {
    pub coef_a: Fr,
    pub coef_d: Fr,
    pub generator: AffinePoint,
}

impl TwistedEdwardsCurve {
    /// The Azeroth curve.
    pub fn alt_bn128() -> &'static Self {
        &ALT_BN128
    }

    pub fn is_on_curve(&self, p: &AffinePoint) -> bool {
        let x2 = p.x.square();
        let y2 = p.y.square();
        self.coef_a * x2 + y2 == self.coef_d * x2 * y2 + Fr::ONE
    }

    /// Fails with [`CryptoError::PointNotOnCurve`] instead of silently continuing.
    pub fn check_point_on_curve(&self, p: &AffinePoint) -> Result<()> {
        if self.is_on_curve(p) {
            Ok(())
        } else {
            Err(CryptoError::PointNotOnCurve {
                x: fr_to_hex(&p.x),
                y: fr_to_hex(&p.y),
            })
        }
    }

    /// `x3 = (x1y2 + y1x2) / (1 + d·x1x2y1y2)`, `y3 = (y1y2 - a·x1x2) / (1 - d·x1x2y1y2)`.
    pub fn add_affine_point(&self, p1: &AffinePoint, p2: &AffinePoint) -> Result<AffinePoint> {
        let x1x2 = p1.x * p2.x;
        let x1y2 = p1.x * p2.y;
        let x2y1 = p2.x * p1.y;
        let y1y2 = p1.y * p2.y;
        let dxy = self.coef_d * x1x2 * y1y2;

        let x = field::div(&(x1y2 + x2y1), &(Fr::ONE + dxy))?;
        let y = field::div(&(y1y2 - self.coef_a * x1x2), &(Fr::ONE - dxy))?;
        Ok(AffinePoint { x, y })
    }

    /// `x3 = 2xy / (a·x² + y²)`, `y3 = (y² - a·x²) / (2 - a·x² - y²)`.
    pub fn double_affine_point(&self, p: &AffinePoint) -> Result<AffinePoint> {
        let xy = p.x * p.y;
        let ax2 = self.coef_a * p.x.square();
        let y2 = p.y.square();
        let two = Fr::from(2u64);

        let x = field::div(&(two * xy), &(ax2 + y2))?;
        let y = field::div(&(y2 - ax2), &(two - ax2 - y2))?;
        Ok(AffinePoint { x, y })
    }

    pub fn sub_affine_point(&self, p1: &AffinePoint, p2: &AffinePoint) -> Result<AffinePoint> {
        let neg = AffinePoint { x: -p2.x, y: p2.y };
        self.add_affine_point(p1, &neg)
    }

    /// `[P, 2P, 4P, ..., 2^L·P]` with `L` the bit length of `exp`.
    fn doubling_table(&self, p: &AffinePoint, exp: &Fr) -> Result<Vec<AffinePoint>> {
        let len = field::bit_length(exp);
        let mut table = Vec::with_capacity(len + 1);
        table.push(*p);
        for _ in 0..len {
            let last = table[table.len() - 1];
            table.push(self.double_affine_point(&last)?);
        }
        Ok(table)
    }

    fn mul_with_table(&self, table: &[AffinePoint], exp: &Fr) -> Result<AffinePoint> {
        let top = table[table.len() - 1];
        let mut result = top;
        for (i, entry) in table.iter().enumerate() {
            if field::bit(exp, i) {
                result = self.add_affine_point(&result, entry)?;
            }
        }
        self.sub_affine_point(&result, &top)
    }

    /// `exp · p`. The input point must be on the curve.
    pub fn compute_scalar_mul(&self, p: &AffinePoint, exp: &Fr) -> Result<AffinePoint> {
        self.check_point_on_curve(p)?;
        let table = self.doubling_table(p, exp)?;
        self.mul_with_table(&table, exp)
    }
}

/// `exp · G`, checking the generator before and the result after.
pub fn base_point_mul(exp: &Fr) -> Result<AffinePoint> {
    let curve = TwistedEdwardsCurve::alt_bn128();
    curve.check_point_on_curve(&curve.generator)?;
    let result = curve.compute_scalar_mul(&curve.generator, exp)?;
    curve.check_point_on_curve(&result)?;
    Ok(result)
}
