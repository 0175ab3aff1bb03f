//! HyperLogLog distinct-count sketch.
//!
//! Overflow keys carry a sketch of the identities folded into them. The
//! sketch has `2^precision` one-byte registers regardless of how many
//! identities it has seen, so both its merge cost and its serialized size are
//! constant. Merging takes the register-wise maximum, which is commutative,
//! associative and idempotent.
//!
//! Identities are hashed with FNV-1a followed by a SplitMix64 finalizer.
//! Both are fixed algorithms, so sketches written by one process merge
//! correctly with sketches written by another.

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::config::SketchConfig;
use crate::error::ValueError;
use crate::value::Reader;

/// Mergeable approximate distinct counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sketch {
    precision: u8,
    registers: Vec<u8>,
}

impl Sketch {
    /// Creates an empty sketch with `2^precision` registers.
    pub fn new(precision: u8) -> Self {
        Self {
            precision,
            registers: vec![0; 1 << precision],
        }
    }

    /// Creates an empty sketch from configuration.
    pub fn from_config(config: &SketchConfig) -> Self {
        Self::new(config.precision)
    }

    /// Register index bits.
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Returns `true` if nothing was inserted.
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    /// Records an identity by its bytes.
    pub fn insert(&mut self, identity: &[u8]) {
        self.insert_hash(hash_identity(identity));
    }

    /// Records an identity by its pre-computed [`hash_identity`] value.
    pub fn insert_hash(&mut self, hash: u64) {
        let p = u32::from(self.precision);
        #[allow(clippy::cast_possible_truncation)] // < 2^16
        let index = (hash >> (64 - p)) as usize;
        let remaining = hash << p;
        #[allow(clippy::cast_possible_truncation)] // <= 64
        let rank = (remaining.leading_zeros().min(64 - p) + 1) as u8;
        if let Some(register) = self.registers.get_mut(index) {
            *register = (*register).max(rank);
        }
    }

    /// Estimates the number of distinct identities inserted.
    #[allow(clippy::cast_precision_loss)] // register counts are at most 2^16
    pub fn estimate(&self) -> u64 {
        let m = self.registers.len() as f64;
        let mut sum = 0.0f64;
        let mut zeros = 0usize;
        for &register in &self.registers {
            sum += 2f64.powi(-i32::from(register));
            if register == 0 {
                zeros += 1;
            }
        }

        let raw = alpha(self.registers.len()) * m * m / sum;
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // non-negative, finite
        let rounded = estimate.round() as u64;
        rounded
    }

    /// Folds `other` into this sketch.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::IncompatibleSketch`] if the precisions differ;
    /// `self` is left unchanged.
    pub fn merge(&mut self, other: &Self) -> Result<(), ValueError> {
        if self.precision != other.precision {
            return Err(ValueError::IncompatibleSketch {
                left: self.precision,
                right: other.precision,
            });
        }
        for (mine, &theirs) in self.registers.iter_mut().zip(&other.registers) {
            *mine = (*mine).max(theirs);
        }
        Ok(())
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.precision);
        out.extend_from_slice(&self.registers);
    }

    pub(crate) fn decode(reader: &mut Reader<'_>) -> Result<Self, ValueError> {
        let precision = reader.u8()?;
        if !(4..=16).contains(&precision) {
            return Err(ValueError::Corrupt {
                reason: format!("sketch precision {precision} out of range"),
            });
        }
        let registers = reader.bytes(1 << precision)?.to_vec();
        let max_rank = 64 - precision + 1;
        if let Some(bad) = registers.iter().find(|&&r| r > max_rank) {
            return Err(ValueError::Corrupt {
                reason: format!("sketch register {bad} exceeds rank {max_rank}"),
            });
        }
        Ok(Self {
            precision,
            registers,
        })
    }
}

/// Hashes identity bytes for [`Sketch::insert_hash`].
pub fn hash_identity(identity: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(identity);
    mix(hasher.finish())
}

/// SplitMix64 finalizer; spreads FNV's weak high bits across the word.
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[allow(clippy::cast_precision_loss)]
fn alpha(m: usize) -> f64 {
    match m {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / m as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(precision: u8, range: std::ops::Range<u32>) -> Sketch {
        let mut sketch = Sketch::new(precision);
        for i in range {
            sketch.insert(format!("identity-{i}").as_bytes());
        }
        sketch
    }

    fn relative_error(estimate: u64, actual: u64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let error = estimate.abs_diff(actual) as f64 / actual as f64;
        error
    }

    #[test]
    fn test_empty() {
        let sketch = Sketch::new(14);
        assert!(sketch.is_empty());
        assert_eq!(sketch.estimate(), 0);
    }

    #[test]
    fn test_duplicates_do_not_count() {
        let mut sketch = Sketch::new(14);
        for _ in 0..1_000 {
            sketch.insert(b"same");
        }
        assert_eq!(sketch.estimate(), 1);
    }

    #[test]
    fn test_small_cardinality_is_near_exact() {
        let sketch = filled(14, 0..150);
        assert!(relative_error(sketch.estimate(), 150) < 0.02);
    }

    #[test]
    fn test_large_cardinality_within_bounds() {
        // Standard error at p=12 is about 1.6%
        let sketch = filled(12, 0..100_000);
        assert!(relative_error(sketch.estimate(), 100_000) < 0.06);
    }

    #[test]
    fn test_merge_is_union() {
        let a = filled(14, 0..3_000);
        let b = filled(14, 2_000..5_000);

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert_eq!(ab, ba);
        assert!(relative_error(ab.estimate(), 5_000) < 0.03);

        // Idempotent
        let mut again = ab.clone();
        again.merge(&ab).unwrap();
        assert_eq!(again, ab);
    }

    #[test]
    fn test_merge_incompatible() {
        let mut a = Sketch::new(14);
        let b = Sketch::new(10);
        assert_eq!(
            a.merge(&b).unwrap_err(),
            ValueError::IncompatibleSketch {
                left: 14,
                right: 10
            }
        );
    }

    #[test]
    fn test_hash_is_stable() {
        // Persisted sketches depend on these exact values
        assert_eq!(hash_identity(b"checkout-api"), hash_identity(b"checkout-api"));
        assert_ne!(hash_identity(b"a"), hash_identity(b"b"));
        assert_eq!(mix(0), 0);
    }

    #[test]
    fn test_decode_validation() {
        let sketch = filled(4, 0..10);
        let mut bytes = Vec::new();
        sketch.encode_into(&mut bytes);
        assert_eq!(bytes.len(), 1 + 16);
        assert_eq!(Sketch::decode(&mut Reader::new(&bytes)).unwrap(), sketch);

        let mut bad_rank = bytes.clone();
        bad_rank[1] = 62;
        assert!(Sketch::decode(&mut Reader::new(&bad_rank)).is_err());

        let mut bad_precision = bytes.clone();
        bad_precision[0] = 3;
        assert!(Sketch::decode(&mut Reader::new(&bad_precision)).is_err());

        assert!(Sketch::decode(&mut Reader::new(&bytes[..10])).is_err());
    }
}
