//! Log-linear latency histogram.
//!
//! Values below `2^significant_bits` get one bucket each. Above that, every
//! power-of-two range `[2^e, 2^(e+1))` is split into `2^significant_bits`
//! equal-width buckets, so a bucket's width never exceeds
//! `value / 2^significant_bits`. Bucket boundaries depend only on
//! `significant_bits`, which is fixed by configuration for the lifetime of a
//! store; histograms with different resolutions refuse to merge.
//!
//! Only populated buckets are stored, in a `BTreeMap` so iteration and
//! serialization are in index order.

use std::collections::BTreeMap;

use crate::config::HistogramConfig;
use crate::error::ValueError;
use crate::value::Reader;

/// A populated histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Smallest value in the bucket (inclusive).
    pub lower: u64,
    /// Largest value in the bucket (inclusive).
    pub upper: u64,
    /// Number of recorded values in the bucket.
    pub count: u64,
}

/// Mergeable latency histogram over microsecond durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    significant_bits: u8,
    sum_us: u64,
    buckets: BTreeMap<u32, u64>,
}

impl Histogram {
    /// Creates an empty histogram with the given resolution.
    pub fn new(significant_bits: u8) -> Self {
        Self {
            significant_bits,
            sum_us: 0,
            buckets: BTreeMap::new(),
        }
    }

    /// Creates an empty histogram from configuration.
    pub fn from_config(config: &HistogramConfig) -> Self {
        Self::new(config.significant_bits)
    }

    /// Records one value.
    pub fn record(&mut self, value_us: u64) {
        self.record_n(value_us, 1);
    }

    /// Records `count` occurrences of a value.
    pub fn record_n(&mut self, value_us: u64, count: u64) {
        if count == 0 {
            return;
        }
        let index = bucket_index(value_us, self.significant_bits);
        let slot = self.buckets.entry(index).or_insert(0);
        *slot = slot.saturating_add(count);
        self.sum_us = self.sum_us.saturating_add(value_us.saturating_mul(count));
    }

    /// Resolution in significant bits.
    pub fn significant_bits(&self) -> u8 {
        self.significant_bits
    }

    /// Sum of recorded values in microseconds (saturating).
    pub fn sum_us(&self) -> u64 {
        self.sum_us
    }

    /// Total number of recorded values (saturating).
    pub fn count(&self) -> u64 {
        self.buckets
            .values()
            .fold(0u64, |acc, &c| acc.saturating_add(c))
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Mean of recorded values, or `None` if empty.
    pub fn mean_us(&self) -> Option<u64> {
        let count = self.count();
        (count > 0).then(|| self.sum_us / count)
    }

    /// Adds every bucket of `other` into this histogram.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::IncompatibleHistogram`] if the resolutions differ;
    /// `self` is left unchanged.
    pub fn merge(&mut self, other: &Self) -> Result<(), ValueError> {
        if self.significant_bits != other.significant_bits {
            return Err(ValueError::IncompatibleHistogram {
                left: self.significant_bits,
                right: other.significant_bits,
            });
        }
        for (&index, &count) in &other.buckets {
            let slot = self.buckets.entry(index).or_insert(0);
            *slot = slot.saturating_add(count);
        }
        self.sum_us = self.sum_us.saturating_add(other.sum_us);
        Ok(())
    }

    /// Estimates the value at quantile `q` (0.0 ..= 1.0).
    ///
    /// Returns the midpoint of the bucket holding the rank `ceil(q * count)`,
    /// so the result is within one bucket width of the true value.
    /// Returns `None` if the histogram is empty or `q` is out of range.
    pub fn percentile(&self, q: f64) -> Option<u64> {
        if !(0.0..=1.0).contains(&q) {
            return None;
        }
        let total = self.count();
        if total == 0 {
            return None;
        }

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )] // q in [0, 1] keeps the product within [0, total]
        let rank = ((q * total as f64).ceil() as u64).clamp(1, total);

        let mut seen = 0u64;
        for bucket in self.buckets() {
            seen = seen.saturating_add(bucket.count);
            if seen >= rank {
                return Some(bucket.lower + (bucket.upper - bucket.lower) / 2);
            }
        }
        None
    }

    /// Iterates populated buckets in ascending value order.
    pub fn buckets(&self) -> impl Iterator<Item = Bucket> + '_ {
        self.buckets.iter().map(|(&index, &count)| {
            let (lower, upper) = bucket_bounds(index, self.significant_bits);
            Bucket {
                lower,
                upper,
                count,
            }
        })
    }

    /// Number of populated buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.significant_bits);
        out.extend_from_slice(&self.sum_us.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)] // bounded by max_index() < u32::MAX
        out.extend_from_slice(&(self.buckets.len() as u32).to_le_bytes());
        for (&index, &count) in &self.buckets {
            out.extend_from_slice(&index.to_le_bytes());
            out.extend_from_slice(&count.to_le_bytes());
        }
    }

    pub(crate) fn decode(reader: &mut Reader<'_>) -> Result<Self, ValueError> {
        let significant_bits = reader.u8()?;
        if !(1..=10).contains(&significant_bits) {
            return Err(ValueError::Corrupt {
                reason: format!("histogram resolution {significant_bits} out of range"),
            });
        }
        let sum_us = reader.u64()?;
        let len = reader.u32()?;
        let max_index = max_index(significant_bits);

        let mut buckets = BTreeMap::new();
        let mut previous: Option<u32> = None;
        for _ in 0..len {
            let index = reader.u32()?;
            let count = reader.u64()?;
            if index > max_index {
                return Err(ValueError::Corrupt {
                    reason: format!("histogram bucket {index} exceeds {max_index}"),
                });
            }
            if previous.is_some_and(|p| p >= index) {
                return Err(ValueError::Corrupt {
                    reason: format!("histogram bucket {index} out of order"),
                });
            }
            if count == 0 {
                return Err(ValueError::Corrupt {
                    reason: format!("histogram bucket {index} is empty"),
                });
            }
            buckets.insert(index, count);
            previous = Some(index);
        }

        Ok(Self {
            significant_bits,
            sum_us,
            buckets,
        })
    }
}

/// Returns the bucket index of `value` at the given resolution.
pub fn bucket_index(value: u64, significant_bits: u8) -> u32 {
    let p = u32::from(significant_bits);
    let m = 1u64 << p;
    if value < m {
        #[allow(clippy::cast_possible_truncation)] // value < 2^10
        return value as u32;
    }
    let exponent = 63 - value.leading_zeros();
    let shift = exponent - p;
    #[allow(clippy::cast_possible_truncation)] // (value >> shift) < 2m
    let sub = ((value >> shift) - m) as u32;
    let m = 1u32 << p;
    m + shift * m + sub
}

/// Returns the inclusive value range covered by bucket `index`.
pub fn bucket_bounds(index: u32, significant_bits: u8) -> (u64, u64) {
    let m = 1u32 << significant_bits;
    if index < m {
        return (u64::from(index), u64::from(index));
    }
    let shift = (index - m) / m;
    let sub = (index - m) % m;
    let lower = u64::from(m + sub) << shift;
    let upper = lower + ((1u64 << shift) - 1);
    (lower, upper)
}

fn max_index(significant_bits: u8) -> u32 {
    bucket_index(u64::MAX, significant_bits)
}
