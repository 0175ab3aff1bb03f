//! Mergeable metric values.
//!
//! A [`MetricValue`] is the aggregate stored under one key: the event count,
//! an outcome breakdown, a latency [`Histogram`], and, on overflow keys only,
//! a distinct-identity [`Sketch`]. Every field combines with a commutative,
//! associative operation (saturating addition for counts and buckets,
//! register-wise maximum for sketches), so values form a monoid and may be
//! merged in any order and any grouping.
//!
//! # Binary format (version 1, little-endian)
//!
//! ```text
//! [version u8 = 1]
//! [count u64][success u64][failure u64][unknown u64]
//! [hist bits u8][hist sum_us u64][bucket_count u32]([index u32][count u64])*
//! [sketch flag u8: 0 | 1]([precision u8][2^precision registers])?
//! ```
//!
//! Buckets are written in ascending index order and only when non-empty, so
//! equal values always encode to identical bytes.

use crate::config::{HistogramConfig, SketchConfig};
use crate::error::ValueError;
use crate::event::{ApmEvent, Outcome};
use crate::histogram::Histogram;
use crate::sketch::Sketch;

const FORMAT_VERSION: u8 = 1;

/// Aggregated metrics for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricValue {
    count: u64,
    success: u64,
    failure: u64,
    unknown: u64,
    histogram: Histogram,
    sketch: Option<Sketch>,
}

impl MetricValue {
    /// Builds the contribution of a single event.
    ///
    /// Durations above `config.max_value_us` are clamped to it.
    pub fn from_event(event: &ApmEvent, config: &HistogramConfig) -> Self {
        let mut histogram = Histogram::from_config(config);
        histogram.record(event.duration_us.min(config.max_value_us));

        let (success, failure, unknown) = match event.outcome {
            Outcome::Success => (1, 0, 0),
            Outcome::Failure => (0, 1, 0),
            Outcome::Unknown => (0, 0, 1),
        };

        Self {
            count: 1,
            success,
            failure,
            unknown,
            histogram,
            sketch: None,
        }
    }

    /// Returns this contribution with an overflowed identity recorded in its sketch.
    ///
    /// `identity_hash` comes from [`crate::sketch::hash_identity`].
    #[must_use]
    pub fn with_overflow_identity(mut self, identity_hash: u64, config: &SketchConfig) -> Self {
        self.sketch
            .get_or_insert_with(|| Sketch::from_config(config))
            .insert_hash(identity_hash);
        self
    }

    /// Number of events merged into this value.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Number of successful events.
    pub fn success_count(&self) -> u64 {
        self.success
    }

    /// Number of failed events.
    pub fn failure_count(&self) -> u64 {
        self.failure
    }

    /// Number of events with unknown outcome.
    pub fn unknown_count(&self) -> u64 {
        self.unknown
    }

    /// Latency distribution.
    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    /// Distinct overflowed identities, present only on overflow keys.
    pub fn sketch(&self) -> Option<&Sketch> {
        self.sketch.as_ref()
    }

    /// Estimated number of distinct identities folded into this value.
    pub fn overflow_estimate(&self) -> Option<u64> {
        self.sketch.as_ref().map(Sketch::estimate)
    }

    /// Merges `other` into `self`.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::IncompatibleHistogram`] or
    /// [`ValueError::IncompatibleSketch`] if the values were built with
    /// different resolutions. On error `self` is unchanged.
    pub fn merge(&mut self, other: &Self) -> Result<(), ValueError> {
        if self.histogram.significant_bits() != other.histogram.significant_bits() {
            return Err(ValueError::IncompatibleHistogram {
                left: self.histogram.significant_bits(),
                right: other.histogram.significant_bits(),
            });
        }
        if let (Some(mine), Some(theirs)) = (&self.sketch, &other.sketch) {
            if mine.precision() != theirs.precision() {
                return Err(ValueError::IncompatibleSketch {
                    left: mine.precision(),
                    right: theirs.precision(),
                });
            }
        }

        self.count = self.count.saturating_add(other.count);
        self.success = self.success.saturating_add(other.success);
        self.failure = self.failure.saturating_add(other.failure);
        self.unknown = self.unknown.saturating_add(other.unknown);
        self.histogram.merge(&other.histogram)?;
        match (&mut self.sketch, &other.sketch) {
            (Some(mine), Some(theirs)) => mine.merge(theirs)?,
            (None, Some(theirs)) => self.sketch = Some(theirs.clone()),
            (_, None) => {}
        }
        Ok(())
    }

    /// Returns the merge of two values without modifying either.
    ///
    /// # Errors
    ///
    /// See [`merge`](Self::merge).
    pub fn merged(a: &Self, b: &Self) -> Result<Self, ValueError> {
        let mut out = a.clone();
        out.merge(b)?;
        Ok(out)
    }

    /// Serializes the value.
    pub fn encode(&self) -> Vec<u8> {
        let sketch_len = self.sketch.as_ref().map_or(0, |s| 1 + (1usize << s.precision()));
        let mut out =
            Vec::with_capacity(1 + 32 + 13 + self.histogram.bucket_count() * 12 + 1 + sketch_len);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.success.to_le_bytes());
        out.extend_from_slice(&self.failure.to_le_bytes());
        out.extend_from_slice(&self.unknown.to_le_bytes());
        self.histogram.encode_into(&mut out);
        match &self.sketch {
            Some(sketch) => {
                out.push(1);
                sketch.encode_into(&mut out);
            }
            None => out.push(0),
        }
        out
    }

    /// Deserializes a value produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::Corrupt`] for truncated, trailing, or
    /// non-canonical bytes and unknown versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, ValueError> {
        let mut reader = Reader::new(bytes);
        let version = reader.u8()?;
        if version != FORMAT_VERSION {
            return Err(ValueError::Corrupt {
                reason: format!("unsupported value version {version}"),
            });
        }

        let count = reader.u64()?;
        let success = reader.u64()?;
        let failure = reader.u64()?;
        let unknown = reader.u64()?;
        let histogram = Histogram::decode(&mut reader)?;
        let sketch = match reader.u8()? {
            0 => None,
            1 => Some(Sketch::decode(&mut reader)?),
            other => {
                return Err(ValueError::Corrupt {
                    reason: format!("invalid sketch flag {other}"),
                });
            }
        };
        reader.finish()?;

        Ok(Self {
            count,
            success,
            failure,
            unknown,
            histogram,
            sketch,
        })
    }
}

/// Bounds-checked little-endian cursor over stored value bytes.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], ValueError> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.bytes.len());
        let Some(end) = end else {
            return Err(ValueError::Corrupt {
                reason: format!(
                    "truncated: needed {len} bytes at offset {}, have {}",
                    self.pos,
                    self.bytes.len() - self.pos
                ),
            });
        };
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ValueError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ValueError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ValueError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn finish(&self) -> Result<(), ValueError> {
        if self.pos != self.bytes.len() {
            return Err(ValueError::Corrupt {
                reason: format!("{} trailing bytes", self.bytes.len() - self.pos),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::hash_identity;

    fn hist() -> HistogramConfig {
        HistogramConfig::default()
    }

    fn contribution(i: u64) -> MetricValue {
        let outcome = match i % 3 {
            0 => Outcome::Success,
            1 => Outcome::Failure,
            _ => Outcome::Unknown,
        };
        let event = ApmEvent::transaction(0, "svc", "request", "GET /", i * 137 + 1, outcome);
        let value = MetricValue::from_event(&event, &hist());
        if i % 2 == 0 {
            value.with_overflow_identity(
                hash_identity(format!("name-{i}").as_bytes()),
                &SketchConfig { precision: 8 },
            )
        } else {
            value
        }
    }

    fn fold(values: &[MetricValue]) -> MetricValue {
        let mut iter = values.iter();
        let mut acc = iter.next().cloned().unwrap();
        for v in iter {
            acc.merge(v).unwrap();
        }
        acc
    }

    #[test]
    fn test_from_event() {
        let event = ApmEvent::transaction(0, "svc", "request", "GET /", 1_500, Outcome::Failure);
        let value = MetricValue::from_event(&event, &hist());

        assert_eq!(value.count(), 1);
        assert_eq!(value.failure_count(), 1);
        assert_eq!(value.success_count(), 0);
        assert_eq!(value.histogram().count(), 1);
        assert_eq!(value.histogram().sum_us(), 1_500);
        assert!(value.sketch().is_none());
        assert_eq!(value.overflow_estimate(), None);
    }

    #[test]
    fn test_duration_clamped() {
        let config = HistogramConfig {
            significant_bits: 7,
            max_value_us: 1_000,
        };
        let event = ApmEvent::transaction(0, "svc", "request", "GET /", 99_999, Outcome::Success);
        let value = MetricValue::from_event(&event, &config);
        assert_eq!(value.histogram().sum_us(), 1_000);
    }

    #[test]
    fn test_merge_commutative() {
        for i in 0..6 {
            for j in 0..6 {
                let a = contribution(i);
                let b = contribution(j);
                assert_eq!(
                    MetricValue::merged(&a, &b).unwrap(),
                    MetricValue::merged(&b, &a).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_merge_associative() {
        for i in 0..4 {
            let a = contribution(i);
            let b = contribution(i + 5);
            let c = contribution(i + 10);

            let left = MetricValue::merged(&MetricValue::merged(&a, &b).unwrap(), &c).unwrap();
            let right = MetricValue::merged(&a, &MetricValue::merged(&b, &c).unwrap()).unwrap();
            assert_eq!(left, right);
            assert_eq!(left.encode(), right.encode());
        }
    }

    #[test]
    fn test_merge_any_order() {
        let values: Vec<MetricValue> = (0..7).map(contribution).collect();
        let forward = fold(&values);

        let mut reversed = values.clone();
        reversed.reverse();
        assert_eq!(fold(&reversed), forward);

        // Rotations and interleaved groupings
        for shift in 1..values.len() {
            let mut rotated = values.clone();
            rotated.rotate_left(shift);
            assert_eq!(fold(&rotated), forward);
        }
        let evens: Vec<MetricValue> = values.iter().step_by(2).cloned().collect();
        let odds: Vec<MetricValue> = values.iter().skip(1).step_by(2).cloned().collect();
        assert_eq!(
            MetricValue::merged(&fold(&odds), &fold(&evens)).unwrap(),
            forward
        );

        assert_eq!(forward.count(), 7);
        assert_eq!(forward.success_count(), 3);
        assert_eq!(forward.failure_count(), 2);
        assert_eq!(forward.unknown_count(), 2);
    }

    #[test]
    fn test_counts_saturate() {
        let mut value = contribution(1);
        value.count = u64::MAX;
        value.failure = u64::MAX - 1;
        let other = contribution(1);
        value.merge(&other).unwrap();
        value.merge(&other).unwrap();
        assert_eq!(value.count(), u64::MAX);
        assert_eq!(value.failure_count(), u64::MAX);
    }

    #[test]
    fn test_incompatible_merge_leaves_value_unchanged() {
        let mut a = contribution(0);
        let before = a.clone();

        let other_hist = MetricValue::from_event(
            &ApmEvent::transaction(0, "s", "t", "n", 1, Outcome::Success),
            &HistogramConfig {
                significant_bits: 3,
                ..hist()
            },
        );
        assert!(matches!(
            a.merge(&other_hist),
            Err(ValueError::IncompatibleHistogram { left: 7, right: 3 })
        ));

        let other_sketch = contribution(1).with_overflow_identity(1, &SketchConfig { precision: 10 });
        assert!(matches!(
            a.merge(&other_sketch),
            Err(ValueError::IncompatibleSketch { left: 8, right: 10 })
        ));
        assert_eq!(a, before);
    }

    #[test]
    fn test_encode_decode_exact() {
        let values = vec![contribution(0), contribution(1), fold(&(0..20).map(contribution).collect::<Vec<_>>())];
        for value in values {
            let bytes = value.encode();
            let decoded = MetricValue::decode(&bytes).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(decoded.encode(), bytes);
        }
    }

    #[test]
    fn test_decode_corrupt() {
        let bytes = contribution(0).encode();

        let mut bad_version = bytes.clone();
        bad_version[0] = 9;
        let mut bad_flag = contribution(1).encode();
        let last = bad_flag.len() - 1;
        bad_flag[last] = 7;
        let mut trailing = bytes.clone();
        trailing.push(0);

        for case in [
            vec![],
            bytes[..20].to_vec(),
            bytes[..bytes.len() - 1].to_vec(),
            bad_version,
            bad_flag,
            trailing,
        ] {
            assert!(matches!(
                MetricValue::decode(&case),
                Err(ValueError::Corrupt { .. })
            ));
        }
    }
}
