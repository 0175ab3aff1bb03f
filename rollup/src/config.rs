//! Configuration types for the rollup aggregation engine.
//!
//! These types define which aggregation intervals exist, how long each one
//! waits for late events before harvesting, how many distinct identities a
//! scope may materialize, and the resolution of the mergeable value parts.
//! The value-format fields (histogram and sketch parameters) are fixed for
//! the lifetime of a buffer store; see [`AggregatorConfig::value_format_hash`].

use std::fs;
use std::hash::Hasher;
use std::path::Path;
use std::time::Duration;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Largest interval the key codec can represent (u32 milliseconds).
const MAX_INTERVAL_MS: u128 = u32::MAX as u128;

/// Top-level configuration consumed by the aggregator, harvester and store.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use rollup::config::{AggregatorConfig, IntervalConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AggregatorConfig {
///     intervals: vec![
///         IntervalConfig::new(Duration::from_secs(60), Duration::from_secs(5))?,
///         IntervalConfig::new(Duration::from_secs(600), Duration::from_secs(5))?,
///     ],
///     ..AggregatorConfig::default()
/// };
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Aggregation intervals, ordered from shortest to longest.
    pub intervals: Vec<IntervalConfig>,

    /// Per-scope cardinality limits.
    pub limits: LimitsConfig,

    /// Latency histogram resolution.
    pub histogram: HistogramConfig,

    /// Distinct-count sketch resolution.
    pub sketch: SketchConfig,

    /// Number of write partitions keys are sharded across.
    pub partitions: u16,

    /// How far ahead of the clock an event timestamp may be.
    #[serde(with = "duration_serde")]
    pub max_future: Duration,

    /// How often the harvester checks for closed windows.
    #[serde(with = "duration_serde")]
    pub harvest_tick: Duration,

    /// How often storage statistics are sampled into gauges.
    #[serde(with = "duration_serde")]
    pub stats_period: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        let delay = Duration::from_secs(5);
        Self {
            intervals: vec![
                IntervalConfig {
                    interval: Duration::from_secs(60),
                    harvest_delay: delay,
                },
                IntervalConfig {
                    interval: Duration::from_secs(600),
                    harvest_delay: delay,
                },
                IntervalConfig {
                    interval: Duration::from_secs(3600),
                    harvest_delay: delay,
                },
            ],
            limits: LimitsConfig::default(),
            histogram: HistogramConfig::default(),
            sketch: SketchConfig::default(),
            partitions: 1,
            max_future: Duration::from_secs(60),
            harvest_tick: Duration::from_secs(1),
            stats_period: Duration::from_secs(10),
        }
    }
}

impl AggregatorConfig {
    /// Loads and validates a configuration from a JSON file.
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.intervals.is_empty() {
            return Err(ConfigError::NoIntervals.into());
        }

        for interval in &self.intervals {
            interval.validate()?;
        }

        for window in self.intervals.windows(2) {
            if window[0].interval >= window[1].interval {
                return Err(ConfigError::IntervalsNotOrdered.into());
            }
        }

        self.limits.validate()?;
        self.histogram.validate()?;
        self.sketch.validate()?;

        if self.partitions == 0 {
            return Err(ConfigError::InvalidPartitions.into());
        }

        for (name, value) in [
            ("max_future", self.max_future),
            ("harvest_tick", self.harvest_tick),
            ("stats_period", self.stats_period),
        ] {
            check_nanos(name, value)?;
        }

        Ok(())
    }

    /// Returns the configuration for `interval`, if it is configured.
    pub fn interval(&self, interval: Duration) -> Option<&IntervalConfig> {
        self.intervals.iter().find(|i| i.interval == interval)
    }

    /// Computes a stable hash of the fields that determine the stored value format.
    ///
    /// Two configurations with the same hash produce values that can be merged
    /// with each other. Intervals, limits and scheduling are excluded since
    /// changing them never reinterprets stored bytes. The hash is FNV-1a over
    /// fixed little-endian bytes, so it is identical on every platform and
    /// toolchain.
    pub fn value_format_hash(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write_u8(self.histogram.significant_bits);
        hasher.write(&self.histogram.max_value_us.to_le_bytes());
        hasher.write_u8(self.sketch.precision);
        hasher.finish()
    }

    /// Returns `max_future` in nanoseconds.
    #[allow(clippy::cast_possible_truncation)] // checked by `validate`
    pub fn max_future_ns(&self) -> u64 {
        self.max_future.as_nanos() as u64
    }
}

/// Configuration of a single aggregation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntervalConfig {
    /// Window length.
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Grace period after a window ends before it is harvested.
    ///
    /// Events for a window are accepted until `window_end + harvest_delay`.
    #[serde(with = "duration_serde")]
    pub harvest_delay: Duration,
}

impl IntervalConfig {
    /// Creates a validated interval configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the interval is zero, not a whole number of
    /// milliseconds, or too long for the key encoding.
    pub fn new(interval: Duration, harvest_delay: Duration) -> Result<Self> {
        let config = Self {
            interval,
            harvest_delay,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates this interval configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidInterval`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidInterval {
                interval: self.interval,
                reason: "interval cannot be zero".to_string(),
            }
            .into());
        }

        if self.interval.subsec_nanos() % 1_000_000 != 0 {
            return Err(ConfigError::InvalidInterval {
                interval: self.interval,
                reason: "interval must be a whole number of milliseconds".to_string(),
            }
            .into());
        }

        if self.interval.as_millis() > MAX_INTERVAL_MS {
            return Err(ConfigError::InvalidInterval {
                interval: self.interval,
                reason: format!("interval exceeds {MAX_INTERVAL_MS} ms"),
            }
            .into());
        }

        check_nanos("harvest_delay", self.harvest_delay)?;

        Ok(())
    }

    /// Returns the interval length in milliseconds, as encoded in keys.
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_INTERVAL_MS
    pub fn interval_ms(&self) -> u32 {
        self.interval.as_millis() as u32
    }

    /// Returns the interval length in nanoseconds.
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_INTERVAL_MS
    pub fn interval_ns(&self) -> u64 {
        self.interval.as_nanos() as u64
    }

    /// Returns the harvest delay in nanoseconds.
    #[allow(clippy::cast_possible_truncation)] // checked by `validate`
    pub fn harvest_delay_ns(&self) -> u64 {
        self.harvest_delay.as_nanos() as u64
    }

    /// Returns the start of the window containing `timestamp_ns`.
    pub fn window_start(&self, timestamp_ns: u64) -> u64 {
        let interval_ns = self.interval_ns();
        timestamp_ns - timestamp_ns % interval_ns
    }

    /// Returns the instant at which the window starting at `window_start` may be harvested.
    pub fn harvest_at(&self, window_start: u64) -> u64 {
        window_start
            .saturating_add(self.interval_ns())
            .saturating_add(self.harvest_delay_ns())
    }
}

/// Maximum number of distinct child identities per parent scope and window.
///
/// Identities beyond a limit are folded into the scope's overflow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Distinct services per window.
    pub max_services: u32,
    /// Distinct transaction types per service.
    pub max_service_transaction_groups_per_service: u32,
    /// Distinct transaction names per service, across all transaction types.
    pub max_transaction_groups_per_service: u32,
    /// Distinct span destinations per service.
    pub max_span_groups_per_service: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_services: 1_000,
            max_service_transaction_groups_per_service: 1_000,
            max_transaction_groups_per_service: 1_000,
            max_span_groups_per_service: 1_000,
        }
    }
}

impl LimitsConfig {
    /// Validates that every limit is positive.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidLimit`] naming the first zero limit.
    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("max_services", self.max_services),
            (
                "max_service_transaction_groups_per_service",
                self.max_service_transaction_groups_per_service,
            ),
            (
                "max_transaction_groups_per_service",
                self.max_transaction_groups_per_service,
            ),
            ("max_span_groups_per_service", self.max_span_groups_per_service),
        ];

        for (name, value) in limits {
            if value == 0 {
                return Err(ConfigError::InvalidLimit { name }.into());
            }
        }

        Ok(())
    }
}

/// Resolution of the log-linear latency histogram.
///
/// Each power-of-two range of durations is split into `2^significant_bits`
/// equal buckets, so the relative error of any reported value is at most
/// `2^-significant_bits` (7 bits: under 0.8%). Memory per populated bucket is
/// constant; higher resolution means more populated buckets per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramConfig {
    /// Sub-bucket bits per power of two.
    pub significant_bits: u8,
    /// Largest recordable duration in microseconds; larger values are clamped.
    pub max_value_us: u64,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            significant_bits: 7,
            max_value_us: 3_600_000_000,
        }
    }
}

impl HistogramConfig {
    /// Validates the histogram parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidHistogram`] if out of range.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.significant_bits) {
            return Err(ConfigError::InvalidHistogram {
                reason: format!(
                    "significant_bits {} must be within 1..=10",
                    self.significant_bits
                ),
            }
            .into());
        }

        if self.max_value_us < (1 << self.significant_bits) {
            return Err(ConfigError::InvalidHistogram {
                reason: format!(
                    "max_value_us {} must be at least {}",
                    self.max_value_us,
                    1u64 << self.significant_bits
                ),
            }
            .into());
        }

        Ok(())
    }
}

/// Resolution of the HyperLogLog distinct-count sketch.
///
/// A sketch holds `2^precision` one-byte registers. The standard error of the
/// estimate is about `1.04 / sqrt(2^precision)`: precision 14 uses 16 KiB per
/// overflow key for roughly 0.8% error, precision 10 uses 1 KiB for 3.3%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SketchConfig {
    /// Register index bits.
    pub precision: u8,
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self { precision: 14 }
    }
}

impl SketchConfig {
    /// Validates the sketch precision.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSketch`] if out of range.
    pub fn validate(&self) -> Result<()> {
        if !(4..=16).contains(&self.precision) {
            return Err(ConfigError::InvalidSketch {
                precision: self.precision,
            }
            .into());
        }
        Ok(())
    }
}

/// Rejects durations that do not fit in `u64` nanoseconds.
fn check_nanos(name: &'static str, value: Duration) -> Result<()> {
    u64::try_from(value.as_nanos())
        .map(|_| ())
        .map_err(|_| ConfigError::DurationOverflow { name, value }.into())
}

/// Serde support for Duration fields.
///
/// Durations are serialized as total seconds (f64) for human readability
/// in JSON configuration files.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}
