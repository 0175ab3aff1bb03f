//! Error types for the rollup aggregation engine.

use std::time::Duration;

use thiserror::Error;

/// The main error type for all rollup operations.
///
/// This enum covers every failure that can surface from the engine, from
/// decoding stored bytes to publishing finalized records downstream.
#[derive(Error, Debug)]
pub enum RollupError {
    /// A stored key could not be decoded.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// A stored or merged metric value is invalid.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// Error opening or operating on the buffer store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error during configuration validation or loading.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error during event aggregation (write path).
    #[error("aggregate error: {0}")]
    Aggregate(#[from] AggregateError),

    /// Error during a harvest run.
    #[error("harvest error: {0}")]
    Harvest(#[from] HarvestError),

    /// Error reported by a downstream sink.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Error registering or sampling telemetry.
    #[error("telemetry error: {0}")]
    Telemetry(#[from] prometheus::Error),

    /// Error during remote write operations.
    #[cfg(feature = "prometheus-remote-write")]
    #[error("remote write error: {0}")]
    RemoteWrite(#[from] RemoteWriteError),
}

impl RollupError {
    /// Returns `true` if this error stems from undecodable stored bytes.
    ///
    /// Corrupt entries are skipped during harvest instead of failing the
    /// whole window.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Key(KeyError::Corrupt { .. }) | Self::Value(ValueError::Corrupt { .. })
        )
    }
}

/// Errors raised by the key codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The stored key bytes are malformed.
    #[error("corrupt key: {reason}")]
    Corrupt {
        /// Description of what was malformed.
        reason: String,
    },

    /// The key cannot be represented by the encoding.
    #[error("unencodable key: {reason}")]
    Unencodable {
        /// Description of the limit that was hit.
        reason: String,
    },
}

/// Errors raised by the metric value codec and merge algebra.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// The stored value bytes are malformed.
    #[error("corrupt value: {reason}")]
    Corrupt {
        /// Description of what was malformed.
        reason: String,
    },

    /// Two histograms with different resolutions were merged.
    #[error("cannot merge histograms with {left} and {right} significant bits")]
    IncompatibleHistogram {
        /// Resolution of the receiving histogram.
        left: u8,
        /// Resolution of the merged-in histogram.
        right: u8,
    },

    /// Two sketches with different register counts were merged.
    #[error("cannot merge sketches with precision {left} and {right}")]
    IncompatibleSketch {
        /// Precision of the receiving sketch.
        left: u8,
        /// Precision of the merged-in sketch.
        right: u8,
    },
}

/// Errors that can occur when opening or operating on the buffer store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store directory could not be created or accessed.
    #[error("failed to access store directory '{path}': {source}")]
    DirectoryAccess {
        /// The path that could not be accessed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The metadata file (meta.json) is corrupted or invalid.
    #[error("corrupted metadata file: {reason}")]
    CorruptedMetadata {
        /// Description of what was invalid about the metadata.
        reason: String,
    },

    /// The value format of the existing store differs from the configured one.
    #[error("value format mismatch: existing store hash {existing:x} does not match configured {expected:x}")]
    ConfigMismatch {
        /// Hash recorded in the existing store.
        existing: u64,
        /// Hash of the configuration used to open the store.
        expected: u64,
    },

    /// Failed to serialize metadata to JSON.
    #[error("failed to serialize metadata: {0}")]
    MetadataSerialize(#[from] serde_json::Error),

    /// The embedded engine failed a read, write, or flush.
    #[error("storage engine failure: {0}")]
    Engine(#[from] sled::Error),

    /// Writes were applied but the flush that makes them durable failed.
    #[error("write was not made durable: {reason}")]
    Unsynced {
        /// The flush failure.
        reason: String,
    },

    /// A merge-write lost the compare-and-swap race too many times.
    #[error("merge-write on a contended key gave up after {attempts} attempts")]
    Contention {
        /// Number of attempts made.
        attempts: u32,
    },
}

/// Errors that can occur during configuration validation or loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No aggregation intervals are configured.
    #[error("at least one aggregation interval must be configured")]
    NoIntervals,

    /// An interval configuration is invalid.
    #[error("invalid interval {interval:?}: {reason}")]
    InvalidInterval {
        /// The offending interval.
        interval: Duration,
        /// Why it is invalid.
        reason: String,
    },

    /// Intervals are not strictly increasing.
    #[error("intervals must be strictly increasing")]
    IntervalsNotOrdered,

    /// A cardinality limit is zero.
    #[error("cardinality limit '{name}' must be > 0")]
    InvalidLimit {
        /// Name of the limit.
        name: &'static str,
    },

    /// Histogram parameters are out of range.
    #[error("invalid histogram configuration: {reason}")]
    InvalidHistogram {
        /// Why it is invalid.
        reason: String,
    },

    /// Sketch parameters are out of range.
    #[error("invalid sketch precision {precision} (must be within 4..=16)")]
    InvalidSketch {
        /// The configured precision.
        precision: u8,
    },

    /// The partition count is zero.
    #[error("partition count must be > 0")]
    InvalidPartitions,

    /// A duration does not fit in 64-bit nanoseconds.
    #[error("'{name}' of {value:?} exceeds the nanosecond range")]
    DurationOverflow {
        /// Name of the setting.
        name: &'static str,
        /// Configured value.
        value: Duration,
    },

    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// The config file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// The config file path.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur while aggregating an event.
#[derive(Error, Debug)]
pub enum AggregateError {
    /// Every configured interval already closed the event's window.
    #[error("event at {timestamp} arrived after all of its windows closed")]
    TooLate {
        /// The event timestamp in nanoseconds.
        timestamp: u64,
    },

    /// The event timestamp is too far ahead of the clock.
    #[error("event at {timestamp} is more than {max_future:?} ahead of now ({now})")]
    InFuture {
        /// The event timestamp in nanoseconds.
        timestamp: u64,
        /// The clock reading in nanoseconds.
        now: u64,
        /// The configured tolerance.
        max_future: Duration,
    },

    /// The aggregator no longer accepts events.
    #[error("aggregator is closed")]
    Closed,

    /// Some of the event's keys could not be merged.
    #[error("{failed} of {total} merges failed; first failure: {first}")]
    PartialFailure {
        /// Number of keys that failed.
        failed: usize,
        /// Number of keys attempted.
        total: usize,
        /// The first failure observed.
        first: Box<RollupError>,
    },
}

/// Errors that can occur during a harvest run.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// The sink did not acknowledge the batch; nothing was reclaimed.
    #[error("publishing window {window_start} of interval {interval:?} failed: {source}")]
    Publish {
        /// The interval being harvested.
        interval: Duration,
        /// The window start in nanoseconds.
        window_start: u64,
        /// The sink failure.
        #[source]
        source: Box<RollupError>,
    },

    /// The run was cancelled before reclaiming the window.
    #[error("harvest of window {window_start} of interval {interval:?} was cancelled")]
    Cancelled {
        /// The interval being harvested.
        interval: Duration,
        /// The window start in nanoseconds.
        window_start: u64,
    },

    /// The interval is not part of the configuration.
    #[error("interval {interval:?} is not configured")]
    UnknownInterval {
        /// The requested interval.
        interval: Duration,
    },
}

/// Errors that a downstream sink can report.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Writing the batch failed.
    #[error("failed to write records: {source}")]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized.
    #[error("failed to serialize record: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The sink refused the batch.
    #[error("sink rejected batch: {reason}")]
    Rejected {
        /// Why the batch was rejected.
        reason: String,
    },
}

/// Errors that can occur during Prometheus remote-write operations.
#[cfg(feature = "prometheus-remote-write")]
#[derive(Error, Debug)]
pub enum RemoteWriteError {
    /// Failed to serialize `WriteRequest` to protobuf.
    #[error("failed to serialize write request: {source}")]
    Serialization {
        /// The protobuf encoding error.
        #[source]
        source: prost::EncodeError,
    },

    /// Failed to compress data with Snappy.
    #[error("failed to compress data: {source}")]
    Compression {
        /// The snappy compression error.
        #[source]
        source: snap::Error,
    },

    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request failed after retries.
    #[error("HTTP request failed: {source}")]
    RequestFailed {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Server returned non-2xx status after retries.
    #[error("server returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },
}

/// Type alias for `Result<T, RollupError>`.
pub type Result<T> = std::result::Result<T, RollupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        let key: RollupError = KeyError::Corrupt {
            reason: "truncated".to_string(),
        }
        .into();
        let value: RollupError = ValueError::Corrupt {
            reason: "bad version".to_string(),
        }
        .into();
        let contention: RollupError = StoreError::Contention { attempts: 3 }.into();

        assert!(key.is_corruption());
        assert!(value.is_corruption());
        assert!(!contention.is_corruption());
    }

    #[test]
    fn test_partial_failure_display() {
        let err = AggregateError::PartialFailure {
            failed: 1,
            total: 4,
            first: Box::new(StoreError::Contention { attempts: 8 }.into()),
        };
        let text = err.to_string();
        assert!(text.starts_with("1 of 4 merges failed"));
        assert!(text.contains("8 attempts"));
    }
}
