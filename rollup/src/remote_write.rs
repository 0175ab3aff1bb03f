//! Prometheus remote-write sink.
//!
//! Converts harvested [`MetricRecord`]s into remote-write time series and
//! pushes them, snappy-compressed, to a configurable endpoint with
//! exponential-backoff retries. Each record becomes one sample per series:
//!
//! | series                         | value                          |
//! |--------------------------------|--------------------------------|
//! | `apm_events_total`             | `count`                        |
//! | `apm_events_outcome_total`     | per `outcome` label            |
//! | `apm_latency_sum_microseconds` | `latency.sum_us`               |
//! | `apm_latency_microseconds`     | per `quantile` label (if any)  |
//! | `apm_overflow_distinct_estimate` | overflow records only        |
//!
//! Record dimensions become labels, together with `level`, `interval` and the
//! configured external labels.
//!
//! This module is only available when the `prometheus-remote-write` feature
//! is enabled.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollup::remote_write::{RemoteWriteConfig, RemoteWriteSink};
//!
//! let config = RemoteWriteConfig::new("http://localhost:9090/api/v1/write")
//!     .with_external_label("instance", "collector-1");
//! let sink = RemoteWriteSink::new(config);
//! // hand `sink` to a Harvester
//! # let _ = sink;
//! ```

use std::time::Duration;

use prost::Message;

use crate::error::{RemoteWriteError, Result};
use crate::record::MetricRecord;
use crate::sink::Sink;

/// Prometheus remote-write protobuf types.
///
/// Hand-written types matching `prometheus/prompb/remote.proto`.
pub mod proto {
    /// A write request containing one or more time series.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteRequest {
        /// The time series to write.
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }

    /// A single time series with labels and samples.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeSeries {
        /// Labels identifying the series.
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        /// Samples of the series.
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
    }

    /// A key-value label pair.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        /// Label name.
        #[prost(string, tag = "1")]
        pub name: String,
        /// Label value.
        #[prost(string, tag = "2")]
        pub value: String,
    }

    /// A single sample.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Sample {
        /// Sample value.
        #[prost(double, tag = "1")]
        pub value: f64,
        /// Timestamp in milliseconds since epoch.
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }
}

/// Configuration for a Prometheus remote-write endpoint.
#[derive(Debug, Clone)]
pub struct RemoteWriteConfig {
    /// Remote write endpoint URL.
    pub endpoint: String,
    /// HTTP timeout per request.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Initial backoff between retries; doubles each attempt.
    pub retry_backoff: Duration,
    /// Extra HTTP headers, e.g. for authentication.
    pub headers: Vec<(String, String)>,
    /// Labels added to every series.
    pub external_labels: Vec<(String, String)>,
}

impl RemoteWriteConfig {
    /// Creates a config with a 30s timeout, 3 retries and 100ms initial backoff.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            headers: Vec::new(),
            external_labels: Vec::new(),
        }
    }

    /// Adds an HTTP header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds a label to every series.
    #[must_use]
    pub fn with_external_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.external_labels.push((name.into(), value.into()));
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Publishes records to a remote-write endpoint.
#[derive(Debug)]
pub struct RemoteWriteSink {
    config: RemoteWriteConfig,
    client: reqwest::blocking::Client,
}

impl RemoteWriteSink {
    /// Creates a sink for `config`, falling back to a default client if the
    /// configured one cannot be built.
    pub fn new(config: RemoteWriteConfig) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default HTTP client");
                reqwest::blocking::Client::new()
            });
        Self { config, client }
    }

    /// Creates a sink, failing if the HTTP client cannot be built.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteWriteError::ClientCreate`] if the TLS backend fails to initialize.
    pub fn try_new(config: RemoteWriteConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteWriteError::ClientCreate { source: e })?;
        Ok(Self { config, client })
    }

    fn send_with_retry(&self, body: &[u8]) -> Result<()> {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;

        loop {
            let mut request = self
                .client
                .post(&self.config.endpoint)
                .header("Content-Encoding", "snappy")
                .header("Content-Type", "application/x-protobuf")
                .header("X-Prometheus-Remote-Write-Version", "0.1.0");
            for (name, value) in &self.config.headers {
                request = request.header(name, value);
            }

            let error = match request.body(body.to_vec()).send() {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().unwrap_or_default();
                    RemoteWriteError::HttpStatus { status, body }
                }
                Err(e) => RemoteWriteError::RequestFailed { source: e },
            };

            if attempt >= self.config.max_retries {
                return Err(error.into());
            }
            tracing::debug!(attempt, error = %error, "remote write failed, retrying");
            std::thread::sleep(backoff);
            backoff *= 2;
            attempt += 1;
        }
    }
}

impl Sink for RemoteWriteSink {
    fn publish(&self, records: &[MetricRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let body = encode(records, &self.config.external_labels)?;
        self.send_with_retry(&body)
    }
}

/// Encodes records as a snappy-compressed remote-write payload.
///
/// # Errors
///
/// Returns an error if serialization or compression fails.
pub fn encode(records: &[MetricRecord], external_labels: &[(String, String)]) -> Result<Vec<u8>> {
    let request = build_write_request(records, external_labels);
    let mut buf = Vec::with_capacity(request.encoded_len());
    request
        .encode(&mut buf)
        .map_err(|e| RemoteWriteError::Serialization { source: e })?;

    let mut encoder = snap::raw::Encoder::new();
    encoder
        .compress_vec(&buf)
        .map_err(|e| RemoteWriteError::Compression { source: e })
        .map_err(Into::into)
}

#[allow(clippy::cast_precision_loss)] // counters beyond 2^53 lose precision as f64 samples
fn build_write_request(
    records: &[MetricRecord],
    external_labels: &[(String, String)],
) -> proto::WriteRequest {
    let mut timeseries = Vec::with_capacity(records.len() * 8);

    for record in records {
        let base = base_labels(record, external_labels);
        #[allow(clippy::cast_possible_wrap)] // ms since epoch fits in i64
        let timestamp = (record.window_start_ns / 1_000_000) as i64;
        let mut push = |name: &str, extra: Option<(&str, &str)>, value: f64| {
            timeseries.push(proto::TimeSeries {
                labels: labels(name, &base, extra),
                samples: vec![proto::Sample { value, timestamp }],
            });
        };

        push("apm_events_total", None, record.count as f64);
        push(
            "apm_events_outcome_total",
            Some(("outcome", "success")),
            record.success_count as f64,
        );
        push(
            "apm_events_outcome_total",
            Some(("outcome", "failure")),
            record.failure_count as f64,
        );
        push(
            "apm_events_outcome_total",
            Some(("outcome", "unknown")),
            record.unknown_count as f64,
        );
        push(
            "apm_latency_sum_microseconds",
            None,
            record.latency.sum_us as f64,
        );
        for (quantile, value) in [
            ("0.5", record.latency.p50_us),
            ("0.95", record.latency.p95_us),
            ("0.99", record.latency.p99_us),
        ] {
            if let Some(v) = value {
                push("apm_latency_microseconds", Some(("quantile", quantile)), v as f64);
            }
        }
        if let Some(estimate) = record.overflow_distinct_estimate {
            push("apm_overflow_distinct_estimate", None, estimate as f64);
        }
    }

    proto::WriteRequest { timeseries }
}

fn base_labels(record: &MetricRecord, external_labels: &[(String, String)]) -> Vec<proto::Label> {
    let mut labels = Vec::with_capacity(8 + external_labels.len());
    labels.push(proto::Label {
        name: "level".to_string(),
        value: record.level.as_str().to_string(),
    });
    labels.push(proto::Label {
        name: "interval".to_string(),
        value: format!("{}ms", record.interval_ms),
    });
    for (name, value) in record.dimensions() {
        labels.push(proto::Label {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    for (name, value) in external_labels {
        labels.push(proto::Label {
            name: name.clone(),
            value: value.clone(),
        });
    }
    labels
}

/// Adds `__name__` and an optional extra label, sorted by name.
fn labels(name: &str, base: &[proto::Label], extra: Option<(&str, &str)>) -> Vec<proto::Label> {
    let mut result = Vec::with_capacity(base.len() + 2);
    result.push(proto::Label {
        name: "__name__".to_string(),
        value: name.to_string(),
    });
    result.extend_from_slice(base);
    if let Some((name, value)) = extra {
        result.push(proto::Label {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    // Prometheus requires labels sorted by name
    result.sort_by(|a, b| a.name.cmp(&b.name));
    result
}
