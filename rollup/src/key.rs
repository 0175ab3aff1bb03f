//! Aggregation key codec.
//!
//! An [`AggregationKey`] identifies one buffered aggregate: the interval, the
//! window start, a write partition, and a chain of hierarchy parts
//! (service → transaction type → transaction name, or service → span target).
//!
//! # Encoding
//!
//! ```text
//! +----------------+--------------------+----------------+---------+-----+
//! | interval_ms    | window_start_ns    | partition      | part 0  | ... |
//! | u32 big-endian | u64 big-endian     | u16 big-endian |         |     |
//! +----------------+--------------------+----------------+---------+-----+
//!
//! named part:    [kind u8][0x01][name with 0x00 escaped as 0x00 0xFF][0x00 0x01]
//! overflow part: [kind u8][0x02]
//! ```
//!
//! The fixed-width big-endian header makes keys sort by interval, then window
//! start, so every key of one window lies in a single contiguous range that
//! starts with [`window_prefix`]. Name terminators sort below every escaped or
//! literal byte, so lexicographic order of names is preserved and the encoding
//! of a parent chain is a strict prefix of the encoding of each descendant.

use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// Length of the interval and window-start header.
pub const WINDOW_PREFIX_LEN: usize = 12;

/// Length of the full fixed header including the partition.
pub const HEADER_LEN: usize = 14;

const MARKER_NAMED: u8 = 0x01;
const MARKER_OVERFLOW: u8 = 0x02;
const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;

/// Kind of a hierarchy part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PartKind {
    /// A service identity.
    Service = 1,
    /// A transaction type within a service.
    TransactionType = 2,
    /// A transaction name within a transaction type.
    TransactionName = 3,
    /// A downstream dependency (span destination resource) of a service.
    SpanTarget = 4,
}

impl PartKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Service),
            2 => Some(Self::TransactionType),
            3 => Some(Self::TransactionName),
            4 => Some(Self::SpanTarget),
            _ => None,
        }
    }

    /// Returns the dimension name used in output records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::TransactionType => "transaction_type",
            Self::TransactionName => "transaction_name",
            Self::SpanTarget => "span_target",
        }
    }
}

/// Identity of a part: a concrete name or the scope's reserved overflow slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Identity {
    /// A concrete identity admitted under its own key.
    Named(String),
    /// All identities beyond the scope's cardinality limit.
    Overflow,
}

impl Identity {
    /// Returns the name, or `None` for the overflow slot.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Overflow => None,
        }
    }

    /// Returns `true` for the overflow slot.
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow)
    }
}

/// One element of a key's hierarchy chain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPart {
    /// What the part identifies.
    pub kind: PartKind,
    /// The concrete identity or overflow.
    pub identity: Identity,
}

impl KeyPart {
    /// Creates a named part.
    pub fn named(kind: PartKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            identity: Identity::Named(name.into()),
        }
    }

    /// Creates an overflow part.
    pub fn overflow(kind: PartKind) -> Self {
        Self {
            kind,
            identity: Identity::Overflow,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.kind as u8);
        match &self.identity {
            Identity::Named(name) => {
                out.push(MARKER_NAMED);
                for &byte in name.as_bytes() {
                    out.push(byte);
                    if byte == ESCAPE {
                        out.push(ESCAPED_ZERO);
                    }
                }
                out.push(ESCAPE);
                out.push(TERMINATOR);
            }
            Identity::Overflow => out.push(MARKER_OVERFLOW),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            Identity::Named(name) => write!(f, "{}={}", self.kind.as_str(), name),
            Identity::Overflow => write!(f, "{}=<overflow>", self.kind.as_str()),
        }
    }
}

/// Hierarchy level of a key, determined by the shape of its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    /// Empty chain: everything in the window.
    Global,
    /// `[service]`
    Service,
    /// `[service, transaction type]`
    ServiceTransaction,
    /// `[service, transaction type, transaction name]`
    Transaction,
    /// `[service, span target]`
    Span,
}

impl Level {
    /// Returns the level name used in output records and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Service => "service",
            Self::ServiceTransaction => "service_transaction",
            Self::Transaction => "transaction",
            Self::Span => "span",
        }
    }

    /// Every level, parents before children.
    pub const ALL: [Level; 5] = [
        Level::Global,
        Level::Service,
        Level::ServiceTransaction,
        Level::Transaction,
        Level::Span,
    ];

    fn of_chain(chain: &[KeyPart]) -> Option<Self> {
        use PartKind::{Service, SpanTarget, TransactionName, TransactionType};

        match chain {
            [] => Some(Self::Global),
            [s] if s.kind == Service => Some(Self::Service),
            [s, t] if s.kind == Service && t.kind == TransactionType => {
                Some(Self::ServiceTransaction)
            }
            [s, t] if s.kind == Service && t.kind == SpanTarget => Some(Self::Span),
            [s, t, n]
                if s.kind == Service
                    && t.kind == TransactionType
                    && n.kind == TransactionName =>
            {
                Some(Self::Transaction)
            }
            _ => None,
        }
    }
}

/// Identity of one buffered aggregate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregationKey {
    interval_ms: u32,
    window_start: u64,
    partition: u16,
    chain: Vec<KeyPart>,
}

impl AggregationKey {
    /// Creates the global key of a window.
    pub fn global(interval_ms: u32, window_start: u64) -> Self {
        Self {
            interval_ms,
            window_start,
            partition: 0,
            chain: Vec::new(),
        }
    }

    /// Creates a key from its parts, validating the chain.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Unencodable`] if the chain is not one of the known
    /// level shapes, or if a named part follows an overflow part.
    pub fn new(
        interval_ms: u32,
        window_start: u64,
        partition: u16,
        chain: Vec<KeyPart>,
    ) -> Result<Self, KeyError> {
        validate_chain(&chain).map_err(|reason| KeyError::Unencodable { reason })?;
        Ok(Self {
            interval_ms,
            window_start,
            partition,
            chain,
        })
    }

    /// Returns the key one level below this one.
    ///
    /// The partition is inherited, except below the global key where the
    /// given `partition` applies.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Unencodable`] if the resulting chain is invalid.
    pub fn child(&self, part: KeyPart, partition: u16) -> Result<Self, KeyError> {
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.extend_from_slice(&self.chain);
        chain.push(part);
        let partition = if self.chain.is_empty() {
            partition
        } else {
            self.partition
        };
        Self::new(self.interval_ms, self.window_start, partition, chain)
    }

    /// Returns the key one level above this one, or `None` for the global key.
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.chain.split_last()?;
        Some(Self {
            interval_ms: self.interval_ms,
            window_start: self.window_start,
            partition: if rest.is_empty() { 0 } else { self.partition },
            chain: rest.to_vec(),
        })
    }

    /// Interval length in milliseconds.
    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    /// Window start in nanoseconds since the Unix epoch.
    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    /// Write partition.
    pub fn partition(&self) -> u16 {
        self.partition
    }

    /// Hierarchy chain, outermost part first.
    pub fn chain(&self) -> &[KeyPart] {
        &self.chain
    }

    /// Returns the hierarchy level of this key.
    pub fn level(&self) -> Level {
        // Chains are validated on construction
        Level::of_chain(&self.chain).unwrap_or(Level::Global)
    }

    /// Returns `true` if the last part of the chain is an overflow slot.
    pub fn is_overflow(&self) -> bool {
        self.chain
            .last()
            .is_some_and(|part| part.identity.is_overflow())
    }

    /// Encodes the key into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.chain.len() * 24);
        self.encode_into(&mut out);
        out
    }

    /// Appends the encoded key to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&window_prefix(self.interval_ms, self.window_start));
        out.extend_from_slice(&self.partition.to_be_bytes());
        for part in &self.chain {
            part.encode_into(out);
        }
    }

    /// Decodes a key produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Corrupt`] if the bytes are not a valid key.
    pub fn decode(bytes: &[u8]) -> Result<Self, KeyError> {
        let (interval_ms, window_start) = decode_window(bytes)?;
        if bytes.len() < HEADER_LEN {
            return Err(corrupt(format!(
                "key is {} bytes, shorter than the {HEADER_LEN}-byte header",
                bytes.len()
            )));
        }
        let partition = u16::from_be_bytes([bytes[12], bytes[13]]);

        let mut chain = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < bytes.len() {
            let kind = PartKind::from_byte(bytes[pos])
                .ok_or_else(|| corrupt(format!("unknown part kind {:#04x} at {pos}", bytes[pos])))?;
            let marker = *bytes
                .get(pos + 1)
                .ok_or_else(|| corrupt(format!("missing identity marker at {}", pos + 1)))?;
            pos += 2;

            let identity = match marker {
                MARKER_OVERFLOW => Identity::Overflow,
                MARKER_NAMED => {
                    let (name, next) = decode_name(bytes, pos)?;
                    pos = next;
                    Identity::Named(name)
                }
                other => {
                    return Err(corrupt(format!(
                        "unknown identity marker {other:#04x} at {}",
                        pos - 1
                    )));
                }
            };
            chain.push(KeyPart { kind, identity });
        }

        validate_chain(&chain).map_err(|reason| KeyError::Corrupt { reason })?;
        Ok(Self {
            interval_ms,
            window_start,
            partition,
            chain,
        })
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}ms@{}/p{}",
            self.interval_ms, self.window_start, self.partition
        )?;
        if self.chain.is_empty() {
            return write!(f, "/global");
        }
        for part in &self.chain {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}

/// Returns the prefix shared by every key of one interval.
pub fn interval_prefix(interval_ms: u32) -> [u8; 4] {
    interval_ms.to_be_bytes()
}

/// Returns the prefix shared by every key of one window.
pub fn window_prefix(interval_ms: u32, window_start: u64) -> [u8; WINDOW_PREFIX_LEN] {
    let mut prefix = [0u8; WINDOW_PREFIX_LEN];
    prefix[..4].copy_from_slice(&interval_ms.to_be_bytes());
    prefix[4..].copy_from_slice(&window_start.to_be_bytes());
    prefix
}

/// Reads only the interval and window start of an encoded key.
///
/// Used to locate windows without decoding (possibly corrupt) chains.
///
/// # Errors
///
/// Returns [`KeyError::Corrupt`] if the key is shorter than the window prefix.
pub fn decode_window(bytes: &[u8]) -> Result<(u32, u64), KeyError> {
    if bytes.len() < WINDOW_PREFIX_LEN {
        return Err(corrupt(format!(
            "key is {} bytes, shorter than the {WINDOW_PREFIX_LEN}-byte window prefix",
            bytes.len()
        )));
    }
    let mut interval = [0u8; 4];
    interval.copy_from_slice(&bytes[..4]);
    let mut window = [0u8; 8];
    window.copy_from_slice(&bytes[4..WINDOW_PREFIX_LEN]);
    Ok((u32::from_be_bytes(interval), u64::from_be_bytes(window)))
}

/// Maps a service identity to a write partition.
///
/// Uses FNV-1a, which is stable across processes and releases.
pub fn partition_for(service: &str, partitions: u16) -> u16 {
    if partitions <= 1 {
        return 0;
    }
    let mut hasher = FnvHasher::default();
    hasher.write(service.as_bytes());
    #[allow(clippy::cast_possible_truncation)] // modulo a u16
    let partition = (hasher.finish() % u64::from(partitions)) as u16;
    partition
}

fn decode_name(bytes: &[u8], mut pos: usize) -> Result<(String, usize), KeyError> {
    let start = pos;
    let mut name = Vec::new();
    loop {
        let byte = *bytes
            .get(pos)
            .ok_or_else(|| corrupt(format!("unterminated name starting at {start}")))?;
        if byte != ESCAPE {
            name.push(byte);
            pos += 1;
            continue;
        }
        match bytes.get(pos + 1) {
            Some(&TERMINATOR) => {
                pos += 2;
                break;
            }
            Some(&ESCAPED_ZERO) => {
                name.push(0);
                pos += 2;
            }
            Some(other) => {
                return Err(corrupt(format!(
                    "invalid escape {other:#04x} at {}",
                    pos + 1
                )));
            }
            None => return Err(corrupt(format!("unterminated name starting at {start}"))),
        }
    }
    let name = String::from_utf8(name)
        .map_err(|e| corrupt(format!("name starting at {start} is not UTF-8: {e}")))?;
    Ok((name, pos))
}

fn validate_chain(chain: &[KeyPart]) -> Result<(), String> {
    if Level::of_chain(chain).is_none() {
        let kinds: Vec<&str> = chain.iter().map(|p| p.kind.as_str()).collect();
        return Err(format!("unsupported hierarchy [{}]", kinds.join(", ")));
    }
    let mut overflowed = false;
    for part in chain {
        if overflowed && !part.identity.is_overflow() {
            return Err(format!("named {} below an overflow part", part.kind.as_str()));
        }
        overflowed |= part.identity.is_overflow();
    }
    Ok(())
}

fn corrupt(reason: String) -> KeyError {
    KeyError::Corrupt { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: u32 = 60_000;
    const WINDOW: u64 = 1_700_000_040_000_000_000;

    fn service(name: &str) -> AggregationKey {
        AggregationKey::global(MINUTE_MS, WINDOW)
            .child(KeyPart::named(PartKind::Service, name), 0)
            .unwrap()
    }

    fn transaction(svc: &str, ty: &str, name: &str) -> AggregationKey {
        service(svc)
            .child(KeyPart::named(PartKind::TransactionType, ty), 0)
            .unwrap()
            .child(KeyPart::named(PartKind::TransactionName, name), 0)
            .unwrap()
    }

    #[test]
    fn test_encode_decode_every_level() {
        let keys = vec![
            AggregationKey::global(MINUTE_MS, WINDOW),
            service("checkout-api"),
            service("checkout-api")
                .child(KeyPart::named(PartKind::TransactionType, "request"), 0)
                .unwrap(),
            transaction("checkout-api", "request", "POST /pay"),
            service("checkout-api")
                .child(KeyPart::named(PartKind::SpanTarget, "postgres:5432"), 0)
                .unwrap(),
            service("checkout-api")
                .child(KeyPart::overflow(PartKind::TransactionType), 0)
                .unwrap()
                .child(KeyPart::overflow(PartKind::TransactionName), 0)
                .unwrap(),
        ];

        let levels: Vec<Level> = keys.iter().map(AggregationKey::level).collect();
        assert_eq!(
            levels,
            vec![
                Level::Global,
                Level::Service,
                Level::ServiceTransaction,
                Level::Transaction,
                Level::Span,
                Level::Transaction,
            ]
        );

        for key in keys {
            let decoded = AggregationKey::decode(&key.encode()).unwrap();
            assert_eq!(decoded, key);
        }
    }

    #[test]
    fn test_names_with_zero_bytes() {
        let key = transaction("svc\0a", "\0", "name\0\0end");
        let bytes = key.encode();
        assert_eq!(AggregationKey::decode(&bytes).unwrap(), key);

        // Distinct names never share an encoding
        assert_ne!(service("a\0").encode(), service("a").encode());
    }

    #[test]
    fn test_order_by_interval_then_window() {
        let a = AggregationKey::global(MINUTE_MS, WINDOW).encode();
        let b = AggregationKey::global(MINUTE_MS, WINDOW + 60_000_000_000).encode();
        let c = AggregationKey::global(10 * MINUTE_MS, 0).encode();
        let d = transaction("zzz", "request", "zzz").encode();

        assert!(a < d);
        assert!(d < b);
        assert!(b < c);
    }

    #[test]
    fn test_name_order_preserved() {
        let mut names = vec!["b", "a", "ab", "a\0", "", "aa"];
        let mut encoded: Vec<Vec<u8>> = names.iter().map(|n| service(n).encode()).collect();
        names.sort_unstable();
        encoded.sort();
        let decoded: Vec<String> = encoded
            .iter()
            .map(|b| {
                let key = AggregationKey::decode(b).unwrap();
                key.chain()[0].identity.name().unwrap().to_string()
            })
            .collect();
        assert_eq!(decoded, names);
    }

    #[test]
    fn test_parent_is_prefix_of_descendants() {
        let parent = service("checkout-api").encode();
        let child = transaction("checkout-api", "request", "POST /pay").encode();
        let sibling = service("checkout-api2").encode();

        assert!(child.starts_with(&parent));
        assert!(!sibling.starts_with(&parent));

        let window = window_prefix(MINUTE_MS, WINDOW);
        assert!(child.starts_with(&window));
        assert!(parent.starts_with(&interval_prefix(MINUTE_MS)));
    }

    #[test]
    fn test_invalid_chains_rejected() {
        // Transaction name directly below a service
        let err = AggregationKey::new(
            MINUTE_MS,
            WINDOW,
            0,
            vec![
                KeyPart::named(PartKind::Service, "a"),
                KeyPart::named(PartKind::TransactionName, "b"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, KeyError::Unencodable { .. }));

        // Named identity below an overflow parent
        let err = AggregationKey::new(
            MINUTE_MS,
            WINDOW,
            0,
            vec![
                KeyPart::overflow(PartKind::Service),
                KeyPart::named(PartKind::SpanTarget, "db"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, KeyError::Unencodable { .. }));
    }

    #[test]
    fn test_decode_corrupt() {
        let good = transaction("svc", "request", "GET /").encode();

        let cases: Vec<Vec<u8>> = vec![
            vec![],
            good[..10].to_vec(),
            good[..13].to_vec(),
            // Truncated inside a name
            good[..good.len() - 1].to_vec(),
            // Unknown kind
            [&good[..HEADER_LEN], &[9u8, MARKER_OVERFLOW][..]].concat(),
            // Unknown marker
            [&good[..HEADER_LEN], &[1u8, 7][..]].concat(),
            // Bad escape
            [&good[..HEADER_LEN], &[1u8, MARKER_NAMED, b'a', 0, 5][..]].concat(),
            // Invalid UTF-8
            [&good[..HEADER_LEN], &[1u8, MARKER_NAMED, 0xC3, 0, 1][..]].concat(),
            // Span target without a service
            [&good[..HEADER_LEN], &[4u8, MARKER_OVERFLOW][..]].concat(),
        ];

        for bytes in cases {
            let err = AggregationKey::decode(&bytes).unwrap_err();
            assert!(matches!(err, KeyError::Corrupt { .. }), "{bytes:?}");
        }
    }

    #[test]
    fn test_partition_inheritance() {
        let global = AggregationKey::global(MINUTE_MS, WINDOW);
        let svc = global
            .child(KeyPart::named(PartKind::Service, "a"), 3)
            .unwrap();
        let span = svc
            .child(KeyPart::named(PartKind::SpanTarget, "db"), 7)
            .unwrap();

        assert_eq!(global.partition(), 0);
        assert_eq!(svc.partition(), 3);
        assert_eq!(span.partition(), 3);

        assert_eq!(span.parent().as_ref(), Some(&svc));
        assert_eq!(svc.parent().as_ref(), Some(&global));
        assert_eq!(global.parent(), None);
    }

    #[test]
    fn test_partition_for_is_stable() {
        assert_eq!(partition_for("checkout-api", 1), 0);
        let p = partition_for("checkout-api", 16);
        assert!(p < 16);
        assert_eq!(p, partition_for("checkout-api", 16));
    }

    #[test]
    fn test_display() {
        let key = transaction("svc", "request", "GET /");
        assert_eq!(
            key.to_string(),
            format!(
                "60000ms@{WINDOW}/p0/service=svc/transaction_type=request/transaction_name=GET /"
            )
        );
    }
}
