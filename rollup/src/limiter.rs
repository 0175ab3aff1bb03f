//! Cardinality limiting with overflow redirection.
//!
//! Each parent key and child kind form a *scope* (for example "span targets
//! under service `checkout-api` in the 12:00 window of the 1m interval").
//! Transaction names are counted per service across every transaction type,
//! so their scope is the service key and each member is a (type, name) pair.
//! A scope admits distinct child identities exactly up to its limit; every
//! further identity is redirected to the scope's overflow key. Admission for one scope is serialized by the mutex of the shard the
//! scope hashes to, so two racing identities at `limit - 1` cannot both win,
//! while unrelated scopes proceed in parallel.
//!
//! Admitted sets live in memory only. [`Limiter::restore`] rebuilds them from
//! the keys still buffered after a restart, [`Limiter::release`] returns the
//! quota of an identity whose key was never written, and
//! [`Limiter::forget_window`] drops them once a window is harvested.

use std::collections::{HashMap, HashSet};
use std::hash::Hasher;

use fnv::FnvHasher;
use parking_lot::Mutex;

use crate::config::LimitsConfig;
use crate::error::KeyError;
use crate::key::{self, AggregationKey, Identity, KeyPart, PartKind};

const SHARDS: usize = 64;

/// Outcome of admitting a child identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The identity was admitted by this call and has its own key.
    New(AggregationKey),
    /// The identity was admitted earlier and has its own key.
    Own(AggregationKey),
    /// The identity was folded into the scope's overflow key.
    Overflow(AggregationKey),
}

impl Admission {
    /// The effective key to merge into.
    pub fn key(&self) -> &AggregationKey {
        match self {
            Self::New(key) | Self::Own(key) | Self::Overflow(key) => key,
        }
    }

    /// Consumes the admission, returning the effective key.
    pub fn into_key(self) -> AggregationKey {
        match self {
            Self::New(key) | Self::Own(key) | Self::Overflow(key) => key,
        }
    }

    /// Returns `true` if this call consumed quota for the identity.
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }

    /// Returns `true` if the identity was redirected.
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow(_))
    }
}

/// Per-scope admission tracker.
///
/// # Example
///
/// ```rust
/// use rollup::config::LimitsConfig;
/// use rollup::key::{AggregationKey, PartKind};
/// use rollup::limiter::Limiter;
///
/// let limiter = Limiter::new(LimitsConfig { max_services: 1, ..LimitsConfig::default() });
/// let global = AggregationKey::global(60_000, 0);
///
/// let a = limiter.admit(&global, PartKind::Service, "a", 0).unwrap();
/// let b = limiter.admit(&global, PartKind::Service, "b", 0).unwrap();
/// assert!(!a.is_overflow());
/// assert!(b.is_overflow());
/// ```
#[derive(Debug)]
pub struct Limiter {
    limits: LimitsConfig,
    shards: Vec<Mutex<HashMap<Vec<u8>, HashSet<String>>>>,
}

impl Limiter {
    /// Creates a limiter with no admitted identities.
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Admits `name` as a child of `parent`.
    ///
    /// Returns the child's own key if it is already admitted or the scope is
    /// below its limit, and the scope's overflow key otherwise. Children of an
    /// overflow parent always go to the overflow key beneath it. `partition`
    /// applies only to children of the global key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Unencodable`] if `kind` cannot follow `parent`.
    pub fn admit(
        &self,
        parent: &AggregationKey,
        kind: PartKind,
        name: &str,
        partition: u16,
    ) -> Result<Admission, KeyError> {
        if parent.is_overflow() {
            return Ok(Admission::Overflow(
                parent.child(KeyPart::overflow(kind), 0)?,
            ));
        }

        let (scope, member) = scope_member(parent, kind, name);
        let admitted = {
            let mut shard = self.shard(&scope).lock();
            let members = shard.entry(scope).or_default();
            if members.contains(&member) {
                Some(false)
            } else if members.len() < self.limit(kind) {
                members.insert(member);
                Some(true)
            } else {
                None
            }
        };

        match admitted {
            Some(fresh) => {
                let key = parent.child(KeyPart::named(kind, name), partition)?;
                Ok(if fresh {
                    Admission::New(key)
                } else {
                    Admission::Own(key)
                })
            }
            None => Ok(Admission::Overflow(
                parent.child(KeyPart::overflow(kind), 0)?,
            )),
        }
    }

    /// Marks the named identities of `keys` as admitted.
    ///
    /// Used after reopening a store so that identities which already own a
    /// key keep owning it. Restored scopes may exceed their limit if the limit
    /// was lowered since the keys were written.
    pub fn restore<'a>(&self, keys: impl IntoIterator<Item = &'a AggregationKey>) -> usize {
        let mut restored = 0;
        for key in keys {
            let Some((scope, member)) = key_scope(key) else {
                continue;
            };
            let mut shard = self.shard(&scope).lock();
            if shard.entry(scope).or_default().insert(member) {
                restored += 1;
            }
        }
        restored
    }

    /// Returns the quota taken by the named identity of `key`.
    ///
    /// Called when the first write for a newly admitted key failed and no
    /// key below it was written either, so nothing in the store owns the
    /// identity.
    pub fn release(&self, key: &AggregationKey) -> bool {
        let Some((scope, member)) = key_scope(key) else {
            return false;
        };
        let mut shard = self.shard(&scope).lock();
        let Some(members) = shard.get_mut(&scope) else {
            return false;
        };
        let removed = members.remove(&member);
        if members.is_empty() {
            shard.remove(&scope);
        }
        removed
    }

    /// Drops every scope belonging to one window.
    pub fn forget_window(&self, interval_ms: u32, window_start: u64) {
        let prefix = key::window_prefix(interval_ms, window_start);
        for shard in &self.shards {
            shard.lock().retain(|scope, _| !scope.starts_with(&prefix));
        }
    }

    /// Number of identities admitted under one scope.
    ///
    /// For [`PartKind::TransactionName`] pass the service key: names are
    /// counted per service.
    pub fn admitted(&self, parent: &AggregationKey, kind: PartKind) -> usize {
        let scope = scope_id(parent, kind);
        self.shard(&scope)
            .lock()
            .get(&scope)
            .map_or(0, HashSet::len)
    }

    /// Number of tracked scopes across all windows.
    pub fn scope_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn limit(&self, kind: PartKind) -> usize {
        let limit = match kind {
            PartKind::Service => self.limits.max_services,
            PartKind::TransactionType => self.limits.max_service_transaction_groups_per_service,
            PartKind::TransactionName => self.limits.max_transaction_groups_per_service,
            PartKind::SpanTarget => self.limits.max_span_groups_per_service,
        };
        limit as usize
    }

    fn shard(&self, scope: &[u8]) -> &Mutex<HashMap<Vec<u8>, HashSet<String>>> {
        let mut hasher = FnvHasher::default();
        hasher.write(scope);
        #[allow(clippy::cast_possible_truncation)] // modulo SHARDS
        let index = (hasher.finish() % SHARDS as u64) as usize;
        &self.shards[index]
    }
}

fn scope_id(parent: &AggregationKey, kind: PartKind) -> Vec<u8> {
    let mut id = parent.encode();
    id.push(kind as u8);
    id
}

/// Scope and member under which `name` is counted as a child of `parent`.
fn scope_member(parent: &AggregationKey, kind: PartKind, name: &str) -> (Vec<u8>, String) {
    if kind == PartKind::TransactionName {
        if let (Some(service), Some(Identity::Named(tx_type))) = (
            parent.parent(),
            parent.chain().last().map(|part| &part.identity),
        ) {
            // Length prefix keeps ("a:b", "c") apart from ("a", "b:c")
            let member = format!("{}:{tx_type}{name}", tx_type.len());
            return (scope_id(&service, kind), member);
        }
    }
    (scope_id(parent, kind), name.to_string())
}

/// Scope and member of a buffered key's own identity, if it is named.
fn key_scope(key: &AggregationKey) -> Option<(Vec<u8>, String)> {
    let last = key.chain().last()?;
    let Identity::Named(name) = &last.identity else {
        return None;
    };
    let parent = key.parent()?;
    Some(scope_member(&parent, last.kind, name))
}
