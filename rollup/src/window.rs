//! Per-interval write gates.
//!
//! A [`WindowGate`] holds a watermark below which windows are sealed. Writers
//! hold the gate's read side from the moment they check their window until
//! their merge-writes are synced; the harvester takes the write side to move
//! the watermark past a window before scanning it. Once [`WindowGate::seal`]
//! returns, every write to a sealed window is durable and none can start, so
//! the harvester never deletes a range that is still being written.
//!
//! The watermark itself is persisted by the buffer store and restored when
//! an aggregator is created, so a reclaimed window stays sealed across
//! restarts.

use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::config::IntervalConfig;

/// Sealed-window watermark for one interval.
#[derive(Debug, Default)]
pub struct WindowGate {
    /// Windows starting before this instant accept no more writes.
    sealed_before: RwLock<u64>,
}

/// Shared hold on a gate.
///
/// While any hold exists the watermark cannot move, so windows that were open
/// when the hold was taken stay open until it is dropped.
#[derive(Debug)]
pub struct WindowHold<'a> {
    guard: RwLockReadGuard<'a, u64>,
}

impl WindowHold<'_> {
    /// Returns `true` if the window starting at `window_start` accepts writes.
    pub fn admits(&self, window_start: u64) -> bool {
        window_start >= *self.guard
    }
}

impl WindowGate {
    /// Creates a gate with every window open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a shared hold for writing.
    ///
    /// Take at most one hold per gate and thread: the lock is fair, so a
    /// second hold behind a waiting sealer would never be granted.
    pub fn hold(&self) -> WindowHold<'_> {
        WindowHold {
            guard: self.sealed_before.read(),
        }
    }

    /// Seals every window that ends at or before `window_end`.
    ///
    /// Blocks until every hold has been dropped. The watermark never moves
    /// backwards; returns `true` if it moved.
    pub fn seal(&self, window_end: u64) -> bool {
        let mut sealed_before = self.sealed_before.write();
        if window_end > *sealed_before {
            *sealed_before = window_end;
            true
        } else {
            false
        }
    }

    /// Current watermark.
    pub fn sealed_before(&self) -> u64 {
        *self.sealed_before.read()
    }
}

/// An interval together with its gate.
#[derive(Debug)]
pub struct IntervalWindow {
    /// Interval configuration.
    pub config: IntervalConfig,
    /// Write gate for this interval.
    pub gate: WindowGate,
}

/// The gates of every configured interval, shortest interval first.
#[derive(Debug)]
pub struct WindowGates {
    intervals: Vec<IntervalWindow>,
}

impl WindowGates {
    /// Creates an open gate for each interval.
    pub fn new(intervals: &[IntervalConfig]) -> Self {
        Self {
            intervals: intervals
                .iter()
                .map(|&config| IntervalWindow {
                    config,
                    gate: WindowGate::new(),
                })
                .collect(),
        }
    }

    /// Looks up an interval by its length.
    pub fn get(&self, interval: Duration) -> Option<&IntervalWindow> {
        self.intervals.iter().find(|w| w.config.interval == interval)
    }

    /// Iterates intervals, shortest first.
    pub fn iter(&self) -> impl Iterator<Item = &IntervalWindow> {
        self.intervals.iter()
    }

    /// Takes a hold on every gate, shortest interval first.
    pub fn hold_all(&self) -> Vec<(&IntervalWindow, WindowHold<'_>)> {
        self.intervals.iter().map(|w| (w, w.gate.hold())).collect()
    }
}
