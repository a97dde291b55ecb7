//! Per-backend last-activity timestamps
//!
//! Each record is a single atomic holding nanoseconds since the tracker's
//! epoch (shifted by one so zero means "never used"). Writers race with
//! `fetch_max`, so the newest timestamp always wins and a record never moves
//! backward.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const NEVER: u64 = 0;

#[derive(Debug, Default)]
struct ActivityRecord {
    last: AtomicU64,
}

/// Tracks when each backend last served a routed request
#[derive(Debug)]
pub struct ActivityTracker {
    epoch: Instant,
    records: DashMap<String, ActivityRecord>,
}

impl ActivityTracker {
    pub fn new<I, S>(backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = DashMap::new();
        for name in backends {
            records.insert(name.into(), ActivityRecord::default());
        }
        Self {
            epoch: Instant::now(),
            records,
        }
    }

    /// Mark `backend` as active now
    pub fn record_activity(&self, backend: &str) {
        self.record_at(backend, Instant::now());
    }

    fn record_at(&self, backend: &str, at: Instant) {
        let ticks = self.ticks(at);
        if let Some(record) = self.records.get(backend) {
            record.last.fetch_max(ticks, Ordering::AcqRel);
            return;
        }
        self.records
            .entry(backend.to_string())
            .or_default()
            .last
            .fetch_max(ticks, Ordering::AcqRel);
    }

    /// When `backend` last served a request, `None` if never
    pub fn last_activity(&self, backend: &str) -> Option<Instant> {
        let ticks = self.records.get(backend)?.last.load(Ordering::Acquire);
        if ticks == NEVER {
            return None;
        }
        Some(self.epoch + Duration::from_nanos(ticks - 1))
    }

    /// Time since `backend` last served a request, `None` if never
    pub fn idle_duration(&self, backend: &str) -> Option<Duration> {
        self.idle_duration_at(backend, Instant::now())
    }

    /// Idle duration as observed at `now`
    pub fn idle_duration_at(&self, backend: &str, now: Instant) -> Option<Duration> {
        self.last_activity(backend)
            .map(|last| now.saturating_duration_since(last))
    }

    fn ticks(&self, at: Instant) -> u64 {
        let nanos = at.saturating_duration_since(self.epoch).as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX - 1) + 1
    }
}
