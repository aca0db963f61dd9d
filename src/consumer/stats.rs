//! Counters for the consumer group.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::RecordOutcome;

#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub records_consumed: AtomicU64,
    pub persisted: AtomicU64,
    pub duplicates: AtomicU64,
    pub filtered: AtomicU64,
    pub skipped: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub batches: AtomicU64,
    pub commits: AtomicU64,
    pub halts: AtomicU64,
    pub rebalances: AtomicU64,
}

impl ConsumerStats {
    pub fn record_outcome(&self, outcome: RecordOutcome) {
        let counter = match outcome {
            RecordOutcome::Persisted => &self.persisted,
            RecordOutcome::Duplicate => &self.duplicates,
            RecordOutcome::Filtered => &self.filtered,
            RecordOutcome::Skipped => &self.skipped,
            RecordOutcome::DeadLettered => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            records_consumed: self.records_consumed.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            halts: self.halts.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub records_consumed: u64,
    pub persisted: u64,
    pub duplicates: u64,
    pub filtered: u64,
    pub skipped: u64,
    pub dead_lettered: u64,
    pub batches: u64,
    pub commits: u64,
    pub halts: u64,
    pub rebalances: u64,
}
