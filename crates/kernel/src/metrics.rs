use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

static METRICS_LOCK_POISON_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_metrics_lock_poison_once(operation: &'static str) {
    if METRICS_LOCK_POISON_WARNED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(operation, "metrics lock poisoned; recovered inner value");
    }
}

/// Running totals since the simulation was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickCounters {
    pub ticks: u64,
    pub entities_ticked: u64,
    pub mirrored_ticks: u64,
    pub blocks_visited: u64,
    pub block_contacts: u64,
    pub leash_snaps: u64,
    pub leashes_abandoned: u64,
    pub rejected_inputs: u64,
    pub removals: u64,
}

impl TickCounters {
    pub fn since(&self, earlier: &TickCounters) -> TickCounters {
        TickCounters {
            ticks: self.ticks.saturating_sub(earlier.ticks),
            entities_ticked: self.entities_ticked.saturating_sub(earlier.entities_ticked),
            mirrored_ticks: self.mirrored_ticks.saturating_sub(earlier.mirrored_ticks),
            blocks_visited: self.blocks_visited.saturating_sub(earlier.blocks_visited),
            block_contacts: self.block_contacts.saturating_sub(earlier.block_contacts),
            leash_snaps: self.leash_snaps.saturating_sub(earlier.leash_snaps),
            leashes_abandoned: self.leashes_abandoned.saturating_sub(earlier.leashes_abandoned),
            rejected_inputs: self.rejected_inputs.saturating_sub(earlier.rejected_inputs),
            removals: self.removals.saturating_sub(earlier.removals),
        }
    }
}

/// Shared read side of the simulation's counters.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    counters: Arc<RwLock<TickCounters>>,
}

impl Default for MetricsHandle {
    fn default() -> Self {
        Self {
            counters: Arc::new(RwLock::new(TickCounters::default())),
        }
    }
}

impl MetricsHandle {
    pub fn snapshot(&self) -> TickCounters {
        match self.counters.read() {
            Ok(guard) => *guard,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("read");
                *poisoned.into_inner()
            }
        }
    }

    pub(crate) fn publish(&self, counters: TickCounters) {
        match self.counters.write() {
            Ok(mut guard) => *guard = counters,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("write");
                let mut guard = poisoned.into_inner();
                *guard = counters;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopMetricsSnapshot {
    pub tps: f32,
    pub entities_per_tick: f32,
    pub contacts_per_tick: f32,
    pub interval: TickCounters,
}

/// Turns counter totals into per-interval rates.
#[derive(Debug)]
pub struct MetricsAccumulator {
    interval_start: Instant,
    interval: Duration,
    baseline: TickCounters,
}

impl MetricsAccumulator {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_start: Instant::now(),
            interval,
            baseline: TickCounters::default(),
        }
    }

    pub fn maybe_snapshot(&mut self, now: Instant, totals: TickCounters) -> Option<LoopMetricsSnapshot> {
        let elapsed = now.saturating_duration_since(self.interval_start);
        if elapsed < self.interval {
            return None;
        }

        let elapsed_seconds = elapsed.as_secs_f32().max(f32::EPSILON);
        let interval = totals.since(&self.baseline);
        let per_tick = |value: u64| {
            if interval.ticks == 0 {
                0.0
            } else {
                value as f32 / interval.ticks as f32
            }
        };
        let snapshot = LoopMetricsSnapshot {
            tps: interval.ticks as f32 / elapsed_seconds,
            entities_per_tick: per_tick(interval.entities_ticked),
            contacts_per_tick: per_tick(interval.block_contacts),
            interval,
        };

        self.interval_start = now;
        self.baseline = totals;
        Some(snapshot)
    }
}
