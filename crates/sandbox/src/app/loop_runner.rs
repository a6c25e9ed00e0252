use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use motion_kernel::MetricsAccumulator;
use tracing::{error, info, warn};

use super::bootstrap::AppWiring;

/// Ticks one frame may run, and what happens to the time left over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FramePlan {
    ticks: u32,
    carry: Duration,
    dropped: Duration,
}

/// Headless fixed-step loop: paces ticks to the target rate until the
/// configured tick count is reached or a tick fails.
pub(crate) fn run(app: AppWiring) -> ExitCode {
    let AppWiring {
        settings,
        mut scenario,
    } = app;
    let fixed_dt = tick_duration(settings.target_tps);
    let max_ticks_per_frame = settings.max_ticks_per_frame.max(1);
    let mut metrics_accumulator = MetricsAccumulator::new(settings.metrics_log_interval);
    let mut accumulator = Duration::ZERO;
    let mut last_frame_instant = Instant::now();
    let mut ticks_run = 0u64;

    info!(
        total_ticks = settings.total_ticks,
        target_tps = settings.target_tps,
        entity_count = scenario.entity_count(),
        "sandbox_loop_started"
    );

    while ticks_run < settings.total_ticks {
        let frame_start = Instant::now();
        let ticks_left = settings.total_ticks - ticks_run;
        let plan = match fixed_dt {
            Some(fixed_dt) => {
                let frame_dt = frame_start.saturating_duration_since(last_frame_instant);
                accumulator = accumulator.saturating_add(frame_dt.min(settings.max_frame_delta));
                plan_frame(accumulator, fixed_dt, max_ticks_per_frame, ticks_left)
            }
            None => unpaced_frame(max_ticks_per_frame, ticks_left),
        };
        last_frame_instant = frame_start;
        accumulator = plan.carry;
        if !plan.dropped.is_zero() {
            warn!(
                dropped_backlog_ms = plan.dropped.as_millis() as u64,
                "sim_backlog_dropped"
            );
        }

        for _ in 0..plan.ticks {
            if let Err(err) = scenario.step() {
                error!(error = %err, tick = ticks_run + 1, "simulation_aborted");
                return ExitCode::FAILURE;
            }
            ticks_run += 1;
        }

        if let Some(snapshot) = metrics_accumulator.maybe_snapshot(Instant::now(), scenario.counters()) {
            info!(
                tps = snapshot.tps,
                entities_per_tick = snapshot.entities_per_tick,
                contacts_per_tick = snapshot.contacts_per_tick,
                leash_snaps = snapshot.interval.leash_snaps,
                entity_count = scenario.entity_count(),
                "loop_metrics"
            );
        }

        if let Some(fixed_dt) = fixed_dt {
            let busy = frame_start.elapsed();
            if busy < fixed_dt {
                thread::sleep(fixed_dt - busy);
            }
        }
    }

    scenario.log_summary();
    ExitCode::SUCCESS
}

fn tick_duration(target_tps: u32) -> Option<Duration> {
    (target_tps > 0).then(|| Duration::from_secs_f64(1.0 / f64::from(target_tps)))
}

/// Whole ticks due in `accumulator`, capped per frame and by what is left of
/// the run. Backlog that would still be due after a capped frame is dropped
/// rather than replayed, unless the run ends this frame anyway.
fn plan_frame(accumulator: Duration, fixed_dt: Duration, max_ticks_per_frame: u32, ticks_left: u64) -> FramePlan {
    let due = accumulator.as_nanos() / fixed_dt.as_nanos().max(1);
    let cap = u64::from(max_ticks_per_frame).min(ticks_left);
    let ticks = u32::try_from(due.min(u128::from(cap))).unwrap_or(max_ticks_per_frame);
    let leftover = accumulator.saturating_sub(fixed_dt.saturating_mul(ticks));

    if leftover >= fixed_dt && u64::from(ticks) < ticks_left {
        FramePlan {
            ticks,
            carry: Duration::ZERO,
            dropped: leftover,
        }
    } else {
        FramePlan {
            ticks,
            carry: leftover,
            dropped: Duration::ZERO,
        }
    }
}

fn unpaced_frame(max_ticks_per_frame: u32, ticks_left: u64) -> FramePlan {
    let ticks = u64::from(max_ticks_per_frame).min(ticks_left);
    FramePlan {
        ticks: u32::try_from(ticks).unwrap_or(max_ticks_per_frame),
        carry: Duration::ZERO,
        dropped: Duration::ZERO,
    }
}
