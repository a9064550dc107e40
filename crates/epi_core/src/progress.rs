//! Progress reports and remaining-time estimates.

use crate::driver::RunState;
use crate::traits::Horizon;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Wall-clock source for elapsed-time reporting.
pub trait Clock: Send {
    /// Marks the start of the measured interval.
    fn start(&mut self);
    /// Seconds since [`Clock::start`], or zero if it was never called.
    fn elapsed_secs(&self) -> f64;
}

/// [`Clock`] backed by [`Instant`]. The instant is taken on `start`, not on
/// construction, so building one is free on targets without a monotonic clock.
#[derive(Debug, Default)]
pub struct SystemClock {
    started: Option<Instant>,
}

impl Clock for SystemClock {
    fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    fn elapsed_secs(&self) -> f64 {
        self.started.map_or(0.0, |s| s.elapsed().as_secs_f64())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub state: RunState,
    /// Completion in percent, 0 to 100.
    pub percent: f64,
    /// Accepted steps so far.
    pub steps: usize,
    /// Simulated time reached.
    pub time: f64,
    pub status: String,
    pub elapsed_secs: f64,
    pub remaining: String,
}

impl Progress {
    pub fn idle(state: RunState) -> Self {
        Self {
            state,
            percent: 0.0,
            steps: 0,
            time: 0.0,
            status: state.to_string(),
            elapsed_secs: 0.0,
            remaining: format_remaining(None),
        }
    }
}

pub fn percent_complete(horizon: Horizon, steps: usize, time: f64) -> f64 {
    let fraction = match horizon {
        Horizon::Steps(0) => 1.0,
        Horizon::Steps(total) => steps as f64 / total as f64,
        Horizon::Time(tmax) if tmax > 0.0 => time / tmax,
        Horizon::Time(_) => 1.0,
    };
    (fraction * 100.0).clamp(0.0, 100.0)
}

/// Seconds left, extrapolated from the elapsed time.
///
/// Fixed-step runs extrapolate per step. Adaptive runs extrapolate per unit of
/// simulated time, since their steps do not cost the same.
pub fn estimate_remaining(horizon: Horizon, steps: usize, time: f64, elapsed: f64) -> Option<f64> {
    match horizon {
        Horizon::Steps(total) => {
            if steps == 0 {
                return None;
            }
            let left = total.saturating_sub(steps) as f64;
            Some(elapsed / steps as f64 * left)
        }
        Horizon::Time(tmax) => {
            if time <= 0.0 {
                return None;
            }
            Some(elapsed / time * (tmax - time).max(0.0))
        }
    }
}

pub fn format_remaining(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds.filter(|s| s.is_finite()) else {
        return "estimating...".to_string();
    };
    let total = seconds.round() as u64;
    let (hours, minutes, secs) = (total / 3600, total / 60 % 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {secs:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}

/// Builds progress reports for one run and paces them to about one per unit
/// of simulated time.
pub struct ProgressTracker {
    clock: Box<dyn Clock>,
    horizon: Option<Horizon>,
    next_report: f64,
}

impl ProgressTracker {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            clock,
            horizon: None,
            next_report: 1.0,
        }
    }

    pub fn begin(&mut self, horizon: Horizon) {
        self.horizon = Some(horizon);
        self.next_report = 1.0;
        self.clock.start();
    }

    /// Whether a report is due at simulated time `t`. Marks it sent if so.
    pub fn due(&mut self, t: f64) -> bool {
        if t < self.next_report {
            return false;
        }
        self.next_report = t.floor() + 1.0;
        true
    }

    pub fn snapshot(&self, state: RunState, steps: usize, time: f64) -> Progress {
        let Some(horizon) = self.horizon else {
            return Progress::idle(state);
        };
        let elapsed = self.clock.elapsed_secs();
        let percent = percent_complete(horizon, steps, time);
        let remaining = match state {
            RunState::Running => format_remaining(estimate_remaining(horizon, steps, time, elapsed)),
            _ => format_remaining(Some(0.0)),
        };
        let status = match (state, horizon) {
            (RunState::Running, Horizon::Steps(total)) => format!("step {steps} of {total}"),
            (RunState::Running, Horizon::Time(tmax)) => format!("t = {time:.2} of {tmax:.2}"),
            (state, _) => state.to_string(),
        };
        Progress {
            state,
            percent,
            steps,
            time,
            status,
            elapsed_secs: elapsed,
            remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(f64);

    impl Clock for FixedClock {
        fn start(&mut self) {}
        fn elapsed_secs(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn fixed_step_estimate_extrapolates_per_step() {
        let remaining = estimate_remaining(Horizon::Steps(1024), 256, 25.6, 8.0);
        assert_eq!(remaining, Some(24.0));
        assert_eq!(estimate_remaining(Horizon::Steps(1000), 0, 0.0, 1.0), None);
    }

    #[test]
    fn adaptive_estimate_extrapolates_per_simulated_time() {
        let remaining = estimate_remaining(Horizon::Time(96.0), 9000, 32.0, 4.0);
        assert_eq!(remaining, Some(8.0));
        assert_eq!(estimate_remaining(Horizon::Time(100.0), 3, 0.0, 4.0), None);
    }

    #[test]
    fn remaining_time_formats_by_magnitude() {
        assert_eq!(format_remaining(None), "estimating...");
        assert_eq!(format_remaining(Some(12.4)), "12s");
        assert_eq!(format_remaining(Some(125.0)), "2m 05s");
        assert_eq!(format_remaining(Some(3723.0)), "1h 02m 03s");
        assert_eq!(format_remaining(Some(f64::INFINITY)), "estimating...");
    }

    #[test]
    fn reports_are_paced_by_simulated_time() {
        let mut tracker = ProgressTracker::new(Box::new(FixedClock(2.0)));
        tracker.begin(Horizon::Time(10.0));
        assert!(!tracker.due(0.5));
        assert!(tracker.due(1.2));
        assert!(!tracker.due(1.9));
        assert!(tracker.due(3.4));
        assert!(!tracker.due(3.9));

        let progress = tracker.snapshot(RunState::Running, 40, 4.0);
        assert_eq!(progress.percent, 40.0);
        assert_eq!(progress.remaining, "3s");
        assert_eq!(progress.status, "t = 4.00 of 10.00");
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent_complete(Horizon::Time(5.0), 10, 5.3), 100.0);
        assert_eq!(percent_complete(Horizon::Steps(0), 0, 0.0), 100.0);
        assert_eq!(percent_complete(Horizon::Steps(4), 1, 0.0), 25.0);
    }
}
