use serde::{Deserialize, Serialize};

use crate::config::Configuration;

/// When a side effect recurs: at fixed simulation-time intervals (snapshot
/// output tracks the flow, not the iteration count), every so many outer
/// steps (diagnostics and the rebalance probe track the step loop, whose
/// cost per step is what they guard), or not at all.
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Time(f64),
    Steps(i64),
    Never,
}

/// One recurring side effect of the outer loop. Due-ness is measured
/// against the base-level clock and the outer step counter, never against
/// wall time, so a restarted run reproduces the same schedule.
#[derive(Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub cadence: Cadence,
    /// The number of times this task has been performed
    pub count: usize,
    next_time: f64,
    next_step: i64,
}

impl Schedule {
    pub fn time(interval: f64) -> Self {
        Self {
            cadence: Cadence::Time(interval),
            count: 0,
            next_time: 0.0,
            next_step: 0,
        }
    }

    pub fn steps(interval: i64) -> Self {
        Self {
            cadence: Cadence::Steps(interval.max(1)),
            count: 0,
            next_time: 0.0,
            next_step: 0,
        }
    }

    pub fn never() -> Self {
        Self {
            cadence: Cadence::Never,
            count: 0,
            next_time: 0.0,
            next_step: 0,
        }
    }

    pub fn is_due(&self, time: f64, step: i64) -> bool {
        match self.cadence {
            Cadence::Time(_) => time >= self.next_time,
            Cadence::Steps(_) => step >= self.next_step,
            Cadence::Never => false,
        }
    }

    /// Mark the task as just performed and schedule the next occurrence.
    pub fn mark_done(&mut self, time: f64, step: i64) {
        self.count += 1;
        match self.cadence {
            Cadence::Time(dt) => {
                self.next_time += dt;
                // a burst of refinement can shrink dt enough that several
                // intervals pass in one step; never schedule in the past
                if self.next_time <= time {
                    self.next_time = time + dt;
                }
            }
            Cadence::Steps(n) => self.next_step = step + n,
            Cadence::Never => {}
        }
    }

    /// Fast-forward past the state of a resumed run, so a restart does not
    /// immediately re-trigger everything that was already done.
    pub fn synchronize(&mut self, time: f64, step: i64) {
        match self.cadence {
            Cadence::Time(dt) => {
                while self.next_time < time {
                    self.next_time += dt;
                }
            }
            Cadence::Steps(n) => {
                self.next_step = (step / n + 1) * n;
            }
            Cadence::Never => {}
        }
    }
}

/// The recurring side effects of a run, matched to the phases of the outer
/// loop they belong to.
#[derive(Clone, Serialize, Deserialize)]
pub struct Tasks {
    /// Write a full snapshot of the patch forest
    pub write_checkpoint: Schedule,

    /// Summarize progress and per-level patch counts
    pub report_progress: Schedule,

    /// Run the diagnostic battery: conservation sums, negative
    /// density/pressure scan, finiteness check
    pub run_checks: Schedule,

    /// Query the weighted load-imbalance factor and trigger a rebalance
    /// when it exceeds the configured bound
    pub rebalance_probe: Schedule,
}

impl Tasks {
    /// Derive the schedules from the run configuration: checkpoints on the
    /// simulation clock, everything else on the step fold.
    pub fn from_configuration(cfg: &Configuration) -> Self {
        let fold = cfg.fold as i64;
        Self {
            write_checkpoint: match cfg.checkpoint_interval {
                Some(dt) => Schedule::time(dt),
                None => Schedule::never(),
            },
            report_progress: Schedule::steps(fold),
            run_checks: Schedule::steps(fold),
            rebalance_probe: Schedule::steps(fold),
        }
    }

    /// Align every schedule with a resumed run's clock and step counter.
    pub fn synchronize(&mut self, time: f64, step: i64) {
        self.write_checkpoint.synchronize(time, step);
        self.report_progress.synchronize(time, step);
        self.run_checks.synchronize(time, step);
        self.rebalance_probe.synchronize(time, step);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn time_schedule_tracks_the_simulation_clock() {
        let mut task = Schedule::time(0.5);
        assert!(task.is_due(0.0, 0));
        task.mark_done(0.0, 0);
        assert!(!task.is_due(0.4, 17));
        assert!(task.is_due(0.5, 17));
        assert_eq!(task.count, 1);
    }

    #[test]
    fn step_schedule_ignores_the_clock() {
        let mut task = Schedule::steps(10);
        assert!(task.is_due(0.0, 0));
        task.mark_done(0.0, 3);
        assert!(!task.is_due(1e10, 12));
        assert!(task.is_due(0.0, 13));
    }

    #[test]
    fn overdue_time_schedule_never_reschedules_in_the_past() {
        let mut task = Schedule::time(0.1);
        task.mark_done(0.75, 0);
        assert!(!task.is_due(0.76, 0));
        assert!(task.is_due(0.85, 0));
    }

    #[test]
    fn synchronize_skips_work_already_done_before_a_restart() {
        let mut task = Schedule::time(0.25);
        task.synchronize(0.6, 40);
        assert!(!task.is_due(0.6, 40));
        assert!(task.is_due(0.75, 41));

        let mut task = Schedule::steps(10);
        task.synchronize(0.0, 25);
        assert!(!task.is_due(0.0, 25));
        assert!(task.is_due(0.0, 30));
    }
}
