//! Wall-clock timings of the phases of a training step.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Data,
    Forward,
    Backward,
    Sync,
    Step,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Data => "data",
            Phase::Forward => "forward",
            Phase::Backward => "backward",
            Phase::Sync => "sync",
            Phase::Step => "step",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub total_secs: f64,
    pub mean_ms: f64,
    pub calls: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileReport {
    pub steps: u64,
    pub phases: BTreeMap<&'static str, PhaseSummary>,
}

/// Accumulates phase timings; a disabled profiler ignores every record.
#[derive(Debug, Default)]
pub struct Profiler {
    enabled: bool,
    steps: u64,
    totals: BTreeMap<Phase, (Duration, u64)>,
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let entry = self.totals.entry(phase).or_default();
        entry.0 += elapsed;
        entry.1 += 1;
    }

    pub fn finish_step(&mut self) {
        if self.enabled {
            self.steps += 1;
        }
    }

    pub fn report(&self) -> ProfileReport {
        let phases = self
            .totals
            .iter()
            .map(|(phase, (total, calls))| {
                let total_secs = total.as_secs_f64();
                let mean_ms = if *calls == 0 {
                    0.0
                } else {
                    total_secs * 1000.0 / *calls as f64
                };
                (
                    phase.name(),
                    PhaseSummary {
                        total_secs,
                        mean_ms,
                        calls: *calls,
                    },
                )
            })
            .collect();
        ProfileReport {
            steps: self.steps,
            phases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_disabled_profiler_records_nothing() {
        let mut profiler = Profiler::new(false);
        profiler.record(Phase::Forward, Duration::from_millis(5));
        profiler.finish_step();
        let report = profiler.report();
        assert_eq!(report.steps, 0);
        assert!(report.phases.is_empty());
    }

    #[test]
    fn test_report_averages_per_call() {
        let mut profiler = Profiler::new(true);
        profiler.record(Phase::Forward, Duration::from_millis(10));
        profiler.record(Phase::Forward, Duration::from_millis(30));
        profiler.record(Phase::Sync, Duration::from_millis(4));
        profiler.finish_step();
        profiler.finish_step();

        let report = profiler.report();
        assert_eq!(report.steps, 2);
        let forward = &report.phases["forward"];
        assert_eq!(forward.calls, 2);
        assert!((forward.mean_ms - 20.0).abs() < 1e-9);
        assert!((report.phases["sync"].total_secs - 0.004).abs() < 1e-9);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["phases"]["forward"]["calls"], 2);
    }
}
