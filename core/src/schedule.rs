//! Sweep conductor and move acceptance for the annealed search.
//!
//! The Conductor generates a Pulse per search sweep that tells the search
//! which phase it is in: annealed burn-in (repeated once per reheating,
//! samples discarded) or collection at temperature 1. The search observes the
//! pulse, runs the sweep, then calls `advance`.

use log::debug;
use rand::distributions::Open01;
use rand::{Rng, RngCore};

use crate::resample::{draw_index, normalize_log_scores};

// ── Annealing ─────────────────────────────────────────────────────────

/// Temperature falls linearly from `max_temp` towards 1 over the burn-in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearAnnealing {
    pub burn_in: usize,
    pub max_temp: f64,
}

impl LinearAnnealing {
    pub fn temperature(&self, step: usize) -> f64 {
        if self.burn_in == 0 || step >= self.burn_in {
            return 1.0;
        }
        self.max_temp - (self.max_temp - 1.0) * step as f64 / self.burn_in as f64
    }
}

/// Sweep budget for one item.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepSchedule {
    /// Burn-in sweeps per heating; their samples are discarded.
    pub burn_in: usize,
    /// Collection sweeps after the last burn-in.
    pub iterations: usize,
    /// Number of burn-in phases (at least one is run).
    pub reheatings: usize,
    pub annealing: Option<LinearAnnealing>,
}

impl SweepSchedule {
    pub fn burn_in_sweeps(&self) -> usize {
        self.reheatings.max(1) * self.burn_in
    }

    pub fn total_sweeps(&self) -> usize {
        self.burn_in_sweeps() + self.iterations
    }
}

// ── Conductor ─────────────────────────────────────────────────────────

/// Timing pulse for one sweep. Read-only after creation.
#[derive(Clone, Debug, PartialEq)]
pub struct Pulse {
    pub sweep: usize,
    /// Which heating this burn-in sweep belongs to; `reheatings` once collecting.
    pub reheat: usize,
    pub temperature: f64,
    /// Whether samples from this sweep enter the distribution.
    pub collect: bool,
}

pub struct Conductor {
    schedule: SweepSchedule,
    step: usize,
}

impl Conductor {
    pub fn new(schedule: SweepSchedule) -> Self {
        Conductor { schedule, step: 0 }
    }

    pub fn schedule(&self) -> &SweepSchedule {
        &self.schedule
    }

    /// Pulse for the current sweep.
    pub fn pulse(&self) -> Pulse {
        let burn = self.schedule.burn_in_sweeps();
        if self.step < burn {
            let local = self.step % self.schedule.burn_in;
            let temperature = self
                .schedule
                .annealing
                .map(|a| a.temperature(local))
                .unwrap_or(1.0);
            Pulse {
                sweep: self.step,
                reheat: self.step / self.schedule.burn_in,
                temperature,
                collect: false,
            }
        } else {
            Pulse {
                sweep: self.step,
                reheat: self.schedule.reheatings.max(1),
                temperature: 1.0,
                collect: true,
            }
        }
    }

    /// Advance the sweep counter. Call after the sweep has read the pulse.
    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn is_done(&self) -> bool {
        self.step >= self.schedule.total_sweeps()
    }

    /// Back to sweep 0 for the next item.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

// ── Acceptance ────────────────────────────────────────────────────────

/// Admission rule for local moves. Chooses among scored alternatives (the
/// current state included) by sampling from exp(score / T).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Acceptor {
    /// Always the best-scoring alternative.
    Greedy,
    /// Sampling at a fixed temperature, ignoring the schedule.
    FixedTemperature(f64),
    /// Sampling at the pulse temperature.
    Regular,
}

impl Acceptor {
    pub fn name(&self) -> &'static str {
        match self {
            Acceptor::Greedy => "greedy",
            Acceptor::FixedTemperature(_) => "fixed-temperature",
            Acceptor::Regular => "regular",
        }
    }

    /// Index of the chosen alternative. `scores` must not be empty.
    pub fn choose(&self, scores: &[f64], pulse: &Pulse, rng: &mut dyn RngCore) -> usize {
        assert!(!scores.is_empty(), "acceptor needs at least one alternative");
        let temperature = match *self {
            Acceptor::Greedy => return argmax(scores),
            Acceptor::FixedTemperature(t) => t,
            Acceptor::Regular => pulse.temperature,
        };
        if temperature <= 0.0 {
            return argmax(scores);
        }
        let mut scaled: Vec<f64> = scores.iter().map(|s| s / temperature).collect();
        match normalize_log_scores(&mut scaled) {
            Ok(_) => {
                let u: f64 = rng.sample(Open01);
                draw_index(&scaled, u.ln())
            }
            Err(e) => {
                debug!("acceptor falling back to greedy: {e}");
                argmax(scores)
            }
        }
    }

    /// Two-way move: keep `current` or take `proposed`.
    pub fn accept(&self, current: f64, proposed: f64, pulse: &Pulse, rng: &mut dyn RngCore) -> bool {
        self.choose(&[current, proposed], pulse, rng) == 1
    }
}

fn argmax(scores: &[f64]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate().skip(1) {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_annealing_endpoints() {
        let a = LinearAnnealing { burn_in: 4, max_temp: 4.0 };
        assert_eq!(a.temperature(0), 4.0);
        assert!((a.temperature(2) - 2.5).abs() < 1e-12);
        assert_eq!(a.temperature(4), 1.0);
        assert_eq!(a.temperature(100), 1.0);
    }

    #[test]
    fn test_argmax_first_wins_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), 1);
    }
}
