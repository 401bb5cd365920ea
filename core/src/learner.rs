/// Online learners over the shared weight vector.
///
/// Both learners keep a running average of every weight snapshot they
/// produce. The averaged weights, not the raw ones, are the trained artifact
/// and what evaluation-time decoding uses.
///
/// - Perceptron-style: w += lr * gradient
/// - MIRA-style: one passive-aggressive step on the best/worst particle pair,
///   tau = min(C, (gain_delta - w . (f_better - f_worse)) / ||f_better - f_worse||^2)

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;

// ── Signal ────────────────────────────────────────────────────────────

/// Highest-gain and lowest-gain particle features with their gain gap.
#[derive(Clone, Debug, PartialEq)]
pub struct MarginPair {
    pub better: FeatureVector,
    pub worse: FeatureVector,
    pub gain_delta: f32,
}

/// Gradient-like input to a learner update.
#[derive(Clone, Debug, PartialEq)]
pub struct LearningSignal {
    pub gradient: FeatureVector,
    pub margin: Option<MarginPair>,
}

// ── Averaging ─────────────────────────────────────────────────────────

/// Current weights plus the running sum of all snapshots.
///
/// Serializable so a training checkpoint can resume the average exactly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearnerState {
    pub weights: FeatureVector,
    pub weight_sum: Vec<f64>,
    pub snapshots: usize,
}

impl LearnerState {
    pub fn new(weights: FeatureVector) -> Self {
        let n = weights.len();
        LearnerState { weights, weight_sum: vec![0.0; n], snapshots: 0 }
    }

    /// Record the current weights into the running average.
    pub fn snapshot(&mut self) {
        for (s, &w) in self.weight_sum.iter_mut().zip(self.weights.iter()) {
            *s += w as f64;
        }
        self.snapshots += 1;
    }

    /// Mean of all snapshots; the current weights before the first one.
    pub fn averaged(&self) -> FeatureVector {
        if self.snapshots == 0 {
            return self.weights.clone();
        }
        let n = self.snapshots as f64;
        FeatureVector::from_vec(self.weight_sum.iter().map(|&s| (s / n) as f32).collect())
    }
}

// ── Trait ─────────────────────────────────────────────────────────────

/// Single owner of the weight vector on a rank.
pub trait OnlineLearner {
    /// Apply one update and record the resulting snapshot.
    fn update(&mut self, signal: &LearningSignal);

    fn weights(&self) -> &FeatureVector;

    fn averaged_weights(&self) -> FeatureVector;

    /// Overwrite the current weights (cross-rank mixing). Does not snapshot.
    fn set_weights(&mut self, weights: FeatureVector);

    fn name(&self) -> &str;

    fn state(&self) -> &LearnerState;

    fn restore_state(&mut self, state: LearnerState);
}

// ── Perceptron ────────────────────────────────────────────────────────

pub struct PerceptronLearner {
    name: String,
    learning_rate: f32,
    state: LearnerState,
}

impl PerceptronLearner {
    pub fn new(weights: FeatureVector, name: impl Into<String>, learning_rate: f32) -> Self {
        PerceptronLearner { name: name.into(), learning_rate, state: LearnerState::new(weights) }
    }
}

impl OnlineLearner for PerceptronLearner {
    fn update(&mut self, signal: &LearningSignal) {
        self.state.weights.add_scaled(&signal.gradient, self.learning_rate);
        self.state.snapshot();
        debug!("{}: step {} gradient norm {:.6}", self.name, self.state.snapshots, signal.gradient.norm());
    }

    fn weights(&self) -> &FeatureVector {
        &self.state.weights
    }

    fn averaged_weights(&self) -> FeatureVector {
        self.state.averaged()
    }

    fn set_weights(&mut self, weights: FeatureVector) {
        assert_eq!(weights.len(), self.state.weights.len(), "weight length mismatch");
        self.state.weights = weights;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &LearnerState {
        &self.state
    }

    fn restore_state(&mut self, state: LearnerState) {
        self.state = state;
    }
}

// ── MIRA ──────────────────────────────────────────────────────────────

pub struct MiraLearner {
    name: String,
    /// Upper bound on the step size tau.
    slack: f32,
    state: LearnerState,
}

impl MiraLearner {
    pub fn new(weights: FeatureVector, name: impl Into<String>, slack: f32) -> Self {
        MiraLearner { name: name.into(), slack, state: LearnerState::new(weights) }
    }

    /// Step size for one pair: 0 when the margin already covers the gain gap.
    fn step_size(&self, pair: &MarginPair) -> Option<(f32, FeatureVector)> {
        let mut diff = pair.better.clone();
        diff -= &pair.worse;
        let norm_sq = diff.norm_sq();
        if norm_sq == 0.0 {
            return None;
        }
        let margin = self.state.weights.dot(&diff);
        let loss = pair.gain_delta as f64 - margin;
        if loss <= 0.0 {
            return None;
        }
        let tau = (loss / norm_sq).min(self.slack as f64) as f32;
        Some((tau, diff))
    }
}

impl OnlineLearner for MiraLearner {
    fn update(&mut self, signal: &LearningSignal) {
        match signal.margin.as_ref().and_then(|pair| self.step_size(pair)) {
            Some((tau, diff)) => {
                self.state.weights.add_scaled(&diff, tau);
                debug!("{}: tau {tau:.6}", self.name);
            }
            None => debug!("{}: constraint satisfied, no change", self.name),
        }
        self.state.snapshot();
    }

    fn weights(&self) -> &FeatureVector {
        &self.state.weights
    }

    fn averaged_weights(&self) -> FeatureVector {
        self.state.averaged()
    }

    fn set_weights(&mut self, weights: FeatureVector) {
        assert_eq!(weights.len(), self.state.weights.len(), "weight length mismatch");
        self.state.weights = weights;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &LearnerState {
        &self.state
    }

    fn restore_state(&mut self, state: LearnerState) {
        self.state = state;
    }
}

// ── Selection ─────────────────────────────────────────────────────────

/// Which update rule to train with. Exactly one is chosen at config time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LearnerKind {
    Perceptron { learning_rate: f32 },
    Mira { slack: f32 },
}

pub fn build_learner(kind: LearnerKind, weights: FeatureVector) -> Box<dyn OnlineLearner> {
    let learner: Box<dyn OnlineLearner> = match kind {
        LearnerKind::Perceptron { learning_rate } => {
            Box::new(PerceptronLearner::new(weights, "Perceptron", learning_rate))
        }
        LearnerKind::Mira { slack } => Box::new(MiraLearner::new(weights, "MIRA", slack)),
    };
    info!("Using learner {}", learner.name());
    learner
}
