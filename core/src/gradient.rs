/// Expected-gain gradient estimation from a resampled particle set.
///
/// Provides:
/// - `feature_expectations`: mean particle feature vector (f64 accumulation)
/// - `update_gradient`: REINFORCE-style estimate sum_i g_i (f_i - E[f]) / K
///   plus the per-item regularization gradient
/// - `learning_signal`: gradient and the best/worst particle pair for
///   margin-based learners
/// - `Regularizer` and its implementations, evaluated per item on the
///   pre-resampling distribution
///
/// The estimate is unbiased for the gradient of expected gain under the K
/// resampled particles, not under the search distribution itself.

use log::{debug, info};

use crate::features::FeatureVector;
use crate::gain::BleuGain;
use crate::learner::{LearningSignal, MarginPair};
use crate::resample::{ParticleCollector, ParticleSet};

// ── Regularization ────────────────────────────────────────────────────

/// Per-item regularizer over a normalized distribution.
///
/// `log_probs[i]` is the normalized log-probability of derivation i and
/// `features[i]` its feature vector. Returns (term, gradient factor).
pub trait Regularizer {
    fn evaluate(
        &self,
        log_probs: &[f64],
        features: &[&FeatureVector],
        num_components: usize,
    ) -> (f64, FeatureVector);
}

pub struct NoRegularizer;

impl Regularizer for NoRegularizer {
    fn evaluate(&self, _: &[f64], _: &[&FeatureVector], num_components: usize) -> (f64, FeatureVector) {
        (0.0, FeatureVector::zeros(num_components))
    }
}

/// weight * H(p). The gradient factor assumes log-linear scores
/// (log p_i = w . f_i - log Z), giving
/// dH/dw = -sum_i p_i log p_i (f_i - E_p[f]).
#[derive(Clone, Copy, Debug)]
pub struct EntropyRegularizer {
    pub weight: f64,
}

impl Regularizer for EntropyRegularizer {
    fn evaluate(
        &self,
        log_probs: &[f64],
        features: &[&FeatureVector],
        num_components: usize,
    ) -> (f64, FeatureVector) {
        debug_assert_eq!(log_probs.len(), features.len());
        let mut entropy = 0.0f64;
        let mut expectation = vec![0.0f64; num_components];
        for (&lp, fv) in log_probs.iter().zip(features) {
            let p = lp.exp();
            if p > 0.0 {
                entropy -= p * lp;
            }
            for (e, &v) in expectation.iter_mut().zip(fv.iter()) {
                *e += p * v as f64;
            }
        }

        let mut grad = vec![0.0f64; num_components];
        for (&lp, fv) in log_probs.iter().zip(features) {
            let p = lp.exp();
            if p == 0.0 {
                continue;
            }
            for ((g, &v), &e) in grad.iter_mut().zip(fv.iter()).zip(expectation.iter()) {
                *g -= p * lp * (v as f64 - e);
            }
        }

        let factor = grad.into_iter().map(|g| (self.weight * g) as f32).collect();
        (self.weight * entropy, FeatureVector::from_vec(factor))
    }
}

// ── Estimator ─────────────────────────────────────────────────────────

/// Gains and diagnostics from one gradient update.
#[derive(Clone, Debug, PartialEq)]
pub struct GradientEstimate {
    /// Mean particle gain plus regularization / items.
    pub expected_gain: f64,
    /// Mean particle gain alone.
    pub unregularized_gain: f64,
    /// Sum of hypothesis lengths over all particle stats.
    pub expected_length: f64,
    /// Sum of reference lengths over all particle stats.
    pub reference_length: f64,
    /// Gain of each particle, in slot order.
    pub gains: Vec<f32>,
}

/// Mean feature vector over all particles. Accumulates in f64 and narrows
/// once at the end.
pub fn feature_expectations(particles: &ParticleSet, num_components: usize) -> FeatureVector {
    let mut sum = vec![0.0f64; num_components];
    if particles.is_empty() {
        return FeatureVector::zeros(num_components);
    }
    let iweight = 1.0 / particles.len() as f64;
    for fv in &particles.features {
        for (s, &v) in sum.iter_mut().zip(fv.iter()) {
            *s += v as f64 * iweight;
        }
    }
    FeatureVector::from_vec(sum.into_iter().map(|s| s as f32).collect())
}

/// Add the expected-gain gradient of the collector's particle set to
/// `gradient` and report the expected gain.
///
/// Particle terms are scaled by 1/K. The regularization term and its
/// gradient factor were summed once per item, so both are divided by the
/// collector's item count. The two always cover the same item set because
/// they are accumulated, reset and reduced together.
pub fn update_gradient(
    collector: &ParticleCollector,
    gain: &BleuGain,
    gradient: &mut FeatureVector,
) -> GradientEstimate {
    let particles = collector.particles();
    let dim = collector.num_components();
    let expectations = feature_expectations(particles, dim);
    debug!("FEXP: {:?}", expectations.as_slice());

    let mut grad = FeatureVector::zeros(dim);
    let mut gains = Vec::with_capacity(particles.len());
    let mut exp_gain = 0.0f64;
    let iweight = if particles.is_empty() { 0.0 } else { 1.0 / particles.len() as f64 };
    for (fv, stats) in particles.features.iter().zip(particles.stats.iter()) {
        let g = gain.gain(stats);
        gains.push(g);
        let mut diff = fv.clone();
        diff -= &expectations;
        diff *= g;
        diff *= iweight as f32;
        grad += &diff;
        exp_gain += g as f64 * iweight;
    }
    info!("Gradient without reg: norm {:.6}", grad.norm());

    let unregularized_gain = exp_gain;
    let items = collector.num_items();
    if items > 0 {
        let mut reg_grad = collector.regularization_grad().clone();
        reg_grad /= items as f32;
        grad += &reg_grad;
        exp_gain += collector.regularization() / items as f64;
    }
    info!("Exp gain without reg term: {unregularized_gain:.6}");
    info!("Exp gain with reg term: {exp_gain:.6}");

    *gradient += &grad;
    debug!("Gradient: {:?}", grad.as_slice());

    let expected_length = particles.stats.iter().map(|s| s.hyp_len as f64).sum();
    let reference_length = particles.stats.iter().map(|s| s.ref_len as f64).sum();

    GradientEstimate {
        expected_gain: exp_gain,
        unregularized_gain,
        expected_length,
        reference_length,
        gains,
    }
}

/// Highest-gain vs lowest-gain particle. None when every particle has the
/// same gain.
pub fn margin_pair(particles: &ParticleSet, gains: &[f32]) -> Option<MarginPair> {
    let best = (0..gains.len()).max_by(|&a, &b| gains[a].total_cmp(&gains[b]))?;
    let worst = (0..gains.len()).min_by(|&a, &b| gains[a].total_cmp(&gains[b]))?;
    let gain_delta = gains[best] - gains[worst];
    if gain_delta <= 0.0 {
        return None;
    }
    Some(MarginPair {
        better: particles.features[best].clone(),
        worse: particles.features[worst].clone(),
        gain_delta,
    })
}

/// Build the learner's input from the collector: the gradient estimate and
/// the margin pair.
pub fn learning_signal(collector: &ParticleCollector, gain: &BleuGain) -> (LearningSignal, GradientEstimate) {
    let mut gradient = FeatureVector::zeros(collector.num_components());
    let estimate = update_gradient(collector, gain, &mut gradient);
    let margin = margin_pair(collector.particles(), &estimate.gains);
    (LearningSignal { gradient, margin }, estimate)
}
