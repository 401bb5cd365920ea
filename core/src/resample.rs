/// Log-domain inverse-CDF resampling of derivation distributions.
///
/// For each item the search hands over an unnormalized log-score per
/// derivation. The collector normalizes with a pairwise log-sum-exp, draws K
/// particles with replacement, and accumulates each draw into particle slot
/// j. Slots accumulate across every item since the last `reset`, so slot j is
/// one sample of the whole item set (its stats give a corpus-level gain).

use log::debug;
use rand::distributions::Open01;
use rand::{Rng, RngCore};

use crate::derivation::{Derivation, DerivationDistribution};
use crate::error::SampleError;
use crate::features::FeatureVector;
use crate::gain::{BleuStats, GainMetric};
use crate::gradient::Regularizer;

// ── Log-space arithmetic ──────────────────────────────────────────────

/// log(exp(a) + exp(b)) without leaving log space.
#[inline]
pub fn log_sum(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Pairwise fold of `log_sum` over all scores. -inf for an empty slice.
pub fn log_sum_exp(scores: &[f64]) -> f64 {
    let mut iter = scores.iter().copied();
    match iter.next() {
        Some(first) => iter.fold(first, log_sum),
        None => f64::NEG_INFINITY,
    }
}

/// Validate scores and turn them into log-probabilities in place.
/// Returns the log-normalizer.
pub fn normalize_log_scores(scores: &mut [f64]) -> Result<f64, SampleError> {
    if scores.is_empty() {
        return Err(SampleError::EmptyDistribution);
    }
    if let Some(index) = scores.iter().position(|s| s.is_nan()) {
        return Err(SampleError::InvalidScore { index });
    }
    let log_z = log_sum_exp(scores);
    if !log_z.is_finite() {
        let index = scores.iter().position(|s| !s.is_finite()).unwrap_or(0);
        return Err(SampleError::InvalidScore { index });
    }
    for s in scores.iter_mut() {
        *s -= log_z;
    }
    Ok(log_z)
}

/// Inverse-CDF lookup: walk the cumulative log mass until it reaches `log_u`.
/// The walk starts before index 0, so the answer is one behind where it stops.
pub fn draw_index(log_probs: &[f64], log_u: f64) -> usize {
    debug_assert!(!log_probs.is_empty());
    let mut position = 1;
    let mut cumulative = log_probs[0];
    while position < log_probs.len() && cumulative < log_u {
        cumulative = log_sum(cumulative, log_probs[position]);
        position += 1;
    }
    position - 1
}

/// K independent draws from a normalized log-probability vector.
pub fn draw_indices<R: Rng + ?Sized>(log_probs: &[f64], k: usize, rng: &mut R) -> Vec<usize> {
    (0..k)
        .map(|_| {
            let u: f64 = rng.sample(Open01);
            draw_index(log_probs, u.ln())
        })
        .collect()
}

/// Empirical mass per entry after resampling: count / K.
pub fn resampled_distribution(chosen: &[usize], num_entries: usize) -> Vec<f64> {
    let mut mass = vec![0.0; num_entries];
    if chosen.is_empty() {
        return mass;
    }
    let w = 1.0 / chosen.len() as f64;
    for &c in chosen {
        mass[c] += w;
    }
    mass
}

// ── Particle set ──────────────────────────────────────────────────────

/// K parallel particle slots: features, output lengths, gain statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct ParticleSet {
    pub features: Vec<FeatureVector>,
    pub lengths: Vec<usize>,
    pub stats: Vec<BleuStats>,
}

impl ParticleSet {
    /// K zeroed slots.
    pub fn zeros(k: usize, num_components: usize, order: usize) -> Self {
        ParticleSet {
            features: vec![FeatureVector::zeros(num_components); k],
            lengths: vec![0; k],
            stats: vec![BleuStats::zeros(order); k],
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Sum of all particle feature vectors, accumulated in f64.
    pub fn feature_sum(&self, num_components: usize) -> Vec<f64> {
        let mut sum = vec![0.0f64; num_components];
        for fv in &self.features {
            for (s, &v) in sum.iter_mut().zip(fv.iter()) {
                *s += v as f64;
            }
        }
        sum
    }
}

/// Result of resampling one item.
#[derive(Clone, Debug)]
pub struct ResampleReport {
    /// Entry index chosen by each of the K draws, in draw order.
    pub chosen: Vec<usize>,
    /// Empirical mass per entry (count / K).
    pub resampled: Vec<f64>,
    pub log_normalizer: f64,
}

// ── Collector ─────────────────────────────────────────────────────────

/// Per-rank particle accumulator plus the item counter and the per-item
/// regularization sums that travel with it.
#[derive(Clone, Debug)]
pub struct ParticleCollector {
    samples: usize,
    num_components: usize,
    order: usize,
    particles: ParticleSet,
    num_items: usize,
    regularization: f64,
    regularization_grad: FeatureVector,
}

impl ParticleCollector {
    pub fn new(samples: usize, num_components: usize, order: usize) -> Self {
        assert!(samples >= 1, "samples must be >= 1");
        ParticleCollector {
            samples,
            num_components,
            order,
            particles: ParticleSet::zeros(samples, num_components, order),
            num_items: 0,
            regularization: 0.0,
            regularization_grad: FeatureVector::zeros(num_components),
        }
    }

    /// Clear particles back to K zeroed slots and zero the item counter.
    pub fn reset(&mut self) {
        self.particles = ParticleSet::zeros(self.samples, self.num_components, self.order);
        self.num_items = 0;
        self.regularization = 0.0;
        self.regularization_grad = FeatureVector::zeros(self.num_components);
    }

    /// Resample one item's distribution into the particle slots.
    ///
    /// The regularizer sees the normalized pre-resampling distribution; its
    /// term and gradient factor are summed per item, not per particle.
    pub fn resample<D, G>(
        &mut self,
        distribution: &DerivationDistribution<D>,
        metric: &G,
        regularizer: &dyn Regularizer,
        rng: &mut dyn RngCore,
    ) -> Result<ResampleReport, SampleError>
    where
        D: Derivation,
        G: GainMetric + ?Sized,
    {
        if metric.order() != self.order {
            return Err(SampleError::DimensionMismatch {
                expected: self.order,
                found: metric.order(),
            });
        }
        let derivations: Vec<&D> = distribution.derivations().collect();
        let mut log_probs: Vec<f64> = distribution.scores().collect();
        for d in &derivations {
            let found = d.feature_values().len();
            if found != self.num_components {
                return Err(SampleError::DimensionMismatch { expected: self.num_components, found });
            }
        }
        let log_normalizer = normalize_log_scores(&mut log_probs)?;

        let chosen = draw_indices(&log_probs, self.samples, rng);
        for (j, &c) in chosen.iter().enumerate() {
            let d = derivations[c];
            debug!("Chosen derivation {c} (len {}) for particle {j}", d.target_len());
            self.particles.features[j] += d.feature_values();
            self.particles.lengths[j] += d.target_len();
            let stats = metric.sufficient_stats(d.target_tokens());
            self.particles.stats[j] += &stats;
        }

        let resampled = resampled_distribution(&chosen, derivations.len());
        if log::log_enabled!(log::Level::Debug) {
            for (i, mass) in resampled.iter().enumerate().filter(|(_, &m)| m > 0.0) {
                debug!("After resampling, derivation {i} has mass {mass:.4}");
            }
        }

        let features: Vec<&FeatureVector> = derivations.iter().map(|d| d.feature_values()).collect();
        let (term, grad) = regularizer.evaluate(&log_probs, &features, self.num_components);
        self.regularization += term;
        self.regularization_grad += &grad;
        self.num_items += 1;

        Ok(ResampleReport { chosen, resampled, log_normalizer })
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn num_components(&self) -> usize {
        self.num_components
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn particles(&self) -> &ParticleSet {
        &self.particles
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn regularization(&self) -> f64 {
        self.regularization
    }

    pub fn regularization_grad(&self) -> &FeatureVector {
        &self.regularization_grad
    }

    /// Install reduced totals (coordinating rank after aggregation).
    pub(crate) fn install_totals(
        &mut self,
        particles: ParticleSet,
        num_items: usize,
        regularization: f64,
        regularization_grad: FeatureVector,
    ) {
        self.particles = particles;
        self.num_items = num_items;
        self.regularization = regularization;
        self.regularization_grad = regularization_grad;
    }
}
