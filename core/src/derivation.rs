//! Candidate derivations and the per-item distribution the search produces.
//!
//! The search process is external. The core only sees derivations through
//! the `Derivation` accessors and only consumes distributions built by a
//! `SearchProcess`.

use rand::RngCore;

use crate::corpus::CorpusItem;
use crate::features::FeatureVector;
use crate::schedule::{Acceptor, Conductor};

// ── Derivation ────────────────────────────────────────────────────────

/// An immutable candidate output.
pub trait Derivation {
    fn feature_values(&self) -> &FeatureVector;

    fn target_tokens(&self) -> &[String];

    fn target_len(&self) -> usize {
        self.target_tokens().len()
    }
}

/// Owned derivation: a feature vector plus the output tokens.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredDerivation {
    pub features: FeatureVector,
    pub tokens: Vec<String>,
}

impl ScoredDerivation {
    pub fn new(features: FeatureVector, output: &str) -> Self {
        ScoredDerivation {
            features,
            tokens: output.split_whitespace().map(str::to_owned).collect(),
        }
    }
}

impl Derivation for ScoredDerivation {
    fn feature_values(&self) -> &FeatureVector {
        &self.features
    }

    fn target_tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl<D: Derivation + ?Sized> Derivation for &D {
    fn feature_values(&self) -> &FeatureVector {
        (**self).feature_values()
    }

    fn target_tokens(&self) -> &[String] {
        (**self).target_tokens()
    }

    fn target_len(&self) -> usize {
        (**self).target_len()
    }
}

// ── Distribution ──────────────────────────────────────────────────────

/// Unnormalized log-domain scores over the distinct derivations found for
/// one item. Entry order carries no meaning beyond making resampling
/// reproducible.
#[derive(Clone, Debug)]
pub struct DerivationDistribution<D> {
    entries: Vec<(D, f64)>,
}

impl<D> Default for DerivationDistribution<D> {
    fn default() -> Self {
        DerivationDistribution { entries: Vec::new() }
    }
}

impl<D> DerivationDistribution<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a derivation with its unnormalized log-score. Callers keep keys
    /// unique; a derivation seen twice by the search is one entry.
    pub fn push(&mut self, derivation: D, log_score: f64) {
        self.entries.push((derivation, log_score));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(D, f64)] {
        &self.entries
    }

    pub fn derivations(&self) -> impl Iterator<Item = &D> {
        self.entries.iter().map(|(d, _)| d)
    }

    pub fn scores(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|&(_, s)| s)
    }
}

impl<D> FromIterator<(D, f64)> for DerivationDistribution<D> {
    fn from_iter<I: IntoIterator<Item = (D, f64)>>(iter: I) -> Self {
        DerivationDistribution { entries: iter.into_iter().collect() }
    }
}

// ── Search interface ──────────────────────────────────────────────────

/// The external annealed search. Given an item and the current weights it
/// runs its own sweeps, paced by the conductor and admitted by the acceptor,
/// and returns the distribution over the derivations it collected.
pub trait SearchProcess {
    type Derivation: Derivation;

    fn sample(
        &mut self,
        item: &CorpusItem,
        weights: &FeatureVector,
        conductor: &mut Conductor,
        acceptor: &Acceptor,
        rng: &mut dyn RngCore,
    ) -> Result<DerivationDistribution<Self::Derivation>, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scored_derivation_tokens() {
        let d = ScoredDerivation::new(FeatureVector::zeros(2), "a  b c ");
        assert_eq!(d.target_len(), 3);
        assert_eq!(d.target_tokens()[2], "c");
    }

    #[test]
    fn test_distribution_collects() {
        let dist: DerivationDistribution<u8> = vec![(1u8, 0.0), (2u8, -1.0)].into_iter().collect();
        assert_eq!(dist.len(), 2);
        assert_eq!(dist.scores().collect::<Vec<_>>(), vec![0.0, -1.0]);
        assert!(DerivationDistribution::<u8>::new().is_empty());
    }
}
