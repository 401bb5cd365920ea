//! Sufficient statistics and the n-gram overlap gain.
//!
//! `BleuStats` is a plain value record: matched and total n-gram counts per
//! order plus hypothesis and reference lengths. Records add componentwise, so
//! a particle that covers several items is just the sum of their records, and
//! the gain of that particle is computed once from the sum (corpus-level, not
//! an average of sentence gains).

use std::collections::HashMap;
use std::fs;
use std::ops::AddAssign;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::InputError;

// ── Sufficient statistics ─────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BleuStats {
    /// Clipped n-gram matches, index n-1 for order n.
    pub matches: Vec<f32>,
    /// Hypothesis n-gram totals, index n-1 for order n.
    pub totals: Vec<f32>,
    pub hyp_len: f32,
    pub ref_len: f32,
}

impl BleuStats {
    pub fn zeros(order: usize) -> Self {
        BleuStats {
            matches: vec![0.0; order],
            totals: vec![0.0; order],
            hyp_len: 0.0,
            ref_len: 0.0,
        }
    }

    pub fn order(&self) -> usize {
        self.matches.len()
    }

    /// Flat width for a given order: matches, totals, hyp_len, ref_len.
    pub fn flat_width(order: usize) -> usize {
        2 * order + 2
    }

    /// Append the flat layout `[m_1..m_n, t_1..t_n, hyp_len, ref_len]` to `out`.
    pub fn write_flat(&self, out: &mut Vec<f32>) {
        out.extend_from_slice(&self.matches);
        out.extend_from_slice(&self.totals);
        out.push(self.hyp_len);
        out.push(self.ref_len);
    }

    pub fn to_flat(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(Self::flat_width(self.order()));
        self.write_flat(&mut out);
        out
    }

    /// Inverse of `to_flat`. Panics if `flat` is not exactly `flat_width(order)` long.
    pub fn from_flat(order: usize, flat: &[f32]) -> Self {
        assert_eq!(
            flat.len(),
            Self::flat_width(order),
            "flat stats len {} != width {} for order {order}",
            flat.len(),
            Self::flat_width(order),
        );
        BleuStats {
            matches: flat[..order].to_vec(),
            totals: flat[order..2 * order].to_vec(),
            hyp_len: flat[2 * order],
            ref_len: flat[2 * order + 1],
        }
    }
}

impl AddAssign<&BleuStats> for BleuStats {
    fn add_assign(&mut self, rhs: &BleuStats) {
        assert_eq!(self.order(), rhs.order(), "stats order mismatch");
        for (a, &b) in self.matches.iter_mut().zip(rhs.matches.iter()) {
            *a += b;
        }
        for (a, &b) in self.totals.iter_mut().zip(rhs.totals.iter()) {
            *a += b;
        }
        self.hyp_len += rhs.hyp_len;
        self.ref_len += rhs.ref_len;
    }
}

// ── Gain ──────────────────────────────────────────────────────────────

/// Pure map from a stats record to a scalar gain in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BleuGain {
    /// Scales the reference length inside the brevity penalty.
    pub bp_scale: f32,
    /// Add-one smoothing of precisions for orders > 1.
    pub smoothing: bool,
}

impl Default for BleuGain {
    fn default() -> Self {
        BleuGain { bp_scale: 1.0, smoothing: false }
    }
}

impl BleuGain {
    pub fn gain(&self, stats: &BleuStats) -> f32 {
        if stats.hyp_len <= 0.0 || stats.order() == 0 {
            return 0.0;
        }
        let mut log_prec = 0.0f64;
        for n in 0..stats.order() {
            let add = if self.smoothing && n > 0 { 1.0 } else { 0.0 };
            let num = stats.matches[n] as f64 + add;
            let den = stats.totals[n] as f64 + add;
            if num <= 0.0 || den <= 0.0 {
                return 0.0;
            }
            log_prec += num.ln() - den.ln();
        }
        log_prec /= stats.order() as f64;

        let hyp = stats.hyp_len as f64;
        let scaled_ref = self.bp_scale as f64 * stats.ref_len as f64;
        let log_bp = if hyp < scaled_ref { 1.0 - scaled_ref / hyp } else { 0.0 };
        (log_prec + log_bp).exp() as f32
    }
}

// ── Gain metric interface ─────────────────────────────────────────────

/// Per-item gain metric: turns an output token sequence into sufficient
/// statistics against the item's fixed references. Must not keep borrows of
/// the tokens it is given.
pub trait GainMetric {
    fn order(&self) -> usize;
    fn sufficient_stats(&self, tokens: &[String]) -> BleuStats;
}

/// Sentence-level BLEU statistics against one or more references.
#[derive(Clone, Debug)]
pub struct SentenceBleu {
    order: usize,
    /// Per n-gram, the maximum count over all references.
    max_ref_counts: HashMap<Vec<String>, u32>,
    ref_lens: Vec<usize>,
}

fn count_ngrams(tokens: &[String], order: usize) -> HashMap<Vec<String>, u32> {
    let mut counts = HashMap::new();
    for n in 1..=order {
        if tokens.len() < n {
            break;
        }
        for gram in tokens.windows(n) {
            *counts.entry(gram.to_vec()).or_insert(0) += 1;
        }
    }
    counts
}

impl SentenceBleu {
    pub fn new(order: usize, references: &[Vec<String>]) -> Self {
        assert!(order >= 1, "order must be >= 1");
        let mut max_ref_counts: HashMap<Vec<String>, u32> = HashMap::new();
        for reference in references {
            for (gram, count) in count_ngrams(reference, order) {
                let slot = max_ref_counts.entry(gram).or_insert(0);
                *slot = (*slot).max(count);
            }
        }
        SentenceBleu {
            order,
            max_ref_counts,
            ref_lens: references.iter().map(|r| r.len()).collect(),
        }
    }

    /// Whitespace-tokenizes each reference line.
    pub fn from_lines<S: AsRef<str>>(order: usize, lines: &[S]) -> Self {
        let refs: Vec<Vec<String>> = lines
            .iter()
            .map(|l| l.as_ref().split_whitespace().map(str::to_owned).collect())
            .collect();
        Self::new(order, &refs)
    }

    /// Closest reference length; ties go to the shorter reference.
    fn closest_ref_len(&self, hyp_len: usize) -> usize {
        self.ref_lens
            .iter()
            .copied()
            .min_by_key(|&r| (r.abs_diff(hyp_len), r))
            .unwrap_or(0)
    }
}

impl GainMetric for SentenceBleu {
    fn order(&self) -> usize {
        self.order
    }

    fn sufficient_stats(&self, tokens: &[String]) -> BleuStats {
        let mut stats = BleuStats::zeros(self.order);
        for (gram, count) in count_ngrams(tokens, self.order) {
            let n = gram.len();
            let clip = self.max_ref_counts.get(&gram).copied().unwrap_or(0);
            stats.matches[n - 1] += count.min(clip) as f32;
        }
        for n in 1..=self.order {
            stats.totals[n - 1] = tokens.len().saturating_sub(n - 1) as f32;
        }
        stats.hyp_len = tokens.len() as f32;
        stats.ref_len = self.closest_ref_len(tokens.len()) as f32;
        stats
    }
}

/// Load parallel reference files: line i of every file is a reference for
/// corpus line i. The first file decides the number of lines; shorter files
/// contribute empty references.
pub fn load_references<P: AsRef<Path>>(
    files: &[P],
    order: usize,
) -> Result<Vec<SentenceBleu>, InputError> {
    if files.is_empty() {
        return Err(InputError::MissingReference { line: 0, available: 0 });
    }
    let mut contents = Vec::with_capacity(files.len());
    for (i, file) in files.iter().enumerate() {
        let path = file.as_ref();
        info!("Reference {}: {}", i + 1, path.display());
        let text = fs::read_to_string(path).map_err(|source| InputError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        contents.push(text.lines().map(str::to_owned).collect::<Vec<_>>());
    }

    let n = contents[0].len();
    let metrics: Vec<SentenceBleu> = (0..n)
        .map(|line| {
            let refs: Vec<&str> = contents
                .iter()
                .map(|lines| lines.get(line).map(String::as_str).unwrap_or(""))
                .collect();
            SentenceBleu::from_lines(order, &refs)
        })
        .collect();
    info!("Loaded reference translations for {} sentences.", metrics.len());
    Ok(metrics)
}
