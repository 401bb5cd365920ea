/// Cross-rank aggregation of particle accumulators.
///
/// Nested per-particle containers cannot be reduced directly, so each rank
/// flattens its feature vectors, lengths and gain statistics into contiguous
/// f64 buffers, the group sum-reduces them, and the coordinating rank
/// unflattens the totals back into a particle set.
///
/// Every collective here must be entered by every rank of the group, the
/// same number of times and in the same order. A rank that skips a call
/// leaves the others blocked inside the reduction. This is a caller
/// contract; nothing below tries to detect it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use log::{debug, info};

use crate::error::TransportError;
use crate::features::FeatureVector;
use crate::gain::BleuStats;
use crate::learner::{LearningSignal, MarginPair};
use crate::resample::{ParticleCollector, ParticleSet};

/// Rank that owns the aggregated totals.
pub const ROOT: usize = 0;

// ── ProcessGroup trait ────────────────────────────────────────────────

/// Collective sum-reduction backend. All-or-nothing: if any rank fails,
/// every rank gets an error.
pub trait ProcessGroup {
    /// In-place sum allreduce: after the call, buf holds the element-wise
    /// sum across all ranks.
    fn allreduce_sum(&self, buf: &mut [f64]) -> Result<(), TransportError>;
    /// Total number of ranks in the group.
    fn world_size(&self) -> usize;
    /// This rank's index (0-based).
    fn rank(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == ROOT
    }
}

// ── LocalProcessGroup ─────────────────────────────────────────────────

/// Single-rank group. Reduction is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalProcessGroup;

impl ProcessGroup for LocalProcessGroup {
    fn allreduce_sum(&self, _buf: &mut [f64]) -> Result<(), TransportError> {
        Ok(())
    }

    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

// ── SharedMemoryGroup ─────────────────────────────────────────────────

struct Reduction {
    sum: Vec<f64>,
    len: Option<usize>,
    /// First rank whose buffer length disagreed: (rank, found).
    mismatch: Option<(usize, usize)>,
}

struct SharedState {
    barrier: Barrier,
    reduction: Mutex<Reduction>,
}

/// Thread-backed process group: one handle per rank, moved into its own
/// thread. Ranks meet at a barrier and sum into a shared accumulator.
pub struct SharedMemoryGroup {
    rank_id: usize,
    world: usize,
    shared: Arc<SharedState>,
    calls: AtomicUsize,
}

impl SharedMemoryGroup {
    /// Create N connected handles, index = rank.
    pub fn new_group(world_size: usize) -> Vec<Self> {
        assert!(world_size > 0, "world_size must be >= 1");
        let shared = Arc::new(SharedState {
            barrier: Barrier::new(world_size),
            reduction: Mutex::new(Reduction { sum: Vec::new(), len: None, mismatch: None }),
        });
        (0..world_size)
            .map(|r| SharedMemoryGroup {
                rank_id: r,
                world: world_size,
                shared: shared.clone(),
                calls: AtomicUsize::new(0),
            })
            .collect()
    }

    /// Number of allreduce calls this rank has entered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Lock the accumulator even if a rank panicked while holding it. The
    /// caller still walks every barrier and fails afterwards, so all ranks
    /// leave the call together.
    fn lock(&self, poisoned: &mut bool) -> MutexGuard<'_, Reduction> {
        self.shared.reduction.lock().unwrap_or_else(|e| {
            *poisoned = true;
            e.into_inner()
        })
    }
}

impl ProcessGroup for SharedMemoryGroup {
    fn allreduce_sum(&self, buf: &mut [f64]) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut poisoned = false;

        // Phase 1: contribute.
        {
            let mut red = self.lock(&mut poisoned);
            match red.len {
                None => {
                    red.len = Some(buf.len());
                    red.sum = buf.to_vec();
                }
                Some(len) if len != buf.len() => {
                    if red.mismatch.is_none() {
                        red.mismatch = Some((self.rank_id, buf.len()));
                    }
                }
                Some(_) => {
                    for (s, &v) in red.sum.iter_mut().zip(buf.iter()) {
                        *s += v;
                    }
                }
            }
        }
        self.shared.barrier.wait();

        // Phase 2: read back. Every rank sees the same outcome.
        let outcome = {
            let red = self.lock(&mut poisoned);
            match (red.mismatch, red.len) {
                (Some((rank, found)), Some(expected)) => {
                    Err(TransportError::BufferMismatch { rank, expected, found })
                }
                _ => {
                    buf.copy_from_slice(&red.sum);
                    Ok(())
                }
            }
        };
        if self.shared.barrier.wait().is_leader() {
            let mut red = self.lock(&mut poisoned);
            red.sum.clear();
            red.len = None;
            red.mismatch = None;
        }
        // Phase 3: nobody starts the next reduction before the reset.
        self.shared.barrier.wait();
        if poisoned {
            return Err(TransportError::Poisoned(format!("rank {}: reduction state poisoned", self.rank_id)));
        }
        outcome
    }

    fn world_size(&self) -> usize {
        self.world
    }

    fn rank(&self) -> usize {
        self.rank_id
    }
}

// ── Flatten / unflatten ───────────────────────────────────────────────

/// Particle features as one contiguous buffer, particle-major.
pub fn flatten_features(particles: &ParticleSet, num_components: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(particles.len() * num_components);
    for fv in &particles.features {
        debug_assert_eq!(fv.len(), num_components);
        out.extend(fv.iter().map(|&v| v as f64));
    }
    out
}

pub fn unflatten_features(flat: &[f64], num_components: usize) -> Vec<FeatureVector> {
    if num_components == 0 {
        return Vec::new();
    }
    flat.chunks_exact(num_components)
        .map(|chunk| FeatureVector::from_vec(chunk.iter().map(|&v| v as f32).collect()))
        .collect()
}

/// Gain statistics as one contiguous buffer of `BleuStats::flat_width(order)`
/// values per particle.
pub fn flatten_stats(particles: &ParticleSet, order: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(particles.len() * BleuStats::flat_width(order));
    let mut scratch = Vec::with_capacity(BleuStats::flat_width(order));
    for stats in &particles.stats {
        scratch.clear();
        stats.write_flat(&mut scratch);
        out.extend(scratch.iter().map(|&v| v as f64));
    }
    out
}

pub fn unflatten_stats(flat: &[f64], order: usize) -> Vec<BleuStats> {
    let width = BleuStats::flat_width(order);
    flat.chunks_exact(width)
        .map(|chunk| {
            let narrow: Vec<f32> = chunk.iter().map(|&v| v as f32).collect();
            BleuStats::from_flat(order, &narrow)
        })
        .collect()
}

fn flatten_lengths(particles: &ParticleSet) -> Vec<f64> {
    particles.lengths.iter().map(|&l| l as f64).collect()
}

fn unflatten_lengths(flat: &[f64]) -> Vec<usize> {
    flat.iter().map(|&l| l.round() as usize).collect()
}

/// Rebuild a particle set from the three flat buffers.
pub fn unflatten_particles(
    features: &[f64],
    lengths: &[f64],
    stats: &[f64],
    num_components: usize,
    order: usize,
) -> ParticleSet {
    ParticleSet {
        features: unflatten_features(features, num_components),
        lengths: unflatten_lengths(lengths),
        stats: unflatten_stats(stats, order),
    }
}

// ── Aggregation ───────────────────────────────────────────────────────

/// How per-rank particle sets combine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateLayout {
    /// Ranks' particles are laid end to end: K1 + K2 + ... particles.
    #[default]
    Concatenate,
    /// Slot j is the sum of every rank's slot j. Needs equal K everywhere.
    Elementwise,
}

/// Outcome of one aggregation. Totals are identical on every rank.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateReport {
    /// Particle count per rank.
    pub counts: Vec<usize>,
    pub total_particles: usize,
    pub num_items: usize,
    /// Sum of output lengths over all particles of all ranks.
    pub total_length: usize,
    pub allreduce_count: usize,
}

/// Reduce every rank's collector into global totals.
///
/// On the coordinating rank the collector is overwritten with the combined
/// particle set, item count and regularization sums. Other ranks keep their
/// local state, which is stale until they reset.
pub fn aggregate_particles(
    collector: &mut ParticleCollector,
    pg: &dyn ProcessGroup,
    layout: AggregateLayout,
) -> Result<AggregateReport, TransportError> {
    let world = pg.world_size();
    assert!(world > 0, "world_size must be >= 1");
    let rank = pg.rank();
    let dim = collector.num_components();
    let order = collector.order();
    let width = BleuStats::flat_width(order);
    let local = collector.particles();
    // A rank with no items this round holds only zeroed slots; concatenating
    // them would add empty particles to the global set.
    let k = match layout {
        AggregateLayout::Concatenate if collector.num_items() == 0 => 0,
        _ => local.len(),
    };
    let mut allreduce_count = 0usize;

    let mut counts_buf = vec![0.0f64; world];
    counts_buf[rank] = k as f64;
    pg.allreduce_sum(&mut counts_buf)?;
    allreduce_count += 1;
    let counts: Vec<usize> = counts_buf.iter().map(|&c| c.round() as usize).collect();
    let total: usize = counts.iter().sum();

    let (mut features, mut lengths, mut stats) = match layout {
        AggregateLayout::Concatenate => {
            let offset: usize = counts[..rank].iter().sum();
            let mut features = vec![0.0f64; total * dim];
            let mut lengths = vec![0.0f64; total];
            let mut stats = vec![0.0f64; total * width];
            if k > 0 {
                features[offset * dim..(offset + k) * dim].copy_from_slice(&flatten_features(local, dim));
                lengths[offset..offset + k].copy_from_slice(&flatten_lengths(local));
                stats[offset * width..(offset + k) * width].copy_from_slice(&flatten_stats(local, order));
            }
            (features, lengths, stats)
        }
        AggregateLayout::Elementwise => {
            if counts.iter().any(|&c| c != k) {
                return Err(TransportError::ParticleCountMismatch { counts });
            }
            (flatten_features(local, dim), flatten_lengths(local), flatten_stats(local, order))
        }
    };
    pg.allreduce_sum(&mut features)?;
    pg.allreduce_sum(&mut lengths)?;
    pg.allreduce_sum(&mut stats)?;
    allreduce_count += 3;

    let mut scalars = Vec::with_capacity(2 + dim);
    scalars.push(collector.num_items() as f64);
    scalars.push(collector.regularization());
    scalars.extend(collector.regularization_grad().iter().map(|&v| v as f64));
    pg.allreduce_sum(&mut scalars)?;
    allreduce_count += 1;

    let num_items = scalars[0].round() as usize;
    let total_length = lengths.iter().sum::<f64>().round() as usize;
    let total_particles = lengths.len();
    debug!("Rank {rank}: aggregated counts {counts:?} into {total_particles} particles");

    if rank == ROOT {
        let particles = unflatten_particles(&features, &lengths, &stats, dim, order);
        let reg_grad = FeatureVector::from_vec(scalars[2..].iter().map(|&v| v as f32).collect());
        collector.install_totals(particles, num_items, scalars[1], reg_grad);
        info!("Aggregated {total_particles} particles over {num_items} items from {world} ranks");
    }

    Ok(AggregateReport { counts, total_particles, num_items, total_length, allreduce_count })
}

// ── Broadcast / mixing ────────────────────────────────────────────────

/// Root's buffer to every rank: non-root ranks contribute zeros to a sum.
pub fn broadcast(buf: &mut [f64], pg: &dyn ProcessGroup) -> Result<(), TransportError> {
    if pg.rank() != ROOT {
        buf.iter_mut().for_each(|v| *v = 0.0);
    }
    pg.allreduce_sum(buf)
}

/// Send the root's learning signal to every rank. Non-root ranks pass any
/// signal of the right dimension; it is overwritten.
pub fn broadcast_signal(signal: &mut LearningSignal, pg: &dyn ProcessGroup) -> Result<(), TransportError> {
    let dim = signal.gradient.len();
    // [gradient | has_margin, gain_delta | better | worse]
    let mut buf = vec![0.0f64; 3 * dim + 2];
    buf[..dim].iter_mut().zip(signal.gradient.iter()).for_each(|(b, &g)| *b = g as f64);
    if let Some(pair) = &signal.margin {
        buf[dim] = 1.0;
        buf[dim + 1] = pair.gain_delta as f64;
        buf[dim + 2..2 * dim + 2].iter_mut().zip(pair.better.iter()).for_each(|(b, &v)| *b = v as f64);
        buf[2 * dim + 2..].iter_mut().zip(pair.worse.iter()).for_each(|(b, &v)| *b = v as f64);
    }
    broadcast(&mut buf, pg)?;

    let narrow = |s: &[f64]| FeatureVector::from_vec(s.iter().map(|&v| v as f32).collect());
    signal.gradient = narrow(&buf[..dim]);
    signal.margin = if buf[dim] > 0.5 {
        Some(MarginPair {
            better: narrow(&buf[dim + 2..2 * dim + 2]),
            worse: narrow(&buf[2 * dim + 2..]),
            gain_delta: buf[dim + 1] as f32,
        })
    } else {
        None
    };
    Ok(())
}

/// Replace `weights` with the mean of every rank's weights.
pub fn average_weights(weights: &mut FeatureVector, pg: &dyn ProcessGroup) -> Result<(), TransportError> {
    let world = pg.world_size();
    if world == 1 {
        return Ok(());
    }
    let mut buf: Vec<f64> = weights.iter().map(|&w| w as f64).collect();
    pg.allreduce_sum(&mut buf)?;
    let ws = world as f64;
    for (w, s) in weights.as_mut_slice().iter_mut().zip(buf) {
        *w = (s / ws) as f32;
    }
    Ok(())
}
