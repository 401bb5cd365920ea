/// Per-rank training context: who this rank is, the model's component count,
/// and the process RNG. Built once at startup and passed by reference.

use log::info;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::TrainingConfig;

pub struct TrainingContext {
    pub rank: usize,
    pub world_size: usize,
    pub num_components: usize,
    /// Seeded `base_seed + rank` so ranks draw non-colliding, reproducible
    /// streams. Never reseeded mid-run.
    pub rng: ChaCha8Rng,
    seed: Option<u64>,
}

impl TrainingContext {
    pub fn new(config: &TrainingConfig, rank: usize, world_size: usize, num_components: usize) -> Self {
        assert!(rank < world_size, "rank {rank} out of range for world_size {world_size}");
        let seed = config.random_seed.map(|base| base.wrapping_add(rank as u64));
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        match seed {
            Some(s) => info!("Rank {rank}/{world_size}: seeded RNG with {s}"),
            None => info!("Rank {rank}/{world_size}: RNG seeded from entropy"),
        }
        TrainingContext { rank, world_size, num_components, rng, seed }
    }

    /// Effective seed of this rank, if one was configured.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn is_root(&self) -> bool {
        self.rank == crate::distributed::ROOT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_rank_offsets_seed() {
        let cfg = TrainingConfig { random_seed: Some(10), ..TrainingConfig::default() };
        let mut a = TrainingContext::new(&cfg, 0, 2, 3);
        let mut b = TrainingContext::new(&cfg, 1, 2, 3);
        assert_eq!(a.seed(), Some(10));
        assert_eq!(b.seed(), Some(11));
        let mut again = TrainingContext::new(&cfg, 1, 2, 3);
        let x: u64 = b.rng.gen();
        assert_eq!(x, again.rng.gen::<u64>());
        assert_ne!(a.rng.gen::<u64>(), x);
    }
}
