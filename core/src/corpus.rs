//! Batch trainer: a rank's view of the training corpus.
//!
//! The corpus is split into one contiguous shard per rank, the shard into
//! batches of `batch_size` positions. Items are handed out one at a time; at
//! the end of a batch the caller reserves the next one, which at the shard
//! boundary starts a new pass (reshuffled if configured) from batch 0. Every
//! rank hands out `epochs x corpus size` items, so with several ranks a pass
//! over the shard is shorter than an epoch and the shard is revisited. The
//! cursor is serializable so training can resume at the exact position.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::info;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{InputError, RestoreError};

// ── Types ──────────────────────────────────────────────────────────────

/// One corpus line and its global (0-based) line number.
#[derive(Clone, Debug, PartialEq)]
pub struct CorpusItem {
    pub text: String,
    pub line_number: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchState {
    /// Nothing handed out yet.
    Idle,
    BatchActive,
    /// Cursor reached the end of the batch; call `reserve_next_batch`.
    BatchExhausted,
    /// Iteration budget spent.
    Done,
}

/// What `reserve_next_batch` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchTransition {
    /// Moved to the next contiguous batch of the shard.
    Advanced,
    /// Shard boundary: new pass, order reshuffled, back to batch 0.
    Reshuffled,
    /// Shard boundary: new pass, same order, back to batch 0.
    Wrapped,
}

/// Serializable position inside the rank's shard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainerCursor {
    pub rank: usize,
    pub world_size: usize,
    /// Start of the current batch, as a position in the shard order.
    pub batch_start: usize,
    /// Next position to hand out.
    pub position: usize,
    pub processed: usize,
    pub epoch: usize,
    /// Number of shuffles applied so far; replayed on restore.
    pub shuffles: u64,
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub rank: usize,
    pub world_size: usize,
    /// 0 = one batch spans the whole shard.
    pub batch_size: usize,
    pub epochs: usize,
    pub randomize: bool,
    pub seed: u64,
    /// Dump weights every this many processed items; 0 = never.
    pub weight_dump_freq: usize,
    pub weight_dump_stem: String,
}

impl BatchConfig {
    pub fn single_rank(batch_size: usize) -> Self {
        BatchConfig {
            rank: 0,
            world_size: 1,
            batch_size,
            epochs: 1,
            randomize: false,
            seed: 0,
            weight_dump_freq: 0,
            weight_dump_stem: "weights".into(),
        }
    }
}

/// Balanced contiguous shard `[r*N/R, (r+1)*N/R)`.
pub fn shard_range(lines: usize, rank: usize, world_size: usize) -> Range<usize> {
    (rank * lines / world_size)..((rank + 1) * lines / world_size)
}

/// Items each rank processes: `epochs` passes over the whole corpus, drawn
/// from its own shard. A rank whose shard is shorter than the corpus wraps
/// around its shard more than once.
pub fn item_budget(lines: usize, epochs: usize) -> usize {
    epochs * lines
}

/// Batches a rank needs to spend `budget` items of a `shard_len` shard, the
/// last batch of each pass being short.
fn rounds_for_shard(shard_len: usize, batch_size: usize, budget: usize) -> usize {
    if shard_len == 0 {
        return 0;
    }
    let bs = if batch_size == 0 || batch_size > shard_len { shard_len } else { batch_size };
    let passes = budget / shard_len;
    let rest = budget % shard_len;
    passes * shard_len.div_ceil(bs) + rest.div_ceil(bs)
}

/// Collective rounds of a whole run: the batch count of the rank that needs
/// the most of them. Every rank runs this many rounds, ranks whose budget is
/// spent contributing nothing.
pub fn max_rounds(lines: usize, world_size: usize, batch_size: usize, epochs: usize) -> usize {
    let budget = item_budget(lines, epochs);
    (0..world_size)
        .map(|r| rounds_for_shard(shard_range(lines, r, world_size).len(), batch_size, budget))
        .max()
        .unwrap_or(0)
}

// ── Trainer ─────────────────────────────────────────────────────────────

pub struct BatchTrainer {
    lines: Vec<String>,
    config: BatchConfig,
    shard: Range<usize>,
    /// Global line numbers of the shard, in visiting order.
    order: Vec<usize>,
    batch_size: usize,
    batch_start: usize,
    position: usize,
    processed: usize,
    max_items: usize,
    epoch: usize,
    shuffles: u64,
    rng: ChaCha8Rng,
}

impl BatchTrainer {
    pub fn new(lines: Vec<String>, config: BatchConfig) -> Result<Self, InputError> {
        if lines.is_empty() {
            return Err(InputError::EmptyCorpus);
        }
        assert!(config.world_size >= 1, "world_size must be >= 1");
        assert!(config.rank < config.world_size, "rank must be < world_size");
        let shard = shard_range(lines.len(), config.rank, config.world_size);
        if shard.is_empty() {
            return Err(InputError::ShardTooSmall { lines: lines.len(), world_size: config.world_size });
        }
        let shard_len = shard.len();
        let batch_size = if config.batch_size == 0 || config.batch_size > shard_len {
            shard_len
        } else {
            config.batch_size
        };
        let rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(config.rank as u64));
        let mut trainer = BatchTrainer {
            order: shard.clone().collect(),
            shard,
            batch_size,
            batch_start: 0,
            position: 0,
            processed: 0,
            max_items: item_budget(lines.len(), config.epochs),
            epoch: 0,
            shuffles: 0,
            rng,
            lines,
            config,
        };
        if trainer.config.randomize {
            trainer.shuffle();
        }
        info!(
            "Rank {}/{}: lines {:?}, batch size {}, {} items budgeted",
            trainer.config.rank, trainer.config.world_size, trainer.shard, batch_size, trainer.max_items
        );
        Ok(trainer)
    }

    fn shuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.shuffles += 1;
    }

    fn batch_end(&self) -> usize {
        (self.batch_start + self.batch_size).min(self.order.len())
    }

    /// Whether the iteration budget (epochs x corpus size) has room left.
    pub fn has_more(&self) -> bool {
        self.processed < self.max_items
    }

    pub fn state(&self) -> BatchState {
        if !self.has_more() {
            BatchState::Done
        } else if self.position == self.batch_end() {
            BatchState::BatchExhausted
        } else if self.processed == 0 {
            BatchState::Idle
        } else {
            BatchState::BatchActive
        }
    }

    /// Next line of the current batch, advancing the cursor. None once the
    /// batch is exhausted or the budget is spent.
    pub fn get_sentence(&mut self) -> Option<CorpusItem> {
        if !self.has_more() || self.position >= self.batch_end() {
            return None;
        }
        let line_number = self.order[self.position];
        self.position += 1;
        self.processed += 1;
        Some(CorpusItem { text: self.lines[line_number].clone(), line_number })
    }

    /// Move to the next batch. At the shard boundary this starts a new pass.
    pub fn reserve_next_batch(&mut self) -> BatchTransition {
        let next = self.batch_end();
        if next < self.order.len() {
            self.batch_start = next;
            self.position = next;
            return BatchTransition::Advanced;
        }
        self.epoch += 1;
        self.batch_start = 0;
        self.position = 0;
        if self.config.randomize {
            self.shuffle();
            info!("Epoch {}: reshuffled {} lines", self.epoch, self.order.len());
            BatchTransition::Reshuffled
        } else {
            BatchTransition::Wrapped
        }
    }

    /// Current cursor position within the shard order.
    pub fn curr(&self) -> usize {
        self.position
    }

    /// One past the last position of the current batch.
    pub fn curr_end(&self) -> usize {
        self.batch_end()
    }

    pub fn batch_start(&self) -> usize {
        self.batch_start
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Total items this rank will hand out.
    pub fn budget(&self) -> usize {
        self.max_items
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn shard(&self) -> Range<usize> {
        self.shard.clone()
    }

    pub fn corpus_len(&self) -> usize {
        self.lines.len()
    }

    /// Global line numbers of the current batch.
    pub fn current_batch(&self) -> &[usize] {
        &self.order[self.batch_start..self.batch_end()]
    }

    /// Path for a periodic weight dump if one is due after the item just
    /// handed out.
    pub fn checkpoint_due(&self) -> Option<PathBuf> {
        let freq = self.config.weight_dump_freq;
        if freq == 0 || self.processed == 0 || self.processed % freq != 0 {
            return None;
        }
        Some(PathBuf::from(format!("{}_{}", self.config.weight_dump_stem, self.processed)))
    }

    pub fn final_weights_path(&self) -> PathBuf {
        PathBuf::from(format!("{}_final", self.config.weight_dump_stem))
    }

    pub fn cursor(&self) -> TrainerCursor {
        TrainerCursor {
            rank: self.config.rank,
            world_size: self.config.world_size,
            batch_start: self.batch_start,
            position: self.position,
            processed: self.processed,
            epoch: self.epoch,
            shuffles: self.shuffles,
        }
    }

    /// Restore a cursor captured by `cursor()` on a trainer built with the
    /// same corpus and config. Shuffles are replayed from the seed.
    pub fn restore(&mut self, cursor: &TrainerCursor) -> Result<(), RestoreError> {
        if cursor.rank != self.config.rank || cursor.world_size != self.config.world_size {
            return Err(RestoreError::RankMismatch {
                expected_rank: self.config.rank,
                expected_world: self.config.world_size,
                found_rank: cursor.rank,
                found_world: cursor.world_size,
            });
        }
        let shard_len = self.order.len();
        if cursor.batch_start >= shard_len || cursor.position > shard_len || cursor.position < cursor.batch_start {
            return Err(RestoreError::PositionOutOfBounds { position: cursor.position, shard_len });
        }
        self.order = self.shard.clone().collect();
        self.rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(self.config.rank as u64));
        self.shuffles = 0;
        for _ in 0..cursor.shuffles {
            self.shuffle();
        }
        self.batch_start = cursor.batch_start;
        self.position = cursor.position;
        self.processed = cursor.processed;
        self.epoch = cursor.epoch;
        Ok(())
    }
}

// ── Loading ─────────────────────────────────────────────────────────────

/// Read a corpus file, one item per line. Blank lines are rejected, not
/// skipped.
pub fn load_corpus(path: &Path) -> Result<Vec<String>, InputError> {
    let text = fs::read_to_string(path).map_err(|source| InputError::Io { path: path.to_path_buf(), source })?;
    let mut lines = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            return Err(InputError::MalformedLine { line: i, reason: "empty line".into() });
        }
        lines.push(line.to_owned());
    }
    if lines.is_empty() {
        return Err(InputError::EmptyCorpus);
    }
    info!("Loaded {} lines in training mode", lines.len());
    Ok(lines)
}

// ── Unit tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("line {i}")).collect()
    }

    #[test]
    fn test_shard_ranges_cover_without_overlap() {
        let ranges: Vec<_> = (0..3).map(|r| shard_range(10, r, 3)).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..10]);
    }

    #[test]
    fn test_rounds_for_shard_counts_short_batches() {
        // 7 items from a shard of 3 in batches of 2: [2, 1], [2, 1], [1]
        assert_eq!(rounds_for_shard(3, 2, 7), 5);
        assert_eq!(rounds_for_shard(3, 0, 6), 2);
        assert_eq!(rounds_for_shard(0, 2, 6), 0);
    }

    #[test]
    fn test_empty_corpus_rejected() {
        assert!(matches!(
            BatchTrainer::new(Vec::new(), BatchConfig::single_rank(0)),
            Err(InputError::EmptyCorpus)
        ));
    }

    #[test]
    fn test_too_many_ranks_rejected() {
        let cfg = BatchConfig { world_size: 4, rank: 0, ..BatchConfig::single_rank(0) };
        assert!(matches!(
            BatchTrainer::new(corpus(2), cfg),
            Err(InputError::ShardTooSmall { lines: 2, world_size: 4 })
        ));
    }

    #[test]
    fn test_zero_batch_size_means_whole_shard() {
        let t = BatchTrainer::new(corpus(7), BatchConfig::single_rank(0)).unwrap();
        assert_eq!(t.batch_size(), 7);
        assert_eq!(t.state(), BatchState::Idle);
    }

    #[test]
    fn test_checkpoint_paths() {
        let cfg = BatchConfig {
            weight_dump_freq: 2,
            weight_dump_stem: "out/w".into(),
            ..BatchConfig::single_rank(0)
        };
        let mut t = BatchTrainer::new(corpus(4), cfg).unwrap();
        t.get_sentence();
        assert_eq!(t.checkpoint_due(), None);
        t.get_sentence();
        assert_eq!(t.checkpoint_due(), Some(PathBuf::from("out/w_2")));
        assert_eq!(t.final_weights_path(), PathBuf::from("out/w_final"));
    }
}
