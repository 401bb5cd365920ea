//! Training session: one rank's sample → learn → advance loop.
//!
//! Each round a rank works through its next batch. Per item the conductor is
//! reset, the external search produces a derivation distribution under the
//! current weights, and the collector resamples it. What happens next depends
//! on the update granularity:
//!
//! - Item: the learner updates from that item's particles right away; at the
//!   batch end ranks average their current weights.
//! - Batch: particles accumulate over the batch; at the batch end they are
//!   aggregated to the root, which derives one learning signal and
//!   broadcasts it so every rank applies the same update.
//!
//! Every rank hands out `epochs x corpus size` items from its shard and runs
//! the same number of rounds (the batch count of the rank needing the most),
//! so collective calls always line up. A rank whose
//! budget is spent joins the remaining rounds with an empty contribution.

use std::path::PathBuf;
use std::time::Instant;

use log::{debug, info};
use rand::Rng;

use crate::checkpoint::{dump_weights, CheckpointSink, TrainingState};
use crate::config::{TrainingConfig, UpdateGranularity};
use crate::context::TrainingContext;
use crate::corpus::{max_rounds, BatchConfig, BatchTrainer, BatchTransition, CorpusItem};
use crate::derivation::SearchProcess;
use crate::distributed::{aggregate_particles, average_weights, broadcast_signal, ProcessGroup};
use crate::error::{ConfigError, InputError, TrainError};
use crate::features::FeatureVector;
use crate::gain::{BleuGain, GainMetric};
use crate::gradient::{learning_signal, Regularizer};
use crate::learner::{build_learner, LearningSignal, OnlineLearner};
use crate::resample::ParticleCollector;
use crate::schedule::{Acceptor, Conductor};

// ── Reports ───────────────────────────────────────────────────────────

/// Outcome of one item.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemReport {
    pub line_number: usize,
    pub num_derivations: usize,
    /// Expected gain of the item's own particles; None in batch mode, where
    /// gains are only computed on the aggregated set.
    pub expected_gain: Option<f64>,
    pub item_time_ms: f32,
}

/// Outcome of one collective round.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundReport {
    pub round: usize,
    /// Items this rank processed in the round.
    pub local_items: usize,
    /// Items processed by all ranks in the round.
    pub global_items: usize,
    /// Batch mode, root only: expected gain of the aggregated particles.
    pub expected_gain: Option<f64>,
    pub transition: Option<BatchTransition>,
    pub allreduce_count: usize,
    /// This rank's items, in processing order.
    pub items: Vec<ItemReport>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainingReport {
    pub rounds: usize,
    pub items_processed: usize,
    pub epochs_started: usize,
    pub averaged_weights: FeatureVector,
    /// Root only.
    pub final_weights_path: Option<PathBuf>,
    pub checkpoints_written: usize,
    pub allreduce_count: usize,
    pub average_item_ms: f32,
}

// ── Session ───────────────────────────────────────────────────────────

pub struct TrainingSession<S: SearchProcess, M: GainMetric> {
    config: TrainingConfig,
    context: TrainingContext,
    trainer: BatchTrainer,
    conductor: Conductor,
    acceptor: Acceptor,
    collector: ParticleCollector,
    regularizer: Box<dyn Regularizer + Send>,
    gain: BleuGain,
    learner: Box<dyn OnlineLearner>,
    search: S,
    /// Gain metric per corpus line, indexed by global line number.
    metrics: Vec<M>,
    pg: Box<dyn ProcessGroup>,
    sink: Box<dyn CheckpointSink>,
    total_rounds: usize,
    rounds_completed: usize,
    checkpoints_written: usize,
    allreduce_count: usize,
    item_time_total_ms: f64,
    items_timed: usize,
}

impl<S: SearchProcess, M: GainMetric> TrainingSession<S, M> {
    /// Validate the config and inputs and set up every component. Fails
    /// before any item is processed.
    pub fn new(
        config: TrainingConfig,
        lines: Vec<String>,
        metrics: Vec<M>,
        initial_weights: FeatureVector,
        search: S,
        pg: Box<dyn ProcessGroup>,
        sink: Box<dyn CheckpointSink>,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        if lines.is_empty() {
            return Err(InputError::EmptyCorpus.into());
        }
        if metrics.len() < lines.len() {
            return Err(InputError::MissingReference { line: metrics.len(), available: metrics.len() }.into());
        }
        if let Some(m) = metrics.iter().find(|m| m.order() != config.bleu_order) {
            return Err(ConfigError::invalid(format!(
                "gain metric order {} != bleu_order {}",
                m.order(),
                config.bleu_order
            ))
            .into());
        }
        if initial_weights.is_empty() {
            return Err(ConfigError::MissingParameter("initial_weights").into());
        }

        let mut weights = initial_weights;
        weights *= config.scale_factor;

        let rank = pg.rank();
        let world_size = pg.world_size();
        let mut context = TrainingContext::new(&config, rank, world_size, weights.len());
        // First draw of the process stream; the shuffle RNG must not share
        // the resampling stream.
        let shuffle_seed: u64 = context.rng.gen();
        let corpus_len = lines.len();
        let trainer = BatchTrainer::new(
            lines,
            BatchConfig {
                rank,
                world_size,
                batch_size: config.training_batch_size,
                epochs: config.epochs,
                randomize: config.randomize_batches,
                seed: shuffle_seed,
                weight_dump_freq: config.weight_dump_freq,
                weight_dump_stem: config.weight_dump_stem.clone(),
            },
        )?;
        let total_rounds = max_rounds(corpus_len, world_size, config.training_batch_size, config.epochs);

        let conductor = Conductor::new(config.sweep_schedule()?);
        let acceptor = config.acceptor();
        info!("Using acceptor {}", acceptor.name());
        let collector = ParticleCollector::new(config.samples, weights.len(), config.bleu_order);
        let learner = build_learner(config.learner_kind()?, weights);
        info!(
            "Rank {rank}/{world_size}: {} samples per item, {total_rounds} rounds, {:?} updates",
            config.samples, config.update_granularity
        );

        Ok(TrainingSession {
            regularizer: config.regularizer(),
            gain: config.gain(),
            config,
            context,
            trainer,
            conductor,
            acceptor,
            collector,
            learner,
            search,
            metrics,
            pg,
            sink,
            total_rounds,
            rounds_completed: 0,
            checkpoints_written: 0,
            allreduce_count: 0,
            item_time_total_ms: 0.0,
            items_timed: 0,
        })
    }

    pub fn learner(&self) -> &dyn OnlineLearner {
        self.learner.as_ref()
    }

    pub fn trainer(&self) -> &BatchTrainer {
        &self.trainer
    }

    pub fn collector(&self) -> &ParticleCollector {
        &self.collector
    }

    pub fn search(&self) -> &S {
        &self.search
    }

    pub fn context(&self) -> &TrainingContext {
        &self.context
    }

    pub fn total_rounds(&self) -> usize {
        self.total_rounds
    }

    pub fn rounds_completed(&self) -> usize {
        self.rounds_completed
    }

    pub fn is_done(&self) -> bool {
        self.rounds_completed >= self.total_rounds
    }

    // ── Items ────────────────────────────────────────────────────────

    fn process_item(&mut self, item: &CorpusItem) -> Result<ItemReport, TrainError> {
        let start = Instant::now();
        let metric = self
            .metrics
            .get(item.line_number)
            .ok_or(InputError::MissingReference { line: item.line_number, available: self.metrics.len() })?;

        let granularity = self.config.update_granularity;
        if granularity == UpdateGranularity::Item {
            self.collector.reset();
        }

        self.conductor.reset();
        let distribution = self
            .search
            .sample(item, self.learner.weights(), &mut self.conductor, &self.acceptor, &mut self.context.rng)
            .map_err(|message| TrainError::Search { line: item.line_number, message })?;
        let num_derivations = distribution.len();
        debug!("Line {}: {num_derivations} derivations", item.line_number);

        self.collector
            .resample(&distribution, metric, self.regularizer.as_ref(), &mut self.context.rng)?;

        let expected_gain = match granularity {
            UpdateGranularity::Item => {
                let (signal, estimate) = learning_signal(&self.collector, &self.gain);
                self.learner.update(&signal);
                info!(
                    "Line {}: expected gain {:.6} (unregularized {:.6}), expected length {}",
                    item.line_number, estimate.expected_gain, estimate.unregularized_gain, estimate.expected_length
                );
                Some(estimate.expected_gain)
            }
            UpdateGranularity::Batch => None,
        };

        if self.context.is_root() {
            if let Some(path) = self.trainer.checkpoint_due() {
                if dump_weights(self.sink.as_ref(), &self.learner.averaged_weights(), &path) {
                    self.checkpoints_written += 1;
                }
            }
        }

        let item_time_ms = start.elapsed().as_secs_f32() * 1000.0;
        self.item_time_total_ms += item_time_ms as f64;
        self.items_timed += 1;
        Ok(ItemReport { line_number: item.line_number, num_derivations, expected_gain, item_time_ms })
    }

    // ── Rounds ───────────────────────────────────────────────────────

    /// Run one collective round. Every rank must call this the same number
    /// of times; `run` takes care of that.
    pub fn run_round(&mut self) -> Result<RoundReport, TrainError> {
        let round = self.rounds_completed;
        let mut items = Vec::new();
        if self.trainer.has_more() {
            while let Some(item) = self.trainer.get_sentence() {
                items.push(self.process_item(&item)?);
            }
        }
        let local_items = items.len();

        let mut allreduce_count = 0usize;
        let mut expected_gain = None;
        let global_items = match self.config.update_granularity {
            UpdateGranularity::Item => {
                let mut weights = self.learner.weights().clone();
                let mut items = [local_items as f64];
                if self.pg.world_size() > 1 {
                    average_weights(&mut weights, self.pg.as_ref())?;
                    self.pg.allreduce_sum(&mut items)?;
                    allreduce_count += 2;
                    self.learner.set_weights(weights);
                }
                items[0].round() as usize
            }
            UpdateGranularity::Batch => {
                let report = aggregate_particles(&mut self.collector, self.pg.as_ref(), self.config.aggregate_layout)?;
                allreduce_count += report.allreduce_count;
                if report.num_items > 0 {
                    let mut signal = if self.context.is_root() {
                        let (signal, estimate) = learning_signal(&self.collector, &self.gain);
                        info!(
                            "Round {round}: {} particles over {} items, expected gain {:.6} (unregularized {:.6})",
                            report.total_particles, report.num_items, estimate.expected_gain, estimate.unregularized_gain
                        );
                        expected_gain = Some(estimate.expected_gain);
                        signal
                    } else {
                        LearningSignal { gradient: FeatureVector::zeros(self.context.num_components), margin: None }
                    };
                    broadcast_signal(&mut signal, self.pg.as_ref())?;
                    allreduce_count += 1;
                    self.learner.update(&signal);
                }
                self.collector.reset();
                report.num_items
            }
        };
        self.allreduce_count += allreduce_count;

        let transition = if self.trainer.has_more() { Some(self.trainer.reserve_next_batch()) } else { None };
        self.rounds_completed += 1;
        Ok(RoundReport { round, local_items, global_items, expected_gain, transition, allreduce_count, items })
    }

    /// Run every remaining round, then write the final averaged weights
    /// (root only).
    pub fn run(&mut self) -> Result<TrainingReport, TrainError> {
        while !self.is_done() {
            self.run_round()?;
        }

        let averaged_weights = self.learner.averaged_weights();
        let final_weights_path = if self.context.is_root() {
            let path = self.trainer.final_weights_path();
            if dump_weights(self.sink.as_ref(), &averaged_weights, &path) {
                self.checkpoints_written += 1;
            }
            Some(path)
        } else {
            None
        };

        let average_item_ms = if self.items_timed == 0 {
            0.0
        } else {
            (self.item_time_total_ms / self.items_timed as f64) as f32
        };
        info!(
            "Rank {}: training done after {} items in {} rounds ({average_item_ms:.2} ms/item)",
            self.context.rank,
            self.trainer.processed(),
            self.rounds_completed
        );

        Ok(TrainingReport {
            rounds: self.rounds_completed,
            items_processed: self.trainer.processed(),
            epochs_started: self.trainer.epoch() + 1,
            averaged_weights,
            final_weights_path,
            checkpoints_written: self.checkpoints_written,
            allreduce_count: self.allreduce_count,
            average_item_ms,
        })
    }

    // ── Resume ───────────────────────────────────────────────────────

    /// Snapshot for resuming. Take it between rounds.
    pub fn training_state(&self) -> TrainingState {
        TrainingState {
            cursor: self.trainer.cursor(),
            learner: self.learner.state().clone(),
            rounds_completed: self.rounds_completed,
        }
    }

    /// Resume from a snapshot taken by `training_state` on a session built
    /// with the same corpus and config.
    pub fn restore(&mut self, state: TrainingState) -> Result<(), TrainError> {
        if state.learner.weights.len() != self.context.num_components {
            return Err(ConfigError::invalid(format!(
                "checkpoint has {} weights, model has {}",
                state.learner.weights.len(),
                self.context.num_components
            ))
            .into());
        }
        self.trainer.restore(&state.cursor)?;
        self.learner.restore_state(state.learner);
        self.rounds_completed = state.rounds_completed;
        self.collector.reset();
        info!(
            "Rank {}: resumed at round {} ({} items processed)",
            self.context.rank,
            self.rounds_completed,
            self.trainer.processed()
        );
        Ok(())
    }
}
