/// Training configuration.
///
/// Loaded once at startup from JSON; every field has a default so a config
/// file only names what it changes. `validate` runs before any item is
/// processed and every failure is fatal.

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::distributed::AggregateLayout;
use crate::error::ConfigError;
use crate::gain::BleuGain;
use crate::gradient::{EntropyRegularizer, NoRegularizer, Regularizer};
use crate::learner::LearnerKind;
use crate::schedule::{Acceptor, LinearAnnealing, SweepSchedule};

/// When the learner sees a signal and how ranks stay in sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateGranularity {
    /// Update after every item on the local particles; ranks average their
    /// weights at each batch end.
    #[default]
    Item,
    /// Aggregate the batch to the root, update once, broadcast the signal.
    Batch,
}

/// How many collection sweeps to run per item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopStrategy {
    Count(usize),
}

impl StopStrategy {
    /// Integer strings are a sweep count. Anything else goes to the named
    /// strategies, of which none are registered.
    pub fn parse(config: &str) -> Result<Self, ConfigError> {
        let trimmed = config.trim();
        match trimmed.parse::<usize>() {
            Ok(n) => Ok(StopStrategy::Count(n)),
            Err(_) => Self::named(trimmed).ok_or_else(|| ConfigError::UnparseableStopper(config.to_owned())),
        }
    }

    fn named(_name: &str) -> Option<Self> {
        None
    }

    pub fn iterations(&self) -> usize {
        match *self {
            StopStrategy::Count(n) => n,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Particles drawn per item (K).
    pub samples: usize,
    /// Stopping criterion for the collection sweeps.
    pub iterations: String,
    pub burn_in: usize,
    pub reheatings: usize,
    pub anneal: bool,
    pub max_temp: f64,
    pub greedy: bool,
    pub fixed_temp_accept: bool,
    pub fixed_temperature: f64,
    pub perceptron: bool,
    pub mira: bool,
    pub perceptron_lr: f32,
    /// Upper bound on the MIRA step size.
    pub mira_c: f32,
    pub epochs: usize,
    /// 0 = one batch spans the whole shard.
    pub training_batch_size: usize,
    pub randomize_batches: bool,
    /// Dump weights every this many items; 0 = never.
    pub weight_dump_freq: usize,
    pub weight_dump_stem: String,
    /// Base seed; each rank uses `random_seed + rank`. None = from entropy.
    pub random_seed: Option<u64>,
    /// Multiplies the initial weights.
    pub scale_factor: f32,
    pub bleu_order: usize,
    pub bp_scale: f32,
    pub bleu_smoothing: bool,
    /// 0 disables the entropy regularizer.
    pub entropy_weight: f64,
    pub update_granularity: UpdateGranularity,
    pub aggregate_layout: AggregateLayout,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            samples: 1,
            iterations: "5".into(),
            burn_in: 1,
            reheatings: 1,
            anneal: false,
            max_temp: 4.0,
            greedy: false,
            fixed_temp_accept: false,
            fixed_temperature: 1.0,
            perceptron: false,
            mira: false,
            perceptron_lr: 1.0,
            mira_c: 0.01,
            epochs: 1,
            training_batch_size: 0,
            randomize_batches: false,
            weight_dump_freq: 0,
            weight_dump_stem: "weights".into(),
            random_seed: None,
            scale_factor: 1.0,
            bleu_order: 4,
            bp_scale: 1.0,
            bleu_smoothing: false,
            entropy_weight: 0.0,
            update_granularity: UpdateGranularity::Item,
            aggregate_layout: AggregateLayout::Concatenate,
        }
    }
}

impl TrainingConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let config: TrainingConfig =
            serde_json::from_str(&json).map_err(|source| ConfigError::Json { path: path.to_path_buf(), source })?;
        config.validate()?;
        info!("Loaded training config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.samples == 0 {
            return Err(ConfigError::invalid("samples must be >= 1"));
        }
        self.stop_strategy()?;
        self.learner_kind()?;
        if self.epochs == 0 {
            return Err(ConfigError::invalid("epochs must be >= 1"));
        }
        if self.bleu_order == 0 {
            return Err(ConfigError::invalid("bleu_order must be >= 1"));
        }
        if self.anneal && self.max_temp <= 0.0 {
            return Err(ConfigError::invalid(format!("max_temp must be > 0 when annealing, got {}", self.max_temp)));
        }
        if self.mira && self.mira_c < 0.0 {
            return Err(ConfigError::invalid(format!("mira_c must be >= 0, got {}", self.mira_c)));
        }
        if self.entropy_weight.is_nan() {
            return Err(ConfigError::invalid("entropy_weight is NaN"));
        }
        if self.weight_dump_stem.is_empty() {
            return Err(ConfigError::MissingParameter("weight_dump_stem"));
        }
        Ok(())
    }

    pub fn stop_strategy(&self) -> Result<StopStrategy, ConfigError> {
        StopStrategy::parse(&self.iterations)
    }

    /// Exactly one of perceptron / mira must be set.
    pub fn learner_kind(&self) -> Result<LearnerKind, ConfigError> {
        match (self.perceptron, self.mira) {
            (true, true) => Err(ConfigError::ConflictingLearners),
            (false, false) => Err(ConfigError::NoLearner),
            (true, false) => Ok(LearnerKind::Perceptron { learning_rate: self.perceptron_lr }),
            (false, true) => Ok(LearnerKind::Mira { slack: self.mira_c }),
        }
    }

    pub fn acceptor(&self) -> Acceptor {
        if self.greedy || self.fixed_temperature == 0.0 {
            Acceptor::Greedy
        } else if self.fixed_temp_accept {
            Acceptor::FixedTemperature(self.fixed_temperature)
        } else {
            Acceptor::Regular
        }
    }

    pub fn sweep_schedule(&self) -> Result<SweepSchedule, ConfigError> {
        let annealing = self.anneal.then_some(LinearAnnealing { burn_in: self.burn_in, max_temp: self.max_temp });
        Ok(SweepSchedule {
            burn_in: self.burn_in,
            iterations: self.stop_strategy()?.iterations(),
            reheatings: self.reheatings,
            annealing,
        })
    }

    pub fn gain(&self) -> BleuGain {
        BleuGain { bp_scale: self.bp_scale, smoothing: self.bleu_smoothing }
    }

    pub fn regularizer(&self) -> Box<dyn Regularizer + Send> {
        if self.entropy_weight != 0.0 {
            info!("Using entropy regularizer with weight {}", self.entropy_weight);
            Box::new(EntropyRegularizer { weight: self.entropy_weight })
        } else {
            Box::new(NoRegularizer)
        }
    }
}
