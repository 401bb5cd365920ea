//! Error taxonomy for the training core.
//!
//! Configuration, input, sampling and transport errors are fatal: they
//! propagate out of the session loop. Checkpoint I/O is the only recoverable
//! class and never reaches these types (it is logged at the sink).

use std::path::PathBuf;

use thiserror::Error;

/// Invalid or inconsistent training configuration. Detected before any item
/// is processed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("unable to parse stopper config string '{0}'")]
    UnparseableStopper(String),

    #[error("no learning algorithm chosen (set exactly one of perceptron, mira)")]
    NoLearner,

    #[error("choose just one learning algorithm (perceptron and mira are both set)")]
    ConflictingLearners,

    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::InvalidParameter { message: message.into() }
    }
}

/// Corpus or reference problems. Never skipped: a bad line would bias the
/// gradient estimate.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("corpus is empty")]
    EmptyCorpus,

    #[error("malformed corpus line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },

    #[error("corpus of {lines} lines cannot be sharded across {world_size} ranks")]
    ShardTooSmall { lines: usize, world_size: usize },

    #[error("no gain metric for line {line} ({available} loaded)")]
    MissingReference { line: usize, available: usize },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while resampling one item's derivation distribution.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SampleError {
    #[error("derivation distribution has no entries")]
    EmptyDistribution,

    #[error("derivation {index} has a NaN score")]
    InvalidScore { index: usize },

    #[error("feature vector length mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Collective reduction failures. All-or-nothing: the whole group aborts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("rank {rank} reduced a buffer of {found} elements, group expected {expected}")]
    BufferMismatch { rank: usize, expected: usize, found: usize },

    #[error("elementwise aggregation needs equal particle counts, ranks hold {counts:?}")]
    ParticleCountMismatch { counts: Vec<usize> },

    #[error("process group is poisoned: {0}")]
    Poisoned(String),
}

/// Errors from restoring a batch trainer cursor.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RestoreError {
    #[error("cursor belongs to rank {found_rank}/{found_world}, trainer is rank {expected_rank}/{expected_world}")]
    RankMismatch {
        expected_rank: usize,
        expected_world: usize,
        found_rank: usize,
        found_world: usize,
    },

    #[error("position {position} out of bounds (shard_len={shard_len})")]
    PositionOutOfBounds { position: usize, shard_len: usize },
}

/// Anything that stops a training session.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Sample(#[from] SampleError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error("search failed on line {line}: {message}")]
    Search { line: usize, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_problem() {
        assert_eq!(
            ConfigError::UnparseableStopper("forever".into()).to_string(),
            "unable to parse stopper config string 'forever'"
        );
        assert_eq!(
            SampleError::InvalidScore { index: 3 }.to_string(),
            "derivation 3 has a NaN score"
        );
        let e: TrainError = SampleError::EmptyDistribution.into();
        assert_eq!(e.to_string(), "derivation distribution has no entries");
    }
}
