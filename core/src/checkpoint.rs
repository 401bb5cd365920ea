/// Weight files and resumable training state.
///
/// Weight dumps are plain text, one weight per line in component order.
/// A failed dump is logged and training carries on; only `load_*` errors
/// reach the caller.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::corpus::TrainerCursor;
use crate::features::FeatureVector;
use crate::learner::LearnerState;

// ── Sinks ─────────────────────────────────────────────────────────────

/// Serialization target for weight vectors.
pub trait CheckpointSink {
    fn write_weights(&self, weights: &FeatureVector, path: &Path) -> io::Result<()>;
}

/// One weight per line, shortest round-trip decimal form.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainTextSink;

impl CheckpointSink for PlainTextSink {
    fn write_weights(&self, weights: &FeatureVector, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(fs::File::create(path)?);
        for w in weights.iter() {
            writeln!(out, "{w}")?;
        }
        out.flush()
    }
}

/// Write through `sink`, logging instead of failing. Returns whether the
/// dump landed.
pub fn dump_weights(sink: &dyn CheckpointSink, weights: &FeatureVector, path: &Path) -> bool {
    match sink.write_weights(weights, path) {
        Ok(()) => {
            info!("Dumped weights to {}", path.display());
            true
        }
        Err(e) => {
            warn!("Failed to dump weights to {}: {e}", path.display());
            false
        }
    }
}

/// Read a plain-text weight file written by `PlainTextSink`.
pub fn read_weights(path: &Path) -> io::Result<FeatureVector> {
    let text = fs::read_to_string(path)?;
    let mut weights = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let w: f32 = line.parse().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("line {}: {e}", i + 1))
        })?;
        weights.push(w);
    }
    Ok(FeatureVector::from_vec(weights))
}

// ── Training state ────────────────────────────────────────────────────

/// Everything needed to resume a rank mid-run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub cursor: TrainerCursor,
    pub learner: LearnerState,
    #[serde(default)]
    pub rounds_completed: usize,
}

/// Save a rank's training state as JSON.
pub fn save_training_state(path: &Path, state: &TrainingState) -> io::Result<()> {
    let json = serde_json::to_string(state)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, json)
}

pub fn load_training_state(path: &Path) -> io::Result<TrainingState> {
    let json = fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
