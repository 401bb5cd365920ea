//! End-to-end training sessions over a toy search process.
//!
//! The toy search enumerates a three-candidate space per line: the line
//! itself, a truncated copy, and unrelated output. Features are chosen so the
//! first component tracks gain and the second tracks its absence.

use std::path::Path;
use std::thread;

use expgain_core::checkpoint::{read_weights, PlainTextSink};
use expgain_core::config::{TrainingConfig, UpdateGranularity};
use expgain_core::corpus::CorpusItem;
use expgain_core::derivation::{DerivationDistribution, ScoredDerivation, SearchProcess};
use expgain_core::distributed::{AggregateLayout, LocalProcessGroup, ProcessGroup, SharedMemoryGroup};
use expgain_core::error::{InputError, TrainError};
use expgain_core::features::FeatureVector;
use expgain_core::gain::SentenceBleu;
use expgain_core::schedule::{Acceptor, Conductor};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

// ── Toy search ──────────────────────────────────────────────────────

#[derive(Default)]
struct ExhaustiveSearch {
    sweeps: usize,
    fail_on_line: Option<usize>,
}

impl ExhaustiveSearch {
    fn candidates(item: &CorpusItem) -> Vec<ScoredDerivation> {
        let truncated: Vec<&str> = item.text.split_whitespace().take(2).collect();
        vec![
            ScoredDerivation::new(FeatureVector::from_vec(vec![1.0, 0.0]), &item.text),
            ScoredDerivation::new(FeatureVector::from_vec(vec![0.5, 0.5]), &truncated.join(" ")),
            ScoredDerivation::new(FeatureVector::from_vec(vec![0.0, 1.0]), "zz qq"),
        ]
    }
}

impl SearchProcess for ExhaustiveSearch {
    type Derivation = ScoredDerivation;

    fn sample(
        &mut self,
        item: &CorpusItem,
        weights: &FeatureVector,
        conductor: &mut Conductor,
        acceptor: &Acceptor,
        rng: &mut dyn RngCore,
    ) -> Result<DerivationDistribution<ScoredDerivation>, String> {
        if self.fail_on_line == Some(item.line_number) {
            return Err("lattice exhausted".into());
        }
        let candidates = Self::candidates(item);
        let scores: Vec<f64> = candidates.iter().map(|d| weights.dot(&d.features)).collect();
        let mut current = 0;
        while !conductor.is_done() {
            let pulse = conductor.pulse();
            let proposed = (current + 1) % candidates.len();
            if acceptor.accept(scores[current], scores[proposed], &pulse, rng) {
                current = proposed;
            }
            conductor.advance();
            self.sweeps += 1;
        }
        Ok(candidates.into_iter().zip(scores).collect())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn corpus(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("w{i} x{i} y{i} z{i}")).collect()
}

fn metrics(lines: &[String]) -> Vec<SentenceBleu> {
    lines.iter().map(|l| SentenceBleu::from_lines(2, &[l.as_str()])).collect()
}

fn config(stem: &Path) -> TrainingConfig {
    TrainingConfig {
        samples: 20,
        iterations: "2".into(),
        perceptron: true,
        perceptron_lr: 0.1,
        epochs: 2,
        bleu_order: 2,
        random_seed: Some(7),
        weight_dump_stem: stem.to_string_lossy().into_owned(),
        ..TrainingConfig::default()
    }
}

type Session = expgain_core::session::TrainingSession<ExhaustiveSearch, SentenceBleu>;

fn session(cfg: TrainingConfig, n: usize, pg: Box<dyn ProcessGroup>) -> Result<Session, TrainError> {
    let lines = corpus(n);
    let m = metrics(&lines);
    Session::new(cfg, lines, m, FeatureVector::zeros(2), ExhaustiveSearch::default(), pg, Box::new(PlainTextSink))
}

// ── Group 1: single rank ────────────────────────────────────────────

#[test_log::test]
fn test_item_updates_favour_gain_feature() {
    let dir = tempfile::tempdir().unwrap();
    let stem = dir.path().join("w");
    let mut s = session(config(&stem), 6, Box::new(LocalProcessGroup)).unwrap();
    let report = s.run().unwrap();

    assert_eq!(report.items_processed, 12);
    assert_eq!(report.rounds, 2);
    let w = &report.averaged_weights;
    assert!(w[0] > w[1], "weights {:?}", w.as_slice());

    let path = report.final_weights_path.unwrap();
    assert_eq!(path, dir.path().join("w_final"));
    assert_eq!(read_weights(&path).unwrap(), report.averaged_weights);
}

#[test_log::test]
fn test_batch_updates_with_mira() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainingConfig {
        perceptron: false,
        mira: true,
        mira_c: 1.0,
        training_batch_size: 2,
        update_granularity: UpdateGranularity::Batch,
        ..config(&dir.path().join("w"))
    };
    let mut s = session(cfg, 6, Box::new(LocalProcessGroup)).unwrap();
    let first = s.run_round().unwrap();
    assert_eq!(first.local_items, 2);
    assert_eq!(first.global_items, 2);
    assert!(first.expected_gain.is_some());
    let lines: Vec<usize> = first.items.iter().map(|i| i.line_number).collect();
    assert_eq!(lines, vec![0, 1]);
    assert!(first.items.iter().all(|i| i.expected_gain.is_none() && i.num_derivations == 3));
    // the collector is cleared once the batch has been learned from
    assert_eq!(s.collector().num_items(), 0);

    let report = s.run().unwrap();
    assert_eq!(report.rounds, 6);
    assert_eq!(report.items_processed, 12);
    assert!(report.averaged_weights[0] > report.averaged_weights[1]);
}

#[test]
fn test_round_reports_each_item() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainingConfig { training_batch_size: 3, ..config(&dir.path().join("w")) };
    let mut s = session(cfg, 6, Box::new(LocalProcessGroup)).unwrap();
    let round = s.run_round().unwrap();
    assert_eq!(round.local_items, 3);
    let lines: Vec<usize> = round.items.iter().map(|i| i.line_number).collect();
    assert_eq!(lines, vec![0, 1, 2]);
    for item in &round.items {
        assert_eq!(item.num_derivations, 3);
        assert!(item.expected_gain.is_some_and(|g| (0.0..=1.0 + 1e-6).contains(&g)));
    }
    let report = s.run().unwrap();
    assert_eq!(report.items_processed, 12);
    assert!(report.average_item_ms >= 0.0);
}

#[test]
fn test_shuffle_does_not_share_the_resampling_stream() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainingConfig { randomize_batches: true, epochs: 1, ..config(&dir.path().join("w")) };
    let s = session(cfg, 30, Box::new(LocalProcessGroup)).unwrap();
    let order = s.trainer().current_batch().to_vec();

    // the resampling stream is seeded random_seed + rank
    let mut same_stream: Vec<usize> = (0..30).collect();
    same_stream.shuffle(&mut ChaCha8Rng::seed_from_u64(7));
    assert_ne!(order, same_stream);

    let shuffle_seed: u64 = ChaCha8Rng::seed_from_u64(7).gen();
    let mut expected: Vec<usize> = (0..30).collect();
    expected.shuffle(&mut ChaCha8Rng::seed_from_u64(shuffle_seed));
    assert_eq!(order, expected);
}

#[test]
fn test_periodic_dumps() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainingConfig { weight_dump_freq: 4, ..config(&dir.path().join("w")) };
    let report = session(cfg, 6, Box::new(LocalProcessGroup)).unwrap().run().unwrap();
    for n in [4, 8, 12] {
        assert!(dir.path().join(format!("w_{n}")).exists(), "missing w_{n}");
    }
    assert_eq!(report.checkpoints_written, 4);
    assert_eq!(read_weights(&dir.path().join("w_4")).unwrap().len(), 2);
}

#[test]
fn test_search_runs_full_sweep_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainingConfig { burn_in: 3, reheatings: 2, anneal: true, epochs: 1, ..config(&dir.path().join("w")) };
    let mut s = session(cfg, 3, Box::new(LocalProcessGroup)).unwrap();
    s.run().unwrap();
    // 2 * 3 burn-in + 2 collection sweeps per item
    assert_eq!(s.search().sweeps, 3 * 8);
}

// ── Group 2: failures ───────────────────────────────────────────────

#[test]
fn test_missing_references_rejected_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let lines = corpus(4);
    let m = metrics(&lines[..3]);
    let err = Session::new(
        config(&dir.path().join("w")),
        lines,
        m,
        FeatureVector::zeros(2),
        ExhaustiveSearch::default(),
        Box::new(LocalProcessGroup),
        Box::new(PlainTextSink),
    )
    .err()
    .unwrap();
    assert!(matches!(err, TrainError::Input(InputError::MissingReference { line: 3, .. })));
}

#[test]
fn test_no_learner_rejected_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainingConfig { perceptron: false, ..config(&dir.path().join("w")) };
    assert!(matches!(
        session(cfg, 2, Box::new(LocalProcessGroup)).err().unwrap(),
        TrainError::Config(_)
    ));
}

#[test]
fn test_search_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let lines = corpus(4);
    let m = metrics(&lines);
    let search = ExhaustiveSearch { fail_on_line: Some(2), ..ExhaustiveSearch::default() };
    let mut s = Session::new(
        config(&dir.path().join("w")),
        lines,
        m,
        FeatureVector::zeros(2),
        search,
        Box::new(LocalProcessGroup),
        Box::new(PlainTextSink),
    )
    .unwrap();
    let err = s.run().unwrap_err();
    assert!(matches!(err, TrainError::Search { line: 2, .. }));
    assert!(!dir.path().join("w_final").exists());
}

// ── Group 3: two ranks ──────────────────────────────────────────────

fn run_two_ranks(cfg: TrainingConfig, n: usize) -> Vec<(usize, expgain_core::session::TrainingReport, FeatureVector)> {
    let handles: Vec<_> = SharedMemoryGroup::new_group(2)
        .into_iter()
        .map(|pg| {
            let cfg = cfg.clone();
            thread::spawn(move || {
                let rank = pg.rank();
                let mut s = session(cfg, n, Box::new(pg)).unwrap();
                let report = s.run().unwrap();
                (rank, report, s.learner().weights().clone())
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_two_ranks_batch_updates_stay_identical() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainingConfig {
        update_granularity: UpdateGranularity::Batch,
        aggregate_layout: AggregateLayout::Concatenate,
        ..config(&dir.path().join("w"))
    };
    let results = run_two_ranks(cfg, 6);
    let (_, r0, w0) = &results[0];
    let (_, r1, w1) = &results[1];
    assert_eq!(w0, w1);
    assert_eq!(r0.averaged_weights, r1.averaged_weights);
    // each rank spends epochs x corpus size items from its 3-line shard
    assert_eq!((r0.items_processed, r1.items_processed), (12, 12));
    assert_eq!((r0.rounds, r1.rounds), (4, 4));
    assert!(r0.final_weights_path.is_some());
    assert!(r1.final_weights_path.is_none());
    assert!(dir.path().join("w_final").exists());
}

#[test]
fn test_two_ranks_uneven_shards_stay_in_lockstep() {
    // 5 lines over 2 ranks, batch size 2: shards of 2 and 3 lines, 10 items
    // each. Rank 0 needs 5 batches, rank 1 needs 7 and sets the pace.
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainingConfig { training_batch_size: 2, ..config(&dir.path().join("w")) };
    let results = run_two_ranks(cfg, 5);
    let (_, r0, w0) = &results[0];
    let (_, r1, w1) = &results[1];
    assert_eq!(r0.rounds, 7);
    assert_eq!(r1.rounds, 7);
    assert_eq!((r0.items_processed, r1.items_processed), (10, 10));
    // weights are mixed at every batch end, the last one included
    assert_eq!(w0, w1);
}

#[test]
fn test_two_ranks_elementwise_batch_updates() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainingConfig {
        update_granularity: UpdateGranularity::Batch,
        aggregate_layout: AggregateLayout::Elementwise,
        ..config(&dir.path().join("w"))
    };
    let results = run_two_ranks(cfg, 4);
    assert_eq!(results[0].1.averaged_weights, results[1].1.averaged_weights);
}

// ── Group 4: resume ─────────────────────────────────────────────────

#[test]
fn test_restore_continues_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainingConfig { training_batch_size: 2, ..config(&dir.path().join("w")) };
    let mut a = session(cfg.clone(), 6, Box::new(LocalProcessGroup)).unwrap();
    a.run_round().unwrap();
    a.run_round().unwrap();
    let state = a.training_state();
    assert_eq!(state.rounds_completed, 2);
    assert_eq!(state.cursor.processed, 4);

    let mut b = session(cfg, 6, Box::new(LocalProcessGroup)).unwrap();
    b.restore(state.clone()).unwrap();
    assert_eq!(b.rounds_completed(), 2);
    assert_eq!(b.learner().state(), &state.learner);
    let report = b.run().unwrap();
    assert_eq!(report.rounds, 6);
    assert_eq!(report.items_processed, 12);
}
