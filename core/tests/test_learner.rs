//! Online learners: update rules and weight averaging.

use expgain_core::features::FeatureVector;
use expgain_core::learner::*;

fn fv(v: &[f32]) -> FeatureVector {
    FeatureVector::from_vec(v.to_vec())
}

fn gradient_only(g: &[f32]) -> LearningSignal {
    LearningSignal { gradient: fv(g), margin: None }
}

// ── Group 1: perceptron ─────────────────────────────────────────────

#[test]
fn test_perceptron_step() {
    let mut p = PerceptronLearner::new(fv(&[1.0, 0.0]), "Perceptron", 0.5);
    p.update(&gradient_only(&[2.0, -4.0]));
    assert_eq!(p.weights().as_slice(), &[2.0, -2.0]);
    assert_eq!(p.name(), "Perceptron");
}

#[test]
fn test_perceptron_average_over_snapshots() {
    let mut p = PerceptronLearner::new(fv(&[0.0]), "Perceptron", 1.0);
    p.update(&gradient_only(&[1.0])); // w = 1
    p.update(&gradient_only(&[1.0])); // w = 2
    p.update(&gradient_only(&[1.0])); // w = 3
    assert_eq!(p.averaged_weights().as_slice(), &[2.0]);
    assert_eq!(p.state().snapshots, 3);
}

#[test]
fn test_set_weights_does_not_snapshot() {
    let mut p = PerceptronLearner::new(fv(&[0.0]), "Perceptron", 1.0);
    p.update(&gradient_only(&[4.0]));
    p.set_weights(fv(&[100.0]));
    assert_eq!(p.weights().as_slice(), &[100.0]);
    assert_eq!(p.averaged_weights().as_slice(), &[4.0]);
}

// ── Group 2: MIRA ───────────────────────────────────────────────────

#[test]
fn test_mira_moves_towards_better() {
    let mut m = MiraLearner::new(fv(&[0.0, 0.0]), "MIRA", 10.0);
    let signal = LearningSignal {
        gradient: fv(&[0.0, 0.0]),
        margin: Some(MarginPair { better: fv(&[1.0, 0.0]), worse: fv(&[0.0, 1.0]), gain_delta: 0.5 }),
    };
    m.update(&signal);
    // loss 0.5, ||df||^2 = 2, tau = 0.25
    assert_eq!(m.weights().as_slice(), &[0.25, -0.25]);
    // constraint now holds with equality: no further change
    m.update(&signal);
    assert!((m.weights()[0] - 0.25).abs() < 1e-7);
    assert_eq!(m.state().snapshots, 2);
}

#[test]
fn test_mira_without_pair_keeps_weights() {
    let mut m = MiraLearner::new(fv(&[1.0]), "MIRA", 0.01);
    m.update(&gradient_only(&[5.0]));
    assert_eq!(m.weights().as_slice(), &[1.0]);
    assert_eq!(m.averaged_weights().as_slice(), &[1.0]);
}

// ── Group 3: selection and state ────────────────────────────────────

#[test]
fn test_build_learner_names() {
    let p = build_learner(LearnerKind::Perceptron { learning_rate: 1.0 }, fv(&[0.0]));
    let m = build_learner(LearnerKind::Mira { slack: 0.1 }, fv(&[0.0]));
    assert_eq!(p.name(), "Perceptron");
    assert_eq!(m.name(), "MIRA");
}

#[test]
fn test_restore_state_resumes_average() {
    let mut a = PerceptronLearner::new(fv(&[0.0]), "Perceptron", 1.0);
    a.update(&gradient_only(&[2.0]));
    let saved = a.state().clone();
    a.update(&gradient_only(&[2.0]));

    let mut b = PerceptronLearner::new(fv(&[0.0]), "Perceptron", 1.0);
    b.restore_state(saved);
    b.update(&gradient_only(&[2.0]));
    assert_eq!(a.state(), b.state());
    assert_eq!(b.averaged_weights().as_slice(), &[3.0]);
}
