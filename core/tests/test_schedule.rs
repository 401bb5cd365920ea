//! Sweep conductor, annealing schedule and acceptance rules.

use expgain_core::schedule::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn schedule(burn_in: usize, iterations: usize, reheatings: usize, anneal: bool) -> SweepSchedule {
    SweepSchedule {
        burn_in,
        iterations,
        reheatings,
        annealing: anneal.then_some(LinearAnnealing { burn_in, max_temp: 4.0 }),
    }
}

fn pulses(mut c: Conductor) -> Vec<Pulse> {
    let mut out = Vec::new();
    while !c.is_done() {
        out.push(c.pulse());
        c.advance();
    }
    out
}

// ── Group 1: conductor ──────────────────────────────────────────────

#[test]
fn test_burn_in_then_collect() {
    let p = pulses(Conductor::new(schedule(2, 3, 1, false)));
    assert_eq!(p.len(), 5);
    assert_eq!(p.iter().filter(|p| p.collect).count(), 3);
    assert!(!p[0].collect && !p[1].collect && p[2].collect);
    assert!(p.iter().all(|p| p.temperature == 1.0));
}

#[test]
fn test_reheating_repeats_annealed_burn_in() {
    let p = pulses(Conductor::new(schedule(4, 2, 2, true)));
    assert_eq!(p.len(), 10);
    let temps: Vec<f64> = p.iter().map(|p| p.temperature).collect();
    assert_eq!(&temps[..4], &[4.0, 3.25, 2.5, 1.75]);
    assert_eq!(&temps[4..8], &temps[..4]);
    assert_eq!(&temps[8..], &[1.0, 1.0]);
    assert_eq!(p[5].reheat, 1);
    assert_eq!(p[9].reheat, 2);
}

#[test]
fn test_no_burn_in_collects_immediately() {
    let p = pulses(Conductor::new(schedule(0, 3, 1, true)));
    assert_eq!(p.len(), 3);
    assert!(p.iter().all(|p| p.collect));
}

#[test]
fn test_pulse_observe_then_advance() {
    let mut c = Conductor::new(schedule(1, 1, 1, false));
    assert_eq!(c.pulse(), c.pulse());
    c.advance();
    assert!(c.pulse().collect);
    c.advance();
    assert!(c.is_done());
    c.reset();
    assert_eq!(c.step(), 0);
    assert!(!c.pulse().collect);
}

// ── Group 2: acceptance ─────────────────────────────────────────────

#[test]
fn test_greedy_takes_best() {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let pulse = Pulse { sweep: 0, reheat: 0, temperature: 100.0, collect: false };
    for _ in 0..50 {
        assert_eq!(Acceptor::Greedy.choose(&[0.0, 2.0, 1.0], &pulse, &mut rng), 1);
    }
    assert!(!Acceptor::Greedy.accept(1.0, 0.5, &pulse, &mut rng));
}

#[test]
fn test_high_temperature_explores() {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let hot = Pulse { sweep: 0, reheat: 0, temperature: 1000.0, collect: false };
    let taken = (0..400)
        .filter(|_| Acceptor::Regular.accept(0.0, -1.0, &hot, &mut rng))
        .count();
    // near-uniform at T = 1000
    assert!((150..250).contains(&taken), "accepted {taken}");
}

#[test]
fn test_fixed_temperature_ignores_pulse() {
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let hot = Pulse { sweep: 0, reheat: 0, temperature: 1000.0, collect: false };
    let cold = Acceptor::FixedTemperature(0.01);
    let taken = (0..100).filter(|_| cold.accept(0.0, -1.0, &hot, &mut rng)).count();
    assert_eq!(taken, 0);
    assert_eq!(cold.name(), "fixed-temperature");
}
