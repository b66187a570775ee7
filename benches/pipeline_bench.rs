//! Benchmark suite for the per-frame pipeline
//!
//! Run with: cargo bench

use std::collections::HashMap;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use danci_affect::config::{InterventionConfig, TemporalConfig, VisibilityConfig};
use danci_affect::emotion::{Emotion, EmotionPrediction, EmotionScores, TemporalStateEngine};
use danci_affect::intervention::InterventionEngine;
use danci_affect::visibility::{Point3D, VisibilityMonitor, VisibilitySignal};

const BASE_TS: i64 = 1_700_000_000_000;

fn predictions(n: usize) -> Vec<EmotionPrediction> {
    (0..n)
        .map(|i| {
            let emotion = Emotion::ALL[i % Emotion::ALL.len()];
            EmotionPrediction::local(emotion, EmotionScores::peaked(emotion, 0.6), 0.7, BASE_TS + i as i64 * 1_000)
        })
        .collect()
}

fn bench_add_prediction(c: &mut Criterion) {
    let stream = predictions(64);
    c.bench_function("TemporalStateEngine::add_prediction", |b| {
        let mut engine = TemporalStateEngine::new(TemporalConfig::default());
        let mut i = 0usize;
        b.iter(|| {
            let p = stream[i % stream.len()].clone();
            i += 1;
            black_box(engine.add_prediction(p))
        })
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let mut temporal = TemporalStateEngine::new(TemporalConfig::default());
    for p in predictions(15) {
        let _ = temporal.add_prediction(p);
    }
    let history = temporal.history();
    let state = temporal.state();

    c.bench_function("InterventionEngine::evaluate_at", |b| {
        let mut engine = InterventionEngine::new(InterventionConfig::default());
        b.iter(|| {
            engine.reset();
            black_box(engine.evaluate_at(&history, &state, BASE_TS + 15_000))
        })
    });
}

fn bench_visibility(c: &mut Criterion) {
    let landmarks: HashMap<usize, Point3D> = (0..468)
        .map(|i| (i, Point3D { x: 0.5, y: 0.5, z: 0.0 }))
        .collect();
    let signal = VisibilitySignal {
        face_detected: true,
        landmarks: Some(landmarks),
        detection_confidence: 0.9,
    };

    c.bench_function("VisibilityMonitor::check_at", |b| {
        let mut monitor = VisibilityMonitor::new(VisibilityConfig::default());
        b.iter(|| black_box(monitor.check_at(&signal, BASE_TS)))
    });
}

criterion_group!(benches, bench_add_prediction, bench_evaluate, bench_visibility);
criterion_main!(benches);
