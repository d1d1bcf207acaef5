use std::sync::Arc;

use chrono::NaiveDate;
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use goalcast::ensemble::WeightRegistry;
use goalcast::features::FeatureVectorBuilder;
use goalcast::models::hawkes::{EmSettings, fit_mle, minute_to_time};
use goalcast::models::{ModelConfig, ScoreTable};
use goalcast::pipeline::PredictionPipeline;
use goalcast::providers::MatchStore;
use goalcast::synthetic::SyntheticLeague;

fn synthetic_store() -> Arc<MatchStore> {
    let start = NaiveDate::from_ymd_opt(2021, 8, 7).expect("valid date");
    let matches = SyntheticLeague::new(1, 20, 2, start, 42)
        .with_unresolved_rounds(1)
        .generate()
        .expect("league");
    Arc::new(MatchStore::new(matches, FeatureVectorBuilder::default()))
}

fn bench_score_table(c: &mut Criterion) {
    c.bench_function("score_table_outcomes", |b| {
        b.iter(|| {
            let table = ScoreTable::from_rates(black_box(1.62), black_box(1.08));
            black_box((table.outcome_probs(), table.most_likely()))
        })
    });
}

fn bench_hawkes_fit(c: &mut Criterion) {
    let sequences: Vec<Vec<f64>> = (0..20u8)
        .map(|i| {
            [3 + i, 17 + i, 19 + i, 64 + i]
                .iter()
                .take(1 + usize::from(i % 4))
                .map(|m| minute_to_time(*m))
                .collect()
        })
        .collect();
    c.bench_function("hawkes_fit_mle", |b| {
        b.iter(|| fit_mle(black_box(&sequences), EmSettings::default()))
    });
}

fn bench_predict_match(c: &mut Criterion) {
    let store = synthetic_store();
    let pipeline = PredictionPipeline::new(
        store.clone(),
        store.clone(),
        Arc::new(WeightRegistry::default()),
        ModelConfig::default(),
    );
    let fixture = store.upcoming(1)[0].clone();

    c.bench_function("predict_match", |b| {
        b.iter(|| pipeline.predict_match(black_box(fixture.match_id), fixture.date))
    });
}

fn bench_predict_batch(c: &mut Criterion) {
    let store = synthetic_store();
    let pipeline = PredictionPipeline::new(
        store.clone(),
        store.clone(),
        Arc::new(WeightRegistry::default()),
        ModelConfig::default(),
    );
    let upcoming = store.upcoming(1);
    let ids: Vec<u64> = upcoming.iter().map(|m| m.match_id).collect();
    let as_of = upcoming[0].date;

    c.bench_function("predict_batch_round", |b| {
        b.iter(|| pipeline.predict_batch(black_box(&ids), as_of))
    });
}

criterion_group!(
    benches,
    bench_score_table,
    bench_hawkes_fit,
    bench_predict_match,
    bench_predict_batch
);
criterion_main!(benches);
