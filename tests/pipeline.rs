use std::sync::{Arc, Mutex};
use std::time::Duration;

use approx::assert_abs_diff_eq;
use chrono::NaiveDate;

use goalcast::ensemble::{ModelWeight, WeightRegistry, WeightSet};
use goalcast::error::{ModelError, PredictError};
use goalcast::explain::{TemplateExplainer, TimedExplainer};
use goalcast::features::{FeatureVector, FeatureVectorBuilder};
use goalcast::history::{GoalHistory, MatchId, MatchRecord};
use goalcast::models::{
    FittedParameters, GoalModel, HiddenMarkovModel, ModelConfig, ModelKind, ModelPrediction, NegativeBinomialModel,
    PoissonModel,
};
use goalcast::pipeline::PredictionPipeline;
use goalcast::providers::{MatchStore, PersistenceSink, Persisted};
use goalcast::synthetic::SyntheticLeague;

struct Failing(ModelKind);

impl GoalModel for Failing {
    fn kind(&self) -> ModelKind {
        self.0
    }

    fn fit(&self, _: &GoalHistory, _: &FeatureVector) -> Result<FittedParameters, ModelError> {
        Err(ModelError::NumericalInstability("intensity diverged".to_string()))
    }

    fn predict(&self, _: &FittedParameters, _: &FeatureVector) -> ModelPrediction {
        unreachable!("fit always fails")
    }
}

#[derive(Default)]
struct RecordingSink {
    saved: Mutex<Vec<MatchId>>,
}

impl PersistenceSink for RecordingSink {
    fn save(&self, item: Persisted<'_>) -> anyhow::Result<()> {
        if let Persisted::Prediction(p) = item {
            self.saved.lock().expect("lock").push(p.match_id);
        }
        Ok(())
    }
}

fn store() -> Arc<MatchStore> {
    let start = NaiveDate::from_ymd_opt(2022, 8, 6).expect("valid date");
    let matches = SyntheticLeague::new(3, 6, 2, start, 11)
        .with_unresolved_rounds(1)
        .generate()
        .expect("league");
    Arc::new(MatchStore::new(matches, FeatureVectorBuilder::default()))
}

fn pipeline(store: &Arc<MatchStore>) -> PredictionPipeline {
    PredictionPipeline::new(
        store.clone(),
        store.clone(),
        Arc::new(WeightRegistry::default()),
        ModelConfig::default(),
    )
}

/// A resolved second-season fixture, so every team has history.
fn late_fixture(store: &MatchStore) -> MatchRecord {
    store
        .matches()
        .iter()
        .filter(|m| m.is_resolved())
        .nth(45)
        .cloned()
        .expect("fixture")
}

#[test]
fn failing_model_is_excluded_and_weights_renormalised() {
    let store = store();
    let config = ModelConfig::default();
    let pipeline = pipeline(&store).with_models(vec![
        Box::new(PoissonModel::new(config)),
        Box::new(NegativeBinomialModel::new(config)),
        Box::new(Failing(ModelKind::Hawkes)),
        Box::new(HiddenMarkovModel::new(config)),
    ]);
    let fixture = late_fixture(&store);

    let p = pipeline.predict_match(fixture.match_id, fixture.date).expect("prediction");

    let kinds: Vec<ModelKind> = p.models.iter().map(|m| m.model).collect();
    assert_eq!(
        kinds,
        vec![ModelKind::Poisson, ModelKind::NegativeBinomial, ModelKind::HiddenMarkov]
    );
    let total: f64 = p.weights.iter().map(|w| w.weight).sum();
    assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
    assert!(p.probs.is_distribution(1e-9));
    assert_abs_diff_eq!(p.confidence, p.probs.max(), epsilon = 1e-12);
}

#[test]
fn all_models_failing_is_an_empty_ensemble() {
    let store = store();
    let pipeline = pipeline(&store).with_models(vec![
        Box::new(Failing(ModelKind::Poisson)),
        Box::new(Failing(ModelKind::Hawkes)),
    ]);
    let fixture = late_fixture(&store);

    let err = pipeline
        .predict_match(fixture.match_id, fixture.date)
        .expect_err("no survivors");
    assert_eq!(
        err,
        PredictError::EnsembleEmpty {
            match_id: fixture.match_id
        }
    );
}

#[test]
fn batch_keeps_request_order_and_isolates_failures() {
    let store = store();
    let sink = Arc::new(RecordingSink::default());
    let pipeline = pipeline(&store).with_sink(sink.clone());

    let upcoming: Vec<MatchId> = store.upcoming(3).iter().map(|m| m.match_id).collect();
    assert_eq!(upcoming.len(), 3);
    let as_of = store.upcoming(3)[0].date;

    let mut ids = upcoming.clone();
    ids.insert(1, 987_654_321);
    let results = pipeline.predict_batch(&ids, as_of);

    assert_eq!(results.len(), ids.len());
    for (id, result) in ids.iter().zip(&results) {
        match result {
            Ok(p) => assert_eq!(p.match_id, *id),
            Err(err) => {
                assert_eq!(*id, 987_654_321);
                assert!(matches!(err, PredictError::ExternalService(_)));
            }
        }
    }
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);

    let mut saved = sink.saved.lock().expect("lock").clone();
    saved.sort_unstable();
    let mut expected = upcoming;
    expected.sort_unstable();
    assert_eq!(saved, expected);
}

#[test]
fn as_of_after_kickoff_is_rejected() {
    let store = store();
    let pipeline = pipeline(&store);
    let fixture = late_fixture(&store);

    let after = fixture.date + chrono::Duration::days(1);
    assert!(pipeline.predict_match(fixture.match_id, after).is_err());
}

#[test]
fn earlier_as_of_sees_less_history() {
    let store = store();
    let pipeline = pipeline(&store);
    let fixture = late_fixture(&store);

    let early = fixture.date - chrono::Duration::days(200);
    let late = pipeline.evaluate(fixture.match_id, fixture.date, None).expect("late");
    let early = pipeline.evaluate(fixture.match_id, early, None).expect("early");
    assert!(early.probs.is_distribution(1e-9));
    assert_ne!(late.probs, early.probs);
}

#[test]
fn weights_snapshot_is_reported_on_the_prediction() {
    let store = store();
    let registry = Arc::new(WeightRegistry::default());
    let pipeline = PredictionPipeline::new(store.clone(), store.clone(), registry.clone(), ModelConfig::default());
    let fixture = late_fixture(&store);

    let published = registry
        .publish(vec![
            ModelWeight {
                model: ModelKind::Poisson,
                weight: 3.0,
            },
            ModelWeight {
                model: ModelKind::HiddenMarkov,
                weight: 1.0,
            },
        ])
        .expect("publish");
    assert_eq!(published.version, WeightSet::uniform().version + 1);

    let p = pipeline.predict_match(fixture.match_id, fixture.date).expect("prediction");
    assert_eq!(p.weights_version, published.version);
    let poisson = p
        .weights
        .iter()
        .find(|w| w.model == ModelKind::Poisson)
        .map(|w| w.weight)
        .expect("poisson weight");
    assert_abs_diff_eq!(poisson, 0.75, epsilon = 1e-9);
}

#[test]
fn explanation_is_attached_when_configured() {
    let store = store();
    let explainer = TimedExplainer::new(Arc::new(TemplateExplainer), Duration::from_secs(2));
    let pipeline = pipeline(&store).with_explainer(explainer);
    let fixture = late_fixture(&store);

    let p = pipeline.predict_match(fixture.match_id, fixture.date).expect("prediction");
    let text = p.explanation.expect("explanation");
    assert!(text.contains(&fixture.home_team));
}
