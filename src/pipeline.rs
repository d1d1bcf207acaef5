use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::ensemble::{EnsembleCombiner, EnsemblePrediction, WeightRegistry};
use crate::error::PredictError;
use crate::explain::{ExplainRequest, TimedExplainer};
use crate::history::{GoalHistory, MatchId};
use crate::models::{GoalModel, ModelConfig, ModelKind, ModelPrediction, all_models};
use crate::providers::{FeatureProvider, HistoryProvider, PersistenceSink, Persisted};

pub struct PredictionPipeline {
    features: Arc<dyn FeatureProvider>,
    history: Arc<dyn HistoryProvider>,
    models: Vec<Box<dyn GoalModel>>,
    weights: Arc<WeightRegistry>,
    combiner: EnsembleCombiner,
    sink: Option<Arc<dyn PersistenceSink>>,
    explainer: Option<TimedExplainer>,
}

impl PredictionPipeline {
    pub fn new(
        features: Arc<dyn FeatureProvider>,
        history: Arc<dyn HistoryProvider>,
        weights: Arc<WeightRegistry>,
        config: ModelConfig,
    ) -> Self {
        Self {
            features,
            history,
            models: all_models(&config),
            weights,
            combiner: EnsembleCombiner,
            sink: None,
            explainer: None,
        }
    }

    pub fn with_models(mut self, models: Vec<Box<dyn GoalModel>>) -> Self {
        self.models = models;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_explainer(mut self, explainer: TimedExplainer) -> Self {
        self.explainer = Some(explainer);
        self
    }

    pub fn weights(&self) -> &Arc<WeightRegistry> {
        &self.weights
    }

    pub fn model_kinds(&self) -> Vec<ModelKind> {
        self.models.iter().map(|m| m.kind()).collect()
    }

    /// Full request: numeric prediction, optional explanation, persistence.
    pub fn predict_match(&self, match_id: MatchId, as_of: NaiveDate) -> Result<EnsemblePrediction, PredictError> {
        let (mut prediction, names) = self.run(match_id, as_of, None)?;

        if let Some(explainer) = &self.explainer {
            let text = explainer.explain(ExplainRequest {
                home_team: names.0,
                away_team: names.1,
                prediction: prediction.clone(),
            });
            prediction.explanation = Some(text);
        }

        if let Some(sink) = &self.sink {
            if let Err(err) = sink.save(Persisted::Prediction(&prediction)) {
                warn!(match_id, %err, "failed to persist prediction");
            }
        }
        Ok(prediction)
    }

    /// One result per requested match, in request order.
    pub fn predict_batch(
        &self,
        match_ids: &[MatchId],
        as_of: NaiveDate,
    ) -> Vec<Result<EnsemblePrediction, PredictError>> {
        match_ids
            .par_iter()
            .map(|id| self.predict_match(*id, as_of))
            .collect()
    }

    /// Numeric prediction only, optionally restricted to `subset`. Used by the
    /// backtest, which must not persist or explain every replayed match.
    pub fn evaluate(
        &self,
        match_id: MatchId,
        as_of: NaiveDate,
        subset: Option<&[ModelKind]>,
    ) -> Result<EnsemblePrediction, PredictError> {
        self.run(match_id, as_of, subset).map(|(p, _)| p)
    }

    fn run(
        &self,
        match_id: MatchId,
        as_of: NaiveDate,
        subset: Option<&[ModelKind]>,
    ) -> Result<(EnsemblePrediction, (String, String)), PredictError> {
        let models = self.select(subset)?;

        let features = self.features.get_features(match_id, as_of)?;
        if as_of > features.match_date {
            return Err(PredictError::validation(format!(
                "as-of date {as_of} is after match {match_id} on {}",
                features.match_date
            )));
        }

        let home = self.history.get_goal_history(features.home.team_id, as_of)?;
        let away = self.history.get_goal_history(features.away.team_id, as_of)?;
        let mut history = home.merge(&away)?;
        if history.cutoff() > as_of {
            history = GoalHistory::new(as_of, history.records().to_vec())?;
        }

        // One snapshot for the whole request.
        let weights = self.weights.current();

        let outcomes: Vec<(ModelKind, Result<ModelPrediction, _>)> = models
            .par_iter()
            .map(|model| (model.kind(), model.forecast(&history, &features)))
            .collect();

        let mut survivors = Vec::with_capacity(outcomes.len());
        for (kind, outcome) in outcomes {
            match outcome {
                Ok(prediction) => survivors.push(prediction),
                Err(err) => warn!(match_id, model = %kind, %err, "model excluded from ensemble"),
            }
        }

        let prediction = self.combiner.combine(match_id, &survivors, &weights)?;
        debug!(
            match_id,
            models = prediction.models.len(),
            home = prediction.probs.home,
            draw = prediction.probs.draw,
            away = prediction.probs.away,
            "ensemble prediction"
        );
        Ok((prediction, (features.home.name, features.away.name)))
    }

    pub fn validate_subset(&self, subset: Option<&[ModelKind]>) -> Result<(), PredictError> {
        self.select(subset).map(|_| ())
    }

    fn select(&self, subset: Option<&[ModelKind]>) -> Result<Vec<&dyn GoalModel>, PredictError> {
        let Some(subset) = subset else {
            return Ok(self.models.iter().map(|m| m.as_ref()).collect());
        };
        if subset.is_empty() {
            return Err(PredictError::validation("model subset is empty"));
        }
        for (i, kind) in subset.iter().enumerate() {
            if subset[..i].contains(kind) {
                return Err(PredictError::validation(format!("model {kind} listed twice")));
            }
            if !self.models.iter().any(|m| m.kind() == *kind) {
                return Err(PredictError::validation(format!("model {kind} is not configured")));
            }
        }
        Ok(self
            .models
            .iter()
            .filter(|m| subset.contains(&m.kind()))
            .map(|m| m.as_ref())
            .collect())
    }
}
