use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calibration::{LogitScaling, Prob3, apply_logit_scaling};
use crate::error::PredictError;
use crate::history::{MatchId, Score};
use crate::models::{ModelKind, ModelPrediction};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelWeight {
    pub model: ModelKind,
    pub weight: f64,
}

/// Immutable mixing configuration. A new snapshot is built for every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSet {
    pub version: u64,
    pub weights: Vec<ModelWeight>,
    #[serde(default)]
    pub scaling: LogitScaling,
}

impl Default for WeightSet {
    fn default() -> Self {
        Self::uniform()
    }
}

impl WeightSet {
    pub fn uniform() -> Self {
        let w = 1.0 / ModelKind::ALL.len() as f64;
        Self {
            version: 0,
            weights: ModelKind::ALL
                .iter()
                .map(|model| ModelWeight { model: *model, weight: w })
                .collect(),
            scaling: LogitScaling::identity(),
        }
    }

    /// Validates and normalises `weights` to sum to one.
    pub fn new(version: u64, weights: Vec<ModelWeight>, scaling: LogitScaling) -> Result<Self, PredictError> {
        let mut seen: Vec<ModelKind> = Vec::with_capacity(weights.len());
        for w in &weights {
            if !w.weight.is_finite() || w.weight < 0.0 {
                return Err(PredictError::validation(format!(
                    "weight for {} must be finite and non-negative, got {}",
                    w.model, w.weight
                )));
            }
            if seen.contains(&w.model) {
                return Err(PredictError::validation(format!("duplicate weight for {}", w.model)));
            }
            seen.push(w.model);
        }
        let total: f64 = weights.iter().map(|w| w.weight).sum();
        if total <= 0.0 {
            return Err(PredictError::validation("weights sum to zero"));
        }
        let mut weights: Vec<ModelWeight> = weights
            .into_iter()
            .map(|w| ModelWeight {
                model: w.model,
                weight: w.weight / total,
            })
            .collect();
        weights.sort_by_key(|w| w.model);
        Ok(Self {
            version,
            weights,
            scaling,
        })
    }

    pub fn weight_for(&self, model: ModelKind) -> f64 {
        self.weights
            .iter()
            .find(|w| w.model == model)
            .map(|w| w.weight)
            .unwrap_or(0.0)
    }
}

/// Single-writer, many-reader publication of [`WeightSet`] snapshots.
/// Readers clone the `Arc` and keep a consistent set for a whole request.
#[derive(Debug)]
pub struct WeightRegistry {
    current: RwLock<Arc<WeightSet>>,
}

impl Default for WeightRegistry {
    fn default() -> Self {
        Self::new(WeightSet::uniform())
    }
}

impl WeightRegistry {
    pub fn new(initial: WeightSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn current(&self) -> Arc<WeightSet> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Publish new model weights, keeping the current scaling.
    pub fn publish(&self, weights: Vec<ModelWeight>) -> Result<Arc<WeightSet>, PredictError> {
        self.update(|current| WeightSet::new(current.version + 1, weights, current.scaling))
    }

    pub fn publish_scaling(&self, scaling: LogitScaling) -> Result<Arc<WeightSet>, PredictError> {
        self.update(|current| WeightSet::new(current.version + 1, current.weights.clone(), scaling))
    }

    fn update(
        &self,
        build: impl FnOnce(&WeightSet) -> Result<WeightSet, PredictError>,
    ) -> Result<Arc<WeightSet>, PredictError> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(build(&guard)?);
        *guard = Arc::clone(&next);
        info!(version = next.version, "published ensemble weights");
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    pub match_id: MatchId,
    pub probs: Prob3,
    /// Weighted model mixture before the snapshot's logit scaling.
    pub mixture: Prob3,
    pub predicted_score: Score,
    /// Equal to the largest outcome probability.
    pub confidence: f64,
    pub expected_home_goals: f64,
    pub expected_away_goals: f64,
    /// Renormalised weights of the models that contributed.
    pub weights: Vec<ModelWeight>,
    pub models: Vec<ModelPrediction>,
    pub weights_version: u64,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnsembleCombiner;

impl EnsembleCombiner {
    pub fn combine(
        &self,
        match_id: MatchId,
        predictions: &[ModelPrediction],
        weights: &WeightSet,
    ) -> Result<EnsemblePrediction, PredictError> {
        if predictions.is_empty() {
            return Err(PredictError::EnsembleEmpty { match_id });
        }
        let mut models: Vec<ModelPrediction> = predictions.to_vec();
        models.sort_by_key(|p| p.model);
        if models.windows(2).any(|w| w[0].model == w[1].model) {
            return Err(PredictError::validation(format!(
                "duplicate model prediction for match {match_id}"
            )));
        }

        let raw: Vec<f64> = models
            .iter()
            .map(|p| weights.weight_for(p.model).max(0.0))
            .collect();
        let total: f64 = raw.iter().sum();
        let active: Vec<f64> = if total > 0.0 && total.is_finite() {
            raw.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / models.len() as f64; models.len()]
        };

        let mut mixed = Prob3 {
            home: 0.0,
            draw: 0.0,
            away: 0.0,
        };
        let mut expected_home_goals = 0.0;
        let mut expected_away_goals = 0.0;
        for (p, w) in models.iter().zip(&active) {
            mixed.home += w * p.probs.home;
            mixed.draw += w * p.probs.draw;
            mixed.away += w * p.probs.away;
            expected_home_goals += w * p.expected_home_goals;
            expected_away_goals += w * p.expected_away_goals;
        }
        let mixture = mixed.normalized();
        let probs = apply_logit_scaling(mixture, weights.scaling);

        // Models are sorted by priority, so the first maximum wins a tie.
        let mut lead = 0usize;
        for (i, w) in active.iter().enumerate().skip(1) {
            if w.partial_cmp(&active[lead]) == Some(Ordering::Greater) {
                lead = i;
            }
        }

        Ok(EnsemblePrediction {
            match_id,
            probs,
            mixture,
            predicted_score: models[lead].predicted_score,
            confidence: probs.max(),
            expected_home_goals,
            expected_away_goals,
            weights: models
                .iter()
                .zip(&active)
                .map(|(p, w)| ModelWeight {
                    model: p.model,
                    weight: *w,
                })
                .collect(),
            models,
            weights_version: weights.version,
            explanation: None,
        })
    }
}

/// Missing file means no snapshot has been published yet.
pub fn load_weight_set(path: &Path) -> Result<Option<WeightSet>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let set: WeightSet = serde_json::from_str(&raw).context("parse weight snapshot")?;
    let set = WeightSet::new(set.version, set.weights, set.scaling)
        .map_err(|e| anyhow::anyhow!("invalid weight snapshot {}: {e}", path.display()))?;
    Ok(Some(set))
}

pub fn save_weight_set(path: &Path, set: &WeightSet) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(set).context("serialize weight snapshot")?;
    fs::write(&tmp, json).context("write weight snapshot")?;
    fs::rename(&tmp, path).context("swap weight snapshot")?;
    Ok(())
}
