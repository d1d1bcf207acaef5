use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::calibration::Prob3;
use crate::error::{ModelError, PredictError};
use crate::features::{FeatureVector, TeamFeatures};
use crate::history::{GoalHistory, Score};

pub mod hawkes;
pub mod hmm;
pub mod negative_binomial;
pub mod poisson;
pub mod scoreline;

pub use hawkes::{HawkesModel, HawkesParams};
pub use hmm::HiddenMarkovModel;
pub use negative_binomial::NegativeBinomialModel;
pub use poisson::PoissonModel;
pub use scoreline::{Marginal, ScoreTable};

pub const MIN_RATE: f64 = 0.10;
pub const MAX_RATE: f64 = 6.0;

/// The four goal models. Declaration order is the tie-break priority used
/// when two models carry the same ensemble weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Poisson,
    NegativeBinomial,
    Hawkes,
    #[serde(rename = "hmm")]
    HiddenMarkov,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Poisson,
        ModelKind::NegativeBinomial,
        ModelKind::Hawkes,
        ModelKind::HiddenMarkov,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Poisson => "poisson",
            ModelKind::NegativeBinomial => "negative_binomial",
            ModelKind::Hawkes => "hawkes",
            ModelKind::HiddenMarkov => "hmm",
        }
    }

    /// Comma separated identifiers, e.g. `poisson,hmm`. Unknown or repeated
    /// identifiers are rejected.
    pub fn parse_list(raw: &str) -> Result<Vec<ModelKind>, PredictError> {
        let mut out = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let kind: ModelKind = part.parse()?;
            if out.contains(&kind) {
                return Err(PredictError::validation(format!("model {kind} listed twice")));
            }
            out.push(kind);
        }
        if out.is_empty() {
            return Err(PredictError::validation("empty model list"));
        }
        Ok(out)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = PredictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poisson" => Ok(ModelKind::Poisson),
            "negative_binomial" | "negbin" | "nb" => Ok(ModelKind::NegativeBinomial),
            "hawkes" => Ok(ModelKind::Hawkes),
            "hmm" | "hidden_markov" => Ok(ModelKind::HiddenMarkov),
            other => Err(PredictError::validation(format!("unknown model identifier '{other}'"))),
        }
    }
}

/// One model's forecast for one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub model: ModelKind,
    pub probs: Prob3,
    pub predicted_score: Score,
    pub expected_home_goals: f64,
    pub expected_away_goals: f64,
    pub used_fallback: bool,
}

/// Model-specific state kept between `fit` and `predict`.
#[derive(Debug, Clone, PartialEq)]
pub enum FitDetail {
    Rates,
    Dispersion { home: f64, away: f64 },
    Hawkes {
        home: HawkesParams,
        away: HawkesParams,
        maximum_likelihood: bool,
    },
    FormStates { home: [f64; 3], away: [f64; 3] },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FittedParameters {
    pub model: ModelKind,
    /// Expected goals before form and sentiment adjustment.
    pub home_rate: f64,
    pub away_rate: f64,
    pub detail: FitDetail,
    pub used_fallback: bool,
}

pub trait GoalModel: Send + Sync {
    fn kind(&self) -> ModelKind;

    /// Estimate parameters from history strictly before the feature cutoff.
    /// Short histories are handled inside the model with a league-average
    /// estimate; an error means the model must be excluded.
    fn fit(&self, history: &GoalHistory, features: &FeatureVector) -> Result<FittedParameters, ModelError>;

    fn predict(&self, fitted: &FittedParameters, features: &FeatureVector) -> ModelPrediction;

    fn forecast(&self, history: &GoalHistory, features: &FeatureVector) -> Result<ModelPrediction, ModelError> {
        let fitted = self.fit(history, features)?;
        Ok(self.predict(&fitted, features))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    pub min_history: usize,
    pub history_window: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            min_history: 5,
            history_window: 20,
        }
    }
}

pub fn all_models(config: &ModelConfig) -> Vec<Box<dyn GoalModel>> {
    vec![
        Box::new(PoissonModel::new(*config)),
        Box::new(NegativeBinomialModel::new(*config)),
        Box::new(HawkesModel::new(*config)),
        Box::new(HiddenMarkovModel::new(*config)),
    ]
}

fn form_multiplier(team: &TeamFeatures) -> f64 {
    let mut m = 0.85 + 0.30 * team.form.clamp(0.0, 1.0);
    if let Some(s) = team.sentiment {
        m *= 0.95 + 0.10 * s.clamp(0.0, 1.0);
    }
    m
}

pub fn clamp_rate(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(MIN_RATE, MAX_RATE)
    } else {
        MIN_RATE
    }
}

/// Fitted rates after the form and sentiment multipliers every model applies.
pub fn adjusted_rates(fitted: &FittedParameters, features: &FeatureVector) -> (f64, f64) {
    (
        clamp_rate(fitted.home_rate * form_multiplier(&features.home)),
        clamp_rate(fitted.away_rate * form_multiplier(&features.away)),
    )
}

/// League-average rates scaled by strengths, used when a team's own history
/// is too short.
pub fn league_rates(features: &FeatureVector) -> (f64, f64) {
    let base = features.league.goals_per_team;
    (
        base * features.home.attack * features.away.defense * features.home_advantage,
        base * features.away.attack * features.home.defense,
    )
}

pub(crate) fn prediction_from_table(
    fitted: &FittedParameters,
    home: Marginal,
    away: Marginal,
) -> ModelPrediction {
    let table = ScoreTable::from_marginals(home, away);
    ModelPrediction {
        model: fitted.model,
        probs: table.outcome_probs(),
        predicted_score: table.most_likely(),
        expected_home_goals: home.mean(),
        expected_away_goals: away.mean(),
        used_fallback: fitted.used_fallback,
    }
}
