use tracing::debug;

use super::{
    FitDetail, FittedParameters, GoalModel, Marginal, ModelConfig, ModelKind, ModelPrediction,
    adjusted_rates, league_rates, prediction_from_table,
};
use crate::error::ModelError;
use crate::features::FeatureVector;
use crate::history::GoalHistory;

/// Independent Poisson scoring rates. The maximum-likelihood rate of a
/// Poisson sample is its mean, scaled here by the opponent's defensive ratio.
#[derive(Debug, Clone, Copy)]
pub struct PoissonModel {
    config: ModelConfig,
}

impl PoissonModel {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    fn estimate(&self, history: &GoalHistory, features: &FeatureVector) -> Result<(f64, f64), ModelError> {
        let home = history.team_sample(features.home.team_id, self.config.history_window);
        let away = history.team_sample(features.away.team_id, self.config.history_window);
        let available = home.len().min(away.len());
        if available < self.config.min_history {
            return Err(ModelError::InsufficientData {
                needed: self.config.min_history,
                available,
            });
        }
        let (Some(home_gf), Some(away_gf)) = (home.mean_goals_for(), away.mean_goals_for()) else {
            return Err(ModelError::InsufficientData {
                needed: self.config.min_history,
                available: 0,
            });
        };
        Ok((
            home_gf * features.away.defense * features.home_advantage,
            away_gf * features.home.defense,
        ))
    }
}

impl GoalModel for PoissonModel {
    fn kind(&self) -> ModelKind {
        ModelKind::Poisson
    }

    fn fit(&self, history: &GoalHistory, features: &FeatureVector) -> Result<FittedParameters, ModelError> {
        let (home_rate, away_rate, used_fallback) = match self.estimate(history, features) {
            Ok((h, a)) => (h, a, false),
            Err(err @ ModelError::InsufficientData { .. }) => {
                debug!(match_id = features.match_id, %err, "poisson falling back to league rates");
                let (h, a) = league_rates(features);
                (h, a, true)
            }
            Err(err) => return Err(err),
        };
        Ok(FittedParameters {
            model: ModelKind::Poisson,
            home_rate,
            away_rate,
            detail: FitDetail::Rates,
            used_fallback,
        })
    }

    fn predict(&self, fitted: &FittedParameters, features: &FeatureVector) -> ModelPrediction {
        let (home, away) = adjusted_rates(fitted, features);
        prediction_from_table(
            fitted,
            Marginal::Poisson { mean: home },
            Marginal::Poisson { mean: away },
        )
    }
}
