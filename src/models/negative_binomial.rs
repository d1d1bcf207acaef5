use tracing::debug;

use super::{
    FitDetail, FittedParameters, GoalModel, Marginal, ModelConfig, ModelKind, ModelPrediction,
    PoissonModel, adjusted_rates, league_rates, prediction_from_table,
};
use crate::error::ModelError;
use crate::features::FeatureVector;
use crate::history::GoalHistory;

pub const DEFAULT_DISPERSION: f64 = 0.08;
pub const MIN_DISPERSION: f64 = 1e-3;
pub const MAX_DISPERSION: f64 = 2.0;

/// Method-of-moments dispersion: `var = mean + alpha * mean^2`.
pub fn moment_dispersion(goals: &[u8]) -> Option<f64> {
    if goals.len() < 2 {
        return None;
    }
    let n = goals.len() as f64;
    let mean = goals.iter().map(|g| *g as f64).sum::<f64>() / n;
    if mean <= 0.0 {
        return None;
    }
    let var = goals
        .iter()
        .map(|g| (*g as f64 - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    let alpha = if var > mean {
        (var - mean) / (mean * mean)
    } else {
        MIN_DISPERSION
    };
    Some(alpha.clamp(0.0, MAX_DISPERSION))
}

/// Poisson means with per-side overdispersion.
#[derive(Debug, Clone, Copy)]
pub struct NegativeBinomialModel {
    config: ModelConfig,
    means: PoissonModel,
}

impl NegativeBinomialModel {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            means: PoissonModel::new(config),
        }
    }
}

impl GoalModel for NegativeBinomialModel {
    fn kind(&self) -> ModelKind {
        ModelKind::NegativeBinomial
    }

    fn fit(&self, history: &GoalHistory, features: &FeatureVector) -> Result<FittedParameters, ModelError> {
        let window = self.config.history_window;
        let home = history.team_sample(features.home.team_id, window);
        let away = history.team_sample(features.away.team_id, window);
        let available = home.len().min(away.len());

        if available < self.config.min_history {
            debug!(
                match_id = features.match_id,
                available,
                "negative binomial falling back to league rates"
            );
            let (home_rate, away_rate) = league_rates(features);
            return Ok(FittedParameters {
                model: ModelKind::NegativeBinomial,
                home_rate,
                away_rate,
                detail: FitDetail::Dispersion {
                    home: DEFAULT_DISPERSION,
                    away: DEFAULT_DISPERSION,
                },
                used_fallback: true,
            });
        }

        let means = self.means.fit(history, features)?;
        Ok(FittedParameters {
            model: ModelKind::NegativeBinomial,
            home_rate: means.home_rate,
            away_rate: means.away_rate,
            detail: FitDetail::Dispersion {
                home: moment_dispersion(&home.goals_for).unwrap_or(DEFAULT_DISPERSION),
                away: moment_dispersion(&away.goals_for).unwrap_or(DEFAULT_DISPERSION),
            },
            used_fallback: means.used_fallback,
        })
    }

    fn predict(&self, fitted: &FittedParameters, features: &FeatureVector) -> ModelPrediction {
        let (home, away) = adjusted_rates(fitted, features);
        let (alpha_home, alpha_away) = match fitted.detail {
            FitDetail::Dispersion { home, away } => (home, away),
            _ => (DEFAULT_DISPERSION, DEFAULT_DISPERSION),
        };
        prediction_from_table(
            fitted,
            Marginal::NegativeBinomial {
                mean: home,
                dispersion: alpha_home,
            },
            Marginal::NegativeBinomial {
                mean: away,
                dispersion: alpha_away,
            },
        )
    }
}
