//! Self-exciting goal process, one per team.
//!
//! `lambda(t) = mu + alpha * sum_{t_i < t} exp(-beta (t - t_i))` with time in
//! minutes over a 90 minute window. Each timed match in the team's history is
//! an independent realisation starting from an empty past.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    FitDetail, FittedParameters, GoalModel, Marginal, ModelConfig, ModelKind, ModelPrediction,
    adjusted_rates, league_rates, prediction_from_table,
};
use crate::error::ModelError;
use crate::features::FeatureVector;
use crate::history::{GoalHistory, TeamSample};

pub const MATCH_MINUTES: f64 = 90.0;
pub const DECAY_GRID: [f64; 4] = [0.02, 0.05, 0.1, 0.2];
pub const DEFAULT_DECAY: f64 = 0.1;
pub const MAX_BRANCHING_RATIO: f64 = 0.95;
const MOMENT_MAX_BRANCHING: f64 = 0.9;
const MIN_EVENTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HawkesParams {
    pub baseline: f64,
    pub excitation: f64,
    pub decay: f64,
}

impl HawkesParams {
    pub fn branching_ratio(&self) -> f64 {
        if self.decay > 0.0 {
            self.excitation / self.decay
        } else {
            f64::INFINITY
        }
    }

    /// `E[N(horizon)]` from an empty past, by integrating the mean intensity.
    pub fn expected_count(&self, horizon: f64) -> f64 {
        self.baseline * count_per_unit_baseline(self.excitation, self.decay, horizon)
    }
}

/// Expected count over `horizon` for a unit baseline.
fn count_per_unit_baseline(excitation: f64, decay: f64, horizon: f64) -> f64 {
    let gap = decay - excitation;
    if excitation <= 0.0 || gap <= 0.0 {
        return horizon;
    }
    let stationary = decay / gap;
    stationary * horizon + (1.0 - stationary) * (1.0 - (-gap * horizon).exp()) / gap
}

/// Goal minute `m` is taken as the midpoint of that minute.
pub fn minute_to_time(minute: u8) -> f64 {
    (minute as f64 - 0.5).clamp(0.0, MATCH_MINUTES - 0.01)
}

#[derive(Debug, Clone, Copy)]
pub struct EmSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for EmSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-8,
        }
    }
}

/// Maximum likelihood by EM over the decay grid; the best converged
/// candidate wins.
pub fn fit_mle(sequences: &[Vec<f64>], settings: EmSettings) -> Result<HawkesParams, ModelError> {
    let events: usize = sequences.iter().map(Vec::len).sum();
    if sequences.is_empty() || events < MIN_EVENTS {
        return Err(ModelError::InsufficientData {
            needed: MIN_EVENTS,
            available: events,
        });
    }

    let mut best: Option<(HawkesParams, f64)> = None;
    for decay in DECAY_GRID {
        match fit_em_fixed_decay(sequences, decay, settings) {
            Ok((params, ll)) => {
                if best.map(|(_, b)| ll > b).unwrap_or(true) {
                    best = Some((params, ll));
                }
            }
            Err(err) => debug!(decay, %err, "hawkes candidate rejected"),
        }
    }

    best.map(|(p, _)| p).ok_or_else(|| {
        ModelError::NumericalInstability("hawkes EM did not converge for any decay".to_string())
    })
}

fn fit_em_fixed_decay(
    sequences: &[Vec<f64>],
    decay: f64,
    settings: EmSettings,
) -> Result<(HawkesParams, f64), ModelError> {
    let windows = sequences.len() as f64;
    let total_events: usize = sequences.iter().map(Vec::len).sum();
    // Kernel mass each event can still contribute before full time.
    let compensator: f64 = sequences
        .iter()
        .flatten()
        .map(|t| (1.0 - (-decay * (MATCH_MINUTES - t)).exp()) / decay)
        .sum();
    if compensator <= 0.0 {
        return Err(ModelError::NumericalInstability("empty compensator".to_string()));
    }

    let mut params = HawkesParams {
        baseline: 0.5 * total_events as f64 / (windows * MATCH_MINUTES),
        excitation: 0.3 * decay,
        decay,
    };
    let mut last_ll = f64::NEG_INFINITY;

    for _ in 0..settings.max_iterations {
        let mut background = 0.0;
        let mut triggered = 0.0;
        let mut log_intensity = 0.0;

        for seq in sequences {
            let mut carry = 0.0_f64;
            let mut prev: Option<f64> = None;
            for &t in seq {
                if let Some(p) = prev {
                    carry = (-decay * (t - p)).exp() * (1.0 + carry);
                }
                prev = Some(t);
                let excited = params.excitation * carry;
                let lambda = params.baseline + excited;
                if lambda <= 0.0 || !lambda.is_finite() {
                    return Err(ModelError::NumericalInstability(format!(
                        "non-positive intensity at t={t:.2}"
                    )));
                }
                background += params.baseline / lambda;
                triggered += excited / lambda;
                log_intensity += lambda.ln();
            }
        }

        let ll = log_intensity
            - params.baseline * windows * MATCH_MINUTES
            - params.excitation * compensator;
        if !ll.is_finite() {
            return Err(ModelError::NumericalInstability("log-likelihood is not finite".to_string()));
        }

        params.baseline = background / (windows * MATCH_MINUTES);
        params.excitation = triggered / compensator;

        if params.branching_ratio() >= MAX_BRANCHING_RATIO {
            return Err(ModelError::NumericalInstability(format!(
                "branching ratio {:.3} at decay {decay}",
                params.branching_ratio()
            )));
        }

        if (ll - last_ll).abs() < settings.tolerance * (1.0 + ll.abs()) {
            return Ok((params, ll));
        }
        last_ll = ll;
    }

    Err(ModelError::NumericalInstability(format!(
        "EM did not converge within {} iterations at decay {decay}",
        settings.max_iterations
    )))
}

/// Moment fit on per-match counts: excess variance sets the branching ratio,
/// the baseline then reproduces the sample mean exactly.
pub fn fit_moments(counts: &[u8]) -> Result<HawkesParams, ModelError> {
    if counts.is_empty() {
        return Err(ModelError::InsufficientData {
            needed: 1,
            available: 0,
        });
    }
    let n = counts.len() as f64;
    let mean = counts.iter().map(|c| *c as f64).sum::<f64>() / n;
    let var = counts
        .iter()
        .map(|c| (*c as f64 - mean).powi(2))
        .sum::<f64>()
        / n;

    let branching = if var > mean && var > 0.0 {
        (1.0 - (mean / var).sqrt()).clamp(0.0, MOMENT_MAX_BRANCHING)
    } else {
        0.0
    };
    let decay = DEFAULT_DECAY;
    let excitation = branching * decay;
    let unit = count_per_unit_baseline(excitation, decay, MATCH_MINUTES);
    let params = HawkesParams {
        baseline: mean / unit,
        excitation,
        decay,
    };
    if !params.baseline.is_finite() || params.baseline < 0.0 {
        return Err(ModelError::NumericalInstability(
            "moment baseline is not finite".to_string(),
        ));
    }
    Ok(params)
}

#[derive(Debug, Clone, Copy)]
pub struct HawkesModel {
    config: ModelConfig,
    em: EmSettings,
}

impl HawkesModel {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            em: EmSettings::default(),
        }
    }

    /// Returns the params and whether they came from maximum likelihood.
    fn fit_team(&self, sample: &TeamSample) -> Result<(HawkesParams, bool), ModelError> {
        if sample.len() < self.config.min_history {
            return Err(ModelError::InsufficientData {
                needed: self.config.min_history,
                available: sample.len(),
            });
        }

        let timed = sample.timed_minutes();
        if timed.len() >= self.config.min_history {
            let sequences: Vec<Vec<f64>> = timed
                .iter()
                .map(|mins| {
                    let mut ts: Vec<f64> = mins.iter().map(|m| minute_to_time(*m)).collect();
                    ts.sort_by(f64::total_cmp);
                    ts
                })
                .collect();
            match fit_mle(&sequences, self.em) {
                Ok(params) => return Ok((params, true)),
                Err(err) => debug!(%err, "hawkes falling back to moment fit"),
            }
        }

        fit_moments(&sample.goals_for).map(|p| (p, false))
    }
}

impl GoalModel for HawkesModel {
    fn kind(&self) -> ModelKind {
        ModelKind::Hawkes
    }

    fn fit(&self, history: &GoalHistory, features: &FeatureVector) -> Result<FittedParameters, ModelError> {
        let window = self.config.history_window;
        let home = history.team_sample(features.home.team_id, window);
        let away = history.team_sample(features.away.team_id, window);

        let fitted = self
            .fit_team(&home)
            .and_then(|h| self.fit_team(&away).map(|a| (h, a)));

        match fitted {
            Ok(((home_params, home_ml), (away_params, away_ml))) => Ok(FittedParameters {
                model: ModelKind::Hawkes,
                home_rate: home_params.expected_count(MATCH_MINUTES)
                    * features.away.defense
                    * features.home_advantage,
                away_rate: away_params.expected_count(MATCH_MINUTES) * features.home.defense,
                detail: FitDetail::Hawkes {
                    home: home_params,
                    away: away_params,
                    maximum_likelihood: home_ml && away_ml,
                },
                used_fallback: false,
            }),
            Err(err @ ModelError::InsufficientData { .. }) => {
                debug!(match_id = features.match_id, %err, "hawkes falling back to league rates");
                let (home_rate, away_rate) = league_rates(features);
                let flat = |rate: f64| HawkesParams {
                    baseline: rate / MATCH_MINUTES,
                    excitation: 0.0,
                    decay: DEFAULT_DECAY,
                };
                Ok(FittedParameters {
                    model: ModelKind::Hawkes,
                    home_rate,
                    away_rate,
                    detail: FitDetail::Hawkes {
                        home: flat(home_rate),
                        away: flat(away_rate),
                        maximum_likelihood: false,
                    },
                    used_fallback: true,
                })
            }
            Err(err) => Err(err),
        }
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
