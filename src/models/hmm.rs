use tracing::debug;

use super::{
    FitDetail, FittedParameters, GoalModel, Marginal, ModelConfig, ModelKind, ModelPrediction,
    adjusted_rates, league_rates, prediction_from_table,
};
use crate::error::ModelError;
use crate::features::{DEFAULT_GOALS_PER_TEAM, FeatureVector};
use crate::history::{GoalHistory, TeamResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormState {
    Good,
    Medium,
    Poor,
}

impl FormState {
    pub const ALL: [FormState; 3] = [FormState::Good, FormState::Medium, FormState::Poor];

    /// Most probable state of a distribution; ties go to the better state.
    pub fn dominant(dist: &[f64; 3]) -> FormState {
        let mut best = 0;
        for s in 1..3 {
            if dist[s] > dist[best] {
                best = s;
            }
        }
        Self::ALL[best]
    }
}

/// Row `i` is the distribution of the next state given state `i`.
pub const TRANSITION: [[f64; 3]; 3] = [[0.6, 0.3, 0.1], [0.3, 0.5, 0.2], [0.2, 0.4, 0.4]];
/// P(win, draw, loss | state).
pub const EMISSION: [[f64; 3]; 3] = [[0.8, 0.15, 0.05], [0.4, 0.4, 0.2], [0.1, 0.3, 0.6]];
pub const INITIAL: [f64; 3] = [1.0 / 3.0; 3];

/// Goals scored and conceded per match in each state, on a 1.30 goal league.
pub const SCORING_RATE: [f64; 3] = [1.8, 1.3, 0.8];
pub const CONCEDING_RATE: [f64; 3] = [0.8, 1.3, 1.8];

fn observation(result: TeamResult) -> usize {
    match result {
        TeamResult::Win => 0,
        TeamResult::Draw => 1,
        TeamResult::Loss => 2,
    }
}

fn step(dist: &[f64; 3]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (from, p) in dist.iter().enumerate() {
        for (to, slot) in out.iter_mut().enumerate() {
            *slot += p * TRANSITION[from][to];
        }
    }
    out
}

/// Forward filtering over results, oldest first. Returns P(state | results).
pub fn filter(results: &[TeamResult]) -> Result<[f64; 3], ModelError> {
    let mut alpha = INITIAL;
    for (i, result) in results.iter().enumerate() {
        let prior = if i == 0 { alpha } else { step(&alpha) };
        let obs = observation(*result);
        let mut norm = 0.0;
        for s in 0..3 {
            alpha[s] = prior[s] * EMISSION[s][obs];
            norm += alpha[s];
        }
        if norm <= 0.0 || !norm.is_finite() {
            return Err(ModelError::NumericalInstability(format!(
                "forward pass normaliser vanished at step {i}"
            )));
        }
        for a in &mut alpha {
            *a /= norm;
        }
    }
    Ok(alpha)
}

/// State distribution for the upcoming match.
pub fn predict_next(results: &[TeamResult]) -> Result<[f64; 3], ModelError> {
    filter(results).map(|alpha| step(&alpha))
}

fn weighted(dist: &[f64; 3], rates: &[f64; 3]) -> f64 {
    dist.iter().zip(rates).map(|(p, r)| p * r).sum()
}

/// Three latent form states driving scoring and conceding rates.
#[derive(Debug, Clone, Copy)]
pub struct HiddenMarkovModel {
    config: ModelConfig,
}

impl HiddenMarkovModel {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

impl GoalModel for HiddenMarkovModel {
    fn kind(&self) -> ModelKind {
        ModelKind::HiddenMarkov
    }

    fn fit(&self, history: &GoalHistory, features: &FeatureVector) -> Result<FittedParameters, ModelError> {
        let window = self.config.history_window;
        let home = history.team_sample(features.home.team_id, window);
        let away = history.team_sample(features.away.team_id, window);
        let available = home.len().min(away.len());

        if available < self.config.min_history {
            debug!(match_id = features.match_id, available, "hmm falling back to league rates");
            let (home_rate, away_rate) = league_rates(features);
            return Ok(FittedParameters {
                model: ModelKind::HiddenMarkov,
                home_rate,
                away_rate,
                detail: FitDetail::FormStates {
                    home: INITIAL,
                    away: INITIAL,
                },
                used_fallback: true,
            });
        }

        let home_states = predict_next(&home.results)?;
        let away_states = predict_next(&away.results)?;
        debug!(
            match_id = features.match_id,
            home_state = ?FormState::dominant(&home_states),
            away_state = ?FormState::dominant(&away_states),
            "hmm next-match form"
        );

        let league = features.league.goals_per_team;
        let relative = |dist: &[f64; 3], rates: &[f64; 3]| weighted(dist, rates) / DEFAULT_GOALS_PER_TEAM;

        Ok(FittedParameters {
            model: ModelKind::HiddenMarkov,
            home_rate: league
                * relative(&home_states, &SCORING_RATE)
                * relative(&away_states, &CONCEDING_RATE)
                * features.home_advantage,
            away_rate: league
                * relative(&away_states, &SCORING_RATE)
                * relative(&home_states, &CONCEDING_RATE),
            detail: FitDetail::FormStates {
                home: home_states,
                away: away_states,
            },
            used_fallback: false,
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn transition_rows_are_distributions() {
        for row in TRANSITION.iter().chain(EMISSION.iter()) {
            assert_abs_diff_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn winning_streak_moves_mass_to_good() {
        let dist = filter(&[TeamResult::Win; 5]).expect("filter");
        assert!(dist[0] > 0.7);
        assert!(dist[0] > dist[1] && dist[1] > dist[2]);
        let next = predict_next(&[TeamResult::Win; 5]).expect("predict");
        assert_abs_diff_eq!(next.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(next[0] > next[2]);
        assert_eq!(FormState::dominant(&next), FormState::Good);
        assert_eq!(FormState::dominant(&INITIAL), FormState::Good);
    }

    #[test]
    fn no_results_keeps_prior() {
        assert_eq!(filter(&[]).expect("filter"), INITIAL);
    }

    #[test]
    fn symmetric_teams_get_symmetric_rates() {
        use crate::models::test_support::{features, meetings};
        let history = meetings(10, 1, 1, false);
        let model = HiddenMarkovModel::new(ModelConfig::default());
        let fitted = model.fit(&history, &features(11)).expect("fit");
        assert_abs_diff_eq!(fitted.home_rate, fitted.away_rate, epsilon = 1e-12);
    }
}
