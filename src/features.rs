use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::history::{GoalHistory, GoalRecord, LeagueId, MatchId, MatchRecord, TeamId, TeamSample};

pub const DEFAULT_HOME_ADVANTAGE: f64 = 1.05;
pub const NEUTRAL_HOME_ADVANTAGE: f64 = 1.0;
/// League-average goals per team per match used as the prior.
pub const DEFAULT_GOALS_PER_TEAM: f64 = 1.30;
pub const FORM_DECAY: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeagueParams {
    pub league_id: LeagueId,
    pub sample_matches: usize,
    pub goals_per_team: f64,
}

impl LeagueParams {
    pub fn defaults(league_id: LeagueId) -> Self {
        Self {
            league_id,
            sample_matches: 0,
            goals_per_team: DEFAULT_GOALS_PER_TEAM,
        }
    }

    pub fn from_records(league_id: LeagueId, records: &[GoalRecord]) -> Self {
        let n = records.len();
        let goals: f64 = records
            .iter()
            .map(|r| r.home_goals as f64 + r.away_goals as f64)
            .sum();

        let mut out = Self::defaults(league_id);
        out.sample_matches = n;
        if n > 0 {
            out.goals_per_team = goals / (2.0 * n as f64);
        }

        // Shrink small samples toward defaults to avoid wild swings.
        const MIN_N: f64 = 200.0;
        let w = (n as f64 / MIN_N).clamp(0.0, 1.0);
        out.goals_per_team = (1.0 - w) * DEFAULT_GOALS_PER_TEAM + w * out.goals_per_team;
        out
    }
}

/// Per-side numeric context. Strengths are ratios to the league average:
/// `attack > 1` scores more than average, `defense > 1` concedes more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamFeatures {
    pub team_id: TeamId,
    pub name: String,
    /// Decayed points rate in [0, 1].
    pub form: f64,
    pub attack: f64,
    pub defense: f64,
    pub matches: usize,
    pub sentiment: Option<f64>,
}

impl TeamFeatures {
    pub fn neutral(team_id: TeamId, name: impl Into<String>) -> Self {
        Self {
            team_id,
            name: name.into(),
            form: 0.5,
            attack: 1.0,
            defense: 1.0,
            matches: 0,
            sentiment: None,
        }
    }

    fn from_sample(
        team_id: TeamId,
        name: &str,
        sample: &TeamSample,
        league: &LeagueParams,
        min_history: usize,
        sentiment: Option<f64>,
    ) -> Self {
        let n = sample.len();
        let shrink = if min_history == 0 {
            1.0
        } else {
            (n as f64 / min_history as f64).min(1.0)
        };
        let base = league.goals_per_team.max(1e-6);

        let raw_attack = sample.mean_goals_for().map(|g| g / base).unwrap_or(1.0);
        let raw_defense = sample.mean_goals_against().map(|g| g / base).unwrap_or(1.0);

        Self {
            team_id,
            name: name.to_string(),
            form: 0.5 + shrink * (decayed_points_rate(sample) - 0.5),
            attack: 1.0 + shrink * (raw_attack - 1.0),
            defense: 1.0 + shrink * (raw_defense - 1.0),
            matches: n,
            sentiment: sentiment.map(|s| s.clamp(0.0, 1.0)),
        }
    }
}

fn decayed_points_rate(sample: &TeamSample) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for (k, result) in sample.results.iter().rev().enumerate() {
        let w = FORM_DECAY.powi(k as i32);
        num += w * result.points_rate();
        den += w;
    }
    if den > 0.0 { num / den } else { 0.5 }
}

/// One match's numeric context as of `cutoff`. Built fresh for each request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub match_id: MatchId,
    pub league_id: LeagueId,
    pub match_date: NaiveDate,
    pub cutoff: NaiveDate,
    pub home: TeamFeatures,
    pub away: TeamFeatures,
    pub home_advantage: f64,
    pub league: LeagueParams,
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureVectorBuilder {
    pub history_window: usize,
    pub min_history: usize,
    pub home_advantage: f64,
}

impl Default for FeatureVectorBuilder {
    fn default() -> Self {
        Self {
            history_window: 20,
            min_history: 5,
            home_advantage: DEFAULT_HOME_ADVANTAGE,
        }
    }
}

impl FeatureVectorBuilder {
    pub fn new(history_window: usize, min_history: usize) -> Self {
        Self {
            history_window,
            min_history,
            ..Self::default()
        }
    }

    pub fn build(
        &self,
        fixture: &MatchRecord,
        history: &GoalHistory,
        league: LeagueParams,
    ) -> Result<FeatureVector, ProviderError> {
        let cutoff = history.cutoff();
        if cutoff > fixture.date {
            return Err(ProviderError::DataUnavailable(format!(
                "history cutoff {cutoff} is after match {} on {}",
                fixture.match_id, fixture.date
            )));
        }

        let home_sample = history.team_sample(fixture.home_team_id, self.history_window);
        let away_sample = history.team_sample(fixture.away_team_id, self.history_window);

        Ok(FeatureVector {
            match_id: fixture.match_id,
            league_id: fixture.league_id,
            match_date: fixture.date,
            cutoff,
            home: TeamFeatures::from_sample(
                fixture.home_team_id,
                &fixture.home_team,
                &home_sample,
                &league,
                self.min_history,
                fixture.home_sentiment,
            ),
            away: TeamFeatures::from_sample(
                fixture.away_team_id,
                &fixture.away_team,
                &away_sample,
                &league,
                self.min_history,
                fixture.away_sentiment,
            ),
            home_advantage: if fixture.neutral {
                NEUTRAL_HOME_ADVANTAGE
            } else {
                self.home_advantage
            },
            league,
        })
    }
}
