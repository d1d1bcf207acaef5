//! Collaborator seams: where features, histories and results come from and
//! where predictions go. [`MatchStore`] serves all three read-side traits from
//! an in-memory fixture list.

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::backtest::{BacktestRecord, Metric};
use crate::calibration::Outcome;
use crate::ensemble::EnsemblePrediction;
use crate::error::ProviderError;
use crate::features::{FeatureVector, FeatureVectorBuilder, LeagueParams};
use crate::history::{GoalHistory, GoalRecord, LeagueId, MatchId, MatchRecord, Score, TeamId};

pub trait FeatureProvider: Send + Sync {
    fn get_features(&self, match_id: MatchId, as_of: NaiveDate) -> Result<FeatureVector, ProviderError>;
}

pub trait HistoryProvider: Send + Sync {
    /// Must not return anything dated on or after `as_of`.
    fn get_goal_history(&self, team_id: TeamId, as_of: NaiveDate) -> Result<GoalHistory, ProviderError>;
}

pub trait ResultProvider: Send + Sync {
    fn get_actual_result(&self, match_id: MatchId) -> Result<(Outcome, Score), ProviderError>;

    /// Resolved fixtures of a league dated within `[start, end]`, in date order.
    fn resolved_matches(
        &self,
        league_id: LeagueId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<MatchRecord>, ProviderError>;
}

#[derive(Debug, Clone, Copy)]
pub enum Persisted<'a> {
    Prediction(&'a EnsemblePrediction),
    BacktestRecord {
        league_id: LeagueId,
        record: &'a BacktestRecord,
    },
    Metric {
        league_id: LeagueId,
        metric: &'a Metric,
    },
}

/// Fire-and-forget storage. Callers log failures and carry on.
pub trait PersistenceSink: Send + Sync {
    fn save(&self, item: Persisted<'_>) -> anyhow::Result<()>;
}

pub struct MatchStore {
    matches: Vec<MatchRecord>,
    by_id: HashMap<MatchId, usize>,
    builder: FeatureVectorBuilder,
}

impl MatchStore {
    pub fn new(mut matches: Vec<MatchRecord>, builder: FeatureVectorBuilder) -> Self {
        matches.sort_by(|a, b| a.date.cmp(&b.date).then(a.match_id.cmp(&b.match_id)));
        matches.dedup_by_key(|m| m.match_id);
        let by_id = matches
            .iter()
            .enumerate()
            .map(|(i, m)| (m.match_id, i))
            .collect();
        Self {
            matches,
            by_id,
            builder,
        }
    }

    pub fn matches(&self) -> &[MatchRecord] {
        &self.matches
    }

    pub fn get(&self, match_id: MatchId) -> Option<&MatchRecord> {
        self.by_id.get(&match_id).map(|i| &self.matches[*i])
    }

    pub fn league_ids(&self) -> Vec<LeagueId> {
        let mut ids: Vec<LeagueId> = self.matches.iter().map(|m| m.league_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Unresolved fixtures of a league, in date order.
    pub fn upcoming(&self, league_id: LeagueId) -> Vec<&MatchRecord> {
        self.matches
            .iter()
            .filter(|m| m.league_id == league_id && !m.is_resolved())
            .collect()
    }

    fn resolved_before(&self, as_of: NaiveDate) -> impl Iterator<Item = GoalRecord> + '_ {
        self.matches
            .iter()
            .take_while(move |m| m.date < as_of)
            .filter_map(MatchRecord::goal_record)
    }

    pub fn league_params(&self, league_id: LeagueId, as_of: NaiveDate) -> LeagueParams {
        let records: Vec<GoalRecord> = self
            .matches
            .iter()
            .take_while(|m| m.date < as_of)
            .filter(|m| m.league_id == league_id)
            .filter_map(MatchRecord::goal_record)
            .collect();
        LeagueParams::from_records(league_id, &records)
    }
}

impl FeatureProvider for MatchStore {
    fn get_features(&self, match_id: MatchId, as_of: NaiveDate) -> Result<FeatureVector, ProviderError> {
        let fixture = self
            .get(match_id)
            .ok_or_else(|| ProviderError::DataUnavailable(format!("unknown match {match_id}")))?;
        let home = self.get_goal_history(fixture.home_team_id, as_of)?;
        let away = self.get_goal_history(fixture.away_team_id, as_of)?;
        let history = home.merge(&away)?;
        let league = self.league_params(fixture.league_id, as_of);
        self.builder.build(fixture, &history, league)
    }
}

impl HistoryProvider for MatchStore {
    fn get_goal_history(&self, team_id: TeamId, as_of: NaiveDate) -> Result<GoalHistory, ProviderError> {
        let records = self
            .resolved_before(as_of)
            .filter(|r| r.home_team_id == team_id || r.away_team_id == team_id)
            .collect();
        GoalHistory::new(as_of, records)
    }
}

impl ResultProvider for MatchStore {
    fn get_actual_result(&self, match_id: MatchId) -> Result<(Outcome, Score), ProviderError> {
        let record = self
            .get(match_id)
            .ok_or_else(|| ProviderError::DataUnavailable(format!("unknown match {match_id}")))?;
        let score = record
            .score()
            .ok_or_else(|| ProviderError::DataUnavailable(format!("match {match_id} is unresolved")))?;
        Ok((score.outcome(), score))
    }

    fn resolved_matches(
        &self,
        league_id: LeagueId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<MatchRecord>, ProviderError> {
        Ok(self
            .matches
            .iter()
            .filter(|m| m.league_id == league_id && m.is_resolved())
            .filter(|m| m.date >= start && m.date <= end)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).expect("valid date")
    }

    fn m(id: MatchId, day: u32, home: TeamId, away: TeamId, score: Option<(u8, u8)>) -> MatchRecord {
        MatchRecord {
            match_id: id,
            league_id: 7,
            date: d(day),
            home_team_id: home,
            away_team_id: away,
            home_team: format!("T{home}"),
            away_team: format!("T{away}"),
            home_goals: score.map(|s| s.0),
            away_goals: score.map(|s| s.1),
            goal_minutes: None,
            neutral: false,
            home_sentiment: None,
            away_sentiment: None,
        }
    }

    fn store() -> MatchStore {
        MatchStore::new(
            vec![
                m(1, 1, 1, 2, Some((2, 1))),
                m(2, 3, 3, 1, Some((0, 0))),
                m(3, 5, 1, 2, Some((1, 3))),
                m(4, 5, 3, 2, Some((1, 1))),
                m(5, 9, 2, 3, None),
            ],
            FeatureVectorBuilder::default(),
        )
    }

    #[test]
    fn history_excludes_as_of_day() {
        let h = store().get_goal_history(1, d(5)).expect("history");
        let ids: Vec<MatchId> = h.records().iter().map(|r| r.match_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn results_only_for_resolved_matches() {
        let s = store();
        assert_eq!(
            s.get_actual_result(3).expect("resolved"),
            (Outcome::Away, Score::new(1, 3))
        );
        assert!(s.get_actual_result(5).is_err());
        let ids: Vec<MatchId> = s
            .resolved_matches(7, d(3), d(9))
            .expect("range")
            .iter()
            .map(|m| m.match_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn features_for_unknown_match_are_unavailable() {
        let err = store().get_features(42, d(9)).expect_err("unknown");
        assert!(matches!(err, ProviderError::DataUnavailable(_)));
    }

    #[test]
    fn features_carry_sentiment() {
        let mut matches = store().matches().to_vec();
        matches[4].home_sentiment = Some(0.8);
        let s = MatchStore::new(matches, FeatureVectorBuilder::default());
        let fv = s.get_features(5, d(9)).expect("features");
        assert_eq!(fv.home.sentiment, Some(0.8));
        assert_eq!(fv.away.sentiment, None);
        assert_eq!(fv.league.sample_matches, 4);
    }
}
