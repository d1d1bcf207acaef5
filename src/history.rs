use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::calibration::{Outcome, classify_outcome};
use crate::error::ProviderError;

pub type MatchId = u64;
pub type TeamId = u32;
pub type LeagueId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Score {
    pub home: u8,
    pub away: u8,
}

impl Score {
    pub fn new(home: u8, away: u8) -> Self {
        Self { home, away }
    }

    pub fn outcome(&self) -> Outcome {
        classify_outcome(self.home, self.away)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.home, self.away)
    }
}

/// Minutes (1..=90, stoppage folded into 90) at which each side scored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalMinutes {
    #[serde(default)]
    pub home: Vec<u8>,
    #[serde(default)]
    pub away: Vec<u8>,
}

/// A fixture as stored by the match store. Unresolved fixtures have no goals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: MatchId,
    pub league_id: LeagueId,
    pub date: NaiveDate,
    pub home_team_id: TeamId,
    pub away_team_id: TeamId,
    #[serde(default)]
    pub home_team: String,
    #[serde(default)]
    pub away_team: String,
    #[serde(default)]
    pub home_goals: Option<u8>,
    #[serde(default)]
    pub away_goals: Option<u8>,
    #[serde(default)]
    pub goal_minutes: Option<GoalMinutes>,
    /// Played at a neutral venue, so neither side gets home advantage.
    #[serde(default)]
    pub neutral: bool,
    /// Pre-match sentiment per side in [0, 1], when a source supplies it.
    #[serde(default)]
    pub home_sentiment: Option<f64>,
    #[serde(default)]
    pub away_sentiment: Option<f64>,
}

impl MatchRecord {
    pub fn is_resolved(&self) -> bool {
        self.home_goals.is_some() && self.away_goals.is_some()
    }

    pub fn score(&self) -> Option<Score> {
        Some(Score::new(self.home_goals?, self.away_goals?))
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.score().map(|s| s.outcome())
    }

    pub fn goal_record(&self) -> Option<GoalRecord> {
        let score = self.score()?;
        Some(GoalRecord {
            match_id: self.match_id,
            date: self.date,
            home_team_id: self.home_team_id,
            away_team_id: self.away_team_id,
            home_goals: score.home,
            away_goals: score.away,
            goal_minutes: self.goal_minutes.clone(),
        })
    }
}

/// One resolved match as seen by the goal models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalRecord {
    pub match_id: MatchId,
    pub date: NaiveDate,
    pub home_team_id: TeamId,
    pub away_team_id: TeamId,
    pub home_goals: u8,
    pub away_goals: u8,
    #[serde(default)]
    pub goal_minutes: Option<GoalMinutes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeamResult {
    Win,
    Draw,
    Loss,
}

impl TeamResult {
    pub fn points_rate(self) -> f64 {
        match self {
            TeamResult::Win => 1.0,
            TeamResult::Draw => 0.5,
            TeamResult::Loss => 0.0,
        }
    }
}

/// A team's view of its recent matches, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TeamSample {
    pub goals_for: Vec<u8>,
    pub goals_against: Vec<u8>,
    /// Scoring minutes for the team, `None` when the match carries no timing.
    pub goal_minutes: Vec<Option<Vec<u8>>>,
    pub results: Vec<TeamResult>,
}

impl TeamSample {
    pub fn len(&self) -> usize {
        self.goals_for.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals_for.is_empty()
    }

    pub fn mean_goals_for(&self) -> Option<f64> {
        mean(&self.goals_for)
    }

    pub fn mean_goals_against(&self) -> Option<f64> {
        mean(&self.goals_against)
    }

    /// Timed matches only.
    pub fn timed_minutes(&self) -> Vec<&[u8]> {
        self.goal_minutes
            .iter()
            .filter_map(|m| m.as_deref())
            .collect()
    }
}

fn mean(values: &[u8]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64)
}

/// Time-ordered resolved matches, all strictly before `cutoff`.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalHistory {
    cutoff: NaiveDate,
    records: Vec<GoalRecord>,
}

impl GoalHistory {
    /// Sorts by date and rejects anything dated on or after the cutoff.
    pub fn new(cutoff: NaiveDate, mut records: Vec<GoalRecord>) -> Result<Self, ProviderError> {
        if let Some(bad) = records.iter().find(|r| r.date >= cutoff) {
            return Err(ProviderError::Leakage {
                match_id: bad.match_id,
                date: bad.date,
                cutoff,
            });
        }
        records.sort_by(|a, b| a.date.cmp(&b.date).then(a.match_id.cmp(&b.match_id)));
        records.dedup_by_key(|r| r.match_id);
        Ok(Self { cutoff, records })
    }

    pub fn empty(cutoff: NaiveDate) -> Self {
        Self {
            cutoff,
            records: Vec::new(),
        }
    }

    /// Union of two histories (typically the two sides of a fixture). Head to
    /// head matches appear in both and are kept once.
    pub fn merge(&self, other: &GoalHistory) -> Result<Self, ProviderError> {
        let cutoff = self.cutoff.min(other.cutoff);
        let records = self
            .records
            .iter()
            .chain(other.records.iter())
            .cloned()
            .collect();
        Self::new(cutoff, records)
    }

    pub fn cutoff(&self) -> NaiveDate {
        self.cutoff
    }

    pub fn records(&self) -> &[GoalRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The last `window` matches involving `team`, oldest first.
    pub fn team_sample(&self, team: TeamId, window: usize) -> TeamSample {
        let mut picked: Vec<&GoalRecord> = self
            .records
            .iter()
            .rev()
            .filter(|r| r.home_team_id == team || r.away_team_id == team)
            .take(window)
            .collect();
        picked.reverse();

        let mut sample = TeamSample::default();
        for r in picked {
            let at_home = r.home_team_id == team;
            let (gf, ga) = if at_home {
                (r.home_goals, r.away_goals)
            } else {
                (r.away_goals, r.home_goals)
            };
            sample.goals_for.push(gf);
            sample.goals_against.push(ga);
            sample.goal_minutes.push(r.goal_minutes.as_ref().map(|m| {
                if at_home { m.home.clone() } else { m.away.clone() }
            }));
            sample.results.push(match gf.cmp(&ga) {
                std::cmp::Ordering::Greater => TeamResult::Win,
                std::cmp::Ordering::Equal => TeamResult::Draw,
                std::cmp::Ordering::Less => TeamResult::Loss,
            });
        }
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    fn rec(id: MatchId, date: NaiveDate, home: TeamId, away: TeamId, hg: u8, ag: u8) -> GoalRecord {
        GoalRecord {
            match_id: id,
            date,
            home_team_id: home,
            away_team_id: away,
            home_goals: hg,
            away_goals: ag,
            goal_minutes: None,
        }
    }

    #[test]
    fn rejects_records_on_cutoff_day() {
        let err = GoalHistory::new(d(2024, 3, 1), vec![rec(7, d(2024, 3, 1), 1, 2, 0, 0)])
            .expect_err("same-day record must leak");
        assert!(matches!(err, ProviderError::Leakage { match_id: 7, .. }));
    }

    #[test]
    fn sorts_and_merges_without_duplicates() {
        let a = GoalHistory::new(
            d(2024, 3, 1),
            vec![rec(2, d(2024, 2, 10), 1, 2, 1, 0), rec(1, d(2024, 1, 5), 1, 3, 2, 2)],
        )
        .expect("history");
        let b = GoalHistory::new(
            d(2024, 3, 1),
            vec![rec(2, d(2024, 2, 10), 1, 2, 1, 0), rec(3, d(2024, 2, 1), 2, 4, 0, 3)],
        )
        .expect("history");
        let merged = a.merge(&b).expect("merge");
        let ids: Vec<MatchId> = merged.records().iter().map(|r| r.match_id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn team_sample_is_from_team_perspective() {
        let h = GoalHistory::new(
            d(2024, 3, 1),
            vec![
                rec(1, d(2024, 1, 5), 1, 3, 2, 2),
                rec(2, d(2024, 2, 10), 2, 1, 3, 1),
                rec(3, d(2024, 2, 20), 1, 4, 1, 0),
            ],
        )
        .expect("history");
        let s = h.team_sample(1, 2);
        assert_eq!(s.goals_for, vec![1, 1]);
        assert_eq!(s.goals_against, vec![3, 0]);
        assert_eq!(s.results, vec![TeamResult::Loss, TeamResult::Win]);
    }
}
