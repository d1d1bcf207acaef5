use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::PredictError;
use crate::features::DEFAULT_GOALS_PER_TEAM;
use crate::history::{GoalMinutes, LeagueId, MatchRecord, TeamId};

const TOWNS: &[&str] = &[
    "Ashford", "Brampton", "Calder", "Dunmore", "Eastwick", "Fairhaven", "Glenrock", "Harrow",
    "Ironbridge", "Jarrow", "Kelso", "Larkhill", "Marston", "Northam", "Oakridge", "Penrith",
    "Queensbury", "Redcliff", "Stanmore", "Thornbury",
];

const SYNTHETIC_HOME_EDGE: f64 = 1.10;
/// Team ids are `league_id * TEAM_ID_STRIDE + index`.
const TEAM_ID_STRIDE: u32 = 1000;

/// Deterministic double round-robin league with latent team strengths.
#[derive(Debug, Clone)]
pub struct SyntheticLeague {
    pub league_id: LeagueId,
    pub teams: usize,
    pub seasons: usize,
    pub start: NaiveDate,
    pub seed: u64,
    /// Rounds at the end of the last season left without a result.
    pub unresolved_rounds: usize,
}

impl SyntheticLeague {
    pub fn new(league_id: LeagueId, teams: usize, seasons: usize, start: NaiveDate, seed: u64) -> Self {
        Self {
            league_id,
            teams,
            seasons,
            start,
            seed,
            unresolved_rounds: 0,
        }
    }

    pub fn with_unresolved_rounds(mut self, rounds: usize) -> Self {
        self.unresolved_rounds = rounds;
        self
    }

    /// First team id of the league, or an error when the league's id block
    /// does not fit in a [`TeamId`].
    fn team_id_base(&self) -> Result<TeamId, PredictError> {
        if self.teams > TEAM_ID_STRIDE as usize {
            return Err(PredictError::validation(format!(
                "synthetic league supports at most {TEAM_ID_STRIDE} teams, got {}",
                self.teams
            )));
        }
        self.league_id
            .checked_mul(TEAM_ID_STRIDE)
            .filter(|base| base.checked_add(TEAM_ID_STRIDE - 1).is_some())
            .ok_or_else(|| {
                PredictError::validation(format!("league id {} is too large for synthetic team ids", self.league_id))
            })
    }

    pub fn team_name(&self, index: usize) -> String {
        match TOWNS.get(index) {
            Some(town) => format!("{town} {}", self.league_id),
            None => format!("Team {} {}", index, self.league_id),
        }
    }

    pub fn generate(&self) -> Result<Vec<MatchRecord>, PredictError> {
        let base = self.team_id_base()?;
        let team_id = |index: usize| base + index as TeamId;
        let teams = self.teams.max(2);
        let mut rng = StdRng::seed_from_u64(self.seed ^ (self.league_id as u64).rotate_left(32));
        let strengths: Vec<(f64, f64)> = (0..teams)
            .map(|_| (rng.gen_range(0.7..1.35), rng.gen_range(0.7..1.35)))
            .collect();

        let rounds = double_round_robin(teams);
        let total_rounds = rounds.len() * self.seasons;
        let mut out = Vec::with_capacity(total_rounds * teams / 2);
        let mut next_id = self.league_id as u64 * 100_000;

        for season in 0..self.seasons {
            // Seasons are a year apart, rounds a week apart.
            let season_start = self.start + Duration::days(365 * season as i64);
            for (r, pairs) in rounds.iter().enumerate() {
                let date = season_start + Duration::days(7 * r as i64);
                let global_round = season * rounds.len() + r;
                let resolved = global_round + self.unresolved_rounds < total_rounds;

                for &(h, a) in pairs {
                    next_id += 1;
                    let mut record = MatchRecord {
                        match_id: next_id,
                        league_id: self.league_id,
                        date,
                        home_team_id: team_id(h),
                        away_team_id: team_id(a),
                        home_team: self.team_name(h),
                        away_team: self.team_name(a),
                        home_goals: None,
                        away_goals: None,
                        goal_minutes: None,
                        neutral: false,
                        home_sentiment: None,
                        away_sentiment: None,
                    };
                    if resolved {
                        let lambda_home = DEFAULT_GOALS_PER_TEAM
                            * strengths[h].0
                            * strengths[a].1
                            * SYNTHETIC_HOME_EDGE;
                        let lambda_away = DEFAULT_GOALS_PER_TEAM * strengths[a].0 * strengths[h].1;
                        let home_goals = sample_poisson(&mut rng, lambda_home);
                        let away_goals = sample_poisson(&mut rng, lambda_away);
                        record.home_goals = Some(home_goals);
                        record.away_goals = Some(away_goals);
                        record.goal_minutes = Some(GoalMinutes {
                            home: sample_minutes(&mut rng, home_goals),
                            away: sample_minutes(&mut rng, away_goals),
                        });
                    }
                    out.push(record);
                }
            }
        }
        Ok(out)
    }
}

/// Circle method; the second half mirrors the first with venues swapped.
fn double_round_robin(teams: usize) -> Vec<Vec<(usize, usize)>> {
    let n = if teams % 2 == 0 { teams } else { teams + 1 };
    let mut ring: Vec<usize> = (0..n).collect();
    let mut first_half = Vec::with_capacity(n - 1);

    for round in 0..n - 1 {
        let mut pairs = Vec::with_capacity(n / 2);
        for i in 0..n / 2 {
            let (a, b) = (ring[i], ring[n - 1 - i]);
            if a >= teams || b >= teams {
                continue;
            }
            // Alternate venues so nobody stays at home all season.
            if (round + i) % 2 == 0 {
                pairs.push((a, b));
            } else {
                pairs.push((b, a));
            }
        }
        first_half.push(pairs);
        ring[1..].rotate_right(1);
    }

    let second_half: Vec<Vec<(usize, usize)>> = first_half
        .iter()
        .map(|pairs| pairs.iter().map(|&(h, a)| (a, h)).collect())
        .collect();
    first_half.into_iter().chain(second_half).collect()
}

fn sample_poisson(rng: &mut impl Rng, lambda: f64) -> u8 {
    let limit = (-lambda).exp();
    let mut k = 0u8;
    let mut p: f64 = rng.r#gen();
    while p > limit && k < u8::MAX {
        k += 1;
        p *= rng.r#gen::<f64>();
    }
    k
}

fn sample_minutes(rng: &mut impl Rng, goals: u8) -> Vec<u8> {
    let mut minutes: Vec<u8> = (0..goals).map(|_| rng.gen_range(1..=90)).collect();
    minutes.sort_unstable();
    minutes
}
