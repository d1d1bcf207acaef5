use chrono::NaiveDate;

use goalcast::features::{FeatureVector, FeatureVectorBuilder, LeagueParams, NEUTRAL_HOME_ADVANTAGE, TeamFeatures};
use goalcast::history::{GoalHistory, GoalMinutes, GoalRecord, MatchRecord, TeamId};
use goalcast::models::{GoalModel, ModelConfig, ModelKind, PoissonModel, all_models};

const HOME: TeamId = 10;
const AWAY: TeamId = 20;

fn day(n: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 8, 5).expect("valid date") + chrono::Duration::days(n)
}

fn neutral_features(match_day: i64) -> FeatureVector {
    FeatureVector {
        match_id: 999,
        league_id: 1,
        match_date: day(match_day),
        cutoff: day(match_day),
        home: TeamFeatures::neutral(HOME, "Harrow"),
        away: TeamFeatures::neutral(AWAY, "Kelso"),
        home_advantage: 1.0,
        league: LeagueParams::defaults(1),
    }
}

fn neutral_venue_fixture(match_day: i64) -> MatchRecord {
    MatchRecord {
        match_id: 999,
        league_id: 1,
        date: day(match_day),
        home_team_id: HOME,
        away_team_id: AWAY,
        home_team: "Harrow".to_string(),
        away_team: "Kelso".to_string(),
        home_goals: None,
        away_goals: None,
        goal_minutes: None,
        neutral: true,
        home_sentiment: None,
        away_sentiment: None,
    }
}

fn record(i: i64, home: TeamId, away: TeamId, hg: u8, ag: u8, minutes: Option<GoalMinutes>) -> GoalRecord {
    GoalRecord {
        match_id: i as u64 + 1,
        date: day(i * 7),
        home_team_id: home,
        away_team_id: away,
        home_goals: hg,
        away_goals: ag,
        goal_minutes: minutes,
    }
}

#[test]
fn landslide_history_makes_the_winner_a_heavy_favourite() {
    let records = (0..20)
        .map(|i| {
            let minutes = GoalMinutes {
                home: vec![12, 34, 56, 78],
                away: Vec::new(),
            };
            record(i, HOME, AWAY, 4, 0, Some(minutes))
        })
        .collect();
    let history = GoalHistory::new(day(20 * 7), records).expect("history");
    let features = neutral_features(20 * 7);

    let poisson = PoissonModel::new(ModelConfig::default())
        .forecast(&history, &features)
        .expect("poisson forecast");
    assert!(poisson.probs.home > 0.85, "home={}", poisson.probs.home);
    assert!(!poisson.used_fallback);

    for model in all_models(&ModelConfig::default()) {
        // A model may legitimately bow out on a degenerate sample; the ones
        // that answer must favour the dominant side.
        let Ok(p) = model.forecast(&history, &features) else {
            continue;
        };
        assert!(p.probs.home > p.probs.away, "{} home={} away={}", p.model, p.probs.home, p.probs.away);
    }
}

#[test]
fn symmetric_teams_get_symmetric_outcomes() {
    // Alternate venues, identical scorelines and goal times for both sides.
    let records = (0..12)
        .map(|i| {
            let (home, away) = if i % 2 == 0 { (HOME, AWAY) } else { (AWAY, HOME) };
            let minutes = GoalMinutes {
                home: vec![30],
                away: vec![30],
            };
            record(i, home, away, 1, 1, Some(minutes))
        })
        .collect();
    let history = GoalHistory::new(day(12 * 7), records).expect("history");
    let league = LeagueParams::from_records(1, history.records());
    let features = FeatureVectorBuilder::default()
        .build(&neutral_venue_fixture(12 * 7), &history, league)
        .expect("features");
    assert_eq!(features.home_advantage, NEUTRAL_HOME_ADVANTAGE);
    assert_eq!(features.home.attack, features.away.attack);
    assert_eq!(features.home.defense, features.away.defense);
    assert_eq!(features.home.form, features.away.form);

    for model in all_models(&ModelConfig::default()) {
        let p = model.forecast(&history, &features).expect("forecast");
        assert!(
            (p.probs.home - p.probs.away).abs() < 0.02,
            "{}: home={} away={}",
            p.model,
            p.probs.home,
            p.probs.away
        );
        assert!(p.probs.is_distribution(1e-9));
    }
}

#[test]
fn empty_history_falls_back_to_league_rates_for_every_model() {
    let history = GoalHistory::empty(day(0));
    let features = neutral_features(0);

    let mut seen = Vec::new();
    for model in all_models(&ModelConfig::default()) {
        let p = model.forecast(&history, &features).expect("fallback forecast");
        assert!(p.used_fallback, "{} did not fall back", p.model);
        assert!(p.probs.is_distribution(1e-9));
        assert!(p.expected_home_goals > 0.0 && p.expected_away_goals > 0.0);
        seen.push(p.model);
    }
    assert_eq!(seen, ModelKind::ALL.to_vec());
}
