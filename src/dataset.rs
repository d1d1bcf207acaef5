use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::backtest::BacktestRecord;
use crate::ensemble::EnsemblePrediction;
use crate::history::{GoalMinutes, LeagueId, MatchRecord};
use crate::providers::{PersistenceSink, Persisted};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS matches (
            match_id INTEGER PRIMARY KEY,
            league_id INTEGER NOT NULL,
            match_date TEXT NOT NULL,
            home_team_id INTEGER NOT NULL,
            away_team_id INTEGER NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            home_goals INTEGER NULL,
            away_goals INTEGER NULL,
            goal_minutes_json TEXT NULL,
            neutral INTEGER NOT NULL DEFAULT 0,
            home_sentiment REAL NULL,
            away_sentiment REAL NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_matches_league ON matches(league_id);
        CREATE INDEX IF NOT EXISTS idx_matches_date ON matches(match_date);

        CREATE TABLE IF NOT EXISTS predictions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            match_id INTEGER NOT NULL,
            model_type TEXT NOT NULL,
            home_probability REAL NOT NULL,
            draw_probability REAL NOT NULL,
            away_probability REAL NOT NULL,
            predicted_score TEXT NOT NULL,
            confidence REAL NOT NULL,
            explanation TEXT NULL,
            weights_version INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_predictions_match ON predictions(match_id);

        CREATE TABLE IF NOT EXISTS backtest_records (
            league_id INTEGER NOT NULL,
            match_id INTEGER NOT NULL,
            match_date TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (league_id, match_id)
        );

        CREATE TABLE IF NOT EXISTS model_metrics (
            league_id INTEGER NOT NULL,
            subject TEXT NOT NULL,
            metric_type TEXT NOT NULL,
            metric_value REAL NOT NULL,
            sample_size INTEGER NOT NULL,
            period_start TEXT NOT NULL,
            period_end TEXT NOT NULL,
            calculated_at TEXT NOT NULL,
            UNIQUE(league_id, subject, metric_type, period_start, period_end)
        );
        "#,
    )
    .context("create sqlite schema")?;

    // Databases created before venue and sentiment were tracked.
    ensure_column(conn, "matches", "neutral", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(conn, "matches", "home_sentiment", "REAL NULL")?;
    ensure_column(conn, "matches", "away_sentiment", "REAL NULL")?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let present: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
            params![table, column],
            |row| row.get(0),
        )
        .with_context(|| format!("inspect {table}.{column}"))?;
    if !present {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))
            .with_context(|| format!("add {table}.{column}"))?;
    }
    Ok(())
}

pub fn upsert_matches(conn: &mut Connection, matches: &[MatchRecord]) -> Result<usize> {
    let tx = conn.transaction().context("begin match transaction")?;
    for m in matches {
        upsert_match(&tx, m)?;
    }
    tx.commit().context("commit match transaction")?;
    Ok(matches.len())
}

fn upsert_match(tx: &rusqlite::Transaction<'_>, m: &MatchRecord) -> Result<()> {
    let minutes = m
        .goal_minutes
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("serialize goal minutes")?;
    tx.execute(
        r#"
        INSERT INTO matches (
            match_id, league_id, match_date, home_team_id, away_team_id,
            home_team, away_team, home_goals, away_goals, goal_minutes_json,
            neutral, home_sentiment, away_sentiment, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(match_id) DO UPDATE SET
            league_id = excluded.league_id,
            match_date = excluded.match_date,
            home_team_id = excluded.home_team_id,
            away_team_id = excluded.away_team_id,
            home_team = excluded.home_team,
            away_team = excluded.away_team,
            home_goals = excluded.home_goals,
            away_goals = excluded.away_goals,
            goal_minutes_json = excluded.goal_minutes_json,
            neutral = excluded.neutral,
            home_sentiment = excluded.home_sentiment,
            away_sentiment = excluded.away_sentiment,
            updated_at = excluded.updated_at
        "#,
        params![
            m.match_id as i64,
            m.league_id as i64,
            m.date.format(DATE_FORMAT).to_string(),
            m.home_team_id as i64,
            m.away_team_id as i64,
            m.home_team,
            m.away_team,
            m.home_goals.map(i64::from),
            m.away_goals.map(i64::from),
            minutes,
            m.neutral,
            m.home_sentiment,
            m.away_sentiment,
            Utc::now().to_rfc3339(),
        ],
    )
    .with_context(|| format!("upsert match {}", m.match_id))?;
    Ok(())
}

struct MatchRow {
    match_id: i64,
    league_id: i64,
    date: String,
    home_team_id: i64,
    away_team_id: i64,
    home_team: String,
    away_team: String,
    home_goals: Option<i64>,
    away_goals: Option<i64>,
    minutes: Option<String>,
    neutral: bool,
    home_sentiment: Option<f64>,
    away_sentiment: Option<f64>,
}

impl MatchRow {
    fn into_record(self) -> Result<MatchRecord> {
        let goal_minutes = self
            .minutes
            .as_deref()
            .map(serde_json::from_str::<GoalMinutes>)
            .transpose()
            .with_context(|| format!("decode goal minutes for match {}", self.match_id))?;
        Ok(MatchRecord {
            match_id: u64::try_from(self.match_id).context("negative match id")?,
            league_id: u32::try_from(self.league_id).context("league id out of range")?,
            date: parse_date(&self.date)?,
            home_team_id: u32::try_from(self.home_team_id).context("team id out of range")?,
            away_team_id: u32::try_from(self.away_team_id).context("team id out of range")?,
            home_team: self.home_team,
            away_team: self.away_team,
            home_goals: goals(self.home_goals)?,
            away_goals: goals(self.away_goals)?,
            goal_minutes,
            neutral: self.neutral,
            home_sentiment: self.home_sentiment,
            away_sentiment: self.away_sentiment,
        })
    }
}

fn goals(raw: Option<i64>) -> Result<Option<u8>> {
    raw.map(|g| u8::try_from(g).map_err(|_| anyhow!("goal count {g} out of range")))
        .transpose()
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).with_context(|| format!("parse date '{raw}'"))
}

/// All stored matches, optionally for one league, in date order.
pub fn load_matches(conn: &Connection, league_id: Option<LeagueId>) -> Result<Vec<MatchRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT
                match_id, league_id, match_date, home_team_id, away_team_id,
                home_team, away_team, home_goals, away_goals, goal_minutes_json,
                neutral, home_sentiment, away_sentiment
            FROM matches
            WHERE ?1 IS NULL OR league_id = ?1
            ORDER BY match_date ASC, match_id ASC
            "#,
        )
        .context("prepare load matches query")?;

    let rows = stmt
        .query_map(params![league_id.map(i64::from)], |row| {
            Ok(MatchRow {
                match_id: row.get(0)?,
                league_id: row.get(1)?,
                date: row.get(2)?,
                home_team_id: row.get(3)?,
                away_team_id: row.get(4)?,
                home_team: row.get(5)?,
                away_team: row.get(6)?,
                home_goals: row.get(7)?,
                away_goals: row.get(8)?,
                minutes: row.get(9)?,
                neutral: row.get(10)?,
                home_sentiment: row.get(11)?,
                away_sentiment: row.get(12)?,
            })
        })
        .context("query load matches")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode match row")?.into_record()?);
    }
    Ok(out)
}

pub fn load_backtest_records(conn: &Connection, league_id: LeagueId) -> Result<Vec<BacktestRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT payload_json FROM backtest_records WHERE league_id = ?1 ORDER BY match_date ASC, match_id ASC",
        )
        .context("prepare load backtest records")?;
    let rows = stmt
        .query_map(params![league_id as i64], |row| row.get::<_, String>(0))
        .context("query backtest records")?;

    let mut out = Vec::new();
    for row in rows {
        let payload = row.context("decode backtest row")?;
        out.push(serde_json::from_str(&payload).context("parse backtest record payload")?);
    }
    Ok(out)
}

pub fn stored_metric(
    conn: &Connection,
    league_id: LeagueId,
    subject: &str,
    metric_type: &str,
) -> Result<Option<(f64, usize)>> {
    conn.query_row(
        "SELECT metric_value, sample_size FROM model_metrics
         WHERE league_id = ?1 AND subject = ?2 AND metric_type = ?3
         ORDER BY calculated_at DESC LIMIT 1",
        params![league_id as i64, subject, metric_type],
        |row| Ok((row.get::<_, f64>(0)?, row.get::<_, i64>(1)? as usize)),
    )
    .optional()
    .context("query stored metric")
}

/// [`PersistenceSink`] over a single SQLite connection.
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut conn)
    }
}

impl PersistenceSink for SqliteSink {
    fn save(&self, item: Persisted<'_>) -> Result<()> {
        self.with_connection(|conn| match item {
            Persisted::Prediction(p) => save_prediction(conn, p),
            Persisted::BacktestRecord { league_id, record } => {
                let payload = serde_json::to_string(record).context("serialize backtest record")?;
                conn.execute(
                    "INSERT OR REPLACE INTO backtest_records(league_id, match_id, match_date, payload_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        league_id as i64,
                        record.match_id as i64,
                        record.date.format(DATE_FORMAT).to_string(),
                        payload,
                        Utc::now().to_rfc3339(),
                    ],
                )
                .context("insert backtest record")?;
                Ok(())
            }
            Persisted::Metric { league_id, metric } => {
                conn.execute(
                    "INSERT OR REPLACE INTO model_metrics(
                        league_id, subject, metric_type, metric_value, sample_size,
                        period_start, period_end, calculated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        league_id as i64,
                        metric.subject.to_string(),
                        metric.kind.as_str(),
                        metric.value,
                        metric.sample_size as i64,
                        metric.period_start.format(DATE_FORMAT).to_string(),
                        metric.period_end.format(DATE_FORMAT).to_string(),
                        Utc::now().to_rfc3339(),
                    ],
                )
                .context("upsert metric")?;
                Ok(())
            }
        })
    }
}

fn save_prediction(conn: &mut Connection, p: &EnsemblePrediction) -> Result<()> {
    let tx = conn.transaction().context("begin prediction transaction")?;
    let created_at = Utc::now().to_rfc3339();
    let insert = |model_type: &str,
                  probs: &crate::calibration::Prob3,
                  score: String,
                  explanation: Option<&str>|
     -> Result<()> {
        tx.execute(
            "INSERT INTO predictions(
                match_id, model_type, home_probability, draw_probability, away_probability,
                predicted_score, confidence, explanation, weights_version, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                p.match_id as i64,
                model_type,
                probs.home,
                probs.draw,
                probs.away,
                score,
                probs.max(),
                explanation,
                p.weights_version as i64,
                created_at,
            ],
        )
        .with_context(|| format!("insert {model_type} prediction"))?;
        Ok(())
    };

    for m in &p.models {
        insert(m.model.as_str(), &m.probs, m.predicted_score.to_string(), None)?;
    }
    insert(
        "ensemble",
        &p.probs,
        p.predicted_score.to_string(),
        p.explanation.as_deref(),
    )?;
    tx.commit().context("commit prediction transaction")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, day: u32, goals: Option<(u8, u8)>) -> MatchRecord {
        MatchRecord {
            match_id: id,
            league_id: 3,
            date: NaiveDate::from_ymd_opt(2022, 9, day).expect("valid date"),
            home_team_id: 10,
            away_team_id: 11,
            home_team: "North".to_string(),
            away_team: "South".to_string(),
            home_goals: goals.map(|g| g.0),
            away_goals: goals.map(|g| g.1),
            goal_minutes: goals.map(|_| GoalMinutes {
                home: vec![12, 77],
                away: vec![],
            }),
            neutral: false,
            home_sentiment: None,
            away_sentiment: None,
        }
    }

    #[test]
    fn upsert_then_load_keeps_latest_row() {
        let mut conn = open_in_memory().expect("db");
        upsert_matches(&mut conn, &[record(2, 9, None), record(1, 2, Some((2, 0)))]).expect("insert");
        upsert_matches(&mut conn, &[record(2, 9, Some((1, 1)))]).expect("update");

        let rows = load_matches(&conn, Some(3)).expect("load");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].match_id, 1);
        assert_eq!(rows[1].home_goals, Some(1));
        assert_eq!(rows[0].goal_minutes.as_ref().map(|m| m.home.clone()), Some(vec![12, 77]));
        assert!(load_matches(&conn, Some(4)).expect("load").is_empty());
        assert_eq!(load_matches(&conn, None).expect("load").len(), 2);
    }

    #[test]
    fn venue_and_sentiment_survive_storage() {
        let mut conn = open_in_memory().expect("db");
        let mut m = record(5, 4, None);
        m.neutral = true;
        m.home_sentiment = Some(0.65);
        upsert_matches(&mut conn, &[m.clone()]).expect("insert");

        let rows = load_matches(&conn, Some(3)).expect("load");
        assert_eq!(rows, vec![m]);
    }

    #[test]
    fn schema_upgrade_adds_missing_columns() {
        let conn = Connection::open_in_memory().expect("db");
        conn.execute_batch(
            "CREATE TABLE matches (
                match_id INTEGER PRIMARY KEY, league_id INTEGER NOT NULL, match_date TEXT NOT NULL,
                home_team_id INTEGER NOT NULL, away_team_id INTEGER NOT NULL,
                home_team TEXT NOT NULL, away_team TEXT NOT NULL,
                home_goals INTEGER NULL, away_goals INTEGER NULL,
                goal_minutes_json TEXT NULL, updated_at TEXT NOT NULL
            );
            INSERT INTO matches VALUES (1, 3, '2022-09-01', 10, 11, 'North', 'South', 2, 1, NULL, '');",
        )
        .expect("legacy table");
        init_schema(&conn).expect("upgrade");
        init_schema(&conn).expect("idempotent");

        let rows = load_matches(&conn, Some(3)).expect("load");
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].neutral);
        assert_eq!(rows[0].home_sentiment, None);
    }
}
