use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

/// Football match outcome forecasting and backtesting
#[derive(Parser, Debug, Clone)]
#[command(name = "goalcast", version, about)]
pub struct Cli {
    /// SQLite database path
    #[arg(long, global = true, env = "GOALCAST_DB", default_value = "goalcast.sqlite")]
    pub database_path: PathBuf,

    /// Ensemble weight snapshot (JSON)
    #[arg(long, global = true, env = "GOALCAST_WEIGHTS", default_value = "weights.json")]
    pub weights_path: PathBuf,

    /// Give up on the explainer after this many milliseconds
    #[arg(long, global = true, env = "GOALCAST_EXPLAIN_TIMEOUT_MS", default_value = "2000")]
    pub explain_timeout_ms: u64,

    /// Matches a team needs before models trust its own history
    #[arg(long, global = true, env = "GOALCAST_MIN_HISTORY", default_value = "5")]
    pub min_history: usize,

    /// Most recent matches per team used for fitting
    #[arg(long, global = true, env = "GOALCAST_HISTORY_WINDOW", default_value = "20")]
    pub history_window: usize,

    /// Calibration buckets over [0, 1]
    #[arg(long, global = true, env = "GOALCAST_BUCKETS", default_value = "10")]
    pub buckets: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate synthetic leagues into the database
    Seed {
        #[arg(long, value_delimiter = ',', default_value = "1")]
        leagues: Vec<u32>,
        #[arg(long, default_value = "20")]
        teams: usize,
        #[arg(long, default_value = "3")]
        seasons: usize,
        #[arg(long, default_value = "2021-08-01")]
        start: NaiveDate,
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Trailing rounds left without a result
        #[arg(long, default_value = "1")]
        unresolved_rounds: usize,
    },
    /// Import matches from a JSON array of match records (venue and sentiment optional)
    Import { path: PathBuf },
    /// Predict one match
    Predict {
        match_id: u64,
        /// Defaults to the match date
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Attach a template explanation
        #[arg(long)]
        explain: bool,
    },
    /// Predict every unresolved fixture of a league
    Batch {
        league_id: u32,
        /// Defaults to the earliest unresolved fixture date
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Replay a league over a date range
    Backtest {
        league_id: u32,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Comma separated model identifiers, e.g. poisson,hmm
        #[arg(long)]
        models: Option<String>,
        /// Write records, metrics and calibration to an .xlsx file
        #[arg(long)]
        export: Option<PathBuf>,
        /// Derive and publish weights from this run
        #[arg(long)]
        publish_weights: bool,
        /// Fit and publish ensemble logit scaling from this run
        #[arg(long)]
        fit_scaling: bool,
    },
    /// Calibration curve from stored backtest records
    Calibrate {
        league_id: u32,
        /// Model identifier or `ensemble`
        #[arg(long, default_value = "ensemble")]
        subject: String,
    },
    /// Show the current weights, or derive them from stored backtest records
    Weights {
        #[arg(long)]
        derive_from_league: Option<u32>,
    },
}

impl Cli {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.history_window == 0 {
            anyhow::bail!("history_window must be positive");
        }
        if self.buckets == 0 {
            anyhow::bail!("buckets must be positive");
        }
        if self.min_history > self.history_window {
            anyhow::bail!("min_history must not exceed history_window");
        }
        if let Command::Seed { teams, seasons, .. } = &self.command {
            if *teams < 2 {
                anyhow::bail!("a league needs at least two teams");
            }
            if *seasons == 0 {
                anyhow::bail!("seasons must be positive");
            }
        }
        if let Command::Backtest { start, end, .. } = &self.command {
            if start > end {
                anyhow::bail!("backtest start {start} is after end {end}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backtest_with_globals() {
        let cli = Cli::try_parse_from([
            "goalcast",
            "--buckets",
            "5",
            "backtest",
            "3",
            "--start",
            "2022-01-01",
            "--end",
            "2022-06-30",
            "--models",
            "poisson,hawkes",
        ])
        .expect("parse");
        assert_eq!(cli.buckets, 5);
        assert!(cli.validate().is_ok());
        match cli.command {
            Command::Backtest { league_id, models, .. } => {
                assert_eq!(league_id, 3);
                assert_eq!(models.as_deref(), Some("poisson,hawkes"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_inverted_range() {
        let cli = Cli::try_parse_from([
            "goalcast",
            "backtest",
            "3",
            "--start",
            "2022-06-30",
            "--end",
            "2022-01-01",
        ])
        .expect("parse");
        assert!(cli.validate().is_err());
    }
}
