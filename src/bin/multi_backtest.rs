use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use goalcast::backtest::{MetricKind, Subject};
use goalcast::models::ModelConfig;
use goalcast::runtime::{Runtime, Settings};

const MIN_SAMPLES: usize = 8;

/// Replay every stored league over its full date range and compare subjects.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "GOALCAST_DB", default_value = "goalcast.sqlite")]
    database_path: PathBuf,
    #[arg(long, env = "GOALCAST_WEIGHTS", default_value = "weights.json")]
    weights_path: PathBuf,
    /// Only these leagues (comma separated); defaults to all stored leagues
    #[arg(long, value_delimiter = ',')]
    leagues: Vec<u32>,
    #[arg(long, env = "GOALCAST_BUCKETS", default_value = "10")]
    buckets: usize,
}

#[derive(Debug, Clone)]
struct LeagueReport {
    league_id: u32,
    samples: usize,
    log_loss: f64,
    brier: f64,
    accuracy: f64,
    ece: f64,
    best_model: Option<(Subject, f64)>,
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    if args.buckets == 0 {
        return Err(anyhow!("buckets must be positive"));
    }
    let rt = Runtime::open(&Settings {
        database_path: args.database_path.clone(),
        weights_path: args.weights_path.clone(),
        model: ModelConfig::default(),
        buckets: args.buckets,
        explain_timeout: None,
    })?;

    let league_ids = if args.leagues.is_empty() {
        rt.store.league_ids()
    } else {
        args.leagues.clone()
    };
    if league_ids.is_empty() {
        return Err(anyhow!("no league ids resolved"));
    }

    let mut reports = Vec::new();
    let mut missing = Vec::new();

    for league_id in &league_ids {
        let dates: Vec<_> = rt
            .store
            .matches()
            .iter()
            .filter(|m| m.league_id == *league_id && m.is_resolved())
            .map(|m| m.date)
            .collect();
        let (Some(start), Some(end)) = (dates.iter().min().copied(), dates.iter().max().copied()) else {
            missing.push(*league_id);
            continue;
        };

        let report = rt.service.run_backtest(*league_id, start, end, None)?;
        let ensemble = |kind| report.metric(Subject::Ensemble, kind);
        let (Some(ll), Some(brier), Some(acc)) = (
            ensemble(MetricKind::LogLoss),
            ensemble(MetricKind::Brier),
            ensemble(MetricKind::Accuracy),
        ) else {
            missing.push(*league_id);
            continue;
        };
        if ll.sample_size < MIN_SAMPLES {
            missing.push(*league_id);
            continue;
        }

        let best_model = report
            .metrics
            .iter()
            .filter(|m| m.kind == MetricKind::LogLoss && m.subject != Subject::Ensemble)
            .min_by(|a, b| a.value.total_cmp(&b.value))
            .map(|m| (m.subject, m.value));

        reports.push(LeagueReport {
            league_id: *league_id,
            samples: ll.sample_size,
            log_loss: ll.value,
            brier: brier.value,
            accuracy: acc.value,
            ece: rt.service.expected_calibration_error(Subject::Ensemble, *league_id)?,
            best_model,
        });
    }

    reports.sort_by_key(|r| r.league_id);

    println!("Multi-league ensemble backtest");
    println!("DB: {}", args.database_path.display());
    println!("Leagues: {:?}", league_ids);
    if !missing.is_empty() {
        println!("Skipped (insufficient data): {:?}", missing);
    }
    println!();

    if reports.is_empty() {
        return Err(anyhow!("no league had enough samples to evaluate"));
    }

    for r in &reports {
        let best = match r.best_model {
            Some((subject, ll)) => format!("{subject}:{ll:.4}"),
            None => "-".to_string(),
        };
        println!(
            "league {} samples={} ll={:.4} brier={:.4} acc={:.4} ece={:.4} best_model={}",
            r.league_id, r.samples, r.log_loss, r.brier, r.accuracy, r.ece, best
        );
    }

    let total_samples: usize = reports.iter().map(|r| r.samples).sum();
    println!();
    println!(
        "aggregate samples={} ll={:.4} brier={:.4} acc={:.4} ece={:.4}",
        total_samples,
        weighted_mean(&reports, total_samples, |r| r.log_loss),
        weighted_mean(&reports, total_samples, |r| r.brier),
        weighted_mean(&reports, total_samples, |r| r.accuracy),
        weighted_mean(&reports, total_samples, |r| r.ece),
    );

    Ok(())
}

fn weighted_mean(reports: &[LeagueReport], total_samples: usize, value: impl Fn(&LeagueReport) -> f64) -> f64 {
    if total_samples == 0 {
        return 0.0;
    }
    reports
        .iter()
        .map(|r| value(r) * r.samples as f64)
        .sum::<f64>()
        / total_samples as f64
}
