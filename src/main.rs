use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use goalcast::backtest::{BacktestReport, MetricKind, Subject};
use goalcast::config::{Cli, Command};
use goalcast::dataset;
use goalcast::ensemble::{EnsemblePrediction, WeightSet};
use goalcast::history::{LeagueId, MatchRecord};
use goalcast::models::ModelKind;
use goalcast::report_export;
use goalcast::runtime::{Runtime, Settings};
use goalcast::synthetic::SyntheticLeague;

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    cli.validate()?;

    match cli.command.clone() {
        Command::Seed {
            leagues,
            teams,
            seasons,
            start,
            seed,
            unresolved_rounds,
        } => {
            let mut conn = dataset::open_db(&cli.database_path)?;
            for league_id in leagues {
                let matches = SyntheticLeague::new(league_id, teams, seasons, start, seed)
                    .with_unresolved_rounds(unresolved_rounds)
                    .generate()?;
                let written = dataset::upsert_matches(&mut conn, &matches)?;
                println!("league {league_id}: stored {written} matches");
            }
        }
        Command::Import { path } => {
            let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let matches: Vec<MatchRecord> = serde_json::from_str(&raw).context("parse match records")?;
            let mut conn = dataset::open_db(&cli.database_path)?;
            let written = dataset::upsert_matches(&mut conn, &matches)?;
            println!("imported {written} matches from {}", path.display());
        }
        Command::Predict {
            match_id,
            as_of,
            explain,
        } => {
            let rt = Runtime::open(&Settings::from_cli(&cli, explain))?;
            let fixture = rt
                .store
                .get(match_id)
                .ok_or_else(|| anyhow!("unknown match {match_id}"))?;
            let as_of = as_of.unwrap_or(fixture.date);
            let prediction = rt.service.predict_match(match_id, as_of)?;
            print_prediction(fixture, &prediction);
        }
        Command::Batch { league_id, as_of } => {
            let rt = Runtime::open(&Settings::from_cli(&cli, false))?;
            let upcoming: Vec<MatchRecord> = rt.store.upcoming(league_id).into_iter().cloned().collect();
            let Some(first) = upcoming.first() else {
                println!("league {league_id}: no unresolved fixtures");
                return Ok(());
            };
            let as_of = as_of.unwrap_or(first.date);
            let ids: Vec<u64> = upcoming.iter().map(|m| m.match_id).collect();
            let results = rt.service.predict_batch(&ids, as_of);
            for (fixture, result) in upcoming.iter().zip(results) {
                match result {
                    Ok(prediction) => print_prediction(fixture, &prediction),
                    Err(err) => println!("match {} failed: {err}", fixture.match_id),
                }
            }
        }
        Command::Backtest {
            league_id,
            start,
            end,
            models,
            export,
            publish_weights,
            fit_scaling,
        } => {
            let rt = Runtime::open(&Settings::from_cli(&cli, false))?;
            let subset = models.as_deref().map(ModelKind::parse_list).transpose()?;
            let report = rt.service.run_backtest(league_id, start, end, subset.as_deref())?;
            print_report(&report);

            if let Some(path) = export {
                let curves: Vec<_> = report
                    .subjects()
                    .into_iter()
                    .filter_map(|s| rt.service.get_calibration(s, league_id).ok().map(|c| (s, c)))
                    .collect();
                let summary = report_export::export_backtest(&path, &report, &curves)?;
                println!(
                    "exported {} records, {} metrics, {} buckets to {}",
                    summary.records,
                    summary.metrics,
                    summary.buckets,
                    path.display()
                );
            }
            if publish_weights {
                rt.service.derive_and_publish_weights(&report.records)?;
                print_weights(&rt.service.current_weights());
            }
            if fit_scaling {
                match rt.service.calibrate_scaling(&report.records)? {
                    Some((scaling, metrics)) => println!(
                        "scaling fit=({:.2},{:+.2}) ll={:.4} brier={:.4}",
                        scaling.logit_scale, scaling.draw_bias, metrics.log_loss, metrics.brier
                    ),
                    None => println!("no records to fit scaling on"),
                }
            }
        }
        Command::Calibrate { league_id, subject } => {
            let subject: Subject = subject.parse()?;
            let rt = Runtime::open(&Settings::from_cli(&cli, false))?;
            load_stored_report(&rt, league_id)?;
            let buckets = rt.service.get_calibration(subject, league_id)?;
            let ece = rt.service.expected_calibration_error(subject, league_id)?;
            println!("calibration league {league_id} subject {subject}");
            for b in &buckets {
                println!(
                    "[{:.2}, {:.2}) count={} confidence={:.4} accuracy={:.4}",
                    b.bucket_start, b.bucket_end, b.count, b.mean_confidence, b.accuracy
                );
            }
            println!("ece={ece:.4}");
            for kind in MetricKind::ALL {
                let stored = rt.sink.with_connection(|conn| {
                    dataset::stored_metric(conn, league_id, &subject.to_string(), kind.as_str())
                })?;
                if let Some((value, samples)) = stored {
                    println!("stored {}={value:.4} n={samples}", kind.as_str());
                }
            }
        }
        Command::Weights { derive_from_league } => {
            let rt = Runtime::open(&Settings::from_cli(&cli, false))?;
            if let Some(league_id) = derive_from_league {
                let report = load_stored_report(&rt, league_id)?;
                rt.service.derive_and_publish_weights(&report.records)?;
            }
            print_weights(&rt.service.current_weights());
        }
    }

    Ok(())
}

fn load_stored_report(rt: &Runtime, league_id: LeagueId) -> Result<Arc<BacktestReport>> {
    let records = rt
        .sink
        .with_connection(|conn| dataset::load_backtest_records(conn, league_id))?;
    let report = BacktestReport::from_records(league_id, records)
        .ok_or_else(|| anyhow!("no stored backtest records for league {league_id}; run a backtest first"))?;
    info!(league_id, records = report.records.len(), "reloaded stored backtest");
    let report = Arc::new(report);
    rt.service.remember(Arc::clone(&report));
    Ok(report)
}

fn print_prediction(fixture: &MatchRecord, p: &EnsemblePrediction) {
    println!(
        "{} {} vs {} home={:.1}% draw={:.1}% away={:.1}% score={} confidence={:.1}% xg=({:.2},{:.2})",
        fixture.match_id,
        fixture.home_team,
        fixture.away_team,
        p.probs.home * 100.0,
        p.probs.draw * 100.0,
        p.probs.away * 100.0,
        p.predicted_score,
        p.confidence * 100.0,
        p.expected_home_goals,
        p.expected_away_goals,
    );
    for m in &p.models {
        println!(
            "  {:<17} home={:.1}% draw={:.1}% away={:.1}% score={}{}",
            m.model.as_str(),
            m.probs.home * 100.0,
            m.probs.draw * 100.0,
            m.probs.away * 100.0,
            m.predicted_score,
            if m.used_fallback { " (league prior)" } else { "" },
        );
    }
    if let Some(text) = &p.explanation {
        println!("  {text}");
    }
}

fn print_report(report: &BacktestReport) {
    println!(
        "Backtest league {} {}..{} records={} skipped={}",
        report.league_id,
        report.start,
        report.end,
        report.records.len(),
        report.skipped
    );
    for subject in report.subjects() {
        let value = |kind| report.metric(subject, kind).map(|m| m.value).unwrap_or(f64::NAN);
        println!(
            "{:<17} acc={:.4} ll={:.4} brier={:.4}",
            subject.to_string(),
            value(MetricKind::Accuracy),
            value(MetricKind::LogLoss),
            value(MetricKind::Brier),
        );
    }
}

fn print_weights(set: &WeightSet) {
    println!("weights v{}", set.version);
    for w in &set.weights {
        println!("  {:<17} {:.4}", w.model.as_str(), w.weight);
    }
    if !set.scaling.is_identity() {
        println!(
            "  scaling=({:.2},{:+.2})",
            set.scaling.logit_scale, set.scaling.draw_bias
        );
    }
}
