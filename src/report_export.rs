use std::path::Path;

use anyhow::{Context, Result};
use rust_xlsxwriter::{Workbook, Worksheet};

use crate::backtest::{BacktestReport, Subject};
use crate::calibration::{CalibrationBucket, Outcome};
use crate::models::ModelKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub records: usize,
    pub metrics: usize,
    pub buckets: usize,
}

fn outcome_label(o: Outcome) -> &'static str {
    match o {
        Outcome::Home => "H",
        Outcome::Draw => "D",
        Outcome::Away => "A",
    }
}

fn pct(p: f64) -> String {
    format!("{:.1}", p * 100.0)
}

fn record_rows(report: &BacktestReport) -> Vec<Vec<String>> {
    let mut header = vec![
        "match_id".to_string(),
        "date".to_string(),
        "home_team_id".to_string(),
        "away_team_id".to_string(),
        "actual".to_string(),
        "actual_score".to_string(),
        "ens_home_pct".to_string(),
        "ens_draw_pct".to_string(),
        "ens_away_pct".to_string(),
        "ens_score".to_string(),
    ];
    for kind in ModelKind::ALL {
        header.push(format!("{kind}_home_pct"));
        header.push(format!("{kind}_draw_pct"));
        header.push(format!("{kind}_away_pct"));
    }

    let mut rows = vec![header];
    for r in &report.records {
        let mut row = vec![
            r.match_id.to_string(),
            r.date.to_string(),
            r.home_team_id.to_string(),
            r.away_team_id.to_string(),
            outcome_label(r.actual).to_string(),
            r.actual_score.to_string(),
            pct(r.ensemble.home),
            pct(r.ensemble.draw),
            pct(r.ensemble.away),
            r.ensemble_score.to_string(),
        ];
        for kind in ModelKind::ALL {
            match r.probs_for(Subject::Model(kind)) {
                Some(p) => row.extend([pct(p.home), pct(p.draw), pct(p.away)]),
                None => row.extend([String::new(), String::new(), String::new()]),
            }
        }
        rows.push(row);
    }
    rows
}

fn metric_rows(report: &BacktestReport) -> Vec<Vec<String>> {
    let mut rows = vec![vec![
        "subject".to_string(),
        "metric".to_string(),
        "value".to_string(),
        "sample_size".to_string(),
        "period_start".to_string(),
        "period_end".to_string(),
    ]];
    for m in &report.metrics {
        rows.push(vec![
            m.subject.to_string(),
            m.kind.as_str().to_string(),
            format!("{:.6}", m.value),
            m.sample_size.to_string(),
            m.period_start.to_string(),
            m.period_end.to_string(),
        ]);
    }
    rows
}

fn calibration_rows(curves: &[(Subject, Vec<CalibrationBucket>)]) -> Vec<Vec<String>> {
    let mut rows = vec![vec![
        "subject".to_string(),
        "bucket_start".to_string(),
        "bucket_end".to_string(),
        "count".to_string(),
        "mean_confidence".to_string(),
        "accuracy".to_string(),
    ]];
    for (subject, buckets) in curves {
        for b in buckets {
            rows.push(vec![
                subject.to_string(),
                format!("{:.2}", b.bucket_start),
                format!("{:.2}", b.bucket_end),
                b.count.to_string(),
                format!("{:.4}", b.mean_confidence),
                format!("{:.4}", b.accuracy),
            ]);
        }
    }
    rows
}

pub fn export_backtest(
    path: &Path,
    report: &BacktestReport,
    curves: &[(Subject, Vec<CalibrationBucket>)],
) -> Result<ExportSummary> {
    let records = record_rows(report);
    let metrics = metric_rows(report);
    let calibration = calibration_rows(curves);

    let mut workbook = Workbook::new();
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Records")?;
        write_rows(sheet, &records)?;
    }
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Metrics")?;
        write_rows(sheet, &metrics)?;
    }
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Calibration")?;
        write_rows(sheet, &calibration)?;
    }

    workbook
        .save(path)
        .with_context(|| format!("failed writing workbook to {}", path.display()))?;

    Ok(ExportSummary {
        records: records.len().saturating_sub(1),
        metrics: metrics.len().saturating_sub(1),
        buckets: calibration.len().saturating_sub(1),
    })
}

fn write_rows(worksheet: &mut Worksheet, rows: &[Vec<String>]) -> Result<()> {
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, value) in row.iter().enumerate() {
            worksheet
                .write_string(row_idx as u32, col_idx as u16, value)
                .with_context(|| format!("write cell ({row_idx},{col_idx})"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{BacktestRecord, Metric, MetricKind};
    use crate::calibration::Prob3;
    use crate::history::Score;
    use chrono::NaiveDate;

    #[test]
    fn record_rows_leave_missing_models_blank() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 4).expect("valid date");
        let probs = Prob3 {
            home: 0.5,
            draw: 0.3,
            away: 0.2,
        };
        let report = BacktestReport {
            league_id: 1,
            start: date,
            end: date,
            records: vec![BacktestRecord {
                match_id: 5,
                date,
                home_team_id: 1,
                away_team_id: 2,
                models: Vec::new(),
                ensemble: probs,
                mixture: probs,
                ensemble_score: Score::new(1, 0),
                actual: Outcome::Draw,
                actual_score: Score::new(2, 2),
            }],
            metrics: vec![Metric {
                subject: Subject::Ensemble,
                kind: MetricKind::Brier,
                value: 0.2,
                sample_size: 1,
                period_start: date,
                period_end: date,
            }],
            skipped: 0,
        };
        let rows = record_rows(&report);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), rows[1].len());
        assert_eq!(rows[1][4], "D");
        assert_eq!(rows[1][6], "50.0");
        assert!(rows[1][10].is_empty());
        assert_eq!(metric_rows(&report)[1][1], "brier");
    }
}
