use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calibration::{Outcome, Prob3, evaluate_probs};
use crate::error::PredictError;
use crate::history::{LeagueId, MatchId, MatchRecord, Score, TeamId};
use crate::models::{ModelKind, ModelPrediction};
use crate::pipeline::PredictionPipeline;
use crate::providers::{PersistenceSink, Persisted, ResultProvider};

/// What a metric or calibration curve is about: one model or the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Model(ModelKind),
    Ensemble,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Model(kind) => kind.fmt(f),
            Subject::Ensemble => f.write_str("ensemble"),
        }
    }
}

impl FromStr for Subject {
    type Err = PredictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("ensemble") {
            Ok(Subject::Ensemble)
        } else {
            s.parse().map(Subject::Model)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Accuracy,
    LogLoss,
    Brier,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [MetricKind::Accuracy, MetricKind::LogLoss, MetricKind::Brier];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Accuracy => "accuracy",
            MetricKind::LogLoss => "log_loss",
            MetricKind::Brier => "brier",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub subject: Subject,
    pub kind: MetricKind,
    pub value: f64,
    pub sample_size: usize,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

/// One replayed match. Predictions only ever saw data from before `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRecord {
    pub match_id: MatchId,
    pub date: NaiveDate,
    pub home_team_id: TeamId,
    pub away_team_id: TeamId,
    pub models: Vec<ModelPrediction>,
    pub ensemble: Prob3,
    /// `ensemble` before logit scaling; scaling is fitted against this.
    pub mixture: Prob3,
    pub ensemble_score: Score,
    pub actual: Outcome,
    pub actual_score: Score,
}

impl BacktestRecord {
    pub fn probs_for(&self, subject: Subject) -> Option<Prob3> {
        match subject {
            Subject::Ensemble => Some(self.ensemble),
            Subject::Model(kind) => self.models.iter().find(|p| p.model == kind).map(|p| p.probs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub league_id: LeagueId,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub records: Vec<BacktestRecord>,
    pub metrics: Vec<Metric>,
    /// Resolved matches that could not be predicted.
    pub skipped: usize,
}

impl BacktestReport {
    /// Rebuild a report from persisted records. `None` when there are none.
    pub fn from_records(league_id: LeagueId, mut records: Vec<BacktestRecord>) -> Option<Self> {
        records.sort_by(|a, b| a.date.cmp(&b.date).then(a.match_id.cmp(&b.match_id)));
        let start = records.first()?.date;
        let end = records.last()?.date;
        let subjects: Vec<Subject> = ModelKind::ALL
            .into_iter()
            .map(Subject::Model)
            .chain(std::iter::once(Subject::Ensemble))
            .collect();
        let metrics = summarize(&records, &subjects, start, end);
        Some(Self {
            league_id,
            start,
            end,
            records,
            metrics,
            skipped: 0,
        })
    }

    pub fn metric(&self, subject: Subject, kind: MetricKind) -> Option<&Metric> {
        self.metrics
            .iter()
            .find(|m| m.subject == subject && m.kind == kind)
    }

    pub fn subjects(&self) -> Vec<Subject> {
        let mut out: Vec<Subject> = self.metrics.iter().map(|m| m.subject).collect();
        out.sort();
        out.dedup();
        out
    }
}

/// Accuracy, log-loss and Brier for each subject that has at least one record.
pub fn summarize(
    records: &[BacktestRecord],
    subjects: &[Subject],
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> Vec<Metric> {
    let mut out = Vec::new();
    for subject in subjects {
        let (probs, outcomes): (Vec<Prob3>, Vec<Outcome>) = records
            .iter()
            .filter_map(|r| r.probs_for(*subject).map(|p| (p, r.actual)))
            .unzip();
        let Some(m) = evaluate_probs(&probs, &outcomes) else {
            continue;
        };
        for (kind, value) in [
            (MetricKind::Accuracy, m.accuracy),
            (MetricKind::LogLoss, m.log_loss),
            (MetricKind::Brier, m.brier),
        ] {
            out.push(Metric {
                subject: *subject,
                kind,
                value,
                sample_size: m.samples,
                period_start,
                period_end,
            });
        }
    }
    out
}

pub struct BacktestEngine {
    pipeline: Arc<PredictionPipeline>,
    results: Arc<dyn ResultProvider>,
    sink: Option<Arc<dyn PersistenceSink>>,
}

impl BacktestEngine {
    pub fn new(pipeline: Arc<PredictionPipeline>, results: Arc<dyn ResultProvider>) -> Self {
        Self {
            pipeline,
            results,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn run(
        &self,
        league_id: LeagueId,
        start: NaiveDate,
        end: NaiveDate,
        subset: Option<&[ModelKind]>,
    ) -> Result<BacktestReport, PredictError> {
        if start > end {
            return Err(PredictError::validation(format!(
                "backtest range starts {start} after it ends {end}"
            )));
        }
        self.pipeline.validate_subset(subset)?;

        let fixtures = self.results.resolved_matches(league_id, start, end)?;
        let replayed: Vec<Option<BacktestRecord>> = fixtures
            .par_iter()
            .map(|fixture| match self.replay(fixture, subset) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(match_id = fixture.match_id, %err, "skipping backtest match");
                    None
                }
            })
            .collect();

        let skipped = replayed.iter().filter(|r| r.is_none()).count();
        let records: Vec<BacktestRecord> = replayed.into_iter().flatten().collect();

        let models: Vec<ModelKind> = match subset {
            Some(kinds) => {
                let mut kinds = kinds.to_vec();
                kinds.sort();
                kinds
            }
            None => self.pipeline.model_kinds(),
        };
        let subjects: Vec<Subject> = models
            .into_iter()
            .map(Subject::Model)
            .chain(std::iter::once(Subject::Ensemble))
            .collect();
        let metrics = summarize(&records, &subjects, start, end);

        if let Some(sink) = &self.sink {
            for record in &records {
                if let Err(err) = sink.save(Persisted::BacktestRecord { league_id, record }) {
                    warn!(match_id = record.match_id, %err, "failed to persist backtest record");
                }
            }
            for metric in &metrics {
                if let Err(err) = sink.save(Persisted::Metric { league_id, metric }) {
                    warn!(subject = %metric.subject, %err, "failed to persist metric");
                }
            }
        }

        let ensemble_ll = metrics
            .iter()
            .find(|m| m.subject == Subject::Ensemble && m.kind == MetricKind::LogLoss)
            .map(|m| m.value);
        info!(
            league_id,
            %start,
            %end,
            records = records.len(),
            skipped,
            ensemble_log_loss = ensemble_ll.unwrap_or(f64::NAN),
            "backtest finished"
        );

        Ok(BacktestReport {
            league_id,
            start,
            end,
            records,
            metrics,
            skipped,
        })
    }

    fn replay(&self, fixture: &MatchRecord, subset: Option<&[ModelKind]>) -> Result<BacktestRecord, PredictError> {
        let prediction = self.pipeline.evaluate(fixture.match_id, fixture.date, subset)?;
        let (actual, actual_score) = self.results.get_actual_result(fixture.match_id)?;
        Ok(BacktestRecord {
            match_id: fixture.match_id,
            date: fixture.date,
            home_team_id: fixture.home_team_id,
            away_team_id: fixture.away_team_id,
            ensemble: prediction.probs,
            mixture: prediction.mixture,
            ensemble_score: prediction.predicted_score,
            models: prediction.models,
            actual,
            actual_score,
        })
    }
}
