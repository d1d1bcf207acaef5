use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::backtest::{BacktestEngine, BacktestRecord, BacktestReport, Subject};
use crate::calibration::{CalibrationAnalyzer, CalibrationBucket, LogitScaling, Metrics};
use crate::ensemble::{EnsemblePrediction, ModelWeight, WeightRegistry, WeightSet, save_weight_set};
use crate::error::{PredictError, ProviderError};
use crate::history::{LeagueId, MatchId};
use crate::models::ModelKind;
use crate::pipeline::PredictionPipeline;
use crate::providers::{PersistenceSink, ResultProvider};

/// The operations the outside world calls. Keeps the latest backtest per
/// league so calibration curves can be served without replaying.
pub struct ForecastService {
    pipeline: Arc<PredictionPipeline>,
    backtest: BacktestEngine,
    analyzer: CalibrationAnalyzer,
    weights: Arc<WeightRegistry>,
    weights_path: Option<PathBuf>,
    reports: RwLock<HashMap<LeagueId, Arc<BacktestReport>>>,
}

impl ForecastService {
    pub fn new(
        pipeline: PredictionPipeline,
        results: Arc<dyn ResultProvider>,
        analyzer: CalibrationAnalyzer,
    ) -> Self {
        let weights = Arc::clone(pipeline.weights());
        let pipeline = Arc::new(pipeline);
        Self {
            backtest: BacktestEngine::new(Arc::clone(&pipeline), results),
            pipeline,
            analyzer,
            weights,
            weights_path: None,
            reports: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.backtest = self.backtest.with_sink(sink);
        self
    }

    /// Published snapshots are also written here.
    pub fn with_weights_path(mut self, path: PathBuf) -> Self {
        self.weights_path = Some(path);
        self
    }

    pub fn current_weights(&self) -> Arc<WeightSet> {
        self.weights.current()
    }

    pub fn predict_match(&self, match_id: MatchId, as_of: NaiveDate) -> Result<EnsemblePrediction, PredictError> {
        self.pipeline.predict_match(match_id, as_of)
    }

    pub fn predict_batch(
        &self,
        match_ids: &[MatchId],
        as_of: NaiveDate,
    ) -> Vec<Result<EnsemblePrediction, PredictError>> {
        self.pipeline.predict_batch(match_ids, as_of)
    }

    pub fn run_backtest(
        &self,
        league_id: LeagueId,
        start: NaiveDate,
        end: NaiveDate,
        subset: Option<&[ModelKind]>,
    ) -> Result<Arc<BacktestReport>, PredictError> {
        let report = Arc::new(self.backtest.run(league_id, start, end, subset)?);
        self.remember(Arc::clone(&report));
        Ok(report)
    }

    /// Install a report that was produced elsewhere, e.g. reloaded from storage.
    pub fn remember(&self, report: Arc<BacktestReport>) {
        let mut reports = self.reports.write().unwrap_or_else(|e| e.into_inner());
        reports.insert(report.league_id, report);
    }

    pub fn latest_report(&self, league_id: LeagueId) -> Option<Arc<BacktestReport>> {
        let reports = self.reports.read().unwrap_or_else(|e| e.into_inner());
        reports.get(&league_id).cloned()
    }

    pub fn get_calibration(
        &self,
        subject: Subject,
        league_id: LeagueId,
    ) -> Result<Vec<CalibrationBucket>, PredictError> {
        let report = self.require_report(league_id)?;
        Ok(self.analyzer.calibrate(&report.records, subject))
    }

    pub fn expected_calibration_error(&self, subject: Subject, league_id: LeagueId) -> Result<f64, PredictError> {
        let report = self.require_report(league_id)?;
        Ok(self.analyzer.expected_calibration_error(&report.records, subject))
    }

    /// Derive inverse log-loss weights and publish them as a new snapshot.
    pub fn derive_and_publish_weights(&self, records: &[BacktestRecord]) -> Result<Vec<ModelWeight>, PredictError> {
        let derived = self.analyzer.derive_weights(records);
        let published = self.weights.publish(derived)?;
        self.persist(&published);
        for w in &published.weights {
            info!(model = %w.model, weight = w.weight, "ensemble weight");
        }
        Ok(published.weights.clone())
    }

    /// Fit logit scaling on the records' unscaled mixtures and publish it in
    /// place of the current one. The returned metrics are those the next
    /// backtest over the same records will report. `None` when there are no
    /// records to fit on.
    pub fn calibrate_scaling(
        &self,
        records: &[BacktestRecord],
    ) -> Result<Option<(LogitScaling, Metrics)>, PredictError> {
        let Some((scaling, metrics)) = self.analyzer.fit_ensemble_scaling(records) else {
            return Ok(None);
        };
        let published = self.weights.publish_scaling(scaling)?;
        self.persist(&published);
        info!(
            logit_scale = scaling.logit_scale,
            draw_bias = scaling.draw_bias,
            log_loss = metrics.log_loss,
            "published logit scaling"
        );
        Ok(Some((scaling, metrics)))
    }

    fn require_report(&self, league_id: LeagueId) -> Result<Arc<BacktestReport>, PredictError> {
        self.latest_report(league_id).ok_or_else(|| {
            PredictError::ExternalService(ProviderError::DataUnavailable(format!(
                "no backtest has been run for league {league_id}"
            )))
        })
    }

    fn persist(&self, set: &WeightSet) {
        let Some(path) = &self.weights_path else {
            return;
        };
        if let Err(err) = save_weight_set(path, set) {
            warn!(path = %path.display(), %err, "failed to save weight snapshot");
        }
    }
}
