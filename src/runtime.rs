use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::calibration::CalibrationAnalyzer;
use crate::config::Cli;
use crate::dataset::{self, SqliteSink};
use crate::ensemble::{WeightRegistry, load_weight_set};
use crate::explain::{TemplateExplainer, TimedExplainer};
use crate::features::FeatureVectorBuilder;
use crate::models::ModelConfig;
use crate::pipeline::PredictionPipeline;
use crate::providers::MatchStore;
use crate::service::ForecastService;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub weights_path: PathBuf,
    pub model: ModelConfig,
    pub buckets: usize,
    /// `None` disables explanations.
    pub explain_timeout: Option<Duration>,
}

impl Settings {
    pub fn from_cli(cli: &Cli, explain: bool) -> Self {
        Self {
            database_path: cli.database_path.clone(),
            weights_path: cli.weights_path.clone(),
            model: ModelConfig {
                min_history: cli.min_history,
                history_window: cli.history_window,
            },
            buckets: cli.buckets,
            explain_timeout: explain.then(|| Duration::from_millis(cli.explain_timeout_ms)),
        }
    }
}

/// Everything wired together over the SQLite store.
pub struct Runtime {
    pub service: ForecastService,
    pub store: Arc<MatchStore>,
    pub sink: Arc<SqliteSink>,
}

impl Runtime {
    pub fn open(settings: &Settings) -> Result<Self> {
        let conn = dataset::open_db(&settings.database_path)?;
        let matches = dataset::load_matches(&conn, None).context("load stored matches")?;
        info!(
            matches = matches.len(),
            db = %settings.database_path.display(),
            "loaded match store"
        );

        let builder = FeatureVectorBuilder::new(settings.model.history_window, settings.model.min_history);
        let store = Arc::new(MatchStore::new(matches, builder));

        let weights = load_weight_set(&settings.weights_path)?.unwrap_or_default();
        info!(version = weights.version, "loaded ensemble weights");
        let registry = Arc::new(WeightRegistry::new(weights));

        let sink = Arc::new(SqliteSink::new(conn));
        let mut pipeline = PredictionPipeline::new(store.clone(), store.clone(), registry, settings.model)
            .with_sink(sink.clone());
        if let Some(timeout) = settings.explain_timeout {
            pipeline = pipeline.with_explainer(TimedExplainer::new(Arc::new(TemplateExplainer), timeout));
        }

        let service = ForecastService::new(pipeline, store.clone(), CalibrationAnalyzer::new(settings.buckets))
            .with_sink(sink.clone())
            .with_weights_path(settings.weights_path.clone());

        Ok(Self {
            service,
            store,
            sink,
        })
    }
}
