use chrono::NaiveDate;
use thiserror::Error;

use crate::history::MatchId;

/// Failure local to one goal model's fit. Never crosses the pipeline boundary:
/// the model either recovers with a fallback estimate or is excluded.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("insufficient history: needed {needed} matches, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("numerical instability: {0}")]
    NumericalInstability(String),
}

/// Failure reported by an external collaborator (feature, history or result source).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("record {match_id} dated {date} is not before cutoff {cutoff}")]
    Leakage {
        match_id: MatchId,
        date: NaiveDate,
        cutoff: NaiveDate,
    },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PredictError {
    #[error("external service failed: {0}")]
    ExternalService(#[from] ProviderError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("every model was excluded for match {match_id}")]
    EnsembleEmpty { match_id: MatchId },
}

impl PredictError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
