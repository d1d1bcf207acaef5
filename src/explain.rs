use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::ensemble::EnsemblePrediction;

#[derive(Debug, Clone)]
pub struct ExplainRequest {
    pub home_team: String,
    pub away_team: String,
    pub prediction: EnsemblePrediction,
}

/// Natural-language commentary on a finished prediction.
pub trait Explainer: Send + Sync {
    fn explain(&self, request: &ExplainRequest) -> Result<String>;
}

pub fn template_explanation(request: &ExplainRequest) -> String {
    let home = if request.home_team.is_empty() { "Home" } else { &request.home_team };
    let away = if request.away_team.is_empty() { "Away" } else { &request.away_team };
    let p = &request.prediction;
    format!(
        "Our model predicts {home} vs {away} will end {}. The home team has a {:.0}% chance of winning, \
         with {:.0}% confidence based on recent form and statistics.",
        p.predicted_score,
        p.probs.home * 100.0,
        p.confidence * 100.0,
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateExplainer;

impl Explainer for TemplateExplainer {
    fn explain(&self, request: &ExplainRequest) -> Result<String> {
        Ok(template_explanation(request))
    }
}

/// Runs an explainer on its own thread and gives up after `timeout`; the
/// template text stands in for errors and timeouts.
#[derive(Clone)]
pub struct TimedExplainer {
    inner: Arc<dyn Explainer>,
    timeout: Duration,
}

impl TimedExplainer {
    pub fn new(inner: Arc<dyn Explainer>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn explain(&self, request: ExplainRequest) -> String {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let job = request.clone();
        thread::spawn(move || {
            let _ = tx.send(inner.explain(&job));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => {
                warn!(match_id = request.prediction.match_id, "empty explanation, using template");
                template_explanation(&request)
            }
            Ok(Err(err)) => {
                warn!(match_id = request.prediction.match_id, %err, "explainer failed, using template");
                template_explanation(&request)
            }
            Err(_) => {
                warn!(
                    match_id = request.prediction.match_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "explainer timed out, using template"
                );
                template_explanation(&request)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Prob3;
    use crate::history::Score;

    struct Slow;

    impl Explainer for Slow {
        fn explain(&self, _request: &ExplainRequest) -> Result<String> {
            thread::sleep(Duration::from_millis(500));
            Ok("late".to_string())
        }
    }

    struct Broken;

    impl Explainer for Broken {
        fn explain(&self, _request: &ExplainRequest) -> Result<String> {
            anyhow::bail!("provider offline")
        }
    }

    fn request() -> ExplainRequest {
        let probs = Prob3 {
            home: 0.52,
            draw: 0.26,
            away: 0.22,
        };
        ExplainRequest {
            home_team: "Lions".to_string(),
            away_team: "Hawks".to_string(),
            prediction: EnsemblePrediction {
                match_id: 11,
                probs,
                mixture: probs,
                predicted_score: Score::new(2, 1),
                confidence: probs.max(),
                expected_home_goals: 1.7,
                expected_away_goals: 1.0,
                weights: Vec::new(),
                models: Vec::new(),
                weights_version: 0,
                explanation: None,
            },
        }
    }

    #[test]
    fn template_mentions_score_and_chance() {
        let text = template_explanation(&request());
        assert_eq!(
            text,
            "Our model predicts Lions vs Hawks will end 2-1. The home team has a 52% chance of winning, \
             with 52% confidence based on recent form and statistics."
        );
    }

    #[test]
    fn timeout_falls_back_to_template() {
        let timed = TimedExplainer::new(Arc::new(Slow), Duration::from_millis(20));
        assert_eq!(timed.explain(request()), template_explanation(&request()));
    }

    #[test]
    fn error_falls_back_to_template() {
        let timed = TimedExplainer::new(Arc::new(Broken), Duration::from_millis(500));
        assert_eq!(timed.explain(request()), template_explanation(&request()));
    }
}
