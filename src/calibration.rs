use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backtest::{BacktestRecord, Subject};
use crate::ensemble::ModelWeight;
use crate::models::ModelKind;

/// Probability floor used when scoring log-loss.
pub const LOG_LOSS_FLOOR: f64 = 1e-9;
pub const DEFAULT_BUCKETS: usize = 10;
/// Range `apply_logit_scaling` accepts for the temperature.
pub const LOGIT_SCALE_RANGE: (f64, f64) = (0.50, 1.80);
pub const DRAW_BIAS_LIMIT: f64 = 0.60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Home,
    Draw,
    Away,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prob3 {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBucket {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub mean_confidence: f64,
    pub accuracy: f64,
}

/// Temperature and draw-bias applied to ensemble log-odds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogitScaling {
    pub logit_scale: f64,
    pub draw_bias: f64,
}

impl Default for LogitScaling {
    fn default() -> Self {
        Self::identity()
    }
}

impl LogitScaling {
    pub fn identity() -> Self {
        Self {
            logit_scale: 1.0,
            draw_bias: 0.0,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.logit_scale == 1.0 && self.draw_bias == 0.0
    }
}

impl Prob3 {
    pub fn uniform() -> Self {
        Self {
            home: 1.0 / 3.0,
            draw: 1.0 / 3.0,
            away: 1.0 / 3.0,
        }
    }

    pub fn get(&self, outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Home => self.home,
            Outcome::Draw => self.draw,
            Outcome::Away => self.away,
        }
    }

    pub fn max(&self) -> f64 {
        self.home.max(self.draw).max(self.away)
    }

    /// Ties resolve toward home, then draw.
    pub fn argmax(&self) -> Outcome {
        if self.home >= self.draw && self.home >= self.away {
            Outcome::Home
        } else if self.draw >= self.away {
            Outcome::Draw
        } else {
            Outcome::Away
        }
    }

    pub fn sum(&self) -> f64 {
        self.home + self.draw + self.away
    }

    /// Rescale so the components sum to one; degenerate input becomes uniform.
    pub fn normalized(self) -> Self {
        let home = self.home.max(0.0);
        let draw = self.draw.max(0.0);
        let away = self.away.max(0.0);
        let sum = home + draw + away;
        if !sum.is_finite() || sum <= 0.0 {
            return Self::uniform();
        }
        Self {
            home: home / sum,
            draw: draw / sum,
            away: away / sum,
        }
    }

    pub fn is_distribution(&self, tolerance: f64) -> bool {
        let in_range = |p: f64| p.is_finite() && (0.0..=1.0).contains(&p);
        in_range(self.home)
            && in_range(self.draw)
            && in_range(self.away)
            && (self.sum() - 1.0).abs() <= tolerance
    }
}

pub fn classify_outcome(home_goals: u8, away_goals: u8) -> Outcome {
    if home_goals > away_goals {
        Outcome::Home
    } else if home_goals < away_goals {
        Outcome::Away
    } else {
        Outcome::Draw
    }
}

pub fn one_hot(outcome: Outcome) -> Prob3 {
    match outcome {
        Outcome::Home => Prob3 {
            home: 1.0,
            draw: 0.0,
            away: 0.0,
        },
        Outcome::Draw => Prob3 {
            home: 0.0,
            draw: 1.0,
            away: 0.0,
        },
        Outcome::Away => Prob3 {
            home: 0.0,
            draw: 0.0,
            away: 1.0,
        },
    }
}

/// Accuracy, log-loss and Brier over paired predictions and outcomes.
///
/// Brier is the mean over the three components of the squared error, averaged
/// over matches. Returns `None` when there is nothing to score.
pub fn evaluate_probs(predictions: &[Prob3], outcomes: &[Outcome]) -> Option<Metrics> {
    if predictions.is_empty() || predictions.len() != outcomes.len() {
        return None;
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;

    for (p, outcome) in predictions.iter().zip(outcomes) {
        let y = one_hot(*outcome);
        brier_sum += ((p.home - y.home).powi(2)
            + (p.draw - y.draw).powi(2)
            + (p.away - y.away).powi(2))
            / 3.0;

        let actual_prob = p.get(*outcome).clamp(LOG_LOSS_FLOOR, 1.0);
        log_loss_sum += -actual_prob.ln();

        if p.argmax() == *outcome {
            correct += 1;
        }
    }

    let n = predictions.len() as f64;
    Some(Metrics {
        samples: predictions.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        accuracy: correct as f64 / n,
    })
}

pub fn apply_logit_scaling(prob: Prob3, scaling: LogitScaling) -> Prob3 {
    if scaling.is_identity() {
        return prob;
    }
    let s = scaling.logit_scale.clamp(LOGIT_SCALE_RANGE.0, LOGIT_SCALE_RANGE.1);
    let mut lh = prob.home.clamp(LOG_LOSS_FLOOR, 1.0).ln();
    let mut ld = prob.draw.clamp(LOG_LOSS_FLOOR, 1.0).ln() + scaling.draw_bias;
    let mut la = prob.away.clamp(LOG_LOSS_FLOOR, 1.0).ln();

    let mean = (lh + ld + la) / 3.0;
    lh = (lh - mean) * s;
    ld = (ld - mean) * s;
    la = (la - mean) * s;

    let mx = lh.max(ld.max(la));
    let eh = (lh - mx).exp();
    let ed = (ld - mx).exp();
    let ea = (la - mx).exp();
    let den = (eh + ed + ea).max(1e-12);

    Prob3 {
        home: eh / den,
        draw: ed / den,
        away: ea / den,
    }
    .normalized()
}

/// Grid search for the scaling that minimises log-loss of `predictions`,
/// which must be unscaled. The identity is kept unless a candidate strictly
/// improves on it.
pub fn fit_logit_scaling(
    predictions: &[Prob3],
    outcomes: &[Outcome],
) -> Option<(LogitScaling, Metrics)> {
    const STEP: f64 = 0.02;
    let mut best_metrics = evaluate_probs(predictions, outcomes)?;
    let mut best = LogitScaling::identity();

    let scale_steps = ((LOGIT_SCALE_RANGE.1 - LOGIT_SCALE_RANGE.0) / STEP).round() as i32;
    let draw_steps = (DRAW_BIAS_LIMIT / STEP).round() as i32;
    for scale_step in 0..=scale_steps {
        let logit_scale = LOGIT_SCALE_RANGE.0 + scale_step as f64 * STEP;
        for draw_step in -draw_steps..=draw_steps {
            let draw_bias = draw_step as f64 * STEP;
            let candidate = LogitScaling {
                logit_scale,
                draw_bias,
            };
            let scaled: Vec<Prob3> = predictions
                .iter()
                .map(|p| apply_logit_scaling(*p, candidate))
                .collect();
            let Some(metrics) = evaluate_probs(&scaled, outcomes) else {
                continue;
            };
            if metrics.log_loss < best_metrics.log_loss {
                best_metrics = metrics;
                best = candidate;
            }
        }
    }

    let tol = STEP / 2.0;
    let on_bound = (best.logit_scale - LOGIT_SCALE_RANGE.0).abs() < tol
        || (best.logit_scale - LOGIT_SCALE_RANGE.1).abs() < tol
        || (best.draw_bias.abs() - DRAW_BIAS_LIMIT).abs() < tol;
    if on_bound {
        warn!(
            logit_scale = best.logit_scale,
            draw_bias = best.draw_bias,
            "logit scaling fit stopped at the edge of its search range"
        );
    }

    Some((best, best_metrics))
}

/// Partition confidence (max outcome probability) into `bins` fixed-width
/// buckets covering [0, 1]. Bucket `i` is `[i/n, (i+1)/n)`, the last one is
/// closed at 1.0.
pub fn confidence_buckets(predictions: &[Prob3], outcomes: &[Outcome], bins: usize) -> Vec<CalibrationBucket> {
    let bins = bins.max(1);
    let mut counts = vec![0usize; bins];
    let mut conf_sum = vec![0.0_f64; bins];
    let mut correct = vec![0usize; bins];

    for (p, outcome) in predictions.iter().zip(outcomes) {
        let confidence = p.max().clamp(0.0, 1.0);
        let idx = ((confidence * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        conf_sum[idx] += confidence;
        if p.argmax() == *outcome {
            correct[idx] += 1;
        }
    }

    (0..bins)
        .map(|i| {
            let count = counts[i];
            let (mean_confidence, accuracy) = if count > 0 {
                (conf_sum[i] / count as f64, correct[i] as f64 / count as f64)
            } else {
                (0.0, 0.0)
            };
            CalibrationBucket {
                bucket_start: i as f64 / bins as f64,
                bucket_end: (i + 1) as f64 / bins as f64,
                count,
                mean_confidence,
                accuracy,
            }
        })
        .collect()
}

pub fn expected_calibration_error(buckets: &[CalibrationBucket]) -> f64 {
    let total: usize = buckets.iter().map(|b| b.count).sum();
    if total == 0 {
        return 0.0;
    }
    buckets
        .iter()
        .filter(|b| b.count > 0)
        .map(|b| (b.count as f64 / total as f64) * (b.mean_confidence - b.accuracy).abs())
        .sum()
}

/// Turns backtest output into calibration curves and ensemble weights.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationAnalyzer {
    buckets: usize,
}

impl Default for CalibrationAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}

impl CalibrationAnalyzer {
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: buckets.max(1),
        }
    }

    /// Records without a prediction for `subject` are skipped, so the bucket
    /// counts sum to the number of records that carry one.
    pub fn calibrate(&self, records: &[BacktestRecord], subject: Subject) -> Vec<CalibrationBucket> {
        let (predictions, outcomes) = paired(records, subject);
        confidence_buckets(&predictions, &outcomes, self.buckets)
    }

    pub fn expected_calibration_error(&self, records: &[BacktestRecord], subject: Subject) -> f64 {
        expected_calibration_error(&self.calibrate(records, subject))
    }

    /// Fits on each record's unscaled mixture, so the result replaces any
    /// scaling the backtest ran with rather than stacking on it.
    pub fn fit_ensemble_scaling(&self, records: &[BacktestRecord]) -> Option<(LogitScaling, Metrics)> {
        let (predictions, outcomes): (Vec<Prob3>, Vec<Outcome>) =
            records.iter().map(|r| (r.mixture, r.actual)).unzip();
        fit_logit_scaling(&predictions, &outcomes)
    }

    /// Inverse log-loss weighting. A model with no backtest samples keeps the
    /// uniform share `1/N`; the remaining mass is split among scored models in
    /// proportion to `1 / log_loss`.
    pub fn derive_weights(&self, records: &[BacktestRecord]) -> Vec<ModelWeight> {
        let n_models = ModelKind::ALL.len() as f64;
        let uniform = 1.0 / n_models;

        let scored: Vec<(ModelKind, Option<f64>)> = ModelKind::ALL
            .iter()
            .map(|kind| {
                let (predictions, outcomes) = paired(records, Subject::Model(*kind));
                let inverse = evaluate_probs(&predictions, &outcomes)
                    .map(|m| 1.0 / m.log_loss.max(1e-6));
                (*kind, inverse)
            })
            .collect();

        let unscored = scored.iter().filter(|(_, inv)| inv.is_none()).count() as f64;
        let inverse_total: f64 = scored.iter().filter_map(|(_, inv)| *inv).sum();
        let remaining = 1.0 - unscored * uniform;

        scored
            .into_iter()
            .map(|(model, inverse)| {
                let weight = match inverse {
                    None => uniform,
                    Some(_) if inverse_total <= 0.0 || !inverse_total.is_finite() => uniform,
                    Some(inv) => remaining * inv / inverse_total,
                };
                ModelWeight { model, weight }
            })
            .collect()
    }
}

fn paired(records: &[BacktestRecord], subject: Subject) -> (Vec<Prob3>, Vec<Outcome>) {
    records
        .iter()
        .filter_map(|r| r.probs_for(subject).map(|p| (p, r.actual)))
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions_have_zero_brier() {
        let preds = vec![one_hot(Outcome::Home), one_hot(Outcome::Draw), one_hot(Outcome::Away)];
        let outcomes = vec![Outcome::Home, Outcome::Draw, Outcome::Away];
        let m = evaluate_probs(&preds, &outcomes).expect("metrics");
        assert_eq!(m.samples, 3);
        assert!(m.brier < 1e-12);
        assert!((m.accuracy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn log_loss_is_floored_for_zero_probability() {
        let m = evaluate_probs(&[one_hot(Outcome::Home)], &[Outcome::Away]).expect("metrics");
        assert!(m.log_loss.is_finite());
        assert!((m.log_loss - (-LOG_LOSS_FLOOR.ln())).abs() < 1e-9);
    }

    #[test]
    fn empty_input_has_no_metrics() {
        assert!(evaluate_probs(&[], &[]).is_none());
    }

    #[test]
    fn logit_scaling_keeps_distribution_normalized() {
        let p = Prob3 {
            home: 0.44,
            draw: 0.27,
            away: 0.29,
        };
        let q = apply_logit_scaling(
            p,
            LogitScaling {
                logit_scale: 1.12,
                draw_bias: 0.08,
            },
        );
        assert!(q.is_distribution(1e-9));
        assert_eq!(apply_logit_scaling(p, LogitScaling::identity()), p);
    }

    #[test]
    fn buckets_cover_unit_interval_and_count_everything() {
        let preds = vec![
            Prob3 { home: 1.0, draw: 0.0, away: 0.0 },
            Prob3 { home: 0.34, draw: 0.33, away: 0.33 },
            Prob3 { home: 0.2, draw: 0.2, away: 0.6 },
        ];
        let outcomes = vec![Outcome::Home, Outcome::Draw, Outcome::Away];
        let buckets = confidence_buckets(&preds, &outcomes, 10);
        assert_eq!(buckets.len(), 10);
        assert_eq!(buckets.first().map(|b| b.bucket_start), Some(0.0));
        assert_eq!(buckets.last().map(|b| b.bucket_end), Some(1.0));
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].bucket_end, pair[1].bucket_start);
        }
        assert_eq!(buckets.iter().map(|b| b.count).sum::<usize>(), 3);
        // confidence of exactly 1.0 lands in the closed last bucket
        assert_eq!(buckets[9].count, 1);
    }

    #[test]
    fn scaling_fit_never_worsens_log_loss() {
        let preds = vec![
            Prob3 { home: 0.8, draw: 0.1, away: 0.1 },
            Prob3 { home: 0.7, draw: 0.2, away: 0.1 },
            Prob3 { home: 0.75, draw: 0.15, away: 0.1 },
            Prob3 { home: 0.6, draw: 0.25, away: 0.15 },
        ];
        let outcomes = vec![Outcome::Draw, Outcome::Home, Outcome::Draw, Outcome::Away];
        let raw = evaluate_probs(&preds, &outcomes).expect("metrics");
        let (_, fitted) = fit_logit_scaling(&preds, &outcomes).expect("fit");
        assert!(fitted.log_loss <= raw.log_loss);
    }

    #[test]
    fn strong_overconfidence_is_fitted_inside_the_grid() {
        // Home is priced at 0.9 but wins 17 of 23; the best temperature is ~0.60.
        let p = Prob3 {
            home: 0.9,
            draw: 0.05,
            away: 0.05,
        };
        let mut outcomes = vec![Outcome::Home; 17];
        outcomes.extend([Outcome::Draw; 3]);
        outcomes.extend([Outcome::Away; 3]);
        let preds = vec![p; outcomes.len()];

        let (scaling, fitted) = fit_logit_scaling(&preds, &outcomes).expect("fit");
        assert!(
            scaling.logit_scale > 0.55 && scaling.logit_scale < 0.65,
            "logit_scale={}",
            scaling.logit_scale
        );
        let replayed: Vec<Prob3> = preds.iter().map(|q| apply_logit_scaling(*q, scaling)).collect();
        let replayed = evaluate_probs(&replayed, &outcomes).expect("metrics");
        assert_eq!(replayed.log_loss, fitted.log_loss);
    }
}
