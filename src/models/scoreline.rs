//! Joint scoreline table shared by every goal model.
//!
//! Each side's goal count is drawn from an independent marginal; the table is
//! their outer product over `0..=K` with `K` grown until the tail is negligible.

use crate::calibration::Prob3;
use crate::history::Score;

pub const MIN_TABLE_GOALS: u32 = 10;
pub const MAX_TABLE_GOALS: u32 = 40;
pub const TAIL_TOLERANCE: f64 = 1e-6;

/// Below this the negative binomial is numerically a Poisson.
const MIN_DISPERSION: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Marginal {
    Poisson { mean: f64 },
    /// Variance `mean + dispersion * mean^2`.
    NegativeBinomial { mean: f64, dispersion: f64 },
}

impl Marginal {
    pub fn mean(&self) -> f64 {
        match *self {
            Marginal::Poisson { mean } | Marginal::NegativeBinomial { mean, .. } => mean,
        }
    }

    pub fn pmf(&self, max_k: u32) -> Vec<f64> {
        match *self {
            Marginal::Poisson { mean } => poisson_pmf(mean, max_k),
            Marginal::NegativeBinomial { mean, dispersion } => {
                negative_binomial_pmf(mean, dispersion, max_k)
            }
        }
    }
}

pub fn poisson_pmf(lambda: f64, max_k: u32) -> Vec<f64> {
    let max_k = max_k as usize;
    let lambda = lambda.max(0.0);
    let mut out = vec![0.0; max_k + 1];
    out[0] = (-lambda).exp();
    for k in 1..=max_k {
        out[k] = out[k - 1] * lambda / k as f64;
    }
    out
}

/// NB2 parameterisation with `r = 1/dispersion`, `p = mean / (r + mean)`.
pub fn negative_binomial_pmf(mean: f64, dispersion: f64, max_k: u32) -> Vec<f64> {
    if dispersion.is_nan() || dispersion <= MIN_DISPERSION {
        return poisson_pmf(mean, max_k);
    }
    let max_k = max_k as usize;
    let mean = mean.max(0.0);
    let r = 1.0 / dispersion;
    let q = mean / (r + mean);

    let mut out = vec![0.0; max_k + 1];
    // (r / (r + mean))^r, computed in log space for small dispersion.
    out[0] = (r * (-q).ln_1p()).exp();
    for k in 1..=max_k {
        out[k] = out[k - 1] * ((k - 1) as f64 + r) / k as f64 * q;
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreTable {
    /// Row-major, home goals by row: `probs[i * (max_goals + 1) + j]`.
    probs: Vec<f64>,
    pub max_goals: u32,
    /// Mass outside the table before renormalisation.
    pub omitted_mass: f64,
}

impl ScoreTable {
    pub fn from_marginals(home: Marginal, away: Marginal) -> Self {
        let (pmf_h, pmf_a, max_goals) = truncated_marginals(home, away);
        let kept: f64 = pmf_h.iter().sum::<f64>() * pmf_a.iter().sum::<f64>();

        let mut probs = Vec::with_capacity(pmf_h.len() * pmf_a.len());
        for p_i in &pmf_h {
            for p_j in &pmf_a {
                probs.push(p_i * p_j);
            }
        }

        let total: f64 = probs.iter().sum();
        if total > 0.0 && total.is_finite() {
            for p in &mut probs {
                *p /= total;
            }
        }

        Self {
            probs,
            max_goals,
            omitted_mass: (1.0 - kept).max(0.0),
        }
    }

    pub fn from_rates(lambda_home: f64, lambda_away: f64) -> Self {
        Self::from_marginals(
            Marginal::Poisson { mean: lambda_home },
            Marginal::Poisson { mean: lambda_away },
        )
    }

    fn side(&self) -> usize {
        self.max_goals as usize + 1
    }

    pub fn prob(&self, home_goals: u32, away_goals: u32) -> f64 {
        if home_goals > self.max_goals || away_goals > self.max_goals {
            return 0.0;
        }
        self.probs[home_goals as usize * self.side() + away_goals as usize]
    }

    pub fn outcome_probs(&self) -> Prob3 {
        let n = self.side();
        let mut home = 0.0;
        let mut draw = 0.0;
        let mut away = 0.0;
        for (idx, p) in self.probs.iter().enumerate() {
            let (i, j) = (idx / n, idx % n);
            if i > j {
                home += p;
            } else if i < j {
                away += p;
            } else {
                draw += p;
            }
        }
        Prob3 { home, draw, away }.normalized()
    }

    /// Highest-probability cell; the first in row-major order wins ties.
    pub fn most_likely(&self) -> Score {
        let n = self.side();
        let mut best_idx = 0usize;
        let mut best = f64::NEG_INFINITY;
        for (idx, p) in self.probs.iter().enumerate() {
            if *p > best {
                best = *p;
                best_idx = idx;
            }
        }
        let clamp_u8 = |v: usize| v.min(u8::MAX as usize) as u8;
        Score::new(clamp_u8(best_idx / n), clamp_u8(best_idx % n))
    }
}

fn truncated_marginals(home: Marginal, away: Marginal) -> (Vec<f64>, Vec<f64>, u32) {
    let mut k = MIN_TABLE_GOALS;
    loop {
        let pmf_h = home.pmf(k);
        let pmf_a = away.pmf(k);
        let tail_h = 1.0 - pmf_h.iter().sum::<f64>();
        let tail_a = 1.0 - pmf_a.iter().sum::<f64>();
        if (tail_h < TAIL_TOLERANCE && tail_a < TAIL_TOLERANCE) || k >= MAX_TABLE_GOALS {
            return (pmf_h, pmf_a, k);
        }
        k += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn poisson_pmf_matches_closed_form() {
        let pmf = poisson_pmf(1.5, 4);
        assert_abs_diff_eq!(pmf[0], (-1.5_f64).exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(pmf[2], (-1.5_f64).exp() * 1.125, epsilon = 1e-12);
    }

    #[test]
    fn negative_binomial_collapses_to_poisson() {
        let nb = negative_binomial_pmf(1.4, 0.0, 10);
        let p = poisson_pmf(1.4, 10);
        assert_eq!(nb, p);
        let near = negative_binomial_pmf(1.4, 1e-7, 10);
        for (a, b) in near.iter().zip(&p) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn negative_binomial_is_overdispersed() {
        let pmf = negative_binomial_pmf(2.0, 0.5, 60);
        let mean: f64 = pmf.iter().enumerate().map(|(k, p)| k as f64 * p).sum();
        let var: f64 = pmf
            .iter()
            .enumerate()
            .map(|(k, p)| (k as f64 - mean).powi(2) * p)
            .sum();
        assert_abs_diff_eq!(mean, 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(var, 2.0 + 0.5 * 4.0, epsilon = 1e-3);
    }

    #[test]
    fn table_is_normalized_and_tail_is_small() {
        let t = ScoreTable::from_rates(1.4, 1.1);
        assert_eq!(t.max_goals, MIN_TABLE_GOALS);
        assert!(t.omitted_mass < 1e-5);
        let p = t.outcome_probs();
        assert!(p.is_distribution(1e-9));
        assert_eq!(t.most_likely(), Score::new(1, 1));
    }

    #[test]
    fn table_grows_for_high_rates() {
        let t = ScoreTable::from_rates(6.0, 0.1);
        assert!(t.max_goals > MIN_TABLE_GOALS);
        assert!(t.max_goals <= MAX_TABLE_GOALS);
        assert!(t.outcome_probs().home > 0.95);
    }

    #[test]
    fn symmetric_rates_give_symmetric_outcomes() {
        let p = ScoreTable::from_rates(1.3, 1.3).outcome_probs();
        assert_abs_diff_eq!(p.home, p.away, epsilon = 1e-12);
    }
}
