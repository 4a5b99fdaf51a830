use ndarray::ArrayView1;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

use crate::{
    data::SurvivalData,
    error::{Result, SurvivalError},
};

/// Harrell's C-index with tie handling - how often does higher risk mean shorter survival?
pub fn harrell_c_index(
    risk_scores: ArrayView1<f64>,
    times: ArrayView1<f64>,
    events: ArrayView1<bool>,
) -> Result<f64> {
    let n = risk_scores.len();
    if n != times.len() || n != events.len() {
        return Err(SurvivalError::invalid_dimensions(
            "risk scores, times, and events must have same length",
        ));
    }

    let mut concordant = 0.0;
    let mut discordant = 0.0;
    let mut tied_risk = 0.0;

    for i in 0..n {
        if !events[i] {
            continue;
        }

        for j in 0..n {
            if i == j {
                continue;
            }

            // j outlived i (or was still under observation when i died)
            if times[j] > times[i] || (!events[j] && times[j] >= times[i]) {
                if risk_scores[i] > risk_scores[j] {
                    concordant += 1.0;
                } else if risk_scores[i] < risk_scores[j] {
                    discordant += 1.0;
                } else {
                    tied_risk += 1.0;
                }
            }
        }
    }

    let total_pairs = concordant + discordant + tied_risk;
    if total_pairs == 0.0 {
        return Err(SurvivalError::numerical_error(
            "no comparable pairs for the C-index",
        ));
    }

    Ok((concordant + 0.5 * tied_risk) / total_pairs)
}

/// Breslow log partial likelihood for given risk scores
pub fn log_partial_likelihood(data: &SurvivalData, risk_scores: ArrayView1<f64>) -> Result<f64> {
    if risk_scores.len() != data.n_samples() {
        return Err(SurvivalError::invalid_dimensions(
            "risk scores length must match number of samples",
        ));
    }

    let mut loglik = 0.0;
    let times = data.times();
    let events = data.events();

    for event_time in data.event_times() {
        let risk_set: Vec<usize> = (0..data.n_samples())
            .filter(|&i| times[i] >= event_time)
            .collect();

        // log-sum-exp, shifted by the max for stability
        let max_risk = risk_set
            .iter()
            .map(|&i| risk_scores[i])
            .fold(f64::NEG_INFINITY, f64::max);
        let log_sum_exp = max_risk
            + risk_set
                .iter()
                .map(|&i| (risk_scores[i] - max_risk).exp())
                .sum::<f64>()
                .ln();

        for i in (0..data.n_samples()).filter(|&i| times[i] == event_time && events[i]) {
            loglik += risk_scores[i] - log_sum_exp;
        }
    }

    Ok(loglik)
}

/// AIC (Akaike Information Criterion)
pub fn aic(log_likelihood: f64, n_parameters: usize) -> f64 {
    2.0 * n_parameters as f64 - 2.0 * log_likelihood
}

/// BIC (Bayesian Information Criterion)
pub fn bic(log_likelihood: f64, n_parameters: usize, n_samples: usize) -> f64 {
    (n_parameters as f64) * (n_samples as f64).ln() - 2.0 * log_likelihood
}

/// a chi-square statistic with its degrees of freedom and p-value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChiSquareTest {
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

impl ChiSquareTest {
    pub fn new(statistic: f64, df: usize) -> Self {
        Self {
            statistic,
            df,
            p_value: chi_square_sf(statistic, df),
        }
    }

    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }
}

/// upper tail of a chi-square; df = 0 gives p = 1
pub fn chi_square_sf(statistic: f64, df: usize) -> f64 {
    if df == 0 || statistic <= 0.0 {
        return 1.0;
    }
    match ChiSquared::new(df as f64) {
        Ok(dist) => dist.sf(statistic).clamp(0.0, 1.0),
        Err(_) => f64::NAN,
    }
}

/// two-sided normal p-value for a z statistic
pub fn normal_two_sided_p(z: f64) -> f64 {
    let normal = Normal::standard();
    (2.0 * normal.sf(z.abs())).clamp(0.0, 1.0)
}

/// standard normal quantile
pub fn normal_quantile(p: f64) -> f64 {
    Normal::standard().inverse_cdf(p)
}
