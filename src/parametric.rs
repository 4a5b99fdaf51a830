//! Fully parametric survival regression in the accelerated failure time form
//! `log T = x'beta + sigma * W`.
//!
//! One fitting routine covers every family; the family only decides the
//! distribution of `W`. Events contribute the log density, censored subjects
//! the log survival function.

use std::fmt;

use log::{debug, warn};
use ndarray::{Array1, Array2};
use statrs::function::erf::erfc;

use crate::data::SurvivalData;
use crate::error::{Result, SurvivalError};
use crate::metrics::{aic, bic, normal_two_sided_p};
use crate::optimization::{numerical_hessian, Derivatives, LogLikelihood, NewtonRaphson, OptimizationConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distribution {
    Exponential,
    Weibull,
    LogNormal,
    LogLogistic,
}

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

fn softplus(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

fn logistic(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// log of the standard normal upper tail and the inverse mills ratio phi/Q
fn normal_upper_tail(z: f64) -> (f64, f64) {
    let q = 0.5 * erfc(z / std::f64::consts::SQRT_2);
    if q > 1e-300 {
        let phi = (-0.5 * z * z - LN_SQRT_2PI).exp();
        (q.ln(), phi / q)
    } else {
        // asymptotic series, z is large and positive here
        let z2 = z * z;
        let series = 1.0 - 1.0 / z2 + 3.0 / (z2 * z2);
        (-0.5 * z2 - z.ln() - LN_SQRT_2PI + series.ln(), z / series)
    }
}

impl Distribution {
    pub const ALL: [Distribution; 4] = [
        Distribution::Exponential,
        Distribution::Weibull,
        Distribution::LogNormal,
        Distribution::LogLogistic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Distribution::Exponential => "exponential",
            Distribution::Weibull => "weibull",
            Distribution::LogNormal => "lognormal",
            Distribution::LogLogistic => "loglogistic",
        }
    }

    /// exponential fixes sigma = 1
    pub fn has_scale(&self) -> bool {
        !matches!(self, Distribution::Exponential)
    }

    /// log f_W(z) and its derivative
    fn log_density(&self, z: f64) -> (f64, f64) {
        match self {
            Distribution::Exponential | Distribution::Weibull => {
                let ez = z.exp();
                (z - ez, 1.0 - ez)
            }
            Distribution::LogNormal => (-0.5 * z * z - LN_SQRT_2PI, -z),
            Distribution::LogLogistic => (z - 2.0 * softplus(z), 1.0 - 2.0 * logistic(z)),
        }
    }

    /// log S_W(z) and its derivative
    fn log_survival(&self, z: f64) -> (f64, f64) {
        match self {
            Distribution::Exponential | Distribution::Weibull => {
                let ez = z.exp();
                (-ez, -ez)
            }
            Distribution::LogNormal => {
                let (log_q, mills) = normal_upper_tail(z);
                (log_q, -mills)
            }
            Distribution::LogLogistic => (-softplus(z), -logistic(z)),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// AFT log-likelihood on an intercept-augmented design
struct AftLikelihood<'a> {
    design: &'a Array2<f64>, // first column is the intercept
    log_times: Array1<f64>,
    events: Vec<bool>,
    distribution: Distribution,
}

impl AftLikelihood<'_> {
    fn n_coef(&self) -> usize {
        self.design.ncols()
    }

    fn sigma(&self, theta: &Array1<f64>) -> f64 {
        if self.distribution.has_scale() {
            theta[self.n_coef()].exp()
        } else {
            1.0
        }
    }

    fn gradient(&self, theta: &Array1<f64>) -> Result<Array1<f64>> {
        let k = self.n_coef();
        let sigma = self.sigma(theta);
        let beta = theta.slice(ndarray::s![..k]);
        let mu = self.design.dot(&beta);

        let mut grad = Array1::zeros(self.n_params());
        for i in 0..mu.len() {
            let z = (self.log_times[i] - mu[i]) / sigma;
            let (d_mu, d_log_sigma) = if self.events[i] {
                let (_, dg) = self.distribution.log_density(z);
                (-dg / sigma, -z * dg - 1.0)
            } else {
                let (_, dg) = self.distribution.log_survival(z);
                (-dg / sigma, -z * dg)
            };
            for j in 0..k {
                grad[j] += d_mu * self.design[[i, j]];
            }
            if self.distribution.has_scale() {
                grad[k] += d_log_sigma;
            }
        }
        if grad.iter().any(|g: &f64| !g.is_finite()) {
            return Err(SurvivalError::numerical_error("non-finite likelihood gradient"));
        }
        Ok(grad)
    }
}

impl LogLikelihood for AftLikelihood<'_> {
    fn n_params(&self) -> usize {
        self.n_coef() + usize::from(self.distribution.has_scale())
    }

    fn loglik(&self, theta: &Array1<f64>) -> Result<f64> {
        let k = self.n_coef();
        let sigma = self.sigma(theta);
        let log_sigma = sigma.ln();
        let mu = self.design.dot(&theta.slice(ndarray::s![..k]));

        let mut ll = 0.0;
        for i in 0..mu.len() {
            let z = (self.log_times[i] - mu[i]) / sigma;
            ll += if self.events[i] {
                self.distribution.log_density(z).0 - log_sigma - self.log_times[i]
            } else {
                self.distribution.log_survival(z).0
            };
        }
        Ok(ll)
    }

    fn evaluate(&self, theta: &Array1<f64>) -> Result<Derivatives> {
        Ok(Derivatives {
            loglik: self.loglik(theta)?,
            gradient: self.gradient(theta)?,
            hessian: numerical_hessian(theta, |t| self.gradient(t))?,
        })
    }
}

/// immutable result of one parametric fit
#[derive(Debug, Clone)]
pub struct ParametricFit {
    pub distribution: Distribution,
    pub names: Vec<String>,          // covariates, without the intercept
    pub coefficients: Array1<f64>,   // intercept first
    pub std_errors: Array1<f64>,
    pub log_scale: Option<f64>,      // log sigma, None for the exponential
    pub log_scale_se: Option<f64>,
    pub covariance: Array2<f64>,     // over (coefficients, log sigma)
    pub loglik: f64,
    pub n: usize,
    pub n_events: usize,
    pub iterations: usize,
}

impl ParametricFit {
    /// "weibull ~ age + male" / "weibull ~ 1"
    pub fn label(&self) -> String {
        if self.names.is_empty() {
            format!("{} ~ 1", self.distribution)
        } else {
            format!("{} ~ {}", self.distribution, self.names.join(" + "))
        }
    }

    pub fn n_params(&self) -> usize {
        self.coefficients.len() + usize::from(self.log_scale.is_some())
    }

    pub fn sigma(&self) -> f64 {
        self.log_scale.map_or(1.0, f64::exp)
    }

    pub fn aic(&self) -> f64 {
        aic(self.loglik, self.n_params())
    }

    pub fn bic(&self) -> f64 {
        bic(self.loglik, self.n_params(), self.n)
    }

    pub fn p_values(&self) -> Array1<f64> {
        (&self.coefficients / &self.std_errors).mapv(normal_two_sided_p)
    }

    /// distribution parameters at covariates = 0, in the usual textbook names
    pub fn natural_parameters(&self) -> Vec<(&'static str, f64)> {
        let mu = self.coefficients[0];
        let sigma = self.sigma();
        match self.distribution {
            Distribution::Exponential => vec![("rate", (-mu).exp())],
            Distribution::Weibull | Distribution::LogLogistic => {
                vec![("shape", 1.0 / sigma), ("scale", mu.exp())]
            }
            Distribution::LogNormal => vec![("meanlog", mu), ("sdlog", sigma)],
        }
    }

    fn location(&self, x: &[f64]) -> Result<f64> {
        if x.len() != self.names.len() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "expected {} covariate values, got {}",
                self.names.len(),
                x.len()
            )));
        }
        Ok(self.coefficients[0]
            + x.iter()
                .zip(self.coefficients.iter().skip(1))
                .map(|(v, b)| v * b)
                .sum::<f64>())
    }

    /// S(t | x)
    pub fn survival(&self, t: f64, x: &[f64]) -> Result<f64> {
        if t <= 0.0 {
            return Ok(1.0);
        }
        let z = (t.ln() - self.location(x)?) / self.sigma();
        Ok(self.distribution.log_survival(z).0.exp())
    }

    /// h(t | x) = f(t | x) / S(t | x)
    pub fn hazard(&self, t: f64, x: &[f64]) -> Result<f64> {
        if t <= 0.0 {
            return Err(SurvivalError::invalid_parameter("t", t.to_string()));
        }
        let sigma = self.sigma();
        let z = (t.ln() - self.location(x)?) / sigma;
        let log_f = self.distribution.log_density(z).0 - sigma.ln() - t.ln();
        let log_s = self.distribution.log_survival(z).0;
        Ok((log_f - log_s).exp())
    }

    /// (t, S(t|x)) over a grid
    pub fn survival_curve(&self, grid: &[f64], x: &[f64]) -> Result<Vec<(f64, f64)>> {
        grid.iter().map(|&t| Ok((t, self.survival(t, x)?))).collect()
    }

    /// (t, h(t|x)) over a grid of positive times
    pub fn hazard_curve(&self, grid: &[f64], x: &[f64]) -> Result<Vec<(f64, f64)>> {
        grid.iter().map(|&t| Ok((t, self.hazard(t, x)?))).collect()
    }

    pub fn print(&self) {
        println!("{}  (n = {}, events = {})", self.label(), self.n, self.n_events);
        let p = self.p_values();
        println!("{:<14} {:>12} {:>12} {:>10}", "", "est", "se", "p");
        for i in 0..self.coefficients.len() {
            let name = if i == 0 { "(Intercept)" } else { self.names[i - 1].as_str() };
            println!(
                "{:<14} {:>12.5} {:>12.5} {:>10.4}",
                name, self.coefficients[i], self.std_errors[i], p[i]
            );
        }
        if let (Some(ls), Some(se)) = (self.log_scale, self.log_scale_se) {
            println!("{:<14} {:>12.5} {:>12.5}", "log(scale)", ls, se);
        }
        let natural: Vec<String> = self
            .natural_parameters()
            .iter()
            .map(|(k, v)| format!("{} = {:.5}", k, v))
            .collect();
        println!("{}", natural.join(", "));
        println!(
            "loglik = {:.3}, AIC = {:.3}, BIC = {:.3}",
            self.loglik,
            self.aic(),
            self.bic()
        );
    }
}

/// maximum likelihood fit of one family on the covariates in `data`
pub fn fit_parametric(
    data: &SurvivalData,
    distribution: Distribution,
    config: &OptimizationConfig,
) -> Result<ParametricFit> {
    let names = data.names().to_vec();
    let label = format!("{} aft", distribution);

    if data.times().iter().any(|&t| t <= 0.0) {
        return Err(SurvivalError::invalid_survival_data(format!(
            "{} needs strictly positive times",
            label
        )));
    }
    let n_events = data.n_events();
    if n_events == 0 {
        return Err(SurvivalError::optimization_failed(label, &names, "no events"));
    }

    // intercept + standardized covariates, mapped back afterwards
    let n = data.n_samples();
    let p = data.n_features();
    let (z, means, stds) = data.standardized_covariates();
    let mut design = Array2::ones((n, p + 1));
    design.slice_mut(ndarray::s![.., 1..]).assign(&z);

    let log_times = data.times().mapv(f64::ln);
    let objective = AftLikelihood {
        design: &design,
        log_times,
        events: data.events().to_vec(),
        distribution,
    };

    let total_time: f64 = data.times().sum();
    let mut start = Array1::zeros(objective.n_params());
    start[0] = (total_time / n_events as f64).ln();

    let optimum = NewtonRaphson::new(config.clone())
        .maximize(&objective, start)
        .map_err(|e| SurvivalError::optimization_failed(label.as_str(), &names, e.to_string()))?;
    let diverging = optimum
        .diverging(config.divergence_tolerance)
        .map_err(|e| SurvivalError::optimization_failed(label.as_str(), &names, e.to_string()))?;
    if !diverging.is_empty() {
        let which: Vec<&str> = diverging
            .iter()
            .map(|&j| match j {
                0 => "(intercept)",
                j if j <= p => names.get(j - 1).map(String::as_str).unwrap_or("?"),
                _ => "log(scale)",
            })
            .collect();
        warn!("{}: monotone likelihood in {}", label, which.join(", "));
        return Err(SurvivalError::optimization_failed(
            label,
            &names,
            format!("parameter may be infinite for {}", which.join(", ")),
        ));
    }
    let scaled_cov = optimum
        .covariance()
        .map_err(|e| SurvivalError::optimization_failed(label.as_str(), &names, e.to_string()))?;

    // unscaled theta = J theta_scaled
    let m = objective.n_params();
    let mut jacobian = Array2::<f64>::eye(m);
    for j in 0..p {
        jacobian[[0, j + 1]] = -means[j] / stds[j];
        jacobian[[j + 1, j + 1]] = 1.0 / stds[j];
    }
    let theta = jacobian.dot(&optimum.theta);
    let covariance = jacobian.dot(&scaled_cov).dot(&jacobian.t());
    let se = covariance.diag().mapv(|v| v.max(0.0).sqrt());
    if se.iter().any(|s| !s.is_finite()) {
        return Err(SurvivalError::optimization_failed(label, &names, "singular information matrix"));
    }

    debug!(
        "{} on [{}]: loglik {:.4} after {} iterations",
        label,
        names.join(", "),
        optimum.loglik,
        optimum.iterations
    );

    let (log_scale, log_scale_se) = if distribution.has_scale() {
        (Some(theta[p + 1]), Some(se[p + 1]))
    } else {
        (None, None)
    };

    Ok(ParametricFit {
        distribution,
        names,
        coefficients: theta.slice(ndarray::s![..p + 1]).to_owned(),
        std_errors: se.slice(ndarray::s![..p + 1]).to_owned(),
        log_scale,
        log_scale_se,
        covariance,
        loglik: optimum.loglik,
        n,
        n_events,
        iterations: optimum.iterations,
    })
}

/// one line of the AIC/BIC table
#[derive(Debug, Clone, PartialEq)]
pub struct RankedModel {
    pub label: String,
    pub n_params: usize,
    pub loglik: f64,
    pub aic: f64,
    pub bic: f64,
}

#[derive(Debug, Clone)]
pub struct ModelRanking {
    pub by_aic: Vec<RankedModel>,
    pub by_bic: Vec<RankedModel>,
}

impl ModelRanking {
    pub fn best_aic(&self) -> Option<&RankedModel> {
        self.by_aic.first()
    }

    pub fn best_bic(&self) -> Option<&RankedModel> {
        self.by_bic.first()
    }

    pub fn print(&self) {
        println!("{:<36} {:>4} {:>12} {:>12} {:>12}", "model", "df", "loglik", "AIC", "BIC");
        for m in &self.by_aic {
            println!(
                "{:<36} {:>4} {:>12.3} {:>12.3} {:>12.3}",
                m.label, m.n_params, m.loglik, m.aic, m.bic
            );
        }
        if let Some(best) = self.best_aic() {
            println!("lowest AIC: {}", best.label);
        }
        if let Some(best) = self.best_bic() {
            println!("lowest BIC: {}", best.label);
        }
    }
}

/// rank fits by AIC and by BIC; ties broken by label
pub fn rank_models(fits: &[ParametricFit]) -> ModelRanking {
    let rows: Vec<RankedModel> = fits
        .iter()
        .map(|f| RankedModel {
            label: f.label(),
            n_params: f.n_params(),
            loglik: f.loglik,
            aic: f.aic(),
            bic: f.bic(),
        })
        .collect();

    let mut by_aic = rows.clone();
    by_aic.sort_by(|a, b| a.aic.total_cmp(&b.aic).then_with(|| a.label.cmp(&b.label)));
    let mut by_bic = rows;
    by_bic.sort_by(|a, b| a.bic.total_cmp(&b.bic).then_with(|| a.label.cmp(&b.label)));

    ModelRanking { by_aic, by_bic }
}
