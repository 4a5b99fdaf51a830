use std::fmt;

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::{
    data::SurvivalData,
    error::{Result, SurvivalError},
    metrics::{harrell_c_index, normal_quantile, normal_two_sided_p, ChiSquareTest},
    optimization::{invert_matrix, Derivatives, LogLikelihood, NewtonRaphson, OptimizationConfig, Optimum},
};

/// how tied event times enter the partial likelihood
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ties {
    Breslow,
    Efron,
}

impl fmt::Display for Ties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ties::Breslow => f.write_str("breslow"),
            Ties::Efron => f.write_str("efron"),
        }
    }
}

/// cox proportional hazards model - configure, then `fit` to get a `CoxFit`
#[derive(Debug, Clone)]
pub struct CoxModel {
    ties: Ties,                       // efron unless told otherwise
    optimization: OptimizationConfig, // newton-raphson settings
}

impl Default for CoxModel {
    fn default() -> Self {
        Self {
            ties: Ties::Efron,
            optimization: OptimizationConfig::default(),
        }
    }
}

impl CoxModel {
    /// new cox model w/ defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// breslow or efron handling of tied event times
    pub fn with_ties(mut self, ties: Ties) -> Self {
        self.ties = ties;
        self
    }

    /// max iterations before giving up
    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.optimization.max_iterations = max_iter;
        self
    }

    /// how close is close enough for convergence
    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.optimization.tolerance = tol;
        self
    }

    pub fn with_optimization(mut self, config: OptimizationConfig) -> Self {
        self.optimization = config;
        self
    }

    pub fn ties(&self) -> Ties {
        self.ties
    }

    /// fit the model to data - this does the actual work
    pub fn fit(&self, data: &SurvivalData) -> Result<CoxFit> {
        let names = data.names().to_vec();
        let label = format!("cox ({})", self.ties);
        if data.n_events() == 0 {
            return Err(SurvivalError::optimization_failed(label, &names, "no events"));
        }

        let (optimum, loglik_null, means, stds) = self.solve(data, &label, &names)?;
        let scaled_cov = optimum
            .covariance()
            .map_err(|e| SurvivalError::optimization_failed(label.as_str(), &names, e.to_string()))?;

        let coefficients = &optimum.theta / &stds;
        let mut covariance = scaled_cov;
        for i in 0..covariance.nrows() {
            for j in 0..covariance.ncols() {
                covariance[[i, j]] /= stds[i] * stds[j];
            }
        }
        let std_errors = covariance.diag().mapv(|v| v.max(0.0).sqrt());
        if std_errors.iter().any(|s| !s.is_finite()) {
            return Err(SurvivalError::optimization_failed(
                label,
                &names,
                "information matrix is not positive definite",
            ));
        }

        debug!(
            "{} on [{}] converged in {} iterations, loglik {:.4}",
            label,
            names.join(", "),
            optimum.iterations,
            optimum.loglik
        );

        let mut centered = data.covariates().to_owned();
        for (j, mut col) in centered.axis_iter_mut(Axis(1)).enumerate() {
            col.mapv_inplace(|v| v - means[j]);
        }
        let linear_predictors = centered.dot(&coefficients);

        let post = PostFit::compute(centered.view(), &linear_predictors, data, self.ties)?;
        let concordance =
            harrell_c_index(linear_predictors.view(), data.times(), data.events()).ok();

        Ok(CoxFit {
            names,
            coefficients,
            std_errors,
            covariance,
            loglik_null,
            loglik: optimum.loglik,
            iterations: optimum.iterations,
            ties: self.ties,
            n: data.n_samples(),
            n_events: data.n_events(),
            means,
            linear_predictors,
            concordance,
            baseline: post.baseline,
            martingale: post.martingale,
            schoenfeld: post.schoenfeld,
        })
    }
}

impl CoxModel {
    /// maximized log partial likelihood alone, skipping residuals and summaries
    pub fn max_loglik(&self, data: &SurvivalData) -> Result<f64> {
        let names = data.names().to_vec();
        let label = format!("cox ({})", self.ties);
        if data.n_events() == 0 {
            return Err(SurvivalError::optimization_failed(label, &names, "no events"));
        }
        Ok(self.solve(data, &label, &names)?.0.loglik)
    }

    // newton on z-scored covariates; caller maps back with the returned moments
    fn solve(
        &self,
        data: &SurvivalData,
        label: &str,
        names: &[String],
    ) -> Result<(Optimum, f64, Array1<f64>, Array1<f64>)> {
        let (z, means, stds) = data.standardized_covariates();
        let objective = PartialLikelihood {
            x: z.view(),
            data,
            ties: self.ties,
        };
        let start = Array1::zeros(data.n_features());
        let loglik_null = objective.loglik(&start)?;

        let optimum = NewtonRaphson::new(self.optimization.clone())
            .maximize(&objective, start)
            .map_err(|e| SurvivalError::optimization_failed(label, names, e.to_string()))?;

        let diverging = optimum
            .diverging(self.optimization.divergence_tolerance)
            .map_err(|e| SurvivalError::optimization_failed(label, names, e.to_string()))?;
        if !diverging.is_empty() {
            let which: Vec<&str> = diverging
                .iter()
                .filter_map(|&j| names.get(j).map(String::as_str))
                .collect();
            warn!("{}: monotone likelihood in {}", label, which.join(", "));
            return Err(SurvivalError::optimization_failed(
                label,
                names,
                format!("coefficient may be infinite for {}", which.join(", ")),
            ));
        }
        Ok((optimum, loglik_null, means, stds))
    }
}

/// log partial likelihood on a fixed design
struct PartialLikelihood<'a> {
    x: ArrayView2<'a, f64>,
    data: &'a SurvivalData,
    ties: Ties,
}

impl LogLikelihood for PartialLikelihood<'_> {
    fn n_params(&self) -> usize {
        self.x.ncols()
    }

    fn evaluate(&self, theta: &Array1<f64>) -> Result<Derivatives> {
        partial_derivatives(self.x, theta, self.data, self.ties)
    }
}

/// w * v v' added into `target`
fn add_outer(target: &mut Array2<f64>, weight: f64, v: ArrayView1<f64>) {
    let p = v.len();
    for j in 0..p {
        for k in 0..p {
            target[[j, k]] += weight * v[j] * v[k];
        }
    }
}

/// groups of subject indices sharing a time, latest time first
fn time_blocks_descending(data: &SurvivalData) -> Vec<&[usize]> {
    let order = data.time_order();
    let times = data.times();
    let mut blocks = Vec::new();
    let mut end = order.len();
    while end > 0 {
        let t = times[order[end - 1]];
        let mut start = end;
        while start > 0 && times[order[start - 1]] == t {
            start -= 1;
        }
        blocks.push(&order[start..end]);
        end = start;
    }
    blocks
}

/// log partial likelihood, gradient and hessian in one backward sweep
fn partial_derivatives(
    x: ArrayView2<f64>,
    beta: &Array1<f64>,
    data: &SurvivalData,
    ties: Ties,
) -> Result<Derivatives> {
    let p = x.ncols();
    let events = data.events();
    let lp = x.dot(beta);
    // shifting every lp by the same constant leaves the likelihood unchanged
    let shift = lp.iter().copied().fold(f64::NEG_INFINITY, f64::max).max(0.0);
    let w = lp.mapv(|v| (v - shift).exp());
    if w.iter().any(|v| !v.is_finite()) {
        return Err(SurvivalError::numerical_error("risk score overflow"));
    }

    let mut loglik = 0.0;
    let mut gradient = Array1::zeros(p);
    let mut hessian = Array2::zeros((p, p));

    let mut s0 = 0.0;
    let mut s1 = Array1::<f64>::zeros(p);
    let mut s2 = Array2::<f64>::zeros((p, p));

    for block in time_blocks_descending(data) {
        let mut d = 0usize;
        let mut d0 = 0.0;
        let mut d1 = Array1::<f64>::zeros(p);
        let mut d2 = Array2::<f64>::zeros((p, p));

        for &i in block {
            let xi = x.row(i);
            s0 += w[i];
            s1.scaled_add(w[i], &xi);
            add_outer(&mut s2, w[i], xi);
            if events[i] {
                d += 1;
                d0 += w[i];
                d1.scaled_add(w[i], &xi);
                add_outer(&mut d2, w[i], xi);
                loglik += lp[i] - shift;
                gradient += &xi;
            }
        }

        for r in 0..d {
            let f = match ties {
                Ties::Breslow => 0.0,
                Ties::Efron => r as f64 / d as f64,
            };
            let a0 = s0 - f * d0;
            if a0 <= 0.0 {
                return Err(SurvivalError::numerical_error("risk set sum is non-positive"));
            }
            let mean = (&s1 - &(f * &d1)) / a0;
            let second = (&s2 - &(f * &d2)) / a0;

            loglik -= a0.ln();
            gradient -= &mean;
            hessian -= &second;
            add_outer(&mut hessian, 1.0, mean.view());
        }
    }

    Ok(Derivatives { loglik, gradient, hessian })
}

/// one distinct event time of the fitted model
#[derive(Debug, Clone, PartialEq)]
pub struct BaselinePoint {
    pub time: f64,
    pub n_risk: usize,
    pub n_event: usize,
    pub hazard: f64,     // increment at this time, at the covariate means
    pub cumhaz: f64,
}

/// per-event residuals, rows in ascending event time
#[derive(Debug, Clone)]
pub struct SchoenfeldResiduals {
    pub times: Vec<f64>,
    pub subjects: Vec<usize>,
    pub residuals: Array2<f64>,
}

/// quantities that need the converged coefficients
struct PostFit {
    baseline: Vec<BaselinePoint>,
    martingale: Array1<f64>,
    schoenfeld: SchoenfeldResiduals,
}

impl PostFit {
    fn compute(
        centered: ArrayView2<f64>,
        lp: &Array1<f64>,
        data: &SurvivalData,
        ties: Ties,
    ) -> Result<Self> {
        let p = centered.ncols();
        let n = data.n_samples();
        let times = data.times();
        let events = data.events();
        let w = lp.mapv(f64::exp);
        if w.iter().any(|v| !v.is_finite()) {
            return Err(SurvivalError::numerical_error("risk score overflow at the fitted coefficients"));
        }

        let mut s0 = 0.0;
        let mut s1 = Array1::<f64>::zeros(p);
        let mut at_risk = 0usize;

        // filled latest-first, reversed at the end
        let mut baseline = Vec::new();
        let mut tied_increment = Vec::new();
        let mut residual_rows: Vec<(f64, usize, Array1<f64>)> = Vec::new();

        for block in time_blocks_descending(data) {
            let mut tied = Vec::new();
            let mut d0 = 0.0;
            let mut d1 = Array1::<f64>::zeros(p);
            for &i in block {
                s0 += w[i];
                s1.scaled_add(w[i], &centered.row(i));
                at_risk += 1;
                if events[i] {
                    tied.push(i);
                    d0 += w[i];
                    d1.scaled_add(w[i], &centered.row(i));
                }
            }
            if tied.is_empty() {
                continue;
            }

            let d = tied.len();
            let mut full = 0.0;
            let mut partial = 0.0;
            let mut mean = Array1::<f64>::zeros(p);
            for r in 0..d {
                let f = match ties {
                    Ties::Breslow => 0.0,
                    Ties::Efron => r as f64 / d as f64,
                };
                let a0 = s0 - f * d0;
                full += 1.0 / a0;
                partial += (1.0 - f) / a0;
                mean += &((&s1 - &(f * &d1)) / a0);
            }
            mean /= d as f64;
            if ties == Ties::Breslow {
                partial = full;
            }

            let t = times[block[0]];
            baseline.push(BaselinePoint {
                time: t,
                n_risk: at_risk,
                n_event: d,
                hazard: full,
                cumhaz: 0.0,
            });
            tied_increment.push(partial);
            for &i in &tied {
                residual_rows.push((t, i, &centered.row(i) - &mean));
            }
        }

        baseline.reverse();
        tied_increment.reverse();
        let mut cumhaz = 0.0;
        for point in baseline.iter_mut() {
            cumhaz += point.hazard;
            point.cumhaz = cumhaz;
        }

        let martingale = Array1::from_shape_fn(n, |i| {
            let t = times[i];
            let idx = baseline.partition_point(|b| b.time <= t);
            if idx == 0 {
                return if events[i] { 1.0 } else { 0.0 };
            }
            let mut h = baseline[idx - 1].cumhaz;
            if events[i] && baseline[idx - 1].time == t {
                h += tied_increment[idx - 1] - baseline[idx - 1].hazard;
            }
            let delta = if events[i] { 1.0 } else { 0.0 };
            delta - w[i] * h
        });

        residual_rows.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let mut residuals = Array2::zeros((residual_rows.len(), p));
        for (row, (_, _, r)) in residual_rows.iter().enumerate() {
            residuals.row_mut(row).assign(r);
        }

        Ok(Self {
            baseline,
            martingale,
            schoenfeld: SchoenfeldResiduals {
                times: residual_rows.iter().map(|r| r.0).collect(),
                subjects: residual_rows.iter().map(|r| r.1).collect(),
                residuals,
            },
        })
    }
}

/// immutable result of a cox fit
#[derive(Debug, Clone)]
pub struct CoxFit {
    pub names: Vec<String>,
    pub coefficients: Array1<f64>,
    pub std_errors: Array1<f64>,
    pub covariance: Array2<f64>,
    pub loglik_null: f64,
    pub loglik: f64,
    pub iterations: usize,
    pub ties: Ties,
    pub n: usize,
    pub n_events: usize,
    pub means: Array1<f64>,             // covariate means; baseline is taken here
    pub linear_predictors: Array1<f64>, // (x - means) . beta
    pub concordance: Option<f64>,
    pub baseline: Vec<BaselinePoint>,
    pub martingale: Array1<f64>,
    pub schoenfeld: SchoenfeldResiduals,
}

impl CoxFit {
    pub fn n_params(&self) -> usize {
        self.coefficients.len()
    }

    /// exp(beta)
    pub fn hazard_ratios(&self) -> Array1<f64> {
        self.coefficients.mapv(f64::exp)
    }

    pub fn z_scores(&self) -> Array1<f64> {
        &self.coefficients / &self.std_errors
    }

    pub fn p_values(&self) -> Array1<f64> {
        self.z_scores().mapv(normal_two_sided_p)
    }

    /// confidence limits for the hazard ratios
    pub fn hazard_ratio_intervals(&self, level: f64) -> Result<Vec<(f64, f64)>> {
        if !(level > 0.0 && level < 1.0) {
            return Err(SurvivalError::invalid_parameter("level", level.to_string()));
        }
        let z = normal_quantile(1.0 - (1.0 - level) / 2.0);
        Ok(self
            .coefficients
            .iter()
            .zip(self.std_errors.iter())
            .map(|(&b, &se)| ((b - z * se).exp(), (b + z * se).exp()))
            .collect())
    }

    /// -2 log partial likelihood
    pub fn deviance(&self) -> f64 {
        -2.0 * self.loglik
    }

    /// 2 (loglik - loglik_null) on p df
    pub fn likelihood_ratio_test(&self) -> ChiSquareTest {
        let stat = (2.0 * (self.loglik - self.loglik_null)).max(0.0);
        ChiSquareTest::new(stat, self.n_params())
    }

    /// beta' V^-1 beta on p df
    pub fn wald_test(&self) -> Result<ChiSquareTest> {
        let inv = invert_matrix(&self.covariance)?;
        let stat = self.coefficients.dot(&inv.dot(&self.coefficients));
        Ok(ChiSquareTest::new(stat, self.n_params()))
    }

    /// baseline survival exp(-H0(t)) at the covariate means
    pub fn baseline_survival(&self) -> Vec<(f64, f64)> {
        self.baseline.iter().map(|b| (b.time, (-b.cumhaz).exp())).collect()
    }

    /// model-implied survival curve for one covariate vector
    pub fn survival_curve(&self, x: &[f64]) -> Result<Vec<(f64, f64)>> {
        if x.len() != self.n_params() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "expected {} covariate values, got {}",
                self.n_params(),
                x.len()
            )));
        }
        let eta: f64 = x
            .iter()
            .zip(self.means.iter())
            .zip(self.coefficients.iter())
            .map(|((v, m), b)| (v - m) * b)
            .sum();
        let risk = eta.exp();
        Ok(self
            .baseline
            .iter()
            .map(|b| (b.time, (-b.cumhaz * risk).exp()))
            .collect())
    }

    /// Schoenfeld residuals scaled by the variance, plus beta (as cox.zph plots them)
    pub fn scaled_schoenfeld(&self) -> Array2<f64> {
        let d = self.schoenfeld.residuals.nrows() as f64;
        let mut scaled = self.schoenfeld.residuals.dot(&self.covariance) * d;
        for mut row in scaled.axis_iter_mut(Axis(0)) {
            row += &self.coefficients;
        }
        scaled
    }

    /// print out what we learned
    pub fn print(&self) {
        print!("{}", self);
    }
}

impl fmt::Display for CoxFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cox proportional hazards model ({} ties)", self.ties)?;
        writeln!(f, "n = {}, events = {}", self.n, self.n_events)?;
        writeln!(f)?;
        writeln!(
            f,
            "{:<12} {:>12} {:>12} {:>12} {:>10} {:>10}",
            "covariate", "coef", "exp(coef)", "se(coef)", "z", "p"
        )?;
        writeln!(f, "{:-<73}", "")?;
        let z = self.z_scores();
        let p = self.p_values();
        for i in 0..self.n_params() {
            writeln!(
                f,
                "{:<12} {:>12.6} {:>12.6} {:>12.6} {:>10.3} {:>10.4}",
                self.names[i],
                self.coefficients[i],
                self.coefficients[i].exp(),
                self.std_errors[i],
                z[i],
                p[i]
            )?;
        }

        if self.n_params() > 0 {
            writeln!(f)?;
            writeln!(
                f,
                "{:<12} {:>12} {:>12} {:>12} {:>12}",
                "covariate", "exp(coef)", "exp(-coef)", "lower .95", "upper .95"
            )?;
            writeln!(f, "{:-<64}", "")?;
            if let Ok(intervals) = self.hazard_ratio_intervals(0.95) {
                for (i, (lower, upper)) in intervals.iter().enumerate() {
                    writeln!(
                        f,
                        "{:<12} {:>12.6} {:>12.6} {:>12.6} {:>12.6}",
                        self.names[i],
                        self.coefficients[i].exp(),
                        (-self.coefficients[i]).exp(),
                        lower,
                        upper
                    )?;
                }
            }
        }

        writeln!(f)?;
        if let Some(c) = self.concordance {
            writeln!(f, "concordance: {:.4}", c)?;
        }
        let lrt = self.likelihood_ratio_test();
        writeln!(
            f,
            "likelihood ratio test: {:.3} on {} df, p = {:.4}",
            lrt.statistic, lrt.df, lrt.p_value
        )?;
        match self.wald_test() {
            Ok(wald) => writeln!(
                f,
                "wald test:             {:.3} on {} df, p = {:.4}",
                wald.statistic, wald.df, wald.p_value
            ),
            Err(e) => writeln!(f, "wald test:             undefined ({})", e),
        }
    }
}

/// convenience: fit and log a one-line summary
pub fn fit_logged(model: &CoxModel, data: &SurvivalData) -> Result<CoxFit> {
    let fit = model.fit(data)?;
    info!(
        "cox [{}]: loglik {:.3} (null {:.3}), {} iterations",
        fit.names.join(" + "),
        fit.loglik,
        fit.loglik_null,
        fit.iterations
    );
    Ok(fit)
}
