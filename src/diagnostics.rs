//! Checks on a fitted Cox model: the Schoenfeld-residual test of
//! proportional hazards and martingale residual trends for functional form.

use std::fmt;

use ndarray::{Array1, Array2};

use crate::cox::CoxFit;
use crate::data::SurvivalData;
use crate::describe::quantile_sorted;
use crate::error::{Result, SurvivalError};
use crate::kaplan_meier::KaplanMeier;
use crate::metrics::ChiSquareTest;

/// scale on which event times are correlated with the residuals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeTransform {
    Identity,
    Rank,
    Log,
    /// 1 - S(t-) from the pooled kaplan-meier curve
    KaplanMeier,
}

impl TimeTransform {
    pub const ALL: [TimeTransform; 4] = [
        TimeTransform::Identity,
        TimeTransform::Rank,
        TimeTransform::Log,
        TimeTransform::KaplanMeier,
    ];
}

impl fmt::Display for TimeTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeTransform::Identity => "identity",
            TimeTransform::Rank => "rank",
            TimeTransform::Log => "log",
            TimeTransform::KaplanMeier => "km",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ZphRow {
    pub covariate: String,
    pub rho: f64, // correlation of scaled residuals with transformed time
    pub test: ChiSquareTest,
}

/// proportional hazards test under one time transform
#[derive(Debug, Clone)]
pub struct ZphTest {
    pub transform: TimeTransform,
    pub rows: Vec<ZphRow>,
    pub global: ChiSquareTest,
    pub transformed_times: Vec<f64>,
    pub scaled_residuals: Array2<f64>, // for residual-vs-time plots
}

impl ZphTest {
    /// covariates whose PH assumption is rejected at `alpha`
    pub fn violations(&self, alpha: f64) -> Vec<&str> {
        self.rows
            .iter()
            .filter(|r| r.test.is_significant(alpha))
            .map(|r| r.covariate.as_str())
            .collect()
    }

    pub fn print(&self) {
        println!("proportional hazards test, transform = {}", self.transform);
        println!("{:<12} {:>8} {:>10} {:>10}", "", "rho", "chisq", "p");
        for row in &self.rows {
            println!(
                "{:<12} {:>8.4} {:>10.4} {:>10.4}",
                row.covariate, row.rho, row.test.statistic, row.test.p_value
            );
        }
        println!(
            "{:<12} {:>8} {:>10.4} {:>10.4}",
            "GLOBAL", "NA", self.global.statistic, self.global.p_value
        );
    }
}

fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < idx.len() {
        let mut j = i;
        while j + 1 < idx.len() && values[idx[j + 1]] == values[idx[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &k in &idx[i..=j] {
            ranks[k] = avg;
        }
        i = j + 1;
    }
    ranks
}

fn transform_times(
    transform: TimeTransform,
    event_times: &[f64],
    data: &SurvivalData,
) -> Result<Vec<f64>> {
    match transform {
        TimeTransform::Identity => Ok(event_times.to_vec()),
        TimeTransform::Rank => Ok(average_ranks(event_times)),
        TimeTransform::Log => {
            if event_times.iter().any(|&t| t <= 0.0) {
                return Err(SurvivalError::numerical_error(
                    "log time transform needs positive event times",
                ));
            }
            Ok(event_times.iter().map(|t| t.ln()).collect())
        }
        TimeTransform::KaplanMeier => {
            let times = data.times().to_vec();
            let events = data.events().to_vec();
            let curve = KaplanMeier::new().fit(&times, &events)?;
            Ok(event_times.iter().map(|&t| 1.0 - curve.survival_before(t)).collect())
        }
    }
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let mut sab = 0.0;
    let mut saa = 0.0;
    let mut sbb = 0.0;
    for (x, y) in a.iter().zip(b) {
        sab += (x - ma) * (y - mb);
        saa += (x - ma).powi(2);
        sbb += (y - mb).powi(2);
    }
    if saa <= 0.0 || sbb <= 0.0 {
        0.0
    } else {
        sab / (saa * sbb).sqrt()
    }
}

/// Grambsch-Therneau test of proportional hazards
///
/// `data` must be the data `fit` came from; it is only needed for the
/// kaplan-meier transform.
pub fn proportional_hazards_test(
    fit: &CoxFit,
    data: &SurvivalData,
    transform: TimeTransform,
) -> Result<ZphTest> {
    let resid = &fit.schoenfeld.residuals;
    let d = resid.nrows();
    let p = resid.ncols();
    if p == 0 {
        return Err(SurvivalError::invalid_dimensions("model has no covariates to test"));
    }
    if d < 2 {
        return Err(SurvivalError::numerical_error("need at least 2 events for the PH test"));
    }
    if data.n_samples() != fit.n {
        return Err(SurvivalError::invalid_dimensions("data is not the data the model was fit on"));
    }

    let g = transform_times(transform, &fit.schoenfeld.times, data)?;
    let mean_g = g.iter().sum::<f64>() / d as f64;
    let centered = Array1::from(g.iter().map(|v| v - mean_g).collect::<Vec<_>>());
    let ss = centered.dot(&centered);
    if ss <= 0.0 {
        return Err(SurvivalError::numerical_error(format!(
            "transformed event times ({}) have no spread",
            transform
        )));
    }

    let var = &fit.covariance;
    let d_f = d as f64;
    let u = centered.dot(resid); // g~' R, length p
    let scaled_no_beta = resid.dot(var) * d_f;
    let gu = centered.dot(&scaled_no_beta); // g~' R V d

    let scaled = fit.scaled_schoenfeld();
    let rows = (0..p)
        .map(|j| {
            let denom = ss * var[[j, j]] * d_f;
            let stat = if denom > 0.0 { gu[j].powi(2) / denom } else { 0.0 };
            let column = scaled.column(j).to_vec();
            ZphRow {
                covariate: fit.names[j].clone(),
                rho: pearson(&g, &column),
                test: ChiSquareTest::new(stat, 1),
            }
        })
        .collect();

    let global_stat = u.dot(&var.dot(&u)) * d_f / ss;

    Ok(ZphTest {
        transform,
        rows,
        global: ChiSquareTest::new(global_stat.max(0.0), p),
        transformed_times: g,
        scaled_residuals: scaled,
    })
}

/// martingale residuals against one covariate with a lowess smooth
#[derive(Debug, Clone)]
pub struct MartingaleTrend {
    pub covariate: String,
    pub points: Vec<(f64, f64)>, // (covariate value, residual), sorted by value
    pub smooth: Vec<f64>,        // lowess fit at each point
}

impl MartingaleTrend {
    /// max - min of the smooth; near zero when the functional form is fine
    pub fn smooth_range(&self) -> f64 {
        let max = self.smooth.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = self.smooth.iter().copied().fold(f64::INFINITY, f64::min);
        if max.is_finite() && min.is_finite() {
            max - min
        } else {
            0.0
        }
    }
}

pub fn martingale_trend(fit: &CoxFit, covariate: &str, values: &[f64]) -> Result<MartingaleTrend> {
    if values.len() != fit.martingale.len() {
        return Err(SurvivalError::invalid_dimensions(format!(
            "{} values for {} residuals",
            values.len(),
            fit.martingale.len()
        )));
    }
    let mut points: Vec<(f64, f64)> = values
        .iter()
        .copied()
        .zip(fit.martingale.iter().copied())
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    let x: Vec<f64> = points.iter().map(|p| p.0).collect();
    let y: Vec<f64> = points.iter().map(|p| p.1).collect();
    let smooth = lowess(&x, &y, 2.0 / 3.0, 3)?;

    Ok(MartingaleTrend {
        covariate: covariate.to_string(),
        points,
        smooth,
    })
}

fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        (1.0 - u.powi(3)).powi(3)
    }
}

fn bisquare(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        (1.0 - u * u).powi(2)
    }
}

/// Cleveland's lowess on x-sorted data: local linear fits with tricube
/// weights over a span of `f * n` points, then `iterations` robustness passes
pub fn lowess(x: &[f64], y: &[f64], f: f64, iterations: usize) -> Result<Vec<f64>> {
    let n = x.len();
    if n != y.len() {
        return Err(SurvivalError::invalid_dimensions("lowess x and y differ in length"));
    }
    if !(f > 0.0 && f <= 1.0) {
        return Err(SurvivalError::invalid_parameter("span", f.to_string()));
    }
    if n < 2 {
        return Ok(y.to_vec());
    }

    if x.windows(2).any(|w| w[0] > w[1]) {
        return Err(SurvivalError::invalid_parameter("x", "not sorted ascending"));
    }

    let span = ((f * n as f64).ceil() as usize).clamp(2, n);
    let mut robustness = vec![1.0; n];
    let mut fitted = vec![0.0; n];

    for pass in 0..=iterations {
        // the span nearest neighbours of a sorted x form a sliding window
        let mut lo = 0;
        for i in 0..n {
            while lo + span < n && x[i] - x[lo] > x[lo + span] - x[i] {
                lo += 1;
            }
            let h = (x[i] - x[lo]).max(x[lo + span - 1] - x[i]);
            let left = x.partition_point(|&v| v < x[i] - h);
            let right = x.partition_point(|&v| v <= x[i] + h);

            let mut sw = 0.0;
            let mut swx = 0.0;
            let mut swy = 0.0;
            let mut swxx = 0.0;
            let mut swxy = 0.0;
            for j in left..right {
                let local = if h > 0.0 {
                    tricube((x[j] - x[i]).abs() / h)
                } else if x[j] == x[i] {
                    1.0
                } else {
                    0.0
                };
                let w = local * robustness[j];
                sw += w;
                swx += w * x[j];
                swy += w * y[j];
                swxx += w * x[j] * x[j];
                swxy += w * x[j] * y[j];
            }

            fitted[i] = if sw <= 0.0 {
                y[i]
            } else {
                let mx = swx / sw;
                let my = swy / sw;
                let sxx = swxx / sw - mx * mx;
                if sxx > 1e-12 * (1.0 + mx * mx) {
                    let slope = (swxy / sw - mx * my) / sxx;
                    my + slope * (x[i] - mx)
                } else {
                    my
                }
            };
        }

        if pass == iterations {
            break;
        }
        let residuals: Vec<f64> = y.iter().zip(&fitted).map(|(a, b)| (a - b).abs()).collect();
        let mut sorted = residuals.clone();
        sorted.sort_by(f64::total_cmp);
        let s = quantile_sorted(&sorted, 0.5);
        if s <= 0.0 {
            break;
        }
        for (r, e) in robustness.iter_mut().zip(&residuals) {
            *r = bisquare(e / (6.0 * s));
        }
    }

    Ok(fitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cox::{CoxModel, Ties};
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn fitted() -> (CoxFit, SurvivalData) {
        let times = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let events = vec![true, true, false, true, true, true, false, true, true, false, true, true];
        let x = Array2::from_shape_vec((12, 1), vec![
            1.2, 0.4, -0.3, 0.9, -1.1, 0.2, 0.0, -0.6, 0.5, -0.2, -1.4, 0.8,
        ]).unwrap();
        let data = SurvivalData::new(times, events, x)
            .unwrap()
            .with_names(vec!["x".into()])
            .unwrap();
        let fit = CoxModel::new().with_ties(Ties::Breslow).fit(&data).unwrap();
        (fit, data)
    }

    #[test]
    fn test_ranks_average_ties() {
        assert_eq!(average_ranks(&[3.0, 1.0, 3.0, 2.0]), vec![3.5, 1.0, 3.5, 2.0]);
    }

    #[test]
    fn test_every_transform_gives_valid_p() {
        let (fit, data) = fitted();
        for transform in TimeTransform::ALL {
            let zph = proportional_hazards_test(&fit, &data, transform).unwrap();
            assert_eq!(zph.rows.len(), 1);
            let p = zph.rows[0].test.p_value;
            assert!((0.0..=1.0).contains(&p));
            // one covariate: the global test is the covariate test
            assert_relative_eq!(zph.global.statistic, zph.rows[0].test.statistic, epsilon = 1e-9);
            assert_eq!(zph.transformed_times.len(), data.n_events());
        }
    }

    #[test]
    fn test_log_transform_rejects_time_zero() {
        let times = vec![0.0, 2.0, 3.0, 4.0, 5.0];
        let events = vec![true, true, true, false, true];
        let x = Array2::from_shape_vec((5, 1), vec![1.0, 0.0, 0.5, -1.0, 0.3]).unwrap();
        let data = SurvivalData::new(times, events, x).unwrap();
        let fit = CoxModel::new().fit(&data).unwrap();
        assert!(proportional_hazards_test(&fit, &data, TimeTransform::Log).is_err());
        assert!(proportional_hazards_test(&fit, &data, TimeTransform::Rank).is_ok());
    }

    #[test]
    fn test_lowess_reproduces_a_line() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v - 1.0).collect();
        let fit = lowess(&x, &y, 2.0 / 3.0, 3).unwrap();
        for (a, b) in fit.iter().zip(&y) {
            assert_relative_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_martingale_trend_sorted() {
        let (fit, data) = fitted();
        let values = data.covariates().column(0).to_vec();
        let trend = martingale_trend(&fit, "x", &values).unwrap();
        assert_eq!(trend.points.len(), 12);
        for w in trend.points.windows(2) {
            assert!(w[0].0 <= w[1].0);
        }
        assert!(trend.smooth_range().is_finite());
        assert!(martingale_trend(&fit, "x", &values[..3]).is_err());
    }
}
