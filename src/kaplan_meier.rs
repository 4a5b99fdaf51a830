//! Kaplan-Meier estimation with Greenwood standard errors.
//!
//! The curve is a right-continuous step function starting at S = 1. It only
//! drops at event times; censored subjects leave the risk set without moving
//! it.

use std::collections::BTreeMap;
use std::fmt::Display;

use log::debug;

use crate::data::SurvivalData;
use crate::error::{Result, SurvivalError};
use crate::metrics::normal_quantile;

/// scale on which pointwise confidence limits are built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceType {
    Plain,
    Log,
    LogLog,
}

#[derive(Debug, Clone)]
pub struct KmConfig {
    pub conf_level: f64,
    pub conf_type: ConfidenceType,
}

impl Default for KmConfig {
    fn default() -> Self {
        Self {
            conf_level: 0.95,
            conf_type: ConfidenceType::Log,
        }
    }
}

/// one row of the survival table
#[derive(Debug, Clone, PartialEq)]
pub struct CurvePoint {
    pub time: f64,
    pub n_risk: usize,
    pub n_event: usize,
    pub n_censor: usize,
    pub survival: f64,
    pub std_err: f64,           // greenwood se of S(t)
    pub lower: Option<f64>,     // None where the transform is undefined
    pub upper: Option<f64>,
}

/// fitted step function for one stratum
#[derive(Debug, Clone)]
pub struct SurvivalCurve {
    pub label: Option<String>,
    pub n: usize,
    pub n_events: usize,
    pub points: Vec<CurvePoint>,
}

impl SurvivalCurve {
    /// S(t), right-continuous; 1 before the first event
    pub fn survival_at(&self, t: f64) -> f64 {
        let idx = self.points.partition_point(|p| p.time <= t);
        if idx == 0 {
            1.0
        } else {
            self.points[idx - 1].survival
        }
    }

    /// S(t-), the value just before `t`
    pub fn survival_before(&self, t: f64) -> f64 {
        let idx = self.points.partition_point(|p| p.time < t);
        if idx == 0 {
            1.0
        } else {
            self.points[idx - 1].survival
        }
    }

    /// first time the curve reaches 0.5 or below
    pub fn median(&self) -> Option<f64> {
        self.points
            .iter()
            .find(|p| p.survival <= 0.5 + 1e-12)
            .map(|p| p.time)
    }

    /// Nelson-Aalen cumulative hazard at each event time
    pub fn cumulative_hazard(&self) -> Vec<(f64, f64)> {
        let mut h = 0.0;
        self.points
            .iter()
            .filter(|p| p.n_event > 0)
            .map(|p| {
                h += p.n_event as f64 / p.n_risk as f64;
                (p.time, h)
            })
            .collect()
    }

    /// curve points with the implicit (0, 1) origin prepended
    pub fn steps(&self) -> Vec<(f64, f64)> {
        let mut steps = Vec::with_capacity(self.points.len() + 1);
        if self.points.first().map_or(true, |p| p.time > 0.0) {
            steps.push((0.0, 1.0));
        }
        steps.extend(self.points.iter().map(|p| (p.time, p.survival)));
        steps
    }

    pub fn print(&self) {
        match &self.label {
            Some(label) => println!("stratum: {}", label),
            None => println!("all subjects"),
        }
        println!(
            "  n = {}, events = {}, median = {}",
            self.n,
            self.n_events,
            self.median().map_or("NA".to_string(), |m| format!("{:.1}", m))
        );
    }
}

/// kaplan-meier estimator
#[derive(Debug, Clone, Default)]
pub struct KaplanMeier {
    config: KmConfig,
}

impl KaplanMeier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: KmConfig) -> Self {
        Self { config }
    }

    pub fn with_conf_level(mut self, level: f64) -> Self {
        self.config.conf_level = level;
        self
    }

    pub fn with_conf_type(mut self, conf_type: ConfidenceType) -> Self {
        self.config.conf_type = conf_type;
        self
    }

    fn z_value(&self) -> Result<f64> {
        let level = self.config.conf_level;
        if !(level > 0.0 && level < 1.0) {
            return Err(SurvivalError::invalid_parameter("conf_level", level.to_string()));
        }
        Ok(normal_quantile(1.0 - (1.0 - level) / 2.0))
    }

    /// fit one curve over all subjects
    pub fn fit(&self, times: &[f64], events: &[bool]) -> Result<SurvivalCurve> {
        let data = SurvivalData::without_covariates(times.to_vec(), events.to_vec())?;
        self.fit_data(&data)
    }

    pub fn fit_data(&self, data: &SurvivalData) -> Result<SurvivalCurve> {
        let z = self.z_value()?;
        let times = data.times();
        let events = data.events();
        let order = data.time_order();
        let n = data.n_samples();

        let mut points = Vec::new();
        let mut survival = 1.0;
        let mut greenwood = 0.0; // running sum of d / (n (n - d))
        let mut at_risk = n;
        let mut i = 0;

        while i < n {
            let t = times[order[i]];
            let mut n_event = 0;
            let mut n_censor = 0;
            while i < n && times[order[i]] == t {
                if events[order[i]] {
                    n_event += 1;
                } else {
                    n_censor += 1;
                }
                i += 1;
            }

            if n_event > 0 {
                let (d, r) = (n_event as f64, at_risk as f64);
                survival *= 1.0 - d / r;
                if n_event < at_risk {
                    greenwood += d / (r * (r - d));
                }
            }

            let std_err = survival * greenwood.sqrt();
            let (lower, upper) = self.limits(survival, greenwood, z);
            points.push(CurvePoint {
                time: t,
                n_risk: at_risk,
                n_event,
                n_censor,
                survival,
                std_err,
                lower,
                upper,
            });

            at_risk -= n_event + n_censor;
        }

        Ok(SurvivalCurve {
            label: None,
            n,
            n_events: data.n_events(),
            points,
        })
    }

    /// pointwise limits; log S and log(-log S) are guarded at S = 0 and S = 1
    fn limits(&self, s: f64, greenwood: f64, z: f64) -> (Option<f64>, Option<f64>) {
        if s <= 0.0 {
            return (None, None);
        }
        let se_log = greenwood.sqrt();
        match self.config.conf_type {
            ConfidenceType::Plain => {
                let half = z * s * se_log;
                (Some((s - half).max(0.0)), Some((s + half).min(1.0)))
            }
            ConfidenceType::Log => {
                let lo = s * (-z * se_log).exp();
                let hi = s * (z * se_log).exp();
                (Some(lo.max(0.0)), Some(hi.min(1.0)))
            }
            ConfidenceType::LogLog => {
                if s >= 1.0 {
                    return (None, None);
                }
                let se = se_log / s.ln().abs();
                let lo = s.powf((z * se).exp());
                let hi = s.powf((-z * se).exp());
                (Some(lo.clamp(0.0, 1.0)), Some(hi.clamp(0.0, 1.0)))
            }
        }
    }

    /// one curve per stratum, strata in label order; unlabeled rows are skipped
    pub fn fit_stratified<L>(
        &self,
        times: &[f64],
        events: &[bool],
        labels: &[Option<L>],
    ) -> Result<Vec<SurvivalCurve>>
    where
        L: Ord + Clone + Display,
    {
        if times.len() != labels.len() || events.len() != labels.len() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "{} times, {} events, {} labels",
                times.len(),
                events.len(),
                labels.len()
            )));
        }

        let mut groups: BTreeMap<L, (Vec<f64>, Vec<bool>)> = BTreeMap::new();
        let mut skipped = 0;
        for ((&t, &e), label) in times.iter().zip(events).zip(labels) {
            match label {
                Some(l) => {
                    let entry = groups.entry(l.clone()).or_default();
                    entry.0.push(t);
                    entry.1.push(e);
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!("{} subjects without a stratum label left out of stratified fit", skipped);
        }

        groups
            .into_iter()
            .map(|(label, (t, e))| {
                let mut curve = self.fit(&t, &e)?;
                curve.label = Some(label.to_string());
                Ok(curve)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_three_of_ten_at_day_five() {
        let times = vec![5.0, 5.0, 5.0, 8.0, 9.0, 12.0, 12.0, 15.0, 20.0, 22.0];
        let events = vec![true, true, true, false, true, true, false, true, false, true];
        let curve = KaplanMeier::new().fit(&times, &events).unwrap();

        assert_relative_eq!(curve.survival_at(4.9), 1.0, epsilon = 1e-12);
        assert_relative_eq!(curve.survival_at(5.0), 0.7, epsilon = 1e-12);
        // 6 at risk at day 9
        assert_relative_eq!(curve.survival_at(9.0), 0.7 * 5.0 / 6.0, epsilon = 1e-12);
        assert_eq!(curve.points[0].n_risk, 10);
        assert_eq!(curve.points[0].n_event, 3);
    }

    #[test]
    fn test_greenwood_by_hand() {
        let times = vec![1.0, 2.0, 3.0, 4.0];
        let events = vec![true, false, true, false];
        let curve = KaplanMeier::new().fit(&times, &events).unwrap();

        // S(1) = 3/4, var = S^2 * 1/(4*3)
        let p = &curve.points[0];
        assert_relative_eq!(p.survival, 0.75, epsilon = 1e-12);
        assert_relative_eq!(p.std_err, 0.75 * (1.0f64 / 12.0).sqrt(), epsilon = 1e-12);

        // S(3) = 3/4 * 1/2, var sum = 1/12 + 1/(2*1)
        let p = &curve.points[2];
        assert_relative_eq!(p.survival, 0.375, epsilon = 1e-12);
        assert_relative_eq!(p.std_err, 0.375 * (1.0f64 / 12.0 + 0.5).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_curve_is_non_increasing() {
        let times = vec![2.0, 3.0, 3.0, 7.0, 7.0, 7.0, 9.0, 11.0, 11.0, 14.0];
        let events = vec![true, false, true, true, true, false, true, false, true, true];
        let curve = KaplanMeier::new().fit(&times, &events).unwrap();

        for w in curve.points.windows(2) {
            assert!(w[1].survival <= w[0].survival + 1e-15);
        }
        assert_eq!(curve.steps()[0], (0.0, 1.0));
    }

    #[test]
    fn test_all_die_guards_intervals() {
        let curve = KaplanMeier::new().fit(&[1.0, 2.0], &[true, true]).unwrap();
        let last = curve.points.last().unwrap();
        assert_eq!(last.survival, 0.0);
        assert!(last.lower.is_none() && last.upper.is_none());
        assert!(last.std_err.is_finite());
    }

    #[test]
    fn test_loglog_undefined_before_first_event() {
        let curve = KaplanMeier::new()
            .with_conf_type(ConfidenceType::LogLog)
            .fit(&[1.0, 2.0, 3.0], &[false, true, true])
            .unwrap();
        assert!(curve.points[0].lower.is_none());
        let p = &curve.points[1];
        let (lo, hi) = (p.lower.unwrap(), p.upper.unwrap());
        assert!(lo <= p.survival && p.survival <= hi);
    }

    #[test]
    fn test_median_and_hazard() {
        let curve = KaplanMeier::new()
            .fit(&[1.0, 2.0, 3.0, 4.0], &[true, true, true, true])
            .unwrap();
        assert_eq!(curve.median(), Some(2.0));
        let h = curve.cumulative_hazard();
        assert_relative_eq!(h[1].1, 0.25 + 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_stratified_skips_unlabeled() {
        let times = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let events = vec![true, true, false, true, true];
        let labels = vec![Some(1u8), Some(0), None, Some(1), Some(0)];
        let curves = KaplanMeier::new().fit_stratified(&times, &events, &labels).unwrap();

        assert_eq!(curves.len(), 2);
        assert_eq!(curves[0].label.as_deref(), Some("0"));
        assert_eq!(curves[0].n + curves[1].n, 4);
    }

    #[test]
    fn test_bad_conf_level() {
        let km = KaplanMeier::new().with_conf_level(1.5);
        assert!(km.fit(&[1.0], &[true]).is_err());
    }
}
