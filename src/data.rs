use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use crate::error::{Result, SurvivalError};

/// survival data - times, events, and covariates for one model
#[derive(Debug, Clone)]
pub struct SurvivalData {
    times: Array1<f64>,         // follow-up time to event/censoring
    events: Array1<bool>,       // true = event, false = censored
    covariates: Array2<f64>,    // n_samples x n_features
    names: Vec<String>,         // one label per covariate column
    order: Vec<usize>,          // indices sorted by ascending time
}

impl SurvivalData {
    /// make new survival data from raw vecs/arrays
    pub fn new(
        times: Vec<f64>,         // follow-up times
        events: Vec<bool>,       // true = event occurred, false = censored
        covariates: Array2<f64>, // covariate matrix, may have zero columns
    ) -> Result<Self> {
        let n_samples = times.len();

        if events.len() != n_samples {
            return Err(SurvivalError::invalid_dimensions(format!(
                "times len ({}) != events len ({})",
                n_samples,
                events.len()
            )));
        }

        if covariates.nrows() != n_samples {
            return Err(SurvivalError::invalid_dimensions(format!(
                "covariates rows ({}) != n_samples ({})",
                covariates.nrows(),
                n_samples
            )));
        }

        if times.iter().any(|&t| t < 0.0 || !t.is_finite()) {
            return Err(SurvivalError::invalid_survival_data(
                "follow-up times must be non-negative & finite",
            ));
        }

        if covariates.iter().any(|v| !v.is_finite()) {
            return Err(SurvivalError::invalid_survival_data(
                "covariates must be finite",
            ));
        }

        let names = (0..covariates.ncols()).map(|j| format!("x{}", j)).collect();

        let mut order: Vec<usize> = (0..n_samples).collect();
        order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));

        Ok(Self {
            times: Array1::from(times),
            events: Array1::from(events),
            covariates,
            names,
            order,
        })
    }

    /// data with no covariates at all (kaplan-meier, intercept-only models)
    pub fn without_covariates(times: Vec<f64>, events: Vec<bool>) -> Result<Self> {
        let n = times.len();
        Self::new(times, events, Array2::zeros((n, 0)))
    }

    /// attach covariate labels
    pub fn with_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.n_features() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "{} names for {} covariates",
                names.len(),
                self.n_features()
            )));
        }
        self.names = names;
        Ok(self)
    }

    /// same subjects, different covariate matrix (used by the fp search)
    pub fn with_covariates(&self, covariates: Array2<f64>, names: Vec<String>) -> Result<Self> {
        Self::new(self.times.to_vec(), self.events.to_vec(), covariates)?.with_names(names)
    }

    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    pub fn n_features(&self) -> usize {
        self.covariates.ncols()
    }

    /// number of observed events
    pub fn n_events(&self) -> usize {
        self.events.iter().filter(|&&e| e).count()
    }

    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    /// event indicators (true = event, false = censored)
    pub fn events(&self) -> ArrayView1<'_, bool> {
        self.events.view()
    }

    pub fn covariates(&self) -> ArrayView2<'_, f64> {
        self.covariates.view()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// subject indices in ascending time order
    pub fn time_order(&self) -> &[usize] {
        &self.order
    }

    /// unique event times in order
    pub fn event_times(&self) -> Vec<f64> {
        let mut times: Vec<f64> = self
            .order
            .iter()
            .filter(|&&i| self.events[i])
            .map(|&i| self.times[i])
            .collect();
        times.dedup();
        times
    }

    /// column means and standard deviations, sd = 1 for constant columns
    pub fn covariate_moments(&self) -> (Array1<f64>, Array1<f64>) {
        let p = self.n_features();
        if self.n_samples() == 0 {
            return (Array1::zeros(p), Array1::ones(p));
        }
        let means = self
            .covariates
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(p));
        let stds = self
            .covariates
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 0.0 { s } else { 1.0 });
        (means, stds)
    }

    /// z-scored copy of the covariates, plus the means and sds used
    pub fn standardized_covariates(&self) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
        let (means, stds) = self.covariate_moments();
        let mut z = self.covariates.clone();
        for (j, mut col) in z.axis_iter_mut(Axis(1)).enumerate() {
            col.mapv_inplace(|v| (v - means[j]) / stds[j]);
        }
        (z, means, stds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_data() -> SurvivalData {
        let times = vec![3.0, 2.0, 1.0, 4.0, 5.0];
        let events = vec![true, false, true, true, false];
        let covariates = Array2::from_shape_vec((5, 2), vec![
            5.0, 6.0,
            3.0, 4.0,
            1.0, 2.0,
            7.0, 8.0,
            9.0, 10.0,
        ]).unwrap();

        SurvivalData::new(times, events, covariates).unwrap()
    }

    #[test]
    fn test_survival_data_creation() {
        let data = create_test_data();
        assert_eq!(data.n_samples(), 5);
        assert_eq!(data.n_features(), 2);
        assert_eq!(data.n_events(), 3);
        assert_eq!(data.event_times(), vec![1.0, 3.0, 4.0]);
        assert_eq!(data.time_order(), &[2, 1, 0, 3, 4]);
    }

    #[test]
    fn test_invalid_dimensions() {
        let times = vec![1.0, 2.0];
        let events = vec![true];
        let covariates = Array2::zeros((2, 2));

        assert!(SurvivalData::new(times, events, covariates).is_err());
    }

    #[test]
    fn test_zero_time_allowed_negative_rejected() {
        let ok = SurvivalData::without_covariates(vec![0.0, 2.0], vec![true, false]);
        assert!(ok.is_ok());

        let bad = SurvivalData::without_covariates(vec![-1.0, 2.0], vec![true, false]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_names_must_match_columns() {
        let data = create_test_data();
        assert!(data.clone().with_names(vec!["age".into()]).is_err());
        let named = data.with_names(vec!["age".into(), "bmi".into()]).unwrap();
        assert_eq!(named.names(), &["age".to_string(), "bmi".to_string()]);
    }

    #[test]
    fn test_standardization_leaves_covariates_alone() {
        let data = create_test_data();
        let (z, means, _stds) = data.standardized_covariates();

        for j in 0..data.n_features() {
            let col_mean = z.column(j).mean().unwrap();
            assert_relative_eq!(col_mean, 0.0, epsilon = 1e-10);
        }

        assert_relative_eq!(means[0], 5.0, epsilon = 1e-10);
        assert_relative_eq!(means[1], 6.0, epsilon = 1e-10);
        assert_relative_eq!(data.covariates()[[0, 0]], 5.0, epsilon = 1e-10);
    }
}
