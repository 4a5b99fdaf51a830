//! # nafld survival
//!
//! survival analysis of the NAFLD cohort - from a raw csv to a full report
//!
//! ## what you get
//!
//! - loading & cleaning w/ a count of what got dropped
//! - age and bmi classes, descriptive stats, correlations
//! - kaplan-meier curves w/ greenwood standard errors
//! - log-rank and peto-peto tests across strata
//! - cox regression (breslow or efron ties), residuals, PH tests
//! - fractional polynomial search for functional form
//! - exponential / weibull / lognormal / loglogistic fits ranked by AIC and BIC
//!
//! ## quick start
//!
//! ```rust
//! use nafld_survival::{CoxModel, KaplanMeier, SurvivalData};
//! use ndarray::Array2;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // setup some survival data
//! let times = vec![1.0, 2.5, 3.2, 4.1, 5.0, 6.3];
//! let events = vec![true, false, true, true, false, true]; // true = died, false = censored
//! let covariates = Array2::from_shape_vec((6, 1), vec![1.0, 0.5, 2.0, 1.0, 0.0, 1.5])?;
//! let data = SurvivalData::new(times, events, covariates)?
//!     .with_names(vec!["age".into()])?;
//!
//! // kaplan-meier
//! let curve = KaplanMeier::new().fit_data(&data)?;
//! println!("median survival: {:?}", curve.median());
//!
//! // cox w/ efron ties
//! let fit = CoxModel::new().fit(&data)?;
//! println!("hazard ratio: {:.3}", fit.hazard_ratios()[0]);
//! # Ok(())
//! # }
//! ```

pub mod binning;
pub mod cox;
pub mod data;
pub mod dataset;
pub mod describe;
pub mod diagnostics;
pub mod error;
pub mod fracpoly;
pub mod kaplan_meier;
pub mod logrank;
pub mod metrics;
pub mod optimization;
pub mod parametric;
pub mod report;

pub use cox::{CoxFit, CoxModel, Ties};
pub use data::SurvivalData;
pub use dataset::{load_cohort, CleaningReport, Cohort, Covariate, LoadOptions};
pub use diagnostics::{proportional_hazards_test, TimeTransform};
pub use error::{Result, SurvivalError};
pub use fracpoly::{fp_search, FpConfig};
pub use kaplan_meier::{KaplanMeier, SurvivalCurve};
pub use logrank::{weighted_log_rank, Weighting};
pub use parametric::{fit_parametric, rank_models, Distribution};
pub use report::{run_analysis, AnalysisConfig, AnalysisReport};

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_basic_functionality() {
        let n_samples = 100;
        let n_features = 3;

        let times = vec![1.0; n_samples];
        let events = vec![true; n_samples];
        let covariates = Array2::zeros((n_samples, n_features));

        let data = SurvivalData::new(times, events, covariates).unwrap();
        assert_eq!(data.n_samples(), n_samples);
        assert_eq!(data.n_features(), n_features);
        assert_eq!(data.event_times(), vec![1.0]);
    }
}
