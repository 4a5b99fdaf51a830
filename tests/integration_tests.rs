use std::path::PathBuf;

use approx::assert_relative_eq;
use nafld_survival::{
    fit_parametric, load_cohort, rank_models, run_analysis, AnalysisConfig, CoxModel, Distribution,
    KaplanMeier, LoadOptions, SurvivalData, SurvivalError, Ties,
};
use nafld_survival::fracpoly::FpForm;
use nafld_survival::optimization::OptimizationConfig;
use nafld_survival::report::Outcome;
use ndarray::{Array1, Array2};

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data/nafld_sample.csv")
}

fn create_synthetic_data(n_samples: usize, n_features: usize, seed: u64) -> SurvivalData {
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    let mut rng = StdRng::seed_from_u64(seed);

    let mut covariates_vec = Vec::with_capacity(n_samples * n_features);
    for _ in 0..(n_samples * n_features) {
        covariates_vec.push(rng.gen_range(-2.0..2.0));
    }
    let covariates = Array2::from_shape_vec((n_samples, n_features), covariates_vec).unwrap();

    let mut times = Vec::with_capacity(n_samples);
    let mut events = Vec::with_capacity(n_samples);

    let true_coefficients = Array1::from(vec![0.5, -0.3, 0.2]);

    for i in 0..n_samples {
        let n_coef = n_features.min(3);
        let linear_pred: f64 = covariates
            .row(i)
            .slice(ndarray::s![0..n_coef])
            .dot(&true_coefficients.slice(ndarray::s![0..n_coef]));

        // continuous times, so no ties
        let hazard = linear_pred.exp();
        let time = -(1.0 - rng.r#gen::<f64>()).ln() / (0.1 * hazard);
        let censoring_time = rng.gen_range(1.0..30.0);

        if time < censoring_time {
            times.push(time);
            events.push(true);
        } else {
            times.push(censoring_time);
            events.push(false);
        }
    }

    let names = (0..n_features).map(|j| format!("x{}", j + 1)).collect();
    SurvivalData::new(times, events, covariates)
        .unwrap()
        .with_names(names)
        .unwrap()
}

fn temp_file(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("nafld_survival_{}_{}", std::process::id(), name));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_fixture_cleaning_counts() {
    let (cohort, report) = load_cohort(fixture(), &LoadOptions::default()).unwrap();
    assert_eq!(report.rows_read, 80);
    assert_eq!(report.rows_kept, 75);
    assert_eq!(report.rows_missing, 4);
    assert_eq!(report.rows_malformed, 1);
    assert_eq!(cohort.len(), 75);
    assert_eq!(cohort.events().iter().filter(|&&e| e).count(), 50);
}

#[test]
fn test_missing_column_is_schema_error() {
    let path = temp_file("no_bmi.csv", "id,status,futime,age,male,weight,height\n1,1,100,50,1,80,175\n");
    let result = load_cohort(&path, &LoadOptions::default());
    std::fs::remove_file(&path).ok();
    assert!(matches!(result, Err(SurvivalError::Schema { .. })));
}

#[test]
fn test_custom_delimiter() {
    let path = temp_file(
        "semicolon.csv",
        "id;status;futime;age;male;weight;height;bmi\n1;1;100;50;1;80;175;26.1\n2;0;250;NA;0;60;160;23.4\n",
    );
    let result = load_cohort(&path, &LoadOptions::default().with_delimiter(b';'));
    std::fs::remove_file(&path).ok();
    let (cohort, report) = result.unwrap();
    assert_eq!(cohort.len(), 1);
    assert_eq!(report.rows_missing, 1);
}

#[test]
fn test_ragged_rows_are_counted_not_fatal() {
    let path = temp_file(
        "ragged.csv",
        "id,status,futime,age,male,weight,height,bmi\n\
         1,1,100,50,1,80,175,26.1\n\
         2,0,250,40,0,60\n\
         3,0,400,61,1,90,180,27.8\n\
         4,1,120,55,0,70,165,25.7,extra\n",
    );
    let result = load_cohort(&path, &LoadOptions::default());
    std::fs::remove_file(&path).ok();
    let (cohort, report) = result.unwrap();
    assert_eq!(report.rows_read, 4);
    assert_eq!(report.rows_kept, 2);
    assert_eq!(report.rows_missing, 1);
    assert_eq!(report.rows_malformed, 1);
    let ids: Vec<u64> = cohort.subjects().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn test_full_pipeline_on_fixture() {
    let (cohort, _) = load_cohort(fixture(), &LoadOptions::default()).unwrap();
    let report = run_analysis(&cohort, &AnalysisConfig::default()).unwrap();

    assert_eq!(report.n_subjects, 75);
    assert_eq!(report.summaries.len(), 8);

    // overall curve starts at 1 and never rises
    let steps = report.overall.steps();
    assert_eq!(steps[0], (0.0, 1.0));
    for w in steps.windows(2) {
        assert!(w[1].1 <= w[0].1);
    }

    // every age class has events in the fixture
    let by_age = report.comparisons.iter().find(|c| c.grouping == "agecl").unwrap();
    let lr = by_age.log_rank.computed().unwrap();
    assert_eq!(lr.test.df, by_age.curves.len() - 1);
    assert!((0.0..=1.0).contains(&lr.test.p_value));

    assert_eq!(report.cox.names, vec!["age", "male", "bmi"]);
    assert_eq!(report.cox.ties, Ties::Efron);
    assert!(report.cox.loglik >= report.cox.loglik_null);
    assert!(report.zph.iter().all(|(_, z)| z.is_computed()));

    assert_eq!(report.parametric.len(), 8);
    let ranked = &report.ranking.by_aic;
    for w in ranked.windows(2) {
        assert!(w[0].aic <= w[1].aic);
    }
    if let Outcome::Computed(fp) = &report.fractional_polynomials {
        assert_eq!(fp.terms.len(), 3);
        assert_eq!(fp.form_of("male"), Some(FpForm::Linear));
    }
}

#[test]
fn test_cox_recovers_coefficients() {
    let data = create_synthetic_data(500, 3, 42);
    let fit = CoxModel::new().fit(&data).unwrap();

    let truth = [0.5, -0.3, 0.2];
    for (b, t) in fit.coefficients.iter().zip(truth) {
        assert!((b - t).abs() < 0.25, "estimate {} vs truth {}", b, t);
    }
    assert!(fit.likelihood_ratio_test().p_value < 0.001);
    assert!(fit.concordance.unwrap() > 0.6);
}

#[test]
fn test_breslow_and_efron_agree_without_ties() {
    let data = create_synthetic_data(150, 2, 7);
    let efron = CoxModel::new().with_ties(Ties::Efron).fit(&data).unwrap();
    let breslow = CoxModel::new().with_ties(Ties::Breslow).fit(&data).unwrap();
    for (a, b) in efron.coefficients.iter().zip(breslow.coefficients.iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-6);
    }
    assert_relative_eq!(efron.loglik, breslow.loglik, epsilon = 1e-8);
}

#[test]
fn test_martingale_residuals_sum_to_zero() {
    let data = create_synthetic_data(200, 3, 99);
    let fit = CoxModel::new().fit(&data).unwrap();
    assert_relative_eq!(fit.martingale.sum(), 0.0, epsilon = 1e-6);
    assert!(fit.martingale.iter().all(|&m| m <= 1.0));
}

#[test]
fn test_weibull_shape_near_one_on_exponential_data() {
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    let mut rng = StdRng::seed_from_u64(2024);
    let mut times = Vec::new();
    let mut events = Vec::new();
    for _ in 0..400 {
        let t = -(1.0 - rng.r#gen::<f64>()).ln() / 0.1;
        let c = rng.gen_range(1.0..20.0);
        times.push(t.min(c));
        events.push(t <= c);
    }
    let data = SurvivalData::without_covariates(times, events).unwrap();
    let config = OptimizationConfig::default();

    let weibull = fit_parametric(&data, Distribution::Weibull, &config).unwrap();
    let shape = weibull.natural_parameters()[0].1;
    assert!((shape - 1.0).abs() < 0.25, "shape {}", shape);

    let exponential = fit_parametric(&data, Distribution::Exponential, &config).unwrap();
    let rate = exponential.natural_parameters()[0].1;
    assert!((rate - 0.1).abs() < 0.03, "rate {}", rate);

    let ranking = rank_models(&[weibull, exponential]);
    assert_eq!(ranking.by_aic.len(), 2);
    assert!(ranking.by_bic[0].bic <= ranking.by_bic[1].bic);
}

#[test]
fn test_kaplan_meier_without_censoring_is_empirical() {
    let times = vec![1.0, 2.0, 3.0, 4.0];
    let events = vec![true; 4];
    let curve = KaplanMeier::new().fit(&times, &events).unwrap();
    assert_relative_eq!(curve.survival_at(2.5), 0.5, epsilon = 1e-12);
    assert_eq!(curve.median(), Some(2.0));
}
