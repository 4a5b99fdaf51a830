//! The end-to-end analysis of a cleaned cohort and its text report.
//!
//! Every stage hands back plain data. Tests that are undefined for the data
//! at hand and parametric fits that fail are recorded in place, so one bad
//! stratum or family never hides the rest of the report.

use log::{info, warn};

use crate::binning::{AgeClass, BmiClass};
use crate::cox::{fit_logged, CoxFit, CoxModel, Ties};
use crate::dataset::{Cohort, Covariate};
use crate::describe::{bar_counts, correlation_matrix, histogram, ColumnSummary, CorrelationMatrix, Histogram};
use crate::diagnostics::{martingale_trend, proportional_hazards_test, MartingaleTrend, TimeTransform, ZphTest};
use crate::error::{Result, SurvivalError};
use crate::fracpoly::{fp_search, FpConfig, FpResult};
use crate::kaplan_meier::{KaplanMeier, KmConfig, SurvivalCurve};
use crate::logrank::{weighted_log_rank, StratumTest, Weighting};
use crate::optimization::OptimizationConfig;
use crate::parametric::{fit_parametric, rank_models, Distribution, ModelRanking, ParametricFit};

/// pipeline settings
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub km: KmConfig,
    pub ties: Ties,
    pub covariates: Vec<Covariate>, // cox and parametric models
    pub alpha: f64,                 // threshold for flagging PH violations
    pub fp: FpConfig,
    pub optimization: OptimizationConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            km: KmConfig::default(),
            ties: Ties::Efron,
            covariates: vec![Covariate::Age, Covariate::Male, Covariate::Bmi],
            alpha: 0.05,
            fp: FpConfig::default(),
            optimization: OptimizationConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn with_ties(mut self, ties: Ties) -> Self {
        self.ties = ties;
        self
    }

    pub fn with_conf_level(mut self, level: f64) -> Self {
        self.km.conf_level = level;
        self
    }

    pub fn with_covariates(mut self, covariates: Vec<Covariate>) -> Self {
        self.covariates = covariates;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_fp(mut self, fp: FpConfig) -> Self {
        self.fp = fp;
        self
    }
}

/// a result, or the reason it could not be computed
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Computed(T),
    Undefined(String),
}

impl<T> Outcome<T> {
    pub fn computed(&self) -> Option<&T> {
        match self {
            Outcome::Computed(v) => Some(v),
            Outcome::Undefined(_) => None,
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, Outcome::Computed(_))
    }
}

/// curves and tests for one grouping variable
#[derive(Debug, Clone)]
pub struct GroupComparison {
    pub grouping: String,
    pub curves: Vec<SurvivalCurve>,
    pub log_rank: Outcome<StratumTest>,
    pub peto_peto: Outcome<StratumTest>,
}

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub n_subjects: usize,
    pub n_events: usize,
    pub summaries: Vec<ColumnSummary>,
    pub histograms: Vec<(String, Histogram)>,
    pub sex_counts: Vec<(&'static str, usize)>,
    pub age_counts: Vec<(AgeClass, usize)>,
    pub bmi_counts: Vec<(BmiClass, usize)>,
    pub correlation: CorrelationMatrix,
    pub overall: SurvivalCurve,
    pub comparisons: Vec<GroupComparison>,
    pub cox: CoxFit,
    pub zph: Vec<(TimeTransform, Outcome<ZphTest>)>,
    pub martingale: Vec<MartingaleTrend>,
    pub fractional_polynomials: Outcome<FpResult>,
    pub parametric: Vec<(String, Outcome<ParametricFit>)>,
    pub ranking: ModelRanking,
    alpha: f64,
}

fn sex_label(male: u8) -> &'static str {
    if male == 1 {
        "male"
    } else {
        "female"
    }
}

/// run one stratum test, keeping a degenerate grouping as undefined
fn stratum_test<L>(
    grouping: &str,
    times: &[f64],
    events: &[bool],
    labels: &[Option<L>],
    weighting: Weighting,
) -> Result<Outcome<StratumTest>>
where
    L: Ord + Clone + std::fmt::Display,
{
    match weighted_log_rank(grouping, times, events, labels, weighting) {
        Ok(test) => Ok(Outcome::Computed(test)),
        Err(e @ SurvivalError::DegenerateStrata { .. }) => {
            warn!("{}", e);
            Ok(Outcome::Undefined(e.to_string()))
        }
        Err(e) => Err(e),
    }
}

fn compare<L>(
    km: &KaplanMeier,
    grouping: &str,
    times: &[f64],
    events: &[bool],
    labels: &[Option<L>],
) -> Result<GroupComparison>
where
    L: Ord + Clone + std::fmt::Display,
{
    Ok(GroupComparison {
        grouping: grouping.to_string(),
        curves: km.fit_stratified(times, events, labels)?,
        log_rank: stratum_test(grouping, times, events, labels, Weighting::LogRank)?,
        peto_peto: stratum_test(grouping, times, events, labels, Weighting::PetoPeto)?,
    })
}

/// keep fit failures and rejected inputs as undefined, propagate the rest
fn recorded<T>(what: &str, result: Result<T>) -> Result<Outcome<T>> {
    match result {
        Ok(v) => Ok(Outcome::Computed(v)),
        Err(e) if e.is_fit_failure() || matches!(e, SurvivalError::InvalidSurvivalData { .. }) => {
            warn!("{}: {}", what, e);
            Ok(Outcome::Undefined(e.to_string()))
        }
        Err(e) => Err(e),
    }
}

/// the whole analysis, in order: describe, kaplan-meier, stratum tests, cox,
/// diagnostics, fractional polynomials, parametric models
pub fn run_analysis(cohort: &Cohort, config: &AnalysisConfig) -> Result<AnalysisReport> {
    if cohort.is_empty() {
        return Err(SurvivalError::invalid_survival_data("cohort is empty after cleaning"));
    }
    let times = cohort.times();
    let events = cohort.events();
    let n_events = events.iter().filter(|&&e| e).count();
    info!("analysing {} subjects with {} events", cohort.len(), n_events);

    // descriptive statistics
    let columns = cohort.numeric_columns();
    let summaries = columns
        .iter()
        .map(|(name, values)| ColumnSummary::compute(name, values))
        .collect::<Result<Vec<_>>>()?;
    let histograms = columns
        .iter()
        .filter(|(name, _)| matches!(*name, "futime" | "age" | "bmi" | "weight" | "height"))
        .map(|(name, values)| Ok((name.to_string(), histogram(values, None)?)))
        .collect::<Result<Vec<_>>>()?;
    let sexes: Vec<Option<&'static str>> =
        cohort.subjects().iter().map(|s| Some(sex_label(s.male))).collect();
    let sex_counts = bar_counts(&sexes, &["female", "male"]);
    let age_counts = bar_counts(cohort.age_classes(), &AgeClass::ALL);
    let bmi_counts = bar_counts(cohort.bmi_classes(), &BmiClass::ALL);
    let correlation_columns: Vec<(&str, Vec<f64>)> =
        columns.into_iter().filter(|(name, _)| *name != "id").collect();
    let correlation = correlation_matrix(&correlation_columns)?;

    // kaplan-meier and stratum comparisons
    let km = KaplanMeier::with_config(config.km.clone());
    let overall = km.fit(&times, &events)?;
    let comparisons = vec![
        compare(&km, "male", &times, &events, &sexes)?,
        compare(&km, "agecl", &times, &events, cohort.age_classes())?,
        compare(&km, "bmicl", &times, &events, cohort.bmi_classes())?,
    ];

    // cox model and its diagnostics
    let data = cohort.survival_data(&config.covariates)?;
    let model = CoxModel::new()
        .with_ties(config.ties)
        .with_optimization(config.optimization.clone());
    let cox = fit_logged(&model, &data)?;

    let zph = TimeTransform::ALL
        .iter()
        .map(|&t| {
            let outcome = recorded(&format!("zph ({})", t), proportional_hazards_test(&cox, &data, t))?;
            Ok((t, outcome))
        })
        .collect::<Result<Vec<_>>>()?;
    for (t, outcome) in &zph {
        if let Outcome::Computed(test) = outcome {
            let violated = test.violations(config.alpha);
            if !violated.is_empty() {
                info!("PH rejected under {} transform for: {}", t, violated.join(", "));
            }
        }
    }

    let martingale = config
        .covariates
        .iter()
        .filter(|c| !c.is_binary())
        .map(|&c| martingale_trend(&cox, c.name(), &cohort.column(c)))
        .collect::<Result<Vec<_>>>()?;

    let fractional_polynomials = recorded("fractional polynomials", fp_search(&data, &config.fp))?;

    // parametric families, intercept-only and on the model covariates
    let intercept_only = cohort.survival_data(&[])?;
    let mut parametric = Vec::new();
    for design in [&intercept_only, &data] {
        for distribution in Distribution::ALL {
            let label = if design.n_features() == 0 {
                format!("{} ~ 1", distribution)
            } else {
                format!("{} ~ {}", distribution, design.names().join(" + "))
            };
            let outcome = recorded(&label, fit_parametric(design, distribution, &config.optimization))?;
            parametric.push((label, outcome));
        }
    }
    let fitted: Vec<ParametricFit> = parametric
        .iter()
        .filter_map(|(_, o)| o.computed().cloned())
        .collect();
    let ranking = rank_models(&fitted);

    Ok(AnalysisReport {
        n_subjects: cohort.len(),
        n_events,
        summaries,
        histograms,
        sex_counts,
        age_counts,
        bmi_counts,
        correlation,
        overall,
        comparisons,
        cox,
        zph,
        martingale,
        fractional_polynomials,
        parametric,
        ranking,
        alpha: config.alpha,
    })
}

fn section(title: &str) {
    println!();
    println!("== {} ==", title);
}

fn print_outcome<T>(outcome: &Outcome<T>, print: impl Fn(&T)) {
    match outcome {
        Outcome::Computed(v) => print(v),
        Outcome::Undefined(reason) => println!("undefined: {}", reason),
    }
}

impl AnalysisReport {
    pub fn print(&self) {
        println!("{} subjects, {} events", self.n_subjects, self.n_events);

        section("summary statistics");
        println!(
            "{:<8} {:>6} {:>11} {:>11} {:>10} {:>10} {:>10} {:>10} {:>10}",
            "column", "n", "mean", "sd", "min", "q1", "median", "q3", "max"
        );
        for s in &self.summaries {
            println!(
                "{:<8} {:>6} {:>11.2} {:>11.2} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>10.2}",
                s.name, s.n, s.mean, s.sd, s.min, s.q1, s.median, s.q3, s.max
            );
        }

        section("histograms");
        for (name, h) in &self.histograms {
            println!("{}:", name);
            for (i, count) in h.counts.iter().enumerate() {
                println!("  [{:>9.1}, {:>9.1}) {:>6}", h.edges[i], h.edges[i + 1], count);
            }
        }

        section("group sizes");
        for (label, n) in &self.sex_counts {
            println!("  {:<10} {:>6}", label, n);
        }
        for (class, n) in &self.age_counts {
            println!("  age {:<10} {:>6}", class, n);
        }
        for (class, n) in &self.bmi_counts {
            println!("  bmi {:<10} {:>6}", class, n);
        }

        section("correlation");
        self.correlation.print();

        section("kaplan-meier");
        self.overall.print();
        for comparison in &self.comparisons {
            println!();
            println!("by {}", comparison.grouping);
            for curve in &comparison.curves {
                curve.print();
            }
            print_outcome(&comparison.log_rank, StratumTest::print);
            print_outcome(&comparison.peto_peto, StratumTest::print);
        }

        section("cox model");
        self.cox.print();

        section("proportional hazards");
        for (_, outcome) in &self.zph {
            print_outcome(outcome, |test| {
                test.print();
                let violated = test.violations(self.alpha);
                if !violated.is_empty() {
                    println!("rejected at {}: {}", self.alpha, violated.join(", "));
                }
            });
        }

        section("martingale residuals");
        for trend in &self.martingale {
            println!(
                "{}: lowess smooth spans {:.4} over {} subjects",
                trend.covariate,
                trend.smooth_range(),
                trend.points.len()
            );
        }

        section("fractional polynomials");
        print_outcome(&self.fractional_polynomials, FpResult::print);

        section("parametric models");
        for (label, outcome) in &self.parametric {
            match outcome {
                Outcome::Computed(fit) => {
                    fit.print();
                    println!();
                }
                Outcome::Undefined(reason) => println!("{}: failed ({})", label, reason),
            }
        }
        self.ranking.print();
    }
}
