//! Fractional polynomial function selection for Cox models.
//!
//! Each continuous covariate is tried as a straight line, as one power term
//! (FP1) and as two power terms (FP2) drawn from the usual power grid, with
//! the other covariates held at their current forms. The closed test sequence
//! picks the simplest form the data cannot reject; cycles repeat until no
//! form changes.

use std::fmt;

use log::{debug, info, warn};
use ndarray::Array2;

use crate::cox::{CoxFit, CoxModel, Ties};
use crate::data::SurvivalData;
use crate::error::{Result, SurvivalError};
use crate::metrics::chi_square_sf;
use crate::optimization::OptimizationConfig;

/// candidate powers; 0 stands for the natural log
pub const POWERS: [f64; 8] = [-2.0, -1.0, -0.5, 0.0, 0.5, 1.0, 2.0, 3.0];

#[derive(Debug, Clone)]
pub struct FpConfig {
    pub alpha: f64,        // level of every test in the sequence
    pub max_cycles: usize, // backfitting cycles
    pub ties: Ties,
    pub optimization: OptimizationConfig,
}

impl Default for FpConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            max_cycles: 5,
            ties: Ties::Breslow,
            optimization: OptimizationConfig::default(),
        }
    }
}

impl FpConfig {
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_max_cycles(mut self, cycles: usize) -> Self {
        self.max_cycles = cycles;
        self
    }

    pub fn with_ties(mut self, ties: Ties) -> Self {
        self.ties = ties;
        self
    }
}

/// functional form of one covariate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FpForm {
    Linear,
    Fp1(f64),
    Fp2(f64, f64),
}

impl FpForm {
    /// degrees of freedom spent: one per coefficient plus one per chosen power
    pub fn df(&self) -> usize {
        match self {
            FpForm::Linear => 1,
            FpForm::Fp1(_) => 2,
            FpForm::Fp2(_, _) => 4,
        }
    }

    pub fn n_terms(&self) -> usize {
        match self {
            FpForm::Linear | FpForm::Fp1(_) => 1,
            FpForm::Fp2(_, _) => 2,
        }
    }
}

impl fmt::Display for FpForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FpForm::Linear => f.write_str("linear"),
            FpForm::Fp1(p) => write!(f, "FP1({})", p),
            FpForm::Fp2(p1, p2) => write!(f, "FP2({}, {})", p1, p2),
        }
    }
}

/// the 8 single powers
pub fn fp1_candidates() -> Vec<FpForm> {
    POWERS.iter().map(|&p| FpForm::Fp1(p)).collect()
}

/// the 36 unordered power pairs, repeats included
pub fn fp2_candidates() -> Vec<FpForm> {
    let mut forms = Vec::with_capacity(36);
    for (i, &p1) in POWERS.iter().enumerate() {
        for &p2 in &POWERS[i..] {
            forms.push(FpForm::Fp2(p1, p2));
        }
    }
    forms
}

/// x^p with the box-tidwell convention x^0 = ln x
pub fn fp_power(x: f64, p: f64) -> f64 {
    if p == 0.0 {
        x.ln()
    } else {
        x.powf(p)
    }
}

/// term columns for a positive variable; a repeated power gets x^p ln x
pub fn fp_basis(x: &[f64], form: FpForm) -> Vec<Vec<f64>> {
    match form {
        FpForm::Linear => vec![x.to_vec()],
        FpForm::Fp1(p) => vec![x.iter().map(|&v| fp_power(v, p)).collect()],
        FpForm::Fp2(p1, p2) => {
            let first: Vec<f64> = x.iter().map(|&v| fp_power(v, p1)).collect();
            let second = if p1 == p2 {
                x.iter().zip(&first).map(|(&v, &t)| t * v.ln()).collect()
            } else {
                x.iter().map(|&v| fp_power(v, p2)).collect()
            };
            vec![first, second]
        }
    }
}

fn power_label(name: &str, p: f64) -> String {
    if p == 0.0 {
        format!("ln({})", name)
    } else {
        format!("{}^{}", name, p)
    }
}

/// column names matching `fp_basis`
pub fn fp_term_names(name: &str, form: FpForm) -> Vec<String> {
    match form {
        FpForm::Linear => vec![name.to_string()],
        FpForm::Fp1(p) => vec![power_label(name, p)],
        FpForm::Fp2(p1, p2) if p1 == p2 => {
            let base = power_label(name, p1);
            vec![base.clone(), format!("{}*ln({})", base, name)]
        }
        FpForm::Fp2(p1, p2) => vec![power_label(name, p1), power_label(name, p2)],
    }
}

/// preprocessing that makes a variable positive and of order one
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShiftScale {
    pub shift: f64,
    pub scale: f64,
}

impl ShiftScale {
    /// shift by the smallest gap past the minimum when anything is <= 0,
    /// then divide by the power of ten nearest the mean
    pub fn fit(values: &[f64]) -> Result<Self> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return Err(SurvivalError::invalid_survival_data(
                "fractional polynomials need finite values",
            ));
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let mut shift = 0.0;
        if min <= 0.0 {
            let mut sorted = values.to_vec();
            sorted.sort_by(f64::total_cmp);
            let gap = sorted
                .windows(2)
                .map(|w| w[1] - w[0])
                .filter(|&d| d > 0.0)
                .fold(f64::INFINITY, f64::min);
            let gap = if gap.is_finite() { gap } else { 1.0 };
            shift = ((gap - min) * 10.0).ceil() / 10.0;
        }
        let mean = values.iter().map(|v| v + shift).sum::<f64>() / values.len() as f64;
        let magnitude = mean.log10();
        let scale = 10f64.powf(magnitude.signum() * magnitude.abs().round());
        Ok(Self { shift, scale })
    }

    pub fn apply(&self, value: f64) -> f64 {
        (value + self.shift) / self.scale
    }
}

/// deviances behind one covariate's selection
#[derive(Debug, Clone)]
pub struct DevianceTable {
    pub covariate: String,
    pub null: Option<f64>,
    pub linear: f64,
    pub fp1: Option<(FpForm, f64)>,
    pub fp2: Option<(FpForm, f64)>,
    pub p_fp2_vs_null: Option<f64>,   // 4 df
    pub p_fp2_vs_linear: Option<f64>, // 3 df
    pub p_fp2_vs_fp1: Option<f64>,    // 2 df
    pub selected: FpForm,
}

impl DevianceTable {
    pub fn print(&self) {
        println!("{}: selected {}", self.covariate, self.selected);
        let fmt_p = |p: Option<f64>| p.map_or("-".to_string(), |p| format!("{:.4}", p));
        if let Some(null) = self.null {
            println!("  {:<16} {:>12.3}", "null", null);
        }
        println!("  {:<16} {:>12.3}", "linear", self.linear);
        if let Some((form, dev)) = self.fp1 {
            println!("  {:<16} {:>12.3}", form.to_string(), dev);
        }
        if let Some((form, dev)) = self.fp2 {
            println!("  {:<16} {:>12.3}", form.to_string(), dev);
        }
        println!(
            "  p: FP2 vs null {}, FP2 vs linear {}, FP2 vs FP1 {}",
            fmt_p(self.p_fp2_vs_null),
            fmt_p(self.p_fp2_vs_linear),
            fmt_p(self.p_fp2_vs_fp1)
        );
    }
}

/// one covariate in the final model
#[derive(Debug, Clone)]
pub struct SelectedTerm {
    pub covariate: String,
    pub form: FpForm,
    pub transform: Option<ShiftScale>, // None for binary covariates
}

#[derive(Debug, Clone)]
pub struct FpResult {
    pub terms: Vec<SelectedTerm>,
    pub tables: Vec<DevianceTable>, // last cycle, continuous covariates only
    pub cycles: usize,
    pub converged: bool,
    pub fit: CoxFit,
}

impl FpResult {
    pub fn form_of(&self, covariate: &str) -> Option<FpForm> {
        self.terms.iter().find(|t| t.covariate == covariate).map(|t| t.form)
    }

    pub fn print(&self) {
        println!(
            "fractional polynomial selection: {} cycle(s){}",
            self.cycles,
            if self.converged { "" } else { ", not stable" }
        );
        for table in &self.tables {
            table.print();
        }
        for term in &self.terms {
            match term.transform {
                Some(t) if t.shift != 0.0 || t.scale != 1.0 => println!(
                    "  {} = {} of ({} + {}) / {}",
                    term.covariate, term.form, term.covariate, t.shift, t.scale
                ),
                _ => println!("  {} = {}", term.covariate, term.form),
            }
        }
        self.fit.print();
    }
}

/// one raw column, ready for transformation
struct Column {
    name: String,
    transformed: Vec<f64>, // shifted and scaled, or raw for binary columns
    raw: Vec<f64>,
    transform: Option<ShiftScale>,
}

/// two or fewer distinct values
fn is_binary(values: &[f64]) -> bool {
    let mut distinct: Vec<f64> = Vec::with_capacity(3);
    for &v in values {
        if !distinct.contains(&v) {
            distinct.push(v);
            if distinct.len() > 2 {
                return false;
            }
        }
    }
    true
}

struct Search<'a> {
    data: &'a SurvivalData,
    columns: Vec<Column>,
    model: CoxModel,
}

impl Search<'_> {
    /// design with `forms[k]` for column k; None leaves the column out
    fn design(&self, forms: &[Option<FpForm>]) -> Result<SurvivalData> {
        let n = self.data.n_samples();
        let mut cols: Vec<Vec<f64>> = Vec::new();
        let mut names = Vec::new();
        for (column, form) in self.columns.iter().zip(forms) {
            let Some(form) = *form else { continue };
            match form {
                FpForm::Linear => {
                    cols.push(column.raw.clone());
                    names.push(column.name.clone());
                }
                _ => {
                    cols.extend(fp_basis(&column.transformed, form));
                    names.extend(fp_term_names(&column.name, form));
                }
            }
        }
        let mut x = Array2::zeros((n, cols.len()));
        for (j, col) in cols.iter().enumerate() {
            for (i, &v) in col.iter().enumerate() {
                x[[i, j]] = v;
            }
        }
        self.data.with_covariates(x, names)
    }

    /// deviance of a candidate, None when that fit fails
    fn deviance(&self, forms: &[Option<FpForm>]) -> Result<Option<f64>> {
        let design = self.design(forms)?;
        match self.model.max_loglik(&design) {
            Ok(ll) => Ok(Some(-2.0 * ll)),
            Err(e) if e.is_fit_failure() => {
                warn!("skipping candidate [{}]: {}", design.names().join(", "), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// best (lowest deviance) of a candidate family for column `j`
    fn best(&self, j: usize, current: &[FpForm], family: Vec<FpForm>) -> Result<Option<(FpForm, f64)>> {
        let mut best: Option<(FpForm, f64)> = None;
        for form in family {
            let mut forms: Vec<Option<FpForm>> = current.iter().copied().map(Some).collect();
            forms[j] = Some(form);
            if let Some(dev) = self.deviance(&forms)? {
                if best.map_or(true, |(_, b)| dev < b) {
                    best = Some((form, dev));
                }
            }
        }
        Ok(best)
    }

    fn select(&self, j: usize, current: &[FpForm], alpha: f64) -> Result<DevianceTable> {
        let name = self.columns[j].name.clone();
        let mut forms: Vec<Option<FpForm>> = current.iter().copied().map(Some).collect();

        forms[j] = Some(FpForm::Linear);
        let linear = self.deviance(&forms)?;
        let fp1 = self.best(j, current, fp1_candidates())?;
        let fp2 = self.best(j, current, fp2_candidates())?;

        let Some(linear) = linear else {
            let names: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
            let message = if fp1.is_none() && fp2.is_none() {
                format!("no candidate form of {} could be fitted", name)
            } else {
                format!("linear term in {} could not be fitted", name)
            };
            return Err(SurvivalError::optimization_failed("fractional polynomial", &names, message));
        };

        forms[j] = None;
        let null = self.deviance(&forms)?;

        let p = |larger: f64, smaller: f64, df: usize| chi_square_sf((larger - smaller).max(0.0), df);
        let p_fp2_vs_null = match (null, fp2) {
            (Some(n), Some((_, d2))) => Some(p(n, d2, 4)),
            _ => None,
        };
        let p_fp2_vs_linear = fp2.map(|(_, d2)| p(linear, d2, 3));
        let p_fp2_vs_fp1 = match (fp1, fp2) {
            (Some((_, d1)), Some((_, d2))) => Some(p(d1, d2, 2)),
            _ => None,
        };

        let selected = match (p_fp2_vs_linear, p_fp2_vs_fp1) {
            (Some(pl), _) if pl >= alpha => FpForm::Linear,
            (Some(_), Some(pf)) if pf >= alpha => fp1.map_or(FpForm::Linear, |(f, _)| f),
            (Some(_), _) => fp2.map_or(FpForm::Linear, |(f, _)| f),
            // no FP2 fit at all: test the best single power against the line on 1 df
            (None, _) => match fp1 {
                Some((form, d1)) if p(linear, d1, 1) < alpha => form,
                _ => FpForm::Linear,
            },
        };

        debug!(
            "{}: linear {:.3}, FP1 {:?}, FP2 {:?} -> {}",
            name, linear, fp1, fp2, selected
        );

        Ok(DevianceTable {
            covariate: name,
            null,
            linear,
            fp1,
            fp2,
            p_fp2_vs_null,
            p_fp2_vs_linear,
            p_fp2_vs_fp1,
            selected,
        })
    }
}

/// backfitting search over every covariate in `data`; binary columns stay linear
pub fn fp_search(data: &SurvivalData, config: &FpConfig) -> Result<FpResult> {
    if !(config.alpha > 0.0 && config.alpha < 1.0) {
        return Err(SurvivalError::invalid_parameter("alpha", config.alpha.to_string()));
    }
    if data.n_features() == 0 {
        return Err(SurvivalError::invalid_dimensions(
            "fractional polynomial search needs at least one covariate",
        ));
    }

    let mut columns = Vec::with_capacity(data.n_features());
    for (j, name) in data.names().iter().enumerate() {
        let raw = data.covariates().column(j).to_vec();
        let (transformed, transform) = if is_binary(&raw) {
            (raw.clone(), None)
        } else {
            let t = ShiftScale::fit(&raw)?;
            (raw.iter().map(|&v| t.apply(v)).collect(), Some(t))
        };
        columns.push(Column {
            name: name.clone(),
            transformed,
            raw,
            transform,
        });
    }

    let search = Search {
        data,
        columns,
        model: CoxModel::new()
            .with_ties(config.ties)
            .with_optimization(config.optimization.clone()),
    };

    let mut forms = vec![FpForm::Linear; data.n_features()];
    let mut tables = Vec::new();
    let mut cycles = 0;
    let mut converged = false;

    while cycles < config.max_cycles {
        cycles += 1;
        let before = forms.clone();
        tables.clear();
        for j in 0..forms.len() {
            if search.columns[j].transform.is_none() {
                continue;
            }
            let table = search.select(j, &forms, config.alpha)?;
            forms[j] = table.selected;
            tables.push(table);
        }
        info!(
            "fp cycle {}: {}",
            cycles,
            search
                .columns
                .iter()
                .zip(&forms)
                .map(|(c, f)| format!("{} {}", c.name, f))
                .collect::<Vec<_>>()
                .join(", ")
        );
        if forms == before {
            converged = true;
            break;
        }
    }
    if !converged {
        warn!("fractional polynomial forms still changing after {} cycles", cycles);
    }

    let final_design = search.design(&forms.iter().copied().map(Some).collect::<Vec<_>>())?;
    let fit = search.model.fit(&final_design)?;

    let terms = search
        .columns
        .iter()
        .zip(&forms)
        .map(|(c, &form)| SelectedTerm {
            covariate: c.name.clone(),
            form,
            transform: c.transform,
        })
        .collect();

    Ok(FpResult {
        terms,
        tables,
        cycles,
        converged,
        fit,
    })
}
