//! k-sample tests for equality of survival curves.
//!
//! One weighted log-rank routine serves every test. Each distinct event time
//! contributes observed-minus-expected events per stratum, scaled by a weight
//! that depends on the pooled Kaplan-Meier curve just before that time.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use log::debug;
use ndarray::{Array1, Array2};

use crate::error::{Result, SurvivalError};
use crate::kaplan_meier::KaplanMeier;
use crate::metrics::ChiSquareTest;
use crate::optimization::invert_matrix;

/// per-event-time weight, `S(t-)^rho` from the pooled curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Weighting {
    /// w = 1
    LogRank,
    /// w = S(t-), Peto & Peto's Wilcoxon-type test
    PetoPeto,
    FlemingHarrington { rho: f64 },
}

impl Weighting {
    pub fn rho(&self) -> f64 {
        match self {
            Weighting::LogRank => 0.0,
            Weighting::PetoPeto => 1.0,
            Weighting::FlemingHarrington { rho } => *rho,
        }
    }

    fn weight(&self, pooled_survival: f64) -> f64 {
        let rho = self.rho();
        if rho == 0.0 {
            1.0
        } else {
            pooled_survival.powf(rho)
        }
    }
}

impl fmt::Display for Weighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Weighting::LogRank => write!(f, "log-rank"),
            Weighting::PetoPeto => write!(f, "Peto-Peto"),
            Weighting::FlemingHarrington { rho } => write!(f, "Fleming-Harrington (rho = {})", rho),
        }
    }
}

/// observed vs expected for one stratum
#[derive(Debug, Clone, PartialEq)]
pub struct StratumRow {
    pub label: String,
    pub n: usize,
    pub observed: f64,
    pub expected: f64,
    pub variance: f64, // diagonal of the variance matrix
}

#[derive(Debug, Clone)]
pub struct StratumTest {
    pub grouping: String,
    pub weighting: Weighting,
    pub strata: Vec<StratumRow>,
    pub test: ChiSquareTest,
}

impl StratumTest {
    pub fn print(&self) {
        println!("{} test across '{}'", self.weighting, self.grouping);
        println!("{:<14} {:>6} {:>10} {:>10} {:>12}", "stratum", "n", "observed", "expected", "(O-E)^2/E");
        for row in &self.strata {
            let contrib = if row.expected > 0.0 {
                (row.observed - row.expected).powi(2) / row.expected
            } else {
                0.0
            };
            println!(
                "{:<14} {:>6} {:>10.2} {:>10.2} {:>12.3}",
                row.label, row.n, row.observed, row.expected, contrib
            );
        }
        println!(
            "chisq = {:.3} on {} df, p = {:.4}",
            self.test.statistic, self.test.df, self.test.p_value
        );
    }
}

/// weighted log-rank test across the strata named by `labels`; unlabeled rows are left out
pub fn weighted_log_rank<L>(
    grouping: &str,
    times: &[f64],
    events: &[bool],
    labels: &[Option<L>],
    weighting: Weighting,
) -> Result<StratumTest>
where
    L: Ord + Clone + Display,
{
    if times.len() != events.len() || times.len() != labels.len() {
        return Err(SurvivalError::invalid_dimensions(format!(
            "{} times, {} events, {} labels",
            times.len(),
            events.len(),
            labels.len()
        )));
    }
    if !weighting.rho().is_finite() || weighting.rho() < 0.0 {
        return Err(SurvivalError::invalid_parameter("rho", weighting.rho().to_string()));
    }

    // stratum index per kept row
    let mut index: BTreeMap<L, usize> = BTreeMap::new();
    for label in labels.iter().flatten() {
        let next = index.len();
        index.entry(label.clone()).or_insert(next);
    }
    // BTreeMap order, not first appearance
    for (rank, slot) in index.values_mut().enumerate() {
        *slot = rank;
    }
    let strata_labels: Vec<String> = index.keys().map(|l| l.to_string()).collect();
    let k = index.len();

    let mut rows: Vec<(f64, bool, usize)> = Vec::with_capacity(times.len());
    for ((&t, &e), label) in times.iter().zip(events).zip(labels) {
        if let Some(l) = label {
            rows.push((t, e, index[l]));
        }
    }
    if rows.len() < times.len() {
        debug!("{}: {} rows without a stratum left out", grouping, times.len() - rows.len());
    }

    check_strata(grouping, &rows, k)?;

    let pooled_times: Vec<f64> = rows.iter().map(|r| r.0).collect();
    let pooled_events: Vec<bool> = rows.iter().map(|r| r.1).collect();
    let pooled = KaplanMeier::new().fit(&pooled_times, &pooled_events)?;

    rows.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut n_risk = vec![0usize; k];
    for r in &rows {
        n_risk[r.2] += 1;
    }
    let sizes = n_risk.clone();

    let mut observed = Array1::<f64>::zeros(k);
    let mut expected = Array1::<f64>::zeros(k);
    let mut variance = Array2::<f64>::zeros((k, k));

    let mut i = 0;
    while i < rows.len() {
        let t = rows[i].0;
        let mut deaths = vec![0usize; k];
        let mut leaving = vec![0usize; k];
        while i < rows.len() && rows[i].0 == t {
            leaving[rows[i].2] += 1;
            if rows[i].1 {
                deaths[rows[i].2] += 1;
            }
            i += 1;
        }

        let d: usize = deaths.iter().sum();
        let n: usize = n_risk.iter().sum();
        if d > 0 {
            let w = weighting.weight(pooled.survival_before(t));
            let (d_f, n_f) = (d as f64, n as f64);
            for g in 0..k {
                let share = n_risk[g] as f64 / n_f;
                observed[g] += w * deaths[g] as f64;
                expected[g] += w * d_f * share;
            }
            if n > 1 {
                let factor = w * w * d_f * (n_f - d_f) / (n_f - 1.0);
                for g in 0..k {
                    let pg = n_risk[g] as f64 / n_f;
                    for h in 0..k {
                        let ph = n_risk[h] as f64 / n_f;
                        let delta = if g == h { 1.0 } else { 0.0 };
                        variance[[g, h]] += factor * pg * (delta - ph);
                    }
                }
            }
        }

        for g in 0..k {
            n_risk[g] -= leaving[g];
        }
    }

    // the k-th stratum is redundant: drop it and invert the rest
    let u = (&observed - &expected).slice(ndarray::s![..k - 1]).to_owned();
    let v = variance.slice(ndarray::s![..k - 1, ..k - 1]).to_owned();
    let v_inv = invert_matrix(&v).map_err(|_| {
        SurvivalError::degenerate_strata(grouping, "variance matrix is singular")
    })?;
    let statistic = u.dot(&v_inv.dot(&u)).max(0.0);

    let strata = (0..k)
        .map(|g| StratumRow {
            label: strata_labels[g].clone(),
            n: sizes[g],
            observed: observed[g],
            expected: expected[g],
            variance: variance[[g, g]],
        })
        .collect();

    Ok(StratumTest {
        grouping: grouping.to_string(),
        weighting,
        strata,
        test: ChiSquareTest::new(statistic, k - 1),
    })
}

/// at least two strata, two distinct event times overall and one event per stratum
fn check_strata(grouping: &str, rows: &[(f64, bool, usize)], k: usize) -> Result<()> {
    if k < 2 {
        return Err(SurvivalError::degenerate_strata(
            grouping,
            format!("need at least 2 strata, found {}", k),
        ));
    }

    let mut event_times: Vec<f64> = rows.iter().filter(|r| r.1).map(|r| r.0).collect();
    event_times.sort_by(f64::total_cmp);
    event_times.dedup();
    if event_times.len() < 2 {
        return Err(SurvivalError::degenerate_strata(
            grouping,
            format!("need at least 2 distinct event times, found {}", event_times.len()),
        ));
    }

    let mut events_per_stratum = vec![0usize; k];
    for r in rows.iter().filter(|r| r.1) {
        events_per_stratum[r.2] += 1;
    }
    if let Some(empty) = events_per_stratum.iter().position(|&e| e == 0) {
        return Err(SurvivalError::degenerate_strata(
            grouping,
            format!("stratum #{} has no events", empty + 1),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identical_strata_give_zero() {
        let base_t = vec![2.0, 3.0, 5.0, 7.0, 8.0, 11.0];
        let base_e = vec![true, false, true, true, false, true];
        let times: Vec<f64> = base_t.iter().chain(base_t.iter()).copied().collect();
        let events: Vec<bool> = base_e.iter().chain(base_e.iter()).copied().collect();
        let labels: Vec<Option<&str>> = (0..12).map(|i| Some(if i < 6 { "a" } else { "b" })).collect();

        for weighting in [Weighting::LogRank, Weighting::PetoPeto] {
            let test = weighted_log_rank("copy", &times, &events, &labels, weighting).unwrap();
            assert_relative_eq!(test.test.statistic, 0.0, epsilon = 1e-10);
            assert_relative_eq!(test.test.p_value, 1.0, epsilon = 1e-10);
            assert_relative_eq!(test.strata[0].observed, test.strata[0].expected, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_early_vs_late_rejects() {
        let mut times = Vec::new();
        let mut labels = Vec::new();
        for i in 0..10 {
            times.push(1.0 + i as f64);
            labels.push(Some(0u8));
        }
        for i in 0..10 {
            times.push(50.0 + i as f64);
            labels.push(Some(1u8));
        }
        let events = vec![true; 20];

        let lr = weighted_log_rank("group", &times, &events, &labels, Weighting::LogRank).unwrap();
        assert!(lr.test.p_value < 0.05, "p = {}", lr.test.p_value);
        assert_eq!(lr.test.df, 1);

        let pp = weighted_log_rank("group", &times, &events, &labels, Weighting::PetoPeto).unwrap();
        assert!(pp.test.p_value < 0.05);
    }

    #[test]
    fn test_two_group_matches_textbook_formula() {
        let times = vec![1.0, 2.0, 3.0, 4.0, 1.5, 2.5, 3.5, 4.5];
        let events = vec![true, true, false, true, true, false, true, false];
        let labels = vec![Some(1), Some(1), Some(1), Some(1), Some(2), Some(2), Some(2), Some(2)];
        let test = weighted_log_rank("g", &times, &events, &labels, Weighting::LogRank).unwrap();

        let row = &test.strata[0];
        let expected = (row.observed - row.expected).powi(2) / row.variance;
        assert_relative_eq!(test.test.statistic, expected, epsilon = 1e-10);
        let total_o: f64 = test.strata.iter().map(|r| r.observed).sum();
        let total_e: f64 = test.strata.iter().map(|r| r.expected).sum();
        assert_relative_eq!(total_o, total_e, epsilon = 1e-10);
    }

    #[test]
    fn test_three_strata_df() {
        let times = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let events = vec![true; 9];
        let labels: Vec<Option<usize>> = (0..9).map(|i| Some(i % 3)).collect();
        let test = weighted_log_rank("g", &times, &events, &labels, Weighting::LogRank).unwrap();
        assert_eq!(test.test.df, 2);
        assert_eq!(test.strata.len(), 3);
    }

    #[test]
    fn test_degenerate_groupings() {
        let times = vec![1.0, 2.0, 3.0, 4.0];
        let events = vec![true, true, false, false];

        let one = vec![Some("a"); 4];
        assert!(matches!(
            weighted_log_rank("one", &times, &events, &one, Weighting::LogRank),
            Err(SurvivalError::DegenerateStrata { .. })
        ));

        // stratum b has no events
        let no_events = vec![Some("a"), Some("a"), Some("b"), Some("b")];
        assert!(matches!(
            weighted_log_rank("empty", &times, &events, &no_events, Weighting::LogRank),
            Err(SurvivalError::DegenerateStrata { .. })
        ));

        let single_time = vec![true, false, false, false];
        let split = vec![Some("a"), Some("b"), Some("a"), Some("b")];
        assert!(weighted_log_rank("t", &times, &single_time, &split, Weighting::LogRank).is_err());
    }
}
