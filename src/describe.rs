use ndarray::Array2;

use crate::error::{Result, SurvivalError};

/// five-number summary plus mean/sd for one numeric column
#[derive(Debug, Clone)]
pub struct ColumnSummary {
    pub name: String,
    pub n: usize,
    pub mean: f64,
    pub sd: f64, // sample sd (n - 1)
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
}

impl ColumnSummary {
    pub fn compute(name: &str, values: &[f64]) -> Result<Self> {
        if values.is_empty() {
            return Err(SurvivalError::invalid_dimensions(format!("column '{}' is empty", name)));
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let sd = if n > 1 {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            0.0
        };

        Ok(Self {
            name: name.to_string(),
            n,
            mean,
            sd,
            min: sorted[0],
            q1: quantile_sorted(&sorted, 0.25),
            median: quantile_sorted(&sorted, 0.5),
            q3: quantile_sorted(&sorted, 0.75),
            max: sorted[n - 1],
        })
    }
}

/// linear-interpolation quantile on sorted data (R's type 7)
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = (n - 1) as f64 * p.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// equal-width histogram; `edges.len() == counts.len() + 1`
#[derive(Debug, Clone)]
pub struct Histogram {
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
}

/// Sturges' rule: ceil(log2(n) + 1) bins
pub fn sturges_bins(n: usize) -> usize {
    if n < 2 {
        return 1;
    }
    ((n as f64).log2() + 1.0).ceil() as usize
}

/// histogram over `[min, max]`; the last bin is closed on the right
pub fn histogram(values: &[f64], bins: Option<usize>) -> Result<Histogram> {
    if values.is_empty() {
        return Err(SurvivalError::invalid_dimensions("histogram of an empty column"));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(SurvivalError::numerical_error("histogram input has non-finite values"));
    }
    let k = bins.unwrap_or_else(|| sturges_bins(values.len()));
    if k == 0 {
        return Err(SurvivalError::invalid_parameter("bins", "0"));
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    // a constant column still gets one unit-wide bin
    let (lo, hi) = if max > min { (min, max) } else { (min - 0.5, max + 0.5) };
    let width = (hi - lo) / k as f64;

    let edges: Vec<f64> = (0..=k).map(|i| lo + width * i as f64).collect();
    let mut counts = vec![0usize; k];
    for &v in values {
        let idx = (((v - lo) / width).floor() as usize).min(k - 1);
        counts[idx] += 1;
    }

    Ok(Histogram { edges, counts })
}

/// counts per category, categories in the order given
pub fn bar_counts<T: PartialEq + Clone>(labels: &[Option<T>], categories: &[T]) -> Vec<(T, usize)> {
    categories
        .iter()
        .map(|c| {
            let n = labels.iter().filter(|l| l.as_ref() == Some(c)).count();
            (c.clone(), n)
        })
        .collect()
}

/// pearson correlation matrix; `None` where a column has zero variance
#[derive(Debug, Clone)]
pub struct CorrelationMatrix {
    pub names: Vec<String>,
    pub values: Array2<Option<f64>>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.names.iter().position(|n| n == a)?;
        let j = self.names.iter().position(|n| n == b)?;
        self.values[[i, j]]
    }

    pub fn print(&self) {
        print!("{:>8}", "");
        for name in &self.names {
            print!(" {:>8}", name);
        }
        println!();
        for (i, name) in self.names.iter().enumerate() {
            print!("{:>8}", name);
            for j in 0..self.names.len() {
                match self.values[[i, j]] {
                    Some(r) => print!(" {:>8.3}", r),
                    None => print!(" {:>8}", "NA"),
                }
            }
            println!();
        }
    }
}

pub fn correlation_matrix(columns: &[(&str, Vec<f64>)]) -> Result<CorrelationMatrix> {
    let k = columns.len();
    let n = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
    if columns.iter().any(|(_, v)| v.len() != n) {
        return Err(SurvivalError::invalid_dimensions("correlation columns differ in length"));
    }
    if n < 2 {
        return Err(SurvivalError::invalid_dimensions("correlation needs at least 2 rows"));
    }

    let centered: Vec<Vec<f64>> = columns
        .iter()
        .map(|(_, v)| {
            let mean = v.iter().sum::<f64>() / n as f64;
            v.iter().map(|x| x - mean).collect()
        })
        .collect();
    let norms: Vec<f64> = centered
        .iter()
        .map(|c| c.iter().map(|x| x * x).sum::<f64>().sqrt())
        .collect();

    let mut values = Array2::from_elem((k, k), None);
    for i in 0..k {
        for j in i..k {
            if norms[i] <= 0.0 || norms[j] <= 0.0 {
                continue;
            }
            let dot: f64 = centered[i].iter().zip(&centered[j]).map(|(a, b)| a * b).sum();
            let r = (dot / (norms[i] * norms[j])).clamp(-1.0, 1.0);
            values[[i, j]] = Some(r);
            values[[j, i]] = Some(r);
        }
    }

    Ok(CorrelationMatrix {
        names: columns.iter().map(|(name, _)| name.to_string()).collect(),
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_summary_quartiles() {
        let s = ColumnSummary::compute("x", &[4.0, 1.0, 3.0, 2.0, 5.0]).unwrap();
        assert_eq!(s.n, 5);
        assert_relative_eq!(s.mean, 3.0, epsilon = 1e-12);
        assert_relative_eq!(s.median, 3.0, epsilon = 1e-12);
        assert_relative_eq!(s.q1, 2.0, epsilon = 1e-12);
        assert_relative_eq!(s.q3, 4.0, epsilon = 1e-12);
        assert_relative_eq!(s.sd, 2.5f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_histogram_counts_everything() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let h = histogram(&values, None).unwrap();
        assert_eq!(h.counts.len(), sturges_bins(100));
        assert_eq!(h.edges.len(), h.counts.len() + 1);
        assert_eq!(h.counts.iter().sum::<usize>(), 100);
    }

    #[test]
    fn test_histogram_constant_column() {
        let h = histogram(&[2.0, 2.0, 2.0], Some(3)).unwrap();
        assert_eq!(h.counts.iter().sum::<usize>(), 3);
    }

    #[test]
    fn test_bar_counts_keep_order() {
        let labels = vec![Some("b"), None, Some("a"), Some("b")];
        let counts = bar_counts(&labels, &["a", "b", "c"]);
        assert_eq!(counts, vec![("a", 1), ("b", 2), ("c", 0)]);
    }

    #[test]
    fn test_correlation() {
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let y = vec![2.0, 4.0, 6.0, 8.0];
        let z = vec![4.0, 3.0, 2.0, 1.0];
        let c = vec![1.0, 1.0, 1.0, 1.0];
        let m = correlation_matrix(&[("x", x), ("y", y), ("z", z), ("c", c)]).unwrap();

        assert_relative_eq!(m.get("x", "y").unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.get("x", "z").unwrap(), -1.0, epsilon = 1e-12);
        assert_relative_eq!(m.get("z", "z").unwrap(), 1.0, epsilon = 1e-12);
        assert!(m.get("x", "c").is_none());
        assert!(m.get("c", "c").is_none());
    }
}
