use log::{debug, trace};
use ndarray::{Array1, Array2};

use crate::error::{Result, SurvivalError};

/// Configuration for Newton-Raphson likelihood maximization
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    pub max_iterations: usize,
    pub tolerance: f64,     // relative change in log-likelihood
    pub max_halvings: usize, // step-halving attempts per iteration
    pub divergence_tolerance: f64, // leftover newton step, relative to max(|theta|, 1)
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-9,
            max_halvings: 30,
            divergence_tolerance: 1e-3,
        }
    }
}

/// log-likelihood with its first and second derivatives at a point
#[derive(Debug, Clone)]
pub struct Derivatives {
    pub loglik: f64,
    pub gradient: Array1<f64>,
    pub hessian: Array2<f64>,
}

/// anything Newton-Raphson can climb
pub trait LogLikelihood {
    fn n_params(&self) -> usize;

    /// log-likelihood alone; defaults to the full evaluation
    fn loglik(&self, theta: &Array1<f64>) -> Result<f64> {
        Ok(self.evaluate(theta)?.loglik)
    }

    fn evaluate(&self, theta: &Array1<f64>) -> Result<Derivatives>;
}

/// converged maximum
#[derive(Debug, Clone)]
pub struct Optimum {
    pub theta: Array1<f64>,
    pub loglik: f64,
    pub information: Array2<f64>, // observed information, -hessian
    pub gradient: Array1<f64>,    // score at theta
    pub iterations: usize,
}

impl Optimum {
    /// inverse of the observed information
    pub fn covariance(&self) -> Result<Array2<f64>> {
        invert_matrix(&self.information)
    }

    /// parameters the next newton step would still move by more than
    /// `tolerance * max(|theta|, 1)`
    ///
    /// under a monotone likelihood the log-likelihood flattens out while the
    /// step stays roughly constant, so the estimate is heading to infinity
    /// even though the convergence test passed.
    pub fn diverging(&self, tolerance: f64) -> Result<Vec<usize>> {
        let step = solve_linear_system(&self.information, &self.gradient)?;
        Ok(step
            .iter()
            .zip(self.theta.iter())
            .enumerate()
            .filter(|(_, (s, t))| s.abs() > tolerance * t.abs().max(1.0))
            .map(|(j, _)| j)
            .collect())
    }
}

/// Newton-Raphson with step halving
#[derive(Debug, Clone, Default)]
pub struct NewtonRaphson {
    config: OptimizationConfig,
}

impl NewtonRaphson {
    pub fn new(config: OptimizationConfig) -> Self {
        Self { config }
    }

    /// climb from `start` until the log-likelihood stops moving
    pub fn maximize<F: LogLikelihood>(&self, objective: &F, start: Array1<f64>) -> Result<Optimum> {
        if start.len() != objective.n_params() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "start has {} values, objective has {} parameters",
                start.len(),
                objective.n_params()
            )));
        }

        let mut theta = start;
        let mut current = objective.evaluate(&theta)?;
        if !current.loglik.is_finite() {
            return Err(SurvivalError::numerical_error(
                "log-likelihood is not finite at the starting values",
            ));
        }

        for iteration in 1..=self.config.max_iterations {
            // newton direction: solve H step = g, move theta - step
            let step = solve_linear_system(&current.hessian, &current.gradient)?;
            let decrement = -current.gradient.dot(&step); // g' (-H)^-1 g

            let mut scale = 1.0;
            let mut accepted = None;
            for _ in 0..=self.config.max_halvings {
                let candidate = &theta - &(scale * &step);
                if candidate.iter().all(|v| v.is_finite()) {
                    if let Ok(ll) = objective.loglik(&candidate) {
                        if ll.is_finite() && ll >= current.loglik - 1e-12 * current.loglik.abs() {
                            accepted = Some((candidate, ll));
                            break;
                        }
                    }
                }
                scale *= 0.5;
            }

            let (candidate, new_loglik) = match accepted {
                Some(found) => found,
                None if decrement.abs() < 1e-8 => {
                    debug!("no uphill step left at iteration {}, accepting", iteration);
                    return self.finish(theta, current, iteration);
                }
                None => {
                    return Err(SurvivalError::numerical_error(format!(
                        "step halving failed at iteration {}",
                        iteration
                    )))
                }
            };

            let change = new_loglik - current.loglik;
            trace!("iteration {}: loglik {:.8} (step scale {})", iteration, new_loglik, scale);

            theta = candidate;
            current = objective.evaluate(&theta)?;

            if change.abs() <= self.config.tolerance * current.loglik.abs().max(1.0) {
                return self.finish(theta, current, iteration);
            }
        }

        Err(SurvivalError::numerical_error(format!(
            "Newton-Raphson failed to converge in {} iterations",
            self.config.max_iterations
        )))
    }

    fn finish(&self, theta: Array1<f64>, at: Derivatives, iterations: usize) -> Result<Optimum> {
        Ok(Optimum {
            theta,
            loglik: at.loglik,
            information: at.hessian.mapv(|v| -v),
            gradient: at.gradient,
            iterations,
        })
    }
}

/// Solve linear system Ax = b by LU with partial pivoting
pub fn solve_linear_system(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return Err(SurvivalError::invalid_dimensions("Matrix dimensions mismatch"));
    }

    let mut a_copy = a.clone();
    let mut b_copy = b.clone();

    // pivot threshold relative to the largest entry
    let scale = a.iter().fold(0.0f64, |m, v| m.max(v.abs())).max(1e-300);

    // Forward elimination
    for i in 0..n {
        let mut max_row = i;
        for k in i + 1..n {
            if a_copy[[k, i]].abs() > a_copy[[max_row, i]].abs() {
                max_row = k;
            }
        }

        if a_copy[[max_row, i]].abs() < 1e-12 * scale {
            return Err(SurvivalError::numerical_error("Matrix is singular"));
        }

        if max_row != i {
            for j in 0..n {
                a_copy.swap([i, j], [max_row, j]);
            }
            b_copy.swap(i, max_row);
        }

        for k in i + 1..n {
            let factor = a_copy[[k, i]] / a_copy[[i, i]];
            for j in i..n {
                a_copy[[k, j]] -= factor * a_copy[[i, j]];
            }
            b_copy[k] -= factor * b_copy[i];
        }
    }

    // Back substitution
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        x[i] = b_copy[i];
        for j in i + 1..n {
            x[i] -= a_copy[[i, j]] * x[j];
        }
        x[i] /= a_copy[[i, i]];
    }

    Ok(x)
}

/// inverse by solving against each unit vector
pub fn invert_matrix(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(SurvivalError::invalid_dimensions("can only invert square matrices"));
    }
    let mut inverse = Array2::zeros((n, n));
    for j in 0..n {
        let mut unit = Array1::zeros(n);
        unit[j] = 1.0;
        let col = solve_linear_system(a, &unit)?;
        inverse.column_mut(j).assign(&col);
    }
    Ok(inverse)
}

/// central-difference hessian of an analytic gradient, symmetrized
pub fn numerical_hessian<G>(theta: &Array1<f64>, gradient: G) -> Result<Array2<f64>>
where
    G: Fn(&Array1<f64>) -> Result<Array1<f64>>,
{
    let p = theta.len();
    let mut hessian = Array2::zeros((p, p));
    for j in 0..p {
        let h = 1e-5 * theta[j].abs().max(1.0);
        let mut up = theta.clone();
        let mut down = theta.clone();
        up[j] += h;
        down[j] -= h;
        let diff = (gradient(&up)? - gradient(&down)?) / (2.0 * h);
        hessian.column_mut(j).assign(&diff);
    }
    let symmetric = (&hessian + &hessian.t()) * 0.5;
    Ok(symmetric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    /// -(x - 2)^2 - 3 (y + 1)^2
    struct Quadratic;

    impl LogLikelihood for Quadratic {
        fn n_params(&self) -> usize {
            2
        }

        fn evaluate(&self, theta: &Array1<f64>) -> Result<Derivatives> {
            let (x, y) = (theta[0], theta[1]);
            Ok(Derivatives {
                loglik: -(x - 2.0).powi(2) - 3.0 * (y + 1.0).powi(2),
                gradient: array![-2.0 * (x - 2.0), -6.0 * (y + 1.0)],
                hessian: array![[-2.0, 0.0], [0.0, -6.0]],
            })
        }
    }

    /// sum of log densities of a poisson with log-rate theta
    struct PoissonLogRate {
        counts: Vec<f64>,
    }

    impl LogLikelihood for PoissonLogRate {
        fn n_params(&self) -> usize {
            1
        }

        fn evaluate(&self, theta: &Array1<f64>) -> Result<Derivatives> {
            let n = self.counts.len() as f64;
            let total: f64 = self.counts.iter().sum();
            let rate = theta[0].exp();
            Ok(Derivatives {
                loglik: total * theta[0] - n * rate,
                gradient: array![total - n * rate],
                hessian: array![[-n * rate]],
            })
        }
    }

    #[test]
    fn test_quadratic_one_step() {
        let opt = NewtonRaphson::default()
            .maximize(&Quadratic, array![10.0, 10.0])
            .unwrap();
        assert_relative_eq!(opt.theta[0], 2.0, epsilon = 1e-10);
        assert_relative_eq!(opt.theta[1], -1.0, epsilon = 1e-10);
        let cov = opt.covariance().unwrap();
        assert_relative_eq!(cov[[0, 0]], 0.5, epsilon = 1e-10);
        assert_relative_eq!(cov[[1, 1]], 1.0 / 6.0, epsilon = 1e-10);
    }

    #[test]
    fn test_poisson_mle() {
        let objective = PoissonLogRate { counts: vec![1.0, 3.0, 2.0, 6.0] };
        let opt = NewtonRaphson::default().maximize(&objective, array![0.0]).unwrap();
        assert_relative_eq!(opt.theta[0], 3.0f64.ln(), epsilon = 1e-8);
    }

    #[test]
    fn test_iteration_limit_is_an_error() {
        let objective = PoissonLogRate { counts: vec![100.0, 300.0] };
        let config = OptimizationConfig { max_iterations: 1, ..Default::default() };
        assert!(NewtonRaphson::new(config).maximize(&objective, array![-5.0]).is_err());
    }

    /// loglik -e^(-theta): always climbing, never reaching its supremum
    struct Flattening;

    impl LogLikelihood for Flattening {
        fn n_params(&self) -> usize {
            1
        }

        fn evaluate(&self, theta: &Array1<f64>) -> Result<Derivatives> {
            let tail = (-theta[0]).exp();
            Ok(Derivatives {
                loglik: -tail,
                gradient: array![tail],
                hessian: array![[-tail]],
            })
        }
    }

    #[test]
    fn test_converged_optimum_is_not_diverging() {
        let objective = PoissonLogRate { counts: vec![1.0, 3.0, 2.0, 6.0] };
        let opt = NewtonRaphson::default().maximize(&objective, array![0.0]).unwrap();
        assert!(opt.diverging(1e-3).unwrap().is_empty());
    }

    #[test]
    fn test_monotone_likelihood_is_diverging() {
        // each newton step is exactly 1, so the loglik change shrinks
        // geometrically and eventually passes the convergence test
        let opt = NewtonRaphson::default().maximize(&Flattening, array![0.0]).unwrap();
        assert!(opt.theta[0] > 10.0);
        assert_eq!(opt.diverging(1e-3).unwrap(), vec![0]);
    }

    #[test]
    fn test_solve_and_invert() {
        let a = array![[4.0, 1.0], [2.0, 3.0]];
        let x = solve_linear_system(&a, &array![1.0, 2.0]).unwrap();
        assert_relative_eq!(x[0], 0.1, epsilon = 1e-12);
        assert_relative_eq!(x[1], 0.6, epsilon = 1e-12);

        let inv = invert_matrix(&a).unwrap();
        let eye = a.dot(&inv);
        assert_relative_eq!(eye[[0, 0]], 1.0, epsilon = 1e-12);
        assert_relative_eq!(eye[[0, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_matrix() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(solve_linear_system(&a, &array![1.0, 1.0]).is_err());
    }

    #[test]
    fn test_numerical_hessian_matches_analytic() {
        let h = numerical_hessian(&array![0.3, -0.2], |t| Ok(Quadratic.evaluate(t)?.gradient)).unwrap();
        assert_relative_eq!(h[[0, 0]], -2.0, epsilon = 1e-6);
        assert_relative_eq!(h[[1, 1]], -6.0, epsilon = 1e-6);
        assert_relative_eq!(h[[0, 1]], 0.0, epsilon = 1e-6);
    }
}
