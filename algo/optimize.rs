//! Unconstrained minimizers used by the mixed-model solver.

use crate::error::{Error, Result};
use argmin::core::{CostFunction, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::brent::BrentOpt;
use argmin::solver::neldermead::NelderMead;
use ndarray::Array1;
use std::cell::RefCell;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Objective value returned in place of a failed evaluation.
pub const FAILED_EVALUATION: f64 = 1e10;

#[derive(Debug, Clone)]
pub struct OptimizeResult {
    pub x: Array1<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Keeps the lowest objective seen so far.
struct BestPoint {
    x: Array1<f64>,
    value: f64,
}

impl BestPoint {
    fn new(x: &Array1<f64>) -> Self {
        Self {
            x: x.clone(),
            value: f64::INFINITY,
        }
    }

    fn offer(&mut self, x: &Array1<f64>, value: f64) {
        if value < self.value {
            self.value = value;
            self.x = x.clone();
        }
    }
}

/// Central finite-difference gradient of `f` at `x`.
pub fn numerical_gradient(f: &dyn Fn(&Array1<f64>) -> f64, x: &Array1<f64>) -> Array1<f64> {
    let mut grad = Array1::<f64>::zeros(x.len());
    let mut shifted = x.clone();
    for i in 0..x.len() {
        let h = 1e-5 * (1.0 + x[i].abs());
        shifted[i] = x[i] + h;
        let forward = f(&shifted);
        shifted[i] = x[i] - h;
        let backward = f(&shifted);
        shifted[i] = x[i];
        grad[i] = (forward - backward) / (2.0 * h);
    }
    grad
}

/// Quasi-Newton minimization with a Wolfe line search.
///
/// `free[i] == false` pins coordinate `i` to its starting value by zeroing its
/// gradient. When the line search stops before the gradient tolerance is met,
/// the best point seen is returned and counts as converged only if it is
/// stationary to within finite-difference accuracy.
pub fn bfgs(
    f: &dyn Fn(&Array1<f64>) -> f64,
    x0: &Array1<f64>,
    free: &[bool],
    gtol: f64,
    maxiter: usize,
) -> OptimizeResult {
    let best = RefCell::new(BestPoint::new(x0));
    let pin = |grad: &mut Array1<f64>| {
        for (g, &is_free) in grad.iter_mut().zip(free) {
            if !is_free || !g.is_finite() {
                *g = 0.0;
            }
        }
    };
    let cost_and_grad = |x: &Array1<f64>| -> (f64, Array1<f64>) {
        let value = f(x);
        best.borrow_mut().offer(x, value);
        let mut grad = numerical_gradient(f, x);
        pin(&mut grad);
        (value, grad)
    };

    let outcome = Bfgs::new(x0.clone(), cost_and_grad)
        .with_tolerance(gtol)
        .with_max_iterations(maxiter)
        .run();

    match outcome {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => OptimizeResult {
            x: final_point,
            value: final_value,
            iterations,
            converged: true,
        },
        Err(e) => {
            log::debug!("BFGS stopped early: {e:?}");
            let BestPoint { x, value } = best.into_inner();
            let mut grad = numerical_gradient(f, &x);
            pin(&mut grad);
            let grad_norm = grad.iter().fold(0.0_f64, |acc, g| acc.max(g.abs()));
            let stationary = grad_norm <= gtol.max(1e-5 * (1.0 + value.abs()));
            OptimizeResult {
                x,
                value,
                iterations: maxiter,
                converged: value.is_finite() && stationary,
            }
        }
    }
}

/// Nelder–Mead stops once the simplex values have this standard deviation.
const SD_TOLERANCE: f64 = 1e-8;
const LINE_SEARCH_ITERATIONS: u64 = 100;
const POWELL_FTOL: f64 = 1e-4;

/// The objective seen by argmin solvers over plain `Vec<f64>` parameters.
struct Objective<'a> {
    f: &'a dyn Fn(&Array1<f64>) -> f64,
}

impl CostFunction for Objective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        Ok((self.f)(&Array1::from(param.clone())))
    }
}

/// `alpha -> f(origin + alpha * direction)`.
struct Line<'a> {
    f: &'a dyn Fn(&Array1<f64>) -> f64,
    origin: &'a Array1<f64>,
    direction: &'a Array1<f64>,
}

impl Line<'_> {
    fn at(&self, alpha: f64) -> f64 {
        (self.f)(&(self.origin + &(self.direction * alpha)))
    }
}

impl CostFunction for Line<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, alpha: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        Ok(self.at(*alpha))
    }
}

fn solver_error(e: argmin::core::Error) -> Error {
    Error::Numeric(format!("optimizer failed: {e}"))
}

fn solver_converged(status: &TerminationStatus) -> bool {
    matches!(
        status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
    )
}

/// Nelder–Mead downhill simplex, started from `x0` and its 5% perturbations
/// along every axis.
pub fn nelder_mead(
    f: &dyn Fn(&Array1<f64>) -> f64,
    x0: &Array1<f64>,
    maxiter: usize,
) -> Result<OptimizeResult> {
    let mut simplex = vec![x0.to_vec()];
    for i in 0..x0.len() {
        let mut vertex = x0.to_vec();
        vertex[i] = if vertex[i] != 0.0 { 1.05 * vertex[i] } else { 0.00025 };
        simplex.push(vertex);
    }
    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(SD_TOLERANCE)
        .map_err(solver_error)?;

    let res = Executor::new(Objective { f }, solver)
        .configure(|state| state.max_iters(maxiter as u64))
        .run()
        .map_err(solver_error)?;

    let state = res.state();
    let x = state
        .get_best_param()
        .cloned()
        .map(Array1::from)
        .ok_or_else(|| Error::Numeric("Nelder-Mead returned no point".to_string()))?;
    Ok(OptimizeResult {
        x,
        value: state.get_best_cost(),
        iterations: state.get_iter() as usize,
        converged: solver_converged(state.get_termination_status()),
    })
}

/// Powell's conjugate direction method. Each line search brackets a minimum
/// and refines it with Brent's method.
pub fn powell(
    f: &dyn Fn(&Array1<f64>) -> f64,
    x0: &Array1<f64>,
    maxiter: usize,
) -> Result<OptimizeResult> {
    let n = x0.len();
    let mut directions: Vec<Array1<f64>> = (0..n)
        .map(|i| {
            let mut d = Array1::<f64>::zeros(n);
            d[i] = 1.0;
            d
        })
        .collect();

    let mut x = x0.clone();
    let mut fx = f(&x);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < maxiter {
        iterations += 1;
        let start = x.clone();
        let f_start = fx;
        let mut largest_drop = 0.0;
        let mut largest_index = 0;

        for (i, direction) in directions.iter().enumerate() {
            let f_before = fx;
            let (alpha, f_new) = line_minimize(f, &x, direction, fx)?;
            x = &x + &(direction * alpha);
            fx = f_new;
            if f_before - fx > largest_drop {
                largest_drop = f_before - fx;
                largest_index = i;
            }
        }

        if 2.0 * (f_start - fx) <= POWELL_FTOL * (f_start.abs() + fx.abs()) + 1e-20 {
            converged = true;
            break;
        }

        let shift = &x - &start;
        let extrapolated = &x + &shift;
        let f_extrapolated = f(&extrapolated);
        if f_extrapolated < f_start {
            let t = 2.0 * (f_start - 2.0 * fx + f_extrapolated)
                * (f_start - fx - largest_drop).powi(2)
                - largest_drop * (f_start - f_extrapolated).powi(2);
            if t < 0.0 {
                let (alpha, f_new) = line_minimize(f, &x, &shift, fx)?;
                x = &x + &(&shift * alpha);
                fx = f_new;
                directions.remove(largest_index);
                directions.push(shift);
            }
        }
    }

    Ok(OptimizeResult {
        x,
        value: fx,
        iterations,
        converged,
    })
}

/// Minimizes `alpha -> f(x + alpha d)`; returns the step and the value reached.
fn line_minimize(
    f: &dyn Fn(&Array1<f64>) -> f64,
    x: &Array1<f64>,
    direction: &Array1<f64>,
    fx: f64,
) -> Result<(f64, f64)> {
    const GOLDEN: f64 = 1.618_033_988_749_895;
    let line = Line {
        f,
        origin: x,
        direction,
    };

    // Bracket a minimum starting from the unit step.
    let (mut a, mut b, mut fb) = (0.0, 1.0, line.at(1.0));
    if fb > fx {
        a = 1.0;
        b = 0.0;
        fb = fx;
    }
    let mut c = b + GOLDEN * (b - a);
    let mut fc = line.at(c);
    let mut expansions = 0;
    while fc < fb && expansions < 50 {
        a = b;
        b = c;
        fb = fc;
        c = b + GOLDEN * (b - a);
        fc = line.at(c);
        expansions += 1;
    }
    let (lo, hi) = if a < c { (a, c) } else { (c, a) };

    let res = Executor::new(line, BrentOpt::new(lo, hi))
        .configure(|state| state.max_iters(LINE_SEARCH_ITERATIONS))
        .run()
        .map_err(solver_error)?;
    let state = res.state();
    let alpha = state.get_best_param().copied().unwrap_or(0.0);
    let value = state.get_best_cost();
    if value < fx {
        Ok((alpha, value))
    } else {
        Ok((0.0, fx))
    }
}
