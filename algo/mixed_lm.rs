//! Linear mixed-effects regression by profiled (restricted) maximum likelihood.
//!
//! For group `i` the model is `y_i = X_i β + Z_i b_i + ε_i` with
//! `b_i ~ N(0, σ² Ψ)` and `ε_i ~ N(0, σ² I)`. The fixed effects `β` and the
//! scale `σ²` are profiled out, so the optimizers only search over the lower
//! Cholesky factor of the unscaled covariance `Ψ`.

use super::optimize::{self, FAILED_EVALUATION, OptimizeResult};
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, Axis, s};
use ndarray_linalg::{Cholesky, Diag, Inverse, Solve, SolveTriangular, UPLO};
use serde::Deserialize;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;

/// Keys understood by [`MixedLmFitOptions`].
pub const ACCEPTED_OPTIONS: [&str; 4] = ["method", "reml", "maxiter", "gtol"];

/// Diagonal entries of `Ψ` below this are reported as lying on the boundary.
const BOUNDARY_THRESHOLD: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMethod {
    Bfgs,
    Nm,
    Powell,
}

impl FitMethod {
    /// Whether the method can hold parameters fixed during the search.
    pub fn supports_fixed_parameters(self) -> bool {
        matches!(self, FitMethod::Bfgs)
    }
}

impl fmt::Display for FitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FitMethod::Bfgs => "bfgs",
            FitMethod::Nm => "nm",
            FitMethod::Powell => "powell",
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MethodList {
    One(FitMethod),
    Many(Vec<FitMethod>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOptions {
    method: Option<MethodList>,
    reml: Option<bool>,
    maxiter: Option<usize>,
    gtol: Option<f64>,
}

/// Solver options left over once an algorithm has taken its own settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MixedLmFitOptions {
    /// Tried in order until one converges.
    pub method: Vec<FitMethod>,
    pub reml: bool,
    pub maxiter: usize,
    pub gtol: f64,
}

impl Default for MixedLmFitOptions {
    fn default() -> Self {
        Self {
            method: vec![FitMethod::Bfgs],
            reml: true,
            maxiter: 200,
            gtol: 1e-8,
        }
    }
}

impl MixedLmFitOptions {
    /// Validates residual settings of `algorithm`. Every unknown key is reported at once.
    pub fn from_table(algorithm: &str, table: toml::Table) -> Result<Self> {
        let unknown: Vec<String> = table
            .keys()
            .filter(|k| !ACCEPTED_OPTIONS.contains(&k.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(Error::UnrecognizedSettings {
                algorithm: algorithm.to_string(),
                keys: unknown,
            });
        }

        let raw: RawOptions = toml::Value::Table(table)
            .try_into()
            .map_err(|e| Error::Type(format!("invalid solver option for '{algorithm}': {e}")))?;
        let defaults = Self::default();
        let method = match raw.method {
            None => defaults.method,
            Some(MethodList::One(method)) => vec![method],
            Some(MethodList::Many(methods)) => methods,
        };
        if method.is_empty() {
            return Err(Error::Input(format!(
                "algorithm '{algorithm}' needs at least one optimization method"
            )));
        }
        let maxiter = raw.maxiter.unwrap_or(defaults.maxiter);
        if maxiter == 0 {
            return Err(Error::Input("'maxiter' must be positive".to_string()));
        }
        let gtol = raw.gtol.unwrap_or(defaults.gtol);
        if gtol.is_nan() || gtol <= 0.0 {
            return Err(Error::Input(format!("'gtol' must be positive, got {gtol}")));
        }
        Ok(Self {
            method,
            reml: raw.reml.unwrap_or(defaults.reml),
            maxiter,
            gtol,
        })
    }
}

/// Design and response of one group.
#[derive(Debug, Clone)]
struct Group {
    exog: Array2<f64>,
    exog_re: Array2<f64>,
    endog: Array1<f64>,
}

/// Profiled quantities at a given `Ψ`.
struct Profile {
    deviance: f64,
    fe_params: Array1<f64>,
    scale: f64,
    xtvx: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct MixedLmResults {
    pub fe_params: Array1<f64>,
    /// `Ψ`, the random-effects covariance in units of the residual variance.
    pub cov_re_unscaled: Array2<f64>,
    pub cov_re: Array2<f64>,
    pub scale: f64,
    pub bse_fe: Array1<f64>,
    pub bse_re: Array1<f64>,
    pub deviance: f64,
    pub converged: bool,
    pub method: FitMethod,
}

#[derive(Debug, Clone)]
pub struct MixedLm {
    groups: Vec<Group>,
    n_obs: usize,
    k_fe: usize,
    k_re: usize,
}

impl MixedLm {
    /// Groups rows by `labels`, in first-appearance order.
    pub fn new(
        endog: &Array1<f64>,
        exog: &Array2<f64>,
        labels: &[String],
        exog_re: &Array2<f64>,
    ) -> Result<Self> {
        let n_obs = endog.len();
        if exog.nrows() != n_obs || exog_re.nrows() != n_obs || labels.len() != n_obs {
            return Err(Error::Input(format!(
                "mixed model inputs disagree on the number of observations: \
                 endog {}, exog {}, exog_re {}, groups {}",
                n_obs,
                exog.nrows(),
                exog_re.nrows(),
                labels.len()
            )));
        }
        let k_fe = exog.ncols();
        let k_re = exog_re.ncols();
        if n_obs <= k_fe {
            return Err(Error::DataInput(format!(
                "{n_obs} observations cannot identify {k_fe} fixed effects"
            )));
        }

        let mut order: Vec<&str> = Vec::new();
        let mut rows: HashMap<&str, Vec<usize>> = HashMap::new();
        for (row, label) in labels.iter().enumerate() {
            rows.entry(label.as_str())
                .or_insert_with(|| {
                    order.push(label.as_str());
                    Vec::new()
                })
                .push(row);
        }
        let groups = order
            .iter()
            .map(|label| {
                let members = &rows[label];
                Group {
                    exog: exog.select(Axis(0), members),
                    exog_re: exog_re.select(Axis(0), members),
                    endog: endog.select(Axis(0), members),
                }
            })
            .collect();

        Ok(Self {
            groups,
            n_obs,
            k_fe,
            k_re,
        })
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    /// Number of free entries in the lower triangle of `Ψ`.
    fn n_theta(&self) -> usize {
        self.k_re * (self.k_re + 1) / 2
    }

    /// Row-major lower-triangle positions.
    fn lower_triangle(&self) -> Vec<(usize, usize)> {
        (0..self.k_re)
            .flat_map(|i| (0..=i).map(move |j| (i, j)))
            .collect()
    }

    fn psi_from_theta(&self, theta: &Array1<f64>) -> Array2<f64> {
        let mut factor = Array2::<f64>::zeros((self.k_re, self.k_re));
        for (&(i, j), &value) in self.lower_triangle().iter().zip(theta) {
            factor[[i, j]] = value;
        }
        factor.dot(&factor.t())
    }

    fn profile(&self, psi: &Array2<f64>, reml: bool) -> Result<Profile> {
        let mut xtvx = Array2::<f64>::zeros((self.k_fe, self.k_fe));
        let mut xtvy = Array1::<f64>::zeros(self.k_fe);
        let mut ytvy = 0.0;
        let mut logdet_v = 0.0;

        for group in &self.groups {
            let n = group.endog.len();
            let v = Array2::<f64>::eye(n) + group.exog_re.dot(psi).dot(&group.exog_re.t());
            let lower = v.cholesky(UPLO::Lower)?;
            logdet_v += 2.0 * lower.diag().iter().map(|d| d.ln()).sum::<f64>();

            let mut stacked = Array2::<f64>::zeros((n, self.k_fe + 1));
            stacked.slice_mut(s![.., ..self.k_fe]).assign(&group.exog);
            stacked.column_mut(self.k_fe).assign(&group.endog);
            let whitened = lower.solve_triangular(UPLO::Lower, Diag::NonUnit, &stacked)?;
            let wx = whitened.slice(s![.., ..self.k_fe]);
            let wy = whitened.column(self.k_fe);

            xtvx += &wx.t().dot(&wx);
            xtvy += &wx.t().dot(&wy);
            ytvy += wy.dot(&wy);
        }

        let fe_params = xtvx.solve(&xtvy)?;
        let quadratic = ytvy - xtvy.dot(&fe_params);
        if quadratic.is_nan() || quadratic <= 0.0 {
            return Err(Error::Numeric(format!(
                "weighted residual sum of squares is not positive ({quadratic:e})"
            )));
        }

        let n = self.n_obs as f64;
        let p = self.k_fe as f64;
        let (deviance, scale) = if reml {
            let dof = n - p;
            let xtvx_lower = xtvx.cholesky(UPLO::Lower)?;
            let logdet_xtvx = 2.0 * xtvx_lower.diag().iter().map(|d| d.ln()).sum::<f64>();
            let scale = quadratic / dof;
            (
                logdet_v + logdet_xtvx + dof * scale.ln() + dof * (1.0 + (2.0 * PI).ln()),
                scale,
            )
        } else {
            let scale = quadratic / n;
            (logdet_v + n * scale.ln() + n * (1.0 + (2.0 * PI).ln()), scale)
        };

        Ok(Profile {
            deviance,
            fe_params,
            scale,
            xtvx,
        })
    }

    fn deviance(&self, psi: &Array2<f64>, reml: bool) -> f64 {
        match self.profile(psi, reml) {
            Ok(profile) if profile.deviance.is_finite() => profile.deviance,
            _ => FAILED_EVALUATION,
        }
    }

    /// Fits the model, trying `options.method` in order until one converges.
    ///
    /// With `diagonal_covariance`, the off-diagonal factors of `Ψ` start at zero
    /// and are held there by methods that support fixed parameters. The other
    /// methods search over them freely.
    pub fn fit(
        &self,
        options: &MixedLmFitOptions,
        diagonal_covariance: bool,
    ) -> Result<MixedLmResults> {
        let positions = self.lower_triangle();
        let free: Vec<bool> = positions
            .iter()
            .map(|&(i, j)| i == j || !diagonal_covariance)
            .collect();
        let start: Array1<f64> = positions
            .iter()
            .map(|&(i, j)| if i == j { 1.0 } else { 0.0 })
            .collect();
        let objective =
            |theta: &Array1<f64>| self.deviance(&self.psi_from_theta(theta), options.reml);

        let mut best: Option<(FitMethod, OptimizeResult)> = None;
        for &method in &options.method {
            log::debug!(
                "Optimizing the {} deviance over {} covariance parameters with {method}",
                if options.reml { "REML" } else { "ML" },
                self.n_theta()
            );
            let result = match method {
                FitMethod::Bfgs => {
                    optimize::bfgs(&objective, &start, &free, options.gtol, options.maxiter)
                }
                FitMethod::Nm => optimize::nelder_mead(&objective, &start, options.maxiter)?,
                FitMethod::Powell => optimize::powell(&objective, &start, options.maxiter)?,
            };
            log::debug!(
                "{method}: deviance {:.6} after {} iterations (converged: {})",
                result.value,
                result.iterations,
                result.converged
            );
            let converged = result.converged;
            let improves = best
                .as_ref()
                .is_none_or(|(_, current)| result.value < current.value);
            if converged || improves {
                best = Some((method, result));
            }
            if converged {
                break;
            }
        }

        let (method, result) = best.ok_or_else(|| {
            Error::Numeric("no optimization method was configured".to_string())
        })?;
        if result.value >= FAILED_EVALUATION {
            return Err(Error::Numeric(
                "the mixed model deviance could not be evaluated at any tried point".to_string(),
            ));
        }
        if !result.converged {
            log::warn!(
                "Mixed model optimization did not converge with methods {:?}; \
                 using the best point found by {method}.",
                options.method.iter().map(ToString::to_string).collect::<Vec<_>>()
            );
        }

        let psi = self.psi_from_theta(&result.x);
        self.summarize(psi, options.reml, method, result.converged)
    }

    fn summarize(
        &self,
        psi: Array2<f64>,
        reml: bool,
        method: FitMethod,
        converged: bool,
    ) -> Result<MixedLmResults> {
        let profile = self.profile(&psi, reml)?;

        let fe_covariance = profile.xtvx.inv()? * profile.scale;
        let bse_fe = fe_covariance.diag().mapv(f64::sqrt);
        let bse_re = self.random_effect_standard_errors(&psi, reml, profile.scale);

        for (k, &variance) in psi.diag().iter().enumerate() {
            if variance < BOUNDARY_THRESHOLD {
                log::warn!(
                    "Random effect {k} has unscaled variance {variance:.3e}; \
                     the covariance estimate may be on the boundary of the parameter space."
                );
            }
        }

        Ok(MixedLmResults {
            fe_params: profile.fe_params,
            cov_re: &psi * profile.scale,
            cov_re_unscaled: psi,
            scale: profile.scale,
            bse_fe,
            bse_re,
            deviance: profile.deviance,
            converged,
            method,
        })
    }

    /// `sqrt(diag(scale * H⁻¹))` with `H` the finite-difference Hessian of
    /// half the deviance in the lower-triangle entries of `Ψ`.
    fn random_effect_standard_errors(
        &self,
        psi: &Array2<f64>,
        reml: bool,
        scale: f64,
    ) -> Array1<f64> {
        let positions = self.lower_triangle();
        let m = positions.len();
        let half_deviance = |delta: &[(usize, f64)]| -> Option<f64> {
            let mut perturbed = psi.clone();
            for &(k, step) in delta {
                let (i, j) = positions[k];
                perturbed[[i, j]] += step;
                if i != j {
                    perturbed[[j, i]] += step;
                }
            }
            self.profile(&perturbed, reml)
                .ok()
                .map(|profile| profile.deviance / 2.0)
                .filter(|v| v.is_finite())
        };
        let steps: Vec<f64> = positions
            .iter()
            .map(|&(i, j)| 1e-4 * (1.0 + psi[[i, j]].abs()))
            .collect();

        let mut hessian = Array2::<f64>::zeros((m, m));
        for a in 0..m {
            for b in a..m {
                let corners = [
                    half_deviance(&[(a, steps[a]), (b, steps[b])]),
                    half_deviance(&[(a, steps[a]), (b, -steps[b])]),
                    half_deviance(&[(a, -steps[a]), (b, steps[b])]),
                    half_deviance(&[(a, -steps[a]), (b, -steps[b])]),
                ];
                let value = match corners {
                    [Some(pp), Some(pm), Some(mp), Some(mm)] => {
                        (pp - pm - mp + mm) / (4.0 * steps[a] * steps[b])
                    }
                    _ => f64::NAN,
                };
                hessian[[a, b]] = value;
                hessian[[b, a]] = value;
            }
        }

        let inverse = if hessian.iter().all(|v| v.is_finite()) {
            hessian.inv().ok()
        } else {
            None
        };
        match inverse {
            Some(inverse) => inverse.diag().mapv(|v| (scale * v).sqrt()),
            None => {
                log::warn!(
                    "The Hessian of the random-effects covariance is not invertible; \
                     their standard errors are undefined."
                );
                Array1::from_elem(m, f64::NAN)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn table(source: &str) -> toml::Table {
        toml::from_str(source).unwrap()
    }

    /// Random intercept data: y = 2 + 0.5 x + b_g + e.
    fn random_intercept_problem(seed: u64) -> MixedLm {
        let mut rng = StdRng::seed_from_u64(seed);
        let group_effect = Normal::new(0.0, 1.0).unwrap();
        let noise = Normal::new(0.0, 0.3).unwrap();
        let mut endog = Vec::new();
        let mut exog = Vec::new();
        let mut labels = Vec::new();
        for g in 0..30 {
            let b = group_effect.sample(&mut rng);
            for k in 0..5 {
                let x = k as f64 - 2.0;
                endog.push(2.0 + 0.5 * x + b + noise.sample(&mut rng));
                exog.extend([1.0, x]);
                labels.push(format!("g{g}"));
            }
        }
        let n = endog.len();
        let exog = Array2::from_shape_vec((n, 2), exog).unwrap();
        let exog_re = Array2::<f64>::ones((n, 1));
        MixedLm::new(&Array1::from_vec(endog), &exog, &labels, &exog_re).unwrap()
    }

    #[test]
    fn options_reject_unknown_keys_all_at_once() {
        let err = MixedLmFitOptions::from_table(
            "lme_fit",
            table("reml = true\nlearning_rate = 0.1\nsteps = 3"),
        )
        .unwrap_err();
        match err {
            Error::UnrecognizedSettings { algorithm, mut keys } => {
                keys.sort();
                assert_eq!(algorithm, "lme_fit");
                assert_eq!(keys, vec!["learning_rate".to_string(), "steps".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn options_accept_one_or_many_methods() {
        let one = MixedLmFitOptions::from_table("lme_fit", table("method = \"powell\"")).unwrap();
        assert_eq!(one.method, vec![FitMethod::Powell]);
        let many = MixedLmFitOptions::from_table(
            "lme_fit",
            table("method = [\"nm\", \"bfgs\"]\nreml = false"),
        )
        .unwrap();
        assert_eq!(many.method, vec![FitMethod::Nm, FitMethod::Bfgs]);
        assert!(!many.reml);
        let defaults = MixedLmFitOptions::from_table("lme_fit", toml::Table::new()).unwrap();
        assert_eq!(defaults, MixedLmFitOptions::default());
        let wrong = MixedLmFitOptions::from_table("lme_fit", table("reml = \"yes\"")).unwrap_err();
        assert!(wrong.is_type_error());
    }

    #[test]
    fn recovers_fixed_effects_and_variances() {
        let model = random_intercept_problem(11);
        assert_eq!(model.n_groups(), 30);
        let results = model.fit(&MixedLmFitOptions::default(), false).unwrap();
        assert_abs_diff_eq!(results.fe_params[1], 0.5, epsilon = 0.05);
        assert_abs_diff_eq!(results.fe_params[0], 2.0, epsilon = 0.6);
        assert_abs_diff_eq!(results.scale.sqrt(), 0.3, epsilon = 0.06);
        assert!(results.cov_re[[0, 0]] > 0.3 && results.cov_re[[0, 0]] < 2.5);
        assert!(results.bse_fe.iter().all(|v| v.is_finite() && *v > 0.0));
        assert_eq!(results.method, FitMethod::Bfgs);
    }

    #[test]
    fn derivative_free_methods_agree_with_bfgs() {
        let model = random_intercept_problem(5);
        let reference = model.fit(&MixedLmFitOptions::default(), false).unwrap();
        for method in [FitMethod::Nm, FitMethod::Powell] {
            let options = MixedLmFitOptions {
                method: vec![method],
                maxiter: 1000,
                ..MixedLmFitOptions::default()
            };
            let results = model.fit(&options, false).unwrap();
            assert_abs_diff_eq!(results.fe_params[1], reference.fe_params[1], epsilon = 1e-3);
            assert_relative_eq!(
                results.cov_re_unscaled[[0, 0]],
                reference.cov_re_unscaled[[0, 0]],
                max_relative = 1e-2
            );
        }
    }

    #[test]
    fn diagonal_constraint_keeps_off_diagonal_at_zero() {
        let mut rng = StdRng::seed_from_u64(3);
        let noise = Normal::new(0.0, 0.2).unwrap();
        let mut endog = Vec::new();
        let mut exog = Vec::new();
        let mut labels = Vec::new();
        for g in 0..20 {
            let intercept = noise.sample(&mut rng) * 4.0;
            let slope = noise.sample(&mut rng) * 2.0;
            for k in 0..6 {
                let x = k as f64 / 2.0 - 1.25;
                endog.push(1.0 + intercept + (0.3 + slope) * x + noise.sample(&mut rng));
                exog.extend([1.0, x]);
                labels.push(format!("g{g}"));
            }
        }
        let n = endog.len();
        let exog = Array2::from_shape_vec((n, 2), exog).unwrap();
        let model = MixedLm::new(&Array1::from_vec(endog), &exog, &labels, &exog).unwrap();
        let results = model.fit(&MixedLmFitOptions::default(), true).unwrap();
        assert_eq!(results.cov_re_unscaled[[0, 1]], 0.0);
        assert_eq!(results.cov_re_unscaled[[1, 0]], 0.0);
        assert_eq!(results.bse_re.len(), 3);
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let endog = array![1.0, 2.0, 3.0];
        let exog = Array2::<f64>::ones((2, 1));
        let labels = vec!["a".to_string(); 3];
        assert!(MixedLm::new(&endog, &exog, &labels, &exog).unwrap_err().is_input_error());
    }
}
