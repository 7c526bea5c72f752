//! Calibration of the LME model.

use super::device::{ComputeContext, Device, Precision};
use super::mixed_lm::{MixedLm, MixedLmFitOptions};
use super::{Algorithm, AlgorithmFamily, FitOutput};
use crate::error::{Error, Result};
use crate::io::dataset::Dataset;
use crate::io::settings::AlgorithmSettings;
use crate::models::Model;
use crate::models::parameters::{
    Hyperparameters, ParameterMap, ParameterValue, bool_hyperparameter,
};
use itertools::izip;
use ndarray::{Array1, Array2, Axis, s};
use ndarray_linalg::{Eigh, Inverse, UPLO};

/// Relative eigenvalue threshold under which a covariance is treated as singular.
const SINGULAR_TOLERANCE: f64 = 1e-8;

const SINGULAR_COVARIANCE: &str =
    "Cannot predict random effects from singular covariance structure.";

/// Observed cells of a univariate dataset, in row-major (subject, visit) order.
#[derive(Debug, Clone)]
pub struct FlattenedObservations {
    pub ages: Array1<f64>,
    pub values: Array1<f64>,
    pub subjects: Vec<String>,
}

/// Drops padding and missing values from a univariate dataset.
///
/// Subject labels are built by repeating every row identifier
/// `max(n_visits_per_individual)` times before applying the same mask.
pub fn flatten_observations(dataset: &Dataset) -> Result<FlattenedObservations> {
    if dataset.dimension() != 1 {
        return Err(Error::DataInput(format!(
            "LME calibration needs univariate data, got features {:?}",
            dataset.headers()
        )));
    }
    let repeats = dataset
        .n_visits_per_individual()
        .iter()
        .copied()
        .max()
        .unwrap_or(0);
    let repeated_subjects = dataset
        .indices()
        .iter()
        .flat_map(|id| std::iter::repeat_n(id, repeats));

    let mask = dataset.mask().index_axis(Axis(2), 0);
    let values = dataset.values().index_axis(Axis(2), 0);

    let mut ages = Vec::new();
    let mut observed = Vec::new();
    let mut subjects = Vec::new();
    for (&age, &value, &m, id) in izip!(
        dataset.timepoints().iter(),
        values.iter(),
        mask.iter(),
        repeated_subjects
    ) {
        if m > 0.0 {
            ages.push(age);
            observed.push(value);
            subjects.push(id.clone());
        }
    }
    Ok(FlattenedObservations {
        ages: Array1::from_vec(ages),
        values: Array1::from_vec(observed),
        subjects,
    })
}

/// Inverts an unscaled random-effects covariance, refusing singular ones.
pub fn invert_covariance(covariance: &Array2<f64>) -> Result<Array2<f64>> {
    let singular = || Error::DataInput(SINGULAR_COVARIANCE.to_string());
    if covariance.iter().any(|v| !v.is_finite()) {
        return Err(singular());
    }
    let (eigenvalues, _) = covariance.eigh(UPLO::Lower).map_err(|_| singular())?;
    let largest = eigenvalues.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let smallest = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if largest <= 0.0 || smallest <= SINGULAR_TOLERANCE * largest {
        return Err(singular());
    }
    covariance.inv().map_err(|_| singular())
}

#[derive(Debug, Clone)]
pub struct LmeFitAlgorithm {
    device: Device,
    force_independent_random_effects: bool,
    /// Model hyperparameters given through the algorithm settings.
    forwarded_hyperparameters: Hyperparameters,
    fit_options: MixedLmFitOptions,
}

impl LmeFitAlgorithm {
    pub const NAME: &'static str = "lme_fit";

    pub fn new(settings: &AlgorithmSettings) -> Result<Self> {
        let mut residual = settings.parameters.clone();

        let force_independent = residual.remove("force_independent_random_effects");
        let force_independent_random_effects = match force_independent {
            None => false,
            Some(toml::Value::Boolean(b)) => b,
            Some(other) => {
                return Err(Error::Type(format!(
                    "'force_independent_random_effects' must be a boolean, found {}",
                    other.type_str()
                )));
            }
        };

        let mut forwarded_hyperparameters = Hyperparameters::new();
        if let Some(value) = residual.remove("with_random_slope_age") {
            if !value.is_bool() {
                return Err(Error::Type(format!(
                    "'with_random_slope_age' must be a boolean, found {}",
                    value.type_str()
                )));
            }
            forwarded_hyperparameters.insert("with_random_slope_age".to_string(), value);
        }

        let fit_options = MixedLmFitOptions::from_table(Self::NAME, residual)?;

        Ok(Self {
            device: settings.device()?,
            force_independent_random_effects,
            forwarded_hyperparameters,
            fit_options,
        })
    }

    pub fn fit_options(&self) -> &MixedLmFitOptions {
        &self.fit_options
    }
}

fn cast_parameter(precision: Precision, value: ParameterValue) -> ParameterValue {
    value.map(|v| precision.cast(v))
}

impl Algorithm for LmeFitAlgorithm {
    type Output = FitOutput;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn family(&self) -> AlgorithmFamily {
        AlgorithmFamily::Fit
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn run_impl(
        &mut self,
        model: &mut dyn Model,
        dataset: &mut Dataset,
        ctx: &ComputeContext,
    ) -> Result<FitOutput> {
        if !self.forwarded_hyperparameters.is_empty() {
            log::warn!(
                "You should define {:?} directly as hyperparameters of the LME model. Passing them through the '{}' settings is deprecated.",
                self.forwarded_hyperparameters.keys().collect::<Vec<_>>(),
                Self::NAME
            );
            model.load_hyperparameters(&self.forwarded_hyperparameters)?;
        }
        let with_random_slope_age =
            bool_hyperparameter(&model.hyperparameters(), "with_random_slope_age")?.ok_or_else(|| {
                Error::Input(format!(
                    "model '{}' has no 'with_random_slope_age' hyperparameter and cannot be fitted by '{}'",
                    model.name(),
                    Self::NAME
                ))
            })?;

        let observations = flatten_observations(dataset)?;
        let n_obs = observations.ages.len();
        let ages_mean = observations
            .ages
            .mean()
            .ok_or_else(|| Error::DataInput("no observed values to fit".to_string()))?;
        let ages_std = observations.ages.std(0.0);
        if ages_std.is_nan() || ages_std <= 0.0 {
            return Err(Error::DataInput(
                "all observations share the same age, the age effect cannot be estimated"
                    .to_string(),
            ));
        }
        let ages_norm = observations.ages.mapv(|age| (age - ages_mean) / ages_std);

        let mut exog = Array2::<f64>::ones((n_obs, 2));
        exog.slice_mut(s![.., 1]).assign(&ages_norm);
        let exog_re = if with_random_slope_age {
            exog.clone()
        } else {
            Array2::<f64>::ones((n_obs, 1))
        };

        let diagonal_covariance = with_random_slope_age && self.force_independent_random_effects;
        if diagonal_covariance
            && self
                .fit_options
                .method
                .iter()
                .any(|m| !m.supports_fixed_parameters())
        {
            log::warn!(
                "Methods {{'powell','nm'}} are not compatible with `force_independent_random_effects`; the constraint is not enforced by them."
            );
        }

        let lme = MixedLm::new(&observations.values, &exog, &observations.subjects, &exog_re)?;
        log::info!(
            "Fitting LME on {} observations from {} subjects (random slope on age: {}).",
            n_obs,
            lme.n_groups(),
            with_random_slope_age
        );
        let fitted = lme.fit(&self.fit_options, diagonal_covariance)?;
        let cov_re_unscaled_inv = invert_covariance(&fitted.cov_re_unscaled)?;
        let noise_std = ctx.precision.cast(fitted.scale.sqrt());

        let mut parameters = ParameterMap::new();
        parameters.insert("ages_mean".into(), ParameterValue::Scalar(ages_mean));
        parameters.insert("ages_std".into(), ParameterValue::Scalar(ages_std));
        parameters.insert("fe_params".into(), ParameterValue::from_array1(&fitted.fe_params));
        parameters.insert("cov_re".into(), ParameterValue::from_array2(&fitted.cov_re));
        parameters.insert(
            "cov_re_unscaled_inv".into(),
            ParameterValue::from_array2(&cov_re_unscaled_inv),
        );
        parameters.insert("noise_std".into(), ParameterValue::Scalar(noise_std));
        parameters.insert("bse_fe".into(), ParameterValue::from_array1(&fitted.bse_fe));
        parameters.insert("bse_re".into(), ParameterValue::from_array1(&fitted.bse_re));
        let parameters: ParameterMap = parameters
            .into_iter()
            .map(|(name, value)| (name, cast_parameter(ctx.precision, value)))
            .collect();
        model.load_parameters(&parameters)?;

        log::info!(
            "LME fit done with {}: fixed effects {:?}, noise std {:.4}",
            fitted.method,
            fitted.fe_params.to_vec(),
            noise_std
        );
        Ok(FitOutput { noise_std })
    }
}
