//! Univariate linear mixed-effects progression model.
//!
//! The population trajectory is a straight line in standardized age. Each
//! subject shifts it by a random intercept and, optionally, a random slope.

use super::parameters::{
    Hyperparameters, ParameterMap, bool_hyperparameter, features_hyperparameter, features_value,
    matrix, scalar, vector,
};
use super::Model;
use crate::algo::device::{Device, DeviceMovable};
use crate::error::{Error, Result};
use crate::io::dataset::Dataset;
use crate::io::individual_parameters::SubjectParameters;
use ndarray::{Array1, Array2, Axis};

pub const RANDOM_INTERCEPT: &str = "random_intercept";
pub const RANDOM_SLOPE_AGE: &str = "random_slope_age";

const PARAMETER_NAMES: [&str; 8] = [
    "ages_mean",
    "ages_std",
    "fe_params",
    "cov_re",
    "cov_re_unscaled_inv",
    "noise_std",
    "bse_fe",
    "bse_re",
];

#[derive(Debug, Clone)]
pub struct LmeModel {
    features: Vec<String>,
    with_random_slope_age: bool,
    parameters: ParameterMap,
    initialized: bool,
    device: Device,
}

impl Default for LmeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LmeModel {
    pub const NAME: &'static str = "lme";

    pub fn new() -> Self {
        Self {
            features: Vec::new(),
            with_random_slope_age: true,
            parameters: ParameterMap::new(),
            initialized: false,
            device: Device::default(),
        }
    }

    /// Names of the per-subject random effects, in design-column order.
    pub fn random_effect_names(&self) -> Vec<String> {
        random_effect_names(self.with_random_slope_age)
    }

    fn set_features(&mut self, features: Vec<String>) -> Result<()> {
        if features.len() != 1 {
            return Err(Error::DataInput(format!(
                "LME model is univariate, got features {features:?}"
            )));
        }
        self.features = features;
        Ok(())
    }

    fn standardized(&self, ages: &[f64]) -> Result<Array1<f64>> {
        let mean = scalar(&self.parameters, "ages_mean")?;
        let std = scalar(&self.parameters, "ages_std")?;
        Ok(ages.iter().map(|age| (age - mean) / std).collect())
    }

    /// Total intercept and slope of one subject on the standardized age scale.
    fn subject_line(&self, individual_parameters: &SubjectParameters<'_>) -> Result<(f64, f64)> {
        let fe_params = vector(&self.parameters, "fe_params")?;
        if fe_params.len() != 2 {
            return Err(Error::Type(format!(
                "parameter 'fe_params' must hold an intercept and a slope, found {} values",
                fe_params.len()
            )));
        }
        let intercept = fe_params[0] + individual_parameters.require(RANDOM_INTERCEPT)?;
        let mut slope = fe_params[1];
        if self.with_random_slope_age {
            slope += individual_parameters.require(RANDOM_SLOPE_AGE)?;
        }
        Ok((intercept, slope))
    }

    fn check_feature(&self, feature: Option<&str>) -> Result<()> {
        match feature {
            Some(name) if !self.features.iter().any(|f| f == name) => Err(Error::Input(format!(
                "feature '{name}' is not part of the model features {:?}",
                self.features
            ))),
            _ => Ok(()),
        }
    }
}

pub fn random_effect_names(with_random_slope_age: bool) -> Vec<String> {
    let mut names = vec![RANDOM_INTERCEPT.to_string()];
    if with_random_slope_age {
        names.push(RANDOM_SLOPE_AGE.to_string());
    }
    names
}

impl DeviceMovable for LmeModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn move_to_device(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }
}

impl Model for LmeModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn features(&self) -> &[String] {
        &self.features
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    fn hyperparameters(&self) -> Hyperparameters {
        let mut hyperparameters = Hyperparameters::new();
        if !self.features.is_empty() {
            hyperparameters.insert("features".into(), features_value(&self.features));
        }
        hyperparameters.insert(
            "with_random_slope_age".into(),
            toml::Value::Boolean(self.with_random_slope_age),
        );
        hyperparameters
    }

    /// Merges the given entries into the current hyperparameters.
    fn load_hyperparameters(&mut self, hyperparameters: &Hyperparameters) -> Result<()> {
        let unknown: Vec<&String> = hyperparameters
            .keys()
            .filter(|k| !matches!(k.as_str(), "features" | "with_random_slope_age"))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::Input(format!(
                "unknown hyperparameters {unknown:?} for model '{}'",
                Self::NAME
            )));
        }
        if let Some(features) = features_hyperparameter(hyperparameters)? {
            self.set_features(features)?;
        }
        if let Some(slope) = bool_hyperparameter(hyperparameters, "with_random_slope_age")? {
            self.with_random_slope_age = slope;
        }
        Ok(())
    }

    fn parameters(&self) -> ParameterMap {
        self.parameters.clone()
    }

    fn load_parameters(&mut self, parameters: &ParameterMap) -> Result<()> {
        if let Some(unknown) = parameters
            .keys()
            .find(|k| !PARAMETER_NAMES.contains(&k.as_str()))
        {
            return Err(Error::Input(format!(
                "unknown parameter '{unknown}' for model '{}'",
                Self::NAME
            )));
        }
        if parameters.contains_key("cov_re") {
            let cov_re = matrix(parameters, "cov_re")?;
            let n_re = self.random_effect_names().len();
            if cov_re.dim() != (n_re, n_re) {
                return Err(Error::Type(format!(
                    "parameter 'cov_re' must be {n_re}x{n_re}, found {:?}",
                    cov_re.dim()
                )));
            }
        }
        self.parameters = parameters.clone();
        Ok(())
    }

    fn initialize(&mut self, dataset: &Dataset, method: Option<&str>) -> Result<()> {
        if let Some(method) = method {
            log::warn!(
                "Model '{}' has no initialization method '{method}'; it is initialized by its fit.",
                Self::NAME
            );
        }
        self.set_features(dataset.headers().to_vec())
    }

    fn compute_individual_trajectory(
        &self,
        ages: &[f64],
        individual_parameters: &SubjectParameters<'_>,
    ) -> Result<Array2<f64>> {
        let (intercept, slope) = self.subject_line(individual_parameters)?;
        let standardized = self.standardized(ages)?;
        let trajectory = standardized.mapv(|t| intercept + slope * t);
        Ok(trajectory.insert_axis(Axis(1)))
    }

    fn compute_individual_ages_from_biomarker_values(
        &self,
        values: &[f64],
        individual_parameters: &SubjectParameters<'_>,
        feature: Option<&str>,
    ) -> Result<Array1<f64>> {
        self.check_feature(feature)?;
        let (intercept, slope) = self.subject_line(individual_parameters)?;
        if slope == 0.0 {
            return Err(Error::Input(
                "subject trajectory is flat, its ages cannot be recovered from biomarker values"
                    .to_string(),
            ));
        }
        let mean = scalar(&self.parameters, "ages_mean")?;
        let std = scalar(&self.parameters, "ages_std")?;
        Ok(values
            .iter()
            .map(|value| mean + std * (value - intercept) / slope)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parameters::ParameterValue;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn calibrated(with_slope: bool) -> LmeModel {
        let mut model = LmeModel::new();
        let mut hyperparameters = Hyperparameters::new();
        hyperparameters.insert("features".into(), features_value(&["score".to_string()]));
        hyperparameters.insert("with_random_slope_age".into(), toml::Value::Boolean(with_slope));
        model.load_hyperparameters(&hyperparameters).unwrap();

        let n_re = if with_slope { 2 } else { 1 };
        let mut parameters = ParameterMap::new();
        parameters.insert("ages_mean".into(), ParameterValue::Scalar(70.0));
        parameters.insert("ages_std".into(), ParameterValue::Scalar(5.0));
        parameters.insert("fe_params".into(), ParameterValue::Vector(vec![1.0, 0.5]));
        parameters.insert(
            "cov_re".into(),
            ParameterValue::from_array2(&Array2::eye(n_re)),
        );
        parameters.insert("noise_std".into(), ParameterValue::Scalar(0.1));
        model.load_parameters(&parameters).unwrap();
        model.mark_initialized();
        model
    }

    #[test]
    fn trajectory_follows_subject_line() {
        let model = calibrated(true);
        let names = model.random_effect_names();
        let values = array![0.2, 0.1];
        let ip = SubjectParameters::new(&names, values.view());
        let trajectory = model.compute_individual_trajectory(&[70.0, 75.0], &ip).unwrap();
        assert_eq!(trajectory.dim(), (2, 1));
        assert_abs_diff_eq!(trajectory[[0, 0]], 1.2, epsilon = 1e-12);
        assert_abs_diff_eq!(trajectory[[1, 0]], 1.8, epsilon = 1e-12);
    }

    #[test]
    fn ages_from_values_invert_the_trajectory() {
        let model = calibrated(false);
        let names = model.random_effect_names();
        let values = array![-0.5];
        let ip = SubjectParameters::new(&names, values.view());
        let ages = model
            .compute_individual_ages_from_biomarker_values(&[0.5, 1.0], &ip, Some("score"))
            .unwrap();
        let back = model.compute_individual_trajectory(ages.as_slice().unwrap(), &ip).unwrap();
        assert_abs_diff_eq!(back[[0, 0]], 0.5, epsilon = 1e-10);
        assert_abs_diff_eq!(back[[1, 0]], 1.0, epsilon = 1e-10);
        assert!(
            model
                .compute_individual_ages_from_biomarker_values(&[0.5], &ip, Some("memory"))
                .unwrap_err()
                .is_input_error()
        );
    }

    #[test]
    fn flat_subject_cannot_be_inverted() {
        let model = calibrated(true);
        let names = model.random_effect_names();
        let values = array![0.0, -0.5];
        let ip = SubjectParameters::new(&names, values.view());
        let err = model
            .compute_individual_ages_from_biomarker_values(&[1.0], &ip, None)
            .unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn multivariate_features_are_rejected() {
        let mut model = LmeModel::new();
        let mut hyperparameters = Hyperparameters::new();
        hyperparameters.insert(
            "features".into(),
            features_value(&["a".to_string(), "b".to_string()]),
        );
        let err = model.load_hyperparameters(&hyperparameters).unwrap_err();
        assert!(matches!(err, Error::DataInput(_)));

        let mut unknown = Hyperparameters::new();
        unknown.insert("source_dimension".into(), toml::Value::Integer(2));
        assert!(model.load_hyperparameters(&unknown).unwrap_err().is_input_error());
    }

    #[test]
    fn covariance_shape_follows_random_slope() {
        let mut model = calibrated(false);
        let mut parameters = model.parameters();
        parameters.insert(
            "cov_re".into(),
            ParameterValue::from_array2(&Array2::eye(2)),
        );
        assert!(model.load_parameters(&parameters).unwrap_err().is_type_error());
    }
}
