//! Progression models consumed by the calibration pipeline.

pub mod constant;
pub mod lme;
pub mod parameters;

use crate::algo::device::DeviceMovable;
use crate::error::{Error, Result};
use crate::io::dataset::Dataset;
use crate::io::individual_parameters::SubjectParameters;
use ndarray::{Array1, Array2};
use parameters::{Hyperparameters, ParameterMap};
use std::str::FromStr;

/// Decision rule used to turn continuous ordinal model output into an estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrdinalMethod {
    /// Most likely level.
    #[default]
    MaximumLikelihood,
    /// Expected level.
    Expectation,
    /// Probability of every level.
    Probabilities,
}

impl FromStr for OrdinalMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MLE" | "maximum_likelihood" => Ok(OrdinalMethod::MaximumLikelihood),
            "E" | "expectation" => Ok(OrdinalMethod::Expectation),
            "P" | "probabilities" => Ok(OrdinalMethod::Probabilities),
            other => Err(Error::Input(format!(
                "unknown ordinal method '{other}', expected one of MLE, E, P"
            ))),
        }
    }
}

/// Model output for one subject at its requested ages.
#[derive(Debug, Clone, PartialEq)]
pub enum Estimation {
    /// One row per age, one column per model feature.
    Values(Array2<f64>),
    /// One named column per output, one entry per age. Produced by postprocessing
    /// steps whose columns differ from the model features.
    Named(Vec<(String, Array1<f64>)>),
}

/// Capabilities the orchestrator and algorithms need from a model.
pub trait Model: DeviceMovable {
    fn name(&self) -> &str;

    fn features(&self) -> &[String];

    fn is_initialized(&self) -> bool;

    /// Irreversibly flags the model as initialized.
    fn mark_initialized(&mut self);

    fn hyperparameters(&self) -> Hyperparameters;

    fn load_hyperparameters(&mut self, hyperparameters: &Hyperparameters) -> Result<()>;

    fn parameters(&self) -> ParameterMap;

    /// Replaces all parameters.
    fn load_parameters(&mut self, parameters: &ParameterMap) -> Result<()>;

    /// Model-specific default initialization from a dataset, before the first fit.
    fn initialize(&mut self, dataset: &Dataset, method: Option<&str>) -> Result<()>;

    /// Trajectory at `ages`, shaped `(ages.len(), features.len())`.
    fn compute_individual_trajectory(
        &self,
        ages: &[f64],
        individual_parameters: &SubjectParameters<'_>,
    ) -> Result<Array2<f64>>;

    /// Ages at which `feature` reaches each of `values`.
    fn compute_individual_ages_from_biomarker_values(
        &self,
        values: &[f64],
        individual_parameters: &SubjectParameters<'_>,
        feature: Option<&str>,
    ) -> Result<Array1<f64>>;

    /// Hook for models whose raw output is not the final estimator.
    fn postprocess_model_estimation(
        &self,
        estimate: Array2<f64>,
        ordinal_method: OrdinalMethod,
    ) -> Result<Estimation> {
        let _ = ordinal_method;
        Ok(Estimation::Values(estimate))
    }
}

/// Builds an uninitialized model from its name.
pub fn model_factory(name: &str) -> Result<Box<dyn Model>> {
    match name {
        lme::LmeModel::NAME => Ok(Box::new(lme::LmeModel::new())),
        constant::ConstantModel::NAME => Ok(Box::new(constant::ConstantModel::new())),
        other => Err(Error::Input(format!(
            "unknown model '{other}', available models are '{}' and '{}'",
            lme::LmeModel::NAME,
            constant::ConstantModel::NAME
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_method_accepts_short_and_long_names() {
        assert_eq!("MLE".parse::<OrdinalMethod>().unwrap(), OrdinalMethod::MaximumLikelihood);
        assert_eq!(
            "maximum_likelihood".parse::<OrdinalMethod>().unwrap(),
            OrdinalMethod::MaximumLikelihood
        );
        assert_eq!("E".parse::<OrdinalMethod>().unwrap(), OrdinalMethod::Expectation);
        assert_eq!(
            "probabilities".parse::<OrdinalMethod>().unwrap(),
            OrdinalMethod::Probabilities
        );
        assert!("median".parse::<OrdinalMethod>().unwrap_err().is_input_error());
    }

    #[test]
    fn factory_builds_uninitialized_lme() {
        let model = model_factory("lme").unwrap();
        assert_eq!(model.name(), "lme");
        assert!(!model.is_initialized());
        assert!(model_factory("logistic").err().unwrap().is_input_error());
    }
}
