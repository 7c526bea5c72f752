//! Benchmark model predicting, for every subject, a constant value per feature.

use super::Model;
use super::parameters::{Hyperparameters, ParameterMap, features_hyperparameter, features_value};
use crate::algo::device::{Device, DeviceMovable};
use crate::error::{Error, Result};
use crate::io::dataset::Dataset;
use crate::io::individual_parameters::SubjectParameters;
use ndarray::{Array1, Array2};

/// The individual parameters of a subject are its predicted values, one per
/// feature and named after it. There are no population parameters.
#[derive(Debug, Clone)]
pub struct ConstantModel {
    features: Vec<String>,
    initialized: bool,
    device: Device,
}

impl Default for ConstantModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantModel {
    pub const NAME: &'static str = "constant";

    /// Built ready to personalize.
    pub fn new() -> Self {
        Self {
            features: Vec::new(),
            initialized: true,
            device: Device::default(),
        }
    }

    pub fn set_features(&mut self, features: Vec<String>) {
        self.features = features;
    }
}

impl DeviceMovable for ConstantModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn move_to_device(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }
}

impl Model for ConstantModel {
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
        hyperparameters
    }

    fn load_hyperparameters(&mut self, hyperparameters: &Hyperparameters) -> Result<()> {
        if let Some(unknown) = hyperparameters.keys().find(|k| k.as_str() != "features") {
            return Err(Error::Input(format!(
                "unknown hyperparameter '{unknown}' for model '{}'",
                Self::NAME
            )));
        }
        if let Some(features) = features_hyperparameter(hyperparameters)? {
            self.features = features;
        }
        Ok(())
    }

    fn parameters(&self) -> ParameterMap {
        ParameterMap::new()
    }

    fn load_parameters(&mut self, parameters: &ParameterMap) -> Result<()> {
        if let Some(name) = parameters.keys().next() {
            return Err(Error::Input(format!(
                "model '{}' has no population parameters, got '{name}'",
                Self::NAME
            )));
        }
        Ok(())
    }

    fn initialize(&mut self, dataset: &Dataset, method: Option<&str>) -> Result<()> {
        if let Some(method) = method {
            log::warn!("Model '{}' ignores initialization method '{method}'.", Self::NAME);
        }
        self.features = dataset.headers().to_vec();
        Ok(())
    }

    fn compute_individual_trajectory(
        &self,
        ages: &[f64],
        individual_parameters: &SubjectParameters<'_>,
    ) -> Result<Array2<f64>> {
        let values = self
            .features
            .iter()
            .map(|feature| individual_parameters.require(feature))
            .collect::<Result<Vec<f64>>>()?;
        let row = Array1::from_vec(values);
        let mut trajectory = Array2::<f64>::zeros((ages.len(), self.features.len()));
        for mut out in trajectory.rows_mut() {
            out.assign(&row);
        }
        Ok(trajectory)
    }

    fn compute_individual_ages_from_biomarker_values(
        &self,
        values: &[f64],
        individual_parameters: &SubjectParameters<'_>,
        feature: Option<&str>,
    ) -> Result<Array1<f64>> {
        let _ = (values, individual_parameters, feature);
        Err(Error::Input(format!(
            "model '{}' is constant in time, ages cannot be estimated from biomarker values",
            Self::NAME
        )))
    }
}
