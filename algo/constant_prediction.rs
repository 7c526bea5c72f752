//! Personalization of the constant benchmark model.

use super::device::{ComputeContext, Device};
use super::{
    Algorithm, AlgorithmFamily, PersonalizeOutput, check_parameter_keys, create_progress_bar,
};
use crate::error::{Error, Result};
use crate::io::dataset::Dataset;
use crate::io::individual_parameters::IndividualParameters;
use crate::io::settings::AlgorithmSettings;
use crate::models::Model;
use crate::models::constant::ConstantModel;
use crate::models::parameters::{Hyperparameters, features_value};
use ndarray::Array1;
use std::str::FromStr;

/// Which summary of a subject's observed values is kept as its prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    /// Value at the last visit, missing if that visit lacks the feature.
    Last,
    /// Last observed value.
    LastKnown,
    Max,
    Mean,
}

impl FromStr for PredictionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last" => Ok(PredictionType::Last),
            "last_known" => Ok(PredictionType::LastKnown),
            "max" => Ok(PredictionType::Max),
            "mean" => Ok(PredictionType::Mean),
            other => Err(Error::Input(format!(
                "unknown prediction_type '{other}', expected one of last, last_known, max, mean"
            ))),
        }
    }
}

impl PredictionType {
    /// `observations` holds `(value, observed)` per visit, in visit order.
    fn summarize(self, observations: &[(f64, bool)]) -> f64 {
        let mut known = observations.iter().filter(|(_, observed)| *observed).map(|(v, _)| *v);
        match self {
            PredictionType::Last => match observations.last() {
                Some(&(value, true)) => value,
                _ => f64::NAN,
            },
            PredictionType::LastKnown => known.next_back().unwrap_or(f64::NAN),
            PredictionType::Max => known.fold(f64::NAN, f64::max),
            PredictionType::Mean => {
                let (sum, count) = known.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
                if count == 0 { f64::NAN } else { sum / count as f64 }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConstantPredictionAlgorithm {
    device: Device,
    prediction_type: PredictionType,
}

impl ConstantPredictionAlgorithm {
    pub const NAME: &'static str = "constant_prediction";

    pub fn new(settings: &AlgorithmSettings) -> Result<Self> {
        check_parameter_keys(Self::NAME, &settings.parameters, &["prediction_type"])?;
        let prediction_type = match settings.parameters.get("prediction_type") {
            None => PredictionType::Last,
            Some(toml::Value::String(s)) => s.parse()?,
            Some(other) => {
                return Err(Error::Type(format!(
                    "'prediction_type' must be a string, found {}",
                    other.type_str()
                )));
            }
        };
        Ok(Self {
            device: settings.device()?,
            prediction_type,
        })
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }
}

impl Algorithm for ConstantPredictionAlgorithm {
    type Output = PersonalizeOutput;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn family(&self) -> AlgorithmFamily {
        AlgorithmFamily::Personalize
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn run_impl(
        &mut self,
        model: &mut dyn Model,
        dataset: &mut Dataset,
        ctx: &ComputeContext,
    ) -> Result<PersonalizeOutput> {
        if model.name() != ConstantModel::NAME {
            return Err(Error::Input(format!(
                "'{}' personalizes '{}' models only, got '{}'",
                Self::NAME,
                ConstantModel::NAME,
                model.name()
            )));
        }
        if model.features().is_empty() {
            let mut hyperparameters = Hyperparameters::new();
            hyperparameters.insert("features".into(), features_value(dataset.headers()));
            model.load_hyperparameters(&hyperparameters)?;
        }

        let features = dataset.headers().to_vec();
        let mut individual_parameters = IndividualParameters::new(features.clone());
        let mut squared_residuals = 0.0;
        let mut n_residuals = 0usize;

        let pb = create_progress_bar(dataset.n_individuals() as u64, "Predicting constants");
        for (i, id) in dataset.indices().iter().enumerate() {
            let n_visits = dataset.n_visits_per_individual()[i];
            let mut prediction = Array1::<f64>::zeros(features.len());
            for k in 0..features.len() {
                let observations: Vec<(f64, bool)> = (0..n_visits)
                    .map(|j| (dataset.values()[[i, j, k]], dataset.mask()[[i, j, k]] > 0.0))
                    .collect();
                let value = self.prediction_type.summarize(&observations);
                for &(observed_value, observed) in &observations {
                    if observed && value.is_finite() {
                        squared_residuals += (observed_value - value).powi(2);
                        n_residuals += 1;
                    }
                }
                prediction[k] = ctx.precision.cast(value);
            }
            individual_parameters.add_individual(id, prediction)?;
            pb.inc(1);
        }
        pb.finish_and_clear();

        let noise_std = if n_residuals > 0 {
            ctx.precision.cast((squared_residuals / n_residuals as f64).sqrt())
        } else {
            f64::NAN
        };
        Ok(PersonalizeOutput {
            individual_parameters,
            noise_std,
        })
    }
}
