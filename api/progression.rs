//! The user-facing entry point: one progression model and everything that can
//! be done with it.

use crate::algo::simulate::SimulationResult;
use crate::algo::{self, FitOutput, PersonalizeOutput};
use crate::error::{Error, Result};
use crate::io::data::Data;
use crate::io::dataset::Dataset;
use crate::io::individual_parameters::IndividualParameters;
use crate::io::settings::AlgorithmSettings;
use crate::models::parameters::ModelSettings;
use crate::models::{Estimation, Model, OrdinalMethod, model_factory};
use ndarray::Array2;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Ages at which to estimate the model.
#[derive(Debug, Clone, PartialEq)]
pub enum Timepoints {
    /// Ages per subject.
    PerSubject(BTreeMap<String, Vec<f64>>),
    /// Structured `(subject, age)` index. Results follow this exact order,
    /// repeated pairs included.
    Index(Vec<(String, f64)>),
}

impl Timepoints {
    /// Ages per subject in order of first appearance.
    fn grouped(&self) -> Vec<(String, Vec<f64>)> {
        match self {
            Timepoints::PerSubject(map) => map
                .iter()
                .map(|(id, ages)| (id.clone(), ages.clone()))
                .collect(),
            Timepoints::Index(index) => {
                let mut groups: Vec<(String, Vec<f64>)> = Vec::new();
                let mut positions: HashMap<&str, usize> = HashMap::new();
                for (id, age) in index {
                    let pos = *positions.entry(id.as_str()).or_insert_with(|| {
                        groups.push((id.clone(), Vec::new()));
                        groups.len() - 1
                    });
                    groups[pos].1.push(*age);
                }
                groups
            }
        }
    }

    /// Flat `(subject, age)` rows in output order.
    fn index(&self) -> Vec<(String, f64)> {
        match self {
            Timepoints::PerSubject(map) => map
                .iter()
                .flat_map(|(id, ages)| ages.iter().map(move |&age| (id.clone(), age)))
                .collect(),
            Timepoints::Index(index) => index.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EstimateOutput {
    BySubject(BTreeMap<String, Estimation>),
    /// One row per `(subject, age)` pair of `index`.
    Table {
        index: Vec<(String, f64)>,
        columns: Vec<String>,
        values: Array2<f64>,
    },
}

/// A biomarker value, or several, whose ages are requested.
#[derive(Debug, Clone, PartialEq)]
pub enum BiomarkerValue {
    Scalar(f64),
    List(Vec<f64>),
}

impl BiomarkerValue {
    fn as_slice(&self) -> &[f64] {
        match self {
            BiomarkerValue::Scalar(v) => std::slice::from_ref(v),
            BiomarkerValue::List(values) => values,
        }
    }

    /// Converts a `subject = value | [values]` TOML table.
    pub fn table_from_toml(table: &toml::Table) -> Result<BTreeMap<String, BiomarkerValue>> {
        table
            .iter()
            .map(|(id, value)| {
                BiomarkerValue::try_from(value)
                    .map(|v| (id.clone(), v))
                    .map_err(|e| Error::Type(format!("subject '{id}': {e}")))
            })
            .collect()
    }
}

impl TryFrom<&toml::Value> for BiomarkerValue {
    type Error = Error;

    fn try_from(value: &toml::Value) -> Result<Self> {
        // Integers are refused like any other non-float value.
        fn number(value: &toml::Value) -> Option<f64> {
            value.as_float()
        }
        match value {
            toml::Value::Array(items) => items
                .iter()
                .map(|item| {
                    number(item).ok_or_else(|| {
                        Error::Type(format!(
                            "biomarker values must be floats, found {}",
                            item.type_str()
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()
                .map(BiomarkerValue::List),
            other => number(other).map(BiomarkerValue::Scalar).ok_or_else(|| {
                Error::Type(format!(
                    "a biomarker value must be a float or a list of floats, found {}",
                    other.type_str()
                ))
            }),
        }
    }
}

/// A disease-progression model together with its lifecycle.
pub struct Progression {
    model: Box<dyn Model>,
}

impl std::fmt::Debug for Progression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progression")
            .field("model", &self.model.name())
            .field("features", &self.model.features())
            .field("initialized", &self.model.is_initialized())
            .finish()
    }
}

impl Progression {
    /// An uninitialized model of the given kind.
    pub fn new(model_name: &str) -> Result<Self> {
        Ok(Self {
            model: model_factory(model_name)?,
        })
    }

    pub fn from_model(model: Box<dyn Model>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> &mut dyn Model {
        self.model.as_mut()
    }

    pub fn check_if_initialized(&self) -> Result<()> {
        if self.model.is_initialized() {
            Ok(())
        } else {
            Err(Error::Input("Model has not been initialized".to_string()))
        }
    }

    /// Calibrates the population parameters on `data`.
    pub fn fit(&mut self, data: &Data, settings: &AlgorithmSettings) -> Result<FitOutput> {
        let mut algorithm = algo::fit_algorithm(settings)?;
        let mut dataset = Dataset::new(data, Some(self.model.as_ref()))?;
        if !self.model.is_initialized() {
            self.model
                .initialize(&dataset, settings.model_initialization_method.as_deref())?;
        }
        let output = algorithm.run(self.model.as_mut(), &mut dataset)?;
        log::info!(
            "Calibrated '{}' with '{}', noise std {:.4}",
            self.model.name(),
            algorithm.name(),
            output.noise_std
        );
        Ok(output)
    }

    pub fn calibrate(&mut self, data: &Data, settings: &AlgorithmSettings) -> Result<FitOutput> {
        self.fit(data, settings)
    }

    pub fn personalize(
        &mut self,
        data: &Data,
        settings: &AlgorithmSettings,
    ) -> Result<IndividualParameters> {
        Ok(self.personalize_with_noise(data, settings)?.individual_parameters)
    }

    /// Estimates individual parameters, also returning the residual noise.
    pub fn personalize_with_noise(
        &mut self,
        data: &Data,
        settings: &AlgorithmSettings,
    ) -> Result<PersonalizeOutput> {
        self.check_if_initialized()?;
        let mut algorithm = algo::personalize_algorithm(settings)?;
        let mut dataset = Dataset::new(data, Some(self.model.as_ref()))?;
        algorithm.run(self.model.as_mut(), &mut dataset)
    }

    /// Model values of each subject at the requested ages.
    ///
    /// `to_table` defaults to a table exactly when `timepoints` is an index.
    pub fn estimate(
        &self,
        timepoints: &Timepoints,
        individual_parameters: &IndividualParameters,
        to_table: Option<bool>,
        ordinal_method: OrdinalMethod,
    ) -> Result<EstimateOutput> {
        self.check_if_initialized()?;
        let to_table = to_table.unwrap_or(matches!(timepoints, Timepoints::Index(_)));

        let mut estimations: Vec<(String, Estimation)> = Vec::new();
        for (id, ages) in timepoints.grouped() {
            let subject = individual_parameters.subject(&id)?;
            let trajectory = self.model.compute_individual_trajectory(&ages, &subject)?;
            let estimation = self
                .model
                .postprocess_model_estimation(trajectory, ordinal_method)?;
            estimations.push((id, estimation));
        }

        if !to_table {
            return Ok(EstimateOutput::BySubject(estimations.into_iter().collect()));
        }
        self.tabulate(timepoints.index(), estimations)
    }

    fn tabulate(
        &self,
        index: Vec<(String, f64)>,
        estimations: Vec<(String, Estimation)>,
    ) -> Result<EstimateOutput> {
        let columns: Vec<String> = match estimations.first() {
            Some((_, Estimation::Named(named))) => {
                named.iter().map(|(name, _)| name.clone()).collect()
            }
            _ => self.model.features().to_vec(),
        };
        let by_subject: HashMap<&str, &Estimation> = estimations
            .iter()
            .map(|(id, estimation)| (id.as_str(), estimation))
            .collect();

        let mut values = Array2::<f64>::from_elem((index.len(), columns.len()), f64::NAN);
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (row, (id, _)) in index.iter().enumerate() {
            let occurrence = seen.entry(id.as_str()).or_insert(0);
            let k = *occurrence;
            *occurrence += 1;
            let estimation = by_subject
                .get(id.as_str())
                .ok_or_else(|| Error::Input(format!("no estimation for subject '{id}'")))?;
            match estimation {
                Estimation::Values(matrix) => {
                    if matrix.ncols() != columns.len() {
                        return Err(Error::Type(format!(
                            "estimation of subject '{id}' has {} columns, expected {}",
                            matrix.ncols(),
                            columns.len()
                        )));
                    }
                    values.row_mut(row).assign(&matrix.row(k));
                }
                Estimation::Named(named) => {
                    for (j, (_, column)) in named.iter().enumerate().take(columns.len()) {
                        values[[row, j]] = column[k];
                    }
                }
            }
        }
        Ok(EstimateOutput::Table {
            index,
            columns,
            values,
        })
    }

    /// Ages at which each subject reaches the given biomarker values.
    ///
    /// A scalar input gives a scalar age, a list gives a list of the same length.
    pub fn estimate_ages_from_biomarker_values(
        &self,
        individual_parameters: &IndividualParameters,
        biomarker_values: &BTreeMap<String, BiomarkerValue>,
        feature: Option<&str>,
    ) -> Result<BTreeMap<String, BiomarkerValue>> {
        self.check_if_initialized()?;
        let features = self.model.features();
        match feature {
            Some(name) if !features.iter().any(|f| f == name) => {
                return Err(Error::Input(format!(
                    "feature '{name}' is not part of the model features {features:?}"
                )));
            }
            None if features.len() > 1 => {
                return Err(Error::Input(format!(
                    "the model is multivariate ({features:?}), the feature of the biomarker values must be given"
                )));
            }
            _ => {}
        }
        let subjects = biomarker_values
            .keys()
            .map(|id| individual_parameters.subject(id).map(|subject| (id, subject)))
            .collect::<Result<Vec<_>>>()?;

        let mut ages = BTreeMap::new();
        for ((id, subject), value) in subjects.into_iter().zip(biomarker_values.values()) {
            let estimated = self.model.compute_individual_ages_from_biomarker_values(
                value.as_slice(),
                &subject,
                feature,
            )?;
            let estimated = match value {
                BiomarkerValue::Scalar(_) => BiomarkerValue::Scalar(estimated[0]),
                BiomarkerValue::List(_) => BiomarkerValue::List(estimated.to_vec()),
            };
            ages.insert(id.clone(), estimated);
        }
        Ok(ages)
    }

    /// Samples a synthetic cohort resembling the subjects of `data`.
    pub fn simulate(
        &self,
        individual_parameters: &IndividualParameters,
        data: &Data,
        settings: &AlgorithmSettings,
    ) -> Result<SimulationResult> {
        self.check_if_initialized()?;
        let algorithm = algo::simulation_algorithm(settings)?;
        algorithm.run(self.model.as_ref(), individual_parameters, data)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.check_if_initialized()?;
        let document = ModelSettings::new(
            self.model.name(),
            self.model.hyperparameters(),
            self.model.parameters(),
        );
        document.save(path.as_ref())?;
        log::info!("Saved model '{}' to {}", self.model.name(), path.as_ref().display());
        Ok(())
    }

    /// Restores a saved model; the result is always initialized.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let document = ModelSettings::load(path)?;
        let mut model = model_factory(&document.name)?;
        model.load_hyperparameters(&document.hyperparameters)?;
        model.load_parameters(&document.parameters)?;
        model.mark_initialized();
        Ok(Self { model })
    }
}
