//! Named model parameters, hyperparameters and the persisted model document.

use crate::error::{Error, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// A single named parameter: a scalar, a vector or a row-major matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Scalar(f64),
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
}

impl ParameterValue {
    pub fn from_array1(values: &Array1<f64>) -> Self {
        ParameterValue::Vector(values.to_vec())
    }

    pub fn from_array2(values: &Array2<f64>) -> Self {
        ParameterValue::Matrix(values.outer_iter().map(|row| row.to_vec()).collect())
    }

    fn kind(&self) -> &'static str {
        match self {
            ParameterValue::Scalar(_) => "scalar",
            ParameterValue::Vector(_) => "vector",
            ParameterValue::Matrix(_) => "matrix",
        }
    }

    /// Applies `f` to every stored number.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        match self {
            ParameterValue::Scalar(v) => ParameterValue::Scalar(f(*v)),
            ParameterValue::Vector(v) => ParameterValue::Vector(v.iter().map(|x| f(*x)).collect()),
            ParameterValue::Matrix(rows) => ParameterValue::Matrix(
                rows.iter()
                    .map(|row| row.iter().map(|x| f(*x)).collect())
                    .collect(),
            ),
        }
    }
}

/// Population parameters of a model, keyed by name.
pub type ParameterMap = BTreeMap<String, ParameterValue>;

/// Structural choices of a model, keyed by name.
pub type Hyperparameters = toml::Table;

fn require<'a>(params: &'a ParameterMap, name: &str) -> Result<&'a ParameterValue> {
    params
        .get(name)
        .ok_or_else(|| Error::Input(format!("missing model parameter '{name}'")))
}

pub fn scalar(params: &ParameterMap, name: &str) -> Result<f64> {
    match require(params, name)? {
        ParameterValue::Scalar(v) => Ok(*v),
        ParameterValue::Vector(v) if v.len() == 1 => Ok(v[0]),
        other => Err(Error::Type(format!(
            "parameter '{name}' must be a scalar, found a {}",
            other.kind()
        ))),
    }
}

pub fn vector(params: &ParameterMap, name: &str) -> Result<Array1<f64>> {
    match require(params, name)? {
        ParameterValue::Scalar(v) => Ok(Array1::from_elem(1, *v)),
        ParameterValue::Vector(v) => Ok(Array1::from_vec(v.clone())),
        other => Err(Error::Type(format!(
            "parameter '{name}' must be a vector, found a {}",
            other.kind()
        ))),
    }
}

pub fn matrix(params: &ParameterMap, name: &str) -> Result<Array2<f64>> {
    match require(params, name)? {
        ParameterValue::Scalar(v) => Ok(Array2::from_elem((1, 1), *v)),
        ParameterValue::Matrix(rows) => {
            let n_rows = rows.len();
            let n_cols = rows.first().map_or(0, Vec::len);
            if rows.iter().any(|row| row.len() != n_cols) {
                return Err(Error::Type(format!(
                    "parameter '{name}' must be a rectangular matrix"
                )));
            }
            let flat: Vec<f64> = rows.iter().flatten().copied().collect();
            Array2::from_shape_vec((n_rows, n_cols), flat)
                .map_err(|e| Error::Type(format!("parameter '{name}': {e}")))
        }
        ParameterValue::Vector(v) if v.len() == 1 => Ok(Array2::from_elem((1, 1), v[0])),
        other => Err(Error::Type(format!(
            "parameter '{name}' must be a matrix, found a {}",
            other.kind()
        ))),
    }
}

pub fn bool_hyperparameter(hyperparameters: &Hyperparameters, name: &str) -> Result<Option<bool>> {
    match hyperparameters.get(name) {
        None => Ok(None),
        Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
        Some(other) => Err(Error::Type(format!(
            "hyperparameter '{name}' must be a boolean, found {}",
            other.type_str()
        ))),
    }
}

pub fn features_hyperparameter(hyperparameters: &Hyperparameters) -> Result<Option<Vec<String>>> {
    match hyperparameters.get("features") {
        None => Ok(None),
        Some(toml::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                toml::Value::String(s) => Ok(s.clone()),
                other => Err(Error::Type(format!(
                    "feature names must be strings, found {}",
                    other.type_str()
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(other) => Err(Error::Type(format!(
            "hyperparameter 'features' must be a list of strings, found {}",
            other.type_str()
        ))),
    }
}

pub fn features_value(features: &[String]) -> toml::Value {
    toml::Value::Array(
        features
            .iter()
            .map(|f| toml::Value::String(f.clone()))
            .collect(),
    )
}

/// The flat, human-readable document a model is saved to and restored from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "crate_version")]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub parameters: ParameterMap,
}

fn crate_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl ModelSettings {
    pub fn new(name: &str, hyperparameters: Hyperparameters, parameters: ParameterMap) -> Self {
        Self {
            version: crate_version(),
            name: name.to_string(),
            hyperparameters,
            parameters,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let toml_string = fs::read_to_string(path)?;
        let settings = toml::from_str(&toml_string)?;
        Ok(settings)
    }
}
