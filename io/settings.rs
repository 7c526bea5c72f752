//! Algorithm settings: which algorithm to run, its knobs and its device.

use crate::algo::device::Device;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

const LME_FIT_DEFAULTS: &str = r#"
force_independent_random_effects = false
method = ["bfgs"]
"#;

const LME_PERSONALIZE_DEFAULTS: &str = "";

const CONSTANT_PREDICTION_DEFAULTS: &str = r#"
prediction_type = "last"
"#;

const SIMULATION_DEFAULTS: &str = r#"
number_of_subjects = 200
mean_number_of_visits = 6.0
std_number_of_visits = 3.0
delay_btw_visits = 1.0
noise = "default"
prefix = "Generated_subject_"
bandwidth_method = "scott"
"#;

/// Built-in default parameters of a known algorithm.
pub fn default_parameters(algorithm: &str) -> Result<toml::Table> {
    let source = match algorithm {
        "lme_fit" => LME_FIT_DEFAULTS,
        "lme_personalize" => LME_PERSONALIZE_DEFAULTS,
        "constant_prediction" => CONSTANT_PREDICTION_DEFAULTS,
        "simulation" => SIMULATION_DEFAULTS,
        other => {
            return Err(Error::Input(format!(
                "unknown algorithm '{other}', available: lme_fit, lme_personalize, constant_prediction, simulation"
            )));
        }
    };
    Ok(toml::from_str(source)?)
}

/// Settings of one algorithm run.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmSettings {
    pub name: String,
    pub parameters: toml::Table,
    pub device: String,
    pub seed: Option<u64>,
    pub model_initialization_method: Option<String>,
}

/// On-disk layout of [`AlgorithmSettings`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    name: String,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    model_initialization_method: Option<String>,
    #[serde(default)]
    parameters: toml::Table,
}

impl AlgorithmSettings {
    /// Settings for `name`, pre-filled with its default parameters, on `cpu`.
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            parameters: default_parameters(name)?,
            device: Device::default().to_string(),
            seed: None,
            model_initialization_method: None,
        })
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.device = device.to_string();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_initialization_method(mut self, method: &str) -> Self {
        self.model_initialization_method = Some(method.to_string());
        self
    }

    pub fn device(&self) -> Result<Device> {
        self.device.parse()
    }

    /// Reads settings from a TOML file; its `[parameters]` override the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let file: SettingsFile = toml::from_str(&contents)?;
        let mut settings = AlgorithmSettings::new(&file.name)?;
        for (key, value) in file.parameters {
            settings.parameters.insert(key, value);
        }
        if let Some(device) = file.device {
            settings.device = device;
        }
        settings.seed = file.seed;
        settings.model_initialization_method = file.model_initialization_method;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_loaded_per_algorithm() {
        let settings = AlgorithmSettings::new("lme_fit").unwrap();
        assert_eq!(
            settings.parameters.get("force_independent_random_effects"),
            Some(&toml::Value::Boolean(false))
        );
        assert_eq!(settings.device, "cpu");
        assert!(AlgorithmSettings::new("mcmc_saem").unwrap_err().is_input_error());
    }

    #[test]
    fn builder_overrides_parameters() {
        let settings = AlgorithmSettings::new("simulation")
            .unwrap()
            .with_parameter("number_of_subjects", 10)
            .with_seed(3)
            .with_device("cuda:0");
        assert_eq!(
            settings.parameters.get("number_of_subjects"),
            Some(&toml::Value::Integer(10))
        );
        assert_eq!(settings.seed, Some(3));
        assert_eq!(settings.device().unwrap(), Device::cuda(Some(0)));
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name = \"lme_fit\"\nseed = 7\n\n[parameters]\nforce_independent_random_effects = true\nreml = false"
        )
        .unwrap();
        file.flush().unwrap();

        let settings = AlgorithmSettings::load(file.path()).unwrap();
        assert_eq!(settings.name, "lme_fit");
        assert_eq!(settings.seed, Some(7));
        assert_eq!(
            settings.parameters.get("force_independent_random_effects"),
            Some(&toml::Value::Boolean(true))
        );
        assert_eq!(settings.parameters.get("reml"), Some(&toml::Value::Boolean(false)));
        assert!(settings.parameters.contains_key("method"));
    }
}
