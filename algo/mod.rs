//! Calibration, personalization and simulation algorithms.
//!
//! Every fit or personalize algorithm implements [`Algorithm`]. Its provided
//! [`Algorithm::run`] executes the algorithm body inside a
//! [`DeviceManager`](device::DeviceManager) scope and handles the model
//! lifecycle, so that the orchestrator can drive all of them the same way.

pub mod constant_prediction;
pub mod device;
pub mod lme_fit;
pub mod lme_personalize;
pub mod mixed_lm;
pub mod optimize;
pub mod simulate;

use crate::error::{Error, Result};
use crate::io::dataset::Dataset;
use crate::io::individual_parameters::IndividualParameters;
use crate::io::settings::AlgorithmSettings;
use crate::models::Model;
use device::{ComputeContext, Device, DeviceManager};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmFamily {
    Fit,
    Personalize,
    Simulate,
}

impl AlgorithmFamily {
    /// Family of a known algorithm name.
    pub fn of(name: &str) -> Option<Self> {
        match name {
            lme_fit::LmeFitAlgorithm::NAME => Some(AlgorithmFamily::Fit),
            lme_personalize::LmePersonalizeAlgorithm::NAME
            | constant_prediction::ConstantPredictionAlgorithm::NAME => {
                Some(AlgorithmFamily::Personalize)
            }
            simulate::SimulationAlgorithm::NAME => Some(AlgorithmFamily::Simulate),
            _ => None,
        }
    }
}

impl fmt::Display for AlgorithmFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlgorithmFamily::Fit => "fit",
            AlgorithmFamily::Personalize => "personalize",
            AlgorithmFamily::Simulate => "simulate",
        })
    }
}

/// Result of a calibration run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOutput {
    pub noise_std: f64,
}

/// Result of a personalization run.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonalizeOutput {
    pub individual_parameters: IndividualParameters,
    pub noise_std: f64,
}

pub trait Algorithm {
    type Output;

    fn name(&self) -> &'static str;

    fn family(&self) -> AlgorithmFamily;

    fn device(&self) -> &Device;

    /// The algorithm body. `ctx` carries the device and precision of the run.
    fn run_impl(
        &mut self,
        model: &mut dyn Model,
        dataset: &mut Dataset,
        ctx: &ComputeContext,
    ) -> Result<Self::Output>;

    /// Runs the algorithm on its device. A successful fit initializes the model.
    fn run(&mut self, model: &mut dyn Model, dataset: &mut Dataset) -> Result<Self::Output> {
        let manager = DeviceManager::new(self.device().clone());
        let family = self.family();
        log::debug!("Running '{}' on {}.", self.name(), manager.algorithm_device());
        let output = manager.scope(model, dataset, |model, dataset, ctx| {
            self.run_impl(model, dataset, ctx)
        })?;
        if family == AlgorithmFamily::Fit && !model.is_initialized() {
            model.mark_initialized();
        }
        Ok(output)
    }
}

fn resolve(settings: &AlgorithmSettings, expected: AlgorithmFamily) -> Result<()> {
    match AlgorithmFamily::of(&settings.name) {
        Some(family) if family == expected => Ok(()),
        Some(family) => Err(Error::Input(format!(
            "algorithm '{}' is a {family} algorithm, it cannot be used to {expected}",
            settings.name
        ))),
        None => Err(Error::Input(format!(
            "unknown {expected} algorithm '{}'",
            settings.name
        ))),
    }
}

/// Builds the calibration algorithm named in `settings`.
pub fn fit_algorithm(
    settings: &AlgorithmSettings,
) -> Result<Box<dyn Algorithm<Output = FitOutput>>> {
    resolve(settings, AlgorithmFamily::Fit)?;
    Ok(Box::new(lme_fit::LmeFitAlgorithm::new(settings)?))
}

/// Builds the personalization algorithm named in `settings`.
pub fn personalize_algorithm(
    settings: &AlgorithmSettings,
) -> Result<Box<dyn Algorithm<Output = PersonalizeOutput>>> {
    resolve(settings, AlgorithmFamily::Personalize)?;
    match settings.name.as_str() {
        constant_prediction::ConstantPredictionAlgorithm::NAME => Ok(Box::new(
            constant_prediction::ConstantPredictionAlgorithm::new(settings)?,
        )),
        _ => Ok(Box::new(lme_personalize::LmePersonalizeAlgorithm::new(settings)?)),
    }
}

/// Builds the simulation algorithm named in `settings`.
pub fn simulation_algorithm(settings: &AlgorithmSettings) -> Result<simulate::SimulationAlgorithm> {
    resolve(settings, AlgorithmFamily::Simulate)?;
    simulate::SimulationAlgorithm::new(settings)
}

/// Rejects any key of `parameters` outside `accepted`.
pub(crate) fn check_parameter_keys(
    algorithm: &str,
    parameters: &toml::Table,
    accepted: &[&str],
) -> Result<()> {
    let unknown: Vec<String> = parameters
        .keys()
        .filter(|k| !accepted.contains(&k.as_str()))
        .cloned()
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(Error::UnrecognizedSettings {
            algorithm: algorithm.to_string(),
            keys: unknown,
        })
    }
}

/// Progress over subjects, drawn only when stderr is a terminal.
pub(crate) fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let template = "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";
    if let Ok(style) = ProgressStyle::with_template(template) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}
