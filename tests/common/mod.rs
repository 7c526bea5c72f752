#![allow(dead_code)]

use log::{Level, LevelFilter, Log, Metadata, Record};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::cell::RefCell;
use std::sync::Once;
use sundial::algo::device::{Device, DeviceMovable};
use sundial::io::dataset::Dataset;
use sundial::io::individual_parameters::SubjectParameters;
use sundial::models::parameters::{Hyperparameters, ParameterMap};
use sundial::{Data, Error, Estimation, Model, OrdinalMethod, Result};

/// Subject-specific line `intercept + slope * (age - 65)`.
#[derive(Debug, Clone)]
pub struct TrueSubject {
    pub id: String,
    pub intercept: f64,
    pub slope: f64,
}

impl TrueSubject {
    pub fn value(&self, age: f64) -> f64 {
        self.intercept + self.slope * (age - 65.0)
    }
}

/// Univariate cohort with random intercepts and slopes observed with Gaussian noise.
pub fn linear_cohort(
    n_subjects: usize,
    n_visits: usize,
    noise: f64,
    seed: u64,
) -> (Data, Vec<TrueSubject>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let intercepts = Normal::new(1.0, 0.3).unwrap();
    let slopes = Normal::new(0.08, 0.02).unwrap();
    let errors = Normal::new(0.0, noise).unwrap();

    let mut data = Data::new(vec!["score".into()]).unwrap();
    let mut truth = Vec::with_capacity(n_subjects);
    for i in 0..n_subjects {
        let subject = TrueSubject {
            id: format!("subject_{i:03}"),
            intercept: intercepts.sample(&mut rng),
            slope: slopes.sample(&mut rng),
        };
        let baseline: f64 = 60.0 + 10.0 * rng.r#gen::<f64>();
        let visits = (0..n_visits)
            .map(|j| {
                let age = baseline + j as f64;
                (age, vec![subject.value(age) + errors.sample(&mut rng)])
            })
            .collect();
        data.add_individual(&subject.id, visits).unwrap();
        truth.push(subject);
    }
    (data, truth)
}

/// Records warnings emitted on the current thread.
struct CaptureLogger;

thread_local! {
    static WARNINGS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

impl Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            WARNINGS.with(|w| w.borrow_mut().push(record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static INIT: Once = Once::new();

/// Runs `f`, returning its result and the warnings it logged.
pub fn capture_warnings<T>(f: impl FnOnce() -> T) -> (T, Vec<String>) {
    INIT.call_once(|| {
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(LevelFilter::Warn);
    });
    WARNINGS.with(|w| w.borrow_mut().clear());
    let result = f();
    let warnings = WARNINGS.with(|w| w.borrow_mut().drain(..).collect());
    (result, warnings)
}

/// A model whose moves to `failing_target` fail.
#[derive(Debug)]
pub struct StubbornModel {
    pub device: Device,
    pub failing_target: Option<Device>,
    pub moves: Vec<Device>,
}

impl StubbornModel {
    pub fn new(failing_target: Option<Device>) -> Self {
        Self {
            device: Device::cpu(),
            failing_target,
            moves: Vec::new(),
        }
    }
}

impl DeviceMovable for StubbornModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn move_to_device(&mut self, device: &Device) -> Result<()> {
        if self.failing_target.as_ref().map(Device::kind) == Some(device.kind()) {
            return Err(Error::Device(format!("cannot move to {device}")));
        }
        self.moves.push(device.clone());
        self.device = device.clone();
        Ok(())
    }
}

impl Model for StubbornModel {
    fn name(&self) -> &str {
        "stubborn"
    }

    fn features(&self) -> &[String] {
        &[]
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn mark_initialized(&mut self) {}

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
    }

    fn load_hyperparameters(&mut self, hyperparameters: &Hyperparameters) -> Result<()> {
        let _ = hyperparameters;
        Ok(())
    }

    fn parameters(&self) -> ParameterMap {
        ParameterMap::new()
    }

    fn load_parameters(&mut self, parameters: &ParameterMap) -> Result<()> {
        let _ = parameters;
        Ok(())
    }

    fn initialize(&mut self, dataset: &Dataset, method: Option<&str>) -> Result<()> {
        let _ = (dataset, method);
        Ok(())
    }

    fn compute_individual_trajectory(
        &self,
        ages: &[f64],
        individual_parameters: &SubjectParameters<'_>,
    ) -> Result<Array2<f64>> {
        let _ = individual_parameters;
        Ok(Array2::zeros((ages.len(), 0)))
    }

    fn compute_individual_ages_from_biomarker_values(
        &self,
        values: &[f64],
        individual_parameters: &SubjectParameters<'_>,
        feature: Option<&str>,
    ) -> Result<Array1<f64>> {
        let _ = (individual_parameters, feature);
        Ok(Array1::zeros(values.len()))
    }
}

/// Ordinal score with two levels; the probability of level 1 is `sigmoid(age - onset)`.
#[derive(Debug)]
pub struct OrdinalModel {
    features: Vec<String>,
    device: Device,
}

impl OrdinalModel {
    pub fn new() -> Self {
        Self {
            features: vec!["stage".into()],
            device: Device::cpu(),
        }
    }
}

impl DeviceMovable for OrdinalModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn move_to_device(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }
}

impl Model for OrdinalModel {
    fn name(&self) -> &str {
        "ordinal"
    }

    fn features(&self) -> &[String] {
        &self.features
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn mark_initialized(&mut self) {}

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
    }

    fn load_hyperparameters(&mut self, hyperparameters: &Hyperparameters) -> Result<()> {
        let _ = hyperparameters;
        Ok(())
    }

    fn parameters(&self) -> ParameterMap {
        ParameterMap::new()
    }

    fn load_parameters(&mut self, parameters: &ParameterMap) -> Result<()> {
        let _ = parameters;
        Ok(())
    }

    fn initialize(&mut self, dataset: &Dataset, method: Option<&str>) -> Result<()> {
        let _ = (dataset, method);
        Ok(())
    }

    fn compute_individual_trajectory(
        &self,
        ages: &[f64],
        individual_parameters: &SubjectParameters<'_>,
    ) -> Result<Array2<f64>> {
        let onset = individual_parameters.require("onset")?;
        Ok(Array2::from_shape_fn((ages.len(), 1), |(i, _)| {
            1.0 / (1.0 + (onset - ages[i]).exp())
        }))
    }

    fn compute_individual_ages_from_biomarker_values(
        &self,
        values: &[f64],
        individual_parameters: &SubjectParameters<'_>,
        feature: Option<&str>,
    ) -> Result<Array1<f64>> {
        let _ = (values, individual_parameters, feature);
        Err(Error::Input("ordinal levels have no inverse".into()))
    }

    fn postprocess_model_estimation(
        &self,
        estimate: Array2<f64>,
        ordinal_method: OrdinalMethod,
    ) -> Result<Estimation> {
        let p1 = estimate.column(0).to_owned();
        Ok(match ordinal_method {
            OrdinalMethod::MaximumLikelihood => {
                Estimation::Values(estimate.mapv(|p| if p > 0.5 { 1.0 } else { 0.0 }))
            }
            OrdinalMethod::Expectation => Estimation::Values(estimate),
            OrdinalMethod::Probabilities => Estimation::Named(vec![
                ("stage_0".into(), p1.mapv(|p| 1.0 - p)),
                ("stage_1".into(), p1),
            ]),
        })
    }
}
