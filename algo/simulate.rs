//! Simulation of new subjects from a calibrated model.
//!
//! A Gaussian kernel density is learnt on the joint vector (baseline age,
//! individual parameters) of real subjects. New subjects are drawn from it,
//! given a random number of regularly spaced visits, and their model
//! trajectories are observed with Gaussian noise.

use super::check_parameter_keys;
use crate::error::{Error, Result};
use crate::io::data::Data;
use crate::io::individual_parameters::{IndividualParameters, SubjectParameters};
use crate::io::settings::AlgorithmSettings;
use crate::models::Model;
use crate::models::parameters::scalar;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Cholesky, UPLO};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};

const ACCEPTED_PARAMETERS: [&str; 7] = [
    "number_of_subjects",
    "mean_number_of_visits",
    "std_number_of_visits",
    "delay_btw_visits",
    "noise",
    "prefix",
    "bandwidth_method",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoiseSetting {
    /// The calibrated `noise_std` of the model.
    Model,
    Fixed(f64),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthMethod {
    Scott,
    Silverman,
}

impl BandwidthMethod {
    /// Kernel bandwidth factor for `n` samples in `d` dimensions.
    pub fn factor(self, n: usize, d: usize) -> f64 {
        let n = n as f64;
        let d = d as f64;
        match self {
            BandwidthMethod::Scott => n.powf(-1.0 / (d + 4.0)),
            BandwidthMethod::Silverman => (n * (d + 2.0) / 4.0).powf(-1.0 / (d + 4.0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResult {
    pub data: Data,
    pub individual_parameters: IndividualParameters,
    /// Standard deviation of the noise added to the trajectories, if any.
    pub noise_std: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SimulationAlgorithm {
    seed: Option<u64>,
    number_of_subjects: usize,
    mean_number_of_visits: f64,
    std_number_of_visits: f64,
    delay_btw_visits: f64,
    noise: NoiseSetting,
    prefix: String,
    bandwidth_method: BandwidthMethod,
}

fn number(parameters: &toml::Table, key: &str) -> Result<f64> {
    match parameters.get(key) {
        Some(toml::Value::Float(v)) => Ok(*v),
        Some(toml::Value::Integer(v)) => Ok(*v as f64),
        Some(other) => Err(Error::Type(format!(
            "'{key}' must be a number, found {}",
            other.type_str()
        ))),
        None => Err(Error::Input(format!("missing simulation parameter '{key}'"))),
    }
}

fn string<'a>(parameters: &'a toml::Table, key: &str) -> Result<&'a str> {
    match parameters.get(key) {
        Some(toml::Value::String(s)) => Ok(s),
        Some(other) => Err(Error::Type(format!(
            "'{key}' must be a string, found {}",
            other.type_str()
        ))),
        None => Err(Error::Input(format!("missing simulation parameter '{key}'"))),
    }
}

impl SimulationAlgorithm {
    pub const NAME: &'static str = "simulation";

    pub fn new(settings: &AlgorithmSettings) -> Result<Self> {
        let parameters = &settings.parameters;
        check_parameter_keys(Self::NAME, parameters, &ACCEPTED_PARAMETERS)?;

        let number_of_subjects = match parameters.get("number_of_subjects") {
            Some(toml::Value::Integer(n)) if *n >= 1 => *n as usize,
            Some(toml::Value::Integer(n)) => {
                return Err(Error::Input(format!(
                    "'number_of_subjects' must be at least 1, got {n}"
                )));
            }
            Some(other) => {
                return Err(Error::Type(format!(
                    "'number_of_subjects' must be an integer, found {}",
                    other.type_str()
                )));
            }
            None => {
                return Err(Error::Input(
                    "missing simulation parameter 'number_of_subjects'".into(),
                ));
            }
        };
        let mean_number_of_visits = number(parameters, "mean_number_of_visits")?;
        let std_number_of_visits = number(parameters, "std_number_of_visits")?;
        if !(mean_number_of_visits.is_finite() && std_number_of_visits.is_finite())
            || std_number_of_visits < 0.0
        {
            return Err(Error::Input(
                "the number of visits needs a finite mean and a non-negative standard deviation"
                    .into(),
            ));
        }
        let delay_btw_visits = number(parameters, "delay_btw_visits")?;
        if delay_btw_visits.is_nan() || delay_btw_visits <= 0.0 {
            return Err(Error::Input(format!(
                "'delay_btw_visits' must be positive, got {delay_btw_visits}"
            )));
        }

        let noise = match parameters.get("noise") {
            None => NoiseSetting::Model,
            Some(toml::Value::String(s)) if s == "default" => NoiseSetting::Model,
            Some(toml::Value::String(s)) if s == "none" => NoiseSetting::None,
            Some(toml::Value::String(s)) => {
                return Err(Error::Input(format!(
                    "unknown noise '{s}', expected \"default\", \"none\" or a standard deviation"
                )));
            }
            Some(_) => {
                let std = number(parameters, "noise")?;
                if std.is_nan() || std < 0.0 {
                    return Err(Error::Input(format!("noise must be non-negative, got {std}")));
                }
                NoiseSetting::Fixed(std)
            }
        };

        let bandwidth_method = match string(parameters, "bandwidth_method")? {
            "scott" => BandwidthMethod::Scott,
            "silverman" => BandwidthMethod::Silverman,
            other => {
                return Err(Error::Input(format!(
                    "unknown bandwidth_method '{other}', expected scott or silverman"
                )));
            }
        };

        Ok(Self {
            seed: settings.seed,
            number_of_subjects,
            mean_number_of_visits,
            std_number_of_visits,
            delay_btw_visits,
            noise,
            prefix: string(parameters, "prefix")?.to_string(),
            bandwidth_method,
        })
    }

    pub fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Learns the joint density from the subjects present in both inputs and
    /// samples a new cohort from it.
    pub fn run(
        &self,
        model: &dyn Model,
        individual_parameters: &IndividualParameters,
        data: &Data,
    ) -> Result<SimulationResult> {
        let features = model.features().to_vec();
        if features.is_empty() {
            return Err(Error::Input("the model has no features to simulate".into()));
        }
        let noise_std = match self.noise {
            NoiseSetting::Model => Some(scalar(&model.parameters(), "noise_std")?),
            NoiseSetting::Fixed(std) => Some(std),
            NoiseSetting::None => None,
        };

        let names = individual_parameters.names().to_vec();
        let dimension = names.len() + 1;
        let mut rows: Vec<f64> = Vec::new();
        let mut n_samples = 0;
        for id in individual_parameters.indices() {
            let Some(individual) = data.get(id) else {
                continue;
            };
            let Some(&baseline) = individual.timepoints.first() else {
                continue;
            };
            rows.push(baseline);
            rows.extend(individual_parameters.subject(id)?.values().iter());
            n_samples += 1;
        }
        if n_samples < 2 {
            return Err(Error::DataInput(format!(
                "simulation needs at least 2 subjects with both data and individual parameters, found {n_samples}"
            )));
        }
        let samples = Array2::from_shape_vec((n_samples, dimension), rows)
            .map_err(|e| Error::Numeric(format!("cannot assemble simulation samples: {e}")))?;

        let kernel = self.kernel_factor(&samples)?;
        log::info!(
            "Simulating {} subjects from a kernel density over {} real subjects.",
            self.number_of_subjects,
            n_samples
        );

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let visits = Normal::new(self.mean_number_of_visits, self.std_number_of_visits).map_err(
            |e| Error::Input(format!("invalid distribution of the number of visits: {e}")),
        )?;

        let width = self.number_of_subjects.to_string().len();
        let mut simulated_data = Data::new(features.clone())?;
        let mut simulated_parameters = IndividualParameters::new(names.clone());
        for k in 0..self.number_of_subjects {
            let center = samples.row(rng.gen_range(0..n_samples));
            let offset: Array1<f64> = (0..dimension)
                .map(|_| rng.sample::<f64, _>(StandardNormal))
                .collect();
            let draw = &center + &kernel.dot(&offset);
            let baseline = draw[0];
            let parameters = draw.slice(ndarray::s![1..]).to_owned();

            let n_visits = (visits.sample(&mut rng).round() as i64).max(1) as usize;
            let ages: Vec<f64> = (0..n_visits)
                .map(|j| baseline + j as f64 * self.delay_btw_visits)
                .collect();
            let subject = SubjectParameters::new(&names, parameters.view());
            let trajectory = model.compute_individual_trajectory(&ages, &subject)?;

            let mut observations = Vec::with_capacity(n_visits);
            for (age, row) in ages.iter().zip(trajectory.axis_iter(Axis(0))) {
                let values = row
                    .iter()
                    .map(|&v| match noise_std {
                        Some(std) if std > 0.0 => v + std * rng.sample::<f64, _>(StandardNormal),
                        _ => v,
                    })
                    .collect();
                observations.push((*age, values));
            }

            let id = format!("{}{:0width$}", self.prefix, k + 1);
            simulated_data.add_individual(&id, observations)?;
            simulated_parameters.add_individual(&id, parameters)?;
        }

        Ok(SimulationResult {
            data: simulated_data,
            individual_parameters: simulated_parameters,
            noise_std,
        })
    }

    /// Lower Cholesky factor of the kernel covariance `factor² · cov(samples)`.
    fn kernel_factor(&self, samples: &Array2<f64>) -> Result<Array2<f64>> {
        let (n, d) = samples.dim();
        let mean = samples
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::DataInput("no samples for the kernel density".into()))?;
        let centered = samples - &mean;
        let covariance = centered.t().dot(&centered) / (n as f64 - 1.0);
        let factor = self.bandwidth_method.factor(n, d);
        (covariance * factor.powi(2)).cholesky(UPLO::Lower).map_err(|_| {
            Error::DataInput(
                "the joint distribution of baseline ages and individual parameters is degenerate, no kernel density can be fitted"
                    .into(),
            )
        })
    }
}
