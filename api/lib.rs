//! Calibration, personalization and simulation of longitudinal
//! disease-progression models.

pub mod error;
pub mod progression;

#[path = "../algo/mod.rs"]
pub mod algo;

#[path = "../models/mod.rs"]
pub mod models;

#[path = "../io/mod.rs"]
pub mod io;

pub use algo::device::{ComputeContext, Device, DeviceManager, DeviceType, Precision};
pub use algo::{Algorithm, AlgorithmFamily, FitOutput, PersonalizeOutput};
pub use error::{Error, Result};
pub use io::data::Data;
pub use io::individual_parameters::IndividualParameters;
pub use io::settings::AlgorithmSettings;
pub use models::{Estimation, Model, OrdinalMethod};
pub use progression::{BiomarkerValue, EstimateOutput, Progression, Timepoints};
