//! Data containers and settings consumed by the pipeline.

pub mod data;
pub mod dataset;
pub mod individual_parameters;
pub mod settings;
