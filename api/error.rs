use thiserror::Error;

/// The error taxonomy shared by every stage of the calibration pipeline.
///
/// Three families matter to callers:
/// - `Type`: a dynamically typed value (settings entry, stored parameter,
///   biomarker value) had the wrong shape. Always raised before computation.
/// - `Input`, `DataInput`, `UnrecognizedSettings`: well-typed but invalid
///   input, surfaced verbatim. See [`Error::is_input_error`].
/// - everything else: numeric, device and I/O failures.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Type error: {0}")]
    Type(String),

    #[error("Input error: {0}")]
    Input(String),

    /// The data cannot identify the requested model, independently of solver settings.
    #[error("Data input error: {0}")]
    DataInput(String),

    #[error(
        "Algorithm '{algorithm}' does not recognize the setting(s) {keys:?}. Remove them or check their spelling."
    )]
    UnrecognizedSettings { algorithm: String, keys: Vec<String> },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Numerical failure in the inner solver: {0}")]
    Numeric(String),

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error("Failed to read or write file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML document: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to serialize TOML document: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Failed to read or write CSV: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// True for the input-error kind, which includes data-input errors and unknown settings.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::Input(_) | Error::DataInput(_) | Error::UnrecognizedSettings { .. }
        )
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self, Error::Type(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
