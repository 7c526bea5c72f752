//! Scoped compute-device management shared by every calibration and
//! personalization algorithm.
//!
//! Tensors of the model and the dataset live on a [`Device`]. An algorithm may
//! be configured to run on a non-default device type; for the duration of one
//! run [`DeviceManager::scope`] moves both objects there, hands the algorithm
//! an explicit [`ComputeContext`], and moves everything back to the default
//! device afterwards, whether the run succeeded or not.

use crate::error::{Error, Result};
use crate::io::dataset::Dataset;
use crate::models::Model;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of compute device. Only the kind decides whether a migration is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda,
}

/// A compute device, e.g. `cpu`, `cuda` or `cuda:1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    kind: DeviceType,
    index: Option<usize>,
}

impl Device {
    pub fn cpu() -> Self {
        Self {
            kind: DeviceType::Cpu,
            index: None,
        }
    }

    pub fn cuda(index: Option<usize>) -> Self {
        Self {
            kind: DeviceType::Cuda,
            index,
        }
    }

    pub fn kind(&self) -> DeviceType {
        self.kind
    }

    /// Whether this device has the same type as the default device.
    pub fn is_default_type(&self) -> bool {
        self.kind == Device::default().kind
    }

    /// Default numeric precision of tensors created on this device type.
    pub fn default_precision(&self) -> Precision {
        match self.kind {
            DeviceType::Cpu => Precision::Float64,
            DeviceType::Cuda => Precision::Float32,
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
        };
        match self.index {
            Some(index) => write!(f, "{kind}:{index}"),
            None => f.write_str(kind),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().to_ascii_lowercase();
        let (kind, index) = match trimmed.split_once(':') {
            Some((kind, index)) => {
                let index = index.parse::<usize>().map_err(|_| {
                    Error::Device(format!("invalid device index in '{s}'"))
                })?;
                (kind.to_string(), Some(index))
            }
            None => (trimmed, None),
        };
        match kind.as_str() {
            "cpu" => Ok(Device {
                kind: DeviceType::Cpu,
                index,
            }),
            "cuda" | "gpu" => Ok(Device {
                kind: DeviceType::Cuda,
                index,
            }),
            other => Err(Error::Device(format!(
                "unknown device type '{other}', expected 'cpu' or 'cuda[:index]'"
            ))),
        }
    }
}

/// Numeric precision of values produced inside a device scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Float32,
    Float64,
}

impl Precision {
    /// Rounds `value` to the precision, keeping it in an `f64` container.
    pub fn cast(self, value: f64) -> f64 {
        match self {
            Precision::Float32 => value as f32 as f64,
            Precision::Float64 => value,
        }
    }
}

/// Device and precision an algorithm body runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeContext {
    pub device: Device,
    pub precision: Precision,
}

impl ComputeContext {
    pub fn for_device(device: &Device) -> Self {
        Self {
            device: device.clone(),
            precision: device.default_precision(),
        }
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::for_device(&Device::default())
    }
}

/// Anything whose tensors can be moved between devices.
pub trait DeviceMovable {
    fn device(&self) -> &Device;
    fn move_to_device(&mut self, device: &Device) -> Result<()>;
}

/// Runs one algorithm invocation on the algorithm's configured device.
#[derive(Debug, Clone)]
pub struct DeviceManager {
    algorithm_device: Device,
    default_device: Device,
}

impl DeviceManager {
    pub fn new(algorithm_device: Device) -> Self {
        Self {
            algorithm_device,
            default_device: Device::default(),
        }
    }

    pub fn algorithm_device(&self) -> &Device {
        &self.algorithm_device
    }

    /// Only the device type is compared; `cuda:0` and `cuda:1` are equivalent here.
    pub fn requires_migration(&self) -> bool {
        self.algorithm_device.kind() != self.default_device.kind()
    }

    /// Executes `body` with `model` and `dataset` on the algorithm device.
    ///
    /// The model and dataset must start on the default device type, which
    /// refuses nested scopes. On exit they are moved back unconditionally,
    /// also when `body` panics. Failing to move them back panics.
    pub fn scope<T, F>(&self, model: &mut dyn Model, dataset: &mut Dataset, body: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Model, &mut Dataset, &ComputeContext) -> Result<T>,
    {
        if !model.device().is_default_type() || !dataset.device().is_default_type() {
            return Err(Error::Device(format!(
                "a device scope is already active (model on {}, dataset on {}); \
                 nested scopes are not supported",
                model.device(),
                dataset.device()
            )));
        }

        if !self.requires_migration() {
            let context = ComputeContext::for_device(&self.default_device);
            return body(model, dataset, &context);
        }

        log::debug!(
            "Moving model and dataset to {} for the algorithm run.",
            self.algorithm_device
        );
        model.move_to_device(&self.algorithm_device)?;
        if let Err(e) = dataset.move_to_device(&self.algorithm_device) {
            self.restore(model, None);
            return Err(e);
        }

        let context = ComputeContext::for_device(&self.algorithm_device);
        let guard = RestoreGuard {
            manager: self,
            model,
            dataset,
        };
        body(&mut *guard.model, &mut *guard.dataset, &context)
    }

    fn restore(&self, model: &mut dyn Model, dataset: Option<&mut Dataset>) {
        if let Err(e) = model.move_to_device(&self.default_device) {
            self.restore_failed("model", &e);
        }
        if let Some(dataset) = dataset {
            if let Err(e) = dataset.move_to_device(&self.default_device) {
                self.restore_failed("dataset", &e);
            }
        }
        log::debug!("Model and dataset restored to {}.", self.default_device);
    }

    /// Panics, unless the thread is already unwinding, where a second panic would abort.
    fn restore_failed(&self, what: &str, e: &Error) {
        let message = format!(
            "invariant violated: failed to move {what} back to {}: {e}",
            self.default_device
        );
        if std::thread::panicking() {
            log::error!("{message}");
        } else {
            panic!("{message}");
        }
    }
}

/// Moves the model and dataset back to the default device when dropped,
/// including while a panic unwinds out of the scope body.
struct RestoreGuard<'a> {
    manager: &'a DeviceManager,
    model: &'a mut dyn Model,
    dataset: &'a mut Dataset,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.manager.restore(&mut *self.model, Some(&mut *self.dataset));
    }
}
