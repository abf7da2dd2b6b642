//! Error type for device control and measurements.
//!
//! Two families matter to callers. Validation errors ([`CtrlError::Compile`],
//! [`CtrlError::Config`], [`CtrlError::ConfigParse`]) are raised before any hardware is
//! touched. Hardware faults ([`CtrlError::Driver`], [`CtrlError::Timeout`],
//! [`CtrlError::DeviceInit`]) come back from a driver call and reach the caller of the
//! measurement after the counters have been stopped.

use pbcompiler_backend::CompileError;
use std::time::Duration;
use thiserror::Error;

pub type CtrlResult<T> = std::result::Result<T, CtrlError>;

#[derive(Error, Debug)]
pub enum CtrlError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to initialize {device}: {message}")]
    DeviceInit { device: String, message: String },

    #[error("{device} error {code}: {message}")]
    Driver {
        device: String,
        code: i32,
        message: String,
    },

    #[error("Task {task} did not finish within {timeout:?}")]
    Timeout { task: String, timeout: Duration },

    #[error("Interrupted")]
    Interrupted,

    #[error("Failed to install the interrupt handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

impl CtrlError {
    /// Raised before any device was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CtrlError::Compile(_) | CtrlError::Config(_) | CtrlError::ConfigParse(_)
        )
    }

    /// Reported by a device or its driver.
    pub fn is_hardware_fault(&self) -> bool {
        matches!(
            self,
            CtrlError::DeviceInit { .. } | CtrlError::Driver { .. } | CtrlError::Timeout { .. }
        )
    }
}
