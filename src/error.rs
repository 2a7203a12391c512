//! Custom error types for the module collection.
//!
//! `DaqError` is the single typed error of the crate. Drivers and capability
//! traits return `anyhow::Result` and raise `DaqError` values inside so callers
//! can `downcast_ref::<DaqError>()` when they need to branch on the cause.
//!
//! ## Error Hierarchy
//!
//! - **`Figment`** / **`Configuration`**: the configuration file could not be
//!   parsed, or parsed into something that fails validation.
//! - **`Io`**: file and socket I/O.
//! - **`Instrument`**: the device answered with something unexpected.
//! - **`Timeout`**: the device did not answer in time.
//! - **`OutOfRange`** / **`InvalidArgument`**: a request was rejected before it
//!   was sent to hardware.
//! - **`ModuleBusy`** / **`ModuleNotActive`**: lifecycle violations in logic
//!   modules.
//! - **`FeatureNotEnabled`**: the code path needs a cargo feature that was not
//!   compiled in.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Figment(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{parameter} = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        parameter: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    #[error("Serial support not enabled. Rebuild with --features tokio_serial")]
    SerialFeatureDisabled,

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Module is busy during operation")]
    ModuleBusy,

    #[error("Module '{0}' is not active")]
    ModuleNotActive(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl DaqError {
    /// Shorthand for range rejections.
    pub fn out_of_range(parameter: &str, value: f64, min: f64, max: f64) -> Self {
        Self::OutOfRange {
            parameter: parameter.to_string(),
            value,
            min,
            max,
        }
    }

    /// Whether retrying the same request after a reconnect can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::Io(_)
                | DaqError::Instrument(_)
                | DaqError::Timeout(_)
                | DaqError::SerialPortNotConnected
                | DaqError::SerialUnexpectedEof
        )
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for DaqError {
    fn from(value: csv::Error) -> Self {
        DaqError::Storage(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_message_names_bounds() {
        let err = DaqError::out_of_range("power", 0.2, 0.0, 0.08);
        assert_eq!(err.to_string(), "power = 0.2 is out of range [0, 0.08]");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn io_errors_are_recoverable() {
        let err: DaqError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(err.is_recoverable());
        assert!(DaqError::Timeout("read".into()).is_recoverable());
        assert!(!DaqError::ModuleBusy.is_recoverable());
    }

    #[test]
    fn downcasts_through_anyhow() {
        let err: anyhow::Error = DaqError::SerialPortNotConnected.into();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::SerialPortNotConnected)
        ));
    }
}
