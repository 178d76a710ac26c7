use pump_traits::{FailureCause, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("invalid pump id {0:?}: expected 6 characters")]
    InvalidPumpId(String),
    #[error("simulator state lock poisoned")]
    Poisoned,
    #[error("unknown radio device {0}")]
    UnknownDevice(String),
}

pub type Result<T> = std::result::Result<T, HwError>;

impl From<HwError> for TransportError {
    fn from(e: HwError) -> Self {
        match e {
            HwError::UnknownDevice(id) => TransportError::NotConnected(pump_traits::DeviceId(id)),
            // State is unknown after an internal failure mid-command.
            other => TransportError::Uncertain(FailureCause::UnexpectedResponse(other.to_string())),
        }
    }
}
