use chrono::{DateTime, Utc};
use pump_traits::{Certainty, FailureCause, StoreError};
use std::time::Duration;
use thiserror::Error;

/// Failure kinds surfaced by every engine operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PumpError {
    #[error("no connected radio device")]
    Connection,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("pump data too old (last reading at {0})")]
    PumpDataTooOld(DateTime<Utc>),
    #[error("missing data: {0}")]
    MissingData(String),
    #[error("radio communication failed ({certainty}): {cause}")]
    RadioComms {
        certainty: Certainty,
        cause: FailureCause,
    },
    #[error("pump clock is {drift_secs}s off local time")]
    PumpClockDrift { drift_secs: i64 },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("could not persist state: {0}")]
    Persistence(String),
}

impl PumpError {
    /// Whether the pump's state is known after this failure.
    ///
    /// Only radio failures during or after a command can leave the pump in an
    /// unknown state; everything else happened before anything was sent.
    pub fn certainty(&self) -> Certainty {
        match self {
            PumpError::RadioComms { certainty, .. } => *certainty,
            _ => Certainty::Certain,
        }
    }

    pub fn is_uncertain(&self) -> bool {
        self.certainty() == Certainty::Uncertain
    }

    /// The pump itself reported that a bolus is already being delivered.
    pub fn is_bolus_in_progress(&self) -> bool {
        matches!(
            self,
            PumpError::RadioComms {
                cause: FailureCause::BolusInProgress,
                ..
            }
        )
    }

    /// Uncertain failure with the power-on signature: the command most likely never arrived.
    pub fn is_transient_radio(&self) -> bool {
        matches!(
            self,
            PumpError::RadioComms {
                certainty: Certainty::Uncertain,
                cause,
            } if cause.is_power_on_signature()
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("timed out after {waited:?} waiting for the radio session ({name})")]
    Timeout { name: String, waited: Duration },
    #[error("session request cancelled ({name})")]
    Cancelled { name: String },
    #[error("nested session request ({name}) from the thread holding the radio session")]
    Reentrant { name: String },
    #[error("session coordinator state poisoned")]
    Poisoned,
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing pump transport")]
    MissingTransport,
    #[error("missing data stores")]
    MissingStores,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type PumpResult<T> = std::result::Result<T, PumpError>;
pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
