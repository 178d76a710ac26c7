//! Observable engine state.

use crate::error::PumpError;
use chrono::{DateTime, Utc};
use pump_config::{DeviceState, PumpIdentity, ScheduleOverride};
use pump_traits::{DeviceId, DoseEntry, ReservoirSample};
use std::collections::BTreeMap;

/// Why a bolus re-reads the reservoir before delivering.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservoirCheck {
    /// Data present but older than the pre-bolus maximum age.
    Stale,
    /// Last drop was negative; the series cannot be trusted.
    NegativeDrop(f64),
    /// Older than the recency interval.
    TooOld(DateTime<Utc>),
    Missing,
}

impl ReservoirCheck {
    /// The reportable error for this condition, if it is one.
    pub fn as_error(&self) -> Option<PumpError> {
        match self {
            ReservoirCheck::Stale => None,
            ReservoirCheck::NegativeDrop(drop) => Some(PumpError::InvalidData(format!(
                "last reservoir drop is negative ({drop:.2} U)"
            ))),
            ReservoirCheck::TooOld(at) => Some(PumpError::PumpDataTooOld(*at)),
            ReservoirCheck::Missing => Some(PumpError::MissingData("reservoir value".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum BolusState {
    #[default]
    Idle,
    ReservoirCheck(ReservoirCheck),
    Delivering {
        units: f64,
        attempt: u32,
    },
    Retrying {
        units: f64,
        attempt: u32,
    },
    Confirmed(DoseEntry),
    FailedCertain {
        units: f64,
        error: PumpError,
    },
    FailedUncertain {
        units: f64,
        error: PumpError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DoseOutcome {
    Confirmed(DoseEntry),
    FailedCertain(PumpError),
    FailedUncertain(PumpError),
}

impl DoseOutcome {
    pub fn error(&self) -> Option<&PumpError> {
        match self {
            DoseOutcome::Confirmed(_) => None,
            DoseOutcome::FailedCertain(e) | DoseOutcome::FailedUncertain(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum TempBasalState {
    #[default]
    Idle,
    Enacting {
        rate: f64,
    },
    Done(DoseOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastError {
    pub at: DateTime<Utc>,
    pub error: PumpError,
}

/// Result of asking for current pump data.
#[derive(Debug, Clone, PartialEq)]
pub enum PollReport {
    /// Data is within tolerance and no read was forced.
    Fresh,
    /// Another poll is running; this request was dropped.
    AlreadyRunning,
    Completed {
        reservoir: ReservoirSample,
        history_events: usize,
        clock_corrected: bool,
    },
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub at: DateTime<Utc>,
    pub pump_identity: Option<PumpIdentity>,
    pub reservoir: Option<ReservoirSample>,
    pub stale: bool,
    pub forced_read: bool,
    pub unverified: bool,
    pub bolus: BolusState,
    pub temp_basal: TempBasalState,
    pub last_error: Option<LastError>,
    pub autosense_enabled: bool,
    pub autosense_factor: f64,
    pub active_override: Option<ScheduleOverride>,
    pub devices: BTreeMap<DeviceId, DeviceState>,
    pub session_attempts: BTreeMap<String, u64>,
}
