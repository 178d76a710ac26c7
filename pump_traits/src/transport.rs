//! Radio transport boundary: one exclusive command session against one pump.
//!
//! Packet encoding is the transport's business. What crosses this boundary is
//! a typed command, a typed response, and a closed failure classification so
//! the engine never has to inspect error text to decide whether a dose happened.

use crate::types::{
    BasalScheduleEntry, PumpModel, PumpStatus, RawPumpEvent, RemainingInsulin, TempBasalAck,
    TuneResult,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Identifier of a radio bridge device (one physical link to the pump).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PumpCommand {
    ReadStatus,
    ReadRemainingInsulin,
    ReadTime,
    /// Set the pump clock to these calendar components.
    SetTime(NaiveDateTime),
    ReadHistory { since: DateTime<Utc> },
    Bolus { units: f64 },
    TempBasal { rate: f64, duration: Duration },
    TuneRadio { current: Option<f64> },
    SetBasalSchedule(Vec<BasalScheduleEntry>),
}

impl PumpCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PumpCommand::ReadStatus => "read_status",
            PumpCommand::ReadRemainingInsulin => "read_remaining_insulin",
            PumpCommand::ReadTime => "read_time",
            PumpCommand::SetTime(_) => "set_time",
            PumpCommand::ReadHistory { .. } => "read_history",
            PumpCommand::Bolus { .. } => "bolus",
            PumpCommand::TempBasal { .. } => "temp_basal",
            PumpCommand::TuneRadio { .. } => "tune_radio",
            PumpCommand::SetBasalSchedule(_) => "set_basal_schedule",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PumpResponse {
    Status(PumpStatus),
    RemainingInsulin(RemainingInsulin),
    Time(NaiveDateTime),
    History {
        events: Vec<RawPumpEvent>,
        model: PumpModel,
    },
    TempBasal(TempBasalAck),
    Tuned(TuneResult),
    Ack,
}

/// Phase of a command exchange in which a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStage {
    /// Waking the pump radio before the command is sent.
    PowerOn,
    /// The command itself or its acknowledgement.
    Command,
}

impl fmt::Display for CommandStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStage::PowerOn => f.write_str("power-on"),
            CommandStage::Command => f.write_str("command"),
        }
    }
}

/// Underlying cause of a radio failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureCause {
    #[error("bolus already in progress")]
    BolusInProgress,
    #[error("no response during {0}")]
    NoResponse(CommandStage),
    #[error("unknown response during {0}")]
    UnknownResponse(CommandStage),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("pump rejected command: {0}")]
    Rejected(String),
    #[error("pump is suspended")]
    Suspended,
    #[error("radio timeout")]
    Timeout,
    #[error("no usable frequency found")]
    NoFrequency,
}

impl FailureCause {
    /// Power-on stage without a usable reply: the pump most likely never saw the command.
    pub fn is_power_on_signature(&self) -> bool {
        matches!(
            self,
            FailureCause::NoResponse(CommandStage::PowerOn)
                | FailureCause::UnknownResponse(CommandStage::PowerOn)
        )
    }
}

/// Whether the pump's resulting state is known after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Certainty {
    Certain,
    Uncertain,
}

impl fmt::Display for Certainty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Certainty::Certain => f.write_str("certain"),
            Certainty::Uncertain => f.write_str("uncertain"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),
    /// Failure where the pump's state is known (e.g. it refused the command).
    #[error("certain failure: {0}")]
    Certain(FailureCause),
    /// Failure without confirmation either way.
    #[error("uncertain failure: {0}")]
    Uncertain(FailureCause),
}

impl TransportError {
    pub fn certainty(&self) -> Option<Certainty> {
        match self {
            TransportError::NotConnected(_) => None,
            TransportError::Certain(_) => Some(Certainty::Certain),
            TransportError::Uncertain(_) => Some(Certainty::Uncertain),
        }
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            TransportError::NotConnected(_) => None,
            TransportError::Certain(c) | TransportError::Uncertain(c) => Some(c),
        }
    }
}

/// An open, exclusive exchange with the pump. Closed when dropped.
pub trait PumpSession {
    fn device(&self) -> &DeviceId;
    fn send(&mut self, command: PumpCommand) -> Result<PumpResponse, TransportError>;
}

/// Radio link manager: device discovery, session opening and prioritization.
pub trait PumpTransport: Send + Sync {
    /// The highest-priority connected device, if any.
    fn first_connected(&self) -> Option<DeviceId>;

    fn open(&self, device: &DeviceId) -> Result<Box<dyn PumpSession + '_>, TransportError>;

    /// Lower the device's priority so other devices are tried first.
    fn deprioritize(&self, device: &DeviceId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_signature_only_matches_power_on_stage() {
        assert!(FailureCause::NoResponse(CommandStage::PowerOn).is_power_on_signature());
        assert!(FailureCause::UnknownResponse(CommandStage::PowerOn).is_power_on_signature());
        assert!(!FailureCause::NoResponse(CommandStage::Command).is_power_on_signature());
        assert!(!FailureCause::BolusInProgress.is_power_on_signature());
    }

    #[test]
    fn certainty_follows_variant() {
        let e = TransportError::Uncertain(FailureCause::Timeout);
        assert_eq!(e.certainty(), Some(Certainty::Uncertain));
        assert_eq!(e.cause(), Some(&FailureCause::Timeout));
        let nc = TransportError::NotConnected(DeviceId::new("rl-1"));
        assert_eq!(nc.certainty(), None);
    }
}
