//! Plain data exchanged between the engine and its collaborators.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One reservoir reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReservoirSample {
    pub units: f64,
    pub at: DateTime<Utc>,
}

/// Result of storing a reservoir reading: the new value, the one before it,
/// and whether the stored series is continuous (no gap large enough to lose doses).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReservoirUpdate {
    pub new: ReservoirSample,
    pub previous: Option<ReservoirSample>,
    pub continuous: bool,
}

/// Pump hardware model, e.g. "523" or "754".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpModel {
    pub number: String,
}

impl PumpModel {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
        }
    }

    /// Hardware generation (last two digits of the model number).
    pub fn generation(&self) -> u32 {
        self.number
            .parse::<u32>()
            .map(|n| n % 100)
            .unwrap_or(0)
    }

    /// x23 and later pumps broadcast sentry status packets while idle.
    pub fn has_sentry(&self) -> bool {
        self.generation() >= 23
    }

    pub fn records_basal_profile_start_events(&self) -> bool {
        self.generation() >= 23
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpRegion {
    #[default]
    NorthAmerica,
    WorldWide,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryChemistry {
    #[default]
    Alkaline,
    Lithium,
}

impl BatteryChemistry {
    /// Map a battery voltage to a charge fraction in 0..=1.
    pub fn charge_remaining(self, volts: f64) -> f64 {
        let (empty, full) = match self {
            BatteryChemistry::Alkaline => (1.26, 1.58),
            BatteryChemistry::Lithium => (1.32, 1.58),
        };
        ((volts - empty) / (full - empty)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryIndicator {
    Normal,
    Low,
}

/// Full status read from the pump over a session.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpStatus {
    /// Pump clock as calendar components in the pump's own time zone.
    pub clock: NaiveDateTime,
    pub pump_id: String,
    pub reservoir: f64,
    pub battery_volts: f64,
    pub battery: BatteryIndicator,
    pub suspended: bool,
    pub bolusing: bool,
    pub model: Option<PumpModel>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemainingInsulin {
    pub units: f64,
    pub clock: NaiveDateTime,
}

/// Glucose reading embedded in a sentry packet by pumps with an integrated sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorReading {
    Active { mg_dl: u16 },
    Off,
    Unavailable,
}

/// Status packet broadcast by the pump while the radio is idle-listening.
#[derive(Debug, Clone, PartialEq)]
pub struct SentryStatus {
    pub pump_clock: NaiveDateTime,
    pub glucose_clock: Option<NaiveDateTime>,
    pub battery_percent: u8,
    pub iob: f64,
    pub reservoir_units: f64,
    pub reservoir_minutes: u32,
    pub sensor: SensorReading,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PumpEventKind {
    Bolus { units: f64 },
    TempBasal { rate: f64, duration: Duration },
    BgReceived { mg_dl: u16 },
    Rewind,
    Prime { units: f64 },
    Suspend,
    Resume,
    BasalProfileStart { rate: f64 },
    Other(String),
}

/// History event as decoded by the transport, still in pump-local time.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPumpEvent {
    pub pump_time: NaiveDateTime,
    pub kind: PumpEventKind,
}

/// History event with its timestamp interpreted in the pump's time zone.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpEvent {
    pub date: DateTime<Utc>,
    pub kind: PumpEventKind,
}

/// Pump echo of an accepted temporary basal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempBasalAck {
    pub rate: f64,
    pub time_remaining: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneResult {
    pub best_frequency: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasalScheduleEntry {
    pub index: usize,
    /// Offset from midnight.
    pub offset: Duration,
    pub rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlucoseSample {
    pub at: DateTime<Utc>,
    pub mg_dl: f64,
    pub display_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlucoseEffect {
    pub at: DateTime<Utc>,
    pub mg_dl: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlucoseEffectVelocity {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub mg_dl_per_min: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CarbValue {
    pub at: DateTime<Utc>,
    pub grams: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InsulinValue {
    pub at: DateTime<Utc>,
    pub units: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoseKind {
    Bolus,
    TempBasal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoseUnit {
    Units,
    UnitsPerHour,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoseEntry {
    pub kind: DoseKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub value: f64,
    pub unit: DoseUnit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DoseStatus {
    Requested,
    Confirmed,
    Failed {
        certain: bool,
        attempts: u32,
        error: String,
    },
}

/// Dose ledger entry handed to the dose store.
#[derive(Debug, Clone, PartialEq)]
pub struct DoseRecord {
    pub entry: DoseEntry,
    pub status: DoseStatus,
}
