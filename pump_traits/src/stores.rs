//! Collaborator interfaces the engine reads from and writes to.
//!
//! Persistence, notifications and upload live outside the engine; these traits
//! are the whole contract. Implementations must be callable from any thread.

use crate::types::{
    CarbValue, DoseEntry, DoseRecord, GlucoseEffect, GlucoseEffectVelocity, GlucoseSample,
    InsulinValue, PumpEvent, PumpModel, ReservoirSample, ReservoirUpdate,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UploadError {
    #[error("uploader not configured")]
    NotConfigured,
    #[error("upload failed: {0}")]
    Failed(String),
}

pub trait DoseStore: Send + Sync {
    fn add_reservoir_value(&self, units: f64, at: DateTime<Utc>)
    -> Result<ReservoirUpdate, StoreError>;
    fn last_reservoir_value(&self) -> Option<ReservoirSample>;
    /// Volume change between the last two reservoir readings (negative means it went up).
    fn last_reservoir_volume_drop(&self) -> f64;
    /// Earliest date the next history query must cover.
    fn pump_event_query_after(&self) -> DateTime<Utc>;
    fn last_added_pump_events(&self) -> Option<DateTime<Utc>>;
    fn add_pump_events(&self, events: &[PumpEvent], model: &PumpModel) -> Result<(), StoreError>;
    fn record_dose(&self, record: DoseRecord) -> Result<(), StoreError>;
    fn insulin_effects(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GlucoseEffect>, StoreError>;
    fn insulin_on_board(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<InsulinValue>, StoreError>;
    fn reset_pump_data(&self);
}

pub trait GlucoseStore: Send + Sync {
    fn add_glucose(&self, samples: &[GlucoseSample], source: Option<&str>)
    -> Result<(), StoreError>;
    fn glucose_samples(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GlucoseSample>, StoreError>;
    fn counteraction_effects(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        insulin_effects: &[GlucoseEffect],
    ) -> Result<Vec<GlucoseEffectVelocity>, StoreError>;
}

pub trait CarbStore: Send + Sync {
    fn carbs_on_board(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        velocities: Option<&[GlucoseEffectVelocity]>,
    ) -> Result<Vec<CarbValue>, StoreError>;
    fn carb_effects(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        velocities: Option<&[GlucoseEffectVelocity]>,
    ) -> Result<Vec<GlucoseEffect>, StoreError>;
}

/// Fire-and-forget user notifications.
pub trait NotificationSink: Send + Sync {
    fn pump_battery_low(&self);
    fn reservoir_low(&self, units: f64, time_left: Option<Duration>);
    fn reservoir_empty(&self);
    fn bolus_failed(&self, units: f64, at: DateTime<Utc>, error: &str);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStatusReport {
    pub device: Option<String>,
    pub clock: Option<DateTime<Utc>>,
    pub pump_id: Option<String>,
    pub reservoir: Option<f64>,
    pub battery_volts: Option<f64>,
    pub suspended: Option<bool>,
    pub bolusing: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Treatment {
    Dose(DoseEntry),
    DeviceStatus(DeviceStatusReport),
}

pub trait Uploader: Send + Sync {
    /// Returns the external identifiers of the uploaded objects.
    fn upload(&self, treatments: &[Treatment]) -> Result<Vec<String>, UploadError>;
}

/// Care-event journal (cartridge/battery changes and diagnostic notes).
#[derive(Debug, Clone, PartialEq)]
pub enum CareEvent {
    CartridgeChange { previous: f64, new: f64 },
    BatteryChange { previous: f64, new: f64 },
    Note(String),
}

pub trait CareLog: Send + Sync {
    fn record(&self, event: CareEvent);
}

/// Hook into the external control loop.
pub trait LoopTrigger: Send + Sync {
    fn request_loop(&self);
}
