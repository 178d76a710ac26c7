//! Versioned record of everything that must survive a restart.
//!
//! Every field carries a serde default so records written by older builds load
//! with defaults for the newer fields, and unknown keys from newer builds are
//! ignored. Only a `schema_version` above [`STATE_SCHEMA_VERSION`] is refused.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use pump_traits::{DeviceId, PumpModel, PumpRegion};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Paired pump. Replaced wholesale when the user re-pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpIdentity {
    pub pump_id: String,
    #[serde(default)]
    pub region: PumpRegion,
    #[serde(default)]
    pub model: Option<PumpModel>,
}

impl PumpIdentity {
    pub fn has_sentry(&self) -> bool {
        self.model.as_ref().is_some_and(PumpModel::has_sentry)
    }

    pub fn records_basal_profile_start_events(&self) -> bool {
        self.model
            .as_ref()
            .is_some_and(PumpModel::records_basal_profile_start_events)
    }
}

/// Last observed pump time zone and model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpState {
    pub utc_offset_secs: i32,
    pub model: Option<PumpModel>,
}

impl PumpState {
    pub fn time_zone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }

    /// Interpret pump-reported calendar components in the pump's time zone.
    pub fn interpret(&self, pump_time: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.time_zone()
            .from_local_datetime(&pump_time)
            .single()
            .map(|d| d.with_timezone(&Utc))
    }

    /// Calendar components of `now` as the pump clock should display them.
    pub fn local_components(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.time_zone()).naive_local()
    }
}

/// Per radio bridge tuning record. Replaced after each successful tune.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceState {
    pub last_tuned: Option<DateTime<Utc>>,
    pub last_valid_frequency: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosenseState {
    pub enabled: bool,
    /// Clamped, unrounded factor from the last run with enough data
    pub factor: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
}

impl Default for AutosenseState {
    fn default() -> Self {
        Self {
            enabled: true,
            factor: 1.0,
            last_run: None,
            suspended_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideContext {
    PreMeal,
    Workout,
    Custom,
}

/// Who installed an override. Autosense only ever touches its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnactTrigger {
    Local,
    Remote,
    Autosense,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetRange {
    pub min_mg_dl: f64,
    pub max_mg_dl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOverride {
    pub id: Uuid,
    pub context: OverrideContext,
    pub trigger: EnactTrigger,
    #[serde(default)]
    pub insulin_needs_scale: Option<f64>,
    pub start: DateTime<Utc>,
    /// None means indefinite
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub target_range: Option<TargetRange>,
}

impl ScheduleOverride {
    pub fn autosense(scale: f64, start: DateTime<Utc>, duration: std::time::Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            context: OverrideContext::Custom,
            trigger: EnactTrigger::Autosense,
            insulin_needs_scale: Some(scale),
            start,
            duration_secs: Some(duration.as_secs()),
            target_range: None,
        }
    }

    pub fn is_autosense(&self) -> bool {
        self.trigger == EnactTrigger::Autosense
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.duration_secs
            .and_then(|s| i64::try_from(s).ok())
            .map(|s| self.start + chrono::Duration::seconds(s))
    }

    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && self.end().is_none_or(|end| at < end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub schema_version: u32,
    #[serde(deserialize_with = "drop_unreadable")]
    pub pump_identity: Option<PumpIdentity>,
    pub pump_state: Option<PumpState>,
    pub devices: BTreeMap<DeviceId, DeviceState>,
    pub autosense: AutosenseState,
    #[serde(deserialize_with = "drop_unreadable")]
    pub active_override: Option<ScheduleOverride>,
}

/// A record missing required keys loads as `None` instead of failing the whole file.
fn drop_unreadable<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Some(value) = Option::<toml::Value>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match value.try_into::<T>() {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            tracing::warn!(
                record = std::any::type_name::<T>(),
                error = %e,
                "dropping unreadable persisted record"
            );
            Ok(None)
        }
    }
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            pump_identity: None,
            pump_state: None,
            devices: BTreeMap::new(),
            autosense: AutosenseState::default(),
            active_override: None,
        }
    }
}

impl PersistedState {
    pub fn from_toml_str(s: &str) -> eyre::Result<Self> {
        let mut state: PersistedState =
            toml::from_str(s).map_err(|e| eyre::eyre!("parse persisted state: {e}"))?;
        if state.schema_version > STATE_SCHEMA_VERSION {
            eyre::bail!(
                "persisted state schema_version {} is newer than supported {}",
                state.schema_version,
                STATE_SCHEMA_VERSION
            );
        }
        state.schema_version = STATE_SCHEMA_VERSION;
        Ok(state)
    }

    pub fn to_toml_string(&self) -> eyre::Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre::eyre!("serialize persisted state: {e}"))
    }
}

/// Load the record at `path`; a missing file yields a fresh default record.
pub fn load_state(path: &Path) -> eyre::Result<PersistedState> {
    match std::fs::read_to_string(path) {
        Ok(s) => PersistedState::from_toml_str(&s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
        Err(e) => Err(eyre::eyre!("read persisted state {:?}: {}", path, e)),
    }
}

pub fn save_state(path: &Path, state: &PersistedState) -> eyre::Result<()> {
    let text = state.to_toml_string()?;
    crate::atomic::write_atomic(path, text.as_bytes())
        .map_err(|e| eyre::eyre!("write persisted state {:?}: {}", path, e))
}
