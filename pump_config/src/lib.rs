#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas, persisted state and glucose history parsing for the pump engine.
//!
//! - `Config` and its sections are deserialized from TOML and validated.
//! - `PersistedState` is the versioned record that survives restarts.
//! - The glucose CSV loader enforces headers and timestamp ordering.
use pump_traits::{BatteryChemistry, GlucoseSample, PumpRegion};
use serde::{Deserialize, Serialize};

pub mod atomic;
pub mod state;

pub use atomic::write_atomic;
pub use state::{
    AutosenseState, DeviceState, EnactTrigger, OverrideContext, PersistedState, PumpIdentity,
    PumpState, STATE_SCHEMA_VERSION, ScheduleOverride, TargetRange, load_state, save_state,
};

/// Glucose history CSV schema.
///
/// Expected headers:
/// timestamp,mg_dl
///
/// Example:
/// timestamp,mg_dl
/// 2024-03-01T08:00:00Z,112
/// 2024-03-01T08:05:00Z,118
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct GlucoseRow {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub mg_dl: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FreshnessCfg {
    /// Pump data age tolerance while idle listening (sentry heartbeat) is available.
    pub heartbeat_tolerance_min: u64,
    /// Tolerance when the pump heartbeat is unavailable.
    pub no_heartbeat_tolerance_min: u64,
    /// Sentry packets arrive in bursts; wait this long before storing their reservoir value.
    pub sentry_reservoir_delay_secs: u64,
    /// Whether the radio listens for sentry packets between sessions
    pub idle_listening: bool,
}

impl Default for FreshnessCfg {
    fn default() -> Self {
        Self {
            heartbeat_tolerance_min: 6,
            no_heartbeat_tolerance_min: 4,
            sentry_reservoir_delay_secs: 11,
            idle_listening: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsulinDataSource {
    #[default]
    PumpHistory,
    Reservoir,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PollerCfg {
    /// Additional in-session attempts after the first failed read
    pub retries: u32,
    pub clock_drift_secs: u64,
    /// Low reservoir warning levels (units), edge-triggered downward
    pub low_reservoir_thresholds: Vec<f64>,
    /// Volume increase that counts as a cartridge change
    pub rewind_delta_units: f64,
    pub insulin_data_source: InsulinDataSource,
    /// Meter readings from pump history are skipped when glucose exists within this window
    pub history_bg_window_min: u64,
    /// How far back the very first history read reaches
    pub initial_history_lookback_hours: u64,
}

impl Default for PollerCfg {
    fn default() -> Self {
        Self {
            retries: 3,
            clock_drift_secs: 20,
            low_reservoir_thresholds: vec![10.0, 20.0, 30.0],
            rewind_delta_units: 1.0,
            insulin_data_source: InsulinDataSource::PumpHistory,
            history_bg_window_min: 30,
            initial_history_lookback_hours: 6,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TunerCfg {
    pub tune_tolerance_min: u64,
    /// A reservoir read this recent means the link works; skip tuning.
    pub recent_reservoir_min: u64,
}

impl Default for TunerCfg {
    fn default() -> Self {
        Self {
            tune_tolerance_min: 14,
            recent_reservoir_min: 24,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BolusCfg {
    /// Total delivery attempts including the first
    pub max_attempts: u32,
    pub reservoir_max_age_min: u64,
    /// Reservoir data older than this is reported as too old
    pub recency_interval_min: u64,
    /// Pump clock error that aborts a bolus and schedules a clock sync
    pub max_clock_drift_secs: u64,
}

impl Default for BolusCfg {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            reservoir_max_age_min: 10,
            recency_interval_min: 15,
            max_clock_drift_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TempBasalCfg {
    pub retries: u32,
    pub history_piggyback_min: u64,
}

impl Default for TempBasalCfg {
    fn default() -> Self {
        Self {
            retries: 3,
            history_piggyback_min: 4,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AutosenseCfg {
    pub enabled: bool,
    pub interval_secs: u64,
    pub lookback_min: u64,
    pub min_samples: usize,
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub high_trigger_ratio: f64,
    pub low_trigger_ratio: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    /// Fraction of the previous deviation from 1.0 kept on each quiet run
    pub decay: f64,
    pub suspend_interval_min: u64,
}

impl Default for AutosenseCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            lookback_min: 240,
            min_samples: 12,
            high_threshold: 180.0,
            low_threshold: 60.0,
            high_trigger_ratio: 0.1,
            low_trigger_ratio: 0.1,
            min_factor: 0.2,
            max_factor: 2.0,
            decay: 0.8,
            suspend_interval_min: 360,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionCfg {
    /// Max wait for the radio session before giving up (0 waits forever)
    pub acquire_timeout_secs: u64,
}

impl Default for SessionCfg {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PumpCfg {
    /// Six character pump serial; seeds the identity when none is persisted
    pub pump_id: Option<String>,
    pub region: PumpRegion,
    /// Model number, e.g. "523"
    pub model: Option<String>,
    pub battery_chemistry: BatteryChemistry,
    /// Pump clock offset from UTC in seconds
    pub utc_offset_secs: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StateCfg {
    /// Where the persisted state record lives; in-memory only when absent
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub freshness: FreshnessCfg,
    pub poller: PollerCfg,
    pub tuner: TunerCfg,
    pub bolus: BolusCfg,
    pub temp_basal: TempBasalCfg,
    pub autosense: AutosenseCfg,
    pub session: SessionCfg,
    pub pump: PumpCfg,
    pub logging: Logging,
    pub state: StateCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

pub fn load_glucose_csv(path: &std::path::Path) -> eyre::Result<Vec<GlucoseSample>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open glucose CSV {:?}: {}", path, e))?;

    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["timestamp", "mg_dl"];
    let actual: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "glucose CSV must have headers 'timestamp,mg_dl', got: {}",
            actual.join(",")
        );
    }

    let mut rows: Vec<GlucoseRow> = Vec::new();
    for (idx, rec) in rdr.deserialize::<GlucoseRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }

    glucose_from_rows(&rows)
}

/// Validate rows (positive finite values, strictly increasing timestamps) and convert.
pub fn glucose_from_rows(rows: &[GlucoseRow]) -> eyre::Result<Vec<GlucoseSample>> {
    for (i, pair) in rows.windows(2).enumerate() {
        if pair[1].timestamp <= pair[0].timestamp {
            eyre::bail!(
                "glucose timestamps must be strictly increasing (rows {} and {})",
                i + 2,
                i + 3
            );
        }
    }
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if !row.mg_dl.is_finite() || row.mg_dl <= 0.0 {
            eyre::bail!("glucose row {} has invalid mg_dl {}", i + 2, row.mg_dl);
        }
        out.push(GlucoseSample {
            at: row.timestamp,
            mg_dl: row.mg_dl,
            display_only: false,
        });
    }
    Ok(out)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Freshness
        if self.freshness.heartbeat_tolerance_min == 0 {
            eyre::bail!("freshness.heartbeat_tolerance_min must be >= 1");
        }
        if self.freshness.no_heartbeat_tolerance_min == 0 {
            eyre::bail!("freshness.no_heartbeat_tolerance_min must be >= 1");
        }
        if self.freshness.sentry_reservoir_delay_secs > 120 {
            eyre::bail!("freshness.sentry_reservoir_delay_secs is unreasonably large (>2min)");
        }

        // Poller
        if self.poller.retries > 10 {
            eyre::bail!("poller.retries must be <= 10");
        }
        if self.poller.clock_drift_secs == 0 {
            eyre::bail!("poller.clock_drift_secs must be >= 1");
        }
        if self
            .poller
            .low_reservoir_thresholds
            .iter()
            .any(|t| !t.is_finite() || *t <= 0.0)
        {
            eyre::bail!("poller.low_reservoir_thresholds must all be > 0");
        }
        if !(self.poller.rewind_delta_units.is_finite() && self.poller.rewind_delta_units > 0.0) {
            eyre::bail!("poller.rewind_delta_units must be > 0");
        }

        // Tuner
        if self.tuner.tune_tolerance_min == 0 {
            eyre::bail!("tuner.tune_tolerance_min must be >= 1");
        }

        // Bolus
        if self.bolus.max_attempts == 0 {
            eyre::bail!("bolus.max_attempts must be >= 1");
        }
        if self.bolus.max_attempts > 10 {
            eyre::bail!("bolus.max_attempts must be <= 10");
        }
        if self.bolus.reservoir_max_age_min == 0 {
            eyre::bail!("bolus.reservoir_max_age_min must be >= 1");
        }
        if self.bolus.max_clock_drift_secs == 0 {
            eyre::bail!("bolus.max_clock_drift_secs must be >= 1");
        }

        // Temp basal
        if self.temp_basal.retries > 10 {
            eyre::bail!("temp_basal.retries must be <= 10");
        }

        // Autosense
        let a = &self.autosense;
        if a.interval_secs == 0 {
            eyre::bail!("autosense.interval_secs must be >= 1");
        }
        if a.lookback_min == 0 {
            eyre::bail!("autosense.lookback_min must be >= 1");
        }
        if a.min_samples < 2 {
            eyre::bail!("autosense.min_samples must be >= 2");
        }
        if a.low_threshold <= 0.0 || a.high_threshold <= a.low_threshold {
            eyre::bail!("autosense thresholds must satisfy 0 < low_threshold < high_threshold");
        }
        if !(0.0..=1.0).contains(&a.high_trigger_ratio) || !(0.0..=1.0).contains(&a.low_trigger_ratio)
        {
            eyre::bail!("autosense trigger ratios must be in [0.0, 1.0]");
        }
        if a.min_factor <= 0.0 {
            eyre::bail!("autosense.min_factor must be > 0");
        }
        if a.max_factor < a.min_factor {
            eyre::bail!("autosense.max_factor must be >= autosense.min_factor");
        }
        if !(0.0..=1.0).contains(&a.decay) {
            eyre::bail!("autosense.decay must be in [0.0, 1.0]");
        }

        // Pump
        if let Some(id) = &self.pump.pump_id
            && id.chars().count() != 6
        {
            eyre::bail!("pump.pump_id must be exactly 6 characters");
        }
        if let Some(off) = self.pump.utc_offset_secs
            && off.abs() >= 24 * 60 * 60
        {
            eyre::bail!("pump.utc_offset_secs must be within +/- 24h");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_reference_cadence() {
        let cfg = load_toml("").expect("empty config parses");
        assert_eq!(cfg.freshness.heartbeat_tolerance_min, 6);
        assert_eq!(cfg.freshness.no_heartbeat_tolerance_min, 4);
        assert_eq!(cfg.poller.retries, 3);
        assert_eq!(cfg.bolus.max_attempts, 5);
        assert_eq!(cfg.autosense.min_samples, 12);
        assert!(cfg.validate().is_ok());
    }
}
