//! Configuration types for the pump engine.
//!
//! These are the runtime configuration structs used by `DeviceManager`.
//! They are separate from the TOML-deserialized config in `pump_config`.

use pump_config::InsulinDataSource;
use pump_traits::BatteryChemistry;
use std::time::Duration;

/// Pump data freshness policy.
#[derive(Debug, Clone)]
pub struct FreshnessCfg {
    /// Tolerance while the pump heartbeat (sentry packets) is available.
    pub heartbeat_tolerance: Duration,
    /// Tolerance when it is not.
    pub no_heartbeat_tolerance: Duration,
    /// Delay between a sentry packet and storing its reservoir value.
    pub sentry_reservoir_delay: Duration,
    /// Radio listens for sentry packets between sessions.
    pub idle_listening: bool,
}

impl Default for FreshnessCfg {
    fn default() -> Self {
        Self {
            heartbeat_tolerance: Duration::from_secs(6 * 60),
            no_heartbeat_tolerance: Duration::from_secs(4 * 60),
            sentry_reservoir_delay: Duration::from_secs(11),
            idle_listening: true,
        }
    }
}

/// Status polling.
#[derive(Debug, Clone)]
pub struct PollerCfg {
    /// In-session attempts after the first failed status read.
    pub retries: u32,
    /// Pump clock error above this is corrected during the read.
    pub clock_drift_threshold: Duration,
    /// Low reservoir warning levels in units.
    pub low_reservoir_thresholds: Vec<f64>,
    /// Volume increase treated as a cartridge change.
    pub rewind_delta_units: f64,
    pub insulin_data_source: InsulinDataSource,
    /// History meter readings are dropped when glucose exists this recently.
    pub history_bg_window: Duration,
    /// Start of the first history read after launch.
    pub initial_history_lookback: Duration,
}

impl Default for PollerCfg {
    fn default() -> Self {
        Self {
            retries: 3,
            clock_drift_threshold: Duration::from_secs(20),
            low_reservoir_thresholds: vec![10.0, 20.0, 30.0],
            rewind_delta_units: 1.0,
            insulin_data_source: InsulinDataSource::PumpHistory,
            history_bg_window: Duration::from_secs(30 * 60),
            initial_history_lookback: Duration::from_secs(6 * 3600),
        }
    }
}

/// Radio troubleshooting.
#[derive(Debug, Clone)]
pub struct TunerCfg {
    /// Minimum time between tunes of the same device.
    pub tune_tolerance: Duration,
    /// Reservoir data this recent means the link is fine.
    pub recent_reservoir_window: Duration,
}

impl Default for TunerCfg {
    fn default() -> Self {
        Self {
            tune_tolerance: Duration::from_secs(14 * 60),
            recent_reservoir_window: Duration::from_secs(24 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BolusCfg {
    /// Total delivery attempts, first one included.
    pub max_attempts: u32,
    /// Reservoir data older than this is re-read before delivery.
    pub reservoir_max_age: Duration,
    /// Reservoir data older than this is also reported as too old.
    pub recency_interval: Duration,
    /// Pump clock error that aborts delivery.
    pub max_clock_drift: Duration,
}

impl Default for BolusCfg {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            reservoir_max_age: Duration::from_secs(10 * 60),
            recency_interval: Duration::from_secs(15 * 60),
            max_clock_drift: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TempBasalCfg {
    pub retries: u32,
    /// History is fetched in the same session when the last fetch is older than this.
    pub history_piggyback_age: Duration,
}

impl Default for TempBasalCfg {
    fn default() -> Self {
        Self {
            retries: 3,
            history_piggyback_age: Duration::from_secs(4 * 60),
        }
    }
}

/// Sensitivity detection.
#[derive(Debug, Clone)]
pub struct AutosenseCfg {
    /// Master switch; the persisted flag can only narrow it.
    pub enabled: bool,
    pub interval: Duration,
    pub lookback: Duration,
    pub min_samples: usize,
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub high_trigger_ratio: f64,
    pub low_trigger_ratio: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    pub decay: f64,
    /// Override installs stay blocked this long after autosense is disabled.
    pub suspend_interval: Duration,
}

impl Default for AutosenseCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            lookback: Duration::from_secs(4 * 3600),
            min_samples: 12,
            high_threshold: 180.0,
            low_threshold: 60.0,
            high_trigger_ratio: 0.1,
            low_trigger_ratio: 0.1,
            min_factor: 0.2,
            max_factor: 2.0,
            decay: 0.8,
            suspend_interval: Duration::from_secs(6 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionCfg {
    /// `None` waits forever.
    pub acquire_timeout: Option<Duration>,
}

impl Default for SessionCfg {
    fn default() -> Self {
        Self {
            acquire_timeout: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatteryCfg {
    pub chemistry: BatteryChemistry,
}

/// Everything the engine reads at runtime.
#[derive(Debug, Clone, Default)]
pub struct EngineCfg {
    pub freshness: FreshnessCfg,
    pub poller: PollerCfg,
    pub tuner: TunerCfg,
    pub bolus: BolusCfg,
    pub temp_basal: TempBasalCfg,
    pub autosense: AutosenseCfg,
    pub session: SessionCfg,
    pub battery: BatteryCfg,
}
