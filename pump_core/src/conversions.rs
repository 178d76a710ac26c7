//! `From` implementations bridging `pump_config` types to `pump_core` types.

use crate::config::{
    AutosenseCfg, BatteryCfg, BolusCfg, EngineCfg, FreshnessCfg, PollerCfg, SessionCfg,
    TempBasalCfg, TunerCfg,
};
use std::time::Duration;

fn mins(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

// ── FreshnessCfg ─────────────────────────────────────────────────────────────

impl From<&pump_config::FreshnessCfg> for FreshnessCfg {
    fn from(c: &pump_config::FreshnessCfg) -> Self {
        Self {
            heartbeat_tolerance: mins(c.heartbeat_tolerance_min),
            no_heartbeat_tolerance: mins(c.no_heartbeat_tolerance_min),
            sentry_reservoir_delay: Duration::from_secs(c.sentry_reservoir_delay_secs),
            idle_listening: c.idle_listening,
        }
    }
}

// ── PollerCfg ────────────────────────────────────────────────────────────────

impl From<&pump_config::PollerCfg> for PollerCfg {
    fn from(c: &pump_config::PollerCfg) -> Self {
        Self {
            retries: c.retries,
            clock_drift_threshold: Duration::from_secs(c.clock_drift_secs),
            low_reservoir_thresholds: c.low_reservoir_thresholds.clone(),
            rewind_delta_units: c.rewind_delta_units,
            insulin_data_source: c.insulin_data_source,
            history_bg_window: mins(c.history_bg_window_min),
            initial_history_lookback: Duration::from_secs(
                c.initial_history_lookback_hours.saturating_mul(3600),
            ),
        }
    }
}

// ── TunerCfg ─────────────────────────────────────────────────────────────────

impl From<&pump_config::TunerCfg> for TunerCfg {
    fn from(c: &pump_config::TunerCfg) -> Self {
        Self {
            tune_tolerance: mins(c.tune_tolerance_min),
            recent_reservoir_window: mins(c.recent_reservoir_min),
        }
    }
}

// ── BolusCfg ─────────────────────────────────────────────────────────────────

impl From<&pump_config::BolusCfg> for BolusCfg {
    fn from(c: &pump_config::BolusCfg) -> Self {
        Self {
            max_attempts: c.max_attempts,
            reservoir_max_age: mins(c.reservoir_max_age_min),
            recency_interval: mins(c.recency_interval_min),
            max_clock_drift: Duration::from_secs(c.max_clock_drift_secs),
        }
    }
}

// ── TempBasalCfg ─────────────────────────────────────────────────────────────

impl From<&pump_config::TempBasalCfg> for TempBasalCfg {
    fn from(c: &pump_config::TempBasalCfg) -> Self {
        Self {
            retries: c.retries,
            history_piggyback_age: mins(c.history_piggyback_min),
        }
    }
}

// ── AutosenseCfg ─────────────────────────────────────────────────────────────

impl From<&pump_config::AutosenseCfg> for AutosenseCfg {
    fn from(c: &pump_config::AutosenseCfg) -> Self {
        Self {
            enabled: c.enabled,
            interval: Duration::from_secs(c.interval_secs),
            lookback: mins(c.lookback_min),
            min_samples: c.min_samples,
            high_threshold: c.high_threshold,
            low_threshold: c.low_threshold,
            high_trigger_ratio: c.high_trigger_ratio,
            low_trigger_ratio: c.low_trigger_ratio,
            min_factor: c.min_factor,
            max_factor: c.max_factor,
            decay: c.decay,
            suspend_interval: mins(c.suspend_interval_min),
        }
    }
}

// ── SessionCfg ───────────────────────────────────────────────────────────────

impl From<&pump_config::SessionCfg> for SessionCfg {
    fn from(c: &pump_config::SessionCfg) -> Self {
        Self {
            acquire_timeout: (c.acquire_timeout_secs > 0)
                .then(|| Duration::from_secs(c.acquire_timeout_secs)),
        }
    }
}

// ── EngineCfg ────────────────────────────────────────────────────────────────

impl From<&pump_config::Config> for EngineCfg {
    fn from(c: &pump_config::Config) -> Self {
        Self {
            freshness: (&c.freshness).into(),
            poller: (&c.poller).into(),
            tuner: (&c.tuner).into(),
            bolus: (&c.bolus).into(),
            temp_basal: (&c.temp_basal).into(),
            autosense: (&c.autosense).into(),
            session: (&c.session).into(),
            battery: BatteryCfg {
                chemistry: c.pump.battery_chemistry,
            },
        }
    }
}
