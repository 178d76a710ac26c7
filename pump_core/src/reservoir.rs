//! Reservoir readings: storage, low/empty notifications and cartridge changes.

use crate::config::PollerCfg;
use crate::context::PumpContext;
use crate::error::PumpResult;
use chrono::{DateTime, Utc};
use pump_traits::{CareEvent, ReservoirUpdate};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReservoirMonitor {
    thresholds: Vec<f64>,
    rewind_delta: f64,
}

impl ReservoirMonitor {
    pub fn new(cfg: &PollerCfg) -> Self {
        let mut thresholds = cfg.low_reservoir_thresholds.clone();
        thresholds.sort_by(|a, b| b.total_cmp(a));
        thresholds.dedup();
        Self {
            thresholds,
            rewind_delta: cfg.rewind_delta_units,
        }
    }

    /// Store a reading and raise whatever notifications the change implies.
    ///
    /// Notifications are edge-triggered against the previous stored value, so
    /// recording the same volume twice is silent.
    pub fn record(
        &self,
        ctx: &PumpContext,
        units: f64,
        at: DateTime<Utc>,
        time_left: Option<Duration>,
    ) -> PumpResult<ReservoirUpdate> {
        let update = ctx.stores.dose.add_reservoir_value(units, at)?;
        tracing::debug!(units, %at, continuous = update.continuous, "reservoir value stored");
        let Some(previous) = update.previous else {
            return Ok(update);
        };
        let new = update.new.units;

        if new <= 0.0 {
            if previous.units > 0.0 {
                ctx.sinks.notifications.reservoir_empty();
            }
            return Ok(update);
        }
        for &threshold in &self.thresholds {
            if previous.units > threshold && new <= threshold {
                tracing::info!(units = new, threshold, "reservoir low");
                ctx.sinks.notifications.reservoir_low(new, time_left);
            }
        }
        if new > previous.units + self.rewind_delta {
            tracing::info!(previous = previous.units, new, "cartridge change detected");
            ctx.sinks.care_log.record(CareEvent::CartridgeChange {
                previous: previous.units,
                new,
            });
        }
        Ok(update)
    }
}
