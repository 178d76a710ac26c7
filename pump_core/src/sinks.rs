//! Default sinks that only log. Used when the host wires nothing else in.

use chrono::{DateTime, Utc};
use pump_traits::{CareEvent, CareLog, LoopTrigger, NotificationSink};
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn pump_battery_low(&self) {
        tracing::warn!(target: "pump::notify", "pump battery low");
    }

    fn reservoir_low(&self, units: f64, time_left: Option<Duration>) {
        tracing::warn!(
            target: "pump::notify",
            units,
            minutes_left = time_left.map(|d| d.as_secs() / 60),
            "reservoir low"
        );
    }

    fn reservoir_empty(&self) {
        tracing::warn!(target: "pump::notify", "reservoir empty");
    }

    fn bolus_failed(&self, units: f64, at: DateTime<Utc>, error: &str) {
        tracing::error!(target: "pump::notify", units, %at, error, "bolus failed");
    }
}

impl CareLog for TracingSink {
    fn record(&self, event: CareEvent) {
        tracing::info!(target: "pump::care", ?event, "care event");
    }
}

impl LoopTrigger for TracingSink {
    fn request_loop(&self) {
        tracing::debug!(target: "pump::loop", "loop requested");
    }
}
