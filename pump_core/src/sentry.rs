//! Handling of status packets the pump broadcasts while idle.

use crate::context::PumpContext;
use crate::freshness::span;
use chrono::{DateTime, Utc};
use pump_traits::{
    DeviceId, DeviceStatusReport, GlucoseSample, SensorReading, SentryStatus, Treatment,
};
use std::sync::Mutex;
use std::time::Duration;

/// Pump clock error beyond which a sentry packet is dropped and the clock resynced.
const MAX_SENTRY_CLOCK_DRIFT: Duration = Duration::from_secs(60);

/// A reservoir reading to be stored after the sentry delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingReservoir {
    pub units: f64,
    pub at: DateTime<Utc>,
    pub time_left: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SentryAction {
    /// Same packet as last time.
    Duplicate,
    /// Pump time cannot be placed in the pump's zone.
    UninterpretableDate,
    /// Clock is off; the packet was dropped and a clock sync should run.
    SyncClock { drift_secs: i64 },
    /// Accepted; store this reading once the delay has passed.
    ScheduleReservoir(PendingReservoir),
}

#[derive(Debug, Default)]
pub struct SentryHandler {
    latest: Mutex<Option<SentryStatus>>,
}

impl SentryHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, ctx: &PumpContext, device: &DeviceId, status: SentryStatus) -> SentryAction {
        if let Ok(latest) = self.latest.lock()
            && latest.as_ref() == Some(&status)
        {
            return SentryAction::Duplicate;
        }
        let pump_state = ctx.settings.pump_state();
        let Some(pump_date) = pump_state.interpret(status.pump_clock) else {
            tracing::warn!(pump_clock = %status.pump_clock, "sentry packet with ambiguous pump time");
            return SentryAction::UninterpretableDate;
        };
        let drift = pump_date - ctx.now();
        if drift.abs() > span(MAX_SENTRY_CLOCK_DRIFT) {
            tracing::info!(drift_secs = drift.num_seconds(), "sentry packet clock off; dropping");
            return SentryAction::SyncClock {
                drift_secs: drift.num_seconds(),
            };
        }

        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(status.clone());
        }
        ctx.note_sentry_date(pump_date);
        ctx.battery
            .observe_charge(ctx, f64::from(status.battery_percent) / 100.0);

        if let SensorReading::Active { mg_dl } = status.sensor {
            let at = status
                .glucose_clock
                .and_then(|c| pump_state.interpret(c))
                .unwrap_or(pump_date);
            let sample = GlucoseSample {
                at,
                mg_dl: f64::from(mg_dl),
                display_only: false,
            };
            if let Err(e) = ctx.stores.glucose.add_glucose(&[sample], Some("pump-sensor")) {
                tracing::warn!(error = %e, "could not store sensor glucose");
            }
        }

        ctx.upload(&[Treatment::DeviceStatus(DeviceStatusReport {
            device: Some(device.to_string()),
            clock: Some(pump_date),
            reservoir: Some(status.reservoir_units),
            ..DeviceStatusReport::default()
        })]);

        SentryAction::ScheduleReservoir(PendingReservoir {
            units: status.reservoir_units,
            at: pump_date,
            time_left: Some(Duration::from_secs(u64::from(status.reservoir_minutes) * 60)),
        })
    }
}
