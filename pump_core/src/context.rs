//! Shared collaborators and services handed to every operation.
//!
//! One `PumpContext` is built per `DeviceManager` and passed by reference;
//! nothing in the engine reaches for global state.

use crate::battery::BatteryMonitor;
use crate::clock_sync::ClockSync;
use crate::config::EngineCfg;
use crate::error::{PumpError, PumpResult};
use crate::freshness::FreshnessTracker;
use crate::history::HistoryReader;
use crate::reservoir::ReservoirMonitor;
use crate::session::SessionCoordinator;
use crate::settings::SettingsStore;
use crate::status::LastError;
use crate::tuner::RadioTuner;
use chrono::{DateTime, Utc};
use pump_config::PumpIdentity;
use pump_traits::{
    CarbStore, CareLog, Clock, DoseStore, GlucoseStore, LoopTrigger, NotificationSink, Treatment,
    Uploader,
};
use std::sync::{Arc, Mutex};

/// The three data stores the engine feeds and reads.
#[derive(Clone)]
pub struct Stores {
    pub dose: Arc<dyn DoseStore>,
    pub glucose: Arc<dyn GlucoseStore>,
    pub carb: Arc<dyn CarbStore>,
}

/// Outbound side effects.
#[derive(Clone)]
pub struct Sinks {
    pub notifications: Arc<dyn NotificationSink>,
    pub care_log: Arc<dyn CareLog>,
    pub loop_trigger: Arc<dyn LoopTrigger>,
    pub uploader: Option<Arc<dyn Uploader>>,
}

pub struct PumpContext {
    pub cfg: EngineCfg,
    pub clock: Arc<dyn Clock>,
    pub sessions: SessionCoordinator,
    pub stores: Stores,
    pub sinks: Sinks,
    pub settings: SettingsStore,
    pub freshness: FreshnessTracker,
    pub clock_sync: ClockSync,
    pub tuner: RadioTuner,
    pub reservoir: ReservoirMonitor,
    pub battery: BatteryMonitor,
    pub history: HistoryReader,
    last_error: Mutex<Option<LastError>>,
    last_sentry_date: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for PumpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpContext")
            .field("cfg", &self.cfg)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl PumpContext {
    pub fn new(
        cfg: EngineCfg,
        clock: Arc<dyn Clock>,
        sessions: SessionCoordinator,
        stores: Stores,
        sinks: Sinks,
        settings: SettingsStore,
    ) -> Self {
        let now = clock.now();
        let ctx = Self {
            freshness: FreshnessTracker::new(cfg.freshness.clone()),
            clock_sync: ClockSync::new(cfg.poller.clock_drift_threshold),
            tuner: RadioTuner::new(cfg.tuner.clone()),
            reservoir: ReservoirMonitor::new(&cfg.poller),
            battery: BatteryMonitor::new(cfg.battery.chemistry),
            history: HistoryReader::new(&cfg.poller, now),
            cfg,
            clock,
            sessions,
            stores,
            sinks,
            settings,
            last_error: Mutex::new(None),
            last_sentry_date: Mutex::new(None),
        };
        ctx.refresh_heartbeat();
        ctx
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Re-derive the heartbeat capability from the paired pump and last seen model.
    pub fn refresh_heartbeat(&self) {
        let has_sentry = self
            .settings
            .pump_identity()
            .is_some_and(|p| p.has_sentry())
            || self
                .settings
                .pump_state()
                .model
                .is_some_and(|m| m.has_sentry());
        self.freshness.set_pump_has_heartbeat(has_sentry);
    }

    pub fn require_identity(&self) -> PumpResult<PumpIdentity> {
        self.settings
            .pump_identity()
            .ok_or_else(|| PumpError::Configuration("Pump ID".into()))
    }

    pub fn set_last_error(&self, error: PumpError) {
        tracing::warn!(%error, "pump error");
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(LastError {
                at: self.now(),
                error,
            });
        }
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn note_sentry_date(&self, at: DateTime<Utc>) {
        if let Ok(mut d) = self.last_sentry_date.lock() {
            *d = Some(at);
        }
    }

    /// Newest of the stored reservoir date and the latest accepted sentry packet.
    pub fn last_pump_data_date(&self) -> Option<DateTime<Utc>> {
        let reservoir = self.stores.dose.last_reservoir_value().map(|r| r.at);
        let sentry = self.last_sentry_date.lock().ok().and_then(|d| *d);
        reservoir.max(sentry)
    }

    pub fn is_stale(&self) -> bool {
        self.freshness.is_stale(self.now(), self.last_pump_data_date())
    }

    /// Opportunistic upload; failures are logged and dropped.
    pub fn upload(&self, treatments: &[Treatment]) {
        let Some(uploader) = &self.sinks.uploader else {
            return;
        };
        match uploader.upload(treatments) {
            Ok(ids) => tracing::debug!(count = ids.len(), "uploaded treatments"),
            Err(e) => tracing::warn!(error = %e, "upload failed"),
        }
    }
}
