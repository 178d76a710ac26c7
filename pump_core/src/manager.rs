//! `DeviceManager`: the engine's public facade.
//!
//! All operations are synchronous and may be called from any thread; pump
//! access is serialized by the session coordinator inside the context.

use crate::autosense::{AutosenseEngine, AutosenseOutcome};
use crate::bolus::BolusEnactor;
use crate::builder::{DeviceManagerBuilder, Missing};
use crate::clock_sync::unexpected;
use crate::context::PumpContext;
use crate::error::{PumpError, PumpResult};
use crate::poller::PumpPoller;
use crate::sentry::{PendingReservoir, SentryAction, SentryHandler};
use crate::status::{DoseOutcome, PollReport, Snapshot};
use crate::temp_basal::{TempBasalEnactor, TempBasalRecommendation};
use crate::tuner::TroubleshootOutcome;
use chrono::{DateTime, Utc};
use pump_config::{DeviceState, InsulinDataSource, PumpIdentity, PumpState, ScheduleOverride};
use pump_traits::{BasalScheduleEntry, DeviceId, GlucoseSample, PumpCommand, PumpResponse, SentryStatus};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct DeviceManager {
    pub(crate) ctx: PumpContext,
    pub(crate) poller: PumpPoller,
    pub(crate) bolus: BolusEnactor,
    pub(crate) temp_basal: TempBasalEnactor,
    pub(crate) autosense: AutosenseEngine,
    pub(crate) sentry: SentryHandler,
    pub(crate) cgm_heartbeat: AtomicBool,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("ctx", &self.ctx)
            .field("bolus", &self.bolus.state())
            .finish_non_exhaustive()
    }
}

impl DeviceManager {
    pub fn builder() -> DeviceManagerBuilder<Missing, Missing> {
        DeviceManagerBuilder::default()
    }

    pub fn context(&self) -> &PumpContext {
        &self.ctx
    }

    // ── Dosing ───────────────────────────────────────────────────────────────

    /// Deliver a bolus. `quiet` suppresses the failure notification.
    pub fn enact_bolus(&self, units: f64, at: DateTime<Utc>, quiet: bool) -> PumpResult<()> {
        self.bolus.enact(&self.ctx, units, at, quiet)
    }

    pub fn enact_temp_basal(&self, rec: TempBasalRecommendation, at: DateTime<Utc>) -> DoseOutcome {
        self.temp_basal.enact(&self.ctx, rec, at)
    }

    // ── Pump data ────────────────────────────────────────────────────────────

    /// Read the pump if its data is stale or a read was forced.
    pub fn assert_current_pump_data(&self) -> PumpResult<PollReport> {
        self.poller.assert_current(&self.ctx)
    }

    /// Force a read regardless of staleness.
    pub fn trigger_pump_data_read(&self) -> PumpResult<PollReport> {
        self.ctx.freshness.force_read();
        self.poller.assert_current(&self.ctx)
    }

    /// Whether the host should keep a periodic timer running for pump reads.
    pub fn wants_timer_tick(&self) -> bool {
        self.ctx.is_stale() || !self.cgm_heartbeat.load(Ordering::SeqCst)
    }

    /// Tell the engine whether the CGM delivers its own periodic wakeups.
    pub fn set_cgm_heartbeat(&self, provides: bool) {
        self.cgm_heartbeat.store(provides, Ordering::SeqCst);
    }

    pub fn add_glucose(&self, samples: &[GlucoseSample], source: Option<&str>) -> PumpResult<()> {
        self.ctx
            .stores
            .glucose
            .add_glucose(samples, source)
            .map_err(PumpError::from)
    }

    pub fn handle_sentry_status(&self, device: &DeviceId, status: SentryStatus) -> SentryAction {
        self.sentry.handle(&self.ctx, device, status)
    }

    /// Store a reservoir reading that arrived outside a status poll, then
    /// fetch history when the insulin data source needs it.
    pub fn update_reservoir_volume(&self, pending: PendingReservoir) -> PumpResult<()> {
        let update = self
            .ctx
            .reservoir
            .record(&self.ctx, pending.units, pending.at, pending.time_left)
            .inspect_err(|e| self.ctx.set_last_error(e.clone()))?;

        let wants_history = self.ctx.cfg.poller.insulin_data_source
            == InsulinDataSource::PumpHistory
            || !update.continuous;
        if wants_history
            && let Err(e) = self.fetch_history()
        {
            self.ctx.set_last_error(e.clone());
            if !update.continuous {
                return Err(e);
            }
        }
        self.ctx.sinks.loop_trigger.request_loop();
        Ok(())
    }

    pub fn fetch_history(&self) -> PumpResult<usize> {
        let device = self.ctx.sessions.connected_device()?;
        self.ctx
            .sessions
            .run_session("Fetch Pump History", &device, None, |session| {
                self.ctx.history.fetch(&self.ctx, session)
            })
    }

    // ── Clock and radio ──────────────────────────────────────────────────────

    pub fn sync_pump_clock(&self) -> PumpResult<()> {
        let device = self.ctx.sessions.connected_device()?;
        self.ctx
            .sessions
            .run_session("Sync Pump Time", &device, None, |session| {
                self.ctx.clock_sync.set_time(&self.ctx, session)
            })
            .inspect_err(|e| self.ctx.set_last_error(e.clone()))
    }

    pub fn troubleshoot(&self, device: &DeviceId) -> TroubleshootOutcome {
        self.ctx.tuner.troubleshoot(&self.ctx, device)
    }

    /// Tune `device` (or the first connected one) right away.
    pub fn tune_radio(&self, device: Option<DeviceId>) -> PumpResult<f64> {
        let device = match device {
            Some(d) => d,
            None => self.ctx.sessions.connected_device()?,
        };
        self.ctx
            .tuner
            .tune(&self.ctx, &device)
            .inspect_err(|e| self.ctx.set_last_error(e.clone()))
    }

    pub fn set_device_state(&self, device: &DeviceId, state: DeviceState) -> PumpResult<()> {
        self.ctx.settings.set_device_state(device, state)
    }

    // ── Pump configuration ───────────────────────────────────────────────────

    /// Pair, re-pair or unpair. A changed identity resets pump-derived data.
    pub fn set_pump_identity(&self, identity: Option<PumpIdentity>) -> PumpResult<()> {
        if let Some(id) = &identity
            && id.pump_id.chars().count() != 6
        {
            return Err(PumpError::InvalidData(format!(
                "pump ID {:?} must be 6 characters",
                id.pump_id
            )));
        }
        let current = self.ctx.settings.pump_identity();
        if current == identity {
            return Ok(());
        }
        let changed_pump =
            current.as_ref().map(|p| &p.pump_id) != identity.as_ref().map(|p| &p.pump_id);
        self.ctx.settings.update(|s| {
            s.pump_identity = identity.clone();
            if changed_pump {
                s.pump_state = None;
            }
        })?;
        if changed_pump {
            tracing::info!(pump_id = ?identity.as_ref().map(|p| &p.pump_id), "pump identity changed; resetting pump data");
            self.ctx.stores.dose.reset_pump_data();
        }
        self.ctx.refresh_heartbeat();
        Ok(())
    }

    pub fn set_pump_id(&self, pump_id: Option<&str>) -> PumpResult<()> {
        let identity = pump_id.map(|id| {
            let mut identity = self.ctx.settings.pump_identity().unwrap_or(PumpIdentity {
                pump_id: String::new(),
                region: pump_traits::PumpRegion::default(),
                model: None,
            });
            if identity.pump_id != id {
                identity.model = None;
            }
            identity.pump_id = id.to_string();
            identity
        });
        self.set_pump_identity(identity)
    }

    pub fn set_pump_state(&self, state: PumpState) -> PumpResult<()> {
        self.ctx.settings.update(|s| s.pump_state = Some(state))?;
        self.ctx.refresh_heartbeat();
        Ok(())
    }

    pub fn set_basal_schedule(&self, schedule: &[BasalScheduleEntry]) -> PumpResult<()> {
        if schedule.is_empty() {
            return Err(PumpError::Configuration("basal rate schedule".into()));
        }
        self.ctx.require_identity()?;
        let device = self.ctx.sessions.connected_device()?;
        let entries = schedule.to_vec();
        self.ctx
            .sessions
            .run_session("Save Basal Profile", &device, None, |session| {
                match session.send(PumpCommand::SetBasalSchedule(entries))? {
                    PumpResponse::Ack => Ok(()),
                    other => Err(unexpected("set_basal_schedule", &other)),
                }
            })
            .inspect_err(|e| self.ctx.set_last_error(e.clone()))
    }

    // ── Autosense and overrides ──────────────────────────────────────────────

    pub fn run_autosense(&self) -> PumpResult<AutosenseOutcome> {
        self.autosense.run(&self.ctx)
    }

    /// Disabling records the time so installs stay blocked for the suspend
    /// interval, and removes any autosense override.
    pub fn set_autosense_enabled(&self, enabled: bool) -> PumpResult<()> {
        let now = self.ctx.now();
        self.ctx.settings.update(|s| {
            s.autosense.enabled = enabled;
            if !enabled {
                s.autosense.suspended_at = Some(now);
                if s.active_override.as_ref().is_some_and(ScheduleOverride::is_autosense) {
                    s.active_override = None;
                }
            }
        })
    }

    pub fn set_override(&self, o: ScheduleOverride) -> PumpResult<()> {
        self.ctx.settings.update(|s| s.active_override = Some(o))
    }

    pub fn clear_override(&self) -> PumpResult<()> {
        self.ctx.settings.update(|s| s.active_override = None)
    }

    // ── Observation ──────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Snapshot {
        let state = self.ctx.settings.snapshot();
        let now = self.ctx.now();
        Snapshot {
            at: now,
            pump_identity: state.pump_identity,
            reservoir: self.ctx.stores.dose.last_reservoir_value(),
            stale: self.ctx.is_stale(),
            forced_read: self.ctx.freshness.forced_read(),
            unverified: self.ctx.freshness.unverified(),
            bolus: self.bolus.state(),
            temp_basal: self.temp_basal.state(),
            last_error: self.ctx.last_error(),
            autosense_enabled: state.autosense.enabled && self.autosense.cfg().enabled,
            autosense_factor: state.autosense.factor,
            active_override: state.active_override.filter(|o| o.is_active(now)),
            devices: state.devices,
            session_attempts: self.ctx.sessions.attempt_counts(),
        }
    }
}
