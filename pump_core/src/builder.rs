//! Type-state builder for `DeviceManager`.
//!
//! The builder enforces at compile time that a transport and the data stores
//! are provided before `build()` is available. `try_build()` is always
//! available for dynamic checks.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use pump_config::{PersistedState, PumpIdentity, PumpState};
use pump_traits::{
    CarbStore, CareLog, Clock, DoseStore, GlucoseStore, LoopTrigger, NotificationSink,
    PumpTransport, SystemClock, Uploader,
};

use crate::autosense::AutosenseEngine;
use crate::bolus::BolusEnactor;
use crate::config::EngineCfg;
use crate::context::{PumpContext, Sinks, Stores};
use crate::error::{BuildError, Result};
use crate::manager::DeviceManager;
use crate::poller::PumpPoller;
use crate::sentry::SentryHandler;
use crate::session::SessionCoordinator;
use crate::settings::SettingsStore;
use crate::sinks::TracingSink;
use crate::temp_basal::TempBasalEnactor;

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

/// Builder for `DeviceManager`. Configuration is validated on `build()`.
pub struct DeviceManagerBuilder<T, S> {
    transport: Option<Arc<dyn PumpTransport>>,
    stores: Option<Stores>,
    cfg: Option<EngineCfg>,
    clock: Option<Arc<dyn Clock>>,
    notifications: Option<Arc<dyn NotificationSink>>,
    care_log: Option<Arc<dyn CareLog>>,
    loop_trigger: Option<Arc<dyn LoopTrigger>>,
    uploader: Option<Arc<dyn Uploader>>,
    state: Option<PersistedState>,
    state_path: Option<PathBuf>,
    seed_identity: Option<PumpIdentity>,
    seed_pump_state: Option<PumpState>,
    cgm_heartbeat: bool,
    _t: PhantomData<T>,
    _s: PhantomData<S>,
}

impl Default for DeviceManagerBuilder<Missing, Missing> {
    fn default() -> Self {
        Self {
            transport: None,
            stores: None,
            cfg: None,
            clock: None,
            notifications: None,
            care_log: None,
            loop_trigger: None,
            uploader: None,
            state: None,
            state_path: None,
            seed_identity: None,
            seed_pump_state: None,
            cgm_heartbeat: false,
            _t: PhantomData,
            _s: PhantomData,
        }
    }
}

fn invalid(msg: &'static str) -> Result<()> {
    Err(eyre::Report::new(BuildError::InvalidConfig(msg)))
}

fn validate(cfg: &EngineCfg) -> Result<()> {
    if cfg.bolus.max_attempts == 0 {
        return invalid("bolus max_attempts must be >= 1");
    }
    let a = &cfg.autosense;
    if !(a.min_factor > 0.0 && a.min_factor <= a.max_factor) {
        return invalid("autosense factor bounds must satisfy 0 < min <= max");
    }
    if !(a.low_threshold > 0.0 && a.low_threshold < a.high_threshold) {
        return invalid("autosense thresholds must satisfy 0 < low < high");
    }
    if !(0.0..=1.0).contains(&a.decay) {
        return invalid("autosense decay must be within 0..=1");
    }
    if cfg
        .poller
        .low_reservoir_thresholds
        .iter()
        .any(|t| !t.is_finite() || *t <= 0.0)
    {
        return invalid("low reservoir thresholds must be finite and > 0");
    }
    if cfg.freshness.heartbeat_tolerance.is_zero() || cfg.freshness.no_heartbeat_tolerance.is_zero()
    {
        return invalid("freshness tolerances must be > 0");
    }
    Ok(())
}

impl<T, S> DeviceManagerBuilder<T, S> {
    /// Fallible build available in any type-state; returns detailed error for missing pieces.
    pub fn try_build(self) -> Result<DeviceManager> {
        let transport = self
            .transport
            .ok_or_else(|| eyre::Report::new(BuildError::MissingTransport))?;
        let stores = self
            .stores
            .ok_or_else(|| eyre::Report::new(BuildError::MissingStores))?;
        let cfg = self.cfg.unwrap_or_default();
        validate(&cfg)?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let log_sink = Arc::new(TracingSink);
        let sinks = Sinks {
            notifications: self
                .notifications
                .unwrap_or_else(|| log_sink.clone() as Arc<dyn NotificationSink>),
            care_log: self
                .care_log
                .unwrap_or_else(|| log_sink.clone() as Arc<dyn CareLog>),
            loop_trigger: self
                .loop_trigger
                .unwrap_or_else(|| log_sink as Arc<dyn LoopTrigger>),
            uploader: self.uploader,
        };

        let mut state = self.state.unwrap_or_default();
        if state.pump_identity.is_none() {
            state.pump_identity = self.seed_identity;
        }
        if state.pump_state.is_none() {
            state.pump_state = self.seed_pump_state;
        }
        let settings = SettingsStore::new(state, self.state_path);
        let sessions = SessionCoordinator::new(transport, cfg.session.acquire_timeout);

        let autosense = AutosenseEngine::new(cfg.autosense.clone());
        let ctx = PumpContext::new(cfg, clock, sessions, stores, sinks, settings);
        Ok(DeviceManager {
            ctx,
            poller: PumpPoller::new(),
            bolus: BolusEnactor::new(),
            temp_basal: TempBasalEnactor::new(),
            autosense,
            sentry: SentryHandler::new(),
            cgm_heartbeat: AtomicBool::new(self.cgm_heartbeat),
        })
    }
}

/// Chainable setters that do not affect type-state.
impl<T, S> DeviceManagerBuilder<T, S> {
    pub fn with_config(mut self, cfg: EngineCfg) -> Self {
        self.cfg = Some(cfg);
        self
    }
    /// Provide a custom clock implementation; defaults to `SystemClock` when not provided.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
    pub fn with_notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(sink);
        self
    }
    pub fn with_care_log(mut self, log: Arc<dyn CareLog>) -> Self {
        self.care_log = Some(log);
        self
    }
    pub fn with_loop_trigger(mut self, trigger: Arc<dyn LoopTrigger>) -> Self {
        self.loop_trigger = Some(trigger);
        self
    }
    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }
    /// Start from a previously persisted record.
    pub fn with_state(mut self, state: PersistedState) -> Self {
        self.state = Some(state);
        self
    }
    /// Write the record here after every change.
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }
    /// Identity used only when the persisted record has none.
    pub fn with_pump_identity(mut self, identity: PumpIdentity) -> Self {
        self.seed_identity = Some(identity);
        self
    }
    /// Pump time zone and model used only when the persisted record has none.
    pub fn with_pump_state(mut self, state: PumpState) -> Self {
        self.seed_pump_state = Some(state);
        self
    }
    pub fn with_cgm_heartbeat(mut self, provides: bool) -> Self {
        self.cgm_heartbeat = provides;
        self
    }
}

// Setters that advance type-state
impl<S> DeviceManagerBuilder<Missing, S> {
    pub fn with_transport(self, transport: Arc<dyn PumpTransport>) -> DeviceManagerBuilder<Set, S> {
        DeviceManagerBuilder {
            transport: Some(transport),
            stores: self.stores,
            cfg: self.cfg,
            clock: self.clock,
            notifications: self.notifications,
            care_log: self.care_log,
            loop_trigger: self.loop_trigger,
            uploader: self.uploader,
            state: self.state,
            state_path: self.state_path,
            seed_identity: self.seed_identity,
            seed_pump_state: self.seed_pump_state,
            cgm_heartbeat: self.cgm_heartbeat,
            _t: PhantomData,
            _s: PhantomData,
        }
    }
}

impl<T> DeviceManagerBuilder<T, Missing> {
    pub fn with_stores(
        self,
        dose: Arc<dyn DoseStore>,
        glucose: Arc<dyn GlucoseStore>,
        carb: Arc<dyn CarbStore>,
    ) -> DeviceManagerBuilder<T, Set> {
        DeviceManagerBuilder {
            transport: self.transport,
            stores: Some(Stores {
                dose,
                glucose,
                carb,
            }),
            cfg: self.cfg,
            clock: self.clock,
            notifications: self.notifications,
            care_log: self.care_log,
            loop_trigger: self.loop_trigger,
            uploader: self.uploader,
            state: self.state,
            state_path: self.state_path,
            seed_identity: self.seed_identity,
            seed_pump_state: self.seed_pump_state,
            cgm_heartbeat: self.cgm_heartbeat,
            _t: PhantomData,
            _s: PhantomData,
        }
    }
}

impl DeviceManagerBuilder<Set, Set> {
    /// Build with all required pieces present.
    pub fn build(self) -> Result<DeviceManager> {
        self.try_build()
    }
}
