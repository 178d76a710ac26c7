#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use pump_config::{PumpIdentity, PumpState};
use pump_core::mocks::{
    CountingLoopTrigger, InMemoryCarbStore, InMemoryDoseStore, InMemoryGlucoseStore,
    RecordingCareLog, RecordingNotifications, RecordingUploader,
};
use pump_core::{DeviceManager, EngineCfg};
use pump_hardware::{SimulatedPump, SimulatedTransport};
use pump_traits::{Clock, GlucoseSample, ManualClock, PumpModel, PumpRegion};
use std::sync::Arc;

pub const PUMP_ID: &str = "123456";

/// Engine wired to a simulated pump and recording collaborators.
pub struct Rig {
    pub clock: ManualClock,
    pub pump: SimulatedPump,
    pub transport: Arc<SimulatedTransport>,
    pub dose: Arc<InMemoryDoseStore>,
    pub glucose: Arc<InMemoryGlucoseStore>,
    pub carbs: Arc<InMemoryCarbStore>,
    pub notes: Arc<RecordingNotifications>,
    pub care: Arc<RecordingCareLog>,
    pub loops: Arc<CountingLoopTrigger>,
    pub uploads: Arc<RecordingUploader>,
    pub manager: Arc<DeviceManager>,
}

impl Rig {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance_min(&self, minutes: i64) {
        self.clock.advance(chrono::Duration::minutes(minutes));
    }
}

pub fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn identity(model: Option<&str>) -> PumpIdentity {
    PumpIdentity {
        pump_id: PUMP_ID.to_string(),
        region: PumpRegion::NorthAmerica,
        model: model.map(PumpModel::new),
    }
}

pub fn rig() -> Rig {
    rig_with(EngineCfg::default(), "523")
}

pub fn rig_with(cfg: EngineCfg, model: &str) -> Rig {
    rig_with_devices(cfg, model, &["rl-1"])
}

pub fn rig_with_devices(cfg: EngineCfg, model: &str, devices: &[&str]) -> Rig {
    let clock = ManualClock::starting_at(origin());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let pump = SimulatedPump::new(PUMP_ID, model, shared.clone()).unwrap();
    let transport = Arc::new(SimulatedTransport::new(pump.clone(), devices));
    let dose = Arc::new(InMemoryDoseStore::new(shared.clone()));
    let glucose = Arc::new(InMemoryGlucoseStore::new());
    let carbs = Arc::new(InMemoryCarbStore::new());
    let notes = Arc::new(RecordingNotifications::new());
    let care = Arc::new(RecordingCareLog::new());
    let loops = Arc::new(CountingLoopTrigger::new());
    let uploads = Arc::new(RecordingUploader::new());

    let manager = DeviceManager::builder()
        .with_config(cfg)
        .with_clock(shared)
        .with_transport(transport.clone())
        .with_stores(dose.clone(), glucose.clone(), carbs.clone())
        .with_notifications(notes.clone())
        .with_care_log(care.clone())
        .with_loop_trigger(loops.clone())
        .with_uploader(uploads.clone())
        .with_pump_identity(identity(Some(model)))
        .with_pump_state(PumpState::default())
        .build()
        .unwrap();
    let manager = Arc::new(manager);

    Rig {
        clock,
        pump,
        transport,
        dose,
        glucose,
        carbs,
        notes,
        care,
        loops,
        uploads,
        manager,
    }
}

/// Glucose values spaced `step_min` apart, ending at `end`.
pub fn glucose_series(end: DateTime<Utc>, values: &[f64], step_min: i64) -> Vec<GlucoseSample> {
    let n = values.len() as i64;
    values
        .iter()
        .enumerate()
        .map(|(i, v)| GlucoseSample {
            at: end - chrono::Duration::minutes((n - 1 - i as i64) * step_min),
            mg_dl: *v,
            display_only: false,
        })
        .collect()
}
