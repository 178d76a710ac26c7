//! Test and helper mocks for pump_core
//!
//! In-memory stores and recording sinks. The CLI runs on these too, so they
//! keep enough behavior to be useful outside tests: reservoir continuity,
//! history query windows and dose records.

use chrono::{DateTime, Utc};
use pump_traits::{
    CarbStore, CarbValue, CareEvent, CareLog, Clock, DoseRecord, DoseStatus, DoseStore,
    GlucoseEffect, GlucoseEffectVelocity, GlucoseSample, GlucoseStore, InsulinValue,
    LoopTrigger, NotificationSink, PumpEvent, PumpEventKind, PumpModel, ReservoirSample,
    ReservoirUpdate, StoreError, Treatment, UploadError, Uploader,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Gap between two reservoir readings beyond which doses may have been missed.
const MAX_CONTINUOUS_GAP: chrono::Duration = chrono::Duration::minutes(30);
/// Overlap kept when asking the pump for history again.
const HISTORY_OVERLAP: chrono::Duration = chrono::Duration::minutes(5);
/// History window used before any event has been stored.
const HISTORY_DEFAULT_LOOKBACK: chrono::Duration = chrono::Duration::hours(24);

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ── Dose store ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct DoseData {
    reservoir: Vec<ReservoirSample>,
    events: Vec<PumpEvent>,
    model: Option<PumpModel>,
    records: Vec<DoseRecord>,
    last_added_events: Option<DateTime<Utc>>,
}

pub struct InMemoryDoseStore {
    clock: Arc<dyn Clock>,
    data: Mutex<DoseData>,
    unavailable: AtomicBool,
}

impl std::fmt::Debug for InMemoryDoseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDoseStore")
            .field("data", &*guard(&self.data))
            .finish_non_exhaustive()
    }
}

impl InMemoryDoseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            data: Mutex::new(DoseData::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every fallible call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("dose store".into()));
        }
        Ok(())
    }

    pub fn reservoir_values(&self) -> Vec<ReservoirSample> {
        guard(&self.data).reservoir.clone()
    }

    pub fn pump_events(&self) -> Vec<PumpEvent> {
        guard(&self.data).events.clone()
    }

    pub fn records(&self) -> Vec<DoseRecord> {
        guard(&self.data).records.clone()
    }

    pub fn confirmed(&self) -> Vec<DoseRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.status == DoseStatus::Confirmed)
            .collect()
    }
}

impl DoseStore for InMemoryDoseStore {
    fn add_reservoir_value(
        &self,
        units: f64,
        at: DateTime<Utc>,
    ) -> Result<ReservoirUpdate, StoreError> {
        self.check()?;
        if !units.is_finite() {
            return Err(StoreError::Invalid(format!("reservoir volume {units}")));
        }
        let mut data = guard(&self.data);
        let previous = data.reservoir.last().copied();
        let new = ReservoirSample { units, at };
        data.reservoir.push(new);
        let continuous = previous.is_some_and(|p| at >= p.at && at - p.at <= MAX_CONTINUOUS_GAP);
        Ok(ReservoirUpdate {
            new,
            previous,
            continuous,
        })
    }

    fn last_reservoir_value(&self) -> Option<ReservoirSample> {
        guard(&self.data).reservoir.last().copied()
    }

    fn last_reservoir_volume_drop(&self) -> f64 {
        let data = guard(&self.data);
        match data.reservoir.as_slice() {
            [.., prev, last] => prev.units - last.units,
            _ => 0.0,
        }
    }

    fn pump_event_query_after(&self) -> DateTime<Utc> {
        let data = guard(&self.data);
        data.events.iter().map(|e| e.date).max().map_or_else(
            || self.clock.now() - HISTORY_DEFAULT_LOOKBACK,
            |newest| newest - HISTORY_OVERLAP,
        )
    }

    fn last_added_pump_events(&self) -> Option<DateTime<Utc>> {
        guard(&self.data).last_added_events
    }

    fn add_pump_events(&self, events: &[PumpEvent], model: &PumpModel) -> Result<(), StoreError> {
        self.check()?;
        let now = self.clock.now();
        let mut data = guard(&self.data);
        for e in events {
            if !data.events.contains(e) {
                data.events.push(e.clone());
            }
        }
        data.events.sort_by_key(|e| e.date);
        data.model = Some(model.clone());
        data.last_added_events = Some(now);
        Ok(())
    }

    fn record_dose(&self, record: DoseRecord) -> Result<(), StoreError> {
        self.check()?;
        guard(&self.data).records.push(record);
        Ok(())
    }

    fn insulin_effects(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GlucoseEffect>, StoreError> {
        self.check()?;
        // Flat effect per delivered bolus; enough for wiring, not for dosing math.
        Ok(guard(&self.data)
            .events
            .iter()
            .filter(|e| e.date >= start && e.date <= end)
            .filter_map(|e| match e.kind {
                PumpEventKind::Bolus { units } => Some(GlucoseEffect {
                    at: e.date,
                    mg_dl: -40.0 * units,
                }),
                _ => None,
            })
            .collect())
    }

    fn insulin_on_board(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<InsulinValue>, StoreError> {
        self.check()?;
        Ok(guard(&self.data)
            .records
            .iter()
            .filter(|r| r.status == DoseStatus::Confirmed)
            .filter(|r| r.entry.start >= start && r.entry.start <= end)
            .map(|r| InsulinValue {
                at: r.entry.start,
                units: r.entry.value,
            })
            .collect())
    }

    fn reset_pump_data(&self) {
        let mut data = guard(&self.data);
        data.reservoir.clear();
        data.events.clear();
        data.model = None;
        data.last_added_events = None;
    }
}

// ── Glucose store ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryGlucoseStore {
    samples: Mutex<Vec<(GlucoseSample, Option<String>)>>,
    unavailable: AtomicBool,
}

impl InMemoryGlucoseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("glucose store".into()));
        }
        Ok(())
    }

    pub fn all(&self) -> Vec<GlucoseSample> {
        guard(&self.samples).iter().map(|(s, _)| *s).collect()
    }

    pub fn from_source(&self, source: &str) -> Vec<GlucoseSample> {
        guard(&self.samples)
            .iter()
            .filter(|(_, src)| src.as_deref() == Some(source))
            .map(|(s, _)| *s)
            .collect()
    }
}

impl GlucoseStore for InMemoryGlucoseStore {
    fn add_glucose(
        &self,
        samples: &[GlucoseSample],
        source: Option<&str>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut all = guard(&self.samples);
        for s in samples {
            if !s.mg_dl.is_finite() {
                return Err(StoreError::Invalid(format!("glucose {}", s.mg_dl)));
            }
            if all.iter().any(|(e, _)| e.at == s.at) {
                continue;
            }
            all.push((*s, source.map(str::to_string)));
        }
        all.sort_by_key(|(s, _)| s.at);
        Ok(())
    }

    fn glucose_samples(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GlucoseSample>, StoreError> {
        self.check()?;
        Ok(guard(&self.samples)
            .iter()
            .map(|(s, _)| *s)
            .filter(|s| s.at >= start && s.at <= end)
            .collect())
    }

    /// Observed rate of change between consecutive samples, with the insulin
    /// effect in each interval added back.
    fn counteraction_effects(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        insulin_effects: &[GlucoseEffect],
    ) -> Result<Vec<GlucoseEffectVelocity>, StoreError> {
        let samples = self.glucose_samples(start, end)?;
        Ok(samples
            .windows(2)
            .filter_map(|w| {
                let minutes = (w[1].at - w[0].at).num_seconds() as f64 / 60.0;
                if minutes <= 0.0 {
                    return None;
                }
                let insulin: f64 = insulin_effects
                    .iter()
                    .filter(|e| e.at > w[0].at && e.at <= w[1].at)
                    .map(|e| e.mg_dl)
                    .sum();
                Some(GlucoseEffectVelocity {
                    start: w[0].at,
                    end: w[1].at,
                    mg_dl_per_min: (w[1].mg_dl - w[0].mg_dl - insulin) / minutes,
                })
            })
            .collect())
    }
}

// ── Carb store ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryCarbStore {
    entries: Mutex<Vec<CarbValue>>,
}

impl InMemoryCarbStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, value: CarbValue) {
        guard(&self.entries).push(value);
    }
}

impl CarbStore for InMemoryCarbStore {
    fn carbs_on_board(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _velocities: Option<&[GlucoseEffectVelocity]>,
    ) -> Result<Vec<CarbValue>, StoreError> {
        Ok(guard(&self.entries)
            .iter()
            .filter(|c| c.at >= start && c.at <= end)
            .copied()
            .collect())
    }

    fn carb_effects(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _velocities: Option<&[GlucoseEffectVelocity]>,
    ) -> Result<Vec<GlucoseEffect>, StoreError> {
        Ok(self
            .carbs_on_board(start, end, None)?
            .into_iter()
            .map(|c| GlucoseEffect {
                at: c.at,
                mg_dl: 4.0 * c.grams,
            })
            .collect())
    }
}

// ── Sinks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    BatteryLow,
    ReservoirLow {
        units: f64,
        time_left: Option<Duration>,
    },
    ReservoirEmpty,
    BolusFailed {
        units: f64,
        at: DateTime<Utc>,
        error: String,
    },
}

#[derive(Debug, Default)]
pub struct RecordingNotifications {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        guard(&self.sent).clone()
    }

    pub fn bolus_failures(&self) -> usize {
        self.sent()
            .iter()
            .filter(|n| matches!(n, Notification::BolusFailed { .. }))
            .count()
    }
}

impl NotificationSink for RecordingNotifications {
    fn pump_battery_low(&self) {
        guard(&self.sent).push(Notification::BatteryLow);
    }

    fn reservoir_low(&self, units: f64, time_left: Option<Duration>) {
        guard(&self.sent).push(Notification::ReservoirLow { units, time_left });
    }

    fn reservoir_empty(&self) {
        guard(&self.sent).push(Notification::ReservoirEmpty);
    }

    fn bolus_failed(&self, units: f64, at: DateTime<Utc>, error: &str) {
        guard(&self.sent).push(Notification::BolusFailed {
            units,
            at,
            error: error.to_string(),
        });
    }
}

#[derive(Debug, Default)]
pub struct RecordingCareLog {
    events: Mutex<Vec<CareEvent>>,
}

impl RecordingCareLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CareEvent> {
        guard(&self.events).clone()
    }
}

impl CareLog for RecordingCareLog {
    fn record(&self, event: CareEvent) {
        guard(&self.events).push(event);
    }
}

#[derive(Debug, Default)]
pub struct CountingLoopTrigger {
    count: AtomicUsize,
}

impl CountingLoopTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl LoopTrigger for CountingLoopTrigger {
    fn request_loop(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct RecordingUploader {
    uploaded: Mutex<Vec<Treatment>>,
    failing: AtomicBool,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn uploaded(&self) -> Vec<Treatment> {
        guard(&self.uploaded).clone()
    }
}

impl Uploader for RecordingUploader {
    fn upload(&self, treatments: &[Treatment]) -> Result<Vec<String>, UploadError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UploadError::Failed("remote unavailable".into()));
        }
        guard(&self.uploaded).extend_from_slice(treatments);
        Ok(treatments
            .iter()
            .map(|_| uuid::Uuid::new_v4().to_string())
            .collect())
    }
}
