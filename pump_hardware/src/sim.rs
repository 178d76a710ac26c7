//! In-process pump and radio link with scripted fault injection.
//!
//! `SimulatedPump` is a cloneable handle onto shared pump state so a test can
//! keep one copy for inspection while the engine drives another through
//! `SimulatedTransport`.

use crate::error::{HwError, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use pump_traits::{
    BasalScheduleEntry, BatteryIndicator, Clock, DeviceId, PumpCommand, PumpEventKind, PumpModel,
    PumpResponse, PumpSession, PumpStatus, PumpTransport, RawPumpEvent, RemainingInsulin,
    SensorReading, SentryStatus, TempBasalAck, TransportError, TuneResult,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const LOW_BATTERY_VOLTS: f64 = 1.2;

#[derive(Debug, Clone)]
struct Fault {
    error: TransportError,
    /// The command takes effect on the pump even though the caller sees an error.
    applied: bool,
}

#[derive(Debug)]
struct SimState {
    pump_id: String,
    model: PumpModel,
    utc_offset: FixedOffset,
    clock_drift: chrono::Duration,
    reservoir: f64,
    battery_volts: f64,
    suspended: bool,
    bolusing: bool,
    history: Vec<RawPumpEvent>,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    commands: Vec<&'static str>,
    delivered_boluses: Vec<f64>,
    temp_basal: Option<(f64, Duration)>,
    basal_schedule: Vec<BasalScheduleEntry>,
    best_frequency: f64,
    sensor_glucose: Option<u16>,
}

#[derive(Clone)]
pub struct SimulatedPump {
    state: Arc<Mutex<SimState>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SimulatedPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedPump").finish_non_exhaustive()
    }
}

impl SimulatedPump {
    pub fn new(pump_id: &str, model: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        if pump_id.chars().count() != 6 {
            return Err(HwError::InvalidPumpId(pump_id.to_string()));
        }
        Ok(Self {
            state: Arc::new(Mutex::new(SimState {
                pump_id: pump_id.to_string(),
                model: PumpModel::new(model),
                utc_offset: Utc.fix(),
                clock_drift: chrono::Duration::zero(),
                reservoir: 150.0,
                battery_volts: 1.5,
                suspended: false,
                bolusing: false,
                history: Vec::new(),
                faults: HashMap::new(),
                commands: Vec::new(),
                delivered_boluses: Vec::new(),
                temp_basal: None,
                basal_schedule: Vec::new(),
                best_frequency: 916.55,
                sensor_glucose: None,
            })),
            clock,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state.lock().map_err(|_| HwError::Poisoned)
    }

    fn with<T: Default>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        match self.lock() {
            Ok(mut s) => f(&mut s),
            Err(_) => T::default(),
        }
    }

    pub fn set_reservoir(&self, units: f64) {
        self.with(|s| s.reservoir = units);
    }

    pub fn set_battery_volts(&self, volts: f64) {
        self.with(|s| s.battery_volts = volts);
    }

    /// Pump clock runs ahead (positive) or behind (negative) of the host clock.
    pub fn set_clock_drift(&self, drift: chrono::Duration) {
        self.with(|s| s.clock_drift = drift);
    }

    pub fn set_utc_offset_secs(&self, secs: i32) {
        self.with(|s| {
            if let Some(off) = FixedOffset::east_opt(secs) {
                s.utc_offset = off;
            }
        });
    }

    pub fn set_bolusing(&self, bolusing: bool) {
        self.with(|s| s.bolusing = bolusing);
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.with(|s| s.suspended = suspended);
    }

    pub fn set_sensor_glucose(&self, mg_dl: Option<u16>) {
        self.with(|s| s.sensor_glucose = mg_dl);
    }

    pub fn set_best_frequency(&self, mhz: f64) {
        self.with(|s| s.best_frequency = mhz);
    }

    pub fn push_history(&self, event: RawPumpEvent) {
        self.with(|s| s.history.push(event));
    }

    /// Fail the next `command` (by `PumpCommand::name`) with `error`; the pump state is untouched.
    pub fn fail_next(&self, command: &'static str, error: TransportError) {
        self.push_fault(command, error, false);
    }

    /// Fail the next `command` with `error` after it has taken effect (lost acknowledgement).
    pub fn fail_next_after_effect(&self, command: &'static str, error: TransportError) {
        self.push_fault(command, error, true);
    }

    fn push_fault(&self, command: &'static str, error: TransportError, applied: bool) {
        self.with(|s| {
            s.faults
                .entry(command)
                .or_default()
                .push_back(Fault { error, applied })
        });
    }

    pub fn reservoir(&self) -> f64 {
        self.with(|s| s.reservoir)
    }

    pub fn pump_clock(&self) -> NaiveDateTime {
        let now = self.clock.now();
        self.with(|s| s.pump_naive(now))
    }

    pub fn delivered_boluses(&self) -> Vec<f64> {
        self.with(|s| s.delivered_boluses.clone())
    }

    pub fn temp_basal(&self) -> Option<(f64, Duration)> {
        self.with(|s| s.temp_basal)
    }

    pub fn basal_schedule(&self) -> Vec<BasalScheduleEntry> {
        self.with(|s| s.basal_schedule.clone())
    }

    /// Names of every command the pump received, in order.
    pub fn commands(&self) -> Vec<&'static str> {
        self.with(|s| s.commands.clone())
    }

    /// Status packet as the pump would broadcast it while idle.
    pub fn sentry_status(&self) -> Option<SentryStatus> {
        let now = self.clock.now();
        self.lock().ok().map(|s| {
            let pump_clock = s.pump_naive(now);
            let sensor = match s.sensor_glucose {
                Some(mg_dl) => SensorReading::Active { mg_dl },
                None => SensorReading::Off,
            };
            let percent = ((s.battery_volts - 1.26) / (1.58 - 1.26) * 100.0).clamp(0.0, 100.0);
            SentryStatus {
                pump_clock,
                glucose_clock: s.sensor_glucose.map(|_| pump_clock),
                battery_percent: percent.round() as u8,
                iob: 0.0,
                reservoir_units: s.reservoir,
                reservoir_minutes: (s.reservoir * 60.0) as u32,
                sensor,
            }
        })
    }

    fn execute(&self, command: PumpCommand) -> std::result::Result<PumpResponse, TransportError> {
        let now = self.clock.now();
        let mut s = self.lock()?;
        let name = command.name();
        s.commands.push(name);

        match s.faults.get_mut(name).and_then(VecDeque::pop_front) {
            Some(Fault {
                error,
                applied: false,
            }) => {
                tracing::debug!(command = name, %error, "injected fault");
                Err(error)
            }
            Some(Fault {
                error,
                applied: true,
            }) => {
                let _ = s.apply(command, now);
                tracing::debug!(command = name, %error, "injected fault after effect");
                Err(error)
            }
            None => s.apply(command, now),
        }
    }
}

impl SimState {
    fn pump_naive(&self, now: DateTime<Utc>) -> NaiveDateTime {
        (now + self.clock_drift)
            .with_timezone(&self.utc_offset)
            .naive_local()
    }

    fn event(&mut self, now: DateTime<Utc>, kind: PumpEventKind) {
        let pump_time = self.pump_naive(now);
        self.history.push(RawPumpEvent { pump_time, kind });
    }

    fn apply(
        &mut self,
        command: PumpCommand,
        now: DateTime<Utc>,
    ) -> std::result::Result<PumpResponse, TransportError> {
        use pump_traits::FailureCause;
        match command {
            PumpCommand::ReadStatus => Ok(PumpResponse::Status(PumpStatus {
                clock: self.pump_naive(now),
                pump_id: self.pump_id.clone(),
                reservoir: self.reservoir,
                battery_volts: self.battery_volts,
                battery: if self.battery_volts < LOW_BATTERY_VOLTS {
                    BatteryIndicator::Low
                } else {
                    BatteryIndicator::Normal
                },
                suspended: self.suspended,
                bolusing: self.bolusing,
                model: Some(self.model.clone()),
            })),
            PumpCommand::ReadRemainingInsulin => Ok(PumpResponse::RemainingInsulin(
                RemainingInsulin {
                    units: self.reservoir,
                    clock: self.pump_naive(now),
                },
            )),
            PumpCommand::ReadTime => Ok(PumpResponse::Time(self.pump_naive(now))),
            PumpCommand::SetTime(components) => {
                let target = self
                    .utc_offset
                    .from_local_datetime(&components)
                    .single()
                    .map(|d| d.with_timezone(&Utc))
                    .ok_or_else(|| {
                        TransportError::Certain(FailureCause::Rejected(
                            "invalid clock components".into(),
                        ))
                    })?;
                self.clock_drift = target - now;
                Ok(PumpResponse::Ack)
            }
            PumpCommand::ReadHistory { since } => {
                let offset = self.utc_offset;
                let events = self
                    .history
                    .iter()
                    .filter(|e| {
                        offset
                            .from_local_datetime(&e.pump_time)
                            .single()
                            .is_some_and(|d| d.with_timezone(&Utc) >= since)
                    })
                    .cloned()
                    .collect();
                Ok(PumpResponse::History {
                    events,
                    model: self.model.clone(),
                })
            }
            PumpCommand::Bolus { units } => {
                if self.bolusing {
                    return Err(TransportError::Certain(FailureCause::BolusInProgress));
                }
                if self.suspended {
                    return Err(TransportError::Certain(FailureCause::Suspended));
                }
                if units > self.reservoir {
                    return Err(TransportError::Certain(FailureCause::Rejected(
                        "insufficient reservoir".into(),
                    )));
                }
                self.reservoir -= units;
                self.delivered_boluses.push(units);
                self.event(now, PumpEventKind::Bolus { units });
                Ok(PumpResponse::Ack)
            }
            PumpCommand::TempBasal { rate, duration } => {
                if self.bolusing {
                    return Err(TransportError::Certain(FailureCause::BolusInProgress));
                }
                if self.suspended {
                    return Err(TransportError::Certain(FailureCause::Suspended));
                }
                self.temp_basal = Some((rate, duration));
                self.event(now, PumpEventKind::TempBasal { rate, duration });
                Ok(PumpResponse::TempBasal(TempBasalAck {
                    rate,
                    time_remaining: duration,
                }))
            }
            PumpCommand::TuneRadio { .. } => Ok(PumpResponse::Tuned(TuneResult {
                best_frequency: self.best_frequency,
            })),
            PumpCommand::SetBasalSchedule(entries) => {
                self.basal_schedule = entries;
                Ok(PumpResponse::Ack)
            }
        }
    }
}

struct SimSession {
    device: DeviceId,
    pump: SimulatedPump,
}

impl PumpSession for SimSession {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    fn send(&mut self, command: PumpCommand) -> std::result::Result<PumpResponse, TransportError> {
        tracing::trace!(device = %self.device, command = command.name(), "sim send");
        self.pump.execute(command)
    }
}

/// Radio link manager over one simulated pump with any number of bridge devices.
#[derive(Debug)]
pub struct SimulatedTransport {
    pump: SimulatedPump,
    /// Priority order; connected flag per device.
    devices: Mutex<Vec<(DeviceId, bool)>>,
    sessions_opened: AtomicUsize,
    deprioritized: Mutex<Vec<DeviceId>>,
}

impl SimulatedTransport {
    pub fn new(pump: SimulatedPump, devices: &[&str]) -> Self {
        Self {
            pump,
            devices: Mutex::new(devices.iter().map(|d| (DeviceId::new(*d), true)).collect()),
            sessions_opened: AtomicUsize::new(0),
            deprioritized: Mutex::new(Vec::new()),
        }
    }

    pub fn pump(&self) -> &SimulatedPump {
        &self.pump
    }

    pub fn set_connected(&self, device: &str, connected: bool) -> Result<()> {
        let mut devices = self.devices.lock().map_err(|_| HwError::Poisoned)?;
        let entry = devices
            .iter_mut()
            .find(|(id, _)| id.0 == device)
            .ok_or_else(|| HwError::UnknownDevice(device.to_string()))?;
        entry.1 = connected;
        Ok(())
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn deprioritized(&self) -> Vec<DeviceId> {
        self.deprioritized
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn priority_order(&self) -> Vec<DeviceId> {
        self.devices
            .lock()
            .map(|d| d.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }
}

impl PumpTransport for SimulatedTransport {
    fn first_connected(&self) -> Option<DeviceId> {
        let devices = self.devices.lock().ok()?;
        devices
            .iter()
            .find(|(_, connected)| *connected)
            .map(|(id, _)| id.clone())
    }

    fn open(
        &self,
        device: &DeviceId,
    ) -> std::result::Result<Box<dyn PumpSession + '_>, TransportError> {
        let connected = {
            let devices = self.devices.lock().map_err(|_| HwError::Poisoned)?;
            devices
                .iter()
                .find(|(id, _)| id == device)
                .map(|(_, c)| *c)
                .ok_or_else(|| HwError::UnknownDevice(device.0.clone()))?
        };
        if !connected {
            return Err(TransportError::NotConnected(device.clone()));
        }
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimSession {
            device: device.clone(),
            pump: self.pump.clone(),
        }))
    }

    fn deprioritize(&self, device: &DeviceId) {
        if let Ok(mut devices) = self.devices.lock()
            && let Some(pos) = devices.iter().position(|(id, _)| id == device)
        {
            let entry = devices.remove(pos);
            devices.push(entry);
        }
        if let Ok(mut d) = self.deprioritized.lock() {
            d.push(device.clone());
        }
    }
}
