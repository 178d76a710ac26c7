//! Background event dispatch.
//!
//! Spawns one thread that owns the receiving end of an event channel and
//! drives the `DeviceManager` from it: timer ticks, CGM data, sentry packets
//! and state changes reported by the radio layer. Sentry reservoir readings
//! are held back for the configured delay before they are stored.
//!
//! The thread is shut down and joined when the `Dispatcher` is dropped.
use crate::manager::DeviceManager;
use crate::sentry::{PendingReservoir, SentryAction};
use crossbeam_channel as xch;
use pump_config::{DeviceState, PumpState};
use pump_traits::{DeviceId, GlucoseSample, SentryStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Longest the loop sleeps when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    TimerTick,
    CgmUpdated(Vec<GlucoseSample>),
    SentryStatus { device: DeviceId, status: SentryStatus },
    TriggerPumpRead,
    DeviceStateChanged { device: DeviceId, state: DeviceState },
    PumpStateChanged(PumpState),
    AutosenseTick,
    Shutdown,
}

pub struct Dispatcher {
    tx: xch::Sender<DeviceEvent>,
    handled: Arc<AtomicU64>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handled", &self.handled())
            .finish_non_exhaustive()
    }
}

struct Worker {
    manager: Arc<DeviceManager>,
    delay: Duration,
    pending: Vec<(Instant, PendingReservoir)>,
}

impl Worker {
    fn handle(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::TimerTick => self.assert_current(),
            DeviceEvent::CgmUpdated(samples) => {
                if let Err(e) = self.manager.add_glucose(&samples, Some("cgm")) {
                    tracing::warn!(error = %e, "could not store CGM samples");
                }
                self.assert_current();
            }
            DeviceEvent::SentryStatus { device, status } => {
                match self.manager.handle_sentry_status(&device, status) {
                    SentryAction::ScheduleReservoir(p) => {
                        self.pending.push((Instant::now() + self.delay, p));
                    }
                    SentryAction::SyncClock { drift_secs } => {
                        tracing::info!(drift_secs, "syncing pump clock after sentry packet");
                        if let Err(e) = self.manager.sync_pump_clock() {
                            tracing::warn!(error = %e, "pump clock sync failed");
                        }
                    }
                    SentryAction::Duplicate | SentryAction::UninterpretableDate => {}
                }
            }
            DeviceEvent::TriggerPumpRead => {
                if let Err(e) = self.manager.trigger_pump_data_read() {
                    tracing::warn!(error = %e, "forced pump read failed");
                }
            }
            DeviceEvent::DeviceStateChanged { device, state } => {
                if let Err(e) = self.manager.set_device_state(&device, state) {
                    tracing::warn!(error = %e, "could not persist device state");
                }
            }
            DeviceEvent::PumpStateChanged(state) => {
                if let Err(e) = self.manager.set_pump_state(state) {
                    tracing::warn!(error = %e, "could not persist pump state");
                }
            }
            DeviceEvent::AutosenseTick => match self.manager.run_autosense() {
                Ok(outcome) => tracing::debug!(?outcome, "autosense tick"),
                Err(e) => tracing::warn!(error = %e, "autosense run failed"),
            },
            DeviceEvent::Shutdown => {}
        }
    }

    fn assert_current(&self) {
        match self.manager.assert_current_pump_data() {
            Ok(report) => tracing::trace!(?report, "pump data check"),
            Err(e) => tracing::warn!(error = %e, "pump data check failed"),
        }
    }

    /// Apply delayed reservoir readings whose time has come (all of them when `flush`).
    fn run_due(&mut self, flush: bool) {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(at, _)| flush || *at <= now);
        self.pending = later;
        for (_, p) in due {
            if let Err(e) = self.manager.update_reservoir_volume(p) {
                tracing::warn!(error = %e, "delayed reservoir update failed");
            }
        }
    }

    fn next_wait(&self) -> Duration {
        let now = Instant::now();
        self.pending
            .iter()
            .map(|(at, _)| at.saturating_duration_since(now))
            .min()
            .unwrap_or(IDLE_WAIT)
    }
}

impl Dispatcher {
    pub fn spawn(manager: Arc<DeviceManager>) -> Self {
        let (tx, rx) = xch::unbounded::<DeviceEvent>();
        let handled = Arc::new(AtomicU64::new(0));
        let handled_clone = handled.clone();
        let delay = manager.context().cfg.freshness.sentry_reservoir_delay;
        let mut worker = Worker {
            manager,
            delay,
            pending: Vec::new(),
        };

        let join_handle = std::thread::spawn(move || {
            loop {
                match rx.recv_timeout(worker.next_wait()) {
                    Ok(DeviceEvent::Shutdown) | Err(xch::RecvTimeoutError::Disconnected) => {
                        tracing::debug!("dispatcher received shutdown signal");
                        break;
                    }
                    Ok(event) => {
                        worker.handle(event);
                        handled_clone.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(xch::RecvTimeoutError::Timeout) => {}
                }
                worker.run_due(false);
            }
            worker.run_due(true);
            tracing::trace!("dispatcher thread exiting cleanly");
        });

        Self {
            tx,
            handled,
            join_handle: Some(join_handle),
        }
    }

    pub fn sender(&self) -> xch::Sender<DeviceEvent> {
        self.tx.clone()
    }

    /// Returns false once the worker has stopped.
    pub fn send(&self, event: DeviceEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Events processed so far (shutdown excluded).
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::SeqCst)
    }

    /// Process everything already queued, apply pending readings and stop.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(DeviceEvent::Shutdown);
        if let Some(handle) = self.join_handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("dispatcher thread panicked during shutdown");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
