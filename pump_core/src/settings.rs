//! Shared persisted state with write-through to disk.

use crate::error::{PumpError, PumpResult};
use pump_config::{
    AutosenseState, DeviceState, PersistedState, PumpIdentity, PumpState, ScheduleOverride,
};
use pump_traits::DeviceId;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
pub struct SettingsStore {
    state: Mutex<PersistedState>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn new(state: PersistedState, path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(state),
            path,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(PersistedState::default(), None)
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        // State is plain data; a panic mid-update cannot leave it half-written in a harmful way.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> PersistedState {
        self.lock().clone()
    }

    /// Mutate and persist. The in-memory value stays updated even if the write fails.
    pub fn update<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> PumpResult<R> {
        let (out, copy) = {
            let mut s = self.lock();
            let out = f(&mut s);
            (out, s.clone())
        };
        if let Some(path) = &self.path {
            pump_config::save_state(path, &copy).map_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "persisting state failed");
                PumpError::Persistence(e.to_string())
            })?;
        }
        Ok(out)
    }

    pub fn pump_identity(&self) -> Option<PumpIdentity> {
        self.lock().pump_identity.clone()
    }

    pub fn pump_state(&self) -> PumpState {
        self.lock().pump_state.clone().unwrap_or_default()
    }

    pub fn device_state(&self, device: &DeviceId) -> DeviceState {
        self.lock().devices.get(device).copied().unwrap_or_default()
    }

    pub fn set_device_state(&self, device: &DeviceId, state: DeviceState) -> PumpResult<()> {
        self.update(|s| {
            s.devices.insert(device.clone(), state);
        })
    }

    pub fn autosense(&self) -> AutosenseState {
        self.lock().autosense
    }

    pub fn active_override(&self) -> Option<ScheduleOverride> {
        self.lock().active_override.clone()
    }
}
