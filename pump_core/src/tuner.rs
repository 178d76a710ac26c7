//! Radio troubleshooting after failed sessions.
//!
//! A device that keeps failing is either retuned (at most once per tune
//! tolerance) or pushed to the back of the device priority list.

use crate::clock_sync::unexpected;
use crate::config::TunerCfg;
use crate::context::PumpContext;
use crate::error::PumpResult;
use crate::freshness::span;
use pump_config::DeviceState;
use pump_traits::{DeviceId, PumpCommand, PumpResponse};

#[derive(Debug, Clone, PartialEq)]
pub enum TroubleshootOutcome {
    /// No pump paired; nothing to tune against.
    NotConfigured,
    /// Reservoir data is recent enough that the link is evidently fine.
    RecentData,
    Tuned { frequency: f64 },
    Deprioritized,
}

#[derive(Debug, Clone)]
pub struct RadioTuner {
    cfg: TunerCfg,
}

impl RadioTuner {
    pub fn new(cfg: TunerCfg) -> Self {
        Self { cfg }
    }

    pub fn troubleshoot(&self, ctx: &PumpContext, device: &DeviceId) -> TroubleshootOutcome {
        if ctx.settings.pump_identity().is_none() {
            return TroubleshootOutcome::NotConfigured;
        }
        let now = ctx.now();
        let state = ctx.settings.device_state(device);
        let due = state
            .last_tuned
            .is_none_or(|t| now - t >= span(self.cfg.tune_tolerance));
        if !due {
            ctx.sessions.deprioritize(device);
            return TroubleshootOutcome::Deprioritized;
        }

        let recent = ctx
            .stores
            .dose
            .last_reservoir_value()
            .is_some_and(|r| now - r.at < span(self.cfg.recent_reservoir_window));
        if recent {
            tracing::debug!(%device, "recent reservoir data; skipping tune");
            return TroubleshootOutcome::RecentData;
        }

        match self.tune(ctx, device) {
            Ok(frequency) => TroubleshootOutcome::Tuned { frequency },
            Err(e) => {
                ctx.sessions.deprioritize(device);
                ctx.set_last_error(e);
                TroubleshootOutcome::Deprioritized
            }
        }
    }

    /// Tune `device` now and persist the result.
    pub fn tune(&self, ctx: &PumpContext, device: &DeviceId) -> PumpResult<f64> {
        let current = ctx.settings.device_state(device).last_valid_frequency;
        let result = ctx
            .sessions
            .run_session("Tune pump", device, None, |session| {
                match session.send(PumpCommand::TuneRadio { current })? {
                    PumpResponse::Tuned(r) => Ok(r),
                    other => Err(unexpected("tune_radio", &other)),
                }
            })?;
        tracing::info!(%device, frequency = result.best_frequency, "radio tuned");
        let state = DeviceState {
            last_tuned: Some(ctx.now()),
            last_valid_frequency: Some(result.best_frequency),
        };
        if let Err(e) = ctx.settings.set_device_state(device, state) {
            tracing::warn!(error = %e, "could not persist device state");
        }
        Ok(result.best_frequency)
    }
}
