//! Pump clock drift detection and correction.

use crate::context::PumpContext;
use crate::error::{PumpError, PumpResult};
use crate::freshness::span;
use chrono::{DateTime, Utc};
use pump_traits::{CareEvent, PumpCommand, PumpResponse, PumpSession};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ClockCheck {
    InSync,
    Corrected { drift_secs: i64 },
    /// Correction was attempted and failed; the caller carries on.
    Failed(PumpError),
}

#[derive(Debug, Clone)]
pub struct ClockSync {
    threshold: Duration,
}

impl ClockSync {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    /// Correct the pump clock inside `session` when `pump_date` is past the drift threshold.
    pub fn check(
        &self,
        ctx: &PumpContext,
        session: &mut dyn PumpSession,
        pump_date: DateTime<Utc>,
    ) -> ClockCheck {
        let drift = pump_date - ctx.now();
        if drift.abs() <= span(self.threshold) {
            return ClockCheck::InSync;
        }
        match self.set_time(ctx, session) {
            Ok(()) => ClockCheck::Corrected {
                drift_secs: drift.num_seconds(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "pump clock correction failed");
                ClockCheck::Failed(e)
            }
        }
    }

    /// Write the current local time to the pump.
    pub fn set_time(&self, ctx: &PumpContext, session: &mut dyn PumpSession) -> PumpResult<()> {
        let components = ctx.settings.pump_state().local_components(ctx.now());
        match session.send(PumpCommand::SetTime(components))? {
            PumpResponse::Ack => {
                tracing::info!(%components, "pump clock set");
                ctx.sinks
                    .care_log
                    .record(CareEvent::Note(format!("pump clock set to {components}")));
                Ok(())
            }
            other => Err(unexpected("set_time", &other)),
        }
    }
}

pub(crate) fn unexpected(command: &str, response: &PumpResponse) -> PumpError {
    PumpError::RadioComms {
        certainty: pump_traits::Certainty::Uncertain,
        cause: pump_traits::FailureCause::UnexpectedResponse(format!(
            "{command} answered with {response:?}"
        )),
    }
}
