//! Temporary basal enactment.

use crate::clock_sync::unexpected;
use crate::context::PumpContext;
use crate::error::{PumpError, PumpResult};
use crate::freshness::span;
use crate::hw_error::{Disposition, temp_basal_disposition};
use crate::status::{DoseOutcome, TempBasalState};
use chrono::{DateTime, Utc};
use pump_traits::{
    DoseEntry, DoseKind, DoseRecord, DoseStatus, DoseUnit, PumpCommand, PumpResponse, PumpSession,
    TempBasalAck, Treatment,
};
use std::sync::Mutex;
use std::time::Duration;

/// A temp basal decided by the control loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempBasalRecommendation {
    /// Units per hour.
    pub rate: f64,
    pub duration: Duration,
}

#[derive(Debug, Default)]
pub struct TempBasalEnactor {
    state: Mutex<TempBasalState>,
}

impl TempBasalEnactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TempBasalState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn set_state(&self, state: TempBasalState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    pub fn enact(
        &self,
        ctx: &PumpContext,
        rec: TempBasalRecommendation,
        at: DateTime<Utc>,
    ) -> DoseOutcome {
        tracing::info!(rate = rec.rate, duration_secs = rec.duration.as_secs(), decided_at = %at, "enacting temp basal");
        let outcome = match self.run(ctx, rec) {
            Ok(outcome) => outcome,
            Err(e) => DoseOutcome::FailedCertain(e),
        };
        match &outcome {
            DoseOutcome::Confirmed(entry) => ctx.upload(&[Treatment::Dose(*entry)]),
            DoseOutcome::FailedCertain(e) => ctx.set_last_error(e.clone()),
            DoseOutcome::FailedUncertain(e) => {
                ctx.freshness.mark_unverified();
                ctx.set_last_error(e.clone());
            }
        }
        self.set_state(TempBasalState::Done(outcome.clone()));
        outcome
    }

    fn run(&self, ctx: &PumpContext, rec: TempBasalRecommendation) -> PumpResult<DoseOutcome> {
        if !rec.rate.is_finite() || rec.rate < 0.0 {
            return Err(PumpError::InvalidData(format!(
                "temp basal rate {} U/h is out of range",
                rec.rate
            )));
        }
        ctx.require_identity()?;
        ctx.freshness.require_verified()?;
        let device = ctx.sessions.connected_device()?;
        self.set_state(TempBasalState::Enacting { rate: rec.rate });

        ctx.sessions
            .run_session("Set Temp Basal", &device, None, |session| {
                ctx.freshness.require_verified()?;
                let outcome = match Self::send_with_retries(ctx, session, rec) {
                    Ok(ack) => Self::confirm(ctx, rec, ack),
                    // The pump is busy delivering; nothing changed.
                    Err(e) if e.is_bolus_in_progress() => DoseOutcome::FailedCertain(e),
                    Err(e) if e.is_uncertain() => DoseOutcome::FailedUncertain(e),
                    Err(e) => DoseOutcome::FailedCertain(e),
                };
                Self::piggyback_history(ctx, session);
                Ok(outcome)
            })
    }

    fn send_with_retries(
        ctx: &PumpContext,
        session: &mut dyn PumpSession,
        rec: TempBasalRecommendation,
    ) -> PumpResult<TempBasalAck> {
        let retries = ctx.cfg.temp_basal.retries;
        let mut attempt = 0;
        loop {
            let error = match session.send(PumpCommand::TempBasal {
                rate: rec.rate,
                duration: rec.duration,
            }) {
                Ok(PumpResponse::TempBasal(ack)) => return Ok(ack),
                Ok(other) => unexpected("temp_basal", &other),
                Err(e) => PumpError::from(e),
            };
            if temp_basal_disposition(&error) != Disposition::Retry || attempt >= retries {
                return Err(error);
            }
            attempt += 1;
            tracing::warn!(attempt, %error, "temp basal failed; retrying");
        }
    }

    /// The pump echoes the time remaining; the entry ends then and starts one requested duration earlier.
    fn confirm(ctx: &PumpContext, rec: TempBasalRecommendation, ack: TempBasalAck) -> DoseOutcome {
        let end = ctx.now() + span(ack.time_remaining);
        let entry = DoseEntry {
            kind: DoseKind::TempBasal,
            start: end - span(rec.duration),
            end,
            value: ack.rate,
            unit: DoseUnit::UnitsPerHour,
        };
        if let Err(e) = ctx.stores.dose.record_dose(DoseRecord {
            entry,
            status: DoseStatus::Confirmed,
        }) {
            tracing::error!(error = %e, "could not record temp basal");
        }
        DoseOutcome::Confirmed(entry)
    }

    /// Catch up on history while the session is open, if the last import is old enough.
    fn piggyback_history(ctx: &PumpContext, session: &mut dyn PumpSession) {
        let now = ctx.now();
        let due = ctx
            .stores
            .dose
            .last_added_pump_events()
            .is_none_or(|t| now - t > span(ctx.cfg.temp_basal.history_piggyback_age));
        if !due {
            return;
        }
        match session.send(PumpCommand::ReadTime) {
            Ok(PumpResponse::Time(clock)) => {
                if let Some(pump_date) = ctx.settings.pump_state().interpret(clock) {
                    ctx.clock_sync.check(ctx, session, pump_date);
                }
            }
            Ok(other) => tracing::warn!(error = %unexpected("read_time", &other), "pump time read"),
            Err(e) => {
                tracing::warn!(error = %PumpError::from(e), "pump time read failed");
                return;
            }
        }
        if let Err(e) = ctx.history.fetch(ctx, session) {
            tracing::warn!(error = %e, "history read after temp basal failed");
        }
    }
}
