//! Bolus delivery.
//!
//! One bolus runs at a time. Before delivery the reservoir is re-read when the
//! stored value is stale or suspect, and the pump clock is checked against
//! local time. Delivery attempts then follow the bolus decision table in
//! `hw_error`: retry only the power-on signature, confirm on "bolus already
//! in progress", stop on anything else.

use crate::clock_sync::unexpected;
use crate::context::PumpContext;
use crate::error::{PumpError, PumpResult};
use crate::freshness::span;
use crate::hw_error::{Disposition, bolus_disposition};
use crate::poller::try_begin;
use crate::status::{BolusState, ReservoirCheck};
use chrono::{DateTime, Utc};
use pump_traits::{
    CareEvent, DoseEntry, DoseKind, DoseRecord, DoseStatus, DoseUnit, PumpCommand,
    PumpResponse, PumpSession, Treatment,
};
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;

enum Delivery {
    Confirmed(DoseEntry),
    Failed {
        error: PumpError,
        attempts: u32,
        /// Every attempt hit the retryable signature.
        exhausted: bool,
    },
}

#[derive(Debug, Default)]
pub struct BolusEnactor {
    in_flight: AtomicBool,
    state: Mutex<BolusState>,
}

impl BolusEnactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BolusState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn set_state(&self, state: BolusState) {
        tracing::debug!(?state, "bolus state");
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    /// Why the reservoir must be read before delivering, if it must.
    pub fn reservoir_check(ctx: &PumpContext) -> Option<ReservoirCheck> {
        let cfg = &ctx.cfg.bolus;
        let now = ctx.now();
        let drop = ctx.stores.dose.last_reservoir_volume_drop();
        if drop < 0.0 {
            return Some(ReservoirCheck::NegativeDrop(drop));
        }
        let Some(last) = ctx.stores.dose.last_reservoir_value() else {
            return Some(ReservoirCheck::Missing);
        };
        if now - last.at >= span(cfg.recency_interval) {
            return Some(ReservoirCheck::TooOld(last.at));
        }
        let newest = ctx.last_pump_data_date().unwrap_or(last.at);
        (now - newest >= span(cfg.reservoir_max_age)).then_some(ReservoirCheck::Stale)
    }

    /// Deliver `units` requested at `at`. `quiet` suppresses the failure notification.
    pub fn enact(&self, ctx: &PumpContext, units: f64, at: DateTime<Utc>, quiet: bool) -> PumpResult<()> {
        if !units.is_finite() {
            return Err(PumpError::InvalidData(format!("bolus of {units} U is not a number")));
        }
        if units <= 0.0 {
            return Ok(());
        }
        ctx.require_identity()?;
        let Some(_flight) = try_begin(&self.in_flight) else {
            return Err(PumpError::InvalidData("Bolus already in progress".into()));
        };
        ctx.freshness.require_verified()?;

        let check = Self::reservoir_check(ctx);
        if let Some(check) = &check {
            match check.as_error() {
                Some(e) => tracing::warn!(error = %e, "reservoir check before bolus"),
                None => tracing::info!("reservoir data stale; reading before bolus"),
            }
            self.set_state(BolusState::ReservoirCheck(check.clone()));
        }

        let device = match ctx.sessions.connected_device() {
            Ok(d) => d,
            Err(e) => return Err(self.fail(ctx, units, at, quiet, e, false)),
        };

        // A dose queued ahead of this one may have failed uncertain while we waited.
        let result = ctx.sessions.run_session("Bolus", &device, None, |session| {
            ctx.freshness.require_verified()?;
            self.deliver(ctx, session, units, check.is_some())
        });

        match result {
            Ok(Delivery::Confirmed(entry)) => {
                self.set_state(BolusState::Confirmed(entry));
                ctx.upload(&[Treatment::Dose(entry)]);
                Ok(())
            }
            Ok(Delivery::Failed {
                error,
                attempts,
                exhausted,
            }) => {
                tracing::error!(units, attempts, %error, "bolus failed");
                if exhausted {
                    ctx.tuner.troubleshoot(ctx, &device);
                }
                let uncertain = error.is_uncertain();
                Err(self.fail(ctx, units, at, quiet, error, uncertain))
            }
            // Nothing was sent to the pump yet.
            Err(e) => Err(self.fail(ctx, units, at, quiet, e, false)),
        }
    }

    fn fail(
        &self,
        ctx: &PumpContext,
        units: f64,
        at: DateTime<Utc>,
        quiet: bool,
        error: PumpError,
        uncertain: bool,
    ) -> PumpError {
        if uncertain {
            ctx.freshness.mark_unverified();
            self.set_state(BolusState::FailedUncertain {
                units,
                error: error.clone(),
            });
        } else {
            self.set_state(BolusState::FailedCertain {
                units,
                error: error.clone(),
            });
        }
        ctx.set_last_error(error.clone());
        if !quiet {
            ctx.sinks
                .notifications
                .bolus_failed(units, at, &error.to_string());
        }
        error
    }

    fn refresh_reservoir(ctx: &PumpContext, session: &mut dyn PumpSession) -> PumpResult<()> {
        let remaining = match session.send(PumpCommand::ReadRemainingInsulin)? {
            PumpResponse::RemainingInsulin(r) => r,
            other => return Err(unexpected("read_remaining_insulin", &other)),
        };
        let pump_date = ctx
            .settings
            .pump_state()
            .interpret(remaining.clock)
            .ok_or_else(|| PumpError::InvalidData("pump clock is ambiguous".into()))?;
        let drift = pump_date - ctx.now();
        if drift.abs() > span(ctx.cfg.bolus.max_clock_drift) {
            if let Err(e) = ctx.clock_sync.set_time(ctx, session) {
                tracing::warn!(error = %e, "clock sync after drift check failed");
            }
            return Err(PumpError::PumpClockDrift {
                drift_secs: drift.num_seconds(),
            });
        }
        ctx.stores
            .dose
            .add_reservoir_value(remaining.units, pump_date)?;
        Ok(())
    }

    fn deliver(
        &self,
        ctx: &PumpContext,
        session: &mut dyn PumpSession,
        units: f64,
        check_reservoir: bool,
    ) -> PumpResult<Delivery> {
        if check_reservoir {
            Self::refresh_reservoir(ctx, session)?;
        }

        let start = ctx.now();
        let entry = DoseEntry {
            kind: DoseKind::Bolus,
            start,
            end: start,
            value: units,
            unit: DoseUnit::Units,
        };
        ctx.stores.dose.record_dose(DoseRecord {
            entry,
            status: DoseStatus::Requested,
        })?;

        let max_attempts = ctx.cfg.bolus.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.set_state(BolusState::Delivering { units, attempt });
            let error = match session.send(PumpCommand::Bolus { units }) {
                Ok(PumpResponse::Ack) => return Self::confirm(ctx, entry),
                Ok(other) => unexpected("bolus", &other),
                Err(e) => PumpError::from(e),
            };
            match bolus_disposition(&error) {
                Disposition::AlreadyDelivering => {
                    tracing::info!(units, "pump reports bolus in progress; treating as delivered");
                    ctx.sinks.care_log.record(CareEvent::Note(format!(
                        "bolus of {units} U confirmed from in-progress report"
                    )));
                    return Self::confirm(ctx, entry);
                }
                Disposition::Retry if attempt < max_attempts => {
                    tracing::warn!(attempt, %error, "bolus attempt failed before reaching the pump; retrying");
                    attempt += 1;
                    self.set_state(BolusState::Retrying { units, attempt });
                }
                disposition => {
                    let exhausted = disposition == Disposition::Retry;
                    if let Err(e) = ctx.stores.dose.record_dose(DoseRecord {
                        entry,
                        status: DoseStatus::Failed {
                            certain: !error.is_uncertain(),
                            attempts: attempt,
                            error: error.to_string(),
                        },
                    }) {
                        tracing::warn!(error = %e, "could not record failed bolus");
                    }
                    return Ok(Delivery::Failed {
                        error,
                        attempts: attempt,
                        exhausted,
                    });
                }
            }
        }
    }

    /// The pump has the dose; a store failure here must not turn it into a failed bolus.
    fn confirm(ctx: &PumpContext, entry: DoseEntry) -> PumpResult<Delivery> {
        if let Err(e) = ctx.stores.dose.record_dose(DoseRecord {
            entry,
            status: DoseStatus::Confirmed,
        }) {
            tracing::error!(error = %e, "could not record confirmed bolus");
        }
        Ok(Delivery::Confirmed(entry))
    }
}
