//! Status polling: keeps reservoir, battery, clock and history current.

use crate::clock_sync::{ClockCheck, unexpected};
use crate::context::PumpContext;
use crate::error::{PumpError, PumpResult};
use crate::status::PollReport;
use chrono::{DateTime, Utc};
use pump_config::InsulinDataSource;
use pump_traits::{
    DeviceStatusReport, PumpCommand, PumpResponse, PumpSession, PumpStatus, ReservoirUpdate,
    Treatment,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// Clears an in-flight flag on drop.
pub(crate) struct FlightGuard<'a>(pub(crate) &'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn try_begin(flag: &AtomicBool) -> Option<FlightGuard<'_>> {
    flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .ok()
        .map(|_| FlightGuard(flag))
}

struct StatusRead {
    status: PumpStatus,
    date: DateTime<Utc>,
    update: ReservoirUpdate,
    history_events: usize,
    clock_corrected: bool,
    /// History succeeded, or the reservoir series alone is good enough.
    loop_ok: bool,
}

#[derive(Debug, Default)]
pub struct PumpPoller {
    in_flight: AtomicBool,
}

impl PumpPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Poll only when data is stale or a read has been forced.
    pub fn assert_current(&self, ctx: &PumpContext) -> PumpResult<PollReport> {
        if !ctx.is_stale() {
            return Ok(PollReport::Fresh);
        }
        self.poll(ctx)
    }

    pub fn poll(&self, ctx: &PumpContext) -> PumpResult<PollReport> {
        let device = ctx.sessions.connected_device().inspect_err(|e| {
            ctx.set_last_error(e.clone());
        })?;
        ctx.require_identity().inspect_err(|e| ctx.set_last_error(e.clone()))?;
        let Some(_flight) = try_begin(&self.in_flight) else {
            tracing::debug!("status poll already running; dropping request");
            return Ok(PollReport::AlreadyRunning);
        };

        let result = ctx
            .sessions
            .run_session("Get Pump Status", &device, None, |session| {
                let read = Self::read_in_session(ctx, session)?;
                // Verify while the slot is held; a dose after this read must not be cleared by it.
                ctx.freshness.poll_completed(true);
                Ok(read)
            });

        match result {
            Ok(read) => {
                ctx.upload(&[Treatment::DeviceStatus(DeviceStatusReport {
                    device: Some(device.to_string()),
                    clock: Some(read.date),
                    pump_id: Some(read.status.pump_id.clone()),
                    reservoir: Some(read.status.reservoir),
                    battery_volts: Some(read.status.battery_volts),
                    suspended: Some(read.status.suspended),
                    bolusing: Some(read.status.bolusing),
                    error: None,
                })]);
                if read.loop_ok {
                    ctx.sinks.loop_trigger.request_loop();
                }
                Ok(PollReport::Completed {
                    reservoir: read.update.new,
                    history_events: read.history_events,
                    clock_corrected: read.clock_corrected,
                })
            }
            Err(e) => {
                ctx.freshness.poll_completed(false);
                ctx.set_last_error(e.clone());
                ctx.upload(&[Treatment::DeviceStatus(DeviceStatusReport {
                    device: Some(device.to_string()),
                    error: Some(e.to_string()),
                    ..DeviceStatusReport::default()
                })]);
                if matches!(e, PumpError::RadioComms { .. }) {
                    ctx.tuner.troubleshoot(ctx, &device);
                }
                Err(e)
            }
        }
    }

    fn read_status(
        ctx: &PumpContext,
        session: &mut dyn PumpSession,
    ) -> PumpResult<PumpStatus> {
        let retries = ctx.cfg.poller.retries;
        let mut attempt = 0;
        loop {
            let err = match session.send(PumpCommand::ReadStatus) {
                Ok(PumpResponse::Status(status)) => return Ok(status),
                Ok(other) => unexpected("read_status", &other),
                Err(e) => PumpError::from(e),
            };
            if attempt >= retries {
                return Err(err);
            }
            attempt += 1;
            tracing::warn!(attempt, error = %err, "status read failed; retrying");
        }
    }

    fn read_in_session(
        ctx: &PumpContext,
        session: &mut dyn PumpSession,
    ) -> PumpResult<StatusRead> {
        let status = Self::read_status(ctx, session)?;

        if let Some(model) = &status.model
            && ctx.settings.pump_state().model.as_ref() != Some(model)
        {
            let model = model.clone();
            if let Err(e) = ctx.settings.update(|s| {
                s.pump_state.get_or_insert_with(Default::default).model = Some(model);
            }) {
                tracing::warn!(error = %e, "could not persist pump model");
            }
            ctx.refresh_heartbeat();
        }

        let pump_date = ctx
            .settings
            .pump_state()
            .interpret(status.clock)
            .ok_or_else(|| PumpError::InvalidData(format!("pump clock {} is ambiguous", status.clock)))?;

        let (date, clock_corrected) = match ctx.clock_sync.check(ctx, session, pump_date) {
            ClockCheck::Corrected { drift_secs } => {
                tracing::info!(drift_secs, "pump clock corrected during status read");
                (ctx.now(), true)
            }
            ClockCheck::InSync | ClockCheck::Failed(_) => (pump_date, false),
        };

        ctx.battery.observe_volts(ctx, status.battery_volts);
        let update = ctx.reservoir.record(ctx, status.reservoir, date, None)?;

        let wants_history = ctx.cfg.poller.insulin_data_source == InsulinDataSource::PumpHistory
            || !update.continuous;
        let (history_events, history_ok) = if wants_history {
            match ctx.history.fetch(ctx, session) {
                Ok(n) => (n, true),
                Err(e) => {
                    tracing::warn!(error = %e, "history read failed");
                    ctx.set_last_error(e);
                    (0, false)
                }
            }
        } else {
            (0, true)
        };

        Ok(StatusRead {
            status,
            date,
            loop_ok: history_ok || update.continuous,
            update,
            history_events,
            clock_corrected,
        })
    }
}
