//! Pump history reads.
//!
//! History is always read inside a session someone else opened (status poll,
//! temp basal piggyback, or a dedicated fetch session).

use crate::clock_sync::unexpected;
use crate::config::PollerCfg;
use crate::context::PumpContext;
use crate::error::PumpResult;
use crate::freshness::span;
use chrono::{DateTime, Utc};
use pump_traits::{
    GlucoseSample, PumpCommand, PumpEvent, PumpEventKind, PumpResponse, PumpSession,
};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
pub struct HistoryReader {
    last_success: Mutex<DateTime<Utc>>,
    bg_window: Duration,
}

impl HistoryReader {
    pub fn new(cfg: &PollerCfg, now: DateTime<Utc>) -> Self {
        Self {
            last_success: Mutex::new(now - span(cfg.initial_history_lookback)),
            bg_window: cfg.history_bg_window,
        }
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success.lock().ok().map(|d| *d)
    }

    fn start_date(&self, ctx: &PumpContext) -> DateTime<Utc> {
        let after = ctx.stores.dose.pump_event_query_after();
        self.last_success().map_or(after, |last| after.min(last))
    }

    /// Read events since the query start, hand them to the dose store, and
    /// import meter readings when no recent glucose exists. Returns the number
    /// of events stored.
    pub fn fetch(&self, ctx: &PumpContext, session: &mut dyn PumpSession) -> PumpResult<usize> {
        let since = self.start_date(ctx);
        let (raw, model) = match session.send(PumpCommand::ReadHistory { since })? {
            PumpResponse::History { events, model } => (events, model),
            other => return Err(unexpected("read_history", &other)),
        };

        let pump_state = ctx.settings.pump_state();
        let mut events = Vec::with_capacity(raw.len());
        for e in raw {
            match pump_state.interpret(e.pump_time) {
                Some(date) => events.push(PumpEvent { date, kind: e.kind }),
                None => tracing::warn!(pump_time = %e.pump_time, "skipping history event with ambiguous time"),
            }
        }
        tracing::debug!(count = events.len(), %since, "pump history read");
        ctx.stores.dose.add_pump_events(&events, &model)?;

        if pump_state.model.as_ref() != Some(&model) {
            let model = model.clone();
            if let Err(e) = ctx.settings.update(|s| {
                s.pump_state.get_or_insert_with(Default::default).model = Some(model);
            }) {
                tracing::warn!(error = %e, "could not persist pump model");
            }
            ctx.refresh_heartbeat();
        }

        if let Some(newest) = events.iter().map(|e| e.date).max()
            && let Ok(mut last) = self.last_success.lock()
        {
            *last = (*last).max(newest);
        }

        self.import_meter_readings(ctx, &events);
        Ok(events.len())
    }

    fn import_meter_readings(&self, ctx: &PumpContext, events: &[PumpEvent]) {
        let readings: Vec<GlucoseSample> = events
            .iter()
            .filter_map(|e| match e.kind {
                PumpEventKind::BgReceived { mg_dl } => Some(GlucoseSample {
                    at: e.date,
                    mg_dl: f64::from(mg_dl),
                    display_only: false,
                }),
                _ => None,
            })
            .collect();
        if readings.is_empty() {
            return;
        }
        let now = ctx.now();
        let recent = ctx
            .stores
            .glucose
            .glucose_samples(now - span(self.bg_window), now)
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if recent {
            tracing::debug!(count = readings.len(), "recent glucose present; skipping meter readings");
            return;
        }
        if let Err(e) = ctx.stores.glucose.add_glucose(&readings, Some("pump")) {
            tracing::warn!(error = %e, "could not store meter readings");
        }
    }
}
