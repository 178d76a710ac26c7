//! Pump data staleness and the forced-read / unverified flags.

use crate::config::FreshnessCfg;
use crate::error::{PumpError, PumpResult};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub(crate) fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[derive(Debug)]
pub struct FreshnessTracker {
    cfg: FreshnessCfg,
    heartbeat: AtomicBool,
    forced: AtomicBool,
    unverified: AtomicBool,
}

impl FreshnessTracker {
    pub fn new(cfg: FreshnessCfg) -> Self {
        Self {
            cfg,
            heartbeat: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            unverified: AtomicBool::new(false),
        }
    }

    pub fn cfg(&self) -> &FreshnessCfg {
        &self.cfg
    }

    /// Record whether the paired pump can send sentry packets.
    pub fn set_pump_has_heartbeat(&self, has_sentry: bool) {
        self.heartbeat
            .store(has_sentry && self.cfg.idle_listening, Ordering::SeqCst);
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat.load(Ordering::SeqCst)
    }

    pub fn tolerance(&self) -> chrono::Duration {
        if self.has_heartbeat() {
            span(self.cfg.heartbeat_tolerance)
        } else {
            span(self.cfg.no_heartbeat_tolerance)
        }
    }

    /// Stale when a read is forced, the pump is unverified, nothing is known yet,
    /// or the newest data has reached the tolerance.
    pub fn is_stale(&self, now: DateTime<Utc>, last_data: Option<DateTime<Utc>>) -> bool {
        self.forced_read()
            || self.unverified()
            || last_data.is_none_or(|t| now - t >= self.tolerance())
    }

    pub fn force_read(&self) {
        self.forced.store(true, Ordering::SeqCst);
    }

    pub fn forced_read(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// An uncertain dose failure: block dosing and force a read.
    pub fn mark_unverified(&self) {
        tracing::warn!("pump state unverified; dosing blocked until the next successful read");
        self.unverified.store(true, Ordering::SeqCst);
        self.force_read();
    }

    pub fn unverified(&self) -> bool {
        self.unverified.load(Ordering::SeqCst)
    }

    /// Dosing gate. Call again inside the session so the check and the send share the slot.
    pub fn require_verified(&self) -> PumpResult<()> {
        if self.unverified() {
            self.force_read();
            return Err(PumpError::InvalidData(
                "pump state unverified after an uncertain dose; read pump data first".into(),
            ));
        }
        Ok(())
    }

    /// A poll finished. The forced flag clears either way; only success verifies the pump.
    pub fn poll_completed(&self, success: bool) {
        self.forced.store(false, Ordering::SeqCst);
        if success {
            self.unverified.store(false, Ordering::SeqCst);
        }
    }
}
