//! Exclusive, FIFO-ordered access to the pump radio link.
//!
//! Every pump interaction runs inside a named session. Callers block until
//! their ticket is served; a waiter that times out or is cancelled gives its
//! ticket up without disturbing the order of the others.

use crate::error::{PumpError, PumpResult, SessionError};
use pump_traits::{DeviceId, PumpSession, PumpTransport};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
pub use tokio_util::sync::CancellationToken;

/// Granularity at which waiters re-check their cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Default)]
struct Queue {
    next_ticket: u64,
    serving: u64,
    holder: Option<ThreadId>,
    abandoned: BTreeSet<u64>,
}

impl Queue {
    fn advance(&mut self) {
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }
}

pub struct SessionCoordinator {
    transport: Arc<dyn PumpTransport>,
    queue: Mutex<Queue>,
    turn: Condvar,
    attempts: Mutex<BTreeMap<String, u64>>,
    acquire_timeout: Option<Duration>,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

/// Held while a session runs; releases the slot on drop, panics included.
struct Slot<'a> {
    coordinator: &'a SessionCoordinator,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if let Ok(mut q) = self.coordinator.queue.lock() {
            q.holder = None;
            q.advance();
        }
        self.coordinator.turn.notify_all();
    }
}

impl SessionCoordinator {
    pub fn new(transport: Arc<dyn PumpTransport>, acquire_timeout: Option<Duration>) -> Self {
        Self {
            transport,
            queue: Mutex::new(Queue::default()),
            turn: Condvar::new(),
            attempts: Mutex::new(BTreeMap::new()),
            acquire_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn PumpTransport> {
        &self.transport
    }

    /// Highest-priority connected radio device.
    pub fn connected_device(&self) -> PumpResult<DeviceId> {
        self.transport.first_connected().ok_or(PumpError::Connection)
    }

    pub fn deprioritize(&self, device: &DeviceId) {
        tracing::info!(%device, "deprioritizing radio device");
        self.transport.deprioritize(device);
    }

    /// Attempts per session name since startup.
    pub fn attempt_counts(&self) -> BTreeMap<String, u64> {
        self.attempts.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Whether the calling thread currently holds the session.
    pub fn held_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        self.queue.lock().is_ok_and(|q| q.holder == Some(me))
    }

    fn lock_queue(&self) -> PumpResult<MutexGuard<'_, Queue>> {
        self.queue
            .lock()
            .map_err(|_| PumpError::Session(SessionError::Poisoned))
    }

    fn acquire(&self, name: &str, cancel: Option<&CancellationToken>) -> PumpResult<Slot<'_>> {
        let me = thread::current().id();
        let started = Instant::now();
        let mut q = self.lock_queue()?;
        if q.holder == Some(me) {
            return Err(SessionError::Reentrant {
                name: name.to_string(),
            }
            .into());
        }
        let ticket = q.next_ticket;
        q.next_ticket += 1;

        while q.serving != ticket {
            let give_up = if cancel.is_some_and(CancellationToken::is_cancelled) {
                Some(SessionError::Cancelled {
                    name: name.to_string(),
                })
            } else {
                self.acquire_timeout
                    .filter(|t| started.elapsed() >= *t)
                    .map(|_| SessionError::Timeout {
                        name: name.to_string(),
                        waited: started.elapsed(),
                    })
            };
            if let Some(err) = give_up {
                q.abandoned.insert(ticket);
                tracing::warn!(session = name, error = %err, "giving up on radio session");
                return Err(err.into());
            }
            let mut slice = CANCEL_POLL;
            if let Some(t) = self.acquire_timeout {
                slice = slice.min(t.saturating_sub(started.elapsed()).max(Duration::from_millis(1)));
            }
            q = self
                .turn
                .wait_timeout(q, slice)
                .map_err(|_| PumpError::Session(SessionError::Poisoned))?
                .0;
        }
        q.holder = Some(me);
        tracing::debug!(session = name, waited_ms = started.elapsed().as_millis() as u64, "session acquired");
        Ok(Slot { coordinator: self })
    }

    fn record_attempt(&self, name: &str) {
        if let Ok(mut m) = self.attempts.lock() {
            *m.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    /// Run `work` with exclusive access to `device`.
    ///
    /// The slot is released when `work` returns, whatever the outcome.
    pub fn run_session<T>(
        &self,
        name: &str,
        device: &DeviceId,
        cancel: Option<&CancellationToken>,
        work: impl FnOnce(&mut dyn PumpSession) -> PumpResult<T>,
    ) -> PumpResult<T> {
        self.record_attempt(name);
        let _slot = self.acquire(name, cancel)?;
        let span = tracing::info_span!("session", name, %device);
        let _enter = span.enter();
        let mut session = self.transport.open(device)?;
        let out = work(session.as_mut());
        if let Err(e) = &out {
            tracing::debug!(error = %e, "session finished with error");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pump_hardware::{SimulatedPump, SimulatedTransport};
    use pump_traits::{ManualClock, PumpCommand};
    use std::sync::mpsc;

    fn coordinator(timeout: Option<Duration>) -> SessionCoordinator {
        let clock = Arc::new(ManualClock::new());
        let pump = SimulatedPump::new("123456", "523", clock).unwrap();
        let transport = Arc::new(SimulatedTransport::new(pump, &["rl-1"]));
        SessionCoordinator::new(transport, timeout)
    }

    #[test]
    fn nested_request_is_reentrant_error() {
        let c = coordinator(None);
        let dev = c.connected_device().unwrap();
        let inner = c.run_session("outer", &dev, None, |_s| {
            Ok(c.run_session("inner", &dev, None, |_s| Ok(())))
        });
        assert!(matches!(
            inner.unwrap(),
            Err(PumpError::Session(SessionError::Reentrant { .. }))
        ));
        // The slot was released afterwards.
        assert!(c.run_session("after", &dev, None, |_s| Ok(())).is_ok());
    }

    #[test]
    fn waiter_times_out_while_slot_is_held() {
        let c = Arc::new(coordinator(Some(Duration::from_millis(50))));
        let dev = c.connected_device().unwrap();
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = {
            let c = Arc::clone(&c);
            let dev = dev.clone();
            thread::spawn(move || {
                c.run_session("hold", &dev, None, |_s| {
                    held_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
            })
        };
        held_rx.recv().unwrap();
        let err = c.run_session("late", &dev, None, |_s| Ok(())).unwrap_err();
        assert!(matches!(err, PumpError::Session(SessionError::Timeout { .. })));
        release_tx.send(()).unwrap();
        holder.join().unwrap().unwrap();
        // Abandoned ticket does not block later callers.
        assert!(c.run_session("next", &dev, None, |_s| Ok(())).is_ok());
    }

    #[test]
    fn cancelled_waiter_gives_up() {
        let c = Arc::new(coordinator(None));
        let dev = c.connected_device().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = {
            let c = Arc::clone(&c);
            let dev = dev.clone();
            thread::spawn(move || {
                c.run_session("hold", &dev, None, |_s| {
                    held_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
            })
        };
        held_rx.recv().unwrap();
        let err = c
            .run_session("cancelled", &dev, Some(&token), |_s| Ok(()))
            .unwrap_err();
        assert!(matches!(err, PumpError::Session(SessionError::Cancelled { .. })));
        release_tx.send(()).unwrap();
        holder.join().unwrap().unwrap();
    }

    #[test]
    fn attempts_are_counted_per_name() {
        let c = coordinator(None);
        let dev = c.connected_device().unwrap();
        for _ in 0..2 {
            c.run_session("Get Pump Status", &dev, None, |s| {
                s.send(PumpCommand::ReadStatus)?;
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(c.attempt_counts().get("Get Pump Status"), Some(&2));
    }
}
