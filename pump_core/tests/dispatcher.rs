mod common;

use common::{glucose_series, rig, rig_with};
use pump_config::DeviceState;
use pump_core::{DeviceEvent, Dispatcher, EngineCfg};
use pump_traits::DeviceId;
use std::time::{Duration, Instant};

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn timer_tick_polls_stale_pump() {
    let r = rig();
    let d = Dispatcher::spawn(r.manager.clone());
    assert!(d.send(DeviceEvent::TimerTick));
    assert!(wait_until(|| d.handled() == 1));
    d.shutdown();
    assert_eq!(r.transport.sessions_opened(), 1);
    assert_eq!(r.loops.count(), 1);
}

#[test]
fn sentry_reservoir_is_stored_after_the_delay() {
    let mut cfg = EngineCfg::default();
    cfg.freshness.sentry_reservoir_delay = Duration::from_millis(150);
    let r = rig_with(cfg, "523");
    r.pump.set_reservoir(77.0);
    let d = Dispatcher::spawn(r.manager.clone());

    let sent = Instant::now();
    d.send(DeviceEvent::SentryStatus {
        device: DeviceId::new("rl-1"),
        status: r.pump.sentry_status().unwrap(),
    });
    assert!(wait_until(|| !r.dose.reservoir_values().is_empty()));
    assert!(sent.elapsed() >= Duration::from_millis(150));
    assert_eq!(r.dose.reservoir_values()[0].units, 77.0);
    drop(d);
}

#[test]
fn shutdown_applies_pending_reservoir_updates() {
    let r = rig();
    let d = Dispatcher::spawn(r.manager.clone());
    d.send(DeviceEvent::SentryStatus {
        device: DeviceId::new("rl-1"),
        status: r.pump.sentry_status().unwrap(),
    });
    d.shutdown();
    assert_eq!(r.dose.reservoir_values().len(), 1);
}

#[test]
fn cgm_update_stores_glucose_and_checks_pump() {
    let r = rig();
    let d = Dispatcher::spawn(r.manager.clone());
    let samples = glucose_series(r.now(), &[110.0, 115.0, 120.0], 5);
    d.send(DeviceEvent::CgmUpdated(samples));
    d.shutdown();
    assert_eq!(r.glucose.from_source("cgm").len(), 3);
    assert_eq!(r.transport.sessions_opened(), 1);
}

#[test]
fn device_state_events_are_persisted() {
    let r = rig();
    let sender = {
        let d = Dispatcher::spawn(r.manager.clone());
        let tx = d.sender();
        tx.send(DeviceEvent::DeviceStateChanged {
            device: DeviceId::new("rl-2"),
            state: DeviceState {
                last_tuned: Some(r.now()),
                last_valid_frequency: Some(868.3),
            },
        })
        .unwrap();
        tx
    };
    // Worker is gone once the dispatcher is dropped.
    assert!(sender.send(DeviceEvent::TimerTick).is_err());
    let devices = r.manager.snapshot().devices;
    assert_eq!(
        devices[&DeviceId::new("rl-2")].last_valid_frequency,
        Some(868.3)
    );
}
