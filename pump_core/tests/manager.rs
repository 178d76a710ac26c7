mod common;

use common::{PUMP_ID, identity, rig, rig_with_devices};
use pump_config::{DeviceState, PumpState, load_state};
use pump_core::mocks::{InMemoryCarbStore, InMemoryDoseStore, InMemoryGlucoseStore};
use pump_core::{
    DeviceManager, EngineCfg, PendingReservoir, PollReport, PumpError, SentryAction,
    TroubleshootOutcome,
};
use pump_hardware::{SimulatedPump, SimulatedTransport};
use pump_traits::{BasalScheduleEntry, Clock, DeviceId, ManualClock};
use std::sync::Arc;
use std::time::Duration;

// ── Pump configuration ───────────────────────────────────────────────────────

#[test]
fn pump_id_must_have_six_characters() {
    let r = rig();
    let err = r.manager.set_pump_id(Some("1234")).unwrap_err();
    assert!(matches!(err, PumpError::InvalidData(_)));
    assert_eq!(
        r.manager.snapshot().pump_identity.map(|p| p.pump_id),
        Some(PUMP_ID.to_string())
    );
}

#[test]
fn new_pump_id_resets_pump_data() {
    let r = rig();
    r.manager.assert_current_pump_data().unwrap();
    assert_eq!(r.dose.reservoir_values().len(), 1);

    r.manager.set_pump_id(Some(PUMP_ID)).unwrap();
    assert_eq!(r.dose.reservoir_values().len(), 1);

    r.manager.set_pump_id(Some("654321")).unwrap();
    assert!(r.dose.reservoir_values().is_empty());
    assert!(r.dose.pump_events().is_empty());
    let snap = r.manager.snapshot();
    let id = snap.pump_identity.unwrap();
    assert_eq!(id.pump_id, "654321");
    assert_eq!(id.model, None);
    assert!(snap.stale);
}

#[test]
fn basal_schedule_is_written_to_the_pump() {
    let r = rig();
    assert!(matches!(
        r.manager.set_basal_schedule(&[]).unwrap_err(),
        PumpError::Configuration(_)
    ));

    let schedule = vec![
        BasalScheduleEntry {
            index: 0,
            offset: Duration::ZERO,
            rate: 0.8,
        },
        BasalScheduleEntry {
            index: 1,
            offset: Duration::from_secs(6 * 3600),
            rate: 1.1,
        },
    ];
    r.manager.set_basal_schedule(&schedule).unwrap();
    assert_eq!(r.pump.basal_schedule(), schedule);
    assert_eq!(
        r.manager.snapshot().session_attempts.get("Save Basal Profile"),
        Some(&1)
    );
}

#[test]
fn pump_state_update_switches_heartbeat() {
    let r = rig();
    r.manager.set_pump_identity(Some(identity(None))).unwrap();
    r.manager
        .set_pump_state(PumpState {
            utc_offset_secs: 0,
            model: Some(pump_traits::PumpModel::new("522")),
        })
        .unwrap();
    assert!(!r.manager.context().freshness.has_heartbeat());
    r.manager
        .set_pump_state(PumpState {
            utc_offset_secs: 0,
            model: Some(pump_traits::PumpModel::new("554")),
        })
        .unwrap();
    assert!(r.manager.context().freshness.has_heartbeat());
}

// ── Radio ────────────────────────────────────────────────────────────────────

#[test]
fn tune_persists_the_best_frequency() {
    let r = rig();
    r.pump.set_best_frequency(916.62);
    assert_eq!(r.manager.tune_radio(None).unwrap(), 916.62);
    let state = r.manager.snapshot().devices[&DeviceId::new("rl-1")];
    assert_eq!(state.last_valid_frequency, Some(916.62));
    assert_eq!(state.last_tuned, Some(r.now()));
}

#[test]
fn troubleshooting_skips_tune_with_recent_data() {
    let r = rig();
    r.manager.assert_current_pump_data().unwrap();
    assert_eq!(
        r.manager.troubleshoot(&DeviceId::new("rl-1")),
        TroubleshootOutcome::RecentData
    );
}

#[test]
fn troubleshooting_tunes_when_data_is_old() {
    let r = rig();
    r.manager.assert_current_pump_data().unwrap();
    r.advance_min(30);
    assert_eq!(
        r.manager.troubleshoot(&DeviceId::new("rl-1")),
        TroubleshootOutcome::Tuned { frequency: 916.55 }
    );
}

#[test]
fn recently_tuned_device_is_deprioritized() {
    let r = rig_with_devices(EngineCfg::default(), "523", &["rl-1", "rl-2"]);
    let dev = DeviceId::new("rl-1");
    r.manager
        .set_device_state(
            &dev,
            DeviceState {
                last_tuned: Some(r.now() - chrono::Duration::minutes(5)),
                last_valid_frequency: Some(916.5),
            },
        )
        .unwrap();
    assert_eq!(r.manager.troubleshoot(&dev), TroubleshootOutcome::Deprioritized);
    assert_eq!(
        r.transport.priority_order(),
        vec![DeviceId::new("rl-2"), DeviceId::new("rl-1")]
    );
}

#[test]
fn troubleshooting_needs_a_paired_pump() {
    let r = rig();
    r.manager.set_pump_identity(None).unwrap();
    assert_eq!(
        r.manager.troubleshoot(&DeviceId::new("rl-1")),
        TroubleshootOutcome::NotConfigured
    );
}

// ── Sentry packets ───────────────────────────────────────────────────────────

#[test]
fn sentry_packet_keeps_data_fresh_and_schedules_reservoir() {
    let r = rig();
    r.pump.set_reservoir(88.0);
    r.pump.set_sensor_glucose(Some(150));
    let dev = DeviceId::new("rl-1");
    let status = r.pump.sentry_status().unwrap();

    let action = r.manager.handle_sentry_status(&dev, status.clone());
    let SentryAction::ScheduleReservoir(pending) = action else {
        panic!("expected a reservoir update, got {action:?}");
    };
    assert_eq!(pending.units, 88.0);
    assert_eq!(pending.at, r.now());
    assert_eq!(pending.time_left, Some(Duration::from_secs(88 * 3600)));
    assert!(!r.manager.snapshot().stale);
    assert_eq!(r.glucose.from_source("pump-sensor").len(), 1);

    assert_eq!(
        r.manager.handle_sentry_status(&dev, status),
        SentryAction::Duplicate
    );
    assert_eq!(r.transport.sessions_opened(), 0);
}

#[test]
fn sentry_packet_with_drifted_clock_asks_for_sync() {
    let r = rig();
    r.pump.set_clock_drift(chrono::Duration::minutes(5));
    let status = r.pump.sentry_status().unwrap();
    assert_eq!(
        r.manager.handle_sentry_status(&DeviceId::new("rl-1"), status),
        SentryAction::SyncClock { drift_secs: 300 }
    );
    assert!(r.manager.snapshot().stale);

    r.manager.sync_pump_clock().unwrap();
    assert_eq!(r.pump.pump_clock(), r.now().naive_utc());
}

#[test]
fn delayed_reservoir_update_stores_and_loops() {
    let r = rig();
    r.manager.assert_current_pump_data().unwrap();
    let loops = r.loops.count();
    r.advance_min(5);
    r.manager
        .update_reservoir_volume(PendingReservoir {
            units: 149.0,
            at: r.now(),
            time_left: None,
        })
        .unwrap();
    assert_eq!(r.dose.reservoir_values().len(), 2);
    assert_eq!(r.loops.count(), loops + 1);
}

// ── Sessions and persistence ─────────────────────────────────────────────────

#[test]
fn session_attempts_are_counted_by_name() {
    let r = rig();
    r.manager.assert_current_pump_data().unwrap();
    r.manager.trigger_pump_data_read().unwrap();
    r.manager.tune_radio(None).unwrap();
    let attempts = r.manager.snapshot().session_attempts;
    assert_eq!(attempts.get("Get Pump Status"), Some(&2));
    assert_eq!(attempts.get("Tune pump"), Some(&1));
}

#[test]
fn nested_session_from_the_same_thread_is_refused() {
    let r = rig();
    let ctx = r.manager.context();
    let dev = DeviceId::new("rl-1");
    let inner = ctx
        .sessions
        .run_session("Outer", &dev, None, |_| {
            Ok(ctx.sessions.run_session("Inner", &dev, None, |_| Ok(())))
        })
        .unwrap();
    assert!(matches!(
        inner,
        Err(PumpError::Session(pump_core::SessionError::Reentrant { .. }))
    ));
}

#[test]
fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.toml");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(common::origin()));

    let build = |clock: Arc<dyn Clock>| {
        let pump = SimulatedPump::new(PUMP_ID, "523", clock.clone()).unwrap();
        DeviceManager::builder()
            .with_clock(clock.clone())
            .with_transport(Arc::new(SimulatedTransport::new(pump, &["rl-1"])))
            .with_stores(
                Arc::new(InMemoryDoseStore::new(clock)),
                Arc::new(InMemoryGlucoseStore::new()),
                Arc::new(InMemoryCarbStore::new()),
            )
            .with_state(load_state(&path).unwrap())
            .with_state_path(&path)
            .build()
            .unwrap()
    };

    let first = build(clock.clone());
    first.set_pump_id(Some(PUMP_ID)).unwrap();
    assert!(matches!(
        first.assert_current_pump_data().unwrap(),
        PollReport::Completed { .. }
    ));
    first.tune_radio(None).unwrap();
    drop(first);

    let saved = load_state(&path).unwrap();
    assert_eq!(saved.pump_identity.map(|p| p.pump_id), Some(PUMP_ID.to_string()));
    assert_eq!(
        saved.pump_state.and_then(|s| s.model).map(|m| m.number),
        Some("523".to_string())
    );

    let second = build(clock);
    let snap = second.snapshot();
    assert!(snap.pump_identity.is_some());
    assert!(snap.devices.contains_key(&DeviceId::new("rl-1")));
}
