mod common;

use common::{rig, rig_with};
use pump_config::InsulinDataSource;
use pump_core::mocks::Notification;
use pump_core::{EngineCfg, PollReport, PumpError};
use pump_traits::{
    CareEvent, CommandStage, DeviceId, FailureCause, GlucoseSample, GlucoseStore, PumpEventKind,
    RawPumpEvent, TransportError, Treatment,
};
use rstest::rstest;

fn read_count(cmds: &[&str], name: &str) -> usize {
    cmds.iter().filter(|c| **c == name).count()
}

#[test]
fn first_check_reads_then_data_is_fresh() {
    let r = rig();
    assert!(r.manager.snapshot().stale);
    let report = r.manager.assert_current_pump_data().unwrap();
    assert!(matches!(report, PollReport::Completed { .. }));
    assert_eq!(r.transport.sessions_opened(), 1);

    assert_eq!(r.manager.assert_current_pump_data().unwrap(), PollReport::Fresh);
    assert_eq!(r.transport.sessions_opened(), 1);
}

#[rstest]
#[case::sentry_pump_within_six_minutes("523", 5, false)]
#[case::sentry_pump_past_six_minutes("523", 7, true)]
#[case::sentry_pump_at_six_minutes("523", 6, true)]
#[case::older_pump_at_four_minutes("522", 4, true)]
#[case::older_pump_within_four_minutes("522", 3, false)]
#[case::older_pump_past_four_minutes("522", 5, true)]
fn staleness_depends_on_heartbeat(#[case] model: &str, #[case] minutes: i64, #[case] reads: bool) {
    let r = rig_with(EngineCfg::default(), model);
    r.manager.assert_current_pump_data().unwrap();
    r.advance_min(minutes);
    let report = r.manager.assert_current_pump_data().unwrap();
    assert_eq!(matches!(report, PollReport::Completed { .. }), reads);
}

#[test]
fn forced_read_ignores_freshness() {
    let r = rig();
    r.manager.assert_current_pump_data().unwrap();
    r.manager.trigger_pump_data_read().unwrap();
    assert_eq!(r.transport.sessions_opened(), 2);
    assert!(!r.manager.snapshot().forced_read);
}

#[test]
fn successful_poll_requests_one_loop_and_uploads_status() {
    let r = rig();
    r.pump.set_reservoir(120.0);
    r.manager.assert_current_pump_data().unwrap();
    assert_eq!(r.loops.count(), 1);
    assert!(r.uploads.uploaded().iter().any(|t| matches!(
        t,
        Treatment::DeviceStatus(s) if s.reservoir == Some(120.0) && s.error.is_none()
    )));
}

#[test]
fn reservoir_thresholds_notify_once_each() {
    let r = rig();
    r.pump.set_reservoir(31.0);
    r.manager.trigger_pump_data_read().unwrap();
    r.pump.set_reservoir(19.0);
    r.manager.trigger_pump_data_read().unwrap();
    let lows: Vec<f64> = r
        .notes
        .sent()
        .iter()
        .filter_map(|n| match n {
            Notification::ReservoirLow { units, .. } => Some(*units),
            _ => None,
        })
        .collect();
    assert_eq!(lows, vec![19.0, 19.0]);

    r.pump.set_reservoir(18.0);
    r.manager.trigger_pump_data_read().unwrap();
    assert_eq!(r.notes.sent().len(), 2);

    r.pump.set_reservoir(0.0);
    r.manager.trigger_pump_data_read().unwrap();
    assert_eq!(r.notes.sent().last(), Some(&Notification::ReservoirEmpty));
    assert_eq!(r.notes.sent().len(), 3);
}

#[test]
fn reservoir_rise_logs_cartridge_change() {
    let r = rig();
    r.pump.set_reservoir(50.0);
    r.manager.trigger_pump_data_read().unwrap();
    r.pump.set_reservoir(200.0);
    r.manager.trigger_pump_data_read().unwrap();
    assert!(r.care.events().contains(&CareEvent::CartridgeChange {
        previous: 50.0,
        new: 200.0
    }));
}

#[test]
fn battery_low_and_battery_change() {
    let r = rig();
    r.pump.set_battery_volts(1.2);
    r.manager.trigger_pump_data_read().unwrap();
    r.manager.trigger_pump_data_read().unwrap();
    let lows = r
        .notes
        .sent()
        .iter()
        .filter(|n| **n == Notification::BatteryLow)
        .count();
    assert_eq!(lows, 1);

    r.pump.set_battery_volts(1.58);
    r.manager.trigger_pump_data_read().unwrap();
    assert!(r.care.events().iter().any(|e| matches!(
        e,
        CareEvent::BatteryChange { previous, new } if *previous == 0.0 && *new == 1.0
    )));
}

#[test]
fn status_read_is_retried_within_the_session() {
    let r = rig();
    for _ in 0..3 {
        r.pump.fail_next(
            "read_status",
            TransportError::Uncertain(FailureCause::NoResponse(CommandStage::Command)),
        );
    }
    let report = r.manager.assert_current_pump_data().unwrap();
    assert!(matches!(report, PollReport::Completed { .. }));
    assert_eq!(read_count(&r.pump.commands(), "read_status"), 4);
    assert_eq!(r.transport.sessions_opened(), 1);
}

#[test]
fn failed_poll_records_error_and_tunes_the_radio() {
    let r = rig();
    for _ in 0..4 {
        r.pump.fail_next(
            "read_status",
            TransportError::Uncertain(FailureCause::Timeout),
        );
    }
    r.pump.set_best_frequency(916.7);
    let err = r.manager.assert_current_pump_data().unwrap_err();
    assert!(matches!(err, PumpError::RadioComms { .. }));
    assert_eq!(r.loops.count(), 0);

    let snap = r.manager.snapshot();
    assert_eq!(snap.last_error.map(|e| e.error), Some(err));
    assert!(snap.stale);
    assert_eq!(
        snap.devices
            .get(&DeviceId::new("rl-1"))
            .and_then(|d| d.last_valid_frequency),
        Some(916.7)
    );
    assert!(r.uploads.uploaded().iter().any(|t| matches!(
        t,
        Treatment::DeviceStatus(s) if s.error.is_some()
    )));
}

#[test]
fn clock_drift_is_corrected_during_the_read() {
    let r = rig();
    r.pump.set_clock_drift(chrono::Duration::minutes(2));
    let report = r.manager.assert_current_pump_data().unwrap();
    match report {
        PollReport::Completed {
            reservoir,
            clock_corrected,
            ..
        } => {
            assert!(clock_corrected);
            assert_eq!(reservoir.at, r.now());
        }
        other => panic!("unexpected report {other:?}"),
    }
    assert_eq!(r.pump.pump_clock(), r.now().naive_utc());
}

#[test]
fn small_drift_is_left_alone() {
    let r = rig();
    r.pump.set_clock_drift(chrono::Duration::seconds(10));
    r.manager.assert_current_pump_data().unwrap();
    assert_eq!(read_count(&r.pump.commands(), "set_time"), 0);
}

#[test]
fn meter_readings_are_imported_without_recent_glucose() {
    let r = rig();
    r.pump.push_history(RawPumpEvent {
        pump_time: (r.now() - chrono::Duration::minutes(10)).naive_utc(),
        kind: PumpEventKind::BgReceived { mg_dl: 140 },
    });
    let report = r.manager.assert_current_pump_data().unwrap();
    assert!(matches!(report, PollReport::Completed { history_events: 1, .. }));
    let imported = r.glucose.from_source("pump");
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].mg_dl, 140.0);
}

#[test]
fn meter_readings_are_skipped_when_cgm_is_recent() {
    let r = rig();
    r.glucose
        .add_glucose(
            &[GlucoseSample {
                at: r.now() - chrono::Duration::minutes(5),
                mg_dl: 110.0,
                display_only: false,
            }],
            Some("cgm"),
        )
        .unwrap();
    r.pump.push_history(RawPumpEvent {
        pump_time: (r.now() - chrono::Duration::minutes(10)).naive_utc(),
        kind: PumpEventKind::BgReceived { mg_dl: 140 },
    });
    r.manager.assert_current_pump_data().unwrap();
    assert!(r.glucose.from_source("pump").is_empty());
}

#[test]
fn reservoir_source_reads_history_only_when_discontinuous() {
    let mut cfg = EngineCfg::default();
    cfg.poller.insulin_data_source = InsulinDataSource::Reservoir;
    let r = rig_with(cfg, "523");

    r.manager.trigger_pump_data_read().unwrap();
    assert_eq!(read_count(&r.pump.commands(), "read_history"), 1);

    r.advance_min(5);
    r.manager.trigger_pump_data_read().unwrap();
    assert_eq!(read_count(&r.pump.commands(), "read_history"), 1);

    r.advance_min(45);
    r.manager.trigger_pump_data_read().unwrap();
    assert_eq!(read_count(&r.pump.commands(), "read_history"), 2);
    assert_eq!(r.loops.count(), 3);
}

#[test]
fn disconnected_radio_is_a_connection_error() {
    let r = rig();
    r.transport.set_connected("rl-1", false).unwrap();
    let err = r.manager.assert_current_pump_data().unwrap_err();
    assert_eq!(err, PumpError::Connection);
    assert_eq!(r.manager.snapshot().last_error.map(|e| e.error), Some(PumpError::Connection));
}

#[test]
fn unpaired_engine_does_not_poll() {
    let r = rig();
    r.manager.set_pump_id(None).unwrap();
    let err = r.manager.assert_current_pump_data().unwrap_err();
    assert!(matches!(err, PumpError::Configuration(_)));
    assert_eq!(r.transport.sessions_opened(), 0);
}

#[test]
fn wants_timer_tick_follows_staleness_and_cgm_heartbeat() {
    let r = rig();
    assert!(r.manager.wants_timer_tick());
    r.manager.assert_current_pump_data().unwrap();
    assert!(r.manager.wants_timer_tick());
    r.manager.set_cgm_heartbeat(true);
    assert!(!r.manager.wants_timer_tick());
    r.advance_min(10);
    assert!(r.manager.wants_timer_tick());
}
