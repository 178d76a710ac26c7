mod common;

use common::{rig, rig_with};
use pump_core::{BolusState, DoseOutcome, EngineCfg, PumpError, TempBasalRecommendation};
use pump_config::DeviceState;
use pump_traits::{
    CareEvent, CommandStage, DeviceId, DoseStatus, FailureCause, PumpEventKind, TransportError,
    Treatment,
};
use rstest::rstest;
use std::sync::mpsc;
use std::time::Duration;

fn power_on_fault() -> TransportError {
    TransportError::Uncertain(FailureCause::NoResponse(CommandStage::PowerOn))
}

fn bolus_commands(cmds: &[&str]) -> usize {
    cmds.iter().filter(|c| **c == "bolus").count()
}

#[test]
fn delivers_and_records_confirmed_dose() {
    let r = rig();
    let at = r.now();
    r.manager.enact_bolus(2.0, at, false).unwrap();

    assert_eq!(r.pump.delivered_boluses(), vec![2.0]);
    let confirmed = r.dose.confirmed();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].entry.value, 2.0);
    assert!(matches!(r.manager.snapshot().bolus, BolusState::Confirmed(_)));
    assert!(
        r.uploads
            .uploaded()
            .iter()
            .any(|t| matches!(t, Treatment::Dose(e) if e.value == 2.0))
    );
}

#[test]
fn zero_units_is_a_no_op() {
    let r = rig();
    r.manager.enact_bolus(0.0, r.now(), false).unwrap();
    assert_eq!(r.transport.sessions_opened(), 0);
    assert!(r.dose.records().is_empty());
}

#[test]
fn missing_pump_id_is_a_configuration_error() {
    let r = rig();
    r.manager.set_pump_identity(None).unwrap();
    let err = r.manager.enact_bolus(1.0, r.now(), false).unwrap_err();
    assert!(matches!(err, PumpError::Configuration(_)));
    assert_eq!(r.transport.sessions_opened(), 0);
}

#[test]
fn stale_reservoir_is_reread_in_the_bolus_session() {
    let r = rig();
    r.pump.set_reservoir(80.0);
    r.manager.enact_bolus(1.0, r.now(), false).unwrap();

    let cmds = r.pump.commands();
    assert_eq!(cmds[0], "read_remaining_insulin");
    assert_eq!(cmds[1], "bolus");
    assert_eq!(r.transport.sessions_opened(), 1);
    assert_eq!(r.dose.reservoir_values()[0].units, 80.0);
}

#[test]
fn fresh_reservoir_skips_the_reread() {
    let r = rig();
    r.manager.trigger_pump_data_read().unwrap();
    let before = r.pump.commands().len();
    r.manager.enact_bolus(1.0, r.now(), false).unwrap();
    assert_eq!(&r.pump.commands()[before..], &["bolus"]);
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(4)]
fn power_on_failures_are_retried(#[case] failures: usize) {
    let r = rig();
    for _ in 0..failures {
        r.pump.fail_next("bolus", power_on_fault());
    }
    r.manager.enact_bolus(1.5, r.now(), false).unwrap();

    assert_eq!(r.pump.delivered_boluses(), vec![1.5]);
    assert_eq!(bolus_commands(&r.pump.commands()), failures + 1);
    assert!(!r.manager.snapshot().unverified);
}

#[test]
fn retries_stop_at_max_attempts() {
    let r = rig();
    for _ in 0..6 {
        r.pump.fail_next("bolus", power_on_fault());
    }
    let err = r.manager.enact_bolus(1.0, r.now(), false).unwrap_err();

    assert!(err.is_uncertain());
    assert_eq!(bolus_commands(&r.pump.commands()), 5);
    assert!(r.pump.delivered_boluses().is_empty());
    let failed = r
        .dose
        .records()
        .into_iter()
        .find_map(|rec| match rec.status {
            DoseStatus::Failed {
                certain, attempts, ..
            } => Some((certain, attempts)),
            _ => None,
        });
    assert_eq!(failed, Some((false, 5)));
    assert_eq!(r.notes.bolus_failures(), 1);
    assert!(matches!(
        r.manager.snapshot().bolus,
        BolusState::FailedUncertain { .. }
    ));
}

#[test]
fn bolus_in_progress_is_treated_as_delivered() {
    let r = rig();
    r.pump.set_bolusing(true);
    r.manager.enact_bolus(3.0, r.now(), false).unwrap();

    assert_eq!(bolus_commands(&r.pump.commands()), 1);
    assert_eq!(r.dose.confirmed().len(), 1);
    assert!(
        r.care
            .events()
            .iter()
            .any(|e| matches!(e, CareEvent::Note(n) if n.contains("in-progress")))
    );
}

#[test]
fn certain_failure_is_not_retried() {
    let r = rig();
    r.pump.set_suspended(true);
    let err = r.manager.enact_bolus(1.0, r.now(), false).unwrap_err();

    assert!(!err.is_uncertain());
    assert_eq!(bolus_commands(&r.pump.commands()), 1);
    let snap = r.manager.snapshot();
    assert!(!snap.unverified);
    assert!(matches!(snap.bolus, BolusState::FailedCertain { .. }));
    assert!(snap.last_error.is_some());
    assert_eq!(r.notes.bolus_failures(), 1);
}

#[test]
fn quiet_bolus_fails_without_notification() {
    let r = rig();
    r.pump.set_suspended(true);
    assert!(r.manager.enact_bolus(1.0, r.now(), true).is_err());
    assert_eq!(r.notes.bolus_failures(), 0);
}

#[test]
fn uncertain_failure_blocks_dosing_until_a_read_succeeds() {
    let r = rig();
    r.pump.fail_next_after_effect(
        "bolus",
        TransportError::Uncertain(FailureCause::NoResponse(CommandStage::Command)),
    );
    let err = r.manager.enact_bolus(1.0, r.now(), false).unwrap_err();
    assert!(err.is_uncertain());
    // The pump took the dose even though we never heard back.
    assert_eq!(r.pump.delivered_boluses(), vec![1.0]);
    assert_eq!(bolus_commands(&r.pump.commands()), 1);

    let snap = r.manager.snapshot();
    assert!(snap.unverified);
    assert!(snap.forced_read);

    let blocked = r.manager.enact_bolus(1.0, r.now(), false).unwrap_err();
    assert!(matches!(blocked, PumpError::InvalidData(_)));
    assert_eq!(r.pump.delivered_boluses().len(), 1);

    r.manager.assert_current_pump_data().unwrap();
    assert!(!r.manager.snapshot().unverified);
    r.manager.enact_bolus(1.0, r.now(), false).unwrap();
    assert_eq!(r.pump.delivered_boluses().len(), 2);
}

#[test]
fn pump_clock_drift_fails_the_bolus_and_resets_the_clock() {
    let r = rig();
    r.pump.set_clock_drift(chrono::Duration::minutes(5));
    let err = r.manager.enact_bolus(1.0, r.now(), false).unwrap_err();

    assert!(matches!(err, PumpError::PumpClockDrift { drift_secs: 300 }));
    assert!(r.pump.delivered_boluses().is_empty());
    assert!(r.pump.commands().contains(&"set_time"));
    assert_eq!(r.pump.pump_clock(), r.now().naive_utc());
    assert!(!r.manager.snapshot().unverified);
}

#[test]
fn exhausted_retries_troubleshoot_the_radio() {
    let mut cfg = EngineCfg::default();
    cfg.bolus.max_attempts = 2;
    let r = rig_with(cfg, "523");
    let device = DeviceId::new("rl-1");
    // Tuned moments ago, so troubleshooting can only deprioritize.
    r.manager
        .set_device_state(
            &device,
            DeviceState {
                last_tuned: Some(r.now()),
                last_valid_frequency: Some(916.5),
            },
        )
        .unwrap();
    for _ in 0..2 {
        r.pump.fail_next("bolus", power_on_fault());
    }
    assert!(r.manager.enact_bolus(1.0, r.now(), false).is_err());
    assert_eq!(bolus_commands(&r.pump.commands()), 2);
    assert_eq!(r.transport.deprioritized(), vec![device]);
}

#[test]
fn concurrent_bolus_is_rejected() {
    let r = rig();
    let manager = &r.manager;
    let device = manager.context().sessions.connected_device().unwrap();
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    std::thread::scope(|s| {
        s.spawn(move || {
            manager
                .context()
                .sessions
                .run_session("Hold", &device, None, |_| {
                    held_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        });
        held_rx.recv().unwrap();

        let at = r.now();
        let first = s.spawn(move || manager.enact_bolus(1.0, at, false));
        // The first bolus owns the slot once it reaches its reservoir check.
        while !matches!(manager.snapshot().bolus, BolusState::ReservoirCheck(_)) {
            std::thread::sleep(Duration::from_millis(5));
        }
        let second = manager.enact_bolus(1.0, at, true).unwrap_err();
        assert!(matches!(second, PumpError::InvalidData(ref m) if m.contains("already in progress")));

        release_tx.send(()).unwrap();
        first.join().unwrap().unwrap();
    });
    assert_eq!(r.pump.delivered_boluses(), vec![1.0]);
}

#[test]
fn delivered_bolus_shows_up_in_history() {
    let r = rig();
    r.manager.enact_bolus(2.5, r.now(), false).unwrap();
    r.manager.fetch_history().unwrap();
    assert!(
        r.dose
            .pump_events()
            .iter()
            .any(|e| e.kind == PumpEventKind::Bolus { units: 2.5 })
    );
}

#[rstest]
#[case::nan(f64::NAN)]
#[case::infinite(f64::INFINITY)]
#[case::negative_infinite(f64::NEG_INFINITY)]
fn non_finite_units_are_rejected_before_the_radio(#[case] units: f64) {
    let r = rig();
    let err = r.manager.enact_bolus(units, r.now(), false).unwrap_err();
    assert!(matches!(err, PumpError::InvalidData(_)));
    assert_eq!(r.transport.sessions_opened(), 0);
    assert!(r.pump.delivered_boluses().is_empty());
    assert!(r.dose.records().is_empty());
}

#[test]
fn bolus_queued_behind_uncertain_temp_basal_is_blocked() {
    let r = rig();
    let manager = &r.manager;
    let device = manager.context().sessions.connected_device().unwrap();
    for _ in 0..4 {
        r.pump.fail_next(
            "temp_basal",
            TransportError::Uncertain(FailureCause::NoResponse(CommandStage::Command)),
        );
    }
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let queued = |name: &str| {
        manager
            .context()
            .sessions
            .attempt_counts()
            .get(name)
            .copied()
            .unwrap_or(0)
            == 1
    };

    std::thread::scope(|s| {
        s.spawn(move || {
            manager
                .context()
                .sessions
                .run_session("Hold", &device, None, |_| {
                    held_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        });
        held_rx.recv().unwrap();

        let at = r.now();
        let temp = s.spawn(move || {
            manager.enact_temp_basal(
                TempBasalRecommendation {
                    rate: 1.0,
                    duration: Duration::from_secs(30 * 60),
                },
                at,
            )
        });
        while !queued("Set Temp Basal") {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(20));

        let bolus = s.spawn(move || manager.enact_bolus(1.0, at, true));
        while !queued("Bolus") {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(20));
        // Both see a verified pump before queueing.
        assert!(!manager.snapshot().unverified);

        release_tx.send(()).unwrap();
        assert!(matches!(temp.join().unwrap(), DoseOutcome::FailedUncertain(_)));
        let err = bolus.join().unwrap().unwrap_err();
        assert!(matches!(err, PumpError::InvalidData(ref m) if m.contains("unverified")));
    });

    assert!(r.pump.delivered_boluses().is_empty());
    assert_eq!(bolus_commands(&r.pump.commands()), 0);
    assert!(r.manager.snapshot().unverified);
}
