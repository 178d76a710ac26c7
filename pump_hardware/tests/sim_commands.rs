use std::sync::Arc;
use std::time::Duration;

use pump_hardware::{SimulatedPump, SimulatedTransport};
use pump_traits::{
    Certainty, Clock, FailureCause, ManualClock, PumpCommand, PumpEventKind, PumpResponse, PumpTransport,
    RawPumpEvent, SensorReading,
};
use rstest::rstest;

fn setup() -> (SimulatedPump, SimulatedTransport, ManualClock) {
    let clock = ManualClock::new();
    let pump = SimulatedPump::new("123456", "523", Arc::new(clock.clone())).unwrap();
    let transport = SimulatedTransport::new(pump.clone(), &["rl-1"]);
    (pump, transport, clock)
}

#[rstest]
#[case(PumpCommand::Bolus { units: 1.0 })]
#[case(PumpCommand::TempBasal { rate: 0.5, duration: Duration::from_secs(1800) })]
fn dosing_while_bolusing_is_a_certain_failure(#[case] command: PumpCommand) {
    let (pump, transport, _clock) = setup();
    pump.set_bolusing(true);
    let mut session = transport.open(&transport.first_connected().unwrap()).unwrap();
    let err = session.send(command).unwrap_err();
    assert_eq!(err.certainty(), Some(Certainty::Certain));
    assert_eq!(err.cause(), Some(&FailureCause::BolusInProgress));
}

#[test]
fn history_is_filtered_by_since() {
    let (pump, transport, clock) = setup();
    let old = clock.now() - chrono::Duration::hours(2);
    pump.push_history(RawPumpEvent {
        pump_time: old.naive_utc(),
        kind: PumpEventKind::Rewind,
    });
    pump.push_history(RawPumpEvent {
        pump_time: clock.now().naive_utc(),
        kind: PumpEventKind::BgReceived { mg_dl: 140 },
    });
    let mut session = transport.open(&transport.first_connected().unwrap()).unwrap();
    let since = clock.now() - chrono::Duration::hours(1);
    match session.send(PumpCommand::ReadHistory { since }).unwrap() {
        PumpResponse::History { events, model } => {
            assert_eq!(events.len(), 1);
            assert_eq!(model.number, "523");
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn sentry_status_reports_sensor_and_reservoir() {
    let (pump, _transport, _clock) = setup();
    pump.set_reservoir(42.0);
    pump.set_sensor_glucose(Some(128));
    let status = pump.sentry_status().unwrap();
    assert_eq!(status.reservoir_units, 42.0);
    assert_eq!(status.sensor, SensorReading::Active { mg_dl: 128 });
    assert!(status.glucose_clock.is_some());
}

#[test]
fn temp_basal_echoes_rate_and_duration() {
    let (pump, transport, _clock) = setup();
    let mut session = transport.open(&transport.first_connected().unwrap()).unwrap();
    let resp = session
        .send(PumpCommand::TempBasal {
            rate: 1.25,
            duration: Duration::from_secs(1800),
        })
        .unwrap();
    match resp {
        PumpResponse::TempBasal(ack) => {
            assert_eq!(ack.rate, 1.25);
            assert_eq!(ack.time_remaining, Duration::from_secs(1800));
        }
        other => panic!("unexpected response {other:?}"),
    }
    assert_eq!(pump.temp_basal(), Some((1.25, Duration::from_secs(1800))));
}
