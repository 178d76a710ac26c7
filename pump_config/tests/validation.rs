use pump_config::load_toml;
use rstest::rstest;

#[rstest]
#[case("[autosense]\nmin_factor = 0.0\n", "autosense.min_factor must be > 0")]
#[case("[autosense]\nmin_factor = 1.5\nmax_factor = 1.0\n", "max_factor must be >=")]
#[case("[bolus]\nmax_attempts = 0\n", "bolus.max_attempts must be >= 1")]
#[case("[pump]\npump_id = \"12345\"\n", "exactly 6 characters")]
#[case("[poller]\nlow_reservoir_thresholds = [10.0, -1.0]\n", "low_reservoir_thresholds")]
#[case("[autosense]\nlow_threshold = 200.0\n", "low_threshold < high_threshold")]
fn rejects_out_of_range_values(#[case] toml: &str, #[case] needle: &str) {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should be rejected");
    assert!(
        format!("{err}").contains(needle),
        "unexpected message: {err}"
    );
}

#[test]
fn accepts_full_config() {
    let toml = r#"
[freshness]
heartbeat_tolerance_min = 6
no_heartbeat_tolerance_min = 4
sentry_reservoir_delay_secs = 11
idle_listening = false

[poller]
retries = 3
clock_drift_secs = 20
low_reservoir_thresholds = [10.0, 20.0, 30.0]
insulin_data_source = "reservoir"

[bolus]
max_attempts = 5

[autosense]
enabled = true
interval_secs = 60
lookback_min = 240

[session]
acquire_timeout_secs = 30

[pump]
pump_id = "123456"
region = "world_wide"
model = "523"
battery_chemistry = "lithium"
utc_offset_secs = 3600

[state]
path = "/tmp/pump-state.toml"
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    cfg.validate().expect("valid config");
    assert!(!cfg.freshness.idle_listening);
    assert_eq!(
        cfg.poller.insulin_data_source,
        pump_config::InsulinDataSource::Reservoir
    );
    assert_eq!(cfg.pump.pump_id.as_deref(), Some("123456"));
    assert_eq!(cfg.session.acquire_timeout_secs, 30);
}

#[test]
fn unknown_region_fails_to_parse() {
    assert!(load_toml("[pump]\nregion = \"mars\"\n").is_err());
}
