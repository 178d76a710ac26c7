use chrono::{TimeZone, Utc};
use pump_config::{
    AutosenseState, DeviceState, PersistedState, PumpIdentity, PumpState, STATE_SCHEMA_VERSION,
    ScheduleOverride, load_state, save_state,
};
use pump_traits::{DeviceId, PumpModel, PumpRegion};
use tempfile::tempdir;

fn populated() -> PersistedState {
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let mut state = PersistedState {
        pump_identity: Some(PumpIdentity {
            pump_id: "654321".into(),
            region: PumpRegion::WorldWide,
            model: Some(PumpModel::new("523")),
        }),
        pump_state: Some(PumpState {
            utc_offset_secs: 7200,
            model: Some(PumpModel::new("523")),
        }),
        autosense: AutosenseState {
            enabled: true,
            factor: 1.4113636,
            last_run: Some(now),
            suspended_at: None,
        },
        active_override: Some(ScheduleOverride::autosense(
            1.4,
            now,
            std::time::Duration::from_secs(120),
        )),
        ..PersistedState::default()
    };
    state.devices.insert(
        DeviceId::new("rl-1"),
        DeviceState {
            last_tuned: Some(now),
            last_valid_frequency: Some(916.55),
        },
    );
    state
}

#[test]
fn save_then_load_reproduces_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.toml");
    let state = populated();
    save_state(&path, &state).unwrap();
    let loaded = load_state(&path).unwrap();
    assert_eq!(loaded.schema_version, STATE_SCHEMA_VERSION);
    assert_eq!(loaded.autosense, state.autosense);
    assert_eq!(loaded.active_override, state.active_override);
    assert_eq!(loaded.pump_state, state.pump_state);
    assert_eq!(loaded, state);
}

#[test]
fn missing_file_yields_default() {
    let dir = tempdir().unwrap();
    let loaded = load_state(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(loaded, PersistedState::default());
}

#[test]
fn missing_and_unknown_keys_default() {
    let text = r#"
future_feature = "ignored"

[autosense]
factor = 0.7
"#;
    let loaded = PersistedState::from_toml_str(text).unwrap();
    assert_eq!(loaded.schema_version, STATE_SCHEMA_VERSION);
    assert!(loaded.autosense.enabled);
    assert_eq!(loaded.autosense.factor, 0.7);
    assert!(loaded.pump_identity.is_none());
}

#[test]
fn newer_schema_is_rejected() {
    let err = PersistedState::from_toml_str("schema_version = 99\n").unwrap_err();
    assert!(format!("{err}").contains("newer than supported"));
}

#[test]
fn incomplete_records_load_as_absent() {
    let text = r#"
schema_version = 1

[pump_identity]
region = "world_wide"

[autosense]
enabled = false
factor = 1.2

[active_override]
context = "custom"
trigger = "autosense"
insulin_needs_scale = 1.2
"#;
    let state = PersistedState::from_toml_str(text).unwrap();
    assert!(state.pump_identity.is_none());
    assert!(state.active_override.is_none());
    assert!(!state.autosense.enabled);
    assert_eq!(state.autosense.factor, 1.2);
}
