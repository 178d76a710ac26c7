#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Any record that loads must serialize and load back.
    if let Ok(state) = pump_config::PersistedState::from_toml_str(data) {
        if let Ok(text) = state.to_toml_string() {
            assert!(pump_config::PersistedState::from_toml_str(&text).is_ok());
        }
    }
});
