//! Human-readable error descriptions and structured JSON error formatting.

use pump_core::{BuildError, PumpError, SessionError};
use pump_traits::Certainty;

/// Stable name of a `PumpError` kind for JSON output.
pub fn error_kind_name(e: &PumpError) -> &'static str {
    match e {
        PumpError::Connection => "Connection",
        PumpError::Configuration(_) => "Configuration",
        PumpError::InvalidData(_) => "InvalidData",
        PumpError::PumpDataTooOld(_) => "PumpDataTooOld",
        PumpError::MissingData(_) => "MissingData",
        PumpError::RadioComms { .. } => "RadioComms",
        PumpError::PumpClockDrift { .. } => "PumpClockDrift",
        PumpError::Session(_) => "Session",
        PumpError::Store(_) => "Store",
        PumpError::Persistence(_) => "Persistence",
    }
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingTransport => {
                "What happened: No pump transport was provided to the engine.\nLikely causes: The radio bridge failed to initialize.\nHow to fix: Check the radio device and rerun.".to_string()
            }
            BuildError::MissingStores => {
                "What happened: The engine has no data stores.\nLikely causes: Store initialization failed.\nHow to fix: Re-run with --log-level=debug for details.".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(pe) = err.downcast_ref::<PumpError>() {
        return match pe {
            PumpError::Connection => "What happened: No radio bridge is connected.\nLikely causes: The bridge is out of range, powered off, or not paired.\nHow to fix: Bring the bridge near the pump and make sure it is on, then retry.".to_string(),
            PumpError::Configuration(what) => format!(
                "What happened: Missing configuration ({what}).\nLikely causes: No pump is paired or a required setting is absent.\nHow to fix: Pair with `pumpctl set-pump-id <ID>` or set [pump] pump_id in the config."
            ),
            PumpError::PumpDataTooOld(at) => format!(
                "What happened: Pump data is too old to dose safely (last reading {}).\nLikely causes: The pump has not been reachable recently.\nHow to fix: Run `pumpctl poll --force` and retry once it succeeds.",
                at.to_rfc3339()
            ),
            PumpError::MissingData(what) => format!(
                "What happened: Required data is missing ({what}).\nLikely causes: No recent pump or glucose readings.\nHow to fix: Run `pumpctl poll` or import glucose history, then retry."
            ),
            PumpError::RadioComms { certainty: Certainty::Uncertain, cause } => format!(
                "What happened: Lost contact with the pump mid-command ({cause}).\nLikely causes: Radio interference or the pump moved out of range.\nHow to fix: Do NOT repeat the dose. Check the pump's history or run `pumpctl poll --force` to learn whether it was delivered."
            ),
            PumpError::RadioComms { cause, .. } => format!(
                "What happened: The pump did not accept the command ({cause}).\nLikely causes: The pump is suspended, busy, or out of range.\nHow to fix: Nothing was delivered. Check the pump, then retry."
            ),
            PumpError::PumpClockDrift { drift_secs } => format!(
                "What happened: The pump clock was {drift_secs}s off and has been corrected.\nLikely causes: Time zone change or pump clock drift.\nHow to fix: Nothing was delivered. Retry the dose."
            ),
            PumpError::Session(SessionError::Timeout { name, waited }) => format!(
                "What happened: Timed out after {}s waiting for the radio ({name}).\nLikely causes: Another command is holding the pump session.\nHow to fix: Wait for it to finish or raise session.acquire_timeout_secs.",
                waited.as_secs()
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("glucose csv must have headers") {
        return "Invalid headers in glucose CSV. Expected 'timestamp,mg_dl'.".to_string();
    }

    if lower.contains("persisted state") {
        return format!(
            "What happened: Could not use the state file.\nLikely causes: It was written by a newer version or is corrupted.\nHow to fix: Point --state at another file or remove it to start fresh. Original: {msg}"
        );
    }

    if lower.contains("must be") || lower.contains("invalid configuration") {
        return format!(
            "What happened: Configuration is invalid ({msg}).\nLikely causes: Out-of-range values in the TOML.\nHow to fix: Edit the config file and try again."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Map `PumpError` kinds to stable exit codes; anything else returns 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    let Some(pe) = err.downcast_ref::<PumpError>() else {
        return 1;
    };
    match pe {
        PumpError::Connection => 3,
        PumpError::RadioComms {
            certainty: Certainty::Certain,
            ..
        } => 4,
        PumpError::RadioComms {
            certainty: Certainty::Uncertain,
            ..
        } => 5,
        PumpError::PumpDataTooOld(_) | PumpError::MissingData(_) | PumpError::InvalidData(_) => 6,
        PumpError::Configuration(_) => 7,
        PumpError::Session(_) => 8,
        PumpError::PumpClockDrift { .. } => 9,
        PumpError::Store(_) | PumpError::Persistence(_) => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    if let Some(pe) = err.downcast_ref::<PumpError>() {
        let certainty = match pe.certainty() {
            Certainty::Certain => "certain",
            Certainty::Uncertain => "uncertain",
        };
        return json!({
            "reason": error_kind_name(pe),
            "certainty": certainty,
            "error": pe.to_string(),
            "message": humanize(err),
        })
        .to_string();
    }

    json!({ "reason": "Error", "message": humanize(err) }).to_string()
}
