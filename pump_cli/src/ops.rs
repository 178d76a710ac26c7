//! Engine assembly and command execution.
//!
//! The CLI drives the simulated pump: every invocation builds a fresh
//! simulator and in-memory stores, while pairing, device and autosense state
//! carry over through the persisted state file.

use crate::cli::Commands;
use eyre::{Result, WrapErr};
use pump_config::{PumpIdentity, PumpState};
use pump_core::mocks::{InMemoryCarbStore, InMemoryDoseStore, InMemoryGlucoseStore};
use pump_core::status::LastError;
use pump_core::{
    AutosenseOutcome, DeviceEvent, DeviceManager, Dispatcher, DoseOutcome, EngineCfg, PollReport,
    Snapshot, TempBasalRecommendation,
};
use pump_hardware::{SimulatedPump, SimulatedTransport};
use pump_traits::{
    Clock, CommandStage, DeviceId, FailureCause, PumpModel, PumpTransport, SystemClock,
    TransportError,
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SIM_DEVICE: &str = "rl-1";
const DEFAULT_MODEL: &str = "523";
/// Stand-in serial for the simulator while no pump is paired.
const UNPAIRED_SIM_ID: &str = "000000";

/// Engine plus the simulator behind it.
pub struct Engine {
    pub manager: Arc<DeviceManager>,
    pub transport: Arc<SimulatedTransport>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

/// Effective state path: the CLI flag wins over `[state] path`.
pub fn state_path(cfg: &pump_config::Config, flag: Option<&Path>) -> Option<PathBuf> {
    flag.map(Path::to_path_buf)
        .or_else(|| cfg.state.path.as_ref().map(PathBuf::from))
}

pub fn build_engine(cfg: &pump_config::Config, state: Option<&Path>) -> Result<Engine> {
    let persisted = match state {
        Some(p) => pump_config::load_state(p)?,
        None => pump_config::PersistedState::default(),
    };

    let seed_identity = cfg.pump.pump_id.as_ref().map(|id| PumpIdentity {
        pump_id: id.clone(),
        region: cfg.pump.region,
        model: cfg.pump.model.as_deref().map(PumpModel::new),
    });
    let seed_state = PumpState {
        utc_offset_secs: cfg.pump.utc_offset_secs.unwrap_or(0),
        model: cfg.pump.model.as_deref().map(PumpModel::new),
    };

    let identity = persisted.pump_identity.clone().or_else(|| seed_identity.clone());
    let sim_id = identity
        .as_ref()
        .map(|i| i.pump_id.clone())
        .unwrap_or_else(|| UNPAIRED_SIM_ID.to_string());
    let model = persisted
        .pump_state
        .as_ref()
        .and_then(|s| s.model.clone())
        .or_else(|| identity.as_ref().and_then(|i| i.model.clone()))
        .map(|m| m.number)
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let pump = SimulatedPump::new(&sim_id, &model, clock.clone())
        .wrap_err("failed to initialize the pump simulator")?;
    pump.set_utc_offset_secs(
        persisted
            .pump_state
            .as_ref()
            .map(|s| s.utc_offset_secs)
            .unwrap_or(seed_state.utc_offset_secs),
    );
    apply_sim_env(&pump)?;

    let transport = Arc::new(SimulatedTransport::new(pump, &[SIM_DEVICE]));
    if env_flag("PUMPCTL_SIM_DISCONNECTED") {
        transport.set_connected(SIM_DEVICE, false)?;
    }

    let mut builder = DeviceManager::builder()
        .with_config(EngineCfg::from(cfg))
        .with_clock(clock.clone())
        .with_transport(transport.clone())
        .with_stores(
            Arc::new(InMemoryDoseStore::new(clock)),
            Arc::new(InMemoryGlucoseStore::new()),
            Arc::new(InMemoryCarbStore::new()),
        )
        .with_state(persisted)
        .with_pump_state(seed_state);
    if let Some(id) = seed_identity {
        builder = builder.with_pump_identity(id);
    }
    if let Some(p) = state {
        builder = builder.with_state_path(p);
    }
    let manager = builder.build()?;

    Ok(Engine {
        manager: Arc::new(manager),
        transport,
    })
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Simulator knobs for scripted runs:
/// `PUMPCTL_SIM_RESERVOIR=<units>` and `PUMPCTL_SIM_FAULT=<command>:<certain|uncertain|power-on>`.
fn apply_sim_env(pump: &SimulatedPump) -> Result<()> {
    if let Ok(v) = std::env::var("PUMPCTL_SIM_RESERVOIR") {
        let units: f64 = v
            .trim()
            .parse()
            .wrap_err_with(|| format!("PUMPCTL_SIM_RESERVOIR is not a number: {v}"))?;
        pump.set_reservoir(units);
    }
    if let Ok(v) = std::env::var("PUMPCTL_SIM_FAULT") {
        let (command, kind) = v
            .split_once(':')
            .ok_or_else(|| eyre::eyre!("PUMPCTL_SIM_FAULT must look like <command>:<kind>"))?;
        let command = sim_command(command.trim())?;
        let error = match kind.trim() {
            "certain" => TransportError::Certain(FailureCause::Rejected("simulated".into())),
            "uncertain" => TransportError::Uncertain(FailureCause::Timeout),
            "power-on" => TransportError::Uncertain(FailureCause::NoResponse(CommandStage::PowerOn)),
            other => eyre::bail!("unknown simulated fault kind: {other}"),
        };
        pump.fail_next(command, error);
    }
    Ok(())
}

fn sim_command(name: &str) -> Result<&'static str> {
    const COMMANDS: [&str; 9] = [
        "read_status",
        "read_remaining_insulin",
        "read_time",
        "set_time",
        "read_history",
        "bolus",
        "temp_basal",
        "tune_radio",
        "set_basal_schedule",
    ];
    COMMANDS
        .iter()
        .copied()
        .find(|c| *c == name)
        .ok_or_else(|| eyre::eyre!("unknown pump command for simulated fault: {name}"))
}

// ── Output ───────────────────────────────────────────────────────────────────

/// What a command prints: a JSON object in `--json` mode, text otherwise.
#[derive(Debug)]
pub struct Output {
    pub json: Value,
    pub text: String,
}

impl Output {
    fn new(json: Value, text: impl Into<String>) -> Self {
        Self {
            json,
            text: text.into(),
        }
    }

    pub fn render(&self, json_mode: bool) -> String {
        if json_mode {
            self.json.to_string()
        } else {
            self.text.clone()
        }
    }
}

fn last_error_json(e: &Option<LastError>) -> Value {
    match e {
        Some(e) => json!({ "at": e.at.to_rfc3339(), "error": e.error.to_string() }),
        None => Value::Null,
    }
}

pub fn snapshot_json(s: &Snapshot) -> Value {
    json!({
        "command": "status",
        "at": s.at.to_rfc3339(),
        "pump_id": s.pump_identity.as_ref().map(|p| p.pump_id.clone()),
        "model": s.pump_identity.as_ref().and_then(|p| p.model.as_ref()).map(|m| m.number.clone()),
        "reservoir_units": s.reservoir.map(|r| r.units),
        "reservoir_at": s.reservoir.map(|r| r.at.to_rfc3339()),
        "stale": s.stale,
        "forced_read": s.forced_read,
        "unverified": s.unverified,
        "bolus": format!("{:?}", s.bolus),
        "temp_basal": format!("{:?}", s.temp_basal),
        "last_error": last_error_json(&s.last_error),
        "autosense_enabled": s.autosense_enabled,
        "autosense_factor": s.autosense_factor,
        "override_scale": s.active_override.as_ref().and_then(|o| o.insulin_needs_scale),
        "devices": s.devices.iter().map(|(id, d)| json!({
            "id": id.0,
            "last_tuned": d.last_tuned.map(|t| t.to_rfc3339()),
            "frequency_mhz": d.last_valid_frequency,
        })).collect::<Vec<_>>(),
        "session_attempts": s.session_attempts,
    })
}

fn snapshot_text(s: &Snapshot) -> String {
    let mut lines = Vec::new();
    match &s.pump_identity {
        Some(p) => lines.push(format!(
            "Pump: {} (model {})",
            p.pump_id,
            p.model.as_ref().map(|m| m.number.as_str()).unwrap_or("unknown")
        )),
        None => lines.push("Pump: not paired".to_string()),
    }
    match s.reservoir {
        Some(r) => lines.push(format!("Reservoir: {:.1} U at {}", r.units, r.at.to_rfc3339())),
        None => lines.push("Reservoir: no data".to_string()),
    }
    lines.push(format!(
        "Data: {}{}",
        if s.stale { "stale" } else { "fresh" },
        if s.unverified { ", unverified" } else { "" }
    ));
    lines.push(format!(
        "Autosense: {} (factor {:.2})",
        if s.autosense_enabled { "enabled" } else { "disabled" },
        s.autosense_factor
    ));
    if let Some(e) = &s.last_error {
        lines.push(format!("Last error: {} at {}", e.error, e.at.to_rfc3339()));
    }
    lines.join("\n")
}

// ── Commands ─────────────────────────────────────────────────────────────────

pub fn execute(
    engine: &Engine,
    cmd: &Commands,
    glucose_csv: Option<&Path>,
    shutdown: Arc<AtomicBool>,
) -> Result<Output> {
    let m = &engine.manager;
    match cmd {
        Commands::Status => {
            let s = m.snapshot();
            Ok(Output::new(snapshot_json(&s), snapshot_text(&s)))
        }
        Commands::SelfCheck => {
            let radio = engine.transport.first_connected();
            let paired = m.snapshot().pump_identity.is_some();
            let text = match &radio {
                Some(d) => format!("OK: radio {d} connected, pump {}.", if paired { "paired" } else { "not paired" }),
                None => "OK: configuration valid, no radio connected.".to_string(),
            };
            Ok(Output::new(
                json!({ "command": "self-check", "status": "ok", "radio": radio.map(|d| d.0), "paired": paired }),
                text,
            ))
        }
        Commands::Poll { force } => {
            let report = if *force {
                m.trigger_pump_data_read()?
            } else {
                m.assert_current_pump_data()?
            };
            Ok(poll_output(&report))
        }
        Commands::Bolus { units, quiet } => {
            let now = m.context().now();
            m.enact_bolus(*units, now, *quiet)?;
            let reservoir = m.snapshot().reservoir.map(|r| r.units);
            Ok(Output::new(
                json!({ "command": "bolus", "units": units, "status": "confirmed", "reservoir_units": reservoir }),
                format!("Bolus of {units:.2} U confirmed."),
            ))
        }
        Commands::TempBasal { rate, minutes } => {
            let rec = TempBasalRecommendation {
                rate: *rate,
                duration: Duration::from_secs(minutes.saturating_mul(60)),
            };
            let now = m.context().now();
            match m.enact_temp_basal(rec, now) {
                DoseOutcome::Confirmed(entry) => Ok(Output::new(
                    json!({
                        "command": "temp-basal",
                        "status": "confirmed",
                        "rate": entry.value,
                        "start": entry.start.to_rfc3339(),
                        "end": entry.end.to_rfc3339(),
                    }),
                    format!(
                        "Temp basal {:.2} U/h until {}.",
                        entry.value,
                        entry.end.to_rfc3339()
                    ),
                )),
                DoseOutcome::FailedCertain(e) | DoseOutcome::FailedUncertain(e) => Err(e.into()),
            }
        }
        Commands::Autosense { enabled, .. } => {
            if let Some(on) = enabled {
                m.set_autosense_enabled(*on)?;
            }
            if let Some(path) = glucose_csv {
                let samples = pump_config::load_glucose_csv(path)?;
                tracing::info!(count = samples.len(), path = %path.display(), "imported glucose");
                m.add_glucose(&samples, Some("csv"))?;
            }
            let outcome = m.run_autosense()?;
            Ok(autosense_output(&outcome))
        }
        Commands::Tune { device } => {
            let freq = m.tune_radio(device.as_ref().map(DeviceId::new))?;
            Ok(Output::new(
                json!({ "command": "tune", "frequency_mhz": freq }),
                format!("Tuned to {freq:.3} MHz."),
            ))
        }
        Commands::SetPumpId { id } => {
            m.set_pump_id(id.as_deref())?;
            let text = match id {
                Some(id) => format!("Paired with pump {id}."),
                None => "Pump unpaired.".to_string(),
            };
            Ok(Output::new(
                json!({ "command": "set-pump-id", "pump_id": id }),
                text,
            ))
        }
        Commands::SyncClock => {
            m.sync_pump_clock()?;
            Ok(Output::new(
                json!({ "command": "sync-clock", "status": "ok" }),
                "Pump clock set.",
            ))
        }
        Commands::Run { tick_ms, ticks } => run_loop(engine, *tick_ms, *ticks, &shutdown),
    }
}

fn poll_output(report: &PollReport) -> Output {
    match report {
        PollReport::Fresh => Output::new(
            json!({ "command": "poll", "result": "fresh" }),
            "Pump data is current.",
        ),
        PollReport::AlreadyRunning => Output::new(
            json!({ "command": "poll", "result": "already_running" }),
            "A pump read is already running.",
        ),
        PollReport::Completed {
            reservoir,
            history_events,
            clock_corrected,
        } => Output::new(
            json!({
                "command": "poll",
                "result": "completed",
                "reservoir_units": reservoir.units,
                "history_events": history_events,
                "clock_corrected": clock_corrected,
            }),
            format!(
                "Read pump: reservoir {:.1} U, {} history event(s){}.",
                reservoir.units,
                history_events,
                if *clock_corrected { ", clock corrected" } else { "" }
            ),
        ),
    }
}

fn autosense_output(outcome: &AutosenseOutcome) -> Output {
    match outcome {
        AutosenseOutcome::TooSoon { last_run } => Output::new(
            json!({ "command": "autosense", "result": "too_soon", "last_run": last_run.to_rfc3339() }),
            format!("Autosense already ran at {}.", last_run.to_rfc3339()),
        ),
        AutosenseOutcome::InsufficientData {
            samples,
            analyzed_secs,
        } => Output::new(
            json!({
                "command": "autosense",
                "result": "insufficient_data",
                "samples": samples,
                "analyzed_secs": analyzed_secs,
            }),
            format!(
                "Not enough glucose data ({samples} samples over {} min); nothing changed.",
                analyzed_secs / 60
            ),
        ),
        AutosenseOutcome::Applied {
            stats,
            factor,
            action,
        } => Output::new(
            json!({
                "command": "autosense",
                "result": "applied",
                "samples": stats.samples,
                "high_ratio": stats.high_ratio(),
                "low_ratio": stats.low_ratio(),
                "factor": factor.value,
                "rounded": factor.rounded,
                "action": format!("{action:?}"),
            }),
            format!(
                "Autosense factor {:.2} (rounded {:.1}); {:?}.",
                factor.value, factor.rounded, action
            ),
        ),
    }
}

/// Feed timer and autosense ticks to the dispatcher until shutdown or the budget runs out.
fn run_loop(
    engine: &Engine,
    tick_ms: u64,
    ticks: Option<u64>,
    shutdown: &AtomicBool,
) -> Result<Output> {
    let dispatcher = Dispatcher::spawn(engine.manager.clone());
    let step = Duration::from_millis(tick_ms.clamp(1, 50));
    let period = Duration::from_millis(tick_ms.max(1));
    let mut sent = 0u64;
    tracing::info!(tick_ms, ?ticks, "dispatcher running");

    'ticks: while ticks.is_none_or(|n| sent < n) {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if !dispatcher.send(DeviceEvent::TimerTick) {
            break;
        }
        dispatcher.send(DeviceEvent::AutosenseTick);
        sent += 1;
        if ticks.is_some_and(|n| sent >= n) {
            break;
        }
        let start = std::time::Instant::now();
        while start.elapsed() < period {
            if shutdown.load(Ordering::Relaxed) {
                break 'ticks;
            }
            std::thread::sleep(step);
        }
    }

    let handled = dispatcher.handled();
    dispatcher.shutdown();
    let s = engine.manager.snapshot();
    tracing::info!(ticks = sent, handled, "dispatcher stopped");
    Ok(Output::new(
        json!({
            "command": "run",
            "ticks": sent,
            "stale": s.stale,
            "reservoir_units": s.reservoir.map(|r| r.units),
        }),
        format!("Stopped after {sent} tick(s)."),
    ))
}
