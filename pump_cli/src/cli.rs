//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "pumpctl", version, about = "Insulin pump device manager CLI")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/pump_config.toml")]
    pub config: PathBuf,

    /// Persisted state file; overrides [state] path from the config
    #[arg(long, value_name = "FILE")]
    pub state: Option<PathBuf>,

    /// Emit results and errors as JSON lines instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the engine snapshot (identity, reservoir, dosing state, autosense)
    Status,
    /// Make sure pump data is current, reading the pump if it is stale
    Poll {
        /// Read the pump even if data is fresh
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Deliver a bolus
    Bolus {
        /// Units to deliver
        #[arg(long)]
        units: f64,
        /// Do not send a failure notification
        #[arg(long, action = ArgAction::SetTrue)]
        quiet: bool,
    },
    /// Set a temporary basal rate
    TempBasal {
        /// Rate in units per hour
        #[arg(long)]
        rate: f64,
        /// Duration in minutes (0 cancels)
        #[arg(long)]
        minutes: u64,
    },
    /// Run one autosense pass, optionally importing glucose history first
    Autosense {
        /// Glucose history CSV with headers 'timestamp,mg_dl'
        #[arg(long = "glucose-csv", value_name = "FILE")]
        glucose_csv: Option<PathBuf>,
        /// Enable or disable autosense before running
        #[arg(long, value_name = "BOOL")]
        enabled: Option<bool>,
    },
    /// Tune the radio to the pump's best frequency
    Tune {
        /// Radio device to tune; defaults to the first connected one
        #[arg(long, value_name = "ID")]
        device: Option<String>,
    },
    /// Pair with a pump by its six character ID (omit to unpair)
    SetPumpId {
        /// Pump serial
        id: Option<String>,
    },
    /// Set the pump clock to local time
    SyncClock,
    /// Validate configuration and state, then exit
    SelfCheck,
    /// Run the event dispatcher until Ctrl-C or the tick budget is spent
    Run {
        /// Milliseconds between timer ticks
        #[arg(long, value_name = "MS", default_value_t = 60_000)]
        tick_ms: u64,
        /// Stop after this many ticks
        #[arg(long, value_name = "N")]
        ticks: Option<u64>,
    },
}
