#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Insulin pump device management (radio-agnostic).
//!
//! This crate keeps a paired pump's data current and executes dosing commands
//! against it. All radio traffic goes through `pump_traits::PumpTransport`;
//! persistence of doses and glucose goes through the store traits.
//!
//! ## Architecture
//!
//! - **Sessions**: exclusive, FIFO-ordered pump access (`session` module)
//! - **Freshness**: when pump data counts as stale (`freshness`)
//! - **Polling**: status reads, clock sync, reservoir and battery (`poller`)
//! - **Dosing**: bolus and temp basal enactment with retry tables (`bolus`, `temp_basal`, `hw_error`)
//! - **Radio**: tuning and bridge prioritization (`tuner`)
//! - **Autosense**: sensitivity factor and override management (`autosense`)
//! - **Events**: background dispatch of timer, CGM and sentry events (`dispatcher`)
//!
//! Every operation receives a `PumpContext` explicitly; there is no global state.

pub mod autosense;
pub mod battery;
pub mod bolus;
pub mod builder;
pub mod clock_sync;
pub mod config;
pub mod context;
pub mod conversions;
pub mod dispatcher;
pub mod error;
pub mod freshness;
pub mod history;
pub mod hw_error;
pub mod manager;
pub mod mocks;
pub mod poller;
pub mod reservoir;
pub mod sentry;
pub mod session;
pub mod settings;
pub mod sinks;
pub mod status;
pub mod temp_basal;
pub mod tuner;

pub use autosense::{AutosenseOutcome, OverrideAction};
pub use builder::DeviceManagerBuilder;
pub use config::EngineCfg;
pub use context::PumpContext;
pub use dispatcher::{DeviceEvent, Dispatcher};
pub use error::{BuildError, PumpError, PumpResult, Result, SessionError};
pub use manager::DeviceManager;
pub use sentry::{PendingReservoir, SentryAction};
pub use session::CancellationToken;
pub use status::{BolusState, DoseOutcome, PollReport, Snapshot, TempBasalState};
pub use temp_basal::TempBasalRecommendation;
pub use tuner::TroubleshootOutcome;
