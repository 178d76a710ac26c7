//! Pump transport implementations.
//!
//! Only the simulator ships here; a radio bridge driver implements the same
//! `PumpTransport` trait from `pump_traits`.
pub mod error;
pub mod sim;

pub use error::HwError;
pub use sim::{SimulatedPump, SimulatedTransport};
