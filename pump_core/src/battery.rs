use crate::context::PumpContext;
use pump_traits::{BatteryChemistry, CareEvent};
use std::sync::Mutex;

/// Charge increase that counts as a new battery.
const BATTERY_CHANGE_DELTA: f64 = 0.5;

#[derive(Debug)]
pub struct BatteryMonitor {
    chemistry: BatteryChemistry,
    last_charge: Mutex<Option<f64>>,
}

impl BatteryMonitor {
    pub fn new(chemistry: BatteryChemistry) -> Self {
        Self {
            chemistry,
            last_charge: Mutex::new(None),
        }
    }

    pub fn observe_volts(&self, ctx: &PumpContext, volts: f64) {
        self.observe_charge(ctx, self.chemistry.charge_remaining(volts));
    }

    /// `charge` is a fraction in 0..=1.
    pub fn observe_charge(&self, ctx: &PumpContext, charge: f64) {
        let previous = self
            .last_charge
            .lock()
            .ok()
            .and_then(|mut last| last.replace(charge));
        if charge <= 0.0 && previous.is_none_or(|p| p > 0.0) {
            tracing::warn!("pump battery empty");
            ctx.sinks.notifications.pump_battery_low();
        }
        if let Some(previous) = previous
            && charge - previous >= BATTERY_CHANGE_DELTA
        {
            tracing::info!(previous, new = charge, "battery change detected");
            ctx.sinks
                .care_log
                .record(CareEvent::BatteryChange { previous, new: charge });
        }
    }

    pub fn last_charge(&self) -> Option<f64> {
        self.last_charge.lock().ok().and_then(|c| *c)
    }
}
