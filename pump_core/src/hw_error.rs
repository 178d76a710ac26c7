//! Maps transport failures onto the engine taxonomy and decides what to do next.
//!
//! The transport hands us a closed classification, so no error text is ever
//! inspected here. The `*_disposition` functions hold the certain/uncertain
//! decision tables used by the bolus and temp basal enactors.

use crate::error::PumpError;
use pump_traits::TransportError;

impl From<TransportError> for PumpError {
    fn from(e: TransportError) -> Self {
        map_transport_error(e)
    }
}

pub fn map_transport_error(e: TransportError) -> PumpError {
    match e {
        TransportError::NotConnected(_) => PumpError::Connection,
        TransportError::Certain(cause) => PumpError::RadioComms {
            certainty: pump_traits::Certainty::Certain,
            cause,
        },
        TransportError::Uncertain(cause) => PumpError::RadioComms {
            certainty: pump_traits::Certainty::Uncertain,
            cause,
        },
    }
}

/// What a dosing enactor should do with a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Pump says a bolus is already running: treat the request as delivered.
    AlreadyDelivering,
    /// Transient radio condition; another attempt in the same session is safe.
    Retry,
    /// Stop here.
    Terminal,
}

/// Bolus table: only the power-on signature is retried.
pub fn bolus_disposition(e: &PumpError) -> Disposition {
    if e.is_bolus_in_progress() && !e.is_uncertain() {
        Disposition::AlreadyDelivering
    } else if e.is_transient_radio() {
        Disposition::Retry
    } else {
        Disposition::Terminal
    }
}

/// Temp basal table: a repeated temp basal replaces the previous one, so any
/// uncertain failure may be retried, except while a bolus runs.
pub fn temp_basal_disposition(e: &PumpError) -> Disposition {
    if e.is_bolus_in_progress() || !e.is_uncertain() {
        Disposition::Terminal
    } else {
        Disposition::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pump_traits::{CommandStage, DeviceId, FailureCause};

    fn certain(c: FailureCause) -> PumpError {
        TransportError::Certain(c).into()
    }

    fn uncertain(c: FailureCause) -> PumpError {
        TransportError::Uncertain(c).into()
    }

    #[test]
    fn not_connected_maps_to_connection() {
        let e: PumpError = TransportError::NotConnected(DeviceId::new("rl")).into();
        assert_eq!(e, PumpError::Connection);
    }

    #[test]
    fn bolus_table() {
        assert_eq!(
            bolus_disposition(&certain(FailureCause::BolusInProgress)),
            Disposition::AlreadyDelivering
        );
        assert_eq!(
            bolus_disposition(&uncertain(FailureCause::NoResponse(CommandStage::PowerOn))),
            Disposition::Retry
        );
        assert_eq!(
            bolus_disposition(&uncertain(FailureCause::UnknownResponse(CommandStage::PowerOn))),
            Disposition::Retry
        );
        assert_eq!(
            bolus_disposition(&uncertain(FailureCause::NoResponse(CommandStage::Command))),
            Disposition::Terminal
        );
        assert_eq!(
            bolus_disposition(&certain(FailureCause::Rejected("x".into()))),
            Disposition::Terminal
        );
        assert_eq!(
            bolus_disposition(&PumpError::Connection),
            Disposition::Terminal
        );
    }

    #[test]
    fn temp_basal_table() {
        assert_eq!(
            temp_basal_disposition(&certain(FailureCause::BolusInProgress)),
            Disposition::Terminal
        );
        assert_eq!(
            temp_basal_disposition(&uncertain(FailureCause::BolusInProgress)),
            Disposition::Terminal
        );
        assert_eq!(
            temp_basal_disposition(&uncertain(FailureCause::Timeout)),
            Disposition::Retry
        );
        assert_eq!(
            temp_basal_disposition(&certain(FailureCause::Suspended)),
            Disposition::Terminal
        );
    }
}
