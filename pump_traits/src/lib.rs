pub mod clock;
pub mod stores;
pub mod transport;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use stores::{
    CareEvent, CareLog, CarbStore, DeviceStatusReport, DoseStore, GlucoseStore, LoopTrigger,
    NotificationSink, StoreError, Treatment, UploadError, Uploader,
};
pub use transport::{
    Certainty, CommandStage, DeviceId, FailureCause, PumpCommand, PumpResponse, PumpSession,
    PumpTransport, TransportError,
};
pub use types::*;
