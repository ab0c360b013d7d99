pub mod archive;
pub mod config;
pub mod content;
pub mod cycle;
pub mod error;
pub mod interpret;
pub mod logqueue;
pub mod ota;
pub mod payload;
pub mod platform;
pub mod protocol;
pub mod retry;
pub mod sleep;
pub mod status;
pub mod store;
pub mod wake;

pub use archive::{ArchiveSlot, ContentArchive, FsArchive, MemoryArchive};
pub use config::{BoardConfig, ButtonConfig, CycleConfig, NetworkConfig, RuntimeConfig};
pub use cycle::{BootReadings, Collaborators, SessionContext, WakeCycle};
pub use error::{
    ContentError, ErrorClass, FirmwareError, NetworkError, ProtocolError, StoreError,
    TransportError,
};
pub use interpret::{DisplayDirective, PollStatus, RenderRequest};
pub use logqueue::{DeviceStatusStamp, LogDrain, LogEntry, LogQueue};
pub use ota::{FirmwareReport, FirmwareSink};
pub use payload::{ImageFormat, ImagePayload};
pub use platform::{ButtonInput, Clock, Network, RenderHints, Renderer};
pub use protocol::{
    ApiDisplayResponse, ApiSetupResponse, DeviceHeaders, Header, HttpResponse, ProtocolSession,
    RequestLimits, SpecialFunction, Transport,
};
pub use retry::{RetryDomain, RetryStep};
pub use sleep::{CycleExit, CycleOutcome, RestartReason, SleepPlan, SleepScheduler, WakeSource};
pub use status::{MessageKind, StatusScreen};
pub use store::{keys, MemoryStore, Store, StoredValue};
pub use wake::{ButtonAction, WakeCause, WakeClassifier};
