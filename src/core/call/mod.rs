mod registry;
mod session;

pub use registry::{Call, CallRegistry, CallState, HistoryEntry, MediaCommand, Speaker};
pub use session::{CallManager, InitiateOutcome, ProviderEvent, TurnTiming};
