pub mod bridge;
pub mod codec;
pub mod error;
pub mod poller;
pub mod products;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod server;

pub use bridge::{QueuePublisher, RequestOutcome, RequestPublisher, SyncBridge};
pub use error::BridgeError;
pub use registry::{CorrelationRegistry, EntryStatus, ResolveOutcome};
