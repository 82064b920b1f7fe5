//! veil-services: the network session core.
//!
//! Components are plain cloneable handles over shared state. A `Session`
//! wires them together around one injected `Transport` and one settings
//! backend.

pub mod bootstrap;
pub mod bus;
pub mod directory;
pub mod health;
pub mod registry;
pub mod retry;
pub mod session;
pub mod settings;
pub mod store;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bootstrap::{BootstrapController, BootstrapPhase, BootstrapPolicy};
pub use bus::{EventBus, SessionEvent, Subscription};
pub use directory::DirectoryClient;
pub use health::HealthAggregator;
pub use registry::{PeerFilter, PeerRegistry};
pub use retry::Backoff;
pub use session::Session;
pub use settings::{FileBackend, KeyValueBackend, MemoryBackend, SettingsStore};
pub use store::{ContentStore, Imported};
pub use transfer::{SeedResult, TransferEngine, TransferPolicy};
pub use transport::{ContentStream, PeerEvent, PeerEventSink, Transport};
