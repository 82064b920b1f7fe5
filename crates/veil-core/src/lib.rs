//! veil-core: shared data model, error taxonomy, configuration, and wire format.
//! All other Veil crates depend on this one.

pub mod config;
pub mod error;
pub mod hash;
pub mod types;
pub mod wire;

pub use error::{
    BootstrapError, ConnectionError, DirectoryError, NetworkError, PersistenceError,
    RegistryError, TransferError,
};
pub use hash::{ContentHash, ContentHasher};
pub use types::{
    CommunityDiscoveryResult, CommunityEngagementSettings, CommunityId, ConnectionState,
    ConnectionType, DiscoveryPage, DiscoveryQuery, HealthStatus, JoinRequest, NetworkHealth,
    NetworkMetrics, PeerId, PeerInfo, TransferDirection, TransferOperation, TransferState,
};
