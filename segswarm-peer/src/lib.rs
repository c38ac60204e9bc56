pub mod actor;
mod error;
pub mod fallback;
pub mod fetch;
pub mod identity;
pub mod linked_map;
pub mod memory;
pub mod observable;
pub mod peer_link;
pub mod proto;
pub mod retry;
pub mod segment_cache;
pub mod settings;
pub mod swarm;
pub mod swarm_manager;
pub mod transport;
pub mod types;

pub use error::{
    is_cancelled, is_exchange_pending, CancelError, Error, ErrorClass, ExchangePending,
    PeerRequestError, Result,
};
pub use fallback::{FallbackLoader, FallbackRequests};
pub use fetch::{FetchProgress, SegmentFetch};
pub use memory::MemoryRendezvous;
pub use segment_cache::SegmentCache;
pub use settings::Settings;
pub use swarm::{Swarm, SwarmClient};
pub use swarm_manager::SwarmManager;
pub use transport::{Connection, ConnectionEvent, PeerCandidate, Rendezvous};
pub use types::{ByteRange, PeerSegmentStatus, Segment, SegmentAnnouncement, Stream, StreamKind};

#[cfg(test)]
pub mod tests;
