use std::{fmt, future::Future, sync::Arc};

use bytes::Bytes;

use crate::Result;

/// A bidirectional message channel to one remote peer.
pub trait Connection: Send + Sync {
    fn remote_id(&self) -> &str;

    /// Queue one message for delivery. Messages arrive in send order.
    fn send(&self, message: Bytes) -> Result<()>;

    /// Tear the connection down. The remote side observes `Closed`.
    fn destroy(&self);

    /// Largest message `send` accepts.
    fn max_message_size(&self) -> usize;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Data(Bytes),
    Closed,
    Error(String),
}

/// A connection offered by the rendezvous, not yet known to be usable.
pub struct PeerCandidate {
    pub remote_id: String,
    pub connection: Arc<dyn Connection>,
    pub events: flume::Receiver<ConnectionEvent>,
}

impl fmt::Debug for PeerCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerCandidate")
            .field("remote_id", &self.remote_id)
            .finish_non_exhaustive()
    }
}

/// Discovers other members of a swarm and yields connections to them.
pub trait Rendezvous: Clone + Send + Sync + 'static {
    /// Register `peer_id` in the swarm and return a stream of candidate
    /// connections. The stream ends when the registration is lost.
    fn join(
        &self,
        swarm_id: &str,
        peer_id: &str,
    ) -> impl Future<Output = Result<flume::Receiver<PeerCandidate>>> + Send;

    fn leave(&self, swarm_id: &str, peer_id: &str) -> impl Future<Output = Result<()>> + Send;
}
