use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    transport::{Connection, ConnectionEvent, PeerCandidate, Rendezvous},
    Result,
};

struct Member {
    peer_id: String,
    candidates_tx: flume::Sender<PeerCandidate>,
}

/// In-process rendezvous. Every member of a swarm is connected to every
/// other member as soon as it joins.
#[derive(Clone)]
pub struct MemoryRendezvous {
    swarms: Arc<Mutex<HashMap<String, Vec<Member>>>>,
    max_message_size: usize,
}

impl MemoryRendezvous {
    pub fn new(max_message_size: usize) -> MemoryRendezvous {
        MemoryRendezvous {
            swarms: Arc::new(Mutex::new(HashMap::new())),
            max_message_size,
        }
    }

    pub fn member_count(&self, swarm_id: &str) -> usize {
        self.swarms.lock().get(swarm_id).map_or(0, |m| m.len())
    }
}

impl Rendezvous for MemoryRendezvous {
    async fn join(&self, swarm_id: &str, peer_id: &str) -> Result<flume::Receiver<PeerCandidate>> {
        let (candidates_tx, candidates_rx) = flume::unbounded();
        let mut swarms = self.swarms.lock();
        let members = swarms.entry(swarm_id.to_owned()).or_default();
        if members.iter().any(|m| m.peer_id == peer_id) {
            bail!("peer {peer_id} already joined swarm {swarm_id}");
        }
        members.retain(|m| !m.candidates_tx.is_disconnected());
        for member in members.iter() {
            let (local, remote) = connection_pair(peer_id, &member.peer_id, self.max_message_size);
            if member.candidates_tx.send(remote).is_ok() {
                let _ = candidates_tx.send(local);
            }
        }
        debug!(swarm_id, peer_id, peers = members.len(), "joined memory swarm");
        members.push(Member {
            peer_id: peer_id.to_owned(),
            candidates_tx,
        });
        Ok(candidates_rx)
    }

    async fn leave(&self, swarm_id: &str, peer_id: &str) -> Result<()> {
        let mut swarms = self.swarms.lock();
        if let Some(members) = swarms.get_mut(swarm_id) {
            members.retain(|m| m.peer_id != peer_id);
            if members.is_empty() {
                swarms.remove(swarm_id);
            }
        }
        Ok(())
    }
}

/// Candidates for both ends of a new connection: the first is handed to
/// `local_id`, the second to `remote_id`. Both report `Connected` right away.
fn connection_pair(
    local_id: &str,
    remote_id: &str,
    max_message_size: usize,
) -> (PeerCandidate, PeerCandidate) {
    let (local_events_tx, local_events_rx) = flume::unbounded();
    let (remote_events_tx, remote_events_rx) = flume::unbounded();
    let closed = Arc::new(AtomicBool::new(false));

    let local = MemoryConnection {
        remote_id: remote_id.to_owned(),
        own_events: local_events_tx.clone(),
        peer_events: remote_events_tx.clone(),
        closed: closed.clone(),
        max_message_size,
    };
    let remote = MemoryConnection {
        remote_id: local_id.to_owned(),
        own_events: remote_events_tx.clone(),
        peer_events: local_events_tx.clone(),
        closed,
        max_message_size,
    };
    let _ = local_events_tx.send(ConnectionEvent::Connected);
    let _ = remote_events_tx.send(ConnectionEvent::Connected);

    (
        PeerCandidate {
            remote_id: remote_id.to_owned(),
            connection: Arc::new(local),
            events: local_events_rx,
        },
        PeerCandidate {
            remote_id: local_id.to_owned(),
            connection: Arc::new(remote),
            events: remote_events_rx,
        },
    )
}

struct MemoryConnection {
    remote_id: String,
    own_events: flume::Sender<ConnectionEvent>,
    peer_events: flume::Sender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
    max_message_size: usize,
}

impl Connection for MemoryConnection {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn send(&self, message: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("connection to {} is closed", self.remote_id);
        }
        if message.len() > self.max_message_size {
            bail!(
                "message of {} bytes exceeds limit of {}",
                message.len(),
                self.max_message_size
            );
        }
        self.peer_events
            .send(ConnectionEvent::Data(message))
            .map_err(|_| anyhow!("peer {} went away", self.remote_id))
    }

    fn destroy(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.peer_events.send(ConnectionEvent::Closed);
            let _ = self.own_events.send(ConnectionEvent::Closed);
        }
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}
