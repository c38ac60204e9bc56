//! Per-rendition swarm coordination.
//!
//! A [`SwarmCoordinator`] joins the rendezvous for one stream rendition,
//! keeps a [`PeerLink`] per remote participant, tells every connected peer
//! which segments it can serve, answers their requests from the shared cache
//! and picks peers to download from. It runs as an actor; [`Swarm`] is the
//! handle used to talk to it.

use std::{collections::HashMap, ops::Deref, sync::Arc};

use anyhow::anyhow;
use rand::seq::IteratorRandom;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Level};

use crate::{
    actor::{Actor, Client, Operator, Respondable, ResponseChannel},
    backoff_retry,
    error::is_cancelled,
    fallback::FallbackLoader,
    fetch::{ExchangeSignal, SegmentFetch},
    identity::{generate_peer_id, swarm_id},
    observable::Subscription,
    peer_link::{LinkEvent, PeerLink},
    retry::Retry,
    segment_cache::{CacheChange, SegmentCache},
    settings::Settings,
    transport::{ConnectionEvent, PeerCandidate, Rendezvous},
    types::{PeerSegmentStatus, Segment, SegmentAnnouncement, Stream},
    Result,
};

pub enum Request {
    /// Start downloading a segment from a peer that has it, if any.
    Download {
        segment: Arc<Segment>,
        response_tx: ResponseChannel<Response>,
    },
    /// Whether any known peer reports any status for a segment.
    IsRequestableElsewhere {
        segment: Arc<Segment>,
        response_tx: ResponseChannel<Response>,
    },
    /// The announcement currently sent to peers.
    Announcement {
        response_tx: ResponseChannel<Response>,
    },
    ConnectedPeers {
        response_tx: ResponseChannel<Response>,
    },
    PeerSegmentStatus {
        remote_id: String,
        external_id: String,
        response_tx: ResponseChannel<Response>,
    },
}

impl Respondable for Request {
    type Response = Response;

    fn set_response(&mut self, ch: ResponseChannel<Self::Response>) {
        match self {
            Request::Download { response_tx, .. }
            | Request::IsRequestableElsewhere { response_tx, .. }
            | Request::Announcement { response_tx }
            | Request::ConnectedPeers { response_tx }
            | Request::PeerSegmentStatus { response_tx, .. } => *response_tx = ch,
        }
    }

    fn response_tx(self) -> ResponseChannel<Self::Response> {
        match self {
            Request::Download { response_tx, .. }
            | Request::IsRequestableElsewhere { response_tx, .. }
            | Request::Announcement { response_tx }
            | Request::ConnectedPeers { response_tx }
            | Request::PeerSegmentStatus { response_tx, .. } => response_tx,
        }
    }
}

#[derive(Debug)]
pub enum Response {
    Download(Option<SegmentFetch>),
    IsRequestableElsewhere(bool),
    Announcement(SegmentAnnouncement),
    ConnectedPeers(Vec<String>),
    PeerSegmentStatus(Option<PeerSegmentStatus>),
}

/// Things that happen to a swarm outside of client requests.
#[derive(Debug)]
enum SwarmEvent {
    Connection {
        remote_id: String,
        seq: u64,
        event: ConnectionEvent,
    },
    CacheChanged,
    FallbackChanged,
}

pub struct SwarmCoordinator<R: Rendezvous> {
    stream_id: String,
    swarm_id: String,
    peer_id: String,
    rendezvous: R,
    cache: SegmentCache,
    fallback: Arc<dyn FallbackLoader>,
    settings: Settings,
    retry: Retry,

    links: HashMap<String, PeerLink>,
    next_candidate_seq: u64,
    subscriptions: Vec<Subscription>,
    forwarders: CancellationToken,

    events_tx: flume::Sender<SwarmEvent>,
    events_rx: flume::Receiver<SwarmEvent>,
    signal_tx: flume::Sender<ExchangeSignal>,
    signal_rx: flume::Receiver<ExchangeSignal>,
}

impl<R: Rendezvous> SwarmCoordinator<R> {
    /// A coordinator for `stream`, a rendition of the manifest at
    /// `manifest_url`.
    pub fn new(
        manifest_url: &str,
        stream: &Stream,
        rendezvous: R,
        cache: SegmentCache,
        fallback: Arc<dyn FallbackLoader>,
        settings: Settings,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let (signal_tx, signal_rx) = flume::unbounded();
        let retry = Retry::with_max_elapsed(settings.rendezvous_retry_max_elapsed);
        SwarmCoordinator {
            stream_id: stream.local_id.clone(),
            swarm_id: swarm_id(manifest_url, stream),
            peer_id: generate_peer_id(),
            rendezvous,
            cache,
            fallback,
            settings,
            retry,
            links: HashMap::new(),
            next_candidate_seq: 0,
            subscriptions: vec![],
            forwarders: CancellationToken::new(),
            events_tx,
            events_rx,
            signal_tx,
            signal_rx,
        }
    }

    pub fn swarm_id(&self) -> &str {
        &self.swarm_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn subscribe(&mut self) {
        let stream_id = self.stream_id.clone();
        let events_tx = self.events_tx.clone();
        self.subscriptions
            .push(self.cache.subscribe(move |change: &CacheChange| {
                if change.touches(&stream_id) {
                    let _ = events_tx.send(SwarmEvent::CacheChanged);
                }
            }));
        let events_tx = self.events_tx.clone();
        self.subscriptions
            .push(self.fallback.subscribe(Box::new(move || {
                let _ = events_tx.send(SwarmEvent::FallbackChanged);
            })));
    }

    async fn join(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<flume::Receiver<PeerCandidate>>> {
        let mut candidates = None;
        let res = backoff_retry!(cancel, self.retry, {
            let rx = self
                .rendezvous
                .join(&self.swarm_id, &self.peer_id)
                .await
                .map_err(backoff::Error::transient)?;
            candidates = Some(rx);
        });
        match res {
            Ok(()) => {
                info!(swarm_id = self.swarm_id, peer_id = self.peer_id, "joined swarm");
                Ok(candidates)
            }
            Err(e) if is_cancelled(&e) => Err(e),
            Err(e) => {
                warn!(swarm_id = self.swarm_id, err = ?e, "giving up on rendezvous");
                Ok(None)
            }
        }
    }

    fn add_candidate(&mut self, candidate: PeerCandidate) {
        self.next_candidate_seq += 1;
        let seq = self.next_candidate_seq;
        let PeerCandidate {
            remote_id,
            connection,
            events,
        } = candidate;
        debug!(swarm_id = self.swarm_id, remote_id, seq, "peer candidate");

        if self.links.get(&remote_id).is_some_and(|l| l.is_closed()) {
            self.links.remove(&remote_id);
        }
        let signal_tx = self.signal_tx.clone();
        let timeout = self.settings.p2p_segment_download_timeout;
        self.links
            .entry(remote_id.clone())
            .or_insert_with(|| PeerLink::new(remote_id.clone(), signal_tx, timeout))
            .add_candidate(seq, connection);

        let events_tx = self.events_tx.clone();
        let cancel = self.forwarders.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = cancel.cancelled() => return,
                    res = events.recv_async() => {
                        let event = res.unwrap_or(ConnectionEvent::Closed);
                        let last = event == ConnectionEvent::Closed;
                        let sent = events_tx.send(SwarmEvent::Connection {
                            remote_id: remote_id.clone(),
                            seq,
                            event,
                        });
                        if last || sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn handle_event(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::Connection {
                remote_id,
                seq,
                event,
            } => {
                let Some(link) = self.links.get_mut(&remote_id) else {
                    return;
                };
                match link.handle_connection_event(seq, event) {
                    Some(LinkEvent::Connected) => {
                        info!(swarm_id = self.swarm_id, remote_id, "peer connected");
                        let announcement = self.announcement();
                        if let Some(link) = self.links.get(&remote_id) {
                            link.send_announcement(&announcement);
                        }
                    }
                    Some(LinkEvent::Closed) => {
                        info!(swarm_id = self.swarm_id, remote_id, "peer closed");
                        self.links.remove(&remote_id);
                    }
                    Some(LinkEvent::SegmentRequested {
                        segment_id,
                        byte_offset,
                    }) => self.serve(&remote_id, &segment_id, byte_offset),
                    Some(LinkEvent::AnnouncementChanged) => {
                        trace!(swarm_id = self.swarm_id, remote_id, "peer announcement");
                    }
                    None => {}
                }
            }
            SwarmEvent::CacheChanged | SwarmEvent::FallbackChanged => {
                self.broadcast_announcement();
            }
        }
    }

    fn serve(&mut self, remote_id: &str, segment_id: &str, byte_offset: Option<u64>) {
        let data = self.cache.get(&self.stream_id, segment_id);
        let Some(link) = self.links.get_mut(remote_id) else {
            return;
        };
        match data {
            Some(data) => link.send_segment(segment_id, data, byte_offset),
            None => {
                debug!(remote_id, segment_id, "requested segment not cached");
                link.send_segment_absent(segment_id);
            }
        }
    }

    /// What this node can offer for its stream right now.
    fn announcement(&self) -> SegmentAnnouncement {
        let loaded = self.cache.stored_external_ids(&self.stream_id);
        let mut loading_via_fallback: Vec<String> = self
            .fallback
            .in_flight()
            .into_iter()
            .filter(|s| s.stream_id == self.stream_id)
            .map(|s| s.external_id.clone())
            .collect();
        loading_via_fallback.sort();
        SegmentAnnouncement {
            loaded,
            loading_via_fallback,
        }
    }

    fn broadcast_announcement(&self) {
        let announcement = self.announcement();
        let mut sent = 0;
        for link in self.links.values().filter(|l| l.is_connected()) {
            link.send_announcement(&announcement);
            sent += 1;
        }
        trace!(
            swarm_id = self.swarm_id,
            peers = sent,
            loaded = announcement.loaded.len(),
            loading = announcement.loading_via_fallback.len(),
            "broadcast announcement"
        );
    }

    fn download(&mut self, segment: Arc<Segment>) -> Result<Option<SegmentFetch>> {
        let link = self
            .links
            .values_mut()
            .filter(|l| {
                l.is_connected()
                    && !l.has_pending_exchange()
                    && l.segment_status(&segment.external_id) == Some(PeerSegmentStatus::Loaded)
            })
            .choose(&mut rand::thread_rng());
        match link {
            Some(link) => Ok(Some(link.request_segment(segment, None)?)),
            None => {
                trace!(segment = segment.external_id, "not available via peers");
                Ok(None)
            }
        }
    }

    async fn teardown(&mut self) {
        self.subscriptions.clear();
        self.forwarders.cancel();
        for (_, mut link) in self.links.drain() {
            link.destroy();
        }
        if let Err(e) = self.rendezvous.leave(&self.swarm_id, &self.peer_id).await {
            warn!(swarm_id = self.swarm_id, err = ?e, "leaving rendezvous");
        }
        info!(swarm_id = self.swarm_id, "swarm destroyed");
    }
}

/// Wait for the next candidate, or forever when there is no rendezvous
/// registration.
async fn next_candidate(
    candidates: &Option<flume::Receiver<PeerCandidate>>,
) -> std::result::Result<PeerCandidate, flume::RecvError> {
    match candidates {
        Some(rx) => rx.recv_async().await,
        None => std::future::pending().await,
    }
}

impl<R: Rendezvous> Actor for SwarmCoordinator<R> {
    type Request = Request;

    #[tracing::instrument(skip_all, err(level = Level::TRACE), level = Level::TRACE)]
    async fn run(
        &mut self,
        cancel: CancellationToken,
        request_rx: flume::Receiver<Self::Request>,
    ) -> Result<()> {
        self.subscribe();
        let mut candidates = match self.join(&cancel).await {
            Ok(candidates) => candidates,
            Err(e) if is_cancelled(&e) => {
                self.teardown().await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let signal_rx = self.signal_rx.clone();
        let events_rx = self.events_rx.clone();
        loop {
            select! {
                biased;
                _ = cancel.cancelled() => {
                    self.teardown().await;
                    return Ok(());
                }
                res = signal_rx.recv_async() => {
                    let signal = res?;
                    if let Some(link) = self.links.get_mut(signal.remote_id()) {
                        link.handle_signal(&signal);
                    }
                }
                res = events_rx.recv_async() => {
                    self.handle_event(res?);
                }
                res = next_candidate(&candidates) => {
                    match res {
                        Ok(candidate) => self.add_candidate(candidate),
                        Err(_) => {
                            debug!(swarm_id = self.swarm_id, "rendezvous stream ended, rejoining");
                            candidates = match self.join(&cancel).await {
                                Ok(candidates) => candidates,
                                Err(e) if is_cancelled(&e) => {
                                    self.teardown().await;
                                    return Ok(());
                                }
                                Err(e) => return Err(e),
                            };
                        }
                    }
                }
                res = request_rx.recv_async() => {
                    match res {
                        Ok(req) => self.handle_request(req).await?,
                        Err(_) => {
                            self.teardown().await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip_all, err(level = Level::TRACE), level = Level::TRACE)]
    async fn handle_request(&mut self, req: Self::Request) -> Result<()> {
        let resp = match &req {
            Request::Download { segment, .. } => Response::Download(self.download(segment.clone())?),
            Request::IsRequestableElsewhere { segment, .. } => {
                Response::IsRequestableElsewhere(
                    self.links
                        .values()
                        .any(|l| l.segment_status(&segment.external_id).is_some()),
                )
            }
            Request::Announcement { .. } => Response::Announcement(self.announcement()),
            Request::ConnectedPeers { .. } => {
                let mut peers: Vec<String> = self
                    .links
                    .values()
                    .filter(|l| l.is_connected())
                    .map(|l| l.remote_id().to_owned())
                    .collect();
                peers.sort();
                Response::ConnectedPeers(peers)
            }
            Request::PeerSegmentStatus {
                remote_id,
                external_id,
                ..
            } => Response::PeerSegmentStatus(
                self.links
                    .get(remote_id)
                    .and_then(|l| l.segment_status(external_id)),
            ),
        };
        if req.response_tx().send(resp).is_err() {
            trace!("requester went away");
        }
        Ok(())
    }
}

/// Cloneable request side of a running swarm.
#[derive(Clone)]
pub struct SwarmClient {
    stream_id: String,
    swarm_id: String,
    client: Client<Request>,
}

impl SwarmClient {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn swarm_id(&self) -> &str {
        &self.swarm_id
    }

    /// Start downloading `segment` from a randomly chosen peer that has it.
    /// `None` means no connected peer can serve it right now.
    pub async fn download_segment(&self, segment: Arc<Segment>) -> Result<Option<SegmentFetch>> {
        match self
            .client
            .call(Request::Download {
                segment,
                response_tx: ResponseChannel::default(),
            })
            .await?
        {
            Response::Download(fetch) => Ok(fetch),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    pub async fn is_requestable_elsewhere(&self, segment: Arc<Segment>) -> Result<bool> {
        match self
            .client
            .call(Request::IsRequestableElsewhere {
                segment,
                response_tx: ResponseChannel::default(),
            })
            .await?
        {
            Response::IsRequestableElsewhere(found) => Ok(found),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    pub async fn announcement(&self) -> Result<SegmentAnnouncement> {
        match self
            .client
            .call(Request::Announcement {
                response_tx: ResponseChannel::default(),
            })
            .await?
        {
            Response::Announcement(announcement) => Ok(announcement),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    pub async fn connected_peers(&self) -> Result<Vec<String>> {
        match self
            .client
            .call(Request::ConnectedPeers {
                response_tx: ResponseChannel::default(),
            })
            .await?
        {
            Response::ConnectedPeers(peers) => Ok(peers),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    pub async fn peer_segment_status(
        &self,
        remote_id: &str,
        external_id: &str,
    ) -> Result<Option<PeerSegmentStatus>> {
        match self
            .client
            .call(Request::PeerSegmentStatus {
                remote_id: remote_id.to_owned(),
                external_id: external_id.to_owned(),
                response_tx: ResponseChannel::default(),
            })
            .await?
        {
            Response::PeerSegmentStatus(status) => Ok(status),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }
}

/// A running swarm. Dereferences to its [`SwarmClient`].
pub struct Swarm {
    client: SwarmClient,
    operator: Operator<Request>,
}

impl Swarm {
    /// Start a coordinator for `stream` of the manifest at `manifest_url`.
    pub fn spawn<R: Rendezvous>(
        cancel: CancellationToken,
        manifest_url: &str,
        stream: &Stream,
        rendezvous: R,
        cache: SegmentCache,
        fallback: Arc<dyn FallbackLoader>,
        settings: Settings,
    ) -> Swarm {
        let coordinator = SwarmCoordinator::new(
            manifest_url,
            stream,
            rendezvous,
            cache,
            fallback,
            settings,
        );
        let swarm_id = coordinator.swarm_id().to_owned();
        let operator = Operator::new(cancel, coordinator);
        Swarm {
            client: SwarmClient {
                stream_id: stream.local_id.clone(),
                swarm_id,
                client: operator.client(),
            },
            operator,
        }
    }

    pub fn client(&self) -> SwarmClient {
        self.client.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.operator.is_finished()
    }

    /// Stop the coordinator and wait for its teardown to finish.
    pub async fn destroy(self) -> Result<()> {
        self.operator.cancel();
        self.operator.join().await?
    }
}

impl Deref for Swarm {
    type Target = SwarmClient;

    fn deref(&self) -> &SwarmClient {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{
        error::PeerRequestError,
        fallback::FallbackRequests,
        memory::MemoryRendezvous,
        proto::PeerCommand,
        tests::{StubConnection, StubRendezvous},
        types::StreamKind,
    };

    const STREAM: &str = "v0";
    const MANIFEST: &str = "https://cdn.example/live.m3u8";

    fn stream() -> Stream {
        Stream::new(STREAM, StreamKind::Video, 0)
    }

    struct Fixture {
        swarm: Swarm,
        rendezvous: StubRendezvous,
        cache: SegmentCache,
        fallback: FallbackRequests,
    }

    fn fixture() -> Fixture {
        let rendezvous = StubRendezvous::new();
        let cache = SegmentCache::new(&Settings::default());
        let fallback = FallbackRequests::new();
        let swarm = Swarm::spawn(
            CancellationToken::new(),
            MANIFEST,
            &stream(),
            rendezvous.clone(),
            cache.clone(),
            Arc::new(fallback.clone()),
            Settings::default(),
        );
        Fixture {
            swarm,
            rendezvous,
            cache,
            fallback,
        }
    }

    fn segment(id: &str) -> Arc<Segment> {
        Arc::new(Segment::new(id, id, STREAM))
    }

    fn announcements(conn: &StubConnection) -> Vec<PeerCommand> {
        conn.sent_commands()
            .into_iter()
            .filter(|c| matches!(c, PeerCommand::Announcement { .. }))
            .collect()
    }

    fn announce(loaded: &[&str]) -> ConnectionEvent {
        ConnectionEvent::Data(
            crate::proto::encode_command(&PeerCommand::Announcement {
                loaded: loaded.iter().map(|s| s.to_string()).collect(),
                loading_via_fallback: vec![],
            })
            .into(),
        )
    }

    async fn eventually<F: FnMut() -> bool>(mut cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition met");
    }

    async fn wait_connected(swarm: &SwarmClient, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while swarm.connected_peers().await.unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peers connected");
    }

    async fn wait_status(swarm: &SwarmClient, remote_id: &str, external_id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while swarm
                .peer_segment_status(remote_id, external_id)
                .await
                .unwrap()
                .is_none()
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer status known");
    }

    #[tokio::test]
    async fn test_announces_on_connect_and_on_each_store() {
        let f = fixture();
        let (a, _a_events) = f.rendezvous.connect("a", 1024);
        let (b, _b_events) = f.rendezvous.connect("b", 1024);
        wait_connected(&f.swarm, 2).await;
        eventually(|| announcements(&a).len() == 1 && announcements(&b).len() == 1).await;

        f.cache.store(segment("s1"), Bytes::from_static(b"data"));
        let expected = PeerCommand::Announcement {
            loaded: vec!["s1".to_owned()],
            loading_via_fallback: vec![],
        };
        eventually(|| announcements(&a).len() == 2 && announcements(&b).len() == 2).await;
        assert_eq!(announcements(&a)[1], expected);
        assert_eq!(announcements(&b)[1], expected);

        // Other streams are not our business.
        f.cache
            .store(Arc::new(Segment::new("x", "x", "a0")), Bytes::from_static(b"x"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(announcements(&a).len(), 2);

        f.swarm.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_fallback_changes_announced() {
        let f = fixture();
        let (a, _a_events) = f.rendezvous.connect("a", 1024);
        wait_connected(&f.swarm, 1).await;

        f.fallback.start(segment("s2"));
        f.fallback.start(Arc::new(Segment::new("o", "o", "a0")));
        eventually(|| {
            announcements(&a).last()
                == Some(&PeerCommand::Announcement {
                    loaded: vec![],
                    loading_via_fallback: vec!["s2".to_owned()],
                })
        })
        .await;
        assert_eq!(
            f.swarm.announcement().await.unwrap().loading_via_fallback,
            vec!["s2".to_owned()]
        );
        f.swarm.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_random_selection_reaches_every_peer() {
        let f = fixture();
        let (_a, a_events) = f.rendezvous.connect("a", 1024);
        let (_b, b_events) = f.rendezvous.connect("b", 1024);
        a_events.send(announce(&["s1"])).unwrap();
        b_events.send(announce(&["s1"])).unwrap();
        wait_status(&f.swarm, "a", "s1").await;
        wait_status(&f.swarm, "b", "s1").await;

        let mut chosen: HashMap<String, usize> = HashMap::new();
        for _ in 0..100 {
            let fetch = f
                .swarm
                .download_segment(segment("s1"))
                .await
                .unwrap()
                .expect("a peer has s1");
            *chosen.entry(fetch.remote_id().to_owned()).or_default() += 1;
            fetch.abort();
            assert_eq!(fetch.await, Err(PeerRequestError::Abort));
        }
        assert!(chosen.get("a").copied().unwrap_or(0) > 0, "{chosen:?}");
        assert!(chosen.get("b").copied().unwrap_or(0) > 0, "{chosen:?}");
        f.swarm.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_download_skips_busy_and_unannounced_peers() {
        let f = fixture();
        let (_a, a_events) = f.rendezvous.connect("a", 1024);
        let (_b, _b_events) = f.rendezvous.connect("b", 1024);
        a_events.send(announce(&["s1", "s2"])).unwrap();
        wait_status(&f.swarm, "a", "s1").await;

        assert!(f.swarm.is_requestable_elsewhere(segment("s1")).await.unwrap());
        assert!(!f.swarm.is_requestable_elsewhere(segment("s9")).await.unwrap());

        let first = f.swarm.download_segment(segment("s1")).await.unwrap();
        assert_eq!(first.as_ref().map(|f| f.remote_id()), Some("a"));
        // "a" is busy and "b" never announced.
        assert!(f.swarm.download_segment(segment("s2")).await.unwrap().is_none());
        f.swarm.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_serves_requests_from_cache() {
        let f = fixture();
        f.cache.store(segment("s1"), Bytes::from_static(b"0123456789"));
        let (a, a_events) = f.rendezvous.connect("a", 4);
        wait_connected(&f.swarm, 1).await;

        for id in ["s1", "nope"] {
            a_events
                .send(ConnectionEvent::Data(
                    crate::proto::encode_command(&PeerCommand::SegmentRequest {
                        segment_id: id.to_owned(),
                        byte_offset: None,
                    })
                    .into(),
                ))
                .unwrap();
        }
        a.wait_for_payload(10).await;
        eventually(|| {
            a.sent_commands().contains(&PeerCommand::SegmentAbsent {
                segment_id: "nope".to_owned(),
            })
        })
        .await;
        assert!(a.sent_commands().contains(&PeerCommand::SegmentData {
            segment_id: "s1".to_owned(),
            total_bytes: 10,
        }));
        f.swarm.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_removed_and_teardown_destroys() {
        let f = fixture();
        let (a, a_events) = f.rendezvous.connect("a", 1024);
        let (b, _b_events) = f.rendezvous.connect("b", 1024);
        wait_connected(&f.swarm, 2).await;

        a_events.send(ConnectionEvent::Closed).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.swarm.connected_peers().await.unwrap() != vec!["b".to_owned()] {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!a.is_destroyed());

        let rendezvous = f.rendezvous.clone();
        f.swarm.destroy().await.unwrap();
        assert!(b.is_destroyed());
        assert_eq!(rendezvous.joins(), 1);
        assert_eq!(rendezvous.leaves(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_forgets_peer() {
        let f = fixture();
        let (a, a_events) = f.rendezvous.connect("a", 1024);
        a_events.send(announce(&["s1"])).unwrap();
        wait_status(&f.swarm, "a", "s1").await;
        assert!(f.swarm.is_requestable_elsewhere(segment("s1")).await.unwrap());

        a_events
            .send(ConnectionEvent::Error("ice failed".to_owned()))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f.swarm.connected_peers().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(a.is_destroyed());
        assert!(!f.swarm.is_requestable_elsewhere(segment("s1")).await.unwrap());
        assert_eq!(f.swarm.peer_segment_status("a", "s1").await.unwrap(), None);
        assert!(f.swarm.download_segment(segment("s1")).await.unwrap().is_none());
        f.swarm.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_over_memory_rendezvous() {
        let settings = Settings::default();
        let rendezvous = MemoryRendezvous::new(1000);
        let seeder_cache = SegmentCache::new(&settings);
        let leecher_cache = SegmentCache::new(&settings);
        let stream = stream();
        let seeder = Swarm::spawn(
            CancellationToken::new(),
            MANIFEST,
            &stream,
            rendezvous.clone(),
            seeder_cache.clone(),
            Arc::new(FallbackRequests::new()),
            settings.clone(),
        );
        let leecher = Swarm::spawn(
            CancellationToken::new(),
            MANIFEST,
            &stream,
            rendezvous.clone(),
            leecher_cache.clone(),
            Arc::new(FallbackRequests::new()),
            settings.clone(),
        );
        assert_eq!(seeder.swarm_id(), leecher.swarm_id());
        assert_eq!(
            seeder.swarm_id(),
            crate::identity::swarm_id(MANIFEST, &stream)
        );
        wait_connected(&leecher, 1).await;

        let payload: Bytes = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        seeder_cache.store(segment("s1"), payload.clone());

        let remote = leecher.connected_peers().await.unwrap().remove(0);
        wait_status(&leecher, &remote, "s1").await;
        let fetch = leecher
            .download_segment(segment("s1"))
            .await
            .unwrap()
            .expect("seeder has s1");
        let data = fetch.await.unwrap();
        assert_eq!(data, payload);
        leecher_cache.store(segment("s1"), data);

        let seeder_remote = seeder.connected_peers().await.unwrap().remove(0);
        wait_status(&seeder, &seeder_remote, "s1").await;

        let swarm_id = seeder.swarm_id().to_owned();
        leecher.destroy().await.unwrap();
        seeder.destroy().await.unwrap();
        assert_eq!(rendezvous.member_count(&swarm_id), 0);
    }
}
