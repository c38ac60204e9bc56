//! State kept for one remote participant of a swarm.
//!
//! A [`PeerLink`] owns the connection(s) offered for a remote id, the remote's
//! latest segment announcement, at most one outbound segment exchange and at
//! most one inbound upload. It does no I/O scheduling of its own: the owning
//! swarm task feeds it connection events and exchange signals, and acts on the
//! [`LinkEvent`]s it returns.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    sync::watch,
    task::AbortHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::{ExchangePending, PeerRequestError},
    fetch::{ExchangeSignal, FetchProgress, FetchResult, ResultCell, SegmentFetch},
    proto::{decode_command, encode_command, PeerCommand},
    transport::{Connection, ConnectionEvent},
    types::{PeerSegmentStatus, Segment, SegmentAnnouncement},
    Result,
};

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// What the owner of a link needs to act on after feeding it an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// The first usable connection to the remote came up.
    Connected,
    /// The link has no usable connection and will not get one. Reported once.
    Closed,
    /// The remote wants a segment from us.
    SegmentRequested {
        segment_id: String,
        byte_offset: Option<u64>,
    },
    /// The remote replaced its announcement.
    AnnouncementChanged,
}

struct PendingExchange {
    id: u64,
    segment: Arc<Segment>,
    chunks: Vec<Bytes>,
    progress: FetchProgress,
    progress_tx: watch::Sender<FetchProgress>,
    timer: AbortHandle,
    result: ResultCell,
}

struct Upload {
    segment_id: String,
    cancel: CancellationToken,
}

pub struct PeerLink {
    remote_id: String,
    candidates: HashMap<u64, Arc<dyn Connection>>,
    connection: Option<(u64, Arc<dyn Connection>)>,
    closed: bool,
    segments: HashMap<String, PeerSegmentStatus>,
    exchange: Option<PendingExchange>,
    upload: Option<Upload>,
    signal_tx: flume::Sender<ExchangeSignal>,
    download_timeout: Duration,
}

impl PeerLink {
    /// A link for `remote_id`. Exchange timeouts and aborts are reported on
    /// `signal_tx` and must be fed back through [`PeerLink::handle_signal`].
    pub fn new(
        remote_id: impl Into<String>,
        signal_tx: flume::Sender<ExchangeSignal>,
        download_timeout: Duration,
    ) -> PeerLink {
        PeerLink {
            remote_id: remote_id.into(),
            candidates: HashMap::new(),
            connection: None,
            closed: false,
            segments: HashMap::new(),
            exchange: None,
            upload: None,
            signal_tx,
            download_timeout,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn segment_status(&self, external_id: &str) -> Option<PeerSegmentStatus> {
        self.segments.get(external_id).copied()
    }

    pub fn known_segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn has_pending_exchange(&self) -> bool {
        self.exchange.is_some()
    }

    pub fn downloading_segment(&self) -> Option<&Arc<Segment>> {
        self.exchange.as_ref().map(|ex| &ex.segment)
    }

    /// Offer another connection for this remote. The first one to report
    /// `Connected` becomes the link's connection.
    pub fn add_candidate(&mut self, seq: u64, connection: Arc<dyn Connection>) {
        if self.closed {
            connection.destroy();
            return;
        }
        self.candidates.insert(seq, connection);
    }

    /// Feed an event from candidate connection `seq`.
    pub fn handle_connection_event(
        &mut self,
        seq: u64,
        event: ConnectionEvent,
    ) -> Option<LinkEvent> {
        let is_active = self.connection.as_ref().map(|(s, _)| *s) == Some(seq);
        match event {
            ConnectionEvent::Connected => self.on_connected(seq),
            ConnectionEvent::Data(data) if is_active => self.on_data(data),
            ConnectionEvent::Data(_) => None,
            ConnectionEvent::Closed if is_active => {
                debug!(remote_id = self.remote_id, "connection closed");
                self.connection = None;
                self.reject(PeerRequestError::PeerClosed);
                self.stop_upload();
                self.mark_closed()
            }
            ConnectionEvent::Closed => {
                self.candidates.remove(&seq);
                self.closed_if_unreachable()
            }
            ConnectionEvent::Error(err) if is_active => {
                warn!(remote_id = self.remote_id, err, "connection error");
                let was_closed = self.closed;
                self.reject(PeerRequestError::PeerClosed);
                self.destroy();
                (!was_closed).then_some(LinkEvent::Closed)
            }
            ConnectionEvent::Error(err) => {
                debug!(remote_id = self.remote_id, seq, err, "candidate connection error");
                if let Some(conn) = self.candidates.remove(&seq) {
                    conn.destroy();
                }
                self.closed_if_unreachable()
            }
        }
    }

    fn on_connected(&mut self, seq: u64) -> Option<LinkEvent> {
        let conn = self.candidates.remove(&seq)?;
        if self.connection.is_some() || self.closed {
            trace!(remote_id = self.remote_id, seq, "dropping redundant connection");
            conn.destroy();
            return None;
        }
        debug!(remote_id = self.remote_id, seq, "connected");
        self.connection = Some((seq, conn));
        Some(LinkEvent::Connected)
    }

    fn closed_if_unreachable(&mut self) -> Option<LinkEvent> {
        if self.connection.is_none() && self.candidates.is_empty() {
            self.mark_closed()
        } else {
            None
        }
    }

    fn mark_closed(&mut self) -> Option<LinkEvent> {
        if self.closed {
            None
        } else {
            self.closed = true;
            Some(LinkEvent::Closed)
        }
    }

    fn on_data(&mut self, data: Bytes) -> Option<LinkEvent> {
        let Some(command) = decode_command(&data) else {
            self.on_chunk(data);
            return None;
        };
        trace!(remote_id = self.remote_id, command = command.name(), "received");
        match command {
            PeerCommand::Announcement {
                loaded,
                loading_via_fallback,
            } => {
                self.segments = SegmentAnnouncement {
                    loaded,
                    loading_via_fallback,
                }
                .statuses();
                Some(LinkEvent::AnnouncementChanged)
            }
            PeerCommand::SegmentRequest {
                segment_id,
                byte_offset,
            } => Some(LinkEvent::SegmentRequested {
                segment_id,
                byte_offset,
            }),
            PeerCommand::SegmentData {
                segment_id,
                total_bytes,
            } => {
                if let Some(ex) = self.exchange.as_mut() {
                    if ex.segment.external_id == segment_id {
                        ex.chunks.clear();
                        ex.progress.loaded_bytes = 0;
                        ex.progress.total_bytes = Some(total_bytes);
                        ex.progress_tx.send_replace(ex.progress.clone());
                        if total_bytes == 0 {
                            self.resolve();
                        }
                    }
                }
                None
            }
            PeerCommand::SegmentAbsent { segment_id } => {
                if self.pending_segment_is(&segment_id) {
                    self.reject(PeerRequestError::SegmentAbsent);
                    self.segments.remove(&segment_id);
                }
                None
            }
            PeerCommand::CancelRequest { segment_id } => {
                if self
                    .upload
                    .as_ref()
                    .is_some_and(|up| up.segment_id == segment_id)
                {
                    debug!(remote_id = self.remote_id, segment_id, "remote cancelled upload");
                    self.stop_upload();
                }
                None
            }
        }
    }

    fn on_chunk(&mut self, chunk: Bytes) {
        let Some(ex) = self.exchange.as_mut() else {
            trace!(remote_id = self.remote_id, len = chunk.len(), "chunk with no exchange");
            return;
        };
        let Some(total) = ex.progress.total_bytes else {
            trace!(remote_id = self.remote_id, len = chunk.len(), "chunk before header");
            return;
        };
        ex.progress.loaded_bytes += chunk.len() as u64;
        ex.progress.last_chunk_at = Some(Instant::now());
        ex.chunks.push(chunk);
        ex.progress_tx.send_replace(ex.progress.clone());

        let loaded = ex.progress.loaded_bytes;
        if loaded == total {
            self.resolve();
        } else if loaded > total {
            warn!(
                remote_id = self.remote_id,
                loaded, total, "peer sent more bytes than announced"
            );
            self.reject(PeerRequestError::ResponseBytesMismatch);
        }
    }

    fn pending_segment_is(&self, external_id: &str) -> bool {
        self.exchange
            .as_ref()
            .is_some_and(|ex| ex.segment.external_id == external_id)
    }

    /// Start downloading `segment` from the remote.
    ///
    /// Fails with [`ExchangePending`] if an exchange is already in flight on
    /// this link; that exchange is left untouched.
    pub fn request_segment(
        &mut self,
        segment: Arc<Segment>,
        byte_offset: Option<u64>,
    ) -> Result<SegmentFetch> {
        if let Some(ex) = self.exchange.as_ref() {
            return Err(ExchangePending {
                remote_id: self.remote_id.clone(),
                segment_id: ex.segment.external_id.clone(),
            }
            .into());
        }

        let id = NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed);
        self.send_command(&PeerCommand::SegmentRequest {
            segment_id: segment.external_id.clone(),
            byte_offset,
        });

        let timer = {
            let signal_tx = self.signal_tx.clone();
            let remote_id = self.remote_id.clone();
            let timeout = self.download_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = signal_tx.send(ExchangeSignal::Timeout {
                    remote_id,
                    exchange_id: id,
                });
            })
            .abort_handle()
        };

        let progress = FetchProgress::new(Instant::now());
        let (progress_tx, progress_rx) = watch::channel(progress.clone());
        let (result, result_rx) = ResultCell::channel();
        debug!(
            remote_id = self.remote_id,
            segment = segment.external_id,
            exchange_id = id,
            "requesting segment"
        );
        self.exchange = Some(PendingExchange {
            id,
            segment: segment.clone(),
            chunks: vec![],
            progress,
            progress_tx,
            timer,
            result,
        });
        Ok(SegmentFetch::new(
            segment,
            self.remote_id.clone(),
            id,
            result_rx,
            progress_rx,
            self.signal_tx.clone(),
        ))
    }

    /// Apply a timeout or abort. Signals for exchanges that already settled
    /// are ignored.
    pub fn handle_signal(&mut self, signal: &ExchangeSignal) {
        let (exchange_id, reason) = match signal {
            ExchangeSignal::Timeout { exchange_id, .. } => {
                (*exchange_id, PeerRequestError::RequestTimeout)
            }
            ExchangeSignal::Abort { exchange_id, .. } => (*exchange_id, PeerRequestError::Abort),
        };
        if self.exchange.as_ref().map(|ex| ex.id) == Some(exchange_id) {
            self.reject(reason);
        }
    }

    fn resolve(&mut self) {
        let Some(mut ex) = self.exchange.take() else {
            return;
        };
        ex.timer.abort();
        let data = join_chunks(std::mem::take(&mut ex.chunks));
        debug!(
            remote_id = self.remote_id,
            segment = ex.segment.external_id,
            len = data.len(),
            elapsed = ?ex.progress.started_at.elapsed(),
            "segment received"
        );
        ex.result.complete(Ok(data));
    }

    fn reject(&mut self, reason: PeerRequestError) {
        let Some(mut ex) = self.exchange.take() else {
            return;
        };
        ex.timer.abort();
        debug!(
            remote_id = self.remote_id,
            segment = ex.segment.external_id,
            %reason,
            "segment request failed"
        );
        if reason.notifies_peer() {
            self.send_command(&PeerCommand::CancelRequest {
                segment_id: ex.segment.external_id.clone(),
            });
        }
        let result: FetchResult = Err(reason);
        ex.result.complete(result);
    }

    /// Upload `data` to the remote in response to its request, replacing any
    /// upload still in progress. With `byte_offset`, only the bytes from that
    /// offset are sent.
    pub fn send_segment(&mut self, segment_id: &str, data: Bytes, byte_offset: Option<u64>) {
        self.stop_upload();
        let Some((_, conn)) = self.connection.as_ref() else {
            return;
        };
        let conn = conn.clone();
        let offset = byte_offset
            .map(|o| usize::try_from(o).unwrap_or(usize::MAX).min(data.len()))
            .unwrap_or(0);
        let remaining = data.slice(offset..);
        let header = encode_command(&PeerCommand::SegmentData {
            segment_id: segment_id.to_owned(),
            total_bytes: remaining.len() as u64,
        });
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let remote_id = self.remote_id.clone();
        let upload_segment = segment_id.to_owned();
        debug!(remote_id, segment = segment_id, len = remaining.len(), offset, "uploading segment");
        tokio::spawn(async move {
            if let Err(e) = upload(conn, header.into(), remaining, task_cancel).await {
                warn!(remote_id, segment = upload_segment, err = ?e, "upload failed");
            }
        });
        self.upload = Some(Upload {
            segment_id: segment_id.to_owned(),
            cancel,
        });
    }

    pub fn send_segment_absent(&self, segment_id: &str) {
        self.send_command(&PeerCommand::SegmentAbsent {
            segment_id: segment_id.to_owned(),
        });
    }

    pub fn send_announcement(&self, announcement: &SegmentAnnouncement) {
        self.send_command(&PeerCommand::Announcement {
            loaded: announcement.loaded.clone(),
            loading_via_fallback: announcement.loading_via_fallback.clone(),
        });
    }

    fn stop_upload(&mut self) {
        if let Some(up) = self.upload.take() {
            up.cancel.cancel();
        }
    }

    fn send_command(&self, command: &PeerCommand) {
        let Some((_, conn)) = self.connection.as_ref() else {
            return;
        };
        trace!(remote_id = self.remote_id, command = command.name(), "send");
        if let Err(e) = conn.send(encode_command(command).into()) {
            warn!(remote_id = self.remote_id, command = command.name(), err = ?e, "send failed");
        }
    }

    /// Reject any pending exchange with `destroy`, stop uploading and tear
    /// down every connection. No `Closed` event follows.
    pub fn destroy(&mut self) {
        self.reject(PeerRequestError::Destroy);
        self.stop_upload();
        if let Some((_, conn)) = self.connection.take() {
            conn.destroy();
        }
        for (_, conn) in self.candidates.drain() {
            conn.destroy();
        }
        self.closed = true;
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if let Some(ex) = self.exchange.as_ref() {
            ex.timer.abort();
        }
        if let Some(up) = self.upload.as_ref() {
            up.cancel.cancel();
        }
    }
}

async fn upload(
    conn: Arc<dyn Connection>,
    header: Bytes,
    data: Bytes,
    cancel: CancellationToken,
) -> Result<()> {
    conn.send(header)?;
    let chunk_size = conn.max_message_size().max(1);
    let mut offset = 0;
    while offset < data.len() {
        if cancel.is_cancelled() {
            trace!(sent = offset, total = data.len(), "upload stopped");
            return Ok(());
        }
        let end = (offset + chunk_size).min(data.len());
        conn.send(data.slice(offset..end))?;
        offset = end;
        tokio::task::yield_now().await;
    }
    Ok(())
}

fn join_chunks(mut chunks: Vec<Bytes>) -> Bytes {
    if chunks.len() == 1 {
        return chunks.remove(0);
    }
    let total = chunks.iter().map(|c| c.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{error::is_exchange_pending, tests::StubConnection};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        link: PeerLink,
        conn: Arc<StubConnection>,
        signal_rx: flume::Receiver<ExchangeSignal>,
    }

    fn connected_link() -> Harness {
        let (signal_tx, signal_rx) = flume::unbounded();
        let mut link = PeerLink::new("remote", signal_tx, TIMEOUT);
        let conn = Arc::new(StubConnection::new("remote", 4));
        link.add_candidate(1, conn.clone());
        assert_eq!(
            link.handle_connection_event(1, ConnectionEvent::Connected),
            Some(LinkEvent::Connected)
        );
        Harness {
            link,
            conn,
            signal_rx,
        }
    }

    fn segment(id: &str) -> Arc<Segment> {
        Arc::new(Segment::new(id, id, "v"))
    }

    fn deliver(link: &mut PeerLink, command: PeerCommand) -> Option<LinkEvent> {
        link.handle_connection_event(
            1,
            ConnectionEvent::Data(encode_command(&command).into()),
        )
    }

    fn header(id: &str, total: u64) -> PeerCommand {
        PeerCommand::SegmentData {
            segment_id: id.to_owned(),
            total_bytes: total,
        }
    }

    fn chunk(link: &mut PeerLink, data: &'static [u8]) {
        link.handle_connection_event(1, ConnectionEvent::Data(Bytes::from_static(data)));
    }

    #[tokio::test]
    async fn test_reassembles_chunks_in_order() {
        let mut h = connected_link();
        let fetch = h.link.request_segment(segment("s1"), None).unwrap();
        assert_eq!(
            h.conn.sent_commands(),
            vec![PeerCommand::SegmentRequest {
                segment_id: "s1".to_owned(),
                byte_offset: None
            }]
        );

        deliver(&mut h.link, header("s1", 10));
        chunk(&mut h.link, b"0123");
        assert_eq!(fetch.progress().loaded_bytes, 4);
        assert_eq!(fetch.progress().percent(), 40.0);
        chunk(&mut h.link, b"4567");
        chunk(&mut h.link, b"89");

        assert_eq!(fetch.await, Ok(Bytes::from_static(b"0123456789")));
        assert!(!h.link.has_pending_exchange());
    }

    #[tokio::test]
    async fn test_one_byte_over_rejects_with_mismatch() {
        let mut h = connected_link();
        let fetch = h.link.request_segment(segment("s1"), None).unwrap();
        deliver(&mut h.link, header("s1", 5));
        chunk(&mut h.link, b"0123");
        chunk(&mut h.link, b"45");

        assert_eq!(fetch.await, Err(PeerRequestError::ResponseBytesMismatch));
        assert_eq!(
            h.conn.sent_commands().last(),
            Some(&PeerCommand::CancelRequest {
                segment_id: "s1".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn test_second_request_fails_and_keeps_first() {
        let mut h = connected_link();
        let fetch = h.link.request_segment(segment("s1"), None).unwrap();
        let err = h.link.request_segment(segment("s2"), None).unwrap_err();
        assert!(is_exchange_pending(&err));
        assert_eq!(
            h.link.downloading_segment().map(|s| s.external_id.as_str()),
            Some("s1")
        );

        deliver(&mut h.link, header("s1", 2));
        chunk(&mut h.link, b"ok");
        assert_eq!(fetch.await, Ok(Bytes::from_static(b"ok")));
    }

    #[tokio::test]
    async fn test_chunks_before_header_or_without_exchange_ignored() {
        let mut h = connected_link();
        chunk(&mut h.link, b"stray");
        let fetch = h.link.request_segment(segment("s1"), None).unwrap();
        chunk(&mut h.link, b"early");
        deliver(&mut h.link, header("other", 2));
        chunk(&mut h.link, b"xx");
        assert!(h.link.has_pending_exchange());

        deliver(&mut h.link, header("s1", 2));
        chunk(&mut h.link, b"ok");
        assert_eq!(fetch.await, Ok(Bytes::from_static(b"ok")));
    }

    #[tokio::test]
    async fn test_absent_rejects_and_clears_status() {
        let mut h = connected_link();
        assert_eq!(
            deliver(
                &mut h.link,
                PeerCommand::Announcement {
                    loaded: vec!["s1".to_owned()],
                    loading_via_fallback: vec![],
                }
            ),
            Some(LinkEvent::AnnouncementChanged)
        );
        assert_eq!(h.link.segment_status("s1"), Some(PeerSegmentStatus::Loaded));

        let fetch = h.link.request_segment(segment("s1"), None).unwrap();
        deliver(
            &mut h.link,
            PeerCommand::SegmentAbsent {
                segment_id: "s1".to_owned(),
            },
        );
        assert_eq!(fetch.await, Err(PeerRequestError::SegmentAbsent));
        assert_eq!(h.link.segment_status("s1"), None);
        // No cancel is sent for an absent reply.
        assert_eq!(h.conn.sent_commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_sends_cancel() {
        let mut h = connected_link();
        let fetch = h.link.request_segment(segment("s1"), None).unwrap();

        let signal = h.signal_rx.recv_async().await.unwrap();
        assert!(matches!(signal, ExchangeSignal::Timeout { .. }));
        h.link.handle_signal(&signal);

        assert_eq!(fetch.await, Err(PeerRequestError::RequestTimeout));
        assert_eq!(
            h.conn.sent_commands().last(),
            Some(&PeerCommand::CancelRequest {
                segment_id: "s1".to_owned()
            })
        );

        // A late duplicate does nothing.
        h.link.handle_signal(&signal);
        assert_eq!(h.conn.sent_commands().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timeout_ignored() {
        let mut h = connected_link();
        let first = h.link.request_segment(segment("s1"), None).unwrap();
        let stale = ExchangeSignal::Timeout {
            remote_id: "remote".to_owned(),
            exchange_id: first.exchange_id(),
        };
        deliver(&mut h.link, header("s1", 1));
        chunk(&mut h.link, b"1");
        assert!(first.await.is_ok());

        let second = h.link.request_segment(segment("s2"), None).unwrap();
        h.link.handle_signal(&stale);
        assert!(h.link.has_pending_exchange());
        second.abort();
        let abort = h.signal_rx.recv_async().await.unwrap();
        h.link.handle_signal(&abort);
        assert_eq!(second.await, Err(PeerRequestError::Abort));
    }

    #[tokio::test]
    async fn test_close_rejects_without_cancel_and_fires_once() {
        let mut h = connected_link();
        let fetch = h.link.request_segment(segment("s1"), None).unwrap();
        assert_eq!(
            h.link.handle_connection_event(1, ConnectionEvent::Closed),
            Some(LinkEvent::Closed)
        );
        assert_eq!(h.link.handle_connection_event(1, ConnectionEvent::Closed), None);
        assert_eq!(fetch.await, Err(PeerRequestError::PeerClosed));
        assert_eq!(h.conn.sent_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_rejects_and_notifies_peer() {
        let mut h = connected_link();
        let fetch = h.link.request_segment(segment("s1"), None).unwrap();
        h.link.destroy();
        assert_eq!(fetch.await, Err(PeerRequestError::Destroy));
        assert!(h.conn.is_destroyed());
        assert_eq!(
            h.conn.sent_commands().last(),
            Some(&PeerCommand::CancelRequest {
                segment_id: "s1".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn test_error_on_active_connection_closes_link() {
        let mut h = connected_link();
        let fetch = h.link.request_segment(segment("s1"), None).unwrap();
        assert_eq!(
            h.link
                .handle_connection_event(1, ConnectionEvent::Error("data channel".to_owned())),
            Some(LinkEvent::Closed)
        );
        assert!(h.conn.is_destroyed());
        assert!(h.link.is_closed());
        assert_eq!(fetch.await, Err(PeerRequestError::PeerClosed));
        // Only the request went out; a broken connection is not told to cancel.
        assert_eq!(h.conn.sent_commands().len(), 1);

        // Closed is reported once.
        assert_eq!(
            h.link
                .handle_connection_event(1, ConnectionEvent::Error("again".to_owned())),
            None
        );
        assert_eq!(h.link.handle_connection_event(1, ConnectionEvent::Closed), None);
    }

    #[tokio::test]
    async fn test_first_connected_candidate_wins() {
        let (signal_tx, _signal_rx) = flume::unbounded();
        let mut link = PeerLink::new("remote", signal_tx, TIMEOUT);
        let a = Arc::new(StubConnection::new("remote", 16));
        let b = Arc::new(StubConnection::new("remote", 16));
        link.add_candidate(1, a.clone());
        link.add_candidate(2, b.clone());

        assert_eq!(
            link.handle_connection_event(2, ConnectionEvent::Connected),
            Some(LinkEvent::Connected)
        );
        assert_eq!(link.handle_connection_event(1, ConnectionEvent::Connected), None);
        assert!(a.is_destroyed());
        assert!(!b.is_destroyed());

        link.send_segment_absent("x");
        assert!(a.sent_commands().is_empty());
        assert_eq!(b.sent_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_chunks_to_max_message_size() {
        let mut h = connected_link();
        h.link
            .send_segment("s1", Bytes::from_static(b"abcdefghij"), None);
        h.conn.wait_for_payload(10).await;
        assert_eq!(
            h.conn.sent_commands(),
            vec![header("s1", 10)]
        );
        let payload = h.conn.sent_payload();
        assert_eq!(payload.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_upload_from_offset() {
        let mut h = connected_link();
        h.link
            .send_segment("s1", Bytes::from_static(b"abcdefghij"), Some(6));
        h.conn.wait_for_payload(4).await;
        assert_eq!(h.conn.sent_commands(), vec![header("s1", 4)]);
        assert_eq!(h.conn.sent_payload(), vec![Bytes::from_static(b"ghij")]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancel_request_stops_upload() {
        let mut h = connected_link();
        h.link
            .send_segment("s1", Bytes::from(vec![7u8; 4 * 100]), None);
        // Let the upload task start, then cancel it.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        deliver(
            &mut h.link,
            PeerCommand::CancelRequest {
                segment_id: "s1".to_owned(),
            },
        );
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let sent = h.conn.sent_payload().len();
        assert!(sent < 100, "sent {sent} chunks");
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.conn.sent_payload().len(), sent);
    }

    #[tokio::test]
    async fn test_incoming_request_surfaces() {
        let mut h = connected_link();
        assert_eq!(
            deliver(
                &mut h.link,
                PeerCommand::SegmentRequest {
                    segment_id: "s9".to_owned(),
                    byte_offset: Some(3),
                }
            ),
            Some(LinkEvent::SegmentRequested {
                segment_id: "s9".to_owned(),
                byte_offset: Some(3),
            })
        );
    }
}
