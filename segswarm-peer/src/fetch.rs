use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::{
    sync::{oneshot, watch},
    time::Instant,
};

use crate::{error::PeerRequestError, types::Segment};

pub type FetchResult = std::result::Result<Bytes, PeerRequestError>;

/// Out-of-band notices about an exchange, delivered to whoever drives the
/// owning peer link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeSignal {
    /// The response timer for the exchange fired.
    Timeout { remote_id: String, exchange_id: u64 },
    /// The caller gave up on the exchange.
    Abort { remote_id: String, exchange_id: u64 },
}

impl ExchangeSignal {
    pub fn remote_id(&self) -> &str {
        match self {
            ExchangeSignal::Timeout { remote_id, .. } | ExchangeSignal::Abort { remote_id, .. } => {
                remote_id
            }
        }
    }
}

/// Single-assignment completion for an exchange. Only the first
/// `complete` takes effect.
#[derive(Debug)]
pub struct ResultCell {
    tx: Option<oneshot::Sender<FetchResult>>,
}

impl ResultCell {
    pub fn channel() -> (ResultCell, oneshot::Receiver<FetchResult>) {
        let (tx, rx) = oneshot::channel();
        (ResultCell { tx: Some(tx) }, rx)
    }

    /// Returns whether this call settled the cell.
    pub fn complete(&mut self, result: FetchResult) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // A dropped receiver still counts as settled.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.tx.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchProgress {
    pub loaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub started_at: Instant,
    pub last_chunk_at: Option<Instant>,
}

impl FetchProgress {
    pub fn new(started_at: Instant) -> FetchProgress {
        FetchProgress {
            loaded_bytes: 0,
            total_bytes: None,
            started_at,
            last_chunk_at: None,
        }
    }

    /// Share of the segment received so far, 0 to 100. Zero until the total
    /// is known.
    pub fn percent(&self) -> f64 {
        match self.total_bytes {
            Some(0) => 100.0,
            Some(total) => self.loaded_bytes as f64 / total as f64 * 100.0,
            None => 0.0,
        }
    }
}

/// Handle to an in-flight segment download from a peer.
///
/// Await it for the segment bytes. Dropping the handle does not stop the
/// exchange; call [`SegmentFetch::abort`] for that.
#[derive(Debug)]
pub struct SegmentFetch {
    segment: Arc<Segment>,
    remote_id: String,
    exchange_id: u64,
    result_rx: oneshot::Receiver<FetchResult>,
    progress_rx: watch::Receiver<FetchProgress>,
    signal_tx: flume::Sender<ExchangeSignal>,
}

impl SegmentFetch {
    pub(crate) fn new(
        segment: Arc<Segment>,
        remote_id: String,
        exchange_id: u64,
        result_rx: oneshot::Receiver<FetchResult>,
        progress_rx: watch::Receiver<FetchProgress>,
        signal_tx: flume::Sender<ExchangeSignal>,
    ) -> SegmentFetch {
        SegmentFetch {
            segment,
            remote_id,
            exchange_id,
            result_rx,
            progress_rx,
            signal_tx,
        }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn exchange_id(&self) -> u64 {
        self.exchange_id
    }

    pub fn progress(&self) -> FetchProgress {
        self.progress_rx.borrow().clone()
    }

    /// A receiver that observes every progress update.
    pub fn watch_progress(&self) -> watch::Receiver<FetchProgress> {
        self.progress_rx.clone()
    }

    /// Ask the link to reject the exchange with `abort`. Has no effect once
    /// the exchange has settled.
    pub fn abort(&self) {
        let _ = self.signal_tx.send(ExchangeSignal::Abort {
            remote_id: self.remote_id.clone(),
            exchange_id: self.exchange_id,
        });
    }
}

impl Future for SegmentFetch {
    type Output = FetchResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.result_rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The owning link went away without settling.
            Poll::Ready(Err(_)) => Poll::Ready(Err(PeerRequestError::Destroy)),
            Poll::Pending => Poll::Pending,
        }
    }
}
