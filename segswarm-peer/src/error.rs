use std::fmt;

pub type Error = anyhow::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub struct CancelError;

impl std::error::Error for CancelError {}

impl fmt::Display for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled")
    }
}

impl fmt::Debug for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled")
    }
}

pub fn is_cancelled(e: &Error) -> bool {
    for cause in e.chain() {
        if cause.downcast_ref::<CancelError>().is_some() {
            return true;
        }
    }
    false
}

/// Raised when a segment request is made on a peer link that already has an
/// exchange in flight. This is a caller bug, not a retryable condition.
#[derive(Debug)]
pub struct ExchangePending {
    pub remote_id: String,
    pub segment_id: String,
}

impl std::error::Error for ExchangePending {}

impl fmt::Display for ExchangePending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment {} is already downloading from peer {}",
            self.segment_id, self.remote_id
        )
    }
}

pub fn is_exchange_pending(e: &Error) -> bool {
    for cause in e.chain() {
        if cause.downcast_ref::<ExchangePending>().is_some() {
            return true;
        }
    }
    false
}

/// Broad category of a failed peer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The peer violated the protocol for this exchange.
    Protocol,
    /// Nothing arrived in time; retrying is reasonable.
    Timeout,
    /// The peer no longer has the segment.
    Availability,
    /// The connection went away.
    Transport,
    /// Ended locally by the caller or by teardown.
    Local,
}

/// Why a pending segment exchange with a peer was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerRequestError {
    #[error("abort")]
    Abort,
    #[error("request-timeout")]
    RequestTimeout,
    #[error("segment-absent")]
    SegmentAbsent,
    #[error("response-bytes-mismatch")]
    ResponseBytesMismatch,
    #[error("peer-closed")]
    PeerClosed,
    #[error("destroy")]
    Destroy,
}

impl PeerRequestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PeerRequestError::Abort | PeerRequestError::Destroy => ErrorClass::Local,
            PeerRequestError::RequestTimeout => ErrorClass::Timeout,
            PeerRequestError::SegmentAbsent => ErrorClass::Availability,
            PeerRequestError::ResponseBytesMismatch => ErrorClass::Protocol,
            PeerRequestError::PeerClosed => ErrorClass::Transport,
        }
    }

    /// Whether the remote side should be told to stop sending. A closed peer
    /// cannot be told anything, and an absent reply means nothing is coming.
    pub fn notifies_peer(&self) -> bool {
        !matches!(
            self,
            PeerRequestError::PeerClosed | PeerRequestError::SegmentAbsent
        )
    }
}
