use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    observable::{Observable, Subscription},
    types::Segment,
};

/// The origin (non-peer) download path, as seen by swarms: which segments it
/// is currently fetching, and when that set changes.
pub trait FallbackLoader: Send + Sync {
    fn in_flight(&self) -> Vec<Arc<Segment>>;

    fn subscribe(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription;
}

/// In-flight set maintained by whoever drives origin downloads.
#[derive(Clone, Default)]
pub struct FallbackRequests {
    in_flight: Arc<Mutex<HashMap<(String, String), Arc<Segment>>>>,
    changes: Observable<()>,
}

impl FallbackRequests {
    pub fn new() -> FallbackRequests {
        FallbackRequests::default()
    }

    /// Record that `segment` is being fetched from the origin.
    pub fn start(&self, segment: Arc<Segment>) {
        let key = (segment.stream_id.clone(), segment.external_id.clone());
        let added = self.in_flight.lock().insert(key, segment).is_none();
        if added {
            self.changes.notify(&());
        }
    }

    /// Record that the origin fetch for `segment` ended, successfully or not.
    pub fn finish(&self, segment: &Segment) {
        let key = (segment.stream_id.clone(), segment.external_id.clone());
        let removed = self.in_flight.lock().remove(&key).is_some();
        if removed {
            self.changes.notify(&());
        }
    }

    pub fn is_in_flight(&self, segment: &Segment) -> bool {
        self.in_flight
            .lock()
            .contains_key(&(segment.stream_id.clone(), segment.external_id.clone()))
    }
}

impl FallbackLoader for FallbackRequests {
    fn in_flight(&self) -> Vec<Arc<Segment>> {
        self.in_flight.lock().values().cloned().collect()
    }

    fn subscribe(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.changes.subscribe(move |_| callback())
    }
}
