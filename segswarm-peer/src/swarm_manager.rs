use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::AbortHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    fallback::FallbackLoader,
    segment_cache::SegmentCache,
    settings::Settings,
    swarm::{Swarm, SwarmClient},
    transport::Rendezvous,
    types::Stream,
};

struct DestroyTimer {
    generation: u64,
    handle: AbortHandle,
}

struct SwarmEntry {
    swarm: Swarm,
    destroy_timer: Option<DestroyTimer>,
}

impl SwarmEntry {
    fn cancel_destroy(&mut self) {
        if let Some(timer) = self.destroy_timer.take() {
            timer.handle.abort();
        }
    }
}

#[derive(Default)]
struct Inner {
    swarms: HashMap<String, SwarmEntry>,
    active: Option<String>,
    generation: u64,
}

impl Inner {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

/// Keeps one swarm per stream rendition of a manifest, with a single active
/// swarm. Swarms that stop being active linger for a grace period while the
/// cache still holds their segments, so peers can keep fetching from us.
#[derive(Clone)]
pub struct SwarmManager<R: Rendezvous> {
    manifest_url: String,
    rendezvous: R,
    cache: SegmentCache,
    fallback: Arc<dyn FallbackLoader>,
    settings: Settings,
    cancel: CancellationToken,
    inner: Arc<Mutex<Inner>>,
}

impl<R: Rendezvous> SwarmManager<R> {
    pub fn new(
        cancel: CancellationToken,
        manifest_url: impl Into<String>,
        rendezvous: R,
        cache: SegmentCache,
        fallback: Arc<dyn FallbackLoader>,
        settings: Settings,
    ) -> Self {
        SwarmManager {
            manifest_url: manifest_url.into(),
            rendezvous,
            cache,
            fallback,
            settings,
            cancel,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Make `stream`'s swarm the active one, creating it if needed.
    ///
    /// The previously active swarm is destroyed at once if the cache holds
    /// nothing of its stream, otherwise after the destroy grace period.
    #[tracing::instrument(skip_all, fields(stream = %stream.local_id))]
    pub async fn switch_active(&self, stream: &Stream) -> SwarmClient {
        let mut inner = self.inner.lock().await;
        let previous = inner.active.replace(stream.local_id.clone());

        let client = match inner.swarms.get_mut(&stream.local_id) {
            Some(entry) => {
                entry.cancel_destroy();
                debug!("reusing swarm");
                entry.swarm.client()
            }
            None => {
                let swarm = Swarm::spawn(
                    self.cancel.child_token(),
                    &self.manifest_url,
                    stream,
                    self.rendezvous.clone(),
                    self.cache.clone(),
                    self.fallback.clone(),
                    self.settings.clone(),
                );
                info!(swarm_id = swarm.swarm_id(), "created swarm");
                let client = swarm.client();
                inner.swarms.insert(
                    stream.local_id.clone(),
                    SwarmEntry {
                        swarm,
                        destroy_timer: None,
                    },
                );
                client
            }
        };

        let Some(previous) = previous.filter(|p| *p != stream.local_id) else {
            return client;
        };
        if self.cache.has_stream(&previous) {
            let generation = inner.next_generation();
            let handle = self.schedule_destroy(previous.clone(), generation);
            if let Some(entry) = inner.swarms.get_mut(&previous) {
                entry.cancel_destroy();
                entry.destroy_timer = Some(DestroyTimer { generation, handle });
            } else {
                handle.abort();
            }
            debug!(previous, grace = ?self.settings.swarm_destroy_grace, "scheduled swarm destroy");
            client
        } else {
            let entry = inner.swarms.remove(&previous);
            drop(inner);
            if let Some(entry) = entry {
                debug!(previous, "nothing cached, destroying swarm now");
                destroy_swarm(entry.swarm).await;
            }
            client
        }
    }

    fn schedule_destroy(&self, stream_id: String, generation: u64) -> AbortHandle {
        let inner = self.inner.clone();
        let grace: Duration = self.settings.swarm_destroy_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let entry = {
                let mut inner = inner.lock().await;
                let due = inner.swarms.get(&stream_id).is_some_and(|e| {
                    e.destroy_timer.as_ref().map(|t| t.generation) == Some(generation)
                }) && inner.active.as_deref() != Some(stream_id.as_str());
                if due {
                    inner.swarms.remove(&stream_id)
                } else {
                    None
                }
            };
            if let Some(entry) = entry {
                debug!(stream = stream_id, "destroy grace elapsed");
                destroy_swarm(entry.swarm).await;
            }
        })
        .abort_handle()
    }

    pub async fn active(&self) -> Option<SwarmClient> {
        let inner = self.inner.lock().await;
        inner
            .active
            .as_ref()
            .and_then(|id| inner.swarms.get(id))
            .map(|e| e.swarm.client())
    }

    pub async fn swarm_count(&self) -> usize {
        self.inner.lock().await.swarms.len()
    }

    pub async fn has_swarm(&self, stream_id: &str) -> bool {
        self.inner.lock().await.swarms.contains_key(stream_id)
    }

    /// Destroy every swarm and cancel pending destroy timers.
    pub async fn destroy(&self) {
        let entries: Vec<SwarmEntry> = {
            let mut inner = self.inner.lock().await;
            inner.active = None;
            inner.swarms.drain().map(|(_, e)| e).collect()
        };
        for mut entry in entries {
            entry.cancel_destroy();
            destroy_swarm(entry.swarm).await;
        }
    }
}

async fn destroy_swarm(swarm: Swarm) {
    let swarm_id = swarm.swarm_id().to_owned();
    if let Err(e) = swarm.destroy().await {
        warn!(swarm_id, err = ?e, "destroying swarm");
    }
}
