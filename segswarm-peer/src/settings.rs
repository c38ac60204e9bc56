use std::time::Duration;

/// Tunables for the cache, peer links and swarm lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Cached segments not accessed for this long are dropped.
    pub cached_segment_expiration: Duration,
    /// Cache entry count above which least recently used segments are evicted.
    pub cached_segments_count: usize,
    pub storage_cleanup_interval: Duration,
    /// How long a peer has to deliver a requested segment.
    pub p2p_segment_download_timeout: Duration,
    /// Largest message the transport will carry. Uploads are chunked to fit.
    pub max_message_size: usize,
    /// How long an inactive swarm is kept before it is torn down.
    pub swarm_destroy_grace: Duration,
    /// Give up re-joining the rendezvous after this long.
    pub rendezvous_retry_max_elapsed: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cached_segment_expiration: Duration::from_secs(120),
            cached_segments_count: 50,
            storage_cleanup_interval: Duration::from_secs(1),
            p2p_segment_download_timeout: Duration::from_secs(5),
            max_message_size: 64 * 1024 - 1,
            swarm_destroy_grace: Duration::from_secs(30),
            rendezvous_retry_max_elapsed: Duration::from_secs(15),
        }
    }
}
