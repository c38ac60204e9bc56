use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use bytes::Bytes;
use rand::RngCore;
use tokio::{select, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use segswarm_peer::{
    FallbackRequests, MemoryRendezvous, Segment, SegmentCache, Settings, Stream, StreamKind,
    SwarmClient, SwarmManager,
};

use crate::{cli::Commands, initialize_stdout_logging, Cli};

const MANIFEST_URL: &str = "memory://segswarm/simulation.m3u8";
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct App {
    cli: Cli,
}

impl App {
    pub fn new(cli: Cli) -> App {
        App { cli }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        println!("segswarm {}", env!("CARGO_PKG_VERSION"));

        if self.cli.version() {
            return Ok(());
        }

        initialize_stdout_logging();

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Set up ctrl-c handler
        let ctrl_c_cancel = cancel.clone();
        tasks.spawn(async move {
            select! {
                _ = ctrl_c_cancel.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Received ctrl-c, shutting down...");
                    ctrl_c_cancel.cancel();
                }
            }
        });

        let res = match self.cli.commands {
            Commands::Simulate {
                peers,
                segments,
                segment_size,
            } => {
                let simulation = Simulation::new(self.cli.settings(), peers, segments, segment_size)?;
                simulation.run(&cancel).await.map(|report| report.log())
            }
            Commands::Version => Ok(()),
        };

        cancel.cancel();
        tasks.join_all().await;

        if let Err(e) = &res {
            error!(err = e.to_string());
        }
        res
    }
}

/// Transfer totals across every downloading node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub peer_segments: usize,
    pub peer_bytes: u64,
    pub origin_segments: usize,
}

impl Report {
    fn merge(&mut self, other: Report) {
        self.peer_segments += other.peer_segments;
        self.peer_bytes += other.peer_bytes;
        self.origin_segments += other.origin_segments;
    }

    fn log(&self) {
        let total = self.peer_segments + self.origin_segments;
        let ratio = if total == 0 {
            0.0
        } else {
            self.peer_segments as f64 / total as f64
        };
        info!(
            peer_segments = self.peer_segments,
            peer_bytes = self.peer_bytes,
            origin_segments = self.origin_segments,
            peer_ratio = format!("{:.2}", ratio),
            "simulation complete"
        );
    }
}

#[derive(Clone)]
struct Node {
    index: usize,
    cache: SegmentCache,
    fallback: FallbackRequests,
    manager: SwarmManager<MemoryRendezvous>,
    swarm: SwarmClient,
}

impl Node {
    /// Simulate an origin download: the segment is reported in flight while
    /// it "downloads", then lands in the cache.
    fn load_from_origin(&self, segment: &Arc<Segment>, data: Bytes) {
        self.fallback.start(segment.clone());
        self.cache.store(segment.clone(), data);
        self.fallback.finish(segment);
    }
}

/// In-process swarm: node 0 loads every segment from the "origin", every
/// other node tries peers first and falls back to the origin when no peer
/// delivers within the download timeout.
pub struct Simulation {
    settings: Settings,
    peers: usize,
    stream: Stream,
    payloads: Arc<HashMap<String, Bytes>>,
}

impl Simulation {
    pub fn new(
        settings: Settings,
        peers: usize,
        segments: usize,
        segment_size: usize,
    ) -> Result<Simulation> {
        if peers < 2 {
            bail!("a swarm needs at least two peers, got {peers}");
        }
        if segments == 0 || segment_size == 0 {
            bail!("nothing to transfer");
        }
        let mut stream = Stream::new("video-0", StreamKind::Video, 0);
        let mut payloads = HashMap::new();
        let mut rng = rand::thread_rng();
        for i in 0..segments {
            let mut data = vec![0u8; segment_size];
            rng.fill_bytes(&mut data);
            let segment =
                stream.push_segment(Segment::new(i.to_string(), format!("segment-{i}.ts"), ""));
            payloads.insert(segment.external_id.clone(), Bytes::from(data));
        }
        Ok(Simulation {
            settings,
            peers,
            stream,
            payloads: Arc::new(payloads),
        })
    }

    #[tracing::instrument(skip_all, err)]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Report> {
        let rendezvous = MemoryRendezvous::new(self.settings.max_message_size);
        let mut nodes = Vec::with_capacity(self.peers);
        for index in 0..self.peers {
            nodes.push(self.start_node(index, cancel, rendezvous.clone()).await);
        }
        let res = self.transfer(&nodes, cancel).await;
        for node in nodes.iter() {
            node.manager.destroy().await;
        }
        res
    }

    async fn start_node(
        &self,
        index: usize,
        cancel: &CancellationToken,
        rendezvous: MemoryRendezvous,
    ) -> Node {
        let cache = SegmentCache::new(&self.settings);
        cache.spawn_cleanup(cancel.child_token());
        let fallback = FallbackRequests::new();
        let manager = SwarmManager::new(
            cancel.child_token(),
            MANIFEST_URL,
            rendezvous,
            cache.clone(),
            Arc::new(fallback.clone()),
            self.settings.clone(),
        );
        let swarm = manager.switch_active(&self.stream).await;
        debug!(node = index, swarm_id = swarm.swarm_id(), "node started");
        Node {
            index,
            cache,
            fallback,
            manager,
            swarm,
        }
    }

    async fn transfer(&self, nodes: &[Node], cancel: &CancellationToken) -> Result<Report> {
        wait_connected(nodes, self.peers - 1).await?;
        info!(peers = self.peers, "swarm connected");

        // Keep the seed copy around for the whole run.
        let seeder = &nodes[0];
        let stream_id = self.stream.local_id.clone();
        seeder
            .cache
            .register_pin(move |segment| segment.stream_id == stream_id);
        for segment in self.stream.segments() {
            seeder.load_from_origin(segment, self.payload(segment)?);
        }

        let segments: Vec<Arc<Segment>> = self.stream.segments().cloned().collect();
        let mut fetches = JoinSet::new();
        for node in nodes.iter().skip(1) {
            fetches.spawn(fetch_all(
                node.clone(),
                segments.clone(),
                self.payloads.clone(),
                self.settings.p2p_segment_download_timeout,
                cancel.clone(),
            ));
        }
        let mut report = Report::default();
        while let Some(res) = fetches.join_next().await {
            report.merge(res??);
        }
        Ok(report)
    }

    fn payload(&self, segment: &Segment) -> Result<Bytes> {
        match self.payloads.get(&segment.external_id) {
            Some(data) => Ok(data.clone()),
            None => bail!("no payload for segment {}", segment.external_id),
        }
    }
}

async fn wait_connected(nodes: &[Node], want: usize) -> Result<()> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    for node in nodes {
        while node.swarm.connected_peers().await?.len() < want {
            if Instant::now() >= deadline {
                bail!("node {} did not connect to {want} peers", node.index);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
    Ok(())
}

/// Load every segment in order, peers first.
async fn fetch_all(
    node: Node,
    segments: Vec<Arc<Segment>>,
    payloads: Arc<HashMap<String, Bytes>>,
    patience: Duration,
    cancel: CancellationToken,
) -> Result<Report> {
    let mut report = Report::default();
    for segment in segments {
        if cancel.is_cancelled() {
            break;
        }
        let Some(expected) = payloads.get(&segment.external_id).cloned() else {
            bail!("no payload for segment {}", segment.external_id);
        };
        let started = Instant::now();
        match fetch_from_peers(&node, &segment, patience, &cancel).await? {
            Some((data, remote_id)) if data == expected => {
                info!(
                    node = node.index,
                    segment = segment.external_id,
                    remote_id,
                    bytes = data.len(),
                    elapsed = ?started.elapsed(),
                    "segment from peer"
                );
                report.peer_segments += 1;
                report.peer_bytes += data.len() as u64;
                node.cache.store(segment.clone(), data);
            }
            Some((_, remote_id)) => {
                warn!(
                    node = node.index,
                    segment = segment.external_id,
                    remote_id,
                    "peer delivered wrong content"
                );
                report.origin_segments += 1;
                node.load_from_origin(&segment, expected);
            }
            None => {
                info!(node = node.index, segment = segment.external_id, "segment from origin");
                report.origin_segments += 1;
                node.load_from_origin(&segment, expected);
            }
        }
    }
    Ok(report)
}

async fn fetch_from_peers(
    node: &Node,
    segment: &Arc<Segment>,
    patience: Duration,
    cancel: &CancellationToken,
) -> Result<Option<(Bytes, String)>> {
    let deadline = Instant::now() + patience;
    loop {
        if let Some(fetch) = node.swarm.download_segment(segment.clone()).await? {
            let remote_id = fetch.remote_id().to_owned();
            let progress = fetch.watch_progress();
            match fetch.await {
                Ok(data) => return Ok(Some((data, remote_id))),
                Err(e) => {
                    warn!(
                        node = node.index,
                        segment = segment.external_id,
                        remote_id,
                        err = %e,
                        class = ?e.class(),
                        percent = progress.borrow().percent(),
                        "peer fetch failed"
                    );
                }
            }
        }
        if cancel.is_cancelled() || Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
