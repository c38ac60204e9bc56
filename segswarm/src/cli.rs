use std::time::Duration;

use clap::{arg, Parser, Subcommand};
use segswarm_peer::Settings;

#[derive(Parser, Debug)]
#[command(name = "segswarm")]
#[command(bin_name = "segswarm")]
pub struct Cli {
    /// Seconds an unaccessed segment stays cached.
    #[arg(long, env, default_value = "120")]
    pub cached_segment_expiration_secs: u64,

    #[arg(long, env, default_value = "50")]
    pub cached_segments_count: usize,

    #[arg(long, env, default_value = "1000")]
    pub storage_cleanup_interval_ms: u64,

    /// Milliseconds a peer has to deliver a requested segment.
    #[arg(long, env, default_value = "5000")]
    pub p2p_segment_download_timeout_ms: u64,

    #[arg(long, env, default_value = "65535")]
    pub max_message_size: usize,

    #[arg(long, env, default_value = "30")]
    pub swarm_destroy_grace_secs: u64,

    #[arg(long, env, default_value = "15")]
    pub rendezvous_retry_max_elapsed_secs: u64,

    #[command(subcommand)]
    pub commands: Commands,
}

impl Cli {
    pub fn settings(&self) -> Settings {
        Settings {
            cached_segment_expiration: Duration::from_secs(self.cached_segment_expiration_secs),
            cached_segments_count: self.cached_segments_count,
            storage_cleanup_interval: Duration::from_millis(self.storage_cleanup_interval_ms),
            p2p_segment_download_timeout: Duration::from_millis(
                self.p2p_segment_download_timeout_ms,
            ),
            max_message_size: self.max_message_size,
            swarm_destroy_grace: Duration::from_secs(self.swarm_destroy_grace_secs),
            rendezvous_retry_max_elapsed: Duration::from_secs(
                self.rendezvous_retry_max_elapsed_secs,
            ),
        }
    }

    pub fn version(&self) -> bool {
        matches!(self.commands, Commands::Version)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a swarm of in-process peers sharing one stream.
    Simulate {
        #[arg(long = "peers", short = 'n', default_value = "4")]
        peers: usize,

        #[arg(long = "segments", short = 's', default_value = "10")]
        segments: usize,

        #[arg(long = "segment-size", default_value = "262144")]
        segment_size: usize,
    },
    Version,
}
