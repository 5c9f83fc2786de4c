pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod frames;
pub mod ingest;
pub mod metrics;
pub mod sched;
pub mod shared;
pub mod store;
pub mod upstream;

use std::sync::Arc;

/// Shared state accessible by the operator surface and the subscriber
/// channel.
pub struct EngineState {
    pub config: config::Config,
    pub settings: config::SettingsHandle,
    pub counters: Arc<metrics::Counters>,
    pub store: Arc<store::TickStore>,
    pub upstream: Arc<upstream::UpstreamClient>,
    pub ingest: Arc<ingest::LiveIngestLoop>,
    pub frames: Arc<frames::FrameAggregator>,
    pub bridge: Arc<bridge::FanoutBridge>,
    pub scheduler: Arc<sched::Scheduler>,
}
