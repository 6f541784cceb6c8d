pub mod decode;
pub mod discovery;
pub mod error;
pub mod pipeline;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use decode::{CodecSelector, DecoderContext, FramePool, PoolStats, PooledFrame, VideoCodec};
pub use discovery::Discovery;
pub use error::{ConfigError, DecodeError, DiscoveryError};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub decoder: DecoderConfig,
    pub discovery: DiscoveryConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Frames kept for reuse per stream
    pub pool_capacity: usize,
    /// Silence libav's own logger below FATAL
    pub quiet_native_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub multicast_address: String,
    pub timeout_ms: u64,
    pub recv_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Encoded units buffered ahead of the decode thread
    pub queue_depth: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 4,
            quiet_native_logs: true,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_address: discovery::DEFAULT_MULTICAST_ADDRESS.to_string(),
            timeout_ms: discovery::DEFAULT_TIMEOUT.as_millis() as u64,
            recv_buffer: 8192,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { queue_depth: 8 }
    }
}

/// Decode counters collected for one stream
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub frames_decoded: u64,
    /// Units that produced no frame (rejected or awaiting more data)
    pub pending_units: u64,
    /// Resolution changes that forced the pool to be cleared
    pub reallocations: u64,
    pub last_decode_time_us: u64,
    pub pool: PoolStats,
}

impl Config {
    /// Layer defaults, an optional TOML file, then `CAMDECODE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("CAMDECODE").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
