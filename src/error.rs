use thiserror::Error;

use crate::decode::VideoCodec;

/// Errors that can occur while opening a decoder or decoding a unit
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no decoder available for codec {0}")]
    CodecNotFound(VideoCodec),
    #[error("avcodec_alloc_context3() failed")]
    ContextAlloc,
    #[error("failed to open {codec} decoder: {reason}")]
    CodecOpen { codec: VideoCodec, reason: String },
    #[error("failed to allocate AVFrame: out of memory or libav internal error")]
    FrameAlloc,
    #[error("failed to allocate AVPacket of {0} bytes")]
    PacketAlloc(usize),
    #[error("av_frame_get_buffer() failed: {0}")]
    BufferAlloc(String),
    #[error("sws_getContext() failed for {width}x{height}")]
    ScaleContext { width: i32, height: i32 },
    #[error("sws_scale() failed: {0}")]
    Scale(String),
    #[error("failed to obtain a frame from the pool")]
    PoolExhausted,
    #[error("got frame from pool that was already freed")]
    StaleFrame,
    #[error("codec {0} must be resolved to a concrete codec before decoding")]
    UnresolvedCodec(VideoCodec),
    #[error("decoder is closed")]
    Closed,
}

/// Errors that can occur during a single WS-Discovery attempt
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to resolve UDP address {0}")]
    Resolve(String),
    #[error("failed to create UDP socket: {0}")]
    Socket(#[source] std::io::Error),
    #[error("failed to send discovery message: {0}")]
    Send(#[source] std::io::Error),
    #[error("error reading from UDP: {0}")]
    Recv(#[source] std::io::Error),
    #[error("error unmarshalling probe match: {0}")]
    Parse(String),
}

/// Errors raised while layering configuration sources
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
