pub mod codec;
pub mod decoder;
pub mod ffi;
pub mod frame;
pub mod pool;

pub use codec::{CodecSelector, VideoCodec, H2645_START_CODE};
pub use decoder::DecoderContext;
pub use frame::{FrameMetadata, FrameWrapper, PixelFormat, RgbaView};
pub use pool::{Checkout, FramePool, PoolStats, PooledFrame};
