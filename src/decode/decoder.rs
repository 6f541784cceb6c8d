//! libavcodec-backed decoder producing pooled RGBA frames

use std::time::Instant;

use ffmpeg_sys_next as ffmpeg;
use tracing::{debug, instrument, trace};

use crate::decode::ffi::{av_error, CodecContext, NativeFrame, Packet, ScaleContext};
use crate::decode::frame::{FrameMetadata, PixelFormat};
use crate::decode::{FramePool, PooledFrame, VideoCodec};
use crate::error::DecodeError;
use crate::Metrics;

/// Decoder state for one stream
///
/// Owns the codec context, the frame libavcodec decodes into, and the
/// colour-conversion context used to fill pooled RGBA frames. All of them
/// are released together by [`close`](DecoderContext::close) or on drop.
pub struct DecoderContext {
    codec: VideoCodec,
    codec_ctx: Option<CodecContext>,
    /// Planar frame libavcodec decodes into
    src: Option<NativeFrame>,
    scaler: Option<ScaleContext>,
    pool: FramePool,
    sequence: u64,
    pending: u64,
    reallocations: u64,
    last_decode_time_us: u64,
}

impl DecoderContext {
    /// Open a decoder for `codec` drawing output frames from `pool`.
    #[instrument(skip(pool))]
    pub fn open(codec: VideoCodec, pool: FramePool) -> Result<Self, DecodeError> {
        let codec_ctx = CodecContext::open(codec)?;
        // codec_ctx is dropped (and freed) if this fails
        let src = NativeFrame::alloc()?;

        debug!("Opened {} decoder with pool capacity {}", codec, pool.capacity());
        Ok(Self {
            codec,
            codec_ctx: Some(codec_ctx),
            src: Some(src),
            scaler: None,
            pool,
            sequence: 0,
            pending: 0,
            reallocations: 0,
            last_decode_time_us: 0,
        })
    }

    pub fn h264(pool: FramePool) -> Result<Self, DecodeError> {
        Self::open(VideoCodec::H264, pool)
    }

    pub fn h265(pool: FramePool) -> Result<Self, DecodeError> {
        Self::open(VideoCodec::H265, pool)
    }

    pub fn mjpeg(pool: FramePool) -> Result<Self, DecodeError> {
        Self::open(VideoCodec::Mjpeg, pool)
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.codec_ctx.is_none()
    }

    /// Counters for this stream so far
    pub fn metrics(&self) -> Metrics {
        Metrics {
            frames_decoded: self.sequence,
            pending_units: self.pending,
            reallocations: self.reallocations,
            last_decode_time_us: self.last_decode_time_us,
            pool: self.pool.stats(),
        }
    }

    /// Decode one encoded unit.
    ///
    /// Returns `Ok(None)` when the decoder rejected the unit or needs more
    /// data before it can emit a frame. Errors are fatal to the stream.
    pub fn decode(&mut self, unit: &[u8]) -> Result<Option<PooledFrame>, DecodeError> {
        let started = Instant::now();
        let (Some(codec_ctx), Some(src)) = (self.codec_ctx.as_mut(), self.src.as_mut()) else {
            return Err(DecodeError::Closed);
        };

        let packet = Packet::with_prefix(self.codec.start_code(), unit)?;
        let res = codec_ctx.send_packet(&packet);
        if res == ffmpeg::AVERROR(libc::EAGAIN) {
            trace!("Decoder needs its output drained before accepting more data");
            self.pending += 1;
            metrics::counter!("decode_pending_total").increment(1);
            return Ok(None);
        }
        if res < 0 {
            debug!("Decoder rejected {} byte unit: {}", unit.len(), av_error(res));
            self.pending += 1;
            metrics::counter!("decode_pending_total").increment(1);
            return Ok(None);
        }

        let res = codec_ctx.receive_frame(src);
        if res < 0 {
            trace!("No frame ready: {}", av_error(res));
            self.pending += 1;
            metrics::counter!("decode_pending_total").increment(1);
            return Ok(None);
        }

        let (width, height, src_format) = (src.width(), src.height(), src.format());

        // The pooled frame is new (0x0), already the right size, or sized for
        // a previous resolution.
        let mut dst = self.pool.get()?;
        if dst.wrapper().is_freed() {
            return Err(DecodeError::StaleFrame);
        }

        if dst.wrapper().width() != width || dst.wrapper().height() != height {
            debug!(
                "(re)making frame due to AVFrame dimension discrepancy: Dst (width: {}, height: {}) vs Src (width: {}, height: {}, format: {:?})",
                dst.wrapper().width(),
                dst.wrapper().height(),
                width,
                height,
                PixelFormat::from_raw(src_format)
            );

            // Old-size frames must never be handed out next to a scaler built
            // for the new size: drop them all before touching the scaler.
            if dst.wrapper().is_sized() {
                dst.reallocate()?;
                self.reallocations += 1;
                metrics::counter!("pool_reallocations_total").increment(1);
            }
            self.scaler = None;
            if let Err(err) = dst.wrapper().alloc_rgba(width, height) {
                dst.discard();
                return Err(err);
            }
        }

        if !self
            .scaler
            .as_ref()
            .is_some_and(|s| s.matches(width, height, src_format))
        {
            self.scaler = None;
            self.scaler = Some(ScaleContext::new(width, height, src_format)?);
        }
        let scaler = self
            .scaler
            .as_mut()
            .ok_or(DecodeError::ScaleContext { width, height })?;

        // SAFETY: dst is checked out to us alone and was sized for this scaler above.
        if let Err(err) = unsafe { scaler.scale(src, dst.wrapper().as_mut_ptr()) } {
            dst.discard();
            return Err(err);
        }

        self.sequence += 1;
        let frame = dst.into_frame(FrameMetadata {
            sequence: self.sequence,
            width: width as u32,
            height: height as u32,
            timestamp: Instant::now(),
        });

        self.last_decode_time_us = started.elapsed().as_micros() as u64;
        metrics::counter!("decode_frames_total").increment(1);
        metrics::histogram!("decode_time_us").record(self.last_decode_time_us as f64);
        Ok(Some(frame))
    }

    /// Release the scaler, the source frame and the codec context.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.scaler = None;
        self.src = None;
        self.codec_ctx = None;
        debug!("Closed {} decoder after {} frames", self.codec, self.sequence);
    }
}

impl Drop for DecoderContext {
    fn drop(&mut self) {
        self.close();
    }
}
