use std::fmt;
use std::str::FromStr;

use ffmpeg_sys_next::AVCodecID;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::decode::{DecoderContext, FramePool, PooledFrame};
use crate::error::DecodeError;

/// Annex-B start code prepended to every H.264/H.265 unit
pub const H2645_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Video codec negotiated for a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    /// No usable codec could be identified
    Unknown,
    /// Not negotiated yet
    #[default]
    Agnostic,
    H264,
    H265,
    Mjpeg,
}

impl VideoCodec {
    /// libavcodec decoder id, if this is a concrete codec
    pub fn codec_id(&self) -> Option<AVCodecID> {
        match self {
            VideoCodec::H264 => Some(AVCodecID::AV_CODEC_ID_H264),
            VideoCodec::H265 => Some(AVCodecID::AV_CODEC_ID_HEVC),
            VideoCodec::Mjpeg => Some(AVCodecID::AV_CODEC_ID_MJPEG),
            VideoCodec::Unknown | VideoCodec::Agnostic => None,
        }
    }

    /// Framing that must precede each unit handed to the decoder
    pub fn start_code(&self) -> &'static [u8] {
        match self {
            VideoCodec::H264 | VideoCodec::H265 => &H2645_START_CODE,
            VideoCodec::Mjpeg | VideoCodec::Unknown | VideoCodec::Agnostic => &[],
        }
    }

    pub fn is_concrete(&self) -> bool {
        self.codec_id().is_some()
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoCodec::Unknown => "Unknown",
            VideoCodec::Agnostic => "Agnostic",
            VideoCodec::H264 => "H264",
            VideoCodec::H265 => "H265",
            VideoCodec::Mjpeg => "MJPEG",
        };
        f.write_str(name)
    }
}

impl FromStr for VideoCodec {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(VideoCodec::H264),
            "h265" | "hevc" => Ok(VideoCodec::H265),
            "mjpeg" | "mjpg" | "jpeg" => Ok(VideoCodec::Mjpeg),
            "agnostic" => Ok(VideoCodec::Agnostic),
            _ => Err(DecodeError::UnresolvedCodec(VideoCodec::Unknown)),
        }
    }
}

/// Holds the decoder for a stream's negotiated codec
///
/// The codec starts out `Agnostic`; it must be resolved before the first
/// `decode` call. The decoder itself is opened lazily on that first call and
/// reopened whenever the codec is resolved to something different.
pub struct CodecSelector {
    codec: VideoCodec,
    pool_capacity: usize,
    decoder: Option<DecoderContext>,
}

impl CodecSelector {
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            codec: VideoCodec::Agnostic,
            pool_capacity,
            decoder: None,
        }
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Record the negotiated codec, closing any decoder opened for another one.
    pub fn resolve(&mut self, codec: VideoCodec) {
        if codec == self.codec {
            return;
        }
        if let Some(mut decoder) = self.decoder.take() {
            debug!("Closing {} decoder, codec resolved to {}", self.codec, codec);
            decoder.close();
        }
        self.codec = codec;
    }

    /// Open the decoder constructor matching `codec` on a fresh pool.
    pub fn open(codec: VideoCodec, pool_capacity: usize) -> Result<DecoderContext, DecodeError> {
        let pool = FramePool::new(pool_capacity);
        match codec {
            VideoCodec::H264 => DecoderContext::h264(pool),
            VideoCodec::H265 => DecoderContext::h265(pool),
            VideoCodec::Mjpeg => DecoderContext::mjpeg(pool),
            VideoCodec::Unknown | VideoCodec::Agnostic => Err(DecodeError::UnresolvedCodec(codec)),
        }
    }

    /// Decode one unit with the selected codec.
    pub fn decode(&mut self, unit: &[u8]) -> Result<Option<PooledFrame>, DecodeError> {
        if !self.codec.is_concrete() {
            return Err(DecodeError::UnresolvedCodec(self.codec));
        }
        if self.decoder.is_none() {
            info!("Opening {} decoder", self.codec);
            self.decoder = Some(Self::open(self.codec, self.pool_capacity)?);
        }
        let decoder = self.decoder.as_mut().ok_or(DecodeError::Closed)?;
        decoder.decode(unit)
    }

    pub fn decoder(&self) -> Option<&DecoderContext> {
        self.decoder.as_ref()
    }

    pub fn close(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names() {
        assert_eq!(VideoCodec::Unknown.to_string(), "Unknown");
        assert_eq!(VideoCodec::Agnostic.to_string(), "Agnostic");
        assert_eq!(VideoCodec::H264.to_string(), "H264");
        assert_eq!(VideoCodec::H265.to_string(), "H265");
        assert_eq!(VideoCodec::Mjpeg.to_string(), "MJPEG");
    }

    #[test]
    fn test_start_code_only_for_annex_b_codecs() {
        assert_eq!(VideoCodec::H264.start_code(), &H2645_START_CODE);
        assert_eq!(VideoCodec::H265.start_code(), &H2645_START_CODE);
        assert!(VideoCodec::Mjpeg.start_code().is_empty());
    }

    #[test]
    fn test_parse_codec_names() {
        assert_eq!("H264".parse::<VideoCodec>().unwrap(), VideoCodec::H264);
        assert_eq!("hevc".parse::<VideoCodec>().unwrap(), VideoCodec::H265);
        assert_eq!("mjpeg".parse::<VideoCodec>().unwrap(), VideoCodec::Mjpeg);
        assert!("vp9".parse::<VideoCodec>().is_err());
    }

    #[test]
    fn test_decode_while_agnostic_is_usage_error() {
        let mut selector = CodecSelector::new(2);
        assert!(matches!(
            selector.decode(&[0x65]),
            Err(DecodeError::UnresolvedCodec(VideoCodec::Agnostic))
        ));
        assert!(selector.decoder().is_none());

        selector.resolve(VideoCodec::Unknown);
        assert!(matches!(
            selector.decode(&[0x65]),
            Err(DecodeError::UnresolvedCodec(VideoCodec::Unknown))
        ));
    }

    #[test]
    fn test_resolve_opens_lazily_and_switches() {
        let mut selector = CodecSelector::new(2);
        selector.resolve(VideoCodec::H264);
        assert!(selector.decoder().is_none());

        // An access unit delimiter on its own never completes a frame
        assert!(selector.decode(&[0x09, 0xf0]).unwrap().is_none());
        assert_eq!(selector.decoder().unwrap().codec(), VideoCodec::H264);

        selector.resolve(VideoCodec::Mjpeg);
        assert!(selector.decoder().is_none());
        assert_eq!(selector.codec(), VideoCodec::Mjpeg);
    }
}
