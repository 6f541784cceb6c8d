//! Scope-guarded owners for the libav handles used by the decoder
//!
//! Every native pointer lives inside exactly one of these types and is
//! released by its `Drop` impl, so early returns never leak a handle.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;

use ffmpeg_sys_next as ffmpeg;
use ffmpeg_sys_next::{AVCodecContext, AVFrame, AVPacket, AVPixelFormat, SwsContext};

use crate::decode::VideoCodec;
use crate::error::DecodeError;

/// Pixel format of every pooled output buffer
pub const OUTPUT_PIXEL_FORMAT: AVPixelFormat = AVPixelFormat::AV_PIX_FMT_RGBA;

/// Converts a libav error code to its message string.
pub fn av_error(code: c_int) -> String {
    let mut buf = [0 as c_char; ffmpeg::AV_ERROR_MAX_STRING_SIZE as usize];
    let res = unsafe { ffmpeg::av_strerror(code, buf.as_mut_ptr(), buf.len()) };
    if res < 0 {
        return format!("Unknown error with code {}", code);
    }
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Sets libav's own logger to FATAL to cut down on log spam.
pub fn set_libav_log_level_fatal() {
    unsafe { ffmpeg::av_log_set_level(ffmpeg::AV_LOG_FATAL as c_int) };
}

/// Opened decoder context for one codec
pub struct CodecContext {
    ptr: *mut AVCodecContext,
}

impl CodecContext {
    /// Find, allocate and open the decoder for `codec`.
    ///
    /// Nothing stays allocated when this returns an error.
    pub fn open(codec: VideoCodec) -> Result<Self, DecodeError> {
        let codec_id = codec
            .codec_id()
            .ok_or(DecodeError::UnresolvedCodec(codec))?;

        unsafe {
            let decoder = ffmpeg::avcodec_find_decoder(codec_id);
            if decoder.is_null() {
                return Err(DecodeError::CodecNotFound(codec));
            }

            let ptr = ffmpeg::avcodec_alloc_context3(decoder);
            if ptr.is_null() {
                return Err(DecodeError::ContextAlloc);
            }
            // Owned from here on, so the error path below frees it
            let ctx = Self { ptr };

            let res = ffmpeg::avcodec_open2(ctx.ptr, decoder, ptr::null_mut());
            if res < 0 {
                return Err(DecodeError::CodecOpen {
                    codec,
                    reason: av_error(res),
                });
            }

            Ok(ctx)
        }
    }

    /// Submit one packet. Returns the raw libav status.
    pub fn send_packet(&mut self, packet: &Packet) -> c_int {
        unsafe { ffmpeg::avcodec_send_packet(self.ptr, packet.ptr) }
    }

    /// Receive a decoded frame into `frame`. Returns the raw libav status.
    pub fn receive_frame(&mut self, frame: &mut NativeFrame) -> c_int {
        unsafe { ffmpeg::avcodec_receive_frame(self.ptr, frame.ptr) }
    }
}

impl Drop for CodecContext {
    fn drop(&mut self) {
        unsafe {
            if !self.ptr.is_null() {
                ffmpeg::avcodec_free_context(&mut self.ptr);
            }
        }
    }
}

/// Frame owned outright by the decoder (never pooled)
pub struct NativeFrame {
    ptr: *mut AVFrame,
}

impl NativeFrame {
    pub fn alloc() -> Result<Self, DecodeError> {
        let ptr = unsafe { ffmpeg::av_frame_alloc() };
        if ptr.is_null() {
            return Err(DecodeError::FrameAlloc);
        }
        Ok(Self { ptr })
    }

    pub fn width(&self) -> i32 {
        unsafe { (*self.ptr).width }
    }

    pub fn height(&self) -> i32 {
        unsafe { (*self.ptr).height }
    }

    /// Raw `AVPixelFormat` value as written by libavcodec
    pub fn format(&self) -> c_int {
        unsafe { (*self.ptr).format }
    }

    pub(crate) fn as_ptr(&self) -> *const AVFrame {
        self.ptr
    }
}

impl Drop for NativeFrame {
    fn drop(&mut self) {
        unsafe {
            if !self.ptr.is_null() {
                ffmpeg::av_frame_free(&mut self.ptr);
            }
        }
    }
}

/// Packet holding its own padded copy of the encoded bytes
pub struct Packet {
    ptr: *mut AVPacket,
}

impl Packet {
    /// Build a packet from `prefix` followed by `unit`.
    pub fn with_prefix(prefix: &[u8], unit: &[u8]) -> Result<Self, DecodeError> {
        let size = prefix.len() + unit.len();
        let ptr = unsafe { ffmpeg::av_packet_alloc() };
        if ptr.is_null() {
            return Err(DecodeError::PacketAlloc(size));
        }
        let packet = Self { ptr };

        let len = c_int::try_from(size).map_err(|_| DecodeError::PacketAlloc(size))?;
        unsafe {
            // av_new_packet zeroes the trailing input padding libavcodec reads past the end
            if ffmpeg::av_new_packet(packet.ptr, len) < 0 {
                return Err(DecodeError::PacketAlloc(size));
            }
            if size == 0 {
                return Ok(packet);
            }
            let data = std::slice::from_raw_parts_mut((*packet.ptr).data, size);
            data[..prefix.len()].copy_from_slice(prefix);
            data[prefix.len()..].copy_from_slice(unit);
        }
        Ok(packet)
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        unsafe {
            if !self.ptr.is_null() {
                ffmpeg::av_packet_free(&mut self.ptr);
            }
        }
    }
}

/// Colour-conversion context between two fixed sizes and formats
pub struct ScaleContext {
    ptr: *mut SwsContext,
    width: i32,
    height: i32,
    src_format: c_int,
}

impl ScaleContext {
    /// Create a same-size conversion from `src_format` to RGBA.
    pub fn new(width: i32, height: i32, src_format: c_int) -> Result<Self, DecodeError> {
        // SAFETY: src_format was written by libavcodec into a decoded frame,
        // so it is a valid AVPixelFormat discriminant.
        let src_pix_fmt = unsafe { std::mem::transmute::<c_int, AVPixelFormat>(src_format) };
        let ptr = unsafe {
            ffmpeg::sws_getContext(
                width,
                height,
                src_pix_fmt,
                width,
                height,
                OUTPUT_PIXEL_FORMAT,
                ffmpeg::SWS_BILINEAR as c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if ptr.is_null() {
            return Err(DecodeError::ScaleContext { width, height });
        }
        Ok(Self {
            ptr,
            width,
            height,
            src_format,
        })
    }

    /// True if this context converts frames of the given shape.
    pub fn matches(&self, width: i32, height: i32, src_format: c_int) -> bool {
        self.width == width && self.height == height && self.src_format == src_format
    }

    /// Convert the whole of `src` into `dst`.
    ///
    /// # Safety
    /// `dst` must point to a live frame whose buffers were allocated for this
    /// context's size in RGBA, and no other thread may access it during the call.
    pub unsafe fn scale(&mut self, src: &NativeFrame, dst: *mut AVFrame) -> Result<(), DecodeError> {
        let src = src.as_ptr();
        let res = ffmpeg::sws_scale(
            self.ptr,
            (*src).data.as_ptr() as *const *const u8,
            (*src).linesize.as_ptr(),
            0,
            (*src).height,
            (*dst).data.as_ptr(),
            (*dst).linesize.as_ptr(),
        );
        if res < 0 {
            return Err(DecodeError::Scale(av_error(res)));
        }
        if res != (*src).height {
            return Err(DecodeError::Scale(format!(
                "returned {} rows (expected {})",
                res,
                (*src).height
            )));
        }
        Ok(())
    }
}

impl Drop for ScaleContext {
    fn drop(&mut self) {
        unsafe {
            if !self.ptr.is_null() {
                ffmpeg::sws_freeContext(self.ptr);
                self.ptr = ptr::null_mut();
            }
        }
    }
}
