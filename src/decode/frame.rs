use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering};
use std::time::Instant;

use ffmpeg_sys_next as ffmpeg;
use ffmpeg_sys_next::{AVColorRange, AVFrame, AVPixelFormat};
use image::{ImageBuffer, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::decode::ffi::{av_error, OUTPUT_PIXEL_FORMAT};
use crate::error::DecodeError;

/// Bytes per output pixel (RGBA)
pub const BYTES_PER_PIXEL: usize = 4;

/// Pixel layouts a frame can carry
///
/// Pooled frames are always [`PixelFormat::Rgba`] once sized. The planar
/// variants describe what libavcodec hands the scaler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// No buffer has been sized yet
    #[default]
    Unset,
    Rgba,
    Yuv420p,
    Yuv422p,
    Yuvj420p,
    Yuvj422p,
    Yuvj444p,
    /// Any other raw `AVPixelFormat` value
    Other(i32),
}

impl PixelFormat {
    pub fn from_raw(format: i32) -> Self {
        const NONE: i32 = AVPixelFormat::AV_PIX_FMT_NONE as i32;
        const RGBA: i32 = AVPixelFormat::AV_PIX_FMT_RGBA as i32;
        const YUV420P: i32 = AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
        const YUV422P: i32 = AVPixelFormat::AV_PIX_FMT_YUV422P as i32;
        const YUVJ420P: i32 = AVPixelFormat::AV_PIX_FMT_YUVJ420P as i32;
        const YUVJ422P: i32 = AVPixelFormat::AV_PIX_FMT_YUVJ422P as i32;
        const YUVJ444P: i32 = AVPixelFormat::AV_PIX_FMT_YUVJ444P as i32;

        match format {
            NONE => Self::Unset,
            RGBA => Self::Rgba,
            YUV420P => Self::Yuv420p,
            YUV422P => Self::Yuv422p,
            YUVJ420P => Self::Yuvj420p,
            YUVJ422P => Self::Yuvj422p,
            YUVJ444P => Self::Yuvj444p,
            other => Self::Other(other),
        }
    }
}

/// Per-decode metadata shared by every handle to the same frame
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// When the colour conversion finished
    pub timestamp: Instant,
}

/// Wraps one libav `AVFrame` holding an RGBA image
///
/// The native frame is released exactly once, either when the pool evicts
/// the wrapper or when it is dropped. Reference counting is atomic so a
/// consumer thread may release a frame while the decoder thread is preparing
/// the next one.
#[derive(Debug)]
pub struct FrameWrapper {
    frame: AtomicPtr<AVFrame>,
    freed: AtomicBool,
    in_pool: AtomicBool,
    ref_count: AtomicI64,
    generation: u64,
}

impl FrameWrapper {
    /// Allocate an empty frame (no pixel buffer, 0x0) tagged with a pool generation.
    pub(crate) fn new(generation: u64) -> Result<Self, DecodeError> {
        let frame = unsafe { ffmpeg::av_frame_alloc() };
        if frame.is_null() {
            return Err(DecodeError::FrameAlloc);
        }
        Ok(Self {
            frame: AtomicPtr::new(frame),
            freed: AtomicBool::new(false),
            in_pool: AtomicBool::new(false),
            ref_count: AtomicI64::new(0),
            generation,
        })
    }

    pub(crate) fn increment_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the reference count and return the new value.
    ///
    /// Panics if the count goes negative: the frame's lifetime bookkeeping is
    /// already corrupt and carrying on risks reading freed memory.
    pub(crate) fn decrement_ref(&self) -> i64 {
        let count = self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if count < 0 {
            panic!("ref count became negative");
        }
        count
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Release the native frame. Panics on a second call.
    ///
    /// Only the pool calls this, once no handle can reach the wrapper.
    pub(crate) fn free(&self) {
        if self
            .freed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("av frame was double freed");
        }
        let mut frame = self.frame.swap(std::ptr::null_mut(), Ordering::AcqRel);
        unsafe { ffmpeg::av_frame_free(&mut frame) };
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub fn is_in_pool(&self) -> bool {
        self.in_pool.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_pool(&self, in_pool: bool) {
        self.in_pool.store(in_pool, Ordering::Release);
    }

    /// Pool generation this wrapper was allocated under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn width(&self) -> i32 {
        self.read(|f| f.width)
    }

    pub fn height(&self) -> i32 {
        self.read(|f| f.height)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        let frame = self.frame.load(Ordering::Acquire);
        if frame.is_null() {
            return PixelFormat::Unset;
        }
        PixelFormat::from_raw(unsafe { (*frame).format })
    }

    /// True once a pixel buffer has been sized for some resolution
    pub fn is_sized(&self) -> bool {
        self.width() > 0 || self.height() > 0
    }

    fn read<T: Default>(&self, f: impl FnOnce(&AVFrame) -> T) -> T {
        let frame = self.frame.load(Ordering::Acquire);
        if frame.is_null() {
            return T::default();
        }
        unsafe { f(&*frame) }
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut AVFrame {
        self.frame.load(Ordering::Acquire)
    }

    /// Size the frame for a full-range RGBA image and allocate its buffer.
    ///
    /// Only valid on a freshly allocated wrapper that nobody else can see.
    pub(crate) fn alloc_rgba(&self, width: i32, height: i32) -> Result<(), DecodeError> {
        let frame = self.as_mut_ptr();
        if frame.is_null() {
            return Err(DecodeError::StaleFrame);
        }
        unsafe {
            (*frame).format = OUTPUT_PIXEL_FORMAT as i32;
            (*frame).width = width;
            (*frame).height = height;
            (*frame).color_range = AVColorRange::AVCOL_RANGE_JPEG;

            let res = ffmpeg::av_frame_get_buffer(frame, 1);
            if res < 0 {
                // Leave no size behind that a later decode could mistake for a buffer
                (*frame).format = AVPixelFormat::AV_PIX_FMT_NONE as i32;
                (*frame).width = 0;
                (*frame).height = 0;
                return Err(DecodeError::BufferAlloc(av_error(res)));
            }
            // libav hands back uninitialised memory
            let len = (*frame).linesize[0].max(0) as usize * height.max(0) as usize;
            std::ptr::write_bytes((*frame).data[0], 0, len);
        }
        Ok(())
    }

    /// Zero-copy view of the RGBA pixels.
    ///
    /// The caller must hold a reference for as long as the view is used.
    pub fn to_image(&self) -> RgbaView<'_> {
        assert!(!self.is_freed(), "image requested from a freed av frame");
        assert!(
            self.ref_count() > 0,
            "image requested without holding a reference"
        );
        let frame = self.as_mut_ptr();
        unsafe {
            let width = (*frame).width.max(0) as u32;
            let height = (*frame).height.max(0) as u32;
            let stride = (*frame).linesize[0].max(0) as usize;
            let data_ptr = (*frame).data[0];
            let data = if data_ptr.is_null() {
                &[][..]
            } else {
                std::slice::from_raw_parts(data_ptr, stride * height as usize)
            };
            RgbaView {
                width,
                height,
                stride,
                data,
            }
        }
    }
}

impl Drop for FrameWrapper {
    fn drop(&mut self) {
        if self
            .freed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut frame = self.frame.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !frame.is_null() {
                unsafe { ffmpeg::av_frame_free(&mut frame) };
            }
        }
    }
}

/// Borrowed RGBA pixels of a decoded frame
#[derive(Debug, Clone, Copy)]
pub struct RgbaView<'a> {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`
    pub stride: usize,
    pub data: &'a [u8],
}

impl<'a> RgbaView<'a> {
    /// Pixels of row `y`, without the stride padding.
    ///
    /// # Panics
    ///
    /// Panics if `y >= height`.
    pub fn row(&self, y: u32) -> &'a [u8] {
        assert!(y < self.height, "row {} out of range for height {}", y, self.height);
        let start = y as usize * self.stride;
        &self.data[start..start + self.width as usize * BYTES_PER_PIXEL]
    }

    /// RGBA value at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates fall outside the image. Use
    /// [`get_pixel`](RgbaView::get_pixel) for a checked lookup.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        assert!(x < self.width, "column {} out of range for width {}", x, self.width);
        let offset = x as usize * BYTES_PER_PIXEL;
        let row = self.row(y);
        [row[offset], row[offset + 1], row[offset + 2], row[offset + 3]]
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.pixel(x, y))
    }

    /// Borrow the pixels as an `image` buffer when rows are tightly packed.
    pub fn as_image_buffer(&self) -> Option<ImageBuffer<Rgba<u8>, &'a [u8]>> {
        if self.stride != self.width as usize * BYTES_PER_PIXEL {
            return None;
        }
        ImageBuffer::from_raw(self.width, self.height, self.data)
    }

    /// Copy the pixels out into an owned image.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * BYTES_PER_PIXEL);
        for y in 0..self.height {
            pixels.extend_from_slice(self.row(y));
        }
        RgbaImage::from_raw(self.width, self.height, pixels).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_wrapper_is_empty() {
        let wrapper = FrameWrapper::new(0).unwrap();
        assert_eq!(wrapper.width(), 0);
        assert_eq!(wrapper.height(), 0);
        assert!(!wrapper.is_sized());
        assert_eq!(wrapper.ref_count(), 0);
        assert!(!wrapper.is_freed());
        assert!(!wrapper.is_in_pool());
    }

    #[test]
    fn test_ref_counting() {
        let wrapper = FrameWrapper::new(0).unwrap();
        wrapper.increment_ref();
        wrapper.increment_ref();
        assert_eq!(wrapper.decrement_ref(), 1);
        assert_eq!(wrapper.decrement_ref(), 0);
    }

    #[test]
    #[should_panic(expected = "ref count became negative")]
    fn test_negative_ref_count_panics() {
        let wrapper = FrameWrapper::new(0).unwrap();
        wrapper.increment_ref();
        wrapper.decrement_ref();
        wrapper.decrement_ref();
    }

    #[test]
    #[should_panic(expected = "av frame was double freed")]
    fn test_double_free_panics() {
        let wrapper = FrameWrapper::new(0).unwrap();
        wrapper.free();
        assert!(wrapper.is_freed());
        wrapper.free();
    }

    #[test]
    fn test_freed_wrapper_reports_zero_size() {
        let wrapper = FrameWrapper::new(0).unwrap();
        wrapper.alloc_rgba(8, 4).unwrap();
        assert_eq!((wrapper.width(), wrapper.height()), (8, 4));
        wrapper.free();
        assert_eq!((wrapper.width(), wrapper.height()), (0, 0));
    }

    #[test]
    fn test_concurrent_ref_counting_balances() {
        let wrapper = FrameWrapper::new(0).unwrap();
        wrapper.increment_ref();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        wrapper.increment_ref();
                        wrapper.decrement_ref();
                    }
                });
            }
        });
        assert_eq!(wrapper.ref_count(), 1);
    }

    #[test]
    fn test_view_over_allocated_buffer() {
        let wrapper = FrameWrapper::new(0).unwrap();
        wrapper.alloc_rgba(6, 3).unwrap();
        wrapper.increment_ref();
        let view = wrapper.to_image();
        assert_eq!((view.width, view.height), (6, 3));
        assert_eq!(view.stride, 6 * BYTES_PER_PIXEL);
        assert_eq!(view.data.len(), 6 * 3 * BYTES_PER_PIXEL);
        assert!(view.as_image_buffer().is_some());
        assert_eq!(view.to_rgba_image().dimensions(), (6, 3));
        wrapper.decrement_ref();
    }

    #[test]
    fn test_pixel_format_follows_allocation() {
        let wrapper = FrameWrapper::new(0).unwrap();
        assert_eq!(wrapper.pixel_format(), PixelFormat::Unset);
        wrapper.alloc_rgba(4, 4).unwrap();
        assert_eq!(wrapper.pixel_format(), PixelFormat::Rgba);
        wrapper.free();
        assert_eq!(wrapper.pixel_format(), PixelFormat::Unset);
    }

    #[test]
    fn test_pixel_format_from_raw() {
        assert_eq!(
            PixelFormat::from_raw(AVPixelFormat::AV_PIX_FMT_YUVJ420P as i32),
            PixelFormat::Yuvj420p
        );
        assert_eq!(
            PixelFormat::from_raw(AVPixelFormat::AV_PIX_FMT_NV12 as i32),
            PixelFormat::Other(AVPixelFormat::AV_PIX_FMT_NV12 as i32)
        );
    }

    #[test]
    fn test_failed_buffer_alloc_leaves_wrapper_unsized() {
        let wrapper = FrameWrapper::new(0).unwrap();
        // Far beyond what av_image_check_size accepts
        let err = wrapper.alloc_rgba(1 << 20, 1 << 20).unwrap_err();
        assert!(matches!(err, DecodeError::BufferAlloc(_)));
        assert!(!wrapper.is_sized());
        assert_eq!(wrapper.pixel_format(), PixelFormat::Unset);

        // Still usable for a sane size afterwards
        wrapper.alloc_rgba(2, 2).unwrap();
        assert_eq!((wrapper.width(), wrapper.height()), (2, 2));
    }

    #[test]
    fn test_get_pixel_is_checked() {
        let wrapper = FrameWrapper::new(0).unwrap();
        wrapper.alloc_rgba(3, 2).unwrap();
        wrapper.increment_ref();
        let view = wrapper.to_image();
        assert_eq!(view.get_pixel(2, 1), Some([0, 0, 0, 0]));
        assert_eq!(view.get_pixel(3, 0), None);
        assert_eq!(view.get_pixel(0, 2), None);
        wrapper.decrement_ref();
    }

    #[test]
    #[should_panic(expected = "out of range for width")]
    fn test_pixel_past_row_end_panics() {
        let wrapper = FrameWrapper::new(0).unwrap();
        wrapper.alloc_rgba(3, 2).unwrap();
        wrapper.increment_ref();
        // Inside the padded row but outside the image
        let _ = wrapper.to_image().pixel(3, 0);
    }

    #[test]
    #[should_panic(expected = "without holding a reference")]
    fn test_view_requires_reference() {
        let wrapper = FrameWrapper::new(0).unwrap();
        wrapper.alloc_rgba(2, 2).unwrap();
        let _ = wrapper.to_image();
    }
}
