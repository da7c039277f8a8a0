//! VideoToolbox decoder backend (macOS).
//!
//! Raw FFI against CoreMedia and VideoToolbox. Samples are copied into a
//! block buffer owned by CoreMedia so decoding can run asynchronously after
//! `decode` returns.

use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, trace, warn};

use mirror_ipc::VideoCodec;

use crate::error::DecoderError;
use crate::{
    DecodedImage, DecoderBackend, DecoderEvent, DecoderResult, FormatDescription,
    HardwareSession, ImageBuffer,
};

const MICROS_PER_SECOND: i32 = 1_000_000;

/// kCMBlockBufferAssureMemoryNowFlag
const BLOCK_BUFFER_ASSURE_MEMORY_NOW: u32 = 1 << 0;
/// kVTDecodeFrame_EnableAsynchronousDecompression
const DECODE_FRAME_ASYNC: u32 = 1 << 0;
/// kVTDecodeInfo_FrameDropped
const DECODE_INFO_FRAME_DROPPED: u32 = 1 << 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct CMTime {
    value: i64,
    timescale: i32,
    flags: u32,
    epoch: i64,
}

impl CMTime {
    const fn invalid() -> Self {
        Self {
            value: 0,
            timescale: 0,
            flags: 0,
            epoch: 0,
        }
    }

    fn from_duration(duration: Duration) -> Self {
        Self {
            value: duration.as_micros() as i64,
            timescale: MICROS_PER_SECOND,
            // kCMTimeFlags_Valid
            flags: 1,
            epoch: 0,
        }
    }

    fn to_duration(self) -> Duration {
        if self.timescale <= 0 || self.value < 0 {
            return Duration::ZERO;
        }
        let nanos = self.value as i128 * 1_000_000_000 / self.timescale as i128;
        Duration::from_nanos(nanos as u64)
    }
}

#[repr(C)]
struct CMSampleTimingInfo {
    duration: CMTime,
    presentation_time_stamp: CMTime,
    decode_time_stamp: CMTime,
}

type VTDecompressionOutputCallback = extern "C" fn(
    decompression_output_ref_con: *mut c_void,
    source_frame_ref_con: *mut c_void,
    status: i32,
    info_flags: u32,
    image_buffer: *mut c_void,
    presentation_time_stamp: CMTime,
    presentation_duration: CMTime,
);

#[repr(C)]
struct VTDecompressionOutputCallbackRecord {
    decompression_output_callback: Option<VTDecompressionOutputCallback>,
    decompression_output_ref_con: *mut c_void,
}

#[link(name = "CoreVideo", kind = "framework")]
extern "C" {
    fn CVPixelBufferGetWidth(pixel_buffer: *const c_void) -> usize;
    fn CVPixelBufferGetHeight(pixel_buffer: *const c_void) -> usize;
}

#[link(name = "CoreMedia", kind = "framework")]
extern "C" {
    fn CMVideoFormatDescriptionCreateFromH264ParameterSets(
        allocator: *const c_void,
        parameter_set_count: usize,
        parameter_set_pointers: *const *const u8,
        parameter_set_sizes: *const usize,
        nal_unit_header_length: i32,
        format_description_out: *mut *mut c_void,
    ) -> i32;

    fn CMVideoFormatDescriptionCreateFromHEVCParameterSets(
        allocator: *const c_void,
        parameter_set_count: usize,
        parameter_set_pointers: *const *const u8,
        parameter_set_sizes: *const usize,
        nal_unit_header_length: i32,
        extensions: *const c_void,
        format_description_out: *mut *mut c_void,
    ) -> i32;

    fn CMBlockBufferCreateWithMemoryBlock(
        structure_allocator: *const c_void,
        memory_block: *mut c_void,
        block_length: usize,
        block_allocator: *const c_void,
        custom_block_source: *const c_void,
        offset_to_data: usize,
        data_length: usize,
        flags: u32,
        block_buffer_out: *mut *mut c_void,
    ) -> i32;

    fn CMBlockBufferReplaceDataBytes(
        source_bytes: *const c_void,
        destination_buffer: *mut c_void,
        offset_into_destination: usize,
        data_length: usize,
    ) -> i32;

    fn CMSampleBufferCreate(
        allocator: *const c_void,
        data_buffer: *mut c_void,
        data_ready: bool,
        make_data_ready_callback: *const c_void,
        make_data_ready_refcon: *mut c_void,
        format_description: *mut c_void,
        num_samples: i64,
        num_sample_timing_entries: i64,
        sample_timing_array: *const CMSampleTimingInfo,
        num_sample_size_entries: i64,
        sample_size_array: *const usize,
        sample_buffer_out: *mut *mut c_void,
    ) -> i32;
}

#[link(name = "VideoToolbox", kind = "framework")]
extern "C" {
    fn VTDecompressionSessionCreate(
        allocator: *const c_void,
        video_format_description: *mut c_void,
        video_decoder_specification: *const c_void,
        destination_image_buffer_attributes: *const c_void,
        output_callback: *const VTDecompressionOutputCallbackRecord,
        decompression_session_out: *mut *mut c_void,
    ) -> i32;

    fn VTDecompressionSessionDecodeFrame(
        session: *mut c_void,
        sample_buffer: *mut c_void,
        decode_flags: u32,
        source_frame_ref_con: *mut c_void,
        info_flags_out: *mut u32,
    ) -> i32;

    fn VTDecompressionSessionWaitForAsynchronousFrames(session: *mut c_void) -> i32;

    fn VTDecompressionSessionInvalidate(session: *mut c_void);
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    fn CFRelease(cf: *const c_void);
    fn CFRetain(cf: *const c_void) -> *const c_void;
}

/// Retained `CVPixelBuffer`, released on drop.
///
/// This is the value inside the [`ImageBuffer`]s this backend produces.
#[derive(Debug)]
pub struct PixelBuffer(*mut c_void);

impl PixelBuffer {
    /// # Safety
    /// `ptr` must be a valid `CVPixelBufferRef`.
    unsafe fn retain(ptr: *mut c_void) -> Self {
        CFRetain(ptr);
        Self(ptr)
    }

    /// Raw `CVPixelBufferRef` for the renderer. Valid while `self` lives.
    pub fn as_ptr(&self) -> *mut c_void {
        self.0
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        unsafe { CFRelease(self.0) };
    }
}

// SAFETY: decoded pixel buffers are not mutated after the callback hands
// them out, and CoreFoundation reference counting is thread-safe.
unsafe impl Send for PixelBuffer {}
unsafe impl Sync for PixelBuffer {}

/// State reachable from the output callback.
struct CallbackState {
    output: Sender<DecoderEvent>,
}

impl CallbackState {
    fn send(&self, event: DecoderEvent) {
        match self.output.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("Decoded frame channel full, dropping frame"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

extern "C" fn decode_callback(
    refcon: *mut c_void,
    _source_frame_refcon: *mut c_void,
    status: i32,
    info_flags: u32,
    image_buffer: *mut c_void,
    presentation_time_stamp: CMTime,
    _presentation_duration: CMTime,
) {
    // SAFETY: refcon is the `Arc<CallbackState>` leaked in `open`, which
    // outlives the decompression session.
    let state = unsafe { &*(refcon as *const CallbackState) };

    if status != 0 {
        state.send(DecoderEvent::Error {
            reason: format!("Decode callback failed: OSStatus {}", status),
        });
        return;
    }

    if info_flags & DECODE_INFO_FRAME_DROPPED != 0 || image_buffer.is_null() {
        state.send(DecoderEvent::Error {
            reason: "Frame dropped by decoder".into(),
        });
        return;
    }

    let (width, height) = unsafe {
        (
            CVPixelBufferGetWidth(image_buffer) as u32,
            CVPixelBufferGetHeight(image_buffer) as u32,
        )
    };
    let pixel_buffer = unsafe { PixelBuffer::retain(image_buffer) };

    state.send(DecoderEvent::Frame(DecodedImage {
        image: ImageBuffer::new(pixel_buffer),
        width,
        height,
        pts: presentation_time_stamp.to_duration(),
    }));
}

/// Backend that opens `VTDecompressionSession`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoToolboxBackend;

impl DecoderBackend for VideoToolboxBackend {
    fn open(
        &self,
        format: &FormatDescription,
        output: Sender<DecoderEvent>,
    ) -> DecoderResult<Box<dyn HardwareSession>> {
        let format_desc = create_format_description(format)?;

        let state = Arc::new(CallbackState { output });
        let refcon = Arc::into_raw(state) as *mut c_void;

        let record = VTDecompressionOutputCallbackRecord {
            decompression_output_callback: Some(decode_callback),
            decompression_output_ref_con: refcon,
        };

        let mut session: *mut c_void = ptr::null_mut();
        let status = unsafe {
            VTDecompressionSessionCreate(
                ptr::null(),
                format_desc,
                ptr::null(),
                ptr::null(),
                &record,
                &mut session,
            )
        };

        if status != 0 || session.is_null() {
            unsafe {
                drop(Arc::from_raw(refcon as *const CallbackState));
                CFRelease(format_desc);
            }
            return Err(DecoderError::SessionCreate(format!(
                "VTDecompressionSessionCreate failed: OSStatus {}",
                status
            )));
        }

        debug!(codec = %format.codec(), "VTDecompressionSession created");

        Ok(Box::new(VideoToolboxSession {
            session,
            format_desc,
            refcon: refcon as *const CallbackState,
        }))
    }

    fn name(&self) -> &'static str {
        "VideoToolbox"
    }
}

fn create_format_description(format: &FormatDescription) -> DecoderResult<*mut c_void> {
    let sets = format.parameter_sets();
    let pointers: Vec<*const u8> = sets.iter().map(|s| s.as_ptr()).collect();
    let sizes: Vec<usize> = sets.iter().map(|s| s.len()).collect();
    let header_length = format.nal_length_size() as i32;

    let mut format_desc: *mut c_void = ptr::null_mut();
    let status = unsafe {
        match format.codec() {
            VideoCodec::H264 => CMVideoFormatDescriptionCreateFromH264ParameterSets(
                ptr::null(),
                sets.len(),
                pointers.as_ptr(),
                sizes.as_ptr(),
                header_length,
                &mut format_desc,
            ),
            VideoCodec::H265 => CMVideoFormatDescriptionCreateFromHEVCParameterSets(
                ptr::null(),
                sets.len(),
                pointers.as_ptr(),
                sizes.as_ptr(),
                header_length,
                ptr::null(),
                &mut format_desc,
            ),
        }
    };

    if status != 0 || format_desc.is_null() {
        return Err(DecoderError::InvalidFormat(format!(
            "CMVideoFormatDescriptionCreate failed: OSStatus {}",
            status
        )));
    }

    Ok(format_desc)
}

struct VideoToolboxSession {
    session: *mut c_void,
    format_desc: *mut c_void,
    refcon: *const CallbackState,
}

// SAFETY: VTDecompressionSession may be used from any thread as long as
// calls are not concurrent; the decode queue owns this value exclusively.
unsafe impl Send for VideoToolboxSession {}

impl VideoToolboxSession {
    fn create_sample(&self, sample: &Bytes, pts: Duration) -> DecoderResult<*mut c_void> {
        let mut block: *mut c_void = ptr::null_mut();
        let status = unsafe {
            CMBlockBufferCreateWithMemoryBlock(
                ptr::null(),
                ptr::null_mut(),
                sample.len(),
                ptr::null(),
                ptr::null(),
                0,
                sample.len(),
                BLOCK_BUFFER_ASSURE_MEMORY_NOW,
                &mut block,
            )
        };
        if status != 0 || block.is_null() {
            return Err(DecoderError::Decode(format!(
                "CMBlockBufferCreate failed: OSStatus {}",
                status
            )));
        }

        let status = unsafe {
            CMBlockBufferReplaceDataBytes(sample.as_ptr() as *const c_void, block, 0, sample.len())
        };
        if status != 0 {
            unsafe { CFRelease(block) };
            return Err(DecoderError::Decode(format!(
                "CMBlockBufferReplaceDataBytes failed: OSStatus {}",
                status
            )));
        }

        let timing = CMSampleTimingInfo {
            duration: CMTime::invalid(),
            presentation_time_stamp: CMTime::from_duration(pts),
            decode_time_stamp: CMTime::invalid(),
        };
        let sample_size = sample.len();

        let mut sample_buffer: *mut c_void = ptr::null_mut();
        let status = unsafe {
            CMSampleBufferCreate(
                ptr::null(),
                block,
                true,
                ptr::null(),
                ptr::null_mut(),
                self.format_desc,
                1,
                1,
                &timing,
                1,
                &sample_size,
                &mut sample_buffer,
            )
        };
        // The sample buffer retains the block buffer.
        unsafe { CFRelease(block) };

        if status != 0 || sample_buffer.is_null() {
            return Err(DecoderError::Decode(format!(
                "CMSampleBufferCreate failed: OSStatus {}",
                status
            )));
        }

        Ok(sample_buffer)
    }
}

impl HardwareSession for VideoToolboxSession {
    fn decode(&mut self, sample: Bytes, pts: Duration) -> DecoderResult<()> {
        if self.session.is_null() {
            return Err(DecoderError::Invalidated);
        }

        let sample_buffer = self.create_sample(&sample, pts)?;

        let mut info_flags: u32 = 0;
        let status = unsafe {
            VTDecompressionSessionDecodeFrame(
                self.session,
                sample_buffer,
                DECODE_FRAME_ASYNC,
                ptr::null_mut(),
                &mut info_flags,
            )
        };
        unsafe { CFRelease(sample_buffer) };

        if status != 0 {
            return Err(DecoderError::Decode(format!(
                "VTDecompressionSessionDecodeFrame failed: OSStatus {}",
                status
            )));
        }

        Ok(())
    }

    fn invalidate(&mut self) {
        if self.session.is_null() {
            return;
        }

        unsafe {
            let status = VTDecompressionSessionWaitForAsynchronousFrames(self.session);
            if status != 0 {
                warn!("Waiting for pending frames failed: OSStatus {}", status);
            }
            VTDecompressionSessionInvalidate(self.session);
            CFRelease(self.session);
            CFRelease(self.format_desc);
            // No callbacks run after invalidation.
            drop(Arc::from_raw(self.refcon));
        }

        self.session = ptr::null_mut();
        self.format_desc = ptr::null_mut();
        self.refcon = ptr::null();
    }
}

impl Drop for VideoToolboxSession {
    fn drop(&mut self) {
        self.invalidate();
    }
}
