//! The seam between the decoding core and the V4L2 memory-to-memory UAPI.
//!
//! The core drives the device exclusively through [`VideoDevice`]; the ioctl
//! wrappers implementing it live outside this crate. Every operation the core
//! needs is enumerated on the trait: formats, buffer negotiation, queueing,
//! streaming, codec controls, media requests and readiness polling.

use std::io;
use std::os::fd::OwnedFd;

pub mod controls;

use controls::{DecodeParamsPayload, PpsPayload, SliceParamsPayload, SpsPayload};

/// The two halves of a memory-to-memory device: `Output` accepts the
/// compressed bitstream, `Capture` yields decoded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueDirection {
    Output,
    Capture,
}

impl QueueDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueDirection::Output => "output",
            QueueDirection::Capture => "capture",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    Mmap,
    DmabufImport,
}

/// A four-character pixel/stream format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fourcc(pub [u8; 4]);

impl Fourcc {
    /// H.264 parsed slice data, as consumed by stateless decoders.
    pub const H264_SLICE: Fourcc = Fourcc(*b"S264");

    /// 4:2:0 luma plane followed by an interleaved chroma plane, one buffer.
    pub const NV12: Fourcc = Fourcc(*b"NV12");
}

impl std::fmt::Display for Fourcc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{}", byte as char)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FormatRequest {
    pub pixel_format: Fourcc,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaneFormat {
    pub size_image: u32,
    pub bytes_per_line: u32,
}

/// The format the device actually selected; drivers are free to adjust the
/// requested one.
#[derive(Debug, Clone)]
pub struct StreamFormat {
    pub pixel_format: Fourcc,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneFormat>,
}

/// Per-plane allocation info reported for one negotiated buffer.
#[derive(Debug, Clone, Copy)]
pub struct QueriedPlane {
    pub length: u32,
    pub mem_offset: u32,
}

/// Per-plane payload description passed when queueing a buffer.
#[derive(Debug, Clone, Copy)]
pub struct PlaneData {
    pub bytes_used: u32,
}

#[derive(Debug, Clone)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: Vec<u32>,
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    FrameBased,
    SliceBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCode {
    None,
    AnnexB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlId {
    DecodeMode,
    StartCode,
    Sps,
    Pps,
    SliceParams,
    DecodeParams,
}

/// One codec control write, borrowed from the mapper's payload.
#[derive(Debug, Clone, Copy)]
pub enum Control<'a> {
    Sps(&'a SpsPayload),
    Pps(&'a PpsPayload),
    SliceParams(&'a SliceParamsPayload),
    DecodeParams(&'a DecodeParamsPayload),
}

impl Control<'_> {
    pub fn id(&self) -> ControlId {
        match self {
            Control::Sps(_) => ControlId::Sps,
            Control::Pps(_) => ControlId::Pps,
            Control::SliceParams(_) => ControlId::SliceParams,
            Control::DecodeParams(_) => ControlId::DecodeParams,
        }
    }
}

/// A kernel media request: a bag of per-frame controls applied atomically with
/// one output buffer. Owns the request file descriptor; dropping closes it.
#[derive(Debug)]
pub struct MediaRequest {
    fd: OwnedFd,
}

impl MediaRequest {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }
}

/// A byte window mapped from device memory.
///
/// The pointer stays valid while the owning buffer pool is alive and the queue
/// has not been torn down; the pool upholds this by unmapping only at
/// teardown, after every outstanding view is gone.
#[derive(Debug)]
pub struct MappedMemory {
    ptr: *mut u8,
    len: usize,
}

// One owner at a time; views hand out plain slices.
unsafe impl Send for MappedMemory {}

impl MappedMemory {
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay valid and unaliased until
    /// the memory is unmapped through the device that produced it.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("the device does not support {0}")]
    NotSupported(&'static str),
}

impl DeviceError {
    pub fn ioctl(op: &'static str, source: io::Error) -> Self {
        DeviceError::Ioctl { op, source }
    }
}

/// A V4L2 memory-to-memory device exposing the stateless H.264 interface.
///
/// Ioctls serialize in the kernel, so every operation takes `&self`; the
/// decoding core additionally serializes control writes per request by
/// construction.
pub trait VideoDevice: Send + Sync {
    fn set_format(
        &self,
        direction: QueueDirection,
        request: FormatRequest,
    ) -> Result<StreamFormat, DeviceError>;

    fn set_decode_mode(&self, mode: DecodeMode) -> Result<(), DeviceError>;

    fn set_start_code(&self, start_code: StartCode) -> Result<(), DeviceError>;

    /// Whether the device advertises the given control at all; optional
    /// controls are simply not written when absent.
    fn advertises_control(&self, id: ControlId) -> bool;

    /// Negotiates `count` buffers; returns the count actually allocated.
    fn request_buffers(
        &self,
        direction: QueueDirection,
        memory: MemoryMode,
        count: u32,
    ) -> Result<u32, DeviceError>;

    fn query_buffer(
        &self,
        direction: QueueDirection,
        index: u32,
    ) -> Result<Vec<QueriedPlane>, DeviceError>;

    fn map_plane(
        &self,
        direction: QueueDirection,
        index: u32,
        plane: QueriedPlane,
    ) -> Result<MappedMemory, DeviceError>;

    fn unmap_plane(&self, memory: MappedMemory);

    fn queue_buffer(
        &self,
        direction: QueueDirection,
        index: u32,
        planes: &[PlaneData],
        request: Option<&MediaRequest>,
    ) -> Result<(), DeviceError>;

    /// Non-blocking dequeue; `Ok(None)` is the expected try-again signal while
    /// nothing has completed.
    fn dequeue_buffer(
        &self,
        direction: QueueDirection,
    ) -> Result<Option<DequeuedBuffer>, DeviceError>;

    fn stream_on(&self, direction: QueueDirection) -> Result<(), DeviceError>;

    fn stream_off(&self, direction: QueueDirection) -> Result<(), DeviceError>;

    /// Writes codec controls, staged into `request` when one is given.
    fn set_controls(
        &self,
        request: Option<&MediaRequest>,
        controls: &[Control<'_>],
    ) -> Result<(), DeviceError>;

    fn alloc_request(&self) -> Result<OwnedFd, DeviceError>;

    fn queue_request(&self, request: &MediaRequest) -> Result<(), DeviceError>;

    /// Returns a queued-and-completed request to its initial state for reuse.
    fn reinit_request(&self, request: &MediaRequest) -> Result<(), DeviceError>;

    /// Waits up to `timeout_ms` for the given queue to become readable.
    fn poll_readable(
        &self,
        direction: QueueDirection,
        timeout_ms: u32,
    ) -> Result<bool, DeviceError>;
}
