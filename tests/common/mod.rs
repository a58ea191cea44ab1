//! Shared test infrastructure: an in-memory stand-in for a stateless V4L2
//! decoder and a bit-exact Annex-B stream synthesizer.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use v4l2_video::device::controls::DecodeParamsPayload;
use v4l2_video::device::{
    Control, ControlId, DecodeMode, DequeuedBuffer, DeviceError, FormatRequest, MappedMemory,
    MediaRequest, MemoryMode, PlaneData, PlaneFormat, QueriedPlane, QueueDirection, StartCode,
    StreamFormat, VideoDevice,
};

const PLANES_PER_BUFFER: usize = 1;

/// Routes decoder logs through the test harness; `RUST_LOG` controls
/// verbosity.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone)]
pub struct FakeConfig {
    pub output_plane_size: usize,
    pub supports_slice_params: bool,
    pub reject_frame_based: bool,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            output_plane_size: 256 * 1024,
            supports_slice_params: true,
            reject_frame_based: false,
        }
    }
}

/// Heap storage a mapped plane points into; freed when the device drops, which
/// outlives every queue holding views into it.
struct RawPlane {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for RawPlane {}

impl RawPlane {
    fn new(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let len = boxed.len();
        Self {
            ptr: Box::into_raw(boxed).cast::<u8>(),
            len,
        }
    }

    fn fill_prefix(&self, byte: u8, prefix: usize) {
        let slice = unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) };
        for target in &mut slice[..prefix.min(self.len)] {
            *target = byte;
        }
    }
}

impl Drop for RawPlane {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

struct FakeBuffer {
    planes: Vec<RawPlane>,
}

#[derive(Default)]
struct RequestState {
    has_controls: bool,
    decode_params: Option<DecodeParamsPayload>,
    buffer: Option<u32>,
    queued: bool,
}

#[derive(Default)]
struct Inner {
    formats: HashMap<QueueDirection, StreamFormat>,
    buffers: HashMap<QueueDirection, Vec<FakeBuffer>>,
    output_done: VecDeque<u32>,
    capture_free: VecDeque<u32>,
    capture_ready: VecDeque<(u32, u32)>,
    awaiting_capture: VecDeque<u32>,
    requests: HashMap<i32, RequestState>,
    decode_counter: u64,
    decode_params_log: Vec<DecodeParamsPayload>,
    maps: usize,
    unmaps: usize,
    stream_off_count: HashMap<QueueDirection, usize>,
    allocated_requests: usize,
    reinitialized_requests: usize,
}

/// An in-memory model of a stateless decoder: output buffers queued through a
/// media request "decode" into the next free capture buffer, stamping the
/// submission sequence number into the first payload byte.
pub struct FakeDevice {
    config: FakeConfig,
    inner: Mutex<Inner>,
    capture_ready_cv: Condvar,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::with_config(FakeConfig::default())
    }

    pub fn with_config(config: FakeConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            capture_ready_cv: Condvar::new(),
        }
    }

    /// Decode parameters in submission order.
    pub fn decode_params_log(&self) -> Vec<DecodeParamsPayload> {
        self.inner.lock().unwrap().decode_params_log.clone()
    }

    pub fn stream_off_count(&self, direction: QueueDirection) -> usize {
        *self
            .inner
            .lock()
            .unwrap()
            .stream_off_count
            .get(&direction)
            .unwrap_or(&0)
    }

    pub fn plane_map_balance(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.maps, inner.unmaps)
    }

    pub fn allocated_requests(&self) -> usize {
        self.inner.lock().unwrap().allocated_requests
    }

    pub fn reinitialized_requests(&self) -> usize {
        self.inner.lock().unwrap().reinitialized_requests
    }

    /// Completes the oldest decode job blocked on a free capture buffer.
    fn complete_ready_jobs(&self, inner: &mut Inner) {
        while !inner.awaiting_capture.is_empty() && !inner.capture_free.is_empty() {
            let output_index = inner.awaiting_capture.pop_front().unwrap();
            self.finish_decode(inner, output_index);
        }
    }

    fn finish_decode(&self, inner: &mut Inner, output_index: u32) {
        let capture_index = inner
            .capture_free
            .pop_front()
            .expect("finish_decode requires a free capture buffer");

        let sequence = inner.decode_counter;
        inner.decode_counter += 1;

        let bytes_used = {
            let plane = &inner.buffers.get(&QueueDirection::Capture).unwrap()
                [capture_index as usize]
                .planes[0];
            plane.fill_prefix(sequence as u8, plane.len);
            plane.len as u32
        };

        inner.capture_ready.push_back((capture_index, bytes_used));
        inner.output_done.push_back(output_index);
        self.capture_ready_cv.notify_all();
    }

    fn decode_queued_request(&self, inner: &mut Inner, fd: i32) -> Result<(), DeviceError> {
        let (output_index, params) = {
            let state = inner
                .requests
                .get_mut(&fd)
                .ok_or(DeviceError::NotSupported("queueing an unknown request"))?;

            if !state.has_controls || state.buffer.is_none() || state.queued {
                return Err(DeviceError::NotSupported(
                    "queueing a request without controls and a buffer",
                ));
            }
            state.queued = true;
            (state.buffer.unwrap(), state.decode_params)
        };

        if let Some(params) = params {
            inner.decode_params_log.push(params);
        }

        if inner.capture_free.is_empty() {
            inner.awaiting_capture.push_back(output_index);
        } else {
            self.finish_decode(inner, output_index);
        }

        Ok(())
    }
}

impl VideoDevice for FakeDevice {
    fn set_format(
        &self,
        direction: QueueDirection,
        request: FormatRequest,
    ) -> Result<StreamFormat, DeviceError> {
        let size_image = match direction {
            QueueDirection::Output => self.config.output_plane_size as u32,
            QueueDirection::Capture => request.width * request.height * 3 / 2,
        };

        let format = StreamFormat {
            pixel_format: request.pixel_format,
            width: request.width,
            height: request.height,
            planes: vec![PlaneFormat {
                size_image,
                bytes_per_line: request.width,
            }],
        };

        self.inner
            .lock()
            .unwrap()
            .formats
            .insert(direction, format.clone());
        Ok(format)
    }

    fn set_decode_mode(&self, mode: DecodeMode) -> Result<(), DeviceError> {
        if mode == DecodeMode::FrameBased && self.config.reject_frame_based {
            return Err(DeviceError::NotSupported("frame-based decoding"));
        }
        Ok(())
    }

    fn set_start_code(&self, _start_code: StartCode) -> Result<(), DeviceError> {
        Ok(())
    }

    fn advertises_control(&self, id: ControlId) -> bool {
        match id {
            ControlId::SliceParams => self.config.supports_slice_params,
            _ => true,
        }
    }

    fn request_buffers(
        &self,
        direction: QueueDirection,
        _memory: MemoryMode,
        count: u32,
    ) -> Result<u32, DeviceError> {
        let mut inner = self.inner.lock().unwrap();

        let plane_size = inner
            .formats
            .get(&direction)
            .map(|format| format.planes[0].size_image as usize)
            .unwrap_or(self.config.output_plane_size);

        let buffers = (0..count)
            .map(|_| FakeBuffer {
                planes: (0..PLANES_PER_BUFFER)
                    .map(|_| RawPlane::new(plane_size))
                    .collect(),
            })
            .collect();
        inner.buffers.insert(direction, buffers);

        Ok(count)
    }

    fn query_buffer(
        &self,
        direction: QueueDirection,
        index: u32,
    ) -> Result<Vec<QueriedPlane>, DeviceError> {
        let inner = self.inner.lock().unwrap();
        let buffer = inner
            .buffers
            .get(&direction)
            .and_then(|buffers| buffers.get(index as usize))
            .ok_or(DeviceError::NotSupported("querying an unknown buffer"))?;

        Ok(buffer
            .planes
            .iter()
            .enumerate()
            .map(|(plane, storage)| QueriedPlane {
                length: storage.len as u32,
                mem_offset: plane as u32,
            })
            .collect())
    }

    fn map_plane(
        &self,
        direction: QueueDirection,
        index: u32,
        plane: QueriedPlane,
    ) -> Result<MappedMemory, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.maps += 1;

        let storage = &inner.buffers.get(&direction).unwrap()[index as usize].planes
            [plane.mem_offset as usize];
        Ok(unsafe { MappedMemory::from_raw(storage.ptr, storage.len) })
    }

    fn unmap_plane(&self, _memory: MappedMemory) {
        self.inner.lock().unwrap().unmaps += 1;
    }

    fn queue_buffer(
        &self,
        direction: QueueDirection,
        index: u32,
        _planes: &[PlaneData],
        request: Option<&MediaRequest>,
    ) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();

        match direction {
            QueueDirection::Output => {
                let Some(request) = request else {
                    return Err(DeviceError::NotSupported(
                        "output buffers without a media request",
                    ));
                };
                let fd = request.fd().as_raw_fd();
                let state = inner
                    .requests
                    .get_mut(&fd)
                    .ok_or(DeviceError::NotSupported("an unknown media request"))?;
                state.buffer = Some(index);
            }
            QueueDirection::Capture => {
                inner.capture_free.push_back(index);
                self.complete_ready_jobs(&mut inner);
            }
        }

        Ok(())
    }

    fn dequeue_buffer(
        &self,
        direction: QueueDirection,
    ) -> Result<Option<DequeuedBuffer>, DeviceError> {
        let mut inner = self.inner.lock().unwrap();

        Ok(match direction {
            QueueDirection::Output => inner.output_done.pop_front().map(|index| DequeuedBuffer {
                index,
                bytes_used: vec![0],
                is_error: false,
            }),
            QueueDirection::Capture => {
                inner
                    .capture_ready
                    .pop_front()
                    .map(|(index, bytes_used)| DequeuedBuffer {
                        index,
                        bytes_used: vec![bytes_used],
                        is_error: false,
                    })
            }
        })
    }

    fn stream_on(&self, _direction: QueueDirection) -> Result<(), DeviceError> {
        Ok(())
    }

    fn stream_off(&self, direction: QueueDirection) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.stream_off_count.entry(direction).or_default() += 1;

        match direction {
            QueueDirection::Output => {
                inner.output_done.clear();
                inner.awaiting_capture.clear();
            }
            QueueDirection::Capture => {
                inner.capture_free.clear();
                inner.capture_ready.clear();
            }
        }

        Ok(())
    }

    fn set_controls(
        &self,
        request: Option<&MediaRequest>,
        controls: &[Control<'_>],
    ) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();

        let Some(request) = request else {
            return Ok(());
        };
        let fd = request.fd().as_raw_fd();
        let state = inner
            .requests
            .get_mut(&fd)
            .ok_or(DeviceError::NotSupported("an unknown media request"))?;

        state.has_controls = true;
        for control in controls {
            if let Control::DecodeParams(params) = control {
                state.decode_params = Some(**params);
            }
        }

        Ok(())
    }

    fn alloc_request(&self) -> Result<OwnedFd, DeviceError> {
        let file = std::fs::File::open("/dev/null")
            .map_err(|err| DeviceError::ioctl("media request alloc", err))?;
        let fd = OwnedFd::from(file);

        let mut inner = self.inner.lock().unwrap();
        inner.allocated_requests += 1;
        inner.requests.insert(fd.as_raw_fd(), RequestState::default());

        Ok(fd)
    }

    fn queue_request(&self, request: &MediaRequest) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        self.decode_queued_request(&mut inner, request.fd().as_raw_fd())
    }

    fn reinit_request(&self, request: &MediaRequest) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.reinitialized_requests += 1;
        inner
            .requests
            .insert(request.fd().as_raw_fd(), RequestState::default());
        Ok(())
    }

    fn poll_readable(
        &self,
        direction: QueueDirection,
        timeout_ms: u32,
    ) -> Result<bool, DeviceError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut inner = self.inner.lock().unwrap();

        loop {
            let ready = match direction {
                QueueDirection::Output => !inner.output_done.is_empty(),
                QueueDirection::Capture => !inner.capture_ready.is_empty(),
            };
            if ready {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }

            let (guard, _timeout) = self
                .capture_ready_cv
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }
}

/// Annex-B H.264 synthesis, bit-exact for the header fields the decoder
/// parses.
pub mod h264 {
    pub struct BitWriter {
        bytes: Vec<u8>,
        used_bits: u8,
    }

    impl BitWriter {
        pub fn new() -> Self {
            Self {
                bytes: Vec::new(),
                used_bits: 0,
            }
        }

        pub fn put_bit(&mut self, bit: u8) {
            if self.used_bits == 0 {
                self.bytes.push(0);
            }
            let last = self.bytes.last_mut().unwrap();
            *last |= (bit & 1) << (7 - self.used_bits);
            self.used_bits = (self.used_bits + 1) % 8;
        }

        pub fn put_bits(&mut self, value: u32, n: u32) {
            for i in (0..n).rev() {
                self.put_bit(((value >> i) & 1) as u8);
            }
        }

        pub fn put_ue(&mut self, value: u32) {
            let code_num = value as u64 + 1;
            let len = 64 - code_num.leading_zeros();
            for _ in 0..len - 1 {
                self.put_bit(0);
            }
            for i in (0..len).rev() {
                self.put_bit(((code_num >> i) & 1) as u8);
            }
        }

        /// Closes the RBSP with the stop bit and escapes emulation-prevention
        /// sequences.
        pub fn into_payload(mut self) -> Vec<u8> {
            self.put_bit(1);

            let mut escaped = Vec::with_capacity(self.bytes.len());
            let mut zeros = 0usize;
            for &byte in &self.bytes {
                if zeros >= 2 && byte <= 3 {
                    escaped.push(3);
                    zeros = 0;
                }
                zeros = if byte == 0 { zeros + 1 } else { 0 };
                escaped.push(byte);
            }
            escaped
        }
    }

    fn nal(ref_idc: u8, nal_unit_type: u8, payload: Vec<u8>) -> Vec<u8> {
        let mut nal = vec![(ref_idc << 5) | (nal_unit_type & 0x1F)];
        nal.extend(payload);
        nal
    }

    /// Baseline SPS: 4:2:0, POC type 0 with 8-bit lsb, 4-bit frame numbers,
    /// progressive. `width`/`height` must be multiples of 16.
    pub fn sps(id: u8, width: u32, height: u32, max_num_ref_frames: u32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_bits(66, 8); // profile_idc
        w.put_bits(0b0100_0000, 8); // constraint_set1_flag
        w.put_bits(31, 8); // level_idc
        w.put_ue(id as u32);
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(0); // pic_order_cnt_type
        w.put_ue(4); // log2_max_pic_order_cnt_lsb_minus4 -> 8 bits
        w.put_ue(max_num_ref_frames);
        w.put_bit(0); // gaps_in_frame_num_value_allowed_flag
        w.put_ue(width / 16 - 1);
        w.put_ue(height / 16 - 1);
        w.put_bit(1); // frame_mbs_only_flag
        w.put_bit(1); // direct_8x8_inference_flag
        w.put_bit(0); // frame_cropping_flag
        nal(3, 7, w.into_payload())
    }

    pub fn pps(pps_id: u8, sps_id: u8) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_ue(pps_id as u32);
        w.put_ue(sps_id as u32);
        w.put_bit(0); // entropy_coding_mode_flag
        w.put_bit(0); // bottom_field_pic_order_in_frame_present_flag
        w.put_ue(0); // num_slice_groups_minus1
        w.put_ue(0); // num_ref_idx_l0_default_active_minus1
        w.put_ue(0); // num_ref_idx_l1_default_active_minus1
        w.put_bit(0); // weighted_pred_flag
        w.put_bits(0, 2); // weighted_bipred_idc
        w.put_ue(0); // pic_init_qp_minus26 (se: 0)
        w.put_ue(0); // pic_init_qs_minus26
        w.put_ue(0); // chroma_qp_index_offset
        w.put_bit(1); // deblocking_filter_control_present_flag
        w.put_bit(0); // constrained_intra_pred_flag
        w.put_bit(0); // redundant_pic_cnt_present_flag
        nal(3, 8, w.into_payload())
    }

    fn slice_payload(header: BitWriter) -> Vec<u8> {
        let mut payload = header.into_payload();
        // Stand-in macroblock data; the decoder only parses the header.
        payload.extend(std::iter::repeat_n(0xA5u8, 24));
        payload
    }

    pub fn idr_slice(pps_id: u8, idr_pic_id: u32, pic_order_cnt_lsb: u32, ref_idc: u8) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_ue(0); // first_mb_in_slice
        w.put_ue(7); // slice_type: I, all slices in this picture
        w.put_ue(pps_id as u32);
        w.put_bits(0, 4); // frame_num, always 0 for IDR
        w.put_ue(idr_pic_id);
        w.put_bits(pic_order_cnt_lsb % 256, 8);
        nal(ref_idc, 5, slice_payload(w))
    }

    pub fn p_slice(pps_id: u8, frame_num: u32, pic_order_cnt_lsb: u32, ref_idc: u8) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_ue(0); // first_mb_in_slice
        w.put_ue(5); // slice_type: P, all slices in this picture
        w.put_ue(pps_id as u32);
        w.put_bits(frame_num % 16, 4);
        w.put_bits(pic_order_cnt_lsb % 256, 8);
        // num_ref_idx_active_override_flag and the rest of the header are
        // past what the decoder reads; any trailing bits work.
        nal(ref_idc, 1, slice_payload(w))
    }

    /// A slice NAL truncated inside its header fields.
    pub fn truncated_slice(pps_id: u8) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_ue(0); // first_mb_in_slice
        w.put_ue(5); // slice_type
        w.put_ue(pps_id as u32);
        let mut payload = w.into_payload();
        payload.truncate(1);
        nal(2, 1, payload)
    }

    /// Concatenates NAL units with 4-byte start codes.
    pub fn annexb(nalus: &[Vec<u8>]) -> Vec<u8> {
        let mut stream = Vec::new();
        for nalu in nalus {
            stream.extend_from_slice(&[0, 0, 0, 1]);
            stream.extend_from_slice(nalu);
        }
        stream
    }

    /// One IDR followed by `total - 1` P frames, all reference pictures.
    pub fn gop(pps_id: u8, total: u32) -> Vec<Vec<u8>> {
        let mut nalus = vec![idr_slice(pps_id, 1, 0, 3)];
        for n in 1..total {
            nalus.push(p_slice(pps_id, n, 2 * n, 2));
        }
        nalus
    }
}
