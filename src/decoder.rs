use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::ScopedJoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{Level, debug, error, info, span, trace, warn};

pub mod buffers;
pub mod capture_queue;
pub mod dpb;
pub mod output_queue;
pub mod requests;

#[cfg(test)]
pub(crate) mod test_device;

use crate::device::controls::{
    decode_params_payload, pps_payload, slice_params_payload, sps_payload,
};
use crate::device::{
    Control, ControlId, DecodeMode, DeviceError, FormatRequest, Fourcc, QueueDirection, StartCode,
    StreamFormat, VideoDevice,
};
use crate::parser::{
    Nalu, NaluKind, NaluSplitter, ParserError, Pps, SliceHeader, Sps, StreamState, nalu_parser,
};
use buffers::PoolError;
use capture_queue::{CaptureQueue, CaptureQueueError};
use dpb::{Dpb, DpbEntry};
use output_queue::{OutputQueue, OutputQueueError};
use requests::RequestPool;

const READ_CHUNK_SIZE: usize = 64 * 1024;
const NALU_CHANNEL_CAPACITY: usize = 32;
const CAPTURE_POLL_TIMEOUT_MS: u32 = 1_000;
const WORKER_JOIN_GRACE: Duration = Duration::from_secs(2);
const DRAIN_IDLE_SLEEP: Duration = Duration::from_millis(10);
const DRAIN_IDLE_BUDGET: u32 = 200;

/// Configuration for one decoding session.
///
/// The initial dimensions size the queues before the first SPS is seen;
/// frame-based hardware keeps using them for the whole stream.
#[derive(Debug, Clone)]
pub struct DecoderOptions {
    pub initial_width: u32,
    pub initial_height: u32,
    pub preferred_pixel_format: Fourcc,
    pub output_buffer_count: u32,
    pub capture_buffer_count: u32,
    pub request_pool_size: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            initial_width: 1920,
            initial_height: 1080,
            preferred_pixel_format: Fourcc::NV12,
            output_buffer_count: 16,
            capture_buffer_count: 16,
            request_pool_size: 32,
        }
    }
}

/// Cooperative cancellation flag shared by the producer, decoder and capture
/// worker threads; each observes it at its next blocking boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// One decoded frame, borrowed from its capture buffer.
///
/// The view is only valid for the duration of the delivery callback; the
/// buffer goes back to the hardware as soon as the callback returns.
#[derive(Debug)]
pub struct DecodedFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub pixel_format: Fourcc,
}

#[derive(Debug, Clone, Default)]
pub struct DecodeStats {
    pub frames_submitted: u64,
    pub frames_delivered: u64,
    pub cancelled: bool,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("the device cannot decode frame-by-frame: {0}")]
    FrameBasedDecodingUnsupported(#[source] DeviceError),

    #[error("slice of {required} bytes does not fit the {capacity}-byte output plane")]
    BufferTooSmall { required: usize, capacity: usize },

    #[error("decoder invariant violated: {0}")]
    InvariantViolated(String),

    #[error("failed to read from the input stream: {0}")]
    Input(#[from] std::io::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl From<OutputQueueError> for DecoderError {
    fn from(err: OutputQueueError) -> Self {
        match err {
            OutputQueueError::BufferTooSmall { required, capacity } => {
                DecoderError::BufferTooSmall { required, capacity }
            }
            OutputQueueError::Device(err) => DecoderError::Device(err),
            other => DecoderError::InvariantViolated(other.to_string()),
        }
    }
}

impl From<CaptureQueueError> for DecoderError {
    fn from(err: CaptureQueueError) -> Self {
        match err {
            CaptureQueueError::Device(err) => DecoderError::Device(err),
            other => DecoderError::InvariantViolated(other.to_string()),
        }
    }
}

impl From<PoolError> for DecoderError {
    fn from(err: PoolError) -> Self {
        DecoderError::InvariantViolated(err.to_string())
    }
}

/// Drives a stateless V4L2 decoder through one H.264 elementary stream:
/// parses it in user space, submits each frame's parameters and slice data
/// through a media request, and delivers decoded frames to a callback.
pub struct Decoder<D: VideoDevice> {
    device: Arc<D>,
    options: DecoderOptions,
    output: Option<OutputQueue<D>>,
    capture: Option<CaptureQueue<D>>,
    capture_format: Option<StreamFormat>,
    stream_state: StreamState,
    dpb: Dpb,
    cancel: CancellationToken,
    torn_down: bool,
}

impl<D: VideoDevice> Decoder<D> {
    /// Negotiates formats and controls, allocates both queues and the request
    /// pool, and starts streaming. The capture worker starts with
    /// [`Decoder::decode`], which brings the delivery callback.
    pub fn new(device: Arc<D>, options: DecoderOptions) -> Result<Self, DecoderError> {
        let mut decoder = Self {
            device,
            options,
            output: None,
            capture: None,
            capture_format: None,
            stream_state: StreamState::default(),
            dpb: Dpb::default(),
            cancel: CancellationToken::new(),
            torn_down: false,
        };

        match decoder.init() {
            Ok(()) => Ok(decoder),
            Err(err) => {
                decoder.teardown();
                Err(err)
            }
        }
    }

    /// A token that cancels this session from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn init(&mut self) -> Result<(), DecoderError> {
        let output_format = self.device.set_format(
            QueueDirection::Output,
            FormatRequest {
                pixel_format: Fourcc::H264_SLICE,
                width: self.options.initial_width,
                height: self.options.initial_height,
            },
        )?;
        debug!(
            format = %output_format.pixel_format,
            width = output_format.width,
            height = output_format.height,
            "output format negotiated"
        );

        let capture_format = self.device.set_format(
            QueueDirection::Capture,
            FormatRequest {
                pixel_format: self.options.preferred_pixel_format,
                width: self.options.initial_width,
                height: self.options.initial_height,
            },
        )?;
        info!(
            format = %capture_format.pixel_format,
            width = capture_format.width,
            height = capture_format.height,
            "capture format negotiated"
        );
        self.capture_format = Some(capture_format.clone());

        self.device
            .set_decode_mode(DecodeMode::FrameBased)
            .map_err(DecoderError::FrameBasedDecodingUnsupported)?;
        self.device.set_start_code(StartCode::AnnexB)?;

        self.output = Some(OutputQueue::initialize_mmap(
            self.device.clone(),
            self.options.output_buffer_count,
        )?);

        let requests = RequestPool::allocate(&*self.device, self.options.request_pool_size)?;
        self.output
            .as_mut()
            .expect("output queue just initialized")
            .associate_media_requests(requests);

        let mut capture = CaptureQueue::initialize_mmap(
            self.device.clone(),
            capture_format,
            self.options.capture_buffer_count,
        )?;
        capture.enqueue_all()?;
        self.capture = Some(capture);

        self.output.as_ref().unwrap().stream_on()?;
        self.capture.as_ref().unwrap().stream_on()?;

        Ok(())
    }

    /// Decodes `input` to completion (or cancellation), delivering each frame
    /// to `deliver` on the capture worker thread, then tears the session
    /// down. Frames arrive in decode order.
    pub fn decode<R, F>(mut self, input: R, deliver: F) -> Result<DecodeStats, DecoderError>
    where
        R: Read + Send,
        F: FnMut(DecodedFrame<'_>) + Send,
    {
        let started = Instant::now();
        let cancel = self.cancel.clone();
        let delivered = Arc::new(AtomicU64::new(0));
        let (nalu_tx, nalu_rx) = crossbeam_channel::bounded::<Nalu>(NALU_CHANNEL_CAPACITY);

        let capture = self.capture.take().ok_or_else(|| {
            DecoderError::InvariantViolated("decode called without an initialized capture queue".into())
        })?;

        let (decode_result, read_result, capture) = std::thread::scope(|scope| {
            let producer = std::thread::Builder::new()
                .name("bitstream producer".into())
                .spawn_scoped(scope, {
                    let cancel = cancel.clone();
                    move || feed_nalus(input, nalu_tx, cancel)
                })
                .expect("spawning the bitstream producer failed");

            let worker = std::thread::Builder::new()
                .name("capture worker".into())
                .spawn_scoped(scope, {
                    let cancel = cancel.clone();
                    let delivered = delivered.clone();
                    move || run_capture_worker(capture, deliver, cancel, delivered)
                })
                .expect("spawning the capture worker failed");

            let decode_result = self.run(&nalu_rx, &delivered);

            // Everything left in flight is abandoned past this point.
            cancel.cancel();
            drop(nalu_rx);

            let read_result = producer.join().expect("the bitstream producer panicked");
            let capture = join_worker_with_grace(worker);

            (decode_result, read_result, capture)
        });

        self.capture = Some(capture);
        let frames_delivered = delivered.load(Ordering::Acquire);
        self.teardown();

        let (frames_submitted, cancelled) = decode_result?;
        read_result?;

        Ok(DecodeStats {
            frames_submitted,
            frames_delivered,
            cancelled,
            elapsed: started.elapsed(),
        })
    }

    /// Per-NALU dispatch; returns the submitted-frame count and whether the
    /// session was cancelled.
    fn run(
        &mut self,
        nalus: &Receiver<Nalu>,
        delivered: &AtomicU64,
    ) -> Result<(u64, bool), DecoderError> {
        let mut submitted = 0u64;

        for nalu in nalus {
            if self.cancel.is_cancelled() {
                return Ok((submitted, true));
            }

            match nalu.kind() {
                NaluKind::Sps => self.handle_sps(&nalu),
                NaluKind::Pps => self.handle_pps(&nalu),
                NaluKind::NonIdrSlice | NaluKind::IdrSlice => {
                    if self.handle_slice(&nalu)? {
                        submitted += 1;
                    }
                }
                kind => trace!(?kind, "ignoring NAL unit"),
            }
        }

        if self.cancel.is_cancelled() {
            return Ok((submitted, true));
        }

        self.drain(submitted, delivered)?;
        Ok((submitted, false))
    }

    fn handle_sps(&mut self, nalu: &Nalu) {
        match nalu_parser::parse_sps(nalu.payload()) {
            Ok(sps) => {
                debug!(
                    id = sps.seq_parameter_set_id,
                    width = sps.width(),
                    height = sps.height(),
                    "sequence parameter set"
                );
                if let Some(format) = &self.capture_format {
                    if sps.width() != format.width || sps.height() != format.height {
                        info!(
                            stream_width = sps.width(),
                            stream_height = sps.height(),
                            capture_width = format.width,
                            capture_height = format.height,
                            "stream dimensions differ from the negotiated capture format"
                        );
                    }
                }
                self.stream_state.put_sps(sps);
            }
            Err(err) => warn!("skipping malformed sequence parameter set: {err}"),
        }
    }

    fn handle_pps(&mut self, nalu: &Nalu) {
        // The chroma format lives in the SPS the PPS references, which is only
        // known once the PPS id fields have been parsed; re-parse in the rare
        // case the linked SPS is not 4:2:0.
        let parsed = nalu_parser::parse_pps(nalu.payload(), crate::parser::DEFAULT_CHROMA_FORMAT_IDC)
            .and_then(|pps| {
                let chroma = self.stream_state.chroma_format_for_pps(pps.seq_parameter_set_id);
                if chroma == crate::parser::DEFAULT_CHROMA_FORMAT_IDC {
                    Ok(pps)
                } else {
                    nalu_parser::parse_pps(nalu.payload(), chroma)
                }
            });

        match parsed {
            Ok(pps) => {
                debug!(
                    id = pps.pic_parameter_set_id,
                    sps_id = pps.seq_parameter_set_id,
                    "picture parameter set"
                );
                self.stream_state.put_pps(pps);
            }
            Err(err) => warn!("skipping malformed picture parameter set: {err}"),
        }
    }

    /// Returns whether the slice was submitted to the hardware.
    fn handle_slice(&mut self, nalu: &Nalu) -> Result<bool, DecoderError> {
        let (header, sps, pps) = match nalu_parser::parse_slice_header(nalu, &self.stream_state) {
            Ok((header, sps, pps)) => (header, sps.clone(), pps.clone()),
            Err(err @ (ParserError::UnknownPps(_) | ParserError::UnknownSps(_))) => {
                warn!("skipping slice: {err}");
                return Ok(false);
            }
            Err(err) => {
                warn!("skipping malformed slice: {err}");
                return Ok(false);
            }
        };

        if header.first_mb_in_slice != 0 {
            // Frame-based hardware consumes whole access units; a non-initial
            // slice cannot be submitted on its own.
            warn!(
                first_mb_in_slice = header.first_mb_in_slice,
                "dropping non-initial slice of a multi-slice frame"
            );
            return Ok(false);
        }

        if header.field_pic_flag {
            warn!("dropping field slice; frame-based decoding requires frame pictures");
            return Ok(false);
        }

        self.submit_frame(nalu, &header, &sps, &pps)?;
        Ok(true)
    }

    fn submit_frame(
        &mut self,
        nalu: &Nalu,
        header: &SliceHeader,
        sps: &Sps,
        pps: &Pps,
    ) -> Result<(), DecoderError> {
        let is_idr = nalu.is_idr();
        let output = self
            .output
            .as_mut()
            .expect("output queue outlives the decode loop");

        output.reclaim_processed()?;

        let request = if output.has_media_requests() {
            Some(output.acquire_media_request(true)?)
        } else {
            None
        };

        let sps_control = sps_payload(sps);
        let pps_control = pps_payload(pps);
        let decode_params = decode_params_payload(header, nalu.ref_idc(), is_idr, &self.dpb);

        let mut controls = vec![Control::Sps(&sps_control), Control::Pps(&pps_control)];
        let slice_params;
        if self.device.advertises_control(ControlId::SliceParams) {
            slice_params = slice_params_payload(header, pps, &self.dpb);
            controls.push(Control::SliceParams(&slice_params));
        }
        controls.push(Control::DecodeParams(&decode_params));

        if let Err(err) = self.device.set_controls(request.as_ref(), &controls) {
            if let Some(request) = request {
                output.release_media_request(request)?;
            }
            return Err(err.into());
        }

        trace!(
            frame_num = header.frame_num,
            slice_type = header.slice_type,
            is_idr,
            dpb_len = self.dpb.len(),
            "submitting frame"
        );

        let mut data = Vec::with_capacity(nalu.bytes().len() + 4);
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(nalu.bytes());
        let index = output.write_and_enqueue(&data, request)?;
        output.queue_associated_request(index)?;

        self.update_dpb(header, nalu.ref_idc(), is_idr, sps);

        Ok(())
    }

    fn update_dpb(&mut self, header: &SliceHeader, ref_idc: u8, is_idr: bool, sps: &Sps) {
        if is_idr {
            self.dpb.clear();
        }

        if ref_idc > 0 {
            self.dpb.push(DpbEntry {
                frame_num: header.frame_num,
                pic_order_cnt: header.pic_order_cnt_lsb.unwrap_or(0) as i32,
                is_reference: true,
                is_long_term: false,
            });
        }

        while self.dpb.len() > sps.max_num_ref_frames as usize {
            self.dpb.evict_oldest();
        }
    }

    /// Reclaims submissions until every output buffer is back and the
    /// consumer saw every submitted frame, giving up once no progress is made
    /// for the idle budget.
    fn drain(&mut self, submitted: u64, delivered: &AtomicU64) -> Result<(), DecoderError> {
        let started = Instant::now();
        let output = self
            .output
            .as_mut()
            .expect("output queue outlives the decode loop");

        let mut idle_iterations = 0u32;
        let mut last_delivered = delivered.load(Ordering::Acquire);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let reclaimed = output.reclaim_processed()?;
            let now_delivered = delivered.load(Ordering::Acquire);

            if output.all_buffers_free() && now_delivered >= submitted {
                break;
            }

            if reclaimed > 0 || now_delivered > last_delivered {
                idle_iterations = 0;
                last_delivered = now_delivered;
            } else {
                idle_iterations += 1;
                if idle_iterations >= DRAIN_IDLE_BUDGET {
                    warn!(
                        submitted,
                        delivered = now_delivered,
                        "giving up on drain after {DRAIN_IDLE_BUDGET} idle iterations"
                    );
                    break;
                }
            }

            std::thread::sleep(DRAIN_IDLE_SLEEP);
        }

        info!(
            frames = delivered.load(Ordering::Acquire),
            elapsed = ?started.elapsed(),
            "pipeline drained"
        );

        Ok(())
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.cancel.cancel();

        if let Some(output) = self.output.take() {
            if let Err(err) = output.stream_off() {
                warn!("output stream_off failed during teardown: {err}");
            }
            output.deinit();
        }

        if let Some(capture) = self.capture.take() {
            if let Err(err) = capture.stream_off() {
                warn!("capture stream_off failed during teardown: {err}");
            }
            capture.deinit();
        }
    }
}

impl<D: VideoDevice> Drop for Decoder<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Reads the byte source in chunks and pushes complete NAL units into the
/// bounded channel; the channel provides the backpressure.
fn feed_nalus<R: Read>(
    mut input: R,
    nalus: Sender<Nalu>,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let _span = span!(Level::DEBUG, "bitstream producer").entered();
    let mut splitter = NaluSplitter::default();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let read = match input.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        for nalu in splitter.push(&chunk[..read]) {
            if nalus.send(nalu).is_err() {
                return Ok(());
            }
        }
    }

    for nalu in splitter.flush() {
        if nalus.send(nalu).is_err() {
            return Ok(());
        }
    }

    Ok(())
}

fn run_capture_worker<D, F>(
    mut queue: CaptureQueue<D>,
    mut deliver: F,
    cancel: CancellationToken,
    delivered: Arc<AtomicU64>,
) -> CaptureQueue<D>
where
    D: VideoDevice,
    F: FnMut(DecodedFrame<'_>) + Send,
{
    let _span = span!(Level::INFO, "capture worker").entered();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match queue.wait_for_ready(CAPTURE_POLL_TIMEOUT_MS) {
            Ok(None) => continue,
            Ok(Some(frame)) => {
                let format = queue.format();
                deliver(DecodedFrame {
                    data: queue.plane_view(frame.index),
                    width: format.width,
                    height: format.height,
                    pixel_format: format.pixel_format,
                });
                delivered.fetch_add(1, Ordering::Release);

                if let Err(err) = queue.reuse(frame.index) {
                    error!("capture worker stopping, buffer requeue failed: {err}");
                    break;
                }
            }
            Err(err) => {
                error!("capture worker stopping: {err}");
                break;
            }
        }
    }

    queue
}

fn join_worker_with_grace<D: VideoDevice>(
    worker: ScopedJoinHandle<'_, CaptureQueue<D>>,
) -> CaptureQueue<D> {
    let deadline = Instant::now() + WORKER_JOIN_GRACE;
    while !worker.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    if !worker.is_finished() {
        warn!(
            "capture worker still running {}s after cancellation",
            WORKER_JOIN_GRACE.as_secs()
        );
    }

    worker.join().expect("the capture worker panicked")
}
