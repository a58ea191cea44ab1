use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::decoder::buffers::{Buffer, BufferPool, PoolError, map_buffer, unmap_buffers};
use crate::decoder::requests::{RequestPool, RequestPoolError};
use crate::device::{DeviceError, MediaRequest, MemoryMode, PlaneData, QueueDirection, VideoDevice};

/// Yield this many times waiting for a completion before backing off to a
/// short sleep.
const ACQUIRE_SPIN_LIMIT: u32 = 64;
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum OutputQueueError {
    #[error("slice of {required} bytes does not fit the {capacity}-byte output plane")]
    BufferTooSmall { required: usize, capacity: usize },

    #[error("all media requests are in use")]
    RequestsExhausted,

    #[error("output queue invariant violated: {0}")]
    Invariant(#[from] PoolError),

    #[error("no media requests were associated with the output queue")]
    NoRequestPool,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// The compressed-bitstream half of the device: owns the mmap pool slices are
/// copied into and remembers which media request rode along with each
/// submitted buffer so both can be recycled when the hardware is done.
pub struct OutputQueue<D: VideoDevice> {
    device: Arc<D>,
    pool: BufferPool,
    in_flight_requests: Vec<Option<MediaRequest>>,
    requests: Option<RequestPool>,
}

impl<D: VideoDevice> OutputQueue<D> {
    /// Allocates and maps `count` mmap buffers for the current output format.
    pub fn initialize_mmap(device: Arc<D>, count: u32) -> Result<Self, OutputQueueError> {
        let count = device.request_buffers(QueueDirection::Output, MemoryMode::Mmap, count)?;

        let mut buffers = Vec::with_capacity(count as usize);
        for index in 0..count {
            match map_buffer(&*device, QueueDirection::Output, index) {
                Ok(buffer) => buffers.push(Buffer::Mmap(buffer)),
                Err(err) => {
                    unmap_buffers(&*device, buffers);
                    return Err(err.into());
                }
            }
        }

        let in_flight_requests = (0..count).map(|_| None).collect();

        Ok(Self {
            device,
            pool: BufferPool::new(buffers),
            in_flight_requests,
            requests: None,
        })
    }

    /// Registers externally allocated DMA buffers instead of mmap
    /// allocations; each inner vector describes one buffer's planes. The
    /// caller fills these buffers and enqueues them itself, so
    /// [`OutputQueue::write_and_enqueue`] is mmap-only.
    pub fn initialize_imported(
        device: Arc<D>,
        buffers: Vec<Vec<crate::decoder::buffers::DmabufPlane>>,
    ) -> Result<Self, OutputQueueError> {
        let requested = buffers.len() as u32;
        let count =
            device.request_buffers(QueueDirection::Output, MemoryMode::DmabufImport, requested)?;
        if count < requested {
            return Err(DeviceError::NotSupported("the requested dma buffer count").into());
        }

        let buffers: Vec<Buffer> = buffers
            .into_iter()
            .enumerate()
            .map(|(index, planes)| {
                Buffer::Dmabuf(crate::decoder::buffers::DmabufBuffer::new(
                    index as u32,
                    planes,
                ))
            })
            .collect();

        let in_flight_requests = buffers.iter().map(|_| None).collect();

        Ok(Self {
            device,
            pool: BufferPool::new(buffers),
            in_flight_requests,
            requests: None,
        })
    }

    /// Installs the media-request pool used to tag subsequent enqueues.
    pub fn associate_media_requests(&mut self, requests: RequestPool) {
        self.requests = Some(requests);
    }

    pub fn has_media_requests(&self) -> bool {
        self.requests.is_some()
    }

    /// Takes a free request from the associated pool.
    ///
    /// When `blocking` is set this drains finished frames between attempts
    /// until one frees up; otherwise pool exhaustion is an error.
    pub fn acquire_media_request(
        &mut self,
        blocking: bool,
    ) -> Result<MediaRequest, OutputQueueError> {
        if self.requests.is_none() {
            return Err(OutputQueueError::NoRequestPool);
        }

        let mut spins = 0u32;
        loop {
            match self.requests.as_ref().unwrap().try_acquire() {
                Ok(request) => return Ok(request),
                Err(RequestPoolError::Exhausted) if blocking => {}
                Err(RequestPoolError::Exhausted) => {
                    return Err(OutputQueueError::RequestsExhausted);
                }
                Err(RequestPoolError::Device(err)) => return Err(err.into()),
            }

            self.reclaim_processed()?;
            back_off(&mut spins);
        }
    }

    /// Returns a request to the pool without it having been queued, e.g. when
    /// a later step of frame submission failed.
    pub fn release_media_request(&self, request: MediaRequest) -> Result<(), OutputQueueError> {
        self.requests
            .as_ref()
            .ok_or(OutputQueueError::NoRequestPool)?
            .release(&*self.device, request)?;
        Ok(())
    }

    /// Copies `data` into plane 0 of a free buffer and submits it, tagged with
    /// `request` when one is given. Blocks while every buffer is in flight,
    /// draining completions between attempts. Returns the buffer index the
    /// slice was submitted in.
    pub fn write_and_enqueue(
        &mut self,
        data: &[u8],
        request: Option<MediaRequest>,
    ) -> Result<u32, OutputQueueError> {
        let index = self.acquire_buffer()?;

        if let Err(err) = self.try_write_and_enqueue(index, data, &request) {
            // The buffer never reached the device; undo the acquisition so
            // acquire/release stay balanced on the error path.
            self.pool.release(index)?;
            if let (Some(request), Some(pool)) = (request, self.requests.as_ref()) {
                pool.release(&*self.device, request)?;
            }
            return Err(err);
        }

        self.in_flight_requests[index as usize] = request;
        Ok(index)
    }

    /// Queues the media request associated with a just-submitted buffer to
    /// the kernel; a no-op for untagged buffers.
    pub fn queue_associated_request(&self, index: u32) -> Result<(), OutputQueueError> {
        if let Some(request) = self
            .in_flight_requests
            .get(index as usize)
            .and_then(Option::as_ref)
        {
            self.device.queue_request(request)?;
        }
        Ok(())
    }

    fn try_write_and_enqueue(
        &mut self,
        index: u32,
        data: &[u8],
        request: &Option<MediaRequest>,
    ) -> Result<(), OutputQueueError> {
        let buffer = self
            .pool
            .buffer_mut(index)
            .as_mmap_mut()
            .expect("output buffers are mmap-backed");
        let plane = buffer.plane_mut(0);

        if data.len() > plane.length as usize {
            return Err(OutputQueueError::BufferTooSmall {
                required: data.len(),
                capacity: plane.length as usize,
            });
        }

        plane.mapping.as_mut_slice()[..data.len()].copy_from_slice(data);
        plane.bytes_used = data.len() as u32;

        self.device.queue_buffer(
            QueueDirection::Output,
            index,
            &[PlaneData {
                bytes_used: data.len() as u32,
            }],
            request.as_ref(),
        )?;

        Ok(())
    }

    /// Dequeues every finished submission, releasing its buffer and any
    /// request that was riding along. Never blocks; returns how many buffers
    /// were reclaimed.
    pub fn reclaim_processed(&mut self) -> Result<usize, OutputQueueError> {
        let mut reclaimed = 0;

        while let Some(done) = self.device.dequeue_buffer(QueueDirection::Output)? {
            trace!(index = done.index, "output buffer reclaimed");
            self.pool.release(done.index)?;

            if let Some(request) = self
                .in_flight_requests
                .get_mut(done.index as usize)
                .and_then(Option::take)
            {
                self.requests
                    .as_ref()
                    .ok_or(OutputQueueError::NoRequestPool)?
                    .release(&*self.device, request)?;
            }

            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    pub fn stream_on(&self) -> Result<(), DeviceError> {
        self.device.stream_on(QueueDirection::Output)
    }

    pub fn stream_off(&self) -> Result<(), DeviceError> {
        self.device.stream_off(QueueDirection::Output)
    }

    pub fn all_buffers_free(&self) -> bool {
        self.pool.all_free()
    }

    pub fn all_requests_free(&self) -> bool {
        self.requests.as_ref().is_none_or(RequestPool::all_free)
    }

    /// Unmaps every buffer and drops the request pool, closing the request
    /// fds. In-flight requests are dropped as well; the kernel releases their
    /// resources once the queues are off.
    pub fn deinit(mut self) {
        self.in_flight_requests.clear();
        self.requests = None;
        unmap_buffers(&*self.device, self.pool.into_buffers());
    }

    fn acquire_buffer(&mut self) -> Result<u32, OutputQueueError> {
        let mut spins = 0u32;
        loop {
            if let Some(index) = self.pool.try_acquire() {
                return Ok(index);
            }

            if self.reclaim_processed()? == 0 {
                back_off(&mut spins);
            }
        }
    }
}

fn back_off(spins: &mut u32) {
    if *spins < ACQUIRE_SPIN_LIMIT {
        *spins += 1;
        std::thread::yield_now();
    } else {
        std::thread::sleep(ACQUIRE_BACKOFF);
    }
}
