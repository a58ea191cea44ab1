use std::sync::Arc;

use tracing::trace;

use crate::decoder::buffers::{Buffer, map_buffer, unmap_buffers};
use crate::device::{DeviceError, MemoryMode, PlaneData, QueueDirection, StreamFormat, VideoDevice};

#[derive(Debug, thiserror::Error)]
pub enum CaptureQueueError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("capture buffer index {0} is out of range")]
    UnknownIndex(u32),
}

/// A decoded frame sitting in a dequeued capture buffer, ready to be viewed
/// until the buffer is requeued.
#[derive(Debug, Clone, Copy)]
pub struct ReadyFrame {
    pub index: u32,
    pub bytes_used: u32,
}

/// The decoded-frame half of the device. All buffers are handed to the
/// hardware up front; the worker dequeues one at a time, lets the consumer
/// look at it and immediately gives it back.
pub struct CaptureQueue<D: VideoDevice> {
    device: Arc<D>,
    buffers: Vec<Buffer>,
    format: StreamFormat,
}

impl<D: VideoDevice> CaptureQueue<D> {
    /// Allocates and maps `count` mmap buffers for the negotiated capture
    /// format.
    pub fn initialize_mmap(
        device: Arc<D>,
        format: StreamFormat,
        count: u32,
    ) -> Result<Self, CaptureQueueError> {
        let count = device.request_buffers(QueueDirection::Capture, MemoryMode::Mmap, count)?;

        let mut buffers = Vec::with_capacity(count as usize);
        for index in 0..count {
            match map_buffer(&*device, QueueDirection::Capture, index) {
                Ok(buffer) => buffers.push(Buffer::Mmap(buffer)),
                Err(err) => {
                    unmap_buffers(&*device, buffers);
                    return Err(err.into());
                }
            }
        }

        Ok(Self {
            device,
            buffers,
            format,
        })
    }

    /// Registers externally allocated DMA buffers for zero-copy consumers.
    /// Decoded planes are then reachable only through the imported fds, so
    /// [`CaptureQueue::plane_view`] is mmap-only.
    pub fn initialize_imported(
        device: Arc<D>,
        format: StreamFormat,
        buffers: Vec<Vec<crate::decoder::buffers::DmabufPlane>>,
    ) -> Result<Self, CaptureQueueError> {
        let requested = buffers.len() as u32;
        let count =
            device.request_buffers(QueueDirection::Capture, MemoryMode::DmabufImport, requested)?;
        if count < requested {
            return Err(DeviceError::NotSupported("the requested dma buffer count").into());
        }

        let buffers = buffers
            .into_iter()
            .enumerate()
            .map(|(index, planes)| {
                Buffer::Dmabuf(crate::decoder::buffers::DmabufBuffer::new(
                    index as u32,
                    planes,
                ))
            })
            .collect();

        Ok(Self {
            device,
            buffers,
            format,
        })
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Queues every buffer so the hardware can fill them; called once after
    /// initialization.
    pub fn enqueue_all(&mut self) -> Result<(), CaptureQueueError> {
        for index in 0..self.buffers.len() as u32 {
            self.enqueue(index)?;
        }
        Ok(())
    }

    /// Waits up to `timeout_ms` for a decoded frame. `None` on timeout, or
    /// when readiness evaporated before the dequeue.
    pub fn wait_for_ready(&mut self, timeout_ms: u32) -> Result<Option<ReadyFrame>, CaptureQueueError> {
        if !self
            .device
            .poll_readable(QueueDirection::Capture, timeout_ms)?
        {
            return Ok(None);
        }

        let Some(done) = self.device.dequeue_buffer(QueueDirection::Capture)? else {
            return Ok(None);
        };

        let bytes_used = done.bytes_used.first().copied().unwrap_or(0);
        let buffer = self
            .buffers
            .get_mut(done.index as usize)
            .ok_or(CaptureQueueError::UnknownIndex(done.index))?;
        buffer.set_bytes_used(0, bytes_used);

        trace!(index = done.index, bytes_used, "capture buffer ready");

        Ok(Some(ReadyFrame {
            index: done.index,
            bytes_used,
        }))
    }

    /// Read-only view of plane 0 of a dequeued buffer, valid until
    /// [`CaptureQueue::reuse`] gives the buffer back.
    pub fn plane_view(&self, index: u32) -> &[u8] {
        self.buffers[index as usize]
            .as_mmap()
            .expect("capture buffers are mmap-backed")
            .plane_view(0)
    }

    /// Resets the payload bookkeeping and hands the buffer back to the
    /// hardware.
    pub fn reuse(&mut self, index: u32) -> Result<(), CaptureQueueError> {
        let buffer = self
            .buffers
            .get_mut(index as usize)
            .ok_or(CaptureQueueError::UnknownIndex(index))?;
        buffer.set_bytes_used(0, 0);

        self.enqueue(index)
    }

    pub fn stream_on(&self) -> Result<(), DeviceError> {
        self.device.stream_on(QueueDirection::Capture)
    }

    pub fn stream_off(&self) -> Result<(), DeviceError> {
        self.device.stream_off(QueueDirection::Capture)
    }

    /// Unmaps every buffer.
    pub fn deinit(self) {
        unmap_buffers(&*self.device, self.buffers);
    }

    fn enqueue(&mut self, index: u32) -> Result<(), CaptureQueueError> {
        let plane_count = self.buffers[index as usize].plane_count();
        let planes = vec![PlaneData { bytes_used: 0 }; plane_count];
        self.device
            .queue_buffer(QueueDirection::Capture, index, &planes, None)?;
        Ok(())
    }
}
