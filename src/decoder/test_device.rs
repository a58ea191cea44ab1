//! A loopback device for queue-level tests: buffers "complete" on demand (or
//! immediately), requests are plain `/dev/null` fds, nothing blocks.

use std::collections::{HashMap, VecDeque};
use std::os::fd::OwnedFd;
use std::sync::Mutex;

use crate::device::{
    Control, ControlId, DecodeMode, DequeuedBuffer, DeviceError, FormatRequest, MappedMemory,
    MediaRequest, MemoryMode, PlaneData, PlaneFormat, QueriedPlane, QueueDirection, StartCode,
    StreamFormat, VideoDevice,
};

struct PlaneStorage {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for PlaneStorage {}

impl PlaneStorage {
    fn new(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        Self {
            ptr: Box::into_raw(boxed).cast::<u8>(),
            len,
        }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        let slice = unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) };
        slice[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read(&self, len: usize) -> Vec<u8> {
        let slice = unsafe { std::slice::from_raw_parts(self.ptr, self.len) };
        slice[..len.min(self.len)].to_vec()
    }
}

impl Drop for PlaneStorage {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

#[derive(Default)]
struct Inner {
    storage: HashMap<QueueDirection, Vec<PlaneStorage>>,
    queued: HashMap<QueueDirection, VecDeque<(u32, u32)>>,
    completed: HashMap<QueueDirection, VecDeque<(u32, u32)>>,
    auto_complete_output: bool,
    maps: usize,
    unmaps: usize,
    reinits: usize,
    queued_requests: usize,
}

pub(crate) struct LoopbackDevice {
    plane_size: usize,
    inner: Mutex<Inner>,
}

impl LoopbackDevice {
    pub(crate) fn new(plane_size: usize) -> Self {
        Self {
            plane_size,
            inner: Mutex::new(Inner {
                auto_complete_output: true,
                ..Inner::default()
            }),
        }
    }

    /// Park output submissions until [`LoopbackDevice::complete_next_output`].
    pub(crate) fn hold_output_completions(&self) {
        self.inner.lock().unwrap().auto_complete_output = false;
    }

    pub(crate) fn complete_next_output(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .queued
            .entry(QueueDirection::Output)
            .or_default()
            .pop_front()
        {
            Some(entry) => {
                inner
                    .completed
                    .entry(QueueDirection::Output)
                    .or_default()
                    .push_back(entry);
                true
            }
            None => false,
        }
    }

    /// Fills a queued capture buffer and marks it dequeueable.
    pub(crate) fn make_capture_ready(&self, data: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some((index, _)) = inner
            .queued
            .entry(QueueDirection::Capture)
            .or_default()
            .pop_front()
        else {
            return false;
        };

        inner.storage.get(&QueueDirection::Capture).unwrap()[index as usize].write(0, data);
        inner
            .completed
            .entry(QueueDirection::Capture)
            .or_default()
            .push_back((index, data.len() as u32));
        true
    }

    pub(crate) fn output_bytes(&self, index: u32, len: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        inner.storage.get(&QueueDirection::Output).unwrap()[index as usize].read(len)
    }

    pub(crate) fn map_balance(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.maps, inner.unmaps)
    }

    pub(crate) fn reinit_count(&self) -> usize {
        self.inner.lock().unwrap().reinits
    }

    pub(crate) fn queued_request_count(&self) -> usize {
        self.inner.lock().unwrap().queued_requests
    }
}

impl VideoDevice for LoopbackDevice {
    fn set_format(
        &self,
        _direction: QueueDirection,
        request: FormatRequest,
    ) -> Result<StreamFormat, DeviceError> {
        Ok(StreamFormat {
            pixel_format: request.pixel_format,
            width: request.width,
            height: request.height,
            planes: vec![PlaneFormat {
                size_image: self.plane_size as u32,
                bytes_per_line: request.width,
            }],
        })
    }

    fn set_decode_mode(&self, _mode: DecodeMode) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_start_code(&self, _start_code: StartCode) -> Result<(), DeviceError> {
        Ok(())
    }

    fn advertises_control(&self, _id: ControlId) -> bool {
        true
    }

    fn request_buffers(
        &self,
        direction: QueueDirection,
        _memory: MemoryMode,
        count: u32,
    ) -> Result<u32, DeviceError> {
        let storage = (0..count).map(|_| PlaneStorage::new(self.plane_size)).collect();
        self.inner.lock().unwrap().storage.insert(direction, storage);
        Ok(count)
    }

    fn query_buffer(
        &self,
        direction: QueueDirection,
        index: u32,
    ) -> Result<Vec<QueriedPlane>, DeviceError> {
        let inner = self.inner.lock().unwrap();
        let storage = inner
            .storage
            .get(&direction)
            .and_then(|buffers| buffers.get(index as usize))
            .ok_or(DeviceError::NotSupported("querying an unknown buffer"))?;

        Ok(vec![QueriedPlane {
            length: storage.len as u32,
            mem_offset: 0,
        }])
    }

    fn map_plane(
        &self,
        direction: QueueDirection,
        index: u32,
        _plane: QueriedPlane,
    ) -> Result<MappedMemory, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.maps += 1;
        let storage = &inner.storage.get(&direction).unwrap()[index as usize];
        Ok(unsafe { MappedMemory::from_raw(storage.ptr, storage.len) })
    }

    fn unmap_plane(&self, _memory: MappedMemory) {
        self.inner.lock().unwrap().unmaps += 1;
    }

    fn queue_buffer(
        &self,
        direction: QueueDirection,
        index: u32,
        planes: &[PlaneData],
        request: Option<&MediaRequest>,
    ) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        let bytes_used = planes.first().map(|plane| plane.bytes_used).unwrap_or(0);
        let _ = request;

        let auto = direction == QueueDirection::Output && inner.auto_complete_output;
        let target = if auto {
            inner.completed.entry(direction).or_default()
        } else {
            inner.queued.entry(direction).or_default()
        };
        target.push_back((index, bytes_used));

        Ok(())
    }

    fn dequeue_buffer(
        &self,
        direction: QueueDirection,
    ) -> Result<Option<DequeuedBuffer>, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .completed
            .entry(direction)
            .or_default()
            .pop_front()
            .map(|(index, bytes_used)| DequeuedBuffer {
                index,
                bytes_used: vec![bytes_used],
                is_error: false,
            }))
    }

    fn stream_on(&self, _direction: QueueDirection) -> Result<(), DeviceError> {
        Ok(())
    }

    fn stream_off(&self, _direction: QueueDirection) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_controls(
        &self,
        _request: Option<&MediaRequest>,
        _controls: &[Control<'_>],
    ) -> Result<(), DeviceError> {
        Ok(())
    }

    fn alloc_request(&self) -> Result<OwnedFd, DeviceError> {
        let file = std::fs::File::open("/dev/null")
            .map_err(|err| DeviceError::ioctl("media request alloc", err))?;
        Ok(OwnedFd::from(file))
    }

    fn queue_request(&self, _request: &MediaRequest) -> Result<(), DeviceError> {
        self.inner.lock().unwrap().queued_requests += 1;
        Ok(())
    }

    fn reinit_request(&self, _request: &MediaRequest) -> Result<(), DeviceError> {
        self.inner.lock().unwrap().reinits += 1;
        Ok(())
    }

    fn poll_readable(
        &self,
        direction: QueueDirection,
        _timeout_ms: u32,
    ) -> Result<bool, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(!inner.completed.entry(direction).or_default().is_empty())
    }
}
