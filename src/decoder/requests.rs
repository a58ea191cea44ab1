use std::collections::VecDeque;
use std::sync::Mutex;

use crate::device::{DeviceError, MediaRequest, VideoDevice};

#[derive(Debug, thiserror::Error)]
pub enum RequestPoolError {
    #[error("all media requests are in use")]
    Exhausted,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// A fixed set of kernel media requests recycled across frames.
///
/// Requests move FREE -> IN_USE on acquire and back on release, which
/// reinitializes the request so the kernel accepts it for the next frame.
/// Dropping the pool closes every request fd. Releases happen on the thread
/// that drains output completions, so a caller that wants to block on an empty
/// pool must interleave its own completion draining between attempts.
#[derive(Debug)]
pub struct RequestPool {
    free: Mutex<VecDeque<MediaRequest>>,
    capacity: usize,
}

impl RequestPool {
    /// Allocates `count` requests from the device's media controller.
    pub fn allocate<D: VideoDevice + ?Sized>(
        device: &D,
        count: usize,
    ) -> Result<Self, DeviceError> {
        let mut free = VecDeque::with_capacity(count);
        for _ in 0..count {
            free.push_back(MediaRequest::new(device.alloc_request()?));
        }

        Ok(Self {
            free: Mutex::new(free),
            capacity: count,
        })
    }

    pub fn try_acquire(&self) -> Result<MediaRequest, RequestPoolError> {
        self.free
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(RequestPoolError::Exhausted)
    }

    /// Reinitializes `request` and returns it to the free FIFO.
    pub fn release<D: VideoDevice + ?Sized>(
        &self,
        device: &D,
        request: MediaRequest,
    ) -> Result<(), DeviceError> {
        device.reinit_request(&request)?;
        self.free.lock().unwrap().push_back(request);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn all_free(&self) -> bool {
        self.free_count() == self.capacity
    }
}
