use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::device::{DeviceError, MappedMemory, QueueDirection, VideoDevice};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("buffer index {0} is out of range for this pool")]
    UnknownIndex(u32),

    #[error("buffer index {0} was released while already free")]
    DoubleRelease(u32),
}

/// One mmap'd plane of a buffer: the mapping plus its payload bookkeeping.
#[derive(Debug)]
pub struct MmapPlane {
    pub mapping: MappedMemory,
    pub length: u32,
    pub bytes_used: u32,
}

/// One plane of an externally allocated DMA buffer. The fd handle is
/// refcounted so a single exported buffer can back several logical planes;
/// the last clone dropped closes it.
#[derive(Debug)]
pub struct DmabufPlane {
    pub fd: Arc<OwnedFd>,
    pub length: u32,
    pub offset: u32,
    pub bytes_used: u32,
}

#[derive(Debug)]
pub struct MmapBuffer {
    index: u32,
    planes: Vec<MmapPlane>,
}

impl MmapBuffer {
    pub fn new(index: u32, planes: Vec<MmapPlane>) -> Self {
        Self { index, planes }
    }

    pub fn plane_view(&self, plane: usize) -> &[u8] {
        let plane = &self.planes[plane];
        &plane.mapping.as_slice()[..plane.bytes_used as usize]
    }

    pub fn plane_mut(&mut self, plane: usize) -> &mut MmapPlane {
        &mut self.planes[plane]
    }

    pub fn into_planes(self) -> Vec<MmapPlane> {
        self.planes
    }
}

#[derive(Debug)]
pub struct DmabufBuffer {
    index: u32,
    planes: Vec<DmabufPlane>,
}

impl DmabufBuffer {
    pub fn new(index: u32, planes: Vec<DmabufPlane>) -> Self {
        Self { index, planes }
    }
}

/// A queue buffer behind one of the two memory backends.
#[derive(Debug)]
pub enum Buffer {
    Mmap(MmapBuffer),
    Dmabuf(DmabufBuffer),
}

impl Buffer {
    pub fn index(&self) -> u32 {
        match self {
            Buffer::Mmap(buffer) => buffer.index,
            Buffer::Dmabuf(buffer) => buffer.index,
        }
    }

    pub fn plane_count(&self) -> usize {
        match self {
            Buffer::Mmap(buffer) => buffer.planes.len(),
            Buffer::Dmabuf(buffer) => buffer.planes.len(),
        }
    }

    pub fn plane_length(&self, plane: usize) -> u32 {
        match self {
            Buffer::Mmap(buffer) => buffer.planes[plane].length,
            Buffer::Dmabuf(buffer) => buffer.planes[plane].length,
        }
    }

    pub fn bytes_used(&self, plane: usize) -> u32 {
        match self {
            Buffer::Mmap(buffer) => buffer.planes[plane].bytes_used,
            Buffer::Dmabuf(buffer) => buffer.planes[plane].bytes_used,
        }
    }

    pub fn set_bytes_used(&mut self, plane: usize, bytes_used: u32) {
        match self {
            Buffer::Mmap(buffer) => buffer.planes[plane].bytes_used = bytes_used,
            Buffer::Dmabuf(buffer) => buffer.planes[plane].bytes_used = bytes_used,
        }
    }

    pub fn as_mmap(&self) -> Option<&MmapBuffer> {
        match self {
            Buffer::Mmap(buffer) => Some(buffer),
            Buffer::Dmabuf(_) => None,
        }
    }

    pub fn as_mmap_mut(&mut self) -> Option<&mut MmapBuffer> {
        match self {
            Buffer::Mmap(buffer) => Some(buffer),
            Buffer::Dmabuf(_) => None,
        }
    }
}

/// A fixed-capacity set of buffers handed out in FIFO order.
///
/// The pool is purely the container: blocking acquisition lives with the
/// queues, which can drain device completions between attempts.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Vec<Buffer>,
    free: VecDeque<u32>,
}

impl BufferPool {
    pub fn new(buffers: Vec<Buffer>) -> Self {
        let free = (0..buffers.len() as u32).collect();
        Self { buffers, free }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn all_free(&self) -> bool {
        self.free.len() == self.buffers.len()
    }

    pub fn try_acquire(&mut self) -> Option<u32> {
        self.free.pop_front()
    }

    pub fn release(&mut self, index: u32) -> Result<(), PoolError> {
        if index as usize >= self.buffers.len() {
            return Err(PoolError::UnknownIndex(index));
        }
        if self.free.contains(&index) {
            return Err(PoolError::DoubleRelease(index));
        }

        self.free.push_back(index);
        Ok(())
    }

    pub fn buffer(&self, index: u32) -> &Buffer {
        &self.buffers[index as usize]
    }

    pub fn buffer_mut(&mut self, index: u32) -> &mut Buffer {
        &mut self.buffers[index as usize]
    }

    /// Tears the pool down, yielding the buffers so their mappings can be
    /// returned to the device.
    pub fn into_buffers(self) -> Vec<Buffer> {
        self.buffers
    }
}

/// Queries one negotiated buffer and maps each of its planes, unwinding the
/// mappings made so far if one fails.
pub(crate) fn map_buffer<D: VideoDevice + ?Sized>(
    device: &D,
    direction: QueueDirection,
    index: u32,
) -> Result<MmapBuffer, DeviceError> {
    let planes = device.query_buffer(direction, index)?;

    let mut mapped = Vec::with_capacity(planes.len());
    for plane in planes {
        match device.map_plane(direction, index, plane) {
            Ok(mapping) => mapped.push(MmapPlane {
                mapping,
                length: plane.length,
                bytes_used: 0,
            }),
            Err(err) => {
                for plane in mapped {
                    device.unmap_plane(plane.mapping);
                }
                return Err(err);
            }
        }
    }

    Ok(MmapBuffer::new(index, mapped))
}

pub(crate) fn unmap_buffers<D: VideoDevice + ?Sized>(device: &D, buffers: Vec<Buffer>) {
    for buffer in buffers {
        if let Buffer::Mmap(buffer) = buffer {
            for plane in buffer.into_planes() {
                device.unmap_plane(plane.mapping);
            }
        }
    }
}
