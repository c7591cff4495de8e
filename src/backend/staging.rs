// Staging buffer pool - host-visible upload buffers
//
// A StagingBuffer guard hands its buffer back to the pool on drop. The pool
// keeps one reference of its own, so a pooled buffer whose strong count is
// above one is still held somewhere else (usually a command list of an
// in-flight submission) and is skipped by `get`.

use anyhow::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use super::buffer::{Buffer, BufferHandle, BufferInfo};
use super::device_context::Device;
use super::raw::RawDevice;

struct PoolInner {
    raw_device: Arc<dyn RawDevice>,
    buffer_size: vk::DeviceSize,
    free: Mutex<Vec<BufferHandle>>,
}

pub struct StagingBufferPool {
    inner: Arc<PoolInner>,
}

impl StagingBufferPool {
    pub fn new(device: &Device, buffer_size: vk::DeviceSize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                raw_device: device.raw_device().clone(),
                buffer_size,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.inner.buffer_size
    }

    /// Buffers currently parked in the pool, reusable or not
    pub fn pooled(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// A staging buffer nobody else references, reused when possible
    pub fn get(&self) -> Result<StagingBuffer> {
        let reusable = {
            let mut free = self.inner.free.lock();
            free.iter()
                .position(|buffer| Arc::strong_count(buffer) == 1)
                .map(|index| free.swap_remove(index))
        };

        let buffer = match reusable {
            Some(buffer) => buffer,
            None => {
                log::debug!(
                    "Allocating staging buffer of {} bytes ({} pooled, all busy)",
                    self.inner.buffer_size,
                    self.pooled()
                );
                Buffer::new(
                    self.inner.raw_device.clone(),
                    &BufferInfo {
                        size: self.inner.buffer_size,
                        usage: vk::BufferUsageFlags::TRANSFER_SRC,
                        location: MemoryLocation::CpuToGpu,
                        name: "staging".to_string(),
                    },
                )?
            }
        };

        Ok(StagingBuffer {
            buffer,
            pool: Arc::downgrade(&self.inner),
        })
    }
}

/// Checked-out staging buffer
pub struct StagingBuffer {
    buffer: BufferHandle,
    pool: Weak<PoolInner>,
}

impl StagingBuffer {
    pub fn handle(&self) -> &BufferHandle {
        &self.buffer
    }
}

impl Deref for StagingBuffer {
    type Target = BufferHandle;

    fn deref(&self) -> &BufferHandle {
        self.handle()
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.free.lock().push(self.buffer.clone());
        }
    }
}
