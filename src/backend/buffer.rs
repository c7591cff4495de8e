// Buffers - reference-counted GPU memory ranges
//
// A BufferHandle can be held by application code, command lists and pending
// submissions at the same time. The native buffer is destroyed when the last
// holder lets go.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::raw::{MappedPtr, RawBuffer, RawDevice};
use super::VulkanDevice;

pub type BufferHandle = Arc<Buffer>;

/// Everything needed to create a buffer
#[derive(Debug, Clone)]
pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: String,
}

impl Default for BufferInfo {
    fn default() -> Self {
        Self {
            size: 0,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
            name: "buffer".to_string(),
        }
    }
}

pub struct Buffer {
    raw_device: Arc<dyn RawDevice>,
    buffer: vk::Buffer,
    allocation: Option<gpu_allocator::vulkan::Allocation>,
    mapped: Option<MappedPtr>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    name: String,
}

impl Buffer {
    pub fn new(raw_device: Arc<dyn RawDevice>, info: &BufferInfo) -> Result<BufferHandle> {
        assert!(info.size > 0, "tried to create buffer '{}' with size 0", info.name);

        let raw = raw_device.create_buffer(info)?;
        raw_device.set_object_name(vk::ObjectType::BUFFER, vk::Handle::as_raw(raw.buffer), &info.name);

        Ok(Arc::new(Self {
            raw_device,
            buffer: raw.buffer,
            allocation: raw.allocation,
            mapped: raw.mapped,
            size: info.size,
            usage: info.usage,
            name: info.name.clone(),
        }))
    }

    pub fn vk_buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy bytes into a host-visible buffer
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        offset
            .checked_add(data.len() as vk::DeviceSize)
            .filter(|&end| end <= self.size)
            .with_context(|| {
                format!(
                    "Write of {} bytes at offset {} overflows buffer '{}' ({} bytes)",
                    data.len(),
                    offset,
                    self.name,
                    self.size
                )
            })?;

        let MappedPtr(ptr) = self
            .mapped
            .with_context(|| format!("Buffer '{}' is not host visible", self.name))?;

        // Safety: range checked above, mapping stays valid while the allocation lives
        unsafe {
            let dst = ptr.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name)
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        log::trace!("Destroying buffer '{}'", self.name);
        self.raw_device.destroy_buffer(RawBuffer {
            buffer: self.buffer,
            allocation: self.allocation.take(),
            mapped: self.mapped.take(),
        });
    }
}

/// Create a native buffer and bind freshly allocated memory to it
pub(super) fn create_raw_buffer(device: &VulkanDevice, info: &BufferInfo) -> Result<RawBuffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(info.size)
        .usage(info.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe {
        device.device.create_buffer(&buffer_info, None)
            .context("Failed to create buffer")?
    };

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
        name: &info.name,
        requirements,
        location: info.location,
        linear: true,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });

    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).context("Failed to allocate buffer memory");
        }
    };

    let bound = unsafe {
        device.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    };

    if let Err(e) = bound {
        device.free_allocation(allocation);
        unsafe { device.device.destroy_buffer(buffer, None) };
        return Err(e).context("Failed to bind buffer memory");
    }

    let mapped = allocation
        .mapped_ptr()
        .map(|ptr| MappedPtr(ptr.cast::<u8>()));

    Ok(RawBuffer {
        buffer,
        allocation: Some(allocation),
        mapped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{Call, FakeDevice};

    fn info(size: u64) -> BufferInfo {
        BufferInfo {
            size,
            name: "test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn dropping_last_handle_destroys_buffer() {
        let fake = FakeDevice::new();
        let buffer = Buffer::new(fake.clone(), &info(64)).unwrap();
        let raw = buffer.vk_buffer();
        let second = buffer.clone();

        drop(buffer);
        assert!(!fake.calls().contains(&Call::DestroyBuffer(raw)));

        drop(second);
        assert!(fake.calls().contains(&Call::DestroyBuffer(raw)));
    }

    #[test]
    fn write_without_host_mapping_fails() {
        let fake = FakeDevice::new();
        let buffer = Buffer::new(fake, &info(16)).unwrap();
        let err = buffer.write(0, &[1, 2, 3, 4]).unwrap_err();
        assert!(err.to_string().contains("not host visible"));
    }

    #[test]
    fn write_lands_in_mapped_memory() {
        let fake = FakeDevice::new();
        let buffer = Buffer::new(
            fake.clone(),
            &BufferInfo {
                location: MemoryLocation::CpuToGpu,
                ..info(8)
            },
        )
        .unwrap();

        buffer.write(0, &[1, 2]).unwrap();
        buffer.write(5, &[7, 8, 9]).unwrap();
        assert_eq!(
            fake.buffer_contents(buffer.vk_buffer()).unwrap(),
            vec![1, 2, 0, 0, 0, 7, 8, 9]
        );
        assert!(buffer.write(6, &[0; 3]).is_err());
        assert_eq!(fake.buffer_contents(buffer.vk_buffer()).unwrap()[6..], [8, 9]);
    }

    #[test]
    fn write_past_end_fails_before_touching_memory() {
        let fake = FakeDevice::new();
        let buffer = Buffer::new(fake, &info(16)).unwrap();
        let err = buffer.write(12, &[0; 8]).unwrap_err();
        assert!(err.to_string().contains("overflows"));
        assert!(buffer.write(u64::MAX, &[0; 1]).is_err());
    }

    #[test]
    #[should_panic(expected = "size 0")]
    fn zero_sized_buffer_is_rejected() {
        let fake = FakeDevice::new();
        let _ = Buffer::new(fake, &info(0));
    }
}
