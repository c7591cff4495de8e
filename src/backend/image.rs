// Images - reference-counted 2D images with tracked layout
//
// The layout stored here is bookkeeping for the command stream: it is the
// layout the GPU will see when the next command touching the image runs.
// Only CommandList writes it.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use super::raw::{RawDevice, RawImage};
use super::VulkanDevice;

pub type ImageHandle = Arc<Image>;

/// Everything needed to create a 2D image and its default view
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub location: MemoryLocation,
    pub name: String,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            extent: vk::Extent2D { width: 1, height: 1 },
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
            location: MemoryLocation::GpuOnly,
            name: "image".to_string(),
        }
    }
}

impl ImageInfo {
    /// Depth target preset
    pub fn depth(extent: vk::Extent2D, name: &str) -> Self {
        Self {
            extent,
            format: vk::Format::D32_SFLOAT,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
            name: name.to_string(),
            ..Default::default()
        }
    }
}

pub struct Image {
    raw_device: Arc<dyn RawDevice>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<gpu_allocator::vulkan::Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
    aspect: vk::ImageAspectFlags,
    layout: Mutex<vk::ImageLayout>,
    name: String,
}

impl Image {
    pub fn new(raw_device: Arc<dyn RawDevice>, info: &ImageInfo) -> Result<ImageHandle> {
        let raw = raw_device.create_image(info)?;
        raw_device.set_object_name(vk::ObjectType::IMAGE, vk::Handle::as_raw(raw.image), &info.name);

        Ok(Arc::new(Self {
            raw_device,
            image: raw.image,
            view: raw.view,
            allocation: raw.allocation,
            format: info.format,
            extent: info.extent,
            aspect: info.aspect,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            name: info.name.clone(),
        }))
    }

    pub fn vk_image(&self) -> vk::Image {
        self.image
    }

    pub fn vk_view(&self) -> vk::ImageView {
        self.view
    }

    pub fn vk_aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Layout the next recorded command will observe
    pub fn layout(&self) -> vk::ImageLayout {
        *self.layout.lock()
    }

    pub(crate) fn set_layout(&self, layout: vk::ImageLayout) {
        *self.layout.lock() = layout;
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("extent", &self.extent)
            .field("layout", &self.layout())
            .finish()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        log::trace!("Destroying image '{}'", self.name);
        self.raw_device.destroy_image(RawImage {
            image: self.image,
            view: self.view,
            allocation: self.allocation.take(),
        });
    }
}

/// Create image, memory and view
pub(super) fn create_raw_image(device: &VulkanDevice, info: &ImageInfo) -> Result<RawImage> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: info.extent.width,
            height: info.extent.height,
            depth: 1,
        })
        .mip_levels(info.mip_levels)
        .array_layers(1)
        .format(info.format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(info.usage)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe {
        device.device.create_image(&image_info, None)
            .context("Failed to create image")?
    };

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };

    let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
        name: &info.name,
        requirements,
        location: info.location,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });

    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            return Err(e).context("Failed to allocate image memory");
        }
    };

    let view = unsafe {
        device.device.bind_image_memory(image, allocation.memory(), allocation.offset())
            .context("Failed to bind image memory")
            .and_then(|_| {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(info.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: info.aspect,
                        base_mip_level: 0,
                        level_count: info.mip_levels,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                device.device.create_image_view(&view_info, None)
                    .context("Failed to create image view")
            })
    };

    match view {
        Ok(view) => Ok(RawImage {
            image,
            view,
            allocation: Some(allocation),
        }),
        Err(e) => {
            device.free_allocation(allocation);
            unsafe { device.device.destroy_image(image, None) };
            Err(e)
        }
    }
}
