// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Resources are Arc handles, command lists retain what they record, and
// the Device facade keeps submitted lists alive until their timeline value.

pub mod buffer;
pub mod command;
pub mod device;
pub mod device_context;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod raw;
pub mod shader;
pub mod staging;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{Buffer, BufferHandle, BufferInfo};
pub use command::{AttachmentDesc, CommandList, ListState, RenderingDesc, ResolveTarget};
pub use device::VulkanDevice;
pub use device_context::{Device, SubmitInfo};
pub use image::{Image, ImageHandle, ImageInfo};
pub use instance::Instance;
pub use pipeline::{GraphicsPipeline, GraphicsPipelineHandle, GraphicsPipelineInfo};
pub use raw::RawDevice;
pub use staging::{StagingBuffer, StagingBufferPool};
pub use sync::{BinarySemaphore, TimelineSemaphore};
