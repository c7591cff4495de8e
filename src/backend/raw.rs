// Native API seam
//
// Everything the command-list layer needs from the graphics API goes through
// this trait. VulkanDevice is the real implementation; the unit tests drive
// the same code through a recording fake.

use anyhow::Result;
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use std::ptr::NonNull;

use super::buffer::BufferInfo;
use super::image::ImageInfo;
use super::pipeline::GraphicsPipelineInfo;

/// One queue submission, expressed in native handles.
///
/// Binary semaphores appear in the wait/signal lists with a value of 0.
#[derive(Default)]
pub struct RawSubmit<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [(vk::Semaphore, u64)],
    pub signal_semaphores: &'a [(vk::Semaphore, u64)],
}

/// Native image objects owned by an `Image` handle.
pub struct RawImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
}

/// Native buffer objects owned by a `Buffer` handle.
pub struct RawBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    /// Host address of the buffer's memory, for host-visible locations
    pub mapped: Option<MappedPtr>,
}

/// Start of a persistently mapped memory range.
///
/// Valid for as long as the memory it points into is allocated.
#[derive(Debug, Clone, Copy)]
pub struct MappedPtr(pub NonNull<u8>);

// Safety: only dereferenced by `Buffer::write`, after a bounds check, while
// the owning allocation is alive
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

pub trait RawDevice: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────
    // Command pools and buffers
    // ─────────────────────────────────────────────────────────────────────

    /// Create a command pool with exactly one primary command buffer in it.
    fn create_command_buffer(&self) -> Result<(vk::CommandPool, vk::CommandBuffer)>;
    fn destroy_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer);
    /// Reset the pool and give its backing memory back to the driver.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────
    // Recording
    // ─────────────────────────────────────────────────────────────────────

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, info: &vk::RenderingInfo);
    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: &vk::Viewport);
    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: &vk::Rect2D);
    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    );
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    // ─────────────────────────────────────────────────────────────────────
    // Semaphores
    // ─────────────────────────────────────────────────────────────────────

    fn create_binary_semaphore(&self) -> Result<vk::Semaphore>;
    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> Result<u64>;
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()>;
    /// Block until the counter reaches `value`. A timeout is `Ok(false)`.
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_nanos: u64)
        -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────
    // Resources
    // ─────────────────────────────────────────────────────────────────────

    fn create_buffer(&self, info: &BufferInfo) -> Result<RawBuffer>;
    fn destroy_buffer(&self, buffer: RawBuffer);
    fn create_image(&self, info: &ImageInfo) -> Result<RawImage>;
    fn destroy_image(&self, image: RawImage);
    fn create_graphics_pipeline(
        &self,
        info: &GraphicsPipelineInfo,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout);

    // ─────────────────────────────────────────────────────────────────────
    // Queue
    // ─────────────────────────────────────────────────────────────────────

    fn queue_submit(&self, submit: &RawSubmit) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;

    /// Attach a debug label to a native object. Ignored without debug utils.
    fn set_object_name(&self, _object_type: vk::ObjectType, _handle: u64, _name: &str) {}
}
