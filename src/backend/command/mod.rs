// Command lists - recording GPU work and keeping its resources alive
//
// A CommandList owns one command pool with one primary command buffer. Every
// buffer, image and pipeline it records a reference to is retained until the
// list is reset or dropped, so the application never has to pin resources
// for in-flight work by hand.
//
// Resetting does NOT wait for the GPU. Callers wait on the timeline value of
// the submission first (Device::recycle does this).

mod rendering;
mod state;
mod tracking;

pub use rendering::{resolve_render_area, AttachmentDesc, RenderingDesc, ResolveTarget};
pub use state::ListState;
pub use tracking::UsedResources;

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use rendering::{AttachmentKind, AttachmentRecord};
use state::{Operation, RecordingState};

use super::buffer::{Buffer, BufferHandle};
use super::image::{Image, ImageHandle};
use super::pipeline::{GraphicsPipeline, GraphicsPipelineHandle};
use super::raw::RawDevice;

pub struct CommandList {
    raw_device: Arc<dyn RawDevice>,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    state: RecordingState,

    used_buffers: UsedResources<Buffer>,
    used_images: UsedResources<Image>,
    used_graphics_pipelines: UsedResources<GraphicsPipeline>,

    /// Colour attachments of the open rendering scope
    attachment_buffer: Vec<AttachmentRecord>,
}

impl CommandList {
    pub fn new(raw_device: Arc<dyn RawDevice>) -> Result<Self> {
        let (pool, cmd) = raw_device
            .create_command_buffer()
            .context("Failed to create command list")?;

        Ok(Self {
            raw_device,
            pool,
            cmd,
            state: RecordingState::new(),
            used_buffers: UsedResources::new(),
            used_images: UsedResources::new(),
            used_graphics_pipelines: UsedResources::new(),
            attachment_buffer: Vec::with_capacity(8),
        })
    }

    // =========================================================================
    // RECORDING SCOPE
    // =========================================================================

    /// Start recording. The buffer is meant to be submitted once.
    pub fn begin(&mut self) -> Result<()> {
        self.state.check(Operation::Begin);
        self.raw_device
            .begin_command_buffer(self.cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .context("Failed to begin command list")?;
        self.state.apply(Operation::Begin);
        Ok(())
    }

    /// Finish recording. No rendering scope may be open.
    pub fn end(&mut self) -> Result<()> {
        self.state.check(Operation::End);
        self.raw_device
            .end_command_buffer(self.cmd)
            .context("Failed to end command list")?;
        self.state.apply(Operation::End);
        log::debug!(
            "Command list {:?} ended: {} buffers, {} images, {} pipelines in use",
            self.cmd,
            self.used_buffers.len(),
            self.used_images.len(),
            self.used_graphics_pipelines.len()
        );
        Ok(())
    }

    /// Make the list recordable again and release every retained resource.
    ///
    /// The GPU must be done executing this list.
    pub fn reset(&mut self) -> Result<()> {
        self.state.check(Operation::Reset);
        self.raw_device
            .reset_command_pool(self.pool)
            .context("Failed to reset command list")?;
        self.used_buffers.clear();
        self.used_images.clear();
        self.used_graphics_pipelines.clear();
        self.attachment_buffer.clear();
        self.state.apply(Operation::Reset);
        Ok(())
    }

    // =========================================================================
    // DYNAMIC RENDERING
    // =========================================================================

    /// Open a rendering scope.
    ///
    /// Attachment images are retained and, if their tracked layout cannot be
    /// rendered to, transitioned first.
    pub fn begin_rendering(&mut self, desc: &RenderingDesc) {
        self.state.check(Operation::BeginRendering);
        debug_assert!(self.attachment_buffer.is_empty());

        // Every transition lands before any record copies a layout, so an
        // image shared by the depth and stencil roles ends up in one layout.
        let attachments = desc
            .color_attachments
            .iter()
            .map(|color| (color, AttachmentKind::Color))
            .chain(desc.depth_attachment.iter().map(|d| (d, AttachmentKind::Depth)))
            .chain(desc.stencil_attachment.iter().map(|s| (s, AttachmentKind::Stencil)));
        for (attachment, kind) in attachments {
            self.ensure_attachment_layout(&attachment.image, kind);
            if let Some(target) = &attachment.resolve {
                self.ensure_attachment_layout(&target.image, kind);
            }
        }

        self.attachment_buffer
            .extend(desc.color_attachments.iter().map(AttachmentRecord::from_desc));
        let depth = desc.depth_attachment.as_ref().map(AttachmentRecord::from_desc);
        let stencil = desc.stencil_attachment.as_ref().map(AttachmentRecord::from_desc);

        let render_area = resolve_render_area(desc);

        rendering::cmd_begin_rendering(
            self.raw_device.as_ref(),
            self.cmd,
            render_area,
            &self.attachment_buffer,
            depth.as_ref(),
            stencil.as_ref(),
        );
        self.state.apply(Operation::BeginRendering);
    }

    /// Close the rendering scope. Retained images stay retained.
    pub fn end_rendering(&mut self) {
        self.state.check(Operation::EndRendering);
        self.raw_device.cmd_end_rendering(self.cmd);
        self.attachment_buffer.clear();
        self.state.apply(Operation::EndRendering);
    }

    fn ensure_attachment_layout(&mut self, image: &ImageHandle, kind: AttachmentKind) {
        if !kind.accepts(image.layout()) {
            self.record_layout_transition(image, kind.optimal_layout());
        }
        self.used_images.insert(image);
    }

    // =========================================================================
    // STATE AND DRAWING
    // =========================================================================

    pub fn bind_pipeline(&mut self, pipeline: &GraphicsPipelineHandle) {
        self.state.check(Operation::Bind);
        self.raw_device.cmd_bind_pipeline(
            self.cmd,
            vk::PipelineBindPoint::GRAPHICS,
            pipeline.vk_pipeline(),
        );
        self.used_graphics_pipelines.insert(pipeline);
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.state.check(Operation::Bind);
        self.raw_device.cmd_set_viewport(self.cmd, &viewport);
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.state.check(Operation::Bind);
        self.raw_device.cmd_set_scissor(self.cmd, &scissor);
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.state.check(Operation::Draw);
        self.raw_device.cmd_draw(
            self.cmd,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
    }

    // =========================================================================
    // TRANSITIONS AND TRANSFERS
    // =========================================================================

    /// Transition `image` from its tracked layout to `new_layout`.
    ///
    /// The barrier covers all commands and all memory accesses on both sides.
    pub fn change_image_layout(&mut self, image: &ImageHandle, new_layout: vk::ImageLayout) {
        self.state.check(Operation::Barrier);
        self.record_layout_transition(image, new_layout);
    }

    fn record_layout_transition(&mut self, image: &ImageHandle, new_layout: vk::ImageLayout) {
        let all_memory = vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE;

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(all_memory)
            .dst_access_mask(all_memory)
            .old_layout(image.layout())
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.vk_image())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: image.vk_aspect(),
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            });

        self.raw_device.cmd_image_barrier(
            self.cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            &barrier,
        );

        image.set_layout(new_layout);
        self.used_images.insert(image);
    }

    /// Copy `regions` from `src` to `dst`.
    ///
    /// Panics on an empty region list or on a region reaching past the end of
    /// either buffer.
    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &BufferHandle,
        dst: &BufferHandle,
        regions: &[vk::BufferCopy],
    ) {
        self.state.check(Operation::Copy);
        assert!(
            !regions.is_empty(),
            "tried copying 0 regions from buffer '{}' to buffer '{}'",
            src.name(),
            dst.name()
        );

        for (i, region) in regions.iter().enumerate() {
            let src_end = region.src_offset.checked_add(region.size);
            assert!(
                src_end.is_some_and(|end| end <= src.size()),
                "copy region {} reads past the end of source buffer '{}' ({} bytes)",
                i,
                src.name(),
                src.size()
            );
            let dst_end = region.dst_offset.checked_add(region.size);
            assert!(
                dst_end.is_some_and(|end| end <= dst.size()),
                "copy region {} writes past the end of destination buffer '{}' ({} bytes)",
                i,
                dst.name(),
                dst.size()
            );
        }

        self.raw_device
            .cmd_copy_buffer(self.cmd, src.vk_buffer(), dst.vk_buffer(), regions);
        self.used_buffers.insert(src);
        self.used_buffers.insert(dst);
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn state(&self) -> ListState {
        self.state.state()
    }

    /// Number of open `begin`/`begin_rendering` scopes
    pub fn operations_in_progress(&self) -> u32 {
        self.state.operations_in_progress()
    }

    pub fn is_rendering(&self) -> bool {
        self.state.is_rendering()
    }

    pub fn vk_command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn used_buffers(&self) -> &[BufferHandle] {
        self.used_buffers.as_slice()
    }

    pub fn used_images(&self) -> &[ImageHandle] {
        self.used_images.as_slice()
    }

    pub fn used_graphics_pipelines(&self) -> &[GraphicsPipelineHandle] {
        self.used_graphics_pipelines.as_slice()
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("cmd", &self.cmd)
            .field("state", &self.state.state())
            .field("operations_in_progress", &self.state.operations_in_progress())
            .finish()
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.state.check(Operation::Destroy);
        }
        self.raw_device.destroy_command_buffer(self.pool, self.cmd);
    }
}
