// Recording fake of the native API for unit tests
//
// Every call is logged in order. Timeline semaphores are real host-side
// counters with blocking waits, and submissions complete instantly unless
// told otherwise, which is enough to exercise pacing and recycling.

use anyhow::{Context, Result};
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use gpu_allocator::MemoryLocation;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::buffer::BufferInfo;
use super::image::ImageInfo;
use super::pipeline::GraphicsPipelineInfo;
use super::raw::{MappedPtr, RawBuffer, RawDevice, RawImage, RawSubmit};

#[derive(Debug, Clone, PartialEq)]
pub struct FakeAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub resolve_mode: vk::ResolveModeFlags,
    pub resolve_view: vk::ImageView,
    pub resolve_layout: vk::ImageLayout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeRendering {
    /// (x, y, width, height)
    pub area: (i32, i32, u32, u32),
    pub layer_count: u32,
    pub colors: Vec<FakeAttachment>,
    pub depth: Option<FakeAttachment>,
    pub stencil: Option<FakeAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub aspect: vk::ImageAspectFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateCommandBuffer(vk::CommandPool, vk::CommandBuffer),
    DestroyCommandBuffer(vk::CommandPool, vk::CommandBuffer),
    ResetCommandPool(vk::CommandPool),
    BeginCommandBuffer(vk::CommandBufferUsageFlags),
    EndCommandBuffer,
    BeginRendering(FakeRendering),
    EndRendering,
    BindPipeline(vk::Pipeline),
    SetViewport([f32; 4]),
    SetScissor((i32, i32, u32, u32)),
    Draw(u32, u32, u32, u32),
    ImageBarrier(FakeBarrier),
    /// regions as (src_offset, dst_offset, size)
    CopyBuffer(vk::Buffer, vk::Buffer, Vec<(u64, u64, u64)>),
    SignalSemaphore(vk::Semaphore, u64),
    DestroySemaphore(vk::Semaphore),
    DestroyBuffer(vk::Buffer),
    DestroyImage(vk::Image),
    DestroyPipeline(vk::Pipeline),
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        waits: Vec<(vk::Semaphore, u64)>,
        signals: Vec<(vk::Semaphore, u64)>,
    },
    WaitIdle,
}

pub struct FakeDevice {
    next_handle: AtomicU64,
    calls: Mutex<Vec<Call>>,
    timelines: Mutex<HashMap<vk::Semaphore, u64>>,
    timeline_changed: Condvar,
    complete_submits: AtomicBool,
    pending_signals: Mutex<Vec<(vk::Semaphore, u64)>>,
    fail_next: AtomicBool,
    /// Backing store of host-visible buffers
    host_memory: Mutex<HashMap<vk::Buffer, Box<[u8]>>>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
            timelines: Mutex::new(HashMap::new()),
            timeline_changed: Condvar::new(),
            complete_submits: AtomicBool::new(true),
            pending_signals: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            host_memory: Mutex::new(HashMap::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Keep submitted signals pending until `complete_submitted_work`
    pub fn hold_submissions(&self) {
        self.complete_submits.store(false, Ordering::SeqCst);
    }

    /// Let the "GPU" finish everything submitted so far
    pub fn complete_submitted_work(&self) {
        let signals: Vec<_> = self.pending_signals.lock().drain(..).collect();
        for (semaphore, value) in signals {
            self.advance(semaphore, value);
        }
    }

    /// Bytes of a host-visible buffer, `None` for device-local ones
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.host_memory.lock().get(&buffer).map(|memory| memory.to_vec())
    }

    /// Make the next fallible native call fail with `ERROR_DEVICE_LOST`
    pub fn fail_next_call(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(vk::Result::ERROR_DEVICE_LOST.into());
        }
        Ok(())
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn advance(&self, semaphore: vk::Semaphore, value: u64) {
        let mut timelines = self.timelines.lock();
        if let Some(current) = timelines.get_mut(&semaphore) {
            *current = (*current).max(value);
            self.timeline_changed.notify_all();
        }
    }
}

fn rect(rect: &vk::Rect2D) -> (i32, i32, u32, u32) {
    (rect.offset.x, rect.offset.y, rect.extent.width, rect.extent.height)
}

fn attachment(info: &vk::RenderingAttachmentInfo) -> FakeAttachment {
    FakeAttachment {
        view: info.image_view,
        layout: info.image_layout,
        load_op: info.load_op,
        store_op: info.store_op,
        resolve_mode: info.resolve_mode,
        resolve_view: info.resolve_image_view,
        resolve_layout: info.resolve_image_layout,
    }
}

impl RawDevice for FakeDevice {
    fn create_command_buffer(&self) -> Result<(vk::CommandPool, vk::CommandBuffer)> {
        self.check_failure()?;
        let pool = vk::CommandPool::from_raw(self.handle());
        let cmd = vk::CommandBuffer::from_raw(self.handle());
        self.record(Call::CreateCommandBuffer(pool, cmd));
        Ok((pool, cmd))
    }

    fn destroy_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        self.record(Call::DestroyCommandBuffer(pool, cmd));
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        self.check_failure()?;
        self.record(Call::ResetCommandPool(pool));
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        self.check_failure()?;
        self.record(Call::BeginCommandBuffer(usage));
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> Result<()> {
        self.check_failure()?;
        self.record(Call::EndCommandBuffer);
        Ok(())
    }

    fn cmd_begin_rendering(&self, _cmd: vk::CommandBuffer, info: &vk::RenderingInfo) {
        let colors = if info.color_attachment_count == 0 {
            Vec::new()
        } else {
            unsafe {
                std::slice::from_raw_parts(
                    info.p_color_attachments,
                    info.color_attachment_count as usize,
                )
            }
            .iter()
            .map(attachment)
            .collect()
        };
        let depth = unsafe { info.p_depth_attachment.as_ref() }.map(attachment);
        let stencil = unsafe { info.p_stencil_attachment.as_ref() }.map(attachment);

        self.record(Call::BeginRendering(FakeRendering {
            area: rect(&info.render_area),
            layer_count: info.layer_count,
            colors,
            depth,
            stencil,
        }));
    }

    fn cmd_end_rendering(&self, _cmd: vk::CommandBuffer) {
        self.record(Call::EndRendering);
    }

    fn cmd_bind_pipeline(
        &self,
        _cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(Call::BindPipeline(pipeline));
    }

    fn cmd_set_viewport(&self, _cmd: vk::CommandBuffer, viewport: &vk::Viewport) {
        self.record(Call::SetViewport([
            viewport.x,
            viewport.y,
            viewport.width,
            viewport.height,
        ]));
    }

    fn cmd_set_scissor(&self, _cmd: vk::CommandBuffer, scissor: &vk::Rect2D) {
        self.record(Call::SetScissor(rect(scissor)));
    }

    fn cmd_draw(
        &self,
        _cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.record(Call::Draw(vertex_count, instance_count, first_vertex, first_instance));
    }

    fn cmd_image_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        self.record(Call::ImageBarrier(FakeBarrier {
            image: barrier.image,
            old_layout: barrier.old_layout,
            new_layout: barrier.new_layout,
            src_stage,
            dst_stage,
            src_access: barrier.src_access_mask,
            dst_access: barrier.dst_access_mask,
            aspect: barrier.subresource_range.aspect_mask,
        }));
    }

    fn cmd_copy_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let regions = regions
            .iter()
            .map(|region| (region.src_offset, region.dst_offset, region.size))
            .collect();
        self.record(Call::CopyBuffer(src, dst, regions));
    }

    fn create_binary_semaphore(&self) -> Result<vk::Semaphore> {
        self.check_failure()?;
        Ok(vk::Semaphore::from_raw(self.handle()))
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore> {
        self.check_failure()?;
        let semaphore = vk::Semaphore::from_raw(self.handle());
        self.timelines.lock().insert(semaphore, initial_value);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.timelines.lock().remove(&semaphore);
        self.record(Call::DestroySemaphore(semaphore));
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        self.timelines
            .lock()
            .get(&semaphore)
            .copied()
            .context("Not a timeline semaphore")
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        self.check_failure()?;
        {
            let timelines = self.timelines.lock();
            let current = timelines.get(&semaphore).context("Not a timeline semaphore")?;
            assert!(value > *current, "timeline signal must increase the counter");
        }
        self.record(Call::SignalSemaphore(semaphore, value));
        self.advance(semaphore, value);
        Ok(())
    }

    fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_nanos: u64,
    ) -> Result<bool> {
        self.check_failure()?;
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_nanos));
        let mut timelines = self.timelines.lock();
        loop {
            let current = *timelines.get(&semaphore).context("Not a timeline semaphore")?;
            if current >= value {
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    if self.timeline_changed.wait_until(&mut timelines, deadline).timed_out() {
                        let current = timelines.get(&semaphore).copied().unwrap_or(0);
                        return Ok(current >= value);
                    }
                }
                None => self.timeline_changed.wait(&mut timelines),
            }
        }
    }

    fn create_buffer(&self, info: &BufferInfo) -> Result<RawBuffer> {
        self.check_failure()?;
        let buffer = vk::Buffer::from_raw(self.handle());

        // Boxed bytes do not move when the map rehashes
        let host_visible = matches!(
            info.location,
            MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu
        );
        let mapped = if host_visible {
            let mut memory = vec![0u8; info.size as usize].into_boxed_slice();
            let ptr = NonNull::new(memory.as_mut_ptr()).map(MappedPtr);
            self.host_memory.lock().insert(buffer, memory);
            ptr
        } else {
            None
        };

        Ok(RawBuffer {
            buffer,
            allocation: None,
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        self.host_memory.lock().remove(&buffer.buffer);
        self.record(Call::DestroyBuffer(buffer.buffer));
    }

    fn create_image(&self, _info: &ImageInfo) -> Result<RawImage> {
        self.check_failure()?;
        Ok(RawImage {
            image: vk::Image::from_raw(self.handle()),
            view: vk::ImageView::from_raw(self.handle()),
            allocation: None,
        })
    }

    fn destroy_image(&self, image: RawImage) {
        self.record(Call::DestroyImage(image.image));
    }

    fn create_graphics_pipeline(
        &self,
        _info: &GraphicsPipelineInfo,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        self.check_failure()?;
        Ok((
            vk::Pipeline::from_raw(self.handle()),
            vk::PipelineLayout::from_raw(self.handle()),
        ))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline, _layout: vk::PipelineLayout) {
        self.record(Call::DestroyPipeline(pipeline));
    }

    fn queue_submit(&self, submit: &RawSubmit) -> Result<()> {
        self.check_failure()?;
        self.record(Call::Submit {
            command_buffers: submit.command_buffers.to_vec(),
            waits: submit.wait_semaphores.to_vec(),
            signals: submit.signal_semaphores.to_vec(),
        });

        if self.complete_submits.load(Ordering::SeqCst) {
            for &(semaphore, value) in submit.signal_semaphores {
                self.advance(semaphore, value);
            }
        } else {
            self.pending_signals
                .lock()
                .extend_from_slice(submit.signal_semaphores);
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.check_failure()?;
        self.record(Call::WaitIdle);
        self.complete_submitted_work();
        Ok(())
    }
}
