// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (prefer discrete GPU, Vulkan 1.3)
// - Logical device + graphics queue creation
// - Memory allocator setup
// - The RawDevice implementation everything else records through

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::buffer::{create_raw_buffer, BufferInfo};
use super::image::{create_raw_image, ImageInfo};
use super::instance::Instance;
use super::pipeline::{create_raw_pipeline, GraphicsPipelineInfo};
use super::raw::{RawBuffer, RawDevice, RawImage, RawSubmit};

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped first, it frees memory through the device
    pub(super) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles. Submission needs external synchronization.
    graphics_queue: Mutex<vk::Queue>,
    pub graphics_queue_family: u32,

    // Device properties (cached for performance)
    pub properties: vk::PhysicalDeviceProperties,

    // Keeps the instance alive until the device is gone
    instance: Arc<Instance>,
}

impl VulkanDevice {
    pub fn new(instance: Arc<Instance>) -> Result<Arc<Self>> {
        let (physical_device, graphics_queue_family) =
            Self::pick_physical_device(&instance.instance)?;

        let (device, graphics_queue) = Self::create_logical_device(
            &instance.instance,
            physical_device,
            graphics_queue_family,
        )?;

        let properties = unsafe {
            instance.instance.get_physical_device_properties(physical_device)
        };

        log::info!("Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy());
        log::info!("API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version));

        let allocator = match Self::create_allocator(&instance.instance, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            graphics_queue: Mutex::new(graphics_queue),
            graphics_queue_family,
            properties,
            instance,
        }))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate GPUs")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if props.api_version < vk::API_VERSION_1_3 {
                log::debug!("Skipping {}: Vulkan 1.3 not supported", name);
                continue;
            }

            if !Self::check_device_features(instance, device) {
                log::debug!("Skipping {}: missing dynamic rendering or timeline semaphores", name);
                continue;
            }

            // Find graphics queue family
            let queue_families = unsafe {
                instance.get_physical_device_queue_family_properties(device)
            };

            let graphics_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i as u32);

            if let Some(graphics_family) = graphics_family {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found (need Vulkan 1.3 with dynamic rendering)"))
    }

    fn check_device_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut features12)
            .push_next(&mut features13);

        unsafe { instance.get_physical_device_features2(device, &mut features) };

        features12.timeline_semaphore == vk::TRUE && features13.dynamic_rendering == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let mut features12 = vk::PhysicalDeviceVulkan12Features {
            timeline_semaphore: vk::TRUE,
            ..Default::default()
        };
        let mut features13 = vk::PhysicalDeviceVulkan13Features {
            dynamic_rendering: vk::TRUE,
            ..Default::default()
        };

        // Dynamic rendering and timeline semaphores are core in 1.3
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device = unsafe {
            instance.create_device(physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        let graphics_queue = unsafe {
            device.get_device_queue(graphics_queue_family, 0)
        };

        Ok((device, graphics_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    /// Return memory to the allocator. Failures are logged, not propagated.
    pub(super) fn free_allocation(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("Failed to free allocation: {}", e);
        }
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl RawDevice for VulkanDevice {
    fn create_command_buffer(&self) -> Result<(vk::CommandPool, vk::CommandBuffer)> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.graphics_queue_family);

        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        match unsafe { self.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => Ok((pool, buffers[0])),
            Err(e) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                Err(e).context("Failed to allocate command buffer")
            }
        }
    }

    fn destroy_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        unsafe {
            self.device.free_command_buffers(pool, &[cmd]);
            self.device.destroy_command_pool(pool, None);
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)
        }?;
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(usage);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }?;
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd) }?;
        Ok(())
    }

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, info: &vk::RenderingInfo) {
        unsafe { self.device.cmd_begin_rendering(cmd, info) };
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cmd) };
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) };
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: &vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(cmd, 0, std::slice::from_ref(viewport)) };
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: &vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cmd, 0, std::slice::from_ref(scissor)) };
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            )
        };
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) };
    }

    fn create_binary_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.device.create_semaphore(&create_info, None) }
            .context("Failed to create binary semaphore")?;
        Ok(semaphore)
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { self.device.create_semaphore(&create_info, None) }
            .context("Failed to create timeline semaphore")?;
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        let value = unsafe { self.device.get_semaphore_counter_value(semaphore) }
            .context("Failed to read timeline semaphore")?;
        Ok(value)
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        let signal_info = vk::SemaphoreSignalInfo::builder()
            .semaphore(semaphore)
            .value(value);
        unsafe { self.device.signal_semaphore(&signal_info) }
            .context("Failed to signal timeline semaphore")?;
        Ok(())
    }

    fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_nanos: u64,
    ) -> Result<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.wait_semaphores(&wait_info, timeout_nanos) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e).context("Failed to wait on timeline semaphore"),
        }
    }

    fn create_buffer(&self, info: &BufferInfo) -> Result<RawBuffer> {
        create_raw_buffer(self, info)
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        if let Some(allocation) = buffer.allocation {
            self.free_allocation(allocation);
        }
    }

    fn create_image(&self, info: &ImageInfo) -> Result<RawImage> {
        create_raw_image(self, info)
    }

    fn destroy_image(&self, image: RawImage) {
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
        if let Some(allocation) = image.allocation {
            self.free_allocation(allocation);
        }
    }

    fn create_graphics_pipeline(
        &self,
        info: &GraphicsPipelineInfo,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        create_raw_pipeline(&self.device, info)
            .with_context(|| format!("Failed to create pipeline '{}'", info.name))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) {
        unsafe {
            self.device.destroy_pipeline(pipeline, None);
            self.device.destroy_pipeline_layout(layout, None);
        }
    }

    fn queue_submit(&self, submit: &RawSubmit) -> Result<()> {
        let (wait_semaphores, wait_values): (Vec<_>, Vec<_>) =
            submit.wait_semaphores.iter().copied().unzip();
        let (signal_semaphores, signal_values): (Vec<_>, Vec<_>) =
            submit.signal_semaphores.iter().copied().unzip();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];

        // Binary semaphores ignore their entry in the value arrays
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(submit.command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        let queue = self.graphics_queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], vk::Fence::null()) }
            .context("Queue submission failed")?;
        Ok(())
    }

    /// Wait for device to be idle (e.g., before cleanup)
    fn wait_idle(&self) -> Result<()> {
        // Idle waits need every queue externally synchronized
        let _queue = self.graphics_queue.lock();
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }

    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        let Some(debug_utils) = self.instance.debug_utils() else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(handle)
            .object_name(&name);

        if let Err(e) = unsafe {
            debug_utils.set_debug_utils_object_name(self.device.handle(), &name_info)
        } {
            log::warn!("Failed to name object {:?}: {}", object_type, e);
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}
