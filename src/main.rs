// =============================================================================
// HEADLESS COMMAND LIST DEMO
// =============================================================================
//
// Renders a fixed number of offscreen frames through the command list layer.
//
// FRAME FLOW:
// 1. Take an empty command list from the device pool
// 2. Record a cleared rendering scope (draw if shaders are available)
// 3. Transition the target for readback
// 4. Submit and wait on the submit timeline
// 5. Recycle finished command lists (releases their resources)
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use std::time::Instant;
use vk_cmdlist::backend::shader::load_spirv;
use vk_cmdlist::backend::{
    AttachmentDesc, BufferHandle, BufferInfo, Device, GraphicsPipelineHandle,
    GraphicsPipelineInfo, ImageHandle, ImageInfo, Instance, RenderingDesc, StagingBufferPool,
    SubmitInfo, VulkanDevice,
};
use vk_cmdlist::config::Config;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting headless command list demo");
    log::info!(
        "Target: {}x{}, {} frames",
        config.render.width,
        config.render.height,
        config.render.frame_count
    );

    let mut app = App::new(config)?;
    app.upload_test_data()?;
    app.run()?;

    log::info!("Shutdown complete");
    Ok(())
}

/// Initialize logging. RUST_LOG overrides the configured level.
fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::new();
    builder.filter_level(config.log_level_filter());
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Everything the demo renders with.
///
/// IMPORTANT: Field order matters for Drop! Handles go first, the Device
/// facade waits for the GPU before it releases pending submissions.
struct App {
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // RESOURCES
    // ─────────────────────────────────────────────────────────────────────────
    color_target: ImageHandle,
    depth_target: Option<ImageHandle>,
    pipeline: Option<GraphicsPipelineHandle>,
    upload_target: BufferHandle,
    staging: StagingBufferPool,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN CORE
    // ─────────────────────────────────────────────────────────────────────────
    device: Device,
}

impl App {
    fn new(config: Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let instance = Instance::new(&config.device.app_name, config.debug.validation_layers)?;
        let vulkan_device = VulkanDevice::new(instance)?;
        let device = Device::new(vulkan_device).context("Failed to create device facade")?;

        let extent = vk::Extent2D {
            width: config.render.width,
            height: config.render.height,
        };

        let color_target = device.create_image_2d(&ImageInfo {
            extent,
            name: "color target".to_string(),
            ..Default::default()
        })?;

        let depth_target = if config.render.depth {
            Some(device.create_image_2d(&ImageInfo::depth(extent, "depth target"))?)
        } else {
            None
        };

        let pipeline = Self::load_pipeline(&device, &config, depth_target.is_some());

        let upload_target = device.create_buffer(&BufferInfo {
            size: config.sync.staging_buffer_size,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            name: "upload target".to_string(),
            ..Default::default()
        })?;
        let staging = StagingBufferPool::new(&device, config.sync.staging_buffer_size);

        log::info!("Vulkan initialized successfully!");

        Ok(Self {
            config,
            color_target,
            depth_target,
            pipeline,
            upload_target,
            staging,
            device,
        })
    }

    /// Drawing is optional: without compiled shaders the frames are clears only
    fn load_pipeline(device: &Device, config: &Config, depth: bool) -> Option<GraphicsPipelineHandle> {
        let result = load_spirv(&config.shaders.vertex).and_then(|vertex_spirv| {
            let fragment_spirv = load_spirv(&config.shaders.fragment)?;
            device.create_graphics_pipeline(&GraphicsPipelineInfo {
                vertex_spirv,
                fragment_spirv,
                depth_format: depth.then_some(vk::Format::D32_SFLOAT),
                name: "triangle".to_string(),
                ..Default::default()
            })
        });

        match result {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                log::warn!("Drawing disabled: {:#}", e);
                None
            }
        }
    }

    // =========================================================================
    // UPLOAD
    // =========================================================================

    /// Fill a staging buffer from the CPU and copy it into device memory
    fn upload_test_data(&mut self) -> Result<()> {
        let staging = self.staging.get()?;
        let data: Vec<u8> = (0..staging.size()).map(|i| (i % 251) as u8).collect();
        staging.write(0, &data)?;

        let mut cmd = self.device.get_empty_command_list()?;
        cmd.begin()?;
        cmd.copy_buffer_to_buffer(
            &staging,
            &self.upload_target,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: staging.size(),
            }],
        );
        cmd.end()?;

        let value = self.device.submit(SubmitInfo {
            command_lists: vec![cmd],
            ..Default::default()
        })?;
        // The command list keeps the staging buffer alive until recycled
        drop(staging);

        self.wait_for(value)?;
        self.device.recycle()?;
        log::info!("Uploaded {} bytes", data.len());
        Ok(())
    }

    // =========================================================================
    // FRAME LOOP
    // =========================================================================

    fn run(&mut self) -> Result<()> {
        let start = Instant::now();

        for frame in 0..self.config.render.frame_count {
            let value = self.record_and_submit_frame()?;
            self.wait_for(value)?;
            self.device.recycle()?;

            if frame % 30 == 0 {
                log::debug!("Frame {} done at timeline value {}", frame, value);
            }
        }

        self.device.wait_idle()?;

        let elapsed = start.elapsed().as_secs_f64();
        let frames = self.config.render.frame_count;
        if frames > 0 && elapsed > 0.0 {
            log::info!(
                "Rendered {} frames in {:.2}s ({:.1} FPS)",
                frames,
                elapsed,
                frames as f64 / elapsed
            );
        }
        Ok(())
    }

    fn record_and_submit_frame(&mut self) -> Result<u64> {
        let mut cmd = self.device.get_empty_command_list()?;
        cmd.begin()?;

        let desc = RenderingDesc {
            color_attachments: vec![AttachmentDesc::new(&self.color_target)
                .clear_color(self.config.render.clear_color)],
            depth_attachment: self
                .depth_target
                .as_ref()
                .map(|depth| AttachmentDesc::new(depth).clear_depth_stencil(1.0, 0)),
            ..Default::default()
        };
        cmd.begin_rendering(&desc);

        if let Some(pipeline) = &self.pipeline {
            let extent = self.color_target.extent();
            cmd.bind_pipeline(pipeline);
            cmd.set_viewport(vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            });
            cmd.set_scissor(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            });
            cmd.draw(3, 1, 0, 0);
        }

        cmd.end_rendering();
        cmd.change_image_layout(&self.color_target, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        cmd.end()?;

        self.device.submit(SubmitInfo {
            command_lists: vec![cmd],
            ..Default::default()
        })
    }

    /// Wait on the submit timeline, a timeout is only a warning
    fn wait_for(&self, value: u64) -> Result<()> {
        let reached = self
            .device
            .submit_timeline()
            .wait_for_value(value, self.config.frame_timeout_nanos())?;
        if !reached {
            log::warn!(
                "GPU did not reach timeline value {} within {} ms",
                value,
                self.config.sync.frame_timeout_ms
            );
        }
        Ok(())
    }
}

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up...");
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {:#}", e);
        }
    }
}
