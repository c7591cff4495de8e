// Graphics pipeline creation and management
//
// Pipelines target dynamic rendering, so there is no render pass object:
// attachment formats are declared up front and viewport/scissor are dynamic.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::raw::RawDevice;
use super::shader::create_shader_module;

pub type GraphicsPipelineHandle = Arc<GraphicsPipeline>;

/// Description of a graphics pipeline
#[derive(Debug, Clone)]
pub struct GraphicsPipelineInfo {
    /// SPIR-V words of the vertex stage
    pub vertex_spirv: Vec<u32>,
    /// SPIR-V words of the fragment stage
    pub fragment_spirv: Vec<u32>,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    /// Vertex + fragment push constant block size in bytes, 0 for none
    pub push_constant_size: u32,
    pub name: String,
}

impl Default for GraphicsPipelineInfo {
    fn default() -> Self {
        Self {
            vertex_spirv: Vec::new(),
            fragment_spirv: Vec::new(),
            color_formats: vec![vk::Format::R8G8B8A8_UNORM],
            depth_format: None,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            push_constant_size: 0,
            name: "pipeline".to_string(),
        }
    }
}

pub struct GraphicsPipeline {
    raw_device: Arc<dyn RawDevice>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    name: String,
}

impl GraphicsPipeline {
    pub fn new(
        raw_device: Arc<dyn RawDevice>,
        info: &GraphicsPipelineInfo,
    ) -> Result<GraphicsPipelineHandle> {
        let (pipeline, layout) = raw_device.create_graphics_pipeline(info)?;
        raw_device.set_object_name(vk::ObjectType::PIPELINE, vk::Handle::as_raw(pipeline), &info.name);

        Ok(Arc::new(Self {
            raw_device,
            pipeline,
            layout,
            name: info.name.clone(),
        }))
    }

    pub fn vk_pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn vk_layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipeline")
            .field("name", &self.name)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        log::trace!("Destroying pipeline '{}'", self.name);
        self.raw_device.destroy_pipeline(self.pipeline, self.layout);
    }
}

/// Create a graphics pipeline for dynamic rendering
pub(super) fn create_raw_pipeline(
    device: &ash::Device,
    info: &GraphicsPipelineInfo,
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let vert_shader = create_shader_module(device, &info.vertex_spirv)?;
    let frag_shader = match create_shader_module(device, &info.fragment_spirv) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vert_shader, None) };
            return Err(e);
        }
    };

    let result = build_pipeline(device, info, vert_shader, frag_shader);

    // Modules are only needed during pipeline creation
    unsafe {
        device.destroy_shader_module(vert_shader, None);
        device.destroy_shader_module(frag_shader, None);
    }

    result
}

fn build_pipeline(
    device: &ash::Device,
    info: &GraphicsPipelineInfo,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let entry_point = c"main";

    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader)
        .name(entry_point)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader)
        .name(entry_point)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    // Vertices are generated in the shader
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(info.topology)
        .primitive_restart_enable(false);

    // Viewport and scissor come from the command list
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
        .dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(info.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let has_depth = info.depth_format.is_some();
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(has_depth)
        .depth_write_enable(has_depth)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // One opaque blend state per colour attachment
    let color_blend_attachments: Vec<_> = info
        .color_formats
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(false)
                .build()
        })
        .collect();

    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let push_constant_ranges: Vec<_> = if info.push_constant_size > 0 {
        vec![vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(info.push_constant_size)
            .build()]
    } else {
        Vec::new()
    };

    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .push_constant_ranges(&push_constant_ranges);

    let pipeline_layout = unsafe {
        device.create_pipeline_layout(&layout_info, None)
            .context("Failed to create pipeline layout")?
    };

    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&info.color_formats)
        .depth_attachment_format(info.depth_format.unwrap_or(vk::Format::UNDEFINED));

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .push_next(&mut rendering_info)
        .build();

    let pipelines = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        ).map_err(|(_, e)| e)
    };

    match pipelines {
        Ok(pipelines) => Ok((pipelines[0], pipeline_layout)),
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
            Err(e).context("Failed to create graphics pipeline")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{Call, FakeDevice};

    #[test]
    fn pipeline_outlives_application_handle_while_cloned() {
        let fake = FakeDevice::new();
        let pipeline = GraphicsPipeline::new(fake.clone(), &GraphicsPipelineInfo::default()).unwrap();
        let raw = pipeline.vk_pipeline();
        let kept = Arc::clone(&pipeline);

        drop(pipeline);
        assert!(!fake.calls().contains(&Call::DestroyPipeline(raw)));
        drop(kept);
        assert!(fake.calls().contains(&Call::DestroyPipeline(raw)));
    }
}
