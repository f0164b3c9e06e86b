// Graphics pipeline creation
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// Rendering is dynamic (no render pass objects) and viewport/scissor are
// dynamic state, so resizing never touches the pipeline.

use anyhow::Result;
use ash::vk;

use super::shader::create_shader_module;
use super::ShaderSet;
use crate::error::FatalError;
use crate::scene::Vertex;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Model-view-projection matrix pushed to the vertex stage
pub const PUSH_CONSTANT_SIZE: u32 = 64;

/// Pipeline plus the layout its push constants are recorded against
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Vertex input description for our cube vertices (position + color)
pub fn vertex_input_info() -> (
    [vk::VertexInputBindingDescription; 1],
    [vk::VertexInputAttributeDescription; 2],
) {
    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(std::mem::size_of::<Vertex>() as u32)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    // Position attribute (location 0)
    let position_attr = vk::VertexInputAttributeDescription::builder()
        .binding(0)
        .location(0)
        .format(vk::Format::R32G32B32_SFLOAT)
        .offset(0)
        .build();

    // Color attribute (location 1)
    let color_attr = vk::VertexInputAttributeDescription::builder()
        .binding(0)
        .location(1)
        .format(vk::Format::R32G32B32_SFLOAT)
        .offset(12) // After 3 floats
        .build();

    ([binding], [position_attr, color_attr])
}

/// Create the cube pipeline rendering into `color_format` with a depth buffer
pub fn create_graphics_pipeline(
    device: &ash::Device,
    color_format: vk::Format,
    shaders: &ShaderSet,
) -> Result<GraphicsPipeline> {
    let vert_shader = create_shader_module(device, &shaders.vertex)?;
    let frag_shader = match create_shader_module(device, &shaders.fragment) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vert_shader, None) };
            return Err(e);
        }
    };

    let result = build_pipeline(device, color_format, vert_shader, frag_shader);

    // Modules are only needed during pipeline creation
    unsafe {
        device.destroy_shader_module(vert_shader, None);
        device.destroy_shader_module(frag_shader, None);
    }
    result
}

fn build_pipeline(
    device: &ash::Device,
    color_format: vk::Format,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
) -> Result<GraphicsPipeline> {
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

    let shader_stages = [vert_stage, frag_stage];

    // Vertex input
    let (bindings, attributes) = vertex_input_info();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    // Input assembly
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport and scissor are set per frame
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // Rasterization
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false);

    // Multisampling (disabled)
    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS) // Closer objects win
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // Color blending (no blending, opaque)
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = [color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let push_constant_range = vk::PushConstantRange::builder()
        .stage_flags(vk::ShaderStageFlags::VERTEX)
        .offset(0)
        .size(PUSH_CONSTANT_SIZE)
        .build();

    let push_constant_ranges = [push_constant_range];
    let layout_info =
        vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(&push_constant_ranges);

    let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(FatalError::api("vkCreatePipelineLayout"))?;

    // Dynamic rendering: attachment formats replace the render pass
    let color_formats = [color_format];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(DEPTH_FORMAT);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info)
        .build();

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    match pipelines {
        Ok(pipelines) => Ok(GraphicsPipeline {
            pipeline: pipelines[0],
            layout,
        }),
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(FatalError::api("vkCreateGraphicsPipelines")(e).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_input_matches_the_vertex_struct() {
        let (bindings, attributes) = vertex_input_info();
        assert_eq!(bindings[0].stride, 24);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[1].location, 1);
    }

    #[test]
    fn push_constants_hold_one_matrix() {
        assert_eq!(PUSH_CONSTANT_SIZE as usize, std::mem::size_of::<glam::Mat4>());
    }
}
