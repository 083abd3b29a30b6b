// Compute pipeline construction
//
// The pipeline is rebuilt in full on every swapchain recreation because
// its descriptor set references the recreated compute-output image view.
// The pipeline cache lives outside this struct and survives rebuilds so
// recompilation stays cheap.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;
use std::path::Path;

use super::descriptor::{
    DescriptorPoolBuilder, PushConstantRegion, ShaderBinding, StorageRegistration,
    COMPUTE_IMAGE_BINDING,
};
use super::shader;
use super::DeviceContext;

/// Pipeline-layout push-constant ranges for the optional region: exactly
/// one range when registered, none otherwise.
pub fn push_constant_ranges(region: Option<&PushConstantRegion>) -> Vec<vk::PushConstantRange> {
    match region {
        Some(region) => vec![vk::PushConstantRange {
            stage_flags: region.stage_flags,
            offset: region.offset,
            size: region.size,
        }],
        None => Vec::new(),
    }
}

pub struct ComputePipeline {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_set: vk::DescriptorSet,
    pub set_layout: vk::DescriptorSetLayout,
}

impl ComputePipeline {
    /// Derive the descriptor set from the registrations plus the
    /// compute-output image, compile the kernel and build the pipeline.
    ///
    /// Registrations must already carry their built buffers.
    pub fn build(
        ctx: &DeviceContext,
        cache: vk::PipelineCache,
        registrations: &[StorageRegistration],
        push_constants: Option<&PushConstantRegion>,
        compute_image_view: vk::ImageView,
        kernel_path: &Path,
    ) -> Result<Self> {
        // The kernel reads/writes the output image in GENERAL layout
        let image_info = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: compute_image_view,
            image_layout: vk::ImageLayout::GENERAL,
        };

        let mut builder = DescriptorPoolBuilder::default();
        let set = builder.set();
        set.bind_image(
            ShaderBinding {
                index: COMPUTE_IMAGE_BINDING,
                descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                stage_flags: vk::ShaderStageFlags::COMPUTE,
            },
            image_info,
        );
        for registration in registrations {
            let buffer = registration
                .buffer
                .as_ref()
                .context("Registration has no built buffer")?;
            set.bind_buffer(registration.binding, buffer.descriptor);
        }

        let built = builder.build(ctx)?;
        let set_layout = built.set_layouts[0];
        let descriptor_set = built.sets[0];

        let set_layouts = [set_layout];
        let ranges = push_constant_ranges(push_constants);
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);

        let layout = unsafe {
            ctx.device
                .create_pipeline_layout(&layout_info, None)
                .context("Failed to create pipeline layout")?
        };

        let handle = Self::create_pipeline(ctx, cache, layout, kernel_path)?;

        Ok(Self {
            handle,
            layout,
            descriptor_pool: built.pool,
            descriptor_set,
            set_layout,
        })
    }

    /// Recompile the kernel and swap in a fresh pipeline handle, keeping
    /// layout, descriptors and cache. Used by shader hot reload; the
    /// caller must have drained the device first. On a compile error the
    /// existing pipeline is left untouched.
    pub fn rebuild_shader(
        &mut self,
        ctx: &DeviceContext,
        cache: vk::PipelineCache,
        kernel_path: &Path,
    ) -> Result<()> {
        let fresh = Self::create_pipeline(ctx, cache, self.layout, kernel_path)?;
        unsafe {
            ctx.device.destroy_pipeline(self.handle, None);
        }
        self.handle = fresh;
        Ok(())
    }

    fn create_pipeline(
        ctx: &DeviceContext,
        cache: vk::PipelineCache,
        layout: vk::PipelineLayout,
        kernel_path: &Path,
    ) -> Result<vk::Pipeline> {
        let code = shader::compile_kernel(kernel_path)?;
        let module = shader::create_shader_module(ctx, &code)?;

        let entry_point = CString::new("main").unwrap();
        let stage_info = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point)
            .build();

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage_info)
            .layout(layout)
            .build();

        let pipelines = unsafe {
            ctx.device
                .create_compute_pipelines(cache, &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create compute pipeline")
        };

        // The module is consumed into the pipeline either way
        unsafe {
            ctx.device.destroy_shader_module(module, None);
        }

        Ok(pipelines?[0])
    }

    /// Release everything this struct owns, in reverse creation order.
    pub fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            ctx.device.destroy_pipeline(self.handle, None);
            ctx.device.destroy_pipeline_layout(self.layout, None);
            ctx.device.destroy_descriptor_pool(self.descriptor_pool, None);
            ctx.device.destroy_descriptor_set_layout(self.set_layout, None);
        }
        self.handle = vk::Pipeline::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::descriptor::shared_bytes;

    #[test]
    fn no_region_means_no_ranges() {
        assert!(push_constant_ranges(None).is_empty());
    }

    #[test]
    fn registered_region_maps_to_one_range() {
        let region = PushConstantRegion {
            offset: 0,
            size: 96,
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            payload: shared_bytes(vec![0; 96]),
            buffer: None,
        };

        let ranges = push_constant_ranges(Some(&region));

        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].offset, 0);
        assert_eq!(ranges[0].size, 96);
        assert_eq!(ranges[0].stage_flags, vk::ShaderStageFlags::COMPUTE);
    }
}
