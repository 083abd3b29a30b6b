// Descriptor machinery - registrations, set layout assembly, pool sizing
//
// The descriptor set is derived from the caller's ordered registration
// list plus the compute-output image at the reserved binding. Contents
// are written once per build in a single batched update; per-frame data
// flows through the persistently mapped buffers, never through
// descriptor rewrites.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::RwLock;
use std::sync::Arc;

use super::buffer::ManagedBuffer;
use super::DeviceContext;

/// Binding index reserved for the compute-output storage image. Caller
/// registrations must not use it.
pub const COMPUTE_IMAGE_BINDING: u32 = 0;

/// CPU-side payload shared between the caller and the engine. The caller
/// mutates it between ticks; the engine copies it into mapped GPU memory
/// at the top of every frame.
pub type SharedBytes = Arc<RwLock<Vec<u8>>>;

/// Convenience constructor for a [`SharedBytes`] payload.
pub fn shared_bytes(data: Vec<u8>) -> SharedBytes {
    Arc::new(RwLock::new(data))
}

/// Where and as what a registration appears in the descriptor set.
#[derive(Debug, Clone, Copy)]
pub struct ShaderBinding {
    pub index: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stage_flags: vk::ShaderStageFlags,
}

/// One registered scene buffer or uniform. `buffer` is populated during
/// pipeline preparation and torn down with it.
pub struct StorageRegistration {
    pub binding: ShaderBinding,
    pub usage: vk::BufferUsageFlags,
    pub payload: SharedBytes,
    pub size: usize,
    pub buffer: Option<ManagedBuffer>,
}

/// The single optional push-constant region. Data is pushed into the
/// command buffer's constant range each frame and also mirrored into its
/// own backing buffer.
pub struct PushConstantRegion {
    pub offset: u32,
    pub size: u32,
    pub stage_flags: vk::ShaderStageFlags,
    pub payload: SharedBytes,
    pub buffer: Option<ManagedBuffer>,
}

/// Accumulates one descriptor set's bindings together with the
/// buffer/image infos to write into it.
#[derive(Default)]
pub struct DescriptorSetBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
    buffer_infos: Vec<(u32, vk::DescriptorBufferInfo)>,
    image_infos: Vec<(u32, vk::DescriptorImageInfo)>,
}

impl DescriptorSetBuilder {
    pub fn bind_buffer(
        &mut self,
        binding: ShaderBinding,
        info: vk::DescriptorBufferInfo,
    ) -> &mut Self {
        self.push_binding(binding);
        self.buffer_infos.push((binding.index, info));
        self
    }

    pub fn bind_image(
        &mut self,
        binding: ShaderBinding,
        info: vk::DescriptorImageInfo,
    ) -> &mut Self {
        self.push_binding(binding);
        self.image_infos.push((binding.index, info));
        self
    }

    fn push_binding(&mut self, binding: ShaderBinding) {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding.index)
                .descriptor_type(binding.descriptor_type)
                .descriptor_count(1)
                .stage_flags(binding.stage_flags)
                .build(),
        );
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }

    /// Duplicate binding indices produce an undefined layout; reject them
    /// before the driver sees them.
    pub fn validate_unique_indices(&self) -> Result<()> {
        let mut seen: Vec<u32> = Vec::with_capacity(self.bindings.len());
        for b in &self.bindings {
            if seen.contains(&b.binding) {
                anyhow::bail!("Duplicate descriptor binding index {}", b.binding);
            }
            seen.push(b.binding);
        }
        Ok(())
    }

    fn build_layout(&self, ctx: &DeviceContext) -> Result<vk::DescriptorSetLayout> {
        self.validate_unique_indices()?;
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);
        unsafe {
            ctx.device
                .create_descriptor_set_layout(&info, None)
                .context("Failed to create descriptor set layout")
        }
    }
}

/// Pool handle plus the per-set objects allocated from it, in builder
/// order.
pub struct BuiltDescriptors {
    pub pool: vk::DescriptorPool,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub sets: Vec<vk::DescriptorSet>,
}

/// Sizes one pool to the aggregate per-type binding counts across its
/// sets, allocates the sets and performs the single batched write.
#[derive(Default)]
pub struct DescriptorPoolBuilder {
    sets: Vec<DescriptorSetBuilder>,
}

impl DescriptorPoolBuilder {
    /// Start a new set; returns its builder.
    pub fn set(&mut self) -> &mut DescriptorSetBuilder {
        self.sets.push(DescriptorSetBuilder::default());
        self.sets.last_mut().unwrap()
    }

    /// Aggregate descriptor counts per type across every set, in
    /// first-seen order.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for set in &self.sets {
            for binding in &set.bindings {
                match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                    Some(size) => size.descriptor_count += binding.descriptor_count,
                    None => sizes.push(vk::DescriptorPoolSize {
                        ty: binding.descriptor_type,
                        descriptor_count: binding.descriptor_count,
                    }),
                }
            }
        }
        sizes
    }

    pub fn build(&self, ctx: &DeviceContext) -> Result<BuiltDescriptors> {
        let set_layouts = self
            .sets
            .iter()
            .map(|s| s.build_layout(ctx))
            .collect::<Result<Vec<_>>>()?;

        let sizes = self.pool_sizes();
        // Sized for exactly these sets, nothing spare
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(self.sets.len() as u32)
            .pool_sizes(&sizes);

        let pool = unsafe {
            ctx.device
                .create_descriptor_pool(&pool_info, None)
                .context("Failed to create descriptor pool")?
        };

        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);

        let sets = unsafe {
            ctx.device
                .allocate_descriptor_sets(&alloc_info)
                .context("Failed to allocate descriptor sets")?
        };

        // One batched write covering every binding of every set
        let mut writes = Vec::new();
        for (handle, set) in sets.iter().zip(&self.sets) {
            for (index, info) in &set.buffer_infos {
                let ty = set
                    .bindings
                    .iter()
                    .find(|b| b.binding == *index)
                    .map(|b| b.descriptor_type)
                    .unwrap_or(vk::DescriptorType::STORAGE_BUFFER);
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(*handle)
                        .dst_binding(*index)
                        .descriptor_type(ty)
                        .buffer_info(std::slice::from_ref(info))
                        .build(),
                );
            }
            for (index, info) in &set.image_infos {
                let ty = set
                    .bindings
                    .iter()
                    .find(|b| b.binding == *index)
                    .map(|b| b.descriptor_type)
                    .unwrap_or(vk::DescriptorType::STORAGE_IMAGE);
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(*handle)
                        .dst_binding(*index)
                        .descriptor_type(ty)
                        .image_info(std::slice::from_ref(info))
                        .build(),
                );
            }
        }

        unsafe {
            ctx.device.update_descriptor_sets(&writes, &[]);
        }

        Ok(BuiltDescriptors {
            pool,
            set_layouts,
            sets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute_binding(index: u32, ty: vk::DescriptorType) -> ShaderBinding {
        ShaderBinding {
            index,
            descriptor_type: ty,
            stage_flags: vk::ShaderStageFlags::COMPUTE,
        }
    }

    fn buffer_info() -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: 64,
        }
    }

    fn image_info() -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::GENERAL,
        }
    }

    #[test]
    fn two_buffers_plus_reserved_image_yield_three_bindings() {
        let mut builder = DescriptorPoolBuilder::default();
        let set = builder.set();
        set.bind_image(
            compute_binding(COMPUTE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE),
            image_info(),
        );
        set.bind_buffer(
            compute_binding(1, vk::DescriptorType::STORAGE_BUFFER),
            buffer_info(),
        );
        set.bind_buffer(
            compute_binding(2, vk::DescriptorType::STORAGE_BUFFER),
            buffer_info(),
        );

        let indices: Vec<u32> = builder.sets[0].bindings().iter().map(|b| b.binding).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let sizes = builder.pool_sizes();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(sizes[0].descriptor_count, 1);
        assert_eq!(sizes[1].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(sizes[1].descriptor_count, 2);
    }

    #[test]
    fn uniforms_are_counted_separately_from_storage() {
        let mut builder = DescriptorPoolBuilder::default();
        let set = builder.set();
        set.bind_buffer(
            compute_binding(1, vk::DescriptorType::STORAGE_BUFFER),
            buffer_info(),
        );
        set.bind_buffer(
            compute_binding(2, vk::DescriptorType::UNIFORM_BUFFER),
            buffer_info(),
        );

        let sizes = builder.pool_sizes();
        assert_eq!(sizes.len(), 2);
        assert!(sizes
            .iter()
            .any(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER && s.descriptor_count == 1));
    }

    #[test]
    fn duplicate_binding_indices_are_rejected() {
        let mut set = DescriptorSetBuilder::default();
        set.bind_buffer(
            compute_binding(1, vk::DescriptorType::STORAGE_BUFFER),
            buffer_info(),
        );
        set.bind_buffer(
            compute_binding(1, vk::DescriptorType::STORAGE_BUFFER),
            buffer_info(),
        );

        assert!(set.validate_unique_indices().is_err());
    }
}
