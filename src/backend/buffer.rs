// Managed buffers - persistently mapped GPU memory for scene data
//
// Every registered buffer/uniform (and the push-constant backing range)
// lives in host-visible, host-coherent memory: CPU writes are visible to
// the next dispatch without an explicit flush or GPU stall.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::DeviceContext;

/// A GPU buffer, its backing allocation, and the descriptor-info view
/// handed to descriptor writes.
///
/// Created during pipeline preparation, destroyed on pipeline cleanup.
/// The mapping persists for the buffer's whole life.
pub struct ManagedBuffer {
    pub handle: vk::Buffer,
    pub descriptor: vk::DescriptorBufferInfo,
    allocation: Option<gpu_allocator::vulkan::Allocation>,
    size: vk::DeviceSize,
}

impl ManagedBuffer {
    pub fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        label: &str,
    ) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Refusing to create zero-sized buffer '{}'", label);
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe {
            ctx.device
                .create_buffer(&buffer_info, None)
                .with_context(|| format!("Failed to create buffer '{}'", label))?
        };

        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(handle) };

        let allocation = ctx
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for buffer '{}'", label))?;

        unsafe {
            ctx.device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
                .context("Failed to bind buffer memory")?;
        }

        let descriptor = vk::DescriptorBufferInfo {
            buffer: handle,
            offset: 0,
            range: size,
        };

        Ok(Self {
            handle,
            descriptor,
            allocation: Some(allocation),
            size,
        })
    }

    /// Copy `data` into the persistent mapping. Host-coherent memory, so
    /// the write is visible to the next submitted dispatch as-is.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as vk::DeviceSize > self.size {
            anyhow::bail!(
                "Write of {} bytes exceeds buffer size {}",
                data.len(),
                self.size
            );
        }

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer allocation is not host-mapped")?;

        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Release the buffer and its allocation. Must only run once all GPU
    /// work referencing the buffer has drained.
    pub fn destroy(&mut self, ctx: &DeviceContext) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = ctx.allocator.lock().free(allocation) {
                log::error!("Failed to free buffer allocation: {}", e);
            }
        }
        unsafe {
            ctx.device.destroy_buffer(self.handle, None);
        }
        self.handle = vk::Buffer::null();
    }
}
