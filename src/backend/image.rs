// Managed images and the barrier cursor
//
// Every image the engine transitions carries a cursor recording the
// layout/access/owning-family the last barrier left it in. Transitions
// always diff against that recorded state - never against a hardcoded
// assumption - so the src half of each barrier is correct by
// construction. The cursor is plain data and unit-tests without a
// device.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::DeviceContext;

/// Full-color single-mip subresource range, the only shape this engine
/// ever transitions or copies.
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Per-image barrier state machine: current layout, access mask and
/// owning queue family.
///
/// Invariant: the cursor is advanced on every transition - a skipped
/// update would make the next barrier's src masks lie to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierCursor {
    layout: vk::ImageLayout,
    access: vk::AccessFlags,
    family: u32,
}

impl BarrierCursor {
    pub fn new(layout: vk::ImageLayout, access: vk::AccessFlags, family: u32) -> Self {
        Self {
            layout,
            access,
            family,
        }
    }

    /// Forget history and re-seed the cursor. Used for swapchain images,
    /// whose contents are undefined again after each present.
    pub fn reset(&mut self, layout: vk::ImageLayout, access: vk::AccessFlags, family: u32) {
        *self = Self::new(layout, access, family);
    }

    /// Produce the barrier moving the image from the recorded state to
    /// `(new_layout, new_access, new_family)`, then advance the cursor.
    /// `new_family: None` keeps the current owner (no transfer).
    pub fn transition(
        &mut self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        new_layout: vk::ImageLayout,
        new_access: vk::AccessFlags,
        new_family: Option<u32>,
    ) -> vk::ImageMemoryBarrier {
        let dst_family = new_family.unwrap_or(self.family);

        let barrier = vk::ImageMemoryBarrier::builder()
            .image(image)
            .subresource_range(range)
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_access_mask(self.access)
            .dst_access_mask(new_access)
            .src_queue_family_index(self.family)
            .dst_queue_family_index(dst_family)
            .build();

        self.layout = new_layout;
        self.access = new_access;
        self.family = dst_family;

        barrier
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn family(&self) -> u32 {
        self.family
    }
}

/// A GPU image, its allocation, its views and its barrier cursor.
///
/// One instance backs the compute-output image; it is created and
/// destroyed together with the pipeline on every swapchain recreation.
pub struct ManagedImage {
    pub handle: vk::Image,
    pub views: Vec<vk::ImageView>,
    pub cursor: BarrierCursor,
    allocation: Option<gpu_allocator::vulkan::Allocation>,
}

impl ManagedImage {
    /// Create a device-local 2D image with one identity-swizzled view.
    /// The cursor starts at UNDEFINED with no access, owned by `family`.
    pub fn new(
        ctx: &DeviceContext,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        family: u32,
        label: &str,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe {
            ctx.device
                .create_image(&image_info, None)
                .with_context(|| format!("Failed to create image '{}'", label))?
        };

        let requirements = unsafe { ctx.device.get_image_memory_requirements(handle) };

        let allocation = ctx
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::DedicatedImage(handle),
            })
            .with_context(|| format!("Failed to allocate memory for image '{}'", label))?;

        unsafe {
            ctx.device
                .bind_image_memory(handle, allocation.memory(), allocation.offset())
                .context("Failed to bind image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(color_subresource_range());

        let view = unsafe {
            ctx.device
                .create_image_view(&view_info, None)
                .context("Failed to create image view")?
        };

        Ok(Self {
            handle,
            views: vec![view],
            cursor: BarrierCursor::new(vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty(), family),
            allocation: Some(allocation),
        })
    }

    /// Release views, allocation and handle. Must only run after a device
    /// idle wait.
    pub fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            for view in self.views.drain(..) {
                ctx.device.destroy_image_view(view, None);
            }
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = ctx.allocator.lock().free(allocation) {
                log::error!("Failed to free image allocation: {}", e);
            }
        }
        unsafe {
            ctx.device.destroy_image(self.handle, None);
        }
        self.handle = vk::Image::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPUTE: u32 = 1;
    const PRESENT: u32 = 0;

    fn image() -> vk::Image {
        vk::Image::null()
    }

    #[test]
    fn first_transition_diffs_from_initial_state() {
        let mut cursor =
            BarrierCursor::new(vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty(), COMPUTE);

        let barrier = cursor.transition(
            image(),
            color_subresource_range(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            None,
        );

        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::empty());
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(barrier.src_queue_family_index, COMPUTE);
        assert_eq!(barrier.dst_queue_family_index, COMPUTE);
    }

    #[test]
    fn chained_transition_diffs_from_last_applied_state() {
        let mut cursor =
            BarrierCursor::new(vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty(), COMPUTE);

        cursor.transition(
            image(),
            color_subresource_range(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            None,
        );
        let back = cursor.transition(
            image(),
            color_subresource_range(),
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::empty(),
            None,
        );

        // src half comes from the previous transition, not from UNDEFINED
        assert_eq!(back.old_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(back.src_access_mask, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(back.new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(cursor.layout(), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn family_handoff_is_symmetric_within_a_frame() {
        let mut cursor = BarrierCursor::new(
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::MEMORY_READ,
            PRESENT,
        );

        // present -> compute before the copy
        let out = cursor.transition(
            image(),
            color_subresource_range(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            Some(COMPUTE),
        );
        assert_eq!(out.src_queue_family_index, PRESENT);
        assert_eq!(out.dst_queue_family_index, COMPUTE);

        // compute -> present before present
        let back = cursor.transition(
            image(),
            color_subresource_range(),
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::MEMORY_READ,
            Some(PRESENT),
        );
        assert_eq!(back.src_queue_family_index, COMPUTE);
        assert_eq!(back.dst_queue_family_index, PRESENT);
        assert_eq!(cursor.family(), PRESENT);
    }

    #[test]
    fn reset_reseeds_without_history() {
        let mut cursor =
            BarrierCursor::new(vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty(), COMPUTE);
        cursor.transition(
            image(),
            color_subresource_range(),
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_WRITE,
            None,
        );

        cursor.reset(
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::MEMORY_READ,
            PRESENT,
        );
        let barrier = cursor.transition(
            image(),
            color_subresource_range(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            None,
        );

        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::MEMORY_READ);
        assert_eq!(barrier.src_queue_family_index, PRESENT);
    }
}
