// Swapchain - window presentation
//
// Manages the chain of presentable images, the negotiated format and
// present mode, and the compute dispatch grid derived from the surface
// extent. Recreated wholesale on resize or an out-of-date result; the
// old handle is fed to the new creation call for driver-side reuse.

use anyhow::{Context, Result};
use ash::vk;

use super::image::BarrierCursor;
use super::DeviceContext;

/// Workgroup edge length of the compute kernel (`local_size_x/y = 8`).
const WORKGROUP_SIZE: u32 = 8;

/// Dispatch grid covering `extent` with 8x8 workgroups: ceiling division
/// per axis, one slice deep.
pub fn dispatch_grid_for(extent: vk::Extent2D) -> [u32; 3] {
    [
        (extent.width + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE,
        (extent.height + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE,
        1,
    ]
}

/// Result of an image acquire.
pub enum AcquireOutcome {
    /// An image is available (its index recorded in `current_frame`);
    /// `suboptimal` asks for a recreation after this frame completes.
    Acquired { suboptimal: bool },
    /// The swapchain no longer matches the surface; the frame must be
    /// abandoned and the swapchain recreated.
    OutOfDate,
}

/// Result of a queue present.
pub enum PresentOutcome {
    Presented { suboptimal: bool },
    OutOfDate,
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    /// Barrier state per image; present-family-owned at creation.
    pub cursors: Vec<BarrierCursor>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub dispatch_grid: [u32; 3],
    /// Image index of the most recent successful acquire.
    pub current_frame: u32,
}

impl Swapchain {
    /// Negotiate format/present mode and build the image chain.
    ///
    /// `old_swapchain` may be null on first creation; on recreation the
    /// retired handle is passed through so the driver can recycle its
    /// resources. The caller destroys the old handle afterwards.
    pub fn new(
        ctx: &DeviceContext,
        requested_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        log::info!(
            "Creating swapchain: {}x{}",
            requested_extent.width,
            requested_extent.height
        );

        let surface_caps = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)
        }?;

        let formats = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_formats(ctx.physical_device, ctx.surface)
        }?;

        let present_modes = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_present_modes(ctx.physical_device, ctx.surface)
        }?;

        // Prefer an 8-bit sRGB format
        let surface_format = formats
            .iter()
            .find(|f| {
                (f.format == vk::Format::B8G8R8A8_SRGB || f.format == vk::Format::R8G8B8A8_SRGB)
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .context("No suitable surface format")?;

        // FIFO is the only mode Vulkan mandates everywhere
        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&mode| mode == preferred_present_mode)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        log::info!(
            "Surface format: {:?}, present mode: {:?}",
            surface_format.format,
            present_mode
        );

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: requested_extent.width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: requested_extent.height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let loader = ash::extensions::khr::Swapchain::new(&ctx.instance, &ctx.device);

        // STORAGE and TRANSFER_DST: the chain receives the compute image
        // by copy and may be written directly by future kernels
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = unsafe { loader.get_swapchain_images(handle) }?;

        log::info!("Created swapchain with {} images", images.len());

        let image_views: Result<Vec<_>> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(super::image::color_subresource_range());

                unsafe {
                    ctx.device
                        .create_image_view(&create_info, None)
                        .context("Failed to create swapchain image view")
                }
            })
            .collect();

        let cursors = images
            .iter()
            .map(|_| {
                BarrierCursor::new(
                    vk::ImageLayout::UNDEFINED,
                    vk::AccessFlags::MEMORY_READ,
                    ctx.present_queue.family,
                )
            })
            .collect();

        Ok(Self {
            handle,
            loader,
            images,
            image_views: image_views?,
            cursors,
            format: surface_format.format,
            extent,
            dispatch_grid: dispatch_grid_for(extent),
            current_frame: 0,
        })
    }

    /// Request the next presentable image, signaling `semaphore` when the
    /// presentation engine releases it. Updates `current_frame` on
    /// success.
    pub fn acquire(&mut self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => {
                self.current_frame = image_index;
                Ok(AcquireOutcome::Acquired { suboptimal })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to acquire swapchain image")),
        }
    }

    /// Present `current_frame` on `queue` after `wait_semaphores`.
    pub fn present(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.handle];
        let image_indices = [self.current_frame];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(PresentOutcome::Presented { suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to present swapchain image")),
        }
    }

    pub fn current_image(&self) -> vk::Image {
        self.images[self.current_frame as usize]
    }

    /// Destroy the per-image views, keeping the swapchain handle alive
    /// so it can seed the replacement chain.
    pub fn destroy_views(&mut self, ctx: &DeviceContext) {
        unsafe {
            for view in self.image_views.drain(..) {
                ctx.device.destroy_image_view(view, None);
            }
        }
        self.images.clear();
        self.cursors.clear();
    }

    /// Destroy views and the swapchain handle.
    pub fn destroy(&mut self, ctx: &DeviceContext) {
        self.destroy_views(ctx);
        unsafe {
            self.loader.destroy_swapchain(self.handle, None);
        }
        self.handle = vk::SwapchainKHR::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_divides_exact_extents() {
        let grid = dispatch_grid_for(vk::Extent2D {
            width: 1080,
            height: 720,
        });
        assert_eq!(grid, [135, 90, 1]);
    }

    #[test]
    fn grid_rounds_partial_workgroups_up() {
        let grid = dispatch_grid_for(vk::Extent2D {
            width: 1081,
            height: 720,
        });
        assert_eq!(grid, [136, 90, 1]);
    }

    #[test]
    fn grid_for_resized_window() {
        let grid = dispatch_grid_for(vk::Extent2D {
            width: 800,
            height: 600,
        });
        assert_eq!(grid, [100, 75, 1]);
    }
}
