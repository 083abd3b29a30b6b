// Frame presentation engine
//
// Drives the per-tick choreography: wait previous frame -> acquire ->
// record -> submit -> present, with swapchain recreation on resize or
// out-of-date results. The compute kernel writes a storage image; each
// frame that image is copied into the acquired swapchain image under a
// pair of barrier pairs that hand ownership present -> compute ->
// present.
//
// FRAME TIMELINE:
// ┌──────────────────────────────────────────────────────────────────────┐
// │ wait_fence ─> acquire ─> record ─> submit(compute) ─> present        │
// │   (CPU gate)  (semaphore) (CPU)     (GPU, signals      (waits GPU    │
// │                                      fence+semaphore)   semaphore)   │
// └──────────────────────────────────────────────────────────────────────┘
//
// Exactly one frame is ever in flight - the single fence is the whole
// pipelining story, by design.

use anyhow::{Context, Result};
use ash::vk;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::backend::commands::{self, DeferredCommand};
use crate::backend::descriptor::{
    PushConstantRegion, ShaderBinding, SharedBytes, StorageRegistration, COMPUTE_IMAGE_BINDING,
};
use crate::backend::buffer::ManagedBuffer;
use crate::backend::image::{color_subresource_range, ManagedImage};
use crate::backend::pipeline::ComputePipeline;
use crate::backend::swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
use crate::backend::sync::FrameSync;
use crate::backend::DeviceContext;

/// The capability surface callers depend on. Registration happens before
/// `post_initialize`; `render` advances one frame and may recreate the
/// swapchain internally.
pub trait Renderer {
    fn register_buffer(&mut self, binding: u32, payload: SharedBytes) -> Result<()>;
    fn register_uniform(&mut self, binding: u32, payload: SharedBytes) -> Result<()>;
    /// At most one region; `None` disables push constants entirely for
    /// the next build (no layout range, no per-frame push).
    fn set_push_constants(&mut self, offset: u32, payload: Option<SharedBytes>);
    /// Queue a command replayed into the command buffer each frame,
    /// ahead of the barrier/copy/dispatch sequence.
    fn push_deferred_command(&mut self, command: DeferredCommand);
    fn post_initialize(&mut self) -> Result<()>;
    fn render(&mut self) -> Result<()>;
    fn resize(&mut self, extent: vk::Extent2D);
    fn cleanup(&mut self);
    /// Frames presented during the last whole wall-clock second.
    fn frames_per_second(&self) -> u32;
}

/// Rolls presented-frame counts into a once-per-second FPS figure.
pub struct FpsCounter {
    frames_this_second: u32,
    observed: u32,
    last_rollup: Instant,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            frames_this_second: 0,
            observed: 0,
            last_rollup: now,
        }
    }

    /// Count one frame; returns the new figure when a second has rolled
    /// over.
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        self.frames_this_second += 1;
        if now.duration_since(self.last_rollup) >= Duration::from_secs(1) {
            self.observed = self.frames_this_second;
            self.frames_this_second = 0;
            self.last_rollup = now;
            Some(self.observed)
        } else {
            None
        }
    }

    pub fn observed(&self) -> u32 {
        self.observed
    }
}

/// Append a registration after checking the binding index is free and
/// not the reserved compute-image slot, and the payload is non-empty.
fn push_registration(
    registrations: &mut Vec<StorageRegistration>,
    binding: u32,
    descriptor_type: vk::DescriptorType,
    usage: vk::BufferUsageFlags,
    payload: SharedBytes,
) -> Result<()> {
    if binding == COMPUTE_IMAGE_BINDING {
        anyhow::bail!(
            "Binding {} is reserved for the compute-output image",
            COMPUTE_IMAGE_BINDING
        );
    }
    if registrations.iter().any(|r| r.binding.index == binding) {
        anyhow::bail!("Binding {} is already registered", binding);
    }
    let size = payload.read().len();
    if size == 0 {
        anyhow::bail!("Registration for binding {} has an empty payload", binding);
    }

    registrations.push(StorageRegistration {
        binding: ShaderBinding {
            index: binding,
            descriptor_type,
            stage_flags: vk::ShaderStageFlags::COMPUTE,
        },
        usage,
        payload,
        size,
        buffer: None,
    });
    Ok(())
}

/// The compute-backed implementation of [`Renderer`].
///
/// Field order matters: `ctx` sits last so every GPU object above it is
/// gone (via `cleanup`) before the device context tears down.
pub struct VulkanRenderer {
    registrations: Vec<StorageRegistration>,
    push_constants: Option<PushConstantRegion>,
    deferred_commands: Vec<DeferredCommand>,

    swapchain: Option<Swapchain>,
    compute_image: Option<ManagedImage>,
    pipeline: Option<ComputePipeline>,
    /// Survives swapchain recreation so pipeline rebuilds hit the cache.
    pipeline_cache: vk::PipelineCache,
    sync: Option<FrameSync>,

    kernel_path: PathBuf,
    preferred_present_mode: vk::PresentModeKHR,
    window_extent: vk::Extent2D,
    pending_resize: bool,
    kernel_dirty: bool,

    fps: FpsCounter,

    ctx: DeviceContext,
}

impl VulkanRenderer {
    pub fn new(
        ctx: DeviceContext,
        extent: vk::Extent2D,
        kernel_path: PathBuf,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let cache_info = vk::PipelineCacheCreateInfo::builder();
        let pipeline_cache = unsafe {
            ctx.device
                .create_pipeline_cache(&cache_info, None)
                .context("Failed to create pipeline cache")?
        };

        Ok(Self {
            registrations: Vec::new(),
            push_constants: None,
            deferred_commands: Vec::new(),
            swapchain: None,
            compute_image: None,
            pipeline: None,
            pipeline_cache,
            sync: None,
            kernel_path,
            preferred_present_mode,
            window_extent: extent,
            pending_resize: false,
            kernel_dirty: false,
            fps: FpsCounter::new(Instant::now()),
            ctx,
        })
    }

    /// Flag the kernel source as changed; the pipeline is rebuilt at the
    /// next inter-frame boundary.
    pub fn request_kernel_reload(&mut self) {
        self.kernel_dirty = true;
    }

    // =========================================================================
    // BUILD
    // =========================================================================

    fn create_compute_image(&mut self) -> Result<()> {
        let swapchain = self
            .swapchain
            .as_ref()
            .context("Swapchain not initialized")?;

        self.compute_image = Some(ManagedImage::new(
            &self.ctx,
            swapchain.format,
            swapchain.extent,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            self.ctx.compute_queue.family,
            "compute-output",
        )?);
        Ok(())
    }

    /// Allocate one mapped buffer per registration (and the push-constant
    /// backing buffer) and copy initial contents in. Runs once; the
    /// buffers survive swapchain recreation.
    fn prepare_storage_buffers(&mut self) -> Result<()> {
        if let Some(region) = self.push_constants.as_mut() {
            if region.buffer.is_none() {
                let mut buffer = ManagedBuffer::new(
                    &self.ctx,
                    region.size as vk::DeviceSize,
                    vk::BufferUsageFlags::STORAGE_BUFFER,
                    "push-constants",
                )?;
                buffer.write(&region.payload.read())?;
                region.buffer = Some(buffer);
            }
        }

        for registration in &mut self.registrations {
            if registration.buffer.is_some() {
                continue;
            }
            let label = format!("binding-{}", registration.binding.index);
            let mut buffer = ManagedBuffer::new(
                &self.ctx,
                registration.size as vk::DeviceSize,
                registration.usage,
                &label,
            )?;
            buffer.write(&registration.payload.read())?;
            registration.buffer = Some(buffer);
        }
        Ok(())
    }

    fn build_pipeline(&mut self) -> Result<()> {
        let compute_image = self
            .compute_image
            .as_ref()
            .context("Compute image not initialized")?;

        self.pipeline = Some(ComputePipeline::build(
            &self.ctx,
            self.pipeline_cache,
            &self.registrations,
            self.push_constants.as_ref(),
            compute_image.views[0],
            &self.kernel_path,
        )?);
        Ok(())
    }

    // =========================================================================
    // RECREATION
    // =========================================================================

    /// Full swapchain recreation: drain the device, release everything
    /// that references the old chain (reverse creation order), then
    /// rebuild. The registry's buffers and the sync objects are reused
    /// untouched.
    fn recreate_swapchain(&mut self) -> Result<()> {
        log::info!(
            "Recreating swapchain: {}x{}",
            self.window_extent.width,
            self.window_extent.height
        );

        self.ctx.wait_idle()?;

        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.destroy(&self.ctx);
        }
        if let Some(mut image) = self.compute_image.take() {
            image.destroy(&self.ctx);
        }

        let mut old = self
            .swapchain
            .take()
            .context("Swapchain recreation before creation")?;
        old.destroy_views(&self.ctx);

        // The retired handle seeds the new chain, then dies either way
        let created = Swapchain::new(
            &self.ctx,
            self.window_extent,
            self.preferred_present_mode,
            old.handle,
        );
        old.destroy(&self.ctx);
        self.swapchain = Some(created?);

        self.create_compute_image()?;
        self.build_pipeline()?;
        Ok(())
    }

    /// Shader-only rebuild for hot reload: same layout, descriptors and
    /// cache; a failed compile keeps the previous pipeline running.
    fn reload_pipeline(&mut self) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("Skipping kernel reload, device not idle: {:#}", e);
            return;
        }
        match pipeline.rebuild_shader(&self.ctx, self.pipeline_cache, &self.kernel_path) {
            Ok(()) => log::info!("Reloaded compute kernel {}", self.kernel_path.display()),
            Err(e) => log::error!("Kernel reload failed, keeping previous pipeline: {:#}", e),
        }
    }

    // =========================================================================
    // PER-FRAME
    // =========================================================================

    /// Copy every registered payload into its mapped buffer. The memory
    /// is host-coherent, so no flush and no GPU stall.
    fn upload_frame_data(&mut self) -> Result<()> {
        if let Some(region) = self.push_constants.as_mut() {
            if let Some(buffer) = region.buffer.as_mut() {
                buffer.write(&region.payload.read())?;
            }
        }
        for registration in &mut self.registrations {
            if let Some(buffer) = registration.buffer.as_mut() {
                buffer.write(&registration.payload.read())?;
            }
        }
        Ok(())
    }

    /// Re-record the compute queue's single command buffer for the
    /// acquired image: deferred commands, barrier pair out, copy,
    /// barrier pair back, dispatch.
    fn record_frame(&mut self) -> Result<()> {
        let device = &self.ctx.device;
        let cmd = self.ctx.compute_queue.command_buffers[0];
        let compute_family = self.ctx.compute_queue.family;
        let present_family = self.ctx.present_queue.family;

        let registrations = &self.registrations;
        let swapchain = self.swapchain.as_mut().context("Swapchain missing")?;
        let compute_image = self.compute_image.as_mut().context("Compute image missing")?;
        let pipeline = self.pipeline.as_ref().context("Pipeline missing")?;

        let range = color_subresource_range();
        let frame = swapchain.current_frame as usize;
        let swap_image = swapchain.images[frame];
        let swap_cursor = &mut swapchain.cursors[frame];

        // The presentation engine returns the image with undefined
        // contents; re-seed its cursor as present-family-owned.
        swap_cursor.reset(
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::MEMORY_READ,
            present_family,
        );

        let resolved = commands::resolve(&self.deferred_commands, |binding| {
            registrations
                .iter()
                .find(|r| r.binding.index == binding)
                .and_then(|r| r.buffer.as_ref())
                .map(|b| b.handle)
        })?;

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder();
            device.begin_command_buffer(cmd, &begin_info)?;

            commands::record(device, cmd, &resolved);

            // First pair: compute image becomes the copy source, the
            // swapchain image becomes the copy destination and moves to
            // the compute family.
            let first_pair = [
                compute_image.cursor.transition(
                    compute_image.handle,
                    range,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::TRANSFER_READ,
                    None,
                ),
                swap_cursor.transition(
                    swap_image,
                    range,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                    Some(compute_family),
                ),
            ];
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &first_pair,
            );

            let layers = vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            };
            let copy = vk::ImageCopy {
                src_subresource: layers,
                src_offset: vk::Offset3D::default(),
                dst_subresource: layers,
                dst_offset: vk::Offset3D::default(),
                extent: vk::Extent3D {
                    width: swapchain.extent.width,
                    height: swapchain.extent.height,
                    depth: 1,
                },
            };
            device.cmd_copy_image(
                cmd,
                compute_image.handle,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                swap_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );

            // Second pair reverses both: compute image back to GENERAL
            // for the dispatch below, swapchain image to present layout
            // and back to the present family.
            let second_pair = [
                compute_image.cursor.transition(
                    compute_image.handle,
                    range,
                    vk::ImageLayout::GENERAL,
                    vk::AccessFlags::empty(),
                    None,
                ),
                swap_cursor.transition(
                    swap_image,
                    range,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::AccessFlags::MEMORY_READ,
                    Some(present_family),
                ),
            ];
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &second_pair,
            );

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.handle);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                &[pipeline.descriptor_set],
                &[],
            );
            if let Some(region) = &self.push_constants {
                let data = region.payload.read();
                device.cmd_push_constants(
                    cmd,
                    pipeline.layout,
                    region.stage_flags,
                    region.offset,
                    &data,
                );
            }
            let [x, y, z] = swapchain.dispatch_grid;
            device.cmd_dispatch(cmd, x, y, z);

            device.end_command_buffer(cmd)?;
        }

        Ok(())
    }
}

impl Renderer for VulkanRenderer {
    fn register_buffer(&mut self, binding: u32, payload: SharedBytes) -> Result<()> {
        push_registration(
            &mut self.registrations,
            binding,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            payload,
        )
    }

    fn register_uniform(&mut self, binding: u32, payload: SharedBytes) -> Result<()> {
        push_registration(
            &mut self.registrations,
            binding,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER,
            payload,
        )
    }

    fn set_push_constants(&mut self, offset: u32, payload: Option<SharedBytes>) {
        self.push_constants = payload.map(|payload| {
            let size = payload.read().len() as u32;
            PushConstantRegion {
                offset,
                size,
                stage_flags: vk::ShaderStageFlags::COMPUTE,
                payload,
                buffer: None,
            }
        });
    }

    fn push_deferred_command(&mut self, command: DeferredCommand) {
        self.deferred_commands.push(command);
    }

    /// Build everything registration-dependent. Any failure here is
    /// fatal to startup.
    fn post_initialize(&mut self) -> Result<()> {
        self.swapchain = Some(Swapchain::new(
            &self.ctx,
            self.window_extent,
            self.preferred_present_mode,
            vk::SwapchainKHR::null(),
        )?);
        self.create_compute_image()?;
        self.prepare_storage_buffers()?;
        self.build_pipeline()?;
        self.sync = Some(FrameSync::new(&self.ctx)?);

        log::info!("Renderer initialized");
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        // Minimized: nothing to present
        if self.window_extent.width == 0 || self.window_extent.height == 0 {
            return Ok(());
        }

        // A deferred resize is applied transactionally before anything
        // else touches the chain.
        if self.pending_resize {
            self.pending_resize = false;
            self.recreate_swapchain()?;
        }
        if self.kernel_dirty {
            self.kernel_dirty = false;
            self.reload_pipeline();
        }

        let sync = self.sync.as_ref().context("render() before post_initialize()")?;
        let image_acquired = sync.image_acquired;
        let render_finished = sync.render_finished;
        let in_flight = sync.in_flight;

        // Previous frame's command buffer must be out of use before we
        // re-record it.
        sync.wait_previous_frame(&self.ctx)?;

        let acquire = self
            .swapchain
            .as_mut()
            .context("Swapchain missing")?
            .acquire(image_acquired)?;
        match acquire {
            AcquireOutcome::OutOfDate => {
                // The acquired index is invalid; abandon this tick
                self.recreate_swapchain()?;
                return Ok(());
            }
            AcquireOutcome::Acquired { suboptimal } => {
                if suboptimal {
                    self.pending_resize = true;
                }
            }
        }

        // Record step: fresh payloads into mapped memory (host-coherent,
        // no stall), then the command buffer
        self.upload_frame_data()?;
        self.record_frame()?;

        let sync = self.sync.as_ref().context("Sync objects missing")?;
        sync.reset(&self.ctx)?;

        let wait_semaphores = [image_acquired];
        let wait_stages = [vk::PipelineStageFlags::TOP_OF_PIPE];
        let command_buffers = [self.ctx.compute_queue.command_buffers[0]];
        let signal_semaphores = [render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.ctx
                .device
                .queue_submit(
                    self.ctx.compute_queue.handle,
                    &[submit_info.build()],
                    in_flight,
                )
                .context("Failed to submit compute command buffer")?;
        }

        let outcome = self
            .swapchain
            .as_ref()
            .context("Swapchain missing")?
            .present(self.ctx.present_queue.handle, &[render_finished])?;
        match outcome {
            PresentOutcome::OutOfDate => self.pending_resize = true,
            PresentOutcome::Presented { suboptimal } => {
                if suboptimal {
                    self.pending_resize = true;
                }
            }
        }

        self.fps.tick(Instant::now());

        if self.pending_resize {
            self.pending_resize = false;
            self.recreate_swapchain()?;
        }

        Ok(())
    }

    fn resize(&mut self, extent: vk::Extent2D) {
        self.window_extent = extent;
        if extent.width > 0 && extent.height > 0 {
            self.pending_resize = true;
        }
    }

    /// Idle-wait, then release every GPU object in dependency-reverse
    /// order. Safe to call more than once; `Drop` routes here too.
    fn cleanup(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("Device idle wait failed during cleanup: {:#}", e);
        }

        if let Some(sync) = self.sync.take() {
            sync.destroy(&self.ctx.device);
        }
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.destroy(&self.ctx);
        }
        if self.pipeline_cache != vk::PipelineCache::null() {
            unsafe {
                self.ctx
                    .device
                    .destroy_pipeline_cache(self.pipeline_cache, None);
            }
            self.pipeline_cache = vk::PipelineCache::null();
        }
        if let Some(mut image) = self.compute_image.take() {
            image.destroy(&self.ctx);
        }
        if let Some(region) = self.push_constants.as_mut() {
            if let Some(mut buffer) = region.buffer.take() {
                buffer.destroy(&self.ctx);
            }
        }
        for registration in &mut self.registrations {
            if let Some(mut buffer) = registration.buffer.take() {
                buffer.destroy(&self.ctx);
            }
        }
        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy(&self.ctx);
        }
    }

    fn frames_per_second(&self) -> u32 {
        self.fps.observed()
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::descriptor::shared_bytes;

    fn storage(registrations: &mut Vec<StorageRegistration>, binding: u32, len: usize) -> Result<()> {
        push_registration(
            registrations,
            binding,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            shared_bytes(vec![0; len]),
        )
    }

    #[test]
    fn registration_order_is_preserved() {
        let mut registrations = Vec::new();
        storage(&mut registrations, 3, 16).unwrap();
        storage(&mut registrations, 1, 64).unwrap();
        storage(&mut registrations, 2, 32).unwrap();

        let order: Vec<u32> = registrations.iter().map(|r| r.binding.index).collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert_eq!(registrations[1].size, 64);
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let mut registrations = Vec::new();
        storage(&mut registrations, 1, 16).unwrap();
        assert!(storage(&mut registrations, 1, 16).is_err());
        assert_eq!(registrations.len(), 1);
    }

    #[test]
    fn reserved_image_binding_is_rejected() {
        let mut registrations = Vec::new();
        assert!(storage(&mut registrations, COMPUTE_IMAGE_BINDING, 16).is_err());
    }

    #[test]
    fn empty_payload_is_rejected() {
        let mut registrations = Vec::new();
        assert!(storage(&mut registrations, 1, 0).is_err());
    }

    #[test]
    fn uniforms_register_with_uniform_descriptor_type() {
        let mut registrations = Vec::new();
        push_registration(
            &mut registrations,
            2,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER,
            shared_bytes(vec![0; 16]),
        )
        .unwrap();

        assert_eq!(
            registrations[0].binding.descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert!(registrations[0]
            .usage
            .contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
    }

    #[test]
    fn fps_counter_rolls_up_once_per_second() {
        let start = Instant::now();
        let mut fps = FpsCounter::new(start);

        assert_eq!(fps.tick(start + Duration::from_millis(400)), None);
        assert_eq!(fps.tick(start + Duration::from_millis(800)), None);
        // Third frame lands past the second boundary: three frames
        // counted into this rollup window
        assert_eq!(fps.tick(start + Duration::from_millis(1100)), Some(3));
        assert_eq!(fps.observed(), 3);

        assert_eq!(fps.tick(start + Duration::from_millis(1500)), None);
        assert_eq!(fps.observed(), 3);
    }
}
