// =============================================================================
// VULKAN COMPUTE RAY TRACER
// =============================================================================
//
// A compute kernel ray-traces the scene into a storage image; the
// presentation engine copies that image into the swapchain every frame
// under a queue-family ownership-transfer barrier protocol.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (window, input, event pump)                          │
// │    └── VulkanRenderer (frame sync + command recording)          │
// │          └── Swapchain + compute image + pipeline               │
// │                └── DeviceContext (instance, device, queues)     │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Apply pending resize / kernel reload
// 2. Wait for the previous frame's fence
// 3. Acquire swapchain image
// 4. Re-record: barriers, image copy, compute dispatch
// 5. Submit to the compute queue, present on the present queue
//
// =============================================================================

mod backend;
mod config;
mod renderer;
mod scene;
mod shader_watch;

use anyhow::{Context, Result};
use ash::vk;
use backend::descriptor::{shared_bytes, SharedBytes};
use backend::sync::DeviceLost;
use backend::DeviceContext;
use config::Config;
use glam::Vec3;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use renderer::{Renderer, VulkanRenderer};
use scene::{Camera, Scene};
use shader_watch::ShaderWatcher;
use std::path::PathBuf;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging();
    log::info!("Starting vulkan raytracer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);
    log::info!("Kernel: {}", config.graphics.kernel);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Event-loop side of the program: owns the window, the renderer and the
/// camera payload shared with it.
pub struct App {
    config: Config,

    // Renderer before window: its surface must die first
    renderer: Option<VulkanRenderer>,
    shader_watcher: Option<ShaderWatcher>,

    camera: Camera,
    camera_payload: SharedBytes,

    yaw: f32,
    pitch: f32,

    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    last_fps_shown: u32,
}

/// Degrees of camera rotation per pixel of mouse motion.
const MOUSE_SENSITIVITY: f32 = 0.1;

impl App {
    pub fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let aspect = config.window.width as f32 / config.window.height as f32;

        let mut camera = Camera::new(Vec3::new(0.0, 2.0, 5.0), aspect, 2.2);
        camera.look_at(Vec3::new(0.0, 0.0, -1.0));

        Self {
            config,
            renderer: None,
            shader_watcher: None,
            camera,
            camera_payload: shared_bytes(Vec::new()),
            yaw: -90.0,
            pitch: 0.0,
            window: None,
            is_fullscreen,
            last_fps_shown: 0,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Build the device context, register the scene and bring up the
    /// presentation engine. Any failure here aborts startup.
    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let ctx = DeviceContext::initialize(
            window.raw_display_handle(),
            window.raw_window_handle(),
            &self.config.window.title,
            enable_validation,
        )?;

        let kernel_path = PathBuf::from(&self.config.graphics.kernel);
        let mut renderer = VulkanRenderer::new(
            ctx,
            extent,
            kernel_path.clone(),
            self.config.get_present_mode(),
        )?;

        // Scene registration: camera as push constants, geometry and
        // lights as storage buffers. Binding 0 belongs to the engine.
        let scene = Scene::demo();
        self.camera.aspect_ratio = extent.width as f32 / extent.height as f32;
        *self.camera_payload.write() = bytemuck::bytes_of(&self.camera).to_vec();

        renderer.set_push_constants(0, Some(self.camera_payload.clone()));
        renderer
            .register_buffer(1, shared_bytes(bytemuck::cast_slice(&scene.spheres).to_vec()))
            .context("Failed to register sphere buffer")?;
        renderer
            .register_buffer(2, shared_bytes(bytemuck::cast_slice(&scene.planes).to_vec()))
            .context("Failed to register plane buffer")?;
        renderer
            .register_buffer(
                3,
                shared_bytes(bytemuck::cast_slice(&scene.spot_lights).to_vec()),
            )
            .context("Failed to register spot light buffer")?;
        renderer
            .register_buffer(
                4,
                shared_bytes(bytemuck::cast_slice(&scene.direct_lights).to_vec()),
            )
            .context("Failed to register directional light buffer")?;

        renderer.post_initialize()?;

        // Hot reload is best-effort; a dead watcher only costs the feature
        self.shader_watcher = match ShaderWatcher::new(&kernel_path) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                log::warn!("Kernel hot reload disabled: {:#}", e);
                None
            }
        };

        self.renderer = Some(renderer);
        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // PER-FRAME
    // =========================================================================

    fn tick(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(watcher) = &self.shader_watcher {
            if watcher.changed() {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.request_kernel_reload();
                }
            }
        }

        // Advance the camera payload the kernel reads this frame
        if let Some(window) = &self.window {
            let size = window.inner_size();
            if size.height > 0 {
                self.camera.aspect_ratio = size.width as f32 / size.height as f32;
            }
        }
        self.camera.time += 0.01;
        if self.camera.time > 1.0 {
            self.camera.time = 0.0;
        }
        *self.camera_payload.write() = bytemuck::bytes_of(&self.camera).to_vec();

        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        if let Err(e) = renderer.render() {
            if e.is::<DeviceLost>() {
                log::error!("{:#}", e);
                event_loop.exit();
                return;
            }
            log::error!("Render error: {:#}", e);
        }

        self.update_title();
    }

    fn update_title(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some(renderer) = &self.renderer else {
            return;
        };

        let fps = renderer.frames_per_second();
        if fps != self.last_fps_shown {
            self.last_fps_shown = fps;
            if let Some(window) = &self.window {
                let mode = if self.is_fullscreen {
                    "fullscreen"
                } else {
                    "windowed"
                };
                window.set_title(&format!(
                    "{} | {} fps [{}]",
                    self.config.window.title, fps, mode
                ));
            }
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(window) = &self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.cleanup();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    // Zero extent parks the renderer until restored
                    renderer.resize(vk::Extent2D {
                        width: size.width,
                        height: size.height,
                    });
                }
            }

            WindowEvent::RedrawRequested => {
                self.tick(event_loop);
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => {
                                self.toggle_fullscreen();
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _device_id: winit::event::DeviceId,
        event: winit::event::DeviceEvent,
    ) {
        if let winit::event::DeviceEvent::MouseMotion { delta } = event {
            self.yaw += delta.0 as f32 * MOUSE_SENSITIVITY;
            self.pitch = (self.pitch - delta.1 as f32 * MOUSE_SENSITIVITY).clamp(-89.0, 89.0);
            self.camera.update_direction(self.yaw, self.pitch);
        }
    }

    /// Request continuous redraws for an uncapped frame rate.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}
