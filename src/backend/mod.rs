// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Performance: Zero-cost abstractions, explicit control

pub mod buffer;
pub mod commands;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::DeviceContext;
pub use swapchain::Swapchain;
