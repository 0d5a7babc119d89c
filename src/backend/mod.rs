// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper keeps an `Arc<VulkanDevice>`,
// so the device and instance outlive whatever was created from them.

pub mod buffer;
pub mod commands;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{Buffer, DepthImage};
pub use commands::CommandPool;
pub use device::VulkanDevice;
pub use pipeline::{Pipeline, PipelineDesc};
pub use surface::Surface;
pub use swapchain::{Acquired, Swapchain};
pub use sync::FrameSync;
