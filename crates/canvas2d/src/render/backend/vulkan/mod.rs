//! Vulkan backend
//!
//! Bring-up ([`context`]), the device and its allocator ([`device`]), and the
//! per-frame presentation machinery the rendering instance drives.

pub mod commands;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod render_pass;
pub mod swapchain;
pub mod sync;

pub use commands::{CommandPool, FrameCommands};
pub use context::{LogicalDevice, PhysicalDeviceInfo, VulkanInstance};
pub use descriptor::{DescriptorAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder, SetArena, SetWriter};
pub use device::VulkanDevice;
pub use render_pass::RenderPass;
pub use swapchain::Swapchain;
pub use sync::{Fence, Semaphore};
