//! Swapchain and framebuffers
//!
//! The swapchain is recreated whenever acquire or present reports it out of
//! date or suboptimal. Recreation passes the old handle so the driver can
//! reuse its images.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

use super::device::VulkanDevice;
use super::sync::color_subresource_range;
use crate::render::error::{RenderError, RenderResult};

/// Vulkan swapchain with its image views and framebuffers
pub struct Swapchain {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain sized for `window_extent`
    ///
    /// `old_swapchain` may be null. Framebuffers are created separately by
    /// [`Swapchain::create_framebuffers`] once the render pass exists.
    pub fn new(
        device: &VulkanDevice,
        window_extent: vk::Extent2D,
        vsync: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> RenderResult<Self> {
        let physical = device.physical().device;
        let surface = device.surface();
        let surface_loader = device.surface_loader();

        let surface_caps = unsafe { surface_loader.get_physical_device_surface_capabilities(physical, surface) }
            .map_err(RenderError::Vulkan)?;
        let surface_formats = unsafe { surface_loader.get_physical_device_surface_formats(physical, surface) }
            .map_err(RenderError::Vulkan)?;
        let present_modes = unsafe { surface_loader.get_physical_device_surface_present_modes(physical, surface) }
            .map_err(RenderError::Vulkan)?;

        let format = choose_surface_format(&surface_formats)
            .ok_or_else(|| RenderError::DeviceInitFailure("Surface reports no formats".to_string()))?;
        let present_mode = choose_present_mode(&present_modes, vsync);
        let extent = choose_extent(&surface_caps, window_extent);

        let image_count = if surface_caps.max_image_count > 0 {
            (surface_caps.min_image_count + 1).min(surface_caps.max_image_count)
        } else {
            surface_caps.min_image_count + 1
        };

        let physical_info = device.physical();
        let queue_families = [physical_info.graphics_family, physical_info.present_family];
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);
        let create_info = if queue_families[0] == queue_families[1] {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        };

        let loader = device.swapchain_loader().clone();
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }.map_err(RenderError::Vulkan)?;

        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(RenderError::Vulkan(e));
            }
        };

        let mut result = Self {
            device: device.device().clone(),
            loader,
            swapchain,
            image_views: Vec::with_capacity(images.len()),
            framebuffers: Vec::new(),
            format,
            extent,
        };

        for image in images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(color_subresource_range());
            let view =
                unsafe { result.device.create_image_view(&create_info, None) }.map_err(RenderError::Vulkan)?;
            result.image_views.push(view);
        }

        log::debug!(
            "Created swapchain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            result.image_views.len(),
            format.format,
            present_mode
        );
        Ok(result)
    }

    /// Create one framebuffer per swapchain image for `render_pass`
    ///
    /// `msaa_view`, when present, is attached first as the multisampled
    /// target and the swapchain image becomes the resolve attachment.
    pub fn create_framebuffers(
        &mut self,
        render_pass: vk::RenderPass,
        msaa_view: Option<vk::ImageView>,
    ) -> RenderResult<()> {
        self.destroy_framebuffers();
        for &view in &self.image_views {
            let attachments: Vec<vk::ImageView> = match msaa_view {
                Some(msaa) => vec![msaa, view],
                None => vec![view],
            };
            let create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer =
                unsafe { self.device.create_framebuffer(&create_info, None) }.map_err(RenderError::Vulkan)?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { self.device.destroy_framebuffer(framebuffer, None) };
        }
    }

    /// Acquire the next image, signalling `semaphore`
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    pub fn acquire(&self, semaphore: vk::Semaphore, timeout_ns: u64) -> Result<(u32, bool), vk::Result> {
        unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
        }
    }

    /// Pixel extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Surface format
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Framebuffer for swapchain image `index`
    pub fn framebuffer(&self, index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(index as usize).copied()
    }

    /// Number of swapchain images
    pub fn image_count(&self) -> usize {
        self.image_views.len()
    }

    /// Native handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Prefer sRGB BGRA, else whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|sf| sf.format == vk::Format::B8G8R8A8_SRGB && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// FIFO under vsync, otherwise MAILBOX then IMMEDIATE when available
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Use the surface's extent when fixed, else clamp the window size into range
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window_extent
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window_extent
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_srgb_format() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]), Some(srgb));
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_present_mode_follows_vsync() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_extent_clamped_when_surface_undefined() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let extent = choose_extent(&caps, vk::Extent2D {
            width: 4000,
            height: 300,
        });
        assert_eq!(extent, vk::Extent2D {
            width: 1024,
            height: 300
        });
    }
}
