// Window surface
//
// ash-window turns the raw-window-handle 0.6 handles from winit into a
// `VkSurfaceKHR` and names the instance extensions each platform needs.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::c_char;
use std::sync::Arc;

use super::VulkanDevice;

/// Instance extensions needed to create a surface on `display`
pub fn required_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
    let mut extensions = ash_window::enumerate_required_extensions(display)
        .context("Unsupported windowing system")?
        .to_vec();

    // MoltenVK is only listed when portability devices are enumerated
    if cfg!(any(target_os = "macos", target_os = "ios")) {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
    }

    Ok(extensions)
}

/// RAII `VkSurfaceKHR`, destroyed before the instance
pub struct Surface {
    pub surface: vk::SurfaceKHR,
    pub loader: ash::khr::surface::Instance,
    device: Arc<VulkanDevice>,
}

impl Surface {
    pub fn new(
        device: &Arc<VulkanDevice>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let surface = unsafe {
            ash_window::create_surface(&device.entry, &device.instance, display, window, None)
        }
        .context("Failed to create window surface")?;
        let loader = ash::khr::surface::Instance::new(&device.entry, &device.instance);

        let supported = unsafe {
            loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        };

        // Wrap first so the surface is destroyed on the error paths below
        let surface = Self {
            surface,
            loader,
            device: Arc::clone(device),
        };

        if !supported.context("Failed to query surface support")? {
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        Ok(surface)
    }

    pub fn capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        let caps = unsafe {
            self.loader
                .get_physical_device_surface_capabilities(self.device.physical_device, self.surface)
        }?;
        Ok(caps)
    }

    pub fn formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        let formats = unsafe {
            self.loader
                .get_physical_device_surface_formats(self.device.physical_device, self.surface)
        }?;
        Ok(formats)
    }

    pub fn present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        let modes = unsafe {
            self.loader
                .get_physical_device_surface_present_modes(self.device.physical_device, self.surface)
        }?;
        Ok(modes)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{WaylandDisplayHandle, WindowsDisplayHandle};
    use std::ffi::CStr;
    use std::ptr::NonNull;

    fn names(extensions: &[*const c_char]) -> Vec<&'static CStr> {
        extensions
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect()
    }

    #[test]
    fn extensions_follow_the_display() {
        let windows =
            names(&required_extensions(RawDisplayHandle::Windows(WindowsDisplayHandle::new())).unwrap());
        assert_eq!(windows[..2], [ash::khr::surface::NAME, ash::khr::win32_surface::NAME]);

        let mut dummy = 0u8;
        let display = NonNull::from(&mut dummy).cast();
        let wayland = names(
            &required_extensions(RawDisplayHandle::Wayland(WaylandDisplayHandle::new(display))).unwrap(),
        );
        assert!(wayland.contains(&ash::khr::surface::NAME));
        assert!(wayland.contains(&ash::khr::wayland_surface::NAME));
    }

    #[test]
    fn portability_enumeration_only_on_apple() {
        let windows =
            names(&required_extensions(RawDisplayHandle::Windows(WindowsDisplayHandle::new())).unwrap());
        let apple = cfg!(any(target_os = "macos", target_os = "ios"));
        assert_eq!(windows.contains(&ash::khr::portability_enumeration::NAME), apple);
    }
}
