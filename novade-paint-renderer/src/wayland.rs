use ash::extensions::khr;
use ash::vk;
use std::ffi::{c_void, CStr};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::context::SurfaceProvider;
use crate::error::{RendererError, Result};

/// Creates a Vulkan surface for a Wayland `wl_surface`.
///
/// The provider does not own the display or surface; the window system
/// must keep both alive for as long as the renderer exists. The
/// framebuffer size is whatever the window system last reported through
/// [`WaylandSurfaceProvider::set_framebuffer_size`].
pub struct WaylandSurfaceProvider {
    display: *mut c_void,
    surface: *mut c_void,
    size: AtomicU64,
}

impl WaylandSurfaceProvider {
    /// # Safety
    /// `display` and `surface` must be valid `wl_display` and `wl_surface`
    /// pointers that outlive the provider and every renderer built from it.
    pub unsafe fn new(display: *mut c_void, surface: *mut c_void, width: u32, height: u32) -> Self {
        Self {
            display,
            surface,
            size: AtomicU64::new(pack(width, height)),
        }
    }

    /// Records a new framebuffer size in physical pixels (logical size
    /// times the buffer scale).
    pub fn set_framebuffer_size(&self, width: u32, height: u32) {
        self.size.store(pack(width, height), Ordering::Relaxed);
    }
}

fn pack(width: u32, height: u32) -> u64 {
    (u64::from(width) << 32) | u64::from(height)
}

fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

impl SurfaceProvider for WaylandSurfaceProvider {
    fn required_instance_extensions(&self) -> Vec<&'static CStr> {
        vec![khr::Surface::name(), khr::WaylandSurface::name()]
    }

    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<vk::SurfaceKHR> {
        if self.display.is_null() || self.surface.is_null() {
            return Err(RendererError::Surface(
                "Wayland display or surface pointer is null".into(),
            ));
        }
        let loader = khr::WaylandSurface::new(entry, instance);
        let info = vk::WaylandSurfaceCreateInfoKHR::builder()
            .display(self.display)
            .surface(self.surface);
        let surface = unsafe { loader.create_wayland_surface(&info, None)? };
        info!("Wayland surface created.");
        Ok(surface)
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        unpack(self.size.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framebuffer_size_round_trips_through_updates() {
        let provider = unsafe {
            WaylandSurfaceProvider::new(std::ptr::null_mut(), std::ptr::null_mut(), 800, 600)
        };
        assert_eq!(provider.framebuffer_size(), (800, 600));
        provider.set_framebuffer_size(2560, 1440);
        assert_eq!(provider.framebuffer_size(), (2560, 1440));
        assert_eq!(
            provider.required_instance_extensions(),
            vec![khr::Surface::name(), khr::WaylandSurface::name()]
        );
    }
}
