use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::allocator::{Image, ImageDesc, ResourceAllocator};
use crate::context::DeviceContext;
use crate::error::{RendererError, Result};
use crate::frame::{AcquireOutcome, PresentOutcome, RecreateOutcome};

/// Prefers 8-bit sRGB BGRA in the sRGB non-linear colour space, otherwise
/// the first format the surface offers.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// Mailbox when available, FIFO otherwise. FIFO is always supported.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    modes
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's fixed extent if it reports one, otherwise the framebuffer
/// pixel size clamped to the supported range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer: (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    let (width, height) = framebuffer;
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// First candidate the device can use as an optimal-tiling depth attachment.
pub fn pick_depth_format(
    candidates: &[vk::Format],
    supports: impl Fn(vk::Format) -> bool,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| supports(format))
}

const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Ready,
    Stale,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainEvent {
    Created,
    Invalidated,
    Destroyed,
}

impl SwapchainState {
    /// Next state, or `None` if `event` cannot happen in this state.
    pub fn on(self, event: SwapchainEvent) -> Option<Self> {
        use SwapchainEvent as E;
        use SwapchainState as S;
        match (self, event) {
            (S::Uninitialized | S::Ready | S::Stale, E::Created) => Some(S::Ready),
            (S::Ready | S::Stale, E::Invalidated) => Some(S::Stale),
            (S::Uninitialized | S::Ready | S::Stale, E::Destroyed) => Some(S::Destroyed),
            _ => None,
        }
    }
}

/// Swap-dependent attachments: the presentable images plus the depth
/// buffer and optional multisample colour target that match them.
struct SwapResources {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth: Image,
    color: Option<Image>,
}

pub struct SwapchainManager {
    context: Arc<DeviceContext>,
    loader: khr::Swapchain,
    samples: vk::SampleCountFlags,
    depth_format: vk::Format,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    resources: Option<SwapResources>,
    state: SwapchainState,
}

impl SwapchainManager {
    /// Prepares the manager without creating a swapchain yet. The surface
    /// format is settled here because render passes depend on it.
    pub fn new(context: Arc<DeviceContext>, samples: vk::SampleCountFlags) -> Result<Self> {
        let formats = unsafe {
            context
                .surface_loader()
                .get_physical_device_surface_formats(context.physical_device(), context.surface())?
        };
        let format = choose_surface_format(&formats)
            .ok_or_else(|| RendererError::Surface("surface reports no formats".into()))?;

        let depth_format = pick_depth_format(&DEPTH_CANDIDATES, |candidate| {
            let props = unsafe {
                context
                    .instance()
                    .get_physical_device_format_properties(context.physical_device(), candidate)
            };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or_else(|| RendererError::Surface("no supported depth format".into()))?;

        let loader = khr::Swapchain::new(context.instance(), context.device());
        Ok(Self {
            context,
            loader,
            samples,
            depth_format,
            format,
            extent: vk::Extent2D::default(),
            resources: None,
            state: SwapchainState::Uninitialized,
        })
    }

    fn advance(&mut self, event: SwapchainEvent) {
        match self.state.on(event) {
            Some(next) => self.state = next,
            None => warn!(state = ?self.state, ?event, "Ignoring swapchain event."),
        }
    }

    /// Builds the swapchain for a framebuffer of `framebuffer` pixels.
    pub fn create(&mut self, allocator: &ResourceAllocator, framebuffer: (u32, u32)) -> Result<()> {
        if framebuffer.0 == 0 || framebuffer.1 == 0 {
            return Err(RendererError::Surface("surface has no area".into()));
        }
        let context = self.context.clone();
        let physical_device = context.physical_device();
        let surface = context.surface();
        let capabilities = unsafe {
            context
                .surface_loader()
                .get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let modes = unsafe {
            context
                .surface_loader()
                .get_physical_device_surface_present_modes(physical_device, surface)?
        };
        let present_mode = choose_present_mode(&modes);
        let extent = choose_extent(&capabilities, framebuffer);
        let image_count = choose_image_count(&capabilities);

        let families = context.queue_families();
        let shared: Vec<u32> = families.unique();
        let mut info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        info = if shared.len() > 1 {
            info.image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&shared)
        } else {
            info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe { self.loader.create_swapchain(&info, None)? };
        let resources = match self.build_attachments(allocator, swapchain, extent) {
            Ok(resources) => resources,
            Err(err) => {
                unsafe { self.loader.destroy_swapchain(swapchain, None) };
                return Err(err);
            }
        };

        info!(
            width = extent.width,
            height = extent.height,
            images = resources.images.len(),
            ?present_mode,
            "Swapchain created."
        );
        self.extent = extent;
        self.resources = Some(resources);
        self.advance(SwapchainEvent::Created);
        Ok(())
    }

    fn build_attachments(
        &self,
        allocator: &ResourceAllocator,
        swapchain: vk::SwapchainKHR,
        extent: vk::Extent2D,
    ) -> Result<SwapResources> {
        let device = self.context.device();
        let images = unsafe { self.loader.get_swapchain_images(swapchain)? };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            match unsafe { device.create_image_view(&view_info, None) } {
                Ok(view) => image_views.push(view),
                Err(err) => {
                    for view in image_views {
                        unsafe { device.destroy_image_view(view, None) };
                    }
                    return Err(err.into());
                }
            }
        }
        let destroy_views = |views: &[vk::ImageView]| {
            for &view in views {
                unsafe { device.destroy_image_view(view, None) };
            }
        };

        let depth = allocator.create_image(&ImageDesc {
            width: extent.width,
            height: extent.height,
            mip_levels: 1,
            samples: self.samples,
            format: self.depth_format,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            aspect: vk::ImageAspectFlags::DEPTH,
        });
        let depth = match depth {
            Ok(depth) => depth,
            Err(err) => {
                destroy_views(&image_views);
                return Err(err);
            }
        };

        let color = if self.samples == vk::SampleCountFlags::TYPE_1 {
            None
        } else {
            let target = allocator.create_image(&ImageDesc {
                samples: self.samples,
                usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                ..ImageDesc::color(extent.width, extent.height, self.format.format, vk::ImageUsageFlags::empty())
            });
            match target {
                Ok(target) => Some(target),
                Err(err) => {
                    destroy_views(&image_views);
                    return Err(err);
                }
            }
        };

        Ok(SwapResources {
            swapchain,
            images,
            image_views,
            depth,
            color,
        })
    }

    fn destroy_resources(&mut self) {
        if let Some(resources) = self.resources.take() {
            let device = self.context.device();
            unsafe {
                for &view in &resources.image_views {
                    device.destroy_image_view(view, None);
                }
                self.loader.destroy_swapchain(resources.swapchain, None);
            }
            debug!("Swapchain resources destroyed.");
        }
    }

    /// Marks the swapchain as needing a rebuild.
    pub fn invalidate(&mut self) {
        self.advance(SwapchainEvent::Invalidated);
    }

    /// Waits for the device to go idle, tears everything down and builds
    /// again at the current framebuffer size. A surface without area is
    /// left stale and reported as [`RecreateOutcome::Deferred`].
    pub fn recreate(
        &mut self,
        allocator: &ResourceAllocator,
        framebuffer: (u32, u32),
    ) -> Result<RecreateOutcome> {
        if framebuffer.0 == 0 || framebuffer.1 == 0 {
            self.invalidate();
            return Ok(RecreateOutcome::Deferred);
        }
        self.context.wait_idle()?;
        self.invalidate();
        self.destroy_resources();
        self.create(allocator, framebuffer)?;
        Ok(RecreateOutcome::Rebuilt)
    }

    pub fn acquire(&mut self, image_available: vk::Semaphore) -> Result<AcquireOutcome> {
        let swapchain = self.handle()?;
        let result = unsafe {
            self.loader
                .acquire_next_image(swapchain, u64::MAX, image_available, vk::Fence::null())
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.invalidate();
                Ok(AcquireOutcome::OutOfDate)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        render_finished: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let swapchains = [self.handle()?];
        let indices = [image_index];
        let waits = [render_finished];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { self.loader.queue_present(queue, &info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                self.invalidate();
                Ok(PresentOutcome::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.invalidate();
                Ok(PresentOutcome::OutOfDate)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn handle(&self) -> Result<vk::SwapchainKHR> {
        self.resources
            .as_ref()
            .map(|resources| resources.swapchain)
            .ok_or_else(|| RendererError::Surface("swapchain has not been created".into()))
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.resources
            .as_ref()
            .map_or(0, |resources| resources.images.len())
    }

    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.resources
            .as_ref()
            .and_then(|resources| resources.images.get(index as usize).copied())
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        self.resources
            .as_ref()
            .map(|resources| resources.image_views.as_slice())
            .unwrap_or(&[])
    }

    pub fn depth_view(&self) -> Option<vk::ImageView> {
        self.resources.as_ref().map(|resources| resources.depth.view())
    }

    pub fn color_view(&self) -> Option<vk::ImageView> {
        self.resources
            .as_ref()
            .and_then(|resources| resources.color.as_ref().map(Image::view))
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        self.destroy_resources();
        self.advance(SwapchainEvent::Destroyed);
        info!("Swapchain manager destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn srgb_bgra_is_preferred() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert_eq!(
            choose_surface_format(&formats[..1]).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn mailbox_then_fifo() {
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_framebuffer_pixels_when_surface_is_flexible() {
        let caps = capabilities((u32::MAX, u32::MAX));
        // A HiDPI window reports twice its logical size in pixels.
        assert_eq!(
            choose_extent(&caps, (1600, 1200)),
            vk::Extent2D {
                width: 1600,
                height: 1200
            }
        );
        assert_eq!(
            choose_extent(&caps, (8, 9000)),
            vk::Extent2D {
                width: 16,
                height: 4096
            }
        );
        assert_eq!(choose_extent(&caps, (800, 600)), choose_extent(&caps, (800, 600)));
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let caps = capabilities((640, 480));
        assert_eq!(
            choose_extent(&caps, (1600, 1200)),
            vk::Extent2D {
                width: 640,
                height: 480
            }
        );
    }

    #[test]
    fn image_count_respects_maximum() {
        assert_eq!(choose_image_count(&capabilities((1, 1))), 3);
        let mut caps = capabilities((1, 1));
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn depth_format_falls_through_candidates() {
        let picked = pick_depth_format(&DEPTH_CANDIDATES, |f| f == vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(picked, Some(vk::Format::D24_UNORM_S8_UINT));
        assert_eq!(pick_depth_format(&DEPTH_CANDIDATES, |_| false), None);
    }

    #[test]
    fn lifecycle_follows_create_resize_destroy() {
        let mut state = SwapchainState::Uninitialized;
        for (event, expected) in [
            (SwapchainEvent::Created, SwapchainState::Ready),
            (SwapchainEvent::Invalidated, SwapchainState::Stale),
            (SwapchainEvent::Invalidated, SwapchainState::Stale),
            (SwapchainEvent::Created, SwapchainState::Ready),
            (SwapchainEvent::Destroyed, SwapchainState::Destroyed),
        ] {
            state = state.on(event).unwrap();
            assert_eq!(state, expected);
        }
        assert_eq!(state.on(SwapchainEvent::Created), None);
        assert_eq!(SwapchainState::Uninitialized.on(SwapchainEvent::Invalidated), None);
    }
}
