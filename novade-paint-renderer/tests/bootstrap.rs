use std::ffi::CStr;

use ash::vk;
use novade_paint_renderer::{
    DirectoryAssets, PaintRenderer, RendererConfig, RendererError, Result, SurfaceProvider,
};

/// A window system that cannot give the renderer a surface.
struct NoSurface;

impl SurfaceProvider for NoSurface {
    fn required_instance_extensions(&self) -> Vec<&'static CStr> {
        Vec::new()
    }

    fn create_surface(&self, _entry: &ash::Entry, _instance: &ash::Instance) -> Result<vk::SurfaceKHR> {
        Err(RendererError::Surface("no window".into()))
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        (800, 600)
    }
}

#[test]
fn invalid_configuration_fails_before_touching_vulkan() {
    let config = RendererConfig {
        max_frames_in_flight: 0,
        ..RendererConfig::default()
    };
    let result = PaintRenderer::new(config, Box::new(NoSurface), &DirectoryAssets::new("."));
    assert!(matches!(result, Err(RendererError::Config(_))));
}

#[test]
fn missing_surface_is_an_error_not_a_crash() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = RendererConfig {
        enable_validation: false,
        ..RendererConfig::default()
    };
    // Without a Vulkan loader this fails at load time; with one, at
    // surface creation. Either way setup reports an error.
    let result = PaintRenderer::new(config, Box::new(NoSurface), &DirectoryAssets::new("."));
    match result {
        Err(err) => assert!(!err.is_transient(), "setup failure reported as transient: {err}"),
        Ok(_) => panic!("renderer came up without a surface"),
    }
}
