//! Vulkan renderer for a brush painting tool.
//!
//! A brush texture is stamped into an offscreen layer, the layer is
//! composited into a persistent canvas, and the canvas is drawn as a
//! textured quad into the window's swapchain. [`PaintRenderer`] owns the
//! whole chain; the window system feeds it through an [`InputHandle`] and a
//! [`SurfaceProvider`].

pub mod allocator;
pub mod assets;
pub mod composition;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod input;
pub mod layout;
pub mod pass;
mod renderer;
pub mod swapchain;
pub mod sync;
#[cfg(feature = "wayland")]
pub mod wayland;

pub use assets::{AssetSource, DecodedImage, DirectoryAssets};
pub use composition::{CompositionEngine, FrameCommand, FramePlan, PassInvocation};
pub use config::{BrushConfig, CameraConfig, RendererConfig, ShaderPaths};
pub use context::{DeviceContext, SurfaceProvider};
pub use error::{RendererError, Result};
pub use frame::{FrameBackend, FrameOutcome, FrameScheduler};
pub use geometry::{ModelData, ModelHandle, SubmeshData, Vertex};
pub use input::{InputHandle, InputState, KeyAction};
pub use renderer::PaintRenderer;
#[cfg(feature = "wayland")]
pub use wayland::WaylandSurfaceProvider;
