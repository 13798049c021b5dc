use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

use crate::layout::LayoutError;
use crate::pass::PassKind;

/// A specialized `Result` type for renderer operations.
pub type Result<T> = std::result::Result<T, RendererError>;

/// Every failure the renderer can surface.
///
/// Setup failures (device selection, pipeline creation, required
/// allocations) are fatal and abort initialization. Swapchain
/// out-of-date/suboptimal results are transient and are handled inside the
/// frame scheduler; see [`RendererError::is_transient`].
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("No suitable Vulkan physical device found")]
    NoSuitableDevice,

    #[error("No memory type in bits {type_bits:#b} satisfies {properties:?}")]
    OutOfDeviceMemory {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("Failed to create {pass:?} pass resources: {reason}")]
    PipelineCreation { pass: PassKind, reason: String },

    #[error("Surface error: {0}")]
    Surface(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("Write of {len} bytes at offset {offset} overruns a {size}-byte buffer")]
    BufferOverrun {
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("Buffer is not host-mapped")]
    BufferNotMapped,

    #[error("Draw queue is full ({capacity} instances)")]
    DrawQueueFull { capacity: usize },

    #[error("Texture set is full ({capacity} textures)")]
    TextureCapacity { capacity: usize },

    #[error("Asset `{path}` could not be loaded: {reason}")]
    Asset { path: PathBuf, reason: String },

    #[error("Invalid SPIR-V blob: {0}")]
    InvalidShader(#[source] std::io::Error),

    #[error("Swapchain recreation failed twice in a row: {0}")]
    SwapchainRecreation(#[source] Box<RendererError>),
}

impl RendererError {
    /// Errors the frame loop recovers from by rebuilding the swapchain.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RendererError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)
                | RendererError::Vulkan(vk::Result::SUBOPTIMAL_KHR)
        )
    }

    pub(crate) fn pipeline(pass: PassKind, reason: impl Into<String>) -> Self {
        RendererError::PipelineCreation {
            pass,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_is_transient() {
        assert!(RendererError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR).is_transient());
        assert!(RendererError::Vulkan(vk::Result::SUBOPTIMAL_KHR).is_transient());
        assert!(!RendererError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_transient());
        assert!(!RendererError::NoSuitableDevice.is_transient());
    }

    #[test]
    fn pipeline_error_names_the_pass() {
        let err = RendererError::pipeline(PassKind::Brush, "shader missing");
        assert_eq!(
            err.to_string(),
            "Failed to create Brush pass resources: shader missing"
        );
    }
}
