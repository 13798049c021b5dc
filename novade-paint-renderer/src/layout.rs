//! Image layout bookkeeping.
//!
//! The composition engine is the only place that decides which layout an
//! image is in. Every render pass and barrier it plans goes through a
//! [`LayoutTracker`] first, so a plan that would sample an attachment or
//! render into a sampled texture is rejected before anything reaches a
//! command buffer.

use ash::vk;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    ColorAttachment,
    ShaderReadOnly,
    PresentSrc,
}

impl ImageLayout {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Whether a fragment shader may sample an image in this layout.
    pub fn is_readable(self) -> bool {
        matches!(self, ImageLayout::ShaderReadOnly)
    }

    /// Whether a render pass may write an image in this layout.
    pub fn is_writable(self) -> bool {
        matches!(self, ImageLayout::ColorAttachment)
    }

    fn stage(self) -> vk::PipelineStageFlags {
        match self {
            ImageLayout::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            ImageLayout::TransferDst => vk::PipelineStageFlags::TRANSFER,
            ImageLayout::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ImageLayout::ShaderReadOnly => vk::PipelineStageFlags::FRAGMENT_SHADER,
            ImageLayout::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }

    fn access(self) -> vk::AccessFlags {
        match self {
            ImageLayout::Undefined | ImageLayout::PresentSrc => vk::AccessFlags::empty(),
            ImageLayout::TransferDst => vk::AccessFlags::TRANSFER_WRITE,
            ImageLayout::ColorAttachment => {
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            ImageLayout::ShaderReadOnly => vk::AccessFlags::SHADER_READ,
        }
    }
}

/// Names the images the engine moves between layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageId {
    Brush,
    Layer,
    Canvas,
    Swapchain(u32),
}

/// One layout change, carrying the stage and access scopes for the
/// barrier that implements it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub image: ImageId,
    pub from: ImageLayout,
    pub to: ImageLayout,
}

impl LayoutTransition {
    pub fn src_stage(&self) -> vk::PipelineStageFlags {
        self.from.stage()
    }

    pub fn dst_stage(&self) -> vk::PipelineStageFlags {
        self.to.stage()
    }

    pub fn src_access(&self) -> vk::AccessFlags {
        self.from.access()
    }

    pub fn dst_access(&self) -> vk::AccessFlags {
        self.to.access()
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Memory barrier moving a single-mip colour image between two layouts.
pub fn image_barrier(image: vk::Image, from: ImageLayout, to: ImageLayout) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .old_layout(from.to_vk())
        .new_layout(to.to_vk())
        .src_access_mask(from.access())
        .dst_access_mask(to.access())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range())
        .build()
}

/// Records one pipeline barrier covering every `(image, from, to)` entry.
/// Batching keeps paired transitions (layer and canvas swapping roles) in a
/// single dependency.
///
/// # Safety
/// `command_buffer` must be in the recording state and every image must be
/// alive until the command buffer completes.
pub unsafe fn cmd_transition(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    transitions: &[(vk::Image, ImageLayout, ImageLayout)],
) {
    if transitions.is_empty() {
        return;
    }
    let (src_stage, dst_stage) = transitions.iter().fold(
        (vk::PipelineStageFlags::empty(), vk::PipelineStageFlags::empty()),
        |(src, dst), (_, from, to)| (src | from.stage(), dst | to.stage()),
    );
    let barriers: Vec<vk::ImageMemoryBarrier> = transitions
        .iter()
        .map(|&(image, from, to)| image_barrier(image, from, to))
        .collect();
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &barriers,
        );
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("image {0:?} is not tracked")]
    UnknownImage(ImageId),

    #[error("image {image:?} sampled while in {layout:?}")]
    NotReadable { image: ImageId, layout: ImageLayout },

    #[error("image {image:?} written while in {layout:?}")]
    NotWritable { image: ImageId, layout: ImageLayout },

    #[error("image {image:?} is already in {layout:?}")]
    RedundantTransition { image: ImageId, layout: ImageLayout },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutTracker {
    layouts: HashMap<ImageId, ImageLayout>,
}

impl LayoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `image`, or overwrites what is known about it.
    pub fn register(&mut self, image: ImageId, layout: ImageLayout) {
        self.layouts.insert(image, layout);
    }

    pub fn forget(&mut self, image: ImageId) {
        self.layouts.remove(&image);
    }

    pub fn current(&self, image: ImageId) -> Option<ImageLayout> {
        self.layouts.get(&image).copied()
    }

    fn layout_of(&self, image: ImageId) -> Result<ImageLayout, LayoutError> {
        self.current(image).ok_or(LayoutError::UnknownImage(image))
    }

    pub fn transition(
        &mut self,
        image: ImageId,
        to: ImageLayout,
    ) -> Result<LayoutTransition, LayoutError> {
        let from = self.layout_of(image)?;
        if from == to {
            return Err(LayoutError::RedundantTransition { image, layout: to });
        }
        self.layouts.insert(image, to);
        Ok(LayoutTransition { image, from, to })
    }

    pub fn require_readable(&self, image: ImageId) -> Result<(), LayoutError> {
        let layout = self.layout_of(image)?;
        if layout.is_readable() {
            Ok(())
        } else {
            Err(LayoutError::NotReadable { image, layout })
        }
    }

    pub fn require_writable(&self, image: ImageId) -> Result<(), LayoutError> {
        let layout = self.layout_of(image)?;
        if layout.is_writable() {
            Ok(())
        } else {
            Err(LayoutError::NotWritable { image, layout })
        }
    }

    /// Applies the implicit transitions of a render pass: the attachment is
    /// taken from `initial` (or `Undefined`, which discards) into the
    /// subpass layout, and is left in `final_layout` when the pass ends.
    pub fn enter_render_pass(
        &mut self,
        image: ImageId,
        initial: ImageLayout,
        final_layout: ImageLayout,
    ) -> Result<(), LayoutError> {
        if initial != ImageLayout::Undefined {
            let layout = self.layout_of(image)?;
            if layout != initial || !layout.is_writable() {
                return Err(LayoutError::NotWritable { image, layout });
            }
        }
        self.layouts.insert(image, final_layout);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_report_their_scopes() {
        let mut tracker = LayoutTracker::new();
        tracker.register(ImageId::Layer, ImageLayout::ColorAttachment);

        let barrier = tracker
            .transition(ImageId::Layer, ImageLayout::ShaderReadOnly)
            .unwrap();
        assert_eq!(barrier.from, ImageLayout::ColorAttachment);
        assert_eq!(barrier.dst_stage(), vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(barrier.dst_access(), vk::AccessFlags::SHADER_READ);
        assert!(barrier
            .src_access()
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
        assert_eq!(tracker.current(ImageId::Layer), Some(ImageLayout::ShaderReadOnly));
    }

    #[test]
    fn reads_and_writes_are_checked_against_the_current_layout() {
        let mut tracker = LayoutTracker::new();
        tracker.register(ImageId::Canvas, ImageLayout::ShaderReadOnly);

        assert!(tracker.require_readable(ImageId::Canvas).is_ok());
        assert_eq!(
            tracker.require_writable(ImageId::Canvas),
            Err(LayoutError::NotWritable {
                image: ImageId::Canvas,
                layout: ImageLayout::ShaderReadOnly,
            })
        );
        assert_eq!(
            tracker.require_readable(ImageId::Brush),
            Err(LayoutError::UnknownImage(ImageId::Brush))
        );
    }

    #[test]
    fn redundant_transitions_are_rejected() {
        let mut tracker = LayoutTracker::new();
        tracker.register(ImageId::Layer, ImageLayout::ColorAttachment);
        assert!(matches!(
            tracker.transition(ImageId::Layer, ImageLayout::ColorAttachment),
            Err(LayoutError::RedundantTransition { .. })
        ));
    }

    #[test]
    fn render_pass_with_undefined_initial_layout_discards() {
        let mut tracker = LayoutTracker::new();
        tracker.register(ImageId::Swapchain(1), ImageLayout::PresentSrc);
        tracker
            .enter_render_pass(
                ImageId::Swapchain(1),
                ImageLayout::Undefined,
                ImageLayout::PresentSrc,
            )
            .unwrap();

        tracker.register(ImageId::Layer, ImageLayout::ShaderReadOnly);
        assert!(tracker
            .enter_render_pass(
                ImageId::Layer,
                ImageLayout::ColorAttachment,
                ImageLayout::ColorAttachment,
            )
            .is_err());
    }
}
