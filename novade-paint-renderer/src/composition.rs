//! Per-frame pass sequencing for the painting chain.
//!
//! [`CompositionEngine::plan_frame`] produces a [`FramePlan`]: the ordered
//! passes and barriers one command buffer has to record. Plans are checked
//! against a [`LayoutTracker`] while they are built, and the engine's
//! tracker only advances when the whole plan is valid.

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::config::CameraConfig;
use crate::error::{RendererError, Result};
use crate::geometry::DrawCall;
use crate::input::InputState;
use crate::layout::{ImageId, ImageLayout, LayoutTracker, LayoutTransition};
use crate::pass::{AttachmentLoad, PassDescriptor, PassKind, PassTarget};

/// Stamp transform in layer space: the quad's corners land at
/// `position ± size`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct StampPushConstants {
    pub position: [f32; 2],
    pub size: [f32; 2],
}

pub const TRANSPARENT: [f32; 4] = [0.0, 0.0, 0.0, 0.0];
pub const BACKGROUND: [f32; 4] = [0.1, 0.1, 0.1, 1.0];

/// Maps a window pixel to layer-local coordinates by undoing the fixed
/// perspective at the canvas depth. Layer space has +Y up.
pub fn window_to_layer(x: f64, y: f64, framebuffer: (u32, u32), camera: &CameraConfig) -> [f32; 2] {
    let width = framebuffer.0.max(1) as f32;
    let height = framebuffer.1.max(1) as f32;
    let ndc_x = x as f32 / width * 2.0 - 1.0;
    let ndc_y = 1.0 - y as f32 / height * 2.0;
    let half_height = camera.depth * camera.tan_half_fov();
    let aspect = width / height;
    [ndc_x * half_height * aspect, ndc_y * half_height]
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassInvocation {
    pub pass: PassKind,
    pub target: ImageId,
    pub sampled: Option<ImageId>,
    pub push_constants: Option<StampPushConstants>,
    /// Colour the target is cleared to; `None` keeps its contents.
    pub clear: Option<[f32; 4]>,
    pub draws: Vec<DrawCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameCommand {
    /// Issued as a single pipeline barrier.
    Barrier(Vec<LayoutTransition>),
    Pass(PassInvocation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FramePlan {
    pub image_index: u32,
    pub stamp: Option<StampPushConstants>,
    pub commands: Vec<FrameCommand>,
}

impl FramePlan {
    pub fn passes(&self) -> impl Iterator<Item = &PassInvocation> {
        self.commands.iter().filter_map(|command| match command {
            FrameCommand::Pass(pass) => Some(pass),
            FrameCommand::Barrier(_) => None,
        })
    }
}

/// Layout transitions that hand `written` over to sampling and make
/// `target` writable. One pair per layer composited.
pub fn swap_roles(
    tracker: &mut LayoutTracker,
    written: ImageId,
    target: ImageId,
) -> Result<Vec<LayoutTransition>> {
    Ok(vec![
        tracker.transition(written, ImageLayout::ShaderReadOnly)?,
        tracker.transition(target, ImageLayout::ColorAttachment)?,
    ])
}

pub struct CompositionEngine {
    passes: Vec<PassDescriptor>,
    camera: CameraConfig,
    /// Pixel size of the presented image, the space pointer events use.
    surface: (u32, u32),
    quad: DrawCall,
    tracker: LayoutTracker,
}

impl CompositionEngine {
    /// `quad` is the canvas quad's draw, reused by the brush and layer
    /// passes. The brush texture is expected to be uploaded, the layer
    /// cleared as an attachment and the canvas cleared for sampling.
    pub fn new(
        passes: Vec<PassDescriptor>,
        camera: CameraConfig,
        quad: DrawCall,
        surface: (u32, u32),
    ) -> Self {
        let mut tracker = LayoutTracker::new();
        tracker.register(ImageId::Brush, ImageLayout::ShaderReadOnly);
        tracker.register(ImageId::Layer, ImageLayout::ColorAttachment);
        tracker.register(ImageId::Canvas, ImageLayout::ShaderReadOnly);
        Self {
            passes,
            camera,
            quad,
            surface,
            tracker,
        }
    }

    /// Follows a swapchain rebuild. Pointer positions are mapped against
    /// this size, not the one carried by resize events.
    pub fn resize(&mut self, surface: (u32, u32)) {
        self.surface = surface;
    }

    pub fn surface(&self) -> (u32, u32) {
        self.surface
    }

    pub fn tracker(&self) -> &LayoutTracker {
        &self.tracker
    }

    pub fn stamp_for(&self, input: &InputState) -> StampPushConstants {
        StampPushConstants {
            position: window_to_layer(input.x, input.y, self.surface, &self.camera),
            size: [input.brush_radius; 2],
        }
    }

    fn descriptor(&self, kind: PassKind) -> Result<&PassDescriptor> {
        self.passes
            .iter()
            .find(|pass| pass.kind == kind)
            .ok_or_else(|| RendererError::pipeline(kind, "pass is not registered"))
    }

    fn invoke(
        &self,
        tracker: &mut LayoutTracker,
        kind: PassKind,
        image_index: u32,
        push_constants: Option<StampPushConstants>,
        draws: Vec<DrawCall>,
    ) -> Result<PassInvocation> {
        let descriptor = self.descriptor(kind)?;
        let target = descriptor.target.image(image_index);
        if let Some(sampled) = descriptor.sampled {
            tracker.require_readable(sampled)?;
        }
        tracker.enter_render_pass(target, descriptor.initial_layout, descriptor.final_layout)?;
        let clear = match descriptor.load {
            AttachmentLoad::Load => None,
            AttachmentLoad::Clear if descriptor.target == PassTarget::Swapchain => Some(BACKGROUND),
            AttachmentLoad::Clear => Some(TRANSPARENT),
        };
        Ok(PassInvocation {
            pass: kind,
            target,
            sampled: descriptor.sampled,
            push_constants,
            clear,
            draws,
        })
    }

    /// Plans one frame. When the pointer is down the brush is stamped into
    /// the layer and the layer composited into the canvas; every frame then
    /// draws `scene_draws` into swapchain image `image_index`.
    ///
    /// A plan that would break a layout rule is rejected and leaves the
    /// engine's layout state untouched.
    pub fn plan_frame(
        &mut self,
        input: &InputState,
        image_index: u32,
        scene_draws: Vec<DrawCall>,
    ) -> Result<FramePlan> {
        let mut tracker = self.tracker.clone();
        let mut commands = Vec::with_capacity(5);

        let stamp = input.wants_stamp().then(|| self.stamp_for(input));
        if let Some(push) = stamp {
            debug!(position = ?push.position, size = push.size[0], "Stamping brush.");
            commands.push(FrameCommand::Pass(self.invoke(
                &mut tracker,
                PassKind::Brush,
                image_index,
                Some(push),
                vec![self.quad],
            )?));
            commands.push(FrameCommand::Barrier(swap_roles(
                &mut tracker,
                ImageId::Layer,
                ImageId::Canvas,
            )?));
            commands.push(FrameCommand::Pass(self.invoke(
                &mut tracker,
                PassKind::Layer,
                image_index,
                None,
                vec![self.quad],
            )?));
            commands.push(FrameCommand::Barrier(swap_roles(
                &mut tracker,
                ImageId::Canvas,
                ImageId::Layer,
            )?));
        }

        commands.push(FrameCommand::Pass(self.invoke(
            &mut tracker,
            PassKind::Scene,
            image_index,
            None,
            scene_draws,
        )?));
        // Swapchain contents are discarded on the next acquire.
        tracker.forget(ImageId::Swapchain(image_index));

        self.tracker = tracker;
        Ok(FramePlan {
            image_index,
            stamp,
            commands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendererConfig;
    use crate::geometry::GlobalUbo;
    use crate::layout::LayoutError;
    use crate::pass::paint_passes;

    const QUAD: DrawCall = DrawCall {
        index_count: 6,
        instance_count: 1,
        first_index: 0,
        vertex_offset: 0,
        first_instance: 0,
    };

    fn input(pressed: bool) -> InputState {
        InputState {
            x: 400.0,
            y: 300.0,
            pressed,
            brush_radius: 0.1,
            framebuffer: (800, 600),
            resized: false,
        }
    }

    fn engine() -> CompositionEngine {
        CompositionEngine::new(
            paint_passes(&RendererConfig::default()),
            CameraConfig::default(),
            QUAD,
            (800, 600),
        )
    }

    #[test]
    fn window_center_maps_to_layer_origin() {
        let camera = CameraConfig::default();
        let [x, y] = window_to_layer(400.0, 300.0, (800, 600), &camera);
        assert!(x.abs() < 1e-6 && y.abs() < 1e-6);

        let [x, y] = window_to_layer(0.0, 0.0, (800, 600), &camera);
        assert!(x < 0.0 && y > 0.0, "top-left is up and to the left");
    }

    #[test]
    fn unprojection_agrees_with_the_scene_camera() {
        let camera = CameraConfig::default();
        let (width, height) = (800.0f32, 600.0f32);
        let ubo = GlobalUbo::for_camera(&camera, width / height);
        for (px, py) in [(100.0, 50.0), (650.0, 420.0), (400.0, 10.0)] {
            let [lx, ly] = window_to_layer(px as f64, py as f64, (800, 600), &camera);
            let clip = ubo.proj * ubo.view * glam::Vec4::new(lx, ly, 0.0, 1.0);
            let screen_x = (clip.x / clip.w + 1.0) * 0.5 * width;
            let screen_y = (clip.y / clip.w + 1.0) * 0.5 * height;
            assert!((screen_x - px).abs() < 1e-2, "{screen_x} vs {px}");
            assert!((screen_y - py).abs() < 1e-2, "{screen_y} vs {py}");
        }
    }

    #[test]
    fn idle_frame_only_redraws_the_canvas() {
        let mut engine = engine();
        let plan = engine.plan_frame(&input(false), 1, vec![QUAD]).unwrap();
        assert_eq!(plan.stamp, None);
        assert_eq!(plan.commands.len(), 1);
        let scene = plan.passes().next().unwrap();
        assert_eq!(scene.pass, PassKind::Scene);
        assert_eq!(scene.target, ImageId::Swapchain(1));
        assert_eq!(scene.sampled, Some(ImageId::Canvas));
        assert_eq!(scene.clear, Some(BACKGROUND));
    }

    #[test]
    fn stamp_frame_runs_the_full_chain_with_paired_barriers() {
        let mut engine = engine();
        let before = engine.tracker().clone();
        let plan = engine.plan_frame(&input(true), 0, vec![QUAD]).unwrap();

        let kinds: Vec<PassKind> = plan.passes().map(|pass| pass.pass).collect();
        assert_eq!(kinds, [PassKind::Brush, PassKind::Layer, PassKind::Scene]);

        let FrameCommand::Barrier(first) = &plan.commands[1] else {
            panic!("expected a barrier after the brush pass");
        };
        assert_eq!(
            first.iter().map(|t| (t.image, t.to)).collect::<Vec<_>>(),
            [
                (ImageId::Layer, ImageLayout::ShaderReadOnly),
                (ImageId::Canvas, ImageLayout::ColorAttachment)
            ]
        );
        let FrameCommand::Barrier(second) = &plan.commands[3] else {
            panic!("expected a barrier after the layer pass");
        };
        assert_eq!(
            second.iter().map(|t| (t.image, t.to)).collect::<Vec<_>>(),
            [
                (ImageId::Canvas, ImageLayout::ShaderReadOnly),
                (ImageId::Layer, ImageLayout::ColorAttachment)
            ]
        );

        let brush = plan.passes().next().unwrap();
        assert_eq!(brush.clear, None, "brush pass preserves the layer");
        assert_eq!(brush.push_constants.map(|p| p.size), Some([0.1, 0.1]));
        assert_eq!(engine.tracker(), &before, "layouts return to rest");
    }

    #[test]
    fn invalid_plan_is_rejected_without_side_effects() {
        let mut passes = paint_passes(&RendererConfig::default());
        passes[0].sampled = Some(ImageId::Layer);
        let mut engine = CompositionEngine::new(passes, CameraConfig::default(), QUAD, (800, 600));
        let before = engine.tracker().clone();

        let err = engine.plan_frame(&input(true), 0, vec![]).unwrap_err();
        assert!(matches!(
            err,
            RendererError::Layout(LayoutError::NotReadable {
                image: ImageId::Layer,
                ..
            })
        ));
        assert_eq!(engine.tracker(), &before);
    }

    #[test]
    fn stamps_follow_the_rebuilt_surface_not_the_resize_payload() {
        let mut engine = engine();
        let mut stale = input(true);
        stale.framebuffer = (1600, 1200);
        let stamp = engine.stamp_for(&stale);
        assert!(stamp.position[0].abs() < 1e-6 && stamp.position[1].abs() < 1e-6);

        engine.resize((1600, 1200));
        let stamp = engine.stamp_for(&stale);
        assert!(stamp.position[0] < 0.0 && stamp.position[1] > 0.0);
        assert_eq!(
            stamp.position,
            window_to_layer(400.0, 300.0, (1600, 1200), &CameraConfig::default())
        );
    }
}
