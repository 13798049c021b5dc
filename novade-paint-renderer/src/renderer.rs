//! The painting renderer: owns every GPU object and drives one frame per
//! call to [`PaintRenderer::render_frame`].

use ash::vk;
use glam::Mat4;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::allocator::{
    Buffer, CommandPool, Image, ImageDesc, ResourceAllocator, Sampler, TextureSet,
};
use crate::assets::AssetSource;
use crate::composition::{CompositionEngine, FrameCommand, FramePlan, PassInvocation, TRANSPARENT};
use crate::config::RendererConfig;
use crate::context::{clamp_sample_count, DeviceContext, SurfaceProvider};
use crate::error::{RendererError, Result};
use crate::frame::{
    AcquireOutcome, FrameBackend, FrameOutcome, FrameScheduler, PresentOutcome, RecreateOutcome,
    SlotRing,
};
use crate::geometry::{
    DrawCall, DrawQueue, GeometryStore, GlobalUbo, InstanceData, ModelData, ModelHandle,
};
use crate::input::{InputHandle, InputQueue, InputState};
use crate::layout::{cmd_transition, ImageId, ImageLayout};
use crate::pass::{paint_passes, PassFormats, PassKind, PassRegistry, PassTargets};
use crate::sync::{FrameSync, PresentSemaphores};
use crate::swapchain::SwapchainManager;

const OFFSCREEN_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;
const SCENE_UNIFORM_BINDING: u32 = 0;
const SCENE_INSTANCE_BINDING: u32 = 1;
const SCENE_TEXTURE_BINDING: u32 = 2;
const CANVAS_INSTANCES: usize = 1;

/// Per-slot GPU state: sync objects, the command buffer and the
/// persistently mapped per-frame buffers.
struct FrameSlot {
    sync: FrameSync,
    command_buffer: vk::CommandBuffer,
    uniforms: Buffer,
    instances: Buffer,
}

/// Everything the frame protocol touches. Fields drop top to bottom.
pub struct RendererCore {
    slots: SlotRing<FrameSlot>,
    render_finished: PresentSemaphores,
    /// Plan built by `prepare_slot`, consumed by `record_slot`.
    pending_plan: Option<FramePlan>,
    command_pool: CommandPool,
    passes: PassRegistry,
    swapchain: SwapchainManager,
    textures: TextureSet,
    brush_texture: usize,
    layer: Image,
    canvas: Image,
    sampler: Sampler,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    geometry: GeometryStore,
    canvas_model: ModelHandle,
    draw_queue: DrawQueue,
    composition: CompositionEngine,
    input: InputQueue,
    frame_input: InputState,
    config: RendererConfig,
    provider: Box<dyn SurfaceProvider>,
    allocator: ResourceAllocator,
    context: Arc<DeviceContext>,
}

pub struct PaintRenderer {
    scheduler: FrameScheduler,
    core: RendererCore,
}

impl PaintRenderer {
    /// Boots the device and builds every pass and target. Any failure here
    /// is fatal; the caller must not enter a frame loop.
    pub fn new(
        config: RendererConfig,
        provider: Box<dyn SurfaceProvider>,
        assets: &dyn AssetSource,
    ) -> Result<Self> {
        config.validate()?;
        let context = Arc::new(DeviceContext::bootstrap(&config, provider.as_ref())?);
        let allocator = ResourceAllocator::new(context.clone())?;

        let samples = clamp_sample_count(config.msaa_samples, context.max_samples());
        let mut swapchain = SwapchainManager::new(context.clone(), samples)?;
        swapchain.create(&allocator, provider.framebuffer_size())?;

        let target_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_DST;
        let layer = allocator.create_image(&ImageDesc::color(
            config.canvas_width,
            config.canvas_height,
            OFFSCREEN_FORMAT,
            target_usage,
        ))?;
        let canvas = allocator.create_image(&ImageDesc::color(
            config.canvas_width,
            config.canvas_height,
            OFFSCREEN_FORMAT,
            target_usage,
        ))?;
        allocator.clear_image(&layer, TRANSPARENT, ImageLayout::ColorAttachment)?;
        allocator.clear_image(&canvas, TRANSPARENT, ImageLayout::ShaderReadOnly)?;

        // Array slot 0 of the scene's texture binding is the canvas itself.
        let mut textures = TextureSet::new(config.num_textures - 1);
        let brush = assets.image_rgba(&config.brush_path)?;
        let brush_texture = textures.upload(&allocator, brush.width, brush.height, &brush.rgba)?;
        let sampler = allocator.create_sampler()?;

        let mut geometry = GeometryStore::new(config.num_textures);
        let canvas_model = geometry.push_model(&ModelData::quad(0))?;
        let (vertex_buffer, index_buffer) = geometry.upload(&allocator)?;
        let quad = geometry
            .model(canvas_model)
            .and_then(|model| geometry.submeshes(model).first().copied())
            .map(|submesh| DrawCall {
                index_count: submesh.index_count,
                instance_count: 1,
                first_index: submesh.first_index,
                vertex_offset: submesh.vertex_offset,
                first_instance: 0,
            })
            .ok_or_else(|| RendererError::Config("canvas quad has no geometry".into()))?;

        let descriptors = paint_passes(&config);
        let formats = PassFormats {
            offscreen: OFFSCREEN_FORMAT,
            swapchain: swapchain.format(),
            depth: swapchain.depth_format(),
            samples,
        };
        let mut passes = PassRegistry::new(
            context.clone(),
            descriptors.clone(),
            formats,
            config.max_frames_in_flight,
            assets,
        )?;
        passes.build_framebuffers(&targets(&swapchain, &layer, &canvas)?)?;

        let graphics_family = context
            .queue_families()
            .graphics
            .ok_or(RendererError::NoSuitableDevice)?;
        let command_pool = CommandPool::new(
            context.clone(),
            graphics_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let command_buffers = command_pool.allocate(config.max_frames_in_flight as u32)?;
        let ubo_size = std::mem::size_of::<GlobalUbo>() as vk::DeviceSize;
        let instance_size =
            (std::mem::size_of::<InstanceData>() * config.max_entities) as vk::DeviceSize;
        let slots = SlotRing::new(config.max_frames_in_flight, |slot| {
            let uniforms =
                allocator.create_mapped_buffer(ubo_size, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
            let instances = allocator
                .create_mapped_buffer(instance_size, vk::BufferUsageFlags::STORAGE_BUFFER)?;
            passes.write_buffer(
                PassKind::Scene,
                slot,
                SCENE_UNIFORM_BINDING,
                uniforms.handle(),
                ubo_size,
            )?;
            passes.write_buffer(
                PassKind::Scene,
                slot,
                SCENE_INSTANCE_BINDING,
                instances.handle(),
                instance_size,
            )?;
            Ok(FrameSlot {
                sync: FrameSync::new(context.clone())?,
                command_buffer: command_buffers[slot],
                uniforms,
                instances,
            })
        })?;

        let mut render_finished = PresentSemaphores::new(context.clone());
        render_finished.ensure(swapchain.image_count())?;

        let extent = swapchain.extent();
        let composition =
            CompositionEngine::new(descriptors, config.camera, quad, (extent.width, extent.height));
        let input = InputQueue::new(config.brush, provider.framebuffer_size());
        let frame_input = *input.state();

        let core = RendererCore {
            slots,
            render_finished,
            pending_plan: None,
            command_pool,
            passes,
            swapchain,
            textures,
            brush_texture,
            layer,
            canvas,
            sampler,
            vertex_buffer,
            index_buffer,
            geometry,
            canvas_model,
            draw_queue: DrawQueue::with_reserved(config.max_entities, CANVAS_INSTANCES),
            composition,
            input,
            frame_input,
            config,
            provider,
            allocator,
            context,
        };
        core.write_sampled_images()?;
        info!(
            device = core.context.device_name(),
            frames_in_flight = core.config.max_frames_in_flight,
            ?samples,
            "Paint renderer ready."
        );

        Ok(Self {
            scheduler: FrameScheduler::new(core.config.max_frames_in_flight),
            core,
        })
    }

    /// Sender for window-system events. Events take effect at the start of
    /// the next frame.
    pub fn input_handle(&self) -> InputHandle {
        self.core.input.handle()
    }

    /// Drains pending input and runs one frame.
    pub fn render_frame(&mut self) -> Result<FrameOutcome> {
        let state = self.core.input.drain();
        if state.resized {
            self.scheduler.request_recreate();
        }
        self.core.frame_input = state;
        self.scheduler.draw_frame(&mut self.core)
    }

    /// Queues an extra model for the next frame's scene pass. One instance
    /// of `MAX_ENTITIES` is kept for the canvas quad.
    pub fn submit_draw(&mut self, model: ModelHandle, transforms: &[Mat4]) -> Result<()> {
        self.core
            .draw_queue
            .submit(&self.core.geometry, model, transforms)
    }

    /// Appends a model to the shared geometry. Meant for setup: it waits for
    /// the device to go idle and re-uploads the vertex and index buffers.
    pub fn add_model(&mut self, data: &ModelData) -> Result<ModelHandle> {
        self.core.context.wait_idle()?;
        let handle = self.core.geometry.push_model(data)?;
        let (vertices, indices) = self.core.geometry.upload(&self.core.allocator)?;
        self.core.vertex_buffer = vertices;
        self.core.index_buffer = indices;
        Ok(handle)
    }

    /// Loads another texture and returns the index materials use for it.
    pub fn load_texture(&mut self, assets: &dyn AssetSource, path: &Path) -> Result<u32> {
        self.core.context.wait_idle()?;
        let decoded = assets.image_rgba(path)?;
        let index = self.core.textures.upload(
            &self.core.allocator,
            decoded.width,
            decoded.height,
            &decoded.rgba,
        )?;
        self.core.write_sampled_images()?;
        Ok(index as u32 + 1)
    }

    pub fn canvas_model(&self) -> ModelHandle {
        self.core.canvas_model
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.core.swapchain.extent()
    }

    pub fn device_name(&self) -> &str {
        self.core.context.device_name()
    }
}

fn targets<'a>(
    swapchain: &'a SwapchainManager,
    layer: &Image,
    canvas: &Image,
) -> Result<PassTargets<'a>> {
    let depth = swapchain
        .depth_view()
        .ok_or_else(|| RendererError::Surface("swapchain has no depth target".into()))?;
    Ok(PassTargets {
        layer: layer.view(),
        canvas: canvas.view(),
        canvas_extent: canvas.extent(),
        swapchain_views: swapchain.image_views(),
        depth,
        color: swapchain.color_view(),
        swapchain_extent: swapchain.extent(),
    })
}

impl RendererCore {
    fn slot(&self, slot: usize) -> Result<&FrameSlot> {
        self.slots
            .get(slot)
            .ok_or_else(|| RendererError::Config(format!("frame slot {slot} does not exist")))
    }

    fn present_semaphore(&self, image_index: u32) -> Result<vk::Semaphore> {
        self.render_finished
            .get(image_index)
            .ok_or_else(|| {
                RendererError::Surface(format!("no present semaphore for image {image_index}"))
            })
    }

    /// Binds the brush texture, the layer and the scene's texture array.
    fn write_sampled_images(&self) -> Result<()> {
        let sampler = self.sampler.handle();
        let brush = self
            .textures
            .get(self.brush_texture)
            .ok_or_else(|| RendererError::pipeline(PassKind::Brush, "brush texture missing"))?;
        self.passes
            .write_image(PassKind::Brush, 0, &[(brush.view(), sampler)])?;
        self.passes
            .write_image(PassKind::Layer, 0, &[(self.layer.view(), sampler)])?;

        let canvas = (self.canvas.view(), sampler);
        let mut array = vec![canvas];
        array.extend(self.textures.iter().map(|image| (image.view(), sampler)));
        array.resize(self.config.num_textures, canvas);
        self.passes
            .write_image(PassKind::Scene, SCENE_TEXTURE_BINDING, &array)
    }

    fn image_handle(&self, image: ImageId) -> Result<vk::Image> {
        match image {
            ImageId::Brush => self
                .textures
                .get(self.brush_texture)
                .map(Image::handle)
                .ok_or_else(|| RendererError::pipeline(PassKind::Brush, "brush texture missing")),
            ImageId::Layer => Ok(self.layer.handle()),
            ImageId::Canvas => Ok(self.canvas.handle()),
            ImageId::Swapchain(index) => self
                .swapchain
                .image(index)
                .ok_or_else(|| RendererError::Surface(format!("no swapchain image {index}"))),
        }
    }

    /// Fills this slot's uniform and instance buffers and plans the frame.
    fn prepare(&mut self, slot: usize, image_index: u32) -> Result<FramePlan> {
        self.draw_queue
            .submit_reserved(&self.geometry, self.canvas_model, &[Mat4::IDENTITY])?;
        let (instances, draws) = self.draw_queue.flush(&self.geometry);

        let extent = self.swapchain.extent();
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
        let ubo = GlobalUbo::for_camera(&self.config.camera, aspect);

        let frame = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| RendererError::Config(format!("frame slot {slot} does not exist")))?;
        frame.uniforms.write(0, &[ubo])?;
        frame.instances.write(0, instances.as_slice())?;

        self.composition
            .plan_frame(&self.frame_input, image_index, draws)
    }

    fn record_plan(&self, slot: usize, plan: &FramePlan) -> Result<()> {
        let device = self.context.device();
        let command_buffer = self.slot(slot)?.command_buffer;
        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::builder())?;
        }

        for command in &plan.commands {
            match command {
                FrameCommand::Barrier(transitions) => {
                    let resolved = transitions
                        .iter()
                        .map(|t| Ok((self.image_handle(t.image)?, t.from, t.to)))
                        .collect::<Result<Vec<_>>>()?;
                    unsafe { cmd_transition(device, command_buffer, &resolved) };
                }
                FrameCommand::Pass(invocation) => {
                    self.record_pass(command_buffer, slot, plan.image_index, invocation)?
                }
            }
        }

        unsafe { device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn record_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        slot: usize,
        image_index: u32,
        invocation: &PassInvocation,
    ) -> Result<()> {
        let device = self.context.device();
        let kind = invocation.pass;
        let pass = self
            .passes
            .get(kind)
            .ok_or_else(|| RendererError::pipeline(kind, "pass is not registered"))?;
        let framebuffer = pass
            .framebuffer(image_index)
            .ok_or_else(|| RendererError::pipeline(kind, "framebuffer missing"))?;
        let set = pass
            .descriptor_set(slot)
            .ok_or_else(|| RendererError::pipeline(kind, "descriptor set missing"))?;
        let extent = pass.extent();

        let mut clear_values = Vec::with_capacity(3);
        if let Some(color) = invocation.clear {
            clear_values.push(vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            });
            if pass.descriptor().depth {
                clear_values.push(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                });
            }
        }

        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        let begin = vk::RenderPassBeginInfo::builder()
            .render_pass(pass.render_pass())
            .framebuffer(framebuffer)
            .render_area(area)
            .clear_values(&clear_values);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let pipeline = pass.pipeline();

        unsafe {
            device.cmd_begin_render_pass(command_buffer, &begin, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.handle(),
            );
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[area]);
            device.cmd_bind_vertex_buffers(command_buffer, 0, &[self.vertex_buffer.handle()], &[0]);
            device.cmd_bind_index_buffer(
                command_buffer,
                self.index_buffer.handle(),
                0,
                vk::IndexType::UINT32,
            );
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout(),
                0,
                &[set],
                &[],
            );
            if let Some(push) = invocation.push_constants {
                device.cmd_push_constants(
                    command_buffer,
                    pipeline.layout(),
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::bytes_of(&push),
                );
            }
            for draw in &invocation.draws {
                device.cmd_draw_indexed(
                    command_buffer,
                    draw.index_count,
                    draw.instance_count,
                    draw.first_index,
                    draw.vertex_offset,
                    draw.first_instance,
                );
            }
            device.cmd_end_render_pass(command_buffer);
        }
        Ok(())
    }
}

impl FrameBackend for RendererCore {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.slot(slot)?.sync.wait()
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.slot(slot)?.sync.image_available;
        self.swapchain.acquire(semaphore)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.slot(slot)?.sync.reset()
    }

    fn prepare_slot(&mut self, slot: usize, image_index: u32) -> Result<()> {
        self.pending_plan = Some(self.prepare(slot, image_index)?);
        Ok(())
    }

    fn record_slot(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let plan = self
            .pending_plan
            .take()
            .filter(|plan| plan.image_index == image_index)
            .ok_or_else(|| {
                RendererError::Config(format!("slot {slot} recorded before it was prepared"))
            })?;
        self.record_plan(slot, &plan)
    }

    fn submit_slot(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let frame = self.slot(slot)?;
        let render_finished = self.present_semaphore(image_index)?;
        let waits = [frame.sync.image_available];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signals = [render_finished];
        let buffers = [frame.command_buffer];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&buffers)
            .signal_semaphores(&signals)
            .build();
        unsafe {
            self.context.device().queue_submit(
                self.context.graphics_queue(),
                &[submit],
                frame.sync.in_flight,
            )?
        };
        Ok(())
    }

    fn present_image(&mut self, _slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let semaphore = self.present_semaphore(image_index)?;
        let queue = self.context.present_queue();
        self.swapchain.present(queue, image_index, semaphore)
    }

    fn recreate_swapchain(&mut self) -> Result<RecreateOutcome> {
        let size = self.provider.framebuffer_size();
        let outcome = self.swapchain.recreate(&self.allocator, size)?;
        if outcome == RecreateOutcome::Rebuilt {
            let targets = targets(&self.swapchain, &self.layer, &self.canvas)?;
            self.passes.rebuild_swap_dependent(&targets)?;
            self.render_finished.ensure(self.swapchain.image_count())?;
            let extent = self.swapchain.extent();
            self.composition.resize((extent.width, extent.height));
            debug!(width = extent.width, height = extent.height, "Swapchain rebuilt.");
        }
        Ok(outcome)
    }

    /// Drops the frame's queued draws and submits nothing but the slot's
    /// acquire wait and fence signal.
    fn abandon_slot(&mut self, slot: usize) -> Result<()> {
        self.pending_plan = None;
        self.draw_queue.clear();
        let frame = self.slot(slot)?;
        let device = self.context.device();
        let waits = [frame.sync.image_available];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .build();
        unsafe {
            // Already unsignaled when the failure came after `reset_slot`.
            device.reset_fences(&[frame.sync.in_flight])?;
            device.queue_submit(self.context.graphics_queue(), &[submit], frame.sync.in_flight)?;
        }
        debug!(slot, "Frame abandoned.");
        Ok(())
    }
}

impl Drop for RendererCore {
    fn drop(&mut self) {
        // Nothing may be destroyed while a submitted frame still uses it.
        let _ = self.context.wait_idle();
        info!("Paint renderer shutting down.");
    }
}
