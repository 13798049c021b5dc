//! Render passes, framebuffers, descriptor sets and pipelines for each
//! logical pass of the painting chain.
//!
//! Which passes exist and how they are wired is plain data
//! ([`PassDescriptor`]); [`PassRegistry`] turns that list into Vulkan
//! objects and rebuilds only the parts that depend on the swapchain.

use ash::util::read_spv;
use ash::vk;
use std::ffi::CStr;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::assets::AssetSource;
use crate::composition::StampPushConstants;
use crate::config::RendererConfig;
use crate::context::DeviceContext;
use crate::error::{RendererError, Result};
use crate::geometry::Vertex;
use crate::layout::{ImageId, ImageLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Stamps the brush texture into the layer.
    Brush,
    /// Composites the layer into the canvas.
    Layer,
    /// Draws the canvas (and any other draw jobs) into the swapchain image.
    Scene,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTarget {
    Layer,
    Canvas,
    Swapchain,
}

impl PassTarget {
    pub fn image(self, swapchain_index: u32) -> ImageId {
        match self {
            PassTarget::Layer => ImageId::Layer,
            PassTarget::Canvas => ImageId::Canvas,
            PassTarget::Swapchain => ImageId::Swapchain(swapchain_index),
        }
    }

    pub fn is_swap_dependent(self) -> bool {
        self == PassTarget::Swapchain
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentLoad {
    /// Keep what the attachment already holds.
    Load,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    SampledImage,
    SampledImageArray(u32),
    UniformBuffer,
    StorageBuffer,
}

impl BindingKind {
    fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            BindingKind::SampledImage | BindingKind::SampledImageArray(_) => {
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
            BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    fn count(self) -> u32 {
        match self {
            BindingKind::SampledImageArray(count) => count,
            _ => 1,
        }
    }

    fn stages(self) -> vk::ShaderStageFlags {
        match self {
            BindingKind::SampledImage | BindingKind::SampledImageArray(_) => {
                vk::ShaderStageFlags::FRAGMENT
            }
            BindingKind::UniformBuffer | BindingKind::StorageBuffer => vk::ShaderStageFlags::VERTEX,
        }
    }
}

/// Everything needed to build one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassDescriptor {
    pub kind: PassKind,
    pub target: PassTarget,
    pub load: AttachmentLoad,
    /// Layout the target must be in when the pass begins.
    pub initial_layout: ImageLayout,
    /// Layout the pass leaves the target in.
    pub final_layout: ImageLayout,
    /// Image read through binding 0 (or the texture array for the scene).
    pub sampled: Option<ImageId>,
    pub bindings: Vec<BindingKind>,
    pub push_constants: bool,
    pub depth: bool,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

/// The painting chain: brush into layer, layer into canvas, canvas onto
/// the screen.
pub fn paint_passes(config: &RendererConfig) -> Vec<PassDescriptor> {
    vec![
        PassDescriptor {
            kind: PassKind::Brush,
            target: PassTarget::Layer,
            load: AttachmentLoad::Load,
            initial_layout: ImageLayout::ColorAttachment,
            final_layout: ImageLayout::ColorAttachment,
            sampled: Some(ImageId::Brush),
            bindings: vec![BindingKind::SampledImage],
            push_constants: true,
            depth: false,
            vertex_shader: config.shaders.brush_vertex.clone(),
            fragment_shader: config.shaders.brush_fragment.clone(),
        },
        PassDescriptor {
            kind: PassKind::Layer,
            target: PassTarget::Canvas,
            load: AttachmentLoad::Clear,
            initial_layout: ImageLayout::ColorAttachment,
            final_layout: ImageLayout::ColorAttachment,
            sampled: Some(ImageId::Layer),
            bindings: vec![BindingKind::SampledImage],
            push_constants: false,
            depth: false,
            vertex_shader: config.shaders.layer_vertex.clone(),
            fragment_shader: config.shaders.layer_fragment.clone(),
        },
        PassDescriptor {
            kind: PassKind::Scene,
            target: PassTarget::Swapchain,
            load: AttachmentLoad::Clear,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::PresentSrc,
            sampled: Some(ImageId::Canvas),
            bindings: vec![
                BindingKind::UniformBuffer,
                BindingKind::StorageBuffer,
                BindingKind::SampledImageArray(config.num_textures as u32),
            ],
            push_constants: false,
            depth: true,
            vertex_shader: config.shaders.scene_vertex.clone(),
            fragment_shader: config.shaders.scene_fragment.clone(),
        },
    ]
}

/// Descriptor counts for a pool holding one set per pass per frame slot.
pub fn pool_sizes(passes: &[PassDescriptor], frames_in_flight: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in passes.iter().flat_map(|pass| pass.bindings.iter()) {
        let ty = binding.descriptor_type();
        let count = binding.count() * frames_in_flight;
        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

/// Standard alpha blending: `srcAlpha * src + (1 - srcAlpha) * dst` for
/// colour, `src + (1 - srcAlpha) * dst` for alpha.
pub fn alpha_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

/// Turns a SPIR-V blob into words. Lengths that are not a multiple of
/// four are rejected.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    read_spv(&mut Cursor::new(bytes)).map_err(RendererError::InvalidShader)
}

macro_rules! owned_handle {
    ($name:ident, $handle:ty, $destroy:ident) => {
        pub struct $name {
            context: Arc<DeviceContext>,
            handle: $handle,
        }

        impl $name {
            pub fn handle(&self) -> $handle {
                self.handle
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                unsafe { self.context.device().$destroy(self.handle, None) };
            }
        }
    };
}

owned_handle!(RenderPass, vk::RenderPass, destroy_render_pass);
owned_handle!(Framebuffer, vk::Framebuffer, destroy_framebuffer);
owned_handle!(DescriptorSetLayout, vk::DescriptorSetLayout, destroy_descriptor_set_layout);
owned_handle!(DescriptorPool, vk::DescriptorPool, destroy_descriptor_pool);
owned_handle!(ShaderModule, vk::ShaderModule, destroy_shader_module);

pub struct Pipeline {
    context: Arc<DeviceContext>,
    layout: vk::PipelineLayout,
    handle: vk::Pipeline,
}

impl Pipeline {
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe {
            device.destroy_pipeline(self.handle, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Attachment formats the passes render into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassFormats {
    pub offscreen: vk::Format,
    pub swapchain: vk::Format,
    pub depth: vk::Format,
    pub samples: vk::SampleCountFlags,
}

/// Image views the framebuffers are built over.
#[derive(Debug, Clone, Copy)]
pub struct PassTargets<'a> {
    pub layer: vk::ImageView,
    pub canvas: vk::ImageView,
    pub canvas_extent: vk::Extent2D,
    pub swapchain_views: &'a [vk::ImageView],
    pub depth: vk::ImageView,
    /// Multisample colour target, resolved into the swapchain image.
    pub color: Option<vk::ImageView>,
    pub swapchain_extent: vk::Extent2D,
}

pub struct PassResources {
    descriptor: PassDescriptor,
    render_pass: RenderPass,
    _set_layout: DescriptorSetLayout,
    pipeline: Pipeline,
    sets: Vec<vk::DescriptorSet>,
    framebuffers: Vec<Framebuffer>,
    extent: vk::Extent2D,
}

impl PassResources {
    pub fn descriptor(&self) -> &PassDescriptor {
        &self.descriptor
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.handle()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn descriptor_set(&self, slot: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(slot).copied()
    }

    /// Offscreen passes have one framebuffer; the scene pass has one per
    /// swapchain image.
    pub fn framebuffer(&self, swapchain_index: u32) -> Option<vk::Framebuffer> {
        let index = if self.descriptor.target.is_swap_dependent() {
            swapchain_index as usize
        } else {
            0
        };
        self.framebuffers.get(index).map(Framebuffer::handle)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

pub struct PassRegistry {
    context: Arc<DeviceContext>,
    // Sets are freed with the pool, so it must outlive `passes`.
    passes: Vec<PassResources>,
    _pool: DescriptorPool,
}

impl PassRegistry {
    /// Builds every pass up front. Any failure is fatal; nothing is kept
    /// from a partially built registry.
    pub fn new(
        context: Arc<DeviceContext>,
        descriptors: Vec<PassDescriptor>,
        formats: PassFormats,
        frames_in_flight: usize,
        assets: &dyn AssetSource,
    ) -> Result<Self> {
        let frames = frames_in_flight as u32;
        let sizes = pool_sizes(&descriptors, frames);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(frames * descriptors.len() as u32)
            .pool_sizes(&sizes);
        let pool = DescriptorPool {
            handle: unsafe { context.device().create_descriptor_pool(&pool_info, None)? },
            context: context.clone(),
        };

        let mut passes = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let kind = descriptor.kind;
            let resources = Self::build_pass(&context, &pool, descriptor, formats, frames, assets)
                .map_err(|err| match err {
                    RendererError::PipelineCreation { .. } => err,
                    other => RendererError::pipeline(kind, other.to_string()),
                })?;
            info!(pass = ?kind, "Pass created.");
            passes.push(resources);
        }

        Ok(Self {
            context,
            passes,
            _pool: pool,
        })
    }

    fn build_pass(
        context: &Arc<DeviceContext>,
        pool: &DescriptorPool,
        descriptor: PassDescriptor,
        formats: PassFormats,
        frames: u32,
        assets: &dyn AssetSource,
    ) -> Result<PassResources> {
        let device = context.device();
        let render_pass = RenderPass {
            handle: create_render_pass(device, &descriptor, formats)?,
            context: context.clone(),
        };

        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = descriptor
            .bindings
            .iter()
            .enumerate()
            .map(|(index, binding)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(index as u32)
                    .descriptor_type(binding.descriptor_type())
                    .descriptor_count(binding.count())
                    .stage_flags(binding.stages())
                    .build()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
        let set_layout = DescriptorSetLayout {
            handle: unsafe { device.create_descriptor_set_layout(&layout_info, None)? },
            context: context.clone(),
        };

        let set_layouts = vec![set_layout.handle(); frames as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool.handle())
            .set_layouts(&set_layouts);
        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info)? };

        let pipeline = create_pipeline(
            context,
            &descriptor,
            render_pass.handle(),
            set_layout.handle(),
            formats,
            assets,
        )?;

        Ok(PassResources {
            descriptor,
            render_pass,
            _set_layout: set_layout,
            pipeline,
            sets,
            framebuffers: Vec::new(),
            extent: vk::Extent2D::default(),
        })
    }

    pub fn get(&self, kind: PassKind) -> Option<&PassResources> {
        self.passes.iter().find(|pass| pass.descriptor.kind == kind)
    }

    /// Creates framebuffers for every pass.
    pub fn build_framebuffers(&mut self, targets: &PassTargets<'_>) -> Result<()> {
        for index in 0..self.passes.len() {
            self.build_pass_framebuffers(index, targets)?;
        }
        Ok(())
    }

    /// Rebuilds only the framebuffers of passes that render into the
    /// swapchain. Offscreen passes keep theirs.
    pub fn rebuild_swap_dependent(&mut self, targets: &PassTargets<'_>) -> Result<()> {
        for index in 0..self.passes.len() {
            if self.passes[index].descriptor.target.is_swap_dependent() {
                self.build_pass_framebuffers(index, targets)?;
                debug!(pass = ?self.passes[index].descriptor.kind, "Swap-dependent framebuffers rebuilt.");
            }
        }
        Ok(())
    }

    fn build_pass_framebuffers(&mut self, index: usize, targets: &PassTargets<'_>) -> Result<()> {
        let pass = &mut self.passes[index];
        // Old framebuffers go first; they may reference views already gone.
        pass.framebuffers.clear();

        let device = self.context.device();
        let (views, extent): (Vec<Vec<vk::ImageView>>, vk::Extent2D) = match pass.descriptor.target {
            PassTarget::Layer => (vec![vec![targets.layer]], targets.canvas_extent),
            PassTarget::Canvas => (vec![vec![targets.canvas]], targets.canvas_extent),
            PassTarget::Swapchain => (
                targets
                    .swapchain_views
                    .iter()
                    .map(|&view| match targets.color {
                        Some(color) => vec![color, targets.depth, view],
                        None => vec![view, targets.depth],
                    })
                    .collect(),
                targets.swapchain_extent,
            ),
        };

        for attachments in views {
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(pass.render_pass.handle())
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let handle = unsafe { device.create_framebuffer(&info, None)? };
            pass.framebuffers.push(Framebuffer {
                context: self.context.clone(),
                handle,
            });
        }
        pass.extent = extent;
        Ok(())
    }

    /// Points binding `binding` of every slot's set at a sampled image.
    pub fn write_image(
        &self,
        kind: PassKind,
        binding: u32,
        images: &[(vk::ImageView, vk::Sampler)],
    ) -> Result<()> {
        let pass = self.require(kind)?;
        let infos: Vec<vk::DescriptorImageInfo> = images
            .iter()
            .map(|&(view, sampler)| vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = pass
            .sets
            .iter()
            .map(|&set| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&infos)
                    .build()
            })
            .collect();
        unsafe { self.context.device().update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    /// Points binding `binding` of one slot's set at a buffer.
    pub fn write_buffer(
        &self,
        kind: PassKind,
        slot: usize,
        binding: u32,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) -> Result<()> {
        let pass = self.require(kind)?;
        let ty = pass
            .descriptor
            .bindings
            .get(binding as usize)
            .map(|binding| binding.descriptor_type())
            .ok_or_else(|| RendererError::pipeline(kind, format!("no binding {binding}")))?;
        let set = pass
            .descriptor_set(slot)
            .ok_or_else(|| RendererError::pipeline(kind, format!("no descriptor set for slot {slot}")))?;
        let info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(&info)
            .build();
        unsafe { self.context.device().update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn require(&self, kind: PassKind) -> Result<&PassResources> {
        self.get(kind)
            .ok_or_else(|| RendererError::pipeline(kind, "pass is not registered"))
    }
}

fn create_render_pass(
    device: &ash::Device,
    descriptor: &PassDescriptor,
    formats: PassFormats,
) -> Result<vk::RenderPass> {
    let load_op = match descriptor.load {
        AttachmentLoad::Load => vk::AttachmentLoadOp::LOAD,
        AttachmentLoad::Clear => vk::AttachmentLoadOp::CLEAR,
    };
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let resolve_ref = vk::AttachmentReference {
        attachment: 2,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };

    let mut attachments = Vec::with_capacity(3);
    let multisampled = descriptor.target.is_swap_dependent()
        && formats.samples != vk::SampleCountFlags::TYPE_1;
    if descriptor.target.is_swap_dependent() {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(formats.swapchain)
                .samples(formats.samples)
                .load_op(load_op)
                .store_op(if multisampled {
                    vk::AttachmentStoreOp::DONT_CARE
                } else {
                    vk::AttachmentStoreOp::STORE
                })
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(if multisampled {
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                } else {
                    descriptor.final_layout.to_vk()
                })
                .build(),
        );
    } else {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(formats.offscreen)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(descriptor.initial_layout.to_vk())
                .final_layout(descriptor.final_layout.to_vk())
                .build(),
        );
    }
    if descriptor.depth {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(formats.depth)
                .samples(formats.samples)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        );
    }
    if multisampled {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(formats.swapchain)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::DONT_CARE)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(descriptor.final_layout.to_vk())
                .build(),
        );
    }

    let color_refs = [color_ref];
    let resolve_refs = [resolve_ref];
    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if descriptor.depth {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }
    if multisampled {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }
    let subpasses = [subpass.build()];

    let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let dependencies = [
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(attachment_stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build(),
        vk::SubpassDependency::builder()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .build(),
    ];

    let info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    Ok(unsafe { device.create_render_pass(&info, None)? })
}

fn load_shader(
    context: &Arc<DeviceContext>,
    assets: &dyn AssetSource,
    path: &std::path::Path,
) -> Result<ShaderModule> {
    let words = parse_spirv(&assets.shader_bytes(path)?)?;
    let info = vk::ShaderModuleCreateInfo::builder().code(&words);
    Ok(ShaderModule {
        handle: unsafe { context.device().create_shader_module(&info, None)? },
        context: context.clone(),
    })
}

fn create_pipeline(
    context: &Arc<DeviceContext>,
    descriptor: &PassDescriptor,
    render_pass: vk::RenderPass,
    set_layout: vk::DescriptorSetLayout,
    formats: PassFormats,
    assets: &dyn AssetSource,
) -> Result<Pipeline> {
    let device = context.device();
    // Modules only need to live until the pipeline exists.
    let vertex = load_shader(context, assets, &descriptor.vertex_shader)?;
    let fragment = load_shader(context, assets, &descriptor.fragment_shader)?;

    let entry = CStr::from_bytes_with_nul(b"main\0")
        .map_err(|err| RendererError::pipeline(descriptor.kind, err.to_string()))?;
    // Fragment constant_id 0 sizes the sampler array.
    let texture_count = descriptor.bindings.iter().find_map(|binding| match binding {
        BindingKind::SampledImageArray(count) => Some(*count),
        _ => None,
    });
    let spec_entries = [vk::SpecializationMapEntry {
        constant_id: 0,
        offset: 0,
        size: std::mem::size_of::<u32>(),
    }];
    let spec_data = texture_count.unwrap_or(1).to_ne_bytes();
    let specialization = vk::SpecializationInfo::builder()
        .map_entries(&spec_entries)
        .data(&spec_data);
    let mut fragment_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(fragment.handle())
        .name(entry);
    if texture_count.is_some() {
        fragment_stage = fragment_stage.specialization_info(&specialization);
    }
    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex.handle())
            .name(entry)
            .build(),
        fragment_stage.build(),
    ];

    let bindings = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let samples = if descriptor.target.is_swap_dependent() {
        formats.samples
    } else {
        vk::SampleCountFlags::TYPE_1
    };
    let multisample =
        vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(samples);
    let blend_attachments = [alpha_blend_attachment()];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&blend_attachments);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(descriptor.depth)
        .depth_write_enable(descriptor.depth)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .stencil_test_enable(false);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let push_ranges = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size: std::mem::size_of::<StampPushConstants>() as u32,
    }];
    let set_layouts = [set_layout];
    let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
    if descriptor.push_constants {
        layout_info = layout_info.push_constant_ranges(&push_ranges);
    }
    let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

    let info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .depth_stencil_state(&depth_stencil)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let created =
        unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None) };
    match created {
        Ok(pipelines) if !pipelines.is_empty() => Ok(Pipeline {
            context: context.clone(),
            layout,
            handle: pipelines[0],
        }),
        Ok(_) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(RendererError::pipeline(descriptor.kind, "driver returned no pipeline"))
        }
        Err((partial, err)) => {
            unsafe {
                for pipeline in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    device.destroy_pipeline(pipeline, None);
                }
                device.destroy_pipeline_layout(layout, None);
            }
            Err(RendererError::pipeline(descriptor.kind, err.to_string()))
        }
    }
}
