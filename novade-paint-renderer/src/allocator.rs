//! GPU memory: buffers, images, samplers and the one-shot transfer path.
//!
//! Every handle created here is wrapped in an owner that destroys it on
//! drop and holds the [`DeviceContext`] alive until it does.

use ash::vk;
use bytemuck::Pod;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::DeviceContext;
use crate::error::{RendererError, Result};
use crate::layout::{cmd_transition, ImageLayout};

/// Index of the first memory type allowed by `type_bits` whose property
/// flags contain `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    memory_properties.memory_types[..memory_properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(properties)
        })
        .map(|(index, _)| index as u32)
        .ok_or(RendererError::OutOfDeviceMemory {
            type_bits,
            properties,
        })
}

/// Rejects a write of `len` bytes at `offset` that does not fit in `size`.
fn check_write_range(
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    size: vk::DeviceSize,
) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RendererError::BufferOverrun { offset, len, size }),
    }
}

pub struct Buffer {
    context: Arc<DeviceContext>,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
}

impl Buffer {
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Maps the whole buffer for the rest of its life. Only valid for
    /// host-visible memory.
    pub fn map_persistent(&mut self) -> Result<()> {
        if self.mapped.is_some() {
            return Ok(());
        }
        let ptr = unsafe {
            self.context.device().map_memory(
                self.memory,
                0,
                self.size,
                vk::MemoryMapFlags::empty(),
            )?
        };
        self.mapped = NonNull::new(ptr.cast::<u8>());
        Ok(())
    }

    /// Copies `data` into the mapped range starting at byte `offset`.
    pub fn write<T: Pod>(&mut self, offset: vk::DeviceSize, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        check_write_range(offset, bytes.len() as vk::DeviceSize, self.size)?;
        let Some(ptr) = self.mapped else {
            return Err(RendererError::BufferNotMapped);
        };
        // SAFETY: the mapping covers `size` bytes and the write ends within it.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe {
            if self.mapped.take().is_some() {
                device.unmap_memory(self.memory);
            }
            device.destroy_buffer(self.handle, None);
            device.free_memory(self.memory, None);
        }
    }
}

// The mapping is only touched through `&mut self`.
unsafe impl Send for Buffer {}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageDesc {
    /// Single-sampled, device-local colour image.
    pub fn color(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }
}

/// An image, its memory and a 2D view over all of it.
pub struct Image {
    context: Arc<DeviceContext>,
    handle: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Image {
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.handle, None);
            device.free_memory(self.memory, None);
        }
    }
}

pub struct Sampler {
    context: Arc<DeviceContext>,
    handle: vk::Sampler,
}

impl Sampler {
    /// Linear filtering, clamped to the edge so stamps never wrap.
    pub fn linear(context: Arc<DeviceContext>) -> Result<Self> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .max_lod(vk::LOD_CLAMP_NONE);
        let handle = unsafe { context.device().create_sampler(&info, None)? };
        Ok(Self { context, handle })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.context.device().destroy_sampler(self.handle, None) };
    }
}

pub struct CommandPool {
    context: Arc<DeviceContext>,
    handle: vk::CommandPool,
}

impl CommandPool {
    pub fn new(
        context: Arc<DeviceContext>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(flags);
        let handle = unsafe { context.device().create_command_pool(&info, None)? };
        Ok(Self { context, handle })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.context.device().allocate_command_buffers(&info)? })
    }

    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        unsafe {
            self.context
                .device()
                .free_command_buffers(self.handle, buffers)
        };
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.context.device().destroy_command_pool(self.handle, None) };
    }
}

/// Creates buffers and images and moves data into device-local memory.
pub struct ResourceAllocator {
    context: Arc<DeviceContext>,
    transfer_pool: CommandPool,
}

impl ResourceAllocator {
    pub fn new(context: Arc<DeviceContext>) -> Result<Self> {
        let family = context
            .queue_families()
            .graphics
            .ok_or(RendererError::NoSuitableDevice)?;
        let transfer_pool = CommandPool::new(
            context.clone(),
            family,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        Ok(Self {
            context,
            transfer_pool,
        })
    }

    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let memory_type = find_memory_type(
            self.context.memory_properties(),
            requirements.memory_type_bits,
            properties,
        )?;
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        Ok(unsafe { self.context.device().allocate_memory(&info, None)? })
    }

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Buffer> {
        let device = self.context.device();
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { device.create_buffer(&info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(handle) };
        let memory = match self.allocate(requirements, properties) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(handle, None) };
                return Err(err);
            }
        };
        // Wrap first so a failed bind still releases both handles.
        let buffer = Buffer {
            context: self.context.clone(),
            handle,
            memory,
            size,
            mapped: None,
        };
        unsafe { device.bind_buffer_memory(handle, memory, 0)? };
        Ok(buffer)
    }

    /// Host-visible, coherent buffer that stays mapped.
    pub fn create_mapped_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Buffer> {
        let mut buffer = self.create_buffer(
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.map_persistent()?;
        Ok(buffer)
    }

    pub fn create_image(&self, desc: &ImageDesc) -> Result<Image> {
        let device = self.context.device();
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { device.create_image(&info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(handle) };
        let memory = match self.allocate(requirements, desc.memory_properties) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(handle, None) };
                return Err(err);
            }
        };
        let bound = unsafe { device.bind_image_memory(handle, memory, 0) }.and_then(|_| {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(handle)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(desc.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: desc.aspect,
                    base_mip_level: 0,
                    level_count: desc.mip_levels,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            unsafe { device.create_image_view(&view_info, None) }
        });
        let view = match bound {
            Ok(view) => view,
            Err(err) => {
                unsafe {
                    device.destroy_image(handle, None);
                    device.free_memory(memory, None);
                }
                return Err(err.into());
            }
        };
        debug!(
            width = desc.width,
            height = desc.height,
            format = ?desc.format,
            "Image created."
        );
        Ok(Image {
            context: self.context.clone(),
            handle,
            memory,
            view,
            format: desc.format,
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
        })
    }

    /// Records `record` into a throwaway command buffer, submits it on the
    /// graphics queue and waits for the queue to drain.
    pub fn one_shot(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        let device = self.context.device();
        let buffers = self.transfer_pool.allocate(1)?;
        let result = (|| -> Result<()> {
            let command_buffer = buffers[0];
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(command_buffer, &begin)? };
            record(device, command_buffer);
            unsafe { device.end_command_buffer(command_buffer)? };

            let submit = vk::SubmitInfo::builder().command_buffers(&buffers).build();
            let queue = self.context.graphics_queue();
            unsafe {
                device.queue_submit(queue, &[submit], vk::Fence::null())?;
                device.queue_wait_idle(queue)?;
            }
            Ok(())
        })();
        self.transfer_pool.free(&buffers);
        result
    }

    /// Creates a device-local buffer holding `data`, filled through a
    /// staging copy.
    pub fn upload_buffer<T: Pod>(&self, data: &[T], usage: vk::BufferUsageFlags) -> Result<Buffer> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let buffer = self.create_buffer(
            size.max(1),
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        if size > 0 {
            self.copy_to_buffer(&buffer, 0, data)?;
        }
        Ok(buffer)
    }

    /// Writes `data` into `dst` at byte `offset` through a staging buffer.
    pub fn copy_to_buffer<T: Pod>(
        &self,
        dst: &Buffer,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<()> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let mut staging =
            self.create_mapped_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC)?;
        staging.write(0, data)?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size,
        };
        self.one_shot(|device, command_buffer| unsafe {
            device.cmd_copy_buffer(command_buffer, staging.handle(), dst.handle(), &[region]);
        })
    }

    /// Uploads tightly packed RGBA8 pixels into `image` and leaves it ready
    /// for sampling.
    pub fn upload_image(&self, image: &Image, rgba: &[u8]) -> Result<()> {
        let extent = image.extent();
        let expected = extent.width as usize * extent.height as usize * 4;
        if rgba.len() != expected {
            return Err(RendererError::Asset {
                path: "<memory>".into(),
                reason: format!("expected {expected} bytes of RGBA8, got {}", rgba.len()),
            });
        }
        let mut staging =
            self.create_mapped_buffer(expected as vk::DeviceSize, vk::BufferUsageFlags::TRANSFER_SRC)?;
        staging.write(0, rgba)?;

        let region = vk::BufferImageCopy::builder()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .build();
        self.one_shot(|device, command_buffer| unsafe {
            cmd_transition(
                device,
                command_buffer,
                &[(image.handle(), ImageLayout::Undefined, ImageLayout::TransferDst)],
            );
            device.cmd_copy_buffer_to_image(
                command_buffer,
                staging.handle(),
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            cmd_transition(
                device,
                command_buffer,
                &[(image.handle(), ImageLayout::TransferDst, ImageLayout::ShaderReadOnly)],
            );
        })?;
        info!(width = extent.width, height = extent.height, "Texture uploaded.");
        Ok(())
    }

    /// Clears `image` to `color` and moves it into `final_layout`.
    pub fn clear_image(&self, image: &Image, color: [f32; 4], final_layout: ImageLayout) -> Result<()> {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let clear = vk::ClearColorValue { float32: color };
        self.one_shot(|device, command_buffer| unsafe {
            cmd_transition(
                device,
                command_buffer,
                &[(image.handle(), ImageLayout::Undefined, ImageLayout::TransferDst)],
            );
            device.cmd_clear_color_image(
                command_buffer,
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                &[range],
            );
            if final_layout != ImageLayout::TransferDst {
                cmd_transition(
                    device,
                    command_buffer,
                    &[(image.handle(), ImageLayout::TransferDst, final_layout)],
                );
            }
        })
    }

    pub fn create_sampler(&self) -> Result<Sampler> {
        Sampler::linear(self.context.clone())
    }
}

/// Sampled textures uploaded at setup, bounded by a fixed capacity.
pub struct TextureSet {
    capacity: usize,
    images: Vec<Image>,
}

impl TextureSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            images: Vec::new(),
        }
    }

    /// Uploads an RGBA8 image and returns its index in the set.
    pub fn upload(
        &mut self,
        allocator: &ResourceAllocator,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<usize> {
        if self.images.len() >= self.capacity {
            return Err(RendererError::TextureCapacity {
                capacity: self.capacity,
            });
        }
        let image = allocator.create_image(&ImageDesc::color(
            width,
            height,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        ))?;
        allocator.upload_image(&image, rgba)?;
        self.images.push(image);
        Ok(self.images.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&Image> {
        self.images.get(index)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.iter()
    }
}
