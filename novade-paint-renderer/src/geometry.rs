//! Shared vertex/index/material arrays and the per-frame draw queue.
//!
//! Geometry is appended during setup and never removed, so the offsets a
//! [`ModelHandle`] resolves to stay valid for the life of the store.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::ops::Range;
use tracing::debug;

use crate::allocator::{Buffer, ResourceAllocator};
use crate::config::CameraConfig;
use crate::error::{RendererError, Result};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        let vec3 = std::mem::size_of::<[f32; 3]>() as u32;
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: vec3,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: vec3 * 2,
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Material {
    pub texture_index: u32,
}

/// A run of indices drawn with one material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submesh {
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: i32,
    pub material: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub submeshes: Range<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelHandle(u32);

impl ModelHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmeshData {
    /// Indices relative to the model's own vertex list.
    pub indices: Vec<u32>,
    pub texture_index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelData {
    pub vertices: Vec<Vertex>,
    pub submeshes: Vec<SubmeshData>,
}

impl ModelData {
    /// The canvas quad: corners at ±1 on the XY plane, uv origin top-left.
    pub fn quad(texture_index: u32) -> Self {
        let white = [1.0, 1.0, 1.0];
        Self {
            vertices: vec![
                Vertex {
                    pos: [-1.0, -1.0, 0.0],
                    color: white,
                    uv: [0.0, 1.0],
                },
                Vertex {
                    pos: [1.0, -1.0, 0.0],
                    color: white,
                    uv: [1.0, 1.0],
                },
                Vertex {
                    pos: [1.0, 1.0, 0.0],
                    color: white,
                    uv: [1.0, 0.0],
                },
                Vertex {
                    pos: [-1.0, 1.0, 0.0],
                    color: white,
                    uv: [0.0, 0.0],
                },
            ],
            submeshes: vec![SubmeshData {
                indices: vec![0, 1, 2, 2, 3, 0],
                texture_index,
            }],
        }
    }
}

/// Append-only store behind the global vertex and index buffers.
#[derive(Debug, Clone)]
pub struct GeometryStore {
    num_textures: u32,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    submeshes: Vec<Submesh>,
    materials: Vec<Material>,
    models: Vec<Model>,
}

impl GeometryStore {
    pub fn new(num_textures: usize) -> Self {
        Self {
            num_textures: num_textures as u32,
            vertices: Vec::new(),
            indices: Vec::new(),
            submeshes: Vec::new(),
            materials: Vec::new(),
            models: Vec::new(),
        }
    }

    pub fn push_model(&mut self, data: &ModelData) -> Result<ModelHandle> {
        if let Some(bad) = data
            .submeshes
            .iter()
            .find(|submesh| submesh.texture_index >= self.num_textures)
        {
            debug!(texture_index = bad.texture_index, "Material references a missing texture.");
            return Err(RendererError::TextureCapacity {
                capacity: self.num_textures as usize,
            });
        }

        let vertex_offset = self.vertices.len() as i32;
        let first_submesh = self.submeshes.len() as u32;
        self.vertices.extend_from_slice(&data.vertices);
        for submesh in &data.submeshes {
            let material = self.materials.len() as u32;
            self.materials.push(Material {
                texture_index: submesh.texture_index,
            });
            self.submeshes.push(Submesh {
                first_index: self.indices.len() as u32,
                index_count: submesh.indices.len() as u32,
                vertex_offset,
                material,
            });
            self.indices.extend_from_slice(&submesh.indices);
        }
        let handle = ModelHandle(self.models.len() as u32);
        self.models.push(Model {
            submeshes: first_submesh..self.submeshes.len() as u32,
        });
        debug!(
            model = handle.0,
            vertices = data.vertices.len(),
            submeshes = data.submeshes.len(),
            "Model appended."
        );
        Ok(handle)
    }

    pub fn model(&self, handle: ModelHandle) -> Option<&Model> {
        self.models.get(handle.index())
    }

    pub fn submeshes(&self, model: &Model) -> &[Submesh] {
        &self.submeshes[model.submeshes.start as usize..model.submeshes.end as usize]
    }

    pub fn material(&self, index: u32) -> Option<Material> {
        self.materials.get(index as usize).copied()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Copies the vertex and index arrays into device-local buffers.
    pub fn upload(&self, allocator: &ResourceAllocator) -> Result<(Buffer, Buffer)> {
        let vertices = allocator.upload_buffer(&self.vertices, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let indices = allocator.upload_buffer(&self.indices, vk::BufferUsageFlags::INDEX_BUFFER)?;
        Ok((vertices, indices))
    }
}

/// Per-instance record read by the scene vertex shader from a storage
/// buffer, indexed by `gl_InstanceIndex`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub model: Mat4,
    pub texture_index: u32,
    pub _pad: [u32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// One submitted model: the materials it draws with and the slice of the
/// frame's instance array that belongs to it. Lives until the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawJob {
    pub model: ModelHandle,
    pub materials: Range<u32>,
    pub instances: Range<u32>,
}

/// Collects draw jobs for one frame, bounded by the instance capacity.
///
/// `reserved` instances at the top of the capacity are kept for
/// [`DrawQueue::submit_reserved`], so caller submissions can never starve
/// the draws the renderer adds itself.
#[derive(Debug)]
pub struct DrawQueue {
    capacity: usize,
    reserved: usize,
    jobs: Vec<DrawJob>,
    instances: Vec<InstanceData>,
}

impl DrawQueue {
    pub fn new(capacity: usize) -> Self {
        Self::with_reserved(capacity, 0)
    }

    pub fn with_reserved(capacity: usize, reserved: usize) -> Self {
        Self {
            capacity,
            reserved: reserved.min(capacity),
            jobs: Vec::new(),
            instances: Vec::with_capacity(capacity),
        }
    }

    /// Instances available to [`DrawQueue::submit`].
    pub fn capacity(&self) -> usize {
        self.capacity - self.reserved
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Queues `model` once per transform. Every submesh gets its own
    /// instance records so each carries its material's texture index.
    pub fn submit(
        &mut self,
        store: &GeometryStore,
        model: ModelHandle,
        transforms: &[Mat4],
    ) -> Result<()> {
        self.push(store, model, transforms, self.capacity - self.reserved)
    }

    /// Like [`DrawQueue::submit`], but may also use the reserved instances.
    pub fn submit_reserved(
        &mut self,
        store: &GeometryStore,
        model: ModelHandle,
        transforms: &[Mat4],
    ) -> Result<()> {
        self.push(store, model, transforms, self.capacity)
    }

    /// Drops every queued job without drawing it.
    pub fn clear(&mut self) {
        self.jobs.clear();
        self.instances.clear();
    }

    fn push(
        &mut self,
        store: &GeometryStore,
        model: ModelHandle,
        transforms: &[Mat4],
        limit: usize,
    ) -> Result<()> {
        let record = store
            .model(model)
            .ok_or_else(|| RendererError::Config(format!("unknown model handle {}", model.0)))?;
        let submeshes = store.submeshes(record);
        let needed = submeshes.len() * transforms.len();
        if self.instances.len() + needed > limit {
            return Err(RendererError::DrawQueueFull { capacity: limit });
        }

        let first = self.instances.len() as u32;
        for submesh in submeshes {
            let texture_index = store
                .material(submesh.material)
                .map_or(0, |material| material.texture_index);
            self.instances
                .extend(transforms.iter().map(|&transform| InstanceData {
                    model: transform,
                    texture_index,
                    _pad: [0; 3],
                }));
        }
        let materials = match (submeshes.first(), submeshes.last()) {
            (Some(first), Some(last)) => first.material..last.material + 1,
            _ => 0..0,
        };
        self.jobs.push(DrawJob {
            model,
            materials,
            instances: first..self.instances.len() as u32,
        });
        Ok(())
    }

    /// Empties the queue, returning the instance records to upload and one
    /// indexed draw per submesh.
    pub fn flush(&mut self, store: &GeometryStore) -> (Vec<InstanceData>, Vec<DrawCall>) {
        let mut draws = Vec::new();
        for job in self.jobs.drain(..) {
            let Some(model) = store.model(job.model) else {
                continue;
            };
            let submeshes = store.submeshes(model);
            if submeshes.is_empty() {
                continue;
            }
            let per_submesh = (job.instances.end - job.instances.start) / submeshes.len() as u32;
            for (n, submesh) in submeshes.iter().enumerate() {
                draws.push(DrawCall {
                    index_count: submesh.index_count,
                    instance_count: per_submesh,
                    first_index: submesh.first_index,
                    vertex_offset: submesh.vertex_offset,
                    first_instance: job.instances.start + n as u32 * per_submesh,
                });
            }
        }
        (std::mem::take(&mut self.instances), draws)
    }
}

/// Per-frame camera uniform.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GlobalUbo {
    pub view: Mat4,
    pub proj: Mat4,
}

impl GlobalUbo {
    /// Eye on +Z at the camera depth looking at the origin. The projection
    /// is flipped on Y for Vulkan's downward clip-space axis.
    pub fn for_camera(camera: &CameraConfig, aspect: f32) -> Self {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, camera.depth), Vec3::ZERO, Vec3::Y);
        let mut proj = Mat4::perspective_rh(camera.fov_y, aspect, camera.near, camera.far);
        proj.y_axis.y *= -1.0;
        Self { view, proj }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle(texture_index: u32) -> ModelData {
        let v = |x: f32| Vertex {
            pos: [x, 0.5, 0.0],
            color: [0.2, 0.4, 0.6],
            uv: [0.0, 0.0],
        };
        ModelData {
            vertices: vec![v(0.0), v(1.0), v(2.0)],
            submeshes: vec![SubmeshData {
                indices: vec![0, 1, 2],
                texture_index,
            }],
        }
    }

    #[test]
    fn appending_a_model_leaves_earlier_bytes_untouched() {
        let mut store = GeometryStore::new(4);
        let a = store.push_model(&ModelData::quad(0)).unwrap();
        let vertex_bytes: Vec<u8> = bytemuck::cast_slice(store.vertices()).to_vec();
        let index_bytes: Vec<u8> = bytemuck::cast_slice(store.indices()).to_vec();
        let a_submeshes = store.submeshes(store.model(a).unwrap()).to_vec();

        let b = store.push_model(&triangle(1)).unwrap();
        assert_ne!(a, b);
        let after: &[u8] = bytemuck::cast_slice(store.vertices());
        assert_eq!(&after[..vertex_bytes.len()], vertex_bytes.as_slice());
        let after: &[u8] = bytemuck::cast_slice(store.indices());
        assert_eq!(&after[..index_bytes.len()], index_bytes.as_slice());
        assert_eq!(store.submeshes(store.model(a).unwrap()), a_submeshes.as_slice());

        let b_submesh = store.submeshes(store.model(b).unwrap())[0];
        assert_eq!(b_submesh.vertex_offset, 4);
        assert_eq!(b_submesh.first_index, 6);
        assert_eq!(store.material(b_submesh.material).unwrap().texture_index, 1);
    }

    #[test]
    fn quad_uses_the_fixed_six_indices() {
        let quad = ModelData::quad(0);
        assert_eq!(quad.vertices.len(), 4);
        assert_eq!(quad.submeshes[0].indices, [0, 1, 2, 2, 3, 0]);
    }

    #[test]
    fn materials_beyond_the_texture_set_are_rejected() {
        let mut store = GeometryStore::new(2);
        assert!(matches!(
            store.push_model(&triangle(2)),
            Err(RendererError::TextureCapacity { capacity: 2 })
        ));
        assert!(store.vertices().is_empty());
    }

    #[test]
    fn draw_queue_expands_jobs_and_enforces_capacity() {
        let mut store = GeometryStore::new(4);
        let quad = store.push_model(&ModelData::quad(0)).unwrap();
        let tri = store.push_model(&triangle(3)).unwrap();

        let mut queue = DrawQueue::new(3);
        queue.submit(&store, quad, &[Mat4::IDENTITY]).unwrap();
        queue
            .submit(&store, tri, &[Mat4::from_translation(Vec3::X); 2])
            .unwrap();
        assert!(matches!(
            queue.submit(&store, quad, &[Mat4::IDENTITY]),
            Err(RendererError::DrawQueueFull { capacity: 3 })
        ));

        let (instances, draws) = queue.flush(&store);
        assert!(queue.is_empty());
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[1].texture_index, 3);
        assert_eq!(
            draws,
            vec![
                DrawCall {
                    index_count: 6,
                    instance_count: 1,
                    first_index: 0,
                    vertex_offset: 0,
                    first_instance: 0,
                },
                DrawCall {
                    index_count: 3,
                    instance_count: 2,
                    first_index: 6,
                    vertex_offset: 4,
                    first_instance: 1,
                },
            ]
        );

        // Flushing frees the capacity for the next frame.
        queue.submit(&store, quad, &[Mat4::IDENTITY; 3]).unwrap();
    }

    #[test]
    fn reserved_instances_survive_a_full_queue() {
        let mut store = GeometryStore::new(4);
        let quad = store.push_model(&ModelData::quad(0)).unwrap();

        let mut queue = DrawQueue::with_reserved(8, 1);
        assert_eq!(queue.capacity(), 7);
        queue.submit(&store, quad, &[Mat4::IDENTITY; 7]).unwrap();
        assert!(matches!(
            queue.submit(&store, quad, &[Mat4::IDENTITY]),
            Err(RendererError::DrawQueueFull { capacity: 7 })
        ));
        queue
            .submit_reserved(&store, quad, &[Mat4::IDENTITY])
            .expect("reserved instance is always available");

        let (instances, draws) = queue.flush(&store);
        assert_eq!(instances.len(), 8);
        assert_eq!(draws.len(), 2);
    }

    #[test]
    fn clearing_frees_the_queue_for_the_next_frame() {
        let mut store = GeometryStore::new(4);
        let quad = store.push_model(&ModelData::quad(0)).unwrap();
        let mut queue = DrawQueue::new(2);
        queue.submit(&store, quad, &[Mat4::IDENTITY; 2]).unwrap();

        queue.clear();
        assert!(queue.is_empty());
        let (instances, draws) = queue.flush(&store);
        assert!(instances.is_empty() && draws.is_empty());
        queue.submit(&store, quad, &[Mat4::IDENTITY; 2]).unwrap();
    }

    #[test]
    fn camera_places_canvas_center_at_screen_center() {
        let ubo = GlobalUbo::for_camera(&CameraConfig::default(), 1.0);
        let clip = ubo.proj * ubo.view * glam::Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!((clip.x / clip.w).abs() < 1e-6);
        assert!((clip.y / clip.w).abs() < 1e-6);
    }
}
