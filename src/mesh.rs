// Procedural meshes
//
// The sample only needs two shapes: a low-poly saucer for the swarm and a
// sphere to paint the starfield on from the inside. Both are built from UV
// spheres, wound counter-clockwise when seen from outside.

use anyhow::Result;
use ash::vk;
use glam::Vec3;
use std::f32::consts::PI;
use std::sync::Arc;

use crate::backend::{Buffer, VulkanDevice};

/// Interleaved vertex: position, normal, color (9 floats)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;

    pub fn binding_descriptions() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(Self::STRIDE)
            .input_rate(vk::VertexInputRate::VERTEX)]
    }

    /// Locations 0..=2: position, normal, color
    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        [0u32, 12, 24]
            .iter()
            .enumerate()
            .map(|(location, &offset)| {
                vk::VertexInputAttributeDescription::default()
                    .binding(0)
                    .location(location as u32)
                    .format(vk::Format::R32G32B32_SFLOAT)
                    .offset(offset)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// UV sphere centred on the origin
    pub fn uv_sphere(radius: f32, stacks: u32, slices: u32, color: Vec3) -> Self {
        let stacks = stacks.max(2);
        let slices = slices.max(3);
        let mut mesh = Mesh::default();

        for stack in 0..=stacks {
            let phi = PI * stack as f32 / stacks as f32;
            for slice in 0..=slices {
                let theta = 2.0 * PI * slice as f32 / slices as f32;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                mesh.vertices.push(Vertex {
                    position: (normal * radius).to_array(),
                    normal: normal.to_array(),
                    color: color.to_array(),
                });
            }
        }

        let row = slices + 1;
        for stack in 0..stacks {
            for slice in 0..slices {
                let a = stack * row + slice;
                let b = a + row;
                let c = b + 1;
                let d = a + 1;
                mesh.indices.extend_from_slice(&[a, c, b, a, d, c]);
            }
        }

        mesh
    }

    /// Non-uniform scale then translate, keeping normals perpendicular
    pub fn transformed(mut self, scale: Vec3, offset: Vec3) -> Self {
        for vertex in &mut self.vertices {
            let position = Vec3::from(vertex.position) * scale + offset;
            let normal = (Vec3::from(vertex.normal) / scale).normalize_or_zero();
            vertex.position = position.to_array();
            vertex.normal = normal.to_array();
        }
        self
    }

    pub fn append(&mut self, other: Mesh) {
        let base = self.vertices.len() as u32;
        self.vertices.extend(other.vertices);
        self.indices.extend(other.indices.into_iter().map(|i| i + base));
    }

    /// Flattened hull with a glass dome on top
    pub fn saucer() -> Self {
        let mut hull = Mesh::uv_sphere(1.0, 8, 16, Vec3::new(0.85, 0.2, 0.15))
            .transformed(Vec3::new(1.6, 0.35, 1.6), Vec3::ZERO);
        let dome = Mesh::uv_sphere(0.65, 6, 12, Vec3::new(0.6, 0.85, 1.0))
            .transformed(Vec3::ONE, Vec3::new(0.0, 0.25, 0.0));
        hull.append(dome);
        hull
    }

    /// Distance from the origin to the farthest vertex
    pub fn bounding_radius(&self) -> f32 {
        self.vertices
            .iter()
            .map(|v| Vec3::from(v.position).length())
            .fold(0.0, f32::max)
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }
}

/// Buffer handles a worker needs to draw a mesh
#[derive(Debug, Clone, Copy)]
pub struct MeshHandles {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
}

impl MeshHandles {
    pub fn bind_and_draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer, 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }
    }
}

/// A mesh living in GPU memory
pub struct GpuMesh {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
    pub bounding_radius: f32,
}

impl GpuMesh {
    pub fn upload(device: &Arc<VulkanDevice>, mesh: &Mesh, name: &str) -> Result<Self> {
        let vertex_buffer = Buffer::with_data(
            device,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
            &format!("{} vertices", name),
        )?;
        let index_buffer = Buffer::with_data(
            device,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.indices,
            &format!("{} indices", name),
        )?;

        log::debug!(
            "Uploaded mesh '{}': {} vertices, {} indices",
            name,
            mesh.vertices.len(),
            mesh.indices.len()
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: mesh.index_count(),
            bounding_radius: mesh.bounding_radius(),
        })
    }

    pub fn handles(&self) -> MeshHandles {
        MeshHandles {
            vertex_buffer: self.vertex_buffer.buffer,
            index_buffer: self.index_buffer.buffer,
            index_count: self.index_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sphere_topology() {
        let mesh = Mesh::uv_sphere(2.0, 8, 16, Vec3::ONE);
        assert_eq!(mesh.vertices.len(), 9 * 17);
        assert_eq!(mesh.indices.len(), 8 * 16 * 6);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
        assert_relative_eq!(mesh.bounding_radius(), 2.0, epsilon = 1e-5);
    }

    #[test]
    fn sphere_triangles_face_outwards() {
        let mesh = Mesh::uv_sphere(1.0, 6, 12, Vec3::ONE);
        for tri in mesh.indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(mesh.vertices[i as usize].position));
            let normal = (b - a).cross(c - a);
            // Pole triangles collapse to zero area
            if normal.length() < 1e-6 {
                continue;
            }
            let centre = (a + b + c) / 3.0;
            assert!(normal.dot(centre) > 0.0);
        }
    }

    #[test]
    fn saucer_is_wider_than_tall() {
        let saucer = Mesh::saucer();
        assert_relative_eq!(saucer.bounding_radius(), 1.6, epsilon = 1e-4);

        let max_y = saucer
            .vertices
            .iter()
            .map(|v| v.position[1])
            .fold(f32::MIN, f32::max);
        assert!(max_y < 1.0);
        assert!(saucer.indices.iter().all(|&i| (i as usize) < saucer.vertices.len()));
    }

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(Vertex::STRIDE, 36);
        let offsets: Vec<u32> = Vertex::attribute_descriptions().iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
    }
}
