//! Device-resident mesh buffers.
//!
//! A [`DeviceMesh`] holds one storage buffer per requested attribute, packed
//! in the layout the remesh kernels consume: positions carry an
//! octahedral-encoded normal in their fourth lane, and per-triangle
//! subdivision levels share a word with the primitive flags. Buffers are
//! reference counted so the remesh resource table can alias them without
//! copies or ownership transfer.

use std::sync::Arc;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

use crate::backend::{BufferDescriptor, BufferUsage, GpuBuffer};
use crate::context::Context;
use crate::error::{MeshopsError, Result};
use crate::mesh::{MeshAttributeFlags, MeshData};

bitflags! {
    /// How device mesh buffers may be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceMeshUsageFlags: u32 {
        /// Kernels read the buffers.
        const COMPUTE_READ = 1 << 0;
        /// Kernels write the buffers (decimation shrinks the mesh in place).
        const COMPUTE_WRITE = 1 << 1;
        /// Buffers can be read back to the host.
        const READBACK = 1 << 2;
    }
}

/// Attribute and usage requirements of a device mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceMeshSettings {
    /// Attributes the mesh carries on the device.
    pub attrib_flags: MeshAttributeFlags,
    /// Usage the buffers were created with.
    pub usage_flags: DeviceMeshUsageFlags,
}

impl DeviceMeshSettings {
    /// Whether these settings satisfy `required` (every required attribute
    /// and usage bit is present).
    pub fn has_required(&self, required: &DeviceMeshSettings) -> bool {
        self.attrib_flags.contains(required.attrib_flags)
            && self.usage_flags.contains(required.usage_flags)
    }
}

/// Vertex position with the octahedral-encoded normal in the fourth lane.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PackedPositionNormal {
    position: [f32; 3],
    normal_oct: u32,
}

/// Displacement direction, padded for std430 array layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PackedDirection {
    direction: [f32; 3],
    _pad: f32,
}

/// Bytes per element for each packed attribute buffer.
pub const POSITION_NORMAL_STRIDE: u64 = 16;
pub const TANGENT_STRIDE: u64 = 16;
pub const TEXCOORD_STRIDE: u64 = 8;
pub const DIRECTION_STRIDE: u64 = 16;
pub const DIRECTION_BOUNDS_STRIDE: u64 = 8;
pub const IMPORTANCE_STRIDE: u64 = 4;
pub const TRIANGLE_VERTICES_STRIDE: u64 = 12;
pub const TRIANGLE_ATTRIBUTES_STRIDE: u64 = 4;

/// Mesh attributes resident in device buffers.
pub struct DeviceMesh {
    settings: DeviceMeshSettings,
    vertex_count: u32,
    triangle_count: u32,

    position_normal: Option<Arc<GpuBuffer>>,
    tangents: Option<Arc<GpuBuffer>>,
    texcoords: Option<Arc<GpuBuffer>>,
    directions: Option<Arc<GpuBuffer>>,
    direction_bounds: Option<Arc<GpuBuffer>>,
    importance: Option<Arc<GpuBuffer>>,
    triangle_vertices: Option<Arc<GpuBuffer>>,
    triangle_attributes: Option<Arc<GpuBuffer>>,
}

impl DeviceMesh {
    /// Create device buffers for every attribute in `settings` and upload the
    /// host data the mesh carries. Attributes requested but absent from the
    /// host mesh get zeroed buffers (the remesher generates them).
    pub fn create(
        context: &Context,
        mesh: &MeshData,
        settings: DeviceMeshSettings,
    ) -> Result<Self> {
        let vertex_count = mesh.vertex_count();
        let triangle_count = mesh.triangle_count();
        if vertex_count == 0 || triangle_count == 0 {
            return Err(MeshopsError::InvalidParameter(
                "device mesh requires a non-empty mesh".to_string(),
            ));
        }

        let backend = context.backend();
        let usage = BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let make = |label: &str, size: u64| {
            backend.create_buffer(&BufferDescriptor::new(size, usage).with_label(label))
        };
        let vc = vertex_count as u64;
        let tc = triangle_count as u64;
        let flags = settings.attrib_flags;
        let has = |flag| flags.contains(flag);

        let mut device_mesh = Self {
            settings,
            vertex_count,
            triangle_count,
            position_normal: has(MeshAttributeFlags::VERTEX_POSITION)
                .then(|| make("mesh position+normal", vc * POSITION_NORMAL_STRIDE))
                .transpose()?,
            tangents: has(MeshAttributeFlags::VERTEX_TANGENT)
                .then(|| make("mesh tangents", vc * TANGENT_STRIDE))
                .transpose()?,
            texcoords: has(MeshAttributeFlags::VERTEX_TEXCOORD)
                .then(|| make("mesh texcoords", vc * TEXCOORD_STRIDE))
                .transpose()?,
            directions: has(MeshAttributeFlags::VERTEX_DIRECTION)
                .then(|| make("mesh directions", vc * DIRECTION_STRIDE))
                .transpose()?,
            direction_bounds: has(MeshAttributeFlags::VERTEX_DIRECTION_BOUNDS)
                .then(|| make("mesh direction bounds", vc * DIRECTION_BOUNDS_STRIDE))
                .transpose()?,
            importance: has(MeshAttributeFlags::VERTEX_IMPORTANCE)
                .then(|| make("mesh importance", vc * IMPORTANCE_STRIDE))
                .transpose()?,
            triangle_vertices: has(MeshAttributeFlags::TRIANGLE_VERTICES)
                .then(|| make("mesh triangle indices", tc * TRIANGLE_VERTICES_STRIDE))
                .transpose()?,
            triangle_attributes: (has(MeshAttributeFlags::TRIANGLE_SUBDIV_LEVELS)
                || has(MeshAttributeFlags::TRIANGLE_PRIMITIVE_FLAGS))
                .then(|| make("mesh triangle attributes", tc * TRIANGLE_ATTRIBUTES_STRIDE))
                .transpose()?,
        };

        device_mesh.upload(context, mesh)?;
        log::debug!(
            "DeviceMesh created: {} triangles, {} vertices, attribs {:?}",
            triangle_count,
            vertex_count,
            flags
        );
        Ok(device_mesh)
    }

    /// Settings the mesh was created with.
    pub fn settings(&self) -> &DeviceMeshSettings {
        &self.settings
    }

    /// Number of vertices the buffers were sized for.
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of triangles the buffers were sized for.
    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    /// Packed position+normal buffer.
    pub fn position_normal_buffer(&self) -> Result<&Arc<GpuBuffer>> {
        require(&self.position_normal, "position+normal")
    }

    /// Tangent-space buffer.
    pub fn tangent_buffer(&self) -> Result<&Arc<GpuBuffer>> {
        require(&self.tangents, "tangents")
    }

    /// Texture-coordinate buffer.
    pub fn texcoord_buffer(&self) -> Result<&Arc<GpuBuffer>> {
        require(&self.texcoords, "texcoords")
    }

    /// Displacement-direction buffer.
    pub fn direction_buffer(&self) -> Result<&Arc<GpuBuffer>> {
        require(&self.directions, "directions")
    }

    /// Displacement direction-bounds buffer.
    pub fn direction_bounds_buffer(&self) -> Result<&Arc<GpuBuffer>> {
        require(&self.direction_bounds, "direction bounds")
    }

    /// Per-vertex importance buffer.
    pub fn importance_buffer(&self) -> Result<&Arc<GpuBuffer>> {
        require(&self.importance, "importance")
    }

    /// Triangle vertex-index buffer.
    pub fn triangle_vertices_buffer(&self) -> Result<&Arc<GpuBuffer>> {
        require(&self.triangle_vertices, "triangle indices")
    }

    /// Packed per-triangle subdivision level + primitive flags buffer.
    pub fn triangle_attributes_buffer(&self) -> Result<&Arc<GpuBuffer>> {
        require(&self.triangle_attributes, "triangle attributes")
    }

    fn upload(&mut self, context: &Context, mesh: &MeshData) -> Result<()> {
        let backend = context.backend();

        if let Some(buffer) = &self.position_normal {
            let packed: Vec<PackedPositionNormal> = mesh
                .positions
                .iter()
                .enumerate()
                .map(|(i, p)| PackedPositionNormal {
                    position: (*p).into(),
                    normal_oct: mesh
                        .normals
                        .get(i)
                        .map(|n| oct_encode(*n))
                        .unwrap_or_default(),
                })
                .collect();
            backend.write_buffer(buffer, 0, bytemuck::cast_slice(&packed))?;
        }
        if let Some(buffer) = &self.tangents {
            if !mesh.tangents.is_empty() {
                backend.write_buffer(buffer, 0, bytemuck::cast_slice(&mesh.tangents))?;
            }
        }
        if let Some(buffer) = &self.texcoords {
            if !mesh.texcoords.is_empty() {
                backend.write_buffer(buffer, 0, bytemuck::cast_slice(&mesh.texcoords))?;
            }
        }
        if let Some(buffer) = &self.directions {
            if !mesh.directions.is_empty() {
                let packed: Vec<PackedDirection> = mesh
                    .directions
                    .iter()
                    .map(|d| PackedDirection {
                        direction: (*d).into(),
                        _pad: 0.0,
                    })
                    .collect();
                backend.write_buffer(buffer, 0, bytemuck::cast_slice(&packed))?;
            }
        }
        if let Some(buffer) = &self.direction_bounds {
            if !mesh.direction_bounds.is_empty() {
                backend.write_buffer(buffer, 0, bytemuck::cast_slice(&mesh.direction_bounds))?;
            }
        }
        if let Some(buffer) = &self.importance {
            if !mesh.importance.is_empty() {
                backend.write_buffer(buffer, 0, bytemuck::cast_slice(&mesh.importance))?;
            }
        }
        if let Some(buffer) = &self.triangle_vertices {
            backend.write_buffer(buffer, 0, bytemuck::cast_slice(&mesh.triangle_vertices))?;
        }
        if let Some(buffer) = &self.triangle_attributes {
            let packed: Vec<u32> = (0..mesh.triangle_count() as usize)
                .map(|i| {
                    let level = mesh
                        .triangle_subdivision_levels
                        .get(i)
                        .copied()
                        .unwrap_or_default() as u32;
                    let flags = mesh
                        .triangle_primitive_flags
                        .get(i)
                        .copied()
                        .unwrap_or_default() as u32;
                    (level << 16) | flags
                })
                .collect();
            backend.write_buffer(buffer, 0, bytemuck::cast_slice(&packed))?;
        }
        Ok(())
    }

    /// Read device buffers back into the host mesh.
    ///
    /// The mesh must already be resized to the counts to read; only its
    /// populated attribute arrays are filled.
    pub fn readback(&self, context: &Context, mesh: &mut MeshData) -> Result<()> {
        let backend = context.backend();
        let vc = mesh.vertex_count() as u64;
        let tc = mesh.triangle_count() as u64;
        if mesh.vertex_count() > self.vertex_count || mesh.triangle_count() > self.triangle_count {
            return Err(MeshopsError::InvalidParameter(format!(
                "readback target ({tc} triangles, {vc} vertices) larger than device mesh ({}, {})",
                self.triangle_count, self.vertex_count
            )));
        }

        // pod_collect_to_vec throughout: readback bytes carry no alignment
        // guarantee, so in-place slice casts could panic.
        if let Some(buffer) = &self.position_normal {
            let bytes = backend.read_buffer(buffer, 0, vc * POSITION_NORMAL_STRIDE)?;
            let packed: Vec<PackedPositionNormal> = bytemuck::pod_collect_to_vec(&bytes);
            for (i, vertex) in packed.iter().enumerate() {
                mesh.positions[i] = Vec3::from(vertex.position);
                if !mesh.normals.is_empty() {
                    mesh.normals[i] = oct_decode(vertex.normal_oct);
                }
            }
        }
        if let Some(buffer) = &self.tangents {
            if !mesh.tangents.is_empty() {
                let bytes = backend.read_buffer(buffer, 0, vc * TANGENT_STRIDE)?;
                mesh.tangents = bytemuck::pod_collect_to_vec::<u8, Vec4>(&bytes);
            }
        }
        if let Some(buffer) = &self.texcoords {
            if !mesh.texcoords.is_empty() {
                let bytes = backend.read_buffer(buffer, 0, vc * TEXCOORD_STRIDE)?;
                mesh.texcoords = bytemuck::pod_collect_to_vec::<u8, Vec2>(&bytes);
            }
        }
        if let Some(buffer) = &self.directions {
            if !mesh.directions.is_empty() {
                let bytes = backend.read_buffer(buffer, 0, vc * DIRECTION_STRIDE)?;
                let packed: Vec<PackedDirection> = bytemuck::pod_collect_to_vec(&bytes);
                for (i, d) in packed.iter().enumerate() {
                    mesh.directions[i] = Vec3::from(d.direction);
                }
            }
        }
        if let Some(buffer) = &self.direction_bounds {
            if !mesh.direction_bounds.is_empty() {
                let bytes = backend.read_buffer(buffer, 0, vc * DIRECTION_BOUNDS_STRIDE)?;
                mesh.direction_bounds = bytemuck::pod_collect_to_vec::<u8, Vec2>(&bytes);
            }
        }
        if let Some(buffer) = &self.importance {
            if !mesh.importance.is_empty() {
                let bytes = backend.read_buffer(buffer, 0, vc * IMPORTANCE_STRIDE)?;
                mesh.importance = bytemuck::pod_collect_to_vec::<u8, f32>(&bytes);
            }
        }
        if let Some(buffer) = &self.triangle_vertices {
            let bytes = backend.read_buffer(buffer, 0, tc * TRIANGLE_VERTICES_STRIDE)?;
            mesh.triangle_vertices = bytemuck::pod_collect_to_vec::<u8, [u32; 3]>(&bytes);
        }
        if let Some(buffer) = &self.triangle_attributes {
            let bytes = backend.read_buffer(buffer, 0, tc * TRIANGLE_ATTRIBUTES_STRIDE)?;
            let packed: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
            for (i, word) in packed.iter().enumerate() {
                if !mesh.triangle_subdivision_levels.is_empty() {
                    mesh.triangle_subdivision_levels[i] = (word >> 16) as u16;
                }
                if !mesh.triangle_primitive_flags.is_empty() {
                    mesh.triangle_primitive_flags[i] = (word & 0xff) as u8;
                }
            }
        }
        log::debug!("DeviceMesh readback: {tc} triangles, {vc} vertices");
        Ok(())
    }
}

fn require<'a>(buffer: &'a Option<Arc<GpuBuffer>>, name: &str) -> Result<&'a Arc<GpuBuffer>> {
    buffer.as_ref().ok_or_else(|| {
        MeshopsError::MissingAttributes(format!("device mesh has no {name} buffer"))
    })
}

/// Encode a unit normal into two snorm16 octahedral coordinates.
fn oct_encode(normal: Vec3) -> u32 {
    let n = normal / (normal.x.abs() + normal.y.abs() + normal.z.abs()).max(f32::EPSILON);
    let (u, v) = if n.z >= 0.0 {
        (n.x, n.y)
    } else {
        (
            (1.0 - n.y.abs()) * n.x.signum(),
            (1.0 - n.x.abs()) * n.y.signum(),
        )
    };
    let to_snorm = |f: f32| ((f.clamp(-1.0, 1.0) * 32767.0).round() as i16) as u16 as u32;
    to_snorm(u) | (to_snorm(v) << 16)
}

/// Decode an octahedral-encoded normal back to a unit vector.
fn oct_decode(encoded: u32) -> Vec3 {
    let from_snorm = |bits: u32| (bits as u16 as i16) as f32 / 32767.0;
    let u = from_snorm(encoded & 0xffff);
    let v = from_snorm(encoded >> 16);
    let z = 1.0 - u.abs() - v.abs();
    let n = if z >= 0.0 {
        Vec3::new(u, v, z)
    } else {
        Vec3::new(
            (1.0 - v.abs()) * u.signum(),
            (1.0 - u.abs()) * v.signum(),
            z,
        )
    };
    n.normalize_or_zero()
}
