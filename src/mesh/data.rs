//! Owning host mesh with optional per-vertex and per-triangle attributes.

use bitflags::bitflags;
use glam::{Vec2, Vec3, Vec4};

bitflags! {
    /// Which attribute arrays a mesh carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MeshAttributeFlags: u32 {
        /// Per-vertex positions.
        const VERTEX_POSITION = 1 << 0;
        /// Per-vertex normals.
        const VERTEX_NORMAL = 1 << 1;
        /// Per-vertex tangents (xyz) with handedness in w.
        const VERTEX_TANGENT = 1 << 2;
        /// Per-vertex texture coordinates.
        const VERTEX_TEXCOORD = 1 << 3;
        /// Per-vertex displacement directions.
        const VERTEX_DIRECTION = 1 << 4;
        /// Per-vertex displacement direction bounds (bias, scale).
        const VERTEX_DIRECTION_BOUNDS = 1 << 5;
        /// Per-vertex decimation importance.
        const VERTEX_IMPORTANCE = 1 << 6;
        /// Triangle vertex indices.
        const TRIANGLE_VERTICES = 1 << 7;
        /// Per-triangle displacement subdivision levels.
        const TRIANGLE_SUBDIV_LEVELS = 1 << 8;
        /// Per-triangle primitive flags (edge decimation flags etc.).
        const TRIANGLE_PRIMITIVE_FLAGS = 1 << 9;
    }
}

/// Host mesh data consumed and produced by bake batching and remeshing.
///
/// Attribute arrays are either empty or sized to the vertex/triangle counts;
/// [`MeshData::attributes`] reports which ones are populated. The remesh
/// engine shrinks the mesh in place via [`MeshData::resize`] once the final
/// decimated counts are known.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    /// Per-vertex positions.
    pub positions: Vec<Vec3>,
    /// Per-vertex normals.
    pub normals: Vec<Vec3>,
    /// Per-vertex tangents, handedness in `w`.
    pub tangents: Vec<Vec4>,
    /// Per-vertex texture coordinates.
    pub texcoords: Vec<Vec2>,
    /// Per-vertex displacement directions.
    pub directions: Vec<Vec3>,
    /// Per-vertex displacement bounds: `x` = bias, `y` = scale.
    pub direction_bounds: Vec<Vec2>,
    /// Per-vertex decimation importance in `[0, 1]`.
    pub importance: Vec<f32>,
    /// Triangle vertex indices.
    pub triangle_vertices: Vec<[u32; 3]>,
    /// Per-triangle displacement subdivision levels.
    pub triangle_subdivision_levels: Vec<u16>,
    /// Per-triangle primitive flags.
    pub triangle_primitive_flags: Vec<u8>,
}

impl MeshData {
    /// Number of triangles.
    pub fn triangle_count(&self) -> u32 {
        self.triangle_vertices.len() as u32
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> u32 {
        self.positions.len() as u32
    }

    /// Flags for every populated attribute array.
    pub fn attributes(&self) -> MeshAttributeFlags {
        let mut flags = MeshAttributeFlags::empty();
        let mut set = |cond: bool, flag| {
            if cond {
                flags |= flag;
            }
        };
        set(!self.positions.is_empty(), MeshAttributeFlags::VERTEX_POSITION);
        set(!self.normals.is_empty(), MeshAttributeFlags::VERTEX_NORMAL);
        set(!self.tangents.is_empty(), MeshAttributeFlags::VERTEX_TANGENT);
        set(!self.texcoords.is_empty(), MeshAttributeFlags::VERTEX_TEXCOORD);
        set(!self.directions.is_empty(), MeshAttributeFlags::VERTEX_DIRECTION);
        set(
            !self.direction_bounds.is_empty(),
            MeshAttributeFlags::VERTEX_DIRECTION_BOUNDS,
        );
        set(!self.importance.is_empty(), MeshAttributeFlags::VERTEX_IMPORTANCE);
        set(
            !self.triangle_vertices.is_empty(),
            MeshAttributeFlags::TRIANGLE_VERTICES,
        );
        set(
            !self.triangle_subdivision_levels.is_empty(),
            MeshAttributeFlags::TRIANGLE_SUBDIV_LEVELS,
        );
        set(
            !self.triangle_primitive_flags.is_empty(),
            MeshAttributeFlags::TRIANGLE_PRIMITIVE_FLAGS,
        );
        flags
    }

    /// Resize every populated attribute array to the given counts.
    ///
    /// Shrinking truncates; growing appends zeroed elements. Used by the
    /// remesh engine before reading back the decimated mesh.
    pub fn resize(&mut self, triangle_count: u32, vertex_count: u32) {
        let tc = triangle_count as usize;
        let vc = vertex_count as usize;
        if !self.positions.is_empty() {
            self.positions.resize(vc, Vec3::ZERO);
        }
        if !self.normals.is_empty() {
            self.normals.resize(vc, Vec3::ZERO);
        }
        if !self.tangents.is_empty() {
            self.tangents.resize(vc, Vec4::ZERO);
        }
        if !self.texcoords.is_empty() {
            self.texcoords.resize(vc, Vec2::ZERO);
        }
        if !self.directions.is_empty() {
            self.directions.resize(vc, Vec3::ZERO);
        }
        if !self.direction_bounds.is_empty() {
            self.direction_bounds.resize(vc, Vec2::ZERO);
        }
        if !self.importance.is_empty() {
            self.importance.resize(vc, 0.0);
        }
        if !self.triangle_vertices.is_empty() {
            self.triangle_vertices.resize(tc, [0; 3]);
        }
        if !self.triangle_subdivision_levels.is_empty() {
            self.triangle_subdivision_levels.resize(tc, 0);
        }
        if !self.triangle_primitive_flags.is_empty() {
            self.triangle_primitive_flags.resize(tc, 0);
        }
        log::trace!("MeshData resized to {tc} triangles, {vc} vertices");
    }
}
