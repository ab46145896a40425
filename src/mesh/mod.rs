//! Host-side mesh data and adjacency.
//!
//! [`MeshData`] owns the per-vertex and per-triangle attribute arrays a bake
//! or remesh operation works on. [`Topology`] is a read-only adjacency
//! structure built once from the triangle index buffer; it backs the
//! watertight batch growth used by the partitioner.

mod data;
mod topology;

pub use data::{MeshAttributeFlags, MeshData};
pub use topology::Topology;

/// Number of micro-triangles produced by uniformly subdividing one triangle
/// to `level`.
pub fn subdiv_level_triangle_count(level: u32) -> u32 {
    1u32 << (2 * level)
}

/// Number of micro-vertices produced by uniformly subdividing one triangle
/// to `level`, counting no sharing with neighbouring triangles.
pub fn subdiv_level_vertex_count(level: u32) -> u32 {
    let n = (1u32 << level) + 1;
    n * (n + 1) / 2
}
