//! Triangle-edge-vertex adjacency over a fixed mesh.

use std::collections::HashMap;

use crate::error::{MeshopsError, Result};

/// Compressed adjacency range: offset and count into a shared connection array.
#[derive(Debug, Clone, Copy, Default)]
struct ConnectionRange {
    first: u32,
    count: u32,
}

/// Read-only adjacency structure over a triangle mesh.
///
/// Built once from the index buffer and borrowed for the lifetime of a bake
/// or remesh call. Provides the one-ring triangle selection growth that keeps
/// independently processed batches watertight under ray tracing.
#[derive(Debug, Clone)]
pub struct Topology {
    vertex_count: u32,

    triangle_vertices: Vec<[u32; 3]>,
    triangle_edges: Vec<[u32; 3]>,

    edge_vertices: Vec<[u32; 2]>,

    vertex_triangle_ranges: Vec<ConnectionRange>,
    vertex_triangle_connections: Vec<u32>,

    vertex_edge_ranges: Vec<ConnectionRange>,
    vertex_edge_connections: Vec<u32>,

    edge_triangle_ranges: Vec<ConnectionRange>,
    edge_triangle_connections: Vec<u32>,
}

impl Topology {
    /// Build adjacency from a triangle index buffer.
    ///
    /// # Errors
    ///
    /// Returns [`MeshopsError::TopologyInconsistency`] when an index is out of
    /// range or a triangle is degenerate (repeated vertex).
    pub fn build(triangle_vertices: &[[u32; 3]], vertex_count: u32) -> Result<Self> {
        for (i, tri) in triangle_vertices.iter().enumerate() {
            if tri.iter().any(|&v| v >= vertex_count) {
                return Err(MeshopsError::TopologyInconsistency(format!(
                    "triangle {i} references vertex out of range"
                )));
            }
            if tri[0] == tri[1] || tri[1] == tri[2] || tri[0] == tri[2] {
                return Err(MeshopsError::TopologyInconsistency(format!(
                    "triangle {i} is degenerate"
                )));
            }
        }

        // Deduplicate undirected edges.
        let mut edge_ids: HashMap<(u32, u32), u32> = HashMap::new();
        let mut edge_vertices: Vec<[u32; 2]> = Vec::new();
        let mut triangle_edges = Vec::with_capacity(triangle_vertices.len());
        for tri in triangle_vertices {
            let mut edges = [0u32; 3];
            for (e, edge) in edges.iter_mut().enumerate() {
                let a = tri[e];
                let b = tri[(e + 1) % 3];
                let key = (a.min(b), a.max(b));
                *edge = *edge_ids.entry(key).or_insert_with(|| {
                    edge_vertices.push([key.0, key.1]);
                    (edge_vertices.len() - 1) as u32
                });
            }
            triangle_edges.push(edges);
        }

        let vertex_to_triangles = build_connections(
            vertex_count as usize,
            triangle_vertices.iter().enumerate().flat_map(|(t, tri)| {
                tri.iter().map(move |&v| (v as usize, t as u32))
            }),
        );
        let vertex_to_edges = build_connections(
            vertex_count as usize,
            edge_vertices.iter().enumerate().flat_map(|(e, ev)| {
                ev.iter().map(move |&v| (v as usize, e as u32))
            }),
        );
        let edge_to_triangles = build_connections(
            edge_vertices.len(),
            triangle_edges.iter().enumerate().flat_map(|(t, edges)| {
                edges.iter().map(move |&e| (e as usize, t as u32))
            }),
        );

        Ok(Self {
            vertex_count,
            triangle_vertices: triangle_vertices.to_vec(),
            triangle_edges,
            edge_vertices,
            vertex_triangle_ranges: vertex_to_triangles.0,
            vertex_triangle_connections: vertex_to_triangles.1,
            vertex_edge_ranges: vertex_to_edges.0,
            vertex_edge_connections: vertex_to_edges.1,
            edge_triangle_ranges: edge_to_triangles.0,
            edge_triangle_connections: edge_to_triangles.1,
        })
    }

    /// Number of triangles.
    pub fn triangle_count(&self) -> u32 {
        self.triangle_vertices.len() as u32
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of unique undirected edges.
    pub fn edge_count(&self) -> u32 {
        self.edge_vertices.len() as u32
    }

    /// Vertex indices of a triangle.
    pub fn triangle_vertices(&self, triangle: u32) -> [u32; 3] {
        self.triangle_vertices[triangle as usize]
    }

    /// Edge indices of a triangle.
    pub fn triangle_edges(&self, triangle: u32) -> [u32; 3] {
        self.triangle_edges[triangle as usize]
    }

    /// Triangles connected to a vertex.
    pub fn vertex_triangles(&self, vertex: u32) -> &[u32] {
        let range = self.vertex_triangle_ranges[vertex as usize];
        let first = range.first as usize;
        &self.vertex_triangle_connections[first..first + range.count as usize]
    }

    /// Edges connected to a vertex.
    pub fn vertex_edges(&self, vertex: u32) -> &[u32] {
        let range = self.vertex_edge_ranges[vertex as usize];
        let first = range.first as usize;
        &self.vertex_edge_connections[first..first + range.count as usize]
    }

    /// Triangles sharing an edge.
    pub fn edge_triangles(&self, edge: u32) -> &[u32] {
        let range = self.edge_triangle_ranges[edge as usize];
        let first = range.first as usize;
        &self.edge_triangle_connections[first..first + range.count as usize]
    }

    /// Grow the triangle range `[first, first + count)` by one ring of
    /// topological neighbours.
    ///
    /// Returns the sorted set of triangle indices covering the range plus
    /// every triangle sharing a vertex with it. A ray grazing exactly on an
    /// edge shared by two independently baked batches must not miss both,
    /// so each batch bakes its neighbours too.
    ///
    /// # Errors
    ///
    /// Returns [`MeshopsError::TopologyInconsistency`] if the range is empty
    /// or reaches past the end of the mesh.
    pub fn grow_triangle_selection(&self, first: u32, count: u32) -> Result<Vec<u32>> {
        let end = first.checked_add(count).unwrap_or(u32::MAX);
        if count == 0 || end > self.triangle_count() {
            return Err(MeshopsError::TopologyInconsistency(format!(
                "triangle selection [{first}, {end}) is outside mesh with {} triangles",
                self.triangle_count()
            )));
        }

        let mut selected = vec![false; self.triangle_vertices.len()];
        for tri in first..end {
            selected[tri as usize] = true;
            for &vertex in &self.triangle_vertices[tri as usize] {
                for &neighbour in self.vertex_triangles(vertex) {
                    selected[neighbour as usize] = true;
                }
            }
        }

        let selection: Vec<u32> = selected
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| s.then_some(i as u32))
            .collect();
        debug_assert!(selection.len() >= count as usize);
        Ok(selection)
    }
}

/// Build a CSR-style mapping from `item -> connected values`.
fn build_connections(
    item_count: usize,
    pairs: impl Iterator<Item = (usize, u32)> + Clone,
) -> (Vec<ConnectionRange>, Vec<u32>) {
    let mut ranges = vec![ConnectionRange::default(); item_count];
    for (item, _) in pairs.clone() {
        ranges[item].count += 1;
    }
    let mut offset = 0u32;
    for range in &mut ranges {
        range.first = offset;
        offset += range.count;
        range.count = 0;
    }
    let mut connections = vec![0u32; offset as usize];
    for (item, value) in pairs {
        let range = &mut ranges[item];
        connections[(range.first + range.count) as usize] = value;
        range.count += 1;
    }
    (ranges, connections)
}
