//! Memory-bounded batch partitioning for ray-traced baking.
//!
//! The mesh is split into contiguous triangle ranges whose estimated device
//! footprint stays under a byte limit. Because the estimated cost of the
//! range `[start, last]` is monotone in `last`, each batch boundary is found
//! with a binary search instead of a linear scan. Every batch is then grown
//! by one ring of topological neighbours so rays that graze a shared edge hit
//! the same geometry no matter which batch traces them.

use crate::backend::ComputeBackend;
use crate::context::Context;
use crate::error::Result;
use crate::mesh::{subdiv_level_triangle_count, subdiv_level_vertex_count, MeshData, Topology};

/// One memory-bounded slice of the mesh to bake.
///
/// The batch *writes* displacement only for the contiguous range
/// `[triangle_offset, triangle_offset + triangle_count)` but *traces* the
/// grown selection in `triangles`, which additionally covers the one-ring
/// neighbourhood of the range.
#[derive(Debug, Clone)]
pub struct GeometryBatch {
    /// First triangle displacement is written for.
    pub triangle_offset: u32,
    /// Number of triangles displacement is written for.
    pub triangle_count: u32,
    /// Index of this batch within the partition.
    pub batch_index: u32,
    /// Total number of batches in the partition.
    pub total_batches: u32,
    /// The batch traces the whole mesh; `triangles` is left empty.
    pub all_triangles: bool,
    /// Sorted grown selection to trace. Empty when `all_triangles` is set.
    pub triangles: Vec<u32>,
}

impl GeometryBatch {
    fn whole_mesh(triangle_count: u32) -> Self {
        Self {
            triangle_offset: 0,
            triangle_count,
            batch_index: 0,
            total_batches: 1,
            all_triangles: true,
            triangles: Vec::new(),
        }
    }

    /// Number of triangles the batch traces.
    pub fn size(&self) -> u32 {
        if self.all_triangles {
            self.triangle_count
        } else {
            self.triangles.len() as u32
        }
    }

    /// The `i`-th traced triangle index.
    pub fn triangle(&self, i: u32) -> u32 {
        if self.all_triangles {
            self.triangle_offset + i
        } else {
            self.triangles[i as usize]
        }
    }
}

/// First value in `[low, high)` for which `func(value) > target`, or `high`
/// when no value exceeds it. `func` must be monotonically non-decreasing.
///
/// The midpoint is computed as `(low & high) + ((low ^ high) >> 1)`, the
/// carry-free average, so the search never overflows near `u32::MAX`.
pub fn find_upper_bound(
    mut low: u32,
    mut high: u32,
    target: u64,
    mut func: impl FnMut(u32) -> u64,
) -> u32 {
    while low < high {
        let mid = (low & high) + ((low ^ high) >> 1);
        if func(mid) > target {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    low
}

/// Estimated device cost of growing batches that begin at a fixed `start`.
struct BatchCostEstimator<'a> {
    topology: &'a Topology,
    subdivision_levels: &'a [u16],
    backend: &'a dyn ComputeBackend,
    start: u32,
}

impl BatchCostEstimator<'_> {
    /// Estimated bytes to bake `[start, batch_last]` including its one-ring
    /// growth. Monotone in `batch_last`: growing the range can only add
    /// triangles to the grown selection.
    fn cost(&self, batch_last: u32) -> u64 {
        let count = batch_last - self.start + 1;
        let selection = match self.topology.grow_triangle_selection(self.start, count) {
            Ok(selection) => selection,
            // Unpartitionable; the real growth below reports the error.
            Err(_) => return u64::MAX,
        };

        let mut micro_triangles = 0u64;
        let mut micro_vertices = 0u64;
        for &tri in &selection {
            let level = self.subdivision_levels[tri as usize] as u32;
            micro_triangles += subdiv_level_triangle_count(level) as u64;
            micro_vertices += subdiv_level_vertex_count(level) as u64;
        }
        self.backend.estimate_batch_memory(micro_triangles, micro_vertices)
    }
}

/// Partition the mesh into batches whose estimated device footprint stays
/// under `mem_limit_bytes`.
///
/// With no limit, no topology or no subdivision levels the whole mesh is a
/// single batch. A triangle too dense to fit the limit on its own becomes a
/// single-triangle batch with a warning rather than an error; rays must
/// still find it. An empty mesh partitions into no batches.
///
/// # Errors
///
/// A growth failure poisons the whole partition: a batch missing its
/// neighbourhood would bake silent holes, so the caller gets `Err` rather
/// than a shorter list.
pub fn compute_batches(
    context: &Context,
    mem_limit_bytes: u64,
    topology: Option<&Topology>,
    mesh: &MeshData,
) -> Result<Vec<GeometryBatch>> {
    let triangle_count = mesh.triangle_count();
    if triangle_count == 0 {
        return Ok(Vec::new());
    }

    let topology = match topology {
        Some(topology)
            if mem_limit_bytes > 0 && !mesh.triangle_subdivision_levels.is_empty() =>
        {
            topology
        }
        _ => {
            log::debug!("Baking all {triangle_count} triangles in one batch");
            return Ok(vec![GeometryBatch::whole_mesh(triangle_count)]);
        }
    };

    let backend = context.backend().as_ref();
    let mut batches: Vec<GeometryBatch> = Vec::new();
    let mut start = 0u32;
    while start < triangle_count {
        let estimator = BatchCostEstimator {
            topology,
            subdivision_levels: &mesh.triangle_subdivision_levels,
            backend,
            start,
        };
        let batch_end = find_upper_bound(start, triangle_count, mem_limit_bytes, |last| {
            estimator.cost(last)
        });

        let count = if batch_end == start {
            // Not even one triangle fits. Bake it alone and let the device
            // decide whether the allocation actually succeeds.
            let estimate = estimator.cost(start);
            if estimate == u64::MAX {
                // Growth failed; the real growth below reports the error.
            } else {
                log::warn!(
                    "batch {}: triangle {start} alone needs an estimated {:.1} MiB, \
                     {:.1} MiB over the {:.1} MiB limit",
                    batches.len(),
                    mib(estimate),
                    mib(estimate.saturating_sub(mem_limit_bytes)),
                    mib(mem_limit_bytes)
                );
            }
            1
        } else {
            batch_end - start
        };

        let triangles = topology.grow_triangle_selection(start, count)?;
        batches.push(GeometryBatch {
            triangle_offset: start,
            triangle_count: count,
            batch_index: 0,
            total_batches: 0,
            all_triangles: false,
            triangles,
        });
        start += count;
    }

    let total_batches = batches.len() as u32;
    for (index, batch) in batches.iter_mut().enumerate() {
        batch.batch_index = index as u32;
        batch.total_batches = total_batches;
    }
    log::info!(
        "Partitioned {triangle_count} triangles into {total_batches} batches \
         ({:.1} MiB limit)",
        mib(mem_limit_bytes)
    );
    Ok(batches)
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::DummyBackend;

    /// Mesh of `n` mutually disconnected triangles, all at subdivision
    /// level 3. Growth never adds neighbours, so batch costs are exactly
    /// proportional to the range.
    fn shards(n: u32) -> MeshData {
        MeshData {
            positions: vec![glam::Vec3::ZERO; (n * 3) as usize],
            triangle_vertices: (0..n).map(|i| [i * 3, i * 3 + 1, i * 3 + 2]).collect(),
            triangle_subdivision_levels: vec![3; n as usize],
            ..Default::default()
        }
    }

    fn context() -> Context {
        Context::with_backend(Arc::new(DummyBackend::new()))
    }

    fn topology_of(mesh: &MeshData) -> Topology {
        Topology::build(&mesh.triangle_vertices, mesh.vertex_count()).unwrap()
    }

    /// Estimated bytes for `k` disconnected level-3 triangles.
    fn cost_of(context: &Context, k: u64) -> u64 {
        context.backend().estimate_batch_memory(64 * k, 45 * k)
    }

    #[test]
    fn test_find_upper_bound_basic() {
        let costs = [10u64, 20, 30, 40, 50];
        let func = |i: u32| costs[i as usize];
        assert_eq!(find_upper_bound(0, 5, 25, func), 2);
        assert_eq!(find_upper_bound(0, 5, 10, func), 1);
        assert_eq!(find_upper_bound(0, 5, 5, func), 0);
        // Nothing exceeds the target.
        assert_eq!(find_upper_bound(0, 5, 100, func), 5);
    }

    #[test]
    fn test_find_upper_bound_near_u32_max() {
        // A naive (low + high) / 2 would overflow here.
        let low = u32::MAX - 8;
        let result = find_upper_bound(low, u32::MAX, 3, |v| (v - low) as u64);
        assert_eq!(result, low + 4);
    }

    #[test]
    fn test_empty_mesh_has_no_batches() {
        let mesh = MeshData::default();
        let batches = compute_batches(&context(), 1 << 30, None, &mesh).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_single_batch_shortcuts() {
        let mesh = shards(10);
        let topology = topology_of(&mesh);
        let context = context();

        // No memory limit.
        let batches = compute_batches(&context, 0, Some(&topology), &mesh).unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].all_triangles);
        assert_eq!(batches[0].size(), 10);
        assert_eq!(batches[0].triangle(3), 3);

        // No topology.
        let batches = compute_batches(&context, 1 << 20, None, &mesh).unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].all_triangles);

        // No subdivision levels.
        let mut flat = shards(10);
        flat.triangle_subdivision_levels.clear();
        let batches = compute_batches(&context, 1 << 20, Some(&topology), &flat).unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].all_triangles);
    }

    #[test]
    fn test_batches_tile_triangle_range() {
        let mesh = shards(10);
        let topology = topology_of(&mesh);
        let context = context();
        let limit = cost_of(&context, 4);

        let batches = compute_batches(&context, limit, Some(&topology), &mesh).unwrap();
        assert!(batches.len() > 1);

        let mut next = 0u32;
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.triangle_offset, next);
            assert_eq!(batch.batch_index, i as u32);
            assert_eq!(batch.total_batches, batches.len() as u32);
            next += batch.triangle_count;
        }
        assert_eq!(next, 10);
    }

    #[test]
    fn test_batches_respect_memory_limit() {
        let mesh = shards(10);
        let topology = topology_of(&mesh);
        let context = context();
        let limit = cost_of(&context, 4);

        let batches = compute_batches(&context, limit, Some(&topology), &mesh).unwrap();
        for batch in &batches {
            assert!(batch.triangle_count <= 4);
            assert!(cost_of(&context, batch.size() as u64) <= limit);
        }
    }

    #[test]
    fn test_oversized_triangle_gets_single_batch() {
        let mesh = shards(3);
        let topology = topology_of(&mesh);
        // Below even a single triangle's estimate, but non-zero.
        let batches = compute_batches(&context(), 1, Some(&topology), &mesh).unwrap();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.triangle_count == 1));
    }

    #[test]
    fn test_short_topology_poisons_the_partition() {
        // Topology covering fewer triangles than the mesh: growth fails for
        // the uncovered range and the whole partition errors out.
        let mesh = shards(4);
        let topology = Topology::build(&mesh.triangle_vertices[..2], mesh.vertex_count()).unwrap();
        let context = context();
        let limit = cost_of(&context, 1);

        let result = compute_batches(&context, limit, Some(&topology), &mesh);
        assert!(matches!(
            result,
            Err(crate::error::MeshopsError::TopologyInconsistency(_))
        ));
    }

    #[test]
    fn test_grown_selection_contains_batch_range() {
        // Grid of connected triangles, so growth really adds neighbours.
        let mut triangles = Vec::new();
        for y in 0..2u32 {
            for x in 0..2u32 {
                let v = |dx: u32, dy: u32| (y + dy) * 3 + x + dx;
                triangles.push([v(0, 0), v(1, 0), v(1, 1)]);
                triangles.push([v(0, 0), v(1, 1), v(0, 1)]);
            }
        }
        let mesh = MeshData {
            positions: vec![glam::Vec3::ZERO; 9],
            triangle_vertices: triangles,
            triangle_subdivision_levels: vec![3; 8],
            ..Default::default()
        };
        let topology = topology_of(&mesh);
        let context = context();
        let limit = cost_of(&context, 2);

        let batches = compute_batches(&context, limit, Some(&topology), &mesh).unwrap();
        for batch in &batches {
            for tri in batch.triangle_offset..batch.triangle_offset + batch.triangle_count {
                assert!(batch.triangles.contains(&tri));
            }
            assert!(batch.triangles.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
