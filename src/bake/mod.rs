//! Ray-traced baking support.
//!
//! Baking tessellates triangles to their subdivision level and traces rays
//! against the whole mesh, which can exceed device memory for dense meshes.
//! [`batch`] splits the work into memory-bounded contiguous ranges.

pub mod batch;

pub use batch::{compute_batches, find_upper_bound, GeometryBatch};
