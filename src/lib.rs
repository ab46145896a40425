//! GPU mesh operations for displacement micromap pipelines.
//!
//! Two subsystems share a compute backend abstraction:
//!
//! - [`bake`] partitions a mesh into memory-bounded batches for ray-traced
//!   displacement baking, growing each batch by one topological ring so
//!   batch seams stay watertight.
//! - [`remesh`] runs GPU decimation as an engine/algorithm pair: the engine
//!   owns buffers, submission and one-iteration-delayed readback, while a
//!   [`remesh::DecimationAlgorithm`] emits command streams.
//!
//! Host meshes live in [`mesh::MeshData`]; [`device_mesh::DeviceMesh`] holds
//! their device-resident form. All device work goes through the
//! [`backend::ComputeBackend`] trait, with a software implementation always
//! available and a wgpu implementation behind the `wgpu-backend` feature.

pub mod backend;
pub mod bake;
pub mod context;
pub mod device_mesh;
pub mod error;
pub mod mesh;
pub mod remesh;

pub use backend::{ComputeBackend, MemoryBudget};
pub use bake::{compute_batches, GeometryBatch};
pub use context::Context;
pub use device_mesh::{DeviceMesh, DeviceMeshSettings, DeviceMeshUsageFlags};
pub use error::{MeshopsError, Result};
pub use mesh::{MeshAttributeFlags, MeshData, Topology};
pub use remesh::{
    DecimationAlgorithm, RemeshOperator, RemeshParams, RemeshStatus, REQUIRED_ATTRIBUTES,
};
