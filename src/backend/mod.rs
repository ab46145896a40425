//! Compute backend abstraction.
//!
//! The bake and remesh cores never talk to a GPU API directly; they record
//! work into a [`CommandEncoder`] and hand it to a [`ComputeBackend`] for a
//! single blocking submission. Two backends are provided:
//!
//! - `dummy` (default): software backend that keeps buffer contents in host
//!   memory and executes fills/copies for real, so the whole engine is
//!   testable without GPU hardware
//! - `wgpu-backend` (feature): compute-only wgpu implementation

pub mod dummy;
mod encoder;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_impl;

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::{MeshopsError, Result};

pub use dummy::DummyBackend;
pub use encoder::{BufferBinding, Command, CommandEncoder};

bitflags! {
    /// Usage flags for device buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be bound as a storage buffer.
        const STORAGE = 1 << 0;
        /// Buffer can be bound as a uniform buffer.
        const UNIFORM = 1 << 1;
        /// Buffer can back an indirect dispatch.
        const INDIRECT = 1 << 2;
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 3;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 4;
        /// Buffer is mappable for CPU reads.
        const MAP_READ = 1 << 5;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferDescriptor {
    /// Debug label.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
    /// Whether the buffer lives in host-visible memory.
    pub host_visible: bool,
}

impl BufferDescriptor {
    /// Create a new device-local buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
            host_visible: false,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Place the buffer in host-visible memory (readback destination).
    pub fn host_visible(mut self) -> Self {
        self.host_visible = true;
        self
    }
}

/// Handle to a device buffer.
pub enum GpuBuffer {
    /// Software backend buffer: contents live in host memory.
    Dummy {
        /// Zero-initialized backing storage.
        storage: Mutex<Vec<u8>>,
    },
    /// wgpu backend buffer.
    #[cfg(feature = "wgpu-backend")]
    Wgpu {
        buffer: wgpu::Buffer,
        size: u64,
    },
}

impl GpuBuffer {
    /// Byte size of the buffer.
    pub fn size(&self) -> u64 {
        match self {
            Self::Dummy { storage } => storage.lock().len() as u64,
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu { size, .. } => *size,
        }
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { .. } => f
                .debug_struct("GpuBuffer::Dummy")
                .field("size", &self.size())
                .finish(),
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu { size, .. } => f
                .debug_struct("GpuBuffer::Wgpu")
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a compute pipeline.
pub enum GpuPipeline {
    /// Software backend pipeline (dispatches are no-ops).
    Dummy,
    /// wgpu backend pipeline.
    #[cfg(feature = "wgpu-backend")]
    Wgpu {
        pipeline: wgpu::ComputePipeline,
        bind_group_layout: wgpu::BindGroupLayout,
    },
}

impl std::fmt::Debug for GpuPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy => write!(f, "GpuPipeline::Dummy"),
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu { .. } => write!(f, "GpuPipeline::Wgpu"),
        }
    }
}

/// Descriptor for creating a compute pipeline.
#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor<'a> {
    /// Debug label.
    pub label: &'a str,
    /// WGSL shader source.
    pub shader_source: &'a str,
    /// Entry point name.
    pub entry_point: &'a str,
    /// Number of storage buffer bindings the shader declares.
    pub binding_count: u32,
    /// Size of the push constant block, zero when unused.
    pub push_constant_size: u32,
}

/// Device-local heap budget and current usage, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    /// Bytes the heap can hold before allocations start failing.
    pub budget: u64,
    /// Bytes currently allocated from the heap.
    pub usage: u64,
}

/// Allocation granularity assumed by the batch memory estimate.
const ESTIMATE_ALIGNMENT: u64 = 4096;

/// Fixed per-batch overhead for pipelines and shader modules.
const ESTIMATE_FIXED_OVERHEAD: u64 = 100 * 1024 * 1024;

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Backend trait for the compute work issued by bake batching and remeshing.
pub trait ComputeBackend: Send + Sync + 'static {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Create a device buffer.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<Arc<GpuBuffer>>;

    /// Create a compute pipeline from WGSL source.
    fn create_pipeline(&self, descriptor: &ComputePipelineDescriptor) -> Result<Arc<GpuPipeline>>;

    /// Write bytes into a buffer, bypassing the command stream.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Read bytes out of a buffer. Blocks until the device is idle enough to
    /// observe all previously submitted writes.
    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<Vec<u8>>;

    /// Submit a recorded command stream and block until it completes.
    fn submit(&self, encoder: CommandEncoder) -> Result<()>;

    /// Block until all submitted work has finished. Called before buffer
    /// destruction so in-flight resources are never freed.
    fn wait_idle(&self);

    /// Budget and usage of the device-local memory heap.
    fn memory_budget(&self) -> MemoryBudget;

    /// Estimate the transient device memory one bake batch needs for the
    /// given tessellated triangle and vertex counts: vertex data, index data,
    /// ray-tracing acceleration structures, and a fixed pipeline overhead.
    ///
    /// Must be monotonically non-decreasing in both arguments; the batch
    /// partitioner binary-searches over it.
    fn estimate_batch_memory(&self, triangles: u64, vertices: u64) -> u64 {
        // Vertex attributes: position, normal, direction, uv as packed floats.
        let vertex_bytes = align_up(vertices * 48, ESTIMATE_ALIGNMENT);
        let index_bytes = align_up(triangles * 3 * 4, ESTIMATE_ALIGNMENT);
        // Conservative BLAS footprint guess per primitive.
        let accel_bytes = align_up(triangles * 64 + vertices * 16, ESTIMATE_ALIGNMENT);
        vertex_bytes + index_bytes + accel_bytes + ESTIMATE_FIXED_OVERHEAD
    }
}

/// Create the best available backend.
pub fn create_backend() -> Result<Arc<dyn ComputeBackend>> {
    #[cfg(feature = "wgpu-backend")]
    {
        match wgpu_impl::WgpuBackend::new() {
            Ok(backend) => {
                log::info!("Using wgpu compute backend");
                return Ok(Arc::new(backend));
            }
            Err(e) => {
                log::warn!("Failed to create wgpu backend: {e}");
            }
        }
    }

    log::info!("Using dummy compute backend");
    Ok(Arc::new(DummyBackend::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_is_monotone() {
        let backend = DummyBackend::new();
        let mut last = 0;
        for triangles in [0u64, 1, 10, 1000, 100_000] {
            let estimate = backend.estimate_batch_memory(triangles, triangles * 3);
            assert!(estimate >= last);
            last = estimate;
        }
    }

    #[test]
    fn test_estimate_includes_fixed_overhead() {
        let backend = DummyBackend::new();
        assert!(backend.estimate_batch_memory(0, 0) >= ESTIMATE_FIXED_OVERHEAD);
    }
}
