//! Software compute backend.
//!
//! Buffers are plain host allocations and the command stream is replayed on
//! them synchronously: fills, writes and copies take effect, dispatches are
//! no-ops. This makes the remesh engine's buffer plumbing (clears, readback
//! staging, the one-iteration readback latency) fully observable in tests
//! without GPU hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{MeshopsError, Result};

use super::{
    BufferDescriptor, Command, CommandEncoder, ComputeBackend, ComputePipelineDescriptor,
    GpuBuffer, GpuPipeline, MemoryBudget,
};

/// Default simulated device-local heap budget: 4 GiB.
const DEFAULT_BUDGET: u64 = 4 << 30;

/// Software backend with host-memory buffers.
pub struct DummyBackend {
    budget: u64,
    allocated: AtomicU64,
}

impl DummyBackend {
    /// Create a backend with the default simulated memory budget.
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_BUDGET)
    }

    /// Create a backend with an explicit simulated memory budget.
    pub fn with_budget(budget: u64) -> Self {
        Self {
            budget,
            allocated: AtomicU64::new(0),
        }
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn storage(buffer: &GpuBuffer) -> Result<&Mutex<Vec<u8>>> {
    match buffer {
        GpuBuffer::Dummy { storage } => Ok(storage),
        #[cfg(feature = "wgpu-backend")]
        _ => Err(MeshopsError::Backend(
            "buffer belongs to a different backend".to_string(),
        )),
    }
}

impl ComputeBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<Arc<GpuBuffer>> {
        if descriptor.size == 0 {
            return Err(MeshopsError::ResourceCreationFailed(format!(
                "zero-sized buffer {:?}",
                descriptor.label
            )));
        }
        self.allocated.fetch_add(descriptor.size, Ordering::Relaxed);
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {}, host_visible: {})",
            descriptor.label,
            descriptor.size,
            descriptor.host_visible
        );
        Ok(Arc::new(GpuBuffer::Dummy {
            storage: Mutex::new(vec![0u8; descriptor.size as usize]),
        }))
    }

    fn create_pipeline(&self, descriptor: &ComputePipelineDescriptor) -> Result<Arc<GpuPipeline>> {
        log::trace!(
            "DummyBackend: creating pipeline {:?} ({} bindings)",
            descriptor.label,
            descriptor.binding_count
        );
        Ok(Arc::new(GpuPipeline::Dummy))
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let storage = storage(buffer)?;
        let mut bytes = storage.lock();
        let offset = offset as usize;
        if offset + data.len() > bytes.len() {
            return Err(MeshopsError::Backend(format!(
                "write of {} bytes at offset {offset} exceeds buffer size {}",
                data.len(),
                bytes.len()
            )));
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<Vec<u8>> {
        let storage = storage(buffer)?;
        let bytes = storage.lock();
        let offset = offset as usize;
        let size = size as usize;
        if offset + size > bytes.len() {
            return Err(MeshopsError::Backend(format!(
                "read of {size} bytes at offset {offset} exceeds buffer size {}",
                bytes.len()
            )));
        }
        Ok(bytes[offset..offset + size].to_vec())
    }

    fn submit(&self, encoder: CommandEncoder) -> Result<()> {
        log::trace!("DummyBackend: executing {} commands", encoder.len());
        for command in encoder.commands() {
            match command {
                Command::FillBuffer { buffer, value } => {
                    let storage = storage(buffer)?;
                    let mut bytes = storage.lock();
                    for chunk in bytes.chunks_mut(4) {
                        let src = value.to_le_bytes();
                        chunk.copy_from_slice(&src[..chunk.len()]);
                    }
                }
                Command::WriteBuffer { buffer, data } => {
                    self.write_buffer(buffer, 0, data)?;
                }
                Command::CopyBuffer { src, dst, size } => {
                    let size = *size as usize;
                    let src_bytes = storage(src)?.lock().clone();
                    let mut dst_bytes = storage(dst)?.lock();
                    if size > src_bytes.len() || size > dst_bytes.len() {
                        return Err(MeshopsError::Backend(format!(
                            "copy of {size} bytes exceeds buffer sizes ({} -> {})",
                            src_bytes.len(),
                            dst_bytes.len()
                        )));
                    }
                    dst_bytes[..size].copy_from_slice(&src_bytes[..size]);
                }
                Command::BindPipeline(_)
                | Command::BindBuffers(_)
                | Command::SetPushConstants(_)
                | Command::MemoryBarrier => {}
                Command::Dispatch { grid } => {
                    log::trace!("DummyBackend: dispatch {}x{}x{}", grid[0], grid[1], grid[2]);
                }
                Command::DispatchIndirect { offset, .. } => {
                    log::trace!("DummyBackend: indirect dispatch at offset {offset}");
                }
                Command::BeginLabel(label) => {
                    log::trace!("DummyBackend: label begin {label}");
                }
                Command::EndLabel => {}
            }
        }
        Ok(())
    }

    fn wait_idle(&self) {
        // Submissions complete synchronously.
    }

    fn memory_budget(&self) -> MemoryBudget {
        MemoryBudget {
            budget: self.budget,
            usage: self.allocated.load(Ordering::Relaxed),
        }
    }
}
