//! Resource slot table shared between the engine and algorithm commands.
//!
//! Commands never hold buffer handles; they name resources by slot index.
//! Mesh-derived and engine-private resources occupy the fixed slots of
//! [`RemeshResource`], task-scoped scratch buffers are appended behind
//! [`SCRATCH_START`]. The table owns the lazily created host-visible
//! staging buffers used for readback, reused across iterations of a task.

use std::sync::Arc;

use crate::backend::{BufferDescriptor, BufferUsage, ComputeBackend, GpuBuffer};
use crate::error::{MeshopsError, Result};

/// Fixed resource slots a remesh task binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RemeshResource {
    /// Packed vertex positions and octahedral normals, aliased from the
    /// device mesh.
    VertexPositions = 0,
    /// Vertex texture coordinates, aliased from the device mesh.
    VertexTexcoords = 1,
    /// Spatial vertex hash, two words per vertex, engine-allocated.
    VertexHash = 2,
    /// Triangle vertex indices, aliased from the device mesh.
    TriangleVertices = 3,
    /// Per-vertex decimation importance, aliased from the device mesh.
    VertexImportance = 4,
    /// Displacement directions, aliased from the device mesh.
    VertexDirections = 5,
    /// Per-triangle user IDs, engine-allocated.
    TriangleUserIds = 6,
    /// Packed subdivision level and primitive flags, aliased from the
    /// device mesh.
    TriangleSubdivisionInfo = 7,
    /// Displacement direction bounds, aliased from the device mesh.
    VertexDirectionBounds = 8,
    /// Vertex merge history, three words per vertex, engine-allocated.
    VertexMerge = 9,
    /// Debug vertex counters, engine-allocated.
    DebugVertex = 10,
    /// Debug triangle counters, engine-allocated.
    DebugTriangle = 11,
    /// [`RemeshCurrentState`](crate::remesh::RemeshCurrentState) feedback
    /// struct, engine-allocated.
    CurrentState = 12,
}

impl RemeshResource {
    /// Number of fixed slots.
    pub const COUNT: u32 = 13;

    /// Slot index of this resource.
    pub fn slot(self) -> u32 {
        self as u32
    }
}

/// First slot index used for task-scoped scratch buffers.
pub const SCRATCH_START: u32 = RemeshResource::COUNT;

/// Slot index of the `i`-th scratch buffer of a task.
pub fn scratch_slot(i: u32) -> u32 {
    SCRATCH_START + i
}

/// One bound resource.
#[derive(Debug)]
pub struct ResourceBinding {
    /// Device buffer backing the slot.
    pub buffer: Arc<GpuBuffer>,
    /// Bytes the slot exposes to commands.
    pub size: u64,
    /// Host-visible staging buffer, created on the first `ReadResources`
    /// naming the slot and reused for the rest of the task.
    pub host_visible: Option<Arc<GpuBuffer>>,
}

/// Dense slot-indexed table of the resources a task may reference.
#[derive(Debug, Default)]
pub struct ResourceTable {
    slots: Vec<Option<ResourceBinding>>,
}

impl ResourceTable {
    /// Create a table with all fixed slots unbound.
    pub fn new() -> Self {
        Self {
            slots: (0..RemeshResource::COUNT).map(|_| None).collect(),
        }
    }

    /// Bind a buffer to a fixed slot.
    pub fn bind(&mut self, resource: RemeshResource, buffer: Arc<GpuBuffer>, size: u64) {
        self.slots[resource.slot() as usize] = Some(ResourceBinding {
            buffer,
            size,
            host_visible: None,
        });
    }

    /// Append a task-scoped scratch buffer, returning its slot index.
    pub fn push_scratch(&mut self, buffer: Arc<GpuBuffer>, size: u64) -> u32 {
        self.slots.push(Some(ResourceBinding {
            buffer,
            size,
            host_visible: None,
        }));
        (self.slots.len() - 1) as u32
    }

    /// Drop every scratch slot, keeping the fixed ones. Called at task end
    /// after the queue went idle.
    pub fn clear_scratch(&mut self) {
        self.slots.truncate(RemeshResource::COUNT as usize);
    }

    /// Look up a bound slot.
    pub fn binding(&self, slot: u32) -> Result<&ResourceBinding> {
        self.slots
            .get(slot as usize)
            .and_then(|b| b.as_ref())
            .ok_or(MeshopsError::UnboundResource(slot))
    }

    /// Host-visible staging buffer for a slot, created on first use.
    pub fn host_visible(
        &mut self,
        slot: u32,
        backend: &dyn ComputeBackend,
    ) -> Result<Arc<GpuBuffer>> {
        let binding = self
            .slots
            .get_mut(slot as usize)
            .and_then(|b| b.as_mut())
            .ok_or(MeshopsError::UnboundResource(slot))?;
        if let Some(host) = &binding.host_visible {
            return Ok(host.clone());
        }
        let host = backend.create_buffer(
            &BufferDescriptor::new(binding.size, BufferUsage::COPY_DST | BufferUsage::MAP_READ)
                .with_label(format!("remesh readback slot {slot}"))
                .host_visible(),
        )?;
        binding.host_visible = Some(host.clone());
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    fn buffer(backend: &DummyBackend, size: u64) -> Arc<GpuBuffer> {
        backend
            .create_buffer(&BufferDescriptor::new(size, BufferUsage::STORAGE))
            .unwrap()
    }

    #[test]
    fn test_unbound_slot_is_an_error() {
        let table = ResourceTable::new();
        let err = table.binding(RemeshResource::VertexHash.slot()).unwrap_err();
        assert!(matches!(err, MeshopsError::UnboundResource(2)));
    }

    #[test]
    fn test_scratch_slots_append_after_fixed_range() {
        let backend = DummyBackend::new();
        let mut table = ResourceTable::new();
        let slot = table.push_scratch(buffer(&backend, 64), 64);
        assert_eq!(slot, scratch_slot(0));
        assert_eq!(table.binding(slot).unwrap().size, 64);

        table.clear_scratch();
        assert!(table.binding(slot).is_err());
    }

    #[test]
    fn test_host_visible_buffer_is_reused() {
        let backend = DummyBackend::new();
        let mut table = ResourceTable::new();
        table.bind(RemeshResource::CurrentState, buffer(&backend, 16), 16);

        let slot = RemeshResource::CurrentState.slot();
        let first = table.host_visible(slot, &backend).unwrap();
        let second = table.host_visible(slot, &backend).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
