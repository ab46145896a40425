//! Remesh command stream and its interpreter.
//!
//! Algorithms describe an iteration as a list of [`RemeshCommand`] values, a
//! closed sum type referencing resources by slot index only. A single
//! [`interpret`] function translates each command into encoder work; adding
//! a command means the compiler points at the one `match` to extend.

use crate::backend::{BufferBinding, CommandEncoder, ComputeBackend, GpuBuffer, GpuPipeline};
use crate::error::Result;
use crate::remesh::resources::ResourceTable;
use std::sync::Arc;

/// One step of a remesh iteration.
#[derive(Debug, Clone)]
pub enum RemeshCommand {
    /// Make an algorithm pipeline current.
    BindPipeline(Arc<GpuPipeline>),
    /// Make a caller-supplied pipeline current together with its push
    /// constant block.
    BindUserPipeline {
        pipeline: Arc<GpuPipeline>,
        push_constants: Vec<u8>,
    },
    /// Bind resource slots for the next dispatches; the `i`-th listed slot
    /// lands on shader binding `i`.
    BindResources(Vec<u32>),
    /// Zero-fill the named resources.
    ClearResources(Vec<u32>),
    /// Copy the named resources into their host-visible staging buffers.
    /// The engine harvests the staging buffers one iteration later.
    ReadResources(Vec<u32>),
    /// Upload host bytes into a resource, ordered within the stream. Used
    /// to seed per-task device state.
    WriteResource { slot: u32, data: Vec<u8> },
    /// Update the task-global constant buffer, ordered within the stream.
    SetGlobalConstants(Vec<u8>),
    /// Set push constants for the next dispatches.
    SetLocalConstants(Vec<u8>),
    /// Execution and memory barrier.
    Barrier,
    /// Dispatch the current pipeline.
    Dispatch { grid: [u32; 3] },
    /// Dispatch with the grid read from the named resource.
    DispatchIndirect { slot: u32, offset: u64 },
    /// Open a debug label region.
    BeginLabel(String),
    /// Close the innermost debug label region.
    EndLabel,
}

/// Engine state the interpreter works against.
pub struct InterpretContext<'a> {
    /// Backend the staging buffers come from.
    pub backend: &'a dyn ComputeBackend,
    /// Task-global constant buffer `SetGlobalConstants` updates.
    pub global_constants: &'a Arc<GpuBuffer>,
    /// Slots whose staging copies this iteration records; harvested before
    /// the stream is submitted.
    pub pending_reads: &'a mut Vec<u32>,
}

/// Translate one command into encoder work.
pub fn interpret(
    command: &RemeshCommand,
    table: &mut ResourceTable,
    encoder: &mut CommandEncoder,
    ctx: &mut InterpretContext<'_>,
) -> Result<()> {
    match command {
        RemeshCommand::BindPipeline(pipeline) => {
            encoder.bind_pipeline(pipeline.clone());
        }
        RemeshCommand::BindUserPipeline {
            pipeline,
            push_constants,
        } => {
            encoder.bind_pipeline(pipeline.clone());
            if !push_constants.is_empty() {
                encoder.set_push_constants(push_constants.clone());
            }
        }
        RemeshCommand::BindResources(slots) => {
            let mut bindings = Vec::with_capacity(slots.len());
            for (binding, &slot) in slots.iter().enumerate() {
                bindings.push(BufferBinding {
                    binding: binding as u32,
                    buffer: table.binding(slot)?.buffer.clone(),
                });
            }
            encoder.bind_buffers(bindings);
        }
        RemeshCommand::ClearResources(slots) => {
            for &slot in slots {
                encoder.fill_buffer(table.binding(slot)?.buffer.clone(), 0);
            }
            encoder.memory_barrier();
        }
        RemeshCommand::ReadResources(slots) => {
            for &slot in slots {
                let host = table.host_visible(slot, ctx.backend)?;
                let binding = table.binding(slot)?;
                encoder.copy_buffer(binding.buffer.clone(), host, binding.size);
                if !ctx.pending_reads.contains(&slot) {
                    ctx.pending_reads.push(slot);
                }
            }
        }
        RemeshCommand::WriteResource { slot, data } => {
            encoder.write_buffer(table.binding(*slot)?.buffer.clone(), data.clone());
            encoder.memory_barrier();
        }
        RemeshCommand::SetGlobalConstants(data) => {
            encoder.write_buffer(ctx.global_constants.clone(), data.clone());
            encoder.memory_barrier();
        }
        RemeshCommand::SetLocalConstants(data) => {
            encoder.set_push_constants(data.clone());
        }
        RemeshCommand::Barrier => {
            encoder.memory_barrier();
        }
        RemeshCommand::Dispatch { grid } => {
            encoder.dispatch(grid[0], grid[1], grid[2]);
        }
        RemeshCommand::DispatchIndirect { slot, offset } => {
            encoder.dispatch_indirect(table.binding(*slot)?.buffer.clone(), *offset);
        }
        RemeshCommand::BeginLabel(label) => {
            encoder.begin_label(label.clone());
        }
        RemeshCommand::EndLabel => {
            encoder.end_label();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferDescriptor, BufferUsage, Command, DummyBackend};
    use crate::error::MeshopsError;
    use crate::remesh::resources::RemeshResource;

    fn setup() -> (DummyBackend, ResourceTable, Arc<GpuBuffer>) {
        let backend = DummyBackend::new();
        let mut table = ResourceTable::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(32, BufferUsage::STORAGE))
            .unwrap();
        table.bind(RemeshResource::VertexHash, buffer.clone(), 32);
        let globals = backend
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::UNIFORM))
            .unwrap();
        (backend, table, globals)
    }

    #[test]
    fn test_unbound_resource_reference_fails() {
        let (backend, mut table, globals) = setup();
        let mut encoder = CommandEncoder::new();
        let mut pending = Vec::new();
        let mut ctx = InterpretContext {
            backend: &backend,
            global_constants: &globals,
            pending_reads: &mut pending,
        };
        let command = RemeshCommand::BindResources(vec![RemeshResource::VertexMerge.slot()]);
        let err = interpret(&command, &mut table, &mut encoder, &mut ctx).unwrap_err();
        assert!(matches!(err, MeshopsError::UnboundResource(_)));
    }

    #[test]
    fn test_read_resources_records_copy_and_pending_read() {
        let (backend, mut table, globals) = setup();
        let mut encoder = CommandEncoder::new();
        let mut pending = Vec::new();
        let mut ctx = InterpretContext {
            backend: &backend,
            global_constants: &globals,
            pending_reads: &mut pending,
        };
        let slot = RemeshResource::VertexHash.slot();
        let command = RemeshCommand::ReadResources(vec![slot, slot]);
        interpret(&command, &mut table, &mut encoder, &mut ctx).unwrap();

        // Two copies recorded, one pending harvest entry.
        assert_eq!(encoder.len(), 2);
        assert!(matches!(encoder.commands()[0], Command::CopyBuffer { .. }));
        assert_eq!(pending, vec![slot]);
        assert!(table.binding(slot).unwrap().host_visible.is_some());
    }

    #[test]
    fn test_write_resource_uploads_in_stream_order() {
        let (backend, mut table, globals) = setup();
        let slot = RemeshResource::VertexHash.slot();
        let buffer = table.binding(slot).unwrap().buffer.clone();

        let mut encoder = CommandEncoder::new();
        let mut pending = Vec::new();
        let mut ctx = InterpretContext {
            backend: &backend,
            global_constants: &globals,
            pending_reads: &mut pending,
        };
        interpret(
            &RemeshCommand::ClearResources(vec![slot]),
            &mut table,
            &mut encoder,
            &mut ctx,
        )
        .unwrap();
        interpret(
            &RemeshCommand::WriteResource {
                slot,
                data: vec![9u8; 32],
            },
            &mut table,
            &mut encoder,
            &mut ctx,
        )
        .unwrap();
        backend.submit(encoder).unwrap();
        // The write landed after the clear.
        assert_eq!(backend.read_buffer(&buffer, 0, 32).unwrap(), vec![9u8; 32]);
    }

    #[test]
    fn test_clear_resources_fills_zero() {
        let (backend, mut table, globals) = setup();
        let slot = RemeshResource::VertexHash.slot();
        let buffer = table.binding(slot).unwrap().buffer.clone();
        backend.write_buffer(&buffer, 0, &[0xff; 32]).unwrap();

        let mut encoder = CommandEncoder::new();
        let mut pending = Vec::new();
        let mut ctx = InterpretContext {
            backend: &backend,
            global_constants: &globals,
            pending_reads: &mut pending,
        };
        interpret(
            &RemeshCommand::ClearResources(vec![slot]),
            &mut table,
            &mut encoder,
            &mut ctx,
        )
        .unwrap();
        backend.submit(encoder).unwrap();
        assert_eq!(backend.read_buffer(&buffer, 0, 32).unwrap(), vec![0u8; 32]);
    }
}
