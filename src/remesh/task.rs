//! Remesh task state machine.
//!
//! A task owns every device resource one decimation run touches: the slot
//! table over the device mesh, the engine-private buffers, the task-global
//! constant buffer and the algorithm's scratch. Iterations follow a strict
//! order: record this iteration's commands, harvest the staging buffers
//! (which still hold the previous iteration's copies), then submit. The
//! algorithm therefore always observes device state one iteration behind,
//! and never blocks mid-iteration.

use std::sync::Arc;

use crate::backend::{
    BufferBinding, BufferDescriptor, BufferUsage, CommandEncoder, ComputePipelineDescriptor,
    GpuBuffer, GpuPipeline,
};
use crate::context::Context;
use crate::device_mesh::{DeviceMesh, DeviceMeshSettings, DeviceMeshUsageFlags};
use crate::error::{MeshopsError, Result};
use crate::mesh::{MeshAttributeFlags, MeshData};
use crate::remesh::algorithm::{
    DecimationAlgorithm, ReadbackPayload, RemeshCurrentState, RemeshErrorState, TaskInput,
    TaskStatus,
};
use crate::remesh::commands::{interpret, InterpretContext};
use crate::remesh::resources::{RemeshResource, ResourceTable};
use crate::remesh::RemeshParams;

/// Attributes a mesh must carry to be remeshed.
pub const REQUIRED_ATTRIBUTES: MeshAttributeFlags = MeshAttributeFlags::VERTEX_POSITION
    .union(MeshAttributeFlags::VERTEX_NORMAL)
    .union(MeshAttributeFlags::VERTEX_TANGENT)
    .union(MeshAttributeFlags::VERTEX_DIRECTION)
    .union(MeshAttributeFlags::VERTEX_DIRECTION_BOUNDS)
    .union(MeshAttributeFlags::VERTEX_IMPORTANCE)
    .union(MeshAttributeFlags::TRIANGLE_VERTICES)
    .union(MeshAttributeFlags::TRIANGLE_SUBDIV_LEVELS)
    .union(MeshAttributeFlags::TRIANGLE_PRIMITIVE_FLAGS);

const VERTEX_COPY_WGSL: &str = include_str!("shaders/vertex_copy.wgsl");
const VERTEX_COPY_WORKGROUP: u32 = 256;

/// Where the device mesh of a task lives.
enum TaskMesh {
    /// Created by the engine from the host mesh, destroyed with the task.
    Owned(DeviceMesh),
    /// Supplied by the caller, who must pass it to every `remesh` call of
    /// the task.
    External,
}

/// A running decimation task.
pub(crate) struct RemeshTask {
    mesh: TaskMesh,
    table: ResourceTable,
    global_constants: Arc<GpuBuffer>,
    vertex_copy: Arc<GpuPipeline>,

    /// Stable host copies handed to the algorithm, refreshed every harvest.
    payloads: Vec<ReadbackPayload>,

    iteration: u32,
    original_triangle_count: u32,
    original_vertex_count: u32,
    target_triangle_count: u32,
    live_triangle_count: u32,
    live_vertex_count: u32,
    last_progress_step: i32,
}

impl RemeshTask {
    /// Validate the input, build the resource table and start the algorithm.
    pub fn begin(
        context: &Context,
        algorithm: &mut dyn DecimationAlgorithm,
        params: &RemeshParams,
        mesh: &MeshData,
        external: Option<&DeviceMesh>,
    ) -> Result<Self> {
        let missing = REQUIRED_ATTRIBUTES.difference(mesh.attributes());
        if !missing.is_empty() {
            return Err(MeshopsError::MissingAttributes(format!(
                "remeshing requires {missing:?}"
            )));
        }
        let triangle_count = mesh.triangle_count();
        let vertex_count = mesh.vertex_count();

        let required_settings = DeviceMeshSettings {
            attrib_flags: REQUIRED_ATTRIBUTES,
            usage_flags: DeviceMeshUsageFlags::COMPUTE_READ
                | DeviceMeshUsageFlags::COMPUTE_WRITE
                | DeviceMeshUsageFlags::READBACK,
        };
        let owned = match external {
            Some(device_mesh) => {
                if !device_mesh.settings().has_required(&required_settings) {
                    return Err(MeshopsError::InvalidParameter(format!(
                        "supplied device mesh lacks required settings: has {:?}, needs {:?}",
                        device_mesh.settings(),
                        required_settings
                    )));
                }
                None
            }
            // Carry optional attributes (texcoords) along with the required
            // set so nothing is lost on readback.
            None => Some(DeviceMesh::create(
                context,
                mesh,
                DeviceMeshSettings {
                    attrib_flags: required_settings.attrib_flags | mesh.attributes(),
                    usage_flags: required_settings.usage_flags,
                },
            )?),
        };
        let device_mesh = match (&owned, external) {
            (Some(device_mesh), _) => device_mesh,
            (None, Some(device_mesh)) => device_mesh,
            (None, None) => unreachable!(),
        };

        let backend = context.backend();
        let vc = vertex_count as u64;
        let tc = triangle_count as u64;

        // Engine-private allocations on top of the device mesh.
        let private_bytes = vc * 8 + vc * 12 + tc * 4 + 16 * 2 + 16 + 256;
        let budget = context.memory_budget();
        if budget.usage + private_bytes > budget.budget {
            log::warn!(
                "remesh task needs {} more bytes with {} of {} already in use",
                private_bytes,
                budget.usage,
                budget.budget
            );
        }

        let mut table = ResourceTable::new();
        table.bind(
            RemeshResource::VertexPositions,
            device_mesh.position_normal_buffer()?.clone(),
            vc * crate::device_mesh::POSITION_NORMAL_STRIDE,
        );
        if let Ok(buffer) = device_mesh.texcoord_buffer() {
            table.bind(
                RemeshResource::VertexTexcoords,
                buffer.clone(),
                vc * crate::device_mesh::TEXCOORD_STRIDE,
            );
        }
        table.bind(
            RemeshResource::TriangleVertices,
            device_mesh.triangle_vertices_buffer()?.clone(),
            tc * crate::device_mesh::TRIANGLE_VERTICES_STRIDE,
        );
        table.bind(
            RemeshResource::VertexImportance,
            device_mesh.importance_buffer()?.clone(),
            vc * crate::device_mesh::IMPORTANCE_STRIDE,
        );
        table.bind(
            RemeshResource::VertexDirections,
            device_mesh.direction_buffer()?.clone(),
            vc * crate::device_mesh::DIRECTION_STRIDE,
        );
        table.bind(
            RemeshResource::TriangleSubdivisionInfo,
            device_mesh.triangle_attributes_buffer()?.clone(),
            tc * crate::device_mesh::TRIANGLE_ATTRIBUTES_STRIDE,
        );
        table.bind(
            RemeshResource::VertexDirectionBounds,
            device_mesh.direction_bounds_buffer()?.clone(),
            vc * crate::device_mesh::DIRECTION_BOUNDS_STRIDE,
        );

        let usage = BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let alloc = |label: &str, size: u64| {
            backend.create_buffer(&BufferDescriptor::new(size, usage).with_label(label))
        };
        table.bind(RemeshResource::VertexHash, alloc("remesh vertex hash", vc * 8)?, vc * 8);
        table.bind(
            RemeshResource::VertexMerge,
            alloc("remesh vertex merge", vc * 12)?,
            vc * 12,
        );
        table.bind(
            RemeshResource::TriangleUserIds,
            alloc("remesh triangle user ids", tc * 4)?,
            tc * 4,
        );
        table.bind(
            RemeshResource::DebugVertex,
            alloc("remesh debug vertex", 16)?,
            16,
        );
        table.bind(
            RemeshResource::DebugTriangle,
            alloc("remesh debug triangle", 16)?,
            16,
        );
        table.bind(
            RemeshResource::CurrentState,
            alloc("remesh current state", 16)?,
            16,
        );

        let global_constants = backend.create_buffer(
            &BufferDescriptor::new(256, BufferUsage::UNIFORM | BufferUsage::COPY_DST)
                .with_label("remesh global constants"),
        )?;
        let vertex_copy = backend.create_pipeline(&ComputePipelineDescriptor {
            label: "remesh vertex copy",
            shader_source: VERTEX_COPY_WGSL,
            entry_point: "main",
            binding_count: 3,
            push_constant_size: 4,
        })?;

        let input = TaskInput {
            triangle_count,
            vertex_count,
            target_triangle_count: params.max_output_triangle_count,
        };
        let setup = algorithm.begin_task(context, params, &input)?;
        for request in &setup.scratch {
            let buffer = alloc(&request.label, request.size)?;
            table.push_scratch(buffer, request.size);
        }

        log::info!(
            "remesh task started ({}): {} triangles, {} vertices, target {}, {} scratch buffers",
            algorithm.name(),
            triangle_count,
            vertex_count,
            params.max_output_triangle_count,
            setup.scratch.len()
        );

        Ok(Self {
            mesh: match owned {
                Some(device_mesh) => TaskMesh::Owned(device_mesh),
                None => TaskMesh::External,
            },
            table,
            global_constants,
            vertex_copy,
            payloads: Vec::new(),
            iteration: 0,
            original_triangle_count: triangle_count,
            original_vertex_count: vertex_count,
            target_triangle_count: params.max_output_triangle_count,
            live_triangle_count: triangle_count,
            live_vertex_count: vertex_count,
            last_progress_step: -1,
        })
    }

    /// Latest harvested live triangle and vertex counts.
    pub fn live_counts(&self) -> (u32, u32) {
        (self.live_triangle_count, self.live_vertex_count)
    }

    /// Run one iteration: record, harvest, submit.
    pub fn iterate(
        &mut self,
        context: &Context,
        algorithm: &mut dyn DecimationAlgorithm,
    ) -> Result<TaskStatus> {
        let backend = context.backend();
        let mut encoder = CommandEncoder::new();
        if self.iteration == 0 {
            self.record_vertex_copy(&mut encoder)?;
        }

        let step = algorithm.continue_task(&self.payloads)?;
        let mut reads = Vec::new();
        let mut ctx = InterpretContext {
            backend: backend.as_ref(),
            global_constants: &self.global_constants,
            pending_reads: &mut reads,
        };
        for command in &step.commands {
            interpret(command, &mut self.table, &mut encoder, &mut ctx)?;
        }

        // Harvest before submitting: the staging buffers still hold the
        // previous iteration's copies, zeroes if a slot is new.
        self.payloads.clear();
        for slot in reads {
            let binding = self.table.binding(slot)?;
            let size = binding.size;
            let host = match &binding.host_visible {
                Some(host) => host.clone(),
                None => continue,
            };
            let data = backend.read_buffer(&host, 0, size)?;
            if slot == RemeshResource::CurrentState.slot() {
                self.apply_state(&data)?;
            }
            self.payloads.push(ReadbackPayload { slot, data });
        }

        if !encoder.is_empty() {
            backend.submit(encoder)?;
        }
        self.iteration += 1;
        self.log_progress();
        Ok(step.status)
    }

    /// Finish a completed task: read the final counts, shrink the host mesh
    /// and read the decimated attributes back.
    pub fn finish(
        mut self,
        context: &Context,
        algorithm: &mut dyn DecimationAlgorithm,
        mesh: &mut MeshData,
        external: Option<&DeviceMesh>,
    ) -> Result<(u32, u32)> {
        let backend = context.backend();
        algorithm.end_task();
        backend.wait_idle();

        // The harvested state is one iteration stale; read the device copy
        // directly for the final counts.
        let binding = self.table.binding(RemeshResource::CurrentState.slot())?;
        let data = backend.read_buffer(&binding.buffer, 0, binding.size)?;
        let state: RemeshCurrentState = bytemuck::pod_read_unaligned(&data);
        match RemeshErrorState::from_raw(state.error_state) {
            RemeshErrorState::None => {}
            error => {
                return Err(MeshopsError::Algorithm(format!(
                    "remesh failed at iteration {}: {}",
                    self.iteration,
                    error.describe()
                )))
            }
        }
        let (triangle_count, vertex_count) = if state.triangle_count > 0 {
            (state.triangle_count, state.vertex_count)
        } else {
            (self.original_triangle_count, self.original_vertex_count)
        };

        self.table.clear_scratch();

        let device_mesh = match &self.mesh {
            TaskMesh::Owned(device_mesh) => device_mesh,
            TaskMesh::External => external.ok_or_else(|| {
                MeshopsError::InvalidParameter(
                    "task uses a caller-supplied device mesh, but none was passed".to_string(),
                )
            })?,
        };
        mesh.resize(triangle_count, vertex_count);
        device_mesh.readback(context, mesh)?;

        log::info!(
            "remesh finished: {} -> {triangle_count} triangles in {} iterations",
            self.original_triangle_count,
            self.iteration
        );
        Ok((triangle_count, vertex_count))
    }

    fn record_vertex_copy(&mut self, encoder: &mut CommandEncoder) -> Result<()> {
        let buffer = |resource: RemeshResource| -> Result<Arc<GpuBuffer>> {
            Ok(self.table.binding(resource.slot())?.buffer.clone())
        };
        encoder.begin_label("remesh vertex copy");
        encoder.bind_pipeline(self.vertex_copy.clone());
        encoder.bind_buffers(vec![
            BufferBinding {
                binding: 0,
                buffer: buffer(RemeshResource::VertexPositions)?,
            },
            BufferBinding {
                binding: 1,
                buffer: buffer(RemeshResource::VertexHash)?,
            },
            BufferBinding {
                binding: 2,
                buffer: buffer(RemeshResource::VertexMerge)?,
            },
        ]);
        encoder.set_push_constants(self.original_vertex_count.to_le_bytes().to_vec());
        encoder.dispatch(
            self.original_vertex_count.div_ceil(VERTEX_COPY_WORKGROUP),
            1,
            1,
        );
        encoder.memory_barrier();
        encoder.end_label();
        Ok(())
    }

    /// Fold a harvested `CurrentState` payload into the live counters.
    fn apply_state(&mut self, data: &[u8]) -> Result<()> {
        let state: RemeshCurrentState = bytemuck::pod_read_unaligned(data);
        match RemeshErrorState::from_raw(state.error_state) {
            RemeshErrorState::None => {}
            error => {
                return Err(MeshopsError::Algorithm(format!(
                    "remesh failed at iteration {}: {}",
                    self.iteration,
                    error.describe()
                )))
            }
        }
        // Zero counts mean the kernels have not reported yet.
        if state.triangle_count > 0 {
            self.live_triangle_count = state.triangle_count;
            self.live_vertex_count = state.vertex_count;
        }
        Ok(())
    }

    fn log_progress(&mut self) {
        if self.target_triangle_count > 0 && self.target_triangle_count < self.original_triangle_count
        {
            let original = self.original_triangle_count as f32;
            let removed = original - self.live_triangle_count as f32;
            let goal = original - self.target_triangle_count as f32;
            let progress = (removed / goal).clamp(0.0, 1.0);
            // At most one line per 5% step.
            let step = (progress * 20.0) as i32;
            if step > self.last_progress_step {
                self.last_progress_step = step;
                log::info!(
                    "remesh progress {:.0}%: {} of {} triangles live (target {})",
                    progress * 100.0,
                    self.live_triangle_count,
                    self.original_triangle_count,
                    self.target_triangle_count
                );
            }
        } else if self.iteration % 50 == 0 {
            log::info!(
                "remesh iteration {}: {} triangles live",
                self.iteration,
                self.live_triangle_count
            );
        }
    }
}
