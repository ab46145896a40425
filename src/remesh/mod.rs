//! GPU remesh task engine.
//!
//! Decimation runs as a sequence of device submissions driven by a pluggable
//! [`DecimationAlgorithm`]. The engine owns every buffer, interprets the
//! algorithm's command stream, and feeds device state back to the algorithm
//! with a one-iteration delay so iterations never stall on readback. In
//! progressive mode one call runs one iteration, which lets interactive
//! callers display intermediate meshes and cancel between iterations.

mod algorithm;
mod commands;
mod resources;
mod task;

pub use algorithm::{
    DecimationAlgorithm, ReadbackPayload, RemeshCurrentState, RemeshErrorState, ScratchRequest,
    TaskInput, TaskSetup, TaskStatus, TaskStep,
};
pub use commands::{interpret, InterpretContext, RemeshCommand};
pub use resources::{scratch_slot, RemeshResource, ResourceBinding, ResourceTable, SCRATCH_START};
pub use task::REQUIRED_ATTRIBUTES;

use crate::context::Context;
use crate::device_mesh::DeviceMesh;
use crate::error::Result;
use crate::mesh::MeshData;
use task::RemeshTask;

/// Decimation controls.
#[derive(Debug, Clone)]
pub struct RemeshParams {
    /// Maximum tolerated geometric error, in mesh units scaled by the
    /// algorithm.
    pub error_threshold: f32,
    /// How strongly per-vertex importance resists collapses.
    pub importance_weight: f32,
    /// Collapse-rejection valence limit.
    pub max_vertex_valence: u32,
    /// Importance at or above which a vertex is never collapsed.
    pub importance_threshold: f32,
    /// Inflation applied to displacement direction bounds.
    pub direction_bounds_factor: f32,
    /// Triangle budget; zero decimates on `error_threshold` alone.
    pub max_output_triangle_count: u32,
    /// Run one iteration per call and keep the task alive in between.
    pub progressive: bool,
}

impl Default for RemeshParams {
    fn default() -> Self {
        Self {
            error_threshold: 100.0,
            importance_weight: 200.0,
            max_vertex_valence: 20,
            importance_threshold: 1.0,
            direction_bounds_factor: 1.02,
            max_output_triangle_count: 0,
            progressive: false,
        }
    }
}

/// Outcome of one [`RemeshOperator::remesh`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemeshStatus {
    /// Decimation finished and the host mesh holds the result.
    Success {
        triangle_count: u32,
        vertex_count: u32,
    },
    /// Progressive mode: one iteration ran, call again to continue.
    Continue,
}

/// Drives one decimation algorithm over host meshes.
pub struct RemeshOperator {
    algorithm: Box<dyn DecimationAlgorithm>,
    task: Option<RemeshTask>,
}

impl RemeshOperator {
    /// Create an operator around a decimation algorithm.
    pub fn new(context: &Context, algorithm: Box<dyn DecimationAlgorithm>) -> Result<Self> {
        log::info!(
            "remesh operator using algorithm {} on {} backend",
            algorithm.name(),
            context.backend().name()
        );
        Ok(Self {
            algorithm,
            task: None,
        })
    }

    /// Whether a progressive task is waiting to be resumed.
    pub fn has_active_task(&self) -> bool {
        self.task.is_some()
    }

    /// Live `(triangle, vertex)` counts of the active progressive task,
    /// one iteration behind the device. Lets interactive callers display
    /// decimation progress between calls.
    pub fn live_counts(&self) -> Option<(u32, u32)> {
        self.task.as_ref().map(RemeshTask::live_counts)
    }

    /// Decimate `mesh` in place.
    ///
    /// With `params.progressive` unset this blocks until the algorithm
    /// finishes and returns [`RemeshStatus::Success`]. In progressive mode
    /// each call runs a single iteration and returns
    /// [`RemeshStatus::Continue`] until the task completes; the mesh is only
    /// modified by the completing call. A caller-supplied `device_mesh`
    /// must satisfy [`REQUIRED_ATTRIBUTES`] and be passed to every call of
    /// the task; with `None` the engine uploads the mesh itself.
    pub fn remesh(
        &mut self,
        context: &Context,
        params: &RemeshParams,
        mesh: &mut MeshData,
        device_mesh: Option<&DeviceMesh>,
    ) -> Result<RemeshStatus> {
        let mut task = match self.task.take() {
            Some(task) => task,
            None => RemeshTask::begin(context, self.algorithm.as_mut(), params, mesh, device_mesh)?,
        };

        loop {
            match task.iterate(context, self.algorithm.as_mut()) {
                Ok(TaskStatus::Done) => {
                    let (triangle_count, vertex_count) =
                        task.finish(context, self.algorithm.as_mut(), mesh, device_mesh)?;
                    return Ok(RemeshStatus::Success {
                        triangle_count,
                        vertex_count,
                    });
                }
                Ok(TaskStatus::Continue) => {
                    if params.progressive {
                        self.task = Some(task);
                        return Ok(RemeshStatus::Continue);
                    }
                }
                Err(error) => {
                    // Abort: release the algorithm and let the dropped task
                    // free its buffers once the queue is idle.
                    self.algorithm.end_task();
                    context.backend().wait_idle();
                    return Err(error);
                }
            }
        }
    }

    /// Decimate a batch of meshes to completion, one task each.
    pub fn remesh_all(
        &mut self,
        context: &Context,
        params: &RemeshParams,
        meshes: &mut [MeshData],
    ) -> Result<()> {
        let params = RemeshParams {
            progressive: false,
            ..params.clone()
        };
        for (index, mesh) in meshes.iter_mut().enumerate() {
            let before = mesh.triangle_count();
            if let RemeshStatus::Success { triangle_count, .. } =
                self.remesh(context, &params, mesh, None)?
            {
                log::info!("mesh {index}: {before} -> {triangle_count} triangles");
            }
        }
        Ok(())
    }
}
