//! Pluggable decimation algorithm interface.
//!
//! The task engine owns buffers, submission and readback; the algorithm only
//! decides *what* to run each iteration and hands back a command list. It
//! never sees device handles, which keeps algorithms portable across
//! backends and lets tests drive the engine with a scripted stand-in.

use bytemuck::{Pod, Zeroable};

use crate::context::Context;
use crate::error::Result;
use crate::remesh::commands::RemeshCommand;
use crate::remesh::RemeshParams;

/// Counts describing the mesh a task starts from.
#[derive(Debug, Clone, Copy)]
pub struct TaskInput {
    /// Triangles in the input mesh.
    pub triangle_count: u32,
    /// Vertices in the input mesh.
    pub vertex_count: u32,
    /// Requested output triangle count, zero when decimation is driven by
    /// the error threshold alone.
    pub target_triangle_count: u32,
}

/// One task-scoped scratch buffer the algorithm needs.
#[derive(Debug, Clone)]
pub struct ScratchRequest {
    /// Debug label for the allocation.
    pub label: String,
    /// Size in bytes.
    pub size: u64,
}

/// Scratch demands returned by [`DecimationAlgorithm::begin_task`].
///
/// The engine allocates one buffer per request and appends them to the
/// resource table; the `i`-th request lands in scratch slot `i`.
#[derive(Debug, Clone, Default)]
pub struct TaskSetup {
    pub scratch: Vec<ScratchRequest>,
}

/// Host copy of one resource harvested for the algorithm.
///
/// Readback is one iteration behind the device: a payload delivered at
/// iteration `n` holds the bytes the resource contained after iteration
/// `n - 1`, and the first delivery for a slot is all zeroes.
#[derive(Debug, Clone)]
pub struct ReadbackPayload {
    /// Resource table slot the bytes came from.
    pub slot: u32,
    /// Buffer contents at the time of the previous copy.
    pub data: Vec<u8>,
}

/// Whether the algorithm needs more iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Submit the returned commands and call again.
    Continue,
    /// Decimation finished; the returned commands still run.
    Done,
}

/// One iteration's worth of work.
#[derive(Debug)]
pub struct TaskStep {
    pub status: TaskStatus,
    pub commands: Vec<RemeshCommand>,
}

/// Decimation state the device reports back each iteration.
///
/// Lives in the `CurrentState` resource slot; kernels decrement the live
/// counts as collapses commit and raise `error_state` on failure.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RemeshCurrentState {
    /// Triangles still alive in the decimated mesh.
    pub triangle_count: u32,
    /// Vertices still alive in the decimated mesh.
    pub vertex_count: u32,
    /// Zero while healthy, otherwise a [`RemeshErrorState`] code.
    pub error_state: u32,
    /// Iteration counter maintained by the kernels.
    pub iteration: u32,
}

/// Failure codes kernels write into [`RemeshCurrentState::error_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemeshErrorState {
    None,
    VertexHashNotFound,
    EdgeHashNotFound,
    DebugTrap,
    OutOfEdgeStorage,
    NoTriangleFound,
    NoVertexHistoryFound,
    InvalidConstantValue,
    Unknown(u32),
}

impl RemeshErrorState {
    /// Decode the raw device value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::VertexHashNotFound,
            2 => Self::EdgeHashNotFound,
            3 => Self::DebugTrap,
            4 => Self::OutOfEdgeStorage,
            5 => Self::NoTriangleFound,
            6 => Self::NoVertexHistoryFound,
            7 => Self::InvalidConstantValue,
            other => Self::Unknown(other),
        }
    }

    /// Human-readable description for error reporting.
    pub fn describe(&self) -> String {
        match self {
            Self::None => "no error".to_string(),
            Self::VertexHashNotFound => "vertex hash lookup failed".to_string(),
            Self::EdgeHashNotFound => "edge hash lookup failed".to_string(),
            Self::DebugTrap => "debug trap".to_string(),
            Self::OutOfEdgeStorage => "edge storage exhausted".to_string(),
            Self::NoTriangleFound => "no triangle found for collapse".to_string(),
            Self::NoVertexHistoryFound => "vertex history missing".to_string(),
            Self::InvalidConstantValue => "invalid constant value".to_string(),
            Self::Unknown(raw) => format!("unknown device error {raw}"),
        }
    }
}

/// A GPU decimation algorithm driven by the task engine.
///
/// The engine calls `begin_task` once, `continue_task` once per iteration
/// until it returns [`TaskStatus::Done`], then `end_task` exactly once, also
/// on failure paths.
pub trait DecimationAlgorithm: Send {
    /// Algorithm name for logging.
    fn name(&self) -> &'static str;

    /// Start a task: create pipelines and request scratch buffers.
    fn begin_task(
        &mut self,
        context: &Context,
        params: &RemeshParams,
        input: &TaskInput,
    ) -> Result<TaskSetup>;

    /// Produce the next iteration's commands.
    ///
    /// `readback` carries the payloads harvested from the previous
    /// iteration's `ReadResources` commands, one iteration behind the
    /// device; it is empty on the first call.
    fn continue_task(&mut self, readback: &[ReadbackPayload]) -> Result<TaskStep>;

    /// Release per-task state. Buffers are owned by the engine and freed
    /// after this returns.
    fn end_task(&mut self);
}
