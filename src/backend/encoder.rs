//! Backend-agnostic recorded command stream.
//!
//! A [`CommandEncoder`] collects compute work as plain data; the backend
//! translates the list into one API-level submission. This keeps recording
//! free of device handles and lets the software backend replay the same
//! stream on host memory.

use std::sync::Arc;

use super::{GpuBuffer, GpuPipeline};

/// A storage buffer bound at an explicit binding index.
#[derive(Debug, Clone)]
pub struct BufferBinding {
    /// Shader binding index.
    pub binding: u32,
    /// Bound buffer.
    pub buffer: Arc<GpuBuffer>,
}

/// One recorded command.
#[derive(Debug, Clone)]
pub enum Command {
    /// Make a pipeline current for subsequent dispatches.
    BindPipeline(Arc<GpuPipeline>),
    /// Bind storage buffers for subsequent dispatches.
    BindBuffers(Vec<BufferBinding>),
    /// Set the push constant block for subsequent dispatches.
    SetPushConstants(Vec<u8>),
    /// Fill a whole buffer with a repeated 32-bit value.
    FillBuffer { buffer: Arc<GpuBuffer>, value: u32 },
    /// Write host bytes into a buffer at the recorded position in the stream.
    WriteBuffer { buffer: Arc<GpuBuffer>, data: Vec<u8> },
    /// Copy `size` bytes between buffers.
    CopyBuffer {
        src: Arc<GpuBuffer>,
        dst: Arc<GpuBuffer>,
        size: u64,
    },
    /// Execution and memory barrier between compute and transfer work.
    MemoryBarrier,
    /// Dispatch the current pipeline.
    Dispatch { grid: [u32; 3] },
    /// Dispatch with the grid read from a device buffer.
    DispatchIndirect { buffer: Arc<GpuBuffer>, offset: u64 },
    /// Open a debug label region.
    BeginLabel(String),
    /// Close the innermost debug label region.
    EndLabel,
}

/// Recorded command stream for one submission.
#[derive(Debug, Default)]
pub struct CommandEncoder {
    commands: Vec<Command>,
}

impl CommandEncoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded commands, in submission order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Make a pipeline current.
    pub fn bind_pipeline(&mut self, pipeline: Arc<GpuPipeline>) {
        self.commands.push(Command::BindPipeline(pipeline));
    }

    /// Bind storage buffers at explicit binding indices.
    pub fn bind_buffers(&mut self, bindings: Vec<BufferBinding>) {
        self.commands.push(Command::BindBuffers(bindings));
    }

    /// Set push constants for the next dispatches.
    pub fn set_push_constants(&mut self, data: Vec<u8>) {
        self.commands.push(Command::SetPushConstants(data));
    }

    /// Fill a whole buffer with a repeated 32-bit value.
    pub fn fill_buffer(&mut self, buffer: Arc<GpuBuffer>, value: u32) {
        self.commands.push(Command::FillBuffer { buffer, value });
    }

    /// Write host bytes into a buffer, ordered within the stream.
    pub fn write_buffer(&mut self, buffer: Arc<GpuBuffer>, data: Vec<u8>) {
        self.commands.push(Command::WriteBuffer { buffer, data });
    }

    /// Copy bytes between buffers.
    pub fn copy_buffer(&mut self, src: Arc<GpuBuffer>, dst: Arc<GpuBuffer>, size: u64) {
        self.commands.push(Command::CopyBuffer { src, dst, size });
    }

    /// Insert an execution and memory barrier.
    pub fn memory_barrier(&mut self) {
        self.commands.push(Command::MemoryBarrier);
    }

    /// Dispatch the current pipeline.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch { grid: [x, y, z] });
    }

    /// Dispatch with the grid read from a device buffer.
    pub fn dispatch_indirect(&mut self, buffer: Arc<GpuBuffer>, offset: u64) {
        self.commands.push(Command::DispatchIndirect { buffer, offset });
    }

    /// Open a debug label region.
    pub fn begin_label(&mut self, label: impl Into<String>) {
        self.commands.push(Command::BeginLabel(label.into()));
    }

    /// Close the innermost debug label region.
    pub fn end_label(&mut self) {
        self.commands.push(Command::EndLabel);
    }
}
