//! wgpu compute backend.
//!
//! Compute-only translation of the recorded command stream: one wgpu command
//! buffer per submission, a compute pass per dispatch, and blocking readback
//! through `map_async` + `Maintain::Wait`.

use std::borrow::Cow;
use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::error::{MeshopsError, Result};

use super::{
    BufferDescriptor, BufferUsage, Command, CommandEncoder, ComputeBackend,
    ComputePipelineDescriptor, GpuBuffer, GpuPipeline, MemoryBudget,
};

/// wgpu does not expose heap budgets; assume a fixed conservative budget.
const ASSUMED_BUDGET: u64 = 4 << 30;

/// wgpu-based compute backend.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl WgpuBackend {
    /// Create a backend on the first suitable adapter.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| MeshopsError::Backend("no suitable wgpu adapter".to_string()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("meshops"),
                required_features: wgpu::Features::PUSH_CONSTANTS,
                required_limits: wgpu::Limits {
                    max_push_constant_size: 128,
                    ..wgpu::Limits::default()
                },
            },
            None,
        ))
        .map_err(|e| MeshopsError::Backend(format!("wgpu device request failed: {e}")))?;

        log::info!("WgpuBackend: using adapter {}", adapter.get_info().name);
        Ok(Self { device, queue })
    }

    fn wgpu_buffer<'a>(&self, buffer: &'a GpuBuffer) -> Result<&'a wgpu::Buffer> {
        match buffer {
            GpuBuffer::Wgpu { buffer, .. } => Ok(buffer),
            _ => Err(MeshopsError::Backend(
                "buffer belongs to a different backend".to_string(),
            )),
        }
    }

    fn map_read(&self, buffer: &wgpu::Buffer, offset: u64, size: u64) -> Result<Vec<u8>> {
        let slice = buffer.slice(offset..offset + size);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| MeshopsError::Backend("map_async callback dropped".to_string()))?
            .map_err(|e| MeshopsError::Backend(format!("buffer map failed: {e:?}")))?;
        let data = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(data)
    }
}

fn to_wgpu_usage(usage: BufferUsage, host_visible: bool) -> wgpu::BufferUsages {
    let mut result = wgpu::BufferUsages::empty();
    if usage.contains(BufferUsage::STORAGE) {
        result |= wgpu::BufferUsages::STORAGE;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        result |= wgpu::BufferUsages::UNIFORM;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        result |= wgpu::BufferUsages::INDIRECT;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        result |= wgpu::BufferUsages::COPY_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        result |= wgpu::BufferUsages::COPY_DST;
    }
    if usage.contains(BufferUsage::MAP_READ) || host_visible {
        result |= wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST;
    }
    result
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<Arc<GpuBuffer>> {
        if descriptor.size == 0 {
            return Err(MeshopsError::ResourceCreationFailed(format!(
                "zero-sized buffer {:?}",
                descriptor.label
            )));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: descriptor.label.as_deref(),
            size: descriptor.size,
            usage: to_wgpu_usage(descriptor.usage, descriptor.host_visible),
            mapped_at_creation: false,
        });
        Ok(Arc::new(GpuBuffer::Wgpu {
            buffer,
            size: descriptor.size,
        }))
    }

    fn create_pipeline(&self, descriptor: &ComputePipelineDescriptor) -> Result<Arc<GpuPipeline>> {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(descriptor.label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(descriptor.shader_source)),
            });

        let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..descriptor.binding_count)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(descriptor.label),
                    entries: &entries,
                });

        let push_constant_ranges = if descriptor.push_constant_size > 0 {
            vec![wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: 0..descriptor.push_constant_size,
            }]
        } else {
            Vec::new()
        };
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(descriptor.label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &push_constant_ranges,
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(descriptor.label),
                layout: Some(&layout),
                module: &module,
                entry_point: descriptor.entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        Ok(Arc::new(GpuPipeline::Wgpu {
            pipeline,
            bind_group_layout,
        }))
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        self.queue.write_buffer(self.wgpu_buffer(buffer)?, offset, data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<Vec<u8>> {
        let buffer = self.wgpu_buffer(buffer)?;
        if buffer.usage().contains(wgpu::BufferUsages::MAP_READ) {
            return self.map_read(buffer, offset, size);
        }

        // Device-local source: only MAP_READ buffers can be mapped, so copy
        // through a transient staging buffer first.
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback copy"),
            });
        encoder.copy_buffer_to_buffer(buffer, offset, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));
        self.map_read(&staging, 0, size)
    }

    fn submit(&self, encoder: CommandEncoder) -> Result<()> {
        let mut wgpu_encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("meshops submit"),
            });

        // Current compute state, applied when a dispatch is recorded.
        let mut current_pipeline: Option<Arc<GpuPipeline>> = None;
        let mut current_bindings: Vec<super::BufferBinding> = Vec::new();
        let mut current_push_constants: Vec<u8> = Vec::new();

        for command in encoder.commands() {
            match command {
                Command::BindPipeline(pipeline) => {
                    current_pipeline = Some(pipeline.clone());
                }
                Command::BindBuffers(bindings) => {
                    current_bindings = bindings.clone();
                }
                Command::SetPushConstants(data) => {
                    current_push_constants = data.clone();
                }
                Command::FillBuffer { buffer, value } => {
                    // wgpu can only clear to zero; fill through a transient
                    // init buffer to keep in-stream ordering.
                    if *value == 0 {
                        wgpu_encoder.clear_buffer(self.wgpu_buffer(buffer)?, 0, None);
                    } else {
                        let size = buffer.size() as usize;
                        let mut pattern = vec![0u8; size];
                        for chunk in pattern.chunks_mut(4) {
                            let src = value.to_le_bytes();
                            chunk.copy_from_slice(&src[..chunk.len()]);
                        }
                        let staging =
                            self.device
                                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                                    label: Some("fill staging"),
                                    contents: &pattern,
                                    usage: wgpu::BufferUsages::COPY_SRC,
                                });
                        wgpu_encoder.copy_buffer_to_buffer(
                            &staging,
                            0,
                            self.wgpu_buffer(buffer)?,
                            0,
                            buffer.size(),
                        );
                    }
                }
                Command::WriteBuffer { buffer, data } => {
                    let staging = self
                        .device
                        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some("write staging"),
                            contents: data,
                            usage: wgpu::BufferUsages::COPY_SRC,
                        });
                    wgpu_encoder.copy_buffer_to_buffer(
                        &staging,
                        0,
                        self.wgpu_buffer(buffer)?,
                        0,
                        data.len() as u64,
                    );
                }
                Command::CopyBuffer { src, dst, size } => {
                    wgpu_encoder.copy_buffer_to_buffer(
                        self.wgpu_buffer(src)?,
                        0,
                        self.wgpu_buffer(dst)?,
                        0,
                        *size,
                    );
                }
                Command::MemoryBarrier => {
                    // Implicit in wgpu's usage tracking.
                }
                Command::Dispatch { grid } => {
                    self.record_dispatch(
                        &mut wgpu_encoder,
                        &current_pipeline,
                        &current_bindings,
                        &current_push_constants,
                        DispatchKind::Direct(*grid),
                    )?;
                }
                Command::DispatchIndirect { buffer, offset } => {
                    self.record_dispatch(
                        &mut wgpu_encoder,
                        &current_pipeline,
                        &current_bindings,
                        &current_push_constants,
                        DispatchKind::Indirect(buffer.clone(), *offset),
                    )?;
                }
                Command::BeginLabel(label) => {
                    wgpu_encoder.push_debug_group(label);
                }
                Command::EndLabel => {
                    wgpu_encoder.pop_debug_group();
                }
            }
        }

        self.queue.submit(Some(wgpu_encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    fn memory_budget(&self) -> MemoryBudget {
        MemoryBudget {
            budget: ASSUMED_BUDGET,
            usage: 0,
        }
    }
}

enum DispatchKind {
    Direct([u32; 3]),
    Indirect(Arc<GpuBuffer>, u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Option<WgpuBackend> {
        match WgpuBackend::new() {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("skipping, no wgpu adapter: {e}");
                None
            }
        }
    }

    #[test]
    fn test_read_device_local_buffer() {
        let Some(backend) = backend() else { return };
        // STORAGE | COPY_SRC | COPY_DST, no MAP_READ: the layout every mesh
        // attribute and state buffer uses. Readback must still work.
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(
                16,
                BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            ))
            .unwrap();
        let data = [7u8; 16];
        backend.write_buffer(&buffer, 0, &data).unwrap();
        backend.wait_idle();
        assert_eq!(backend.read_buffer(&buffer, 0, 16).unwrap(), data);
    }

    #[test]
    fn test_read_host_visible_buffer() {
        let Some(backend) = backend() else { return };
        let buffer = backend
            .create_buffer(
                &BufferDescriptor::new(8, BufferUsage::MAP_READ | BufferUsage::COPY_DST)
                    .host_visible(),
            )
            .unwrap();
        assert_eq!(backend.read_buffer(&buffer, 0, 8).unwrap(), vec![0u8; 8]);
    }
}

impl WgpuBackend {
    fn record_dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &Option<Arc<GpuPipeline>>,
        bindings: &[super::BufferBinding],
        push_constants: &[u8],
        kind: DispatchKind,
    ) -> Result<()> {
        let Some(pipeline) = pipeline else {
            return Err(MeshopsError::Backend(
                "dispatch without a bound pipeline".to_string(),
            ));
        };
        let GpuPipeline::Wgpu {
            pipeline,
            bind_group_layout,
        } = pipeline.as_ref()
        else {
            return Err(MeshopsError::Backend(
                "pipeline belongs to a different backend".to_string(),
            ));
        };

        let entries: Vec<wgpu::BindGroupEntry> = bindings
            .iter()
            .map(|binding| {
                Ok(wgpu::BindGroupEntry {
                    binding: binding.binding,
                    resource: self.wgpu_buffer(&binding.buffer)?.as_entire_binding(),
                })
            })
            .collect::<Result<_>>()?;
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("dispatch bindings"),
            layout: bind_group_layout,
            entries: &entries,
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        if !push_constants.is_empty() {
            pass.set_push_constants(0, push_constants);
        }
        match &kind {
            DispatchKind::Direct([x, y, z]) => pass.dispatch_workgroups(*x, *y, *z),
            DispatchKind::Indirect(buffer, offset) => {
                pass.dispatch_workgroups_indirect(self.wgpu_buffer(buffer)?, *offset)
            }
        }
        Ok(())
    }
}
