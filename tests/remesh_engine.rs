//! Remesh task engine scenarios on the software backend.
//!
//! The software backend executes fills and copies for real, so the
//! readback-latency contract and the resource plumbing are observable
//! without GPU hardware. Dispatches are no-ops, which leaves the device
//! state counters untouched; the engine then falls back to the original
//! mesh counts on completion.

use std::sync::{Arc, Mutex};

use glam::{Vec2, Vec3, Vec4};

use meshops::backend::DummyBackend;
use meshops::remesh::{
    DecimationAlgorithm, ReadbackPayload, RemeshCommand, RemeshCurrentState, RemeshResource,
    ScratchRequest, TaskInput, TaskSetup, TaskStatus, TaskStep,
};
use meshops::{
    Context, DeviceMesh, DeviceMeshSettings, DeviceMeshUsageFlags, MeshData, MeshopsError,
    RemeshOperator, RemeshParams, RemeshStatus, Result, REQUIRED_ATTRIBUTES,
};

/// Mesh of `n` disconnected triangles carrying every required attribute.
fn full_mesh(n: u32) -> MeshData {
    let vc = (n * 3) as usize;
    MeshData {
        positions: (0..vc).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect(),
        normals: vec![Vec3::Z; vc],
        tangents: vec![Vec4::new(1.0, 0.0, 0.0, 1.0); vc],
        texcoords: vec![Vec2::ZERO; vc],
        directions: vec![Vec3::Z; vc],
        direction_bounds: vec![Vec2::new(0.0, 1.0); vc],
        importance: vec![0.0; vc],
        triangle_vertices: (0..n).map(|i| [i * 3, i * 3 + 1, i * 3 + 2]).collect(),
        triangle_subdivision_levels: vec![0; n as usize],
        triangle_primitive_flags: vec![0; n as usize],
    }
}

fn test_context() -> Context {
    Context::with_backend(Arc::new(DummyBackend::new()))
}

#[derive(Default)]
struct ScriptLog {
    payloads: Vec<Vec<ReadbackPayload>>,
    began: bool,
    ended: bool,
}

/// Scripted stand-in for a GPU decimation algorithm.
struct ScriptedAlgorithm {
    log: Arc<Mutex<ScriptLog>>,
    total_iterations: u32,
    iteration: u32,
    read_slots: Vec<u32>,
    scratch: Vec<ScratchRequest>,
    fail_at: Option<u32>,
}

impl ScriptedAlgorithm {
    fn new(total_iterations: u32, read_slots: Vec<u32>) -> (Box<Self>, Arc<Mutex<ScriptLog>>) {
        let log = Arc::new(Mutex::new(ScriptLog::default()));
        let algorithm = Box::new(Self {
            log: log.clone(),
            total_iterations,
            iteration: 0,
            read_slots,
            scratch: Vec::new(),
            fail_at: None,
        });
        (algorithm, log)
    }
}

impl DecimationAlgorithm for ScriptedAlgorithm {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn begin_task(
        &mut self,
        _context: &Context,
        _params: &RemeshParams,
        _input: &TaskInput,
    ) -> Result<TaskSetup> {
        self.log.lock().unwrap().began = true;
        Ok(TaskSetup {
            scratch: self.scratch.clone(),
        })
    }

    fn continue_task(&mut self, readback: &[ReadbackPayload]) -> Result<TaskStep> {
        self.log.lock().unwrap().payloads.push(readback.to_vec());
        if self.fail_at == Some(self.iteration) {
            return Err(MeshopsError::Algorithm("scripted failure".to_string()));
        }
        self.iteration += 1;

        let mut commands = Vec::new();
        if !self.read_slots.is_empty() {
            commands.push(RemeshCommand::ReadResources(self.read_slots.clone()));
        }
        let status = if self.iteration >= self.total_iterations {
            TaskStatus::Done
        } else {
            TaskStatus::Continue
        };
        Ok(TaskStep { status, commands })
    }

    fn end_task(&mut self) {
        self.log.lock().unwrap().ended = true;
    }
}

/// Algorithm that scripts the device state feedback: each iteration uploads
/// the next `RemeshCurrentState` into the state slot and reads it back,
/// standing in for kernels that decrement the live counts.
struct CountdownAlgorithm {
    schedule: Vec<RemeshCurrentState>,
    iteration: usize,
}

impl DecimationAlgorithm for CountdownAlgorithm {
    fn name(&self) -> &'static str {
        "countdown"
    }

    fn begin_task(
        &mut self,
        _context: &Context,
        _params: &RemeshParams,
        _input: &TaskInput,
    ) -> Result<TaskSetup> {
        Ok(TaskSetup::default())
    }

    fn continue_task(&mut self, _readback: &[ReadbackPayload]) -> Result<TaskStep> {
        let Some(state) = self.schedule.get(self.iteration).copied() else {
            return Ok(TaskStep {
                status: TaskStatus::Done,
                commands: Vec::new(),
            });
        };
        self.iteration += 1;
        let slot = RemeshResource::CurrentState.slot();
        Ok(TaskStep {
            status: TaskStatus::Continue,
            commands: vec![
                RemeshCommand::WriteResource {
                    slot,
                    data: bytemuck::bytes_of(&state).to_vec(),
                },
                RemeshCommand::ReadResources(vec![slot]),
            ],
        })
    }

    fn end_task(&mut self) {}
}

fn countdown_state(triangle_count: u32, vertex_count: u32) -> RemeshCurrentState {
    RemeshCurrentState {
        triangle_count,
        vertex_count,
        error_state: 0,
        iteration: 0,
    }
}

#[test]
fn readback_is_one_iteration_behind() {
    let _ = env_logger::builder().is_test(true).try_init();
    let context = test_context();
    let mut mesh = full_mesh(4);

    let settings = DeviceMeshSettings {
        attrib_flags: REQUIRED_ATTRIBUTES,
        usage_flags: DeviceMeshUsageFlags::COMPUTE_READ
            | DeviceMeshUsageFlags::COMPUTE_WRITE
            | DeviceMeshUsageFlags::READBACK,
    };
    let device_mesh = DeviceMesh::create(&context, &mesh, settings).unwrap();
    let positions = device_mesh.position_normal_buffer().unwrap().clone();

    let slot = RemeshResource::VertexPositions.slot();
    let (algorithm, log) = ScriptedAlgorithm::new(3, vec![slot]);
    let mut operator = RemeshOperator::new(&context, algorithm).unwrap();
    let params = RemeshParams {
        progressive: true,
        ..Default::default()
    };

    let marker = |n: u8| [n; 16];
    for call in 1u8..=3 {
        context
            .backend()
            .write_buffer(&positions, 0, &marker(call))
            .unwrap();
        let status = operator
            .remesh(&context, &params, &mut mesh, Some(&device_mesh))
            .unwrap();
        if call < 3 {
            assert_eq!(status, RemeshStatus::Continue);
            assert!(operator.has_active_task());
        } else {
            assert!(matches!(status, RemeshStatus::Success { .. }));
            assert!(!operator.has_active_task());
        }
    }

    let log = log.lock().unwrap();
    assert!(log.began && log.ended);
    assert_eq!(log.payloads.len(), 3);

    // First iteration: nothing harvested yet.
    assert!(log.payloads[0].is_empty());
    // Second iteration: the slot's first harvest is all zeroes, not the
    // bytes written before the first call.
    assert_eq!(log.payloads[1][0].slot, slot);
    assert_eq!(&log.payloads[1][0].data[..16], &[0u8; 16]);
    // Third iteration: the copy submitted by the first call is visible.
    assert_eq!(&log.payloads[2][0].data[..16], &marker(1));
}

#[test]
fn completion_without_device_counts_keeps_original_mesh() {
    let context = test_context();
    let mut mesh = full_mesh(6);

    let (algorithm, _log) = ScriptedAlgorithm::new(2, Vec::new());
    let mut operator = RemeshOperator::new(&context, algorithm).unwrap();
    let status = operator
        .remesh(&context, &RemeshParams::default(), &mut mesh, None)
        .unwrap();

    // Dispatches are no-ops on the software backend, so the state buffer
    // stays zeroed and the engine falls back to the input counts.
    assert_eq!(
        status,
        RemeshStatus::Success {
            triangle_count: 6,
            vertex_count: 18
        }
    );
    assert_eq!(mesh.triangle_count(), 6);
    assert_eq!(mesh.vertex_count(), 18);
    // Readback restored the uploaded positions.
    assert_eq!(mesh.positions[5], Vec3::new(5.0, 0.0, 0.0));
}

#[test]
fn missing_attributes_fail_before_any_task_starts() {
    let context = test_context();
    let mut mesh = full_mesh(4);
    mesh.importance.clear();

    let (algorithm, log) = ScriptedAlgorithm::new(1, Vec::new());
    let mut operator = RemeshOperator::new(&context, algorithm).unwrap();
    let err = operator
        .remesh(&context, &RemeshParams::default(), &mut mesh, None)
        .unwrap_err();

    assert!(matches!(err, MeshopsError::MissingAttributes(_)));
    assert!(!log.lock().unwrap().began);
}

#[test]
fn insufficient_device_mesh_settings_are_rejected() {
    let context = test_context();
    let mut mesh = full_mesh(4);

    // Right attributes, missing write/readback usage.
    let settings = DeviceMeshSettings {
        attrib_flags: REQUIRED_ATTRIBUTES,
        usage_flags: DeviceMeshUsageFlags::COMPUTE_READ,
    };
    let device_mesh = DeviceMesh::create(&context, &mesh, settings).unwrap();

    let (algorithm, _log) = ScriptedAlgorithm::new(1, Vec::new());
    let mut operator = RemeshOperator::new(&context, algorithm).unwrap();
    let err = operator
        .remesh(
            &context,
            &RemeshParams::default(),
            &mut mesh,
            Some(&device_mesh),
        )
        .unwrap_err();
    assert!(matches!(err, MeshopsError::InvalidParameter(_)));
}

#[test]
fn algorithm_failure_aborts_and_releases_the_task() {
    let context = test_context();
    let mut mesh = full_mesh(4);

    let (mut algorithm, log) = ScriptedAlgorithm::new(10, Vec::new());
    algorithm.fail_at = Some(2);
    let mut operator = RemeshOperator::new(&context, algorithm).unwrap();
    let err = operator
        .remesh(&context, &RemeshParams::default(), &mut mesh, None)
        .unwrap_err();

    assert!(matches!(err, MeshopsError::Algorithm(_)));
    assert!(log.lock().unwrap().ended);
    assert!(!operator.has_active_task());
    // The mesh was never modified.
    assert_eq!(mesh.triangle_count(), 4);
}

#[test]
fn scratch_slots_are_usable_and_task_scoped() {
    let context = test_context();
    let mut mesh = full_mesh(4);

    let log = Arc::new(Mutex::new(ScriptLog::default()));
    let scratch_read = meshops::remesh::scratch_slot(0);
    let algorithm = Box::new(ScriptedAlgorithm {
        log: log.clone(),
        total_iterations: 2,
        iteration: 0,
        read_slots: vec![scratch_read],
        scratch: vec![ScratchRequest {
            label: "edge candidates".to_string(),
            size: 128,
        }],
        fail_at: None,
    });
    let mut operator = RemeshOperator::new(&context, algorithm).unwrap();
    let status = operator
        .remesh(&context, &RemeshParams::default(), &mut mesh, None)
        .unwrap();
    assert!(matches!(status, RemeshStatus::Success { .. }));

    let log = log.lock().unwrap();
    // The scratch slot existed and was harvested like any other resource.
    assert_eq!(log.payloads[1][0].slot, scratch_read);
    assert_eq!(log.payloads[1][0].data.len(), 128);
}

#[test]
fn no_triangle_budget_runs_many_iterations() {
    let context = test_context();
    let mut mesh = full_mesh(4);

    // error_threshold-driven run, long enough to cross the every-50
    // iteration logging path.
    let (algorithm, log) = ScriptedAlgorithm::new(120, Vec::new());
    let mut operator = RemeshOperator::new(&context, algorithm).unwrap();
    let params = RemeshParams {
        max_output_triangle_count: 0,
        error_threshold: 100.0,
        ..Default::default()
    };
    let status = operator.remesh(&context, &params, &mut mesh, None).unwrap();
    assert!(matches!(status, RemeshStatus::Success { .. }));
    assert_eq!(log.lock().unwrap().payloads.len(), 120);
}

#[test]
fn live_counts_decrease_monotonically_toward_the_target() {
    let context = test_context();
    let mut mesh = full_mesh(6);
    let target = 4u32;

    let algorithm = Box::new(CountdownAlgorithm {
        schedule: vec![
            countdown_state(6, 18),
            countdown_state(5, 15),
            countdown_state(4, 12),
        ],
        iteration: 0,
    });
    let mut operator = RemeshOperator::new(&context, algorithm).unwrap();
    let params = RemeshParams {
        progressive: true,
        max_output_triangle_count: target,
        ..Default::default()
    };

    let mut observed = Vec::new();
    let status = loop {
        match operator
            .remesh(&context, &params, &mut mesh, None)
            .unwrap()
        {
            RemeshStatus::Continue => {
                let (triangles, _) = operator.live_counts().unwrap();
                observed.push(triangles);
            }
            status => break status,
        }
    };

    assert!(!observed.is_empty());
    assert!(
        observed.windows(2).all(|w| w[1] <= w[0]),
        "live counts never increase: {observed:?}"
    );
    assert!(observed.iter().all(|&t| t >= target));
    assert_eq!(
        status,
        RemeshStatus::Success {
            triangle_count: 4,
            vertex_count: 12
        }
    );
    assert_eq!(mesh.triangle_count(), 4);
    assert_eq!(mesh.vertex_count(), 12);
    assert!(!operator.has_active_task());
}

#[test]
fn device_error_state_aborts_the_task() {
    let context = test_context();
    let mut mesh = full_mesh(6);

    // Edge storage exhaustion reported by the first iteration, observed by
    // the engine one iteration later.
    let algorithm = Box::new(CountdownAlgorithm {
        schedule: vec![
            RemeshCurrentState {
                triangle_count: 6,
                vertex_count: 18,
                error_state: 4,
                iteration: 0,
            },
            countdown_state(6, 18),
        ],
        iteration: 0,
    });
    let mut operator = RemeshOperator::new(&context, algorithm).unwrap();
    let err = operator
        .remesh(&context, &RemeshParams::default(), &mut mesh, None)
        .unwrap_err();
    assert!(matches!(err, MeshopsError::Algorithm(_)));
    assert!(err.to_string().contains("edge storage"));
    assert!(!operator.has_active_task());
}

#[test]
fn remesh_all_processes_every_mesh() {
    let context = test_context();
    let mut meshes = vec![full_mesh(2), full_mesh(3), full_mesh(5)];

    let (algorithm, log) = ScriptedAlgorithm::new(1, Vec::new());
    let mut operator = RemeshOperator::new(&context, algorithm).unwrap();
    operator
        .remesh_all(&context, &RemeshParams::default(), &mut meshes)
        .unwrap();

    assert_eq!(log.lock().unwrap().payloads.len(), 3);
    assert_eq!(meshes[2].triangle_count(), 5);
}
