use aos::{
    control::N_STRESS, AosConfig, CorrectionIssuer, CycleState, Error, MemorySink, Orchestrator,
    PipelineConfig, SensitivitySolver, SimulatedSubsystem, Subsystem, TelemetryEvent, VisitId,
    N_DOF,
};
use nalgebra as na;
use std::{path::Path, sync::Arc, time::Duration};

const DETECTORS: [u32; 2] = [191, 195];

fn solver() -> SensitivitySolver {
    let rows: Vec<_> = DETECTORS
        .iter()
        .flat_map(|&detector| (4..=22).map(move |mode| (detector, mode)))
        .collect();
    let n_row = rows.len();
    let matrix = na::DMatrix::from_fn(n_row, N_DOF, |i, j| if i % N_DOF == j { 1.0 } else { 0.0 });
    SensitivitySolver::new(rows, matrix)
        .unwrap()
        .stress_per_mode(vec![1.0; N_STRESS])
        .unwrap()
}

fn wep(dir: &Path, visit: u64) -> PipelineConfig {
    PipelineConfig::new(env!("CARGO_BIN_EXE_mock_wep"))
        .detectors(DETECTORS)
        .calibration(dir.join("calibration"))
        .visit(VisitId::new("closed-loop", visit))
        .output(dir.join(format!("wep-{visit}.bin")))
}

fn orchestrator(m2: SimulatedSubsystem) -> (Orchestrator, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let config = AosConfig {
        gain: 0.5,
        poll_interval: Duration::from_millis(10),
        pipeline_timeout: Duration::from_secs(30),
        ack_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let issuer = CorrectionIssuer::new(config.ack_timeout)
        .channel(Subsystem::M2Hexapod, SimulatedSubsystem::accepting())
        .channel(Subsystem::CameraHexapod, SimulatedSubsystem::accepting())
        .channel(Subsystem::M1, SimulatedSubsystem::accepting())
        .channel(Subsystem::M2, m2);
    let orchestrator = Orchestrator::new(config, solver(), issuer, sink.clone()).unwrap();
    (orchestrator, sink)
}

#[tokio::test]
async fn closed_loop_with_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let (aos, sink) = orchestrator(SimulatedSubsystem::accepting());

    assert_eq!(aos.run_wep(&wep(dir.path(), 1)).await.unwrap(), 2);
    assert_eq!(aos.run_wep(&wep(dir.path(), 2)).await.unwrap(), 2);
    assert_eq!(aos.pending_records().unwrap(), 4);
    let report = aos.run_cycle(None).await.unwrap();
    assert!(report.is_committed());
    assert_eq!(aos.state().unwrap(), CycleState::Idle);
    assert_eq!(aos.pending_records().unwrap(), 0);
    assert!(aos.dof().unwrap().iter().any(|x| *x != 0.0));

    let events = sink.events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::WepDuration { .. }))
            .count(),
        2
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, TelemetryEvent::WavefrontError { detector: 191, .. })));
}

#[tokio::test]
async fn pipeline_failure_keeps_collected_records() {
    let dir = tempfile::tempdir().unwrap();
    let (aos, _) = orchestrator(SimulatedSubsystem::accepting());

    assert!(matches!(
        aos.run_wep(&wep(dir.path(), 1).set("fail", 1)).await,
        Err(Error::PipelineFailure(msg)) if msg.contains("no donut found")
    ));
    assert_eq!(aos.state().unwrap(), CycleState::Idle);

    aos.run_wep(&wep(dir.path(), 2)).await.unwrap();
    assert!(aos.run_wep(&wep(dir.path(), 3).set("fail", 1)).await.is_err());
    assert_eq!(aos.state().unwrap(), CycleState::Collecting);
    assert_eq!(aos.pending_records().unwrap(), 2);
}

#[tokio::test]
async fn partial_rejection_resynchronizes_the_rejecting_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let (aos, sink) = orchestrator(SimulatedSubsystem::rejecting());

    aos.run_wep(&wep(dir.path(), 1).set("amplitude", 2.0))
        .await
        .unwrap();
    let report = aos.run_cycle(None).await.unwrap();
    assert_eq!(report.rejections.len(), 1);
    let dof = aos.dof().unwrap();
    assert!(Subsystem::M2.dof_range().all(|i| dof[i] == 0.0));

    let rejection = sink
        .events()
        .into_iter()
        .find_map(|e| match e {
            TelemetryEvent::Rejection(notice) => Some(notice),
            _ => None,
        })
        .unwrap();
    assert_eq!(rejection.subsystem, Subsystem::M2);
    assert_eq!(rejection.delta.len(), 20);

    // the next cycle starts from fresh measurements only
    assert!(matches!(
        aos.run_cycle(None).await,
        Err(Error::Transition { .. })
    ));
}

#[tokio::test]
async fn reset_interrupts_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let (aos, _) = orchestrator(SimulatedSubsystem::accepting());
    let offset = aos::DofVector::repeat(0.1);
    assert!(aos.offset_dof(&offset).await.unwrap().is_committed());
    assert_eq!(aos.dof().unwrap(), offset);

    let slow = wep(dir.path(), 1).set("delay_ms", 10_000);
    let (collected, _) = tokio::join!(
        aos.run_wep(&slow),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            aos.reset().unwrap();
        }
    );
    assert!(matches!(collected, Err(Error::CycleReset)));
    assert_eq!(aos.dof().unwrap(), aos::DofVector::zeros());
    assert_eq!(aos.state().unwrap(), CycleState::Idle);
    assert_eq!(aos.pending_records().unwrap(), 0);
}
