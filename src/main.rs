use aos::{
    subsystem::N_BENDING_MODE, AosConfig, CorrectionIssuer, Orchestrator, PickleSink,
    PipelineConfig, SensitivitySolver, SimulatedSubsystem, Subsystem, VisitId, N_DOF,
};
use chrono::prelude::*;
use linya::{Bar, Progress};
use nalgebra as na;
use std::{
    env,
    fs::{create_dir_all, File},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

const DETECTORS: [u32; 4] = [191, 195, 199, 203];
const MODES: std::ops::RangeInclusive<usize> = 4..=22;

/// Loads the sensitivity matrix from `AOS_SENSITIVITY` or builds a diagonally dominant one
fn sensitivity() -> anyhow::Result<SensitivitySolver> {
    let rows: Vec<(u32, usize)> = DETECTORS
        .iter()
        .flat_map(|&detector| MODES.map(move |mode| (detector, mode)))
        .collect();
    let n_row = rows.len();
    let matrix = match env::var("AOS_SENSITIVITY") {
        Ok(path) => {
            log::info!("loading sensitivity matrix from {path}");
            let data: Vec<f64> = bincode::deserialize_from(File::open(path)?)?;
            if data.len() != n_row * N_DOF {
                anyhow::bail!(
                    "expected a {n_row}x{N_DOF} sensitivity matrix, found {} entries",
                    data.len()
                );
            }
            na::DMatrix::from_vec(n_row, N_DOF, data)
        }
        Err(_) => na::DMatrix::from_fn(n_row, N_DOF, |i, j| {
            if i % N_DOF == j {
                1f64
            } else {
                1e-2 * (((i * 7 + j * 13) % 17) as f64 / 17.0 - 0.5)
            }
        }),
    };
    Ok(SensitivitySolver::new(rows, matrix)?.stress_per_mode(vec![1e2; 2 * N_BENDING_MODE])?)
}

fn wep_program() -> anyhow::Result<PathBuf> {
    Ok(match env::var("AOS_WEP_PROGRAM") {
        Ok(program) => program.into(),
        Err(_) => env::current_exe()?.with_file_name("mock_wep"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let local: DateTime<Local> = Local::now();
    let data_path = Path::new(".").join("data").join(local.to_rfc3339());
    create_dir_all(&data_path)?;
    println!("Data repository: {:?}", &data_path);

    let config = AosConfig::from_env()?;
    let n_cycle = env::var("AOS_N_CYCLE")
        .ok()
        .map(|n| n.parse::<usize>())
        .transpose()?
        .unwrap_or(5);
    let calibration = env::var("AOS_CALIBRATION").unwrap_or_else(|_| "calibration".to_string());
    let program = wep_program()?;
    log::info!("Closed loop: {n_cycle} cycles with gain {}", config.gain);

    let issuer = Subsystem::ALL.into_iter().fold(
        CorrectionIssuer::new(config.ack_timeout).retries(config.ack_retries),
        |issuer, subsystem| {
            issuer.channel(
                subsystem,
                SimulatedSubsystem::accepting().latency(Duration::from_millis(10)),
            )
        },
    );
    let sink = Arc::new(PickleSink::create(data_path.join("telemetry.pkl"))?);
    let aos = Orchestrator::new(config, sensitivity()?, issuer, sink)?;

    let mut progress = Progress::new();
    let bar: Bar = progress.bar(n_cycle, "Closed loop");
    for cycle in 0..n_cycle {
        let wep = PipelineConfig::new(&program)
            .detectors(DETECTORS)
            .calibration(&calibration)
            .visit(VisitId::new("aos", 2 * cycle as u64))
            .visit(VisitId::new("aos", 2 * cycle as u64 + 1))
            .set("amplitude", 0.5f64.powi(cycle as i32))
            .output(data_path.join(format!("wep-{cycle:03}.bin")));
        match aos.run_wep(&wep).await {
            Ok(n) => log::info!("cycle #{cycle}: {n} wavefront error records"),
            Err(e) => {
                log::error!("cycle #{cycle}: {e}");
                progress.inc_and_draw(&bar, 1);
                continue;
            }
        }
        let report = aos.run_cycle(None).await?;
        if !report.is_committed() {
            log::warn!("cycle #{cycle}: {} rejection(s)", report.rejections.len());
        }
        progress.inc_and_draw(&bar, 1);
    }

    let dof = aos.dof()?;
    println!(
        "Bending modes RSS: {:.6}",
        dof[Subsystem::M1.dof_range().start..]
            .iter()
            .map(|x| x * x)
            .sum::<f64>()
            .sqrt()
    );
    Ok(())
}
