//! Stand-in wavefront estimation pipeline
//!
//! Writes one record per detector and per visit, with coefficients for the modes 4 to 22.
//! Recognized `--config` overrides:
//!  - `amplitude=<f64>`: scales the coefficients (default: 1)
//!  - `delay_ms=<u64>`: processing time (default: 0)
//!  - `fail=1`: exits with an error

use aos::{DetectorId, VisitId, WavefrontErrorRecord};
use clap::Parser;
use std::{collections::HashMap, fs::File, io::BufWriter, path::PathBuf, thread, time::Duration};

/// Parse a `key=value` configuration override
fn parse_override(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("invalid override {s:?}, expected key=value"))
}

#[derive(Parser, Debug)]
#[command(name = "mock_wep", about = "Stand-in wavefront estimation pipeline", long_about = None)]
struct Args {
    /// Detectors to process (comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    detectors: Vec<DetectorId>,

    /// Calibration reference
    #[arg(long)]
    calibration: PathBuf,

    /// Visit identifier, repeated for each visit
    #[arg(long = "visit", required = true)]
    visits: Vec<VisitId>,

    /// Configuration override (key=value), repeated for each override
    #[arg(long = "config", value_parser = parse_override)]
    overrides: Vec<(String, String)>,

    /// Output file of the wavefront error records
    #[arg(long)]
    output: PathBuf,
}

struct Overrides(HashMap<String, String>);
impl Overrides {
    fn get<T: std::str::FromStr>(&self, key: &str) -> anyhow::Result<Option<T>>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        Ok(self.0.get(key).map(|v| v.parse()).transpose()?)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let overrides = Overrides(args.overrides.into_iter().collect());
    println!(
        "estimating wavefront errors of {} detector(s) for {} visit(s) with {:?}",
        args.detectors.len(),
        args.visits.len(),
        args.calibration
    );

    if let Some(delay) = overrides.get::<u64>("delay_ms")? {
        thread::sleep(Duration::from_millis(delay));
    }
    if overrides.get::<u8>("fail")?.unwrap_or(0) > 0 {
        eprintln!("wavefront estimation failed: no donut found");
        std::process::exit(2);
    }
    let amplitude = overrides.get::<f64>("amplitude")?.unwrap_or(1f64);

    let mut records = vec![];
    for visit in &args.visits {
        for &detector in &args.detectors {
            let coefficients: Vec<f64> = (4..=22)
                .map(|mode| amplitude * 1e-2 * (mode as f64 - 3.0) / (detector % 10 + 1) as f64)
                .collect();
            println!("{visit} detector #{detector}: {} modes", coefficients.len());
            records.push(WavefrontErrorRecord::dense(
                detector,
                visit.clone(),
                4,
                &coefficients,
            ));
        }
    }
    bincode::serialize_into(BufWriter::new(File::create(&args.output)?), &records)?;
    println!("{} records written to {:?}", records.len(), args.output);
    Ok(())
}
