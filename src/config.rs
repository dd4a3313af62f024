//! # Configuration
//!
//! Every recognized option of the closed loop.
//! A configuration is loaded from a bincode (`.bin`) or a pickle (`.pkl`, `.pickle`) file,
//! or from the environment:
//!  - `AOS_CONFIG`: path to the configuration file, defaults are used if unset
//!  - `AOS_GAIN`: overrides the feedback gain

use std::{
    env,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    correction::StressScaleApproach,
    dof::{DofMask, DofVector, N_DOF},
    subsystem::{Subsystem, BENDING_OFFSET},
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AosConfig {
    /// Scales the proposed correction
    pub gain: f64,
    /// Largest contribution of each DOF to a correction
    pub safety_limits: Vec<f64>,
    /// Largest RSS stress of the M1 bending modes
    pub m1_stress_limit: Option<f64>,
    /// Largest RSS stress of the M2 bending modes
    pub m2_stress_limit: Option<f64>,
    /// Reduction of a mirror correction above its stress limit
    pub stress_scale_approach: StressScaleApproach,
    /// Multiplies the RSS of the bending mode stresses before it is compared to the limit
    pub stress_scale_factor: f64,
    /// Smallest command magnitude worth issuing, per subsystem in [Subsystem::ALL] order
    pub min_thresholds: Vec<f64>,
    /// Modifiable degrees of freedom
    pub active_mask: DofMask,
    /// DOF vector restored on reset
    pub initial_state: DofVector,
    /// Solver output above this magnitude is considered diverging
    pub divergence_limit: f64,
    pub poll_interval: Duration,
    pub pipeline_timeout: Duration,
    pub ack_timeout: Duration,
    /// Number of times a command is resent after an acknowledgment timeout
    pub ack_retries: usize,
}
impl Default for AosConfig {
    fn default() -> Self {
        Self {
            gain: 0.7,
            safety_limits: (0..N_DOF)
                .map(|i| if i < BENDING_OFFSET { 500.0 } else { 2.0 })
                .collect(),
            m1_stress_limit: None,
            m2_stress_limit: None,
            stress_scale_approach: StressScaleApproach::Scale,
            stress_scale_factor: 1.0,
            min_thresholds: vec![1e-3; Subsystem::ALL.len()],
            active_mask: DofMask::all(),
            initial_state: DofVector::zeros(),
            divergence_limit: 1e6,
            poll_interval: Duration::from_millis(100),
            pipeline_timeout: Duration::from_secs(600),
            ack_timeout: Duration::from_secs(30),
            ack_retries: 0,
        }
    }
}
impl AosConfig {
    /// Loads the configuration from a bincode or a pickle file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let config: Self = match extension(path)? {
            Format::Bincode => bincode::deserialize_from(reader)?,
            Format::Pickle => serde_pickle::from_reader(reader, Default::default())?,
        };
        log::info!("configuration loaded from {path:?}");
        config.validate()?;
        Ok(config)
    }
    /// Saves the configuration to a bincode or a pickle file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let format = extension(path)?;
        let mut writer = BufWriter::new(File::create(path)?);
        match format {
            Format::Bincode => bincode::serialize_into(&mut writer, self)?,
            Format::Pickle => serde_pickle::to_writer(&mut writer, self, Default::default())?,
        }
        Ok(())
    }
    /// Loads the configuration from `AOS_CONFIG`, and applies the `AOS_GAIN` override
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var("AOS_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => Default::default(),
        };
        if let Ok(gain) = env::var("AOS_GAIN") {
            config.gain = gain
                .parse()
                .map_err(|_| Error::Configuration(format!("AOS_GAIN={gain} is not a number")))?;
        }
        config.validate()?;
        Ok(config)
    }
    /// Minimum application threshold of `subsystem`
    pub fn min_threshold(&self, subsystem: Subsystem) -> f64 {
        self.min_thresholds
            .get(subsystem.index())
            .copied()
            .unwrap_or_default()
    }
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Configuration(msg));
        if !self.gain.is_finite() || self.gain <= 0f64 {
            return invalid(format!("gain must be positive, found {}", self.gain));
        }
        if self.safety_limits.len() != N_DOF {
            return invalid(format!(
                "expected {N_DOF} safety limits, found {}",
                self.safety_limits.len()
            ));
        }
        if self.safety_limits.iter().any(|l| l.is_nan() || *l < 0f64) {
            return invalid("safety limits must be positive".into());
        }
        if self.min_thresholds.len() != Subsystem::ALL.len() {
            return invalid(format!(
                "expected {} minimum thresholds, found {}",
                Subsystem::ALL.len(),
                self.min_thresholds.len()
            ));
        }
        if self.min_thresholds.iter().any(|t| t.is_nan() || *t < 0f64) {
            return invalid("minimum thresholds must be positive".into());
        }
        if [self.m1_stress_limit, self.m2_stress_limit]
            .into_iter()
            .flatten()
            .any(|l| l.is_nan() || l <= 0f64)
        {
            return invalid("stress limits must be positive".into());
        }
        if !self.stress_scale_factor.is_finite() || self.stress_scale_factor <= 0f64 {
            return invalid(format!(
                "stress scale factor must be positive, found {}",
                self.stress_scale_factor
            ));
        }
        // serde bypasses the length checks of the DOF types
        if self.initial_state.len() != N_DOF || self.active_mask.len() != N_DOF {
            return invalid(format!(
                "initial state and active mask must have {N_DOF} entries"
            ));
        }
        if self.initial_state.iter().any(|x| !x.is_finite()) {
            return invalid("initial state must be finite".into());
        }
        if !(self.divergence_limit > 0f64) {
            return invalid("divergence limit must be positive".into());
        }
        if self.poll_interval.is_zero()
            || self.pipeline_timeout.is_zero()
            || self.ack_timeout.is_zero()
        {
            return invalid("poll interval and timeouts must be non-zero".into());
        }
        Ok(())
    }
}

enum Format {
    Bincode,
    Pickle,
}
fn extension(path: &Path) -> Result<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("bin") => Ok(Format::Bincode),
        Some("pkl" | "pickle") => Ok(Format::Pickle),
        _ => Err(Error::Configuration(format!(
            "unsupported configuration file {path:?}, expected .bin, .pkl or .pickle"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AosConfig::default();
        config.validate().unwrap();
        assert_eq!(config.safety_limits.len(), N_DOF);
        assert_eq!(config.min_threshold(Subsystem::M2), 1e-3);
        assert_eq!(config.ack_retries, 0);
    }

    #[test]
    fn test_invalid_configs() {
        let bad = [
            AosConfig {
                gain: 0.0,
                ..Default::default()
            },
            AosConfig {
                safety_limits: vec![1.0; 10],
                ..Default::default()
            },
            AosConfig {
                min_thresholds: vec![-1.0; 4],
                ..Default::default()
            },
            AosConfig {
                m2_stress_limit: Some(0.0),
                ..Default::default()
            },
            AosConfig {
                ack_timeout: Duration::ZERO,
                ..Default::default()
            },
            AosConfig {
                stress_scale_factor: 0.0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(Error::Configuration(_))));
        }
    }

    #[test]
    fn test_bincode_and_pickle_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = AosConfig {
            gain: 0.3,
            m1_stress_limit: Some(120.0),
            active_mask: DofMask::all().exclude(3),
            ack_retries: 2,
            stress_scale_approach: StressScaleApproach::Truncate,
            stress_scale_factor: 1.5,
            ..Default::default()
        };
        for name in ["aos.bin", "aos.pkl"] {
            let path = dir.path().join(name);
            config.save(&path).unwrap();
            assert_eq!(AosConfig::load(&path).unwrap(), config);
        }
        assert!(config.save(dir.path().join("aos.yaml")).is_err());
    }
}
