//! # Correction computation
//!
//! Runs the feedback solver and gates its output before anything reaches a subsystem:
//!  1. the solver output must be finite and within the divergence limit,
//!  2. each mode contribution is clipped to its safety limit,
//!  3. each mirror contribution is brought down to its stress limit, either scaled
//!     or truncated to its lower order bending modes ([StressScaleApproach]),
//!  4. the subsystem commands too small to be worth sending are suppressed.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{
    config::AosConfig,
    control::{FeedbackSolver, SolverInput, N_STRESS},
    dof::{DofMask, DofState, DofVector, N_DOF},
    subsystem::{Subsystem, BENDING_OFFSET},
    wavefront::WavefrontSnapshot,
    Error, Result,
};

/// Safety limit violation
///
/// A violation is not fatal: the contribution is reduced to the limit and the cycle goes on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyEvent {
    /// The contribution of DOF `index` was clipped to `±limit`
    ModeAmplitude {
        index: usize,
        proposed: f64,
        limit: f64,
    },
    /// The bending modes of a mirror were scaled or truncated to bring
    /// the RSS stress `stress` within `limit`
    MirrorStress {
        subsystem: Subsystem,
        stress: f64,
        limit: f64,
    },
}

/// Reduction of a mirror correction above its stress limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StressScaleApproach {
    /// All the bending modes are scaled by `limit/stress`
    #[default]
    Scale,
    /// The highest order bending modes are zeroed until the stress is within the limit
    Truncate,
}

/// Lifecycle of a [CorrectionCommand]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Ready to be issued
    Pending,
    /// Below the minimum application threshold, never issued
    Suppressed,
    Accepted,
    Rejected,
    /// Not acknowledged in time, rolled back like a rejection
    TimedOut,
}

/// Correction of one subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionCommand {
    pub subsystem: Subsystem,
    /// The subsystem part of the DOF correction
    pub delta: Vec<f64>,
    /// Whether a safety limit reduced the correction
    pub clipped: bool,
    pub status: CommandStatus,
}
impl CorrectionCommand {
    /// Splits `delta` into one command per subsystem, in [Subsystem::ALL] order
    ///
    /// The commands without any non-zero entry are suppressed.
    pub fn split(delta: &DofVector) -> Vec<Self> {
        Subsystem::ALL
            .into_iter()
            .map(|subsystem| {
                let delta = delta[subsystem.dof_range()].to_vec();
                let status = if delta.iter().all(|d| *d == 0f64) {
                    CommandStatus::Suppressed
                } else {
                    CommandStatus::Pending
                };
                Self {
                    subsystem,
                    delta,
                    clipped: false,
                    status,
                }
            })
            .collect()
    }
    /// Largest absolute value of the correction
    pub fn magnitude(&self) -> f64 {
        self.delta.iter().fold(0f64, |m, d| m.max(d.abs()))
    }
    pub fn is_suppressed(&self) -> bool {
        self.status == CommandStatus::Suppressed
    }
    /// Returns the correction as a full DOF vector
    pub fn dof_delta(&self) -> DofVector {
        DofVector::scatter(self.subsystem.dof_range(), &self.delta)
    }
}

/// Output of [CorrectionComputer::compute]
#[derive(Debug, Clone)]
pub struct Correction {
    /// One command per subsystem, in [Subsystem::ALL] order
    pub commands: Vec<CorrectionCommand>,
    /// Gated DOF correction
    pub delta: DofVector,
    /// Raw predicted stresses of the proposed correction
    pub stresses: Vec<f64>,
    pub safety: Vec<SafetyEvent>,
}
impl Correction {
    /// Commands that may be issued
    pub fn issuable(&self) -> impl Iterator<Item = &CorrectionCommand> {
        self.commands.iter().filter(|c| !c.is_suppressed())
    }
    pub fn command(&self, subsystem: Subsystem) -> Option<&CorrectionCommand> {
        self.commands.iter().find(|c| c.subsystem == subsystem)
    }
    /// Predicted stresses of the `subsystem` bending modes
    pub fn mirror_stresses(&self, subsystem: Subsystem) -> Option<&[f64]> {
        subsystem
            .is_mirror()
            .then(|| &self.stresses[stress_range(subsystem)])
    }
}

fn stress_range(subsystem: Subsystem) -> Range<usize> {
    let range = subsystem.dof_range();
    range.start - BENDING_OFFSET..range.end - BENDING_OFFSET
}

/// Safety and threshold gated feedback
pub struct CorrectionComputer {
    solver: Box<dyn FeedbackSolver>,
    safety_limits: Vec<f64>,
    stress_limits: [Option<f64>; 2],
    stress_scale_approach: StressScaleApproach,
    stress_scale_factor: f64,
    min_thresholds: [f64; 4],
    divergence_limit: f64,
}
impl CorrectionComputer {
    /// Creates the computer with the limits and thresholds of `config`
    pub fn new<S: FeedbackSolver + 'static>(solver: S, config: &AosConfig) -> Self {
        Self {
            solver: Box::new(solver),
            safety_limits: config.safety_limits.clone(),
            stress_limits: [config.m1_stress_limit, config.m2_stress_limit],
            stress_scale_approach: config.stress_scale_approach,
            stress_scale_factor: config.stress_scale_factor,
            min_thresholds: Subsystem::ALL.map(|s| config.min_threshold(s)),
            divergence_limit: config.divergence_limit,
        }
    }
    fn stress_limit(&self, subsystem: Subsystem) -> Option<f64> {
        match subsystem {
            Subsystem::M1 => self.stress_limits[0],
            Subsystem::M2 => self.stress_limits[1],
            _ => None,
        }
    }
    /// RSS of the bending mode stresses
    fn rss(&self, stresses: &[f64]) -> f64 {
        self.stress_scale_factor * stresses.iter().map(|s| s * s).sum::<f64>().sqrt()
    }
    /// Computes the gated subsystem corrections
    ///
    /// The DOF state is only read, it is never modified here.
    pub fn compute(
        &self,
        wavefront: &WavefrontSnapshot,
        dof: &DofState,
        gain: f64,
    ) -> Result<Correction> {
        self.compute_masked(wavefront, dof, dof.mask(), gain)
    }
    /// Computes the gated subsystem corrections of the DOF active in both `mask` and `dof`
    pub fn compute_masked(
        &self,
        wavefront: &WavefrontSnapshot,
        dof: &DofState,
        mask: &DofMask,
        gain: f64,
    ) -> Result<Correction> {
        let mask = dof.mask().intersect(mask);
        if !gain.is_finite() || gain <= 0f64 {
            return Err(Error::Configuration(format!("invalid gain: {gain}")));
        }
        if wavefront.values().all(Vec::is_empty) {
            return Err(Error::Configuration("no wavefront error to correct".into()));
        }
        let output = self.solver.solve(&SolverInput {
            wavefront,
            dof: dof.current(),
            mask: &mask,
            gain,
        })?;
        if output.delta.len() != N_DOF || output.stresses.len() != N_STRESS {
            return Err(Error::Computation(format!(
                "solver returned {} DOF and {} stresses, expected {N_DOF} and {N_STRESS}",
                output.delta.len(),
                output.stresses.len()
            )));
        }
        if let Some(i) = output.delta.iter().position(|d| !d.is_finite()) {
            return Err(Error::Computation(format!("DOF #{i} correction is not finite")));
        }
        if output.stresses.iter().any(|s| !s.is_finite()) {
            return Err(Error::Computation("predicted stresses are not finite".into()));
        }
        if let Some(i) = output
            .delta
            .iter()
            .position(|d| d.abs() > self.divergence_limit)
        {
            return Err(Error::Computation(format!(
                "DOF #{i} correction {:e} diverges (limit: {:e})",
                output.delta[i], self.divergence_limit
            )));
        }

        let mut delta = DofVector::zeros();
        for i in mask.active_indices() {
            delta[i] = output.delta[i];
        }

        let mut safety = vec![];
        let mut clipped = [false; 4];
        for (i, limit) in self.safety_limits.iter().enumerate() {
            let proposed = delta[i];
            if proposed.abs() > *limit {
                log::warn!("DOF #{i} correction {proposed:.3e} clipped to ±{limit:.3e}");
                delta[i] = limit.copysign(proposed);
                safety.push(SafetyEvent::ModeAmplitude {
                    index: i,
                    proposed,
                    limit: *limit,
                });
                if let Some(subsystem) = Subsystem::of_dof(i) {
                    clipped[subsystem.index()] = true;
                }
            }
        }

        for subsystem in [Subsystem::M1, Subsystem::M2] {
            let Some(limit) = self.stress_limit(subsystem) else {
                continue;
            };
            let range = subsystem.dof_range();
            let mut stresses: Vec<f64> = output.stresses[stress_range(subsystem)]
                .iter()
                .zip(range.clone())
                .map(|(s, i)| {
                    let proposed = output.delta[i];
                    if proposed == 0f64 {
                        0f64
                    } else {
                        s * delta[i] / proposed
                    }
                })
                .collect();
            let stress = self.rss(&stresses);
            if stress > limit {
                match self.stress_scale_approach {
                    StressScaleApproach::Scale => {
                        log::warn!(
                            "{subsystem} stress {stress:.3} above limit {limit:.3}, scaling bending modes"
                        );
                        let scale = limit / stress;
                        range.for_each(|i| delta[i] *= scale);
                    }
                    StressScaleApproach::Truncate => {
                        for (k, i) in range.enumerate().rev() {
                            if self.rss(&stresses) <= limit {
                                break;
                            }
                            stresses[k] = 0f64;
                            delta[i] = 0f64;
                        }
                        log::warn!(
                            "{subsystem} stress {stress:.3} above limit {limit:.3}, truncated to {:.3}",
                            self.rss(&stresses)
                        );
                    }
                }
                safety.push(SafetyEvent::MirrorStress {
                    subsystem,
                    stress,
                    limit,
                });
                clipped[subsystem.index()] = true;
            }
        }

        let mut commands = CorrectionCommand::split(&delta);
        for command in commands.iter_mut() {
            let subsystem = command.subsystem;
            command.clipped = clipped[subsystem.index()];
            let magnitude = command.magnitude();
            let threshold = self.min_thresholds[subsystem.index()];
            if !command.is_suppressed() && magnitude < threshold {
                log::info!(
                    "{subsystem} correction {magnitude:.3e} below threshold {threshold:.3e}, suppressed"
                );
                command.status = CommandStatus::Suppressed;
            }
        }

        Ok(Correction {
            commands,
            delta,
            stresses: output.stresses,
            safety,
        })
    }
}
