//! # Optical feedback control
//!
//! The feedback solver turns the aggregated wavefront errors into a proposed
//! DOF correction and the predicted mirror stresses of that correction.

use nalgebra as na;

use crate::{
    dof::{DofMask, DofVector, N_DOF},
    subsystem::{BENDING_OFFSET, N_BENDING_MODE},
    wavefront::{DetectorId, WavefrontSnapshot},
    Error, Result,
};

/// Number of predicted stresses: M1 bending modes followed by M2 bending modes
pub const N_STRESS: usize = 2 * N_BENDING_MODE;

/// Feedback solver inputs
pub struct SolverInput<'a> {
    pub wavefront: &'a WavefrontSnapshot,
    pub dof: &'a DofVector,
    pub mask: &'a DofMask,
    pub gain: f64,
}

/// Feedback solver outputs
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutput {
    /// Proposed DOF correction, [N_DOF] entries
    pub delta: Vec<f64>,
    /// Predicted stress per bending mode, [N_STRESS] entries
    pub stresses: Vec<f64>,
}

/// Interface to the optical feedback solver
///
/// A solver is a pure function of its inputs.
pub trait FeedbackSolver: Send + Sync {
    fn solve(&self, input: &SolverInput<'_>) -> Result<SolverOutput>;
}
impl<F> FeedbackSolver for F
where
    F: Fn(&SolverInput<'_>) -> Result<SolverOutput> + Send + Sync,
{
    fn solve(&self, input: &SolverInput<'_>) -> Result<SolverOutput> {
        self(input)
    }
}

/// Integral controller based on the pseudo-inverse of a sensitivity matrix
///
/// The sensitivity matrix maps the degrees of freedom to the wavefront error
/// coefficients; each row is labeled with the detector and the mode index it measures.
/// The correction is `-gain * pinv(S) * w` restricted to the active degrees of freedom
/// and to the rows that were actually measured, the integration being performed
/// by the [DofState](crate::DofState).
pub struct SensitivitySolver {
    rows: Vec<(DetectorId, usize)>,
    sensitivity: na::DMatrix<f64>,
    stress_per_mode: Vec<f64>,
    rcond: f64,
}
impl SensitivitySolver {
    /// Creates a solver from the row labels and the `rows.len()x50` sensitivity matrix
    pub fn new(rows: Vec<(DetectorId, usize)>, sensitivity: na::DMatrix<f64>) -> Result<Self> {
        if sensitivity.nrows() != rows.len() || sensitivity.ncols() != N_DOF {
            return Err(Error::Configuration(format!(
                "sensitivity matrix is {}x{}, expected {}x{N_DOF}",
                sensitivity.nrows(),
                sensitivity.ncols(),
                rows.len()
            )));
        }
        Ok(Self {
            rows,
            sensitivity,
            stress_per_mode: vec![0f64; N_STRESS],
            rcond: 1e-9,
        })
    }
    /// Sets the stress of a unit amplitude of each bending mode
    pub fn stress_per_mode(mut self, stress_per_mode: Vec<f64>) -> Result<Self> {
        if stress_per_mode.len() != N_STRESS {
            return Err(Error::Configuration(format!(
                "expected {N_STRESS} stress coefficients, found {}",
                stress_per_mode.len()
            )));
        }
        self.stress_per_mode = stress_per_mode;
        Ok(self)
    }
    /// Sets the singular value threshold of the pseudo-inverse
    pub fn rcond(mut self, rcond: f64) -> Self {
        self.rcond = rcond;
        self
    }
}
impl FeedbackSolver for SensitivitySolver {
    fn solve(&self, input: &SolverInput<'_>) -> Result<SolverOutput> {
        let (measured_rows, measurements): (Vec<usize>, Vec<f64>) = self
            .rows
            .iter()
            .enumerate()
            .filter_map(|(row, (detector, mode))| {
                input
                    .wavefront
                    .get(detector)
                    .and_then(|coefs| coefs.iter().find(|(m, _)| m == mode))
                    .map(|(_, value)| (row, *value))
            })
            .unzip();
        if measured_rows.is_empty() {
            return Err(Error::Computation(
                "no measured wavefront error matches the sensitivity matrix".into(),
            ));
        }
        let active: Vec<usize> = input.mask.active_indices().collect();
        if active.is_empty() {
            return Err(Error::Configuration("no active degree of freedom".into()));
        }
        let s = na::DMatrix::<f64>::from_fn(measured_rows.len(), active.len(), |i, j| {
            self.sensitivity[(measured_rows[i], active[j])]
        });
        log::debug!(
            "solving {}x{} sensitivity system with gain {}",
            s.nrows(),
            s.ncols(),
            input.gain
        );
        let pinv = s
            .pseudo_inverse(self.rcond)
            .map_err(|e| Error::Computation(e.to_string()))?;
        let w = na::DVector::from_vec(measurements);
        let x = pinv * w * (-input.gain);

        let mut delta = vec![0f64; N_DOF];
        active
            .iter()
            .zip(x.iter())
            .for_each(|(&i, &value)| delta[i] = value);
        let stresses = self
            .stress_per_mode
            .iter()
            .zip(&delta[BENDING_OFFSET..])
            .map(|(k, d)| k * d)
            .collect();
        Ok(SolverOutput { delta, stresses })
    }
}
