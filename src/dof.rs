//! # Degrees of freedom
//!
//! The aggregated optical state: 10 hexapod rigid body offsets followed by
//! 40 mirror bending mode amplitudes (see [Subsystem](crate::Subsystem) for the layout).

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut, Range},
};

use serde::{Deserialize, Serialize};

use crate::{subsystem::Subsystem, Error, Result};

/// Number of degrees of freedom
pub const N_DOF: usize = 50;

/// Degrees of freedom vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DofVector(Vec<f64>);
impl DofVector {
    pub fn zeros() -> Self {
        Self(vec![0f64; N_DOF])
    }
    /// Creates a vector with all entries set to `value`
    pub fn repeat(value: f64) -> Self {
        Self(vec![value; N_DOF])
    }
    pub fn from_vec(values: Vec<f64>) -> Result<Self> {
        if values.len() != N_DOF {
            return Err(Error::Configuration(format!(
                "expected {N_DOF} degrees of freedom, found {}",
                values.len()
            )));
        }
        Ok(Self(values))
    }
    /// Creates a vector that is zero everywhere but in `range`
    pub fn scatter(range: Range<usize>, values: &[f64]) -> Self {
        let mut dof = Self::zeros();
        dof.0[range]
            .iter_mut()
            .zip(values)
            .for_each(|(d, v)| *d = *v);
        dof
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
    pub fn into_vec(self) -> Vec<f64> {
        self.0
    }
}
impl Default for DofVector {
    fn default() -> Self {
        Self::zeros()
    }
}
impl Deref for DofVector {
    type Target = [f64];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl DerefMut for DofVector {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
impl From<[f64; N_DOF]> for DofVector {
    fn from(values: [f64; N_DOF]) -> Self {
        Self(values.to_vec())
    }
}

/// Active degrees of freedom
///
/// Only the active entries of a [DofVector] may be modified by a correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DofMask(Vec<bool>);
impl DofMask {
    /// All degrees of freedom active
    pub fn all() -> Self {
        Self(vec![true; N_DOF])
    }
    pub fn none() -> Self {
        Self(vec![false; N_DOF])
    }
    pub fn from_vec(mask: Vec<bool>) -> Result<Self> {
        if mask.len() != N_DOF {
            return Err(Error::Configuration(format!(
                "expected a mask of {N_DOF} entries, found {}",
                mask.len()
            )));
        }
        Ok(Self(mask))
    }
    /// Creates a mask with only the given indices active
    pub fn from_indices<I: IntoIterator<Item = usize>>(indices: I) -> Result<Self> {
        let mut mask = Self::none();
        for i in indices {
            *mask.0.get_mut(i).ok_or_else(|| {
                Error::Configuration(format!("DOF index {i} is out of range"))
            })? = true;
        }
        Ok(mask)
    }
    /// Deactivates DOF `index`
    pub fn exclude(mut self, index: usize) -> Self {
        if let Some(active) = self.0.get_mut(index) {
            *active = false;
        }
        self
    }
    /// Returns the mask of the DOF active in both masks
    pub fn intersect(&self, other: &DofMask) -> DofMask {
        Self(
            self.0
                .iter()
                .enumerate()
                .map(|(i, active)| *active && other.is_active(i))
                .collect(),
        )
    }
    pub fn is_active(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }
    pub fn active_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, active)| active.then_some(i))
    }
    pub fn n_active(&self) -> usize {
        self.0.iter().filter(|active| **active).count()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
impl Default for DofMask {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    subsystem: Option<Subsystem>,
    previous: DofVector,
}

/// Aggregated degrees of freedom with an undo history
///
/// Every [apply](DofState::apply) pushes the vector it modifies into the history.
/// The history entries are then either [committed](DofState::commit) or rolled back.
#[derive(Debug, Clone)]
pub struct DofState {
    current: DofVector,
    initial: DofVector,
    mask: DofMask,
    history: VecDeque<Snapshot>,
    generation: u64,
}
impl DofState {
    /// Creates the state seeded with the `initial` vector
    pub fn new(initial: DofVector, mask: DofMask) -> Self {
        Self {
            current: initial.clone(),
            initial,
            mask,
            history: VecDeque::new(),
            generation: 0,
        }
    }
    pub fn current(&self) -> &DofVector {
        &self.current
    }
    pub fn initial(&self) -> &DofVector {
        &self.initial
    }
    pub fn mask(&self) -> &DofMask {
        &self.mask
    }
    /// Number of uncommitted history entries
    pub fn pending(&self) -> usize {
        self.history.len()
    }
    /// Incremented by every [reset](DofState::reset)
    pub fn generation(&self) -> u64 {
        self.generation
    }
    /// Adds `delta` to the active entries of the vector
    pub fn apply(&mut self, delta: &DofVector) -> &DofVector {
        self.push_and_add(None, 0..N_DOF, delta)
    }
    /// Adds the `subsystem` part of `delta` to the active entries of the vector
    ///
    /// The history entry is tagged with `subsystem` so it can be rolled back on its own
    /// with [rollback_subsystem](DofState::rollback_subsystem).
    pub fn apply_for(&mut self, subsystem: Subsystem, delta: &DofVector) -> &DofVector {
        self.push_and_add(Some(subsystem), subsystem.dof_range(), delta)
    }
    fn push_and_add(
        &mut self,
        subsystem: Option<Subsystem>,
        range: Range<usize>,
        delta: &DofVector,
    ) -> &DofVector {
        self.history.push_back(Snapshot {
            subsystem,
            previous: self.current.clone(),
        });
        for i in range {
            if self.mask.is_active(i) {
                self.current[i] += delta[i];
            }
        }
        &self.current
    }
    /// Restores the vector as it was before the most recent [apply](DofState::apply)
    pub fn rollback(&mut self) -> Result<()> {
        let snapshot = self
            .history
            .pop_back()
            .ok_or_else(|| Error::State("nothing to roll back".into()))?;
        self.current = snapshot.previous;
        Ok(())
    }
    /// Rolls back the most recent contribution of `subsystem` and returns it
    ///
    /// Only the entries of the subsystem are restored, the contributions of the
    /// other subsystems are left untouched.
    pub fn rollback_subsystem(&mut self, subsystem: Subsystem) -> Result<DofVector> {
        let position = self
            .history
            .iter()
            .rposition(|snapshot| snapshot.subsystem == Some(subsystem))
            .ok_or_else(|| Error::State(format!("no pending contribution from {subsystem}")))?;
        let snapshot = self
            .history
            .remove(position)
            .ok_or_else(|| Error::State("history entry vanished".into()))?;
        let mut rejected = DofVector::zeros();
        for i in subsystem.dof_range() {
            rejected[i] = self.current[i] - snapshot.previous[i];
            self.current[i] = snapshot.previous[i];
        }
        Ok(rejected)
    }
    /// Permanently accepts the oldest pending history entry
    pub fn commit(&mut self) -> Result<()> {
        self.history
            .pop_front()
            .map(|_| ())
            .ok_or_else(|| Error::State("nothing to commit".into()))
    }
    /// Restores the initial vector and clears the history
    pub fn reset(&mut self) {
        self.current = self.initial.clone();
        self.history.clear();
        self.generation += 1;
    }
}
