//! # Optical subsystems
//!
//! The degrees of freedom are laid out as
//!  - M2 hexapod rigid body offsets: `[0,5)`
//!  - camera hexapod rigid body offsets: `[5,10)`
//!  - M1 bending modes: `[10,30)`
//!  - M2 bending modes: `[30,50)`

use std::{
    fmt,
    ops::Range,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::correction::CorrectionCommand;

/// Number of rigid body offsets of a hexapod
pub const N_HEXAPOD_DOF: usize = 5;
/// Number of *controlled* bending modes of a mirror
pub const N_BENDING_MODE: usize = 20;
/// Index of the first bending mode in the DOF vector
pub const BENDING_OFFSET: usize = 2 * N_HEXAPOD_DOF;

/// Subsystems receiving corrections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subsystem {
    M2Hexapod,
    CameraHexapod,
    M1,
    M2,
}
impl Subsystem {
    pub const ALL: [Subsystem; 4] = [
        Subsystem::M2Hexapod,
        Subsystem::CameraHexapod,
        Subsystem::M1,
        Subsystem::M2,
    ];
    /// Position of the subsystem in [Subsystem::ALL]
    pub fn index(&self) -> usize {
        match self {
            Subsystem::M2Hexapod => 0,
            Subsystem::CameraHexapod => 1,
            Subsystem::M1 => 2,
            Subsystem::M2 => 3,
        }
    }
    /// Indices of the subsystem degrees of freedom
    pub fn dof_range(&self) -> Range<usize> {
        match self {
            Subsystem::M2Hexapod => 0..N_HEXAPOD_DOF,
            Subsystem::CameraHexapod => N_HEXAPOD_DOF..BENDING_OFFSET,
            Subsystem::M1 => BENDING_OFFSET..BENDING_OFFSET + N_BENDING_MODE,
            Subsystem::M2 => BENDING_OFFSET + N_BENDING_MODE..BENDING_OFFSET + 2 * N_BENDING_MODE,
        }
    }
    pub fn n_dof(&self) -> usize {
        self.dof_range().len()
    }
    /// Returns `true` for the subsystems actuated with bending modes
    pub fn is_mirror(&self) -> bool {
        matches!(self, Subsystem::M1 | Subsystem::M2)
    }
    /// Returns the subsystem owning DOF `index`
    pub fn of_dof(index: usize) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|subsystem| subsystem.dof_range().contains(&index))
    }
}
impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subsystem::M2Hexapod => "M2 hexapod",
            Subsystem::CameraHexapod => "camera hexapod",
            Subsystem::M1 => "M1",
            Subsystem::M2 => "M2",
        };
        f.write_str(name)
    }
}

/// Subsystem acknowledgment of a correction command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Ack {
    Accepted,
    Rejected(String),
    TimedOut,
}

/// Command channel to one subsystem
#[async_trait]
pub trait SubsystemChannel: Send + Sync {
    /// Sends the command and resolves with the subsystem acknowledgment
    ///
    /// The channel may never resolve, the caller bounds the wait.
    async fn send(&self, command: &CorrectionCommand) -> Ack;
}

/// Acknowledgment policy of a [SimulatedSubsystem]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Accept,
    Reject,
    /// Never acknowledges
    Silent,
}

/// In-process subsystem
///
/// Records every command it receives; clones share the record.
#[derive(Debug, Clone)]
pub struct SimulatedSubsystem {
    behavior: Arc<Mutex<Behavior>>,
    latency: Duration,
    received: Arc<Mutex<Vec<CorrectionCommand>>>,
}
impl SimulatedSubsystem {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            latency: Duration::ZERO,
            received: Default::default(),
        }
    }
    pub fn accepting() -> Self {
        Self::new(Behavior::Accept)
    }
    pub fn rejecting() -> Self {
        Self::new(Behavior::Reject)
    }
    pub fn silent() -> Self {
        Self::new(Behavior::Silent)
    }
    /// Sets the delay before the acknowledgment
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
    /// Changes the acknowledgment policy of the subsystem and of its clones
    pub fn set_behavior(&self, behavior: Behavior) {
        if let Ok(mut current) = self.behavior.lock() {
            *current = behavior;
        }
    }
    /// Returns the commands received so far
    pub fn received(&self) -> Vec<CorrectionCommand> {
        self.received
            .lock()
            .map(|received| received.clone())
            .unwrap_or_default()
    }
}
#[async_trait]
impl SubsystemChannel for SimulatedSubsystem {
    async fn send(&self, command: &CorrectionCommand) -> Ack {
        if let Ok(mut received) = self.received.lock() {
            received.push(command.clone());
        }
        tokio::time::sleep(self.latency).await;
        let behavior = self
            .behavior
            .lock()
            .map(|behavior| *behavior)
            .unwrap_or(Behavior::Silent);
        match behavior {
            Behavior::Accept => Ack::Accepted,
            Behavior::Reject => Ack::Rejected(format!("{} refused the correction", command.subsystem)),
            Behavior::Silent => futures::future::pending().await,
        }
    }
}
