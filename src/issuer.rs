//! # Correction issuer
//!
//! Sends the correction commands to the subsystems and reconciles the
//! [DofState] with their acknowledgments.
//! All the commands of a correction are applied to the DOF state tagged with their
//! subsystem before being sent; then, once every subsystem has answered, the
//! rejected (or unacknowledged) contributions are rolled back and the accepted ones committed.

use std::{collections::BTreeMap, sync::Mutex, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    correction::{CommandStatus, CorrectionCommand},
    dof::DofState,
    subsystem::{Ack, Subsystem, SubsystemChannel},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The subsystem refused the command
    Rejected,
    /// The subsystem did not acknowledge the command in time
    AckTimeout,
}

/// Correction rolled back after a rejection
///
/// `delta` is exactly the contribution that was removed from the DOF state,
/// the subsystem is resynchronized by applying its opposite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionNotice {
    pub subsystem: Subsystem,
    pub reason: RejectReason,
    pub message: String,
    pub delta: Vec<f64>,
}

/// Outcome of [CorrectionIssuer::issue]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueReport {
    pub accepted: Vec<Subsystem>,
    pub rejections: Vec<RejectionNotice>,
}
impl IssueReport {
    /// Returns `true` if no command was rejected
    pub fn is_committed(&self) -> bool {
        self.rejections.is_empty()
    }
}

pub struct CorrectionIssuer {
    channels: BTreeMap<Subsystem, Box<dyn SubsystemChannel>>,
    ack_timeout: Duration,
    ack_retries: usize,
}
impl CorrectionIssuer {
    /// Creates an issuer waiting at most `ack_timeout` for each acknowledgment
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            channels: BTreeMap::new(),
            ack_timeout,
            ack_retries: 0,
        }
    }
    /// Sets the number of times an unacknowledged command is resent
    pub fn retries(mut self, ack_retries: usize) -> Self {
        self.ack_retries = ack_retries;
        self
    }
    /// Sets the command channel of `subsystem`
    pub fn channel<C: SubsystemChannel + 'static>(mut self, subsystem: Subsystem, channel: C) -> Self {
        self.channels.insert(subsystem, Box::new(channel));
        self
    }
    async fn acknowledge(&self, channel: &dyn SubsystemChannel, command: &CorrectionCommand) -> Ack {
        for attempt in 1..=self.ack_retries + 1 {
            match tokio::time::timeout(self.ack_timeout, channel.send(command)).await {
                Ok(Ack::TimedOut) | Err(_) => log::warn!(
                    "{} did not acknowledge within {:?} (attempt {attempt}/{})",
                    command.subsystem,
                    self.ack_timeout,
                    self.ack_retries + 1
                ),
                Ok(ack) => return ack,
            }
        }
        Ack::TimedOut
    }
    /// Issues the commands and updates their status
    ///
    /// Only [pending](CommandStatus::Pending) commands may be issued, anything else
    /// fails before any of them is applied or sent.
    /// The accepted contributions are committed to `dof`, the others are rolled back.
    /// If the returned future is dropped before every subsystem has answered,
    /// all the contributions are rolled back.
    pub async fn issue(
        &self,
        commands: &mut [CorrectionCommand],
        dof: &Mutex<DofState>,
    ) -> Result<IssueReport> {
        let mut channels = vec![];
        for command in commands.iter() {
            if command.status != CommandStatus::Pending {
                return Err(Error::State(format!(
                    "{} command is {:?}, only pending commands are issued",
                    command.subsystem, command.status
                )));
            }
            let channel = self.channels.get(&command.subsystem).ok_or_else(|| {
                Error::Configuration(format!("no command channel to {}", command.subsystem))
            })?;
            channels.push(&**channel);
        }
        if commands.is_empty() {
            return Ok(Default::default());
        }

        let generation = {
            let mut dof = crate::lock(dof)?;
            for command in commands.iter() {
                dof.apply_for(command.subsystem, &command.dof_delta());
            }
            dof.generation()
        };
        let in_flight = InFlight {
            dof,
            subsystems: commands.iter().map(|c| c.subsystem).collect(),
            generation,
        };
        let acks = futures::future::join_all(
            commands
                .iter()
                .zip(&channels)
                .map(|(command, channel)| self.acknowledge(*channel, command)),
        )
        .await;
        in_flight.disarm();

        let mut dof = crate::lock(dof)?;
        if dof.generation() != generation {
            log::warn!("DOF state reset while commands were in flight");
            return Err(Error::CycleReset);
        }
        let mut report = IssueReport::default();
        let mut accepted = vec![];
        for (i, ack) in acks.into_iter().enumerate() {
            let command = &mut commands[i];
            let (status, reason, message) = match ack {
                Ack::Accepted => {
                    accepted.push(i);
                    continue;
                }
                Ack::Rejected(message) => (CommandStatus::Rejected, RejectReason::Rejected, message),
                Ack::TimedOut => (
                    CommandStatus::TimedOut,
                    RejectReason::AckTimeout,
                    format!("no acknowledgment within {:?}", self.ack_timeout),
                ),
            };
            let subsystem = command.subsystem;
            let rejected = dof.rollback_subsystem(subsystem)?;
            command.status = status;
            log::warn!("{subsystem} correction rolled back: {message}");
            report.rejections.push(RejectionNotice {
                subsystem,
                reason,
                message,
                delta: rejected[subsystem.dof_range()].to_vec(),
            });
        }
        for i in accepted {
            let command = &mut commands[i];
            dof.commit()?;
            command.status = CommandStatus::Accepted;
            log::info!(
                "{} correction committed (magnitude: {:.3e})",
                command.subsystem,
                command.magnitude()
            );
            report.accepted.push(command.subsystem);
        }
        Ok(report)
    }
}

/// Rolls back the contributions of the commands still in flight when dropped
struct InFlight<'a> {
    dof: &'a Mutex<DofState>,
    subsystems: Vec<Subsystem>,
    generation: u64,
}
impl InFlight<'_> {
    /// Every subsystem has answered
    fn disarm(mut self) {
        self.subsystems.clear();
    }
}
impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.subsystems.is_empty() {
            return;
        }
        let Ok(mut dof) = self.dof.lock() else {
            return;
        };
        // a reset already discarded the contributions
        if dof.generation() != self.generation {
            return;
        }
        for subsystem in self.subsystems.drain(..).rev() {
            if let Err(e) = dof.rollback_subsystem(subsystem) {
                log::error!("failed to roll back the {subsystem} correction: {e}");
            }
        }
        log::warn!("correction dropped before its acknowledgments, rolled back");
    }
}
