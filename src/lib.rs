//! # Closed-loop active optics
//!
//! Turns wavefront errors measured by an external wavefront estimation pipeline into
//! safety-gated corrections of the mirror and hexapod subsystems, and keeps the
//! aggregated optical state consistent with what each subsystem accepted.
//!
//! The components, leaves first:
//!  - [WavefrontCollection]: per-detector wavefront error records of one correction cycle
//!  - [DofState]: the 50 degrees of freedom with an undo history
//!  - [PipelineRunner]: submission, monitoring and cancellation of pipeline jobs
//!  - [CorrectionComputer]: feedback solver invocation and safety/threshold gating
//!  - [CorrectionIssuer]: command transmission and accept/reject reconciliation
//!
//! The [Orchestrator] owns all of them and drives the [correction cycle](CycleState).

use std::sync::{Mutex, MutexGuard};

pub mod config;
pub mod control;
pub mod correction;
pub mod cycle;
pub mod dof;
pub mod issuer;
pub mod orchestrator;
pub mod pipeline;
pub mod subsystem;
pub mod telemetry;
pub mod wavefront;

#[doc(no_inline)]
pub use config::AosConfig;
#[doc(no_inline)]
pub use control::{FeedbackSolver, SensitivitySolver, SolverInput, SolverOutput};
#[doc(no_inline)]
pub use correction::{
    CommandStatus, Correction, CorrectionCommand, CorrectionComputer, SafetyEvent, StressScaleApproach,
};
#[doc(no_inline)]
pub use cycle::{CycleEvent, CycleState};
#[doc(no_inline)]
pub use dof::{DofMask, DofState, DofVector, N_DOF};
#[doc(no_inline)]
pub use issuer::{CorrectionIssuer, IssueReport, RejectReason, RejectionNotice};
#[doc(no_inline)]
pub use orchestrator::Orchestrator;
#[doc(no_inline)]
pub use pipeline::{JobHandle, JobId, JobStatus, PipelineConfig, PipelineRunner};
#[doc(no_inline)]
pub use subsystem::{Ack, SimulatedSubsystem, Subsystem, SubsystemChannel};
#[doc(no_inline)]
pub use telemetry::{LogSink, MemorySink, PickleSink, TelemetryEvent, TelemetrySink};
#[doc(no_inline)]
pub use wavefront::{
    uniform_wavefront, DetectorId, VisitId, WavefrontCollection, WavefrontErrorRecord,
    WavefrontSnapshot,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("wavefront estimation pipeline failed: {0}")]
    PipelineFailure(String),
    #[error("pipeline job #{0} was interrupted")]
    Interrupted(JobId),
    #[error("pipeline job #{job} did not complete within {timeout:?}")]
    PipelineTimeout {
        job: JobId,
        timeout: std::time::Duration,
    },
    #[error("a pipeline job is already running for visit {0}")]
    JobRunning(VisitId),
    #[error("feedback solver output rejected: {0}")]
    Computation(String),
    #[error("a correction cycle is already {0:?}")]
    Busy(CycleState),
    #[error("{event:?} is not a valid transition from {state:?}")]
    Transition { state: CycleState, event: CycleEvent },
    #[error("the correction cycle was reset while in flight")]
    CycleReset,
    #[error("DOF state error: {0}")]
    State(String),
    #[error("i/o failure")]
    Io(#[from] std::io::Error),
    #[error("bincode (de)serialization failed")]
    Decode(#[from] bincode::Error),
    #[error("pickle (de)serialization failed")]
    Pickle(#[from] serde_pickle::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::State("shared state lock poisoned".into()))
}
