//! # Closed-loop orchestrator
//!
//! Owns the correction components and maps the external commands onto
//! [cycle transitions](CycleState::next):
//!
//! | command | transitions |
//! |---|---|
//! | [run_wep](Orchestrator::run_wep), [add_records](Orchestrator::add_records) | `Collect`, `Discard` if the submission failed and nothing was collected |
//! | [run_cycle](Orchestrator::run_cycle) | `Compute`, `Issue`, `Commit`/`PartialReject`, `Finish`; `Abort` on failure or if dropped |
//! | [reset](Orchestrator::reset) | `Reset` |
//!
//! [offset_dof](Orchestrator::offset_dof), [reject_correction](Orchestrator::reject_correction)
//! and [add_aberration](Orchestrator::add_aberration) issue commands outside of the
//! correction cycle and leave its state untouched.
//! Only one correction is computed or issued at a time, whatever command started it.
//!
//! The wavefront errors of a cycle are cleared once, when the cycle ends,
//! whatever its outcome: a new cycle always starts from fresh measurements.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use crate::{
    config::AosConfig,
    control::FeedbackSolver,
    correction::{CommandStatus, Correction, CorrectionCommand, CorrectionComputer},
    cycle::{CycleEvent, CycleState},
    dof::{DofMask, DofState, DofVector},
    issuer::{CorrectionIssuer, IssueReport},
    lock,
    pipeline::{PipelineConfig, PipelineRunner},
    subsystem::Subsystem,
    telemetry::{TelemetryEvent, TelemetrySink},
    wavefront::{WavefrontCollection, WavefrontErrorRecord, WavefrontSnapshot},
    Error, Result,
};

pub struct Orchestrator {
    config: AosConfig,
    state: Mutex<CycleState>,
    aggregator: Mutex<WavefrontCollection>,
    dof: Mutex<DofState>,
    runner: PipelineRunner,
    computer: CorrectionComputer,
    issuer: CorrectionIssuer,
    sink: Arc<dyn TelemetrySink>,
    // set until the future computing or issuing a correction ends, a reset does not clear it
    in_flight: Mutex<bool>,
    last_correction: Mutex<Option<DofVector>>,
}
impl Orchestrator {
    pub fn new<S: FeedbackSolver + 'static>(
        config: AosConfig,
        solver: S,
        issuer: CorrectionIssuer,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Default::default(),
            aggregator: Default::default(),
            dof: Mutex::new(DofState::new(
                config.initial_state.clone(),
                config.active_mask.clone(),
            )),
            runner: PipelineRunner::new(config.pipeline_timeout),
            computer: CorrectionComputer::new(solver, &config),
            issuer,
            sink,
            in_flight: Default::default(),
            last_correction: Default::default(),
            config,
        })
    }
    pub fn config(&self) -> &AosConfig {
        &self.config
    }
    pub fn runner(&self) -> &PipelineRunner {
        &self.runner
    }
    pub fn state(&self) -> Result<CycleState> {
        Ok(*lock(&self.state)?)
    }
    /// Current DOF vector
    pub fn dof(&self) -> Result<DofVector> {
        Ok(lock(&self.dof)?.current().clone())
    }
    /// Number of wavefront error records collected for the next correction
    pub fn pending_records(&self) -> Result<usize> {
        Ok(lock(&self.aggregator)?.len())
    }
    /// Averaged wavefront errors collected for the next correction
    pub fn wavefront(&self) -> Result<WavefrontSnapshot> {
        Ok(lock(&self.aggregator)?.snapshot())
    }
    /// Accepted part of the most recent correction or offset, if it was not rejected since
    pub fn last_correction(&self) -> Result<Option<DofVector>> {
        Ok(lock(&self.last_correction)?.clone())
    }

    fn transition(&self, event: CycleEvent) -> Result<CycleState> {
        let mut state = lock(&self.state)?;
        let next = state.next(event)?;
        log::debug!("cycle {:?} -> {next:?} on {event:?}", *state);
        *state = next;
        Ok(next)
    }
    fn end_cycle(&self, event: CycleEvent) -> Result<()> {
        lock(&self.aggregator)?.clear();
        self.transition(event)?;
        Ok(())
    }
    /// Reserves the computation and the issue of a correction
    ///
    /// With `cycle`, the correction cycle moves to `Computing`.
    fn lease(&self, cycle: bool) -> Result<IssueLease<'_>> {
        let mut in_flight = lock(&self.in_flight)?;
        if *in_flight {
            return Err(Error::Busy(CycleState::Issuing));
        }
        let generation = lock(&self.dof)?.generation();
        if cycle {
            self.transition(CycleEvent::Compute)?;
        } else {
            let state = self.state()?;
            if state.is_active() {
                return Err(Error::Busy(state));
            }
        }
        *in_flight = true;
        Ok(IssueLease {
            orchestrator: self,
            generation,
            cycle,
        })
    }

    /// Runs the wavefront estimation pipeline and collects its output
    ///
    /// Returns the number of records added to the current cycle.
    pub async fn run_wep(&self, config: &PipelineConfig) -> Result<usize> {
        self.transition(CycleEvent::Collect)?;
        let generation = lock(&self.dof)?.generation();
        let collected = async {
            let handle = self.runner.submit(config)?;
            let collected = self.runner.wait(&handle, self.config.poll_interval).await;
            self.sink.publish(TelemetryEvent::WepDuration {
                job: handle.id(),
                seconds: handle.elapsed().as_secs_f64(),
            });
            collected
        }
        .await;
        if lock(&self.dof)?.generation() != generation {
            return Err(Error::CycleReset);
        }
        let collection = match collected {
            Ok(collection) => collection,
            Err(e) => {
                if self.state()? == CycleState::Collecting && lock(&self.aggregator)?.is_empty() {
                    self.transition(CycleEvent::Discard)?;
                }
                return Err(e);
            }
        };
        self.collect(collection)
    }
    /// Adds wavefront error records to the current cycle
    pub fn add_records<I>(&self, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = WavefrontErrorRecord>,
    {
        let mut collection = WavefrontCollection::new();
        collection.add(records);
        self.collect(collection)
    }
    fn collect(&self, collection: WavefrontCollection) -> Result<usize> {
        // the cycle may have moved on while the pipeline was running
        self.transition(CycleEvent::Collect)?;
        for detector in collection.detectors() {
            if let Some(coefficients) = collection.average(detector) {
                self.sink.publish(TelemetryEvent::WavefrontError {
                    detector,
                    coefficients,
                });
            }
        }
        for record in collection.rejected() {
            self.sink.publish(TelemetryEvent::RejectedWavefrontError {
                detector: record.detector,
                coefficients: record.coefficients.clone(),
            });
        }
        let n = collection.len();
        let mut aggregator = lock(&self.aggregator)?;
        aggregator.merge(collection);
        log::info!(
            "{n} wavefront error record(s) collected, {} pending",
            aggregator.len()
        );
        Ok(n)
    }

    /// Runs the feedback solver and publishes its telemetry
    fn compute<F>(&self, compute: F) -> Result<Correction>
    where
        F: FnOnce(&DofState) -> Result<Correction>,
    {
        let now = Instant::now();
        let computed = lock(&self.dof).and_then(|dof| compute(&dof));
        self.sink.publish(TelemetryEvent::OfcDuration {
            seconds: now.elapsed().as_secs_f64(),
        });
        let correction = computed.map_err(|e| {
            log::error!("correction computation failed: {e}");
            e
        })?;
        for event in &correction.safety {
            self.sink
                .publish(TelemetryEvent::SafetyLimitExceeded(event.clone()));
        }
        for subsystem in [Subsystem::M1, Subsystem::M2] {
            if let Some(stresses) = correction.mirror_stresses(subsystem) {
                self.sink.publish(TelemetryEvent::MirrorStresses {
                    subsystem,
                    stresses: stresses.to_vec(),
                });
            }
        }
        Ok(correction)
    }
    /// Issues the commands that are not suppressed and publishes the outcome
    ///
    /// Returns the issued commands with their final status.
    async fn issue(
        &self,
        commands: Vec<CorrectionCommand>,
    ) -> Result<(IssueReport, Vec<CorrectionCommand>)> {
        let (mut issued, suppressed): (Vec<_>, Vec<_>) =
            commands.into_iter().partition(|c| !c.is_suppressed());
        if !suppressed.is_empty() {
            log::debug!(
                "{:?} correction(s) suppressed",
                suppressed.iter().map(|c| c.subsystem).collect::<Vec<_>>()
            );
        }
        let report = match self.issuer.issue(&mut issued, &self.dof).await {
            Ok(report) => report,
            Err(Error::CycleReset) => return Err(Error::CycleReset),
            Err(e) => {
                log::error!("correction issue failed: {e}");
                return Err(e);
            }
        };
        for command in issued
            .iter()
            .filter(|c| c.status == CommandStatus::Accepted)
        {
            self.sink.publish(TelemetryEvent::CorrectionIssued {
                subsystem: command.subsystem,
                delta: command.delta.clone(),
            });
        }
        for notice in &report.rejections {
            self.sink.publish(TelemetryEvent::Rejection(notice.clone()));
        }
        if !report.is_committed() {
            log::warn!(
                "correction partially rejected by {:?}",
                report
                    .rejections
                    .iter()
                    .map(|notice| notice.subsystem)
                    .collect::<Vec<_>>()
            );
        }
        self.sink
            .publish(TelemetryEvent::DegreeOfFreedom(self.dof()?.into_vec()));
        Ok((report, issued))
    }
    /// Remembers the accepted part of the issued commands as the most recent correction
    fn record_correction(&self, commands: &[CorrectionCommand]) -> Result<()> {
        let accepted = accepted_delta(commands);
        if accepted.iter().any(|x| *x != 0f64) {
            *lock(&self.last_correction)? = Some(accepted);
        }
        Ok(())
    }

    /// Computes and issues a correction from the collected wavefront errors
    ///
    /// `gain` overrides the configured gain.
    /// Fails with [Error::Busy] if a correction is already being computed or issued.
    /// If the returned future is dropped before completion, the correction is rolled back
    /// and the cycle is aborted.
    pub async fn run_cycle(&self, gain: Option<f64>) -> Result<IssueReport> {
        let lease = self.lease(true)?;
        let gain = gain.unwrap_or(self.config.gain);
        let snapshot = lock(&self.aggregator)?.snapshot();
        let correction = self.compute(|dof| self.computer.compute(&snapshot, dof, gain))?;

        self.transition(CycleEvent::Issue)?;
        let (report, commands) = self.issue(correction.commands).await?;
        self.record_correction(&commands)?;
        if report.is_committed() {
            self.transition(CycleEvent::Commit)?;
        } else {
            self.transition(CycleEvent::PartialReject)?;
        }
        self.end_cycle(CycleEvent::Finish)?;
        lease.complete();
        Ok(report)
    }

    /// Adds a user offset to the DOF vector and sends it to the subsystems
    ///
    /// Each subsystem part of the offset is committed or rolled back on its own acknowledgment.
    /// The offset becomes the most recent correction.
    pub async fn offset_dof(&self, offset: &DofVector) -> Result<IssueReport> {
        if offset.iter().any(|x| !x.is_finite()) {
            return Err(Error::Configuration("DOF offset must be finite".into()));
        }
        let _lease = self.lease(false)?;
        let offset = {
            let dof = lock(&self.dof)?;
            let mut masked = DofVector::zeros();
            for i in dof.mask().active_indices() {
                masked[i] = offset[i];
            }
            masked
        };
        let (report, commands) = self.issue(CorrectionCommand::split(&offset)).await?;
        self.record_correction(&commands)?;
        Ok(report)
    }
    /// Backs out the most recent correction
    ///
    /// The opposite of the correction is sent to the subsystems that accepted it.
    /// The parts that a subsystem refuses to back out remain the most recent correction.
    pub async fn reject_correction(&self) -> Result<IssueReport> {
        let _lease = self.lease(false)?;
        let last = lock(&self.last_correction)?
            .clone()
            .ok_or_else(|| Error::State("no correction to reject".into()))?;
        let backout = DofVector::from_vec(last.iter().map(|x| -x).collect())?;
        let (report, commands) = self.issue(CorrectionCommand::split(&backout)).await?;

        let mut remaining = last;
        for command in commands
            .iter()
            .filter(|c| c.status == CommandStatus::Accepted)
        {
            command
                .subsystem
                .dof_range()
                .for_each(|i| remaining[i] = 0f64);
        }
        let rejected: Vec<f64> = accepted_delta(&commands).iter().map(|x| -x).collect();
        log::info!("most recent correction backed out");
        self.sink
            .publish(TelemetryEvent::RejectedDegreeOfFreedom(rejected));
        *lock(&self.last_correction)? = remaining.iter().any(|x| *x != 0f64).then_some(remaining);
        Ok(report)
    }
    /// Computes and issues the correction of user supplied wavefront errors
    ///
    /// `gain` temporarily overrides the configured gain and `mask` narrows the active DOF.
    /// The collected wavefront errors and the correction cycle are left untouched.
    pub async fn add_aberration(
        &self,
        wavefront: &WavefrontSnapshot,
        gain: Option<f64>,
        mask: Option<&DofMask>,
    ) -> Result<IssueReport> {
        let _lease = self.lease(false)?;
        let gain = gain.unwrap_or(self.config.gain);
        let correction = self.compute(|dof| match mask {
            Some(mask) => self.computer.compute_masked(wavefront, dof, mask, gain),
            None => self.computer.compute(wavefront, dof, gain),
        })?;
        let (report, commands) = self.issue(correction.commands).await?;
        self.record_correction(&commands)?;
        Ok(report)
    }

    /// Cancels the running pipeline jobs, discards the collected wavefront errors
    /// and restores the initial DOF vector
    ///
    /// A correction in flight ends with [Error::CycleReset], no other correction
    /// is computed or issued before it does.
    pub fn reset(&self) -> Result<()> {
        let cancelled = self.runner.cancel_all()?;
        lock(&self.aggregator)?.clear();
        *lock(&self.last_correction)? = None;
        let current = {
            let mut dof = lock(&self.dof)?;
            dof.reset();
            dof.current().clone()
        };
        self.transition(CycleEvent::Reset)?;
        log::info!("closed loop reset ({cancelled} pipeline job(s) cancelled)");
        self.sink
            .publish(TelemetryEvent::DegreeOfFreedom(current.into_vec()));
        Ok(())
    }
}

fn accepted_delta(commands: &[CorrectionCommand]) -> DofVector {
    let mut delta = DofVector::zeros();
    for command in commands
        .iter()
        .filter(|c| c.status == CommandStatus::Accepted)
    {
        for (i, d) in command.subsystem.dof_range().zip(&command.delta) {
            delta[i] += d;
        }
    }
    delta
}

/// Exclusive right to compute and issue a correction
///
/// Dropped before [complete](IssueLease::complete), it aborts the correction cycle it started,
/// unless a reset already ended it.
struct IssueLease<'a> {
    orchestrator: &'a Orchestrator,
    generation: u64,
    cycle: bool,
}
impl IssueLease<'_> {
    fn complete(mut self) {
        self.cycle = false;
    }
}
impl Drop for IssueLease<'_> {
    fn drop(&mut self) {
        let orchestrator = self.orchestrator;
        if self.cycle {
            let reset = orchestrator
                .dof
                .lock()
                .map(|dof| dof.generation() != self.generation)
                .unwrap_or(true);
            if !reset {
                if let Ok(mut aggregator) = orchestrator.aggregator.lock() {
                    aggregator.clear();
                }
                if let Ok(mut state) = orchestrator.state.lock() {
                    if let Ok(next) = state.next(CycleEvent::Abort) {
                        log::warn!("correction cycle aborted while {:?}", *state);
                        *state = next;
                    }
                }
            }
        }
        if let Ok(mut in_flight) = orchestrator.in_flight.lock() {
            *in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        control::{SolverInput, SolverOutput, N_STRESS},
        dof::N_DOF,
        issuer::RejectReason,
        subsystem::SimulatedSubsystem,
        telemetry::MemorySink,
        wavefront::{uniform_wavefront, VisitId},
    };
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<WavefrontSnapshot>>>;

    /// Proposes minus the mean coefficient on every DOF and records its inputs
    fn solver(seen: Seen) -> impl FeedbackSolver {
        move |input: &SolverInput<'_>| -> Result<SolverOutput> {
            seen.lock().unwrap().push(input.wavefront.clone());
            let (sum, n) = input
                .wavefront
                .values()
                .flatten()
                .fold((0f64, 0usize), |(s, n), (_, c)| (s + c, n + 1));
            Ok(SolverOutput {
                delta: vec![-input.gain * sum / n as f64; N_DOF],
                stresses: vec![0.0; N_STRESS],
            })
        }
    }

    fn records(value: f64) -> Vec<WavefrontErrorRecord> {
        let visit = VisitId::new("test", 1);
        vec![
            WavefrontErrorRecord::dense(1, visit.clone(), 4, &[value, value]),
            WavefrontErrorRecord::dense(2, visit, 4, &[value]),
        ]
    }

    fn issuer(m2: SimulatedSubsystem) -> CorrectionIssuer {
        CorrectionIssuer::new(Duration::from_secs(1))
            .channel(Subsystem::M2Hexapod, SimulatedSubsystem::accepting())
            .channel(Subsystem::CameraHexapod, SimulatedSubsystem::accepting())
            .channel(Subsystem::M1, SimulatedSubsystem::accepting())
            .channel(Subsystem::M2, m2)
    }

    fn build(config: AosConfig, issuer: CorrectionIssuer) -> (Orchestrator, Arc<MemorySink>, Seen) {
        let sink = Arc::new(MemorySink::new());
        let seen = Arc::new(Mutex::new(vec![]));
        let orchestrator =
            Orchestrator::new(config, solver(seen.clone()), issuer, sink.clone()).unwrap();
        (orchestrator, sink, seen)
    }

    /// Every subsystem accepts after `latency`, well within the acknowledgment timeout
    fn slow(latency: Duration) -> (Orchestrator, Arc<MemorySink>, Seen) {
        let issuer = Subsystem::ALL.into_iter().fold(
            CorrectionIssuer::new(Duration::from_secs(30)),
            |issuer, subsystem| {
                issuer.channel(subsystem, SimulatedSubsystem::accepting().latency(latency))
            },
        );
        let config = AosConfig {
            gain: 1.0,
            ..Default::default()
        };
        build(config, issuer)
    }

    fn orchestrator(m2: SimulatedSubsystem) -> (Orchestrator, Arc<MemorySink>, Seen) {
        let config = AosConfig {
            gain: 1.0,
            ..Default::default()
        };
        build(config, issuer(m2))
    }

    #[tokio::test]
    async fn test_committed_cycle() {
        let (orchestrator, sink, _) = orchestrator(SimulatedSubsystem::accepting());
        assert_eq!(orchestrator.add_records(records(0.5)).unwrap(), 2);
        assert_eq!(orchestrator.state().unwrap(), CycleState::Collecting);
        let report = orchestrator.run_cycle(None).await.unwrap();
        assert!(report.is_committed());
        assert_eq!(report.accepted, Subsystem::ALL.to_vec());
        assert_eq!(orchestrator.state().unwrap(), CycleState::Idle);
        assert_eq!(orchestrator.pending_records().unwrap(), 0);
        assert_eq!(orchestrator.dof().unwrap(), DofVector::repeat(-0.5));
        assert_eq!(
            orchestrator.last_correction().unwrap(),
            Some(DofVector::repeat(-0.5))
        );
        let events = sink.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, TelemetryEvent::OfcDuration { .. })));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, TelemetryEvent::CorrectionIssued { .. }))
                .count(),
            4
        );
        assert!(matches!(
            events.last(),
            Some(TelemetryEvent::DegreeOfFreedom(_))
        ));
    }

    #[tokio::test]
    async fn test_partially_rejected_cycle() {
        let (orchestrator, sink, _) = orchestrator(SimulatedSubsystem::rejecting());
        orchestrator.add_records(records(0.5)).unwrap();
        let report = orchestrator.run_cycle(None).await.unwrap();
        assert_eq!(report.rejections.len(), 1);
        assert_eq!(report.rejections[0].reason, RejectReason::Rejected);
        assert_eq!(report.rejections[0].delta, vec![-0.5; 20]);
        let dof = orchestrator.dof().unwrap();
        for i in 0..N_DOF {
            let expected = if Subsystem::M2.dof_range().contains(&i) {
                0.0
            } else {
                -0.5
            };
            assert_eq!(dof[i], expected);
        }
        assert_eq!(orchestrator.pending_records().unwrap(), 0);
        assert_eq!(orchestrator.state().unwrap(), CycleState::Idle);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, TelemetryEvent::Rejection(n) if n.subsystem == Subsystem::M2)));
    }

    #[tokio::test]
    async fn test_suppressed_commands_are_not_issued() {
        let m1 = SimulatedSubsystem::accepting();
        let config = AosConfig {
            gain: 1.0,
            min_thresholds: vec![1.0, 1.0, 0.0, 0.0],
            ..Default::default()
        };
        // no hexapod channel: issuing a hexapod command fails
        let issuer = CorrectionIssuer::new(Duration::from_secs(1))
            .channel(Subsystem::M1, m1.clone())
            .channel(Subsystem::M2, SimulatedSubsystem::accepting());
        let (orchestrator, sink, _) = build(config, issuer);
        orchestrator.add_records(records(0.5)).unwrap();
        let report = orchestrator.run_cycle(None).await.unwrap();
        assert_eq!(report.accepted, vec![Subsystem::M1, Subsystem::M2]);
        assert_eq!(m1.received().len(), 1);
        let dof = orchestrator.dof().unwrap();
        assert!((0..10).all(|i| dof[i] == 0.0));
        assert!(!sink.events().iter().any(|e| matches!(
            e,
            TelemetryEvent::CorrectionIssued {
                subsystem: Subsystem::M2Hexapod | Subsystem::CameraHexapod,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_busy_cycle_leaves_dof_unchanged() {
        let (orchestrator, _, _) =
            orchestrator(SimulatedSubsystem::accepting().latency(Duration::from_millis(50)));
        orchestrator.add_records(records(0.5)).unwrap();
        let (first, (second, before, after), third) = tokio::join!(
            orchestrator.run_cycle(None),
            async {
                tokio::task::yield_now().await;
                let before = orchestrator.dof().unwrap();
                let result = orchestrator.run_cycle(None).await;
                (result, before, orchestrator.dof().unwrap())
            },
            async {
                tokio::task::yield_now().await;
                orchestrator.add_records(records(1.0))
            }
        );
        assert!(matches!(second, Err(Error::Busy(CycleState::Issuing))));
        assert!(matches!(third, Err(Error::Busy(_))));
        assert_eq!(before, after);
        assert!(first.unwrap().is_committed());
        assert_eq!(orchestrator.dof().unwrap(), DofVector::repeat(-0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_cycle_is_aborted() {
        let (orchestrator, _, _) = slow(Duration::from_secs(10));
        orchestrator.add_records(records(0.5)).unwrap();
        let cycle =
            tokio::time::timeout(Duration::from_millis(100), orchestrator.run_cycle(None)).await;
        assert!(cycle.is_err());
        assert_eq!(orchestrator.state().unwrap(), CycleState::Idle);
        assert_eq!(orchestrator.dof().unwrap(), DofVector::zeros());
        assert_eq!(orchestrator.pending_records().unwrap(), 0);
        assert_eq!(orchestrator.last_correction().unwrap(), None);

        let offset = DofVector::scatter(Subsystem::M1.dof_range(), &[0.25; 20]);
        assert!(orchestrator.offset_dof(&offset).await.unwrap().is_committed());
        orchestrator.add_records(records(0.5)).unwrap();
        assert!(orchestrator.run_cycle(None).await.unwrap().is_committed());
    }

    #[tokio::test]
    async fn test_stale_wavefront_errors_do_not_leak() {
        let (orchestrator, _, seen) = orchestrator(SimulatedSubsystem::rejecting());
        orchestrator.add_records(records(0.5)).unwrap();
        orchestrator.run_cycle(None).await.unwrap();
        orchestrator
            .add_records(vec![WavefrontErrorRecord::dense(
                3,
                VisitId::new("test", 2),
                4,
                &[1.0],
            )])
            .unwrap();
        orchestrator.run_cycle(None).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].keys().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn test_computation_error_leaves_dof_unchanged() {
        let sink = Arc::new(MemorySink::new());
        let diverging = |_: &SolverInput<'_>| -> Result<SolverOutput> {
            Ok(SolverOutput {
                delta: vec![f64::INFINITY; N_DOF],
                stresses: vec![0.0; N_STRESS],
            })
        };
        let orchestrator = Orchestrator::new(
            Default::default(),
            diverging,
            issuer(SimulatedSubsystem::accepting()),
            sink,
        )
        .unwrap();
        orchestrator.add_records(records(0.5)).unwrap();
        assert!(matches!(
            orchestrator.run_cycle(None).await,
            Err(Error::Computation(_))
        ));
        assert_eq!(orchestrator.dof().unwrap(), DofVector::zeros());
        assert_eq!(orchestrator.state().unwrap(), CycleState::Idle);
        assert_eq!(orchestrator.pending_records().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cycle_needs_wavefront_errors() {
        let (orchestrator, _, _) = orchestrator(SimulatedSubsystem::accepting());
        assert!(matches!(
            orchestrator.run_cycle(None).await,
            Err(Error::Transition { .. })
        ));
        orchestrator.add_records(records(0.5)).unwrap();
        assert!(orchestrator.run_cycle(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_offset_reaches_the_subsystems() {
        let m1 = SimulatedSubsystem::accepting();
        let m2 = SimulatedSubsystem::rejecting();
        let hexapod = SimulatedSubsystem::accepting();
        let issuer = CorrectionIssuer::new(Duration::from_secs(1))
            .channel(Subsystem::M2Hexapod, hexapod.clone())
            .channel(Subsystem::CameraHexapod, SimulatedSubsystem::accepting())
            .channel(Subsystem::M1, m1.clone())
            .channel(Subsystem::M2, m2.clone());
        let (orchestrator, _, _) = build(Default::default(), issuer);

        let offset = DofVector::scatter(Subsystem::M1.dof_range(), &[0.25; 20]);
        assert!(orchestrator.offset_dof(&offset).await.unwrap().is_committed());
        assert_eq!(orchestrator.dof().unwrap(), offset);
        let received = m1.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].delta, vec![0.25; 20]);
        assert!(hexapod.received().is_empty());
        assert_eq!(orchestrator.state().unwrap(), CycleState::Idle);

        let offset = DofVector::scatter(Subsystem::M2.dof_range(), &[0.1; 20]);
        let report = orchestrator.offset_dof(&offset).await.unwrap();
        assert_eq!(report.rejections[0].subsystem, Subsystem::M2);
        assert_eq!(m2.received().len(), 1);
        let dof = orchestrator.dof().unwrap();
        assert!(Subsystem::M2.dof_range().all(|i| dof[i] == 0.0));
        assert!(Subsystem::M1.dof_range().all(|i| dof[i] == 0.25));

        assert!(matches!(
            orchestrator.offset_dof(&DofVector::repeat(f64::NAN)).await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_offset_keeps_collected_records() {
        let (orchestrator, _, _) = orchestrator(SimulatedSubsystem::accepting());
        orchestrator.add_records(records(0.5)).unwrap();
        orchestrator
            .offset_dof(&DofVector::repeat(0.5))
            .await
            .unwrap();
        assert_eq!(orchestrator.state().unwrap(), CycleState::Collecting);
        assert_eq!(orchestrator.pending_records().unwrap(), 2);
        orchestrator.run_cycle(None).await.unwrap();
        assert_eq!(orchestrator.dof().unwrap(), DofVector::zeros());
    }

    #[tokio::test]
    async fn test_reject_correction() {
        let (orchestrator, sink, _) = orchestrator(SimulatedSubsystem::rejecting());
        assert!(matches!(
            orchestrator.reject_correction().await,
            Err(Error::State(_))
        ));
        orchestrator.add_records(records(0.5)).unwrap();
        orchestrator.run_cycle(None).await.unwrap();
        // the rejecting M2 never received a correction to back out
        let report = orchestrator.reject_correction().await.unwrap();
        assert!(report.is_committed());
        assert_eq!(report.accepted.len(), 3);
        assert!(!report.accepted.contains(&Subsystem::M2));
        assert_eq!(orchestrator.dof().unwrap(), DofVector::zeros());
        assert_eq!(orchestrator.last_correction().unwrap(), None);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, TelemetryEvent::RejectedDegreeOfFreedom(delta) if delta[0] == -0.5)));
        assert!(orchestrator.reject_correction().await.is_err());
    }

    #[tokio::test]
    async fn test_partially_refused_backout_remains_rejectable() {
        let m2 = SimulatedSubsystem::accepting();
        let issuer = CorrectionIssuer::new(Duration::from_secs(1))
            .channel(Subsystem::M1, SimulatedSubsystem::accepting())
            .channel(Subsystem::M2, m2.clone());
        let (orchestrator, _, _) = build(Default::default(), issuer);
        let offset = DofVector::scatter(10..50, &[0.5; 40]);
        orchestrator.offset_dof(&offset).await.unwrap();

        m2.set_behavior(crate::subsystem::Behavior::Reject);
        let report = orchestrator.reject_correction().await.unwrap();
        assert_eq!(report.accepted, vec![Subsystem::M1]);
        let remaining = DofVector::scatter(Subsystem::M2.dof_range(), &[0.5; 20]);
        assert_eq!(orchestrator.dof().unwrap(), remaining);
        assert_eq!(orchestrator.last_correction().unwrap(), Some(remaining));
    }

    #[tokio::test]
    async fn test_add_aberration() {
        let (orchestrator, _, seen) = orchestrator(SimulatedSubsystem::accepting());
        orchestrator.add_records(records(0.5)).unwrap();
        let aberration = uniform_wavefront([1, 2, 3], 4, &[1.0, 1.0]);
        let mask = DofMask::from_indices(Subsystem::M1.dof_range()).unwrap();
        let report = orchestrator
            .add_aberration(&aberration, Some(0.5), Some(&mask))
            .await
            .unwrap();
        assert_eq!(report.accepted, vec![Subsystem::M1]);
        let dof = orchestrator.dof().unwrap();
        for i in 0..N_DOF {
            let expected = if Subsystem::M1.dof_range().contains(&i) {
                -0.5
            } else {
                0.0
            };
            assert_eq!(dof[i], expected);
        }
        assert_eq!(seen.lock().unwrap().last(), Some(&aberration));
        assert_eq!(orchestrator.state().unwrap(), CycleState::Collecting);
        assert_eq!(orchestrator.pending_records().unwrap(), 2);
        assert_eq!(orchestrator.config().gain, 1.0);
    }

    #[tokio::test]
    async fn test_offset_and_reset() {
        let (orchestrator, _, _) = orchestrator(SimulatedSubsystem::accepting());
        let offset = DofVector::scatter(Subsystem::M1.dof_range(), &[0.25; 20]);
        assert!(orchestrator.offset_dof(&offset).await.unwrap().is_committed());
        assert_eq!(orchestrator.dof().unwrap(), offset);
        orchestrator.add_records(records(0.5)).unwrap();
        orchestrator.reset().unwrap();
        assert_eq!(orchestrator.dof().unwrap(), DofVector::zeros());
        assert_eq!(orchestrator.pending_records().unwrap(), 0);
        assert_eq!(orchestrator.state().unwrap(), CycleState::Idle);
        assert_eq!(orchestrator.last_correction().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_during_issue() {
        let (orchestrator, _, _) = slow(Duration::from_secs(1));
        orchestrator.add_records(records(0.5)).unwrap();
        let (result, _) = tokio::join!(orchestrator.run_cycle(None), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            orchestrator.reset().unwrap();
            // no other correction while the reset one is in flight
            orchestrator.add_records(records(0.5)).unwrap();
            assert!(matches!(
                orchestrator.run_cycle(None).await,
                Err(Error::Busy(_))
            ));
            assert!(matches!(
                orchestrator.offset_dof(&DofVector::repeat(0.1)).await,
                Err(Error::Busy(_))
            ));
            assert_eq!(orchestrator.state().unwrap(), CycleState::Collecting);
        });
        assert!(matches!(result, Err(Error::CycleReset)));
        assert_eq!(orchestrator.dof().unwrap(), DofVector::zeros());
        assert_eq!(orchestrator.state().unwrap(), CycleState::Collecting);
        assert_eq!(orchestrator.pending_records().unwrap(), 2);

        assert!(orchestrator.run_cycle(None).await.unwrap().is_committed());
        assert_eq!(orchestrator.dof().unwrap(), DofVector::repeat(-0.5));
        assert_eq!(orchestrator.state().unwrap(), CycleState::Idle);
    }
}
