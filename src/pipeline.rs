//! # Wavefront estimation pipeline
//!
//! Each pipeline invocation runs as a separate process supervised by its own task.
//! The control loop only holds a [JobHandle]: [PipelineRunner::wait] polls it,
//! yielding on every iteration and forwarding the child output to the logger.
//!
//! The pipeline program is invoked as
//! ```text
//! <program> [args..] --detectors 1,2,3 --calibration <path> --visit <visit>.. [--config key=value].. --output <path>
//! ```
//! with the output path also exported as `AOS_WEP_OUTPUT`.
//! On success the program writes a bincode encoded `Vec<WavefrontErrorRecord>` to the output path.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    wavefront::{DetectorId, VisitId, WavefrontCollection, WavefrontErrorRecord},
    Error, Result,
};

/// Output environment variable
pub const OUTPUT_ENV: &str = "AOS_WEP_OUTPUT";
/// Number of stderr lines reported with a failure
const STDERR_TAIL: usize = 10;
/// Grace period for the output readers once the child has exited
const DRAIN_GRACE: Duration = Duration::from_secs(1);

pub type JobId = u64;

/// Pipeline job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}
impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Interrupted
        )
    }
}

/// Pipeline invocation builder
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    program: PathBuf,
    args: Vec<String>,
    detectors: Vec<DetectorId>,
    calibration: Option<PathBuf>,
    visits: Vec<VisitId>,
    overrides: BTreeMap<String, String>,
    output: Option<PathBuf>,
}
impl PipelineConfig {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }
    /// Adds an argument ahead of the pipeline arguments
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }
    /// Selects the detectors to process
    pub fn detectors<I: IntoIterator<Item = DetectorId>>(mut self, detectors: I) -> Self {
        self.detectors.extend(detectors);
        self
    }
    /// Sets the calibration reference
    pub fn calibration<P: Into<PathBuf>>(mut self, calibration: P) -> Self {
        self.calibration = Some(calibration.into());
        self
    }
    pub fn visit(mut self, visit: VisitId) -> Self {
        self.visits.push(visit);
        self
    }
    /// Overrides a pipeline configuration entry
    pub fn set<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.overrides.insert(key.into(), value.to_string());
        self
    }
    /// Sets the location of the pipeline output
    pub fn output<P: Into<PathBuf>>(mut self, output: P) -> Self {
        self.output = Some(output.into());
        self
    }
    pub fn visits(&self) -> &[VisitId] {
        &self.visits
    }
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Configuration(format!("pipeline {msg}")));
        if self.program.as_os_str().is_empty() {
            return invalid("program is not set");
        }
        if self.detectors.is_empty() {
            return invalid("detector selection is empty");
        }
        if self.calibration.is_none() {
            return invalid("calibration reference is not set");
        }
        if self.visits.is_empty() {
            return invalid("visit list is empty");
        }
        if self.output.is_none() {
            return invalid("output location is not set");
        }
        if self
            .overrides
            .keys()
            .any(|key| key.is_empty() || key.contains('='))
        {
            return invalid("override keys must be non-empty and free of '='");
        }
        Ok(())
    }
    fn command(&self, output: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg("--detectors").arg(
            self.detectors
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(calibration) = &self.calibration {
            command.arg("--calibration").arg(calibration);
        }
        for visit in &self.visits {
            command.arg("--visit").arg(visit.to_string());
        }
        for (key, value) in &self.overrides {
            command.arg("--config").arg(format!("{key}={value}"));
        }
        command
            .arg("--output")
            .arg(output)
            .env(OUTPUT_ENV, output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}
#[derive(Debug)]
struct LogLine {
    stream: Stream,
    line: String,
}

struct Job {
    id: JobId,
    visits: Vec<VisitId>,
    output: PathBuf,
    started: Instant,
    status: watch::Sender<JobStatus>,
    cancel: Notify,
    logs: Mutex<mpsc::UnboundedReceiver<LogLine>>,
    stderr: Mutex<VecDeque<String>>,
    detail: Mutex<Option<String>>,
    elapsed: Mutex<Option<Duration>>,
}
impl Job {
    /// Moves the job into a terminal state, unless it is already in one
    fn finish(&self, status: JobStatus, detail: Option<String>) -> bool {
        let mut detail = detail;
        let finished = self.status.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            if let Ok(mut d) = self.detail.lock() {
                *d = detail.take();
            }
            if let Ok(mut elapsed) = self.elapsed.lock() {
                *elapsed = Some(self.started.elapsed());
            }
            *current = status;
            true
        });
        if finished {
            log::debug!("pipeline job #{} {status:?}", self.id);
        }
        finished
    }
    /// Forwards the child output received so far to the logger
    fn drain_logs(&self) -> Result<()> {
        let mut logs = crate::lock(&self.logs)?;
        while let Ok(LogLine { stream, line }) = logs.try_recv() {
            log::debug!("[wep #{}] {line}", self.id);
            if let Stream::Stderr = stream {
                let mut stderr = crate::lock(&self.stderr)?;
                if stderr.len() == STDERR_TAIL {
                    stderr.pop_front();
                }
                stderr.push_back(line);
            }
        }
        Ok(())
    }
    fn failure(&self) -> Error {
        let detail = self
            .detail
            .lock()
            .ok()
            .and_then(|detail| detail.clone())
            .unwrap_or_else(|| "failed".into());
        let stderr = self
            .stderr
            .lock()
            .map(|stderr| Vec::from(stderr.clone()).join("\n"))
            .unwrap_or_default();
        if stderr.is_empty() {
            log::error!("pipeline job #{} {detail}", self.id);
            Error::PipelineFailure(format!("job #{} {detail}", self.id))
        } else {
            log::error!("pipeline job #{} {detail}:\n{stderr}", self.id);
            Error::PipelineFailure(format!("job #{} {detail}:\n{stderr}", self.id))
        }
    }
}

/// Shared handle to a pipeline job
#[derive(Clone)]
pub struct JobHandle(Arc<Job>);
impl JobHandle {
    pub fn id(&self) -> JobId {
        self.0.id
    }
    pub fn status(&self) -> JobStatus {
        *self.0.status.borrow()
    }
    pub fn visits(&self) -> &[VisitId] {
        &self.0.visits
    }
    pub fn output(&self) -> &Path {
        &self.0.output
    }
    /// Job wall duration, up to now if the job is not finished
    pub fn elapsed(&self) -> Duration {
        self.0
            .elapsed
            .lock()
            .ok()
            .and_then(|elapsed| *elapsed)
            .unwrap_or_else(|| self.0.started.elapsed())
    }
}
impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("visits", &self.0.visits)
            .finish()
    }
}

type Registry = Arc<Mutex<HashMap<VisitId, JobId>>>;

/// Pipeline job submission, monitoring and cancellation
pub struct PipelineRunner {
    next_id: AtomicU64,
    running: Registry,
    jobs: Mutex<Vec<JobHandle>>,
    timeout: Duration,
}
impl PipelineRunner {
    /// Creates a runner whose jobs must complete within `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            running: Default::default(),
            jobs: Default::default(),
            timeout,
        }
    }
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
    /// Starts a pipeline job
    ///
    /// A job whose process cannot be started is returned already [JobStatus::Failed].
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, config: &PipelineConfig) -> Result<JobHandle> {
        config.validate()?;
        let output = config
            .output
            .clone()
            .ok_or_else(|| Error::Configuration("pipeline output location is not set".into()))?;
        let mut running = crate::lock(&self.running)?;
        if let Some(visit) = config.visits.iter().find(|v| running.contains_key(*v)) {
            return Err(Error::JobRunning(visit.clone()));
        }
        match std::fs::remove_file(&output) {
            Ok(_) => log::debug!("removed stale pipeline output {output:?}"),
            Err(e) if e.kind() == ErrorKind::NotFound => (),
            Err(e) => return Err(e.into()),
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(JobStatus::Pending);
        let job = Arc::new(Job {
            id,
            visits: config.visits.clone(),
            output: output.clone(),
            started: Instant::now(),
            status,
            cancel: Notify::new(),
            logs: Mutex::new(rx),
            stderr: Default::default(),
            detail: Default::default(),
            elapsed: Default::default(),
        });

        match config.command(&output).spawn() {
            Ok(mut child) => {
                log::info!(
                    "pipeline job #{id} started for {} visit(s): {:?}",
                    config.visits.len(),
                    config.program
                );
                for visit in &config.visits {
                    running.insert(visit.clone(), id);
                }
                job.status.send_if_modified(|status| {
                    let pending = *status == JobStatus::Pending;
                    if pending {
                        *status = JobStatus::Running;
                    }
                    pending
                });
                let readers = vec![
                    forward(child.stdout.take(), Stream::Stdout, tx.clone()),
                    forward(child.stderr.take(), Stream::Stderr, tx),
                ];
                tokio::spawn(supervise(job.clone(), child, readers, self.running.clone()));
            }
            Err(e) => {
                job.finish(
                    JobStatus::Failed,
                    Some(format!("failed to start {:?}: {e}", config.program)),
                );
            }
        }
        drop(running);

        let handle = JobHandle(job);
        let mut jobs = crate::lock(&self.jobs)?;
        jobs.retain(|job| !job.status().is_terminal());
        jobs.push(handle.clone());
        Ok(handle)
    }
    /// Waits for the job to complete and reads its output
    ///
    /// The job status is checked every `poll_interval` at most, the child output is
    /// forwarded to the logger on every check.
    /// A job still running after the runner timeout is cancelled.
    pub async fn wait(
        &self,
        handle: &JobHandle,
        poll_interval: Duration,
    ) -> Result<WavefrontCollection> {
        let job = &handle.0;
        let deadline = job.started + self.timeout;
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let mut status = job.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            // the output is complete once the status is terminal
            job.drain_logs()?;
            match current {
                JobStatus::Completed => break,
                JobStatus::Failed => return Err(job.failure()),
                JobStatus::Interrupted => return Err(Error::Interrupted(job.id)),
                JobStatus::Pending | JobStatus::Running => (),
            }
            let now = Instant::now();
            if now >= deadline {
                log::error!(
                    "pipeline job #{} timed out after {:?}",
                    job.id,
                    self.timeout
                );
                self.cancel(handle);
                return Err(Error::PipelineTimeout {
                    job: job.id,
                    timeout: self.timeout,
                });
            }
            tokio::task::yield_now().await;
            let _ = tokio::time::timeout(poll_interval.min(deadline - now), status.changed()).await;
        }

        let bytes = tokio::fs::read(&job.output).await.map_err(|e| {
            Error::PipelineFailure(format!(
                "job #{} output {:?} is unreadable: {e}",
                job.id, job.output
            ))
        })?;
        let records: Vec<WavefrontErrorRecord> = bincode::deserialize(&bytes).map_err(|e| {
            Error::PipelineFailure(format!("job #{} output is corrupted: {e}", job.id))
        })?;
        let mut collection = WavefrontCollection::new();
        let rejected = collection.add(records);
        if rejected > 0 {
            log::warn!(
                "pipeline job #{} returned {rejected} non-finite record(s)",
                job.id
            );
        }
        log::info!(
            "pipeline job #{} completed in {:.3}s with {} record(s)",
            job.id,
            handle.elapsed().as_secs_f64(),
            collection.len()
        );
        Ok(collection)
    }
    /// Requests the termination of the job
    ///
    /// The job ends either [Interrupted](JobStatus::Interrupted) or, if it exited first,
    /// in the state its exit decided.
    pub fn cancel(&self, handle: &JobHandle) {
        if !handle.status().is_terminal() {
            log::info!("cancelling pipeline job #{}", handle.id());
            handle.0.cancel.notify_one();
        }
    }
    /// Cancels every job still running and returns how many were
    pub fn cancel_all(&self) -> Result<usize> {
        let jobs = crate::lock(&self.jobs)?;
        let mut n = 0;
        for job in jobs.iter().filter(|job| !job.status().is_terminal()) {
            self.cancel(job);
            n += 1;
        }
        Ok(n)
    }
    /// Jobs that are not yet in a terminal state
    pub fn running(&self) -> Result<Vec<JobHandle>> {
        Ok(crate::lock(&self.jobs)?
            .iter()
            .filter(|job| !job.status().is_terminal())
            .cloned()
            .collect())
    }
}

/// Reads the child output line by line until the pipe closes
fn forward<R>(reader: Option<R>, stream: Stream, tx: mpsc::UnboundedSender<LogLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else {
            return;
        };
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer).trim_end().to_string();
                    // the receiver may be gone, the pipe is still drained
                    let _ = tx.send(LogLine { stream, line });
                }
                Err(e) => {
                    log::warn!("failed to read pipeline {stream:?}: {e}");
                    break;
                }
            }
        }
    })
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    Cancelled,
}

async fn supervise(job: Arc<Job>, mut child: Child, readers: Vec<JoinHandle<()>>, running: Registry) {
    let exit = tokio::select! {
        biased;
        status = child.wait() => Exit::Status(status),
        _ = job.cancel.notified() => Exit::Cancelled,
    };
    let (status, detail) = match exit {
        Exit::Status(Ok(status)) if status.success() => (JobStatus::Completed, None),
        Exit::Status(Ok(status)) => (JobStatus::Failed, Some(format!("exited with {status}"))),
        Exit::Status(Err(e)) => (JobStatus::Failed, Some(format!("could not be waited on: {e}"))),
        Exit::Cancelled => {
            if let Err(e) = child.start_kill() {
                log::warn!("failed to kill pipeline job #{}: {e}", job.id);
            }
            if let Err(e) = child.wait().await {
                log::warn!("failed to reap pipeline job #{}: {e}", job.id);
            }
            (JobStatus::Interrupted, None)
        }
    };
    if tokio::time::timeout(DRAIN_GRACE, futures::future::join_all(readers))
        .await
        .is_err()
    {
        log::warn!("pipeline job #{} output is still open after exit", job.id);
    }
    if let Ok(mut running) = running.lock() {
        running.retain(|_, id| *id != job.id);
    }
    job.finish(status, detail);
}
