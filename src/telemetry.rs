//! # Telemetry
//!
//! Events published by the [Orchestrator](crate::Orchestrator) to the surrounding layer.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::{
    correction::SafetyEvent,
    issuer::RejectionNotice,
    pipeline::JobId,
    subsystem::Subsystem,
    wavefront::DetectorId,
    Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryEvent {
    /// Wall duration of a pipeline job
    WepDuration { job: JobId, seconds: f64 },
    /// Duration of the correction computation
    OfcDuration { seconds: f64 },
    /// Wavefront error records of a pipeline job
    WavefrontError {
        detector: DetectorId,
        coefficients: Vec<(usize, f64)>,
    },
    /// Wavefront error records discarded for non-finite coefficients
    RejectedWavefrontError {
        detector: DetectorId,
        coefficients: Vec<(usize, f64)>,
    },
    /// Current DOF vector
    DegreeOfFreedom(Vec<f64>),
    /// Predicted stresses of the bending modes of a mirror
    MirrorStresses {
        subsystem: Subsystem,
        stresses: Vec<f64>,
    },
    SafetyLimitExceeded(SafetyEvent),
    /// Correction accepted by a subsystem
    CorrectionIssued {
        subsystem: Subsystem,
        delta: Vec<f64>,
    },
    Rejection(RejectionNotice),
    /// Correction backed out on request
    RejectedDegreeOfFreedom(Vec<f64>),
}

/// Telemetry destination
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, event: TelemetryEvent);
}

/// Logs every event at `info` level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;
impl TelemetrySink for LogSink {
    fn publish(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::SafetyLimitExceeded(_) | TelemetryEvent::Rejection(_) => {
                log::warn!("{event:?}")
            }
            _ => log::info!("{event:?}"),
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}
impl MemorySink {
    pub fn new() -> Self {
        Default::default()
    }
    /// Returns a copy of the events published so far
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}
impl TelemetrySink for MemorySink {
    fn publish(&self, event: TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Appends every event to a pickle file
///
/// The file holds one pickle per event, to be read back with successive `pickle.load`.
pub struct PickleSink {
    writer: Mutex<BufWriter<File>>,
}
impl PickleSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::info!("writing telemetry to {path:?}");
        Ok(Self {
            writer: Mutex::new(BufWriter::new(File::create(path)?)),
        })
    }
    fn write(&self, event: &TelemetryEvent) -> Result<()> {
        let mut writer = crate::lock(&self.writer)?;
        serde_pickle::to_writer(&mut *writer, event, Default::default())?;
        writer.flush()?;
        Ok(())
    }
}
impl TelemetrySink for PickleSink {
    fn publish(&self, event: TelemetryEvent) {
        if let Err(e) = self.write(&event) {
            log::error!("failed to write telemetry: {e}");
        }
    }
}
