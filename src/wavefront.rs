//! # Wavefront errors
//!
//! Wavefront error records produced by the wavefront estimation pipeline and their
//! per-detector aggregation over one correction cycle.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Detector identifier
pub type DetectorId = u32;

/// Averaged sparse coefficients per detector
pub type WavefrontSnapshot = BTreeMap<DetectorId, Vec<(usize, f64)>>;

/// Visit identifier
///
/// Disambiguates concurrent pipeline submissions: requester, submission time
/// (milliseconds since the Unix epoch) and visit number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VisitId {
    pub requester: String,
    pub submitted: i64,
    pub visit: u64,
}
impl VisitId {
    /// Creates a visit identifier submitted now
    pub fn new<S: Into<String>>(requester: S, visit: u64) -> Self {
        Self::at(requester, Utc::now(), visit)
    }
    /// Creates a visit identifier submitted at `submitted`
    pub fn at<S: Into<String>>(requester: S, submitted: DateTime<Utc>, visit: u64) -> Self {
        Self {
            requester: requester.into(),
            submitted: submitted.timestamp_millis(),
            visit,
        }
    }
    /// Returns the submission time
    pub fn submitted(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.submitted).single()
    }
}
impl fmt::Display for VisitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.requester, self.visit, self.submitted)
    }
}
impl FromStr for VisitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::Configuration(format!("malformed visit identifier: {s:?}"));
        let (requester, rest) = s.rsplit_once(':').ok_or_else(malformed)?;
        let (visit, submitted) = rest.split_once('@').ok_or_else(malformed)?;
        Ok(Self {
            requester: requester.to_string(),
            submitted: submitted.parse().map_err(|_| malformed())?,
            visit: visit.parse().map_err(|_| malformed())?,
        })
    }
}

/// Sparse wavefront error of one detector
///
/// Mode indices without a measurement are absent, not zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavefrontErrorRecord {
    pub detector: DetectorId,
    pub coefficients: Vec<(usize, f64)>,
    pub visit: VisitId,
}
impl WavefrontErrorRecord {
    /// Creates a record, the coefficients are ordered by mode index
    pub fn new<I>(detector: DetectorId, visit: VisitId, coefficients: I) -> Self
    where
        I: IntoIterator<Item = (usize, f64)>,
    {
        let mut coefficients: Vec<_> = coefficients.into_iter().collect();
        coefficients.sort_by_key(|(mode, _)| *mode);
        Self {
            detector,
            coefficients,
            visit,
        }
    }
    /// Creates a record from consecutive coefficients starting at mode `first_mode`
    pub fn dense(detector: DetectorId, visit: VisitId, first_mode: usize, values: &[f64]) -> Self {
        Self::new(
            detector,
            visit,
            values
                .iter()
                .enumerate()
                .map(|(i, v)| (first_mode + i, *v)),
        )
    }
    pub fn is_finite(&self) -> bool {
        self.coefficients.iter().all(|(_, v)| v.is_finite())
    }
}

/// Returns the same wavefront error on every detector
///
/// `coefficients` are the consecutive coefficients starting at mode `first_mode`.
pub fn uniform_wavefront<I>(detectors: I, first_mode: usize, coefficients: &[f64]) -> WavefrontSnapshot
where
    I: IntoIterator<Item = DetectorId>,
{
    let coefficients: Vec<_> = coefficients
        .iter()
        .enumerate()
        .map(|(i, c)| (first_mode + i, *c))
        .collect();
    detectors
        .into_iter()
        .map(|detector| (detector, coefficients.clone()))
        .collect()
}

/// Wavefront errors of one correction cycle, grouped by detector in arrival order
///
/// Records with non-finite coefficients are set aside as rejected and never averaged.
#[derive(Debug, Default, Clone)]
pub struct WavefrontCollection {
    records: BTreeMap<DetectorId, Vec<WavefrontErrorRecord>>,
    rejected: Vec<WavefrontErrorRecord>,
}
impl WavefrontCollection {
    pub fn new() -> Self {
        Default::default()
    }
    /// Appends the records and returns how many were rejected
    pub fn add<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = WavefrontErrorRecord>,
    {
        let mut n_rejected = 0;
        for record in records {
            if record.is_finite() {
                self.records.entry(record.detector).or_default().push(record);
            } else {
                log::warn!(
                    "rejecting non-finite wavefront error of detector {} ({})",
                    record.detector,
                    record.visit
                );
                self.rejected.push(record);
                n_rejected += 1;
            }
        }
        n_rejected
    }
    /// Moves all the records of `other`, rejected ones included, into the collection
    pub fn merge(&mut self, other: WavefrontCollection) {
        for (detector, records) in other.records {
            self.records.entry(detector).or_default().extend(records);
        }
        self.rejected.extend(other.rejected);
    }
    /// Returns the mean coefficient of every mode measured at least once by `detector`
    ///
    /// Returns `None` if there is no record for `detector`.
    pub fn average(&self, detector: DetectorId) -> Option<Vec<(usize, f64)>> {
        let records = self.records.get(&detector).filter(|r| !r.is_empty())?;
        let mut sums: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
        records
            .iter()
            .flat_map(|record| record.coefficients.iter())
            .for_each(|(mode, value)| {
                let (sum, count) = sums.entry(*mode).or_insert((0f64, 0));
                *sum += *value;
                *count += 1;
            });
        Some(
            sums.into_iter()
                .map(|(mode, (sum, count))| (mode, sum / count as f64))
                .collect(),
        )
    }
    /// Returns the averages of all the detectors
    pub fn snapshot(&self) -> WavefrontSnapshot {
        self.records
            .keys()
            .filter_map(|&detector| self.average(detector).map(|avg| (detector, avg)))
            .collect()
    }
    /// Empties the collection, rejected records included
    pub fn clear(&mut self) {
        self.records.clear();
        self.rejected.clear();
    }
    /// Number of accepted records
    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn detectors(&self) -> impl Iterator<Item = DetectorId> + '_ {
        self.records.keys().copied()
    }
    pub fn records(&self, detector: DetectorId) -> &[WavefrontErrorRecord] {
        self.records
            .get(&detector)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
    /// Iterates over the accepted records, detector by detector
    pub fn iter(&self) -> impl Iterator<Item = &WavefrontErrorRecord> {
        self.records.values().flatten()
    }
    pub fn rejected(&self) -> &[WavefrontErrorRecord] {
        &self.rejected
    }
}
