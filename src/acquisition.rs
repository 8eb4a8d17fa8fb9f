//! Acquisition session state.
//!
//! A series ends when two independent signals agree on the same filename:
//!
//! ```text
//! control channel:  "7 OK /data/scan3_00009.cbf"  -> last_expected_file
//! watch folder:     scan3_00009.cbf moved in       -> most_recently_seen_file
//! ```
//!
//! Either may arrive first. The check runs after each of them, and when both
//! are set and equal, one `series_end` is emitted and both are cleared.

use pilatus_core::SourceFormat;
use tracing::{debug, info};

use crate::control::{CompletionRecord, CompletionStatus};

/// Coarse state of the current series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No series armed, or the last one has ended
    Idle,
    /// Detector armed and frames may arrive
    Armed,
}

/// Filename assigned to a newly armed series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedSeries {
    /// Scan number used for this series
    pub scan_number: u32,
    /// Detector-side filename, `scan<N>.<ext>`
    pub filename: String,
}

/// Per-process acquisition state, owned by the orchestrator.
#[derive(Debug)]
pub struct AcquisitionSession {
    format: SourceFormat,
    state: AcquisitionState,
    scan_number: u32,
    last_expected_file: Option<String>,
    most_recently_seen_file: Option<String>,
}

impl AcquisitionSession {
    /// New idle session starting at scan 0.
    #[must_use]
    pub fn new(format: SourceFormat) -> Self {
        Self {
            format,
            state: AcquisitionState::Idle,
            scan_number: 0,
            last_expected_file: None,
            most_recently_seen_file: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Scan number the next arm will use.
    #[must_use]
    pub fn scan_number(&self) -> u32 {
        self.scan_number
    }

    /// Filename named by the last OK completion record, if not yet matched.
    #[must_use]
    pub fn last_expected_file(&self) -> Option<&str> {
        self.last_expected_file.as_deref()
    }

    /// Last file seen in the watch folder, if not yet matched.
    #[must_use]
    pub fn most_recently_seen_file(&self) -> Option<&str> {
        self.most_recently_seen_file.as_deref()
    }

    /// Arm a new series and assign its filename.
    pub fn arm(&mut self) -> ArmedSeries {
        let series = ArmedSeries {
            scan_number: self.scan_number,
            filename: format!("scan{}.{}", self.scan_number, self.format.extension()),
        };
        self.scan_number = self.scan_number.wrapping_add(1);
        self.state = AcquisitionState::Armed;
        info!(scan = series.scan_number, file = %series.filename, "Detector armed");
        series
    }

    /// Record a file that appeared in the watch folder.
    ///
    /// Does not evaluate the series end; call
    /// [`check_series_end`](Self::check_series_end) once the file is handled.
    pub fn observe_file(&mut self, file_name: &str) {
        self.most_recently_seen_file = Some(file_name.to_string());
    }

    /// Apply a completion record from the control channel.
    ///
    /// Returns `true` if this completes the series. Error records are ignored:
    /// an aborted frame reports ERR and then OK for the same file.
    pub fn complete(&mut self, record: &CompletionRecord) -> bool {
        match record.status {
            CompletionStatus::Ok => {
                self.last_expected_file = Some(record.file_name().to_string());
                debug!(file = record.file_name(), "Detector reported last file");
                self.check_series_end()
            }
            CompletionStatus::Err => {
                debug!(path = %record.path, "Ignoring error completion record");
                false
            }
        }
    }

    /// Fire the series end if both signals name the same file.
    ///
    /// Clears both on a match, so the same pair can never fire twice.
    pub fn check_series_end(&mut self) -> bool {
        match (&self.last_expected_file, &self.most_recently_seen_file) {
            (Some(expected), Some(seen)) if expected == seen => {
                info!(scan = self.scan_number.wrapping_sub(1), file = %expected, "Series complete");
                self.last_expected_file = None;
                self.most_recently_seen_file = None;
                self.state = AcquisitionState::Idle;
                true
            }
            _ => false,
        }
    }
}
