//! The boundary to the numerical reduction framework.
//!
//! The chopping pipeline never touches neutron events or detector physics directly.
//! Everything it needs from the physics side goes through the [`Instrument`] trait,
//! which operates on named workspaces. [`event_store::EventStore`] is a small
//! reference implementation backed by the `.vevt` event file format.
pub mod event_file;
pub mod event_store;

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use super::calibration::Calibration;
use super::error::{InstrumentError, SplitterError};
use super::grouping::{BankGeometry, Grouping};
use super::pattern::FocusedPattern;
use super::splitter::SplitterSet;

/// Handle to a workspace held by an Instrument.
///
/// The empty handle is a sentinel: the chopped interval it stands for produced no events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceRef(String);

impl WorkspaceRef {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkspaceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Units of the x-axis of a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    TOF,
    DSpacing,
}

/// Which stretches of a sample log are eligible when scanning for threshold crossings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogDirection {
    #[default]
    Both,
    Increase,
    Decrease,
}

impl FromStr for LogDirection {
    type Err = SplitterError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "both" => Ok(Self::Both),
            "increase" => Ok(Self::Increase),
            "decrease" => Ok(Self::Decrease),
            _ => Err(SplitterError::UnsupportedOption {
                option: "direction",
                value: s.to_string(),
            }),
        }
    }
}

/// Run level metadata. Any field may be missing from a workspace.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunMetadata {
    /// Run start in nanoseconds since the Unix epoch
    pub start_epoch_ns: Option<i64>,
    pub duration_s: Option<f64>,
    pub title: String,
}

impl RunMetadata {
    /// Run start in seconds since the Unix epoch
    pub fn start_epoch_s(&self) -> Option<f64> {
        self.start_epoch_ns.map(|ns| ns as f64 * 1.0e-9)
    }
}

/// The operations the chopping pipeline requires from the reduction framework.
///
/// Implementations are shared between the focus workers, so they must be thread safe.
/// Every call that names a workspace must tolerate concurrent calls on other
/// workspaces.
pub trait Instrument: Send + Sync {
    /// Load an event file into a new workspace
    fn load_event_file(&self, path: &Path) -> Result<WorkspaceRef, InstrumentError>;

    /// Apply detector calibration constants to a workspace, in place
    fn align_detectors(
        &self,
        workspace: &WorkspaceRef,
        calibration: &Calibration,
    ) -> Result<(), InstrumentError>;

    /// Split an event workspace into one workspace per target of the splitter set.
    ///
    /// Times in the set are relative to the run start. The returned list is ordered by
    /// target and contains an empty WorkspaceRef for each target that received zero events.
    fn filter_by_splitters(
        &self,
        workspace: &WorkspaceRef,
        splitters: &SplitterSet,
    ) -> Result<Vec<WorkspaceRef>, InstrumentError>;

    /// Convert the x-axis of a workspace, in place
    fn convert_units(&self, workspace: &WorkspaceRef, unit: Unit) -> Result<(), InstrumentError>;

    /// Group the detector spectra of a workspace into the banks of a grouping, in place
    fn diffraction_focus(
        &self,
        workspace: &WorkspaceRef,
        grouping: &Grouping,
        target_unit: Unit,
    ) -> Result<(), InstrumentError>;

    /// Attach per-bank geometry to a focused workspace
    fn edit_instrument_geometry(
        &self,
        workspace: &WorkspaceRef,
        geometry: &[BankGeometry],
    ) -> Result<(), InstrumentError>;

    /// Find the time windows during which a sample log is at or above a threshold
    fn scan_log_crossings(
        &self,
        workspace: &WorkspaceRef,
        log_name: &str,
        threshold: f64,
        direction: LogDirection,
    ) -> Result<Vec<(f64, f64)>, InstrumentError>;

    fn get_run_metadata(&self, workspace: &WorkspaceRef) -> Result<RunMetadata, InstrumentError>;

    /// Copy the banks of a focused workspace out of the framework
    fn extract_pattern(&self, workspace: &WorkspaceRef) -> Result<FocusedPattern, InstrumentError>;

    /// Release a workspace. Unknown names are ignored.
    fn delete_workspace(&self, workspace: &WorkspaceRef);
}
