use std::path::PathBuf;
use thiserror::Error;

use super::splitter::TargetId;

#[derive(Debug, Error)]
pub enum SplitterError {
    #[error("Invalid range for splitter: {0}")]
    InvalidRange(String),
    #[error("Unsupported value {value:?} for splitter option {option}")]
    UnsupportedOption { option: &'static str, value: String },
    #[error("Splitter segments for targets {0} and {1} overlap at {2:.9} s")]
    Overlap(TargetId, TargetId, f64),
    #[error("Could not open splitter file because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Splitter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Splitter failed due to instrument error: {0}")]
    InstrumentError(#[from] InstrumentError),
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Calibration failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Calibration failed to parse an integer: {0}")]
    ParsingIntError(#[from] std::num::ParseIntError),
    #[error("Calibration failed to parse a float: {0}")]
    ParsingFloatError(#[from] std::num::ParseFloatError),
    #[error("Calibration was given a file with the incorrect format; most likely the number of columns is incorrect")]
    BadFileFormat,
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("Could not load event file because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Instrument failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Event file is not in the expected format: {0}")]
    BadFormat(String),
    #[error("No workspace named {0:?} exists")]
    NoWorkspace(String),
    #[error("Workspace {0:?} cannot be used here: {1}")]
    WrongWorkspaceKind(String, &'static str),
    #[error("Workspace {0:?} has no sample log named {1:?}")]
    NoSampleLog(String, String),
    #[error("Pixel {0} has no calibration constant")]
    UncalibratedPixel(u32),
    #[error("Grouping cannot be used for focusing: {0}")]
    InvalidGrouping(String),
    #[error("Instrument geometry could not be applied: {0}")]
    Geometry(String),
    #[error("Instrument failed due to calibration error: {0}")]
    CalibrationError(#[from] CalibrationError),
    #[error("Workspace store lock was poisoned")]
    PoisonedStore,
}

#[derive(Debug, Error)]
pub enum GsasError {
    #[error("GsasWriter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Refusing to overwrite {0:?}: the file exists and is not writable")]
    NotWritable(PathBuf),
    #[error("Cannot write GSAS file into {0:?}: the directory is not writable")]
    DirectoryNotWritable(PathBuf),
    #[error("Cannot write GSAS file into {0:?}: the directory does not exist")]
    DirectoryMissing(PathBuf),
    #[error("Bank {0} is assigned to more than one binning group")]
    DuplicateBank(u32),
    #[error("Invalid binning parameters: {0}")]
    InvalidBinning(String),
    #[error("Bank {0} has inconsistent array lengths")]
    MalformedBank(u32),
}

#[derive(Debug, Error)]
pub enum ChopIndexError {
    #[error("ChopIndex failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ChopIndex could not access directory {0:?}")]
    BadDirectory(PathBuf),
}

#[derive(Debug, Error)]
pub enum FocusPoolError {
    #[error("Focus failed due to instrument error: {0}")]
    InstrumentError(#[from] InstrumentError),
    #[error("Focus failed due to GSAS error: {0}")]
    GsasError(#[from] GsasError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is not valid: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Orchestrator failed because the event file {0:?} does not exist")]
    MissingEventFile(PathBuf),
    #[error("Orchestrator failed because the output directory {0:?} does not exist")]
    MissingOutputDir(PathBuf),
    #[error("Orchestrator failed because the output directory {0:?} is not writable")]
    OutputDirNotWritable(PathBuf),
    #[error("Orchestrator failed because the splitter request produced no segments")]
    NoSegments,
    #[error("Orchestrator failed because absolute splitter times were given but the run start is unknown")]
    UnknownRunStart,
    #[error("Orchestrator failed because splitting produced {found} workspaces for {expected} targets")]
    SplitCountMismatch { expected: usize, found: usize },
    #[error("Orchestrator failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Orchestrator failed due to splitter error: {0}")]
    SplitterError(#[from] SplitterError),
    #[error("Orchestrator failed due to instrument error: {0}")]
    InstrumentError(#[from] InstrumentError),
    #[error("Orchestrator failed due to calibration error: {0}")]
    CalibrationError(#[from] CalibrationError),
    #[error("Orchestrator failed due to GSAS error: {0}")]
    GsasError(#[from] GsasError),
    #[error("Orchestrator failed due to ChopIndex error: {0}")]
    ChopIndexError(#[from] ChopIndexError),
    #[error("Orchestrator failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
}
