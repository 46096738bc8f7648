use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::binning::{default_vulcan_binning, BinningGroup};
use super::constants::{
    DEFAULT_FILE_INDEX_START, DEFAULT_IPARM_FILE, DEFAULT_JOIN_TIMEOUT_SECS,
    DEFAULT_MEMORY_CEILING, DEFAULT_POOL_SIZE, GSAS_EXTENSION,
};
use super::error::ConfigError;
use super::grouping::Grouping;
use super::splitter_builder::LogValueFilter;

/// How the run should be chopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SplitterSource {
    /// A splitter text file
    File { path: PathBuf },
    Time {
        start: Option<f64>,
        stop: Option<f64>,
        step: Option<f64>,
    },
    OverlappingTime {
        start: Option<f64>,
        stop: Option<f64>,
        step: f64,
        overlap: f64,
    },
    LogValue(LogValueFilter),
    Manual { marks: Vec<f64> },
}

impl Default for SplitterSource {
    fn default() -> Self {
        Self::Time {
            start: None,
            stop: None,
            step: Some(60.0),
        }
    }
}

/// Structure representing the configuration of one chop-and-reduce job.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub run_number: i32,
    pub ipts: i32,
    pub event_file: PathBuf,
    pub output_dir: PathBuf,
    pub splitter: SplitterSource,
    pub n_threads: i32,
    /// Targets chopped at once; more than this and the run is chopped in batches
    pub memory_ceiling: usize,
    pub join_timeout_secs: u64,
    pub file_index_start: usize,
    pub calibration_path: Option<PathBuf>,
    pub iparm_file: String,
    pub grouping: Grouping,
    pub binning: Vec<BinningGroup>,
}

impl Default for Config {
    /// Generate a new Config object. Paths will be empty/invalid
    fn default() -> Self {
        Self {
            run_number: 0,
            ipts: 0,
            event_file: PathBuf::from("None"),
            output_dir: PathBuf::from("None"),
            splitter: SplitterSource::default(),
            n_threads: DEFAULT_POOL_SIZE as i32,
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            join_timeout_secs: DEFAULT_JOIN_TIMEOUT_SECS,
            file_index_start: DEFAULT_FILE_INDEX_START,
            calibration_path: None,
            iparm_file: String::from(DEFAULT_IPARM_FILE),
            grouping: Grouping::default(),
            binning: default_vulcan_binning(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    pub fn is_n_threads_valid(&self) -> bool {
        self.n_threads >= 1
    }

    pub fn is_memory_ceiling_valid(&self) -> bool {
        self.memory_ceiling >= 1
    }

    pub fn is_grouping_valid(&self) -> bool {
        self.grouping.is_valid()
    }

    /// Check everything that can be checked without touching the disk
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_n_threads_valid() {
            return Err(ConfigError::Invalid(format!(
                "n_threads must be at least 1, found {}",
                self.n_threads
            )));
        }
        if !self.is_memory_ceiling_valid() {
            return Err(ConfigError::Invalid(String::from(
                "memory_ceiling must be at least 1",
            )));
        }
        if !self.is_grouping_valid() {
            return Err(ConfigError::Invalid(String::from(
                "grouping banks must have unique ids, disjoint pixel ranges and positive DIFC",
            )));
        }
        for group in self.binning.iter() {
            if !group.binning.is_valid() {
                return Err(ConfigError::Invalid(format!(
                    "binning for banks {:?} is not valid",
                    group.banks
                )));
            }
        }
        Ok(())
    }

    pub fn pool_size(&self) -> usize {
        self.n_threads.max(1) as usize
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    /// Name of the GSAS file for a sequence number
    pub fn get_gsas_file_name(&self, sequence: usize) -> String {
        format!("{sequence}.{GSAS_EXTENSION}")
    }

    /// Full path of the GSAS file for a sequence number
    pub fn get_gsas_path(&self, sequence: usize) -> PathBuf {
        self.output_dir.join(self.get_gsas_file_name(sequence))
    }
}
