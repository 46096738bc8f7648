use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::calibration::Calibration;
use super::chop_index::{ChopEntry, ChopIndex, ChopState};
use super::config::{Config, SplitterSource};
use super::error::OrchestratorError;
use super::focus_pool::{FocusUnit, FocusWorkerPool, WorkerFailure};
use super::gsas_writer::{write_gsas_file, GsasWriter};
use super::instrument::{Instrument, RunMetadata, WorkspaceRef};
use super::splitter::{SplitterSet, TargetId};
use super::splitter_builder::{from_text, SplitterBuilder};
use super::worker_status::{BarColor, WorkerStatus};

/// How the targets of a run are chopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChopStrategy {
    SinglePass,
    /// Chop `batch_size` targets at a time
    Chunked { batch_size: usize },
}

impl ChopStrategy {
    /// Contiguous ranges of target indices, one per batch
    pub fn batches(&self, num_targets: usize) -> Vec<Range<usize>> {
        match self {
            Self::SinglePass => vec![0..num_targets],
            Self::Chunked { batch_size } => {
                let size = (*batch_size).max(1);
                (0..num_targets)
                    .step_by(size)
                    .map(|start| start..(start + size).min(num_targets))
                    .collect()
            }
        }
    }
}

/// Fewer targets than the ceiling are chopped at once, otherwise in batches of the ceiling
pub fn decide_strategy(num_targets: usize, memory_ceiling: usize) -> ChopStrategy {
    if num_targets < memory_ceiling {
        ChopStrategy::SinglePass
    } else {
        ChopStrategy::Chunked {
            batch_size: memory_ceiling.max(1),
        }
    }
}

/// What a chop-and-reduce run produced
#[derive(Debug, Clone, Default)]
pub struct ChopReport {
    pub run_number: i32,
    pub written: Vec<PathBuf>,
    /// Targets whose interval had no events
    pub skipped: Vec<TargetId>,
    pub failures: Vec<WorkerFailure>,
    pub abandoned_workers: usize,
    pub lookup_file: Option<PathBuf>,
    pub n_batches: usize,
}

impl ChopReport {
    /// Every non-empty target produced a GSAS file
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.abandoned_workers == 0
    }
}

fn check_output_dir(dir: &Path) -> Result<(), OrchestratorError> {
    if !dir.is_dir() {
        return Err(OrchestratorError::MissingOutputDir(dir.to_path_buf()));
    }
    let readonly = dir
        .metadata()
        .map(|m| m.permissions().readonly())
        .unwrap_or(true);
    if readonly {
        return Err(OrchestratorError::OutputDirNotWritable(dir.to_path_buf()));
    }
    // Mode bits do not tell whether this user may write, so try it
    match tempfile::Builder::new()
        .prefix(".vulcan_chop_write_check")
        .tempfile_in(dir)
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            Err(OrchestratorError::OutputDirNotWritable(dir.to_path_buf()))
        }
        Err(e) => Err(OrchestratorError::IOError(e)),
    }
}

/// ChopReduceOrchestrator drives one run through loading, chopping, focusing and export.
///
/// It owns the ChopIndex. The Instrument is shared with the focus workers.
pub struct ChopReduceOrchestrator {
    config: Config,
    instrument: Arc<dyn Instrument>,
    index: ChopIndex,
    status_tx: Option<Sender<WorkerStatus>>,
}

impl ChopReduceOrchestrator {
    pub fn new(config: Config, instrument: Arc<dyn Instrument>) -> Self {
        Self {
            config,
            instrument,
            index: ChopIndex::new(),
            status_tx: None,
        }
    }

    pub fn with_progress(mut self, tx: Sender<WorkerStatus>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &ChopIndex {
        &self.index
    }

    fn send_status(&self, progress: f32, batch: usize, color: BarColor) {
        if let Some(tx) = &self.status_tx {
            // The driver reports under the id just past the last focus worker
            let _ = tx.send(WorkerStatus::new(
                progress,
                self.config.run_number,
                self.config.pool_size(),
                batch,
                color,
            ));
        }
    }

    /// Build the splitters requested by the config for a loaded run
    pub fn build_splitters(
        &self,
        workspace: &WorkspaceRef,
        metadata: &RunMetadata,
    ) -> Result<SplitterSet, OrchestratorError> {
        let builder = SplitterBuilder::new("chop")
            .with_run_duration(metadata.duration_s)
            .with_reference_run(self.config.run_number as i64)
            .with_run_start(metadata.start_epoch_s());
        let set = match &self.config.splitter {
            SplitterSource::File { path } => from_text(path)?,
            SplitterSource::Time { start, stop, step } => builder.by_time(*start, *stop, *step)?,
            SplitterSource::OverlappingTime {
                start,
                stop,
                step,
                overlap,
            } => builder.by_overlapping_time(*start, *stop, *step, *overlap)?,
            SplitterSource::LogValue(filter) => {
                builder.by_log_value(self.instrument.as_ref(), workspace, filter)?
            }
            SplitterSource::Manual { marks } => builder.manual(marks)?,
        };
        if set.is_relative() {
            return Ok(set);
        }
        let run_start = metadata
            .start_epoch_s()
            .or(set.run_start_epoch)
            .ok_or(OrchestratorError::UnknownRunStart)?;
        log::info!("Rebasing absolute splitter times onto the run start {run_start:.9}");
        Ok(set.to_relative(run_start))
    }

    /// Chop, focus and export the configured run
    pub fn run(&mut self) -> Result<ChopReport, OrchestratorError> {
        self.config.validate()?;
        check_output_dir(&self.config.output_dir)?;
        if !self.config.event_file.exists() {
            return Err(OrchestratorError::MissingEventFile(
                self.config.event_file.clone(),
            ));
        }

        let run_number = self.config.run_number;
        log::info!(
            "Loading run {run_number} from {}",
            self.config.event_file.to_string_lossy()
        );
        let parent = self.instrument.load_event_file(&self.config.event_file)?;
        let calibration = Calibration::new(
            self.config.calibration_path.as_deref(),
            &self.config.grouping,
        )?;
        self.instrument.align_detectors(&parent, &calibration)?;
        let metadata = self.instrument.get_run_metadata(&parent)?;

        let splitters = match self.build_splitters(&parent, &metadata) {
            Ok(s) if s.is_empty() => {
                self.instrument.delete_workspace(&parent);
                return Err(OrchestratorError::NoSegments);
            }
            Ok(s) => s,
            Err(e) => {
                self.instrument.delete_workspace(&parent);
                return Err(e);
            }
        };

        let output_dir = self.config.output_dir.clone();
        match self.index.recover(run_number, &output_dir)? {
            ChopState::NotChopped => (),
            ChopState::Chopped(seqs) | ChopState::Recovered(seqs) => log::info!(
                "Run {run_number} already has {} chopped files in {}; matching sequences are replaced",
                seqs.len(),
                output_dir.to_string_lossy()
            ),
        }

        let mut report = ChopReport {
            run_number,
            ..Default::default()
        };
        let result = self.chop_batches(&parent, &splitters, &mut report);
        self.instrument.delete_workspace(&parent);

        // Whatever was written is recorded, even if a batch failed
        let lookup = self.index.export_lookup(run_number, &output_dir);
        if let Err(e) = result {
            if let Err(export_error) = &lookup {
                log::error!("Could not export the lookup file of run {run_number}: {export_error}");
            }
            return Err(e);
        }
        report.lookup_file = Some(lookup?);

        log::info!(
            "Run {run_number}: {} files written, {} empty intervals skipped, {} failures",
            report.written.len(),
            report.skipped.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn chop_batches(
        &mut self,
        parent: &WorkspaceRef,
        splitters: &SplitterSet,
        report: &mut ChopReport,
    ) -> Result<(), OrchestratorError> {
        let run_number = self.config.run_number;
        let start_index = self.config.file_index_start;
        let targets = splitters.targets();
        let strategy = decide_strategy(targets.len(), self.config.memory_ceiling);
        let batches = strategy.batches(targets.len());
        report.n_batches = batches.len();
        log::info!(
            "Chopping {} targets of run {run_number} with strategy {strategy:?} in {} batches",
            targets.len(),
            batches.len()
        );

        let writer = Arc::new(GsasWriter::new(
            self.config.ipts,
            &self.config.iparm_file,
            self.config.binning.clone(),
        )?);
        let grouping = Arc::new(self.config.grouping.clone());
        let mut pool = FocusWorkerPool::new(
            self.config.pool_size(),
            self.config.join_timeout(),
            start_index,
        );
        if let Some(tx) = &self.status_tx {
            pool = pool.with_progress(run_number, tx.clone());
        }

        for (batch, range) in batches.into_iter().enumerate() {
            self.send_status(0.0, batch, BarColor::MAGENTA);
            let batch_targets = &targets[range.clone()];
            let subset = splitters.restricted_to(batch_targets);
            let refs = self.instrument.filter_by_splitters(parent, &subset)?;
            if refs.len() != batch_targets.len() {
                for workspace in refs.iter().filter(|r| !r.is_empty()) {
                    self.instrument.delete_workspace(workspace);
                }
                return Err(OrchestratorError::SplitCountMismatch {
                    expected: batch_targets.len(),
                    found: refs.len(),
                });
            }
            let units: Vec<FocusUnit> = refs
                .into_iter()
                .zip(batch_targets.iter())
                .enumerate()
                .map(|(offset, (workspace, target))| FocusUnit {
                    sequence_index: range.start + offset,
                    workspace,
                    target: target.clone(),
                })
                .collect();

            pool.set_batch(batch);
            let output = pool.run(
                units,
                self.instrument.clone(),
                grouping.clone(),
                writer.clone(),
            );
            if output.abandoned_workers > 0 {
                log::error!(
                    "Batch {batch} of run {run_number} lost {} workers; re-chop targets {:?} to complete it",
                    output.abandoned_workers,
                    range
                );
            }

            // Written in ascending sequence order
            let n_buffers = output.buffers.len().max(1) as f32;
            for (written, (index, buffer)) in output.buffers.iter().enumerate() {
                let sequence = index + start_index;
                let path = self.config.get_gsas_path(sequence);
                write_gsas_file(&path, &buffer.text)?;
                self.index.insert(ChopEntry {
                    run_number,
                    sequence,
                    workspace_ref: buffer.workspace.clone(),
                    source_event_file: Some(self.config.event_file.clone()),
                    output_file: Some(path.clone()),
                });
                report.written.push(path);
                self.send_status((written + 1) as f32 / n_buffers, batch, BarColor::GREEN);
            }
            for unit in output.skipped {
                self.index.insert(ChopEntry {
                    run_number,
                    sequence: unit.sequence_index + start_index,
                    workspace_ref: WorkspaceRef::empty(),
                    source_event_file: Some(self.config.event_file.clone()),
                    output_file: None,
                });
                report.skipped.push(unit.target);
            }
            report.failures.extend(output.failures);
            report.abandoned_workers += output.abandoned_workers;
        }
        Ok(())
    }
}
