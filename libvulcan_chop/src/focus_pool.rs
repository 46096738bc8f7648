use fxhash::FxHashSet;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::constants::{GSAS_EXTENSION, JOIN_POLL_MILLIS};
use super::error::FocusPoolError;
use super::grouping::{BankGeometry, Grouping};
use super::gsas_writer::GsasWriter;
use super::instrument::{Instrument, Unit, WorkspaceRef};
use super::partition::WorkerPartitioner;
use super::splitter::TargetId;
use super::worker_status::{BarColor, WorkerStatus};

/// One chopped workspace waiting to be focused. An empty workspace marks a chopped
/// interval that received no events.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusUnit {
    /// Position of the unit in the whole run, across batches
    pub sequence_index: usize,
    pub workspace: WorkspaceRef,
    pub target: TargetId,
}

/// Rendered GSAS text of one unit, waiting to be written
#[derive(Debug, Clone, PartialEq)]
pub struct GsasBuffer {
    pub sequence_index: usize,
    pub workspace: WorkspaceRef,
    pub target: TargetId,
    pub file_name: String,
    pub text: String,
}

/// A unit that did not produce GSAS text
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerFailure {
    pub sequence_index: usize,
    pub workspace: WorkspaceRef,
    pub reason: String,
}

/// Everything the pool produced once the join barrier has passed
#[derive(Debug, Default)]
pub struct FocusOutput {
    /// Keyed by sequence index
    pub buffers: BTreeMap<usize, GsasBuffer>,
    pub failures: Vec<WorkerFailure>,
    /// Zero-event units, never handed to the Instrument
    pub skipped: Vec<FocusUnit>,
    pub abandoned_workers: usize,
}

impl FocusOutput {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.abandoned_workers == 0
    }
}

/// Written once per unit by the worker that owns it, read after the join
#[derive(Debug, Default)]
struct SharedOutput {
    buffers: Mutex<BTreeMap<usize, GsasBuffer>>,
    failures: Mutex<Vec<WorkerFailure>>,
}

impl SharedOutput {
    fn push_buffer(&self, buffer: GsasBuffer) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|p| p.into_inner());
        buffers.insert(buffer.sequence_index, buffer);
    }

    fn push_failure(&self, failure: WorkerFailure) {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        failures.push(failure);
    }
}

/// Read-only inputs shared by every worker
struct WorkerContext {
    instrument: Arc<dyn Instrument>,
    grouping: Arc<Grouping>,
    geometry: Arc<Vec<BankGeometry>>,
    writer: Arc<GsasWriter>,
    output: Arc<SharedOutput>,
    cancel: Arc<AtomicBool>,
    file_index_start: usize,
}

/// The per unit pipeline: d-spacing, focus, back to TOF, geometry, GSAS text
fn focus_unit(
    ctx: &WorkerContext,
    unit: &FocusUnit,
    file_name: &str,
) -> Result<String, FocusPoolError> {
    let ws = &unit.workspace;
    ctx.instrument.convert_units(ws, Unit::DSpacing)?;
    ctx.instrument
        .diffraction_focus(ws, &ctx.grouping, Unit::DSpacing)?;
    ctx.instrument.convert_units(ws, Unit::TOF)?;
    if let Err(e) = ctx.instrument.edit_instrument_geometry(ws, &ctx.geometry) {
        log::warn!("Could not attach instrument geometry to {ws}: {e}");
    }
    let pattern = ctx.instrument.extract_pattern(ws)?;
    Ok(ctx.writer.render(&pattern, file_name)?)
}

fn send_status(tx: &Option<Sender<WorkerStatus>>, status: WorkerStatus) {
    if let Some(tx) = tx {
        // The receiver going away only means nobody is watching
        let _ = tx.send(status);
    }
}

/// Body of one worker thread. Units are processed in order until done or cancelled.
fn run_worker(
    ctx: WorkerContext,
    units: Vec<FocusUnit>,
    worker_id: usize,
    status: WorkerStatus,
    tx: Option<Sender<WorkerStatus>>,
) {
    let total = units.len().max(1) as f32;
    let mut color = BarColor::CYAN;
    send_status(&tx, WorkerStatus { progress: 0.0, worker_id, color, ..status.clone() });
    for (done, unit) in units.iter().enumerate() {
        if ctx.cancel.load(Ordering::Relaxed) {
            log::warn!("Focus worker {worker_id} cancelled with {} units left", units.len() - done);
            return;
        }
        if unit.workspace.is_empty() {
            log::warn!(
                "PartialOutputWarning: chop interval {} (target {}) has no events, no output is produced",
                unit.sequence_index,
                unit.target
            );
            continue;
        }

        let file_name = format!(
            "{}.{GSAS_EXTENSION}",
            unit.sequence_index + ctx.file_index_start
        );
        match focus_unit(&ctx, unit, &file_name) {
            Ok(text) => ctx.output.push_buffer(GsasBuffer {
                sequence_index: unit.sequence_index,
                workspace: unit.workspace.clone(),
                target: unit.target.clone(),
                file_name,
                text,
            }),
            Err(e) => {
                log::error!(
                    "Focus worker {worker_id} failed on unit {} ({}): {e}",
                    unit.sequence_index,
                    unit.workspace
                );
                color = BarColor::RED;
                ctx.output.push_failure(WorkerFailure {
                    sequence_index: unit.sequence_index,
                    workspace: unit.workspace.clone(),
                    reason: e.to_string(),
                });
            }
        }
        ctx.instrument.delete_workspace(&unit.workspace);
        send_status(
            &tx,
            WorkerStatus {
                progress: (done + 1) as f32 / total,
                worker_id,
                color,
                ..status.clone()
            },
        );
    }
}

/// FocusWorkerPool focuses chopped workspaces on a fixed number of OS threads.
///
/// Units are split into contiguous static partitions, one thread per non-empty
/// partition. The pool then waits for every thread up to the join timeout; threads still
/// running after that are told to stop and abandoned.
#[derive(Debug, Clone)]
pub struct FocusWorkerPool {
    partitioner: WorkerPartitioner,
    join_timeout: Duration,
    file_index_start: usize,
    run_number: i32,
    batch: usize,
    status_tx: Option<Sender<WorkerStatus>>,
}

impl FocusWorkerPool {
    pub fn new(pool_size: usize, join_timeout: Duration, file_index_start: usize) -> Self {
        Self {
            partitioner: WorkerPartitioner::new(pool_size),
            join_timeout,
            file_index_start,
            run_number: 0,
            batch: 0,
            status_tx: None,
        }
    }

    /// Report progress of every worker over a channel
    pub fn with_progress(mut self, run_number: i32, tx: Sender<WorkerStatus>) -> Self {
        self.run_number = run_number;
        self.status_tx = Some(tx);
        self
    }

    pub fn set_batch(&mut self, batch: usize) {
        self.batch = batch;
    }

    pub fn pool_size(&self) -> usize {
        self.partitioner.pool_size()
    }

    pub fn run(
        &self,
        units: Vec<FocusUnit>,
        instrument: Arc<dyn Instrument>,
        grouping: Arc<Grouping>,
        writer: Arc<GsasWriter>,
    ) -> FocusOutput {
        let skipped: Vec<FocusUnit> = units
            .iter()
            .filter(|u| u.workspace.is_empty())
            .cloned()
            .collect();
        let output = Arc::new(SharedOutput::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let geometry = Arc::new(grouping.geometry());

        let ranges = self.partitioner.partition(units.len());
        let mut pending: Vec<(usize, Range<usize>, JoinHandle<()>)> = Vec::new();
        for (worker_id, range) in ranges.into_iter().enumerate() {
            // Dont make empty workers
            if range.is_empty() {
                continue;
            }
            let ctx = WorkerContext {
                instrument: instrument.clone(),
                grouping: grouping.clone(),
                geometry: geometry.clone(),
                writer: writer.clone(),
                output: output.clone(),
                cancel: cancel.clone(),
                file_index_start: self.file_index_start,
            };
            let subset = units[range.clone()].to_vec();
            let status = WorkerStatus::new(0.0, self.run_number, worker_id, self.batch, BarColor::CYAN);
            let tx = self.status_tx.clone();
            pending.push((
                worker_id,
                range,
                std::thread::spawn(move || run_worker(ctx, subset, worker_id, status, tx)),
            ));
        }
        log::info!(
            "Started {} focus workers for {} units ({} empty)",
            pending.len(),
            units.len(),
            skipped.len()
        );

        // Join barrier
        let deadline = Instant::now() + self.join_timeout;
        let mut lost: Vec<(Range<usize>, &'static str)> = Vec::new();
        let mut abandoned_workers = 0;
        loop {
            let mut running = Vec::with_capacity(pending.len());
            for (worker_id, range, handle) in pending.drain(..) {
                if !handle.is_finished() {
                    running.push((worker_id, range, handle));
                    continue;
                }
                if handle.join().is_err() {
                    log::error!("Focus worker {worker_id} panicked");
                    lost.push((range, "focus worker panicked"));
                }
            }
            pending = running;
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                cancel.store(true, Ordering::Relaxed);
                for (worker_id, range, _) in pending.drain(..) {
                    log::error!(
                        "Focus worker {worker_id} did not finish within {:?} and was abandoned",
                        self.join_timeout
                    );
                    abandoned_workers += 1;
                    lost.push((range, "focus worker abandoned after the join timeout"));
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(JOIN_POLL_MILLIS));
        }

        let buffers = {
            let mut guard = output.buffers.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        let mut failures = {
            let mut guard = output.failures.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };

        // Units owned by a lost worker that never reported count as failures
        let reported: FxHashSet<usize> = failures.iter().map(|f| f.sequence_index).collect();
        for (range, reason) in lost {
            for unit in units[range].iter() {
                if unit.workspace.is_empty()
                    || buffers.contains_key(&unit.sequence_index)
                    || reported.contains(&unit.sequence_index)
                {
                    continue;
                }
                failures.push(WorkerFailure {
                    sequence_index: unit.sequence_index,
                    workspace: unit.workspace.clone(),
                    reason: String::from(reason),
                });
            }
        }
        failures.sort_by_key(|f| f.sequence_index);

        FocusOutput {
            buffers,
            failures,
            skipped,
            abandoned_workers,
        }
    }
}
