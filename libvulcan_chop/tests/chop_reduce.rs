use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libvulcan_chop::binning::{BinningGroup, LogBinning};
use libvulcan_chop::calibration::Calibration;
use libvulcan_chop::chop_index::{lookup_path, ChopIndex, ChopState};
use libvulcan_chop::config::{Config, SplitterSource};
use libvulcan_chop::error::{InstrumentError, OrchestratorError};
use libvulcan_chop::grouping::{BankGeometry, Grouping};
use libvulcan_chop::instrument::event_file::{Event, EventFile};
use libvulcan_chop::instrument::event_store::EventStore;
use libvulcan_chop::instrument::{Instrument, LogDirection, RunMetadata, Unit, WorkspaceRef};
use libvulcan_chop::pattern::FocusedPattern;
use libvulcan_chop::orchestrator::ChopReduceOrchestrator;
use libvulcan_chop::splitter::{SplitterSet, TargetId, TimeSegment};
use libvulcan_chop::splitter_builder::to_text;

const RUN: i32 = 164960;
const RUN_START_NS: i64 = 1_600_000_000_000_000_000;

/// 300 s of events, one every 0.1 s, cycling over the three banks
fn write_event_file(dir: &Path) -> PathBuf {
    let events = (0..3000)
        .map(|i| Event {
            pixel: (i % 3) * 3234,
            pulse_time: (i as f64 + 0.5) * 0.1,
            tof: 20000.0 + (i % 7) as f64 * 1000.0,
        })
        .collect();
    let file = EventFile {
        metadata: RunMetadata {
            start_epoch_ns: Some(RUN_START_NS),
            duration_s: Some(300.0),
            title: String::from("VULCAN_164960 Inconel 718 ramp"),
        },
        events,
        logs: vec![],
    };
    let path = dir.join("VULCAN_164960.vevt");
    file.write(&path).unwrap();
    path
}

/// A config with coarse binning so hundreds of files stay small
fn make_config(dir: &Path, splitter: SplitterSource, n_threads: i32) -> Config {
    let output_dir = dir.join("chopped");
    std::fs::create_dir_all(&output_dir).unwrap();
    let mut config = Config {
        run_number: RUN,
        ipts: 22752,
        event_file: write_event_file(dir),
        output_dir,
        splitter,
        n_threads,
        ..Default::default()
    };
    config.grouping.d_binning = LogBinning::new(0.3, 0.1, 5.0).unwrap();
    config.binning = vec![BinningGroup::new(
        LogBinning::new(5000.0, 0.5, 70000.0).unwrap(),
        &[1, 2, 3],
    )];
    config
}

fn splitter_file(dir: &Path, segments: Vec<TimeSegment>) -> SplitterSource {
    let path = dir.join("splitters.txt");
    let set = SplitterSet::new("", segments).unwrap();
    to_text(&set, &path).unwrap();
    SplitterSource::File { path }
}

fn gsas_stems(dir: &Path) -> BTreeSet<usize> {
    dir.read_dir()
        .unwrap()
        .filter_map(|item| {
            let path = item.unwrap().path();
            if path.extension()?.to_str()? != "gda" {
                return None;
            }
            path.file_stem()?.to_str()?.parse().ok()
        })
        .collect()
}

fn run(config: Config) -> Result<libvulcan_chop::orchestrator::ChopReport, OrchestratorError> {
    ChopReduceOrchestrator::new(config, Arc::new(EventStore::new())).run()
}

#[test]
fn three_relative_segments_two_workers() {
    let dir = tempfile::tempdir().unwrap();
    let splitter = splitter_file(
        dir.path(),
        vec![
            TimeSegment::new(0.0, 100.0, TargetId::Int(0)).unwrap(),
            TimeSegment::new(100.0, 200.0, TargetId::Int(1)).unwrap(),
            TimeSegment::new(200.0, 300.0, TargetId::Int(2)).unwrap(),
        ],
    );
    let config = make_config(dir.path(), splitter, 2);
    let output_dir = config.output_dir.clone();

    let report = run(config).unwrap();
    assert!(report.is_success());
    assert_eq!(report.n_batches, 1);
    assert_eq!(report.written.len(), 3);
    assert_eq!(gsas_stems(&output_dir), BTreeSet::from([1, 2, 3]));

    let lookup = std::fs::read_to_string(lookup_path(RUN, &output_dir)).unwrap();
    assert_eq!(lookup.lines().count(), 3);
    assert!(lookup.lines().next().unwrap().ends_with("VULCAN_164960_0"));

    let gsas = std::fs::read_to_string(output_dir.join("1.gda")).unwrap();
    assert!(gsas.starts_with("VULCAN_164960 Inconel 718 ramp"));
    assert!(gsas.contains("#Pulsestart:    968848000000000000"));
    assert!(gsas.contains("#Pulsestop:     968848100000000000"));
    assert_eq!(gsas.lines().filter(|l| l.starts_with("BANK")).count(), 3);
    assert!(gsas.lines().all(|l| l.len() >= 80));
}

#[test]
fn zero_event_segment_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let splitter = splitter_file(
        dir.path(),
        vec![
            TimeSegment::new(0.0, 100.0, TargetId::Int(0)).unwrap(),
            TimeSegment::new(400.0, 500.0, TargetId::Int(1)).unwrap(),
            TimeSegment::new(100.0, 200.0, TargetId::Int(2)).unwrap(),
        ],
    );
    let config = make_config(dir.path(), splitter, 2);
    let output_dir = config.output_dir.clone();

    let report = run(config).unwrap();
    assert!(report.is_success());
    assert_eq!(report.skipped, vec![TargetId::Int(1)]);
    assert_eq!(gsas_stems(&output_dir), BTreeSet::from([1, 3]));
    let lookup = std::fs::read_to_string(lookup_path(RUN, &output_dir)).unwrap();
    assert_eq!(lookup.lines().count(), 2);
}

#[test]
fn many_targets_are_chopped_in_batches() {
    let dir = tempfile::tempdir().unwrap();
    let splitter = SplitterSource::Time {
        start: None,
        stop: None,
        step: Some(0.6),
    };
    let mut config = make_config(dir.path(), splitter, 4);
    config.memory_ceiling = 200;
    let output_dir = config.output_dir.clone();

    let report = run(config).unwrap();
    assert!(report.is_success());
    assert_eq!(report.n_batches, 3);
    assert_eq!(report.written.len(), 500);
    assert_eq!(gsas_stems(&output_dir), (1..=500).collect::<BTreeSet<usize>>());
    let lookup = std::fs::read_to_string(lookup_path(RUN, &output_dir)).unwrap();
    assert_eq!(lookup.lines().count(), 500);
}

#[test]
fn absolute_splitter_times_are_rebased() {
    let dir = tempfile::tempdir().unwrap();
    let start = RUN_START_NS as f64 * 1.0e-9;
    let splitter = splitter_file(
        dir.path(),
        vec![
            TimeSegment::new(start, start + 150.0, TargetId::Int(0)).unwrap(),
            TimeSegment::new(start + 150.0, start + 300.0, TargetId::Int(1)).unwrap(),
        ],
    );
    let config = make_config(dir.path(), splitter, 1);
    let output_dir = config.output_dir.clone();

    let report = run(config).unwrap();
    assert!(report.is_success());
    assert_eq!(gsas_stems(&output_dir), BTreeSet::from([1, 2]));
}

#[test]
fn rechop_recovers_previous_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let splitter = SplitterSource::Time {
        start: Some(0.0),
        stop: Some(300.0),
        step: Some(100.0),
    };
    let config = make_config(dir.path(), splitter, 2);
    let output_dir = config.output_dir.clone();
    run(config.clone()).unwrap();

    let mut again = ChopReduceOrchestrator::new(config, Arc::new(EventStore::new()));
    again.run().unwrap();
    assert_eq!(again.index().state(RUN), ChopState::Recovered(vec![1, 2, 3]));

    // Without the lookup file the reduced files are found by name
    std::fs::remove_file(lookup_path(RUN, &output_dir)).unwrap();
    let mut index = ChopIndex::new();
    assert_eq!(
        index.recover(RUN, &output_dir).unwrap(),
        ChopState::Recovered(vec![1, 2, 3])
    );
}

#[test]
fn fatal_conditions() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = make_config(dir.path(), SplitterSource::default(), 1);

    let mut missing_events = config.clone();
    missing_events.event_file = dir.path().join("nope.vevt");
    assert!(matches!(
        run(missing_events),
        Err(OrchestratorError::MissingEventFile(_))
    ));

    let mut missing_output = config.clone();
    missing_output.output_dir = dir.path().join("nowhere");
    assert!(matches!(
        run(missing_output),
        Err(OrchestratorError::MissingOutputDir(_))
    ));

    config.splitter = SplitterSource::Manual { marks: vec![5.0] };
    assert!(matches!(run(config), Err(OrchestratorError::NoSegments)));
}

/// Loses the last chopped workspace of every split
struct LossySplitter {
    store: EventStore,
    /// Made a directory during the split so the lookup export fails afterwards
    block_lookup: Option<PathBuf>,
}

impl Instrument for LossySplitter {
    fn load_event_file(&self, path: &Path) -> Result<WorkspaceRef, InstrumentError> {
        self.store.load_event_file(path)
    }
    fn align_detectors(
        &self,
        workspace: &WorkspaceRef,
        calibration: &Calibration,
    ) -> Result<(), InstrumentError> {
        self.store.align_detectors(workspace, calibration)
    }
    fn filter_by_splitters(
        &self,
        workspace: &WorkspaceRef,
        splitters: &SplitterSet,
    ) -> Result<Vec<WorkspaceRef>, InstrumentError> {
        let mut refs = self.store.filter_by_splitters(workspace, splitters)?;
        if let Some(lost) = refs.pop() {
            self.store.delete_workspace(&lost);
        }
        if let Some(path) = &self.block_lookup {
            std::fs::create_dir_all(path)?;
        }
        Ok(refs)
    }
    fn convert_units(&self, workspace: &WorkspaceRef, unit: Unit) -> Result<(), InstrumentError> {
        self.store.convert_units(workspace, unit)
    }
    fn diffraction_focus(
        &self,
        workspace: &WorkspaceRef,
        grouping: &Grouping,
        target_unit: Unit,
    ) -> Result<(), InstrumentError> {
        self.store.diffraction_focus(workspace, grouping, target_unit)
    }
    fn edit_instrument_geometry(
        &self,
        workspace: &WorkspaceRef,
        geometry: &[BankGeometry],
    ) -> Result<(), InstrumentError> {
        self.store.edit_instrument_geometry(workspace, geometry)
    }
    fn scan_log_crossings(
        &self,
        workspace: &WorkspaceRef,
        log_name: &str,
        threshold: f64,
        direction: LogDirection,
    ) -> Result<Vec<(f64, f64)>, InstrumentError> {
        self.store
            .scan_log_crossings(workspace, log_name, threshold, direction)
    }
    fn get_run_metadata(&self, workspace: &WorkspaceRef) -> Result<RunMetadata, InstrumentError> {
        self.store.get_run_metadata(workspace)
    }
    fn extract_pattern(&self, workspace: &WorkspaceRef) -> Result<FocusedPattern, InstrumentError> {
        self.store.extract_pattern(workspace)
    }
    fn delete_workspace(&self, workspace: &WorkspaceRef) {
        self.store.delete_workspace(workspace)
    }
}

fn three_segment_config(dir: &Path) -> Config {
    let splitter = SplitterSource::Time {
        start: Some(0.0),
        stop: Some(300.0),
        step: Some(100.0),
    };
    make_config(dir, splitter, 2)
}

#[test]
fn lost_chopped_workspace_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = three_segment_config(dir.path());
    let output_dir = config.output_dir.clone();
    let instrument = Arc::new(LossySplitter {
        store: EventStore::new(),
        block_lookup: None,
    });

    let result = ChopReduceOrchestrator::new(config, instrument.clone()).run();
    assert!(matches!(
        result,
        Err(OrchestratorError::SplitCountMismatch {
            expected: 3,
            found: 2
        })
    ));
    assert!(gsas_stems(&output_dir).is_empty());
    assert!(lookup_path(RUN, &output_dir).is_file());
    // Nothing is left behind in the store
    assert!(instrument.store.is_empty());
}

#[test]
fn batch_error_survives_failed_lookup_export() {
    let dir = tempfile::tempdir().unwrap();
    let config = three_segment_config(dir.path());
    let instrument = Arc::new(LossySplitter {
        store: EventStore::new(),
        block_lookup: Some(lookup_path(RUN, &config.output_dir)),
    });

    let result = ChopReduceOrchestrator::new(config, instrument).run();
    assert!(matches!(
        result,
        Err(OrchestratorError::SplitCountMismatch { .. })
    ));
}
