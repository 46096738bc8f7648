use fxhash::FxHashMap;
use ndarray::Array1;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use super::event_file::{Event, EventFile, SampleLog};
use super::{Instrument, LogDirection, RunMetadata, Unit, WorkspaceRef};
use crate::binning::find_bin;
use crate::calibration::Calibration;
use crate::error::InstrumentError;
use crate::grouping::{BankGeometry, Grouping};
use crate::pattern::{FocusedBank, FocusedPattern};
use crate::splitter::SplitterSet;

#[derive(Debug, Clone)]
enum WorkspaceData {
    /// Raw events. The `tof` field of each event is in `unit`.
    Events {
        events: Vec<Event>,
        unit: Unit,
        calibration: Option<Arc<Calibration>>,
    },
    /// Focused histograms. Bank edges are in `unit`.
    Focused {
        banks: Vec<FocusedBank>,
        bank_difc: Vec<f64>,
        unit: Unit,
    },
}

#[derive(Debug, Clone)]
struct Workspace {
    metadata: RunMetadata,
    logs: Arc<Vec<SampleLog>>,
    data: WorkspaceData,
}

/// EventStore is an in-memory Instrument that holds named event workspaces.
///
/// Workspaces are taken out of the store while they are being modified, so workers
/// operating on different workspaces never wait on each other for the duration of a
/// focus.
#[derive(Debug, Default)]
pub struct EventStore {
    workspaces: RwLock<FxHashMap<String, Workspace>>,
    counter: AtomicUsize,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the contents of an event file under the given name
    pub fn insert_event_file(
        &self,
        name: &str,
        file: EventFile,
    ) -> Result<WorkspaceRef, InstrumentError> {
        let workspace = Workspace {
            metadata: file.metadata,
            logs: Arc::new(file.logs),
            data: WorkspaceData::Events {
                events: file.events,
                unit: Unit::TOF,
                calibration: None,
            },
        };
        self.put(self.unique_name(name)?, workspace)
    }

    pub fn contains(&self, workspace: &WorkspaceRef) -> bool {
        match self.workspaces.read() {
            Ok(map) => map.contains_key(workspace.as_str()),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        match self.workspaces.read() {
            Ok(map) => map.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events held by an event workspace
    pub fn event_count(&self, workspace: &WorkspaceRef) -> Result<usize, InstrumentError> {
        let map = self
            .workspaces
            .read()
            .map_err(|_| InstrumentError::PoisonedStore)?;
        match map.get(workspace.as_str()) {
            Some(Workspace {
                data: WorkspaceData::Events { events, .. },
                ..
            }) => Ok(events.len()),
            Some(_) => Err(InstrumentError::WrongWorkspaceKind(
                workspace.to_string(),
                "expected an event workspace",
            )),
            None => Err(InstrumentError::NoWorkspace(workspace.to_string())),
        }
    }

    fn unique_name(&self, base: &str) -> Result<String, InstrumentError> {
        let map = self
            .workspaces
            .read()
            .map_err(|_| InstrumentError::PoisonedStore)?;
        if !map.contains_key(base) {
            return Ok(base.to_string());
        }
        loop {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let candidate = format!("{base}_{n}");
            if !map.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    fn put(&self, name: String, workspace: Workspace) -> Result<WorkspaceRef, InstrumentError> {
        let mut map = self
            .workspaces
            .write()
            .map_err(|_| InstrumentError::PoisonedStore)?;
        let ws_ref = WorkspaceRef::new(&name);
        map.insert(name, workspace);
        Ok(ws_ref)
    }

    fn take(&self, workspace: &WorkspaceRef) -> Result<Workspace, InstrumentError> {
        let mut map = self
            .workspaces
            .write()
            .map_err(|_| InstrumentError::PoisonedStore)?;
        map.remove(workspace.as_str())
            .ok_or_else(|| InstrumentError::NoWorkspace(workspace.to_string()))
    }

    /// Take a workspace out, modify it, and put it back even if the modification failed.
    fn modify<F>(&self, workspace: &WorkspaceRef, f: F) -> Result<(), InstrumentError>
    where
        F: FnOnce(&mut Workspace) -> Result<(), InstrumentError>,
    {
        let mut ws = self.take(workspace)?;
        let result = f(&mut ws);
        self.put(workspace.to_string(), ws)?;
        result
    }

    fn with_workspace<T, F>(&self, workspace: &WorkspaceRef, f: F) -> Result<T, InstrumentError>
    where
        F: FnOnce(&Workspace) -> Result<T, InstrumentError>,
    {
        let map = self
            .workspaces
            .read()
            .map_err(|_| InstrumentError::PoisonedStore)?;
        match map.get(workspace.as_str()) {
            Some(ws) => f(ws),
            None => Err(InstrumentError::NoWorkspace(workspace.to_string())),
        }
    }
}

/// Convert raw events between TOF and d-spacing using the pixel DIFC
fn convert_events(
    events: &[Event],
    calibration: &Calibration,
    to: Unit,
) -> Result<Vec<Event>, InstrumentError> {
    events
        .iter()
        .map(|event| {
            let difc = calibration
                .get_difc(event.pixel)
                .ok_or(InstrumentError::UncalibratedPixel(event.pixel))?;
            let tof = match to {
                Unit::DSpacing => event.tof / difc,
                Unit::TOF => event.tof * difc,
            };
            Ok(Event { tof, ..*event })
        })
        .collect()
}

fn split_events(
    events: &[Event],
    splitters: &SplitterSet,
    n_targets: usize,
) -> Vec<Vec<Event>> {
    let targets = splitters.targets();
    let sorted = splitters.sorted_segments();
    let target_index: Vec<usize> = sorted
        .iter()
        .map(|seg| targets.binary_search(seg.target()).unwrap_or(0))
        .collect();
    let max_duration = sorted.iter().map(|seg| seg.duration()).fold(0.0, f64::max);

    let mut buckets: Vec<Vec<Event>> = vec![Vec::new(); n_targets];
    for event in events.iter() {
        let t = event.pulse_time;
        let idx = sorted.partition_point(|seg| seg.start() <= t);
        for j in (0..idx).rev() {
            let seg = &sorted[j];
            if seg.start() < t - max_duration {
                break;
            }
            if seg.contains(t) {
                buckets[target_index[j]].push(*event);
                if !splitters.is_overlapping() {
                    break;
                }
            }
        }
    }
    buckets
}

impl Instrument for EventStore {
    fn load_event_file(&self, path: &Path) -> Result<WorkspaceRef, InstrumentError> {
        if !path.exists() {
            return Err(InstrumentError::BadFilePath(path.to_path_buf()));
        }
        let file = EventFile::read(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| String::from("events"));
        log::info!(
            "Loaded {} events from {}",
            file.events.len(),
            path.to_string_lossy()
        );
        self.insert_event_file(&name, file)
    }

    fn align_detectors(
        &self,
        workspace: &WorkspaceRef,
        calibration: &Calibration,
    ) -> Result<(), InstrumentError> {
        let shared = Arc::new(calibration.clone());
        self.modify(workspace, |ws| match &mut ws.data {
            WorkspaceData::Events {
                calibration: cal, ..
            } => {
                *cal = Some(shared);
                Ok(())
            }
            WorkspaceData::Focused { .. } => Err(InstrumentError::WrongWorkspaceKind(
                workspace.to_string(),
                "cannot align a focused workspace",
            )),
        })
    }

    fn filter_by_splitters(
        &self,
        workspace: &WorkspaceRef,
        splitters: &SplitterSet,
    ) -> Result<Vec<WorkspaceRef>, InstrumentError> {
        let targets = splitters.targets();
        let chopped = self.with_workspace(workspace, |ws| {
            let rebased;
            let splitters = if splitters.is_relative() {
                splitters
            } else {
                let run_start = ws.metadata.start_epoch_s().ok_or_else(|| {
                    InstrumentError::WrongWorkspaceKind(
                        workspace.to_string(),
                        "absolute splitter times need a known run start",
                    )
                })?;
                rebased = splitters.to_relative(run_start);
                &rebased
            };
            let (events, unit, calibration) = match &ws.data {
                WorkspaceData::Events {
                    events,
                    unit,
                    calibration,
                } => (events, *unit, calibration.clone()),
                WorkspaceData::Focused { .. } => {
                    return Err(InstrumentError::WrongWorkspaceKind(
                        workspace.to_string(),
                        "only event workspaces can be filtered",
                    ))
                }
            };
            let buckets = split_events(events, splitters, targets.len());
            let mut chopped = Vec::with_capacity(targets.len());
            for (target, bucket) in targets.iter().zip(buckets) {
                if bucket.is_empty() {
                    chopped.push(None);
                    continue;
                }
                let segs: Vec<_> = splitters
                    .segments()
                    .iter()
                    .filter(|seg| seg.target() == target)
                    .collect();
                let first = segs.iter().map(|s| s.start()).fold(f64::INFINITY, f64::min);
                let mut last = segs.iter().map(|s| s.stop()).fold(0.0, f64::max);
                if let Some(duration) = ws.metadata.duration_s {
                    last = last.min(duration);
                }
                let metadata = RunMetadata {
                    start_epoch_ns: ws
                        .metadata
                        .start_epoch_ns
                        .map(|ns| ns + (first * 1.0e9).round() as i64),
                    duration_s: ws.metadata.duration_s.map(|_| (last - first).max(0.0)),
                    title: ws.metadata.title.clone(),
                };
                let name = if splitters.tag.is_empty() {
                    format!("{workspace}_{target}")
                } else {
                    format!("{workspace}_{}_{target}", splitters.tag)
                };
                chopped.push(Some((
                    name,
                    Workspace {
                        metadata,
                        logs: ws.logs.clone(),
                        data: WorkspaceData::Events {
                            events: bucket,
                            unit,
                            calibration: calibration.clone(),
                        },
                    },
                )));
            }
            Ok(chopped)
        })?;

        let mut refs = Vec::with_capacity(chopped.len());
        for item in chopped {
            match item {
                Some((name, ws)) => refs.push(self.put(self.unique_name(&name)?, ws)?),
                None => refs.push(WorkspaceRef::empty()),
            }
        }
        Ok(refs)
    }

    fn convert_units(&self, workspace: &WorkspaceRef, to: Unit) -> Result<(), InstrumentError> {
        self.modify(workspace, |ws| {
            match &mut ws.data {
                WorkspaceData::Events {
                    events,
                    unit,
                    calibration,
                } => {
                    if *unit == to {
                        return Ok(());
                    }
                    let cal = calibration.as_ref().ok_or(InstrumentError::WrongWorkspaceKind(
                        workspace.to_string(),
                        "detectors must be aligned before converting units",
                    ))?;
                    *events = convert_events(events, cal, to)?;
                    *unit = to;
                }
                WorkspaceData::Focused {
                    banks,
                    bank_difc,
                    unit,
                } => {
                    if *unit == to {
                        return Ok(());
                    }
                    for (bank, difc) in banks.iter_mut().zip(bank_difc.iter()) {
                        match to {
                            Unit::TOF => bank.tof.mapv_inplace(|x| x * difc),
                            Unit::DSpacing => bank.tof.mapv_inplace(|x| x / difc),
                        }
                    }
                    *unit = to;
                }
            }
            Ok(())
        })
    }

    fn diffraction_focus(
        &self,
        workspace: &WorkspaceRef,
        grouping: &Grouping,
        target_unit: Unit,
    ) -> Result<(), InstrumentError> {
        if target_unit != Unit::DSpacing {
            return Err(InstrumentError::InvalidGrouping(String::from(
                "focusing is only supported in d-spacing",
            )));
        }
        let edges = grouping
            .d_binning
            .edges()
            .map_err(|e| InstrumentError::InvalidGrouping(e.to_string()))?;
        let n_bins = edges.len() - 1;

        self.modify(workspace, |ws| {
            let events = match &ws.data {
                WorkspaceData::Events { events, unit, .. } if *unit == target_unit => events,
                _ => {
                    return Err(InstrumentError::WrongWorkspaceKind(
                        workspace.to_string(),
                        "focusing requires events in the target unit",
                    ))
                }
            };

            let mut counts: Vec<Array1<f64>> = vec![Array1::zeros(n_bins); grouping.banks.len()];
            for event in events.iter() {
                let bank_idx = match grouping.banks.iter().position(|b| b.contains(event.pixel)) {
                    Some(idx) => idx,
                    None => continue, // Pixel is not part of any bank
                };
                if let Some(bin) = find_bin(edges.view(), event.tof) {
                    counts[bank_idx][bin] += 1.0;
                }
            }

            let mut banks = Vec::with_capacity(grouping.banks.len());
            for (group, bank_counts) in grouping.banks.iter().zip(counts) {
                let errors = bank_counts.mapv(f64::sqrt);
                let bank = FocusedBank::new(group.bank_id, edges.clone(), bank_counts, errors)
                    .map_err(|e| InstrumentError::InvalidGrouping(e.to_string()))?;
                banks.push(bank);
            }
            ws.data = WorkspaceData::Focused {
                banks,
                bank_difc: grouping.banks.iter().map(|b| b.difc).collect(),
                unit: target_unit,
            };
            Ok(())
        })
    }

    fn edit_instrument_geometry(
        &self,
        workspace: &WorkspaceRef,
        geometry: &[BankGeometry],
    ) -> Result<(), InstrumentError> {
        self.modify(workspace, |ws| {
            let banks = match &mut ws.data {
                WorkspaceData::Focused { banks, .. } => banks,
                WorkspaceData::Events { .. } => {
                    return Err(InstrumentError::Geometry(format!(
                        "workspace {workspace} is not focused"
                    )))
                }
            };
            if banks.len() != geometry.len() {
                return Err(InstrumentError::Geometry(format!(
                    "{} geometry entries given for {} banks",
                    geometry.len(),
                    banks.len()
                )));
            }
            let mut matched = Vec::with_capacity(banks.len());
            for bank in banks.iter() {
                match geometry.iter().find(|g| g.bank_id == bank.bank_id) {
                    Some(g) => matched.push(g.clone()),
                    None => {
                        return Err(InstrumentError::Geometry(format!(
                            "no geometry given for bank {}",
                            bank.bank_id
                        )))
                    }
                }
            }
            for (bank, g) in banks.iter_mut().zip(matched) {
                bank.geometry = Some(g);
            }
            Ok(())
        })
    }

    fn scan_log_crossings(
        &self,
        workspace: &WorkspaceRef,
        log_name: &str,
        threshold: f64,
        direction: LogDirection,
    ) -> Result<Vec<(f64, f64)>, InstrumentError> {
        self.with_workspace(workspace, |ws| {
            let log = ws
                .logs
                .iter()
                .find(|l| l.name == log_name)
                .ok_or_else(|| {
                    InstrumentError::NoSampleLog(workspace.to_string(), log_name.to_string())
                })?;
            let n = log.times.len();
            let run_end = match ws.metadata.duration_s {
                Some(d) => d,
                None => log.times.last().copied().unwrap_or(0.0),
            };

            let mut windows: Vec<(f64, f64)> = Vec::new();
            for i in 0..n {
                let value = log.values[i];
                let rising = i == 0 || value >= log.values[i - 1];
                let falling = i == 0 || value <= log.values[i - 1];
                let eligible = match direction {
                    LogDirection::Both => true,
                    LogDirection::Increase => rising,
                    LogDirection::Decrease => falling,
                };
                if !eligible || value < threshold {
                    continue;
                }
                let start = log.times[i];
                let stop = if i + 1 < n { log.times[i + 1] } else { run_end };
                if stop <= start {
                    continue;
                }
                match windows.last_mut() {
                    Some(last) if last.1 >= start => last.1 = stop,
                    _ => windows.push((start, stop)),
                }
            }
            Ok(windows)
        })
    }

    fn get_run_metadata(&self, workspace: &WorkspaceRef) -> Result<RunMetadata, InstrumentError> {
        self.with_workspace(workspace, |ws| Ok(ws.metadata.clone()))
    }

    fn extract_pattern(&self, workspace: &WorkspaceRef) -> Result<FocusedPattern, InstrumentError> {
        self.with_workspace(workspace, |ws| match &ws.data {
            WorkspaceData::Focused {
                banks,
                unit: Unit::TOF,
                ..
            } => Ok(FocusedPattern {
                title: ws.metadata.title.clone(),
                metadata: ws.metadata.clone(),
                banks: banks.clone(),
            }),
            _ => Err(InstrumentError::WrongWorkspaceKind(
                workspace.to_string(),
                "expected a focused workspace in TOF",
            )),
        })
    }

    fn delete_workspace(&self, workspace: &WorkspaceRef) {
        if let Ok(mut map) = self.workspaces.write() {
            map.remove(workspace.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splitter::TimeSegment;

    fn make_store() -> (EventStore, WorkspaceRef) {
        let events = (0..100)
            .map(|i| Event {
                pixel: (i % 2) as u32 * 4000,
                pulse_time: i as f64,
                tof: 20000.0,
            })
            .collect();
        let file = EventFile {
            metadata: RunMetadata {
                start_epoch_ns: Some(1_000_000_000_000_000_000),
                duration_s: Some(100.0),
                title: String::from("test run"),
            },
            events,
            logs: vec![SampleLog::new(
                "temp",
                &[(0.0, 10.0), (20.0, 30.0), (40.0, 20.0), (60.0, 40.0), (80.0, 5.0)],
            )],
        };
        let store = EventStore::new();
        let ws = store.insert_event_file("VULCAN_1", file).unwrap();
        (store, ws)
    }

    #[test]
    fn test_filter_sentinel_for_empty_target() {
        let (store, ws) = make_store();
        let splitters = SplitterSet::new(
            "t",
            vec![
                TimeSegment::new(0.0, 10.0, 0.into()).unwrap(),
                TimeSegment::new(200.0, 300.0, 1.into()).unwrap(),
                TimeSegment::new(50.0, 60.0, 2.into()).unwrap(),
            ],
        )
        .unwrap();
        let chopped = store.filter_by_splitters(&ws, &splitters).unwrap();
        assert_eq!(chopped.len(), 3);
        assert_eq!(store.event_count(&chopped[0]).unwrap(), 10);
        assert!(chopped[1].is_empty());
        assert_eq!(store.event_count(&chopped[2]).unwrap(), 10);
        let meta = store.get_run_metadata(&chopped[2]).unwrap();
        assert_eq!(meta.start_epoch_ns, Some(1_000_000_050_000_000_000));
        assert_eq!(meta.duration_s, Some(10.0));
    }

    #[test]
    fn test_focus_pipeline() {
        let (store, ws) = make_store();
        let grouping = Grouping::default();
        let cal = Calibration::nominal(&grouping);
        store.align_detectors(&ws, &cal).unwrap();
        store.convert_units(&ws, Unit::DSpacing).unwrap();
        store.diffraction_focus(&ws, &grouping, Unit::DSpacing).unwrap();
        store.convert_units(&ws, Unit::TOF).unwrap();
        store.edit_instrument_geometry(&ws, &grouping.geometry()).unwrap();
        let pattern = store.extract_pattern(&ws).unwrap();
        assert_eq!(pattern.banks.len(), 3);
        assert_eq!(pattern.bank(1).unwrap().counts.sum(), 50.0);
        assert_eq!(pattern.bank(2).unwrap().counts.sum(), 50.0);
        assert_eq!(pattern.bank(3).unwrap().counts.sum(), 0.0);
        assert!((pattern.bank(1).unwrap().tof_min() - 0.3 * 16372.0).abs() < 1e-6);
    }

    #[test]
    fn test_convert_requires_alignment() {
        let (store, ws) = make_store();
        assert!(store.convert_units(&ws, Unit::DSpacing).is_err());
        // The workspace must survive a failed modification
        assert!(store.contains(&ws));
    }

    #[test]
    fn test_geometry_mismatch_is_error() {
        let (store, ws) = make_store();
        let grouping = Grouping::default();
        store.align_detectors(&ws, &Calibration::nominal(&grouping)).unwrap();
        store.convert_units(&ws, Unit::DSpacing).unwrap();
        store.diffraction_focus(&ws, &grouping, Unit::DSpacing).unwrap();
        let geometry = grouping.geometry();
        assert!(store.edit_instrument_geometry(&ws, &geometry[..1]).is_err());
    }

    #[test]
    fn test_scan_log_crossings() {
        let (store, ws) = make_store();
        let both = store
            .scan_log_crossings(&ws, "temp", 20.0, LogDirection::Both)
            .unwrap();
        assert_eq!(both, vec![(20.0, 80.0)]);
        let rising = store
            .scan_log_crossings(&ws, "temp", 20.0, LogDirection::Increase)
            .unwrap();
        assert_eq!(rising, vec![(20.0, 40.0), (60.0, 80.0)]);
        assert!(matches!(
            store.scan_log_crossings(&ws, "pressure", 1.0, LogDirection::Both),
            Err(InstrumentError::NoSampleLog(..))
        ));
    }
}
