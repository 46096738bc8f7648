use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::constants::{GSAS_EXTENSION, LOOKUP_NONE, LOOKUP_SUFFIX};
use super::error::ChopIndexError;
use super::instrument::WorkspaceRef;

/// One chopped unit of a run
#[derive(Debug, Clone, PartialEq)]
pub struct ChopEntry {
    pub run_number: i32,
    /// GSAS sequence number, the basename of the output file
    pub sequence: usize,
    pub workspace_ref: WorkspaceRef,
    pub source_event_file: Option<PathBuf>,
    /// None for units that produced no output
    pub output_file: Option<PathBuf>,
}

/// Where a run is in its chop lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChopState {
    NotChopped,
    /// Sequences produced by this process
    Chopped(Vec<usize>),
    /// Sequences known after reloading a previous chop from disk
    Recovered(Vec<usize>),
}

#[derive(Debug, Clone, Default)]
struct RunRecord {
    entries: BTreeMap<usize, ChopEntry>,
    recovered: bool,
}

/// Path of the lookup file of a run inside an output directory
pub fn lookup_path(run_number: i32, dir: &Path) -> PathBuf {
    dir.join(format!("{run_number}_{LOOKUP_SUFFIX}"))
}

/// Write the lookup file of a run: one `gsas\tsource\tworkspace` line per entry with an
/// output file. Returns the path of the lookup file.
pub fn export_lookup(
    run_number: i32,
    entries: &[ChopEntry],
    dir: &Path,
) -> Result<PathBuf, ChopIndexError> {
    if !dir.exists() {
        return Err(ChopIndexError::BadDirectory(dir.to_path_buf()));
    }
    let path = lookup_path(run_number, dir);
    let mut writer = BufWriter::new(File::create(&path)?);
    let mut n_lines = 0;
    for entry in entries.iter() {
        let output = match &entry.output_file {
            Some(o) => o,
            None => continue,
        };
        let source = entry
            .source_event_file
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| String::from(LOOKUP_NONE));
        writeln!(
            writer,
            "{}\t{}\t{}",
            output.to_string_lossy(),
            source,
            entry.workspace_ref
        )?;
        n_lines += 1;
    }
    writer.flush()?;
    log::info!(
        "Wrote {n_lines} entries for run {run_number} to {}",
        path.to_string_lossy()
    );
    Ok(path)
}

/// The sequence number encoded in a reduced file name, `<sequence>.gda`
fn sequence_of(path: &Path) -> Option<usize> {
    if path.extension()?.to_str()? != GSAS_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse::<usize>().ok()
}

/// ChopIndex keeps track of what has been chopped for every run handled by this process.
/// It is owned by the orchestrator and nothing else.
#[derive(Debug, Clone, Default)]
pub struct ChopIndex {
    runs: BTreeMap<i32, RunRecord>,
}

impl ChopIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a unit. An existing entry with the same sequence is replaced.
    pub fn insert(&mut self, entry: ChopEntry) {
        let record = self.runs.entry(entry.run_number).or_default();
        record.entries.insert(entry.sequence, entry);
    }

    /// Union of the entries, keyed by sequence. Entries in `entries` win.
    pub fn merge(&mut self, run_number: i32, entries: Vec<ChopEntry>) {
        let record = self.runs.entry(run_number).or_default();
        for entry in entries {
            record.entries.insert(entry.sequence, entry);
        }
    }

    /// Entries of a run in sequence order
    pub fn entries(&self, run_number: i32) -> Vec<ChopEntry> {
        match self.runs.get(&run_number) {
            Some(record) => record.entries.values().cloned().collect(),
            None => vec![],
        }
    }

    pub fn lookup(&self, run_number: i32, sequence: usize) -> Option<&ChopEntry> {
        self.runs.get(&run_number)?.entries.get(&sequence)
    }

    pub fn state(&self, run_number: i32) -> ChopState {
        match self.runs.get(&run_number) {
            Some(record) if !record.entries.is_empty() => {
                let sequences = record.entries.keys().copied().collect();
                if record.recovered {
                    ChopState::Recovered(sequences)
                } else {
                    ChopState::Chopped(sequences)
                }
            }
            _ => ChopState::NotChopped,
        }
    }

    pub fn export_lookup(&self, run_number: i32, dir: &Path) -> Result<PathBuf, ChopIndexError> {
        export_lookup(run_number, &self.entries(run_number), dir)
    }

    /// Reload the lookup file of a run into the index.
    ///
    /// Returns false if there is no lookup file. Malformed lines are skipped with a warning.
    pub fn load_lookup(&mut self, run_number: i32, dir: &Path) -> Result<bool, ChopIndexError> {
        let path = lookup_path(run_number, dir);
        if !path.exists() {
            return Ok(false);
        }
        let contents = std::fs::read_to_string(&path)?;
        let mut entries = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = if line.contains('\t') {
                line.split('\t').map(|f| f.trim()).collect()
            } else {
                line.split_whitespace().collect()
            };
            if fields.len() != 3 {
                log::warn!(
                    "Lookup file {} line {} does not have 3 fields, skipping",
                    path.to_string_lossy(),
                    idx + 1
                );
                continue;
            }
            let output = PathBuf::from(fields[0]);
            let sequence = match sequence_of(&output) {
                Some(s) => s,
                None => {
                    log::warn!(
                        "Lookup file {} line {} names {:?} which is not a reduced file, skipping",
                        path.to_string_lossy(),
                        idx + 1,
                        fields[0]
                    );
                    continue;
                }
            };
            let source = (fields[1] != LOOKUP_NONE).then(|| PathBuf::from(fields[1]));
            entries.push(ChopEntry {
                run_number,
                sequence,
                workspace_ref: WorkspaceRef::new(fields[2]),
                source_event_file: source,
                output_file: Some(output),
            });
        }
        log::info!(
            "Recovered {} entries of run {run_number} from {}",
            entries.len(),
            path.to_string_lossy()
        );
        self.merge(run_number, entries);
        self.mark_recovered(run_number);
        Ok(true)
    }

    /// Recover a run from the `<sequence>.gda` files in a directory.
    /// Returns the number of files found.
    pub fn scan_output_dir(&mut self, run_number: i32, dir: &Path) -> Result<usize, ChopIndexError> {
        if !dir.is_dir() {
            return Err(ChopIndexError::BadDirectory(dir.to_path_buf()));
        }
        let mut entries = Vec::new();
        for item in dir.read_dir()? {
            let item_path = item?.path();
            if let Some(sequence) = sequence_of(&item_path) {
                entries.push(ChopEntry {
                    run_number,
                    sequence,
                    workspace_ref: WorkspaceRef::empty(),
                    source_event_file: None,
                    output_file: Some(item_path),
                });
            }
        }
        let n_found = entries.len();
        if n_found > 0 {
            log::info!(
                "Found {n_found} reduced files of run {run_number} in {}",
                dir.to_string_lossy()
            );
            self.merge(run_number, entries);
            self.mark_recovered(run_number);
        }
        Ok(n_found)
    }

    /// Load the lookup file if there is one, otherwise fall back to scanning the directory
    pub fn recover(&mut self, run_number: i32, dir: &Path) -> Result<ChopState, ChopIndexError> {
        if !self.load_lookup(run_number, dir)? {
            self.scan_output_dir(run_number, dir)?;
        }
        Ok(self.state(run_number))
    }

    fn mark_recovered(&mut self, run_number: i32) {
        if let Some(record) = self.runs.get_mut(&run_number) {
            record.recovered = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(run: i32, sequence: usize, output: Option<&Path>) -> ChopEntry {
        ChopEntry {
            run_number: run,
            sequence,
            workspace_ref: WorkspaceRef::new(&format!("VULCAN_{run}_{sequence}")),
            source_event_file: Some(PathBuf::from("/SNS/VULCAN/run.vevt")),
            output_file: output.map(|p| p.to_path_buf()),
        }
    }

    #[test]
    fn test_state_machine() {
        let mut index = ChopIndex::new();
        assert_eq!(index.state(10), ChopState::NotChopped);
        index.insert(entry(10, 1, Some(Path::new("1.gda"))));
        index.insert(entry(10, 2, Some(Path::new("2.gda"))));
        assert_eq!(index.state(10), ChopState::Chopped(vec![1, 2]));

        // Re-chopping a sequence replaces only that entry
        let mut replacement = entry(10, 2, Some(Path::new("2.gda")));
        replacement.workspace_ref = WorkspaceRef::new("rechopped");
        index.merge(10, vec![replacement, entry(10, 3, None)]);
        assert_eq!(index.state(10), ChopState::Chopped(vec![1, 2, 3]));
        assert_eq!(index.lookup(10, 2).unwrap().workspace_ref.as_str(), "rechopped");
        assert_eq!(index.lookup(10, 1).unwrap().workspace_ref.as_str(), "VULCAN_10_1");
    }

    #[test]
    fn test_lookup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ChopIndex::new();
        for seq in 1..=3 {
            let out = dir.path().join(format!("{seq}.gda"));
            index.insert(entry(164960, seq, Some(&out)));
        }
        index.insert(entry(164960, 4, None));
        let path = index.export_lookup(164960, dir.path()).unwrap();
        assert!(path.ends_with("164960_chop_info.txt"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);

        let mut reloaded = ChopIndex::new();
        assert!(reloaded.load_lookup(164960, dir.path()).unwrap());
        assert_eq!(reloaded.state(164960), ChopState::Recovered(vec![1, 2, 3]));
        assert_eq!(
            reloaded.lookup(164960, 2).unwrap().source_event_file,
            Some(PathBuf::from("/SNS/VULCAN/run.vevt"))
        );
    }

    #[test]
    fn test_recover_prefers_lookup_over_scan() {
        let dir = tempfile::tempdir().unwrap();
        for seq in 1..=4 {
            std::fs::write(dir.path().join(format!("{seq}.gda")), "x").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let mut scanned = ChopIndex::new();
        assert_eq!(scanned.recover(5, dir.path()).unwrap(), ChopState::Recovered(vec![1, 2, 3, 4]));

        let lookup = format!(
            "{}\tNone\tws_2\nmalformed line\n",
            dir.path().join("2.gda").to_string_lossy()
        );
        std::fs::write(lookup_path(5, dir.path()), lookup).unwrap();
        let mut from_lookup = ChopIndex::new();
        assert_eq!(from_lookup.recover(5, dir.path()).unwrap(), ChopState::Recovered(vec![2]));
        assert_eq!(from_lookup.lookup(5, 2).unwrap().source_event_file, None);
    }

    #[test]
    fn test_lookup_with_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let lookup = "/data/7.gda  /SNS/VULCAN/run.vevt   VULCAN_5_7\n/data/8.gda\tNone\tVULCAN_5_8\n";
        std::fs::write(lookup_path(5, dir.path()), lookup).unwrap();
        let mut index = ChopIndex::new();
        assert!(index.load_lookup(5, dir.path()).unwrap());
        assert_eq!(index.state(5), ChopState::Recovered(vec![7, 8]));
        assert_eq!(index.lookup(5, 7).unwrap().workspace_ref.as_str(), "VULCAN_5_7");
        assert_eq!(
            index.lookup(5, 7).unwrap().source_event_file,
            Some(PathBuf::from("/SNS/VULCAN/run.vevt"))
        );
    }

    #[test]
    fn test_missing_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ChopIndex::new();
        assert!(!index.load_lookup(1, dir.path()).unwrap());
        assert_eq!(index.recover(1, dir.path()).unwrap(), ChopState::NotChopped);
    }
}
