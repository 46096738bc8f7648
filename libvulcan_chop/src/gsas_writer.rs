use bit_set::BitSet;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::io::ErrorKind;
use std::path::Path;
use time::macros::datetime;

use super::binning::BinningGroup;
use super::constants::{GSAS_BINNED_BY, GSAS_FIELD_WIDTH, GSAS_LINE_WIDTH};
use super::error::GsasError;
use super::instrument::RunMetadata;
use super::pattern::{FocusedBank, FocusedPattern};

/// Pad (never truncate) a line to the fixed GSAS width
fn pad_line(line: &str) -> String {
    format!("{line:<GSAS_LINE_WIDTH$}")
}

/// Run start and stop as nanoseconds since 1990-01-01T00:00:00 UTC, the GSAS epoch.
/// Both are zero if the start or the duration is unknown.
pub fn pulse_times(metadata: &RunMetadata) -> (i64, i64) {
    let gsas_epoch_ns = datetime!(1990-01-01 0:00 UTC).unix_timestamp_nanos() as i64;
    match (metadata.start_epoch_ns, metadata.duration_s) {
        (Some(start), Some(duration)) => {
            let pulse_start = start - gsas_epoch_ns;
            (pulse_start, pulse_start + (duration * 1.0e9).round() as i64)
        }
        _ => (0, 0),
    }
}

/// Replace the 6th and 7th whitespace separated fields of a BANK line with the TOF range.
/// Lines with too few fields are only padded.
pub fn rewrite_bank_line(line: &str, tof_min: f64, tof_max: f64) -> String {
    let mut fields: Vec<String> = line.split_whitespace().map(String::from).collect();
    if fields.len() < 7 {
        return pad_line(line);
    }
    fields[5] = format!("{tof_min:.1}");
    fields[6] = format!("{tof_max:.1}");
    pad_line(&fields.join(" "))
}

/// Format a `tof intensity uncertainty` line into fixed width columns.
/// Anything that is not exactly three numbers is passed through.
pub fn format_body_line(line: &str) -> String {
    let values: Vec<f64> = line
        .split_whitespace()
        .map_while(|f| f.parse::<f64>().ok())
        .collect();
    let n_fields = line.split_whitespace().count();
    if n_fields != 3 || values.len() != 3 {
        return pad_line(line);
    }
    let w = GSAS_FIELD_WIDTH;
    pad_line(&format!(
        "{:>w$.1}{:>w$.1}{:>w$.2}",
        values[0], values[1], values[2]
    ))
}

/// Normalize a raw bank block: comments padded, BANK line ranges rewritten,
/// data lines put into fixed columns.
fn normalize_block(raw: &str, tof_min: f64, tof_max: f64) -> String {
    let mut block = String::with_capacity(raw.len() * 2);
    for line in raw.lines() {
        let formatted = if line.starts_with('#') {
            pad_line(line)
        } else if line.starts_with("BANK") {
            rewrite_bank_line(line, tof_min, tof_max)
        } else {
            format_body_line(line)
        };
        block.push_str(&formatted);
        block.push('\n');
    }
    block
}

/// Raw text of one bank. Data points are at the bin centres.
fn raw_bank_block(bank: &FocusedBank, step: f64) -> String {
    let mut raw = String::new();
    if let Some(geo) = &bank.geometry {
        let _ = writeln!(
            raw,
            "# Total flight path {:.3}m, tth {:.3}deg, DIFC {:.1}",
            geo.total_flight_path, geo.polar, geo.difc
        );
    }
    let _ = writeln!(raw, "# Data for spectrum :{}", bank.bank_id);
    let n = bank.n_bins();
    let _ = writeln!(
        raw,
        "BANK {} {n} {n} SLOG {} {} {step} 0 FXYE",
        bank.bank_id,
        bank.tof_min(),
        bank.tof_max()
    );
    for i in 0..n {
        let center = 0.5 * (bank.tof[i] + bank.tof[i + 1]);
        let _ = writeln!(raw, "{center} {} {}", bank.counts[i], bank.errors[i]);
    }
    raw
}

/// GsasWriter renders FocusedPatterns as VULCAN GSAS text.
///
/// Banks are re-binned by binning group. A bank may belong to at most one group; banks
/// outside every group keep the binning they were focused with.
#[derive(Debug, Clone)]
pub struct GsasWriter {
    iparm_file: String,
    ipts: i32,
    binned_by: String,
    binning: Vec<BinningGroup>,
}

impl GsasWriter {
    pub fn new(ipts: i32, iparm_file: &str, binning: Vec<BinningGroup>) -> Result<Self, GsasError> {
        let mut seen = BitSet::new();
        for group in binning.iter() {
            if !group.binning.is_valid() {
                return Err(GsasError::InvalidBinning(format!(
                    "min={}, step={}, max={} for banks {:?}",
                    group.binning.min, group.binning.step, group.binning.max, group.banks
                )));
            }
            for bank in group.banks.iter() {
                if !seen.insert(*bank as usize) {
                    return Err(GsasError::DuplicateBank(*bank));
                }
            }
        }
        Ok(Self {
            iparm_file: iparm_file.to_string(),
            ipts,
            binned_by: String::from(GSAS_BINNED_BY),
            binning,
        })
    }

    fn header(&self, pattern: &FocusedPattern, file_name: &str) -> String {
        let title = if pattern.title.is_empty() {
            &pattern.metadata.title
        } else {
            &pattern.title
        };
        let title: String = title.chars().take(GSAS_LINE_WIDTH).collect();
        let (pulse_start, pulse_stop) = pulse_times(&pattern.metadata);
        let lines = [
            title,
            format!("Instrument parameter file: {}", self.iparm_file),
            format!("#IPTS: {}", self.ipts),
            format!("#binned by: {}", self.binned_by),
            format!("#GSAS file name: {file_name}"),
            format!("#GSAS IPARM file: {}", self.iparm_file),
            format!("#Pulsestart:    {pulse_start}"),
            format!("#Pulsestop:     {pulse_stop}"),
            String::from("#"),
        ];
        let mut header = String::new();
        for line in lines.iter() {
            header.push_str(&pad_line(line));
            header.push('\n');
        }
        header
    }

    /// Render a focused pattern. `file_name` is the basename recorded in the header.
    pub fn render(&self, pattern: &FocusedPattern, file_name: &str) -> Result<String, GsasError> {
        // Keyed by bank id so blocks come out in ascending order
        let mut blocks: BTreeMap<u32, String> = BTreeMap::new();
        let mut grouped = BitSet::new();

        for group in self.binning.iter() {
            for bank_id in group.banks.iter() {
                grouped.insert(*bank_id as usize);
                let bank = match pattern.bank(*bank_id) {
                    Some(b) => b,
                    None => {
                        log::warn!("Bank {bank_id} has binning but is not in the focused pattern");
                        continue;
                    }
                };
                let rebinned = bank.rebinned(&group.binning)?;
                let raw = raw_bank_block(&rebinned, group.binning.step);
                blocks.insert(
                    *bank_id,
                    normalize_block(&raw, rebinned.tof_min(), rebinned.tof_max()),
                );
            }
        }

        for bank in pattern.banks.iter() {
            if grouped.contains(bank.bank_id as usize) {
                continue;
            }
            if !self.binning.is_empty() {
                log::warn!(
                    "Bank {} is not in any binning group and is written with its focused binning",
                    bank.bank_id
                );
            }
            if blocks.contains_key(&bank.bank_id) {
                return Err(GsasError::DuplicateBank(bank.bank_id));
            }
            let raw = raw_bank_block(bank, bank.log_step());
            blocks.insert(
                bank.bank_id,
                normalize_block(&raw, bank.tof_min(), bank.tof_max()),
            );
        }

        let mut text = self.header(pattern, file_name);
        for block in blocks.values() {
            text.push_str(block);
        }
        Ok(text)
    }
}

/// Write rendered GSAS text to disk.
///
/// Refuses a missing or read-only destination directory and an existing read-only file.
pub fn write_gsas_file(path: &Path, text: &str) -> Result<(), GsasError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if !parent.exists() {
        return Err(GsasError::DirectoryMissing(parent.to_path_buf()));
    }
    if parent.metadata()?.permissions().readonly() {
        return Err(GsasError::DirectoryNotWritable(parent.to_path_buf()));
    }
    let existed = path.exists();
    if existed && path.metadata()?.permissions().readonly() {
        return Err(GsasError::NotWritable(path.to_path_buf()));
    }
    // Mode bits do not tell whether this user may write, the write itself does
    if let Err(e) = std::fs::write(path, text) {
        return Err(match e.kind() {
            ErrorKind::PermissionDenied if existed => {
                GsasError::NotWritable(path.to_path_buf())
            }
            ErrorKind::PermissionDenied => {
                GsasError::DirectoryNotWritable(parent.to_path_buf())
            }
            _ => GsasError::IOError(e),
        });
    }
    log::info!(
        "Wrote GSAS file {} ({})",
        path.to_string_lossy(),
        human_bytes::human_bytes(text.len() as f64)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::LogBinning;
    use crate::grouping::BankGeometry;
    use ndarray::array;

    fn two_bank_pattern() -> FocusedPattern {
        let mut bank1 = FocusedBank::new(
            1,
            array![1000.0, 2000.0, 3000.0],
            array![10.0, 20.5],
            array![3.16, 4.53],
        )
        .unwrap();
        bank1.geometry = Some(BankGeometry {
            bank_id: 1,
            total_flight_path: 45.754,
            polar: 90.0,
            difc: 16372.0,
        });
        let bank2 = FocusedBank::new(
            2,
            array![1500.0, 2500.0, 4000.0],
            array![7.0, 0.0],
            array![2.65, 0.0],
        )
        .unwrap();
        FocusedPattern {
            title: String::from("synthetic pattern"),
            metadata: RunMetadata {
                start_epoch_ns: Some(631_152_000_000_000_000 + 5_000_000_000),
                duration_s: Some(2.5),
                title: String::new(),
            },
            // Out of order on purpose
            banks: vec![bank2, bank1],
        }
    }

    fn data_lines(text: &str) -> Vec<Vec<String>> {
        text.lines()
            .filter(|l| !l.starts_with('#') && !l.starts_with("BANK"))
            .skip(2) // title and IPARM lines
            .map(|l| l.split_whitespace().map(String::from).collect())
            .collect()
    }

    #[test]
    fn test_header_and_pulse_times() {
        let writer = GsasWriter::new(22752, "vulcan.prm", vec![]).unwrap();
        let text = writer.render(&two_bank_pattern(), "1.gda").unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0].trim_end(), "synthetic pattern");
        assert_eq!(lines[1].trim_end(), "Instrument parameter file: vulcan.prm");
        assert_eq!(lines[2].trim_end(), "#IPTS: 22752");
        assert_eq!(lines[4].trim_end(), "#GSAS file name: 1.gda");
        assert_eq!(lines[6].trim_end(), "#Pulsestart:    5000000000");
        assert_eq!(lines[7].trim_end(), "#Pulsestop:     7500000000");
        assert_eq!(lines[8].trim_end(), "#");
        assert!(lines.iter().all(|l| l.len() == GSAS_LINE_WIDTH));
    }

    #[test]
    fn test_missing_metadata_gives_zero_pulses() {
        assert_eq!(pulse_times(&RunMetadata::default()), (0, 0));
    }

    #[test]
    fn test_native_banks_in_ascending_order() {
        let writer = GsasWriter::new(1, "vulcan.prm", vec![]).unwrap();
        let text = writer.render(&two_bank_pattern(), "1.gda").unwrap();
        let bank_lines: Vec<Vec<&str>> = text
            .lines()
            .filter(|l| l.starts_with("BANK"))
            .map(|l| l.split_whitespace().collect())
            .collect();
        assert_eq!(bank_lines.len(), 2);
        assert_eq!(bank_lines[0][1], "1");
        assert_eq!(bank_lines[0][5], "1000.0");
        assert_eq!(bank_lines[0][6], "3000.0");
        assert_eq!(bank_lines[1][1], "2");
        assert_eq!(bank_lines[1][5], "1500.0");
        assert_eq!(bank_lines[1][6], "4000.0");

        assert!(text.contains("# Total flight path 45.754m, tth 90.000deg, DIFC 16372.0"));
        let data = data_lines(&text);
        assert_eq!(data.len(), 4);
        assert_eq!(data[0], vec!["1500.0", "10.0", "3.16"]);
        assert_eq!(data[1], vec!["2500.0", "20.5", "4.53"]);
        assert_eq!(data[2][1], "7.0");
    }

    #[test]
    fn test_file_on_disk_reparses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.gda");
        let writer = GsasWriter::new(22752, "vulcan.prm", vec![]).unwrap();
        let text = writer.render(&two_bank_pattern(), "1.gda").unwrap();
        write_gsas_file(&path, &text).unwrap();

        let loaded = std::fs::read_to_string(&path).unwrap();
        let ranges: Vec<(String, String)> = loaded
            .lines()
            .filter(|l| l.starts_with("BANK"))
            .map(|l| {
                let fields: Vec<&str> = l.split_whitespace().collect();
                (fields[5].to_string(), fields[6].to_string())
            })
            .collect();
        assert_eq!(
            ranges,
            vec![
                (String::from("1000.0"), String::from("3000.0")),
                (String::from("1500.0"), String::from("4000.0")),
            ]
        );
        let intensities: Vec<f64> = data_lines(&loaded)
            .iter()
            .map(|f| f[1].parse::<f64>().unwrap())
            .collect();
        assert_eq!(intensities, vec![10.0, 20.5, 7.0, 0.0]);
    }

    #[test]
    fn test_grouped_rebinning() {
        let binning = LogBinning::new(1000.0, 0.5, 4000.0).unwrap();
        let writer =
            GsasWriter::new(1, "vulcan.prm", vec![BinningGroup::new(binning, &[1, 2])]).unwrap();
        let text = writer.render(&two_bank_pattern(), "2.gda").unwrap();
        let bank_lines: Vec<Vec<&str>> = text
            .lines()
            .filter(|l| l.starts_with("BANK"))
            .map(|l| l.split_whitespace().collect())
            .collect();
        assert_eq!(bank_lines[0][2], "4");
        assert_eq!(bank_lines[0][6], "4000.0");
        let data = data_lines(&text);
        let bank1_total: f64 = data[..4].iter().map(|f| f[1].parse::<f64>().unwrap()).sum();
        assert!((bank1_total - 30.5).abs() < 0.2);
    }

    #[test]
    fn test_duplicate_bank_rejected() {
        let binning = LogBinning::new(1000.0, 0.01, 4000.0).unwrap();
        let groups = vec![
            BinningGroup::new(binning, &[1, 2]),
            BinningGroup::new(binning, &[2]),
        ];
        assert!(matches!(
            GsasWriter::new(1, "vulcan.prm", groups),
            Err(GsasError::DuplicateBank(2))
        ));
    }

    #[test]
    fn test_body_line_passthrough() {
        let line = format_body_line("12.0 abc 3.0");
        assert_eq!(line.trim_end(), "12.0 abc 3.0");
        assert_eq!(line.len(), GSAS_LINE_WIDTH);
        let line = format_body_line("5000.04 12.345 3.514");
        assert_eq!(&line[..36], "      5000.0        12.3        3.51");
    }

    #[test]
    fn test_bank_line_rewrite() {
        let line = rewrite_bank_line("BANK 3 10 10 SLOG 4999.99 70000.01 0.0003 0 FXYE", 5000.0, 70000.0);
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields[5], "5000.0");
        assert_eq!(fields[6], "70000.0");
        assert_eq!(fields[7], "0.0003");
    }

    #[test]
    fn test_write_refusals() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope").join("1.gda");
        assert!(matches!(
            write_gsas_file(&missing, "x"),
            Err(GsasError::DirectoryMissing(_))
        ));

        let path = dir.path().join("1.gda");
        write_gsas_file(&path, "first").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).unwrap();
        assert!(matches!(
            write_gsas_file(&path, "second"),
            Err(GsasError::NotWritable(_))
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_refuses_locked_directory() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
        let result = write_gsas_file(&locked.join("1.gda"), "x");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(matches!(result, Err(GsasError::DirectoryNotWritable(_))));
        assert!(!locked.join("1.gda").exists());
    }
}
