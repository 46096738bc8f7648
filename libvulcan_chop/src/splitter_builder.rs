use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::constants::{SPLITTER_TIME_PRECISION, SPLITTER_TOLERANCE};
use super::error::SplitterError;
use super::instrument::{Instrument, LogDirection, WorkspaceRef};
use super::splitter::{SplitterSet, TargetId, TimeSegment};

/// Parameters of a sample log value chop. Serializable so it can live in a Config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogValueFilter {
    pub log_name: String,
    pub min_value: f64,
    pub max_value: Option<f64>,
    pub step: Option<f64>,
    pub direction: String,
    pub start_time: Option<f64>,
    pub stop_time: Option<f64>,
}

impl LogValueFilter {
    pub fn new(log_name: &str, min_value: f64, max_value: Option<f64>, step: Option<f64>) -> Self {
        Self {
            log_name: log_name.to_string(),
            min_value,
            max_value,
            step,
            direction: String::from("Both"),
            start_time: None,
            stop_time: None,
        }
    }
}

/// The boundary tolerance, widened when the times are so large (epoch seconds) that
/// it falls below the spacing of adjacent floats.
fn boundary_tolerance(time: f64) -> f64 {
    SPLITTER_TOLERANCE.max(time.abs() * f64::EPSILON * 2.0)
}

/// Remove the windows of `right` from the windows of `left`. Both must be sorted and disjoint.
fn subtract_windows(left: &[(f64, f64)], right: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let mut result = Vec::new();
    for &(start, stop) in left.iter() {
        let mut cursor = start;
        for &(r_start, r_stop) in right.iter() {
            if r_stop <= cursor || r_start >= stop {
                continue;
            }
            if r_start > cursor {
                result.push((cursor, r_start));
            }
            cursor = cursor.max(r_stop);
            if cursor >= stop {
                break;
            }
        }
        if cursor < stop {
            result.push((cursor, stop));
        }
    }
    result
}

/// SplitterBuilder generates SplitterSets for one run.
///
/// The run duration is needed whenever a time range is left open. The reference run and
/// run start are only carried along so they can be written into splitter files.
#[derive(Debug, Clone, Default)]
pub struct SplitterBuilder {
    tag: String,
    run_duration: Option<f64>,
    reference_run: Option<i64>,
    run_start_epoch: Option<f64>,
}

impl SplitterBuilder {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    pub fn with_run_duration(mut self, duration: Option<f64>) -> Self {
        self.run_duration = duration;
        self
    }

    pub fn with_reference_run(mut self, run: i64) -> Self {
        self.reference_run = Some(run);
        self
    }

    pub fn with_run_start(mut self, epoch: Option<f64>) -> Self {
        self.run_start_epoch = epoch;
        self
    }

    fn finish(&self, mut set: SplitterSet) -> SplitterSet {
        set.reference_run = self.reference_run;
        set.run_start_epoch = self.run_start_epoch;
        set
    }

    /// Fill in open time bounds from the run
    fn resolve_bounds(
        &self,
        start: Option<f64>,
        stop: Option<f64>,
    ) -> Result<(f64, f64), SplitterError> {
        let start = start.unwrap_or(0.0);
        let stop = match stop {
            Some(s) => s,
            None => self.run_duration.ok_or_else(|| {
                SplitterError::InvalidRange(String::from(
                    "no stop time given and the run duration is unknown",
                ))
            })?,
        };
        if start >= stop {
            return Err(SplitterError::InvalidRange(format!(
                "start {start} is not before stop {stop}"
            )));
        }
        Ok((start, stop))
    }

    /// Chop the run into contiguous slices of `step` seconds.
    ///
    /// The final slice is stretched by the boundary tolerance so the last sample is kept.
    pub fn by_time(
        &self,
        start: Option<f64>,
        stop: Option<f64>,
        step: Option<f64>,
    ) -> Result<SplitterSet, SplitterError> {
        if start.is_none() && stop.is_none() && step.is_none() {
            return Err(SplitterError::InvalidRange(String::from(
                "none of start, stop or step were given",
            )));
        }
        let (start, stop) = self.resolve_bounds(start, stop)?;
        let step = match step {
            Some(s) if s <= 0.0 || !s.is_finite() => {
                return Err(SplitterError::InvalidRange(format!(
                    "time step {s} must be positive"
                )))
            }
            Some(s) => s,
            None => stop - start,
        };

        let tolerance = boundary_tolerance(stop);
        let mut segments = Vec::new();
        let mut index: i64 = 0;
        loop {
            let t = start + index as f64 * step;
            if t >= stop - tolerance && index > 0 {
                break;
            }
            let next = start + (index + 1) as f64 * step;
            let is_last = next >= stop - tolerance;
            let seg_stop = if is_last {
                stop + tolerance
            } else {
                next
            };
            segments.push(TimeSegment::new(t, seg_stop, TargetId::Int(index))?);
            if is_last {
                break;
            }
            index += 1;
        }
        log::info!(
            "Created {} time splitters of {step} s between {start} s and {stop} s",
            segments.len()
        );
        Ok(self.finish(SplitterSet::new(&self.tag, segments)?))
    }

    /// Chop the run into windows of `step` seconds that start every `overlap` seconds.
    ///
    /// Neighbouring windows share events on purpose.
    pub fn by_overlapping_time(
        &self,
        start: Option<f64>,
        stop: Option<f64>,
        step: f64,
        overlap: f64,
    ) -> Result<SplitterSet, SplitterError> {
        let (start, stop) = self.resolve_bounds(start, stop)?;
        if step <= 0.0 || overlap <= 0.0 {
            return Err(SplitterError::InvalidRange(format!(
                "step {step} and overlap {overlap} must be positive"
            )));
        }
        if overlap >= step {
            return Err(SplitterError::InvalidRange(format!(
                "overlap {overlap} must be smaller than the step {step}"
            )));
        }

        let tolerance = boundary_tolerance(stop);
        let mut segments = Vec::new();
        let mut index: i64 = 0;
        loop {
            let t = start + index as f64 * overlap;
            if t >= stop - tolerance {
                break;
            }
            let is_last = t + step >= stop - tolerance;
            let seg_stop = if is_last {
                stop + tolerance
            } else {
                t + step
            };
            segments.push(TimeSegment::new(t, seg_stop, TargetId::Int(index))?);
            if is_last {
                break;
            }
            index += 1;
        }
        log::info!(
            "Created {} overlapping windows of {step} s advancing by {overlap} s",
            segments.len()
        );
        Ok(self.finish(SplitterSet::new_overlapping(&self.tag, segments)))
    }

    /// Chop the run by the value of a sample log.
    ///
    /// With a step, each value bin `[min + k*step, min + (k+1)*step)` becomes target k.
    /// Without one, the whole `[min, max)` window is target 0.
    pub fn by_log_value(
        &self,
        instrument: &dyn Instrument,
        workspace: &WorkspaceRef,
        filter: &LogValueFilter,
    ) -> Result<SplitterSet, SplitterError> {
        let direction: LogDirection = filter.direction.parse()?;
        let min = filter.min_value;
        if let Some(max) = filter.max_value {
            if min >= max {
                return Err(SplitterError::InvalidRange(format!(
                    "minimum log value {min} is not below maximum {max}"
                )));
            }
        }

        let mut bins: Vec<(f64, Option<f64>)> = Vec::new();
        match (filter.step, filter.max_value) {
            (Some(step), _) if step <= 0.0 => {
                return Err(SplitterError::InvalidRange(format!(
                    "log value step {step} must be positive"
                )))
            }
            (Some(_), None) => {
                return Err(SplitterError::InvalidRange(String::from(
                    "a log value step requires a maximum log value",
                )))
            }
            (Some(step), Some(max)) => {
                let mut k = 0;
                loop {
                    let lo = min + k as f64 * step;
                    if lo >= max - SPLITTER_TOLERANCE {
                        break;
                    }
                    bins.push((lo, Some((lo + step).min(max))));
                    k += 1;
                }
            }
            (None, max) => bins.push((min, max)),
        }

        let lower_time = filter.start_time.unwrap_or(f64::NEG_INFINITY);
        let upper_time = filter.stop_time.unwrap_or(f64::INFINITY);
        if lower_time >= upper_time {
            return Err(SplitterError::InvalidRange(format!(
                "start time {lower_time} is not before stop time {upper_time}"
            )));
        }

        let mut segments = Vec::new();
        let mut cached: Option<(f64, Vec<(f64, f64)>)> = None;
        for (k, (lo, hi)) in bins.iter().enumerate() {
            let above_lo = match cached.take() {
                Some((threshold, windows)) if threshold == *lo => windows,
                _ => instrument.scan_log_crossings(workspace, &filter.log_name, *lo, direction)?,
            };
            let windows = match hi {
                Some(hi) => {
                    let above_hi =
                        instrument.scan_log_crossings(workspace, &filter.log_name, *hi, direction)?;
                    let inside = subtract_windows(&above_lo, &above_hi);
                    cached = Some((*hi, above_hi));
                    inside
                }
                None => above_lo,
            };
            for (start, stop) in windows {
                let seg = TimeSegment::new(start, stop, TargetId::Int(k as i64))?;
                if let Some(clipped) = seg.clipped(lower_time, upper_time) {
                    segments.push(clipped);
                }
            }
        }
        segments.sort_by(|a, b| a.start().total_cmp(&b.start()));

        if segments.is_empty() {
            log::warn!(
                "Log {} never entered [{min}, {:?}) in the requested direction",
                filter.log_name,
                filter.max_value
            );
        } else {
            log::info!(
                "Created {} log value splitters from {} over {} value bins",
                segments.len(),
                filter.log_name,
                bins.len()
            );
        }
        Ok(self.finish(SplitterSet::new(&self.tag, segments)?))
    }

    /// Chop the run at hand picked times. Each pair of neighbouring marks is one target.
    pub fn manual(&self, marks: &[f64]) -> Result<SplitterSet, SplitterError> {
        for pair in marks.windows(2) {
            if pair[0] >= pair[1] {
                return Err(SplitterError::InvalidRange(format!(
                    "manual marks must be strictly increasing; found {} then {}",
                    pair[0], pair[1]
                )));
            }
        }
        let mut segments = Vec::new();
        for (index, pair) in marks.windows(2).enumerate() {
            segments.push(TimeSegment::new(pair[0], pair[1], TargetId::Int(index as i64))?);
        }
        if let Some(last) = marks.last() {
            log::warn!("Final manual mark at {last} s has no stop time and is dropped");
        }
        Ok(self.finish(SplitterSet::new(&self.tag, segments)?))
    }
}

/// Write a splitter set as a tab separated text file
pub fn to_text(set: &SplitterSet, path: &Path) -> Result<(), SplitterError> {
    let mut writer = BufWriter::new(File::create(path)?);
    let p = SPLITTER_TIME_PRECISION;
    if !set.tag.is_empty() {
        writeln!(writer, "# Tag = {}", set.tag)?;
    }
    if let Some(run) = set.reference_run {
        writeln!(writer, "# Reference Run Number = {run}")?;
    }
    if let Some(epoch) = set.run_start_epoch {
        writeln!(writer, "# Run Start Time = {epoch:.p$}")?;
    }
    if set.is_overlapping() {
        writeln!(writer, "# Overlap = True")?;
    }
    for seg in set.segments() {
        writeln!(
            writer,
            "{:.p$}\t{:.p$}\t{}",
            seg.start(),
            seg.stop(),
            target_field(seg.target())?
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Text form of a target. Tags that would read back as an integer, as blank or with
/// different whitespace are written in double quotes.
fn target_field(target: &TargetId) -> Result<String, SplitterError> {
    match target {
        TargetId::Int(n) => Ok(n.to_string()),
        TargetId::Tag(tag) if tag.contains(['\t', '\n', '\r']) => {
            Err(SplitterError::UnsupportedOption {
                option: "target tag",
                value: tag.clone(),
            })
        }
        TargetId::Tag(tag)
            if tag.is_empty()
                || tag.trim() != tag
                || tag.starts_with('"')
                || tag.parse::<i64>().is_ok() =>
        {
            Ok(format!("\"{tag}\""))
        }
        TargetId::Tag(tag) => Ok(tag.clone()),
    }
}

/// Inverse of `target_field`
fn parse_target_field(field: &str) -> TargetId {
    match field
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(tag) => TargetId::Tag(tag.to_string()),
        None => field.parse::<TargetId>().unwrap_or(TargetId::Int(0)),
    }
}

#[derive(Debug, Default)]
struct SplitterHeader {
    tag: Option<String>,
    reference_run: Option<i64>,
    run_start_epoch: Option<f64>,
    overlapping: bool,
}

impl SplitterHeader {
    /// Parse a `Key = Value` comment. Comments that are not headers are ignored.
    fn apply(&mut self, comment: &str, line_number: usize) {
        let (key, value) = match comment.split_once('=') {
            Some(kv) => kv,
            None => return,
        };
        let key: String = key
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let value = value.trim();
        match key.as_str() {
            "tag" => self.tag = Some(value.to_string()),
            "referencerun" | "referencerunnumber" => match value.parse::<i64>() {
                Ok(run) => self.reference_run = Some(run),
                Err(_) => log::warn!(
                    "Splitter file line {line_number}: reference run {value:?} is not an integer"
                ),
            },
            "runstart" | "runstarttime" => match value.parse::<f64>() {
                Ok(epoch) => self.run_start_epoch = Some(epoch),
                Err(_) => match time::OffsetDateTime::parse(
                    value,
                    &time::format_description::well_known::Rfc3339,
                ) {
                    Ok(date) => {
                        self.run_start_epoch = Some(date.unix_timestamp_nanos() as f64 * 1.0e-9)
                    }
                    Err(_) => log::warn!(
                        "Splitter file line {line_number}: run start {value:?} is not a time"
                    ),
                },
            },
            "overlap" => self.overlapping = value.eq_ignore_ascii_case("true"),
            _ => (),
        }
    }
}

/// Read a splitter set from a tab separated text file.
///
/// Malformed lines are skipped with a warning.
pub fn from_text(path: &Path) -> Result<SplitterSet, SplitterError> {
    if !path.exists() {
        return Err(SplitterError::BadFilePath(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;

    let mut header = SplitterHeader::default();
    let mut segments = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line_number = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(comment) = trimmed.strip_prefix('#') {
            header.apply(comment, line_number);
            continue;
        }

        let fields: Vec<&str> = if trimmed.contains('\t') {
            trimmed.split('\t').map(|f| f.trim()).collect()
        } else {
            trimmed.split_whitespace().collect()
        };
        let start = fields.first().and_then(|f| f.parse::<f64>().ok());
        let stop = fields.get(1).and_then(|f| f.parse::<f64>().ok());
        let (start, stop) = match (start, stop) {
            (Some(start), Some(stop)) => (start, stop),
            _ => {
                log::warn!("Splitter file line {line_number} has fewer than 2 numeric fields, skipping: {trimmed:?}");
                continue;
            }
        };
        let target = match fields.get(2) {
            Some(f) if !f.is_empty() => parse_target_field(f),
            _ => TargetId::Int(segments.len() as i64),
        };
        match TimeSegment::new(start, stop, target) {
            Ok(seg) => segments.push(seg),
            Err(e) => log::warn!("Splitter file line {line_number} skipped: {e}"),
        }
    }

    let tag = header.tag.unwrap_or_default();
    let mut set = if header.overlapping {
        SplitterSet::new_overlapping(&tag, segments)
    } else {
        SplitterSet::new(&tag, segments)?
    };
    set.reference_run = header.reference_run;
    set.run_start_epoch = header.run_start_epoch;
    log::info!(
        "Read {} splitters from {}",
        set.len(),
        path.to_string_lossy()
    );
    Ok(set)
}
