use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use super::constants::{FIFTEEN_YEARS_IN_SECONDS, SPLITTER_TOLERANCE};
use super::error::SplitterError;

/// The label of a chopping target.
///
/// Splitters built by the time or log algorithms use integer targets, hand written
/// splitter files may use arbitrary string tags. Integer targets always sort before
/// tags so that the ordering is total.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetId {
    Int(i64),
    Tag(String),
}

impl Ord for TargetId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Int(_), Self::Tag(_)) => Ordering::Less,
            (Self::Tag(_), Self::Int(_)) => Ordering::Greater,
            (Self::Tag(a), Self::Tag(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for TargetId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Tag(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for TargetId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.parse::<i64>() {
            Ok(n) => Ok(Self::Int(n)),
            Err(_) => Ok(Self::Tag(s.to_string())),
        }
    }
}

impl From<i64> for TargetId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self::Tag(value.to_string())
    }
}

/// One slice of the run's time axis, routed to a single target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSegment {
    start: f64,
    stop: f64,
    target: TargetId,
}

impl TimeSegment {
    /// Create a segment. The start must be strictly before the stop.
    pub fn new(start: f64, stop: f64, target: TargetId) -> Result<Self, SplitterError> {
        if !(start < stop) {
            return Err(SplitterError::InvalidRange(format!(
                "segment start {start} is not before stop {stop}"
            )));
        }
        Ok(Self {
            start,
            stop,
            target,
        })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn stop(&self) -> f64 {
        self.stop
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn duration(&self) -> f64 {
        self.stop - self.start
    }

    /// Times at or below fifteen years are offsets from the run start, anything larger
    /// is an absolute epoch timestamp.
    pub fn is_relative(&self) -> bool {
        self.start <= FIFTEEN_YEARS_IN_SECONDS
    }

    /// Shift the segment by `offset` seconds
    pub fn shifted(&self, offset: f64) -> Self {
        Self {
            start: self.start + offset,
            stop: self.stop + offset,
            target: self.target.clone(),
        }
    }

    /// Does this segment contain the time `t`? The stop is exclusive.
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.stop
    }

    /// Clip the segment to `[lower, upper]`. Returns None if nothing is left.
    pub fn clipped(&self, lower: f64, upper: f64) -> Option<Self> {
        let start = self.start.max(lower);
        let stop = self.stop.min(upper);
        if start < stop {
            Some(Self {
                start,
                stop,
                target: self.target.clone(),
            })
        } else {
            None
        }
    }
}

/// SplitterSet is the full chopping definition for a run: a tagged collection of
/// TimeSegments plus the bookkeeping needed to persist it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SplitterSet {
    pub tag: String,
    segments: Vec<TimeSegment>,
    pub reference_run: Option<i64>,
    pub run_start_epoch: Option<f64>,
    overlapping: bool,
}

impl SplitterSet {
    /// Create a validated set of non-overlapping segments
    pub fn new(tag: &str, segments: Vec<TimeSegment>) -> Result<Self, SplitterError> {
        let set = Self {
            tag: tag.to_string(),
            segments,
            reference_run: None,
            run_start_epoch: None,
            overlapping: false,
        };
        set.validate()?;
        Ok(set)
    }

    /// Create a set whose windows are allowed to overlap each other
    pub fn new_overlapping(tag: &str, segments: Vec<TimeSegment>) -> Self {
        Self {
            tag: tag.to_string(),
            segments,
            reference_run: None,
            run_start_epoch: None,
            overlapping: true,
        }
    }

    pub fn segments(&self) -> &[TimeSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_overlapping(&self) -> bool {
        self.overlapping
    }

    /// Segments sorted by their start time
    pub fn sorted_segments(&self) -> Vec<TimeSegment> {
        let mut sorted = self.segments.clone();
        sorted.sort_by(|a, b| a.start.total_cmp(&b.start));
        sorted
    }

    /// Check that no two segments with different targets overlap.
    ///
    /// After sorting by start time it is enough to compare each stop with the next start.
    pub fn validate(&self) -> Result<(), SplitterError> {
        if self.overlapping {
            return Ok(());
        }
        let sorted = self.sorted_segments();
        for pair in sorted.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            if current.target != next.target && current.stop > next.start + SPLITTER_TOLERANCE
            {
                return Err(SplitterError::Overlap(
                    current.target.clone(),
                    next.target.clone(),
                    next.start,
                ));
            }
        }
        Ok(())
    }

    /// The distinct targets of the set in ascending order
    pub fn targets(&self) -> Vec<TargetId> {
        self.segments
            .iter()
            .map(|seg| seg.target.clone())
            .collect::<BTreeSet<TargetId>>()
            .into_iter()
            .collect()
    }

    /// True if every segment uses the relative time base
    pub fn is_relative(&self) -> bool {
        self.segments.iter().all(|seg| seg.is_relative())
    }

    /// Keep only the segments routed to one of the given targets
    pub fn restricted_to(&self, targets: &[TargetId]) -> Self {
        Self {
            tag: self.tag.clone(),
            segments: self
                .segments
                .iter()
                .filter(|seg| targets.contains(&seg.target))
                .cloned()
                .collect(),
            reference_run: self.reference_run,
            run_start_epoch: self.run_start_epoch,
            overlapping: self.overlapping,
        }
    }

    /// Rebase all absolute segments onto the run start, so that every segment is relative.
    ///
    /// `run_start` is the run start in seconds since the Unix epoch.
    pub fn to_relative(&self, run_start: f64) -> Self {
        let segments = self
            .segments
            .iter()
            .map(|seg| {
                if seg.is_relative() {
                    seg.clone()
                } else {
                    seg.shifted(-run_start)
                }
            })
            .collect();
        Self {
            tag: self.tag.clone(),
            segments,
            reference_run: self.reference_run,
            run_start_epoch: Some(run_start),
            overlapping: self.overlapping,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_threshold() {
        let rel = TimeSegment::new(FIFTEEN_YEARS_IN_SECONDS, FIFTEEN_YEARS_IN_SECONDS + 1.0, 0.into())
            .unwrap();
        assert!(rel.is_relative());
        let abs = TimeSegment::new(1.7e9, 1.7e9 + 10.0, 0.into()).unwrap();
        assert!(!abs.is_relative());
    }

    #[test]
    fn test_segment_requires_order() {
        assert!(matches!(
            TimeSegment::new(5.0, 5.0, 0.into()),
            Err(SplitterError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_overlap_detected() {
        let segs = vec![
            TimeSegment::new(0.0, 10.0, 0.into()).unwrap(),
            TimeSegment::new(9.0, 20.0, 1.into()).unwrap(),
        ];
        assert!(matches!(
            SplitterSet::new("test", segs),
            Err(SplitterError::Overlap(..))
        ));
    }

    #[test]
    fn test_touching_segments_allowed() {
        let segs = vec![
            TimeSegment::new(10.0, 20.0 + 1e-11, 1.into()).unwrap(),
            TimeSegment::new(0.0, 10.0, 0.into()).unwrap(),
            TimeSegment::new(20.0, 30.0, 2.into()).unwrap(),
        ];
        let set = SplitterSet::new("test", segs).unwrap();
        assert_eq!(set.targets(), vec![0.into(), 1.into(), 2.into()]);
    }

    #[test]
    fn test_target_order_is_total() {
        let mut targets = vec![
            TargetId::Tag("b".into()),
            TargetId::Int(3),
            TargetId::Tag("a".into()),
            TargetId::Int(-1),
        ];
        targets.sort();
        assert_eq!(
            targets,
            vec![
                TargetId::Int(-1),
                TargetId::Int(3),
                TargetId::Tag("a".into()),
                TargetId::Tag("b".into())
            ]
        );
        assert_eq!("12".parse::<TargetId>().unwrap(), TargetId::Int(12));
        assert_eq!("hot".parse::<TargetId>().unwrap(), TargetId::Tag("hot".into()));
    }

    #[test]
    fn test_to_relative() {
        let segs = vec![
            TimeSegment::new(1.0e9 + 5.0, 1.0e9 + 10.0, 0.into()).unwrap(),
            TimeSegment::new(20.0, 30.0, 1.into()).unwrap(),
        ];
        let set = SplitterSet::new("mixed", segs).unwrap().to_relative(1.0e9);
        assert!(set.is_relative());
        assert_eq!(set.segments()[0].start(), 5.0);
        assert_eq!(set.segments()[1].start(), 20.0);
    }
}
