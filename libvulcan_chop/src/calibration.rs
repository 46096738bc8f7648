// Detector calibration maps each pixel to its DIFC constant, the factor between
// d-spacing and time-of-flight (TOF = DIFC * d). Real calibrations come from a
// dedicated calibration run and are stored as a two column CSV:
// pixel,difc
// When no file is given we fall back to the nominal DIFC of the bank each pixel
// belongs to, which is what an uncalibrated instrument would use.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use fxhash::FxHashMap;

use super::error::CalibrationError;
use super::grouping::Grouping;

const ENTRIES_PER_LINE: usize = 2; //Number of elements in a single row in the CSV file

/// Calibration contains the pixel to DIFC mapping applied by detector alignment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Calibration {
    map: FxHashMap<u32, f64>,
}

impl Calibration {
    /// Create a new Calibration
    /// If the path is None, we build the nominal calibration from the grouping
    pub fn new(path: Option<&Path>, grouping: &Grouping) -> Result<Self, CalibrationError> {
        match path {
            Some(p) => Self::read_file(p),
            None => Ok(Self::nominal(grouping)),
        }
    }

    /// Read a pixel,difc CSV file. The first line is a header.
    pub fn read_file(path: &Path) -> Result<Self, CalibrationError> {
        let mut contents = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut contents)?;

        let mut cal = Calibration::default();
        let mut lines = contents.lines();
        lines.next(); // Skip the header
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let entries: Vec<&str> = line.split_terminator(',').map(|e| e.trim()).collect();
            if entries.len() != ENTRIES_PER_LINE {
                return Err(CalibrationError::BadFileFormat);
            }
            let pixel: u32 = entries[0].parse()?;
            let difc: f64 = entries[1].parse()?;
            cal.map.insert(pixel, difc);
        }

        Ok(cal)
    }

    /// Every pixel of every bank gets the bank's nominal DIFC
    pub fn nominal(grouping: &Grouping) -> Self {
        let mut cal = Calibration::default();
        for bank in grouping.banks.iter() {
            for pixel in bank.first_pixel..=bank.last_pixel {
                cal.map.insert(pixel, bank.difc);
            }
        }
        cal
    }

    /// Get the DIFC for a pixel. None if the pixel is not calibrated.
    pub fn get_difc(&self, pixel: u32) -> Option<f64> {
        self.map.get(&pixel).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
