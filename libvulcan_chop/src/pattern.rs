use ndarray::Array1;

use super::binning::{rebin, LogBinning};
use super::error::GsasError;
use super::grouping::BankGeometry;
use super::instrument::RunMetadata;

/// One focused bank in time-of-flight. `tof` holds the histogram bin edges, so it is
/// always one element longer than `counts` and `errors`.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusedBank {
    pub bank_id: u32,
    pub tof: Array1<f64>,
    pub counts: Array1<f64>,
    pub errors: Array1<f64>,
    pub geometry: Option<BankGeometry>,
}

impl FocusedBank {
    pub fn new(
        bank_id: u32,
        tof: Array1<f64>,
        counts: Array1<f64>,
        errors: Array1<f64>,
    ) -> Result<Self, GsasError> {
        if tof.len() != counts.len() + 1 || counts.len() != errors.len() || counts.is_empty() {
            return Err(GsasError::MalformedBank(bank_id));
        }
        Ok(Self {
            bank_id,
            tof,
            counts,
            errors,
            geometry: None,
        })
    }

    pub fn n_bins(&self) -> usize {
        self.counts.len()
    }

    pub fn tof_min(&self) -> f64 {
        self.tof[0]
    }

    pub fn tof_max(&self) -> f64 {
        self.tof[self.tof.len() - 1]
    }

    /// Log step of the existing binning, measured from the first bin
    pub fn log_step(&self) -> f64 {
        if self.tof[0] > 0.0 {
            self.tof[1] / self.tof[0] - 1.0
        } else {
            0.0
        }
    }

    /// A copy of the bank redistributed onto new binning
    pub fn rebinned(&self, binning: &LogBinning) -> Result<Self, GsasError> {
        let new_edges = binning.edges()?;
        let (counts, errors) = rebin(
            self.tof.view(),
            self.counts.view(),
            self.errors.view(),
            new_edges.view(),
        );
        Ok(Self {
            bank_id: self.bank_id,
            tof: new_edges,
            counts,
            errors,
            geometry: self.geometry.clone(),
        })
    }
}

/// A focused diffraction pattern: the unit handed from a focus worker to the GSAS writer
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FocusedPattern {
    pub title: String,
    pub metadata: RunMetadata,
    pub banks: Vec<FocusedBank>,
}

impl FocusedPattern {
    pub fn bank(&self, bank_id: u32) -> Option<&FocusedBank> {
        self.banks.iter().find(|bank| bank.bank_id == bank_id)
    }
}
