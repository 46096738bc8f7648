use serde::{Deserialize, Serialize};

use super::binning::LogBinning;

/// Primary flight path of VULCAN, moderator to sample, in meters
const VULCAN_L1: f64 = 43.754;

/// One focused bank: a contiguous range of detector pixels and its focused geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankGroup {
    pub bank_id: u32,
    pub first_pixel: u32,
    /// Inclusive
    pub last_pixel: u32,
    pub difc: f64,
    pub l2: f64,
    pub polar: f64,
}

impl BankGroup {
    pub fn contains(&self, pixel: u32) -> bool {
        pixel >= self.first_pixel && pixel <= self.last_pixel
    }
}

/// Geometry written into the GSAS bank comments
#[derive(Debug, Clone, PartialEq)]
pub struct BankGeometry {
    pub bank_id: u32,
    pub total_flight_path: f64,
    pub polar: f64,
    pub difc: f64,
}

/// The grouping definition used by diffraction focusing. The groups are read-only and
/// shared by every focus worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grouping {
    pub l1: f64,
    pub banks: Vec<BankGroup>,
    /// Binning of the focused banks in d-spacing
    pub d_binning: LogBinning,
}

impl Default for Grouping {
    /// The standard three bank VULCAN grouping: west, east and high angle
    fn default() -> Self {
        Self {
            l1: VULCAN_L1,
            banks: vec![
                BankGroup {
                    bank_id: 1,
                    first_pixel: 0,
                    last_pixel: 3233,
                    difc: 16372.0,
                    l2: 2.0,
                    polar: 90.0,
                },
                BankGroup {
                    bank_id: 2,
                    first_pixel: 3234,
                    last_pixel: 6467,
                    difc: 16377.0,
                    l2: 2.0,
                    polar: 90.0,
                },
                BankGroup {
                    bank_id: 3,
                    first_pixel: 6468,
                    last_pixel: 24899,
                    difc: 22850.0,
                    l2: 2.0,
                    polar: 150.0,
                },
            ],
            d_binning: LogBinning {
                min: 0.3,
                step: 0.0003,
                max: 5.0,
            },
        }
    }
}

impl Grouping {
    /// The geometry of each bank, in bank order
    pub fn geometry(&self) -> Vec<BankGeometry> {
        self.banks
            .iter()
            .map(|bank| BankGeometry {
                bank_id: bank.bank_id,
                total_flight_path: self.l1 + bank.l2,
                polar: bank.polar,
                difc: bank.difc,
            })
            .collect()
    }

    /// Banks must have unique ids and disjoint pixel ranges
    pub fn is_valid(&self) -> bool {
        if self.banks.is_empty() || !self.d_binning.is_valid() {
            return false;
        }
        for (idx, bank) in self.banks.iter().enumerate() {
            if bank.first_pixel > bank.last_pixel || bank.difc <= 0.0 {
                return false;
            }
            for other in self.banks.iter().skip(idx + 1) {
                if other.bank_id == bank.bank_id
                    || (other.first_pixel <= bank.last_pixel && bank.first_pixel <= other.last_pixel)
                {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grouping() {
        let grouping = Grouping::default();
        assert!(grouping.is_valid());
        assert!(grouping.banks[0].contains(10));
        assert!(grouping.banks[1].contains(3234));
        assert!(!grouping.banks.iter().any(|b| b.contains(30000)));
        let geometry = grouping.geometry();
        assert!((geometry[2].total_flight_path - 45.754).abs() < 1e-9);
    }

    #[test]
    fn test_overlapping_banks_invalid() {
        let mut grouping = Grouping::default();
        grouping.banks[1].first_pixel = 3000;
        assert!(!grouping.is_valid());
    }
}
