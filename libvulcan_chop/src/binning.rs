use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use super::error::GsasError;

/// Logarithmic binning: each bin is `step` times wider than the previous edge.
///
/// Equivalent to a `min, -step, max` rebin specification. The final bin is truncated
/// at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogBinning {
    pub min: f64,
    pub step: f64,
    pub max: f64,
}

impl LogBinning {
    pub fn new(min: f64, step: f64, max: f64) -> Result<Self, GsasError> {
        let binning = Self { min, step, max };
        if binning.is_valid() {
            Ok(binning)
        } else {
            Err(GsasError::InvalidBinning(format!(
                "min={min}, step={step}, max={max}"
            )))
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min > 0.0 && self.step > 0.0 && self.max > self.min && self.max.is_finite()
    }

    /// Generate the bin edges
    pub fn edges(&self) -> Result<Array1<f64>, GsasError> {
        if !self.is_valid() {
            return Err(GsasError::InvalidBinning(format!(
                "min={}, step={}, max={}",
                self.min, self.step, self.max
            )));
        }
        let mut edges = vec![self.min];
        let factor = 1.0 + self.step;
        let mut x = self.min;
        loop {
            x *= factor;
            // Snap to the end if we are within rounding of it
            if x >= self.max * (1.0 - 1.0e-12) {
                edges.push(self.max);
                break;
            }
            edges.push(x);
        }
        Ok(Array1::from(edges))
    }

    /// Number of bins these parameters produce
    pub fn n_bins(&self) -> Result<usize, GsasError> {
        Ok(self.edges()?.len() - 1)
    }
}

/// A set of banks that share one binning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinningGroup {
    pub binning: LogBinning,
    pub banks: Vec<u32>,
}

impl BinningGroup {
    pub fn new(binning: LogBinning, banks: &[u32]) -> Self {
        Self {
            binning,
            banks: banks.to_vec(),
        }
    }
}

/// The standard VULCAN TOF binning: the two 90 degree banks share a coarse binning,
/// the high angle bank uses a finer one.
pub fn default_vulcan_binning() -> Vec<BinningGroup> {
    vec![
        BinningGroup::new(
            LogBinning {
                min: 5000.0,
                step: 0.001,
                max: 70000.0,
            },
            &[1, 2],
        ),
        BinningGroup::new(
            LogBinning {
                min: 5000.0,
                step: 0.0003,
                max: 70000.0,
            },
            &[3],
        ),
    ]
}

/// Find the bin containing x. Bins are closed on the left.
pub fn find_bin(edges: ArrayView1<f64>, x: f64) -> Option<usize> {
    let n = edges.len();
    if n < 2 || x < edges[0] || x >= edges[n - 1] {
        return None;
    }
    let slice = edges.as_slice()?;
    Some(slice.partition_point(|edge| *edge <= x) - 1)
}

/// Redistribute histogram counts onto new bin edges.
///
/// Each source bin contributes to the target bins in proportion to their overlap.
/// Errors are propagated in quadrature. Returns (counts, errors) on the new edges.
pub fn rebin(
    edges: ArrayView1<f64>,
    counts: ArrayView1<f64>,
    errors: ArrayView1<f64>,
    new_edges: ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>) {
    let n_new = new_edges.len().saturating_sub(1);
    let mut new_counts = Array1::<f64>::zeros(n_new);
    let mut new_err2 = Array1::<f64>::zeros(n_new);
    if n_new == 0 || edges.len() < 2 {
        return (new_counts, new_err2);
    }

    let mut j = 0;
    for i in 0..(edges.len() - 1) {
        let (lo, hi) = (edges[i], edges[i + 1]);
        let width = hi - lo;
        if width <= 0.0 {
            continue;
        }
        // Skip target bins entirely to the left of this source bin
        while j < n_new && new_edges[j + 1] <= lo {
            j += 1;
        }
        let mut k = j;
        while k < n_new && new_edges[k] < hi {
            let overlap = hi.min(new_edges[k + 1]) - lo.max(new_edges[k]);
            if overlap > 0.0 {
                let frac = overlap / width;
                new_counts[k] += counts[i] * frac;
                new_err2[k] += (errors[i] * frac).powi(2);
            }
            k += 1;
        }
    }

    (new_counts, new_err2.mapv(f64::sqrt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_log_edges() {
        let binning = LogBinning::new(1000.0, 0.5, 4000.0).unwrap();
        let edges = binning.edges().unwrap();
        assert_eq!(edges.to_vec(), vec![1000.0, 1500.0, 2250.0, 3375.0, 4000.0]);
        assert_eq!(binning.n_bins().unwrap(), 4);
    }

    #[test]
    fn test_invalid_binning() {
        assert!(LogBinning::new(0.0, 0.1, 10.0).is_err());
        assert!(LogBinning::new(10.0, 0.1, 5.0).is_err());
        assert!(LogBinning::new(1.0, -0.1, 5.0).is_err());
    }

    #[test]
    fn test_rebin_conserves_counts() {
        let edges = array![0.0, 1.0, 2.0, 3.0, 4.0];
        let counts = array![4.0, 8.0, 2.0, 6.0];
        let errors = counts.mapv(f64::sqrt);
        let new_edges = array![0.0, 2.0, 4.0];
        let (c, e) = rebin(edges.view(), counts.view(), errors.view(), new_edges.view());
        assert_eq!(c.to_vec(), vec![12.0, 8.0]);
        assert!((e[0] - 12.0_f64.sqrt()).abs() < 1e-12);

        let split_edges = array![0.0, 0.5, 1.0];
        let (c, _) = rebin(edges.view(), counts.view(), errors.view(), split_edges.view());
        assert_eq!(c.to_vec(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_find_bin() {
        let edges = array![1.0, 2.0, 4.0];
        assert_eq!(find_bin(edges.view(), 0.5), None);
        assert_eq!(find_bin(edges.view(), 1.0), Some(0));
        assert_eq!(find_bin(edges.view(), 3.9), Some(1));
        assert_eq!(find_bin(edges.view(), 4.0), None);
    }
}
