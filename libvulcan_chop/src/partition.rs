use std::ops::Range;

/// Splits a list of work units into contiguous slices, one per worker.
///
/// With n units and p workers every worker gets n / p units and the first n % p
/// workers get one more. Slices cover every unit exactly once, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPartitioner {
    pool_size: usize,
}

impl WorkerPartitioner {
    /// A pool size of 0 is treated as 1
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Ranges of unit indices, one per worker. Workers beyond the unit count get an
    /// empty range.
    pub fn partition(&self, n_units: usize) -> Vec<Range<usize>> {
        let base = n_units / self.pool_size;
        let remainder = n_units % self.pool_size;
        let mut ranges = Vec::with_capacity(self.pool_size);
        let mut start = 0;
        for worker in 0..self.pool_size {
            let len = base + usize::from(worker < remainder);
            ranges.push(start..(start + len));
            start += len;
        }
        ranges
    }
}

impl Default for WorkerPartitioner {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_POOL_SIZE)
    }
}
