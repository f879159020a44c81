use std::ops::RangeInclusive;

use alloy::primitives::BlockNumber;
use tracing::debug;

/// An iterator that splits a closed block interval into fixed-size batches.
///
/// The first batch starts exactly at `start`; each following batch begins
/// one past the previous boundary, so batches cover `[start, end]` without
/// overlap and without gaps.
#[derive(Debug, Clone)]
pub(crate) struct BatchIterator {
    current: BlockNumber,
    end: BlockNumber,
    batch_size: u64,
    steps_complete: u64,
    total_steps: u64,
}

impl BatchIterator {
    /// Creates an iterator over `[start, end]` with `batch_size` blocks per batch.
    ///
    /// # Panics
    ///
    /// Panics if `batch_size` is 0; the builder rejects that before any
    /// iterator is constructed.
    #[must_use]
    pub const fn new(start: BlockNumber, end: BlockNumber, batch_size: u64) -> Self {
        assert!(batch_size >= 1, "batch_size must be at least 1");
        let total_steps = if start > end { 0 } else { (end - start) / batch_size + 1 };
        Self { current: start, end, batch_size, steps_complete: 0, total_steps }
    }

    /// Number of batches yielded so far.
    #[must_use]
    pub const fn steps_complete(&self) -> u64 {
        self.steps_complete
    }

    /// Total number of batches the interval splits into.
    #[must_use]
    pub const fn total_steps(&self) -> u64 {
        self.total_steps
    }
}

impl Iterator for BatchIterator {
    type Item = RangeInclusive<BlockNumber>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.steps_complete >= self.total_steps {
            return None;
        }

        self.steps_complete += 1;
        if self.steps_complete % 10 == 0 {
            debug!(steps_complete = self.steps_complete, "processed batches");
        }

        let batch_start = self.current;
        let batch_end = batch_start.saturating_add(self.batch_size - 1).min(self.end);
        self.current = batch_end + 1;

        Some(batch_start..=batch_end)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match usize::try_from(self.total_steps - self.steps_complete) {
            Ok(remaining) => (remaining, Some(remaining)),
            Err(_) => (usize::MAX, None),
        }
    }
}
