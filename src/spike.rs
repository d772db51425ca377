//! Per-metric outlier rejection
//!
//! Rolling-window robust statistic: modified z-score over the median and
//! median absolute deviation (MAD) of the last accepted values. A flat
//! buffer (MAD ≈ 0) falls back to a delta check against the metric's
//! configured range so constant signals neither mask real spikes nor
//! reject legitimate small moves.

use std::collections::VecDeque;

use tracing::debug;

/// Rolling window size of accepted values.
const WINDOW: usize = 20;

/// Below this many accepted values every reading passes.
const WARM_UP: usize = 5;

/// Modified z-score rejection threshold.
const Z_THRESHOLD: f64 = 3.5;

/// Scale constant relating MAD to the standard deviation.
const MAD_SCALE: f64 = 0.6745;

/// Fraction of the configured range tolerated when the buffer is flat.
const FLAT_RANGE_FRACTION: f64 = 0.3;

/// Absolute delta tolerated on a flat buffer when no range is known.
const FLAT_FALLBACK_ABS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpikeVerdict {
    Accepted,
    Rejected,
}

/// Bounded FIFO of accepted values for one metric.
#[derive(Debug, Default)]
pub struct SpikeFilter {
    buffer: VecDeque<f64>,
}

impl SpikeFilter {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::with_capacity(WINDOW),
        }
    }

    /// Evaluate a candidate value against the accepted-value buffer.
    ///
    /// Accepted values enter the buffer; rejected values are dropped and
    /// never influence later decisions. `range` is the metric's static
    /// (min, max) when configured.
    pub fn check(&mut self, value: f64, range: Option<(f64, f64)>) -> SpikeVerdict {
        if !value.is_finite() {
            debug!("rejecting non-finite reading {value}");
            return SpikeVerdict::Rejected;
        }

        if self.buffer.len() < WARM_UP {
            self.accept(value);
            return SpikeVerdict::Accepted;
        }

        let center = median(self.buffer.iter().copied());
        let mad = median(self.buffer.iter().map(|v| (v - center).abs()));

        let rejected = if mad > f64::EPSILON {
            let z = MAD_SCALE * (value - center).abs() / mad;
            z > Z_THRESHOLD
        } else {
            // Flat buffer: the z-score is degenerate, compare the raw
            // delta against the configured range instead.
            let tolerance = range
                .map(|(min, max)| (max - min).abs() * FLAT_RANGE_FRACTION)
                .unwrap_or(FLAT_FALLBACK_ABS);
            (value - center).abs() > tolerance
        };

        if rejected {
            debug!("spike rejected: {value} (median {center}, mad {mad})");
            SpikeVerdict::Rejected
        } else {
            self.accept(value);
            SpikeVerdict::Accepted
        }
    }

    fn accept(&mut self, value: f64) {
        if self.buffer.len() == WINDOW {
            self.buffer.pop_front();
        }
        self.buffer.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}
