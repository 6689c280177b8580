//! Trailing volatility computation.
//!
//! Sample standard deviation of log returns over the `window` bars strictly
//! before the current one. Missing returns occupy a slot but are not counted.

use statrs::statistics::Statistics;
use std::collections::VecDeque;

/// Trailing-window volatility over nullable returns.
pub struct TrailingVolatility {
    /// Window size in bars.
    window: usize,
    /// Returns of the most recent `window` bars.
    returns: VecDeque<Option<f64>>,
}

impl TrailingVolatility {
    /// Create a new trailing volatility calculator.
    pub fn new(window: usize) -> Self {
        Self {
            window,
            returns: VecDeque::with_capacity(window + 1),
        }
    }

    /// Volatility of the returns currently in the window.
    ///
    /// `None` with fewer than two observed returns.
    pub fn volatility(&self) -> Option<f64> {
        if self.count() < 2 {
            return None;
        }
        Some(self.returns.iter().flatten().std_dev())
    }

    /// Push the return of the bar just processed, evicting the oldest slot
    /// once the window is full.
    pub fn push(&mut self, ret: Option<f64>) {
        if self.returns.len() >= self.window {
            self.returns.pop_front();
        }
        self.returns.push_back(ret);
    }

    /// Number of observed (non-null) returns in the window.
    pub fn count(&self) -> usize {
        self.returns.iter().filter(|r| r.is_some()).count()
    }

    /// Check if the window is full.
    pub fn is_ready(&self) -> bool {
        self.returns.len() >= self.window
    }

    pub fn window(&self) -> usize {
        self.window
    }
}
