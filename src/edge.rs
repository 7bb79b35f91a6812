//! Edge detection between consecutive samples
//!
//! An edge is derived purely from two adjacent group values. There is no
//! debouncing. Before the first sample the previous value is all-zero, so
//! the first sample of a capture can show raw rising transitions but never
//! a raw falling one.

use crate::signal::Signal;

/// Transitions of one signal group between two samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Edges {
    previous: u64,
    current: u64,
}

impl Edges {
    /// Compare two raw group values
    pub fn new(previous: u64, current: u64) -> Self {
        Edges { previous, current }
    }

    /// Raw value at the earlier sample
    pub fn previous(&self) -> u64 {
        self.previous
    }

    /// Raw value at the later sample
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Masked bits went from 0 to 1
    pub fn rose(&self, mask: u64) -> bool {
        self.current & mask != 0 && self.previous & mask == 0
    }

    /// Masked bits went from 1 to 0
    pub fn fell(&self, mask: u64) -> bool {
        self.current & mask == 0 && self.previous & mask != 0
    }

    /// Any masked bit differs
    pub fn changed(&self, mask: u64) -> bool {
        (self.current ^ self.previous) & mask != 0
    }

    /// The signal became active, whatever its polarity
    pub fn asserted(&self, signal: &Signal) -> bool {
        signal.is_active(self.current) && !signal.is_active(self.previous)
    }

    /// The signal became inactive, whatever its polarity
    pub fn released(&self, signal: &Signal) -> bool {
        !signal.is_active(self.current) && signal.is_active(self.previous)
    }

    /// The signal is active at the later sample
    pub fn is_active(&self, signal: &Signal) -> bool {
        signal.is_active(self.current)
    }

    /// The signal was active at the earlier sample
    pub fn was_active(&self, signal: &Signal) -> bool {
        signal.is_active(self.previous)
    }
}

/// Tracks one group across a pass and yields its edges per sample
#[derive(Debug, Clone, Default)]
pub struct EdgeDetector {
    previous: u64,
}

impl EdgeDetector {
    /// Create a detector whose "previous" sample is all-zero
    pub fn new() -> Self {
        EdgeDetector { previous: 0 }
    }

    /// Feed the next sample and return its edges relative to the last one
    pub fn update(&mut self, current: u64) -> Edges {
        let edges = Edges::new(self.previous, current);
        self.previous = current;
        edges
    }

    /// Last value fed to the detector
    pub fn previous(&self) -> u64 {
        self.previous
    }

    /// Forget history, as at the start of a capture
    pub fn reset(&mut self) {
        self.previous = 0;
    }
}
