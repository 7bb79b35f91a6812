//! Sample source seam towards the capture host

use crate::error::{DecodeError, Result};
use crate::signal::GroupId;

/// Inclusive bounds of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleRange {
    /// First valid sample index
    pub first: u64,
    /// Last valid sample index
    pub last: u64,
}

impl SampleRange {
    /// Create a range, rejecting `first > last`
    pub fn new(first: u64, last: u64) -> Result<Self> {
        if first > last {
            return Err(DecodeError::invalid_range(format!(
                "first sample {} after last sample {}",
                first, last
            )));
        }
        Ok(SampleRange { first, last })
    }

    /// Number of samples covered, saturating for a full `u64` span
    pub fn len(&self) -> u64 {
        (self.last - self.first).saturating_add(1)
    }

    /// A valid range always holds at least one sample
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate sample indices in capture order
    pub fn indices(&self) -> std::ops::RangeInclusive<u64> {
        self.first..=self.last
    }
}

/// Supplies raw group values for a capture.
///
/// Implemented by the host glue. `group_value` is called once per group
/// per sample during a pass and need not be cheap.
pub trait SampleSource {
    /// Bounds of the current capture, or `None` when nothing is captured
    fn sample_range(&self) -> Result<Option<SampleRange>>;

    /// Raw value of `group` at `sample`
    fn group_value(&self, sample: u64, group: GroupId) -> Result<u64>;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn sample_range(&self) -> Result<Option<SampleRange>> {
        (**self).sample_range()
    }

    fn group_value(&self, sample: u64, group: GroupId) -> Result<u64> {
        (**self).group_value(sample, group)
    }
}

/// In-memory capture: one row of group values per sample
#[derive(Debug, Clone, Default)]
pub struct Capture {
    first: u64,
    groups: usize,
    rows: Vec<Vec<u64>>,
}

impl Capture {
    /// Create an empty capture with `groups` signal groups, starting at sample 0
    pub fn new(groups: usize) -> Self {
        Capture {
            first: 0,
            groups,
            rows: Vec::new(),
        }
    }

    /// Start sample numbering at `first` instead of 0
    pub fn with_first_sample(mut self, first: u64) -> Self {
        self.first = first;
        self
    }

    /// Append one sample; missing trailing groups read as zero
    pub fn push(&mut self, values: &[u64]) {
        let mut row = vec![0; self.groups];
        for (slot, value) in row.iter_mut().zip(values) {
            *slot = *value;
        }
        self.rows.push(row);
    }

    /// Append the same sample `count` times
    pub fn push_repeated(&mut self, values: &[u64], count: usize) {
        for _ in 0..count {
            self.push(values);
        }
    }

    /// Number of samples held
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no samples have been pushed
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index the next pushed sample will get
    pub fn next_index(&self) -> u64 {
        self.first + self.rows.len() as u64
    }

    /// Drop every sample, keeping the group count
    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

impl SampleSource for Capture {
    fn sample_range(&self) -> Result<Option<SampleRange>> {
        if self.rows.is_empty() {
            return Ok(None);
        }
        SampleRange::new(self.first, self.first + self.rows.len() as u64 - 1).map(Some)
    }

    fn group_value(&self, sample: u64, group: GroupId) -> Result<u64> {
        if group >= self.groups {
            return Err(DecodeError::unknown_group(format!(
                "group {} not in a {}-group capture",
                group, self.groups
            )));
        }
        sample
            .checked_sub(self.first)
            .and_then(|offset| self.rows.get(offset as usize))
            .map(|row| row[group])
            .ok_or_else(|| DecodeError::source_failed(format!("sample {} not captured", sample)))
    }
}
