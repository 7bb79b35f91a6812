//! Signal-level decoding of raw group values
//!
//! A capture supplies one unsigned integer per signal group per sample.
//! Individual lines are picked out of that value with a bit mask and read
//! according to their electrical polarity.

/// Index of a signal group as declared by a protocol
pub type GroupId = usize;

/// Electrical level at which a line is considered asserted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Polarity {
    /// Asserted when the line reads 1
    ActiveHigh,
    /// Asserted when the line reads 0 (`#` suffix in signal names)
    ActiveLow,
}

impl Polarity {
    /// Test the masked bits of `raw` against this polarity
    pub fn is_active(&self, mask: u64, raw: u64) -> bool {
        match self {
            Polarity::ActiveHigh => is_active_high(mask, raw),
            Polarity::ActiveLow => is_active_low(mask, raw),
        }
    }
}

impl std::fmt::Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Polarity::ActiveHigh => write!(f, "active high"),
            Polarity::ActiveLow => write!(f, "active low"),
        }
    }
}

/// A named line inside a signal group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal {
    name: &'static str,
    mask: u64,
    polarity: Polarity,
}

impl Signal {
    /// Describe an active-high line
    pub const fn active_high(name: &'static str, mask: u64) -> Self {
        Signal {
            name,
            mask,
            polarity: Polarity::ActiveHigh,
        }
    }

    /// Describe an active-low line
    pub const fn active_low(name: &'static str, mask: u64) -> Self {
        Signal {
            name,
            mask,
            polarity: Polarity::ActiveLow,
        }
    }

    /// Signal name as printed on the bus connector
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bit mask within the group value
    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Asserted level of the line
    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    /// Whether the line is asserted in `raw`
    pub fn is_active(&self, raw: u64) -> bool {
        self.polarity.is_active(self.mask, raw)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:X}, {})", self.name, self.mask, self.polarity)
    }
}

/// True when none of the masked bits are set
pub fn is_active_low(mask: u64, raw: u64) -> bool {
    raw & mask == 0
}

/// True when any of the masked bits is set
pub fn is_active_high(mask: u64, raw: u64) -> bool {
    raw & mask != 0
}

/// Return the first candidate asserted in `raw`.
///
/// Candidates are scanned in slice order, so when several lines of a
/// nominally exclusive set are asserted together the earliest one wins.
pub fn identify_exclusive_active(raw: u64, candidates: &[Signal]) -> Option<&Signal> {
    candidates.iter().find(|signal| signal.is_active(raw))
}

/// Numbered lines of a mutually exclusive set, in tie-break order
///
/// Used for DMA acknowledge channels and interrupt request lines. The
/// order of `entries` is the arbitration policy.
#[derive(Debug, Clone, Copy)]
pub struct PriorityTable {
    entries: &'static [(u8, Signal)],
}

impl PriorityTable {
    /// Build a table from `(number, signal)` pairs in priority order
    pub const fn new(entries: &'static [(u8, Signal)]) -> Self {
        PriorityTable { entries }
    }

    /// Number of the highest-priority asserted line, if any
    pub fn identify(&self, raw: u64) -> Option<u8> {
        self.entries
            .iter()
            .find(|(_, signal)| signal.is_active(raw))
            .map(|(number, _)| *number)
    }

    /// Table entries in scan order
    pub fn entries(&self) -> &'static [(u8, Signal)] {
        self.entries
    }

    /// Union of every member's mask
    pub fn mask(&self) -> u64 {
        self.entries
            .iter()
            .fold(0, |acc, (_, signal)| acc | signal.mask())
    }
}
