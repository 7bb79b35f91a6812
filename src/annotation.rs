//! Annotation events and the store that serves them
//!
//! A pass appends one [`Annotation`] per transaction or bus event. Events
//! are immutable once stored. Lookup is keyed by sample index: for a
//! multi-sample transaction that is the start sample.

use std::collections::BTreeMap;

use tracing::debug;

use crate::transaction::Transaction;

/// What an annotation describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// Ordinary read/write transaction
    Transfer,
    /// DMA acknowledge cycle
    Dma,
    /// Memory refresh cycle
    Refresh,
    /// Reset, interrupt and arbitration events
    BusStatus,
    /// Incomplete transactions and other advisories
    Notice,
}

/// Display class of an annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Classification {
    /// Plain background
    Normal,
    /// Grey background
    Status,
    /// Red background
    Error,
    /// Yellow background
    Warning,
}

impl Classification {
    /// Classify an event; the error flag wins over the kind
    pub fn classify(kind: EventKind, error: bool) -> Self {
        if error {
            return Classification::Error;
        }
        match kind {
            EventKind::Refresh | EventKind::BusStatus => Classification::Status,
            EventKind::Dma | EventKind::Notice => Classification::Warning,
            EventKind::Transfer => Classification::Normal,
        }
    }

    /// Background flag bits understood by the host
    pub fn display_flags(&self) -> u32 {
        match self {
            Classification::Normal => 1,
            Classification::Status => 2,
            Classification::Error => 4,
            Classification::Warning => 8,
        }
    }
}

/// One displayable decode result
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Annotation {
    /// Sample the event is keyed on
    pub sample: u64,
    /// What the event describes
    pub kind: EventKind,
    /// Display class
    pub class: Classification,
    /// Formatted text line
    pub text: String,
}

impl Annotation {
    /// Create an event, deriving its classification
    pub fn new(sample: u64, kind: EventKind, error: bool, text: impl Into<String>) -> Self {
        Annotation {
            sample,
            kind,
            class: Classification::classify(kind, error),
            text: text.into(),
        }
    }
}

impl std::fmt::Display for Annotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.sample, self.text)
    }
}

/// Insertion-ordered events with a sample index for lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationStore {
    events: Vec<Annotation>,
    // sample -> position of the first event keyed on it
    index: BTreeMap<u64, usize>,
}

impl AnnotationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn push(&mut self, annotation: Annotation) {
        self.index
            .entry(annotation.sample)
            .or_insert(self.events.len());
        self.events.push(annotation);
    }

    /// First event stored for `sample`
    pub fn find(&self, sample: u64) -> Option<&Annotation> {
        self.index.get(&sample).map(|&i| &self.events[i])
    }

    /// Smallest stored sample strictly after `sample`, or `sample` itself
    pub fn next_after(&self, sample: u64) -> u64 {
        use std::ops::Bound::{Excluded, Unbounded};
        self.index
            .range((Excluded(sample), Unbounded))
            .next()
            .map(|(&s, _)| s)
            .unwrap_or(sample)
    }

    /// Events in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.events.iter()
    }

    /// Event at insertion position `i`
    pub fn get(&self, i: usize) -> Option<&Annotation> {
        self.events.get(i)
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the store holds no events
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop every event
    pub fn clear(&mut self) {
        self.events.clear();
        self.index.clear();
    }

    /// Serialize the events as a JSON array
    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.events)
    }
}

/// Appends events and archives finished transactions during a pass
pub struct Emitter<'a> {
    store: &'a mut AnnotationStore,
    archive: &'a mut Vec<Transaction>,
}

impl<'a> Emitter<'a> {
    /// Wrap the session's store and archive
    pub fn new(store: &'a mut AnnotationStore, archive: &'a mut Vec<Transaction>) -> Self {
        Emitter { store, archive }
    }

    /// Append one event
    pub fn emit(&mut self, sample: u64, kind: EventKind, error: bool, text: impl Into<String>) {
        let annotation = Annotation::new(sample, kind, error, text);
        debug!(
            sample,
            class = ?annotation.class,
            text = %annotation.text,
            "annotation"
        );
        self.store.push(annotation);
    }

    /// Keep a finished transaction
    pub fn archive(&mut self, transaction: Transaction) {
        self.archive.push(transaction);
    }

    /// Events emitted so far
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether nothing has been emitted yet
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Parse the hex value following `label:` in annotation text.
///
/// Accepts both `Addr: 0x1234` and `Addr:0x1234`.
pub fn parse_hex_field(text: &str, label: &str) -> Option<u64> {
    let key = format!("{}:", label);
    let start = text.find(&key)? + key.len();
    let rest = text[start..].trim_start();
    let rest = rest
        .strip_prefix("0x")
        .or_else(|| rest.strip_prefix("0X"))?;
    let end = rest
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(rest.len());
    u64::from_str_radix(&rest[..end], 16).ok()
}
