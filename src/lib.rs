//! # Bus Trace Decoder
//!
//! Decodes sampled parallel-bus traces into annotated bus transactions.
//!
//! A logic analyser captures one integer per signal group per sample. This
//! library replays those samples through a protocol state machine and
//! produces one human-readable annotation per transaction or bus event:
//!
//! - ISA (8/16-bit, with DMA, refresh, interrupts and IOCHK#)
//! - ISA-minimal (control, address and data groups only)
//! - PCI (32/64-bit multiplexed address/data, arbitration, interrupts)
//!
//! Protocol faults such as timeouts, aborts and parity errors never fail a
//! pass; they show up as flags on the decoded [`Transaction`] and as the
//! [`Classification`] of its annotation.
//!
//! ## Features
//!
//! - `serde`: Enable serialization/deserialization support
//!
//! ## Example
//!
//! ```
//! use bustrace_decoder::{Capture, Protocol, SessionBuilder};
//!
//! // Idle ISA bus, then a reset pulse at sample 2
//! let idle = [0x0BFC, 0, 0, 0x7F_0000, 0];
//! let reset = [0x1BFC, 0, 0, 0x7F_0000, 0];
//! let mut capture = Capture::new(5);
//! capture.push_repeated(&idle, 2);
//! capture.push_repeated(&reset, 2);
//! capture.push(&idle);
//!
//! let mut session = SessionBuilder::new()
//!     .with_protocol(Protocol::Isa)
//!     .with_source(capture)
//!     .build()?;
//!
//! let event = session.annotation_at(2)?.unwrap();
//! assert_eq!(event.text, "SYSTEM RESET");
//! assert_eq!(session.next_marked(0)?, 2);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod annotation;
pub mod config;
pub mod edge;
pub mod error;
pub mod isa;
pub mod pci;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod source;
pub mod transaction;

pub use annotation::{Annotation, AnnotationStore, Classification, EventKind};
pub use config::{DecoderConfig, IsaConfig, IsaMinimalConfig, PciConfig};
pub use error::{DecodeError, Result};
pub use protocol::Protocol;
pub use session::{BusDecoder, DecodeStatus, Session, SessionBuilder};
pub use source::{Capture, SampleRange, SampleSource};
pub use transaction::{Transaction, TransactionKind};

/// Fixed protocol thresholds
pub mod limits {
    /// ISA wait states tolerated before a transfer is forced to complete
    pub const MAX_WAIT_STATES: u32 = 20;

    /// ISA clock edges a command or refresh may stay asserted
    pub const MAX_BUS_CYCLES: u32 = 10;

    /// PCI data phases stored per transaction
    pub const MAX_DATA_PHASES: usize = 16;
}
