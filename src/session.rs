//! Decoder session: one configuration, one capture, one memoised pass
//!
//! The session owns everything a pass produces. The first request for an
//! annotation runs the pass over the whole capture; later requests are
//! lookups. Changing a setting or the capture bounds throws the results
//! away and the next request decodes again from scratch.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::annotation::{Annotation, AnnotationStore, Emitter};
use crate::config::DecoderConfig;
use crate::error::{DecodeError, Result};
use crate::isa::IsaDecoder;
use crate::pci::PciDecoder;
use crate::protocol::Protocol;
use crate::source::{SampleRange, SampleSource};
use crate::transaction::Transaction;

/// A protocol state machine driven sample by sample
pub trait BusDecoder {
    /// Consume one sample
    fn step<S: SampleSource + ?Sized>(
        &mut self,
        sample: u64,
        source: &S,
        emitter: &mut Emitter<'_>,
    ) -> Result<()>;

    /// Flush whatever is still in flight after the last sample
    fn finish(&mut self, last_sample: u64, emitter: &mut Emitter<'_>);
}

/// Outcome of a cancellable decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The store holds a complete pass
    Complete,
    /// The pass was abandoned; the session stays unprocessed
    Cancelled,
}

/// State machine for the configured protocol, fresh for each pass
enum Machine {
    Isa(IsaDecoder),
    Pci(PciDecoder),
}

impl Machine {
    fn for_config(config: &DecoderConfig) -> Self {
        match config {
            DecoderConfig::Isa(c) => Machine::Isa(IsaDecoder::full(c)),
            DecoderConfig::IsaMinimal(c) => Machine::Isa(IsaDecoder::minimal(c)),
            DecoderConfig::Pci(c) => Machine::Pci(PciDecoder::new(c)),
        }
    }

    fn step<S: SampleSource + ?Sized>(
        &mut self,
        sample: u64,
        source: &S,
        emitter: &mut Emitter<'_>,
    ) -> Result<()> {
        match self {
            Machine::Isa(m) => m.step(sample, source, emitter),
            Machine::Pci(m) => m.step(sample, source, emitter),
        }
    }

    fn finish(&mut self, last_sample: u64, emitter: &mut Emitter<'_>) {
        match self {
            Machine::Isa(m) => m.finish(last_sample, emitter),
            Machine::Pci(m) => m.finish(last_sample, emitter),
        }
    }
}

/// Decoder session over one sample source
pub struct Session<S: SampleSource> {
    config: DecoderConfig,
    source: S,
    store: AnnotationStore,
    transactions: Vec<Transaction>,
    processed: bool,
    // Bounds the current results were built from
    decoded_range: Option<SampleRange>,
}

impl<S: SampleSource> Session<S> {
    /// Create a session with `config` over `source`
    pub fn new(config: DecoderConfig, source: S) -> Self {
        Session {
            config,
            source,
            store: AnnotationStore::new(),
            transactions: Vec::new(),
            processed: false,
            decoded_range: None,
        }
    }

    /// Protocol being decoded
    pub fn protocol(&self) -> Protocol {
        self.config.protocol()
    }

    /// Current configuration
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// The sample source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutable access to the sample source.
    ///
    /// Bounds changes are picked up on the next request; call
    /// [`Session::invalidate`] after rewriting samples in place.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Whether the store holds a pass for the current configuration
    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Run the pass unless the current results are still valid
    pub fn decode_if_needed(&mut self) -> Result<()> {
        let never = AtomicBool::new(false);
        self.decode_cancellable(&never).map(|_| ())
    }

    /// Like [`Session::decode_if_needed`], polling `cancel` before every sample.
    ///
    /// A cancelled pass leaves the session unprocessed with an empty store.
    pub fn decode_cancellable(&mut self, cancel: &AtomicBool) -> Result<DecodeStatus> {
        let range = self.source.sample_range()?;
        if self.processed && range == self.decoded_range {
            return Ok(DecodeStatus::Complete);
        }
        if self.processed {
            debug!("capture bounds changed, decoding again");
        }
        self.clear_results();

        match self.run_pass(range, cancel) {
            Ok(DecodeStatus::Complete) => {
                self.processed = true;
                self.decoded_range = range;
                Ok(DecodeStatus::Complete)
            }
            Ok(DecodeStatus::Cancelled) => {
                info!("decode cancelled");
                self.clear_results();
                Ok(DecodeStatus::Cancelled)
            }
            Err(e) => {
                warn!(error = %e, "decode failed");
                self.clear_results();
                Err(e)
            }
        }
    }

    fn run_pass(&mut self, range: Option<SampleRange>, cancel: &AtomicBool) -> Result<DecodeStatus> {
        let Some(range) = range else {
            info!(protocol = %self.protocol(), "empty capture, nothing to decode");
            return Ok(DecodeStatus::Complete);
        };

        info!(
            protocol = %self.protocol(),
            first = range.first,
            last = range.last,
            "decode pass started"
        );

        let mut machine = Machine::for_config(&self.config);
        let mut emitter = Emitter::new(&mut self.store, &mut self.transactions);
        for sample in range.indices() {
            if cancel.load(Ordering::Relaxed) {
                return Ok(DecodeStatus::Cancelled);
            }
            machine.step(sample, &self.source, &mut emitter)?;
        }
        machine.finish(range.last, &mut emitter);

        info!(
            annotations = self.store.len(),
            transactions = self.transactions.len(),
            "decode pass finished"
        );
        Ok(DecodeStatus::Complete)
    }

    fn clear_results(&mut self) {
        self.store.clear();
        self.transactions.clear();
        self.processed = false;
        self.decoded_range = None;
    }

    /// Drop the results; the next request decodes again
    pub fn invalidate(&mut self) {
        self.clear_results();
    }

    /// Annotation keyed on `sample`, decoding first if needed
    pub fn annotation_at(&mut self, sample: u64) -> Result<Option<&Annotation>> {
        self.decode_if_needed()?;
        Ok(self.store.find(sample))
    }

    /// Next annotated sample after `sample`, or `sample` if there is none
    pub fn next_marked(&mut self, sample: u64) -> Result<u64> {
        self.decode_if_needed()?;
        Ok(self.store.next_after(sample))
    }

    /// Option index of setting `id`
    pub fn get_setting(&self, id: usize) -> Result<usize> {
        self.config.get_setting(id)
    }

    /// Change setting `id`; a successful write invalidates the results
    pub fn set_setting(&mut self, id: usize, value: usize) -> Result<()> {
        self.config.set_setting(id, value)?;
        debug!(setting = id, value, "setting changed");
        self.invalidate();
        Ok(())
    }

    /// Restore startup settings and invalidate the results
    pub fn reset_config(&mut self) {
        self.config.reset();
        self.invalidate();
    }

    /// Annotations of the last completed pass
    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    /// Transactions archived by the last completed pass, in decode order
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }
}

/// Builder for decoder sessions
pub struct SessionBuilder<S> {
    config: DecoderConfig,
    source: Option<S>,
}

impl<S: SampleSource> SessionBuilder<S> {
    /// Start from the default ISA configuration
    pub fn new() -> Self {
        SessionBuilder {
            config: DecoderConfig::for_protocol(Protocol::Isa),
            source: None,
        }
    }

    /// Decode `protocol` with its default settings
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.config = DecoderConfig::for_protocol(protocol);
        self
    }

    /// Use a prepared configuration
    pub fn with_config(mut self, config: DecoderConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the sample source
    pub fn with_source(mut self, source: S) -> Self {
        self.source = Some(source);
        self
    }

    /// Build the session
    pub fn build(self) -> Result<Session<S>> {
        let source = self.source.ok_or_else(|| {
            DecodeError::missing_source(format!(
                "{} session needs a sample source",
                self.config.protocol()
            ))
        })?;
        Ok(Session::new(self.config, source))
    }
}

impl<S: SampleSource> Default for SessionBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Classification;
    use crate::signal::GroupId;
    use crate::source::Capture;
    use std::cell::Cell;

    // BCLK toggling on an otherwise idle full ISA bus
    fn isa_capture_with_reset() -> (Capture, u64) {
        let idle = [0x0BFC, 0, 0, 0x7F_0000, 0];
        let mut capture = Capture::new(5);
        for _ in 0..4 {
            capture.push(&idle);
            capture.push(&[idle[0] | 0x1, 0, 0, 0x7F_0000, 0]);
        }
        let reset_at = capture.next_index();
        capture.push_repeated(&[idle[0] | 0x1000, 0, 0, 0x7F_0000, 0], 3);
        capture.push_repeated(&idle, 2);
        (capture, reset_at)
    }

    /// Counts group reads and can fail on a chosen sample
    struct CountingSource {
        inner: Capture,
        reads: Cell<usize>,
        fail_at: Option<u64>,
    }

    impl SampleSource for CountingSource {
        fn sample_range(&self) -> Result<Option<SampleRange>> {
            self.inner.sample_range()
        }

        fn group_value(&self, sample: u64, group: GroupId) -> Result<u64> {
            self.reads.set(self.reads.get() + 1);
            if self.fail_at == Some(sample) {
                return Err(DecodeError::source_failed(format!("sample {} unavailable", sample)));
            }
            self.inner.group_value(sample, group)
        }
    }

    fn counting(fail_at: Option<u64>) -> (CountingSource, u64) {
        let (inner, reset_at) = isa_capture_with_reset();
        (
            CountingSource {
                inner,
                reads: Cell::new(0),
                fail_at,
            },
            reset_at,
        )
    }

    #[test]
    fn test_builder_requires_source() {
        let result = SessionBuilder::<Capture>::new()
            .with_protocol(Protocol::Pci)
            .build();
        assert!(matches!(result, Err(DecodeError::MissingSource(_))));
    }

    #[test]
    fn test_builder_with_config() -> Result<()> {
        let mut config = DecoderConfig::for_protocol(Protocol::IsaMinimal);
        config.set_setting(2, 1)?;
        let session = SessionBuilder::new()
            .with_config(config.clone())
            .with_source(Capture::new(3))
            .build()?;
        assert_eq!(session.protocol(), Protocol::IsaMinimal);
        assert_eq!(session.config(), &config);
        assert!(!session.is_processed());
        Ok(())
    }

    #[test]
    fn test_lazy_decode_and_lookup() -> Result<()> {
        let (capture, reset_at) = isa_capture_with_reset();
        let mut session = SessionBuilder::new()
            .with_protocol(Protocol::Isa)
            .with_source(capture)
            .build()?;
        assert!(!session.is_processed());

        let event = session.annotation_at(reset_at)?.cloned().unwrap();
        assert!(session.is_processed());
        assert_eq!(event.text, "SYSTEM RESET");
        assert_eq!(event.class, Classification::Status);

        assert!(session.annotation_at(0)?.is_none());
        assert_eq!(session.next_marked(0)?, reset_at);
        assert_eq!(session.next_marked(reset_at)?, reset_at);
        Ok(())
    }

    #[test]
    fn test_decode_is_idempotent() -> Result<()> {
        let (source, _) = counting(None);
        let mut session = Session::new(DecoderConfig::for_protocol(Protocol::Isa), source);

        session.decode_if_needed()?;
        let first = session.store().clone();
        let reads = session.source().reads.get();
        assert!(reads > 0);

        session.decode_if_needed()?;
        session.annotation_at(3)?;
        assert_eq!(session.source().reads.get(), reads);
        assert_eq!(session.store(), &first);

        session.invalidate();
        session.decode_if_needed()?;
        assert_eq!(session.store(), &first);
        assert_eq!(session.source().reads.get(), reads * 2);
        Ok(())
    }

    #[test]
    fn test_setting_change_invalidates() -> Result<()> {
        let (capture, reset_at) = isa_capture_with_reset();
        let mut session = Session::new(DecoderConfig::for_protocol(Protocol::Isa), capture);
        session.decode_if_needed()?;
        assert!(session.is_processed());

        session.set_setting(0, 1)?;
        assert!(!session.is_processed());
        assert!(session.store().is_empty());
        assert_eq!(session.get_setting(0)?, 1);

        // A rejected write leaves the results alone
        session.decode_if_needed()?;
        assert!(session.set_setting(0, 9).is_err());
        assert!(session.is_processed());

        session.reset_config();
        assert!(!session.is_processed());
        assert_eq!(session.get_setting(0)?, 0);
        assert!(session.annotation_at(reset_at)?.is_some());
        Ok(())
    }

    #[test]
    fn test_range_change_triggers_rebuild() -> Result<()> {
        let (capture, reset_at) = isa_capture_with_reset();
        let mut session = Session::new(DecoderConfig::for_protocol(Protocol::Isa), capture);
        assert_eq!(session.store().len(), 0);
        session.decode_if_needed()?;
        assert_eq!(session.store().len(), 1);

        // A second reset pulse after the capture grew
        session.source_mut().push_repeated(&[0x0BFC | 0x1000, 0, 0, 0x7F_0000, 0], 2);
        assert_eq!(session.next_marked(reset_at)?, reset_at + 5);
        assert_eq!(session.store().len(), 2);
        Ok(())
    }

    #[test]
    fn test_empty_capture() -> Result<()> {
        let mut session = Session::new(
            DecoderConfig::for_protocol(Protocol::Pci),
            Capture::new(1),
        );
        session.decode_if_needed()?;
        assert!(session.is_processed());
        assert!(session.store().is_empty());
        assert_eq!(session.next_marked(4)?, 4);
        Ok(())
    }

    #[test]
    fn test_cancelled_pass_is_unprocessed() -> Result<()> {
        let (capture, reset_at) = isa_capture_with_reset();
        let mut session = Session::new(DecoderConfig::for_protocol(Protocol::Isa), capture);

        let cancel = AtomicBool::new(true);
        assert_eq!(session.decode_cancellable(&cancel)?, DecodeStatus::Cancelled);
        assert!(!session.is_processed());
        assert!(session.store().is_empty());

        cancel.store(false, Ordering::Relaxed);
        assert_eq!(session.decode_cancellable(&cancel)?, DecodeStatus::Complete);
        assert!(session.annotation_at(reset_at)?.is_some());
        Ok(())
    }

    #[test]
    fn test_source_failure_leaves_session_unprocessed() {
        let (source, _) = counting(Some(5));
        let mut session = Session::new(DecoderConfig::for_protocol(Protocol::Isa), source);

        let result = session.decode_if_needed();
        assert!(matches!(result, Err(DecodeError::Source(_))));
        assert!(!session.is_processed());
        assert!(session.store().is_empty());
        assert!(session.transactions().is_empty());

        session.source_mut().fail_at = None;
        assert!(session.decode_if_needed().is_ok());
        assert_eq!(session.store().len(), 1);
    }

    #[test]
    fn test_pci_session_archives_transactions() -> Result<()> {
        use crate::transaction::{PciCommand, TransactionKind};

        // FRAME# with Memory Write, one data phase, then idle
        let idle: u64 = 0x20_FF7E;
        let address = (idle & !0x4) | (0x7 << 16) | (0x100 << 32);
        let data = (idle & !(0x8 | 0x10 | 0x40)) | (0x42 << 32);
        let mut capture = Capture::new(1);
        for word in [idle, address, data, idle, idle] {
            capture.push(&[word]);
            capture.push(&[word | 0x1]);
        }

        let mut session = SessionBuilder::new()
            .with_protocol(Protocol::Pci)
            .with_source(capture)
            .build()?;
        let text = session.annotation_at(3)?.map(|a| a.text.clone());
        assert_eq!(
            text.as_deref(),
            Some("Memory Write Addr:0x00000100 Data:0x00000042 BE:0xF")
        );
        assert_eq!(session.transactions().len(), 1);
        assert_eq!(
            session.transactions()[0].kind,
            TransactionKind::Pci(PciCommand::MemoryWrite)
        );
        Ok(())
    }
}
