//! PCI bus state machine
//!
//! The machine only evaluates on a rising CLK edge, or on any sample with
//! RST# asserted. Levels are compared against the previous clocked sample,
//! so a strobe held across several unclocked samples counts once.
//!
//! ```text
//! IDLE -> ADDRESS_PHASE -> DATA_PHASE -> COMPLETION_PHASE -> IDLE
//! IDLE -> DUAL_ADDRESS_PHASE -> ADDRESS_PHASE
//! IDLE -> CONFIG_CYCLE -> DATA_PHASE
//! IDLE -> SPECIAL_CYCLE -> COMPLETION_PHASE
//! IDLE -> BUS_PARKING -> ADDRESS_PHASE | IDLE
//! ```
//!
//! Abort detection is edge based: a missing DEVSEL# when IRDY# first
//! asserts with FRAME# still held is a master abort, DEVSEL# dropping
//! mid-transfer is a target abort. There is no five-clock DEVSEL# timer.

use bitfield::bitfield;
use tracing::{debug, trace, warn};

use crate::annotation::{Emitter, EventKind};
use crate::config::PciConfig;
use crate::edge::{EdgeDetector, Edges};
use crate::error::Result;
use crate::protocol::PCI_SIGNALS;
use crate::session::BusDecoder;
use crate::signal::Signal;
use crate::source::SampleSource;
use crate::transaction::{
    BurstType, Completion, ConfigTarget, ConfigType, DataPhase, PciCommand, Transaction,
    TransactionKind,
};

/// Bus clock
pub const CLK: Signal = Signal::active_high("CLK", 0x1);
/// Bus reset
pub const RST: Signal = Signal::active_low("RST#", 0x2);
/// Transaction framing
pub const FRAME: Signal = Signal::active_low("FRAME#", 0x4);
/// Initiator ready
pub const IRDY: Signal = Signal::active_low("IRDY#", 0x8);
/// Target ready
pub const TRDY: Signal = Signal::active_low("TRDY#", 0x10);
/// Target requests termination
pub const STOP: Signal = Signal::active_low("STOP#", 0x20);
/// Target claimed the transaction
pub const DEVSEL: Signal = Signal::active_low("DEVSEL#", 0x40);
/// Even parity over AD and C/BE#
pub const PAR: Signal = Signal::active_high("PAR", 0x80);
/// Data parity error
pub const PERR: Signal = Signal::active_low("PERR#", 0x100);
/// System error
pub const SERR: Signal = Signal::active_low("SERR#", 0x200);
/// Interrupt pin A
pub const INTA: Signal = Signal::active_low("INTA#", 0x400);
/// Interrupt pin B
pub const INTB: Signal = Signal::active_low("INTB#", 0x800);
/// Interrupt pin C
pub const INTC: Signal = Signal::active_low("INTC#", 0x1000);
/// Interrupt pin D
pub const INTD: Signal = Signal::active_low("INTD#", 0x2000);
/// Bus grant
pub const GNT: Signal = Signal::active_low("GNT#", 0x4000);
/// Bus request
pub const REQ: Signal = Signal::active_low("REQ#", 0x8000);
/// Configuration device select
pub const IDSEL: Signal = Signal::active_high("IDSEL", 0x10_0000);
/// Exclusive access
pub const LOCK: Signal = Signal::active_low("LOCK#", 0x20_0000);

/// Interrupt pins in reporting order
pub const INTERRUPT_PINS: [Signal; 4] = [INTA, INTB, INTC, INTD];

/// Bytes moved by one data phase on AD[31:0]
const BYTES_PER_PHASE: u32 = 4;

bitfield! {
    /// Combined PCI signal word: control lines low, AD[31:0] in the upper half
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct PciWord(u64);
    impl Debug;
    /// C/BE[3:0]#
    pub cbe, set_cbe: 19, 16;
    /// AD[31:0]
    pub ad, set_ad: 63, 32;
}

impl PciWord {
    /// Wrap a raw group value
    pub fn from_raw(raw: u64) -> Self {
        PciWord(raw)
    }

    /// Raw group value
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Active byte lanes; C/BE# is active low
    pub fn byte_enables(&self) -> u8 {
        (!self.cbe() & 0xF) as u8
    }
}

/// Machine state; in-flight states own the partial record
#[derive(Debug, Clone, PartialEq, Default)]
enum PciState {
    #[default]
    Idle,
    BusParking,
    AddressPhase(Transaction),
    DualAddressPhase(Transaction),
    DataPhase(Transaction),
    ConfigCycle(Transaction),
    SpecialCycle(Transaction),
    CompletionPhase(Transaction),
}

impl PciState {
    fn name(&self) -> &'static str {
        match self {
            PciState::Idle => "IDLE",
            PciState::BusParking => "BUS_PARKING",
            PciState::AddressPhase(_) => "ADDRESS_PHASE",
            PciState::DualAddressPhase(_) => "DUAL_ADDRESS_PHASE",
            PciState::DataPhase(_) => "DATA_PHASE",
            PciState::ConfigCycle(_) => "CONFIG_CYCLE",
            PciState::SpecialCycle(_) => "SPECIAL_CYCLE",
            PciState::CompletionPhase(_) => "COMPLETION_PHASE",
        }
    }

    fn into_transaction(self) -> Option<Transaction> {
        match self {
            PciState::Idle | PciState::BusParking => None,
            PciState::AddressPhase(t)
            | PciState::DualAddressPhase(t)
            | PciState::DataPhase(t)
            | PciState::ConfigCycle(t)
            | PciState::SpecialCycle(t)
            | PciState::CompletionPhase(t) => Some(t),
        }
    }
}

/// One clocked sample
struct Clocked {
    sample: u64,
    bus: Edges,
    word: PciWord,
}

impl Clocked {
    fn active(&self, signal: &Signal) -> bool {
        self.bus.is_active(signal)
    }
}

fn command_of(txn: &Transaction) -> PciCommand {
    match txn.kind {
        TransactionKind::Pci(cmd) => cmd,
        TransactionKind::Isa(_) => PciCommand::Reserved4,
    }
}

/// PCI decoder for one pass over a capture
#[derive(Debug, Clone)]
pub struct PciDecoder {
    config: PciConfig,
    state: PciState,
    clock: EdgeDetector,
    last_clocked: Option<u64>,
    in_reset: bool,
}

impl PciDecoder {
    /// Create a decoder using `config`
    pub fn new(config: &PciConfig) -> Self {
        PciDecoder {
            config: config.clone(),
            state: PciState::Idle,
            clock: EdgeDetector::new(),
            last_clocked: None,
            in_reset: false,
        }
    }

    /// Name of the current state
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Whether no transaction is in flight
    pub fn is_idle(&self) -> bool {
        matches!(self.state, PciState::Idle | PciState::BusParking)
    }

    fn format_address(&self, txn: &Transaction) -> String {
        if txn.dual_address || self.config.bus_64bit {
            format!("0x{:016X}", txn.address)
        } else {
            format!("0x{:08X}", txn.address & 0xFFFF_FFFF)
        }
    }

    fn advance(&self, state: PciState, c: &Clocked, emitter: &mut Emitter<'_>) -> PciState {
        match state {
            PciState::Idle => self.idle(c, emitter),
            PciState::BusParking => self.parking(c, emitter),
            PciState::AddressPhase(t) => self.address_phase(t, c, false),
            PciState::DualAddressPhase(t) => self.dual_address_phase(t, c),
            PciState::DataPhase(t) => self.data_phase(t, c),
            PciState::ConfigCycle(t) => self.address_phase(t, c, true),
            PciState::SpecialCycle(t) => self.special_cycle(t, c),
            PciState::CompletionPhase(t) => self.completion_phase(t, c, emitter),
        }
    }

    /// Open a record from the address phase on FRAME# assertion
    fn start(&self, c: &Clocked) -> PciState {
        let command = PciCommand::from_nibble(c.word.cbe());
        let mut txn = Transaction::new(TransactionKind::Pci(command), c.sample);
        txn.address = c.word.ad();
        txn.address_valid = true;
        txn.locked = c.active(&LOCK);
        txn.request = c.active(&REQ);
        txn.grant = c.active(&GNT);
        debug!(
            sample = c.sample,
            command = %command,
            address = format_args!("0x{:08X}", txn.address),
            "transaction started"
        );

        match command {
            PciCommand::DualAddressCycle => {
                txn.dual_address = true;
                PciState::DualAddressPhase(txn)
            }
            PciCommand::SpecialCycle => PciState::SpecialCycle(txn),
            cmd if cmd.is_config() => {
                let target = ConfigTarget::decode(c.word.ad(), c.active(&IDSEL));
                debug!(
                    sample = c.sample,
                    device = target.device,
                    function = target.function,
                    config_type = ?target.config_type,
                    "configuration cycle"
                );
                txn.config = Some(target);
                PciState::ConfigCycle(txn)
            }
            _ => PciState::AddressPhase(txn),
        }
    }

    fn idle(&self, c: &Clocked, emitter: &mut Emitter<'_>) -> PciState {
        if c.active(&FRAME) {
            return self.start(c);
        }

        let arbitration = REQ.mask() | GNT.mask();
        if !c.bus.changed(arbitration) {
            return PciState::Idle;
        }
        let (text, next) = match (c.active(&REQ), c.active(&GNT)) {
            (true, false) => ("Request for bus", PciState::Idle),
            (false, true) => ("Bus grant without request", PciState::Idle),
            (true, true) => ("Bus granted to requestor", PciState::BusParking),
            (false, false) => ("Bus released", PciState::Idle),
        };
        debug!(sample = c.sample, event = text, "arbitration");
        emitter.emit(c.sample, EventKind::BusStatus, false, text);
        next
    }

    fn parking(&self, c: &Clocked, emitter: &mut Emitter<'_>) -> PciState {
        if c.active(&FRAME) {
            debug!(sample = c.sample, "transaction started from bus parking");
            return self.start(c);
        }
        if !c.active(&REQ) || !c.active(&GNT) {
            debug!(sample = c.sample, "bus parking ended");
            emitter.emit(c.sample, EventKind::BusStatus, false, "End of bus parking");
            return PciState::Idle;
        }
        PciState::BusParking
    }

    fn dual_address_phase(&self, mut txn: Transaction, c: &Clocked) -> PciState {
        txn.address |= c.word.ad() << 32;
        let command = PciCommand::from_nibble(c.word.cbe());
        txn.kind = TransactionKind::Pci(command);
        debug!(
            sample = c.sample,
            command = %command,
            address = format_args!("0x{:016X}", txn.address),
            "dual address phase"
        );
        PciState::AddressPhase(txn)
    }

    fn master_abort(&self, mut txn: Transaction, c: &Clocked, reason: &str) -> PciState {
        warn!(sample = c.sample, reason, "master abort");
        txn.faults.master_abort = true;
        txn.completion = Some(Completion::MasterAbort);
        txn.end = c.sample;
        PciState::CompletionPhase(txn)
    }

    /// Waiting for IRDY#; shared by ordinary and configuration commands.
    ///
    /// With FRAME# already released the target may still claim the last
    /// data phase, so DEVSEL# is only required while FRAME# is held.
    fn address_phase(&self, txn: Transaction, c: &Clocked, config: bool) -> PciState {
        if c.active(&IRDY) {
            if c.active(&FRAME) && !c.active(&DEVSEL) {
                return self.master_abort(txn, c, "no DEVSEL# response");
            }
            trace!(sample = c.sample, "address phase -> data phase");
            return self.data_phase(txn, c);
        }
        if c.bus.released(&FRAME) {
            return self.master_abort(txn, c, "FRAME# released before IRDY#");
        }
        if config {
            PciState::ConfigCycle(txn)
        } else {
            PciState::AddressPhase(txn)
        }
    }

    fn data_phase(&self, mut txn: Transaction, c: &Clocked) -> PciState {
        let irdy = c.active(&IRDY);
        let trdy = c.active(&TRDY);
        let stop = c.active(&STOP);
        let frame = c.active(&FRAME);

        if c.active(&PERR) && !txn.faults.parity_error {
            warn!(sample = c.sample, "parity error");
            txn.faults.parity_error = true;
        }
        if c.active(&SERR) && !txn.faults.system_error {
            warn!(sample = c.sample, "system error");
            txn.faults.system_error = true;
        }

        if irdy && trdy {
            let phase = DataPhase {
                value: c.word.ad(),
                byte_enables: c.word.byte_enables(),
            };
            if txn.push_phase(phase) {
                debug!(
                    sample = c.sample,
                    phase = txn.phases.len(),
                    data = format_args!("0x{:08X}", phase.value),
                    be = format_args!("0x{:X}", phase.byte_enables),
                    "data phase"
                );
            } else {
                trace!(sample = c.sample, dropped = txn.dropped_phases, "data phase not stored");
            }
        }

        if c.bus.released(&DEVSEL) {
            warn!(sample = c.sample, "target abort");
            txn.faults.target_abort = true;
            txn.completion = Some(Completion::TargetAbort);
            txn.end = c.sample;
            return PciState::CompletionPhase(txn);
        }

        if stop && !trdy {
            debug!(sample = c.sample, "retry");
            txn.completion = Some(Completion::Retry);
            txn.end = c.sample;
            return PciState::CompletionPhase(txn);
        }

        if stop && trdy {
            debug!(sample = c.sample, phases = txn.phase_count(), "disconnect");
            txn.completion = Some(Completion::Disconnect);
            if txn.phases_full() {
                return self.close_data(txn, c);
            }
        }

        if !frame && irdy && trdy {
            return self.close_data(txn, c);
        }

        if !frame && !irdy {
            warn!(sample = c.sample, "bus went idle without a final data phase");
            txn.faults.protocol_error = true;
            txn.end = c.sample;
            return PciState::CompletionPhase(txn);
        }
        PciState::DataPhase(txn)
    }

    /// Final data phase seen: classify the burst
    fn close_data(&self, mut txn: Transaction, c: &Clocked) -> PciState {
        let burst = BurstType::classify(txn.phase_count(), command_of(&txn));
        debug!(
            sample = c.sample,
            phases = txn.phase_count(),
            burst = burst.name(),
            "final data phase"
        );
        txn.burst = Some(burst);
        txn.completion.get_or_insert(Completion::Normal);
        txn.end = c.sample;
        PciState::CompletionPhase(txn)
    }

    fn special_cycle(&self, mut txn: Transaction, c: &Clocked) -> PciState {
        let irdy = c.active(&IRDY);
        if irdy && txn.phases.is_empty() {
            debug!(
                sample = c.sample,
                message = format_args!("0x{:08X}", c.word.ad()),
                "special cycle message"
            );
            txn.push_phase(DataPhase {
                value: c.word.ad(),
                byte_enables: c.word.byte_enables(),
            });
        }
        if irdy && !c.active(&FRAME) {
            txn.burst = Some(BurstType::Single);
            txn.completion = Some(Completion::Normal);
            txn.end = c.sample;
            return PciState::CompletionPhase(txn);
        }
        PciState::SpecialCycle(txn)
    }

    fn completion_phase(
        &self,
        txn: Transaction,
        c: &Clocked,
        emitter: &mut Emitter<'_>,
    ) -> PciState {
        if c.active(&IRDY) || c.active(&FRAME) {
            return PciState::CompletionPhase(txn);
        }
        self.complete(txn, c.sample, emitter);
        PciState::Idle
    }

    fn detail(&self, txn: &Transaction) -> Option<String> {
        if let Some(target) = txn.config {
            let kind = match target.config_type {
                ConfigType::Type0 => "Type0",
                ConfigType::Type1 => "Type1",
            };
            return Some(format!(
                "Dev:{} Func:{} {}",
                target.device, target.function, kind
            ));
        }
        if let Some(completion) = txn.completion.filter(|c| *c != Completion::Normal) {
            return Some(format!("Completion:{}", completion.name()));
        }
        if txn.phase_count() > 1 {
            let burst = txn.burst.unwrap_or(BurstType::Continuous);
            let mut text = format!("Burst:{} Phases:{}", burst.name(), txn.phase_count());
            if let (BurstType::Line, Some(line)) = (burst, self.config.cache_line_bytes()) {
                let bytes = txn.phase_count() as u32 * BYTES_PER_PHASE;
                text.push_str(&format!(" Lines:{}", bytes.div_ceil(line)));
            }
            return Some(text);
        }
        None
    }

    fn complete(&self, mut txn: Transaction, sample: u64, emitter: &mut Emitter<'_>) {
        let mut parts = vec![txn.kind.to_string(), format!("Addr:{}", self.format_address(&txn))];
        if let Some(first) = txn.phases.first() {
            parts.push(format!("Data:0x{:08X}", first.value & 0xFFFF_FFFF));
            parts.push(format!("BE:0x{:X}", first.byte_enables));
        }
        if let Some(detail) = self.detail(&txn) {
            parts.push(detail);
        }

        let error = txn.is_error();
        let kind = if !error && txn.completion == Some(Completion::Disconnect) {
            EventKind::Notice
        } else {
            EventKind::Transfer
        };
        debug!(sample, command = %txn.kind, error, "transaction completed");
        txn.end = sample;
        emitter.emit(txn.start, kind, error, parts.join(" "));
        emitter.archive(txn);
    }

    /// One annotation per contiguous reset run; aborts any transaction in flight
    fn handle_reset(&mut self, sample: u64, emitter: &mut Emitter<'_>) {
        let state = std::mem::take(&mut self.state);
        if self.in_reset {
            return;
        }
        self.in_reset = true;

        match state.into_transaction() {
            None => {
                debug!(sample, "bus reset");
                emitter.emit(sample, EventKind::BusStatus, false, "PCI Reset");
            }
            Some(mut txn) => {
                warn!(sample, command = %txn.kind, "bus reset aborted transaction");
                txn.faults.protocol_error = true;
                txn.end = sample;
                emitter.emit(
                    sample,
                    EventKind::BusStatus,
                    true,
                    "PCI Reset during transaction",
                );
                emitter.archive(txn);
            }
        }
    }

    /// First pin change in A..D order; assertions before releases
    fn check_interrupts(&self, c: &Clocked, emitter: &mut Emitter<'_>) {
        let text = if let Some(pin) = INTERRUPT_PINS.iter().find(|p| c.bus.asserted(p)) {
            format!("{} Asserted", pin.name())
        } else if let Some(pin) = INTERRUPT_PINS.iter().find(|p| c.bus.released(p)) {
            format!("{} Deasserted", pin.name())
        } else {
            return;
        };
        debug!(sample = c.sample, event = %text, "interrupt");
        emitter.emit(c.sample, EventKind::BusStatus, false, text);
    }
}

impl BusDecoder for PciDecoder {
    fn step<S: SampleSource + ?Sized>(
        &mut self,
        sample: u64,
        source: &S,
        emitter: &mut Emitter<'_>,
    ) -> Result<()> {
        let raw = source.group_value(sample, PCI_SIGNALS)?;
        let clock = self.clock.update(raw);

        // Reset pre-empts everything else on the sample
        if RST.is_active(raw) {
            self.handle_reset(sample, emitter);
            self.last_clocked = Some(raw);
            return Ok(());
        }
        self.in_reset = false;

        if !clock.asserted(&CLK) {
            return Ok(());
        }

        let c = Clocked {
            sample,
            bus: Edges::new(self.last_clocked.unwrap_or(raw), raw),
            word: PciWord::from_raw(raw),
        };
        trace!(
            sample,
            signals = format_args!("0x{:06X}", raw & 0x3F_FFFF),
            ad = format_args!("0x{:08X}", c.word.ad()),
            state = self.state.name(),
            "CLK rising edge"
        );

        let state = std::mem::take(&mut self.state);
        let before = state.name();
        self.state = self.advance(state, &c, emitter);
        if before != self.state.name() {
            trace!(sample, from = before, to = self.state.name(), "state change");
        }

        self.check_interrupts(&c, emitter);
        self.last_clocked = Some(raw);
        Ok(())
    }

    fn finish(&mut self, last_sample: u64, emitter: &mut Emitter<'_>) {
        let state = std::mem::take(&mut self.state);
        let state_name = state.name();
        let Some(mut txn) = state.into_transaction() else {
            return;
        };
        txn.end = last_sample;
        warn!(command = %txn.kind, state = state_name, "incomplete transaction at end of capture");
        emitter.emit(
            txn.start,
            EventKind::Notice,
            false,
            format!(
                "WARNING: Incomplete {} | Addr: {} | State: {}",
                txn.kind,
                self.format_address(&txn),
                state_name
            ),
        );
        emitter.archive(txn);
    }
}
