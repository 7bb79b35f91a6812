//! ISA bus state machine
//!
//! One machine serves both the full ISA profile (five signal groups, DMA,
//! interrupts, IOCHK#) and the reduced profile (control, address and data
//! only). The profiles differ in their control-bit layout and in which
//! orthogonal checks run; the bus-cycle states are shared.
//!
//! ```text
//! IDLE -> T1 -> T2 -> [TW ...] -> T3 -> IDLE
//! IDLE -> DMA_ACTIVE -> IDLE
//! IDLE -> REFRESH -> IDLE
//! ```

use tracing::{debug, trace, warn};

use crate::annotation::{Emitter, EventKind};
use crate::config::{AddressWidth, IsaConfig, IsaMinimalConfig};
use crate::edge::{EdgeDetector, Edges};
use crate::error::Result;
use crate::limits::{MAX_BUS_CYCLES, MAX_WAIT_STATES};
use crate::protocol::{ISA_ADDR, ISA_CONTROL, ISA_DATA, ISA_DMA, ISA_IRQ};
use crate::session::BusDecoder;
use crate::signal::{PriorityTable, Signal};
use crate::source::SampleSource;
use crate::transaction::{DataPhase, Faults, IsaKind, Transaction, TransactionKind, Width};

/// Control-group bit assignments of one ISA profile
#[derive(Debug, Clone, Copy)]
pub struct IsaLayout {
    /// Bus clock
    pub bclk: Signal,
    /// Address latch enable
    pub ale: Signal,
    /// I/O read strobe
    pub ior: Signal,
    /// I/O write strobe
    pub iow: Signal,
    /// Memory read strobe
    pub memr: Signal,
    /// Memory write strobe
    pub memw: Signal,
    /// Refresh strobe
    pub refresh: Signal,
    /// System bus high enable
    pub sbhe: Signal,
    /// Channel ready; low requests wait states
    pub iochrdy: Signal,
    /// System reset
    pub reset: Signal,
    /// I/O channel check, absent from the reduced profile
    pub iochk: Option<Signal>,
}

impl IsaLayout {
    fn commands(&self) -> [Signal; 4] {
        [self.ior, self.iow, self.memr, self.memw]
    }
}

/// Full ISA control layout
pub const FULL_LAYOUT: IsaLayout = IsaLayout {
    bclk: Signal::active_high("BCLK", 0x1),
    ale: Signal::active_high("ALE", 0x2),
    ior: Signal::active_low("IOR#", 0x4),
    iow: Signal::active_low("IOW#", 0x8),
    memr: Signal::active_low("MEMR#", 0x10),
    memw: Signal::active_low("MEMW#", 0x20),
    refresh: Signal::active_low("REFRESH#", 0x40),
    sbhe: Signal::active_low("SBHE#", 0x100),
    iochrdy: Signal::active_high("IOCHRDY", 0x200),
    reset: Signal::active_high("RESET", 0x1000),
    iochk: Some(Signal::active_low("IOCHK#", 0x800)),
};

/// Reduced ISA control layout
pub const MINIMAL_LAYOUT: IsaLayout = IsaLayout {
    bclk: Signal::active_high("BCLK", 0x1),
    ale: Signal::active_high("ALE", 0x2),
    ior: Signal::active_low("IOR#", 0x4),
    iow: Signal::active_low("IOW#", 0x8),
    memr: Signal::active_low("MEMR#", 0x10),
    memw: Signal::active_low("MEMW#", 0x20),
    refresh: Signal::active_low("REFRESH#", 0x40),
    sbhe: Signal::active_low("SBHE#", 0x80),
    iochrdy: Signal::active_high("IOCHRDY", 0x100),
    reset: Signal::active_high("RESET", 0x400),
    iochk: None,
};

const DACK_LINES: [(u8, Signal); 7] = [
    (0, Signal::active_low("DACK0#", 0x01_0000)),
    (1, Signal::active_low("DACK1#", 0x02_0000)),
    (2, Signal::active_low("DACK2#", 0x04_0000)),
    (3, Signal::active_low("DACK3#", 0x08_0000)),
    (5, Signal::active_low("DACK5#", 0x10_0000)),
    (6, Signal::active_low("DACK6#", 0x20_0000)),
    (7, Signal::active_low("DACK7#", 0x40_0000)),
];

const IRQ_LINES: [(u8, Signal); 12] = [
    (2, Signal::active_high("IRQ2", 0x001)),
    (3, Signal::active_high("IRQ3", 0x002)),
    (4, Signal::active_high("IRQ4", 0x004)),
    (5, Signal::active_high("IRQ5", 0x008)),
    (6, Signal::active_high("IRQ6", 0x010)),
    (7, Signal::active_high("IRQ7", 0x020)),
    (9, Signal::active_high("IRQ9", 0x800)),
    (10, Signal::active_high("IRQ10", 0x040)),
    (11, Signal::active_high("IRQ11", 0x080)),
    (12, Signal::active_high("IRQ12", 0x100)),
    (14, Signal::active_high("IRQ14", 0x200)),
    (15, Signal::active_high("IRQ15", 0x400)),
];

/// DMA acknowledge channels; the first asserted channel wins
pub static DMA_CHANNELS: PriorityTable = PriorityTable::new(&DACK_LINES);

/// Interrupt request lines; the first asserted line wins
pub static INTERRUPT_LINES: PriorityTable = PriorityTable::new(&IRQ_LINES);

/// DMA terminal count
pub const TERMINAL_COUNT: Signal = Signal::active_high("TC", 0x4000_0000);

/// Which flavour of the ISA bus is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsaProfile {
    /// Five groups with DMA, interrupts and IOCHK#
    Full,
    /// Control, address and data groups only
    Minimal,
}

impl IsaProfile {
    /// Control-bit layout
    pub fn layout(&self) -> &'static IsaLayout {
        match self {
            IsaProfile::Full => &FULL_LAYOUT,
            IsaProfile::Minimal => &MINIMAL_LAYOUT,
        }
    }
}

/// Behaviour switches resolved from the configuration at pass start
#[derive(Debug, Clone, PartialEq)]
pub struct IsaSettings {
    /// Latched address width
    pub address_width: AddressWidth,
    /// Decode DMA cycles
    pub dma: bool,
    /// Decode refresh cycles
    pub refresh: bool,
    /// Report interrupt requests
    pub irq: bool,
    /// Enforce timeouts and report IOCHK#
    pub error_detection: bool,
    /// Mask applied to each data sample
    pub data_mask: u64,
    /// SBHE# may select 16-bit transfers
    pub word_transfers: bool,
}

impl From<&IsaConfig> for IsaSettings {
    fn from(config: &IsaConfig) -> Self {
        IsaSettings {
            address_width: config.address_width,
            dma: config.dma_support,
            refresh: config.refresh_support,
            irq: config.irq_support,
            error_detection: config.error_detection,
            data_mask: 0xFFFF,
            word_transfers: true,
        }
    }
}

impl From<&IsaMinimalConfig> for IsaSettings {
    fn from(config: &IsaMinimalConfig) -> Self {
        IsaSettings {
            address_width: config.address_width,
            dma: false,
            refresh: true,
            irq: false,
            error_detection: true,
            data_mask: config.data_mask(),
            word_transfers: config.data_16bit,
        }
    }
}

/// A CPU or bus-master cycle in T1..T3
#[derive(Debug, Clone, PartialEq)]
struct BusCycle {
    kind: IsaKind,
    start: u64,
    partial_address: u64,
    address: Option<u64>,
    data: Option<u64>,
    pending_data: Option<u64>,
    wait_states: u32,
    cycles: u32,
    faults: Faults,
}

impl BusCycle {
    fn new(kind: IsaKind, start: u64, partial_address: u64) -> Self {
        BusCycle {
            kind,
            start,
            partial_address,
            address: None,
            data: None,
            pending_data: None,
            wait_states: 0,
            cycles: 0,
            faults: Faults::default(),
        }
    }

    fn captured_data(&self) -> Option<u64> {
        if self.kind.is_read() {
            self.data.or(self.pending_data)
        } else {
            self.data
        }
    }

    fn into_transaction(self, end: u64) -> Transaction {
        let mut txn = Transaction::new(TransactionKind::Isa(self.kind), self.start);
        txn.end = end;
        txn.address = self.address.unwrap_or(self.partial_address);
        txn.address_valid = self.address.is_some();
        if let Some(value) = self.captured_data() {
            txn.push_phase(DataPhase {
                value,
                byte_enables: 0,
            });
        }
        txn.wait_states = self.wait_states;
        txn.bus_cycles = self.cycles;
        txn.faults = self.faults;
        txn
    }
}

/// A DMA acknowledge cycle
#[derive(Debug, Clone, PartialEq)]
struct DmaCycle {
    channel: u8,
    start: u64,
    width: Width,
    ior: bool,
    iow: bool,
    memr: bool,
    memw: bool,
    address: Option<u64>,
    data: Option<u64>,
    terminal_count: bool,
}

impl DmaCycle {
    fn new(channel: u8, start: u64, width: Width, terminal_count: bool) -> Self {
        DmaCycle {
            channel,
            start,
            width,
            ior: false,
            iow: false,
            memr: false,
            memw: false,
            address: None,
            data: None,
            terminal_count,
        }
    }

    /// First strobe seen in MEMR#, MEMW#, IOR#, IOW# order sets the direction
    fn kind(&self) -> IsaKind {
        let strobes = [
            (self.memr, IsaKind::DmaRead(self.width)),
            (self.memw, IsaKind::DmaWrite(self.width)),
            (self.ior, IsaKind::DmaRead(self.width)),
            (self.iow, IsaKind::DmaWrite(self.width)),
        ];
        strobes
            .into_iter()
            .find_map(|(seen, kind)| seen.then_some(kind))
            .unwrap_or(IsaKind::DmaTransfer)
    }

    fn into_transaction(self, end: u64) -> Transaction {
        let mut txn = Transaction::new(TransactionKind::Isa(self.kind()), self.start);
        txn.end = end;
        txn.address = self.address.unwrap_or(0);
        txn.address_valid = self.address.is_some();
        if let Some(value) = self.data {
            txn.push_phase(DataPhase {
                value,
                byte_enables: 0,
            });
        }
        txn.dma_channel = Some(self.channel);
        txn.terminal_count = self.terminal_count;
        txn
    }
}

/// A memory refresh cycle
#[derive(Debug, Clone, PartialEq)]
struct RefreshCycle {
    start: u64,
    cycles: u32,
}

impl RefreshCycle {
    fn into_transaction(self, end: u64) -> Transaction {
        let mut txn = Transaction::new(TransactionKind::Isa(IsaKind::Refresh), self.start);
        txn.end = end;
        txn.bus_cycles = self.cycles;
        txn
    }
}

/// Machine state; each in-flight state owns its partial record
#[derive(Debug, Clone, PartialEq, Default)]
enum IsaState {
    #[default]
    Idle,
    T1(BusCycle),
    T2(BusCycle),
    Wait(BusCycle),
    T3(BusCycle),
    Dma(DmaCycle),
    Refresh(RefreshCycle),
}

impl IsaState {
    fn name(&self) -> &'static str {
        match self {
            IsaState::Idle => "IDLE",
            IsaState::T1(_) => "T1",
            IsaState::T2(_) => "T2",
            IsaState::Wait(_) => "TW",
            IsaState::T3(_) => "T3",
            IsaState::Dma(_) => "DMA_ACTIVE",
            IsaState::Refresh(_) => "REFRESH",
        }
    }

    /// Close out whatever record is in flight
    fn into_transaction(self, end: u64) -> Option<Transaction> {
        match self {
            IsaState::Idle => None,
            IsaState::T1(c) | IsaState::T2(c) | IsaState::Wait(c) | IsaState::T3(c) => {
                Some(c.into_transaction(end))
            }
            IsaState::Dma(c) => Some(c.into_transaction(end)),
            IsaState::Refresh(c) => Some(c.into_transaction(end)),
        }
    }
}

/// Decoded inputs of one sample
struct Inputs {
    sample: u64,
    ctrl: Edges,
    address: Edges,
    data: Edges,
    dma_channel: Option<u8>,
    terminal_count: bool,
    irq_line: Option<u8>,
}

/// ISA decoder for one pass over a capture
#[derive(Debug, Clone)]
pub struct IsaDecoder {
    profile: IsaProfile,
    settings: IsaSettings,
    state: IsaState,
    ctrl: EdgeDetector,
    address: EdgeDetector,
    data: EdgeDetector,
    irq_line: Option<u8>,
    in_reset: bool,
}

impl IsaDecoder {
    /// Create a decoder for `profile`
    pub fn new(profile: IsaProfile, settings: IsaSettings) -> Self {
        IsaDecoder {
            profile,
            settings,
            state: IsaState::Idle,
            ctrl: EdgeDetector::new(),
            address: EdgeDetector::new(),
            data: EdgeDetector::new(),
            irq_line: None,
            in_reset: false,
        }
    }

    /// Full ISA decoder
    pub fn full(config: &IsaConfig) -> Self {
        Self::new(IsaProfile::Full, IsaSettings::from(config))
    }

    /// Reduced ISA decoder
    pub fn minimal(config: &IsaMinimalConfig) -> Self {
        Self::new(IsaProfile::Minimal, IsaSettings::from(config))
    }

    /// Profile being decoded
    pub fn profile(&self) -> IsaProfile {
        self.profile
    }

    /// Name of the current state
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Whether no transaction is in flight
    pub fn is_idle(&self) -> bool {
        self.state == IsaState::Idle
    }

    fn layout(&self) -> &'static IsaLayout {
        self.profile.layout()
    }

    fn format_address(&self, address: u64) -> String {
        let width = self.settings.address_width;
        format!(
            "0x{:0digits$X}",
            address & width.mask(),
            digits = width.digits()
        )
    }

    fn width(&self, ctrl: &Edges) -> Width {
        Width::from_sbhe(self.settings.word_transfers && ctrl.is_active(&self.layout().sbhe))
    }

    /// Kind selected by the asserted command, IOR# first
    fn kind_from_levels(&self, ctrl: &Edges) -> Option<IsaKind> {
        let l = self.layout();
        let width = self.width(ctrl);
        if ctrl.is_active(&l.ior) {
            Some(IsaKind::IoRead(width))
        } else if ctrl.is_active(&l.iow) {
            Some(IsaKind::IoWrite(width))
        } else if ctrl.is_active(&l.memr) {
            Some(IsaKind::MemoryRead(width))
        } else if ctrl.is_active(&l.memw) {
            Some(IsaKind::MemoryWrite(width))
        } else {
            None
        }
    }

    /// Kind selected by a command assert edge on this sample
    fn kind_from_edges(&self, ctrl: &Edges) -> Option<IsaKind> {
        let l = self.layout();
        let width = self.width(ctrl);
        if ctrl.asserted(&l.ior) {
            Some(IsaKind::IoRead(width))
        } else if ctrl.asserted(&l.iow) {
            Some(IsaKind::IoWrite(width))
        } else if ctrl.asserted(&l.memr) {
            Some(IsaKind::MemoryRead(width))
        } else if ctrl.asserted(&l.memw) {
            Some(IsaKind::MemoryWrite(width))
        } else {
            None
        }
    }

    fn read_inputs<S: SampleSource + ?Sized>(&mut self, sample: u64, source: &S) -> Result<Inputs> {
        let ctrl = source.group_value(sample, ISA_CONTROL)?;
        let address = source.group_value(sample, ISA_ADDR)?;
        let data = source.group_value(sample, ISA_DATA)? & self.settings.data_mask;

        let (dma_channel, terminal_count, irq_line) = match self.profile {
            IsaProfile::Full => {
                let dma = source.group_value(sample, ISA_DMA)?;
                let irq = source.group_value(sample, ISA_IRQ)?;
                (
                    DMA_CHANNELS.identify(dma),
                    TERMINAL_COUNT.is_active(dma),
                    INTERRUPT_LINES.identify(irq),
                )
            }
            IsaProfile::Minimal => (None, false, None),
        };

        trace!(
            sample,
            ctrl = format_args!("0x{:04X}", ctrl),
            address = format_args!("0x{:06X}", address),
            data = format_args!("0x{:04X}", data),
            "ISA sample"
        );

        Ok(Inputs {
            sample,
            ctrl: self.ctrl.update(ctrl),
            address: self.address.update(address),
            data: self.data.update(data),
            dma_channel,
            terminal_count,
            irq_line,
        })
    }

    fn clock_rose(&self, inputs: &Inputs) -> bool {
        inputs.ctrl.asserted(&self.layout().bclk)
    }

    fn ready(&self, inputs: &Inputs) -> bool {
        inputs.ctrl.is_active(&self.layout().iochrdy)
    }

    fn advance(&self, state: IsaState, inputs: &Inputs, emitter: &mut Emitter<'_>) -> IsaState {
        match state {
            IsaState::Idle => self.idle(inputs),
            IsaState::T1(c) => self.t1(c, inputs),
            IsaState::T2(c) => self.t2(c, inputs),
            IsaState::Wait(c) => self.wait(c, inputs),
            IsaState::T3(c) => self.t3(c, inputs, emitter),
            IsaState::Dma(c) => self.dma(c, inputs, emitter),
            IsaState::Refresh(c) => self.refresh(c, inputs, emitter),
        }
    }

    fn idle(&self, inputs: &Inputs) -> IsaState {
        let l = self.layout();
        let ctrl = &inputs.ctrl;
        let started = ctrl.asserted(&l.ale)
            || l.commands().iter().any(|s| ctrl.asserted(s))
            || ctrl.asserted(&l.refresh);
        if !started {
            return IsaState::Idle;
        }

        let sample = inputs.sample;
        if let (Some(channel), true) = (inputs.dma_channel, self.settings.dma) {
            debug!(sample, channel, "DMA cycle started");
            let mut cycle = DmaCycle::new(channel, sample, self.width(ctrl), inputs.terminal_count);
            cycle.ior = ctrl.is_active(&l.ior);
            cycle.iow = ctrl.is_active(&l.iow);
            cycle.memr = ctrl.is_active(&l.memr);
            cycle.memw = ctrl.is_active(&l.memw);
            return IsaState::Dma(cycle);
        }

        if self.settings.refresh && ctrl.is_active(&l.refresh) {
            debug!(sample, "refresh cycle started");
            return IsaState::Refresh(RefreshCycle { start: sample, cycles: 0 });
        }

        let kind = self.kind_from_levels(ctrl).unwrap_or(IsaKind::Unclassified);
        let partial = inputs.address.current() & self.settings.address_width.mask();
        debug!(sample, kind = %kind, "bus cycle started");
        IsaState::T1(BusCycle::new(kind, sample, partial))
    }

    fn t1(&self, mut c: BusCycle, inputs: &Inputs) -> IsaState {
        let l = self.layout();
        let ctrl = &inputs.ctrl;
        let mask = self.settings.address_width.mask();

        if ctrl.is_active(&l.ale) {
            c.partial_address = inputs.address.current() & mask;
        }
        if ctrl.released(&l.ale) {
            c.address = Some(c.partial_address);
            debug!(
                sample = inputs.sample,
                address = %self.format_address(c.partial_address),
                "address latched"
            );
        }

        if c.kind == IsaKind::Unclassified {
            if let Some(kind) = self.kind_from_edges(ctrl) {
                debug!(sample = inputs.sample, kind = %kind, "cycle classified");
                c.kind = kind;
            }
        }

        if self.clock_rose(inputs) {
            c.cycles += 1;
            trace!(sample = inputs.sample, "T1 -> T2");
            return IsaState::T2(c);
        }
        IsaState::T1(c)
    }

    fn t2(&self, mut c: BusCycle, inputs: &Inputs) -> IsaState {
        if c.kind.is_read() && inputs.data.changed(u64::MAX) {
            c.pending_data = Some(inputs.data.current());
        }

        if !self.clock_rose(inputs) {
            return IsaState::T2(c);
        }
        c.cycles += 1;

        // Writes drive the bus from T2 on
        if c.kind.is_write() {
            c.data = Some(inputs.data.current());
            debug!(
                sample = inputs.sample,
                data = format_args!("0x{:04X}", inputs.data.current()),
                "write data captured"
            );
        }

        if self.ready(inputs) {
            trace!(sample = inputs.sample, "T2 -> T3");
            IsaState::T3(c)
        } else {
            debug!(sample = inputs.sample, "wait state requested");
            IsaState::Wait(c)
        }
    }

    fn wait(&self, mut c: BusCycle, inputs: &Inputs) -> IsaState {
        let mut done = false;
        if self.clock_rose(inputs) {
            c.wait_states += 1;
            done = self.ready(inputs);
            if done {
                debug!(
                    sample = inputs.sample,
                    wait_states = c.wait_states,
                    "wait released"
                );
            }
        }

        if c.wait_states > MAX_WAIT_STATES && self.settings.error_detection {
            warn!(
                sample = inputs.sample,
                wait_states = c.wait_states,
                "excessive wait states, forcing completion"
            );
            c.faults.timed_out = true;
            c.faults.protocol_error = true;
            done = true;
        }

        if done {
            IsaState::T3(c)
        } else {
            IsaState::Wait(c)
        }
    }

    fn t3(&self, mut c: BusCycle, inputs: &Inputs, emitter: &mut Emitter<'_>) -> IsaState {
        if self.clock_rose(inputs) {
            c.cycles += 1;
            if c.kind.is_read() && c.data.is_none() {
                c.data = Some(inputs.data.current());
                debug!(
                    sample = inputs.sample,
                    data = format_args!("0x{:04X}", inputs.data.current()),
                    "read data captured"
                );
            }
        }

        let released = self
            .layout()
            .commands()
            .iter()
            .any(|s| inputs.ctrl.released(s));
        if released {
            self.complete(c, inputs.sample, emitter);
            return IsaState::Idle;
        }

        if c.cycles > MAX_BUS_CYCLES && self.settings.error_detection {
            warn!(
                sample = inputs.sample,
                cycles = c.cycles,
                "command held too long, transaction timed out"
            );
            c.faults.timed_out = true;
            c.faults.protocol_error = true;
            let text = format!(
                "ERROR: {} transaction timed out | Addr: {} | Cycles: {}",
                c.kind,
                self.format_address(c.address.unwrap_or(c.partial_address)),
                c.cycles
            );
            emitter.emit(c.start, EventKind::Transfer, true, text);
            emitter.archive(c.into_transaction(inputs.sample));
            return IsaState::Idle;
        }
        IsaState::T3(c)
    }

    fn complete(&self, c: BusCycle, sample: u64, emitter: &mut Emitter<'_>) {
        let width = c.kind.width().unwrap_or(Width::Byte);
        let shown = c
            .captured_data()
            .map(|d| d & width.data_mask())
            .unwrap_or(width.data_mask());
        let address = self.format_address(c.address.unwrap_or(c.partial_address));
        let text = match width {
            Width::Byte => format!(
                "{} | Addr: {} | Data: 0x{:02X} | Wait: {}",
                c.kind, address, shown, c.wait_states
            ),
            Width::Word => format!(
                "{} | Addr: {} | Data: 0x{:04X} | Wait: {}",
                c.kind, address, shown, c.wait_states
            ),
        };
        debug!(sample, kind = %c.kind, "bus cycle completed");
        emitter.emit(c.start, EventKind::Transfer, c.faults.protocol_error, text);
        emitter.archive(c.into_transaction(sample));
    }

    fn dma(&self, c: DmaCycle, inputs: &Inputs, emitter: &mut Emitter<'_>) -> IsaState {
        let l = self.layout();
        let ctrl = &inputs.ctrl;

        let mut c = if inputs.dma_channel != Some(c.channel) {
            debug!(sample = inputs.sample, channel = c.channel, "DMA cycle completed");
            self.finish_dma(c, inputs.sample, emitter);
            match inputs.dma_channel {
                Some(channel) => {
                    debug!(sample = inputs.sample, channel, "DMA cycle started");
                    DmaCycle::new(
                        channel,
                        inputs.sample,
                        self.width(ctrl),
                        inputs.terminal_count,
                    )
                }
                None => return IsaState::Idle,
            }
        } else {
            c
        };

        c.ior |= ctrl.is_active(&l.ior);
        c.iow |= ctrl.is_active(&l.iow);
        c.memr |= ctrl.is_active(&l.memr);
        c.memw |= ctrl.is_active(&l.memw);

        if c.address.is_none() && inputs.address.changed(u64::MAX) {
            c.address = Some(inputs.address.current() & self.settings.address_width.mask());
        }
        if c.data.is_none() && inputs.data.changed(u64::MAX) {
            c.data = Some(inputs.data.current());
        }
        if inputs.terminal_count && !c.terminal_count {
            debug!(sample = inputs.sample, channel = c.channel, "terminal count");
            c.terminal_count = true;
        }
        IsaState::Dma(c)
    }

    fn finish_dma(&self, c: DmaCycle, sample: u64, emitter: &mut Emitter<'_>) {
        let text = format!(
            "{} | Channel: {} | Addr: {} | Data: 0x{:04X} | TC: {}",
            c.kind(),
            c.channel,
            self.format_address(c.address.unwrap_or(0)),
            c.data.unwrap_or(0xFFFF),
            if c.terminal_count { "Yes" } else { "No" }
        );
        emitter.emit(c.start, EventKind::Dma, false, text);
        emitter.archive(c.into_transaction(sample));
    }

    fn refresh(&self, mut c: RefreshCycle, inputs: &Inputs, emitter: &mut Emitter<'_>) -> IsaState {
        if self.clock_rose(inputs) {
            c.cycles += 1;
        }

        if inputs.ctrl.released(&self.layout().refresh) {
            debug!(sample = inputs.sample, cycles = c.cycles, "refresh completed");
            emitter.emit(
                c.start,
                EventKind::Refresh,
                false,
                format!("Memory Refresh Cycle | Cycles: {}", c.cycles),
            );
            emitter.archive(c.into_transaction(inputs.sample));
            return IsaState::Idle;
        }

        if c.cycles > MAX_BUS_CYCLES && self.settings.error_detection {
            warn!(sample = inputs.sample, cycles = c.cycles, "refresh timed out");
            emitter.emit(
                c.start,
                EventKind::Refresh,
                true,
                format!("ERROR: Refresh cycle timed out | Cycles: {}", c.cycles),
            );
            let mut txn = c.into_transaction(inputs.sample);
            txn.faults.timed_out = true;
            txn.faults.protocol_error = true;
            emitter.archive(txn);
            return IsaState::Idle;
        }
        IsaState::Refresh(c)
    }

    /// One annotation per contiguous reset run; aborts any cycle in flight
    fn handle_reset(&mut self, sample: u64, emitter: &mut Emitter<'_>) {
        let state = std::mem::take(&mut self.state);
        if self.in_reset {
            return;
        }
        self.in_reset = true;

        match state.into_transaction(sample) {
            None => {
                debug!(sample, "system reset");
                emitter.emit(sample, EventKind::BusStatus, false, "SYSTEM RESET");
            }
            Some(mut txn) => {
                warn!(sample, kind = %txn.kind, "system reset aborted transaction");
                txn.faults.protocol_error = true;
                let text = format!(
                    "SYSTEM RESET | Aborted {} | Addr: {}",
                    txn.kind,
                    self.format_address(txn.address)
                );
                emitter.emit(sample, EventKind::BusStatus, true, text);
                emitter.archive(txn);
            }
        }
    }

    fn check_interrupts(&mut self, inputs: &Inputs, emitter: &mut Emitter<'_>) {
        if !self.settings.irq || inputs.irq_line == self.irq_line {
            return;
        }
        match (self.irq_line, inputs.irq_line) {
            (None, Some(line)) => {
                debug!(sample = inputs.sample, line, "interrupt requested");
                emitter.emit(
                    inputs.sample,
                    EventKind::BusStatus,
                    false,
                    format!("Interrupt Request | IRQ Line: {}", line),
                );
            }
            (Some(line), None) => debug!(sample = inputs.sample, line, "interrupt cleared"),
            (old, new) => debug!(sample = inputs.sample, ?old, ?new, "interrupt line changed"),
        }
        self.irq_line = inputs.irq_line;
    }

    fn check_channel_check(&self, inputs: &Inputs, emitter: &mut Emitter<'_>) {
        let Some(iochk) = self.layout().iochk else {
            return;
        };
        if self.settings.error_detection && inputs.ctrl.asserted(&iochk) {
            warn!(sample = inputs.sample, "I/O channel check");
            emitter.emit(
                inputs.sample,
                EventKind::BusStatus,
                true,
                "ERROR: I/O Channel Check (IOCHK#) detected",
            );
        }
    }
}

impl BusDecoder for IsaDecoder {
    fn step<S: SampleSource + ?Sized>(
        &mut self,
        sample: u64,
        source: &S,
        emitter: &mut Emitter<'_>,
    ) -> Result<()> {
        let inputs = self.read_inputs(sample, source)?;
        if self.clock_rose(&inputs) {
            trace!(sample, state = self.state.name(), "BCLK rising edge");
        }

        // Reset pre-empts everything else on the sample
        if inputs.ctrl.is_active(&self.layout().reset) {
            self.handle_reset(sample, emitter);
            return Ok(());
        }
        self.in_reset = false;

        let state = std::mem::take(&mut self.state);
        let before = state.name();
        self.state = self.advance(state, &inputs, emitter);
        if before != self.state.name() {
            trace!(sample, from = before, to = self.state.name(), "state change");
        }

        self.check_interrupts(&inputs, emitter);
        self.check_channel_check(&inputs, emitter);
        Ok(())
    }

    fn finish(&mut self, last_sample: u64, emitter: &mut Emitter<'_>) {
        let state = std::mem::take(&mut self.state);
        let state_name = state.name();
        let Some(txn) = state.into_transaction(last_sample) else {
            return;
        };
        if txn.kind == TransactionKind::Isa(IsaKind::Unclassified) {
            debug!(state = state_name, "dropping unclassified cycle at end of capture");
            return;
        }
        let address = if txn.address_valid {
            self.format_address(txn.address)
        } else {
            "Unknown".to_string()
        };
        warn!(kind = %txn.kind, state = state_name, "incomplete transaction at end of capture");
        emitter.emit(
            txn.start,
            EventKind::Notice,
            false,
            format!(
                "WARNING: Incomplete {} | Addr: {} | State: {}",
                txn.kind, address, state_name
            ),
        );
        emitter.archive(txn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{parse_hex_field, AnnotationStore, Classification};
    use crate::source::Capture;

    // Strobes, IOCHK# and MASTER# high, IOCHRDY high
    const FULL_IDLE: u64 = 0x0BFC;
    const MINIMAL_IDLE: u64 = 0x01FC;
    // Every DACK# released
    const DMA_IDLE: u64 = 0x7F_0000;

    /// Builds a five-group ISA capture one sample at a time
    struct Trace {
        layout: &'static IsaLayout,
        capture: Capture,
        ctrl: u64,
        address: u64,
        data: u64,
        dma: u64,
        irq: u64,
    }

    impl Trace {
        fn full() -> Self {
            Trace {
                layout: &FULL_LAYOUT,
                capture: Capture::new(5),
                ctrl: FULL_IDLE,
                address: 0,
                data: 0,
                dma: DMA_IDLE,
                irq: 0,
            }
        }

        fn minimal() -> Self {
            Trace {
                layout: &MINIMAL_LAYOUT,
                capture: Capture::new(3),
                ctrl: MINIMAL_IDLE,
                ..Trace::full()
            }
        }

        fn push(&mut self) -> u64 {
            let index = self.capture.next_index();
            self.capture
                .push(&[self.ctrl, self.address, self.data, self.dma, self.irq]);
            index
        }

        fn set(&mut self, signal: Signal, active: bool) {
            let high = match signal.polarity() {
                crate::signal::Polarity::ActiveHigh => active,
                crate::signal::Polarity::ActiveLow => !active,
            };
            if high {
                self.ctrl |= signal.mask();
            } else {
                self.ctrl &= !signal.mask();
            }
        }

        /// One full BCLK period: low then high
        fn tick(&mut self) {
            self.set(self.layout.bclk, false);
            self.push();
            self.set(self.layout.bclk, true);
            self.push();
        }

        /// Idle clocks between cycles
        fn idle(&mut self, clocks: usize) {
            for _ in 0..clocks {
                self.tick();
            }
        }

        /// A complete CPU cycle; returns the start sample
        fn cycle(&mut self, command: Signal, word: bool, address: u64, data: u64, waits: u32) -> u64 {
            let writes = command.name() == "IOW#" || command.name() == "MEMW#";

            // T1: ALE pulse while BCLK is low
            self.set(self.layout.bclk, false);
            self.set(self.layout.ale, true);
            self.address = address;
            let start = self.push();
            self.set(self.layout.ale, false);
            self.push();

            // Command asserted with the T1 -> T2 clock
            self.set(command, true);
            self.set(self.layout.sbhe, word);
            if writes {
                self.data = data;
            }
            self.set(self.layout.bclk, true);
            self.push();

            // T2 clock; target responds before it
            if !writes {
                self.data = data;
            }
            if waits > 0 {
                self.set(self.layout.iochrdy, false);
            }
            self.tick();

            for i in 1..=waits {
                if i == waits {
                    self.set(self.layout.iochrdy, true);
                }
                self.tick();
            }

            // T3 clock, then release
            self.tick();
            self.set(self.layout.bclk, false);
            self.set(command, false);
            self.set(self.layout.sbhe, false);
            self.push();
            self.tick();
            start
        }
    }

    fn run(decoder: &mut IsaDecoder, capture: &Capture) -> (AnnotationStore, Vec<Transaction>) {
        let mut store = AnnotationStore::new();
        let mut archive = Vec::new();
        {
            let mut emitter = Emitter::new(&mut store, &mut archive);
            let range = capture.sample_range().unwrap().unwrap();
            for sample in range.indices() {
                decoder.step(sample, capture, &mut emitter).unwrap();
            }
            decoder.finish(range.last, &mut emitter);
        }
        (store, archive)
    }

    fn decode_full(trace: &Trace) -> (AnnotationStore, Vec<Transaction>) {
        run(&mut IsaDecoder::full(&IsaConfig::default()), &trace.capture)
    }

    #[test]
    fn test_clean_read() {
        let mut trace = Trace::full();
        trace.idle(2);
        let start = trace.cycle(FULL_LAYOUT.ior, false, 0x3F8, 0x5A, 0);
        trace.idle(2);

        let (store, archive) = decode_full(&trace);
        assert_eq!(store.len(), 1);
        let event = store.find(start).unwrap();
        assert_eq!(event.class, Classification::Normal);
        assert_eq!(event.text, "I/O Read (8-bit) | Addr: 0x03F8 | Data: 0x5A | Wait: 0");

        let txn = &archive[0];
        assert_eq!(txn.kind, TransactionKind::Isa(IsaKind::IoRead(Width::Byte)));
        assert!(txn.address_valid);
        assert_eq!(txn.data(), Some(0x5A));
        assert_eq!(txn.wait_states, 0);
    }

    #[test]
    fn test_word_write_captured_in_t2() {
        let mut trace = Trace::full();
        trace.idle(1);
        let start = trace.cycle(FULL_LAYOUT.memw, true, 0xC800, 0xBEEF, 2);
        trace.idle(1);

        let (store, archive) = decode_full(&trace);
        let event = store.find(start).unwrap();
        assert_eq!(
            event.text,
            "Memory Write (16-bit) | Addr: 0xC800 | Data: 0xBEEF | Wait: 2"
        );
        assert_eq!(archive[0].wait_states, 2);
    }

    #[test]
    fn test_wait_states_counted_exactly() {
        for waits in [1u32, 5, 12, 20] {
            let mut trace = Trace::full();
            trace.idle(1);
            let start = trace.cycle(FULL_LAYOUT.memr, false, 0x1234, 0x42, waits);
            trace.idle(1);

            let (store, archive) = decode_full(&trace);
            assert_eq!(store.len(), 1, "waits {}", waits);
            let event = store.find(start).unwrap();
            assert_eq!(event.class, Classification::Normal, "waits {}", waits);
            assert!(event.text.ends_with(&format!("Wait: {}", waits)));
            assert_eq!(archive[0].wait_states, waits);
        }
    }

    #[test]
    fn test_excessive_wait_states_flag_error() {
        let mut trace = Trace::full();
        trace.idle(1);
        let start = trace.cycle(FULL_LAYOUT.ior, false, 0x60, 0x1C, 25);
        trace.idle(1);

        let (store, archive) = decode_full(&trace);
        let event = store.find(start).unwrap();
        assert_eq!(event.class, Classification::Error);
        assert!(event.text.ends_with("Wait: 21"));
        assert!(archive[0].faults.timed_out);
        assert!(archive[0].faults.protocol_error);
    }

    #[test]
    fn test_wait_limit_ignored_without_error_detection() {
        let config = IsaConfig {
            error_detection: false,
            ..IsaConfig::default()
        };
        let mut trace = Trace::full();
        trace.idle(1);
        let start = trace.cycle(FULL_LAYOUT.ior, false, 0x60, 0x1C, 25);
        trace.idle(1);

        let (store, _) = run(&mut IsaDecoder::full(&config), &trace.capture);
        let event = store.find(start).unwrap();
        assert_eq!(event.class, Classification::Normal);
        assert!(event.text.ends_with("Wait: 25"));
    }

    #[test]
    fn test_command_held_too_long_times_out() {
        let mut trace = Trace::full();
        trace.idle(1);
        trace.set(FULL_LAYOUT.ale, true);
        trace.address = 0x80;
        let start = trace.push();
        trace.set(FULL_LAYOUT.ale, false);
        trace.set(FULL_LAYOUT.ior, true);
        trace.push();
        trace.idle(12);

        let (store, archive) = decode_full(&trace);
        let event = store.find(start).unwrap();
        assert_eq!(event.class, Classification::Error);
        assert_eq!(
            event.text,
            "ERROR: I/O Read (8-bit) transaction timed out | Addr: 0x0080 | Cycles: 11"
        );
        assert!(archive[0].faults.timed_out);
    }

    #[test]
    fn test_reset_mid_transaction() {
        let mut trace = Trace::full();
        trace.idle(1);
        trace.set(FULL_LAYOUT.ale, true);
        trace.address = 0x2F8;
        trace.push();
        trace.set(FULL_LAYOUT.ale, false);
        trace.set(FULL_LAYOUT.iow, true);
        trace.push();
        trace.tick();

        trace.set(FULL_LAYOUT.reset, true);
        let reset_at = trace.push();
        trace.push();
        trace.push();
        trace.set(FULL_LAYOUT.reset, false);
        trace.set(FULL_LAYOUT.iow, false);
        trace.idle(1);
        let next = trace.cycle(FULL_LAYOUT.ior, false, 0x2F8, 0x11, 0);
        trace.idle(1);

        let (store, archive) = decode_full(&trace);
        assert_eq!(store.len(), 2);
        let event = store.find(reset_at).unwrap();
        assert_eq!(event.class, Classification::Error);
        assert_eq!(
            event.text,
            "SYSTEM RESET | Aborted I/O Write (8-bit) | Addr: 0x02F8"
        );
        assert_eq!(archive[0].end, reset_at);

        // Machine was idle again after reset
        assert_eq!(store.find(next).unwrap().class, Classification::Normal);
    }

    #[test]
    fn test_reset_while_idle_reported_once() {
        let mut trace = Trace::full();
        trace.idle(1);
        trace.set(FULL_LAYOUT.reset, true);
        let reset_at = trace.push();
        trace.idle(3);
        trace.set(FULL_LAYOUT.reset, false);
        trace.idle(1);

        let (store, archive) = decode_full(&trace);
        assert_eq!(store.len(), 1);
        let event = store.find(reset_at).unwrap();
        assert_eq!(event.text, "SYSTEM RESET");
        assert_eq!(event.class, Classification::Status);
        assert!(archive.is_empty());
    }

    #[test]
    fn test_refresh_cycle() {
        let mut trace = Trace::full();
        trace.idle(1);
        trace.set(FULL_LAYOUT.bclk, false);
        trace.set(FULL_LAYOUT.refresh, true);
        let start = trace.push();
        trace.set(FULL_LAYOUT.bclk, true);
        trace.push();
        trace.tick();
        trace.tick();
        trace.set(FULL_LAYOUT.refresh, false);
        trace.push();
        trace.idle(1);

        let (store, archive) = decode_full(&trace);
        let event = store.find(start).unwrap();
        assert_eq!(event.text, "Memory Refresh Cycle | Cycles: 3");
        assert_eq!(event.class, Classification::Status);
        assert_eq!(archive[0].kind, TransactionKind::Isa(IsaKind::Refresh));
    }

    #[test]
    fn test_dma_cycle() {
        let mut trace = Trace::full();
        trace.idle(1);
        // DACK3# low, MEMR# low
        trace.dma = DMA_IDLE & !0x08_0000;
        trace.set(FULL_LAYOUT.memr, true);
        let start = trace.push();
        trace.address = 0x4000;
        trace.push();
        trace.data = 0x77;
        trace.dma |= TERMINAL_COUNT.mask();
        trace.tick();
        trace.dma = DMA_IDLE;
        trace.set(FULL_LAYOUT.memr, false);
        let end = trace.push();
        trace.idle(1);

        let (store, archive) = decode_full(&trace);
        assert_eq!(store.len(), 1);
        let event = store.find(start).unwrap();
        assert_eq!(event.class, Classification::Warning);
        assert_eq!(
            event.text,
            "DMA Read (8-bit) | Channel: 3 | Addr: 0x4000 | Data: 0x0077 | TC: Yes"
        );
        let txn = &archive[0];
        assert_eq!(txn.dma_channel, Some(3));
        assert!(txn.terminal_count);
        assert_eq!(txn.end, end);
    }

    #[test]
    fn test_dma_direction_with_paired_strobes() {
        // I/O to memory: IOR# with MEMW# is a write
        let mut trace = Trace::full();
        trace.idle(1);
        trace.dma = DMA_IDLE & !0x02_0000;
        trace.set(FULL_LAYOUT.ior, true);
        trace.set(FULL_LAYOUT.memw, true);
        let io_to_memory = trace.push();
        trace.push();
        trace.dma = DMA_IDLE;
        trace.set(FULL_LAYOUT.ior, false);
        trace.set(FULL_LAYOUT.memw, false);
        trace.push();
        trace.idle(1);

        // Memory to I/O: MEMR# with IOW# is a read
        trace.dma = DMA_IDLE & !0x02_0000;
        trace.set(FULL_LAYOUT.iow, true);
        trace.set(FULL_LAYOUT.memr, true);
        let memory_to_io = trace.push();
        trace.push();
        trace.dma = DMA_IDLE;
        trace.set(FULL_LAYOUT.iow, false);
        trace.set(FULL_LAYOUT.memr, false);
        trace.push();
        trace.idle(1);

        let (store, archive) = decode_full(&trace);
        assert_eq!(store.len(), 2);
        assert!(store
            .find(io_to_memory)
            .unwrap()
            .text
            .starts_with("DMA Write (8-bit) | Channel: 1"));
        assert!(store
            .find(memory_to_io)
            .unwrap()
            .text
            .starts_with("DMA Read (8-bit) | Channel: 1"));
        assert_eq!(archive[0].kind, TransactionKind::Isa(IsaKind::DmaWrite(Width::Byte)));
        assert_eq!(archive[1].kind, TransactionKind::Isa(IsaKind::DmaRead(Width::Byte)));
    }

    #[test]
    fn test_dma_channel_priority_and_switch() {
        // Channels 1 and 5 together: the lower-numbered one wins
        assert_eq!(DMA_CHANNELS.identify(DMA_IDLE & !0x12_0000), Some(1));

        let mut trace = Trace::full();
        trace.idle(1);
        trace.dma = DMA_IDLE & !0x02_0000;
        trace.set(FULL_LAYOUT.iow, true);
        let first = trace.push();
        trace.tick();
        trace.set(FULL_LAYOUT.iow, false);
        trace.dma = DMA_IDLE & !0x20_0000;
        let second = trace.push();
        trace.tick();
        trace.dma = DMA_IDLE;
        trace.push();
        trace.idle(1);

        let (store, archive) = decode_full(&trace);
        assert_eq!(store.len(), 2);
        assert!(store.find(first).unwrap().text.starts_with("DMA Write (8-bit) | Channel: 1"));
        assert!(store.find(second).unwrap().text.starts_with("DMA Transfer | Channel: 6"));
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn test_interrupt_and_channel_check() {
        let mut trace = Trace::full();
        trace.idle(1);
        // IRQ9 and IRQ10 together: IRQ9 is scanned first
        trace.irq = 0x840;
        let irq_at = trace.push();
        trace.idle(2);
        trace.irq = 0;
        trace.idle(1);
        trace.set(FULL_LAYOUT.iochk.unwrap(), true);
        let iochk_at = trace.push();
        trace.idle(1);

        let (store, _) = decode_full(&trace);
        assert_eq!(store.len(), 2);
        let irq = store.find(irq_at).unwrap();
        assert_eq!(irq.text, "Interrupt Request | IRQ Line: 9");
        assert_eq!(irq.class, Classification::Status);
        let iochk = store.find(iochk_at).unwrap();
        assert_eq!(iochk.class, Classification::Error);
    }

    #[test]
    fn test_incomplete_transaction_warning() {
        let mut trace = Trace::full();
        trace.idle(1);
        trace.set(FULL_LAYOUT.ale, true);
        trace.address = 0x300;
        let start = trace.push();
        trace.set(FULL_LAYOUT.ale, false);
        trace.set(FULL_LAYOUT.memr, true);
        trace.push();
        // T1 -> T2, then T2 -> T3
        trace.tick();
        trace.tick();

        let (store, archive) = decode_full(&trace);
        let event = store.find(start).unwrap();
        assert_eq!(event.class, Classification::Warning);
        assert_eq!(
            event.text,
            "WARNING: Incomplete Memory Read (8-bit) | Addr: 0x0300 | State: T3"
        );
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn test_unclassified_cycle_not_reported_at_end() {
        let mut trace = Trace::full();
        trace.idle(1);
        // ALE pulse with no command before the capture ends
        trace.set(FULL_LAYOUT.ale, true);
        trace.address = 0x2F8;
        trace.push();
        trace.set(FULL_LAYOUT.ale, false);
        trace.push();
        trace.tick();

        let (store, archive) = decode_full(&trace);
        assert!(store.is_empty());
        assert!(archive.is_empty());
    }

    #[test]
    fn test_address_width_truncation_round_trip() -> Result<()> {
        let config = IsaConfig {
            address_width: AddressWidth::Bits20,
            ..IsaConfig::default()
        };
        let mut trace = Trace::full();
        trace.idle(1);
        let start = trace.cycle(FULL_LAYOUT.memr, true, 0xF_C123 | 0x30_0000, 0xA55A, 3);
        trace.idle(1);

        let (store, archive) = run(&mut IsaDecoder::full(&config), &trace.capture);
        let text = &store.find(start).unwrap().text;
        assert_eq!(parse_hex_field(text, "Addr"), Some(archive[0].address));
        assert_eq!(parse_hex_field(text, "Addr"), Some(0xF_C123));
        assert_eq!(parse_hex_field(text, "Data"), archive[0].data());
        Ok(())
    }

    #[test]
    fn test_minimal_profile() {
        let mut trace = Trace::minimal();
        trace.idle(1);
        let byte = trace.cycle(MINIMAL_LAYOUT.ior, true, 0x1F0, 0x1234, 0);
        trace.idle(1);

        // 8-bit data bus: SBHE# ignored, data masked
        let (store, _) = run(&mut IsaDecoder::minimal(&IsaMinimalConfig::default()), &trace.capture);
        assert_eq!(
            store.find(byte).unwrap().text,
            "I/O Read (8-bit) | Addr: 0x01F0 | Data: 0x34 | Wait: 0"
        );

        let wide = IsaMinimalConfig {
            data_16bit: true,
            ..IsaMinimalConfig::default()
        };
        let (store, _) = run(&mut IsaDecoder::minimal(&wide), &trace.capture);
        assert_eq!(
            store.find(byte).unwrap().text,
            "I/O Read (16-bit) | Addr: 0x01F0 | Data: 0x1234 | Wait: 0"
        );
    }
}
