//! Transaction records produced by the bus state machines

use crate::error::{DecodeError, Result};
use crate::limits::MAX_DATA_PHASES;

/// Transfer width of an ISA cycle, decided by SBHE#
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Width {
    /// 8-bit transfer
    Byte,
    /// 16-bit transfer
    Word,
}

impl Width {
    /// Width selected by the SBHE# level
    pub fn from_sbhe(sbhe: bool) -> Self {
        if sbhe {
            Width::Word
        } else {
            Width::Byte
        }
    }

    /// Mask of the valid data bits
    pub fn data_mask(&self) -> u64 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
        }
    }
}

/// ISA transaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IsaKind {
    /// Started by ALE without a command strobe yet
    Unclassified,
    /// IOR# cycle
    IoRead(Width),
    /// IOW# cycle
    IoWrite(Width),
    /// MEMR# cycle
    MemoryRead(Width),
    /// MEMW# cycle
    MemoryWrite(Width),
    /// DMA cycle that read from memory or I/O
    DmaRead(Width),
    /// DMA cycle that wrote to memory or I/O
    DmaWrite(Width),
    /// DMA cycle with no command strobe observed
    DmaTransfer,
    /// REFRESH# cycle
    Refresh,
}

impl IsaKind {
    /// Display name
    pub fn name(&self) -> &'static str {
        use IsaKind::*;
        use Width::*;
        match self {
            Unclassified => "Unclassified",
            IoRead(Byte) => "I/O Read (8-bit)",
            IoRead(Word) => "I/O Read (16-bit)",
            IoWrite(Byte) => "I/O Write (8-bit)",
            IoWrite(Word) => "I/O Write (16-bit)",
            MemoryRead(Byte) => "Memory Read (8-bit)",
            MemoryRead(Word) => "Memory Read (16-bit)",
            MemoryWrite(Byte) => "Memory Write (8-bit)",
            MemoryWrite(Word) => "Memory Write (16-bit)",
            DmaRead(Byte) => "DMA Read (8-bit)",
            DmaRead(Word) => "DMA Read (16-bit)",
            DmaWrite(Byte) => "DMA Write (8-bit)",
            DmaWrite(Word) => "DMA Write (16-bit)",
            DmaTransfer => "DMA Transfer",
            Refresh => "Memory Refresh",
        }
    }

    /// Transfer width, if the kind carries one
    pub fn width(&self) -> Option<Width> {
        match self {
            IsaKind::IoRead(w)
            | IsaKind::IoWrite(w)
            | IsaKind::MemoryRead(w)
            | IsaKind::MemoryWrite(w)
            | IsaKind::DmaRead(w)
            | IsaKind::DmaWrite(w) => Some(*w),
            _ => None,
        }
    }

    /// Target drives the data bus
    pub fn is_read(&self) -> bool {
        matches!(self, IsaKind::IoRead(_) | IsaKind::MemoryRead(_))
    }

    /// Initiator drives the data bus
    pub fn is_write(&self) -> bool {
        matches!(self, IsaKind::IoWrite(_) | IsaKind::MemoryWrite(_))
    }

    /// DMA acknowledge cycle
    pub fn is_dma(&self) -> bool {
        matches!(
            self,
            IsaKind::DmaRead(_) | IsaKind::DmaWrite(_) | IsaKind::DmaTransfer
        )
    }
}

impl std::fmt::Display for IsaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// PCI bus command carried on C/BE[3:0]# during the address phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PciCommand {
    /// 0x0
    InterruptAcknowledge = 0x0,
    /// 0x1
    SpecialCycle = 0x1,
    /// 0x2
    IoRead = 0x2,
    /// 0x3
    IoWrite = 0x3,
    /// 0x4
    Reserved4 = 0x4,
    /// 0x5
    Reserved5 = 0x5,
    /// 0x6
    MemoryRead = 0x6,
    /// 0x7
    MemoryWrite = 0x7,
    /// 0x8
    Reserved8 = 0x8,
    /// 0x9
    Reserved9 = 0x9,
    /// 0xA
    ConfigRead = 0xA,
    /// 0xB
    ConfigWrite = 0xB,
    /// 0xC
    MemoryReadMultiple = 0xC,
    /// 0xD
    DualAddressCycle = 0xD,
    /// 0xE
    MemoryReadLine = 0xE,
    /// 0xF
    MemoryWriteInvalidate = 0xF,
}

impl TryFrom<u8> for PciCommand {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self> {
        use PciCommand::*;
        Ok(match value {
            0x0 => InterruptAcknowledge,
            0x1 => SpecialCycle,
            0x2 => IoRead,
            0x3 => IoWrite,
            0x4 => Reserved4,
            0x5 => Reserved5,
            0x6 => MemoryRead,
            0x7 => MemoryWrite,
            0x8 => Reserved8,
            0x9 => Reserved9,
            0xA => ConfigRead,
            0xB => ConfigWrite,
            0xC => MemoryReadMultiple,
            0xD => DualAddressCycle,
            0xE => MemoryReadLine,
            0xF => MemoryWriteInvalidate,
            _ => {
                return Err(DecodeError::unknown_command(format!(
                    "PCI command 0x{:X}",
                    value
                )))
            }
        })
    }
}

impl PciCommand {
    /// Decode the low nibble of a C/BE# value
    pub fn from_nibble(cbe: u64) -> Self {
        // Every nibble value is a defined command
        match PciCommand::try_from((cbe & 0xF) as u8) {
            Ok(cmd) => cmd,
            Err(_) => PciCommand::Reserved4,
        }
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        use PciCommand::*;
        match self {
            InterruptAcknowledge => "Interrupt Acknowledge",
            SpecialCycle => "Special Cycle",
            IoRead => "I/O Read",
            IoWrite => "I/O Write",
            Reserved4 => "Reserved (0x4)",
            Reserved5 => "Reserved (0x5)",
            MemoryRead => "Memory Read",
            MemoryWrite => "Memory Write",
            Reserved8 => "Reserved (0x8)",
            Reserved9 => "Reserved (0x9)",
            ConfigRead => "Configuration Read",
            ConfigWrite => "Configuration Write",
            MemoryReadMultiple => "Memory Read Multiple",
            DualAddressCycle => "Dual Address Cycle",
            MemoryReadLine => "Memory Read Line",
            MemoryWriteInvalidate => "Memory Write and Invalidate",
        }
    }

    /// Configuration space access
    pub fn is_config(&self) -> bool {
        matches!(self, PciCommand::ConfigRead | PciCommand::ConfigWrite)
    }

    /// Transfers whole cache lines
    pub fn is_line(&self) -> bool {
        matches!(
            self,
            PciCommand::MemoryReadLine | PciCommand::MemoryWriteInvalidate
        )
    }
}

impl std::fmt::Display for PciCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of a decoded transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransactionKind {
    /// ISA bus cycle
    Isa(IsaKind),
    /// PCI bus command
    Pci(PciCommand),
}

impl TransactionKind {
    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            TransactionKind::Isa(kind) => kind.name(),
            TransactionKind::Pci(cmd) => cmd.name(),
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One data transfer within a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataPhase {
    /// Value on the data lines
    pub value: u64,
    /// Active byte lanes (PCI C/BE# inverted), 0 for ISA
    pub byte_enables: u8,
}

/// Protocol faults recorded against a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Faults {
    /// A timing threshold was exceeded
    pub timed_out: bool,
    /// The bus violated the protocol sequence
    pub protocol_error: bool,
    /// PERR# asserted
    pub parity_error: bool,
    /// SERR# asserted
    pub system_error: bool,
    /// No target claimed the transaction
    pub master_abort: bool,
    /// The target withdrew DEVSEL#
    pub target_abort: bool,
}

impl Faults {
    /// Pack the flags into bits 0..=5
    pub fn bits(&self) -> u8 {
        let mut bits = 0u8;
        if self.timed_out {
            bits |= 0x01;
        }
        if self.protocol_error {
            bits |= 0x02;
        }
        if self.parity_error {
            bits |= 0x04;
        }
        if self.system_error {
            bits |= 0x08;
        }
        if self.master_abort {
            bits |= 0x10;
        }
        if self.target_abort {
            bits |= 0x20;
        }
        bits
    }

    /// Unpack flags produced by [`Faults::bits`]
    pub fn from_bits(bits: u8) -> Self {
        Faults {
            timed_out: bits & 0x01 != 0,
            protocol_error: bits & 0x02 != 0,
            parity_error: bits & 0x04 != 0,
            system_error: bits & 0x08 != 0,
            master_abort: bits & 0x10 != 0,
            target_abort: bits & 0x20 != 0,
        }
    }

    /// Any fault recorded
    pub fn any(&self) -> bool {
        self.bits() != 0
    }
}

/// How a PCI transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Completion {
    /// All data phases completed
    Normal,
    /// No DEVSEL# response
    MasterAbort,
    /// Target dropped DEVSEL#
    TargetAbort,
    /// STOP# before any data
    Retry,
    /// STOP# with data
    Disconnect,
}

impl Completion {
    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Completion::Normal => "Normal",
            Completion::MasterAbort => "Master Abort",
            Completion::TargetAbort => "Target Abort",
            Completion::Retry => "Retry",
            Completion::Disconnect => "Disconnect",
        }
    }

    /// Shown with an error classification
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Completion::MasterAbort | Completion::TargetAbort | Completion::Retry
        )
    }
}

/// Burst pattern of a completed PCI transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BurstType {
    /// One data phase
    Single,
    /// Memory Read Multiple burst
    Multiple,
    /// Cache-line burst
    Line,
    /// Any other burst
    Continuous,
}

impl BurstType {
    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            BurstType::Single => "Single Transfer",
            BurstType::Multiple => "Multiple Transfer",
            BurstType::Line => "Line Transfer",
            BurstType::Continuous => "Continuous",
        }
    }

    /// Classify by phase count and command
    pub fn classify(phases: usize, command: PciCommand) -> Self {
        if phases <= 1 {
            BurstType::Single
        } else if command.is_line() {
            BurstType::Line
        } else if command == PciCommand::MemoryReadMultiple {
            BurstType::Multiple
        } else {
            BurstType::Continuous
        }
    }
}

/// Configuration cycle addressing type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConfigType {
    /// Device on this bus, selected by IDSEL
    Type0,
    /// Forwarded through a bridge
    Type1,
}

/// Target of a PCI configuration cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConfigTarget {
    /// Addressing type
    pub config_type: ConfigType,
    /// Bus number (type 1 only)
    pub bus: u8,
    /// AD[15:11]
    pub device: u8,
    /// AD[10:8]
    pub function: u8,
    /// Dword register, AD[7:2]
    pub register: u8,
}

impl ConfigTarget {
    /// Decode the configuration address from AD[31:0]
    pub fn decode(ad: u64, idsel: bool) -> Self {
        let config_type = if idsel {
            ConfigType::Type0
        } else {
            ConfigType::Type1
        };
        ConfigTarget {
            config_type,
            bus: match config_type {
                ConfigType::Type0 => 0,
                ConfigType::Type1 => ((ad >> 16) & 0xFF) as u8,
            },
            device: ((ad >> 11) & 0x1F) as u8,
            function: ((ad >> 8) & 0x7) as u8,
            register: ((ad >> 2) & 0x3F) as u8,
        }
    }
}

/// A decoded bus transaction
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transaction {
    /// Transaction kind
    pub kind: TransactionKind,
    /// Sample at which the transaction started
    pub start: u64,
    /// Sample at which it completed or was abandoned
    pub end: u64,
    /// Latched address
    pub address: u64,
    /// Whether `address` was actually observed
    pub address_valid: bool,
    /// Recorded data phases
    pub phases: Vec<DataPhase>,
    /// Phases seen after the record was full
    pub dropped_phases: u32,
    /// ISA wait states
    pub wait_states: u32,
    /// Clock edges counted against the bus-cycle limit
    pub bus_cycles: u32,
    /// Fault flags
    pub faults: Faults,
    /// PCI completion
    pub completion: Option<Completion>,
    /// PCI burst type
    pub burst: Option<BurstType>,
    /// Active DMA channel
    pub dma_channel: Option<u8>,
    /// DMA terminal count seen
    pub terminal_count: bool,
    /// PCI configuration target
    pub config: Option<ConfigTarget>,
    /// PCI dual address cycle used
    pub dual_address: bool,
    /// LOCK# asserted at the address phase
    pub locked: bool,
    /// REQ# asserted at the address phase
    pub request: bool,
    /// GNT# asserted at the address phase
    pub grant: bool,
}

impl Transaction {
    /// Open a new record
    pub fn new(kind: TransactionKind, start: u64) -> Self {
        Transaction {
            kind,
            start,
            end: start,
            address: 0,
            address_valid: false,
            phases: Vec::new(),
            dropped_phases: 0,
            wait_states: 0,
            bus_cycles: 0,
            faults: Faults::default(),
            completion: None,
            burst: None,
            dma_channel: None,
            terminal_count: false,
            config: None,
            dual_address: false,
            locked: false,
            request: false,
            grant: false,
        }
    }

    /// Value of the first data phase
    pub fn data(&self) -> Option<u64> {
        self.phases.first().map(|p| p.value)
    }

    /// Append a data phase. Returns false once the record is full.
    pub fn push_phase(&mut self, phase: DataPhase) -> bool {
        if self.phases.len() >= MAX_DATA_PHASES {
            self.dropped_phases += 1;
            return false;
        }
        self.phases.push(phase);
        true
    }

    /// Store is at capacity
    pub fn phases_full(&self) -> bool {
        self.phases.len() >= MAX_DATA_PHASES
    }

    /// Every transfer seen, stored or not
    pub fn phase_count(&self) -> usize {
        self.phases.len() + self.dropped_phases as usize
    }

    /// Shown with an error classification
    pub fn is_error(&self) -> bool {
        self.faults.any() || self.completion.is_some_and(|c| c.is_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isa_kind_names() {
        assert_eq!(IsaKind::IoRead(Width::Byte).name(), "I/O Read (8-bit)");
        assert_eq!(IsaKind::MemoryWrite(Width::Word).name(), "Memory Write (16-bit)");
        assert_eq!(IsaKind::Refresh.to_string(), "Memory Refresh");
        assert!(IsaKind::DmaRead(Width::Byte).is_dma());
        assert!(!IsaKind::DmaRead(Width::Byte).is_read());
        assert_eq!(IsaKind::Unclassified.width(), None);
    }

    #[test]
    fn test_pci_command_conversion() {
        let cmd: PciCommand = 0x6u8.try_into().unwrap();
        assert_eq!(cmd, PciCommand::MemoryRead);
        assert_eq!(PciCommand::from_nibble(0xFD), PciCommand::DualAddressCycle);
        assert_eq!(PciCommand::MemoryWriteInvalidate.name(), "Memory Write and Invalidate");

        let result: Result<PciCommand> = 0x10u8.try_into();
        assert!(matches!(result, Err(DecodeError::UnknownCommand(_))));
    }

    #[test]
    fn test_fault_flags_encode_decode() {
        let faults = Faults {
            parity_error: true,
            master_abort: true,
            ..Faults::default()
        };
        assert_eq!(faults.bits(), 0x14);
        assert_eq!(Faults::from_bits(faults.bits()), faults);
        assert!(!Faults::default().any());
    }

    #[test]
    fn test_burst_classification() {
        assert_eq!(BurstType::classify(1, PciCommand::MemoryReadLine), BurstType::Single);
        assert_eq!(BurstType::classify(4, PciCommand::MemoryReadLine), BurstType::Line);
        assert_eq!(
            BurstType::classify(4, PciCommand::MemoryReadMultiple),
            BurstType::Multiple
        );
        assert_eq!(BurstType::classify(3, PciCommand::MemoryWrite), BurstType::Continuous);
    }

    #[test]
    fn test_config_target_decode() {
        // Bus 2, device 3, function 1, register 0x10
        let ad = (2 << 16) | (3 << 11) | (1 << 8) | (0x10 << 2) | 0x1;
        let target = ConfigTarget::decode(ad, false);
        assert_eq!(target.config_type, ConfigType::Type1);
        assert_eq!(target.bus, 2);
        assert_eq!(target.device, 3);
        assert_eq!(target.function, 1);
        assert_eq!(target.register, 0x10);

        assert_eq!(ConfigTarget::decode(ad, true).bus, 0);
    }

    #[test]
    fn test_phase_capacity() {
        let mut txn = Transaction::new(TransactionKind::Pci(PciCommand::MemoryWrite), 0);
        for i in 0..MAX_DATA_PHASES {
            assert!(txn.push_phase(DataPhase { value: i as u64, byte_enables: 0xF }));
        }
        assert!(txn.phases_full());
        assert!(!txn.push_phase(DataPhase::default()));
        assert_eq!(txn.phases.len(), MAX_DATA_PHASES);
        assert_eq!(txn.phase_count(), MAX_DATA_PHASES + 1);
        assert_eq!(txn.data(), Some(0));
    }
}
