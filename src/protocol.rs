//! Protocol variants and their static descriptive metadata
//!
//! Group and setting tables are data only. The glue layer reads them to
//! present a configuration UI; the decoders read the typed configuration
//! in [`crate::config`] instead.

use crate::error::{DecodeError, Result};
use crate::signal::GroupId;

/// ISA control group
pub const ISA_CONTROL: GroupId = 0;
/// ISA address group
pub const ISA_ADDR: GroupId = 1;
/// ISA data group
pub const ISA_DATA: GroupId = 2;
/// ISA DMA acknowledge/request group (full profile only)
pub const ISA_DMA: GroupId = 3;
/// ISA interrupt request group (full profile only)
pub const ISA_IRQ: GroupId = 4;
/// PCI combined signal word
pub const PCI_SIGNALS: GroupId = 0;

/// Supported bus protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
    /// 8/16-bit ISA with DMA, refresh and interrupts
    Isa,
    /// Reduced ISA: control, address and data groups only
    IsaMinimal,
    /// 32/64-bit PCI with multiplexed address/data
    Pci,
}

/// A named signal group and the bits it occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group name shown to the user
    pub name: &'static str,
    /// Bits of the raw value that carry signals
    pub mask: u64,
}

impl GroupInfo {
    /// Number of signal lines in the group
    pub fn width(&self) -> u32 {
        self.mask.count_ones()
    }
}

/// A user-selectable setting and its named options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingInfo {
    /// Setting identifier
    pub name: &'static str,
    /// Option labels, indexed by option value
    pub options: &'static [&'static str],
    /// Option index selected at startup
    pub default: usize,
}

impl SettingInfo {
    /// Highest valid option index
    pub fn max(&self) -> usize {
        self.options.len().saturating_sub(1)
    }

    /// Label of option `value`
    pub fn option(&self, value: usize) -> Option<&'static str> {
        self.options.get(value).copied()
    }

    /// Check that `value` names one of the options
    pub fn validate(&self, value: usize) -> Result<()> {
        if value > self.max() {
            return Err(DecodeError::invalid_option(format!(
                "{} has no option {} (0..={})",
                self.name,
                value,
                self.max()
            )));
        }
        Ok(())
    }
}

const ADDR_WIDTH_OPTIONS: &[&str] = &["16-bit", "20-bit", "24-bit"];
const ENABLE_OPTIONS: &[&str] = &["Disabled", "Enabled"];

const ISA_GROUPS: &[GroupInfo] = &[
    GroupInfo { name: "ISA_Control", mask: 0x3FFF },
    GroupInfo { name: "ISA_Addr", mask: 0xFF_FFFF },
    GroupInfo { name: "ISA_Data", mask: 0xFFFF },
    GroupInfo { name: "ISA_DMA", mask: 0x7FFF_FFFF },
    GroupInfo { name: "ISA_IRQ", mask: 0xFFF },
];

const ISA_SETTINGS: &[SettingInfo] = &[
    SettingInfo { name: "ADDR_WIDTH", options: ADDR_WIDTH_OPTIONS, default: 0 },
    SettingInfo {
        name: "BUS_SPEED",
        options: &["4.77 MHz", "6 MHz", "8 MHz", "10 MHz", "12 MHz"],
        default: 2,
    },
    SettingInfo { name: "DMA_SUPPORT", options: ENABLE_OPTIONS, default: 1 },
    SettingInfo { name: "REFRESH_SUPPORT", options: ENABLE_OPTIONS, default: 1 },
    SettingInfo { name: "IRQ_SUPPORT", options: ENABLE_OPTIONS, default: 1 },
    SettingInfo {
        name: "TIMING_MODE",
        options: &["Fast Mode", "Normal Mode", "Slow Mode", "AT Mode", "ISA Mode"],
        default: 3,
    },
    SettingInfo { name: "ERROR_DETECTION", options: &["Basic", "Advanced"], default: 1 },
];

const ISA_MINIMAL_GROUPS: &[GroupInfo] = &[
    GroupInfo { name: "ISA_Control", mask: 0x7FF },
    GroupInfo { name: "ISA_Addr", mask: 0xFFFF },
    GroupInfo { name: "ISA_Data", mask: 0xFF },
];

const ISA_MINIMAL_SETTINGS: &[SettingInfo] = &[
    SettingInfo { name: "ADDR_WIDTH", options: ADDR_WIDTH_OPTIONS, default: 0 },
    SettingInfo {
        name: "TIMING_MODE",
        options: &["Fast Mode", "Normal Mode", "Slow Mode"],
        default: 1,
    },
    SettingInfo { name: "DATA_WIDTH", options: &["8-bit", "16-bit"], default: 0 },
];

// AD[31:0] sits in the upper half of the 64-bit word
const PCI_GROUPS: &[GroupInfo] = &[
    GroupInfo { name: "PCI", mask: 0xFFFF_FFFF_003F_FFFF },
    GroupInfo { name: "PCISig", mask: 0xFFFF },
    GroupInfo { name: "PCIAD", mask: 0xFFFF_FFFF_0000_0000 },
    GroupInfo { name: "PCIInt", mask: 0x3C00 },
];

const PCI_SETTINGS: &[SettingInfo] = &[
    SettingInfo { name: "BUS_WIDTH", options: &["32-bit", "64-bit"], default: 0 },
    SettingInfo { name: "BUS_SPEED", options: &["33 MHz", "66 MHz"], default: 0 },
    SettingInfo {
        name: "ARB_MODE",
        options: &["Simple", "Fairness", "Priority"],
        default: 0,
    },
    SettingInfo {
        name: "CACHELINE",
        options: &["Disabled", "16 Bytes", "32 Bytes", "64 Bytes"],
        default: 0,
    },
    SettingInfo {
        name: "LATENCY",
        options: &["Minimal", "Standard", "Extended"],
        default: 1,
    },
    SettingInfo {
        name: "RETRY_POLICY",
        options: &["Immediate Retry", "Delayed Retry"],
        default: 0,
    },
];

impl Protocol {
    /// All supported protocols
    pub const ALL: [Protocol; 3] = [Protocol::Isa, Protocol::IsaMinimal, Protocol::Pci];

    /// Short protocol name
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Isa => "ISA",
            Protocol::IsaMinimal => "ISA-minimal",
            Protocol::Pci => "PCI",
        }
    }

    /// Signal groups the decoder reads, indexed by [`GroupId`]
    pub fn groups(&self) -> &'static [GroupInfo] {
        match self {
            Protocol::Isa => ISA_GROUPS,
            Protocol::IsaMinimal => ISA_MINIMAL_GROUPS,
            Protocol::Pci => PCI_GROUPS,
        }
    }

    /// Groups actually sampled during a pass.
    ///
    /// The PCI views all slice the same combined word, so only the
    /// first is fetched.
    pub fn sampled_groups(&self) -> usize {
        match self {
            Protocol::Pci => 1,
            _ => self.groups().len(),
        }
    }

    /// Look up one group
    pub fn group(&self, id: GroupId) -> Result<&'static GroupInfo> {
        self.groups().get(id).ok_or_else(|| {
            DecodeError::unknown_group(format!("{} has no group {}", self.name(), id))
        })
    }

    /// User settings, indexed by setting id
    pub fn settings(&self) -> &'static [SettingInfo] {
        match self {
            Protocol::Isa => ISA_SETTINGS,
            Protocol::IsaMinimal => ISA_MINIMAL_SETTINGS,
            Protocol::Pci => PCI_SETTINGS,
        }
    }

    /// Look up one setting
    pub fn setting(&self, id: usize) -> Result<&'static SettingInfo> {
        self.settings().get(id).ok_or_else(|| {
            DecodeError::unknown_setting(format!("{} has no setting {}", self.name(), id))
        })
    }

    /// Find a setting id by its name
    pub fn setting_id(&self, name: &str) -> Option<usize> {
        self.settings().iter().position(|s| s.name == name)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Protocol {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self> {
        Protocol::ALL
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| DecodeError::unknown_setting(format!("unknown protocol '{}'", s)))
    }
}
