//! Decoder configuration
//!
//! Settings are addressed by index, the same way the host enumerates them
//! from [`Protocol::settings`]. Every write is validated against the
//! protocol's option table before it is stored.

use crate::error::{DecodeError, Result};
use crate::protocol::Protocol;

/// ISA bus clock periods in ns, indexed by the BUS_SPEED option
const ISA_CLOCK_PERIODS_NS: [f64; 5] = [209.64, 166.67, 125.0, 100.0, 83.33];

/// PCI cache-line sizes in bytes, indexed by the CACHELINE option
const PCI_CACHE_LINE_BYTES: [u32; 4] = [0, 16, 32, 64];

/// Width of the decoded ISA address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressWidth {
    /// 64 KiB I/O and memory space
    #[default]
    Bits16,
    /// XT memory space
    Bits20,
    /// AT memory space
    Bits24,
}

impl AddressWidth {
    /// Width in bits
    pub fn bits(&self) -> u32 {
        match self {
            AddressWidth::Bits16 => 16,
            AddressWidth::Bits20 => 20,
            AddressWidth::Bits24 => 24,
        }
    }

    /// Hex digits used when printing an address
    pub fn digits(&self) -> usize {
        (self.bits() / 4) as usize
    }

    /// Mask applied to a latched address
    pub fn mask(&self) -> u64 {
        (1u64 << self.bits()) - 1
    }

    fn index(&self) -> usize {
        match self {
            AddressWidth::Bits16 => 0,
            AddressWidth::Bits20 => 1,
            AddressWidth::Bits24 => 2,
        }
    }
}

impl TryFrom<usize> for AddressWidth {
    type Error = DecodeError;

    fn try_from(value: usize) -> Result<Self> {
        match value {
            0 => Ok(AddressWidth::Bits16),
            1 => Ok(AddressWidth::Bits20),
            2 => Ok(AddressWidth::Bits24),
            _ => Err(DecodeError::invalid_option(format!(
                "address width option {}",
                value
            ))),
        }
    }
}

/// Full ISA decoder settings
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsaConfig {
    /// Latched address width
    pub address_width: AddressWidth,
    /// BUS_SPEED option index
    pub bus_speed: usize,
    /// Decode DMA acknowledge cycles
    pub dma_support: bool,
    /// Decode memory refresh cycles
    pub refresh_support: bool,
    /// Report interrupt requests
    pub irq_support: bool,
    /// TIMING_MODE option index (informational)
    pub timing_mode: usize,
    /// Enforce timeouts and report IOCHK#
    pub error_detection: bool,
}

impl Default for IsaConfig {
    fn default() -> Self {
        IsaConfig {
            address_width: AddressWidth::Bits16,
            bus_speed: 2,
            dma_support: true,
            refresh_support: true,
            irq_support: true,
            timing_mode: 3,
            error_detection: true,
        }
    }
}

impl IsaConfig {
    /// Bus clock period for the selected speed
    pub fn clock_period_ns(&self) -> f64 {
        ISA_CLOCK_PERIODS_NS[self.bus_speed.min(ISA_CLOCK_PERIODS_NS.len() - 1)]
    }

    fn get(&self, id: usize) -> Result<usize> {
        Ok(match id {
            0 => self.address_width.index(),
            1 => self.bus_speed,
            2 => self.dma_support as usize,
            3 => self.refresh_support as usize,
            4 => self.irq_support as usize,
            5 => self.timing_mode,
            6 => self.error_detection as usize,
            _ => return Err(unknown(Protocol::Isa, id)),
        })
    }

    fn set(&mut self, id: usize, value: usize) -> Result<()> {
        Protocol::Isa.setting(id)?.validate(value)?;
        match id {
            0 => self.address_width = AddressWidth::try_from(value)?,
            1 => self.bus_speed = value,
            2 => self.dma_support = value != 0,
            3 => self.refresh_support = value != 0,
            4 => self.irq_support = value != 0,
            5 => self.timing_mode = value,
            6 => self.error_detection = value != 0,
            _ => return Err(unknown(Protocol::Isa, id)),
        }
        Ok(())
    }
}

/// Reduced ISA decoder settings
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsaMinimalConfig {
    /// Latched address width
    pub address_width: AddressWidth,
    /// Data bus is 16 bits wide; byte-only when false
    pub data_16bit: bool,
}

impl IsaMinimalConfig {
    /// TIMING_MODE always reports "Normal Mode"
    pub const TIMING_MODE: usize = 1;

    /// Mask applied to every data sample
    pub fn data_mask(&self) -> u64 {
        if self.data_16bit {
            0xFFFF
        } else {
            0xFF
        }
    }

    fn get(&self, id: usize) -> Result<usize> {
        Ok(match id {
            0 => self.address_width.index(),
            1 => Self::TIMING_MODE,
            2 => self.data_16bit as usize,
            _ => return Err(unknown(Protocol::IsaMinimal, id)),
        })
    }

    fn set(&mut self, id: usize, value: usize) -> Result<()> {
        Protocol::IsaMinimal.setting(id)?.validate(value)?;
        match id {
            0 => self.address_width = AddressWidth::try_from(value)?,
            // Accepted but not stored
            1 => {}
            2 => self.data_16bit = value != 0,
            _ => return Err(unknown(Protocol::IsaMinimal, id)),
        }
        Ok(())
    }
}

/// PCI decoder settings
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PciConfig {
    /// 64-bit bus: addresses print with 16 digits
    pub bus_64bit: bool,
    /// 66 MHz clock instead of 33 MHz
    pub bus_66mhz: bool,
    /// ARB_MODE option index
    pub arbitration: usize,
    /// CACHELINE option index
    pub cache_line: usize,
    /// LATENCY option index
    pub latency: usize,
    /// RETRY_POLICY option index
    pub retry_policy: usize,
}

impl Default for PciConfig {
    fn default() -> Self {
        PciConfig {
            bus_64bit: false,
            bus_66mhz: false,
            arbitration: 0,
            cache_line: 0,
            latency: 1,
            retry_policy: 0,
        }
    }
}

impl PciConfig {
    /// Bus clock period
    pub fn clock_period_ns(&self) -> f64 {
        if self.bus_66mhz {
            15.0
        } else {
            30.0
        }
    }

    /// Configured cache-line size, `None` when disabled
    pub fn cache_line_bytes(&self) -> Option<u32> {
        match PCI_CACHE_LINE_BYTES.get(self.cache_line).copied() {
            Some(0) | None => None,
            Some(bytes) => Some(bytes),
        }
    }

    fn get(&self, id: usize) -> Result<usize> {
        Ok(match id {
            0 => self.bus_64bit as usize,
            1 => self.bus_66mhz as usize,
            2 => self.arbitration,
            3 => self.cache_line,
            4 => self.latency,
            5 => self.retry_policy,
            _ => return Err(unknown(Protocol::Pci, id)),
        })
    }

    fn set(&mut self, id: usize, value: usize) -> Result<()> {
        Protocol::Pci.setting(id)?.validate(value)?;
        match id {
            0 => self.bus_64bit = value != 0,
            1 => self.bus_66mhz = value != 0,
            2 => self.arbitration = value,
            3 => self.cache_line = value,
            4 => self.latency = value,
            5 => self.retry_policy = value,
            _ => return Err(unknown(Protocol::Pci, id)),
        }
        Ok(())
    }
}

fn unknown(protocol: Protocol, id: usize) -> DecodeError {
    DecodeError::unknown_setting(format!("{} has no setting {}", protocol, id))
}

/// Configuration of one decoder session
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecoderConfig {
    /// Full ISA
    Isa(IsaConfig),
    /// Reduced ISA
    IsaMinimal(IsaMinimalConfig),
    /// PCI
    Pci(PciConfig),
}

impl DecoderConfig {
    /// Startup defaults for `protocol`
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Isa => DecoderConfig::Isa(IsaConfig::default()),
            Protocol::IsaMinimal => DecoderConfig::IsaMinimal(IsaMinimalConfig::default()),
            Protocol::Pci => DecoderConfig::Pci(PciConfig::default()),
        }
    }

    /// Protocol this configuration belongs to
    pub fn protocol(&self) -> Protocol {
        match self {
            DecoderConfig::Isa(_) => Protocol::Isa,
            DecoderConfig::IsaMinimal(_) => Protocol::IsaMinimal,
            DecoderConfig::Pci(_) => Protocol::Pci,
        }
    }

    /// Read the option index of setting `id`
    pub fn get_setting(&self, id: usize) -> Result<usize> {
        match self {
            DecoderConfig::Isa(c) => c.get(id),
            DecoderConfig::IsaMinimal(c) => c.get(id),
            DecoderConfig::Pci(c) => c.get(id),
        }
    }

    /// Store option `value` for setting `id`
    pub fn set_setting(&mut self, id: usize, value: usize) -> Result<()> {
        match self {
            DecoderConfig::Isa(c) => c.set(id, value),
            DecoderConfig::IsaMinimal(c) => c.set(id, value),
            DecoderConfig::Pci(c) => c.set(id, value),
        }
    }

    /// Put every setting back to its startup value
    pub fn reset(&mut self) {
        *self = DecoderConfig::for_protocol(self.protocol());
    }
}
