/*
    MartyPC
    https://github.com/dbalsom/martypc

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    config.rs

    Driver configuration. A DriverConfig is built once, usually from a TOML
    file, and shared read-only by every component that touches the port. All
    protocol timing constants live here so they can be tuned per installation
    or shortened for simulation.

*/

use std::{path::PathBuf, str::FromStr, time::Duration};

use serde_derive::Deserialize;

use crate::{error::ParportError, modes::ProtocolModes};

const fn _default_true() -> bool {
    true
}

/// SAFE mode runs the full IEEE 1284 discipline. UNSAFE mode skips negotiation and
/// assumes the peripheral is always in the requested mode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum ModeSafety {
    #[default]
    Safe,
    Unsafe,
}

impl FromStr for ModeSafety {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err>
    where
        Self: Sized,
    {
        match s.to_lowercase().as_str() {
            "safe" => Ok(ModeSafety::Safe),
            "unsafe" => Ok(ModeSafety::Unsafe),
            _ => Err(format!("Bad value for ModeSafety: '{}'", s)),
        }
    }
}

/// Capabilities of the port hardware itself, independent of the attached peripheral.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub ecp: bool,
    pub epp: bool,
    pub epp_32bit: bool,
    pub byte_mode: bool,
    pub fifo_depth: usize,
    pub fifo_width: usize,
    pub host_recovery: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            ecp: true,
            epp: true,
            epp_32bit: false,
            byte_mode: true,
            fifo_depth: 16,
            fifo_width: 1,
            host_recovery: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub mode_safety: ModeSafety,
    pub forward_mode_override: Option<u16>,
    pub reverse_mode_override: Option<u16>,
    pub forward_interface_address: u8,
    pub reverse_interface_address: u8,
    pub event22_delay_us: u64,
    #[serde(default = "_default_true")]
    pub synch_writes: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode_safety: ModeSafety::Safe,
            forward_mode_override: None,
            reverse_mode_override: None,
            forward_interface_address: 0,
            reverse_interface_address: 0,
            event22_delay_us: 0,
            synch_writes: true,
        }
    }
}

impl ChannelConfig {
    pub fn forward_override(&self) -> Option<ProtocolModes> {
        self.forward_mode_override.map(ProtocolModes::from_bits_truncate)
    }

    pub fn reverse_override(&self) -> Option<ProtocolModes> {
        self.reverse_mode_override.map(ProtocolModes::from_bits_truncate)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DataLinkConfig {
    pub data_channel: u8,
    pub reset_channel: u8,
    pub reset_byte_count: u8,
    pub reset_byte: u8,
    pub forward_skip_mask: u16,
    pub reverse_skip_mask: u16,
    pub max_frame: usize,
}

impl Default for DataLinkConfig {
    fn default() -> Self {
        Self {
            data_channel: 0,
            reset_channel: 0x7F,
            reset_byte_count: 4,
            reset_byte: 0,
            forward_skip_mask: ProtocolModes::FORWARD_DATALINK_SKIP.bits(),
            reverse_skip_mask: ProtocolModes::REVERSE_DATALINK_SKIP.bits(),
            max_frame: 4096,
        }
    }
}

/// Protocol timing. Defaults are the values real hardware expects.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// IEEE 1284 TL, the peripheral response window for most events.
    pub tl_ms: u64,
    /// Receive-side window, also used while waiting for an ECP FIFO to drain.
    pub receive_timeout_ms: u64,
    /// Status window for 1284.3 mode qualifier checks.
    pub daisy_chain_check_ms: u64,
    /// Status reads allowed for a CPP select or deselect to be acknowledged.
    pub select_poll_count: u32,
    pub select_poll_stall_us: u64,
    pub dot3_retries: u32,
    /// Upper bound when probing how long a printer takes to raise BUSY.
    pub spp_busy_probe_us: u64,
    /// Delay used when the probe never saw BUSY.
    pub spp_busy_fallback_us: u64,
    pub spp_ready_timeout_ms: u64,
    /// Total time the write path waits out a printer condition.
    pub write_timeout_s: u64,
    pub write_retry_sleep_ms: u64,
    pub device_id_delay_ms: u64,
    pub compatibility_reset_us: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tl_ms: 35,
            receive_timeout_ms: 330,
            daisy_chain_check_ms: 5,
            select_poll_count: 25000,
            select_poll_stall_us: 0,
            dot3_retries: 5,
            spp_busy_probe_us: 10,
            spp_busy_fallback_us: 10,
            spp_ready_timeout_ms: 35,
            write_timeout_s: 300,
            write_retry_sleep_ms: 1000,
            device_id_delay_ms: 40,
            compatibility_reset_us: 300,
            acquire_timeout_ms: 5000,
        }
    }
}

impl TimingConfig {
    pub fn tl(&self) -> Duration {
        Duration::from_millis(self.tl_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn daisy_chain_check(&self) -> Duration {
        Duration::from_millis(self.daisy_chain_check_ms)
    }

    pub fn spp_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.spp_ready_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_s)
    }

    pub fn write_retry_sleep(&self) -> Duration {
        Duration::from_millis(self.write_retry_sleep_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// A manufacturer/model pair matched as substrings of a device ID.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct QuirkEntry {
    pub manufacturer: String,
    pub model: String,
}

impl QuirkEntry {
    pub fn new(manufacturer: &str, model: &str) -> Self {
        Self {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
        }
    }
}

/// Peripherals whose firmware does not toggle XFlag during termination.
pub const XFLAG_QUIRKS: &[(&str, &str)] = &[
    ("Brother", "MFC"),
    ("Brother", "FAX"),
    ("Brother", "HL-P"),
    ("Brother", "DCP"),
    ("PitneyBowes", "1630"),
    ("PitneyBowes", "1640"),
    ("LEGEND", "LJ6112MFC"),
    ("LEGEND", "LJ6212MFC"),
    ("HBP", "MFC 6550"),
    ("HBP", "OMNI L621"),
    ("HBP", "LJ 6106MFC"),
    ("HBP", "LJ 6206MFC"),
    ("Legend", "LJ6012MFP"),
];

fn _default_quirks() -> Vec<QuirkEntry> {
    XFLAG_QUIRKS.iter().map(|(m, d)| QuirkEntry::new(m, d)).collect()
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    pub file: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub port: PortConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub datalink: DataLinkConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default = "_default_quirks")]
    pub quirks: Vec<QuirkEntry>,
    #[serde(default)]
    pub trace: TraceConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port: PortConfig::default(),
            channel: ChannelConfig::default(),
            datalink: DataLinkConfig::default(),
            timing: TimingConfig::default(),
            quirks: _default_quirks(),
            trace: TraceConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn from_toml_str(toml_string: &str) -> Result<DriverConfig, ParportError> {
        let config: DriverConfig = toml::from_str(toml_string).map_err(|e| ParportError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<DriverConfig, ParportError> {
        let toml_string = std::fs::read_to_string(path)?;
        DriverConfig::from_toml_str(&toml_string)
    }

    fn validate(&self) -> Result<(), ParportError> {
        if self.port.ecp && self.port.fifo_depth == 0 {
            return Err(ParportError::Config("ECP port with zero FIFO depth".to_string()));
        }
        if self.channel.forward_interface_address > crate::modes::MAX_CHANNEL
            || self.channel.reverse_interface_address > crate::modes::MAX_CHANNEL
        {
            return Err(ParportError::Config("interface address out of range".to_string()));
        }
        if self.datalink.reset_byte_count == 0 {
            return Err(ParportError::Config("datalink reset_byte_count must be nonzero".to_string()));
        }
        Ok(())
    }

    /// True if the given device ID manufacturer and model match a quirk entry.
    pub fn ignores_xflag(&self, manufacturer: &str, model: &str) -> bool {
        self.quirks
            .iter()
            .any(|q| manufacturer.contains(q.manufacturer.as_str()) && model.contains(q.model.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = DriverConfig::from_toml_str("").unwrap();
        assert_eq!(config.timing.tl_ms, 35);
        assert_eq!(config.timing.select_poll_count, 25000);
        assert_eq!(config.channel.mode_safety, ModeSafety::Safe);
        assert_eq!(config.quirks.len(), XFLAG_QUIRKS.len());
    }

    #[test]
    fn config_overrides_parse() {
        let toml = r#"
            [port]
            ecp = false
            epp_32bit = true

            [channel]
            mode_safety = "Unsafe"
            forward_mode_override = 1

            [timing]
            write_timeout_s = 3

            [[quirks]]
            manufacturer = "Acme"
            model = "Dot"
        "#;
        let config = DriverConfig::from_toml_str(toml).unwrap();
        assert!(!config.port.ecp);
        assert!(config.port.epp_32bit);
        assert_eq!(config.channel.mode_safety, ModeSafety::Unsafe);
        assert_eq!(config.channel.forward_override(), Some(ProtocolModes::IEEE_COMPATIBILITY));
        assert_eq!(config.timing.write_timeout_s, 3);
        assert_eq!(config.timing.tl_ms, 35);
        assert_eq!(config.quirks, vec![QuirkEntry::new("Acme", "Dot")]);
    }

    #[test]
    fn quirk_lookup_matches_substrings() {
        let config = DriverConfig::default();
        assert!(config.ignores_xflag("Brother", "MFC-7820N"));
        assert!(config.ignores_xflag("HBP", "MFC 6550MC"));
        assert!(!config.ignores_xflag("Brother", "HL-2140"));
        assert!(!config.ignores_xflag("Hewlett-Packard", "LaserJet 4"));
    }

    #[test]
    fn bad_config_is_rejected() {
        assert!(DriverConfig::from_toml_str("[datalink]\nreset_byte_count = 0\n").is_err());
        assert!("bogus".parse::<ModeSafety>().is_err());
    }
}
