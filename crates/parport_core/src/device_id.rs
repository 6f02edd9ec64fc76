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

    device_id.rs

    IEEE 1284 device ID retrieval and parsing. The ID is read in nibble mode
    after negotiating with the device ID request flag, sanity checked, and
    parsed into the fields the driver acts on: identity, vendor quirks, modes
    the device cannot use and its datalink.

*/

use std::time::Duration;

use crate::{
    datalink::DataLinkMode,
    error::ParportError,
    ieee,
    modes::{extensibility, ModeContext, ModeDriver, Nibble, ProtocolModes},
    registers::DCR_NEUTRAL,
};

/// Two length bytes plus "MFG:x;" and "MDL:y;".
pub const MIN_VALID_ID_LEN: usize = 14;
pub const MAX_ID_LEN: usize = 1024;
const MAX_TRIES: usize = 3;

/// A parsed IEEE 1284 device ID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceId {
    /// The ID string without its length prefix.
    pub raw: String,
    pub manufacturer: String,
    pub model: String,
    pub command_set: String,
    pub class: String,
    pub description: String,
    /// Modes listed under `1284.3M`, which the device cannot tolerate.
    pub bad_modes: ProtocolModes,
    pub dot3_dl: Option<String>,
    pub dot3_channels: Option<String>,
    pub dot4_dl: Option<String>,
}

impl DeviceId {
    pub fn parse(raw: &str) -> DeviceId {
        let mut id = DeviceId {
            raw: raw.to_string(),
            ..Default::default()
        };

        for field in raw.split(';') {
            let field = field.trim_start_matches(' ');
            if field.is_empty() {
                continue;
            }
            let Some((key, value)) = field.split_once(':') else {
                // Anything after a key without a value is unreliable.
                break;
            };
            match key {
                "MFG" | "MANUFACTURER" => id.manufacturer = value.to_string(),
                "MDL" | "MODEL" => id.model = value.to_string(),
                "CMD" | "COMMAND SET" => id.command_set = value.to_string(),
                "CLS" | "CLASS" => id.class = value.to_string(),
                "DES" | "DESCRIPTION" => id.description = value.to_string(),
                "1284.4DL" => id.dot4_dl = Some(value.to_string()),
                "1284.3DL" => id.dot3_dl = Some(value.to_string()),
                "1284.3C" | ".3C" => id.dot3_channels = Some(value.to_string()),
                "1284.3M" | ".3M" => id.bad_modes = parse_modes(value),
                _ => {}
            }
        }
        id
    }

    /// The datalink this device speaks, if any. A 1284.4 datalink takes precedence
    /// over 1284.3, and a legacy MLC command set is the fallback.
    pub fn datalink_mode(&self) -> Option<DataLinkMode> {
        if self.dot4_dl.is_some() {
            Some(DataLinkMode::Dot4)
        }
        else if self.dot3_dl.is_some() {
            Some(DataLinkMode::Dot3)
        }
        else if self.command_set.split(',').any(|c| c.trim() == "MLC") {
            Some(DataLinkMode::Mlc)
        }
        else {
            None
        }
    }

    /// Manufacturer and model joined into an identifier safe for device naming.
    pub fn pnp_id(&self) -> String {
        fixup(&format!("{}{}", self.manufacturer, self.model))
    }
}

/// Replace characters that are not allowed in device identifiers with '_'.
pub fn fixup(id: &str) -> String {
    id.chars()
        .map(|c| if c <= ' ' || c > '\x7F' || c == ',' { '_' } else { c })
        .collect()
}

fn parse_modes(list: &str) -> ProtocolModes {
    let mut modes = ProtocolModes::empty();
    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        modes |= match name.to_ascii_uppercase().as_str() {
            "COMPAT" | "IEEE" => ProtocolModes::IEEE_COMPATIBILITY,
            "NIBBLE" => ProtocolModes::NIBBLE,
            "CNIBBLE" | "CHANNEL_NIBBLE" => ProtocolModes::CHANNEL_NIBBLE,
            "BYTE" => ProtocolModes::BYTE_BIDIR,
            "EPP" => ProtocolModes::EPP_ANY,
            "ECP" => ProtocolModes::ECP_SW | ProtocolModes::ECP_HW_NOIRQ | ProtocolModes::ECP_HW_IRQ,
            "BECP" => ProtocolModes::BOUNDED_ECP,
            other => {
                log::warn!("device ID: unknown 1284.3M mode '{}'", other);
                ProtocolModes::empty()
            }
        };
    }
    modes
}

/// Check the length prefix and cut the ID at its reported length. Returns `None`
/// for a transfer that does not look like a device ID.
pub fn validate(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 2 {
        return None;
    }
    let (high, low) = (bytes[0], bytes[1]);
    if high > 2 {
        log::debug!("device ID: length {:02X} {:02X} looks bogus", high, low);
        return None;
    }
    if bytes.len() < MIN_VALID_ID_LEN {
        return None;
    }
    let length = (high as usize) << 8 | low as usize;
    let end = if length >= MIN_VALID_ID_LEN && length < bytes.len() {
        length
    }
    else {
        bytes.len()
    };
    if end < length {
        log::debug!("device ID: shorter than reported ({} of {} bytes)", end, length);
    }
    Some(String::from_utf8_lossy(&bytes[2..end]).into_owned())
}

/// Read the device ID of the peripheral on `ctx`. The link must be in
/// compatibility mode; it is returned there afterwards.
///
/// A peripheral that answers with a few bytes but not a whole ID is asked again,
/// up to three times in all.
pub fn query(ctx: &mut ModeContext) -> Result<DeviceId, ParportError> {
    // Some printers need a pause between back to back ID requests.
    let delay = Duration::from_millis(ctx.config.timing.device_id_delay_ms);
    ctx.hw.sleep(delay);

    let nibble = Nibble { channelized: false };
    let mut buf = vec![0u8; MAX_ID_LEN];

    for attempt in 1..=MAX_TRIES {
        if let Err(e) = ieee::negotiate(ctx, extensibility::NIBBLE | extensibility::DEVICE_ID_REQ) {
            log::debug!("device ID: negotiation failed: {}", e);
            return Err(match e {
                ParportError::ModeRefused(_) => ParportError::NoDeviceId,
                e => e,
            });
        }

        let count = match nibble.read(ctx, &mut buf) {
            Ok(n) => n,
            Err(e) => e.transferred,
        };
        let id = validate(&buf[..count]).map(|raw| DeviceId::parse(&raw));

        // The quirk applies to the termination that ends this very read.
        if let Some(id) = &id {
            ctx.state.ignore_xflag = ctx.config.ignores_xflag(&id.manufacturer, &id.model);
        }
        if let Err(e) = ieee::terminate(ctx) {
            log::debug!("device ID: termination: {}", e);
        }
        ctx.hw.write_dcr(DCR_NEUTRAL);

        if let Some(id) = id {
            log::debug!("device ID: {}", id.raw);
            return Ok(id);
        }
        if count == 0 || count >= MIN_VALID_ID_LEN {
            break;
        }
        log::warn!("device ID: short read of {} bytes on attempt {}", count, attempt);
    }
    Err(ParportError::NoDeviceId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelState,
        config::DriverConfig,
        ieee::Phase,
        port_io::SignalIo,
        sim::{FakeClock, SimulatedPort},
    };
    use std::sync::Arc;

    fn query_sim(sim: &SimulatedPort, clock: FakeClock) -> (Result<DeviceId, ParportError>, Phase) {
        let config = DriverConfig::default();
        let mut hw = SignalIo::new(Box::new(sim.clone()), Arc::new(clock), &config);
        let mut state = ChannelState::new(&config);
        let mut ctx = ModeContext {
            hw:     &mut hw,
            state:  &mut state,
            config: &config,
        };
        let result = query(&mut ctx);
        (result, ctx.state.phase)
    }

    #[test]
    fn parses_keys_and_aliases() {
        let id = DeviceId::parse("MANUFACTURER:Acme;COMMAND SET:PCL,MLC;MDL:Laser 9; CLS:PRINTER;DES:Acme Laser;");
        assert_eq!(id.manufacturer, "Acme");
        assert_eq!(id.model, "Laser 9");
        assert_eq!(id.class, "PRINTER");
        assert_eq!(id.description, "Acme Laser");
        assert_eq!(id.datalink_mode(), Some(DataLinkMode::Mlc));
        assert_eq!(id.pnp_id(), "AcmeLaser_9");
    }

    #[test]
    fn dot4_takes_precedence_over_dot3() {
        let id = DeviceId::parse("MFG:X;MDL:Y;1284.3DL:1;1284.4DL:2;.3M:BECP,byte;");
        assert_eq!(id.datalink_mode(), Some(DataLinkMode::Dot4));
        assert_eq!(id.bad_modes, ProtocolModes::BOUNDED_ECP | ProtocolModes::BYTE_BIDIR);
    }

    #[test]
    fn validate_rejects_bogus_lengths() {
        assert_eq!(validate(b"\x05\x10MFG:ACME;MDL:JET;"), None);
        assert_eq!(validate(b"\x00\x08MFG:A;"), None);

        let id = validate(b"\x00\x10MFG:AB;MDL:CD;trailing").unwrap();
        assert_eq!(id, "MFG:AB;MDL:CD;");
    }

    #[test]
    fn fixup_replaces_invalid_characters() {
        assert_eq!(fixup("HP LaserJet,4\u{e9}"), "HP_LaserJet_4_");
    }

    #[test]
    fn query_reads_simulated_id() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        let (result, phase) = query_sim(&sim, clock);
        let id = result.unwrap();
        assert_eq!(id.manufacturer, "Generic");
        assert_eq!(id.model, "Simulated Printer");
        assert_eq!(id.class, "PRINTER");
        assert_eq!(phase, Phase::Terminate);
        assert!(sim.end_of_chain_in_compatibility());
    }

    #[test]
    fn query_without_id_reports_no_device_id() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        sim.with_end_of_chain(|p| p.device_id = None);
        let (result, _) = query_sim(&sim, clock);
        assert!(matches!(result, Err(ParportError::NoDeviceId)));
        assert!(sim.end_of_chain_in_compatibility());
    }
}
