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

    modes::nibble.rs

    Nibble mode reverse transfers, including the channelized variant. Each byte
    arrives as two nibbles on the status lines, low nibble first.

*/

use crate::{
    error::{ParportError, TransferError, TransferResult},
    ieee::{self, Phase},
    modes::{extensibility, ModeContext, ModeDriver, ProtocolFamily, ProtocolModes},
    registers::*,
};

#[derive(Copy, Clone, Debug)]
pub struct Nibble {
    pub channelized: bool,
}

/// Reassemble a nibble from the status lines. nFault, Select and PError carry bits
/// 0-2; Busy carries bit 3 and arrives inverted.
#[inline]
pub fn status_to_nibble(dsr: u8) -> u8 {
    let mut nibble = (dsr >> 3) & 0x07;
    if dsr & DSR_NOT_BUSY == 0 {
        nibble |= 0x08;
    }
    nibble
}

impl Nibble {
    fn extensibility(&self) -> u8 {
        if self.channelized {
            extensibility::CHANNELIZED
        }
        else {
            extensibility::NIBBLE
        }
    }

    /// One request/acknowledge cycle, events 7 through 11.
    fn read_nibble(&self, ctx: &mut ModeContext) -> Result<u8, u8> {
        let tl = ctx.tl();

        // Event 7: HostBusy low, ready for data.
        ctx.set_event(7);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Active, DontCare);

        // Event 8/9: PtrClk low once the nibble is valid.
        ctx.set_event(9);
        if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Inactive, DontCare, DontCare, DontCare), tl) {
            return Err(9);
        }
        let nibble = status_to_nibble(ctx.hw.read_dsr());

        // Event 10: HostBusy high, nibble latched.
        ctx.set_event(10);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Inactive, DontCare);

        // Event 11: PtrClk high.
        ctx.set_event(11);
        if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Active, DontCare, DontCare, DontCare), tl) {
            return Err(11);
        }
        Ok(nibble)
    }
}

impl ModeDriver for Nibble {
    fn name(&self) -> &'static str {
        if self.channelized {
            "Channelized Nibble"
        }
        else {
            "Nibble"
        }
    }

    fn protocol(&self) -> ProtocolModes {
        if self.channelized {
            ProtocolModes::CHANNEL_NIBBLE
        }
        else {
            ProtocolModes::NIBBLE
        }
    }

    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::ReverseNibble
    }

    fn is_supported(&self, ctx: &mut ModeContext) -> bool {
        ctx.probe_mode(self, true)
    }

    fn connect(&self, ctx: &mut ModeContext, device_id_request: bool) -> Result<(), ParportError> {
        if ctx.safe() {
            let mut ext = self.extensibility();
            if device_id_request {
                ext |= extensibility::DEVICE_ID_REQ;
            }
            ieee::negotiate(ctx, ext)?;
        }
        else {
            ctx.state.connected = true;
            ctx.set_phase(Phase::ReverseIdle);
        }
        Ok(())
    }

    fn disconnect(&self, ctx: &mut ModeContext) {
        if ctx.safe() {
            if let Err(e) = ieee::terminate(ctx) {
                log::debug!("{}: termination: {}", self.name(), e);
            }
        }
        else {
            ctx.state.connected = false;
            ctx.set_phase(Phase::Terminate);
        }
    }

    /// nDataAvail low means the peripheral has a byte for us.
    fn have_read_data(&self, ctx: &mut ModeContext) -> bool {
        ctx.hw.read_dsr() & DSR_NOT_FAULT == 0
    }

    fn read(&self, ctx: &mut ModeContext, buf: &mut [u8]) -> TransferResult {
        if !ctx.state.phase.is_reverse() {
            return Err(ParportError::InvalidPhase(ctx.state.phase).into());
        }
        ctx.set_phase(Phase::ReverseXfer);

        let mut count = 0;
        while count < buf.len() {
            if !self.have_read_data(ctx) {
                break;
            }

            let byte = self
                .read_nibble(ctx)
                .and_then(|lo| self.read_nibble(ctx).map(|hi| lo | (hi << 4)));

            match byte {
                Ok(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                Err(event) => {
                    log::debug!("{}: timeout at event {} after {} bytes", self.name(), event, count);
                    ctx.fail_to(Phase::Unknown);
                    return Err(TransferError::new(ParportError::HandshakeTimeout(event), count));
                }
            }
        }

        ctx.set_phase(Phase::ReverseIdle);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelState,
        config::DriverConfig,
        port_io::SignalIo,
        sim::{FakeClock, SimulatedPort},
    };
    use std::sync::Arc;

    #[test]
    fn status_lines_decode_to_nibbles() {
        // All data lines high, Busy bit clear (line high).
        assert_eq!(status_to_nibble(0x38), 0x0F);
        assert_eq!(status_to_nibble(0x80), 0x00);
        assert_eq!(status_to_nibble(0x08), 0x09);
    }

    #[test]
    fn nibble_read_returns_peripheral_data() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        sim.with_end_of_chain(|p| p.reverse_data.extend([0x12, 0xA5, 0xFF]));
        let config = DriverConfig::default();
        let mut hw = SignalIo::new(Box::new(sim.clone()), Arc::new(clock), &config);
        let mut state = ChannelState::new(&config);
        let mut ctx = ModeContext {
            hw:     &mut hw,
            state:  &mut state,
            config: &config,
        };

        let nibble = Nibble { channelized: false };
        nibble.connect(&mut ctx, false).unwrap();
        assert!(nibble.have_read_data(&mut ctx));

        let mut buf = [0u8; 8];
        let n = nibble.read(&mut ctx, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x12, 0xA5, 0xFF]);
        assert_eq!(ctx.state.phase, Phase::ReverseIdle);
        assert!(!nibble.have_read_data(&mut ctx));

        nibble.disconnect(&mut ctx);
        assert_eq!(ctx.state.phase, Phase::Terminate);
    }

    #[test]
    fn nibble_timeout_resets_phase_to_unknown() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        sim.with_end_of_chain(|p| {
            p.reverse_data.extend([0x01, 0x02, 0x03]);
            p.stall_reverse_after = Some(1);
        });
        let config = DriverConfig::default();
        let mut hw = SignalIo::new(Box::new(sim.clone()), Arc::new(clock), &config);
        let mut state = ChannelState::new(&config);
        let mut ctx = ModeContext {
            hw:     &mut hw,
            state:  &mut state,
            config: &config,
        };

        let nibble = Nibble { channelized: false };
        nibble.connect(&mut ctx, false).unwrap();
        let mut buf = [0u8; 3];
        let err = nibble.read(&mut ctx, &mut buf).unwrap_err();
        assert_eq!(err.transferred, 1);
        assert!(matches!(err.error, ParportError::HandshakeTimeout(9)));
        assert_eq!(ctx.state.phase, Phase::Unknown);
        assert!(!ctx.state.connected);
    }
}
