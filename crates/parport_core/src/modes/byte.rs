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

    modes::byte.rs

    Byte mode (PS/2 bidirectional) reverse transfers. The data lines are turned
    around and a whole byte is read per handshake.

*/

use crate::{
    error::{ParportError, TransferError, TransferResult},
    ieee::{self, Phase},
    modes::{extensibility, ModeContext, ModeDriver, ProtocolFamily, ProtocolModes},
    registers::*,
};

#[derive(Copy, Clone, Debug)]
pub struct Byte;

impl Byte {
    fn read_byte(&self, ctx: &mut ModeContext) -> Result<u8, u8> {
        let tl = ctx.tl();

        // Event 7: HostBusy low.
        ctx.set_event(7);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Active, DontCare);

        // Event 9: PtrClk low, data valid.
        ctx.set_event(9);
        if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Inactive, DontCare, DontCare, DontCare), tl) {
            return Err(9);
        }
        let byte = ctx.hw.read_data();

        // Event 10: HostBusy high.
        ctx.set_event(10);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Inactive, DontCare);

        // Event 11: PtrClk high.
        ctx.set_event(11);
        if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Active, DontCare, DontCare, DontCare), tl) {
            return Err(11);
        }

        // Event 16: HostClk pulse acknowledges the byte.
        ctx.set_event(16);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, DontCare, Active);
        ctx.hw.stall_us(1);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, DontCare, Inactive);
        Ok(byte)
    }
}

impl ModeDriver for Byte {
    fn name(&self) -> &'static str {
        "Byte"
    }

    fn protocol(&self) -> ProtocolModes {
        ProtocolModes::BYTE_BIDIR
    }

    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::ReverseByte
    }

    fn is_supported(&self, ctx: &mut ModeContext) -> bool {
        let hardware_ok = ctx.hw.caps().byte_mode;
        ctx.probe_mode(self, hardware_ok)
    }

    fn connect(&self, ctx: &mut ModeContext, device_id_request: bool) -> Result<(), ParportError> {
        if ctx.safe() {
            let mut ext = extensibility::BYTE;
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
        ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, DontCare, DontCare);
        if ctx.safe() {
            if let Err(e) = ieee::terminate(ctx) {
                log::debug!("Byte: termination: {}", e);
            }
        }
        else {
            ctx.state.connected = false;
            ctx.set_phase(Phase::Terminate);
        }
    }

    fn enter_reverse(&self, ctx: &mut ModeContext) -> Result<(), ParportError> {
        ctx.hw.update_dcr(DIR_READ, DontCare, DontCare, DontCare, DontCare, DontCare);
        ctx.set_phase(Phase::ReverseIdle);
        Ok(())
    }

    fn exit_reverse(&self, ctx: &mut ModeContext) -> Result<(), ParportError> {
        ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, DontCare, DontCare);
        Ok(())
    }

    fn have_read_data(&self, ctx: &mut ModeContext) -> bool {
        ctx.hw.read_dsr() & DSR_NOT_FAULT == 0
    }

    fn read(&self, ctx: &mut ModeContext, buf: &mut [u8]) -> TransferResult {
        if !ctx.state.phase.is_reverse() {
            return Err(ParportError::InvalidPhase(ctx.state.phase).into());
        }
        ctx.hw.update_dcr(DIR_READ, DontCare, DontCare, DontCare, DontCare, DontCare);
        ctx.set_phase(Phase::ReverseXfer);

        let mut count = 0;
        while count < buf.len() && self.have_read_data(ctx) {
            match self.read_byte(ctx) {
                Ok(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                Err(event) => {
                    log::debug!("Byte: timeout at event {} after {} bytes", event, count);
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
        sim::{FakeClock, PeripheralCaps, SimulatedPort},
    };
    use std::sync::Arc;

    #[test]
    fn byte_mode_reads_whole_bytes() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        sim.with_end_of_chain(|p| p.reverse_data.extend(0u8..10));
        let config = DriverConfig::default();
        let mut hw = SignalIo::new(Box::new(sim.clone()), Arc::new(clock), &config);
        let mut state = ChannelState::new(&config);
        let mut ctx = ModeContext {
            hw:     &mut hw,
            state:  &mut state,
            config: &config,
        };

        assert!(Byte.is_supported(&mut ctx));
        assert!(ctx.state.modes_supported.contains(ProtocolModes::BYTE_BIDIR));

        Byte.connect(&mut ctx, false).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(Byte.read(&mut ctx, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0, 1, 2, 3]);
        Byte.disconnect(&mut ctx);
        assert!(sim.end_of_chain_in_compatibility());
    }

    #[test]
    fn byte_mode_unsupported_by_nibble_only_peripheral() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        sim.with_end_of_chain(|p| p.caps = PeripheralCaps::nibble_only());
        let config = DriverConfig::default();
        let mut hw = SignalIo::new(Box::new(sim.clone()), Arc::new(clock), &config);
        let mut state = ChannelState::new(&config);
        let mut ctx = ModeContext {
            hw:     &mut hw,
            state:  &mut state,
            config: &config,
        };

        assert!(!Byte.is_supported(&mut ctx));
        assert!(sim.end_of_chain_in_compatibility());
    }
}
