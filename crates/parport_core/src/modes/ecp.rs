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

    modes::ecp.rs

    ECP mode driven in software. Forward bytes are clocked with
    HostClk/PeriphAck, reverse bytes with PeriphClk/HostAck. The event helpers
    here are shared with the FIFO-based hardware driver, which uses the same
    direction-change handshakes.

*/

use crate::{
    error::{ParportError, TransferError, TransferResult},
    ieee::{self, Phase},
    modes::{extensibility, ModeContext, ModeDriver, ProtocolFamily, ProtocolModes, MAX_CHANNEL},
    registers::*,
};

/// Negotiate ECP (or bounded ECP) and run the setup phase, events 30 and 31.
pub(crate) fn ecp_connect(ctx: &mut ModeContext, ext: u8, device_id_request: bool) -> Result<(), ParportError> {
    if ctx.safe() {
        let ext = if device_id_request {
            ext | extensibility::DEVICE_ID_REQ
        }
        else {
            ext
        };
        ieee::negotiate(ctx, ext)?;
    }
    else {
        ctx.state.connected = true;
    }
    setup_phase(ctx)
}

pub(crate) fn setup_phase(ctx: &mut ModeContext) -> Result<(), ParportError> {
    ctx.set_phase(Phase::Setup);

    // Event 30: HostAck low.
    ctx.set_event(30);
    ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Inactive, DontCare);

    // Event 31: nAckReverse high, PeriphAck low.
    if ctx.safe() {
        ctx.set_event(31);
        let tl = ctx.tl();
        if !ctx.hw.check_dsr(DsrPattern::new(Inactive, Active, Active, Active, DontCare), tl) {
            ctx.fail_to(Phase::Unknown);
            return Err(ParportError::HandshakeTimeout(31));
        }
    }

    ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, Active, Active);
    ctx.set_phase(Phase::ForwardIdle);
    Ok(())
}

/// Events 38 and 39, plus the state 40 check in SAFE mode. Refuses with a timeout
/// if the peripheral is still mid-handshake on the forward channel.
pub(crate) fn enter_reverse_events(ctx: &mut ModeContext) -> Result<(), ParportError> {
    let tl = ctx.tl();

    if ctx.safe() && !ctx.hw.check_dsr(DsrPattern::new(Inactive, DontCare, DontCare, DontCare, DontCare), tl) {
        log::debug!("ECP: peripheral not idle, refusing direction change");
        return Err(ParportError::HandshakeTimeout(38));
    }

    ctx.set_phase(Phase::FwdToRev);

    // Event 38: release the data bus, HostAck low.
    ctx.set_event(38);
    ctx.hw.update_dcr(DIR_READ, DontCare, DontCare, DontCare, Inactive, DontCare);
    ctx.hw.stall_us(1);

    // Event 39: nReverseRequest low.
    ctx.set_event(39);
    ctx.hw.update_dcr(DontCare, DontCare, DontCare, Inactive, DontCare, DontCare);

    // State 40: nAckReverse low.
    if ctx.safe() {
        ctx.set_event(40);
        if !ctx.hw.check_dsr(DsrPattern::new(DontCare, DontCare, Inactive, Active, DontCare), tl) {
            ctx.fail_to(Phase::Unknown);
            return Err(ParportError::HandshakeTimeout(40));
        }
    }
    Ok(())
}

/// Events 47 through 49: hand the bus back to the host.
pub(crate) fn exit_reverse_events(ctx: &mut ModeContext) -> Result<(), ParportError> {
    ctx.set_phase(Phase::RevToFwd);

    // Event 47: nReverseRequest high.
    ctx.set_event(47);
    ctx.hw.update_dcr(DontCare, DontCare, DontCare, Active, DontCare, DontCare);

    // Event 49: nAckReverse high, PeriphAck low.
    if ctx.safe() {
        ctx.set_event(49);
        let timeout = ctx.config.timing.receive_timeout();
        if !ctx.hw.check_dsr(DsrPattern::new(Inactive, Active, Active, Active, DontCare), timeout) {
            return Err(ParportError::HandshakeTimeout(49));
        }
    }
    Ok(())
}

#[derive(Copy, Clone, Debug)]
pub struct EcpSw;

impl EcpSw {
    /// Forward cycle, events 34 through 37.
    fn write_byte(&self, ctx: &mut ModeContext, byte: u8) -> Result<(), u8> {
        let tl = ctx.tl();
        ctx.hw.write_data(byte);

        // Event 34: HostClk low.
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, DontCare, Inactive);

        // Event 35: PeriphAck high.
        if !ctx.hw.check_dsr(DsrPattern::new(Active, DontCare, DontCare, DontCare, DontCare), tl) {
            ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, DontCare, Active);
            return Err(35);
        }

        // Event 36: HostClk high.
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, DontCare, Active);

        // Event 37: PeriphAck low.
        if !ctx.hw.check_dsr(DsrPattern::new(Inactive, DontCare, DontCare, DontCare, DontCare), tl) {
            return Err(37);
        }
        Ok(())
    }

    /// Reverse cycle, events 43 through 46.
    fn read_byte(&self, ctx: &mut ModeContext) -> Result<u8, u8> {
        let tl = ctx.tl();

        // Event 43: PeriphClk low, data valid.
        if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Inactive, DontCare, DontCare, DontCare), tl) {
            return Err(43);
        }
        let byte = ctx.hw.read_data();

        // Event 44: HostAck high.
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Active, DontCare);

        // Event 45: PeriphClk high.
        if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Active, DontCare, DontCare, DontCare), tl) {
            return Err(45);
        }

        // Event 46: HostAck low.
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Inactive, DontCare);
        Ok(byte)
    }
}

impl ModeDriver for EcpSw {
    fn name(&self) -> &'static str {
        "ECP (software)"
    }

    fn protocol(&self) -> ProtocolModes {
        ProtocolModes::ECP_SW
    }

    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Ecp
    }

    fn is_supported(&self, ctx: &mut ModeContext) -> bool {
        ctx.probe_mode(self, true)
    }

    fn connect(&self, ctx: &mut ModeContext, device_id_request: bool) -> Result<(), ParportError> {
        ecp_connect(ctx, extensibility::ECP, device_id_request)
    }

    fn disconnect(&self, ctx: &mut ModeContext) {
        if ctx.state.phase.is_reverse() {
            if let Err(e) = self.exit_reverse(ctx) {
                log::debug!("ECP: exit reverse during disconnect: {}", e);
            }
        }
        if ctx.safe() {
            if let Err(e) = ieee::terminate(ctx) {
                log::debug!("ECP: termination: {}", e);
            }
        }
        else {
            ctx.state.connected = false;
            ctx.set_phase(Phase::Terminate);
        }
    }

    fn enter_reverse(&self, ctx: &mut ModeContext) -> Result<(), ParportError> {
        enter_reverse_events(ctx)?;
        ctx.set_phase(Phase::ReverseIdle);
        Ok(())
    }

    fn exit_reverse(&self, ctx: &mut ModeContext) -> Result<(), ParportError> {
        if let Err(e) = exit_reverse_events(ctx) {
            ctx.fail_to(Phase::Unknown);
            return Err(e);
        }
        ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, Active, Active);
        ctx.set_phase(Phase::ForwardIdle);
        Ok(())
    }

    /// Channel addresses travel as command cycles, HostAck low with bit 7 set.
    fn set_interface_address(&self, ctx: &mut ModeContext, address: u8) -> Result<(), ParportError> {
        if address > MAX_CHANNEL {
            return Err(ParportError::AddressProgramming(address));
        }
        ctx.set_phase(Phase::ForwardXfer);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Inactive, DontCare);
        let result = self.write_byte(ctx, 0x80 | address);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Active, DontCare);
        match result {
            Ok(()) => {
                ctx.set_phase(Phase::ForwardIdle);
                Ok(())
            }
            Err(event) => {
                log::debug!("ECP: address cycle failed at event {}", event);
                ctx.fail_to(Phase::Unknown);
                Err(ParportError::AddressProgramming(address))
            }
        }
    }

    /// nPeriphRequest low.
    fn have_read_data(&self, ctx: &mut ModeContext) -> bool {
        ctx.hw.read_dsr() & DSR_NOT_FAULT == 0
    }

    fn read(&self, ctx: &mut ModeContext, buf: &mut [u8]) -> TransferResult {
        if !ctx.state.phase.is_reverse() {
            return Err(ParportError::InvalidPhase(ctx.state.phase).into());
        }
        ctx.set_phase(Phase::ReverseXfer);

        let mut count = 0;
        while count < buf.len() && self.have_read_data(ctx) {
            match self.read_byte(ctx) {
                Ok(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                Err(event) => {
                    log::debug!("ECP: reverse timeout at event {} after {} bytes", event, count);
                    ctx.fail_to(Phase::Unknown);
                    return Err(TransferError::new(ParportError::HandshakeTimeout(event), count));
                }
            }
        }

        ctx.set_phase(Phase::ReverseIdle);
        Ok(count)
    }

    fn write(&self, ctx: &mut ModeContext, buf: &[u8]) -> TransferResult {
        if !ctx.state.phase.is_forward() {
            return Err(ParportError::InvalidPhase(ctx.state.phase).into());
        }
        ctx.set_phase(Phase::ForwardXfer);

        for (i, byte) in buf.iter().enumerate() {
            if let Err(event) = self.write_byte(ctx, *byte) {
                log::debug!("ECP: forward timeout at event {} after {} bytes", event, i);
                ctx.fail_to(Phase::Unknown);
                return Err(TransferError::new(ParportError::HandshakeTimeout(event), i));
            }
        }

        ctx.set_phase(Phase::ForwardIdle);
        Ok(buf.len())
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

    fn run<F: FnOnce(&mut ModeContext, &SimulatedPort)>(f: F) {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        let config = DriverConfig::default();
        let mut hw = SignalIo::new(Box::new(sim.clone()), Arc::new(clock), &config);
        let mut state = ChannelState::new(&config);
        let mut ctx = ModeContext {
            hw:     &mut hw,
            state:  &mut state,
            config: &config,
        };
        f(&mut ctx, &sim);
    }

    #[test]
    fn ecp_software_round_trip() {
        run(|ctx, sim| {
            EcpSw.connect(ctx, false).unwrap();
            assert_eq!(ctx.state.phase, Phase::ForwardIdle);

            EcpSw.set_interface_address(ctx, 2).unwrap();
            assert_eq!(EcpSw.write(ctx, b"ecp").unwrap(), 3);
            assert_eq!(sim.end_of_chain_received(), b"ecp".to_vec());
            assert_eq!(sim.end_of_chain_channels(), vec![2]);

            sim.with_end_of_chain(|p| p.reverse_data.extend([0x55, 0xAA]));
            assert!(EcpSw.have_read_data(ctx));
            EcpSw.enter_reverse(ctx).unwrap();
            let mut buf = [0u8; 4];
            assert_eq!(EcpSw.read(ctx, &mut buf).unwrap(), 2);
            assert_eq!(&buf[..2], &[0x55, 0xAA]);

            EcpSw.exit_reverse(ctx).unwrap();
            assert_eq!(ctx.state.phase, Phase::ForwardIdle);
            EcpSw.disconnect(ctx);
            assert!(sim.end_of_chain_in_compatibility());
        });
    }

    #[test]
    fn reverse_refused_while_peripheral_mid_handshake() {
        run(|ctx, sim| {
            EcpSw.connect(ctx, false).unwrap();
            sim.with_end_of_chain(|p| p.hold_periph_ack = true);

            let err = EcpSw.enter_reverse(ctx).unwrap_err();
            assert!(matches!(err, ParportError::HandshakeTimeout(38)));
            assert_eq!(ctx.state.phase, Phase::ForwardIdle);
            assert!(ctx.state.connected);
        });
    }
}
