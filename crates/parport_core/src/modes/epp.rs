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

    modes::epp.rs

    EPP transfers. The hardware variant lets the port generate the EPP cycles
    through its address and data registers; the software variant drives nWrite,
    nDStrb and nAStrb directly and waits on nWait.

*/

use crate::{
    error::{ParportError, TransferError, TransferResult},
    ieee::{self, Phase},
    modes::{extensibility, ModeContext, ModeDriver, ProtocolFamily, ProtocolModes, MAX_CHANNEL},
    registers::*,
};

/// Set by the port when an EPP cycle was not acknowledged.
pub const DSR_EPP_TIMEOUT: u8 = 0x01;

fn epp_connect(ctx: &mut ModeContext) -> Result<(), ParportError> {
    if ctx.safe() {
        ieee::negotiate(ctx, extensibility::EPP)?;
    }
    else {
        ctx.state.connected = true;
    }
    // Idle EPP bus: all strobes released, host driving.
    ctx.hw.update_dcr(DIR_WRITE, DontCare, Inactive, Active, Inactive, Inactive);
    ctx.set_phase(Phase::ForwardIdle);
    Ok(())
}

/// EPP has no termination handshake of its own; a pulse on nInit resets the
/// peripheral to compatibility mode.
fn epp_disconnect(ctx: &mut ModeContext) {
    if ctx.safe() && ctx.state.connected {
        ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, Inactive, Inactive, Inactive);
        ctx.hw.stall_us(ctx.config.timing.compatibility_reset_us);
        ctx.hw.write_dcr(DCR_NEUTRAL);
    }
    ctx.state.connected = false;
    ctx.set_phase(Phase::Terminate);
}

fn check_epp_timeout(ctx: &mut ModeContext) -> Result<(), ParportError> {
    if ctx.hw.read_dsr() & DSR_EPP_TIMEOUT != 0 {
        clear_epp_timeout(ctx);
        Err(ParportError::HandshakeTimeout(0))
    }
    else {
        Ok(())
    }
}

/// Chipsets clear the timeout latch in different ways: on a status read, by
/// writing the bit back as one, or by writing it as zero. Do all three.
fn clear_epp_timeout(ctx: &mut ModeContext) {
    _ = ctx.hw.read_dsr();
    let dsr = ctx.hw.read_dsr();
    ctx.hw.write(Register::Status, dsr | DSR_EPP_TIMEOUT);
    ctx.hw.write(Register::Status, dsr & !DSR_EPP_TIMEOUT);
    if ctx.hw.read_dsr() & DSR_EPP_TIMEOUT != 0 {
        log::warn!("EPP timeout bit did not clear");
    }
}

#[derive(Copy, Clone, Debug)]
pub struct EppHw;

impl ModeDriver for EppHw {
    fn name(&self) -> &'static str {
        "EPP (hardware)"
    }

    fn protocol(&self) -> ProtocolModes {
        ProtocolModes::EPP_HW
    }

    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Epp
    }

    fn is_supported(&self, ctx: &mut ModeContext) -> bool {
        let hardware_ok = ctx.hw.caps().epp;
        ctx.probe_mode(self, hardware_ok)
    }

    fn connect(&self, ctx: &mut ModeContext, _device_id_request: bool) -> Result<(), ParportError> {
        epp_connect(ctx)
    }

    fn disconnect(&self, ctx: &mut ModeContext) {
        epp_disconnect(ctx)
    }

    fn set_interface_address(&self, ctx: &mut ModeContext, address: u8) -> Result<(), ParportError> {
        if address > MAX_CHANNEL {
            return Err(ParportError::AddressProgramming(address));
        }
        ctx.hw.write(Register::EppAddress, address);
        check_epp_timeout(ctx).map_err(|_| ParportError::AddressProgramming(address))
    }

    fn have_read_data(&self, ctx: &mut ModeContext) -> bool {
        ctx.hw.read_dsr() & DSR_NOT_FAULT == 0
    }

    fn read(&self, ctx: &mut ModeContext, buf: &mut [u8]) -> TransferResult {
        ctx.set_phase(Phase::ReverseXfer);
        ctx.hw.update_dcr(DIR_READ, DontCare, DontCare, DontCare, DontCare, DontCare);

        if ctx.hw.caps().epp_32bit && buf.len() % 4 == 0 {
            let mut words = vec![0u32; buf.len() / 4];
            ctx.hw.read_buffer_u32(Register::EppData, &mut words);
            for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
                chunk.copy_from_slice(&word.to_le_bytes());
            }
        }
        else {
            ctx.hw.read_buffer(Register::EppData, buf);
        }

        let result = check_epp_timeout(ctx);
        ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, DontCare, DontCare);
        match result {
            Ok(()) => {
                ctx.set_phase(Phase::ReverseIdle);
                Ok(buf.len())
            }
            Err(e) => {
                ctx.fail_to(Phase::Unknown);
                Err(TransferError::new(e, 0))
            }
        }
    }

    fn write(&self, ctx: &mut ModeContext, buf: &[u8]) -> TransferResult {
        ctx.set_phase(Phase::ForwardXfer);

        if ctx.hw.caps().epp_32bit && buf.len() % 4 == 0 {
            let words: Vec<u32> = buf
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            ctx.hw.write_buffer_u32(Register::EppData, &words);
        }
        else {
            ctx.hw.write_buffer(Register::EppData, buf);
        }

        match check_epp_timeout(ctx) {
            Ok(()) => {
                ctx.set_phase(Phase::ForwardIdle);
                Ok(buf.len())
            }
            Err(e) => {
                ctx.fail_to(Phase::Unknown);
                Err(TransferError::new(e, 0))
            }
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct EppSw;

impl EppSw {
    /// One EPP cycle. `address` selects nAStrb instead of nDStrb; `write` asserts
    /// nWrite.
    fn cycle(&self, ctx: &mut ModeContext, address: bool, write: bool, value: u8) -> Result<u8, ParportError> {
        let tl = ctx.tl();
        let (astrb, dstrb) = if address {
            (Active, DontCare)
        }
        else {
            (DontCare, Active)
        };

        if write {
            ctx.hw.write_data(value);
            ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, DontCare, Active);
        }
        else {
            ctx.hw.update_dcr(DIR_READ, DontCare, DontCare, DontCare, DontCare, Inactive);
        }
        ctx.hw.update_dcr(DontCare, DontCare, astrb, DontCare, dstrb, DontCare);

        // nWait high: the peripheral has taken or presented the byte.
        if !ctx.hw.check_dsr(DsrPattern::new(Active, DontCare, DontCare, DontCare, DontCare), tl) {
            ctx.hw.update_dcr(DIR_WRITE, DontCare, Inactive, DontCare, Inactive, Inactive);
            return Err(ParportError::HandshakeTimeout(0));
        }
        let byte = if write { value } else { ctx.hw.read_data() };

        let release = if address { (Inactive, DontCare) } else { (DontCare, Inactive) };
        ctx.hw.update_dcr(DontCare, DontCare, release.0, DontCare, release.1, DontCare);

        // nWait low: ready for the next cycle.
        let ok = ctx
            .hw
            .check_dsr(DsrPattern::new(Inactive, DontCare, DontCare, DontCare, DontCare), tl);
        ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, DontCare, Inactive);
        if ok {
            Ok(byte)
        }
        else {
            Err(ParportError::HandshakeTimeout(0))
        }
    }
}

impl ModeDriver for EppSw {
    fn name(&self) -> &'static str {
        "EPP (software)"
    }

    fn protocol(&self) -> ProtocolModes {
        ProtocolModes::EPP_SW
    }

    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Epp
    }

    fn is_supported(&self, ctx: &mut ModeContext) -> bool {
        ctx.probe_mode(self, true)
    }

    fn connect(&self, ctx: &mut ModeContext, _device_id_request: bool) -> Result<(), ParportError> {
        epp_connect(ctx)
    }

    fn disconnect(&self, ctx: &mut ModeContext) {
        epp_disconnect(ctx)
    }

    fn set_interface_address(&self, ctx: &mut ModeContext, address: u8) -> Result<(), ParportError> {
        if address > MAX_CHANNEL {
            return Err(ParportError::AddressProgramming(address));
        }
        self.cycle(ctx, true, true, address)
            .map(|_| ())
            .map_err(|_| ParportError::AddressProgramming(address))
    }

    fn have_read_data(&self, ctx: &mut ModeContext) -> bool {
        ctx.hw.read_dsr() & DSR_NOT_FAULT == 0
    }

    fn read(&self, ctx: &mut ModeContext, buf: &mut [u8]) -> TransferResult {
        ctx.set_phase(Phase::ReverseXfer);
        for i in 0..buf.len() {
            match self.cycle(ctx, false, false, 0) {
                Ok(byte) => buf[i] = byte,
                Err(e) => {
                    ctx.fail_to(Phase::Unknown);
                    return Err(TransferError::new(e, i));
                }
            }
        }
        ctx.set_phase(Phase::ReverseIdle);
        Ok(buf.len())
    }

    fn write(&self, ctx: &mut ModeContext, buf: &[u8]) -> TransferResult {
        ctx.set_phase(Phase::ForwardXfer);
        for (i, byte) in buf.iter().enumerate() {
            if let Err(e) = self.cycle(ctx, false, true, *byte) {
                ctx.fail_to(Phase::Unknown);
                return Err(TransferError::new(e, i));
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

    fn run<F: FnOnce(&mut ModeContext, &SimulatedPort)>(config: DriverConfig, f: F) {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
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
    fn epp_software_writes_data_and_addresses() {
        run(DriverConfig::default(), |ctx, sim| {
            EppSw.connect(ctx, false).unwrap();
            EppSw.set_interface_address(ctx, 5).unwrap();
            assert_eq!(EppSw.write(ctx, &[1, 2, 3]).unwrap(), 3);
            assert_eq!(sim.end_of_chain_received(), vec![1, 2, 3]);
            assert_eq!(sim.end_of_chain_addresses(), vec![5]);

            sim.with_end_of_chain(|p| p.reverse_data.extend([9, 8]));
            let mut buf = [0u8; 2];
            assert_eq!(EppSw.read(ctx, &mut buf).unwrap(), 2);
            assert_eq!(buf, [9, 8]);

            EppSw.disconnect(ctx);
            assert!(sim.end_of_chain_in_compatibility());
        });
    }

    #[test]
    fn epp_hardware_uses_32_bit_path_for_aligned_buffers() {
        let mut config = DriverConfig::default();
        config.port.epp_32bit = true;
        run(config, |ctx, sim| {
            EppHw.connect(ctx, false).unwrap();
            let data: Vec<u8> = (0..8).collect();
            assert_eq!(EppHw.write(ctx, &data).unwrap(), 8);
            assert_eq!(sim.end_of_chain_received(), data);
            assert_eq!(sim.wide_transfers(), 2);

            assert_eq!(EppHw.write(ctx, &[0xAA, 0xBB, 0xCC]).unwrap(), 3);
            assert_eq!(sim.wide_transfers(), 2);
        });
    }

    #[test]
    fn epp_hardware_timeout_fails_the_link_and_clears() {
        run(DriverConfig::default(), |ctx, sim| {
            EppHw.connect(ctx, false).unwrap();
            assert!(ctx.state.connected);

            sim.stall_epp_cycles(true);
            let err = EppHw.write(ctx, &[1, 2, 3]).unwrap_err();
            assert!(matches!(err.error, ParportError::HandshakeTimeout(_)));
            assert_eq!(err.transferred, 0);
            assert_eq!(ctx.state.phase, Phase::Unknown);
            assert!(!ctx.state.connected);
            assert_eq!(ctx.hw.read_dsr() & DSR_EPP_TIMEOUT, 0);
            assert!(sim.end_of_chain_received().is_empty());
        });
    }

    #[test]
    fn epp_hardware_read_timeout_fails_the_link() {
        run(DriverConfig::default(), |ctx, sim| {
            EppHw.connect(ctx, false).unwrap();
            sim.stall_epp_cycles(true);
            let mut buf = [0u8; 2];
            assert!(EppHw.read(ctx, &mut buf).is_err());
            assert_eq!(ctx.state.phase, Phase::Unknown);
            assert!(!ctx.state.connected);
            assert_eq!(ctx.hw.read_dsr() & DSR_EPP_TIMEOUT, 0);
        });
    }

    #[test]
    fn epp_address_out_of_range_is_rejected() {
        run(DriverConfig::default(), |ctx, _sim| {
            EppHw.connect(ctx, false).unwrap();
            assert!(matches!(
                EppHw.set_interface_address(ctx, 200),
                Err(ParportError::AddressProgramming(200))
            ));
        });
    }
}
