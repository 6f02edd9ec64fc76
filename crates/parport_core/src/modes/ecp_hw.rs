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

    modes::ecp_hw.rs

    ECP through the port's FIFO. The chipset clocks bytes with the 1284
    handshake itself; the driver keeps the FIFO fed or drained and walks the
    direction-change events in software. Bounded ECP uses the same machinery
    but only holds the reverse channel while the peripheral is requesting.

*/

use crate::{
    error::{ParportError, TransferError, TransferResult},
    ieee::{self, Phase},
    modes::{
        ecp::{ecp_connect, enter_reverse_events, exit_reverse_events},
        extensibility,
        ModeContext,
        ModeDriver,
        ProtocolFamily,
        ProtocolModes,
        MAX_CHANNEL,
    },
    port_io::FifoState,
    registers::*,
    status::PrinterCondition,
};

/// Poll the ECR until the FIFO leaves `state`, or until `timeout` passes.
fn wait_fifo_not(ctx: &mut ModeContext, state: FifoState, timeout: std::time::Duration) -> bool {
    let deadline = ctx.hw.now() + timeout;
    loop {
        if ctx.hw.fifo_state() != state {
            return true;
        }
        if ctx.hw.now() >= deadline {
            return false;
        }
        ctx.hw.stall_us(1);
    }
}

fn wait_fifo_empty(ctx: &mut ModeContext, timeout: std::time::Duration) -> bool {
    let deadline = ctx.hw.now() + timeout;
    loop {
        if ctx.hw.fifo_state() == FifoState::Empty {
            return true;
        }
        if ctx.hw.now() >= deadline {
            return false;
        }
        ctx.hw.stall_us(1);
    }
}

/// With synchronous writes, wait for the FIFO to empty and the peripheral to go idle.
fn wait_forward_idle(ctx: &mut ModeContext) -> bool {
    if !ctx.state.synch_writes {
        return true;
    }
    let tl = ctx.tl();
    wait_fifo_empty(ctx, tl) && ctx.hw.check_dsr(DsrPattern::new(Inactive, Active, Active, Active, DontCare), tl)
}

/// Try to shake the link loose after a failed handshake. The port is walked back to
/// compatibility mode, a recovery code is pulsed on the data lines, and the status
/// register is read to name what went wrong.
pub(crate) fn recover_port(ctx: &mut ModeContext, code: u8) -> ParportError {
    if ctx.hw.read_dcr() & DCR_NOT_INIT == 0 {
        // Someone else is driving the port.
        return ParportError::ProtocolError;
    }

    _ = ieee::terminate(ctx);
    ctx.hw.write_ecr_mode(EcrMode::Byte);
    ctx.hw.update_dcr(DIR_WRITE, DontCare, Active, Active, Active, Active);
    ctx.hw.write_data(code);
    ctx.hw.stall_us(100);
    ctx.hw.write_data(0);
    ctx.hw.write_dcr(DCR_NEUTRAL);

    let dsr = ctx.hw.read_dsr() | 0x07;
    ctx.fail_to(Phase::Unknown);
    match dsr {
        0x87 | 0x4F => {
            log::error!("ECP recovery: peripheral powered off (DSR {:02X})", dsr);
            ParportError::Printer(PrinterCondition::PoweredOff)
        }
        0x7F => {
            log::error!("ECP recovery: peripheral not connected");
            ParportError::Printer(PrinterCondition::NotConnected)
        }
        _ => {
            log::warn!("ECP recovery code {:02X}: DSR {:02X}", code, dsr);
            ParportError::LinkFailed
        }
    }
}

/// Host recovery, events 71 through 75: force the peripheral through a reverse
/// request and back so a stuck forward transfer is abandoned.
fn host_recovery(ctx: &mut ModeContext) -> Result<(), ParportError> {
    if !ctx.config.port.host_recovery {
        return Ok(());
    }
    let tl = ctx.tl();

    ctx.hw.write_ecr_mode(EcrMode::Byte);
    ctx.hw.update_dcr(DIR_READ, DontCare, DontCare, DontCare, DontCare, DontCare);

    let result = (|| {
        if ctx.hw.read_dcr() & DCR_NOT_INIT == 0 {
            return Err(ParportError::ProtocolError);
        }
        if !ctx.hw.test_dsr(DsrPattern::new(DontCare, Active, Active, Active, DontCare)) {
            return Err(ParportError::LinkFailed);
        }

        // Event 72: nReverseRequest low.
        ctx.set_event(72);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, Inactive, DontCare, DontCare);

        // Event 73: nAckReverse low.
        ctx.set_event(73);
        if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Active, Inactive, Active, DontCare), tl) {
            return Err(ParportError::HandshakeTimeout(73));
        }

        // Event 74: nReverseRequest high, HostAck and HostClk high.
        ctx.set_event(74);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, Active, Active, Active);

        // Event 75: nAckReverse high.
        ctx.set_event(75);
        if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Active, Active, Active, DontCare), tl) {
            return Err(ParportError::HandshakeTimeout(75));
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, DontCare, DontCare);
            ctx.hw.write_ecr_mode(EcrMode::Ecp);
            ctx.set_phase(Phase::ForwardIdle);
            Ok(())
        }
        Err(e) => {
            log::warn!("ECP host recovery failed: {}", e);
            ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, Active, Active);
            Err(e)
        }
    }
}

/// Shared FIFO machinery for [EcpHw] and [Becp].
struct FifoEngine;

impl FifoEngine {
    fn is_supported<D: ModeDriver>(driver: &D, ctx: &mut ModeContext) -> bool {
        let hardware_ok = ctx.hw.caps().ecp && ctx.hw.caps().fifo_width > 0;
        if hardware_ok
            && ctx.state.modes_supported.contains(ProtocolModes::ECP_SW)
            && !ctx.state.bad_modes.intersects(driver.protocol())
        {
            return true;
        }
        ctx.probe_mode(driver, hardware_ok)
    }

    fn connect(ctx: &mut ModeContext, ext: u8, device_id_request: bool) -> Result<(), ParportError> {
        ecp_connect(ctx, ext, device_id_request)?;
        ctx.hw.write_ecr_mode(EcrMode::Ecp);
        ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, Active, Active);
        ctx.state.synch_writes = ctx.config.channel.synch_writes;
        ctx.state.shadow.clear();
        Ok(())
    }

    fn disconnect<D: ModeDriver>(driver: &D, ctx: &mut ModeContext) {
        if ctx.state.phase.is_reverse() {
            if let Err(e) = driver.exit_reverse(ctx) {
                log::debug!("{}: exit reverse during disconnect: {}", driver.name(), e);
            }
        }

        let timeout = ctx.config.timing.receive_timeout();
        if !wait_fifo_empty(ctx, timeout) {
            log::warn!("{}: FIFO still holds data at termination", driver.name());
        }
        ctx.hw.write_ecr_mode(EcrMode::Spp);

        if ctx.safe() {
            if let Err(e) = ieee::terminate(ctx) {
                log::debug!("{}: termination: {}", driver.name(), e);
            }
        }
        else {
            ctx.state.connected = false;
            ctx.set_phase(Phase::Terminate);
        }
    }

    fn set_address(ctx: &mut ModeContext, address: u8) -> Result<(), ParportError> {
        if address > MAX_CHANNEL {
            return Err(ParportError::AddressProgramming(address));
        }
        ctx.set_phase(Phase::ForwardXfer);

        let tl = ctx.tl();
        if !wait_fifo_empty(ctx, tl) {
            log::warn!("ECP: FIFO not empty before address cycle");
            _ = host_recovery(ctx);
            ctx.set_phase(Phase::ForwardIdle);
            return Err(ParportError::AddressProgramming(address));
        }

        // In ECP mode a write to the data register goes to the address FIFO.
        ctx.hw.write_data(0x80 | address);

        let ok = wait_forward_idle(ctx);
        ctx.set_phase(Phase::ForwardIdle);
        if ok {
            Ok(())
        }
        else {
            Err(ParportError::AddressProgramming(address))
        }
    }

    fn enter_reverse(ctx: &mut ModeContext) -> Result<(), ParportError> {
        ctx.hw.write_ecr_mode(EcrMode::Byte);

        if ctx.safe() {
            if let Err(e) = enter_reverse_events(ctx) {
                if ctx.state.phase == Phase::ForwardIdle {
                    // Refused before anything moved.
                    ctx.hw.write_ecr_mode(EcrMode::Ecp);
                    return Err(e);
                }
                log::debug!("ECP: reverse entry failed: {}", e);
                return Err(recover_port(ctx, 0x28));
            }
        }
        else {
            ctx.hw.update_dcr(DIR_READ, DontCare, DontCare, Inactive, Inactive, DontCare);
        }

        ctx.hw.write_ecr_mode(EcrMode::Ecp);
        ctx.hw.update_dcr(DIR_READ, DontCare, DontCare, DontCare, Active, Active);
        ctx.set_phase(Phase::ReverseIdle);
        Ok(())
    }

    fn exit_reverse(ctx: &mut ModeContext) -> Result<(), ParportError> {
        if let Err(e) = exit_reverse_events(ctx) {
            log::debug!("ECP: reverse exit failed: {}", e);
            return Err(recover_port(ctx, 0x37));
        }

        // Whatever the chipset prefetched belongs to the next read.
        while ctx.hw.fifo_state() != FifoState::Empty {
            let byte = ctx.hw.read(Register::EcpFifo);
            if ctx.state.shadow.push(byte).is_err() {
                log::error!("ECP: shadow buffer overflow while draining FIFO");
                return Err(ParportError::BufferOverflow);
            }
        }

        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Active, Active);
        ctx.hw.write_ecr_mode(EcrMode::Byte);
        ctx.hw.update_dcr(DIR_WRITE, DontCare, DontCare, DontCare, DontCare, DontCare);
        ctx.hw.write_ecr_mode(EcrMode::Ecp);
        ctx.set_phase(Phase::ForwardIdle);
        Ok(())
    }

    fn read(ctx: &mut ModeContext, buf: &mut [u8]) -> TransferResult {
        if !ctx.state.phase.is_reverse() {
            return Err(ParportError::InvalidPhase(ctx.state.phase).into());
        }
        ctx.set_phase(Phase::ReverseXfer);

        let mut count = ctx.state.shadow.pop_slice(buf);
        let depth = ctx.hw.caps().fifo_depth;
        let tl = ctx.tl();

        while count < buf.len() {
            match ctx.hw.fifo_state() {
                FifoState::Full => {
                    let n = depth.min(buf.len() - count);
                    ctx.hw.read_buffer(Register::EcpFifo, &mut buf[count..count + n]);
                    count += n;
                }
                FifoState::Some => {
                    buf[count] = ctx.hw.read(Register::EcpFifo);
                    count += 1;
                }
                FifoState::Empty => {
                    // nPeriphRequest high: nothing more is coming.
                    if ctx.hw.read_dsr() & DSR_NOT_FAULT != 0 {
                        break;
                    }
                    if !wait_fifo_not(ctx, FifoState::Empty, tl) {
                        break;
                    }
                }
            }
        }

        ctx.set_phase(Phase::ReverseIdle);
        if count == 0 && ctx.hw.read_dsr() & DSR_NOT_FAULT == 0 {
            log::debug!("ECP: peripheral requesting but no data arrived");
            return Err(TransferError::new(ParportError::HandshakeTimeout(43), 0));
        }
        Ok(count)
    }

    fn write(ctx: &mut ModeContext, buf: &[u8]) -> TransferResult {
        if !ctx.state.phase.is_forward() {
            return Err(ParportError::InvalidPhase(ctx.state.phase).into());
        }
        ctx.set_phase(Phase::ForwardXfer);

        let depth = ctx.hw.caps().fifo_depth;
        let tl = ctx.tl();
        let mut count = 0;

        while count < buf.len() {
            match ctx.hw.fifo_state() {
                FifoState::Empty => {
                    let n = depth.min(buf.len() - count);
                    ctx.hw.write_buffer(Register::EcpFifo, &buf[count..count + n]);
                    count += n;
                }
                FifoState::Some => {
                    ctx.hw.write(Register::EcpFifo, buf[count]);
                    count += 1;
                }
                FifoState::Full => {
                    if !wait_fifo_not(ctx, FifoState::Full, tl) {
                        log::debug!("ECP: FIFO stuck full after {} bytes", count);
                        ctx.set_phase(Phase::ForwardIdle);
                        return Err(TransferError::new(ParportError::HandshakeTimeout(35), count));
                    }
                }
            }
        }

        let idle = wait_forward_idle(ctx);
        ctx.set_phase(Phase::ForwardIdle);
        if idle {
            Ok(count)
        }
        else {
            Err(TransferError::new(ParportError::HandshakeTimeout(37), count))
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct EcpHw;

impl ModeDriver for EcpHw {
    fn name(&self) -> &'static str {
        "ECP (hardware)"
    }

    fn protocol(&self) -> ProtocolModes {
        ProtocolModes::ECP_HW_NOIRQ
    }

    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Ecp
    }

    fn is_supported(&self, ctx: &mut ModeContext) -> bool {
        FifoEngine::is_supported(self, ctx)
    }

    fn connect(&self, ctx: &mut ModeContext, device_id_request: bool) -> Result<(), ParportError> {
        FifoEngine::connect(ctx, extensibility::ECP, device_id_request)
    }

    fn disconnect(&self, ctx: &mut ModeContext) {
        FifoEngine::disconnect(self, ctx)
    }

    fn enter_reverse(&self, ctx: &mut ModeContext) -> Result<(), ParportError> {
        FifoEngine::enter_reverse(ctx)
    }

    fn exit_reverse(&self, ctx: &mut ModeContext) -> Result<(), ParportError> {
        FifoEngine::exit_reverse(ctx)
    }

    fn set_interface_address(&self, ctx: &mut ModeContext, address: u8) -> Result<(), ParportError> {
        FifoEngine::set_address(ctx, address)
    }

    fn have_read_data(&self, ctx: &mut ModeContext) -> bool {
        !ctx.state.shadow.is_empty() || ctx.hw.read_dsr() & DSR_NOT_FAULT == 0
    }

    fn read(&self, ctx: &mut ModeContext, buf: &mut [u8]) -> TransferResult {
        FifoEngine::read(ctx, buf)
    }

    fn write(&self, ctx: &mut ModeContext, buf: &[u8]) -> TransferResult {
        FifoEngine::write(ctx, buf)
    }
}

/// Bounded ECP. The reverse channel is entered on demand and left as soon as the
/// peripheral stops requesting, so the link rests in the forward direction.
#[derive(Copy, Clone, Debug)]
pub struct Becp;

impl ModeDriver for Becp {
    fn name(&self) -> &'static str {
        "Bounded ECP"
    }

    fn protocol(&self) -> ProtocolModes {
        ProtocolModes::BOUNDED_ECP
    }

    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Becp
    }

    fn is_supported(&self, ctx: &mut ModeContext) -> bool {
        let hardware_ok = ctx.hw.caps().ecp && ctx.hw.caps().fifo_width > 0;
        ctx.probe_mode(self, hardware_ok)
    }

    fn connect(&self, ctx: &mut ModeContext, device_id_request: bool) -> Result<(), ParportError> {
        FifoEngine::connect(ctx, extensibility::BECP, device_id_request)
    }

    fn disconnect(&self, ctx: &mut ModeContext) {
        FifoEngine::disconnect(self, ctx)
    }

    fn enter_reverse(&self, ctx: &mut ModeContext) -> Result<(), ParportError> {
        FifoEngine::enter_reverse(ctx)
    }

    fn exit_reverse(&self, ctx: &mut ModeContext) -> Result<(), ParportError> {
        FifoEngine::exit_reverse(ctx)
    }

    fn set_interface_address(&self, ctx: &mut ModeContext, address: u8) -> Result<(), ParportError> {
        FifoEngine::set_address(ctx, address)
    }

    fn have_read_data(&self, ctx: &mut ModeContext) -> bool {
        !ctx.state.shadow.is_empty() || ctx.hw.read_dsr() & DSR_NOT_FAULT == 0
    }

    fn read(&self, ctx: &mut ModeContext, buf: &mut [u8]) -> TransferResult {
        if ctx.state.phase.is_forward() {
            if !ctx.state.shadow.is_empty() {
                let n = ctx.state.shadow.pop_slice(buf);
                return Ok(n);
            }
            self.enter_reverse(ctx)?;
        }

        let result = FifoEngine::read(ctx, buf);

        if ctx.state.phase.is_reverse() && ctx.hw.read_dsr() & DSR_NOT_FAULT != 0 {
            if let Err(e) = self.exit_reverse(ctx) {
                return match result {
                    Ok(n) => Err(TransferError::new(e, n)),
                    Err(err) => Err(err),
                };
            }
        }
        result
    }

    fn write(&self, ctx: &mut ModeContext, buf: &[u8]) -> TransferResult {
        FifoEngine::write(ctx, buf)
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
    fn fifo_write_and_address() {
        run(DriverConfig::default(), |ctx, sim| {
            assert!(EcpHw.is_supported(ctx));
            EcpHw.connect(ctx, false).unwrap();
            EcpHw.set_interface_address(ctx, 3).unwrap();

            let data: Vec<u8> = (0..40).collect();
            assert_eq!(EcpHw.write(ctx, &data).unwrap(), 40);
            assert_eq!(sim.end_of_chain_received(), data);
            assert_eq!(sim.end_of_chain_channels(), vec![3]);

            EcpHw.disconnect(ctx);
            assert_eq!(ctx.state.phase, Phase::Terminate);
            assert!(sim.end_of_chain_in_compatibility());
        });
    }

    #[test]
    fn exit_reverse_keeps_prefetched_bytes() {
        run(DriverConfig::default(), |ctx, sim| {
            sim.with_end_of_chain(|p| p.reverse_data.extend(0u8..20));
            EcpHw.connect(ctx, false).unwrap();
            EcpHw.enter_reverse(ctx).unwrap();

            let mut buf = [0u8; 4];
            assert_eq!(EcpHw.read(ctx, &mut buf).unwrap(), 4);
            assert_eq!(buf, [0, 1, 2, 3]);

            EcpHw.exit_reverse(ctx).unwrap();
            assert_eq!(ctx.state.phase, Phase::ForwardIdle);
            assert!(!ctx.state.shadow.is_empty());
            assert!(EcpHw.have_read_data(ctx));

            EcpHw.enter_reverse(ctx).unwrap();
            let mut rest = [0u8; 32];
            let n = EcpHw.read(ctx, &mut rest).unwrap();
            assert_eq!(&rest[..n], &(4u8..20).collect::<Vec<_>>()[..]);
        });
    }

    #[test]
    fn stuck_fifo_reports_bytes_queued() {
        run(DriverConfig::default(), |ctx, sim| {
            sim.with_end_of_chain(|p| p.stall_forward = true);
            EcpHw.connect(ctx, false).unwrap();

            let err = EcpHw.write(ctx, &[0x11; 64]).unwrap_err();
            assert!(matches!(err.error, ParportError::HandshakeTimeout(35)));
            assert_eq!(err.transferred, 16);
        });
    }

    #[test]
    fn bounded_ecp_returns_to_forward_after_read() {
        run(DriverConfig::default(), |ctx, sim| {
            sim.with_end_of_chain(|p| p.reverse_data.extend([7, 7, 7]));
            Becp.connect(ctx, false).unwrap();
            assert!(Becp.have_read_data(ctx));

            let mut buf = [0u8; 8];
            assert_eq!(Becp.read(ctx, &mut buf).unwrap(), 3);
            assert_eq!(&buf[..3], &[7, 7, 7]);
            assert_eq!(ctx.state.phase, Phase::ForwardIdle);
        });
    }
}
