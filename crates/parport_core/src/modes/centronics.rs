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

    modes::centronics.rs

    Compatibility mode forward writes. Plain Centronics strobes each byte with
    a delay calibrated against the printer's BUSY response; the IEEE 1284
    compatibility variant waits for BUSY to clear after every byte instead.

*/

use crate::{
    error::{ParportError, TransferError, TransferResult},
    ieee::{self, Phase},
    modes::{extensibility, ModeContext, ModeDriver, ProtocolFamily, ProtocolModes},
    registers::*,
    status::{self, PrinterCondition},
};

#[derive(Copy, Clone, Debug)]
pub struct Centronics {
    pub ieee: bool,
}

impl Centronics {
    /// Wait for the printer to come ready. Busy is waited out up to the ready timeout;
    /// any other condition is returned at once.
    fn wait_ready(&self, ctx: &mut ModeContext) -> Result<(), PrinterCondition> {
        let deadline = ctx.hw.now() + ctx.config.timing.spp_ready_timeout();
        loop {
            let dsr = ctx.hw.read_dsr();
            if status::printer_online(dsr) {
                return Ok(());
            }
            let condition = status::classify(dsr);
            if condition != PrinterCondition::Busy || ctx.hw.now() >= deadline {
                return Err(condition);
            }
            ctx.hw.stall_us(1);
        }
    }

    fn strobe(&self, ctx: &mut ModeContext, byte: u8) {
        ctx.hw.write_data(byte);
        ctx.hw.stall_us(1);
        let dcr = ctx.hw.read_dcr();
        ctx.hw.write_dcr(dcr | DCR_STROBE);
        ctx.hw.stall_us(1);
        ctx.hw.write_dcr(dcr & !DCR_STROBE);
    }

    /// Measure how long the printer takes to raise BUSY after a strobe. Called right
    /// after the first strobe on a channel.
    fn calibrate(&self, ctx: &mut ModeContext) -> u64 {
        let limit = ctx.config.timing.spp_busy_probe_us;
        let start = ctx.hw.now();
        loop {
            let elapsed = (ctx.hw.now() - start).as_micros() as u64;
            if ctx.hw.read_dsr() & DSR_NOT_BUSY == 0 {
                let delay = elapsed.max(1);
                log::debug!("Centronics busy delay calibrated to {}us", delay);
                return delay;
            }
            if elapsed >= limit {
                break;
            }
            ctx.hw.stall_us(1);
        }
        let fallback = ctx.config.timing.spp_busy_fallback_us;
        log::debug!("Centronics busy never asserted; using fallback delay of {}us", fallback);
        fallback
    }
}

impl ModeDriver for Centronics {
    fn name(&self) -> &'static str {
        if self.ieee {
            "IEEE compatibility"
        }
        else {
            "Centronics"
        }
    }

    fn protocol(&self) -> ProtocolModes {
        if self.ieee {
            ProtocolModes::IEEE_COMPATIBILITY
        }
        else {
            ProtocolModes::empty()
        }
    }

    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::None
    }

    /// Centronics always works. The IEEE variant needs a peripheral that answers a
    /// nibble negotiation, which proves it implements the 1284 compatibility timing.
    fn is_supported(&self, ctx: &mut ModeContext) -> bool {
        if !self.ieee {
            return true;
        }
        if ctx.state.bad_modes.intersects(ProtocolModes::IEEE_COMPATIBILITY) {
            return false;
        }
        if ctx.state.modes_supported.contains(ProtocolModes::IEEE_COMPATIBILITY) || !ctx.safe() {
            return true;
        }
        let saved = (ctx.state.phase, ctx.state.connected);
        let result = ieee::negotiate(ctx, extensibility::NIBBLE);
        if result.is_ok() {
            _ = ieee::terminate(ctx);
        }
        ctx.state.phase = saved.0;
        ctx.state.connected = saved.1;
        result.is_ok()
    }

    fn connect(&self, ctx: &mut ModeContext, _device_id_request: bool) -> Result<(), ParportError> {
        ctx.state.connected = true;
        ctx.set_phase(Phase::ForwardIdle);
        Ok(())
    }

    fn disconnect(&self, ctx: &mut ModeContext) {
        ctx.state.connected = false;
        ctx.set_phase(Phase::Terminate);
    }

    fn write(&self, ctx: &mut ModeContext, buf: &[u8]) -> TransferResult {
        ctx.set_phase(Phase::ForwardXfer);

        for (i, byte) in buf.iter().enumerate() {
            if let Err(condition) = self.wait_ready(ctx) {
                ctx.set_phase(Phase::ForwardIdle);
                log::trace!("{}: printer {} after {} bytes", self.name(), condition, i);
                return Err(TransferError::new(ParportError::Printer(condition), i));
            }

            self.strobe(ctx, *byte);

            if self.ieee {
                // BUSY must fall again within TL; a slow printer is caught by the next
                // ready wait.
                let tl = ctx.tl();
                _ = ctx
                    .hw
                    .check_dsr(DsrPattern::new(Inactive, DontCare, DontCare, DontCare, DontCare), tl);
            }
            else {
                match ctx.state.spp_busy_delay_us {
                    Some(delay) => ctx.hw.stall_us(delay),
                    None => {
                        let delay = self.calibrate(ctx);
                        ctx.state.spp_busy_delay_us = Some(delay);
                    }
                }
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

    fn setup() -> (SimulatedPort, SignalIo, ChannelState, DriverConfig) {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        let config = DriverConfig::default();
        let hw = SignalIo::new(Box::new(sim.clone()), Arc::new(clock), &config);
        let state = ChannelState::new(&config);
        (sim, hw, state, config)
    }

    #[test]
    fn spp_write_calibrates_busy_delay_once() {
        let (sim, mut hw, mut state, config) = setup();
        sim.with_end_of_chain(|p| {
            p.printer.busy_latency_us = Some(3);
            p.printer.busy_duration_us = 4;
        });
        let mut ctx = ModeContext {
            hw:     &mut hw,
            state:  &mut state,
            config: &config,
        };

        let driver = Centronics { ieee: false };
        driver.connect(&mut ctx, false).unwrap();
        assert_eq!(driver.write(&mut ctx, b"Hello").unwrap(), 5);

        let delay = ctx.state.spp_busy_delay_us.unwrap();
        assert!(delay >= 1 && delay <= config.timing.spp_busy_probe_us);
        assert_eq!(sim.end_of_chain_received(), b"Hello".to_vec());
        assert_eq!(ctx.state.phase, Phase::ForwardIdle);
    }

    #[test]
    fn spp_calibration_falls_back_when_busy_never_asserts() {
        let (sim, mut hw, mut state, config) = setup();
        sim.with_end_of_chain(|p| p.printer.busy_latency_us = None);
        let mut ctx = ModeContext {
            hw:     &mut hw,
            state:  &mut state,
            config: &config,
        };

        let driver = Centronics { ieee: false };
        driver.write(&mut ctx, &[1, 2, 3]).unwrap();
        assert_eq!(ctx.state.spp_busy_delay_us, Some(config.timing.spp_busy_fallback_us));
    }

    #[test]
    fn spp_write_stops_on_paper_out() {
        let (sim, mut hw, mut state, config) = setup();
        sim.with_end_of_chain(|p| p.printer.fail_after(5, PrinterCondition::PaperEmpty));
        let mut ctx = ModeContext {
            hw:     &mut hw,
            state:  &mut state,
            config: &config,
        };

        let err = Centronics { ieee: true }.write(&mut ctx, &[0xAA; 16]).unwrap_err();
        assert!(matches!(err.error, ParportError::Printer(PrinterCondition::PaperEmpty)));
        assert_eq!(err.transferred, 5);
        assert_eq!(sim.end_of_chain_received().len(), 5);
    }
}
