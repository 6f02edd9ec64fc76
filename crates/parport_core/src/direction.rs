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

    direction.rs

    Bus direction changes for a connected channel. Moving between forward and
    reverse either stays inside one negotiated mode, when the forward and
    reverse drivers share a protocol family, or tears the link down and
    connects the other driver.

*/

use crate::{
    error::ParportError,
    modes::{ModeContext, ModeDispatch, ModeDriver, ProtocolFamily},
};

/// Forward and reverse drivers can hand the link to each other without
/// renegotiating.
fn same_family(forward: &ModeDispatch, reverse: &ModeDispatch) -> bool {
    forward.family() != ProtocolFamily::None && forward.family() == reverse.family()
}

fn program_address(
    ctx: &mut ModeContext,
    driver: ModeDispatch,
    address: u8,
    pending: for<'a, 'b> fn(&'a mut ModeContext<'b>) -> &'a mut bool,
) -> Result<(), ParportError> {
    if !*pending(ctx) {
        return Ok(());
    }
    match driver.set_interface_address(ctx, address) {
        Ok(()) => {
            log::trace!("{}: interface address {} set", driver.name(), address);
            *pending(ctx) = false;
            Ok(())
        }
        Err(ParportError::NotSupported(_)) => {
            *pending(ctx) = false;
            Ok(())
        }
        Err(e) => {
            log::debug!("{}: interface address {} failed: {}", driver.name(), address, e);
            Err(e)
        }
    }
}

/// Write the pending forward channel address, if any. The pending flag is cleared
/// only once the write succeeds.
pub fn program_forward_address(ctx: &mut ModeContext) -> Result<(), ParportError> {
    let driver = ctx.state.forward_mode();
    let address = ctx.state.forward_address;
    program_address(ctx, driver, address, |ctx| &mut ctx.state.set_forward_address)
}

pub fn program_reverse_address(ctx: &mut ModeContext) -> Result<(), ParportError> {
    let driver = ctx.state.reverse_mode();
    let address = ctx.state.reverse_address;
    program_address(ctx, driver, address, |ctx| &mut ctx.state.set_reverse_address)
}

/// Make the link ready for a reverse transfer.
pub fn forward_to_reverse(ctx: &mut ModeContext) -> Result<(), ParportError> {
    if ctx.state.connected && ctx.state.phase.is_reverse() {
        return Ok(());
    }
    let forward = ctx.state.forward_mode();
    let reverse = ctx.state.reverse_mode();

    if ctx.state.connected && ctx.state.phase.is_forward() {
        if same_family(&forward, &reverse) {
            forward.exit_forward(ctx)?;
        }
        else {
            log::trace!("{} -> {}: family change, disconnecting", forward.name(), reverse.name());
            forward.disconnect(ctx);
        }
    }

    if !ctx.state.connected {
        reverse.connect(ctx, false)?;
        ctx.state.set_reverse_address = ctx.state.reverse_address != 0;
    }

    program_reverse_address(ctx)?;

    if !ctx.state.phase.is_reverse() {
        reverse.enter_reverse(ctx)?;
    }
    Ok(())
}

/// Make the link ready for a forward transfer.
pub fn reverse_to_forward(ctx: &mut ModeContext) -> Result<(), ParportError> {
    if ctx.state.connected && ctx.state.phase.is_forward() {
        return Ok(());
    }
    let forward = ctx.state.forward_mode();
    let reverse = ctx.state.reverse_mode();

    if ctx.state.connected && ctx.state.phase.is_reverse() {
        if same_family(&forward, &reverse) {
            reverse.exit_reverse(ctx)?;
        }
        else {
            log::trace!("{} -> {}: family change, disconnecting", reverse.name(), forward.name());
            reverse.disconnect(ctx);
        }
    }

    if !ctx.state.connected {
        forward.connect(ctx, false)?;
        ctx.state.set_forward_address = ctx.state.forward_address != 0;
    }

    if !ctx.state.phase.is_forward() {
        forward.enter_forward(ctx)?;
    }

    program_forward_address(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelState,
        config::DriverConfig,
        ieee::Phase,
        modes::{forward_index, reverse_index, ProtocolModes},
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

    fn use_modes(ctx: &mut ModeContext, forward: ProtocolModes, reverse: ProtocolModes) {
        ctx.state.forward_idx = forward_index(forward).unwrap();
        ctx.state.reverse_idx = reverse_index(reverse).unwrap();
    }

    fn round_trip(forward: ProtocolModes, reverse: ProtocolModes) {
        run(DriverConfig::default(), |ctx, _sim| {
            use_modes(ctx, forward, reverse);
            let driver = ctx.state.forward_mode();
            driver.connect(ctx, false).unwrap();
            let start = ctx.state.phase;
            assert_eq!(start, Phase::ForwardIdle);

            forward_to_reverse(ctx).unwrap();
            assert!(ctx.state.phase.is_reverse());
            reverse_to_forward(ctx).unwrap();
            assert_eq!(ctx.state.phase, start);
            assert!(ctx.state.connected);
        });
    }

    #[test]
    fn ecp_round_trip_keeps_connection() {
        round_trip(ProtocolModes::ECP_HW_NOIRQ, ProtocolModes::ECP_HW_NOIRQ);
        round_trip(ProtocolModes::ECP_SW, ProtocolModes::ECP_SW);
    }

    #[test]
    fn epp_round_trip_keeps_connection() {
        round_trip(ProtocolModes::EPP_SW, ProtocolModes::EPP_SW);
    }

    #[test]
    fn family_change_renegotiates() {
        run(DriverConfig::default(), |ctx, sim| {
            use_modes(ctx, ProtocolModes::IEEE_COMPATIBILITY, ProtocolModes::NIBBLE);
            reverse_to_forward(ctx).unwrap();
            assert_eq!(ctx.state.phase, Phase::ForwardIdle);
            assert!(sim.end_of_chain_in_compatibility());

            forward_to_reverse(ctx).unwrap();
            assert_eq!(ctx.state.phase, Phase::ReverseIdle);
            assert!(!sim.end_of_chain_in_compatibility());

            reverse_to_forward(ctx).unwrap();
            assert_eq!(ctx.state.phase, Phase::ForwardIdle);
            assert!(sim.end_of_chain_in_compatibility());
        });
    }

    #[test]
    fn reverse_address_is_written_once() {
        let mut config = DriverConfig::default();
        config.channel.reverse_interface_address = 9;
        run(config, |ctx, sim| {
            use_modes(ctx, ProtocolModes::ECP_SW, ProtocolModes::ECP_SW);
            forward_to_reverse(ctx).unwrap();
            assert!(!ctx.state.set_reverse_address);
            reverse_to_forward(ctx).unwrap();
            forward_to_reverse(ctx).unwrap();
            assert_eq!(sim.end_of_chain_channels(), vec![9]);
        });
    }

    #[test]
    fn unaddressable_modes_clear_the_flag() {
        let mut config = DriverConfig::default();
        config.channel.forward_interface_address = 4;
        run(config, |ctx, _sim| {
            use_modes(ctx, ProtocolModes::IEEE_COMPATIBILITY, ProtocolModes::NIBBLE);
            reverse_to_forward(ctx).unwrap();
            assert!(!ctx.state.set_forward_address);
        });
    }
}
