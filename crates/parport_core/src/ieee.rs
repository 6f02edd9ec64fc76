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

    ieee.rs

    IEEE 1284 negotiation and termination. Negotiation moves a
    compatibility-mode peripheral into an extended mode by presenting an
    extensibility byte and walking events 0 through 6. Termination walks events
    22 through 28 to return the link to compatibility mode.

*/

use crate::{
    error::ParportError,
    modes::{extensibility, ModeContext, ProtocolModes},
    registers::*,
};

/// Where a channel is in the IEEE 1284 state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::EnumIter)]
pub enum Phase {
    Unknown,
    Negotiation,
    Setup,
    ForwardIdle,
    ForwardXfer,
    FwdToRev,
    ReverseIdle,
    ReverseXfer,
    RevToFwd,
    Terminate,
}

impl Phase {
    pub fn is_forward(&self) -> bool {
        matches!(self, Phase::ForwardIdle | Phase::ForwardXfer)
    }

    pub fn is_reverse(&self) -> bool {
        matches!(self, Phase::ReverseIdle | Phase::ReverseXfer)
    }

    /// Phases in which a link is considered connected.
    pub fn is_connected(&self) -> bool {
        self.is_forward() || self.is_reverse()
    }

    /// Phases from which termination has nothing to undo.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Phase::Terminate | Phase::Unknown)
    }
}

/// Phase a successfully negotiated mode starts in.
fn idle_phase(ext: u8) -> Phase {
    match ext & !extensibility::DEVICE_ID_REQ {
        extensibility::NIBBLE | extensibility::BYTE | extensibility::CHANNELIZED => Phase::ReverseIdle,
        _ => Phase::ForwardIdle,
    }
}

fn abort_negotiation(ctx: &mut ModeContext) {
    ctx.hw.write_dcr(DCR_NEUTRAL);
    ctx.fail_to(Phase::Unknown);
}

/// Negotiate from compatibility mode into the mode named by `ext`.
///
/// On success the channel is connected and in the idle phase of the new mode's
/// natural direction, and the protocols implied by the peripheral's acceptance are
/// returned. On any failure the channel is left disconnected in `Phase::Unknown`.
pub fn negotiate(ctx: &mut ModeContext, ext: u8) -> Result<ProtocolModes, ParportError> {
    let tl = ctx.tl();
    ctx.set_phase(Phase::Negotiation);

    // Event 0: extensibility request on the data lines.
    ctx.set_event(0);
    ctx.hw.write_data(ext);
    ctx.hw.stall_us(1);

    // Event 1: 1284 Active high, HostBusy low.
    ctx.set_event(1);
    ctx.hw.update_dcr(DIR_WRITE, DontCare, Inactive, Active, Active, Inactive);

    // Event 2: a 1284 peripheral drops PtrClk and raises PError, Select and nFault.
    ctx.set_event(2);
    if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Inactive, Active, Active, Active), tl) {
        log::trace!("negotiate({:#04X}): no response at event 2", ext);
        abort_negotiation(ctx);
        return Err(ParportError::NegotiationFailed(ext));
    }

    // Event 3: latch the extensibility byte.
    ctx.set_event(3);
    ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, DontCare, Active);
    ctx.hw.stall_us(1);

    // Event 4: release strobe and HostBusy.
    ctx.set_event(4);
    ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Inactive, Inactive);

    // Event 6: PtrClk returns high with XFlag answering the request.
    ctx.set_event(6);
    if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Active, DontCare, DontCare, DontCare), tl) {
        log::trace!("negotiate({:#04X}): no response at event 6", ext);
        abort_negotiation(ctx);
        return Err(ParportError::HandshakeTimeout(6));
    }

    let xflag = ctx.hw.read_dsr() & DSR_SELECT != 0;
    ctx.state.negotiated_xflag = xflag;

    // Nibble is the only mode accepted with XFlag low.
    let accepted = if ext & !extensibility::DEVICE_ID_REQ == extensibility::NIBBLE {
        !xflag
    }
    else {
        xflag
    };

    if !accepted {
        log::debug!("negotiate({:#04X}): peripheral refused mode", ext);
        // The peripheral is still in an extended-mode handshake and must be walked back.
        ctx.state.connected = true;
        ctx.set_phase(idle_phase(ext));
        _ = terminate(ctx);
        ctx.fail_to(Phase::Unknown);
        return Err(ParportError::ModeRefused(ext));
    }

    let modes = ProtocolModes::from_extensibility(ext);
    ctx.state.peripheral_modes |= modes;
    ctx.state.connected = true;
    ctx.set_phase(idle_phase(ext));
    log::trace!("negotiate({:#04X}): accepted, peripheral modes {:?}", ext, modes);
    Ok(modes)
}

/// Return the peripheral to compatibility mode. A channel already in
/// `Phase::Terminate` or `Phase::Unknown` is left untouched.
///
/// The link always ends disconnected in `Phase::Terminate`; a handshake failure is
/// still reported so callers can log it.
pub fn terminate(ctx: &mut ModeContext) -> Result<(), ParportError> {
    if ctx.state.phase.is_terminated() {
        return Ok(());
    }
    let tl = ctx.tl();
    let mut result = Ok(());

    // Event 22: 1284 Active low, HostBusy high.
    ctx.set_event(22);
    ctx.hw.update_dcr(DIR_WRITE, DontCare, Active, Active, Inactive, Inactive);
    if ctx.config.channel.event22_delay_us > 0 {
        ctx.hw.stall_us(ctx.config.channel.event22_delay_us);
    }

    // Event 24: PtrClk low and XFlag toggled, unless this peripheral is known not to
    // toggle it.
    ctx.set_event(24);
    let xflag = if ctx.state.ignore_xflag {
        DontCare
    }
    else if ctx.state.negotiated_xflag {
        Inactive
    }
    else {
        Active
    };
    if ctx.hw.check_dsr(DsrPattern::new(DontCare, Inactive, DontCare, xflag, DontCare), tl) {
        // Event 25: HostBusy low.
        ctx.set_event(25);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Active, DontCare);

        // Event 27: PtrClk high.
        ctx.set_event(27);
        if !ctx.hw.check_dsr(DsrPattern::new(DontCare, Active, DontCare, DontCare, DontCare), tl) {
            result = Err(ParportError::HandshakeTimeout(27));
        }

        // Event 28: HostBusy high, back in compatibility mode.
        ctx.set_event(28);
        ctx.hw.update_dcr(DontCare, DontCare, DontCare, DontCare, Inactive, DontCare);
    }
    else {
        log::warn!("terminate: no response at event 24");
        ctx.hw.write_dcr(DCR_NEUTRAL);
        result = Err(ParportError::HandshakeTimeout(24));
    }

    ctx.state.connected = false;
    ctx.set_phase(Phase::Terminate);
    result
}
