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

    modes::mod.rs

    Transfer mode drivers. Each IEEE 1284 mode is a variant of ModeDispatch and
    implements the ModeDriver capability set. Channels select modes by index
    into the FORWARD_MODES and REVERSE_MODES tables, which are ordered best
    first.

*/

pub mod byte;
pub mod centronics;
pub mod ecp;
pub mod ecp_hw;
pub mod epp;
pub mod nibble;

use std::time::Duration;

use bitflags::bitflags;
use enum_dispatch::enum_dispatch;

use crate::{
    channel::ChannelState,
    config::{DriverConfig, ModeSafety},
    error::{ParportError, TransferResult},
    ieee::Phase,
    port_io::SignalIo,
};

pub use byte::Byte;
pub use centronics::Centronics;
pub use ecp::EcpSw;
pub use ecp_hw::{Becp, EcpHw};
pub use epp::{EppHw, EppSw};
pub use nibble::Nibble;

/// Highest ECP/EPP channel address.
pub const MAX_CHANNEL: u8 = 127;

bitflags! {
    /// IEEE 1284 protocols, as advertised by a peripheral or supported by a port.
    /// Centronics has no bit; it is always available.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ProtocolModes: u16 {
        const IEEE_COMPATIBILITY = 0x0001;
        const NIBBLE = 0x0002;
        const CHANNEL_NIBBLE = 0x0004;
        const BYTE_BIDIR = 0x0008;
        const EPP_HW = 0x0010;
        const EPP_SW = 0x0020;
        const EPP_ANY = Self::EPP_HW.bits() | Self::EPP_SW.bits();
        const BOUNDED_ECP = 0x0040;
        const ECP_HW_NOIRQ = 0x0080;
        const ECP_HW_IRQ = 0x0100;
        const ECP_SW = 0x0200;
        const ECP_ANY = Self::BOUNDED_ECP.bits() | Self::ECP_HW_NOIRQ.bits() | Self::ECP_HW_IRQ.bits() | Self::ECP_SW.bits();

        const FORWARD_DATALINK_SKIP = Self::EPP_ANY.bits() | Self::BOUNDED_ECP.bits() | Self::ECP_HW_NOIRQ.bits() | Self::ECP_HW_IRQ.bits();
        const REVERSE_DATALINK_SKIP = Self::CHANNEL_NIBBLE.bits() | Self::BYTE_BIDIR.bits() | Self::EPP_ANY.bits() | Self::ECP_ANY.bits();
    }
}

/// Extensibility request bytes placed on the data lines at negotiation event 0.
pub mod extensibility {
    pub const NIBBLE: u8 = 0x00;
    pub const BYTE: u8 = 0x01;
    pub const DEVICE_ID_REQ: u8 = 0x04;
    pub const CHANNELIZED: u8 = 0x08;
    pub const ECP: u8 = 0x10;
    pub const BECP: u8 = 0x18;
    pub const EPP: u8 = 0x40;
}

impl ProtocolModes {
    /// Protocols a peripheral implies support for by accepting `ext`.
    pub fn from_extensibility(ext: u8) -> ProtocolModes {
        match ext & !extensibility::DEVICE_ID_REQ {
            extensibility::NIBBLE => ProtocolModes::NIBBLE | ProtocolModes::IEEE_COMPATIBILITY,
            extensibility::BYTE => ProtocolModes::BYTE_BIDIR,
            extensibility::CHANNELIZED => ProtocolModes::CHANNEL_NIBBLE,
            extensibility::ECP => ProtocolModes::ECP_SW | ProtocolModes::ECP_HW_NOIRQ | ProtocolModes::ECP_HW_IRQ,
            extensibility::BECP => ProtocolModes::BOUNDED_ECP,
            extensibility::EPP => ProtocolModes::EPP_ANY,
            _ => ProtocolModes::empty(),
        }
    }
}

/// Modes sharing a family can change direction without a full renegotiation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ProtocolFamily {
    None,
    ReverseNibble,
    ReverseByte,
    Ecp,
    Epp,
    Becp,
}

/// Everything a mode driver may touch while it runs: the port registers, the owning
/// channel's state, and the shared configuration.
pub struct ModeContext<'a> {
    pub hw:     &'a mut SignalIo,
    pub state:  &'a mut ChannelState,
    pub config: &'a DriverConfig,
}

impl ModeContext<'_> {
    #[inline]
    pub fn safe(&self) -> bool {
        self.state.safety == ModeSafety::Safe
    }

    #[inline]
    pub fn set_phase(&mut self, phase: Phase) {
        self.state.set_phase(phase);
    }

    #[inline]
    pub fn set_event(&mut self, event: u8) {
        self.state.current_event = event;
    }

    #[inline]
    pub fn tl(&self) -> Duration {
        self.config.timing.tl()
    }

    /// Mark the channel disconnected after a handshake failure.
    pub fn fail_to(&mut self, phase: Phase) {
        self.state.connected = false;
        self.state.set_phase(phase);
    }

    /// Shared is-supported policy: bad modes never, known-good modes always, then
    /// the hardware check, then (SAFE mode only) a trial connect whose outcome is
    /// remembered.
    pub fn probe_mode<D: ModeDriver + ?Sized>(&mut self, driver: &D, hardware_ok: bool) -> bool {
        let protocol = driver.protocol();
        if self.state.bad_modes.intersects(protocol) {
            return false;
        }
        if self.state.modes_supported.contains(protocol) && !protocol.is_empty() {
            return true;
        }
        if !hardware_ok {
            return false;
        }
        if !self.safe() {
            return true;
        }

        match driver.connect(self, false) {
            Ok(()) => {
                driver.disconnect(self);
                self.state.modes_supported |= protocol;
                true
            }
            Err(e) => {
                log::debug!("{} is not supported by the peripheral: {}", driver.name(), e);
                false
            }
        }
    }
}

/// Capability set shared by every transfer mode. Operations a mode has no use for
/// keep the default, which is either a no-op or `NotSupported`.
#[enum_dispatch]
pub trait ModeDriver {
    fn name(&self) -> &'static str;
    fn protocol(&self) -> ProtocolModes;
    fn family(&self) -> ProtocolFamily;

    fn is_supported(&self, ctx: &mut ModeContext) -> bool;
    fn connect(&self, ctx: &mut ModeContext, device_id_request: bool) -> Result<(), ParportError>;
    fn disconnect(&self, ctx: &mut ModeContext);

    fn enter_forward(&self, ctx: &mut ModeContext) -> Result<(), ParportError> {
        ctx.set_phase(Phase::ForwardIdle);
        Ok(())
    }

    fn exit_forward(&self, _ctx: &mut ModeContext) -> Result<(), ParportError> {
        Ok(())
    }

    fn enter_reverse(&self, ctx: &mut ModeContext) -> Result<(), ParportError> {
        ctx.set_phase(Phase::ReverseIdle);
        Ok(())
    }

    fn exit_reverse(&self, _ctx: &mut ModeContext) -> Result<(), ParportError> {
        Ok(())
    }

    fn set_interface_address(&self, _ctx: &mut ModeContext, _address: u8) -> Result<(), ParportError> {
        Err(ParportError::NotSupported("interface addressing"))
    }

    fn have_read_data(&self, _ctx: &mut ModeContext) -> bool {
        false
    }

    fn read(&self, _ctx: &mut ModeContext, _buf: &mut [u8]) -> TransferResult {
        Err(ParportError::NotSupported("reverse transfer").into())
    }

    fn write(&self, _ctx: &mut ModeContext, _buf: &[u8]) -> TransferResult {
        Err(ParportError::NotSupported("forward transfer").into())
    }
}

#[enum_dispatch(ModeDriver)]
#[derive(Copy, Clone, Debug)]
pub enum ModeDispatch {
    Centronics(Centronics),
    Nibble(Nibble),
    Byte(Byte),
    EppSw(EppSw),
    EppHw(EppHw),
    EcpSw(EcpSw),
    EcpHw(EcpHw),
    Becp(Becp),
}

pub const FORWARD_MODES: [ModeDispatch; 7] = [
    ModeDispatch::Becp(Becp),
    ModeDispatch::EcpHw(EcpHw),
    ModeDispatch::EppHw(EppHw),
    ModeDispatch::EppSw(EppSw),
    ModeDispatch::EcpSw(EcpSw),
    ModeDispatch::Centronics(Centronics { ieee: true }),
    ModeDispatch::Centronics(Centronics { ieee: false }),
];

pub const REVERSE_MODES: [ModeDispatch; 8] = [
    ModeDispatch::Becp(Becp),
    ModeDispatch::EcpHw(EcpHw),
    ModeDispatch::EppHw(EppHw),
    ModeDispatch::EppSw(EppSw),
    ModeDispatch::EcpSw(EcpSw),
    ModeDispatch::Byte(Byte),
    ModeDispatch::Nibble(Nibble { channelized: false }),
    ModeDispatch::Nibble(Nibble { channelized: true }),
];

/// Index of the Centronics entry, the forward mode of last resort.
pub const FORWARD_DEFAULT: usize = FORWARD_MODES.len() - 1;
/// Index of the plain Nibble entry, the reverse mode of last resort.
pub const REVERSE_DEFAULT: usize = REVERSE_MODES.len() - 2;

/// Find the table index of the forward driver implementing `protocol`.
pub fn forward_index(protocol: ProtocolModes) -> Option<usize> {
    FORWARD_MODES.iter().position(|m| m.protocol() == protocol)
}

pub fn reverse_index(protocol: ProtocolModes) -> Option<usize> {
    REVERSE_MODES.iter().position(|m| m.protocol() == protocol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_ordered_best_first() {
        assert_eq!(FORWARD_MODES[0].protocol(), ProtocolModes::BOUNDED_ECP);
        assert_eq!(FORWARD_MODES[FORWARD_DEFAULT].protocol(), ProtocolModes::empty());
        assert_eq!(REVERSE_MODES[REVERSE_DEFAULT].protocol(), ProtocolModes::NIBBLE);
        assert_eq!(forward_index(ProtocolModes::ECP_HW_NOIRQ), Some(1));
        assert_eq!(reverse_index(ProtocolModes::BYTE_BIDIR), Some(5));
    }

    #[test]
    fn extensibility_maps_to_protocols() {
        assert!(ProtocolModes::from_extensibility(extensibility::ECP).contains(ProtocolModes::ECP_SW));
        assert_eq!(
            ProtocolModes::from_extensibility(extensibility::NIBBLE | extensibility::DEVICE_ID_REQ),
            ProtocolModes::NIBBLE | ProtocolModes::IEEE_COMPATIBILITY
        );
        assert_eq!(ProtocolModes::ECP_ANY.bits(), 0x03C0);
        assert_eq!(ProtocolModes::REVERSE_DATALINK_SKIP.bits(), 0x03FC);
    }
}
