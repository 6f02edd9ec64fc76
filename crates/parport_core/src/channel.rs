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

    channel.rs

    A logical channel to one peripheral. ChannelState is the per-device
    protocol state every mode driver works on; Channel ties it to a shared
    ParallelPort and implements the caller-facing operations: mode selection,
    negotiation, termination, and reads and writes that flip the bus direction
    as needed.

*/

use std::{fmt, sync::Arc};

use ringbuf::{Consumer, Producer, RingBuffer};

use crate::{
    config::{DriverConfig, ModeSafety},
    datalink::DataLinkMode,
    device_id::{self, DeviceId},
    direction,
    error::{ParportError, TransferError, TransferResult},
    ieee::Phase,
    modes::{
        forward_index,
        reverse_index,
        ModeContext,
        ModeDispatch,
        ModeDriver,
        ProtocolModes,
        FORWARD_DEFAULT,
        FORWARD_MODES,
        REVERSE_DEFAULT,
        REVERSE_MODES,
        MAX_CHANNEL,
    },
    port::ParallelPort,
};

/// Bounded queue of bytes read from the peripheral ahead of a caller's request.
pub struct ShadowBuffer {
    producer: Producer<u8>,
    consumer: Consumer<u8>,
}

impl ShadowBuffer {
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = RingBuffer::<u8>::new(capacity).split();
        Self { producer, consumer }
    }

    pub fn push(&mut self, byte: u8) -> Result<(), ParportError> {
        self.producer.push(byte).map_err(|_| ParportError::BufferOverflow)
    }

    pub fn pop(&mut self) -> Option<u8> {
        self.consumer.pop()
    }

    pub fn pop_slice(&mut self, buf: &mut [u8]) -> usize {
        self.consumer.pop_slice(buf)
    }

    pub fn len(&self) -> usize {
        self.consumer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    pub fn clear(&mut self) {
        while self.consumer.pop().is_some() {}
    }
}

impl fmt::Debug for ShadowBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowBuffer").field("len", &self.len()).finish()
    }
}

/// Protocol state owned by one logical device.
#[derive(Debug)]
pub struct ChannelState {
    pub phase: Phase,
    pub connected: bool,
    /// Last IEEE 1284 event driven, for diagnostics.
    pub current_event: u8,
    pub modes_supported: ProtocolModes,
    pub bad_modes: ProtocolModes,
    pub peripheral_modes: ProtocolModes,
    pub forward_idx: usize,
    pub reverse_idx: usize,
    pub forward_address: u8,
    pub reverse_address: u8,
    pub set_forward_address: bool,
    pub set_reverse_address: bool,
    pub safety: ModeSafety,
    pub ignore_xflag: bool,
    pub negotiated_xflag: bool,
    pub spp_busy_delay_us: Option<u64>,
    pub synch_writes: bool,
    pub datalink: Option<DataLinkMode>,
    pub shadow: ShadowBuffer,
}

impl ChannelState {
    pub fn new(config: &DriverConfig) -> Self {
        let shadow_capacity = (config.port.fifo_depth * 2).max(64);
        Self {
            phase: Phase::Terminate,
            connected: false,
            current_event: 0,
            modes_supported: ProtocolModes::empty(),
            bad_modes: ProtocolModes::empty(),
            peripheral_modes: ProtocolModes::empty(),
            forward_idx: FORWARD_DEFAULT,
            reverse_idx: REVERSE_DEFAULT,
            forward_address: config.channel.forward_interface_address,
            reverse_address: config.channel.reverse_interface_address,
            set_forward_address: false,
            set_reverse_address: false,
            safety: config.channel.mode_safety,
            ignore_xflag: false,
            negotiated_xflag: false,
            spp_busy_delay_us: None,
            synch_writes: config.channel.synch_writes,
            datalink: None,
            shadow: ShadowBuffer::new(shadow_capacity),
        }
    }

    pub fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            log::trace!("phase {:?} -> {:?} (event {})", self.phase, phase, self.current_event);
            self.phase = phase;
        }
    }

    pub fn forward_mode(&self) -> ModeDispatch {
        FORWARD_MODES[self.forward_idx]
    }

    pub fn reverse_mode(&self) -> ModeDispatch {
        REVERSE_MODES[self.reverse_idx]
    }
}

/// A logical device's connection through a shared port.
///
/// The caller is expected to own the port (see [`Channel::acquire`] or the daisy
/// chain select operations) before negotiating or transferring. Operations on one
/// channel are not reentrant.
pub struct Channel {
    port: Arc<ParallelPort>,
    state: ChannelState,
    holds_port: bool,
}

impl Channel {
    pub fn new(port: Arc<ParallelPort>) -> Self {
        let state = ChannelState::new(port.config());
        Self {
            port,
            state,
            holds_port: false,
        }
    }

    pub fn port(&self) -> &Arc<ParallelPort> {
        &self.port
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    /// Take ownership of the port for this channel, waiting up to the configured
    /// acquire timeout.
    pub fn acquire(&mut self) -> Result<(), ParportError> {
        if !self.holds_port {
            let timeout = self.port.config().timing.acquire_timeout();
            self.port.arbiter().acquire(timeout)?;
            self.holds_port = true;
        }
        Ok(())
    }

    /// Return the link to compatibility mode and give up the port.
    pub fn release(&mut self) {
        self.terminate();
        if self.holds_port {
            self.port.arbiter().release();
            self.holds_port = false;
        }
    }

    fn with_context<R>(&mut self, f: impl FnOnce(&mut ModeContext) -> R) -> R {
        let port = &self.port;
        let mut hw = port.hardware();
        let mut ctx = ModeContext {
            hw:     &mut *hw,
            state:  &mut self.state,
            config: port.config(),
        };
        f(&mut ctx)
    }

    fn masks(&self) -> (ProtocolModes, ProtocolModes) {
        let config = self.port.config();
        let mut forward = config.channel.forward_override().unwrap_or(ProtocolModes::all());
        let mut reverse = config.channel.reverse_override().unwrap_or(ProtocolModes::all());
        if self.state.datalink.is_some() {
            forward &= !ProtocolModes::from_bits_truncate(config.datalink.forward_skip_mask);
            reverse &= !ProtocolModes::from_bits_truncate(config.datalink.reverse_skip_mask);
        }
        (forward, reverse)
    }

    /// Pick the best forward and reverse modes the port and peripheral both support.
    pub fn select_modes(&mut self) -> Result<(), ParportError> {
        self.terminate();
        let (forward_mask, reverse_mask) = self.masks();

        let forward = self.with_context(|ctx| {
            FORWARD_MODES.iter().position(|m| {
                let protocol = m.protocol();
                (protocol.is_empty() || forward_mask.contains(protocol)) && m.is_supported(ctx)
            })
        });
        let reverse = self.with_context(|ctx| {
            REVERSE_MODES
                .iter()
                .position(|m| reverse_mask.contains(m.protocol()) && m.is_supported(ctx))
        });

        self.state.forward_idx = forward.unwrap_or(FORWARD_DEFAULT);
        self.state.reverse_idx = reverse.unwrap_or(REVERSE_DEFAULT);
        log::debug!(
            "selected modes: forward {}, reverse {}",
            self.state.forward_mode().name(),
            self.state.reverse_mode().name()
        );
        Ok(())
    }

    /// Connect in the mode implementing `mode`. Returns the protocols the peripheral
    /// has shown it supports.
    pub fn negotiate(&mut self, mode: ProtocolModes) -> Result<ProtocolModes, ParportError> {
        let forward = forward_index(mode);
        let reverse = reverse_index(mode);
        let driver = match (forward, reverse) {
            (Some(i), _) => FORWARD_MODES[i],
            (None, Some(i)) => REVERSE_MODES[i],
            (None, None) => return Err(ParportError::NotSupported("no driver for protocol")),
        };

        self.terminate();
        if let Some(i) = forward {
            self.state.forward_idx = i;
        }
        if let Some(i) = reverse {
            self.state.reverse_idx = i;
        }

        self.with_context(|ctx| driver.connect(ctx, false))?;
        self.state.peripheral_modes |= driver.protocol();
        log::debug!("negotiated {}, phase {:?}", driver.name(), self.state.phase);

        if self.state.phase.is_forward() {
            self.state.set_forward_address = self.state.forward_address != 0;
            self.with_context(direction::program_forward_address)?;
        }
        else {
            self.state.set_reverse_address = self.state.reverse_address != 0;
            self.with_context(direction::program_reverse_address)?;
        }
        Ok(self.state.peripheral_modes)
    }

    /// Drop back to compatibility mode. Does nothing if the link is already down.
    pub fn terminate(&mut self) {
        if self.state.phase.is_terminated() {
            return;
        }
        let driver = if self.state.phase.is_reverse() {
            self.state.reverse_mode()
        }
        else {
            self.state.forward_mode()
        };
        self.with_context(|ctx| driver.disconnect(ctx));
    }

    /// Use `address` for forward transfers. Written at once if the link is idle in
    /// the forward direction, otherwise on the next change to forward.
    pub fn set_forward_address(&mut self, address: u8) -> Result<(), ParportError> {
        if address > MAX_CHANNEL {
            return Err(ParportError::AddressProgramming(address));
        }
        self.state.forward_address = address;
        self.state.set_forward_address = true;
        if self.state.connected && self.state.phase.is_forward() {
            self.with_context(direction::program_forward_address)?;
        }
        Ok(())
    }

    pub fn forward_to_reverse(&mut self) -> Result<(), ParportError> {
        self.with_context(direction::forward_to_reverse)
    }

    pub fn reverse_to_forward(&mut self) -> Result<(), ParportError> {
        self.with_context(direction::reverse_to_forward)
    }

    pub fn have_read_data(&mut self) -> bool {
        if !self.state.shadow.is_empty() {
            return true;
        }
        if !self.state.connected {
            return false;
        }
        let forward = self.state.forward_mode();
        let reverse = self.state.reverse_mode();
        if self.state.phase.is_reverse() || forward.family() == reverse.family() {
            self.with_context(|ctx| reverse.have_read_data(ctx))
        }
        else {
            false
        }
    }

    /// Read from the peripheral, flipping the bus to reverse if needed. Bytes
    /// already held in the shadow buffer are returned first.
    pub fn read(&mut self, buf: &mut [u8]) -> TransferResult {
        let mut count = self.state.shadow.pop_slice(buf);
        if count == buf.len() {
            return Ok(count);
        }

        self.forward_to_reverse()
            .map_err(|e| TransferError::new(e, count))?;

        let driver = self.state.reverse_mode();
        match self.with_context(|ctx| driver.read(ctx, &mut buf[count..])) {
            Ok(n) => {
                count += n;
                Ok(count)
            }
            Err(e) => Err(TransferError::new(e.error, count + e.transferred)),
        }
    }

    /// Write to the peripheral, flipping the bus to forward if needed.
    ///
    /// A printer reporting an error condition is waited out in sleeps of
    /// `write_retry_sleep`, with the port released meanwhile if this channel holds
    /// it, until `write_timeout` has passed. The condition last seen is then
    /// returned along with the bytes that did make it out.
    pub fn write(&mut self, buf: &[u8]) -> TransferResult {
        self.reverse_to_forward().map_err(TransferError::from)?;

        let timing = self.port.config().timing.clone();
        let clock = self.port.clock().clone();
        let deadline = clock.now() + timing.write_timeout();
        let mut written = 0;

        while written < buf.len() {
            let driver = self.state.forward_mode();
            match self.with_context(|ctx| driver.write(ctx, &buf[written..])) {
                Ok(n) => written += n,
                Err(TransferError {
                    error: ParportError::Printer(condition),
                    transferred,
                }) => {
                    written += transferred;
                    if clock.now() >= deadline {
                        log::warn!("write: printer {} after {} bytes, giving up", condition, written);
                        return Err(TransferError::new(ParportError::Printer(condition), written));
                    }
                    log::warn!("write: printer {}, retrying", condition);
                    self.sleep_unowned(timing.write_retry_sleep())
                        .map_err(|e| TransferError::new(e, written))?;
                }
                Err(e) => return Err(TransferError::new(e.error, written + e.transferred)),
            }
        }
        Ok(written)
    }

    /// Sleep with the port released so other devices can use it meanwhile.
    fn sleep_unowned(&mut self, duration: std::time::Duration) -> Result<(), ParportError> {
        let clock = self.port.clock().clone();
        if self.holds_port {
            self.port.arbiter().release();
            self.holds_port = false;
            clock.sleep(duration);
            self.acquire()
        }
        else {
            clock.sleep(duration);
            Ok(())
        }
    }

    /// Read the peripheral's IEEE 1284 device ID and apply what it tells us: the
    /// XFlag quirk, the modes it cannot use, and its datalink.
    pub fn query_device_id(&mut self) -> Result<DeviceId, ParportError> {
        self.terminate();
        let id = self.with_context(device_id::query)?;

        let ignore = self.port.config().ignores_xflag(&id.manufacturer, &id.model);
        if ignore {
            log::warn!("{} {}: ignoring XFlag at termination", id.manufacturer, id.model);
        }
        self.state.ignore_xflag = ignore;
        self.state.bad_modes |= id.bad_modes;
        self.state.datalink = id.datalink_mode();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DriverConfig,
        sim::{FakeClock, PeripheralCaps, SimulatedPort},
        status::PrinterCondition,
    };

    fn setup(config: DriverConfig) -> (SimulatedPort, Channel) {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        let port = ParallelPort::new(Box::new(sim.clone()), Arc::new(clock), Arc::new(config));
        let channel = Channel::new(port);
        (sim, channel)
    }

    #[test]
    fn terminate_is_idempotent() {
        let (sim, mut channel) = setup(DriverConfig::default());
        sim.with_end_of_chain(|p| p.caps = PeripheralCaps::nibble_only());

        // A refused negotiation leaves the channel disconnected.
        assert!(channel.negotiate(ProtocolModes::ECP_SW).is_err());
        let phase = channel.phase();
        assert!(phase.is_terminated());
        assert!(!channel.is_connected());

        channel.terminate();
        assert_eq!(channel.phase(), phase);
        channel.terminate();
        assert_eq!(channel.phase(), phase);
    }

    #[test]
    fn direction_round_trip_restores_forward_idle() {
        let (sim, mut channel) = setup(DriverConfig::default());
        sim.with_end_of_chain(|p| p.reverse_data.extend([1, 2, 3]));

        channel.negotiate(ProtocolModes::ECP_HW_NOIRQ).unwrap();
        assert_eq!(channel.phase(), Phase::ForwardIdle);

        channel.forward_to_reverse().unwrap();
        assert_eq!(channel.phase(), Phase::ReverseIdle);
        channel.reverse_to_forward().unwrap();
        assert_eq!(channel.phase(), Phase::ForwardIdle);
        assert!(channel.is_connected());
    }

    #[test]
    fn select_modes_picks_best_supported() {
        let (sim, mut channel) = setup(DriverConfig::default());
        channel.select_modes().unwrap();
        assert_eq!(channel.state().forward_mode().protocol(), ProtocolModes::BOUNDED_ECP);
        assert_eq!(channel.state().reverse_mode().protocol(), ProtocolModes::BOUNDED_ECP);
        assert!(sim.end_of_chain_in_compatibility());
    }

    #[test]
    fn nibble_only_peripheral_gets_nibble_reverse() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        sim.with_end_of_chain(|p| p.caps = PeripheralCaps::nibble_only());
        let port = ParallelPort::new(Box::new(sim.clone()), Arc::new(clock), Arc::new(DriverConfig::default()));
        let mut channel = Channel::new(port);

        channel.select_modes().unwrap();
        assert_eq!(channel.state().reverse_mode().protocol(), ProtocolModes::NIBBLE);
        assert_eq!(channel.state().forward_mode().protocol(), ProtocolModes::IEEE_COMPATIBILITY);
        assert!(sim.end_of_chain_in_compatibility());
    }

    #[test]
    fn write_then_read_flips_direction() {
        let (sim, mut channel) = setup(DriverConfig::default());
        sim.with_end_of_chain(|p| p.reverse_data.extend(*b"ready"));

        channel.negotiate(ProtocolModes::ECP_HW_NOIRQ).unwrap();
        assert_eq!(channel.write(b"status?").unwrap(), 7);
        assert!(channel.have_read_data());

        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ready");
        assert!(channel.phase().is_reverse());

        assert_eq!(channel.write(b"!").unwrap(), 1);
        assert_eq!(sim.end_of_chain_received(), b"status?!".to_vec());
    }

    #[test]
    fn write_reports_paper_empty_after_timeout() {
        let mut config = DriverConfig::default();
        config.timing.write_timeout_s = 3;
        let (sim, mut channel) = setup(config);
        sim.with_end_of_chain(|p| p.printer.fail_after(5, PrinterCondition::PaperEmpty));

        channel.acquire().unwrap();
        channel.negotiate(ProtocolModes::empty()).unwrap();
        let err = channel.write(b"0123456789").unwrap_err();
        assert!(matches!(err.error, ParportError::Printer(PrinterCondition::PaperEmpty)));
        assert_eq!(err.transferred, 5);
        assert_eq!(sim.end_of_chain_received(), b"01234".to_vec());

        // The port was handed back between retries and is held again now.
        assert!(!channel.port().arbiter().is_free());
        channel.release();
        assert!(channel.port().arbiter().is_free());
    }

    #[test]
    fn write_resumes_when_printer_recovers() {
        let mut config = DriverConfig::default();
        config.timing.write_timeout_s = 10;
        let (sim, mut channel) = setup(config);
        sim.with_end_of_chain(|p| {
            p.printer.fail_after(3, PrinterCondition::OffLine);
            p.printer.recover_after(std::time::Duration::from_millis(2500));
        });

        channel.negotiate(ProtocolModes::empty()).unwrap();
        assert_eq!(channel.write(b"abcdef").unwrap(), 6);
        assert_eq!(sim.end_of_chain_received(), b"abcdef".to_vec());
    }

    #[test]
    fn device_id_applies_quirks_and_datalink() {
        let (sim, mut channel) = setup(DriverConfig::default());
        sim.with_end_of_chain(|p| {
            p.device_id = Some("MFG:Brother;MDL:MFC-7820N;CMD:PCL;1284.3DL:4d,4e,4f;1284.3M:EPP;".to_string())
        });

        let id = channel.query_device_id().unwrap();
        assert_eq!(id.manufacturer, "Brother");
        assert!(channel.state().ignore_xflag);
        assert_eq!(channel.state().datalink, Some(DataLinkMode::Dot3));
        assert!(channel.state().bad_modes.contains(ProtocolModes::EPP_ANY));
        assert!(sim.end_of_chain_in_compatibility());
    }

    fn unsafe_config() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.channel.mode_safety = ModeSafety::Unsafe;
        config
    }

    #[test]
    fn unsafe_mode_selection_skips_trial_connects() {
        // A nibble-only peripheral fails every trial connect but nibble.
        let (sim, mut channel) = setup(DriverConfig::default());
        sim.with_end_of_chain(|p| p.caps = PeripheralCaps::nibble_only());
        channel.select_modes().unwrap();
        assert!(sim.with_end_of_chain(|p| p.negotiations) > 0);
        assert_ne!(channel.state().forward_mode().protocol(), ProtocolModes::BOUNDED_ECP);

        let (sim, mut channel) = setup(unsafe_config());
        sim.with_end_of_chain(|p| p.caps = PeripheralCaps::nibble_only());
        channel.select_modes().unwrap();
        assert_eq!(sim.with_end_of_chain(|p| p.negotiations), 0);
        assert_eq!(channel.state().forward_mode().protocol(), ProtocolModes::BOUNDED_ECP);
        assert_eq!(channel.state().reverse_mode().protocol(), ProtocolModes::BOUNDED_ECP);
        assert!(!channel.is_connected());
    }

    #[test]
    fn unsafe_mode_accepts_ieee_compatibility_untested() {
        let mut config = unsafe_config();
        config.channel.forward_mode_override = Some(ProtocolModes::IEEE_COMPATIBILITY.bits());
        config.channel.reverse_mode_override = Some(ProtocolModes::NIBBLE.bits());
        let (sim, mut channel) = setup(config);

        channel.select_modes().unwrap();
        assert_eq!(channel.state().forward_mode().protocol(), ProtocolModes::IEEE_COMPATIBILITY);
        assert_eq!(channel.state().reverse_mode().protocol(), ProtocolModes::NIBBLE);
        assert_eq!(sim.with_end_of_chain(|p| p.negotiations), 0);
    }

    #[test]
    fn unsafe_mode_connects_without_negotiation() {
        let cases = [
            (ProtocolModes::NIBBLE, Phase::ReverseIdle),
            (ProtocolModes::BYTE_BIDIR, Phase::ReverseIdle),
            (ProtocolModes::EPP_HW, Phase::ForwardIdle),
            (ProtocolModes::EPP_SW, Phase::ForwardIdle),
            (ProtocolModes::ECP_SW, Phase::ForwardIdle),
        ];

        for (mode, phase) in cases {
            let (sim, mut channel) = setup(unsafe_config());
            channel.negotiate(mode).unwrap();
            assert!(channel.is_connected(), "{:?} not connected", mode);
            assert_eq!(channel.phase(), phase, "{:?}", mode);
            assert_eq!(sim.with_end_of_chain(|p| p.negotiations), 0, "{:?} negotiated", mode);
            assert!(sim.end_of_chain_in_compatibility());

            channel.terminate();
            assert!(!channel.is_connected());
            assert!(channel.phase().is_terminated());
        }
    }
}
