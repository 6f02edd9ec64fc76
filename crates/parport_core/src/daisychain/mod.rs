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

    daisychain::mod.rs

    The IEEE 1284.3 daisy-chain bus. DaisyChainBus assigns addresses to the
    devices chained in front of the end-of-chain peripheral, tells plain 1284.3
    devices apart from Shuttle adapters that miscount the chain, and selects or
    deselects a device with CPP commands. A legacy Zip drive is routed to its
    own select sequence.

*/

pub mod legacy_zip;

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    config::TimingConfig,
    error::ParportError,
    port::ParallelPort,
    port_io::SignalIo,
    registers::*,
};

/// The 1284.3 mode qualifier: four lead bytes, the check byte, the command
/// byte and the terminator.
pub const MODE_QUALIFIER: [u8; 7] = [0xAA, 0x55, 0x00, 0xFF, 0x87, 0x78, 0xFF];

/// Most devices a 1284.3 chain can address, not counting the end of chain.
pub const MAX_CHAIN_DEVICES: u8 = 4;

pub const CPP_SELECT: u8 = 0xE0;
pub const CPP_DESELECT: u8 = 0x30;
pub const CPP_COUNTDOWN: u8 = 0x88;
pub const CPP_COUNTDOWN_ARM: u8 = 0x80;
pub const CPP_PRODUCT_ID: u8 = 0x10;

const ASSIGN_STALL_US: u64 = 5;
const COMMAND_STALL_US: u64 = 3;
const INITIATE_TRIES: u32 = 3;

/// Product ids reported by Shuttle adapters that predate 1284.3.
const STL_LEGACY_PRODUCT_IDS: [u16; 2] = [0xAAFF, 0xA8FF];

/// Something that can be selected on the bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainTarget {
    /// A 1284.3 device at the given address.
    Dot3(u8),
    /// The peripheral at the end of the cable. Selecting it is a no-op.
    EndOfChain,
    /// A parallel Zip drive without 1284.3 support.
    LegacyZip,
}

impl fmt::Display for ChainTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainTarget::Dot3(id) => write!(f, "1284.3 device {}", id),
            ChainTarget::EndOfChain => write!(f, "end of chain"),
            ChainTarget::LegacyZip => write!(f, "legacy zip"),
        }
    }
}

#[derive(Debug, Default)]
struct ChainState {
    device_count: u8,
    legacy_zip: bool,
    selected: Option<ChainTarget>,
}

/// The daisy chain on one physical port.
pub struct DaisyChainBus {
    port:  Arc<ParallelPort>,
    state: Mutex<ChainState>,
}

/// Control register for the 1284.3 sequences: 1284 Active low so chained devices
/// listen, nInit high so nothing resets, forward direction.
fn qualifier_dcr(dcr: u8) -> u8 {
    (dcr & !(DCR_SELECT_IN | DCR_DIRECTION)) | DCR_NOT_INIT
}

/// Pulse STROBE so the addressed device latches the last command byte.
fn pulse_strobe(hw: &mut SignalIo, dcr: u8, stall_us: u64) {
    hw.write_dcr(dcr & !DCR_STROBE);
    hw.write_dcr(dcr | DCR_STROBE);
    hw.stall_us(stall_us);
    hw.write_dcr(dcr & !DCR_STROBE);
    hw.stall_us(stall_us);
}

/// Status of a chain that heard the four lead bytes: every device drives
/// nBusy, PError, Select and nFault high.
const LEAD_STATUS: u8 = DSR_NOT_BUSY | DSR_PERROR | DSR_SELECT | DSR_NOT_FAULT;
/// Status after the check byte. Busy is inverted on the cable, so it reads low.
const CHECK_STATUS: u8 = DSR_SELECT | DSR_NOT_FAULT;
/// PError and Select stay high once the chain accepts the qualifier.
const ACCEPT_STATUS: u8 = DSR_PERROR | DSR_SELECT;
const STATUS_MASK: u8 = 0xB8;

/// Write the lead bytes and the check byte, verifying the chain's answer to each.
/// Returns the status seen after the lead and after the check byte, or None as soon
/// as the chain answers wrongly.
fn send_lead(hw: &mut SignalIo, stall_us: u64) -> Option<(u8, u8)> {
    for byte in &MODE_QUALIFIER[..4] {
        hw.write_data(*byte);
        hw.stall_us(stall_us);
    }
    let armed = hw.read_dsr();
    if armed & STATUS_MASK != LEAD_STATUS {
        log::trace!("qualifier lead not answered: {:02X}", armed);
        return None;
    }

    hw.write_data(MODE_QUALIFIER[4]);
    hw.stall_us(stall_us);
    let checked = hw.read_dsr();
    if checked & STATUS_MASK != CHECK_STATUS {
        log::trace!("qualifier check byte not answered: {:02X}", checked);
        return None;
    }
    Some((armed, checked))
}

/// Write the qualifier's sixth byte and report whether a device accepted it.
fn send_accept(hw: &mut SignalIo, stall_us: u64) -> bool {
    hw.write_data(MODE_QUALIFIER[5]);
    hw.stall_us(stall_us);
    let status = hw.read_dsr();
    if status & ACCEPT_STATUS != ACCEPT_STATUS {
        log::trace!("qualifier not accepted: {:02X}", status);
        return false;
    }
    true
}

/// Run the address assignment sequence once and return how many devices took an
/// address.
pub fn assign_addresses(hw: &mut SignalIo) -> u8 {
    let saved = hw.read_dcr();
    let dcr = qualifier_dcr(saved);
    hw.write_dcr(dcr);
    hw.write_dcr(dcr & !DCR_STROBE);

    let mut count = 0u8;
    let mut last_device = false;

    for byte in &MODE_QUALIFIER[..4] {
        hw.write_data(*byte);
        hw.stall_us(ASSIGN_STALL_US);
    }

    if hw.read_dsr() & 0xB8 == 0xB8 {
        hw.write_data(MODE_QUALIFIER[4]);
        hw.stall_us(ASSIGN_STALL_US);

        if hw.read_dsr() & 0xB8 == 0x18 {
            hw.write_data(MODE_QUALIFIER[5]);
            hw.stall_us(ASSIGN_STALL_US);

            if hw.read_dsr() & 0x30 == 0x30 {
                hw.stall_us(ASSIGN_STALL_US);
                while count < MAX_CHAIN_DEVICES && !last_device {
                    hw.write_data(count);
                    count += 1;
                    hw.stall_us(ASSIGN_STALL_US);
                    if hw.read_dsr() & DSR_NOT_BUSY == 0 {
                        last_device = true;
                    }
                    pulse_strobe(hw, dcr, ASSIGN_STALL_US);
                }
                hw.write_data(MODE_QUALIFIER[6]);
                hw.stall_us(ASSIGN_STALL_US);
            }
        }
    }

    if count > 0 {
        let non_1284_3 = check_non_1284_3_present(hw);
        let mut stl_legacy = false;
        let mut idx = 0u8;
        while idx < count {
            if check_stl_1284_3(hw, idx, non_1284_3) {
                idx += 1;
                continue;
            }
            if non_1284_3 && check_stl_product_id(hw, idx) {
                stl_legacy = true;
                idx += 1;
                continue;
            }
            break;
        }
        if stl_legacy {
            log::debug!("shuttle adapter miscounted the chain: {} -> {}", count, idx);
            count = idx;
        }
    }

    hw.write_dcr(saved);
    count
}

/// A device that is not 1284.3 compliant answers the check byte with nAck
/// unchanged from the lead.
pub fn check_non_1284_3_present(hw: &mut SignalIo) -> bool {
    let saved = hw.read_dcr();
    let dcr = qualifier_dcr(saved);
    hw.write_dcr(dcr & !DCR_STROBE);
    hw.stall_us(COMMAND_STALL_US);

    let mut present = false;

    if let Some((armed, checked)) = send_lead(hw, COMMAND_STALL_US) {
        // Earlier adapters do not toggle nAck on the check byte.
        if (armed ^ checked) & DSR_NOT_ACK != 0 {
            present = send_accept(hw, COMMAND_STALL_US);
        }
        hw.write_data(MODE_QUALIFIER[6]);
        hw.stall_us(COMMAND_STALL_US);
    }

    hw.write_dcr(saved);
    present
}

/// Shuttle 1284.3 adapters count down from 0xF0 on the upper status lines while
/// the countdown command is toggled.
pub fn check_stl_1284_3(hw: &mut SignalIo, idx: u8, no_strobe: bool) -> bool {
    let saved = hw.read_dcr();
    let dcr = qualifier_dcr(saved);
    hw.write_dcr(dcr & !DCR_STROBE);
    hw.stall_us(COMMAND_STALL_US);

    if send_lead(hw, COMMAND_STALL_US).is_none() || !send_accept(hw, COMMAND_STALL_US) {
        hw.write_dcr(saved);
        return false;
    }

    hw.stall_us(COMMAND_STALL_US);
    hw.write_data(CPP_COUNTDOWN | idx);
    hw.stall_us(COMMAND_STALL_US);
    if idx != 0 && !no_strobe {
        pulse_strobe(hw, dcr, COMMAND_STALL_US);
    }

    let mut matched = true;
    let mut expected = 0xF0u8;
    while expected != 0 {
        hw.stall_us(COMMAND_STALL_US);
        hw.write_data(CPP_COUNTDOWN_ARM | idx);
        hw.stall_us(COMMAND_STALL_US);
        hw.write_data(CPP_COUNTDOWN | idx);
        hw.stall_us(COMMAND_STALL_US);

        let dsr = hw.read_dsr();
        let pattern = ((dsr << 1) & 0x70) | (dsr & 0x80);
        if pattern != expected {
            matched = false;
            break;
        }
        expected -= 0x10;
    }

    hw.write_data(MODE_QUALIFIER[6]);
    hw.stall_us(COMMAND_STALL_US);
    hw.write_dcr(saved);
    matched
}

/// Older Shuttle adapters return a 16 bit product id a nibble at a time on the
/// upper status lines.
pub fn check_stl_product_id(hw: &mut SignalIo, idx: u8) -> bool {
    let saved = hw.read_dcr();
    let dcr = qualifier_dcr(saved);
    hw.write_dcr(dcr & !DCR_STROBE);
    hw.stall_us(COMMAND_STALL_US);

    if send_lead(hw, COMMAND_STALL_US).is_none() || !send_accept(hw, COMMAND_STALL_US) {
        hw.write_dcr(saved);
        return false;
    }

    hw.write_data(CPP_PRODUCT_ID | idx);
    hw.stall_us(COMMAND_STALL_US);
    hw.stall_us(COMMAND_STALL_US);

    let lo_hi = hw.read_dsr() & 0xF0;
    pulse_strobe(hw, dcr, COMMAND_STALL_US);
    let lo_lo = hw.read_dsr() >> 4;
    pulse_strobe(hw, dcr, COMMAND_STALL_US);
    let hi_hi = hw.read_dsr() & 0xF0;
    pulse_strobe(hw, dcr, COMMAND_STALL_US);
    let hi_lo = hw.read_dsr() >> 4;
    pulse_strobe(hw, dcr, COMMAND_STALL_US);

    let product_id = u16::from_be_bytes([hi_hi | hi_lo, lo_hi | lo_lo]);
    log::trace!("shuttle product id for slot {}: {:04X}", idx, product_id);

    hw.write_data(MODE_QUALIFIER[6]);
    hw.stall_us(COMMAND_STALL_US);
    hw.write_dcr(saved);

    STL_LEGACY_PRODUCT_IDS.contains(&product_id)
}

/// Send one CPP command through the mode qualifier. Select and deselect are
/// confirmed on the fault line.
pub fn send_command(hw: &mut SignalIo, timing: &TimingConfig, command: u8) -> bool {
    let window = timing.daisy_chain_check();
    let saved = hw.read_dcr();
    let dcr = qualifier_dcr(saved);
    hw.write_dcr(dcr & !DCR_STROBE);
    hw.stall_us(COMMAND_STALL_US);

    let mut success = false;

    for byte in &MODE_QUALIFIER[..4] {
        hw.write_data(*byte);
        hw.stall_us(COMMAND_STALL_US);
    }

    'qualify: {
        if !hw.check_dsr(DsrPattern::new(Inactive, DontCare, Active, Active, Active), window) {
            log::trace!("cpp {:02X}: no response to the lead bytes", command);
            break 'qualify;
        }
        hw.write_data(MODE_QUALIFIER[4]);
        hw.stall_us(COMMAND_STALL_US);

        if !hw.check_dsr(DsrPattern::new(Active, DontCare, Inactive, Active, Active), window) {
            log::trace!("cpp {:02X}: no response to the check byte", command);
            break 'qualify;
        }
        hw.write_data(MODE_QUALIFIER[5]);
        hw.stall_us(COMMAND_STALL_US);

        if !hw.check_dsr(DsrPattern::new(DontCare, DontCare, Active, Active, DontCare), window) {
            log::trace!("cpp {:02X}: qualifier not accepted", command);
            break 'qualify;
        }

        hw.stall_us(COMMAND_STALL_US);
        hw.write_data(command);
        hw.stall_us(COMMAND_STALL_US);
        hw.write_dcr(dcr | DCR_STROBE);
        hw.stall_us(COMMAND_STALL_US);

        success = match command & 0xF0 {
            CPP_SELECT => poll_fault(hw, timing, true),
            CPP_DESELECT => poll_fault(hw, timing, false),
            _ => {
                hw.stall_us(COMMAND_STALL_US);
                true
            }
        };

        hw.write_dcr(dcr & !DCR_STROBE);
        hw.stall_us(COMMAND_STALL_US);
        hw.write_data(MODE_QUALIFIER[6]);
        hw.stall_us(COMMAND_STALL_US);
    }

    hw.write_dcr(saved);
    success
}

fn poll_fault(hw: &mut SignalIo, timing: &TimingConfig, set: bool) -> bool {
    for _ in 0..timing.select_poll_count {
        if (hw.read_dsr() & DSR_NOT_FAULT != 0) == set {
            return true;
        }
        if timing.select_poll_stall_us > 0 {
            hw.stall_us(timing.select_poll_stall_us);
        }
    }
    false
}

impl DaisyChainBus {
    pub fn new(port: Arc<ParallelPort>) -> Self {
        Self {
            port,
            state: Mutex::new(ChainState::default()),
        }
    }

    pub fn port(&self) -> &Arc<ParallelPort> {
        &self.port
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of 1284.3 devices found by the last [DaisyChainBus::initiate_bus].
    pub fn device_count(&self) -> u8 {
        self.state().device_count
    }

    pub fn legacy_zip_present(&self) -> bool {
        self.state().legacy_zip
    }

    pub fn selected(&self) -> Option<ChainTarget> {
        self.state().selected
    }

    /// Assign addresses to every device on the chain and return how many there are.
    /// The caller must own the port.
    ///
    /// The assignment is run twice and repeated while the two counts disagree. A
    /// count that never settles is logged and the last one returned.
    pub fn initiate_bus(&self) -> u8 {
        let mut hw = self.port.hardware();

        let mut count = 0;
        let mut settled = false;
        for attempt in 0..INITIATE_TRIES {
            hw.stall_us(ASSIGN_STALL_US);
            let first = assign_addresses(&mut hw);
            hw.stall_us(ASSIGN_STALL_US);
            count = assign_addresses(&mut hw);
            if first == count {
                settled = true;
                break;
            }
            log::warn!(
                "daisy chain count changed between passes ({} -> {}), attempt {}",
                first,
                count,
                attempt + 1
            );
        }
        if !settled {
            log::error!("daisy chain count never settled, using {}", count);
        }

        let zip = legacy_zip::detect(&mut hw);
        drop(hw);

        log::debug!("daisy chain initiated: {} device(s), legacy zip: {}", count, zip);
        let mut state = self.state();
        state.device_count = count;
        state.legacy_zip = zip;
        state.selected = None;
        count
    }

    /// Select `target`. Unless `keep_port` is set the port is acquired first, and
    /// given back again if the select fails.
    pub fn select_device(&self, target: ChainTarget, keep_port: bool) -> Result<(), ParportError> {
        if !keep_port {
            let timeout = self.port.config().timing.acquire_timeout();
            self.port.arbiter().acquire(timeout)?;
        }

        match self.try_select_device(target) {
            Ok(()) => Ok(()),
            Err(e) => {
                if !keep_port {
                    self.port.arbiter().release();
                }
                Err(e)
            }
        }
    }

    /// Select `target` on a port the caller already owns.
    pub fn try_select_device(&self, target: ChainTarget) -> Result<(), ParportError> {
        let count = self.device_count();
        match target {
            ChainTarget::EndOfChain => {}
            ChainTarget::Dot3(id) if id == count => {
                // The address after the last device is the end of chain.
            }
            ChainTarget::Dot3(id) if id > count => {
                return Err(ParportError::InvalidDevice(id));
            }
            ChainTarget::Dot3(id) => {
                if !self.retry_command(CPP_SELECT | id) {
                    log::warn!("select of 1284.3 device {} failed", id);
                    return Err(ParportError::SelectFailed(id));
                }
            }
            ChainTarget::LegacyZip => {
                let mut hw = self.port.hardware();
                if !legacy_zip::select(&mut hw) {
                    return Err(ParportError::SelectFailed(legacy_zip::LEGACY_ZIP_ID));
                }
            }
        }

        log::debug!("selected {}", target);
        self.state().selected = Some(target);
        Ok(())
    }

    /// Deselect `target`, then give up the port unless `keep_port` is set. The port
    /// is only given up when the deselect succeeds.
    pub fn deselect_device(&self, target: ChainTarget, keep_port: bool) -> Result<(), ParportError> {
        let count = self.device_count();
        let result = match target {
            ChainTarget::Dot3(id) if id > count => Err(ParportError::InvalidDevice(id)),
            ChainTarget::Dot3(id) if id < count => {
                if self.retry_command(CPP_DESELECT) {
                    Ok(())
                }
                else {
                    log::warn!("deselect of 1284.3 device {} failed", id);
                    Err(ParportError::DeselectFailed(id))
                }
            }
            ChainTarget::Dot3(_) | ChainTarget::EndOfChain => Ok(()),
            ChainTarget::LegacyZip => {
                let mut hw = self.port.hardware();
                legacy_zip::deselect(&mut hw);
                Ok(())
            }
        };

        // A failed deselect leaves the port with the caller.
        if result.is_ok() {
            let mut state = self.state();
            if state.selected == Some(target) {
                state.selected = None;
            }
            drop(state);
            if !keep_port {
                self.port.arbiter().release();
            }
        }
        result
    }

    fn retry_command(&self, command: u8) -> bool {
        let config = self.port.config();
        let mut hw = self.port.hardware();
        for attempt in 0..config.timing.dot3_retries.max(1) {
            if send_command(&mut hw, &config.timing, command) {
                return true;
            }
            log::trace!("cpp {:02X} retry {}", command, attempt + 1);
            hw.stall_us(ASSIGN_STALL_US);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::Channel,
        config::DriverConfig,
        modes::ProtocolModes,
        sim::{ChainDeviceKind, FakeClock, Peripheral, QualifierStage, SimulatedPort},
    };

    fn setup() -> (SimulatedPort, Arc<ParallelPort>) {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        let port = ParallelPort::new(Box::new(sim.clone()), Arc::new(clock), Arc::new(DriverConfig::default()));
        (sim, port)
    }

    fn two_device_chain() -> (SimulatedPort, DaisyChainBus) {
        let (sim, port) = setup();
        sim.add_chain_device(ChainDeviceKind::Standard, Peripheral::new());
        sim.add_chain_device(ChainDeviceKind::Standard, Peripheral::new());
        (sim, DaisyChainBus::new(port))
    }

    #[test]
    fn empty_port_has_no_devices() {
        let (_sim, port) = setup();
        let bus = DaisyChainBus::new(port);
        assert_eq!(bus.initiate_bus(), 0);
        assert!(!bus.legacy_zip_present());
    }

    #[test]
    fn initiate_bus_assigns_addresses() {
        let (sim, bus) = two_device_chain();
        assert_eq!(bus.initiate_bus(), 2);
        assert_eq!(sim.device_address(0), Some(0));
        assert_eq!(sim.device_address(1), Some(1));
        assert!(sim.end_of_chain_in_compatibility());
    }

    #[test]
    fn initiate_bus_count_is_stable() {
        let (_sim, bus) = two_device_chain();
        let first = bus.initiate_bus();
        let second = bus.initiate_bus();
        assert_eq!(first, second);
        assert_eq!(bus.device_count(), 2);
    }

    #[test]
    fn select_then_deselect_frees_port() {
        let (sim, bus) = two_device_chain();
        bus.initiate_bus();

        for id in 0..bus.device_count() {
            bus.select_device(ChainTarget::Dot3(id), false).unwrap();
            assert!(!bus.port().arbiter().is_free());
            assert_eq!(sim.selected(), Some(id));
            assert_eq!(bus.selected(), Some(ChainTarget::Dot3(id)));

            bus.deselect_device(ChainTarget::Dot3(id), false).unwrap();
            assert!(bus.port().arbiter().is_free());
            assert_eq!(sim.selected(), None);
            assert_eq!(bus.selected(), None);
        }
    }

    #[test]
    fn end_of_chain_select_is_trivial() {
        let (sim, bus) = two_device_chain();
        bus.initiate_bus();
        bus.select_device(ChainTarget::EndOfChain, false).unwrap();
        bus.select_device(ChainTarget::Dot3(2), true).unwrap();
        assert_eq!(sim.selected(), None);
        bus.deselect_device(ChainTarget::EndOfChain, false).unwrap();
        assert!(bus.port().arbiter().is_free());
    }

    #[test]
    fn select_past_end_of_chain_is_rejected() {
        let (_sim, bus) = two_device_chain();
        bus.initiate_bus();
        let err = bus.select_device(ChainTarget::Dot3(3), false).unwrap_err();
        assert!(matches!(err, ParportError::InvalidDevice(3)));
        assert!(bus.port().arbiter().is_free());
    }

    #[test]
    fn invalid_deselect_keeps_the_port() {
        let (sim, port) = setup();
        sim.add_chain_device(ChainDeviceKind::Standard, Peripheral::new());
        let bus = DaisyChainBus::new(port);
        assert_eq!(bus.initiate_bus(), 1);

        assert!(bus.port().arbiter().try_acquire());
        let err = bus.deselect_device(ChainTarget::Dot3(7), false).unwrap_err();
        assert!(matches!(err, ParportError::InvalidDevice(7)));
        assert!(!bus.port().arbiter().is_free());

        bus.port().arbiter().release();
        assert!(bus.port().arbiter().is_free());
    }

    #[test]
    fn failed_deselect_keeps_the_port() {
        let (sim, bus) = two_device_chain();
        bus.initiate_bus();
        bus.select_device(ChainTarget::Dot3(0), false).unwrap();
        assert_eq!(sim.selected(), Some(0));

        sim.override_qualifier_status(QualifierStage::Accept, 0xDF);
        let err = bus.deselect_device(ChainTarget::Dot3(0), false).unwrap_err();
        assert!(matches!(err, ParportError::DeselectFailed(0)));
        assert!(!bus.port().arbiter().is_free());
        assert_eq!(bus.selected(), Some(ChainTarget::Dot3(0)));

        bus.port().arbiter().release();
        assert!(bus.port().arbiter().is_free());
    }

    #[test]
    fn shuttle_legacy_device_is_not_miscounted() {
        let (sim, port) = setup();
        sim.add_chain_device(ChainDeviceKind::Shuttle1284_3, Peripheral::new());
        sim.add_chain_device(ChainDeviceKind::ShuttleLegacy(0xAAFF), Peripheral::new());
        let bus = DaisyChainBus::new(port);

        let mut hw = bus.port().hardware();
        assert!(check_non_1284_3_present(&mut hw));
        drop(hw);

        assert_eq!(bus.initiate_bus(), 2);
    }

    fn shuttle_pair() -> (SimulatedPort, Arc<ParallelPort>) {
        let (sim, port) = setup();
        sim.add_chain_device(ChainDeviceKind::Shuttle1284_3, Peripheral::new());
        sim.add_chain_device(ChainDeviceKind::ShuttleLegacy(0xA8FF), Peripheral::new());
        (sim, port)
    }

    #[test]
    fn shuttle_checks_identify_adapters() {
        let (sim, port) = shuttle_pair();
        let mut hw = port.hardware();
        assert!(check_stl_1284_3(&mut hw, 0, true));
        assert!(check_stl_product_id(&mut hw, 1));
        assert!(!check_stl_product_id(&mut hw, 0));
        drop(hw);
        assert!(sim.cpp_commands().contains(&(CPP_PRODUCT_ID | 1)));
    }

    #[test]
    fn shuttle_checks_stop_on_unexpected_qualifier_status() {
        let checks: [fn(&mut SignalIo) -> bool; 3] = [
            |hw| check_stl_1284_3(hw, 0, true),
            |hw| check_stl_product_id(hw, 1),
            check_non_1284_3_present,
        ];
        let cases = [
            (QualifierStage::Lead, 0x7F),
            (QualifierStage::Check, 0x0F),
            (QualifierStage::Accept, 0xDF),
        ];

        for (stage, status) in cases {
            for (i, check) in checks.iter().enumerate() {
                let (sim, port) = shuttle_pair();
                sim.override_qualifier_status(stage, status);
                let mut hw = port.hardware();
                assert!(!check(&mut *hw), "check {} passed with bad {:?} status", i, stage);
                drop(hw);
                assert!(sim.cpp_commands().is_empty(), "check {} sent commands after {:?}", i, stage);
            }
        }
    }

    #[test]
    fn standard_chain_has_no_non_1284_3_device() {
        let (_sim, bus) = two_device_chain();
        let mut hw = bus.port().hardware();
        assert!(!check_non_1284_3_present(&mut hw));
    }

    #[test]
    fn legacy_zip_is_detected_and_selected() {
        let (sim, port) = setup();
        sim.attach_legacy_zip();
        let bus = DaisyChainBus::new(port);

        assert_eq!(bus.initiate_bus(), 0);
        assert!(bus.legacy_zip_present());
        assert!(!sim.legacy_zip_selected());

        bus.select_device(ChainTarget::LegacyZip, false).unwrap();
        assert!(sim.legacy_zip_selected());
        bus.deselect_device(ChainTarget::LegacyZip, false).unwrap();
        assert!(!sim.legacy_zip_selected());
        assert!(bus.port().arbiter().is_free());
    }

    #[test]
    fn two_device_chain_example() {
        let (sim, port) = setup();
        sim.add_chain_device(ChainDeviceKind::Standard, Peripheral::new());
        sim.add_chain_device(ChainDeviceKind::Standard, Peripheral::new());
        sim.with_device(0, |p| p.reverse_data.extend((0..32u8).map(|b| b ^ 0x5A)));

        let bus = DaisyChainBus::new(port.clone());
        let mut channel = Channel::new(port.clone());

        channel.acquire().unwrap();
        assert_eq!(bus.initiate_bus(), 2);
        bus.select_device(ChainTarget::Dot3(0), true).unwrap();

        channel.negotiate(ProtocolModes::ECP_HW_NOIRQ).unwrap();
        assert!(channel.phase().is_forward());

        let payload: Vec<u8> = (0..64u8).collect();
        assert_eq!(channel.write(&payload).unwrap(), 64);
        assert_eq!(sim.device_received(0), payload);

        channel.forward_to_reverse().unwrap();
        assert!(channel.phase().is_reverse());

        let mut buf = [0u8; 64];
        let n = channel.read(&mut buf).unwrap();
        let expected: Vec<u8> = (0..32u8).map(|b| b ^ 0x5A).collect();
        assert_eq!(&buf[..n], &expected[..]);

        channel.terminate();
        bus.deselect_device(ChainTarget::Dot3(0), true).unwrap();
        channel.release();
        assert!(port.arbiter().is_free());
    }
}
