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

    daisychain::legacy_zip.rs

    Select and deselect for parallel Zip drives that predate IEEE 1284.3. The
    drive watches for a three byte disk-mode qualifier clocked on AUTOFEED and
    answers on the fault line once selected. A print-mode byte after the
    qualifier hands the cable back to the printer.

*/

use crate::{port_io::SignalIo, registers::*};

/// Pseudo device id reported for a legacy Zip drive, which has none of its own.
pub const LEGACY_ZIP_PSEUDO_ID: &str = "MFG:IMG;CMD:;MDL:VP0;CLS:SCSIADAPTER;DES:IOMEGA PARALLEL PORT";

/// Slot number used when reporting legacy Zip select failures.
pub const LEGACY_ZIP_ID: u8 = 5;

const DISK_MODE: [u8; 3] = [0x00, 0x3C, 0x20];
const PRINT_MODE: u8 = 0x8F;

const DCR_IDLE: u8 = DCR_RESERVED | DCR_SELECT_IN | DCR_NOT_INIT;

/// Put `byte` on the data lines and clock it with an AUTOFEED pulse.
fn clock_byte(hw: &mut SignalIo, byte: u8) {
    hw.write_data(byte);
    hw.write_dcr(DCR_IDLE);
    hw.write_dcr(DCR_IDLE | DCR_AUTOFEED);
    hw.write_dcr(DCR_IDLE);
    hw.write_dcr(DCR_IDLE & !DCR_SELECT_IN);
    hw.write_dcr(DCR_IDLE);
}

/// A selected drive follows AUTOFEED on its fault line.
fn responding(hw: &mut SignalIo) -> bool {
    hw.write_dcr(DCR_IDLE | DCR_AUTOFEED);
    let high = hw.read_dsr() & DSR_NOT_FAULT != 0;
    hw.write_dcr(DCR_IDLE);
    let low = hw.read_dsr() & DSR_NOT_FAULT == 0;
    high && low
}

pub fn select(hw: &mut SignalIo) -> bool {
    let saved = hw.read_dcr();
    for byte in DISK_MODE {
        clock_byte(hw, byte);
    }
    let selected = responding(hw);
    if !selected {
        log::trace!("legacy zip: no response to disk mode qualifier");
    }
    hw.write_dcr(saved);
    selected
}

pub fn deselect(hw: &mut SignalIo) {
    let saved = hw.read_dcr();
    for byte in DISK_MODE {
        clock_byte(hw, byte);
    }
    clock_byte(hw, PRINT_MODE);
    hw.write_dcr(saved);
}

/// Probe for a drive by selecting it and deselecting it again.
pub fn detect(hw: &mut SignalIo) -> bool {
    if select(hw) {
        deselect(hw);
        log::debug!("legacy zip drive detected");
        true
    }
    else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DriverConfig,
        device_id::DeviceId,
        sim::{FakeClock, SimulatedPort},
    };
    use std::sync::Arc;

    fn signal_io(sim: &SimulatedPort, clock: FakeClock) -> SignalIo {
        SignalIo::new(Box::new(sim.clone()), Arc::new(clock), &DriverConfig::default())
    }

    #[test]
    fn printer_alone_is_not_a_zip() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        let mut hw = signal_io(&sim, clock);
        assert!(!detect(&mut hw));
        assert!(sim.end_of_chain_received().is_empty());
    }

    #[test]
    fn select_and_deselect() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        sim.attach_legacy_zip();
        let mut hw = signal_io(&sim, clock);

        assert!(select(&mut hw));
        assert!(sim.legacy_zip_selected());
        deselect(&mut hw);
        assert!(!sim.legacy_zip_selected());
        assert!(sim.end_of_chain_in_compatibility());
    }

    #[test]
    fn pseudo_id_parses() {
        let id = DeviceId::parse(LEGACY_ZIP_PSEUDO_ID);
        assert_eq!(id.manufacturer, "IMG");
        assert_eq!(id.model, "VP0");
        assert_eq!(id.class, "SCSIADAPTER");
    }
}
