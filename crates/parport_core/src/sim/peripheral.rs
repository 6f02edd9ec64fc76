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

    sim::peripheral.rs

    A behavioural model of an IEEE 1284 peripheral. It answers negotiation,
    termination and the per-mode handshakes by watching control-line edges, the
    same way a real device only ever sees the cable.

*/

use std::{collections::VecDeque, time::Duration};

use crate::{registers::*, status::PrinterCondition};

const DEFAULT_DEVICE_ID: &str = "MFG:Generic;MDL:Simulated Printer;CMD:PCL,PJL;CLS:PRINTER;DES:Simulated 1284 Printer;";

/// Extended modes the peripheral will accept during negotiation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PeripheralCaps {
    pub nibble: bool,
    pub byte: bool,
    pub ecp: bool,
    pub becp: bool,
    pub epp: bool,
    pub channelized: bool,
}

impl PeripheralCaps {
    pub fn full() -> Self {
        Self {
            nibble: true,
            byte: true,
            ecp: true,
            becp: true,
            epp: true,
            channelized: true,
        }
    }

    pub fn nibble_only() -> Self {
        Self {
            nibble: true,
            byte: false,
            ecp: false,
            becp: false,
            epp: false,
            channelized: false,
        }
    }

    fn accepts(&self, ext: u8) -> bool {
        match ext {
            0x00 => self.nibble,
            0x01 => self.byte,
            0x08 => self.channelized,
            0x10 => self.ecp,
            0x18 => self.becp,
            0x40 => self.epp,
            _ => false,
        }
    }
}

impl Default for PeripheralCaps {
    fn default() -> Self {
        Self::full()
    }
}

/// Compatibility-mode printer engine: paper state and the BUSY pulse that follows
/// each strobe.
#[derive(Clone, Debug)]
pub struct PrinterModel {
    pub condition: PrinterCondition,
    /// Delay from strobe to BUSY rising. `None` models a printer that never raises
    /// BUSY at all.
    pub busy_latency_us: Option<u64>,
    pub busy_duration_us: u64,
    busy_window: Option<(Duration, Duration)>,
    accepted: usize,
    fail_after: Option<(usize, PrinterCondition)>,
    recover_after: Option<Duration>,
    recover_at: Option<Duration>,
}

impl Default for PrinterModel {
    fn default() -> Self {
        Self {
            condition: PrinterCondition::Ok,
            busy_latency_us: Some(1),
            busy_duration_us: 2,
            busy_window: None,
            accepted: 0,
            fail_after: None,
            recover_after: None,
            recover_at: None,
        }
    }
}

impl PrinterModel {
    /// Switch to `condition` once `bytes` bytes have been accepted.
    pub fn fail_after(&mut self, bytes: usize, condition: PrinterCondition) {
        self.fail_after = Some((bytes, condition));
    }

    /// After a scheduled failure, return to `Ok` once `duration` has passed.
    pub fn recover_after(&mut self, duration: Duration) {
        self.recover_after = Some(duration);
    }

    fn tick(&mut self, now: Duration) {
        if let Some(at) = self.recover_at {
            if now >= at {
                self.condition = PrinterCondition::Ok;
                self.recover_at = None;
            }
        }
    }

    fn busy(&self, now: Duration) -> bool {
        match self.busy_window {
            Some((from, until)) => now >= from && now < until,
            None => false,
        }
    }

    fn status(&self, now: Duration) -> u8 {
        match self.condition {
            PrinterCondition::Ok if self.busy(now) => 0x5F,
            PrinterCondition::Ok => 0xDF,
            PrinterCondition::Busy => 0x5F,
            PrinterCondition::OffLine => 0x4F,
            PrinterCondition::PaperEmpty => 0xEF,
            PrinterCondition::PoweredOff => 0x87,
            PrinterCondition::NotConnected => 0x7F,
        }
    }

    fn strobe(&mut self, now: Duration) -> bool {
        if self.condition != PrinterCondition::Ok || self.busy(now) {
            return false;
        }
        self.accepted += 1;

        if let Some((bytes, condition)) = self.fail_after {
            if self.accepted >= bytes {
                self.condition = condition;
                self.fail_after = None;
                self.recover_at = self.recover_after.map(|d| now + d);
            }
        }
        if let Some(latency) = self.busy_latency_us {
            let from = now + Duration::from_micros(latency);
            self.busy_window = Some((from, from + Duration::from_micros(self.busy_duration_us)));
        }
        true
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Compatibility,
    Negotiating,
    Refused,
    Nibble,
    Byte,
    Ecp,
    Epp,
    Terminating,
}

#[derive(Clone, Debug)]
pub struct Peripheral {
    pub caps: PeripheralCaps,
    /// A plain Centronics printer ignores negotiation entirely.
    pub ieee1284: bool,
    /// Leave XFlag where negotiation put it during termination.
    pub stuck_xflag: bool,
    /// Hold PeriphAck asserted, as if stuck in the middle of a forward byte.
    pub hold_periph_ack: bool,
    /// Stop draining the ECP FIFO.
    pub stall_forward: bool,
    /// Stop presenting reverse data after this many bytes.
    pub stall_reverse_after: Option<usize>,
    pub device_id: Option<String>,
    pub reverse_data: VecDeque<u8>,
    pub received: Vec<u8>,
    pub channels: Vec<u8>,
    pub addresses: Vec<u8>,
    pub printer: PrinterModel,
    /// Negotiations the host has started (event 1 seen).
    pub negotiations: usize,

    mode: Mode,
    ext: u8,
    latched: bool,
    xflag: bool,
    term_acked: bool,
    id_stream: Option<VecDeque<u8>>,
    delivered: usize,
    presenting: bool,
    nibble_high: bool,
    ecp_reverse: bool,
    periph_ack: bool,
    epp_wait: bool,
    epp_latch: u8,
}

impl Default for Peripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl Peripheral {
    pub fn new() -> Self {
        Self {
            caps: PeripheralCaps::full(),
            ieee1284: true,
            stuck_xflag: false,
            hold_periph_ack: false,
            stall_forward: false,
            stall_reverse_after: None,
            device_id: Some(DEFAULT_DEVICE_ID.to_string()),
            reverse_data: VecDeque::new(),
            received: Vec::new(),
            channels: Vec::new(),
            addresses: Vec::new(),
            printer: PrinterModel::default(),
            negotiations: 0,
            mode: Mode::Compatibility,
            ext: 0,
            latched: false,
            xflag: false,
            term_acked: false,
            id_stream: None,
            delivered: 0,
            presenting: false,
            nibble_high: false,
            ecp_reverse: false,
            periph_ack: false,
            epp_wait: false,
            epp_latch: 0xFF,
        }
    }

    /// A Centronics printer with no 1284 support.
    pub fn legacy_printer() -> Self {
        Self {
            ieee1284: false,
            device_id: None,
            ..Self::new()
        }
    }

    pub fn in_compatibility(&self) -> bool {
        self.mode == Mode::Compatibility
    }

    pub(crate) fn is_ecp(&self) -> bool {
        self.mode == Mode::Ecp
    }

    pub(crate) fn is_epp(&self) -> bool {
        self.mode == Mode::Epp
    }

    pub(crate) fn in_ecp_reverse(&self) -> bool {
        self.mode == Mode::Ecp && self.ecp_reverse
    }

    /// Drop back to compatibility mode, as on power-up or an nInit pulse.
    pub fn reset(&mut self) {
        if self.mode != Mode::Compatibility {
            log::trace!("peripheral: reset from {:?}", self.mode);
        }
        self.mode = Mode::Compatibility;
        self.latched = false;
        self.term_acked = false;
        self.id_stream = None;
        self.presenting = false;
        self.nibble_high = false;
        self.ecp_reverse = false;
        self.periph_ack = false;
        self.epp_wait = false;
    }

    fn source(&self) -> &VecDeque<u8> {
        self.id_stream.as_ref().unwrap_or(&self.reverse_data)
    }

    fn front(&self) -> u8 {
        self.source().front().copied().unwrap_or(0xFF)
    }

    pub(crate) fn has_reverse_data(&self) -> bool {
        !self.source().is_empty()
    }

    fn stalled(&self) -> bool {
        self.stall_reverse_after.map_or(false, |n| self.delivered >= n)
    }

    fn can_present(&self) -> bool {
        self.has_reverse_data() && !self.stalled()
    }

    pub(crate) fn take_reverse(&mut self) -> Option<u8> {
        if self.stalled() {
            return None;
        }
        let byte = match self.id_stream.as_mut() {
            Some(stream) => stream.pop_front(),
            None => self.reverse_data.pop_front(),
        };
        if byte.is_some() {
            self.delivered += 1;
        }
        byte
    }

    /// Device ID as sent on the wire: a big-endian length that counts itself,
    /// followed by the key string.
    fn id_bytes(id: &str) -> VecDeque<u8> {
        let len = (id.len() + 2) as u16;
        let mut stream: VecDeque<u8> = len.to_be_bytes().into_iter().collect();
        stream.extend(id.bytes());
        stream
    }

    fn finish_negotiation(&mut self) {
        let base = self.ext & !0x04;
        let id_request = self.ext & 0x04 != 0;

        let mut accepted = self.caps.accepts(base);
        if id_request && self.device_id.is_none() {
            accepted = false;
        }
        // Nibble mode is acknowledged with XFlag low.
        self.xflag = if base == 0x00 { !accepted } else { accepted };

        self.mode = match (accepted, base) {
            (false, _) => Mode::Refused,
            (true, 0x00 | 0x08) => Mode::Nibble,
            (true, 0x01) => Mode::Byte,
            (true, 0x10 | 0x18) => Mode::Ecp,
            (true, 0x40) => Mode::Epp,
            _ => Mode::Refused,
        };
        if accepted && id_request {
            self.id_stream = self.device_id.as_deref().map(Self::id_bytes);
        }
        log::trace!("peripheral: negotiated {:#04X} -> {:?}", self.ext, self.mode);
    }

    /// Status lines as the peripheral drives them.
    pub(crate) fn status(&mut self, dcr: u8, now: Duration) -> u8 {
        self.printer.tick(now);
        let xflag = if self.xflag { DSR_SELECT } else { 0 };
        let data_avail = if self.has_reverse_data() { 0 } else { DSR_NOT_FAULT };

        match self.mode {
            Mode::Compatibility => self.printer.status(now),
            // PtrClk low, PError, Select and nFault high.
            Mode::Negotiating => 0xBF,
            Mode::Refused => DSR_NOT_BUSY | DSR_NOT_ACK | DSR_PERROR | xflag | DSR_NOT_FAULT | 0x07,
            Mode::Nibble if self.presenting => {
                let byte = self.front();
                let n = if self.nibble_high { byte >> 4 } else { byte & 0x0F };
                let busy = if n & 0x08 != 0 { 0 } else { DSR_NOT_BUSY };
                busy | ((n & 0x07) << 3) | 0x07
            }
            Mode::Byte if self.presenting => DSR_NOT_BUSY | xflag | 0x07,
            Mode::Nibble | Mode::Byte => {
                let idle = if self.has_reverse_data() { 0 } else { DSR_PERROR };
                DSR_NOT_BUSY | DSR_NOT_ACK | idle | xflag | data_avail | 0x07
            }
            Mode::Ecp if self.ecp_reverse => {
                let presenting = dcr & DCR_AUTOFEED == 0 && self.can_present();
                let ack = if presenting { 0 } else { DSR_NOT_ACK };
                DSR_NOT_BUSY | ack | DSR_SELECT | data_avail | 0x07
            }
            Mode::Ecp => {
                let busy = if self.periph_ack || self.hold_periph_ack {
                    0
                }
                else {
                    DSR_NOT_BUSY
                };
                busy | DSR_NOT_ACK | DSR_PERROR | DSR_SELECT | data_avail | 0x07
            }
            Mode::Epp => {
                let busy = if self.epp_wait { 0 } else { DSR_NOT_BUSY };
                busy | DSR_NOT_ACK | DSR_PERROR | DSR_SELECT | data_avail | 0x06
            }
            Mode::Terminating => {
                let select = if self.stuck_xflag == self.xflag { DSR_SELECT } else { 0 };
                let ack = if self.term_acked { DSR_NOT_ACK } else { 0 };
                DSR_NOT_BUSY | ack | DSR_PERROR | select | DSR_NOT_FAULT | 0x07
            }
        }
    }

    /// What the peripheral drives onto the data lines while the host has them
    /// tristated.
    pub(crate) fn data_lines(&self, dcr: u8) -> u8 {
        match self.mode {
            Mode::Byte if self.presenting => self.front(),
            Mode::Ecp if self.ecp_reverse && dcr & DCR_AUTOFEED == 0 && self.can_present() => self.front(),
            Mode::Epp => self.epp_latch,
            _ => 0xFF,
        }
    }

    pub(crate) fn epp_write(&mut self, address: bool, value: u8) {
        if address {
            self.addresses.push(value);
        }
        else {
            self.received.push(value);
        }
    }

    /// React to a change on the control lines. `ecr_hw` is set when an ECP
    /// chipset, rather than software, is driving the ECP handshake.
    pub(crate) fn control_changed(&mut self, old: u8, new: u8, data: u8, now: Duration, ecr_hw: bool) {
        let rose = |bit: u8| old & bit == 0 && new & bit != 0;
        let fell = |bit: u8| old & bit != 0 && new & bit == 0;

        match self.mode {
            Mode::Compatibility => {
                let active = |dcr: u8| dcr & DCR_SELECT_IN == 0 && dcr & DCR_AUTOFEED != 0;
                if self.ieee1284 && active(new) && !active(old) {
                    self.ext = data;
                    self.latched = false;
                    self.negotiations += 1;
                    self.mode = Mode::Negotiating;
                }
                else if rose(DCR_STROBE) && self.printer.strobe(now) {
                    self.received.push(data);
                }
            }
            Mode::Negotiating => {
                if new & DCR_SELECT_IN != 0 {
                    log::trace!("peripheral: negotiation aborted");
                    self.mode = Mode::Compatibility;
                }
                else if rose(DCR_STROBE) {
                    self.latched = true;
                }
                else if self.latched && new & (DCR_STROBE | DCR_AUTOFEED) == 0 {
                    self.finish_negotiation();
                }
            }
            Mode::Epp => {
                if fell(DCR_NOT_INIT) {
                    self.reset();
                    return;
                }
                if rose(DCR_SELECT_IN) {
                    if new & DCR_STROBE != 0 {
                        self.addresses.push(data);
                    }
                    self.epp_wait = true;
                }
                if rose(DCR_AUTOFEED) {
                    if new & DCR_STROBE != 0 {
                        self.received.push(data);
                    }
                    else {
                        self.epp_latch = self.take_reverse().unwrap_or(0xFF);
                    }
                    self.epp_wait = true;
                }
                if fell(DCR_SELECT_IN) || fell(DCR_AUTOFEED) {
                    self.epp_wait = false;
                }
            }
            Mode::Terminating => {
                if rose(DCR_AUTOFEED) {
                    self.term_acked = true;
                }
                else if self.term_acked && fell(DCR_AUTOFEED) {
                    self.reset();
                }
            }
            Mode::Refused | Mode::Nibble | Mode::Byte | Mode::Ecp if rose(DCR_SELECT_IN) => {
                self.mode = Mode::Terminating;
                self.term_acked = false;
                self.presenting = false;
                self.ecp_reverse = false;
            }
            Mode::Refused => {}
            Mode::Nibble => {
                if rose(DCR_AUTOFEED) {
                    self.presenting = self.can_present();
                }
                else if fell(DCR_AUTOFEED) && self.presenting {
                    self.presenting = false;
                    if self.nibble_high {
                        self.take_reverse();
                    }
                    self.nibble_high = !self.nibble_high;
                }
            }
            Mode::Byte => {
                if rose(DCR_AUTOFEED) {
                    self.presenting = self.can_present();
                }
                else if fell(DCR_AUTOFEED) && self.presenting {
                    self.presenting = false;
                    self.take_reverse();
                }
            }
            Mode::Ecp => {
                if fell(DCR_NOT_INIT) && new & DCR_DIRECTION != 0 {
                    self.ecp_reverse = true;
                }
                if rose(DCR_NOT_INIT) {
                    self.ecp_reverse = false;
                }
                if ecr_hw {
                    return;
                }

                if fell(DCR_STROBE) && !self.ecp_reverse && new & DCR_DIRECTION == 0 {
                    if new & DCR_AUTOFEED != 0 {
                        self.received.push(data);
                    }
                    else if data & 0x80 != 0 {
                        self.channels.push(data & 0x7F);
                    }
                    self.periph_ack = true;
                }
                if rose(DCR_STROBE) {
                    self.periph_ack = false;
                }
                if rose(DCR_AUTOFEED) && self.ecp_reverse && self.can_present() {
                    self.take_reverse();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEUTRAL: u8 = DCR_NEUTRAL;
    const EVENT1: u8 = DCR_RESERVED | DCR_NOT_INIT | DCR_AUTOFEED;

    fn negotiate(p: &mut Peripheral, ext: u8) {
        let now = Duration::ZERO;
        p.control_changed(NEUTRAL, EVENT1, ext, now, false);
        p.control_changed(EVENT1, EVENT1 | DCR_STROBE, ext, now, false);
        p.control_changed(EVENT1 | DCR_STROBE, DCR_RESERVED | DCR_NOT_INIT, ext, now, false);
    }

    #[test]
    fn nibble_acceptance_uses_low_xflag() {
        let mut p = Peripheral::new();
        negotiate(&mut p, 0x00);
        assert_eq!(p.status(DCR_NOT_INIT, Duration::ZERO) & DSR_SELECT, 0);

        let mut p = Peripheral::new();
        negotiate(&mut p, 0x10);
        assert!(p.is_ecp());
        assert_ne!(p.status(DCR_NOT_INIT, Duration::ZERO) & DSR_SELECT, 0);
    }

    #[test]
    fn device_id_stream_is_length_prefixed() {
        let mut p = Peripheral::new();
        p.device_id = Some("MFG:A;".to_string());
        negotiate(&mut p, 0x04);
        let mut bytes = Vec::new();
        while let Some(b) = p.take_reverse() {
            bytes.push(b);
        }
        assert_eq!(bytes, b"\x00\x08MFG:A;".to_vec());
    }

    #[test]
    fn missing_device_id_refuses_request() {
        let mut p = Peripheral::legacy_printer();
        p.ieee1284 = true;
        negotiate(&mut p, 0x04);
        assert_eq!(p.mode, Mode::Refused);
    }

    #[test]
    fn printer_goes_busy_after_strobe() {
        let mut printer = PrinterModel::default();
        assert!(printer.strobe(Duration::ZERO));
        assert_eq!(printer.status(Duration::from_micros(2)), 0x5F);
        assert_eq!(printer.status(Duration::from_micros(5)), 0xDF);
    }
}
