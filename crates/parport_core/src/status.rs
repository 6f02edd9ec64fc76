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

    status.rs

    Classification of the compatibility-mode status register into printer
    conditions. Used by the forward write path to report the specific reason a
    peripheral stopped accepting data.

*/

use std::fmt::Display;

use crate::registers::DeviceStatus;

/// The condition of a compatibility-mode peripheral as read from the status register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrinterCondition {
    Ok,
    OffLine,
    PaperEmpty,
    PoweredOff,
    NotConnected,
    Busy,
}

impl Display for PrinterCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PrinterCondition::Ok => write!(f, "ready"),
            PrinterCondition::OffLine => write!(f, "off line"),
            PrinterCondition::PaperEmpty => write!(f, "out of paper"),
            PrinterCondition::PoweredOff => write!(f, "powered off"),
            PrinterCondition::NotConnected => write!(f, "not connected"),
            PrinterCondition::Busy => write!(f, "busy"),
        }
    }
}

impl PrinterCondition {
    /// True for conditions the write path waits out rather than fails on immediately.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PrinterCondition::Ok)
    }
}

pub fn printer_online(dsr: u8) -> bool {
    let s = DeviceStatus::from_dsr(dsr);
    s.not_fault() && s.not_busy() && s.select() && !s.paper_error()
}

pub fn printer_ok(dsr: u8) -> bool {
    let s = DeviceStatus::from_dsr(dsr);
    s.not_fault() && s.not_busy() && !s.paper_error()
}

pub fn printer_busy(dsr: u8) -> bool {
    let s = DeviceStatus::from_dsr(dsr);
    !s.not_busy() && s.not_fault()
}

pub fn printer_paper_empty(dsr: u8) -> bool {
    DeviceStatus::from_dsr(dsr).paper_error()
}

pub fn printer_off_line(dsr: u8) -> bool {
    let s = DeviceStatus::from_dsr(dsr);
    s.not_fault() && !s.not_busy() && !s.select()
}

pub fn printer_powered_off(dsr: u8) -> bool {
    let s = DeviceStatus::from_dsr(dsr);
    !s.not_fault() && !s.not_ack() && s.not_busy()
}

pub fn printer_not_connected(dsr: u8) -> bool {
    let s = DeviceStatus::from_dsr(dsr);
    s.not_fault() && s.not_busy() && !s.select()
}

/// All status lines floating high except BUSY, the signature of an unplugged cable.
pub fn printer_no_cable(dsr: u8) -> bool {
    let s = DeviceStatus::from_dsr(dsr);
    !s.not_busy() && s.not_ack() && s.paper_error() && s.select() && s.not_fault()
}

/// Classify a status byte. The order matters: an unplugged cable also looks like
/// paper-out, and a powered-off printer drags BUSY and ACK in odd directions.
pub fn classify(dsr: u8) -> PrinterCondition {
    if printer_online(dsr) {
        PrinterCondition::Ok
    }
    else if printer_no_cable(dsr) {
        PrinterCondition::NotConnected
    }
    else if printer_paper_empty(dsr) {
        PrinterCondition::PaperEmpty
    }
    else if printer_powered_off(dsr) {
        PrinterCondition::PoweredOff
    }
    else if printer_off_line(dsr) {
        PrinterCondition::OffLine
    }
    else if printer_not_connected(dsr) {
        PrinterCondition::NotConnected
    }
    else {
        PrinterCondition::Busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_status_codes() {
        assert_eq!(classify(0xDF), PrinterCondition::Ok);
        assert_eq!(classify(0xEF), PrinterCondition::PaperEmpty);
        assert_eq!(classify(0x87), PrinterCondition::PoweredOff);
        assert_eq!(classify(0x7F), PrinterCondition::NotConnected);
        assert_eq!(classify(0xCF), PrinterCondition::NotConnected);
        assert_eq!(classify(0x4F), PrinterCondition::OffLine);
    }

    #[test]
    fn busy_printer_is_not_an_error() {
        // BUSY asserted, everything else healthy.
        assert_eq!(classify(0x5F), PrinterCondition::Busy);
        assert!(printer_busy(0x5F));
        assert!(!printer_ok(0x5F));
    }
}
