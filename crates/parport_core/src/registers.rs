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

    registers.rs

    Register offsets, bit definitions and signal patterns for a PC parallel
    port. The Status (DSR) and Control (DCR) registers carry the IEEE 1284
    handshake lines; their meaning changes with the active transfer mode, so
    the aliases for each mode are listed next to the compatibility-mode name.

*/

use modular_bitfield::prelude::*;

pub const DATA_OFFSET: u16 = 0;
pub const DSR_OFFSET: u16 = 1;
pub const DCR_OFFSET: u16 = 2;
pub const EPP_ADDRESS_OFFSET: u16 = 3;
pub const EPP_DATA_OFFSET: u16 = 4;

// ECP registers are addressed from the ECR base, conventionally base + 0x400.
pub const ECP_FIFO_OFFSET: u16 = 0x400;
pub const ECP_CONFIG_B_OFFSET: u16 = 0x401;
pub const ECR_OFFSET: u16 = 0x402;

pub const DSR_NOT_BUSY: u8 = 0x80; // Periph ack, Wait
pub const DSR_NOT_ACK: u8 = 0x40; // PtrClk, PeriphClk, Intr
pub const DSR_PERROR: u8 = 0x20; // AckDataReq, nAckReverse
pub const DSR_SELECT: u8 = 0x10; // XFlag
pub const DSR_NOT_FAULT: u8 = 0x08; // nDataAvail, nPeriphRequest

pub const DCR_RESERVED: u8 = 0xC0;
pub const DCR_DIRECTION: u8 = 0x20;
pub const DCR_SELECT_IN: u8 = 0x08; // 1284 Active, nAStrb
pub const DCR_NOT_INIT: u8 = 0x04; // nReverseRequest
pub const DCR_AUTOFEED: u8 = 0x02; // HostBusy, HostAck, nDStrb
pub const DCR_STROBE: u8 = 0x01; // HostClk, nWrite

/// Control register value for an idle port in compatibility mode.
pub const DCR_NEUTRAL: u8 = DCR_RESERVED | DCR_SELECT_IN | DCR_NOT_INIT;

pub const ECR_FIFO_MASK: u8 = 0x03;
pub const ECR_FIFO_EMPTY: u8 = 0x01;
pub const ECR_FIFO_FULL: u8 = 0x02;
pub const ECR_FIFO_SOME: u8 = 0x00;
pub const ECR_SERVICE_INTR: u8 = 0x04;
pub const ECR_ERRINT_DISABLED: u8 = 0x10;
pub const ECR_MODE_MASK: u8 = 0xE0;

/// A register reachable through the hardware access layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Register {
    Data,
    Status,
    Control,
    EppAddress,
    EppData,
    EcpFifo,
    EcpConfigB,
    Ecr,
}

impl Register {
    pub fn offset(&self) -> u16 {
        match self {
            Register::Data => DATA_OFFSET,
            Register::Status => DSR_OFFSET,
            Register::Control => DCR_OFFSET,
            Register::EppAddress => EPP_ADDRESS_OFFSET,
            Register::EppData => EPP_DATA_OFFSET,
            Register::EcpFifo => ECP_FIFO_OFFSET,
            Register::EcpConfigB => ECP_CONFIG_B_OFFSET,
            Register::Ecr => ECR_OFFSET,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Register::Data => "Data",
            Register::Status => "DSR",
            Register::Control => "DCR",
            Register::EppAddress => "EPP address",
            Register::EppData => "EPP data",
            Register::EcpFifo => "ECP FIFO",
            Register::EcpConfigB => "ECP config B",
            Register::Ecr => "ECR",
        }
    }
}

/// Status register bits as seen in compatibility mode.
#[bitfield]
#[derive(Copy, Clone, Default)]
pub struct DeviceStatus {
    #[skip]
    pub unused: B3,
    pub not_fault: bool,
    pub select: bool,
    pub paper_error: bool,
    pub not_ack: bool,
    pub not_busy: bool,
}

impl DeviceStatus {
    pub fn from_dsr(dsr: u8) -> Self {
        DeviceStatus::from_bytes([dsr])
    }
}

/// Control register bits. Note the strobe, autofeed and select-in lines are inverted
/// on the cable, so a set bit drives the wire low.
#[bitfield]
#[derive(Copy, Clone, Default)]
pub struct DeviceControl {
    pub strobe: bool,
    pub autofeed: bool,
    pub not_init: bool,
    pub select_in: bool,
    pub ack_int: bool,
    pub direction: bool,
    #[skip]
    pub reserved: B2,
}

impl DeviceControl {
    pub fn from_dcr(dcr: u8) -> Self {
        DeviceControl::from_bytes([dcr])
    }
}

/// The desired state of a single handshake line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Active,
    Inactive,
    DontCare,
}

pub use Signal::{Active, DontCare, Inactive};

/// Direction bit values for [update_dcr].
pub const DIR_READ: Signal = Active;
pub const DIR_WRITE: Signal = Inactive;

/// A mask/value pair describing an expected status register pattern.
///
/// The BUSY line is inverted by the port hardware, so `busy: Active` matches a clear
/// bit 7. Every other line is register-literal: `Active` matches a set bit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DsrPattern {
    pub mask:  u8,
    pub value: u8,
}

impl DsrPattern {
    pub const fn new(busy: Signal, ack: Signal, perror: Signal, select: Signal, fault: Signal) -> Self {
        let mut mask = 0;
        let mut value = 0;

        match busy {
            Active => mask |= DSR_NOT_BUSY,
            Inactive => {
                mask |= DSR_NOT_BUSY;
                value |= DSR_NOT_BUSY;
            }
            DontCare => {}
        }

        let lines = [(ack, DSR_NOT_ACK), (perror, DSR_PERROR), (select, DSR_SELECT), (fault, DSR_NOT_FAULT)];
        let mut i = 0;
        while i < lines.len() {
            let (signal, bit) = lines[i];
            match signal {
                Active => {
                    mask |= bit;
                    value |= bit;
                }
                Inactive => mask |= bit,
                DontCare => {}
            }
            i += 1;
        }

        DsrPattern { mask, value }
    }

    #[inline]
    pub fn matches(&self, dsr: u8) -> bool {
        dsr & self.mask == self.value
    }
}

impl Signal {
    #[inline]
    fn level(self) -> Option<bool> {
        match self {
            Active => Some(true),
            Inactive => Some(false),
            DontCare => None,
        }
    }
}

/// Produce a new control register value from `dcr`, changing each line as requested.
pub fn update_dcr(
    dcr: u8,
    direction: Signal,
    ack_int: Signal,
    select_in: Signal,
    init: Signal,
    autofeed: Signal,
    strobe: Signal,
) -> u8 {
    let mut control = DeviceControl::from_dcr(dcr);
    if let Some(level) = direction.level() {
        control.set_direction(level);
    }
    if let Some(level) = ack_int.level() {
        control.set_ack_int(level);
    }
    if let Some(level) = select_in.level() {
        control.set_select_in(level);
    }
    if let Some(level) = init.level() {
        control.set_not_init(level);
    }
    if let Some(level) = autofeed.level() {
        control.set_autofeed(level);
    }
    if let Some(level) = strobe.level() {
        control.set_strobe(level);
    }
    control.into_bytes()[0]
}

/// Operating modes of an ECP-capable port, selected through the ECR.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EcrMode {
    Spp = 0,
    Byte = 1,
    Ecp = 3,
}

impl EcrMode {
    /// Full ECR value selecting this mode with error and service interrupts masked.
    pub fn ecr_value(self) -> u8 {
        ((self as u8) << 5) | ECR_ERRINT_DISABLED | ECR_SERVICE_INTR
    }

    pub fn from_ecr(ecr: u8) -> Option<EcrMode> {
        match (ecr & ECR_MODE_MASK) >> 5 {
            0 => Some(EcrMode::Spp),
            1 => Some(EcrMode::Byte),
            3 => Some(EcrMode::Ecp),
            _ => None,
        }
    }
}
