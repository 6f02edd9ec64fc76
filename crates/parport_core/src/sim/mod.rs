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

    sim::mod.rs

    A simulated parallel port and cable. SimulatedPort implements PortIo over a
    shared state holding the end-of-chain peripheral, any IEEE 1284.3
    daisy-chain devices in front of it, an optional legacy Zip drive and the
    ECP FIFO. The handle is cheap to clone so tests can inspect what the
    peripherals saw while a driver owns the port.

*/

mod clock;
mod peripheral;

pub use clock::FakeClock;
pub use peripheral::{Peripheral, PeripheralCaps, PrinterModel};

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    modes::epp::DSR_EPP_TIMEOUT,
    port_io::{Clock, PortIo},
    registers::*,
};

pub const SIM_FIFO_DEPTH: usize = 16;

const QUALIFIER_LEAD: [u8; 4] = [0xAA, 0x55, 0x00, 0xFF];

/// Flavours of device that can sit in front of the end-of-chain peripheral.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainDeviceKind {
    /// A plain 1284.3 device.
    Standard,
    /// A Shuttle adapter that answers the 1284.3 countdown.
    Shuttle1284_3,
    /// A Shuttle adapter that only answers the product ID query.
    ShuttleLegacy(u16),
}

#[derive(Clone, Debug)]
pub struct ChainDevice {
    pub kind: ChainDeviceKind,
    pub address: Option<u8>,
    pub peripheral: Peripheral,
}

/// Points in the 1284.3 mode qualifier where the chain reports status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QualifierStage {
    /// After the four lead bytes.
    Lead,
    /// After the 0x87 check byte.
    Check,
    /// After the 0x78 byte, before any command.
    Accept,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum Qualifier {
    #[default]
    Idle,
    Lead(usize),
    Armed,
    Checked,
    Command,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum Command {
    #[default]
    None,
    Assign(u8),
    Select(u8),
    Selected(bool),
    Deselect,
    ProductId { index: usize, step: u8 },
    Countdown { index: usize, count: Option<u8>, armed: bool },
}

/// Parallel-port Zip drive. It sits behind everything else and only wakes up for
/// its own select sequence.
#[derive(Clone, Debug, Default)]
struct LegacyZip {
    history: Vec<u8>,
    selected: bool,
}

impl LegacyZip {
    fn latch(&mut self, byte: u8) {
        self.history.push(byte);
        if self.history.ends_with(&[0x00, 0x3C, 0x20, 0x8F]) {
            log::trace!("sim: zip deselected");
            self.selected = false;
            self.history.clear();
        }
        else if self.history.ends_with(&[0x00, 0x3C, 0x20]) {
            log::trace!("sim: zip selected");
            self.selected = true;
        }
        if self.history.len() > 16 {
            self.history.drain(..8);
        }
    }

    fn status(&self, dcr: u8) -> u8 {
        let fault = if dcr & DCR_AUTOFEED != 0 { DSR_NOT_FAULT } else { 0 };
        0xF7 | fault
    }
}

pub struct SimState {
    clock: FakeClock,
    data: u8,
    dcr: u8,
    ecr: u8,
    fifo: VecDeque<u8>,
    fifo_depth: usize,
    eoc: Peripheral,
    chain: Vec<ChainDevice>,
    selected: Option<usize>,
    qualifier: Qualifier,
    command: Command,
    cpp_commands: Vec<u8>,
    status_override: Option<(QualifierStage, u8)>,
    epp_unacked: bool,
    epp_timeout: bool,
    zip: Option<LegacyZip>,
    wide_transfers: usize,
}

fn target_of<'a>(chain: &'a mut [ChainDevice], eoc: &'a mut Peripheral, selected: Option<usize>) -> &'a mut Peripheral {
    match selected {
        Some(i) if i < chain.len() => &mut chain[i].peripheral,
        _ => eoc,
    }
}

impl SimState {
    fn new(clock: FakeClock) -> Self {
        Self {
            clock,
            data: 0,
            dcr: DCR_NEUTRAL,
            ecr: EcrMode::Spp.ecr_value(),
            fifo: VecDeque::new(),
            fifo_depth: SIM_FIFO_DEPTH,
            eoc: Peripheral::new(),
            chain: Vec::new(),
            selected: None,
            qualifier: Qualifier::Idle,
            command: Command::None,
            cpp_commands: Vec::new(),
            status_override: None,
            epp_unacked: false,
            epp_timeout: false,
            zip: None,
            wide_transfers: 0,
        }
    }

    fn target(&mut self) -> &mut Peripheral {
        target_of(&mut self.chain, &mut self.eoc, self.selected)
    }

    fn ecr_hw(&self) -> bool {
        EcrMode::from_ecr(self.ecr) == Some(EcrMode::Ecp)
    }

    /// The chain devices snoop the data lines while the selected peripheral idles in
    /// compatibility mode with 1284 Active low.
    fn qualifier_listening(&mut self) -> bool {
        !self.chain.is_empty() && self.dcr & DCR_SELECT_IN == 0 && self.target().in_compatibility()
    }

    fn legacy_present(&self) -> bool {
        self.chain
            .iter()
            .any(|d| matches!(d.kind, ChainDeviceKind::ShuttleLegacy(_)))
    }

    fn qualifier_write(&mut self, byte: u8) {
        self.qualifier = match self.qualifier {
            Qualifier::Idle | Qualifier::Lead(_) => {
                let matched = match self.qualifier {
                    Qualifier::Lead(n) => n,
                    _ => 0,
                };
                if byte == QUALIFIER_LEAD[matched] {
                    if matched + 1 == QUALIFIER_LEAD.len() {
                        Qualifier::Armed
                    }
                    else {
                        Qualifier::Lead(matched + 1)
                    }
                }
                else if byte == QUALIFIER_LEAD[0] {
                    Qualifier::Lead(1)
                }
                else {
                    Qualifier::Idle
                }
            }
            Qualifier::Armed if byte == 0x87 => Qualifier::Checked,
            Qualifier::Checked if byte == 0x78 => {
                self.command = Command::None;
                Qualifier::Command
            }
            Qualifier::Command if byte == 0xFF => Qualifier::Idle,
            Qualifier::Command => {
                self.cpp_commands.push(byte);
                self.command_byte(byte);
                Qualifier::Command
            }
            _ if byte == QUALIFIER_LEAD[0] => Qualifier::Lead(1),
            _ => Qualifier::Idle,
        };
    }

    fn command_byte(&mut self, byte: u8) {
        let index = (byte & 0x07) as usize;
        self.command = match (byte & 0xF8, self.command) {
            (0x88, Command::Countdown { index: i, count, armed: true }) if i == index => Command::Countdown {
                index,
                count: Some(count.map_or(0, |c| (c + 1).min(15))),
                armed: false,
            },
            (0x88, _) => Command::Countdown {
                index,
                count: None,
                armed: false,
            },
            (0x80, Command::Countdown { index: i, count, .. }) if i == index => Command::Countdown {
                index,
                count,
                armed: true,
            },
            _ if byte & 0xF0 == 0xE0 => Command::Select(byte & 0x0F),
            _ if byte == 0x30 => Command::Deselect,
            _ if byte & 0xF0 == 0x10 => Command::ProductId {
                index: (byte & 0x0F) as usize,
                step: 0,
            },
            _ if byte < 0x04 => Command::Assign(byte),
            (_, current) => current,
        };
    }

    fn command_strobe(&mut self) {
        match self.command {
            Command::Assign(k) => {
                if let Some(device) = self.chain.get_mut(k as usize) {
                    device.address = Some(k);
                }
            }
            Command::Select(id) => {
                let found = self.chain.iter().position(|d| d.address == Some(id));
                if found.is_some() {
                    self.selected = found;
                }
                log::trace!("sim: select {} -> {:?}", id, found);
                self.command = Command::Selected(found.is_some());
            }
            Command::Deselect => {
                self.selected = None;
            }
            Command::ProductId { index, step } => {
                self.command = Command::ProductId {
                    index,
                    step: step.saturating_add(1),
                };
            }
            _ => {}
        }
    }

    fn command_status(&self) -> u8 {
        match self.command {
            Command::Assign(k) => {
                let last = self.chain.len().checked_sub(1) == Some(k as usize)
                    && !matches!(self.chain[k as usize].kind, ChainDeviceKind::ShuttleLegacy(_));
                if last {
                    0x7F
                }
                else {
                    0xFF
                }
            }
            Command::Selected(true) => 0xFF,
            Command::Selected(false) | Command::Deselect => 0xF7,
            Command::ProductId { index, step } => {
                let pid = match self.chain.get(index).map(|d| d.kind) {
                    Some(ChainDeviceKind::ShuttleLegacy(pid)) => pid,
                    _ => 0xFFFF,
                };
                let [hi, lo] = pid.to_be_bytes();
                let nibble = match step {
                    0 => lo >> 4,
                    1 => lo & 0x0F,
                    2 => hi >> 4,
                    _ => hi & 0x0F,
                };
                (nibble << 4) | 0x0F
            }
            Command::Countdown {
                index,
                count: Some(k),
                ..
            } if matches!(self.chain.get(index).map(|d| d.kind), Some(ChainDeviceKind::Shuttle1284_3)) => {
                let p = 0xF0u8.saturating_sub(k << 4);
                (p & 0x80) | ((p & 0x70) >> 1) | 0x07
            }
            Command::Countdown { .. } => 0x07,
            _ => 0xFF,
        }
    }

    fn stage_override(&self, stage: QualifierStage) -> Option<u8> {
        match self.status_override {
            Some((s, value)) if s == stage => Some(value),
            _ => None,
        }
    }

    fn status(&mut self) -> u8 {
        let stage = match (self.qualifier, self.command) {
            (Qualifier::Armed, _) => Some(QualifierStage::Lead),
            (Qualifier::Checked, _) => Some(QualifierStage::Check),
            (Qualifier::Command, Command::None) => Some(QualifierStage::Accept),
            _ => None,
        };
        if let Some(value) = stage.and_then(|s| self.stage_override(s)) {
            return value;
        }
        match self.qualifier {
            Qualifier::Armed => return 0xFF,
            Qualifier::Checked => return if self.legacy_present() { 0x1F } else { 0x5F },
            Qualifier::Command => return self.command_status(),
            _ => {}
        }
        if let Some(zip) = &self.zip {
            if zip.selected {
                return zip.status(self.dcr);
            }
        }
        let (dcr, now) = (self.dcr, self.clock.now());
        self.target().status(dcr, now)
    }

    fn write_data(&mut self, value: u8) {
        self.data = value;
        if self.ecr_hw() && self.dcr & DCR_DIRECTION == 0 {
            // Data register writes in ECP mode go out as command bytes.
            let target = self.target();
            if target.is_ecp() {
                if value & 0x80 != 0 {
                    target.channels.push(value & 0x7F);
                }
                return;
            }
        }
        if self.qualifier_listening() || self.qualifier != Qualifier::Idle {
            self.qualifier_write(value);
        }
    }

    fn write_control(&mut self, value: u8) {
        let old = self.dcr;
        self.dcr = value | DCR_RESERVED;
        let new = self.dcr;

        if self.qualifier == Qualifier::Command {
            if old & DCR_STROBE == 0 && new & DCR_STROBE != 0 {
                self.command_strobe();
            }
            return;
        }

        if old & DCR_AUTOFEED == 0 && new & DCR_AUTOFEED != 0 {
            if let Some(zip) = self.zip.as_mut() {
                zip.latch(self.data);
            }
        }

        let (data, now, hw) = (self.data, self.clock.now(), self.ecr_hw());
        self.target().control_changed(old, new, data, now, hw);
    }

    fn write_ecr(&mut self, value: u8) {
        let was_ecp = self.ecr_hw();
        self.ecr = value & !ECR_FIFO_MASK;
        if was_ecp && !self.ecr_hw() {
            self.fifo.clear();
        }
    }

    /// Move reverse data into the FIFO the way an ECP chipset prefetches it.
    fn top_up_fifo(&mut self) {
        if !self.ecr_hw() || self.dcr & DCR_DIRECTION == 0 {
            return;
        }
        let depth = self.fifo_depth;
        let target = target_of(&mut self.chain, &mut self.eoc, self.selected);
        if !target.in_ecp_reverse() {
            return;
        }
        while self.fifo.len() < depth {
            match target.take_reverse() {
                Some(byte) => self.fifo.push_back(byte),
                None => break,
            }
        }
    }

    fn write_fifo(&mut self, value: u8) {
        if !self.ecr_hw() || self.dcr & DCR_DIRECTION != 0 {
            return;
        }
        let depth = self.fifo_depth;
        let target = target_of(&mut self.chain, &mut self.eoc, self.selected);
        if !target.is_ecp() {
            return;
        }
        if target.stall_forward {
            if self.fifo.len() < depth {
                self.fifo.push_back(value);
            }
        }
        else {
            target.received.push(value);
        }
    }

    fn read_ecr(&mut self) -> u8 {
        self.top_up_fifo();
        let flags = if self.fifo.is_empty() {
            ECR_FIFO_EMPTY
        }
        else if self.fifo.len() >= self.fifo_depth {
            ECR_FIFO_FULL
        }
        else {
            ECR_FIFO_SOME
        };
        (self.ecr & !ECR_FIFO_MASK) | flags
    }

    pub fn read(&mut self, reg: Register) -> u8 {
        match reg {
            Register::Data => {
                if self.dcr & DCR_DIRECTION != 0 {
                    let dcr = self.dcr;
                    self.target().data_lines(dcr)
                }
                else {
                    self.data
                }
            }
            Register::Status => {
                let timeout = if self.epp_timeout { DSR_EPP_TIMEOUT } else { 0 };
                self.status() | timeout
            }
            Register::Control => self.dcr,
            Register::EppData if self.epp_unacked => {
                self.epp_timeout = true;
                0xFF
            }
            Register::EppData => {
                let target = self.target();
                if target.is_epp() {
                    target.take_reverse().unwrap_or(0xFF)
                }
                else {
                    0xFF
                }
            }
            Register::EppAddress | Register::EcpConfigB => 0,
            Register::EcpFifo => {
                self.top_up_fifo();
                self.fifo.pop_front().unwrap_or(0xFF)
            }
            Register::Ecr => self.read_ecr(),
        }
    }

    pub fn write(&mut self, reg: Register, value: u8) {
        match reg {
            Register::Data => self.write_data(value),
            // The timeout latch clears when its bit is written back as one.
            Register::Status => {
                if value & DSR_EPP_TIMEOUT != 0 {
                    self.epp_timeout = false;
                }
            }
            Register::Control => self.write_control(value),
            Register::EppAddress | Register::EppData if self.epp_unacked => {
                self.epp_timeout = true;
            }
            Register::EppAddress | Register::EppData => {
                let target = self.target();
                if target.is_epp() {
                    target.epp_write(reg == Register::EppAddress, value);
                }
            }
            Register::EcpFifo => self.write_fifo(value),
            Register::EcpConfigB => {}
            Register::Ecr => self.write_ecr(value),
        }
    }
}

/// Shared handle to a simulated port. Clones refer to the same cable.
#[derive(Clone)]
pub struct SimulatedPort {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPort {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(clock))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_fifo_depth(&self, depth: usize) {
        self.lock().fifo_depth = depth;
    }

    pub fn with_end_of_chain<R>(&self, f: impl FnOnce(&mut Peripheral) -> R) -> R {
        f(&mut self.lock().eoc)
    }

    pub fn with_device<R>(&self, index: usize, f: impl FnOnce(&mut Peripheral) -> R) -> Option<R> {
        self.lock().chain.get_mut(index).map(|d| f(&mut d.peripheral))
    }

    /// Insert a daisy-chain device. Devices are ordered from the host outwards.
    pub fn add_chain_device(&self, kind: ChainDeviceKind, peripheral: Peripheral) -> usize {
        let mut state = self.lock();
        state.chain.push(ChainDevice {
            kind,
            address: None,
            peripheral,
        });
        state.chain.len() - 1
    }

    pub fn attach_legacy_zip(&self) {
        self.lock().zip = Some(LegacyZip::default());
    }

    /// Make the chain report `status` at one point of the mode qualifier instead of
    /// its normal answer.
    pub fn override_qualifier_status(&self, stage: QualifierStage, status: u8) {
        self.lock().status_override = Some((stage, status));
    }

    /// While set, EPP cycles go unacknowledged and latch the port's timeout bit.
    pub fn stall_epp_cycles(&self, stall: bool) {
        self.lock().epp_unacked = stall;
    }

    /// Every byte the chain took as a CPP command, in order.
    pub fn cpp_commands(&self) -> Vec<u8> {
        self.lock().cpp_commands.clone()
    }

    pub fn legacy_zip_selected(&self) -> bool {
        self.lock().zip.as_ref().map_or(false, |z| z.selected)
    }

    /// Address of the currently selected chain device, if any.
    pub fn selected(&self) -> Option<u8> {
        let state = self.lock();
        state
            .selected
            .and_then(|i| state.chain.get(i))
            .and_then(|d| d.address)
    }

    pub fn device_address(&self, index: usize) -> Option<u8> {
        self.lock().chain.get(index).and_then(|d| d.address)
    }

    pub fn end_of_chain_received(&self) -> Vec<u8> {
        self.lock().eoc.received.clone()
    }

    pub fn end_of_chain_channels(&self) -> Vec<u8> {
        self.lock().eoc.channels.clone()
    }

    pub fn end_of_chain_addresses(&self) -> Vec<u8> {
        self.lock().eoc.addresses.clone()
    }

    pub fn end_of_chain_in_compatibility(&self) -> bool {
        self.lock().eoc.in_compatibility()
    }

    pub fn device_received(&self, index: usize) -> Vec<u8> {
        self.lock()
            .chain
            .get(index)
            .map(|d| d.peripheral.received.clone())
            .unwrap_or_default()
    }

    /// Power-cycle every peripheral on the cable.
    pub fn reset_peripherals(&self) {
        let mut state = self.lock();
        state.eoc.reset();
        for device in state.chain.iter_mut() {
            device.peripheral.reset();
        }
        state.qualifier = Qualifier::Idle;
        state.command = Command::None;
        state.fifo.clear();
    }

    /// Number of 32-bit words moved through the wide transfer path.
    pub fn wide_transfers(&self) -> usize {
        self.lock().wide_transfers
    }
}

impl PortIo for SimulatedPort {
    fn read(&mut self, reg: Register) -> u8 {
        self.lock().read(reg)
    }

    fn write(&mut self, reg: Register, value: u8) {
        self.lock().write(reg, value)
    }

    fn read_buffer_u32(&mut self, reg: Register, buf: &mut [u32]) {
        let mut state = self.lock();
        state.wide_transfers += buf.len();
        for word in buf.iter_mut() {
            let mut bytes = [0u8; 4];
            for b in bytes.iter_mut() {
                *b = state.read(reg);
            }
            *word = u32::from_le_bytes(bytes);
        }
    }

    fn write_buffer_u32(&mut self, reg: Register, buf: &[u32]) {
        let mut state = self.lock();
        state.wide_transfers += buf.len();
        for word in buf {
            for b in word.to_le_bytes() {
                state.write(reg, b);
            }
        }
    }
}
