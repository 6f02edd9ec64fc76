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

    port_io.rs

    The hardware access layer boundary. PortIo is the raw register interface a
    platform provides; Clock supplies the monotonic counter and stall
    primitive. SignalIo wraps both and implements the bounded status waits
    every handshake is built from.

*/

use std::{sync::Arc, time::Duration};

use web_time::Instant;

use crate::{
    config::{DriverConfig, PortConfig},
    registers::*,
    tracelogger::TraceLogger,
};

/// Raw register access for one physical port.
pub trait PortIo: Send {
    fn read(&mut self, reg: Register) -> u8;
    fn write(&mut self, reg: Register, value: u8);

    fn read_buffer(&mut self, reg: Register, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte = self.read(reg);
        }
    }

    fn write_buffer(&mut self, reg: Register, buf: &[u8]) {
        for byte in buf {
            self.write(reg, *byte);
        }
    }

    /// 32-bit wide transfer for EPP ports that support it. The default splits each
    /// word into little-endian byte accesses.
    fn read_buffer_u32(&mut self, reg: Register, buf: &mut [u32]) {
        for word in buf.iter_mut() {
            let mut bytes = [0u8; 4];
            self.read_buffer(reg, &mut bytes);
            *word = u32::from_le_bytes(bytes);
        }
    }

    fn write_buffer_u32(&mut self, reg: Register, buf: &[u32]) {
        for word in buf {
            self.write_buffer(reg, &word.to_le_bytes());
        }
    }
}

/// Monotonic time source and processor stall.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
    /// Busy-wait without yielding the processor.
    fn stall_us(&self, us: u64);
    /// Yield the thread for at least `duration`.
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn stall_us(&self, us: u64) {
        let end = Instant::now() + Duration::from_micros(us);
        while Instant::now() < end {
            std::hint::spin_loop();
        }
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Current state of the ECP FIFO as reported by the ECR.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FifoState {
    Empty,
    Some,
    Full,
}

pub struct SignalIo {
    io: Box<dyn PortIo>,
    clock: Arc<dyn Clock>,
    trace_logger: TraceLogger,
    caps: PortConfig,
}

impl SignalIo {
    pub fn new(io: Box<dyn PortIo>, clock: Arc<dyn Clock>, config: &DriverConfig) -> Self {
        Self {
            io,
            clock,
            trace_logger: TraceLogger::from_config(&config.trace),
            caps: config.port.clone(),
        }
    }

    pub fn caps(&self) -> &PortConfig {
        &self.caps
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[inline]
    pub fn read(&mut self, reg: Register) -> u8 {
        let value = self.io.read(reg);
        self.trace_logger.access(self.clock.now(), reg, value, false);
        value
    }

    #[inline]
    pub fn write(&mut self, reg: Register, value: u8) {
        self.trace_logger.access(self.clock.now(), reg, value, true);
        self.io.write(reg, value);
    }

    #[inline]
    pub fn read_dsr(&mut self) -> u8 {
        self.read(Register::Status)
    }

    #[inline]
    pub fn read_dcr(&mut self) -> u8 {
        self.read(Register::Control)
    }

    #[inline]
    pub fn write_dcr(&mut self, value: u8) {
        self.write(Register::Control, value)
    }

    #[inline]
    pub fn read_data(&mut self) -> u8 {
        self.read(Register::Data)
    }

    #[inline]
    pub fn write_data(&mut self, value: u8) {
        self.write(Register::Data, value)
    }

    /// Read-modify-write of the control register.
    pub fn update_dcr(
        &mut self,
        direction: Signal,
        ack_int: Signal,
        select_in: Signal,
        init: Signal,
        autofeed: Signal,
        strobe: Signal,
    ) -> u8 {
        let dcr = self.read_dcr();
        let dcr = update_dcr(dcr, direction, ack_int, select_in, init, autofeed, strobe);
        self.write_dcr(dcr);
        dcr
    }

    pub fn read_buffer(&mut self, reg: Register, buf: &mut [u8]) {
        self.io.read_buffer(reg, buf);
        if self.trace_logger.is_some() {
            let now = self.clock.now();
            for byte in buf.iter() {
                self.trace_logger.access(now, reg, *byte, false);
            }
        }
    }

    pub fn write_buffer(&mut self, reg: Register, buf: &[u8]) {
        if self.trace_logger.is_some() {
            let now = self.clock.now();
            for byte in buf {
                self.trace_logger.access(now, reg, *byte, true);
            }
        }
        self.io.write_buffer(reg, buf);
    }

    pub fn read_buffer_u32(&mut self, reg: Register, buf: &mut [u32]) {
        self.io.read_buffer_u32(reg, buf);
    }

    pub fn write_buffer_u32(&mut self, reg: Register, buf: &[u32]) {
        self.io.write_buffer_u32(reg, buf);
    }

    #[inline]
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    #[inline]
    pub fn stall_us(&self, us: u64) {
        self.clock.stall_us(us)
    }

    pub fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration)
    }

    /// Wait for `(reg & mask) == value`. Checks once immediately, then polls with 1us
    /// stalls until `timeout` elapses, then checks a final time.
    pub fn check_port(&mut self, reg: Register, mask: u8, value: u8, timeout: Duration) -> bool {
        if self.read(reg) & mask == value {
            return true;
        }

        let deadline = self.clock.now() + timeout;
        loop {
            self.clock.stall_us(1);
            if self.read(reg) & mask == value {
                return true;
            }
            if self.clock.now() >= deadline {
                break;
            }
        }

        self.read(reg) & mask == value
    }

    #[inline]
    pub fn check_dsr(&mut self, pattern: DsrPattern, timeout: Duration) -> bool {
        self.check_port(Register::Status, pattern.mask, pattern.value, timeout)
    }

    /// Single non-waiting comparison of the status register against a pattern.
    #[inline]
    pub fn test_dsr(&mut self, pattern: DsrPattern) -> bool {
        pattern.matches(self.read_dsr())
    }

    pub fn write_ecr_mode(&mut self, mode: EcrMode) {
        self.write(Register::Ecr, mode.ecr_value());
    }

    pub fn ecr_mode(&mut self) -> Option<EcrMode> {
        let ecr = self.read(Register::Ecr);
        EcrMode::from_ecr(ecr)
    }

    pub fn fifo_state(&mut self) -> FifoState {
        match self.read(Register::Ecr) & ECR_FIFO_MASK {
            ECR_FIFO_EMPTY => FifoState::Empty,
            ECR_FIFO_FULL => FifoState::Full,
            _ => FifoState::Some,
        }
    }

    pub fn flush_trace(&mut self) {
        self.trace_logger.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FakeClock, SimulatedPort};

    #[test]
    fn check_dsr_times_out_in_virtual_time() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        let config = DriverConfig::default();
        let mut hw = SignalIo::new(Box::new(sim), Arc::new(clock.clone()), &config);

        // The idle printer never drops SELECT, so this pattern cannot match.
        let pattern = DsrPattern::new(DontCare, DontCare, DontCare, Inactive, DontCare);
        let start = clock.now();
        assert!(!hw.check_dsr(pattern, Duration::from_millis(2)));
        assert!(clock.now() - start >= Duration::from_millis(2));
    }

    #[test]
    fn check_dsr_returns_immediately_on_match() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        let config = DriverConfig::default();
        let mut hw = SignalIo::new(Box::new(sim), Arc::new(clock.clone()), &config);

        let pattern = DsrPattern::new(Inactive, Active, Inactive, Active, Active);
        let start = clock.now();
        assert!(hw.check_dsr(pattern, Duration::from_millis(35)));
        assert_eq!(clock.now(), start);
    }
}
