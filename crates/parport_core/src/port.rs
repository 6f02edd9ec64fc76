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

    port.rs

    A physical parallel port shared by every logical device behind it. Owns the
    register interface, the injected clock and the arbiter that decides which
    device may drive the registers.

*/

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    arbiter::PortArbiter,
    config::DriverConfig,
    port_io::{Clock, PortIo, SignalIo},
    status::{self, PrinterCondition},
};

pub struct ParallelPort {
    config:  Arc<DriverConfig>,
    arbiter: PortArbiter,
    clock:   Arc<dyn Clock>,
    hw:      Mutex<SignalIo>,
}

impl ParallelPort {
    pub fn new(io: Box<dyn PortIo>, clock: Arc<dyn Clock>, config: Arc<DriverConfig>) -> Arc<Self> {
        let hw = SignalIo::new(io, clock.clone(), &config);
        log::debug!(
            "port created: ecp: {} epp: {} fifo depth: {}",
            config.port.ecp,
            config.port.epp,
            config.port.fifo_depth
        );
        Arc::new(Self {
            config,
            arbiter: PortArbiter::new(),
            clock,
            hw: Mutex::new(hw),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<DriverConfig> {
        self.config.clone()
    }

    pub fn arbiter(&self) -> &PortArbiter {
        &self.arbiter
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Lock the register interface. Only the current port owner should drive the
    /// registers; the lock itself just keeps register sequences from interleaving.
    pub fn hardware(&self) -> MutexGuard<'_, SignalIo> {
        self.hw.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Classify the peripheral status lines the way the SPP write path does.
    pub fn printer_status(&self) -> PrinterCondition {
        let dsr = self.hardware().read_dsr();
        status::classify(dsr)
    }
}

impl Drop for ParallelPort {
    fn drop(&mut self) {
        self.hardware().flush_trace();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FakeClock, SimulatedPort};

    #[test]
    fn new_port_is_free_and_ready() {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        let port = ParallelPort::new(Box::new(sim), Arc::new(clock), Arc::new(DriverConfig::default()));
        assert!(port.arbiter().is_free());
        assert_eq!(port.printer_status(), PrinterCondition::Ok);
    }
}
