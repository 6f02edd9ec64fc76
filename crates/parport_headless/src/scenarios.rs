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

    scenarios.rs

    End-to-end scenarios run against a simulated port: a session with a device
    on a 1284.3 chain, port contention between two callers, device ID retrieval
    and a Dot3 datalink exchange.

*/

use std::{sync::Arc, thread, time::Duration};

use anyhow::{anyhow, bail};

use parport_core::{
    arbiter::AcquireOutcome,
    channel::Channel,
    config::DriverConfig,
    daisychain::{legacy_zip::LEGACY_ZIP_PSEUDO_ID, ChainTarget, DaisyChainBus},
    datalink::{DataLink, DataLinkMode},
    device_id::DeviceId,
    modes::ProtocolModes,
    port::ParallelPort,
    sim::{FakeClock, SimulatedPort},
};

use crate::{args::Scenario, sim_config::SimulationConfig};

const CONTENTION_WAIT: Duration = Duration::from_secs(5);

/// A simulated cable and the port driving it.
pub struct Harness {
    pub sim:  SimulatedPort,
    pub port: Arc<ParallelPort>,
}

impl Harness {
    pub fn new(config: &Arc<DriverConfig>, simulation: &SimulationConfig) -> Self {
        let clock = FakeClock::new();
        let sim = simulation.build(clock.clone());
        let port = ParallelPort::new(Box::new(sim.clone()), Arc::new(clock), config.clone());
        Self { sim, port }
    }
}

pub fn run_scenario(
    scenario: Scenario,
    config: &Arc<DriverConfig>,
    simulation: &SimulationConfig,
) -> Result<(), anyhow::Error> {
    let scenarios = match scenario {
        Scenario::All => vec![
            Scenario::Chain,
            Scenario::Contention,
            Scenario::DeviceId,
            Scenario::Datalink,
        ],
        other => vec![other],
    };

    for scenario in scenarios {
        log::info!("Running scenario: {}", scenario);
        // Every scenario starts from a freshly powered cable.
        let harness = Harness::new(config, simulation);
        match scenario {
            Scenario::Chain => run_chain(&harness, simulation)?,
            Scenario::Contention => run_contention(&harness)?,
            Scenario::DeviceId => run_device_id(&harness)?,
            Scenario::Datalink => run_datalink(&harness)?,
            Scenario::All => {}
        }
        log::info!("Scenario {} complete", scenario);
    }
    Ok(())
}

/// Acquire the port, enumerate the chain, select the first device and move data
/// in both directions with it.
pub fn run_chain(harness: &Harness, simulation: &SimulationConfig) -> Result<(), anyhow::Error> {
    let bus = DaisyChainBus::new(harness.port.clone());
    let mut channel = Channel::new(harness.port.clone());

    channel.acquire()?;
    let count = bus.initiate_bus();
    log::info!("Daisy chain has {} device(s)", count);

    let target = if count > 0 { ChainTarget::Dot3(0) } else { ChainTarget::EndOfChain };
    let reply: Vec<u8> = (0..simulation.payload_len).map(|i| (i as u8) ^ 0x5A).collect();
    match target {
        ChainTarget::Dot3(_) => {
            harness.sim.with_device(0, |p| p.reverse_data.extend(reply.iter().copied()));
        }
        _ => harness.sim.with_end_of_chain(|p| p.reverse_data.extend(reply.iter().copied())),
    }

    bus.select_device(target, true)?;
    log::info!("Selected {}", target);

    let modes = channel.negotiate(ProtocolModes::ECP_HW_NOIRQ)?;
    log::info!("Negotiated ECP, peripheral modes: {:?}, phase: {:?}", modes, channel.phase());

    let payload: Vec<u8> = (0..simulation.payload_len).map(|i| i as u8).collect();
    let written = channel.write(&payload)?;
    log::info!("Wrote {} of {} bytes", written, payload.len());

    channel.forward_to_reverse()?;
    log::info!("Bus reversed, phase: {:?}", channel.phase());

    let mut buf = vec![0u8; simulation.payload_len];
    match channel.read(&mut buf) {
        Ok(n) => log::info!("Read {} bytes", n),
        Err(e) => log::warn!("Read stopped: {}", e),
    }

    channel.terminate();
    bus.deselect_device(target, true)?;

    if bus.legacy_zip_present() {
        bus.select_device(ChainTarget::LegacyZip, true)?;
        let id = DeviceId::parse(LEGACY_ZIP_PSEUDO_ID);
        log::info!("Legacy Zip selected: {} {}", id.manufacturer, id.model);
        bus.deselect_device(ChainTarget::LegacyZip, true)?;
    }

    channel.release();
    if !harness.port.arbiter().is_free() {
        bail!("port still held after release");
    }
    log::info!("Port released");
    Ok(())
}

/// A holds the port while B queues behind it; A's release completes B's request.
pub fn run_contention(harness: &Harness) -> Result<(), anyhow::Error> {
    let arbiter = harness.port.arbiter().clone();

    if !arbiter.try_acquire() {
        bail!("port unexpectedly busy");
    }
    log::info!("A acquired the port");

    let pending = match arbiter.submit()? {
        AcquireOutcome::Pending(pending) => pending,
        AcquireOutcome::Granted => bail!("B was granted a port A still holds"),
    };
    log::info!("B is pending as request {}", pending.id());

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let waiter = thread::spawn(move || {
        let result = pending.wait(CONTENTION_WAIT);
        let _ = done_tx.send(result.is_ok());
    });

    arbiter.release();
    log::info!("A released the port");

    let granted = done_rx.recv_timeout(CONTENTION_WAIT)?;
    waiter.join().map_err(|_| anyhow!("waiter thread panicked"))?;
    if !granted {
        bail!("B's request did not complete");
    }
    log::info!("B now owns the port");

    arbiter.release();
    log::info!("Arbiter stats: {:?}", arbiter.stats());
    Ok(())
}

pub fn run_device_id(harness: &Harness) -> Result<(), anyhow::Error> {
    let mut channel = Channel::new(harness.port.clone());
    channel.acquire()?;

    let id = channel.query_device_id();
    channel.release();
    let id = id?;

    log::info!("Manufacturer: {}", id.manufacturer);
    log::info!("Model: {}", id.model);
    log::info!("Command set: {}", id.command_set);
    log::info!("PnP id: {}", id.pnp_id());
    if let Some(mode) = id.datalink_mode() {
        log::info!("Datalink: {}", mode);
    }
    Ok(())
}

/// Reset the link, send a Dot3 frame and take a reply from the peripheral.
pub fn run_datalink(harness: &Harness) -> Result<(), anyhow::Error> {
    let config = harness.port.config();
    let mut channel = Channel::new(harness.port.clone());
    channel.acquire()?;
    channel.negotiate(ProtocolModes::ECP_HW_NOIRQ)?;

    let mut link = DataLink::for_channel(&channel)
        .unwrap_or_else(|| DataLink::new(DataLinkMode::Dot3, &config.datalink, config.timing.receive_timeout()));
    log::info!("Datalink mode: {}", link.mode());

    link.reset(&mut channel)?;
    link.send(&mut channel, b"status?")?;

    let mut peer = DataLink::new(link.mode(), &config.datalink, config.timing.receive_timeout());
    let reply = peer.encode(b"ready")?;
    harness.sim.with_end_of_chain(|p| p.reverse_data.extend(reply));

    let frame = link.receive(&mut channel)?;
    log::info!("Received frame {:?} with {} byte payload", frame.header, frame.payload.len());

    channel.release();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness(simulation: &SimulationConfig) -> Harness {
        Harness::new(&Arc::new(DriverConfig::default()), simulation)
    }

    #[test]
    fn chain_scenario_leaves_port_free() {
        let simulation = SimulationConfig::default();
        let h = harness(&simulation);
        run_chain(&h, &simulation).unwrap();
        assert_eq!(h.sim.device_received(0), (0..64u8).collect::<Vec<_>>());
        assert_eq!(h.sim.selected(), None);
        assert!(h.port.arbiter().is_free());
    }

    #[test]
    fn chain_scenario_without_chain_uses_end_of_chain() {
        let simulation = SimulationConfig {
            chain: Vec::new(),
            legacy_zip: true,
            ..Default::default()
        };
        let h = harness(&simulation);
        run_chain(&h, &simulation).unwrap();
        assert_eq!(h.sim.end_of_chain_received(), (0..64u8).collect::<Vec<_>>());
        assert!(!h.sim.legacy_zip_selected());
    }

    #[test]
    fn contention_scenario_hands_off() {
        let h = harness(&SimulationConfig::default());
        run_contention(&h).unwrap();
        assert!(h.port.arbiter().is_free());
        assert_eq!(h.port.arbiter().stats().immediate, 1);
    }

    #[test]
    fn all_scenarios_run() {
        let config = Arc::new(DriverConfig::default());
        run_scenario(Scenario::All, &config, &SimulationConfig::default()).unwrap();
    }
}
