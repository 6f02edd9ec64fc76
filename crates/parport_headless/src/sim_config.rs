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

    sim_config.rs

    The [simulation] section of the headless configuration file, describing the
    peripheral chain to build on the simulated cable, and the loader that reads
    it alongside the driver configuration.

*/

use std::path::Path;

use anyhow::Context;
use serde_derive::Deserialize;

use parport_core::{
    config::DriverConfig,
    sim::{ChainDeviceKind, FakeClock, Peripheral, SimulatedPort},
};

use crate::args::CmdLineArgs;

const fn _default_payload_len() -> usize {
    64
}

fn _default_chain() -> Vec<ChainDeviceSpec> {
    vec![ChainDeviceSpec::Standard, ChainDeviceSpec::Standard]
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainDeviceSpec {
    Standard,
    Shuttle,
    ShuttleLegacy,
}

impl ChainDeviceSpec {
    fn kind(self) -> ChainDeviceKind {
        match self {
            ChainDeviceSpec::Standard => ChainDeviceKind::Standard,
            ChainDeviceSpec::Shuttle => ChainDeviceKind::Shuttle1284_3,
            ChainDeviceSpec::ShuttleLegacy => ChainDeviceKind::ShuttleLegacy(0xAAFF),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "_default_chain")]
    pub chain: Vec<ChainDeviceSpec>,
    #[serde(default)]
    pub legacy_zip: bool,
    /// Device ID reported by the end-of-chain peripheral.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "_default_payload_len")]
    pub payload_len: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            chain: _default_chain(),
            legacy_zip: false,
            device_id: None,
            payload_len: _default_payload_len(),
        }
    }
}

impl SimulationConfig {
    /// Build a simulated cable with this chain on it.
    pub fn build(&self, clock: FakeClock) -> SimulatedPort {
        let sim = SimulatedPort::new(clock);
        for spec in &self.chain {
            sim.add_chain_device(spec.kind(), Peripheral::new());
        }
        if self.legacy_zip {
            sim.attach_legacy_zip();
        }
        if let Some(id) = &self.device_id {
            sim.with_end_of_chain(|p| p.device_id = Some(id.clone()));
        }
        sim
    }
}

#[derive(Debug, Default, Deserialize)]
struct HeadlessFile {
    #[serde(default)]
    simulation: SimulationConfig,
}

/// Parse both configurations from one TOML document.
pub fn read_config(toml_string: &str) -> Result<(DriverConfig, SimulationConfig), anyhow::Error> {
    let driver = DriverConfig::from_toml_str(toml_string)?;
    let file: HeadlessFile = toml::from_str(toml_string)?;
    Ok((driver, file.simulation))
}

/// Load the configuration named on the command line, or the defaults, and apply
/// the command line overrides.
pub fn load_config(args: &CmdLineArgs) -> Result<(DriverConfig, SimulationConfig), anyhow::Error> {
    let (mut driver, mut simulation) = match args.config_file.as_deref() {
        Some(path) => read_config_file(path)?,
        None => {
            log::debug!("No config file given, using defaults");
            (DriverConfig::default(), SimulationConfig::default())
        }
    };

    if let Some(devices) = args.devices {
        simulation.chain = vec![ChainDeviceSpec::Standard; devices.min(4) as usize];
    }
    simulation.legacy_zip |= args.legacy_zip;
    driver.trace.enabled |= args.trace;

    Ok((driver, simulation))
}

fn read_config_file(path: &Path) -> Result<(DriverConfig, SimulationConfig), anyhow::Error> {
    log::debug!("Reading config file {}", path.display());
    let toml_string =
        std::fs::read_to_string(path).with_context(|| format!("couldn't read config file {}", path.display()))?;
    read_config(&toml_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulation_section_is_optional() {
        let (driver, simulation) = read_config("[timing]\ndot3_retries = 2\n").unwrap();
        assert_eq!(driver.timing.dot3_retries, 2);
        assert_eq!(simulation.chain.len(), 2);
        assert_eq!(simulation.payload_len, 64);
    }

    #[test]
    fn simulation_section_builds_chain() {
        let toml = r#"
            [simulation]
            chain = ["shuttle", "shuttle_legacy"]
            legacy_zip = true
        "#;
        let (_, simulation) = read_config(toml).unwrap();
        assert_eq!(simulation.chain, vec![ChainDeviceSpec::Shuttle, ChainDeviceSpec::ShuttleLegacy]);

        let sim = simulation.build(FakeClock::new());
        assert!(!sim.legacy_zip_selected());
        assert_eq!(sim.device_address(1), None);
    }

    #[test]
    fn command_line_overrides_chain() {
        let args = CmdLineArgs {
            devices: Some(3),
            trace: true,
            ..Default::default()
        };
        let (driver, simulation) = load_config(&args).unwrap();
        assert_eq!(simulation.chain, vec![ChainDeviceSpec::Standard; 3]);
        assert!(driver.trace.enabled);
    }
}
