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

    lib.rs

    Headless runner for parport_core. Loads a driver configuration, builds a
    simulated port and runs end-to-end scenarios against it.

*/

//! parport headless runner library component.

#![forbid(unsafe_code)]

pub mod args;
pub mod scenarios;
pub mod sim_config;

use std::sync::Arc;

use crate::{args::CmdLineArgs, scenarios::run_scenario, sim_config::load_config};

pub fn run(args: CmdLineArgs) -> Result<(), anyhow::Error> {
    let (config, simulation) = load_config(&args)?;
    log::debug!("Driver config: {:?}", config);
    log::debug!("Simulation config: {:?}", simulation);

    let config = Arc::new(config);
    run_scenario(args.scenario.unwrap_or_default(), &config, &simulation)
}
