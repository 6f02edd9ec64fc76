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

    args.rs

    Command line arguments for the headless runner.

*/

use std::path::PathBuf;

use bpaf::Bpaf;
use strum_macros::{Display, EnumString};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Scenario {
    #[default]
    All,
    Chain,
    Contention,
    DeviceId,
    Datalink,
}

#[derive(Debug, Default, Bpaf)]
#[bpaf(options, version, generate(cli_args))]
pub struct CmdLineArgs {
    /// Driver configuration file (TOML)
    #[bpaf(long("config_file"), long("configfile"), short('c'))]
    pub config_file: Option<PathBuf>,

    /// Scenario to run: all, chain, contention, device-id, datalink
    #[bpaf(long, short('s'))]
    pub scenario: Option<Scenario>,

    /// Number of plain 1284.3 devices on the simulated chain
    #[bpaf(long)]
    pub devices: Option<u8>,

    /// Attach a legacy Zip drive behind the chain
    #[bpaf(long("legacy_zip"), long("zip"), switch)]
    pub legacy_zip: bool,

    /// Log every register access to the console
    #[bpaf(long, switch)]
    pub trace: bool,
}
