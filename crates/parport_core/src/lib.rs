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

    IEEE 1284 parallel port core: negotiation, mode drivers, direction changes,
    the 1284.3 daisy chain, the shared-port arbiter and the Dot3/Dot4 datalink
    framing that sits on top of a channel.

*/

pub mod arbiter;
pub mod channel;
pub mod config;
pub mod daisychain;
pub mod datalink;
pub mod device_id;
pub mod direction;
pub mod error;
pub mod ieee;
pub mod modes;
pub mod port;
pub mod port_io;
pub mod registers;
pub mod status;
pub mod tracelogger;

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "sim"))] {
        pub mod sim;
    }
}

pub use arbiter::PortArbiter;
pub use channel::Channel;
pub use config::DriverConfig;
pub use daisychain::{ChainTarget, DaisyChainBus};
pub use error::{ParportError, TransferError};
pub use port::ParallelPort;
