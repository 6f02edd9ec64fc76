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

    error.rs

    Error types for the parallel port engine.

*/

use crate::{ieee::Phase, status::PrinterCondition};

#[derive(thiserror::Error, Debug)]
pub enum ParportError {
    #[error("Peripheral did not respond at IEEE 1284 event {0}")]
    HandshakeTimeout(u8),
    #[error("No peripheral answered negotiation for extensibility byte {0:#04X}")]
    NegotiationFailed(u8),
    #[error("Peripheral refused extensibility byte {0:#04X}")]
    ModeRefused(u8),
    #[error("Operation is not valid in phase {0:?}")]
    InvalidPhase(Phase),
    #[error("Printer is {0}")]
    Printer(PrinterCondition),
    #[error("Link to the peripheral failed")]
    LinkFailed,
    #[error("Port state was changed by another agent")]
    ProtocolError,
    #[error("Failed to program interface address {0:#04X}")]
    AddressProgramming(u8),
    #[error("Frame checksum mismatch: expected {expected:#06X}, got {actual:#06X}")]
    Checksum { expected: u16, actual: u16 },
    #[error("Frame length {0} exceeds the receive buffer")]
    FrameOverflow(usize),
    #[error("Malformed frame: {0}")]
    FrameFormat(String),
    #[error("Timed out waiting for a frame")]
    ReceiveTimeout,
    #[error("Receive shadow buffer overflowed")]
    BufferOverflow,
    #[error("Timed out waiting to acquire the port")]
    AcquireTimeout,
    #[error("Port request was cancelled")]
    Cancelled,
    #[error("No room to queue the port request")]
    ResourceExhausted,
    #[error("Invalid daisy chain device id: {0}")]
    InvalidDevice(u8),
    #[error("Daisy chain device {0} did not acknowledge select")]
    SelectFailed(u8),
    #[error("Daisy chain device {0} did not acknowledge deselect")]
    DeselectFailed(u8),
    #[error("Not supported: {0}")]
    NotSupported(&'static str),
    #[error("Peripheral returned no usable device ID")]
    NoDeviceId,
    #[error("Invalid configuration: '{0}'")]
    Config(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl ParportError {
    /// Errors a caller may reasonably answer with a fresh negotiation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ParportError::HandshakeTimeout(_) | ParportError::NegotiationFailed(_) | ParportError::AddressProgramming(_)
        )
    }
}

/// A failed transfer, with the number of bytes moved before the failure.
#[derive(thiserror::Error, Debug)]
#[error("{error} after {transferred} bytes")]
pub struct TransferError {
    #[source]
    pub error: ParportError,
    pub transferred: usize,
}

impl TransferError {
    pub fn new(error: ParportError, transferred: usize) -> Self {
        Self { error, transferred }
    }
}

impl From<ParportError> for TransferError {
    fn from(error: ParportError) -> Self {
        TransferError { error, transferred: 0 }
    }
}

pub type TransferResult = Result<usize, TransferError>;
