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

    datalink.rs

    Packet datalinks layered over a channel's forward and reverse modes. Dot3
    frames carry start and end markers and a 16-bit checksum; Dot4 (and legacy
    MLC) frames carry a length-prefixed header. Received frames are length
    checked before their checksum is verified.

*/

use std::time::Duration;

use crate::{channel::Channel, config::DataLinkConfig, error::ParportError};

pub const DOT3_SOF: u8 = 0x7E;
pub const DOT3_EOF: u8 = 0x7F;
/// SOF, PID, channel and two length bytes.
pub const DOT3_HEADER_LEN: usize = 5;
/// Checksum and EOF.
pub const DOT3_TRAILER_LEN: usize = 3;
/// PSID, SSID, two length bytes, credit and control.
pub const DOT4_HEADER_LEN: usize = 6;

const RECEIVE_CHUNK: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum DataLinkMode {
    Dot3,
    Dot4,
    Mlc,
}

const CRC16_LO: [u16; 16] = [
    0o000000, 0o140301, 0o140601, 0o000500, 0o141401, 0o001700, 0o001200, 0o141101, 0o143001, 0o003300, 0o003600,
    0o143501, 0o002400, 0o142701, 0o142201, 0o002100,
];
const CRC16_HI: [u16; 16] = [
    0o000000, 0o146001, 0o154001, 0o012000, 0o170001, 0o036000, 0o024000, 0o162001, 0o120001, 0o066000, 0o074000,
    0o132001, 0o050000, 0o116001, 0o104001, 0o043000,
];

/// Table-driven 16-bit checksum, a nibble at a time.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, &b| {
        let t = (b ^ crc as u8) as usize;
        (crc >> 8) ^ CRC16_LO[t & 0x0F] ^ CRC16_HI[t >> 4]
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameHeader {
    Dot3 { pid: u8, channel: u8 },
    Dot4 { psid: u8, ssid: u8, credit: u8, control: u8 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header:  FrameHeader,
    pub payload: Vec<u8>,
}

pub struct DataLink {
    mode: DataLinkMode,
    data_channel: u8,
    reset_channel: u8,
    reset_byte_count: u8,
    reset_byte: u8,
    current_pid: u8,
    max_frame: usize,
    receive_timeout: Duration,
    rx: Vec<u8>,
}

impl DataLink {
    pub fn new(mode: DataLinkMode, config: &DataLinkConfig, receive_timeout: Duration) -> Self {
        Self {
            mode,
            data_channel: config.data_channel,
            reset_channel: config.reset_channel,
            reset_byte_count: config.reset_byte_count,
            reset_byte: config.reset_byte,
            current_pid: 0,
            max_frame: config.max_frame.min(u16::MAX as usize - DOT4_HEADER_LEN),
            receive_timeout,
            rx: Vec::new(),
        }
    }

    /// Build the datalink a channel's device ID asked for, if it asked for one.
    pub fn for_channel(channel: &Channel) -> Option<Self> {
        let config = channel.port().config();
        channel
            .state()
            .datalink
            .map(|mode| DataLink::new(mode, &config.datalink, config.timing.receive_timeout()))
    }

    pub fn mode(&self) -> DataLinkMode {
        self.mode
    }

    pub fn encode(&mut self, payload: &[u8]) -> Result<Vec<u8>, ParportError> {
        if payload.len() > self.max_frame {
            return Err(ParportError::FrameOverflow(payload.len()));
        }
        match self.mode {
            DataLinkMode::Dot3 => {
                let pid = self.current_pid;
                self.current_pid = self.current_pid.wrapping_add(1);

                let mut frame = Vec::with_capacity(DOT3_HEADER_LEN + payload.len() + DOT3_TRAILER_LEN);
                frame.push(DOT3_SOF);
                frame.push(pid);
                frame.push(self.data_channel);
                frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                frame.extend_from_slice(payload);
                let crc = checksum(&frame[1..]);
                frame.extend_from_slice(&crc.to_be_bytes());
                frame.push(DOT3_EOF);
                Ok(frame)
            }
            DataLinkMode::Dot4 | DataLinkMode::Mlc => {
                let length = (payload.len() + DOT4_HEADER_LEN) as u16;
                let mut frame = Vec::with_capacity(length as usize);
                frame.push(self.data_channel);
                frame.push(self.data_channel);
                frame.extend_from_slice(&length.to_be_bytes());
                // One credit, no control flags.
                frame.push(1);
                frame.push(0);
                frame.extend_from_slice(payload);
                Ok(frame)
            }
        }
    }

    /// Decode the frame at the start of `bytes`. Returns the frame and the number of
    /// bytes it used, or `None` if more bytes are needed.
    pub fn decode(&self, bytes: &[u8]) -> Result<Option<(Frame, usize)>, ParportError> {
        match self.mode {
            DataLinkMode::Dot3 => self.decode_dot3(bytes),
            DataLinkMode::Dot4 | DataLinkMode::Mlc => self.decode_dot4(bytes),
        }
    }

    fn decode_dot3(&self, bytes: &[u8]) -> Result<Option<(Frame, usize)>, ParportError> {
        if bytes.is_empty() {
            return Ok(None);
        }
        if bytes[0] != DOT3_SOF {
            return Err(ParportError::FrameFormat(format!("expected start of frame, got {:#04X}", bytes[0])));
        }
        if bytes.len() < DOT3_HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([bytes[3], bytes[4]]) as usize;
        if length > self.max_frame {
            return Err(ParportError::FrameOverflow(length));
        }
        let total = DOT3_HEADER_LEN + length + DOT3_TRAILER_LEN;
        if bytes.len() < total {
            return Ok(None);
        }
        if bytes[total - 1] != DOT3_EOF {
            return Err(ParportError::FrameFormat(format!(
                "expected end of frame, got {:#04X}",
                bytes[total - 1]
            )));
        }

        let body = DOT3_HEADER_LEN + length;
        let expected = u16::from_be_bytes([bytes[body], bytes[body + 1]]);
        let actual = checksum(&bytes[1..body]);
        if expected != actual {
            return Err(ParportError::Checksum { expected, actual });
        }

        let frame = Frame {
            header:  FrameHeader::Dot3 {
                pid: bytes[1],
                channel: bytes[2],
            },
            payload: bytes[DOT3_HEADER_LEN..body].to_vec(),
        };
        Ok(Some((frame, total)))
    }

    fn decode_dot4(&self, bytes: &[u8]) -> Result<Option<(Frame, usize)>, ParportError> {
        if bytes.len() < DOT4_HEADER_LEN {
            return Ok(None);
        }
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if length < DOT4_HEADER_LEN {
            return Err(ParportError::FrameFormat(format!("header length {} too short", length)));
        }
        if length - DOT4_HEADER_LEN > self.max_frame {
            return Err(ParportError::FrameOverflow(length - DOT4_HEADER_LEN));
        }
        if bytes.len() < length {
            return Ok(None);
        }

        let frame = Frame {
            header:  FrameHeader::Dot4 {
                psid: bytes[0],
                ssid: bytes[1],
                credit: bytes[4],
                control: bytes[5],
            },
            payload: bytes[DOT4_HEADER_LEN..length].to_vec(),
        };
        Ok(Some((frame, length)))
    }

    /// Frame `payload` and write it to the peripheral.
    pub fn send(&mut self, channel: &mut Channel, payload: &[u8]) -> Result<(), ParportError> {
        let frame = self.encode(payload)?;
        let written = channel.write(&frame).map_err(|e| e.error)?;
        if written != frame.len() {
            return Err(ParportError::LinkFailed);
        }
        log::trace!("{}: sent {} byte frame", self.mode, frame.len());
        Ok(())
    }

    /// Read until one whole frame has arrived. Malformed input is reported and left
    /// in the receive buffer; call [`DataLink::resync`] to discard it.
    pub fn receive(&mut self, channel: &mut Channel) -> Result<Frame, ParportError> {
        let clock = channel.port().clock().clone();
        let deadline = clock.now() + self.receive_timeout;
        let mut chunk = [0u8; RECEIVE_CHUNK];

        loop {
            if let Some((frame, used)) = self.decode(&self.rx)? {
                self.rx.drain(..used);
                return Ok(frame);
            }

            let read = match channel.read(&mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    self.rx.extend_from_slice(&chunk[..e.transferred]);
                    return Err(e.error);
                }
            };
            self.rx.extend_from_slice(&chunk[..read]);

            if read == 0 {
                if clock.now() >= deadline {
                    log::debug!("{}: receive timed out with {} bytes buffered", self.mode, self.rx.len());
                    return Err(ParportError::ReceiveTimeout);
                }
                clock.sleep(Duration::from_millis(1));
            }
        }
    }

    /// Drop any partially received input.
    pub fn resync(&mut self) {
        self.rx.clear();
    }

    /// Send the reset sequence on the reset channel, then return to the data
    /// channel.
    pub fn reset(&mut self, channel: &mut Channel) -> Result<(), ParportError> {
        log::debug!("{}: reset on channel {:#04X}", self.mode, self.reset_channel);
        channel.set_forward_address(self.reset_channel)?;
        let sequence = vec![self.reset_byte; self.reset_byte_count as usize];
        let result = channel.write(&sequence).map_err(|e| e.error);
        channel.set_forward_address(self.data_channel)?;
        result?;

        self.current_pid = 0;
        self.rx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DriverConfig,
        modes::ProtocolModes,
        port::ParallelPort,
        sim::{FakeClock, SimulatedPort},
    };
    use std::sync::Arc;

    fn link(mode: DataLinkMode) -> DataLink {
        DataLink::new(mode, &DataLinkConfig::default(), Duration::from_millis(330))
    }

    fn ecp_channel() -> (SimulatedPort, Channel) {
        let clock = FakeClock::new();
        let sim = SimulatedPort::new(clock.clone());
        let port = ParallelPort::new(Box::new(sim.clone()), Arc::new(clock), Arc::new(DriverConfig::default()));
        let mut channel = Channel::new(port);
        channel.negotiate(ProtocolModes::ECP_HW_NOIRQ).unwrap();
        (sim, channel)
    }

    #[test]
    fn checksum_matches_reference_value() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"123456789"), 0x593C);
    }

    #[test]
    fn dot3_frame_layout() {
        let mut dl = link(DataLinkMode::Dot3);
        let frame = dl.encode(b"abc").unwrap();
        assert_eq!(&frame[..5], &[DOT3_SOF, 0, 0, 0, 3]);
        assert_eq!(&frame[5..8], b"abc");
        assert_eq!(u16::from_be_bytes([frame[8], frame[9]]), checksum(&frame[1..8]));
        assert_eq!(frame[10], DOT3_EOF);

        // PIDs advance per frame.
        assert_eq!(dl.encode(b"").unwrap()[1], 1);
    }

    #[test]
    fn dot4_length_includes_header() {
        let mut dl = link(DataLinkMode::Dot4);
        let frame = dl.encode(&[9; 10]).unwrap();
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 16);
        let (decoded, used) = dl.decode(&frame).unwrap().unwrap();
        assert_eq!(used, 16);
        assert_eq!(decoded.payload, vec![9; 10]);
    }

    #[test]
    fn decode_waits_for_whole_frame() {
        let mut dl = link(DataLinkMode::Dot3);
        let frame = dl.encode(b"hello").unwrap();
        assert!(dl.decode(&frame[..7]).unwrap().is_none());
        let (decoded, used) = dl.decode(&frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(decoded.payload, b"hello".to_vec());
    }

    #[test]
    fn corrupt_frames_are_rejected() {
        let mut dl = link(DataLinkMode::Dot3);
        let mut frame = dl.encode(b"hello").unwrap();
        frame[6] ^= 0xFF;
        assert!(matches!(dl.decode(&frame), Err(ParportError::Checksum { .. })));

        // An oversized length is caught before any checksum is computed.
        let oversized = [DOT3_SOF, 0, 0, 0xFF, 0xFF];
        assert!(matches!(dl.decode(&oversized), Err(ParportError::FrameOverflow(0xFFFF))));

        assert!(matches!(dl.decode(&[0x00, 1, 2]), Err(ParportError::FrameFormat(_))));
    }

    #[test]
    fn send_and_receive_over_ecp() {
        let (sim, mut channel) = ecp_channel();
        let mut dl = link(DataLinkMode::Dot3);

        dl.send(&mut channel, b"ping").unwrap();
        let sent = sim.end_of_chain_received();
        assert_eq!(sent.len(), DOT3_HEADER_LEN + 4 + DOT3_TRAILER_LEN);
        assert!(dl.decode(&sent).unwrap().is_some());

        let mut peer = link(DataLinkMode::Dot3);
        let reply = peer.encode(b"pong").unwrap();
        sim.with_end_of_chain(|p| p.reverse_data.extend(reply));

        let frame = dl.receive(&mut channel).unwrap();
        assert_eq!(frame.payload, b"pong".to_vec());
    }

    #[test]
    fn receive_times_out_without_data() {
        let (_sim, mut channel) = ecp_channel();
        let mut dl = link(DataLinkMode::Dot3);
        assert!(matches!(dl.receive(&mut channel), Err(ParportError::ReceiveTimeout)));
    }

    #[test]
    fn reset_uses_reset_channel() {
        let (sim, mut channel) = ecp_channel();
        let mut dl = link(DataLinkMode::Dot3);
        dl.reset(&mut channel).unwrap();
        assert_eq!(sim.end_of_chain_received(), vec![0; 4]);
        assert_eq!(sim.end_of_chain_channels(), vec![0x7F, 0]);
    }
}
