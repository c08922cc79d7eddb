//! Raw frame boundary toward the CAN driver.

use crate::protocol::{FrameId, MAX_FRAME_ID, MAX_PAYLOAD};
use crate::Error;
use std::fmt;

/// Which bus a frame is sent on: the inverter side or one battery's BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bus {
    Inverter,
    Battery(usize),
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Bus::Inverter => write!(f, "inverter"),
            Bus::Battery(index) => write!(f, "battery{}", index + 1),
        }
    }
}

pub trait Transport {
    fn send_frame(&mut self, bus: Bus, frame_id: FrameId, payload: &[u8]) -> Result<(), Error>;
}

/// A received or outgoing standard frame.
#[derive(Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: FrameId,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8]) -> Result<Self, Error> {
        if id > MAX_FRAME_ID as u32 {
            return Err(Error::IdRange(id));
        }
        if data.len() > MAX_PAYLOAD {
            return Err(Error::PayloadLength(data.len()));
        }
        Ok(Self {
            id: id as FrameId,
            data: data.to_vec(),
        })
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03X} {:02X?}", self.id, self.data)
    }
}

/// Keeps every sent frame, mostly useful for dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<(Bus, CanFrame)>,
}

impl Transport for RecordingTransport {
    fn send_frame(&mut self, bus: Bus, frame_id: FrameId, payload: &[u8]) -> Result<(), Error> {
        let frame = CanFrame::new(frame_id as u32, payload)?;
        log::trace!("send {bus}: {frame:?}");
        self.sent.push((bus, frame));
        Ok(())
    }
}
