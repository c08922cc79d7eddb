//! Linux SocketCAN transport.
//!
//! Every bus gets its own raw socket for sending, with loopback off so local
//! readers never see the charger's own frames. Received battery traffic is
//! read on one thread per battery and handed to the caller through a channel.

use crate::protocol::FrameId;
use crate::transport::{Bus, CanFrame, Transport};
use crate::Error;
use socketcan::{
    CanFrame as SocketCanFrame, CanSocket, EmbeddedFrame, Frame, Socket, SocketOptions,
    StandardId,
};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const READ_TIMEOUT: Duration = Duration::from_millis(100);

fn open(interface: &str) -> Result<CanSocket, Error> {
    CanSocket::open(interface)
        .map_err(|err| Error::Transport(format!("cannot open {interface}: {err}")))
}

fn open_sender(interface: &str) -> Result<CanSocket, Error> {
    let socket = open(interface)?;
    socket
        .set_loopback(false)
        .map_err(|err| Error::Transport(format!("cannot disable loopback on {interface}: {err}")))?;
    Ok(socket)
}

/// Frame read from a battery bus.
#[derive(Debug, Clone)]
pub struct Received {
    pub battery: usize,
    pub at: Instant,
    pub frame: CanFrame,
}

pub struct SocketCanTransport {
    inverter: CanSocket,
    batteries: Vec<CanSocket>,
}

impl SocketCanTransport {
    /// Opens the inverter interface and one socket per battery interface.
    pub fn open(inverter: &str, batteries: &[String]) -> Result<Self, Error> {
        log::info!("Opening inverter bus {inverter}");
        Ok(Self {
            inverter: open_sender(inverter)?,
            batteries: batteries
                .iter()
                .map(|interface| open_sender(interface))
                .collect::<Result<_, _>>()?,
        })
    }
}

impl Transport for SocketCanTransport {
    fn send_frame(&mut self, bus: Bus, frame_id: FrameId, payload: &[u8]) -> Result<(), Error> {
        let socket = match bus {
            Bus::Inverter => &self.inverter,
            Bus::Battery(index) => self
                .batteries
                .get(index)
                .ok_or_else(|| Error::Transport(format!("no socket for {bus}")))?,
        };
        let id = StandardId::new(frame_id).ok_or(Error::IdRange(frame_id as u32))?;
        let frame =
            SocketCanFrame::new(id, payload).ok_or(Error::PayloadLength(payload.len()))?;
        log::trace!("send {bus}: 0x{frame_id:03X} {payload:02X?}");
        socket
            .write_frame(&frame)
            .map_err(|err| Error::Transport(format!("{bus}: {err}")))
    }
}

/// Starts a thread reading standard data frames of `battery` from
/// `interface`. The thread ends once the receiving side is dropped.
pub fn spawn_reader(
    interface: &str,
    battery: usize,
    tx: Sender<Received>,
) -> Result<JoinHandle<()>, Error> {
    let socket = open(interface)?;
    socket.set_read_timeout(READ_TIMEOUT)?;
    let interface = interface.to_string();
    let handle = std::thread::Builder::new()
        .name(format!("can-{interface}"))
        .spawn(move || {
            log::debug!("Reading battery #{} from {interface}", battery + 1);
            loop {
                let frame = match socket.read_frame() {
                    Ok(frame) => frame,
                    Err(err)
                        if matches!(
                            err.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue;
                    }
                    Err(err) => {
                        log::error!("{interface}: read failed: {err}");
                        std::thread::sleep(READ_TIMEOUT);
                        continue;
                    }
                };
                if frame.is_extended() || frame.is_remote_frame() || frame.is_error_frame() {
                    continue;
                }
                let Ok(frame) = CanFrame::new(frame.raw_id(), frame.data()) else {
                    continue;
                };
                let received = Received {
                    battery,
                    at: Instant::now(),
                    frame,
                };
                if tx.send(received).is_err() {
                    break;
                }
            }
            log::debug!("{interface}: reader stopped");
        })?;
    Ok(handle)
}
