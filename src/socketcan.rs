//! Linux SocketCAN transport.
//!
//! # Example
//!
//! ```no_run
//! use ubms_lib::protocol::OPERATING_FILTERS;
//! use ubms_lib::socketcan::SocketCanTransport;
//! use ubms_lib::transport::Transport;
//! use std::time::Duration;
//!
//! let transport = SocketCanTransport::open("can0")?;
//! transport.set_filters(&OPERATING_FILTERS)?;
//! if let Some(frame) = transport.receive(Duration::from_secs(1))? {
//!     println!("{frame:?}");
//! }
//! # Ok::<(), ubms_lib::Error>(())
//! ```

use crate::protocol::{Filter, Frame};
use crate::transport::{CyclicSender, PeriodicHandle, Transport};
use crate::Error;
use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, Frame as _, Socket, SocketOptions, StandardId,
};
use std::io::ErrorKind;
use std::time::Duration;

pub struct SocketCanTransport {
    interface: String,
    socket: CanSocket,
}

impl SocketCanTransport {
    pub fn open(interface: &str) -> Result<Self, Error> {
        let socket = CanSocket::open(interface)?;
        log::info!("Opened CAN socket on {interface}");
        Ok(Self {
            interface: interface.to_string(),
            socket,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

fn to_can_frame(frame: &Frame) -> Result<CanFrame, Error> {
    let id = StandardId::new(frame.id()).ok_or(Error::RangeError)?;
    <CanFrame as EmbeddedFrame>::new(id, frame.payload()).ok_or(Error::RangeError)
}

fn write(socket: &CanSocket, frame: &Frame) -> Result<(), Error> {
    socket
        .write_frame(&to_can_frame(frame)?)
        .map_err(|e| Error::Transport(format!("cannot send {frame:?}: {e}")))
}

impl Transport for SocketCanTransport {
    fn send(&self, frame: &Frame) -> Result<(), Error> {
        write(&self.socket, frame)
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Frame>, Error> {
        self.socket.set_read_timeout(timeout)?;
        match self.socket.read_frame() {
            Ok(CanFrame::Data(frame)) if !EmbeddedFrame::is_extended(&frame) => Ok(Some(
                Frame::new(frame.raw_id() as u16, EmbeddedFrame::data(&frame))?,
            )),
            Ok(other) => {
                log::trace!("Ignoring frame {other:?}");
                Ok(None)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(Error::Transport(format!(
                "cannot read from {}: {e}",
                self.interface
            ))),
        }
    }

    fn set_filters(&self, filters: &[Filter]) -> Result<(), Error> {
        let filters: Vec<CanFilter> = filters
            .iter()
            .map(|f| CanFilter::new(u32::from(f.id), u32::from(f.mask)))
            .collect();
        self.socket.set_filters(&filters)?;
        log::debug!("Set {} CAN filters on {}", filters.len(), self.interface);
        Ok(())
    }

    fn send_periodic(&self, frame: Frame, period: Duration) -> Result<PeriodicHandle, Error> {
        // The cyclic sender gets its own socket so a blocking receive never delays it
        let socket = CanSocket::open(&self.interface)?;
        socket.set_filter_drop_all()?;
        let sender = CyclicSender::spawn(frame, period, move |frame| write(&socket, frame))?;
        Ok(PeriodicHandle::Modifiable(Box::new(sender)))
    }
}
