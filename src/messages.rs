use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use transport::buf_ext::BufExt;
use transport::packet_header::MessageType;
use uuid::Uuid;

/// Commands a controller sends to a grabber process
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    /// shut down the grabber's host machine
    Shutdown = 0,
    /// restart the grabber's host machine
    Restart = 1,
    /// stop sending to the controller until the next 'init connection'
    Disconnect = 2,
    /// terminate the grabber process
    Quit = 3,
    UpdateDeviceList = 4,
}

impl Command {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8((*self).into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Command> {
        let raw = buf.read_u8()?;
        Command::try_from(raw).map_err(|_| anyhow!("invalid command {}", raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FeedbackKind {
    MessageReceived = 0,
    Shutdown = 1,
    Restart = 2,
    Disconnect = 3,
    Quit = 4,
    UpdateDeviceList = 5,
}

impl From<Command> for FeedbackKind {
    fn from(value: Command) -> Self {
        match value {
            Command::Shutdown => FeedbackKind::Shutdown,
            Command::Restart => FeedbackKind::Restart,
            Command::Disconnect => FeedbackKind::Disconnect,
            Command::Quit => FeedbackKind::Quit,
            Command::UpdateDeviceList => FeedbackKind::UpdateDeviceList,
        }
    }
}

/// Acknowledgement a grabber sends for every control message it processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feedback {
    pub received_message_type: MessageType,
    pub kind: FeedbackKind,
}

impl Feedback {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.received_message_type.into());
        buf.put_u8(self.kind.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Feedback> {
        let raw_type = buf.read_u8()?;
        let received_message_type = MessageType::try_from(raw_type)
            .map_err(|_| anyhow!("invalid message type {}", raw_type))?;
        let raw_kind = buf.read_u8()?;
        let kind = FeedbackKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid feedback kind {}", raw_kind))?;

        Ok(Feedback { received_message_type, kind })
    }
}

/// Sent by a controller to a grabber to (re)start a streaming session. The grabber sends frames
///  and feedback to `reply_addr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitConnection {
    /// identifies the controller's session; a new value means the controller restarted
    pub session: Uuid,
    pub reply_addr: SocketAddr,
    /// the biggest datagram the controller wants to receive, including the packet header
    pub max_datagram_size: u16,
}

impl InitConnection {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u128(self.session.as_u128());
        ser_socket_addr(&self.reply_addr, buf);
        buf.put_u16(self.max_datagram_size);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<InitConnection> {
        Ok(InitConnection {
            session: Uuid::from_u128(buf.read_u128()?),
            reply_addr: deser_socket_addr(buf)?,
            max_datagram_size: buf.read_u16()?,
        })
    }
}

fn ser_socket_addr(addr: &SocketAddr, buf: &mut BytesMut) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

fn deser_socket_addr(buf: &mut impl Buf) -> anyhow::Result<SocketAddr> {
    let ip = match buf.read_u8()? {
        4 => IpAddr::V4(Ipv4Addr::from(buf.read_u32()?)),
        6 => IpAddr::V6(Ipv6Addr::from(buf.read_u128()?)),
        n => bail!("invalid address family {}", n),
    };
    Ok(SocketAddr::new(ip, buf.read_u16()?))
}
