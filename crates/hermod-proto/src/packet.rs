//! The cross-node logic packet: the payload of Binary frames exchanged
//! between gateways and logic nodes.
//!
//! Envelope layout:
//!
//! ```text
//!  +-------+------+---------+------------+-----------+----------+--------+
//!  | magic | flag | version | header len | header    | body len | body   |
//!  |   4   |  1   |    1    |   4 (BE)   | protobuf  |  4 (BE)  | opaque |
//!  +-------+------+---------+------------+-----------+----------+--------+
//! ```
//!
//! Body encoding is the caller's responsibility; the envelope treats it as
//! opaque bytes.

use std::collections::HashMap;

use bytes::{Buf, BufMut};
use prost::Message;

use crate::frame::WireError;
use crate::metakey;

/// Identifies a byte stream as a logic packet.
pub const MAGIC: [u8; 4] = [0xc3, 0x11, 0xa3, 0x65];

/// Envelope version this codec speaks.
pub const VERSION: u8 = 1;

/// Packet direction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    Request = 1,
    Response = 2,
    Push = 3,
}

impl TryFrom<u8> for Flag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(Flag::Request),
            2 => Ok(Flag::Response),
            3 => Ok(Flag::Push),
            other => Err(WireError::UnknownFlag(other)),
        }
    }
}

/// Response status carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Unspecified = 0,
    Success = 10,
    NoDestination = 100,
    NotImplemented = 101,
    SessionLost = 105,
    InvalidPacket = 400,
    SystemException = 500,
}

/// Routing header of a logic packet.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    /// Command string, e.g. `chat.talk`. The prefix names the owning
    /// service.
    #[prost(string, tag = "1")]
    pub command: String,
    /// Id of the originating client channel.
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(uint32, tag = "3")]
    pub sequence: u32,
    #[prost(enumeration = "Status", tag = "4")]
    pub status: i32,
    #[prost(map = "string, string", tag = "5")]
    pub meta: HashMap<String, String>,
}

/// A routed application message: header plus opaque body.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub flag: Flag,
    pub header: Header,
    pub body: Vec<u8>,
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new("")
    }
}

impl Packet {
    pub fn new(command: &str) -> Self {
        Packet {
            flag: Flag::Request,
            header: Header {
                command: command.to_owned(),
                ..Header::default()
            },
            body: Vec::new(),
        }
    }

    /// Build a reply packet preserving the request's command, channel id and
    /// sequence.
    pub fn from_header(header: &Header) -> Self {
        Packet {
            flag: Flag::Response,
            header: Header {
                command: header.command.clone(),
                channel_id: header.channel_id.clone(),
                sequence: header.sequence,
                ..Header::default()
            },
            body: Vec::new(),
        }
    }

    pub fn set_status(&mut self, status: Status) {
        self.header.status = status as i32;
    }

    pub fn status(&self) -> Status {
        self.header.status()
    }

    /// Serialize `body` as the packet body.
    pub fn write_body<M: Message>(&mut self, body: &M) {
        self.body = body.encode_to_vec();
    }

    /// Decode the packet body as a protobuf message.
    pub fn read_body<M: Message + Default>(&self) -> Result<M, WireError> {
        M::decode(self.body.as_slice()).map_err(WireError::from)
    }

    pub fn set_meta(&mut self, key: &str, value: &str) {
        self.header.meta.insert(key.to_owned(), value.to_owned());
    }

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.header.meta.get(key).map(String::as_str)
    }

    pub fn del_meta(&mut self, key: &str) {
        self.header.meta.remove(key);
    }

    /// Channel ids listed under the `dest_channels` routing key.
    pub fn dest_channels(&self) -> Option<Vec<String>> {
        self.get_meta(metakey::DEST_CHANNELS).map(|v| {
            v.split(',')
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
    }

    /// Serialize the envelope.
    pub fn encode(&self) -> Vec<u8> {
        let header = self.header.encode_to_vec();
        let mut buf = Vec::with_capacity(MAGIC.len() + 2 + 8 + header.len() + self.body.len());
        buf.put_slice(&MAGIC);
        buf.put_u8(self.flag as u8);
        buf.put_u8(VERSION);
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf
    }

    /// Parse the envelope, verifying magic and version.
    pub fn decode(mut buf: &[u8]) -> Result<Packet, WireError> {
        if buf.len() < MAGIC.len() + 2 {
            return Err(WireError::Truncated);
        }
        if buf[..MAGIC.len()] != MAGIC {
            return Err(WireError::BadMagic);
        }
        buf.advance(MAGIC.len());
        let flag = Flag::try_from(buf.get_u8())?;
        let version = buf.get_u8();
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let header_len = read_len(&mut buf)?;
        let header = Header::decode(&buf[..header_len])?;
        buf.advance(header_len);

        let body_len = read_len(&mut buf)?;
        let body = buf[..body_len].to_vec();

        Ok(Packet { flag, header, body })
    }
}

fn read_len(buf: &mut &[u8]) -> Result<usize, WireError> {
    if buf.len() < 4 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if len > buf.len() {
        return Err(WireError::Truncated);
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::LoginReq;

    #[test]
    fn packet_roundtrip_preserves_header_meta_and_body() {
        let mut packet = Packet::new("chat.talk");
        packet.header.channel_id = "c1".to_owned();
        packet.header.sequence = 7;
        packet.set_status(Status::Success);
        packet.set_meta(metakey::DEST_SERVER, "chat_1");
        packet.set_meta(metakey::DEST_CHANNELS, "c1,c2");
        packet.set_meta("trace", "abc");
        packet.write_body(&LoginReq {
            account: "acc1".to_owned(),
            device: "ios".to_owned(),
        });

        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.status(), Status::Success);
        assert_eq!(decoded.get_meta("trace"), Some("abc"));
        assert_eq!(
            decoded.dest_channels(),
            Some(vec!["c1".to_owned(), "c2".to_owned()])
        );

        let body: LoginReq = decoded.read_body().unwrap();
        assert_eq!(body.account, "acc1");
    }

    #[test]
    fn from_header_preserves_routing_identity_only() {
        let mut request = Packet::new("login.signin");
        request.header.channel_id = "c9".to_owned();
        request.header.sequence = 3;
        request.set_meta(metakey::DEST_SERVER, "gateway_1");

        let reply = Packet::from_header(&request.header);
        assert_eq!(reply.flag, Flag::Response);
        assert_eq!(reply.header.command, "login.signin");
        assert_eq!(reply.header.channel_id, "c9");
        assert_eq!(reply.header.sequence, 3);
        assert!(reply.header.meta.is_empty());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = Packet::new("x").encode();
        bytes[0] ^= 0xff;
        assert!(matches!(Packet::decode(&bytes), Err(WireError::BadMagic)));
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let bytes = Packet::new("x").encode();
        assert!(matches!(
            Packet::decode(&bytes[..bytes.len() - 1]),
            Err(WireError::Truncated)
        ));
    }
}
