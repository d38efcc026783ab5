//! Semtech UDP Packet Forwarder protocol (GWMP) framing.
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! Every datagram opens with `0x02 | token(2B BE) | identifier(1B) | GatewayEUI(8B)`.
//! This simulator plays the *gateway* role: it originates PUSH_DATA/PULL_DATA
//! and receives PULL_RESP, the mirror image of a network-server-side
//! implementation.

use crate::error::SimError;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Identifier {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for Identifier {
    type Error = SimError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Identifier::PushData),
            0x01 => Ok(Identifier::PushAck),
            0x02 => Ok(Identifier::PullData),
            0x03 => Ok(Identifier::PullResp),
            0x04 => Ok(Identifier::PullAck),
            0x05 => Ok(Identifier::TxAck),
            other => Err(SimError::UnknownGwmpIdentifier(other)),
        }
    }
}

pub type GatewayEui = [u8; 8];

/// A datagram received *by* the simulated gateway (PUSH_ACK/PULL_ACK/PULL_RESP).
#[derive(Debug)]
pub enum InboundPacket {
    PushAck { random_token: u16 },
    PullAck { random_token: u16 },
    PullResp { random_token: u16, json_payload: String },
}

/// Parse an inbound UDP datagram. Unlike the network-server side, a gateway
/// client never receives PUSH_DATA/PULL_DATA — only their acks and PULL_RESP.
pub fn parse_inbound(data: &[u8]) -> Result<InboundPacket, SimError> {
    if data.len() < 4 {
        return Err(SimError::GwmpTooShort(data.len()));
    }
    let mut buf = &data[..];
    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(SimError::UnsupportedGwmpVersion(version));
    }
    let random_token = buf.get_u16();
    let identifier = Identifier::try_from(buf.get_u8())?;

    match identifier {
        Identifier::PushAck => Ok(InboundPacket::PushAck { random_token }),
        Identifier::PullAck => Ok(InboundPacket::PullAck { random_token }),
        Identifier::PullResp => {
            let json_payload = String::from_utf8_lossy(buf).into_owned();
            Ok(InboundPacket::PullResp { random_token, json_payload })
        }
        other => Err(SimError::UnknownGwmpIdentifier(other as u8)),
    }
}

fn header(token: u16, id: Identifier, eui: &GatewayEui) -> BytesMut {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(token);
    buf.put_u8(id as u8);
    buf.put_slice(eui);
    buf
}

/// Build a PUSH_DATA datagram carrying `{"rxpk":[...]}`.
pub fn push_data(token: u16, eui: &GatewayEui, json: &str) -> Vec<u8> {
    let mut buf = header(token, Identifier::PushData, eui);
    buf.put_slice(json.as_bytes());
    buf.to_vec()
}

/// Build a PULL_DATA keep-alive datagram (no JSON body).
pub fn pull_data(token: u16, eui: &GatewayEui) -> Vec<u8> {
    header(token, Identifier::PullData, eui).to_vec()
}

/// A single received-packet record, as emitted on PUSH_DATA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    pub time: String,
    pub tmst: u32,
    pub chan: u8,
    pub rfch: u8,
    pub freq: f64,
    pub stat: i8,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub rssi: f64,
    pub lsnr: f64,
    pub size: u16,
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct PushDataPayload {
    pub rxpk: Vec<Rxpk>,
}

/// A scheduled-transmit record, as received inside PULL_RESP.
#[derive(Debug, Clone, Deserialize)]
pub struct Txpk {
    pub imme: Option<bool>,
    pub tmst: Option<u32>,
    pub freq: f64,
    pub powe: Option<u8>,
    pub modu: Option<String>,
    pub datr: String,
    pub codr: Option<String>,
    pub size: u16,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_for_push_and_pull() {
        let eui: GatewayEui = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];
        let packet = pull_data(0x1234, &eui);
        assert_eq!(packet[0], PROTOCOL_VERSION);
        assert_eq!(u16::from_be_bytes([packet[1], packet[2]]), 0x1234);
        assert_eq!(packet[3], Identifier::PullData as u8);
        assert_eq!(&packet[4..12], &eui);
    }

    #[test]
    fn parse_inbound_pull_resp() {
        let json = r#"{"txpk":{"freq":869.525,"datr":"SF12BW125","size":4,"data":"AQIDBA=="}}"#;
        let mut packet = vec![PROTOCOL_VERSION, 0x00, 0x42, Identifier::PullResp as u8];
        packet.extend_from_slice(json.as_bytes());
        let parsed = parse_inbound(&packet).unwrap();
        match parsed {
            InboundPacket::PullResp { random_token, json_payload } => {
                assert_eq!(random_token, 0x42);
                assert!(json_payload.contains("869.525"));
            }
            _ => panic!("expected PullResp"),
        }
    }

    #[test]
    fn rejects_short_packet() {
        assert!(matches!(parse_inbound(&[0x02, 0x00]), Err(SimError::GwmpTooShort(2))));
    }

    #[test]
    fn rejects_unsupported_version() {
        let packet = [0x01, 0x00, 0x00, Identifier::PullAck as u8];
        assert!(matches!(parse_inbound(&packet), Err(SimError::UnsupportedGwmpVersion(0x01))));
    }
}
