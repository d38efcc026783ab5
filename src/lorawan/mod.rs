//! PHYPayload construction and decoding for LoRaWAN Class A uplinks/downlinks.
//!
//! Frame layout (unconfirmed/confirmed data, up or down):
//!   MHDR(1) | DevAddr(4,LE) | FCtrl(1) | FCnt(2,LE) | FOpts(0..15) |
//!   [FPort(1) | FRMPayload(N)] | MIC(4)

pub mod mac;

use crate::crypto::{self, Direction};
use crate::error::SimError;
use std::fmt;

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    fn mhdr_byte(self) -> u8 {
        // MType in bits 7-5, RFU in 4-2, Major=0b00 (LoRaWAN R1) in 1-0.
        (match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        }) << 5
    }
}

impl TryFrom<u8> for MType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match (value >> 5) & 0x07 {
            0b000 => Ok(MType::JoinRequest),
            0b001 => Ok(MType::JoinAccept),
            0b010 => Ok(MType::UnconfirmedDataUp),
            0b011 => Ok(MType::UnconfirmedDataDown),
            0b100 => Ok(MType::ConfirmedDataUp),
            0b101 => Ok(MType::ConfirmedDataDown),
            0b110 => Ok(MType::RejoinRequest),
            0b111 => Ok(MType::Proprietary),
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MType::JoinRequest => "JoinRequest",
            MType::JoinAccept => "JoinAccept",
            MType::UnconfirmedDataUp => "UnconfirmedDataUp",
            MType::UnconfirmedDataDown => "UnconfirmedDataDown",
            MType::ConfirmedDataUp => "ConfirmedDataUp",
            MType::ConfirmedDataDown => "ConfirmedDataDown",
            MType::RejoinRequest => "RejoinRequest",
            MType::Proprietary => "Proprietary",
        };
        write!(f, "{}", s)
    }
}

/// Frame Control byte (FCtrl).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub class_b_or_f_pending: bool,
    pub f_opts_len: u8,
}

impl FCtrl {
    fn to_byte(self) -> u8 {
        let mut b = self.f_opts_len & 0x0F;
        if self.adr {
            b |= 0x80;
        }
        if self.adr_ack_req {
            b |= 0x40;
        }
        if self.ack {
            b |= 0x20;
        }
        if self.class_b_or_f_pending {
            b |= 0x10;
        }
        b
    }

    fn from_byte(b: u8) -> Self {
        Self {
            adr: b & 0x80 != 0,
            adr_ack_req: b & 0x40 != 0,
            ack: b & 0x20 != 0,
            class_b_or_f_pending: b & 0x10 != 0,
            f_opts_len: b & 0x0F,
        }
    }
}

/// A decoded data-frame (uplink or downlink).
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub mtype: MType,
    pub dev_addr: u32,
    pub fctrl: FCtrl,
    pub fcnt16: u16,
    pub f_opts: Vec<u8>,
    pub f_port: Option<u8>,
    /// Raw (still encrypted) FRMPayload bytes.
    pub frm_payload: Vec<u8>,
    pub mic: [u8; 4],
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} DevAddr={:08X} FCnt={} FPort={} FRMPayload={}B FOpts={}B",
            self.mtype,
            self.dev_addr,
            self.fcnt16,
            self.f_port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            self.frm_payload.len(),
            self.f_opts.len(),
        )
    }
}

/// Parameters for building an uplink PHYPayload.
pub struct UplinkFrame<'a> {
    pub confirmed: bool,
    pub dev_addr: u32,
    pub fcnt: u32,
    pub f_opts: &'a [u8],
    /// `None` when the uplink carries only FOpts MAC commands.
    pub f_port: Option<u8>,
    pub app_payload: &'a [u8],
    pub adr: bool,
    pub nwk_s_key: &'a [u8; 16],
    pub app_s_key: &'a [u8; 16],
}

/// Build a complete uplink PHYPayload: MHDR | DevAddr | FCtrl | FCnt | FOpts |
/// [FPort | FRMPayload] | MIC.
pub fn build_uplink(frame: &UplinkFrame) -> Result<Vec<u8>, SimError> {
    if frame.f_opts.len() > 15 {
        return Err(SimError::FOptsTooLong(frame.f_opts.len() as u8));
    }

    let mtype = if frame.confirmed {
        MType::ConfirmedDataUp
    } else {
        MType::UnconfirmedDataUp
    };

    let fctrl = FCtrl {
        adr: frame.adr,
        f_opts_len: frame.f_opts.len() as u8,
        ..Default::default()
    };

    let mut mac_payload = Vec::with_capacity(7 + frame.f_opts.len() + 1 + frame.app_payload.len());
    mac_payload.extend_from_slice(&frame.dev_addr.to_le_bytes());
    mac_payload.push(fctrl.to_byte());
    mac_payload.extend_from_slice(&(frame.fcnt as u16).to_le_bytes());
    mac_payload.extend_from_slice(frame.f_opts);

    if let Some(port) = frame.f_port {
        let key = if port == 0 { frame.nwk_s_key } else { frame.app_s_key };
        let encrypted = crypto::encrypt_payload(frame.app_payload, key, frame.dev_addr, frame.fcnt, Direction::Up);
        mac_payload.push(port);
        mac_payload.extend_from_slice(&encrypted);
    }

    let mut msg = Vec::with_capacity(1 + mac_payload.len());
    msg.push(mtype.mhdr_byte());
    msg.extend_from_slice(&mac_payload);

    let mic = crypto::compute_mic(&msg, frame.nwk_s_key, frame.dev_addr, frame.fcnt, Direction::Up);

    let mut phy = msg;
    phy.extend_from_slice(&mic);
    Ok(phy)
}

/// Parse and accept a downlink PHYPayload destined for `expected_dev_addr`.
///
/// Returns the decoded [`DataFrame`] without attempting MIC verification
/// (see design notes). Rejects mismatched DevAddr and unsupported MType.
pub fn parse_downlink(data: &[u8], expected_dev_addr: u32) -> Result<DataFrame, SimError> {
    if data.is_empty() {
        return Err(SimError::EmptyPayload);
    }
    if data.len() < 12 {
        return Err(SimError::FrameTooShort(data.len()));
    }

    let mhdr = data[0];
    let mtype = MType::try_from(mhdr).map_err(|_| SimError::UnsupportedMType)?;
    if !matches!(mtype, MType::UnconfirmedDataDown | MType::ConfirmedDataDown) {
        return Err(SimError::UnsupportedMType);
    }

    let dev_addr = u32::from_le_bytes(data[1..5].try_into().unwrap());
    if dev_addr != expected_dev_addr {
        return Err(SimError::DevAddrMismatch {
            frame: dev_addr,
            expected: expected_dev_addr,
        });
    }

    let fctrl = FCtrl::from_byte(data[5]);
    let fcnt16 = u16::from_le_bytes(data[6..8].try_into().unwrap());

    let f_opts_end = 8 + fctrl.f_opts_len as usize;
    let mic_start = data.len().checked_sub(4).ok_or(SimError::FrameTooShort(data.len()))?;
    if f_opts_end > mic_start {
        return Err(SimError::FOptsOverrun(fctrl.f_opts_len));
    }
    let f_opts = data[8..f_opts_end].to_vec();

    let (f_port, frm_payload) = if f_opts_end < mic_start {
        let f_port = data[f_opts_end];
        let frm_payload = data[f_opts_end + 1..mic_start].to_vec();
        (Some(f_port), frm_payload)
    } else {
        (None, Vec::new())
    };

    let mic: [u8; 4] = data[mic_start..].try_into().unwrap();

    Ok(DataFrame {
        mtype,
        dev_addr,
        fctrl,
        fcnt16,
        f_opts,
        f_port,
        frm_payload,
        mic,
    })
}

/// Decrypt a downlink FRMPayload. `fcnt` is the full internal 32-bit counter
/// reconstructed from the wire's 16-bit value by the caller.
pub fn decrypt_downlink_payload(frame: &DataFrame, key: &[u8; 16], fcnt: u32) -> Vec<u8> {
    crypto::encrypt_payload(&frame.frm_payload, key, frame.dev_addr, fcnt, Direction::Down)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> ([u8; 16], [u8; 16]) {
        ([0x11; 16], [0x22; 16])
    }

    #[test]
    fn build_uplink_has_expected_length_and_fctrl() {
        let (nwk, app) = keys();
        let frame = UplinkFrame {
            confirmed: false,
            dev_addr: 0x0102_0304,
            fcnt: 0,
            f_opts: &[],
            f_port: Some(1),
            app_payload: &[0x01, 0x64],
            adr: false,
            nwk_s_key: &nwk,
            app_s_key: &app,
        };
        let phy = build_uplink(&frame).unwrap();
        // MHDR+DevAddr+FCtrl+FCnt+FPort+2B payload+MIC = 1+4+1+2+1+2+4 = 15
        assert_eq!(phy.len(), 15);
        assert_eq!(phy[0], 0x40);
        assert_eq!(phy[5] & 0x0F, 0);
    }

    #[test]
    fn uplink_build_parse_round_trip_via_downlink_shape() {
        // Build an uplink then reinterpret the bytes through the downlink
        // parser logic by flipping MType, to exercise the shared FOpts/FPort
        // slicing logic end to end.
        let (nwk, app) = keys();
        let frame = UplinkFrame {
            confirmed: false,
            dev_addr: 0xAABB_CCDD,
            fcnt: 3,
            f_opts: &[0x02],
            f_port: Some(5),
            app_payload: b"hi",
            adr: true,
            nwk_s_key: &nwk,
            app_s_key: &app,
        };
        let mut phy = build_uplink(&frame).unwrap();
        // Flip MType to UnconfirmedDataDown (0b011) so parse_downlink accepts it.
        phy[0] = MType::UnconfirmedDataDown.mhdr_byte();
        let parsed = parse_downlink(&phy, 0xAABB_CCDD).unwrap();
        assert_eq!(parsed.dev_addr, 0xAABB_CCDD);
        assert_eq!(parsed.fcnt16, 3);
        assert_eq!(parsed.f_opts, vec![0x02]);
        assert_eq!(parsed.f_port, Some(5));

        let decrypted = decrypt_downlink_payload(&parsed, &app, 3);
        assert_eq!(decrypted, b"hi");
    }

    #[test]
    fn fopts_length_boundary() {
        let (nwk, app) = keys();
        let f_opts_15 = vec![0u8; 15];
        let frame = UplinkFrame {
            confirmed: false,
            dev_addr: 1,
            fcnt: 0,
            f_opts: &f_opts_15,
            f_port: None,
            app_payload: &[],
            adr: false,
            nwk_s_key: &nwk,
            app_s_key: &app,
        };
        assert!(build_uplink(&frame).is_ok());

        let f_opts_16 = vec![0u8; 16];
        let frame16 = UplinkFrame { f_opts: &f_opts_16, ..frame };
        assert!(matches!(build_uplink(&frame16), Err(SimError::FOptsTooLong(16))));
    }

    #[test]
    fn parse_downlink_rejects_dev_addr_mismatch() {
        let data = vec![0x60, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0, 0, 0, 0];
        let err = parse_downlink(&data, 0xFFFF_FFFF).unwrap_err();
        assert!(matches!(err, SimError::DevAddrMismatch { .. }));
    }

    #[test]
    fn parse_downlink_rejects_too_short() {
        let err = parse_downlink(&[0x60, 0x01, 0x02], 1).unwrap_err();
        assert!(matches!(err, SimError::FrameTooShort(3)));
    }

    #[test]
    fn empty_payload_fails() {
        assert!(matches!(parse_downlink(&[], 0).unwrap_err(), SimError::EmptyPayload));
    }
}
