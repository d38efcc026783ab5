//! MAC command parsing, application, and response queueing.
//!
//! Commands are modeled as a tagged enum per CID rather than a
//! heterogeneous name/payload/dict triple, so callers dispatch on the
//! variant instead of string keys.

use crate::error::SimError;
use crate::radio::RadioState;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacCommand {
    LinkCheckReq,
    LinkADRReq { data_rate: u8, tx_power: u8, ch_mask: u16, nb_trans: u8 },
    DutyCycleReq { max_duty_cycle: u8 },
    RXParamSetupReq { rx1_dr_offset: u8, rx2_data_rate: u8, rx2_frequency_hz: u32 },
    DevStatusReq,
    NewChannelReq { ch_index: u8, frequency_hz: u32, dr_min: u8, dr_max: u8 },
    RXTimingSetupReq { rx1_delay_secs: u8 },
}

impl MacCommand {
    fn cid(&self) -> u8 {
        match self {
            MacCommand::LinkCheckReq => 0x02,
            MacCommand::LinkADRReq { .. } => 0x03,
            MacCommand::DutyCycleReq { .. } => 0x04,
            MacCommand::RXParamSetupReq { .. } => 0x05,
            MacCommand::DevStatusReq => 0x06,
            MacCommand::NewChannelReq { .. } => 0x07,
            MacCommand::RXTimingSetupReq { .. } => 0x08,
        }
    }
}

fn payload_len_for_cid(cid: u8) -> Option<usize> {
    match cid {
        0x02 => Some(0),
        0x03 => Some(4),
        0x04 => Some(1),
        0x05 => Some(4),
        0x06 => Some(0),
        0x07 => Some(5),
        0x08 => Some(1),
        _ => None,
    }
}

fn decode_one(cid: u8, payload: &[u8]) -> MacCommand {
    match cid {
        0x02 => MacCommand::LinkCheckReq,
        0x03 => MacCommand::LinkADRReq {
            data_rate: payload[0] >> 4,
            tx_power: payload[0] & 0x0F,
            ch_mask: u16::from_le_bytes([payload[1], payload[2]]),
            nb_trans: payload[3] & 0x0F,
        },
        0x04 => MacCommand::DutyCycleReq { max_duty_cycle: payload[0] & 0x0F },
        0x05 => MacCommand::RXParamSetupReq {
            rx1_dr_offset: (payload[0] >> 4) & 0x07,
            rx2_data_rate: payload[0] & 0x0F,
            rx2_frequency_hz: u32::from_le_bytes([payload[1], payload[2], payload[3], 0]) * 100,
        },
        0x06 => MacCommand::DevStatusReq,
        0x07 => MacCommand::NewChannelReq {
            ch_index: payload[0],
            frequency_hz: u32::from_le_bytes([payload[1], payload[2], payload[3], 0]) * 100,
            dr_min: payload[4] & 0x0F,
            dr_max: (payload[4] >> 4) & 0x0F,
        },
        0x08 => MacCommand::RXTimingSetupReq { rx1_delay_secs: payload[0] & 0x0F },
        _ => unreachable!("decode_one only called for known CIDs"),
    }
}

/// Parse a stream of `CID ‖ payload` MAC commands. Stops (returning what
/// was parsed so far as an error-free prefix is not distinguishable from
/// the caller's perspective, so an unknown/truncated CID is surfaced as
/// an error) at the first unknown CID or truncated payload, per the
/// "unparseable once a length is unknown" rule.
pub fn parse_mac_commands(data: &[u8]) -> Result<Vec<MacCommand>, SimError> {
    let mut commands = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let cid = data[i];
        let len = match payload_len_for_cid(cid) {
            Some(len) => len,
            None => return Err(SimError::UnknownMacCid(cid)),
        };
        if i + 1 + len > data.len() {
            return Err(SimError::TruncatedMacCommand(cid));
        }
        let payload = &data[i + 1..i + 1 + len];
        commands.push(decode_one(cid, payload));
        i += 1 + len;
    }
    Ok(commands)
}

/// Encode one command back to `CID ‖ payload` (used only for tests and for
/// a network-server-side simulator that needs to originate commands).
pub fn encode_one(cmd: &MacCommand) -> Vec<u8> {
    let mut out = vec![cmd.cid()];
    match cmd {
        MacCommand::LinkCheckReq | MacCommand::DevStatusReq => {}
        MacCommand::LinkADRReq { data_rate, tx_power, ch_mask, nb_trans } => {
            out.push((data_rate << 4) | (tx_power & 0x0F));
            out.extend_from_slice(&ch_mask.to_le_bytes());
            out.push(nb_trans & 0x0F);
        }
        MacCommand::DutyCycleReq { max_duty_cycle } => out.push(*max_duty_cycle & 0x0F),
        MacCommand::RXParamSetupReq { rx1_dr_offset, rx2_data_rate, rx2_frequency_hz } => {
            out.push(((rx1_dr_offset & 0x07) << 4) | (rx2_data_rate & 0x0F));
            let f = rx2_frequency_hz / 100;
            out.extend_from_slice(&f.to_le_bytes()[..3]);
        }
        MacCommand::NewChannelReq { ch_index, frequency_hz, dr_min, dr_max } => {
            out.push(*ch_index);
            let f = frequency_hz / 100;
            out.extend_from_slice(&f.to_le_bytes()[..3]);
            out.push((dr_max << 4) | (dr_min & 0x0F));
        }
        MacCommand::RXTimingSetupReq { rx1_delay_secs } => out.push(rx1_delay_secs & 0x0F),
    }
    out
}

/// Apply a single MAC command's side effects to radio state and return the
/// response bytes (`CID ‖ payload`) to queue for the next uplink, if any.
pub fn apply_mac_command(cmd: &MacCommand, radio: &mut RadioState, last_snr: f64, battery: u8) -> Option<Vec<u8>> {
    match cmd {
        MacCommand::LinkCheckReq => None,
        MacCommand::LinkADRReq { data_rate, tx_power, ch_mask, nb_trans } => {
            radio.data_rate = *data_rate;
            radio.tx_power = *tx_power;
            radio.nb_trans = (*nb_trans).clamp(1, 15);
            radio.apply_channel_mask(*ch_mask);
            info!(data_rate, tx_power, nb_trans, ch_mask, "applied LinkADRReq");
            Some(vec![0x03, 0b111])
        }
        MacCommand::DutyCycleReq { max_duty_cycle } => {
            radio.max_duty_cycle = Some(1.0 / (1u32 << max_duty_cycle) as f64);
            debug!(max_duty_cycle, "applied DutyCycleReq");
            Some(vec![0x04])
        }
        MacCommand::RXParamSetupReq { rx1_dr_offset, rx2_data_rate, rx2_frequency_hz } => {
            radio.rx1_dr_offset = *rx1_dr_offset;
            radio.rx2_data_rate = *rx2_data_rate;
            radio.rx2_frequency_hz = *rx2_frequency_hz;
            info!(rx2_frequency_hz, rx2_data_rate, "applied RXParamSetupReq");
            Some(vec![0x05, 0b111])
        }
        MacCommand::DevStatusReq => {
            let margin = last_snr.clamp(-32.0, 31.0) as i8;
            Some(vec![0x06, battery, margin as u8])
        }
        MacCommand::NewChannelReq { ch_index, frequency_hz, dr_min, dr_max } => {
            radio.add_channel(*ch_index, *frequency_hz, *dr_min, *dr_max);
            info!(ch_index, frequency_hz, "applied NewChannelReq");
            Some(vec![0x07, 0b111])
        }
        MacCommand::RXTimingSetupReq { rx1_delay_secs } => {
            radio.rx_delay_secs = (*rx1_delay_secs).max(1);
            debug!(rx1_delay_secs, "applied RXTimingSetupReq");
            Some(vec![0x08])
        }
    }
}

/// Parse and apply a full FOpts/FRMPayload MAC-command stream, returning the
/// concatenated response bytes to embed in the next uplink.
pub fn process_mac_stream(data: &[u8], radio: &mut RadioState, last_snr: f64, battery: u8) -> Result<Vec<u8>, SimError> {
    let commands = match parse_mac_commands(data) {
        Ok(cmds) => cmds,
        Err(e) => {
            warn!(error = %e, "stopped parsing MAC command stream");
            return Err(e);
        }
    };
    let mut responses = Vec::new();
    for cmd in &commands {
        if let Some(resp) = apply_mac_command(cmd, radio, last_snr, battery) {
            responses.extend(resp);
        }
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::RadioState;

    #[test]
    fn parses_link_adr_req() {
        let data = [0x03u8, 0x52, 0xFF, 0x00, 0x01];
        let cmds = parse_mac_commands(&data).unwrap();
        assert_eq!(
            cmds,
            vec![MacCommand::LinkADRReq { data_rate: 5, tx_power: 2, ch_mask: 0x00FF, nb_trans: 1 }]
        );
    }

    #[test]
    fn unknown_cid_stops_parsing() {
        let data = [0x02u8, 0xFF, 0x01, 0x02];
        let err = parse_mac_commands(&data).unwrap_err();
        assert_eq!(err, SimError::UnknownMacCid(0xFF));
    }

    #[test]
    fn truncated_payload_errors() {
        let data = [0x03u8, 0x01, 0x02];
        let err = parse_mac_commands(&data).unwrap_err();
        assert_eq!(err, SimError::TruncatedMacCommand(0x03));
    }

    #[test]
    fn encode_decode_round_trip() {
        let cmd = MacCommand::NewChannelReq { ch_index: 3, frequency_hz: 867_100_000, dr_min: 0, dr_max: 5 };
        let bytes = encode_one(&cmd);
        let decoded = parse_mac_commands(&bytes).unwrap();
        assert_eq!(decoded, vec![cmd]);
    }

    #[test]
    fn link_adr_req_updates_radio_state_and_queues_ack() {
        let mut radio = RadioState::new_eu868_defaults();
        let cmd = MacCommand::LinkADRReq { data_rate: 5, tx_power: 2, ch_mask: 0xFFFF, nb_trans: 1 };
        let resp = apply_mac_command(&cmd, &mut radio, 0.0, 255).unwrap();
        assert_eq!(radio.data_rate, 5);
        assert_eq!(radio.tx_power, 2);
        assert_eq!(radio.nb_trans, 1);
        assert_eq!(resp, vec![0x03, 0b111]);
    }

    #[test]
    fn dev_status_req_reports_clamped_margin() {
        let mut radio = RadioState::new_eu868_defaults();
        let resp = apply_mac_command(&MacCommand::DevStatusReq, &mut radio, 100.0, 200).unwrap();
        assert_eq!(resp[0], 0x06);
        assert_eq!(resp[1], 200);
        assert_eq!(resp[2] as i8, 31);
    }
}
