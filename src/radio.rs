//! Per-device radio state: EU868 channel plan, ADR parameters, duty-cycle
//! accounting, and airtime calculation.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// DR index -> (spreading factor, bandwidth kHz), EU868 only.
const EU868_DR_TABLE: [(u8, u16); 7] = [
    (12, 125), // DR0
    (11, 125), // DR1
    (10, 125), // DR2
    (9, 125),  // DR3
    (8, 125),  // DR4
    (7, 125),  // DR5
    (7, 250),  // DR6
];

pub fn dr_to_sf_bw(dr: u8) -> (u8, u16) {
    EU868_DR_TABLE
        .get(dr as usize)
        .copied()
        .unwrap_or_else(|| {
            warn!(dr, "unknown EU868 data rate, defaulting to DR0");
            EU868_DR_TABLE[0]
        })
}

/// `T_air` in seconds for `payload_size` bytes at the given SF/BW, with an
/// explicit header and CR 4/5 (LoRaWAN's standard uplink coding).
pub fn calculate_airtime(payload_size: usize, sf: u8, bw_khz: u16) -> f64 {
    let bw_hz = bw_khz as f64 * 1000.0;
    let symbol_time = 2f64.powi(sf as i32) / bw_hz;
    let preamble_symbols = 8.0;

    let numerator = 8.0 * payload_size as f64 - 4.0 * sf as f64 + 28.0 + 16.0;
    let denominator = 4.0 * (sf as f64 - 2.0);
    let payload_symb_nb = 8.0 + (numerator / denominator).ceil().max(0.0) * 4.0;

    let total_symbols = preamble_symbols + payload_symb_nb;
    total_symbols * symbol_time
}

#[derive(Debug, Clone, Copy)]
pub struct Channel {
    pub frequency_hz: u32,
    pub dr_min: u8,
    pub dr_max: u8,
    pub duty_cycle: f64,
}

#[derive(Debug, Clone)]
pub struct RadioState {
    pub enabled_channels: BTreeMap<u8, Channel>,
    pub current_channel_index: u8,
    pub data_rate: u8,
    pub tx_power: u8,
    pub coding_rate: &'static str,
    pub rx1_dr_offset: u8,
    pub rx2_data_rate: u8,
    pub rx2_frequency_hz: u32,
    pub rx_delay_secs: u8,
    pub nb_trans: u8,
    pub max_ack_retries: u8,
    pub max_duty_cycle: Option<f64>,
    pub last_snr: f64,
    next_tx_time: BTreeMap<u8, Instant>,
    aggregate_next_tx_time: Option<Instant>,
}

impl RadioState {
    /// Default EU868 3-channel plan (the mandatory join channels) plus the
    /// single mandatory 10% duty-cycle channel.
    pub fn new_eu868_defaults() -> Self {
        let mut enabled_channels = BTreeMap::new();
        enabled_channels.insert(0, Channel { frequency_hz: 868_100_000, dr_min: 0, dr_max: 5, duty_cycle: 0.01 });
        enabled_channels.insert(1, Channel { frequency_hz: 868_300_000, dr_min: 0, dr_max: 5, duty_cycle: 0.01 });
        enabled_channels.insert(2, Channel { frequency_hz: 868_500_000, dr_min: 0, dr_max: 5, duty_cycle: 0.01 });

        Self {
            enabled_channels,
            current_channel_index: 0,
            data_rate: 5,
            tx_power: 14,
            coding_rate: "4/5",
            rx1_dr_offset: 0,
            rx2_data_rate: 0,
            rx2_frequency_hz: 869_525_000,
            rx_delay_secs: 1,
            nb_trans: 1,
            max_ack_retries: 8,
            max_duty_cycle: None,
            last_snr: 0.0,
            next_tx_time: BTreeMap::new(),
            aggregate_next_tx_time: None,
        }
    }

    pub fn current_channel(&self) -> Channel {
        self.enabled_channels[&self.current_channel_index]
    }

    pub fn current_frequency_hz(&self) -> u32 {
        self.current_channel().frequency_hz
    }

    pub fn spreading_factor_and_bw(&self) -> (u8, u16) {
        dr_to_sf_bw(self.data_rate)
    }

    /// Round-robin to the next enabled channel.
    pub fn rotate_channel(&mut self) {
        let keys: Vec<u8> = self.enabled_channels.keys().copied().collect();
        if keys.is_empty() {
            return;
        }
        let pos = keys.iter().position(|k| *k == self.current_channel_index).unwrap_or(0);
        self.current_channel_index = keys[(pos + 1) % keys.len()];
    }

    /// Enable/disable channels per the 16-bit ChMask; only ever affects
    /// channels that are already known.
    pub fn apply_channel_mask(&mut self, ch_mask: u16) {
        for i in 0..16u8 {
            let enabled_bit = (ch_mask >> i) & 1 != 0;
            if !enabled_bit {
                if self.enabled_channels.remove(&i).is_some() && self.current_channel_index == i {
                    self.rotate_channel();
                }
            } else if !self.enabled_channels.contains_key(&i) {
                warn!(channel = i, "ChMask enables an unknown channel, ignoring");
            }
        }
    }

    pub fn add_channel(&mut self, index: u8, frequency_hz: u32, dr_min: u8, dr_max: u8) {
        let duty_cycle = if frequency_hz == 869_525_000 { 0.10 } else { 0.01 };
        self.enabled_channels.insert(index, Channel { frequency_hz, dr_min, dr_max, duty_cycle });
    }

    /// `(ready, wait)`: whether channel `c` can transmit now, and if not,
    /// how long to wait.
    pub fn can_transmit(&self, channel_index: u8, airtime: Duration) -> (bool, Option<Duration>) {
        let Some(channel) = self.enabled_channels.get(&channel_index) else {
            return (false, None);
        };
        if self.data_rate < channel.dr_min || self.data_rate > channel.dr_max {
            return (false, None);
        }

        let now = Instant::now();

        if let Some(agg_next) = self.aggregate_next_tx_time {
            if now < agg_next {
                return (false, Some(agg_next - now));
            }
        }

        match self.next_tx_time.get(&channel_index) {
            Some(next) if *next > now => (false, Some(*next - now)),
            _ => {
                let _ = airtime;
                (true, None)
            }
        }
    }

    pub fn record_transmission(&mut self, channel_index: u8, airtime: Duration) {
        let now = Instant::now();
        if let Some(channel) = self.enabled_channels.get(&channel_index) {
            let wait = airtime.mul_f64(1.0 / channel.duty_cycle - 1.0);
            self.next_tx_time.insert(channel_index, now + wait);
        }
        if let Some(agg_duty) = self.max_duty_cycle {
            if agg_duty > 0.0 {
                let wait = airtime.mul_f64(1.0 / agg_duty - 1.0);
                self.aggregate_next_tx_time = Some(now + wait);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn airtime_matches_known_example() {
        // 13-byte payload at SF7/BW125 should be in the tens-of-milliseconds range.
        let t = calculate_airtime(13, 7, 125);
        assert!(t > 0.03 && t < 0.10, "unexpected airtime {t}");
    }

    #[test]
    fn channel_rotation_is_round_robin() {
        let mut radio = RadioState::new_eu868_defaults();
        assert_eq!(radio.current_channel_index, 0);
        radio.rotate_channel();
        assert_eq!(radio.current_channel_index, 1);
        radio.rotate_channel();
        assert_eq!(radio.current_channel_index, 2);
        radio.rotate_channel();
        assert_eq!(radio.current_channel_index, 0);
    }

    #[test]
    fn duty_cycle_blocks_immediate_retransmission() {
        let mut radio = RadioState::new_eu868_defaults();
        let airtime = Duration::from_millis(60);
        radio.record_transmission(0, airtime);
        let (ready, wait) = radio.can_transmit(0, airtime);
        assert!(!ready);
        assert!(wait.unwrap() > Duration::from_secs(5));
    }

    #[test]
    fn channel_mask_disables_unmasked_channels() {
        let mut radio = RadioState::new_eu868_defaults();
        radio.apply_channel_mask(0b0000_0000_0000_0001); // only channel 0 stays enabled
        assert_eq!(radio.enabled_channels.len(), 1);
        assert!(radio.enabled_channels.contains_key(&0));
    }

    #[test]
    fn new_channel_req_sets_high_duty_cycle_for_g4_band() {
        let mut radio = RadioState::new_eu868_defaults();
        radio.add_channel(3, 869_525_000, 0, 6);
        assert_eq!(radio.enabled_channels[&3].duty_cycle, 0.10);
    }
}
