//! The radio envelope shared between uplink construction, channel
//! simulation, the gateway adapter, and downlink delivery.

use chrono::{SecondsFormat, Utc};

#[derive(Debug, Clone)]
pub struct RadioEnvelope {
    pub payload: Vec<u8>,
    pub dev_addr: u32,
    pub frequency_hz: u32,
    pub channel_index: u8,
    pub spreading_factor: u8,
    pub bandwidth_khz: u16,
    pub coding_rate: &'static str,
    pub tx_power_dbm: i8,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
    pub size: usize,
    pub concentrator_tmst: Option<u32>,
    pub utc_iso: Option<String>,
    pub distance_m: f64,
    pub environment: String,
}

impl RadioEnvelope {
    /// Fill `size` and `utc_iso` if absent, mirroring the prototype's enrich
    /// step that normalizes an envelope before it crosses a component
    /// boundary. `utc_iso` is `Z`-suffixed UTC, as the rxpk `time` field
    /// requires, not chrono's default `+00:00` offset notation.
    pub fn enrich(&mut self) {
        self.size = self.payload.len();
        if self.utc_iso.is_none() {
            self.utc_iso = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
    }

    pub fn data_rate_string(&self) -> String {
        format!("SF{}BW{}", self.spreading_factor, self.bandwidth_khz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrich_fills_size_and_timestamp() {
        let mut env = RadioEnvelope {
            payload: vec![1, 2, 3, 4],
            dev_addr: 1,
            frequency_hz: 868_100_000,
            channel_index: 0,
            spreading_factor: 7,
            bandwidth_khz: 125,
            coding_rate: "4/5",
            tx_power_dbm: 14,
            rssi: None,
            snr: None,
            size: 0,
            concentrator_tmst: None,
            utc_iso: None,
            distance_m: 1000.0,
            environment: "suburban".into(),
        };
        env.enrich();
        assert_eq!(env.size, 4);
        assert!(env.utc_iso.as_ref().is_some_and(|t| t.ends_with('Z')));
        assert_eq!(env.data_rate_string(), "SF7BW125");
    }
}
