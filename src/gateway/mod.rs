pub mod protocol;

use crate::bus::MessageBus;
use crate::envelope::RadioEnvelope;
use crate::radio::dr_to_sf_bw;
use base64::Engine;
use protocol::{GatewayEui, InboundPacket, PullRespPayload, PushDataPayload, Rxpk};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// The gateway side of the Semtech UDP packet-forwarder link: sends
/// PUSH_DATA uplinks, keeps the NAT path open with PULL_DATA, and schedules
/// inbound PULL_RESP downlinks by concentrator timestamp before publishing
/// them on the message bus.
pub struct GatewayAdapter {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    eui: GatewayEui,
    bus: MessageBus,
    concentrator_start: Instant,
    token_counter: AtomicU16,
}

impl GatewayAdapter {
    pub async fn connect(server_addr: SocketAddr, eui: GatewayEui, bus: MessageBus) -> anyhow::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        info!(%server_addr, eui = %hex::encode(eui), "gateway adapter bound");
        Ok(Arc::new(Self {
            socket,
            server_addr,
            eui,
            bus,
            concentrator_start: Instant::now(),
            token_counter: AtomicU16::new(0),
        }))
    }

    fn next_token(&self) -> u16 {
        self.token_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn concentrator_tmst(&self) -> u32 {
        (self.concentrator_start.elapsed().as_micros() % (1u128 << 32)) as u32
    }

    /// Spawn the keep-alive (PULL_DATA every 5s) and receive-loop tasks.
    /// Returns immediately; the tasks run until the process exits.
    pub fn start(self: &Arc<Self>) {
        let keepalive_adapter = self.clone();
        tokio::spawn(async move { keepalive_adapter.run_keepalive().await });

        let recv_adapter = self.clone();
        tokio::spawn(async move { recv_adapter.run_recv_loop().await });
    }

    async fn run_keepalive(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let token = self.next_token();
            let packet = protocol::pull_data(token, &self.eui);
            if let Err(e) = self.socket.send_to(&packet, self.server_addr).await {
                warn!(error = %e, "failed to send PULL_DATA keepalive");
            } else {
                debug!(token, "sent PULL_DATA keepalive");
            }
        }
    }

    async fn run_recv_loop(&self) {
        let mut buf = vec![0u8; 65535];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, _src)) => match protocol::parse_inbound(&buf[..len]) {
                    Ok(packet) => self.handle_inbound(packet).await,
                    Err(e) => warn!(error = %e, "failed to parse inbound GWMP packet"),
                },
                Err(e) => warn!(error = %e, "UDP recv error"),
            }
        }
    }

    async fn handle_inbound(&self, packet: InboundPacket) {
        match packet {
            InboundPacket::PushAck { random_token } => {
                debug!(token = random_token, "PUSH_ACK received");
            }
            InboundPacket::PullAck { random_token } => {
                debug!(token = random_token, "PULL_ACK received");
            }
            InboundPacket::PullResp { random_token, json_payload } => {
                debug!(token = random_token, "PULL_RESP received");
                if let Err(e) = self.schedule_downlink(&json_payload).await {
                    warn!(error = %e, "failed to process PULL_RESP");
                }
            }
        }
    }

    async fn schedule_downlink(&self, json_payload: &str) -> anyhow::Result<()> {
        let raw_value: serde_json::Value = serde_json::from_str(json_payload)?;
        if raw_value.get("txpk").is_none() {
            // A real network server occasionally pushes status chatter down the
            // same socket (e.g. a `stat` object); it's not a scheduled downlink
            // so it's accepted and ignored rather than treated as a parse error.
            debug!("ignoring non-txpk payload on the downlink path");
            return Ok(());
        }
        let payload: PullRespPayload = serde_json::from_value(raw_value)?;
        let txpk = payload.txpk;

        let raw = base64::engine::general_purpose::STANDARD.decode(&txpk.data)?;

        if let Some(target_tmst) = txpk.tmst {
            let now = self.concentrator_tmst();
            let wait_us = target_tmst.wrapping_sub(now);
            // A small/negative-looking wait (wrapped near u32::MAX) is treated
            // as "now"; anything plausible is actually waited out.
            if wait_us > 0 && wait_us < 60_000_000 {
                tokio::time::sleep(Duration::from_micros(wait_us as u64)).await;
            }
        }

        let (sf, bw) = parse_datr(&txpk.datr).unwrap_or_else(|| dr_to_sf_bw(0));
        let dev_addr = if raw.len() >= 5 {
            u32::from_le_bytes(raw[1..5].try_into().unwrap())
        } else {
            0
        };

        let mut envelope = RadioEnvelope {
            payload: raw,
            dev_addr,
            frequency_hz: (txpk.freq * 1_000_000.0) as u32,
            channel_index: 0,
            spreading_factor: sf,
            bandwidth_khz: bw,
            coding_rate: "4/5",
            tx_power_dbm: txpk.powe.unwrap_or(14) as i8,
            rssi: None,
            snr: None,
            size: 0,
            concentrator_tmst: txpk.tmst,
            utc_iso: None,
            distance_m: 0.0,
            environment: String::new(),
        };
        envelope.enrich();

        self.bus.publish(envelope).await;
        Ok(())
    }

    /// Encode and send one uplink envelope as a PUSH_DATA datagram.
    pub async fn send_uplink(&self, envelope: &RadioEnvelope) -> anyhow::Result<()> {
        let rxpk = Rxpk {
            time: envelope.utc_iso.clone().unwrap_or_default(),
            tmst: envelope.concentrator_tmst.unwrap_or_else(|| self.concentrator_tmst()),
            chan: envelope.channel_index,
            rfch: 0,
            freq: envelope.frequency_hz as f64 / 1_000_000.0,
            stat: 1,
            modu: "LORA".to_string(),
            datr: envelope.data_rate_string(),
            codr: envelope.coding_rate.to_string(),
            rssi: envelope.rssi.unwrap_or(0.0),
            lsnr: envelope.snr.unwrap_or(0.0),
            size: envelope.size as u16,
            data: base64::engine::general_purpose::STANDARD.encode(&envelope.payload),
        };

        let json = serde_json::to_string(&PushDataPayload { rxpk: vec![rxpk] })?;
        let token = self.next_token();
        let packet = protocol::push_data(token, &self.eui, &json);
        self.socket.send_to(&packet, self.server_addr).await?;
        info!(token, bytes = packet.len(), "sent PUSH_DATA uplink");
        Ok(())
    }
}

fn parse_datr(datr: &str) -> Option<(u8, u16)> {
    let rest = datr.strip_prefix("SF")?;
    let (sf_str, bw_str) = rest.split_once("BW")?;
    Some((sf_str.parse().ok()?, bw_str.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_datr_handles_standard_format() {
        assert_eq!(parse_datr("SF7BW125"), Some((7, 125)));
        assert_eq!(parse_datr("SF12BW500"), Some((12, 500)));
        assert_eq!(parse_datr("garbage"), None);
    }

    #[tokio::test]
    async fn connect_binds_a_local_socket() {
        let bus = MessageBus::new();
        let adapter = GatewayAdapter::connect("127.0.0.1:1700".parse().unwrap(), [1; 8], bus)
            .await
            .unwrap();
        assert!(adapter.concentrator_tmst() < u32::MAX);
    }
}
