//! Per-device Class-A state machine: build/NbTrans/ACK-wait/confirmed-retry
//! uplink cycle and RX1/RX2 downlink acceptance + MAC application.

use crate::channel::ChannelSimulator;
use crate::device::{ApplicationHooks, DeviceSession};
use crate::envelope::RadioEnvelope;
use crate::gateway::GatewayAdapter;
use crate::lorawan::mac;
use crate::lorawan::{self, UplinkFrame};
use crate::radio::{calculate_airtime, dr_to_sf_bw, RadioState};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

const NBTRANS_BACKOFF_RANGE: (f64, f64) = (0.5, 2.0);
const RETRY_BACKOFF_RANGE: (f64, f64) = (2.0, 6.0);

pub struct LoRaWanStack {
    session: Mutex<DeviceSession>,
    radio: Mutex<RadioState>,
    hooks: Arc<dyn ApplicationHooks>,
    gateway: Arc<GatewayAdapter>,
    channel_sim: ChannelSimulator,
    send_lock: Mutex<()>,
    ack_notify: Notify,
    rx1_open: AtomicBool,
    rx2_open: AtomicBool,
}

impl LoRaWanStack {
    pub fn new(session: DeviceSession, hooks: Arc<dyn ApplicationHooks>, gateway: Arc<GatewayAdapter>) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(session),
            radio: Mutex::new(RadioState::new_eu868_defaults()),
            hooks,
            gateway,
            channel_sim: ChannelSimulator::default(),
            send_lock: Mutex::new(()),
            ack_notify: Notify::new(),
            rx1_open: AtomicBool::new(false),
            rx2_open: AtomicBool::new(false),
        })
    }

    pub async fn dev_addr(&self) -> u32 {
        self.session.lock().await.dev_addr
    }

    pub async fn send_interval_s(&self) -> u64 {
        self.session.lock().await.send_interval_s
    }

    /// Run one full Class-A send cycle: build, transmit (with NbTrans
    /// redundancy), and for confirmed uplinks retry with back-off until
    /// acknowledged or `max_ack_retries` is exhausted.
    pub async fn send(self: &Arc<Self>, confirmed: bool) {
        let _guard = self.send_lock.lock().await;
        let max_retries = self.radio.lock().await.max_ack_retries;

        for attempt in 0..=max_retries {
            self.build_and_transmit(confirmed).await;

            if !confirmed {
                return;
            }

            let rx_delay = self.radio.lock().await.rx_delay_secs;
            let ack_wait = Duration::from_secs_f64(rx_delay as f64 + 1.1);
            let acked = tokio::time::timeout(ack_wait, self.ack_notify.notified()).await.is_ok();

            {
                let mut session = self.session.lock().await;
                session.waiting_for_ack = false;
                session.pending_fcnt = None;
            }

            if acked {
                return;
            }

            if attempt < max_retries {
                let backoff = rand::thread_rng().gen_range(RETRY_BACKOFF_RANGE.0..RETRY_BACKOFF_RANGE.1) * (attempt as f64 + 1.0);
                warn!(attempt, backoff, "confirmed uplink unacknowledged, retrying");
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            } else {
                warn!("confirmed uplink exhausted all retries without an ACK");
            }
        }
    }

    async fn build_and_transmit(self: &Arc<Self>, confirmed: bool) {
        let (phy, fcnt, fport, channel_index, sf, bw, tx_power) = {
            let mut session = self.session.lock().await;
            let radio = self.radio.lock().await;

            let pending = session.drain_mac_responses();
            let (f_opts, f_port, app_payload): (Vec<u8>, Option<u8>, Vec<u8>) = if !pending.is_empty() && pending.len() <= 15 {
                (pending, Some(1), self.hooks.generate_app_payload())
            } else if !pending.is_empty() {
                (Vec::new(), Some(0), pending)
            } else {
                (Vec::new(), Some(1), self.hooks.generate_app_payload())
            };

            let fcnt = session.frame_counter;
            let frame = UplinkFrame {
                confirmed,
                dev_addr: session.dev_addr,
                fcnt,
                f_opts: &f_opts,
                f_port,
                app_payload: &app_payload,
                adr: true,
                nwk_s_key: &session.nwk_s_key,
                app_s_key: &session.app_s_key,
            };
            let phy = match lorawan::build_uplink(&frame) {
                Ok(phy) => phy,
                Err(e) => {
                    warn!(error = %e, "failed to build uplink frame");
                    return;
                }
            };
            session.frame_counter = session.frame_counter.wrapping_add(1);
            if confirmed {
                session.waiting_for_ack = true;
                session.pending_fcnt = Some(fcnt);
            }

            let (sf, bw) = dr_to_sf_bw(radio.data_rate);
            (phy, fcnt, f_port.unwrap_or(1), radio.current_channel_index, sf, bw, radio.tx_power)
        };

        let airtime_s = calculate_airtime(phy.len(), sf, bw);
        let airtime = Duration::from_secs_f64(airtime_s);

        let nb_trans = self.radio.lock().await.nb_trans.max(1);

        for trans in 0..nb_trans {
            self.wait_for_channel_ready(airtime).await;

            let (channel_index, freq, distance_m, environment) = {
                let radio = self.radio.lock().await;
                let session = self.session.lock().await;
                (radio.current_channel_index, radio.current_frequency_hz(), session.distance_m, session.environment.clone())
            };

            let mut envelope = RadioEnvelope {
                payload: phy.clone(),
                dev_addr: { self.session.lock().await.dev_addr },
                frequency_hz: freq,
                channel_index,
                spreading_factor: sf,
                bandwidth_khz: bw,
                coding_rate: "4/5",
                tx_power_dbm: tx_power as i8,
                rssi: None,
                snr: None,
                size: phy.len(),
                concentrator_tmst: None,
                utc_iso: None,
                distance_m,
                environment,
            };
            envelope.enrich();

            let tmst = self.gateway.concentrator_tmst();
            match self.channel_sim.simulate_uplink(envelope, tmst) {
                Some(envelope) => {
                    if let Err(e) = self.gateway.send_uplink(&envelope).await {
                        warn!(error = %e, "uplink send failed");
                    } else {
                        debug!(fcnt, fport, trans, "uplink transmitted");
                    }
                }
                None => debug!(fcnt, trans, "uplink dropped by channel simulator"),
            }

            {
                let mut radio = self.radio.lock().await;
                radio.record_transmission(channel_index, airtime);
            }

            self.schedule_rx_windows();

            let rx_delay = self.radio.lock().await.rx_delay_secs;
            let jitter = rand::thread_rng().gen_range(NBTRANS_BACKOFF_RANGE.0..NBTRANS_BACKOFF_RANGE.1);
            tokio::time::sleep(Duration::from_secs_f64(rx_delay as f64 + 1.0 + jitter)).await;

            self.radio.lock().await.rotate_channel();

            if confirmed && !self.session.lock().await.waiting_for_ack {
                break;
            }
        }
    }

    async fn wait_for_channel_ready(&self, airtime: Duration) {
        loop {
            let num_channels = self.radio.lock().await.enabled_channels.len().max(1);
            let mut shortest_wait: Option<Duration> = None;

            for _ in 0..num_channels {
                let channel_index = self.radio.lock().await.current_channel_index;
                let (ready, wait) = self.radio.lock().await.can_transmit(channel_index, airtime);
                if ready {
                    return;
                }
                if let Some(w) = wait {
                    shortest_wait = Some(shortest_wait.map_or(w, |s| s.min(w)));
                }
                self.radio.lock().await.rotate_channel();
            }

            let wait = shortest_wait.unwrap_or(Duration::from_secs(1));
            debug!(wait_ms = wait.as_millis() as u64, "no channel ready, waiting on duty cycle");
            tokio::time::sleep(wait).await;
        }
    }

    /// Spawn RX1 and RX2 window tasks. RX1 opens `rx_delay` seconds after
    /// transmission; RX2 opens `rx_delay + 1` seconds after (2 s after TX
    /// with the default `rx_delay = 1`), never at the same instant as RX1.
    fn schedule_rx_windows(self: &Arc<Self>) {
        let stack = self.clone();
        tokio::spawn(async move {
            let (rx_delay, rx1_dr_offset, data_rate) = {
                let radio = stack.radio.lock().await;
                (radio.rx_delay_secs, radio.rx1_dr_offset, radio.data_rate)
            };
            let rx1_dr = data_rate.saturating_sub(rx1_dr_offset);
            let (sf, bw) = dr_to_sf_bw(rx1_dr);
            let window = 8.0 * 2f64.powi(sf as i32) / (bw as f64 * 1000.0);

            let pre_open = Duration::from_secs_f64((rx_delay as f64 - 0.02).max(0.0));
            tokio::time::sleep(pre_open).await;
            stack.rx1_open.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs_f64(0.02 + window)).await;
            stack.rx1_open.store(false, Ordering::SeqCst);
        });

        let stack2 = self.clone();
        tokio::spawn(async move {
            let (rx_delay, rx2_data_rate) = {
                let radio = stack2.radio.lock().await;
                (radio.rx_delay_secs, radio.rx2_data_rate)
            };
            let (sf, bw) = dr_to_sf_bw(rx2_data_rate);
            let window = 8.0 * 2f64.powi(sf as i32) / (bw as f64 * 1000.0);

            let pre_open = Duration::from_secs_f64((rx_delay as f64 + 1.0 - 0.02).max(0.0));
            tokio::time::sleep(pre_open).await;
            stack2.rx2_open.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs_f64(0.02 + window)).await;
            stack2.rx2_open.store(false, Ordering::SeqCst);
        });
    }

    /// Entry point for downlink delivery from the message bus: filters by
    /// DevAddr and RX-window state, then processes the frame.
    pub async fn on_downlink(self: &Arc<Self>, envelope: &RadioEnvelope) {
        let dev_addr = self.session.lock().await.dev_addr;
        if envelope.dev_addr != dev_addr {
            return;
        }

        let radio = self.radio.lock().await;
        let rx1_match = envelope.frequency_hz == radio.current_frequency_hz() && self.rx1_open.load(Ordering::SeqCst);
        let rx2_match = envelope.frequency_hz == radio.rx2_frequency_hz && self.rx2_open.load(Ordering::SeqCst);
        drop(radio);

        if !rx1_match && !rx2_match {
            debug!(dev_addr, "downlink arrived outside any open RX window, dropping");
            return;
        }

        if let Some(snr) = envelope.snr {
            self.radio.lock().await.last_snr = snr;
        }

        let Some(payload) = self.channel_sim.simulate_downlink(envelope) else {
            debug!(dev_addr, "downlink dropped by channel simulator");
            return;
        };

        self.process_downlink(&payload).await;
    }

    async fn process_downlink(self: &Arc<Self>, raw: &[u8]) {
        let dev_addr = self.session.lock().await.dev_addr;
        let frame = match lorawan::parse_downlink(raw, dev_addr) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "downlink rejected");
                return;
            }
        };

        if frame.fctrl.ack {
            let mut session = self.session.lock().await;
            if session.waiting_for_ack {
                session.waiting_for_ack = false;
                drop(session);
                self.ack_notify.notify_one();
                self.hooks.on_ack();
                info!(dev_addr, "confirmed uplink acknowledged");
            }
        }

        let (last_snr, battery) = {
            let radio = self.radio.lock().await;
            (radio.last_snr, self.hooks.get_battery_status())
        };

        if !frame.f_opts.is_empty() {
            let mut radio = self.radio.lock().await;
            match mac::process_mac_stream(&frame.f_opts, &mut radio, last_snr, battery) {
                Ok(responses) => self.session.lock().await.queue_mac_response(&responses),
                Err(e) => warn!(error = %e, "failed to process FOpts MAC stream"),
            }
        }

        if let Some(f_port) = frame.f_port {
            if f_port == 0 {
                let key = self.session.lock().await.nwk_s_key;
                let fcnt = frame.fcnt16 as u32;
                let decrypted = lorawan::decrypt_downlink_payload(&frame, &key, fcnt);
                let mut radio = self.radio.lock().await;
                match mac::process_mac_stream(&decrypted, &mut radio, last_snr, battery) {
                    Ok(responses) => self.session.lock().await.queue_mac_response(&responses),
                    Err(e) => warn!(error = %e, "failed to process FPort-0 MAC stream"),
                }
            } else {
                let key = self.session.lock().await.app_s_key;
                let fcnt = frame.fcnt16 as u32;
                let decrypted = lorawan::decrypt_downlink_payload(&frame, &key, fcnt);
                self.hooks.receive_downlink(f_port, &decrypted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::device::ExampleSensor;

    async fn test_stack() -> Arc<LoRaWanStack> {
        let bus = MessageBus::new();
        let gateway = GatewayAdapter::connect("127.0.0.1:17002".parse().unwrap(), [2; 8], bus).await.unwrap();
        let session = DeviceSession::new(0x2601_1BDA, [0; 16], [0; 16], 1000.0, "suburban".into(), 10);
        LoRaWanStack::new(session, Arc::new(ExampleSensor::default()), gateway)
    }

    #[tokio::test]
    async fn frame_counter_increments_once_per_built_uplink() {
        let stack = test_stack().await;
        assert_eq!(stack.session.lock().await.frame_counter, 0);
        stack.build_and_transmit(false).await;
        assert_eq!(stack.session.lock().await.frame_counter, 1);
        stack.build_and_transmit(false).await;
        assert_eq!(stack.session.lock().await.frame_counter, 2);
    }

    #[tokio::test]
    async fn downlink_outside_rx_window_is_dropped_without_state_change() {
        let stack = test_stack().await;
        let dev_addr = stack.dev_addr().await;

        let envelope = RadioEnvelope {
            payload: vec![0x60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            dev_addr,
            frequency_hz: 869_525_000,
            channel_index: 0,
            spreading_factor: 12,
            bandwidth_khz: 125,
            coding_rate: "4/5",
            tx_power_dbm: 14,
            rssi: Some(-80.0),
            snr: Some(5.0),
            size: 12,
            concentrator_tmst: None,
            utc_iso: None,
            distance_m: 100.0,
            environment: "suburban".into(),
        };
        // No RX window has been opened yet (no uplink has been sent).
        stack.on_downlink(&envelope).await;
        assert_eq!(stack.radio.lock().await.last_snr, 0.0);
    }
}
