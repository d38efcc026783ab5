//! Device session state and the application-level hooks a host process
//! implements to drive one simulated device.

use tracing::info;

/// Callbacks the stack invokes into the hosting application. A default,
/// example implementation is provided for devices that just want a fixed
/// periodic payload (mirroring a basic sensor that always reports the same
/// shape of reading).
pub trait ApplicationHooks: Send + Sync {
    /// Called once per uplink cycle to produce the application payload.
    fn generate_app_payload(&self) -> Vec<u8>;

    /// Invoked after a confirmed uplink's ACK is observed.
    fn on_ack(&self) {}

    /// Battery level reported in DevStatusAns: 0 external, 1-254 = 1-100%, 255 unknown.
    fn get_battery_status(&self) -> u8 {
        255
    }

    /// Delivers an application-port downlink payload (FPort != 0).
    fn receive_downlink(&self, f_port: u8, payload: &[u8]) {
        info!(f_port, bytes = payload.len(), "received application downlink");
    }
}

/// A minimal example hook set: reports a fixed two-byte payload and logs
/// everything else, the simulator's equivalent of a "hello world" sensor.
pub struct ExampleSensor {
    pub payload: Vec<u8>,
}

impl Default for ExampleSensor {
    fn default() -> Self {
        Self { payload: vec![0x01, 0x64] }
    }
}

impl ApplicationHooks for ExampleSensor {
    fn generate_app_payload(&self) -> Vec<u8> {
        self.payload.clone()
    }
}

/// Immutable identity plus mutable protocol state for one simulated device.
pub struct DeviceSession {
    pub dev_addr: u32,
    pub nwk_s_key: [u8; 16],
    pub app_s_key: [u8; 16],
    pub frame_counter: u32,
    pub pending_mac_response: Vec<u8>,
    pub waiting_for_ack: bool,
    pub pending_fcnt: Option<u32>,
    pub distance_m: f64,
    pub environment: String,
    pub send_interval_s: u64,
}

impl DeviceSession {
    pub fn new(
        dev_addr: u32,
        nwk_s_key: [u8; 16],
        app_s_key: [u8; 16],
        distance_m: f64,
        environment: String,
        send_interval_s: u64,
    ) -> Self {
        Self {
            dev_addr,
            nwk_s_key,
            app_s_key,
            frame_counter: 0,
            pending_mac_response: Vec::new(),
            waiting_for_ack: false,
            pending_fcnt: None,
            distance_m,
            environment,
            send_interval_s,
        }
    }

    /// Take and clear the queued MAC responses for the next uplink.
    pub fn drain_mac_responses(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending_mac_response)
    }

    pub fn queue_mac_response(&mut self, bytes: &[u8]) {
        self.pending_mac_response.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_sensor_reports_fixed_payload() {
        let sensor = ExampleSensor::default();
        assert_eq!(sensor.generate_app_payload(), vec![0x01, 0x64]);
        assert_eq!(sensor.get_battery_status(), 255);
    }

    #[test]
    fn drain_mac_responses_clears_queue() {
        let mut session = DeviceSession::new(1, [0; 16], [0; 16], 500.0, "suburban".into(), 10);
        session.queue_mac_response(&[0x03, 0b111]);
        session.queue_mac_response(&[0x08]);
        let drained = session.drain_mac_responses();
        assert_eq!(drained, vec![0x03, 0b111, 0x08]);
        assert!(session.pending_mac_response.is_empty());
    }
}
