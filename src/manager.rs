//! Device lifecycle: construction from configuration, periodic uplink
//! cycles, and downlink fan-out via the message bus.

use crate::bus::MessageBus;
use crate::config::Config;
use crate::device::{DeviceSession, ExampleSensor};
use crate::gateway::GatewayAdapter;
use crate::stack::LoRaWanStack;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct DeviceManager {
    stacks: HashMap<u32, Arc<LoRaWanStack>>,
}

impl DeviceManager {
    /// Build one stack per configured device, subscribe each to the
    /// message bus (so an inbound downlink is filtered per-device), and
    /// spawn its periodic uplink task.
    pub async fn start(config: &Config, gateway: Arc<GatewayAdapter>, bus: MessageBus) -> anyhow::Result<Self> {
        let mut stacks = HashMap::new();

        for device_cfg in &config.devices {
            let dev_addr = u32::from_str_radix(&device_cfg.devaddr, 16)?;
            let nwk_s_key = parse_key(&device_cfg.nwk_skey)?;
            let app_s_key = parse_key(&device_cfg.app_skey)?;

            if stacks.contains_key(&dev_addr) {
                anyhow::bail!("duplicate DevAddr {}", device_cfg.devaddr);
            }

            let session = DeviceSession::new(
                dev_addr,
                nwk_s_key,
                app_s_key,
                device_cfg.distance_m as f64,
                device_cfg.environment.clone(),
                device_cfg.send_interval_s as u64,
            );

            let stack = LoRaWanStack::new(session, Arc::new(ExampleSensor::default()), gateway.clone());
            bus.subscribe(subscriber_for(stack.clone())).await;
            spawn_uplink_loop(stack.clone());

            info!(devaddr = %device_cfg.devaddr, "added simulated device");
            stacks.insert(dev_addr, stack);
        }

        Ok(Self { stacks })
    }

    pub fn device_count(&self) -> usize {
        self.stacks.len()
    }
}

fn subscriber_for(stack: Arc<LoRaWanStack>) -> crate::bus::Subscriber {
    Arc::new(move |envelope| {
        let stack = stack.clone();
        Box::pin(async move {
            stack.on_downlink(&envelope).await;
        })
    })
}

fn spawn_uplink_loop(stack: Arc<LoRaWanStack>) {
    tokio::spawn(async move {
        let interval = stack.send_interval_s().await.max(1);
        loop {
            stack.send(false).await;
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    });
}

fn parse_key(hex_str: &str) -> anyhow::Result<[u8; 16]> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("session key must be exactly 16 bytes, got {}", hex_str.len() / 2))
}
