//! Minimal Semtech UDP packet-forwarder stand-in network server.
//!
//! The core simulator plays the *gateway* role and needs a real LoRaWAN
//! network server on the other end of the wire. This binary is a throwaway
//! test harness for exercising the core without one: it listens for
//! PUSH_DATA/PULL_DATA from `lorawan-device-sim`, ACKs them, logs the
//! decoded PHYPayload header of every uplink, and can schedule a PULL_RESP
//! downlink back at the sender so RX-window and confirmed-uplink code paths
//! get exercised manually.
//!
//! Usage: cargo run --bin network-server-sim [listen_addr]

use base64::Engine;
use serde_json::Value;
use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{sleep, Duration};

const PROTOCOL_VERSION: u8 = 0x02;
const PUSH_DATA: u8 = 0x00;
const PUSH_ACK: u8 = 0x01;
const PULL_DATA: u8 = 0x02;
const PULL_RESP: u8 = 0x03;
const PULL_ACK: u8 = 0x04;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let listen_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1700".to_string())
        .parse()?;

    let socket = Arc::new(UdpSocket::bind(listen_addr).await?);
    println!("network-server-sim listening on {listen_addr}");

    let token_counter = Arc::new(AtomicU16::new(0x8000));
    let mut buf = vec![0u8; 65535];

    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;
        if len < 4 {
            eprintln!("packet too short ({len} bytes) from {src}");
            continue;
        }

        let data = &buf[..len];
        let token = u16::from_be_bytes([data[1], data[2]]);
        let identifier = data[3];

        match identifier {
            PUSH_DATA if len >= 12 => {
                let gw_eui = hex::encode(&data[4..12]);
                let json = String::from_utf8_lossy(&data[12..]);
                println!("PUSH_DATA from {src} (gw_eui={gw_eui})");
                describe_rxpk(&json);

                let ack = vec![PROTOCOL_VERSION, (token >> 8) as u8, token as u8, PUSH_ACK];
                socket.send_to(&ack, src).await?;

                let sock = socket.clone();
                let tc = token_counter.clone();
                tokio::spawn(async move {
                    sleep(Duration::from_millis(200)).await;
                    if let Err(e) = send_ack_downlink(&sock, src, &tc).await {
                        eprintln!("failed to send PULL_RESP: {e}");
                    }
                });
            }
            PULL_DATA if len >= 12 => {
                println!("PULL_DATA keepalive from {src}");
                let ack = vec![PROTOCOL_VERSION, (token >> 8) as u8, token as u8, PULL_ACK];
                socket.send_to(&ack, src).await?;
            }
            other => {
                eprintln!("unhandled/short GWMP identifier 0x{other:02x} from {src} ({len} bytes)");
            }
        }
    }
}

fn describe_rxpk(json: &str) {
    let Ok(parsed) = serde_json::from_str::<Value>(json) else {
        eprintln!("  (rxpk JSON did not parse)");
        return;
    };
    let Some(rxpk_list) = parsed.get("rxpk").and_then(Value::as_array) else {
        return;
    };
    for rxpk in rxpk_list {
        let Some(data) = rxpk.get("data").and_then(Value::as_str) else { continue };
        let Ok(phy) = base64::engine::general_purpose::STANDARD.decode(data) else { continue };
        if phy.len() < 12 {
            continue;
        }
        let mhdr = phy[0];
        let dev_addr = u32::from_le_bytes(phy[1..5].try_into().unwrap());
        let fcnt = u16::from_le_bytes(phy[6..8].try_into().unwrap());
        println!(
            "  MHDR=0x{mhdr:02x} DevAddr={dev_addr:08X} FCnt={fcnt} datr={} rssi={} lsnr={}",
            rxpk.get("datr").and_then(Value::as_str).unwrap_or("?"),
            rxpk.get("rssi").and_then(Value::as_f64).unwrap_or(0.0),
            rxpk.get("lsnr").and_then(Value::as_f64).unwrap_or(0.0),
        );
    }
}

/// Schedule an immediate unconfirmed-down ACK frame for DevAddr 0 (a
/// placeholder — a real network server would track per-device state and
/// FCnt). Exists purely so a manual test run can observe the gateway
/// adapter's PULL_RESP scheduling path end to end.
async fn send_ack_downlink(
    socket: &UdpSocket,
    dest: SocketAddr,
    token_counter: &AtomicU16,
) -> anyhow::Result<()> {
    // MType=unconfirmed-down(0x60), DevAddr=0, FCtrl.ACK=1, FCnt=0, no FOpts/FPort, MIC=0.
    let phy: Vec<u8> = vec![0x60, 0, 0, 0, 0, 0x20, 0, 0, 0, 0, 0, 0];
    let data_b64 = base64::engine::general_purpose::STANDARD.encode(&phy);
    let txpk = serde_json::json!({
        "txpk": {
            "imme": true,
            "freq": 869.525,
            "powe": 14,
            "datr": "SF12BW125",
            "codr": "4/5",
            "size": phy.len(),
            "data": data_b64,
        }
    });
    let json = txpk.to_string();

    let token = token_counter.fetch_add(1, Ordering::Relaxed);
    let mut packet = Vec::with_capacity(4 + json.len());
    packet.push(PROTOCOL_VERSION);
    packet.push((token >> 8) as u8);
    packet.push(token as u8);
    packet.push(PULL_RESP);
    packet.extend_from_slice(json.as_bytes());

    socket.send_to(&packet, dest).await?;
    println!("sent PULL_RESP ack-frame to {dest}");
    Ok(())
}
