//! LoRaWAN Appendix A crypto: FRMPayload keystream and AES-CMAC MIC.
//!
//! Both operations are built on plain AES-128 block encryption, the same
//! way the RustCrypto ecosystem expects: one-shot `BlockEncrypt` calls over
//! a `GenericArray<u8, U16>`, no separate mode-of-operation crate needed
//! since LoRaWAN's "encryption" is just a keystream XOR.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

/// Direction byte used in the A_i / B0 blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up = 0,
    Down = 1,
}

fn aes_encrypt_block(key: &[u8; 16], block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

/// XOR-stream encrypt/decrypt FRMPayload (self-inverse).
///
/// `fcnt` is the full 32-bit internal frame counter — only the wire FCnt
/// field is ever truncated to 16 bits, the A_i blocks always see the
/// full width.
pub fn encrypt_payload(
    payload: &[u8],
    key: &[u8; 16],
    dev_addr: u32,
    fcnt: u32,
    dir: Direction,
) -> Vec<u8> {
    let dev_addr_le = dev_addr.to_le_bytes();
    let fcnt_le = fcnt.to_le_bytes();

    let num_blocks = payload.len().div_ceil(16);
    let mut keystream = Vec::with_capacity(num_blocks * 16);

    for i in 1..=num_blocks {
        let mut a_block = [0u8; 16];
        a_block[0] = 0x01;
        a_block[5] = dir as u8;
        a_block[6..10].copy_from_slice(&dev_addr_le);
        a_block[10..14].copy_from_slice(&fcnt_le);
        a_block[15] = i as u8;
        aes_encrypt_block(key, &mut a_block);
        keystream.extend_from_slice(&a_block);
    }

    payload
        .iter()
        .zip(keystream.iter())
        .map(|(p, k)| p ^ k)
        .collect()
}

/// Compute the 4-byte LoRaWAN MIC over `msg` (MHDR ‖ MACPayload).
pub fn compute_mic(msg: &[u8], nwk_s_key: &[u8; 16], dev_addr: u32, fcnt: u32, dir: Direction) -> [u8; 4] {
    let dev_addr_le = dev_addr.to_le_bytes();
    let fcnt_le = fcnt.to_le_bytes();

    let mut b0 = [0u8; 16];
    b0[0] = 0x49;
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr_le);
    b0[10..14].copy_from_slice(&fcnt_le);
    b0[15] = msg.len() as u8;

    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(nwk_s_key));
    mac.update(&b0);
    mac.update(msg);
    let tag = mac.finalize().into_bytes();

    [tag[0], tag[1], tag[2], tag[3]]
}

/// Recompute and compare the MIC of a downlink frame. Not called on the
/// accept path today (see the design notes on downlink MIC verification)
/// but kept available for a caller that wants to opt in.
pub fn verify_downlink_mic(
    msg: &[u8],
    mic: [u8; 4],
    nwk_s_key: &[u8; 16],
    dev_addr: u32,
    fcnt: u32,
) -> bool {
    compute_mic(msg, nwk_s_key, dev_addr, fcnt, Direction::Down) == mic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_stream_is_self_inverse() {
        let key = [0x2b; 16];
        let payload = b"hello lorawan!!!";
        let dev_addr = 0x2601_1BDA;
        let fcnt = 7u32;

        let encrypted = encrypt_payload(payload, &key, dev_addr, fcnt, Direction::Up);
        let decrypted = encrypt_payload(&encrypted, &key, dev_addr, fcnt, Direction::Up);
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn keystream_depends_on_direction() {
        let key = [0x01; 16];
        let payload = [0xAAu8; 16];
        let up = encrypt_payload(&payload, &key, 1, 1, Direction::Up);
        let down = encrypt_payload(&payload, &key, 1, 1, Direction::Down);
        assert_ne!(up, down);
    }

    #[test]
    fn mic_is_deterministic_and_key_dependent() {
        let msg = [0x40, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00];
        let key_a = [0x11; 16];
        let key_b = [0x22; 16];
        let mic_a1 = compute_mic(&msg, &key_a, 0x04030201, 0, Direction::Up);
        let mic_a2 = compute_mic(&msg, &key_a, 0x04030201, 0, Direction::Up);
        let mic_b = compute_mic(&msg, &key_b, 0x04030201, 0, Direction::Up);
        assert_eq!(mic_a1, mic_a2);
        assert_ne!(mic_a1, mic_b);
    }

    #[test]
    fn verify_downlink_mic_round_trips() {
        let key = [0x33; 16];
        let msg = [0x60, 0x01, 0x02, 0x03, 0x04, 0x00, 0x05, 0x00];
        let mic = compute_mic(&msg, &key, 0x04030201, 5, Direction::Down);
        assert!(verify_downlink_mic(&msg, mic, &key, 0x04030201, 5));
        assert!(!verify_downlink_mic(&msg, [0, 0, 0, 0], &key, 0x04030201, 5));
    }
}
