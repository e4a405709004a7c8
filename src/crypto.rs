//! Application-layer AES-128-CBC + HMAC-SHA256 framer for the HTTP
//! (port-80) transport variant.
//!
//! Ported from `HCSocket.py`'s `encrypt`/`decrypt`/`hmac_msg`. CBC state
//! chains across messages within a connection (the cipher instances are
//! never reset between `encrypt`/`decrypt` calls, only on reconnect), and
//! the HMAC chain links every frame to the one before it so replaying an
//! earlier frame fails verification once the chain has advanced.

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::HcError;

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const DIR_OUTBOUND: u8 = 0x45; // 'E'
const DIR_INBOUND: u8 = 0x43; // 'C'

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// 32-byte pre-shared key split into the two derived sub-keys used by the
/// HTTP framer.
pub struct FramerKeys {
    pub enc_key: [u8; 16],
    pub mac_key: [u8; 32],
}

impl FramerKeys {
    pub fn derive(psk: &[u8]) -> Self {
        let enc_full = hmac_sha256(psk, b"ENC");
        let mut enc_key = [0u8; 16];
        enc_key.copy_from_slice(&enc_full[0..16]);
        let mac_key = hmac_sha256(psk, b"MAC");
        FramerKeys { enc_key, mac_key }
    }
}

/// Per-connection CBC + HMAC chain state. Reset on every reconnect.
pub struct Framer {
    keys: FramerKeys,
    iv: [u8; 16],
    last_rx_hmac: [u8; 16],
    last_tx_hmac: [u8; 16],
    enc: Aes128CbcEnc,
    dec: Aes128CbcDec,
}

impl Framer {
    pub fn new(psk: &[u8], iv: [u8; 16]) -> Self {
        let keys = FramerKeys::derive(psk);
        let enc = Aes128CbcEnc::new(&keys.enc_key.into(), &iv.into());
        let dec = Aes128CbcDec::new(&keys.enc_key.into(), &iv.into());
        Framer {
            keys,
            iv,
            last_rx_hmac: [0u8; 16],
            last_tx_hmac: [0u8; 16],
            enc,
            dec,
        }
    }

    /// Re-initialize both CBC instances and zero the chained HMAC
    /// registers. Called on every fresh TCP/WebSocket connection.
    pub fn reset(&mut self) {
        self.last_rx_hmac = [0u8; 16];
        self.last_tx_hmac = [0u8; 16];
        self.enc = Aes128CbcEnc::new(&self.keys.enc_key.into(), &self.iv.into());
        self.dec = Aes128CbcDec::new(&self.keys.enc_key.into(), &self.iv.into());
    }

    fn hmac_chain(&self, direction: u8, last: &[u8; 16], enc_msg: &[u8]) -> [u8; 16] {
        let mut input = Vec::with_capacity(16 + 1 + 16 + enc_msg.len());
        input.extend_from_slice(&self.iv);
        input.push(direction);
        input.extend_from_slice(last);
        input.extend_from_slice(enc_msg);
        let full = hmac_sha256(&self.keys.mac_key, &input);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&full[0..16]);
        tag
    }

    /// Encrypt a UTF-8 plaintext message, returning `ciphertext || tag`.
    pub fn encrypt(&mut self, plaintext: &str) -> Vec<u8> {
        let mut buf = plaintext.as_bytes().to_vec();

        let mut pad_len = 16 - (buf.len() % 16);
        if pad_len == 1 {
            pad_len += 16;
        }
        let mut pad = vec![0u8; pad_len];
        pad[0] = 0x00;
        rand::thread_rng().fill_bytes(&mut pad[1..pad_len - 1]);
        pad[pad_len - 1] = pad_len as u8;
        buf.extend_from_slice(&pad);

        for block in buf.chunks_mut(16) {
            let block: &mut [u8; 16] = block.try_into().expect("buf is a multiple of 16 bytes");
            self.enc.encrypt_block_mut(block.into());
        }

        let tag = self.hmac_chain(DIR_OUTBOUND, &self.last_tx_hmac, &buf);
        self.last_tx_hmac = tag;

        buf.extend_from_slice(&tag);
        buf
    }

    /// Verify, decrypt, and unpad an inbound frame.
    pub fn decrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, HcError> {
        if buf.len() < 32 {
            metrics::counter!("hc.framer.short_frame").increment(1);
            return Err(HcError::ShortFrame(buf.len()));
        }
        if buf.len() % 16 != 0 {
            tracing::warn!(len = buf.len(), "unaligned inbound frame length");
        }

        let (enc_msg, their_tag) = buf.split_at(buf.len() - 16);
        let our_tag = self.hmac_chain(DIR_INBOUND, &self.last_rx_hmac, enc_msg);
        if their_tag != our_tag {
            metrics::counter!("hc.framer.mac_mismatch").increment(1);
            return Err(HcError::MacMismatch);
        }
        self.last_rx_hmac.copy_from_slice(their_tag);

        let mut plain = enc_msg.to_vec();
        for block in plain.chunks_mut(16) {
            let block: &mut [u8; 16] = block.try_into().expect("enc_msg is a multiple of 16 bytes");
            self.dec.decrypt_block_mut(block.into());
        }

        let pad_len = *plain.last().unwrap_or(&0) as usize;
        if pad_len > plain.len() {
            return Err(HcError::PadError { pad_len, plaintext_len: plain.len() });
        }
        plain.truncate(plain.len() - pad_len);
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn psk_iv() -> (Vec<u8>, [u8; 16]) {
        let psk = vec![0x11u8; 32];
        let iv = [0x22u8; 16];
        (psk, iv)
    }

    #[test]
    fn round_trip() {
        let (psk, iv) = psk_iv();
        let mut tx = Framer::new(&psk, iv);
        let mut rx = Framer::new(&psk, iv);

        let msg = "hello home connect";
        let enc = tx.encrypt(msg);
        assert_eq!(enc.len() % 16, 0);
        assert!(enc.len() >= 32);

        let dec = rx.decrypt(&enc).unwrap();
        assert_eq!(String::from_utf8(dec).unwrap(), msg);
    }

    #[test]
    fn chaining_changes_ciphertext_for_same_plaintext() {
        let (psk, iv) = psk_iv();
        let mut tx = Framer::new(&psk, iv);
        let a = tx.encrypt("A");
        let b = tx.encrypt("A");
        assert_ne!(a, b);
    }

    #[test]
    fn replay_fails_mac_once_chain_advances() {
        let (psk, iv) = psk_iv();
        let mut tx = Framer::new(&psk, iv);
        let mut rx = Framer::new(&psk, iv);

        let first = tx.encrypt("A");
        let second = tx.encrypt("A");

        assert!(rx.decrypt(&first).is_ok());
        // first frame already consumed; replaying it again must fail
        assert!(matches!(rx.decrypt(&first), Err(HcError::MacMismatch)));
        // the real second frame still verifies against the advanced chain
        assert!(rx.decrypt(&second).is_ok());
    }

    #[test]
    fn decrypt_out_of_order_fails_mac() {
        let (psk, iv) = psk_iv();
        let mut tx = Framer::new(&psk, iv);
        let mut rx = Framer::new(&psk, iv);

        let _first = tx.encrypt("A");
        let second = tx.encrypt("A");
        // feeding the second frame before the first breaks the HMAC chain
        assert!(matches!(rx.decrypt(&second), Err(HcError::MacMismatch)));
    }

    #[test]
    fn tamper_flips_a_bit_causes_mac_mismatch() {
        let (psk, iv) = psk_iv();
        let mut tx = Framer::new(&psk, iv);
        let mut rx = Framer::new(&psk, iv);

        let mut enc = tx.encrypt("A");
        let last = enc.len() - 1;
        enc[last] ^= 0x01;
        assert!(matches!(rx.decrypt(&enc), Err(HcError::MacMismatch)));
    }

    #[test]
    fn short_frame_rejected() {
        let (psk, iv) = psk_iv();
        let mut rx = Framer::new(&psk, iv);
        assert!(matches!(rx.decrypt(&[0u8; 16]), Err(HcError::ShortFrame(16))));
    }

    #[test]
    fn encrypted_length_always_aligned_and_at_least_32() {
        let (psk, iv) = psk_iv();
        let mut tx = Framer::new(&psk, iv);
        for len in 0..40 {
            let msg = "x".repeat(len);
            let enc = tx.encrypt(&msg);
            assert_eq!(enc.len() % 16, 0);
            assert!(enc.len() >= 32);
        }
    }

    #[test]
    fn reset_restores_fresh_chain_state() {
        let (psk, iv) = psk_iv();
        let mut tx = Framer::new(&psk, iv);
        let mut rx = Framer::new(&psk, iv);

        let a = tx.encrypt("A");
        assert!(rx.decrypt(&a).is_ok());

        tx.reset();
        rx.reset();

        let b = tx.encrypt("A");
        // after a reset both chains restart from zero, so the ciphertext
        // for the same plaintext is identical to the very first message
        assert_eq!(a, b);
        assert!(rx.decrypt(&b).is_ok());
    }
}
