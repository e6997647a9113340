use aes::Aes256;
use anyhow::{Context, Result};
use base64::Engine as _;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::Rng;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// WeCom pads with PKCS#7 over a 32-byte block, not the AES block size.
const PAD_BLOCK: usize = 32;

/// Shared envelope codec for both callback channels.
///
/// Plaintext framing is `[16 random bytes][u32 BE length][message][receiver_id]`,
/// AES-256-CBC with the IV taken from the first 16 key bytes, and a
/// sorted-SHA1 signature over (token, timestamp, nonce, ciphertext).
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    token: String,
    key: [u8; 32],
    receiver_id: String,
}

impl EnvelopeCodec {
    pub fn new(token: &str, encoding_aes_key: &str, receiver_id: &str) -> Result<Self> {
        let mut padded = encoding_aes_key.trim().to_string();
        if !padded.ends_with('=') {
            padded.push('=');
        }
        let raw = base64::engine::general_purpose::STANDARD
            .decode(padded)
            .context("invalid encoding key: not base64")?;
        if raw.len() != 32 {
            anyhow::bail!("invalid encoding key length: expected 32 bytes, got {}", raw.len());
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw);

        Ok(Self {
            token: token.trim().to_string(),
            key,
            receiver_id: receiver_id.trim().to_string(),
        })
    }

    pub fn sign(&self, timestamp: &str, nonce: &str, encrypt: &str) -> String {
        let mut parts = vec![
            self.token.as_str(),
            timestamp.trim(),
            nonce.trim(),
            encrypt.trim(),
        ];
        parts.sort_unstable();

        let mut sha = Sha1::new();
        sha.update(parts.join(""));
        hex::encode(sha.finalize())
    }

    /// Timing-safe signature check; accepts upper- or lower-case hex.
    pub fn verify_signature(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypt: &str,
    ) -> bool {
        let expected = self.sign(timestamp, nonce, encrypt);
        let candidate = signature.trim().to_ascii_lowercase();
        expected.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    /// Encrypt a plaintext message into the base64 ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let message = plaintext.as_bytes();
        if message.len() > u32::MAX as usize {
            anyhow::bail!("plaintext payload too large");
        }

        let mut raw =
            Vec::with_capacity(20 + message.len() + self.receiver_id.len() + PAD_BLOCK);
        raw.extend_from_slice(&random_prefix());
        raw.extend_from_slice(&(message.len() as u32).to_be_bytes());
        raw.extend_from_slice(message);
        raw.extend_from_slice(self.receiver_id.as_bytes());

        let pad = PAD_BLOCK - (raw.len() % PAD_BLOCK);
        let pad = if pad == 0 { PAD_BLOCK } else { pad };
        raw.extend(std::iter::repeat(pad as u8).take(pad));

        let iv = &self.key[..16];
        let len = raw.len();
        let mut buf = raw;
        let encrypted = cbc::Encryptor::<Aes256>::new((&self.key).into(), iv.into())
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|_| anyhow::anyhow!("encrypt failed"))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(encrypted))
    }

    /// Decrypt a base64 ciphertext back to the framed message, verifying
    /// padding, framing and the receiver id.
    pub fn decrypt(&self, encrypt: &str) -> Result<String> {
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(encrypt.trim())
            .context("invalid ciphertext: not base64")?;
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            anyhow::bail!("invalid ciphertext length");
        }

        let iv = &self.key[..16];
        let mut buf = ciphertext;
        let plaintext = cbc::Decryptor::<Aes256>::new((&self.key).into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| anyhow::anyhow!("decrypt failed"))?;
        let unpadded = strip_padding(plaintext)?;

        if unpadded.len() < 20 {
            anyhow::bail!("invalid framing: payload too short");
        }
        let msg_len =
            u32::from_be_bytes([unpadded[16], unpadded[17], unpadded[18], unpadded[19]]) as usize;
        let msg_start = 20usize;
        let msg_end = msg_start.saturating_add(msg_len);
        if msg_end > unpadded.len() {
            anyhow::bail!("invalid framing: declared length out of range");
        }

        let message = std::str::from_utf8(&unpadded[msg_start..msg_end])
            .context("invalid framing: message is not utf-8")?;
        let from_receiver = std::str::from_utf8(&unpadded[msg_end..])
            .context("invalid framing: receiver id is not utf-8")?;

        if !self.receiver_id.is_empty() && from_receiver != self.receiver_id {
            anyhow::bail!("receiver id mismatch");
        }

        Ok(message.to_string())
    }

    /// Decrypt a downloaded media blob. Media bodies carry no length framing,
    /// only the 32-byte padding.
    pub fn decrypt_media(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        if encrypted.is_empty() || encrypted.len() % 16 != 0 {
            anyhow::bail!("invalid ciphertext length");
        }
        let iv = &self.key[..16];
        let mut buf = encrypted.to_vec();
        let plaintext = cbc::Decryptor::<Aes256>::new((&self.key).into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| anyhow::anyhow!("decrypt failed"))?;
        Ok(strip_padding(plaintext)?.to_vec())
    }

    /// Build the bot-channel reply envelope: JSON with ciphertext, signature,
    /// timestamp and nonce, served as `text/plain`.
    pub fn encrypt_bot_reply(
        &self,
        plaintext: &str,
        timestamp: &str,
        nonce: &str,
    ) -> Result<String> {
        let encrypt = self.encrypt(plaintext)?;
        let signature = self.sign(timestamp, nonce, &encrypt);
        let envelope = serde_json::json!({
            "encrypt": encrypt,
            "msgsignature": signature,
            "timestamp": timestamp.trim(),
            "nonce": nonce.trim(),
        });
        Ok(envelope.to_string())
    }
}

/// Every padding byte must equal the pad count.
fn strip_padding(input: &[u8]) -> Result<&[u8]> {
    let Some(&last) = input.last() else {
        anyhow::bail!("invalid padding: empty payload");
    };
    let pad = last as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > input.len() {
        anyhow::bail!("invalid padding length");
    }
    let (body, tail) = input.split_at(input.len() - pad);
    if tail.iter().any(|&b| b != last) {
        anyhow::bail!("invalid padding bytes");
    }
    Ok(body)
}

fn random_prefix() -> [u8; 16] {
    let mut prefix = [0u8; 16];
    rand::thread_rng().fill(&mut prefix[..]);
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

    fn codec(receiver: &str) -> EnvelopeCodec {
        EnvelopeCodec::new("token", TEST_KEY, receiver).unwrap()
    }

    #[test]
    fn rejects_short_encoding_key() {
        let err = EnvelopeCodec::new("token", "c2hvcnQ", "").unwrap_err();
        assert!(err.to_string().contains("length"));
    }

    #[test]
    fn roundtrip_json_plaintext() {
        let codec = codec("");
        let plain = r#"{"hello":"world"}"#;
        let encrypt = codec.encrypt(plain).unwrap();
        assert_eq!(codec.decrypt(&encrypt).unwrap(), plain);
    }

    #[test]
    fn roundtrip_at_pad_block_boundary() {
        // 16 prefix + 4 length + 12 message + 0 receiver = 32 raw bytes, so
        // the padding is a full extra block.
        let codec = codec("");
        let plain = "abcdefghijkl";
        assert_eq!(plain.len(), 12);
        let encrypt = codec.encrypt(plain).unwrap();
        assert_eq!(codec.decrypt(&encrypt).unwrap(), plain);
    }

    #[test]
    fn roundtrip_with_receiver_id() {
        let codec = codec("ww1234");
        let encrypt = codec.encrypt("ping").unwrap();
        assert_eq!(codec.decrypt(&encrypt).unwrap(), "ping");
    }

    #[test]
    fn receiver_id_mismatch_is_rejected() {
        let sender = codec("ww1234");
        let receiver = EnvelopeCodec::new("token", TEST_KEY, "ww9999").unwrap();
        let encrypt = sender.encrypt("ping").unwrap();
        let err = receiver.decrypt(&encrypt).unwrap_err();
        assert!(err.to_string().contains("receiver id mismatch"));
    }

    #[test]
    fn empty_receiver_skips_the_check() {
        let sender = codec("ww1234");
        let receiver = codec("");
        assert_eq!(receiver.decrypt(&sender.encrypt("ping").unwrap()).unwrap(), "ping");
    }

    #[test]
    fn tampered_padding_is_rejected() {
        assert!(strip_padding(&[]).is_err());
        assert!(strip_padding(&[0u8]).is_err());
        // Correct count byte but a mismatched filler byte.
        let mut block = vec![b'x'; 28];
        block.extend_from_slice(&[4, 4, 9, 4]);
        assert!(strip_padding(&block).is_err());
        let mut ok = vec![b'x'; 28];
        ok.extend_from_slice(&[4, 4, 4, 4]);
        assert_eq!(strip_padding(&ok).unwrap().len(), 28);
    }

    #[test]
    fn signature_is_hex_and_order_insensitive() {
        let codec = codec("");
        let sig = codec.sign("123", "456", "ENCRYPT");
        assert_eq!(sig.len(), 40);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // Sorting makes the signature symmetric under argument permutation.
        assert_eq!(sig, codec.sign("456", "123", "ENCRYPT"));
        assert_eq!(sig, codec.sign("ENCRYPT", "456", "123"));
        assert!(codec.verify_signature(&sig.to_ascii_uppercase(), "123", "456", "ENCRYPT"));
        assert!(!codec.verify_signature(&sig, "123", "456", "OTHER"));
    }

    #[test]
    fn bot_reply_envelope_verifies() {
        let codec = codec("");
        let envelope = codec.encrypt_bot_reply("{\"a\":1}", "1700000000", "n1").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&envelope).unwrap();
        let encrypt = parsed["encrypt"].as_str().unwrap();
        let signature = parsed["msgsignature"].as_str().unwrap();
        assert!(codec.verify_signature(signature, "1700000000", "n1", encrypt));
        assert_eq!(codec.decrypt(encrypt).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn media_blob_roundtrip() {
        let codec = codec("");
        // Encrypt a framed payload, then decrypt it as a raw blob: the
        // framing survives as-is because media decryption only unpads.
        let encrypt = codec.encrypt("media-bytes").unwrap();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encrypt)
            .unwrap();
        let blob = codec.decrypt_media(&raw).unwrap();
        assert!(blob.windows(11).any(|w| w == b"media-bytes"));
    }
}
