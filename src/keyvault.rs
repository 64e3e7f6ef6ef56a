//! Symmetric sealing of per-address signing material.
//!
//! Secrets are encrypted with AES-256-GCM-SIV under a single service key.
//! Layout at rest: hex(ciphertext || tag || 12-byte nonce). The nonce is
//! random per sealing, so encrypting the same secret twice yields
//! different blobs.

use aes_gcm_siv::aead::AeadMutInPlace;
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use eyre::{eyre, Result, WrapErr};
use rand::RngCore;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Vault holding the service-wide sealing key.
#[derive(Clone)]
pub struct KeyVault {
    key: [u8; 32],
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault").field("key", &"<redacted>").finish()
    }
}

impl KeyVault {
    /// Build a vault from the hex-encoded 32-byte key in the configuration.
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(key_hex.trim()).wrap_err("AES key is not valid hex")?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| eyre!("AES key must be exactly 32 bytes"))?;
        Ok(Self { key })
    }

    /// Seal a secret (WIF or hex private key) for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut cipher = Aes256GcmSiv::new(&self.key.into());

        let mut nonce = Nonce::default();
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut buf = plaintext.as_bytes().to_vec();
        cipher
            .encrypt_in_place(&nonce, &[], &mut buf)
            .map_err(|_| eyre!("key sealing failed"))?;
        buf.extend_from_slice(nonce.as_ref());

        Ok(hex::encode(buf))
    }

    /// Open a sealed secret.
    pub fn decrypt(&self, sealed_hex: &str) -> Result<String> {
        let bytes = hex::decode(sealed_hex.trim()).wrap_err("sealed key is not valid hex")?;
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(eyre!("sealed key too short"));
        }
        let (body, nonce_bytes) = bytes.split_at(bytes.len() - NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let mut cipher = Aes256GcmSiv::new(&self.key.into());
        let mut buf = body.to_vec();
        cipher
            .decrypt_in_place(nonce, &[], &mut buf)
            .map_err(|_| eyre!("key unsealing failed (wrong AES key?)"))?;

        String::from_utf8(buf).wrap_err("unsealed key is not UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> KeyVault {
        KeyVault::from_hex(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn test_seal_roundtrip() {
        let v = vault();
        let secret = "L1aW4aubDFB7yfras2S1mN3bqg9nwySY8nkoLmJebSLD5BWv3ENZ";
        let sealed = v.encrypt(secret).unwrap();
        assert_ne!(sealed, secret);
        assert_eq!(v.decrypt(&sealed).unwrap(), secret);
    }

    #[test]
    fn test_nonce_is_random() {
        let v = vault();
        let a = v.encrypt("same secret").unwrap();
        let b = v.encrypt("same secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(v.decrypt(&a).unwrap(), v.decrypt(&b).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = vault().encrypt("secret").unwrap();
        let other = KeyVault::from_hex(&"cd".repeat(32)).unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_bad_key_length_rejected() {
        assert!(KeyVault::from_hex("abcd").is_err());
        assert!(KeyVault::from_hex("zz").is_err());
    }
}
