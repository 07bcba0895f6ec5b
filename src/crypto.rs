/*!
Sealing of platform credentials at rest.

Access and refresh tokens are never stored in the clear: each value is
AES-256-GCM encrypted under `ENC_KEY` with a fresh 12-byte nonce, and both
the ciphertext and the nonce are hex-encoded into text columns.
*/
use ring::aead::BoundKey;

use crate::{se, CONFIG};

/// A sealed secret as it is stored: hex ciphertext plus hex nonce.
pub struct Sealed {
    pub value: String,
    pub nonce: String,
}

/// ring requires an implementor of `NonceSequence`,
/// which is a wrapping trait around `ring::aead::Nonce`.
/// We have to make a wrapper that can pass ownership
/// of the nonce exactly once.
struct OneNonceSequence {
    inner: Option<ring::aead::Nonce>,
}
impl OneNonceSequence {
    fn new(inner: ring::aead::Nonce) -> Self {
        Self { inner: Some(inner) }
    }
}

impl ring::aead::NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> std::result::Result<ring::aead::Nonce, ring::error::Unspecified> {
        self.inner.take().ok_or(ring::error::Unspecified)
    }
}

/// Return a `Vec` of secure random bytes of size `n`
pub fn rand_bytes(n: usize) -> crate::Result<Vec<u8>> {
    use ring::rand::SecureRandom;
    let mut buf = vec![0; n];
    let sysrand = ring::rand::SystemRandom::new();
    sysrand
        .fill(&mut buf)
        .map_err(|_| "error getting random bytes")?;
    Ok(buf)
}

pub fn new_nonce() -> crate::Result<Vec<u8>> {
    rand_bytes(12)
}

/// Encrypt `bytes` with the given `nonce` and `pass`
///
/// `bytes` are encrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
pub fn encrypt(bytes: &[u8], nonce: &[u8], pass: &[u8]) -> crate::Result<Vec<u8>> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| "encryption nonce not unique")?;
    let nonce = OneNonceSequence::new(nonce);
    let key = ring::aead::UnboundKey::new(alg, pass).map_err(|_| "error building sealing key")?;
    let mut key = ring::aead::SealingKey::new(key, nonce);
    let mut in_out = bytes.to_vec();
    key.seal_in_place_append_tag(ring::aead::Aad::empty(), &mut in_out)
        .map_err(|_| "failed encrypting bytes")?;
    Ok(in_out)
}

/// Decrypt `bytes` with the given `nonce` and `pass`
///
/// `bytes` are decrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
pub fn decrypt<'a>(bytes: &'a mut [u8], nonce: &[u8], pass: &[u8]) -> crate::Result<&'a [u8]> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| "decryption nonce not unique")?;
    let nonce = OneNonceSequence::new(nonce);
    let key = ring::aead::UnboundKey::new(alg, pass).map_err(|_| "error building opening key")?;
    let mut key = ring::aead::OpeningKey::new(key, nonce);
    let out_slice = key
        .open_in_place(ring::aead::Aad::empty(), bytes)
        .map_err(|_| "failed decrypting bytes")?;
    Ok(out_slice)
}

/// Seal a secret string under the configured `ENC_KEY`.
pub fn seal_str(s: &str) -> crate::Result<Sealed> {
    let nonce = new_nonce()?;
    let b = encrypt(s.as_bytes(), &nonce, CONFIG.enc_key.as_bytes())?;
    Ok(Sealed {
        value: hex::encode(&b),
        nonce: hex::encode(&nonce),
    })
}

/// Recover a secret string sealed by [`seal_str`].
pub fn open_str(value: &str, nonce: &str) -> crate::Result<String> {
    let nonce = hex::decode(nonce).map_err(|e| se!("nonce hex decode error {}", e))?;
    let mut value = hex::decode(value).map_err(|e| se!("value hex decode error {}", e))?;
    let bytes = decrypt(value.as_mut_slice(), &nonce, CONFIG.enc_key.as_bytes())?;
    String::from_utf8(bytes.to_owned()).map_err(|e| se!("sealed value utf8 error {}", e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"01234567890123456789012345678901";

    #[test]
    fn encrypt_decrypt_round_trip() {
        let nonce = new_nonce().unwrap();
        let mut sealed = encrypt(b"BQDa_access-token", &nonce, KEY).unwrap();
        let opened = decrypt(sealed.as_mut_slice(), &nonce, KEY).unwrap();
        assert_eq!(opened, b"BQDa_access-token");
    }

    #[test]
    fn wrong_nonce_fails_open() {
        let nonce = new_nonce().unwrap();
        let other = new_nonce().unwrap();
        let mut sealed = encrypt(b"secret", &nonce, KEY).unwrap();
        assert!(decrypt(sealed.as_mut_slice(), &other, KEY).is_err());
    }

    #[test]
    fn seal_open_round_trip_with_configured_key() {
        let sealed = seal_str("a-refresh-token").unwrap();
        assert_ne!(sealed.value, hex::encode("a-refresh-token"));
        let opened = open_str(&sealed.value, &sealed.nonce).unwrap();
        assert_eq!(opened, "a-refresh-token");
    }
}
