//! Hybrid encryption for direct messages
//!
//! Every message gets a fresh 256-bit ChaCha20-Poly1305 key and a fresh 96-bit nonce.
//! The symmetric key is wrapped under the recipient's RSA public key with OAEP(SHA-256),
//! so identical plaintexts never produce identical envelopes.

use blake2::{Blake2b512, Digest};
use chacha20poly1305::aead::{rand_core::RngCore, Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

/// RSA modulus size for generated identities
pub const RSA_KEY_BITS: usize = 2048;

/// Symmetric key length in bytes (ChaCha20-Poly1305)
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// Nonce length in bytes (ChaCha20-Poly1305)
pub const NONCE_LEN: usize = 12;

/// Error types for key handling and hybrid encryption
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key wrap failed: {0}")]
    KeyWrap(String),

    #[error("key unwrap failed (wrong recipient or corrupted key)")]
    KeyUnwrap,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed (tampered or truncated ciphertext)")]
    Decryption,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

/// Output of [`hybrid_encrypt`]: the wrapped key, the nonce and the AEAD ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub wrapped_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` for the holder of `recipient_public_key` (SPKI PEM).
pub fn hybrid_encrypt(
    recipient_public_key: &str,
    plaintext: &[u8],
) -> Result<EncryptedEnvelope, CryptoError> {
    let public_key = parse_public_key(recipient_public_key)?;

    let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher =
        ChaCha20Poly1305::new_from_slice(&key[..]).map_err(|_| CryptoError::Encryption)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let wrapped_key = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key[..])
        .map_err(|e| CryptoError::KeyWrap(e.to_string()))?;

    Ok(EncryptedEnvelope {
        wrapped_key,
        iv: iv.to_vec(),
        ciphertext,
    })
}

/// Unwrap the symmetric key with `private_key`, then decrypt the payload.
pub fn hybrid_decrypt(
    private_key: &RsaPrivateKey,
    envelope: &EncryptedEnvelope,
) -> Result<Vec<u8>, CryptoError> {
    if envelope.iv.len() != NONCE_LEN {
        return Err(CryptoError::MalformedEnvelope(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            envelope.iv.len()
        )));
    }

    let key = Zeroizing::new(
        private_key
            .decrypt(Oaep::new::<Sha256>(), &envelope.wrapped_key)
            .map_err(|_| CryptoError::KeyUnwrap)?,
    );
    if key.len() != SYMMETRIC_KEY_LEN {
        return Err(CryptoError::KeyUnwrap);
    }

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::KeyUnwrap)?;
    cipher
        .decrypt(Nonce::from_slice(&envelope.iv), envelope.ciphertext.as_slice())
        .map_err(|_| CryptoError::Decryption)
}

/// Parse an SPKI PEM public key as exchanged in `PUBKEY:` frames.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Encode a public key as SPKI PEM.
pub fn public_key_pem(public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Short fingerprint of a public key, for trust-on-first-use display
pub fn key_fingerprint(public_key_pem: &str) -> String {
    let mut hasher = Blake2b512::new();
    hasher.update(b"lan-messenger-key:");
    hasher.update(public_key_pem.trim().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Generate a fresh RSA key whose primes are stored largest first.
///
/// Certificate signing (ring, through rcgen) only accepts PKCS#8 keys with p > q.
pub(crate) fn generate_private_key(bits: usize) -> Result<RsaPrivateKey, CryptoError> {
    let key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

    let mut primes = key.primes().to_vec();
    primes.sort_by(|a, b| b.cmp(a));

    let mut ordered = RsaPrivateKey::from_components(
        key.n().clone(),
        key.e().clone(),
        key.d().clone(),
        primes,
    )
    .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    ordered
        .precompute()
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn test_key() -> &'static (RsaPrivateKey, String) {
        static KEY: OnceLock<(RsaPrivateKey, String)> = OnceLock::new();
        KEY.get_or_init(|| {
            let private_key = generate_private_key(RSA_KEY_BITS).unwrap();
            let pem = public_key_pem(&private_key.to_public_key()).unwrap();
            (private_key, pem)
        })
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let (private_key, pem) = test_key();
        let plaintext = "bonjour, équipe réseau".as_bytes();

        let envelope = hybrid_encrypt(pem, plaintext).unwrap();
        assert_eq!(envelope.iv.len(), NONCE_LEN);
        assert_eq!(envelope.wrapped_key.len(), RSA_KEY_BITS / 8);

        let recovered = hybrid_decrypt(private_key, &envelope).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let (private_key, pem) = test_key();
        let envelope = hybrid_encrypt(pem, b"").unwrap();
        assert!(hybrid_decrypt(private_key, &envelope).unwrap().is_empty());
    }

    #[test]
    fn test_same_plaintext_never_repeats() {
        let (_, pem) = test_key();
        let first = hybrid_encrypt(pem, b"same message").unwrap();
        let second = hybrid_encrypt(pem, b"same message").unwrap();

        assert_ne!(first.wrapped_key, second.wrapped_key);
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_wrong_private_key_fails() {
        let (_, pem) = test_key();
        let other = generate_private_key(RSA_KEY_BITS).unwrap();

        let envelope = hybrid_encrypt(pem, b"for someone else").unwrap();
        assert!(matches!(
            hybrid_decrypt(&other, &envelope),
            Err(CryptoError::KeyUnwrap)
        ));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let (private_key, pem) = test_key();
        let mut envelope = hybrid_encrypt(pem, b"truncate me please").unwrap();
        envelope.ciphertext.truncate(envelope.ciphertext.len() - 3);

        assert!(matches!(
            hybrid_decrypt(private_key, &envelope),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn test_bad_nonce_length_fails() {
        let (private_key, pem) = test_key();
        let mut envelope = hybrid_encrypt(pem, b"nonce").unwrap();
        envelope.iv.pop();

        assert!(matches!(
            hybrid_decrypt(private_key, &envelope),
            Err(CryptoError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_invalid_public_key_rejected() {
        assert!(hybrid_encrypt("not a key", b"hello").is_err());
        assert!(parse_public_key("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----").is_err());
    }

    #[test]
    fn test_generated_primes_are_ordered() {
        let (private_key, _) = test_key();
        let primes = private_key.primes();
        assert_eq!(primes.len(), 2);
        assert!(primes[0] > primes[1]);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let (_, pem) = test_key();
        assert_eq!(key_fingerprint(pem), key_fingerprint(&format!("{}\n", pem)));
        assert_eq!(key_fingerprint(pem).len(), 16);
    }
}
