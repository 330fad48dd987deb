//! Local identity: RSA key pair plus a self-signed certificate binding a label.

use std::fmt;
use std::path::Path;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tracing::{debug, info};

use crate::crypto::{
    generate_private_key, hybrid_decrypt, key_fingerprint, public_key_pem, CryptoError,
    EncryptedEnvelope, RSA_KEY_BITS,
};
use crate::error::PeerError;

/// File holding the PKCS#8 private key
pub const PRIVATE_KEY_FILE: &str = "private_key.pem";

/// File holding the self-signed certificate
pub const CERTIFICATE_FILE: &str = "certificate.pem";

/// The local key pair and its certificate.
pub struct Identity {
    label: String,
    private_key: RsaPrivateKey,
    public_key_pem: String,
    certificate_pem: String,
}

impl Identity {
    /// Generate a fresh identity that lives only in memory.
    pub fn generate(label: &str) -> Result<Self, PeerError> {
        let private_key = generate_private_key(RSA_KEY_BITS)?;
        let certificate_pem = self_signed_certificate(&private_key, label)?;
        Self::from_parts(label, private_key, certificate_pem)
    }

    /// Load the identity stored in `dir`, creating and persisting one on first use.
    ///
    /// Repeated calls return the same key material.
    pub fn load_or_create(dir: &Path, label: &str) -> Result<Self, PeerError> {
        let key_path = dir.join(PRIVATE_KEY_FILE);
        let cert_path = dir.join(CERTIFICATE_FILE);

        if key_path.exists() && cert_path.exists() {
            let key_pem = zeroize::Zeroizing::new(std::fs::read_to_string(&key_path)?);
            let private_key = RsaPrivateKey::from_pkcs8_pem(&key_pem)
                .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
            let certificate_pem = std::fs::read_to_string(&cert_path)?;
            debug!("Loaded identity from {}", dir.display());
            return Self::from_parts(label, private_key, certificate_pem);
        }

        info!("No identity in {}, generating a new key pair", dir.display());
        let identity = Self::generate(label)?;

        std::fs::create_dir_all(dir)?;
        let key_pem = identity
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        write_private(&key_path, key_pem.as_bytes())?;
        std::fs::write(&cert_path, &identity.certificate_pem)?;

        Ok(identity)
    }

    fn from_parts(
        label: &str,
        private_key: RsaPrivateKey,
        certificate_pem: String,
    ) -> Result<Self, PeerError> {
        let public_key_pem = public_key_pem(&private_key.to_public_key())?;
        Ok(Self {
            label: label.to_string(),
            private_key,
            public_key_pem,
            certificate_pem,
        })
    }

    /// Public key material embedded in `PUBKEY:` frames.
    pub fn public_key_material(&self) -> &str {
        &self.public_key_pem
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.public_key_pem)
    }

    /// Decrypt an envelope addressed to this identity.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
        hybrid_decrypt(&self.private_key, envelope)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("label", &self.label)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

fn self_signed_certificate(private_key: &RsaPrivateKey, label: &str) -> Result<String, PeerError> {
    let key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, label);
    params.distinguished_name = dn;

    let cert = params.self_signed(&key_pair)?;
    Ok(cert.pem())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
