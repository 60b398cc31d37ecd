//! Key + certificate pair loaded once and shared by every signing call.
use crate::certificate::{CertificateError, SigningCertificate};
use crate::key::{decode_private_key, DecodedKey, KeyDecodeError, KeyEnvelope, KeySource, KeyStructure};
use crate::sign::{sign_canonical, verify_canonical, SignError};
use rsa::RsaPrivateKey;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SELF_TEST_PROBE: &str = "||sello|self-test||";

#[derive(Debug, Error)]
pub enum MaterialError {
    #[error("failed to read {what} from '{path}': {source}")]
    Read {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    KeyDecode(#[from] KeyDecodeError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error("private key does not belong to certificate {serial}")]
    KeyCertificateMismatch { serial: String },
    #[error("self-test signature failed: {0}")]
    SelfTest(#[from] SignError),
}

/// Decoded signing key, its certificate and the values derived from it.
///
/// Read-only after construction; wrap it in an `Arc` to share it.
pub struct SigningMaterial {
    private_key: RsaPrivateKey,
    certificate: SigningCertificate,
    serial: String,
    certificate_base64: String,
    key_envelope: KeyEnvelope,
    key_structure: KeyStructure,
}

impl SigningMaterial {
    /// Decode both halves and prove they belong together.
    pub fn load(key: &KeySource<'_>, certificate: &[u8]) -> Result<Self, MaterialError> {
        let decoded = decode_private_key(key)?;
        let certificate = SigningCertificate::from_bytes(certificate)?;
        Self::from_parts(decoded, certificate)
    }

    /// Read both files and [`load`](Self::load) them. The key file name is
    /// passed along so container formats can be recognised by extension.
    pub fn load_files(
        key_path: &Path,
        password: Option<&str>,
        certificate_path: &Path,
    ) -> Result<Self, MaterialError> {
        let read = |what: &'static str, path: &Path| {
            std::fs::read(path).map_err(|e| MaterialError::Read {
                what,
                path: path.to_path_buf(),
                source: e,
            })
        };
        let key_bytes = read("private key", key_path)?;
        let certificate = read("certificate", certificate_path)?;
        let file_name = key_path.file_name().and_then(|n| n.to_str());
        let source = KeySource::new(&key_bytes)
            .with_password(password)
            .with_file_name(file_name);
        Self::load(&source, &certificate)
    }

    pub fn from_parts(
        decoded: DecodedKey,
        certificate: SigningCertificate,
    ) -> Result<Self, MaterialError> {
        let key_envelope = decoded.envelope();
        let key_structure = decoded.structure();
        let private_key = decoded.into_key();
        let serial = certificate.serial();

        check_pair(&private_key, &certificate, &serial)?;

        tracing::info!(
            serial = %serial,
            envelope = ?key_envelope,
            structure = ?key_structure,
            not_after = %certificate.not_after(),
            "signing material loaded"
        );
        Ok(Self {
            certificate_base64: certificate.der_base64(),
            private_key,
            certificate,
            serial,
            key_envelope,
            key_structure,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn certificate(&self) -> &SigningCertificate {
        &self.certificate
    }

    pub fn certificate_serial(&self) -> &str {
        &self.serial
    }

    pub fn certificate_base64(&self) -> &str {
        &self.certificate_base64
    }

    pub fn key_envelope(&self) -> KeyEnvelope {
        self.key_envelope
    }

    pub fn key_structure(&self) -> KeyStructure {
        self.key_structure
    }
}

impl fmt::Debug for SigningMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningMaterial")
            .field("serial", &self.serial)
            .field("key_envelope", &self.key_envelope)
            .field("key_structure", &self.key_structure)
            .finish_non_exhaustive()
    }
}

/// Round-trip sign/verify with the certificate's public key.
fn check_pair(
    key: &RsaPrivateKey,
    certificate: &SigningCertificate,
    serial: &str,
) -> Result<(), MaterialError> {
    let public_key = certificate.public_key()?;
    let probe = sign_canonical(key, SELF_TEST_PROBE)?;
    match verify_canonical(&public_key, SELF_TEST_PROBE, &probe) {
        Ok(()) => Ok(()),
        Err(SignError::Verify) => {
            tracing::error!(serial, "private key does not match certificate");
            Err(MaterialError::KeyCertificateMismatch {
                serial: serial.to_string(),
            })
        }
        Err(other) => Err(other.into()),
    }
}
