//! Private key decoding.
//!
//! Signing keys reach us in whatever shape the issuer's tooling produced:
//! PEM with or without encryption, PKCS#1 or PKCS#8 bodies, bare base64 with
//! the envelope stripped, raw DER (the authority's `.key` files are encrypted
//! PKCS#8 DER) and PKCS#12 keystores. Detection is an ordered list of
//! [`KeyStrategy`] values; the first one whose predicate matches and whose
//! decoder recognises the structure wins.
mod binary;
mod pem;
mod pkcs12;

use base64ct::{Base64, Encoding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors returned by [`decode_private_key`]. None of them carry key bytes.
#[derive(Debug, Error)]
pub enum KeyDecodeError {
    #[error("key material is empty")]
    Empty,
    #[error("no key format matched ({len} bytes, leading byte 0x{first_byte:02x})")]
    Unrecognized { len: usize, first_byte: u8 },
    #[error("{format} key is encrypted but no password was supplied")]
    PasswordRequired { format: &'static str },
    #[error("failed to decrypt {format} key: wrong password or unsupported cipher")]
    Decrypt { format: &'static str },
    #[error("unsupported legacy key format: {detail}")]
    UnsupportedLegacyFormat { detail: String },
    #[error("PEM block '{label}' does not hold a private key")]
    UnsupportedPemLabel { label: String },
    #[error("malformed PEM envelope: {detail}")]
    MalformedPem { detail: String },
    #[error("PKCS#12 container holds {count} private keys, expected exactly one")]
    Pkcs12KeyCount { count: usize },
}

/// Raw key bytes plus what we know about where they came from.
#[derive(Clone, Copy)]
pub struct KeySource<'a> {
    bytes: &'a [u8],
    password: Option<&'a str>,
    file_name: Option<&'a str>,
}

impl<'a> KeySource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            password: None,
            file_name: None,
        }
    }

    /// Empty passwords are treated as absent.
    pub fn with_password(mut self, password: Option<&'a str>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_file_name(mut self, file_name: Option<&'a str>) -> Self {
        self.file_name = file_name;
        self
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn password(&self) -> Option<&'a str> {
        self.password
    }

    pub fn file_name(&self) -> Option<&'a str> {
        self.file_name
    }

    fn text(&self) -> Option<&'a str> {
        std::str::from_utf8(self.bytes).ok()
    }
}

impl fmt::Debug for KeySource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySource")
            .field("len", &self.bytes.len())
            .field("password", &self.password.map(|_| "<redacted>"))
            .field("file_name", &self.file_name)
            .finish()
    }
}

/// Outer encoding the key arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEnvelope {
    Pem,
    Base64,
    Der,
    Pkcs12,
}

/// ASN.1 structure the key was recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStructure {
    Pkcs8,
    Pkcs1,
    EncryptedPkcs8,
    Pkcs12,
}

/// A decoded key with the path that produced it.
pub struct DecodedKey {
    key: RsaPrivateKey,
    envelope: KeyEnvelope,
    structure: KeyStructure,
}

impl DecodedKey {
    pub fn key(&self) -> &RsaPrivateKey {
        &self.key
    }

    pub fn into_key(self) -> RsaPrivateKey {
        self.key
    }

    pub fn envelope(&self) -> KeyEnvelope {
        self.envelope
    }

    pub fn structure(&self) -> KeyStructure {
        self.structure
    }

    pub fn modulus_bits(&self) -> usize {
        self.key.n().bits()
    }
}

impl fmt::Debug for DecodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedKey")
            .field("envelope", &self.envelope)
            .field("structure", &self.structure)
            .field("modulus_bits", &self.modulus_bits())
            .finish_non_exhaustive()
    }
}

type StrategyResult = Result<Option<(RsaPrivateKey, KeyStructure)>, KeyDecodeError>;

/// One detection step: `applies` says whether the input positively looks like
/// this encoding, `decode` returns `Ok(None)` when the structure inside is not
/// recognised and `Err` when it is recognised but cannot be opened.
pub struct KeyStrategy {
    pub name: &'static str,
    pub envelope: KeyEnvelope,
    pub applies: fn(&KeySource<'_>) -> bool,
    pub decode: fn(&KeySource<'_>) -> StrategyResult,
}

/// Detection order.
pub const STRATEGIES: &[KeyStrategy] = &[
    KeyStrategy {
        name: "pem",
        envelope: KeyEnvelope::Pem,
        applies: looks_like_pem,
        decode: pem::decode,
    },
    KeyStrategy {
        name: "base64",
        envelope: KeyEnvelope::Base64,
        applies: looks_like_bare_base64,
        decode: decode_bare_base64,
    },
    KeyStrategy {
        name: "der",
        envelope: KeyEnvelope::Der,
        applies: looks_like_der_sequence,
        decode: decode_der,
    },
    KeyStrategy {
        name: "pkcs12",
        envelope: KeyEnvelope::Pkcs12,
        applies: named_like_pkcs12,
        decode: pkcs12::decode,
    },
];

/// Decode an RSA private key, trying every known encoding in order.
///
/// # Examples
/// ```rust,no_run
/// use sello_core::key::{decode_private_key, KeySource};
///
/// let bytes = std::fs::read("issuer.key")?;
/// let decoded = decode_private_key(&KeySource::new(&bytes).with_password(Some("12345678a")))?;
/// println!("{:?} / {:?}", decoded.envelope(), decoded.structure());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn decode_private_key(source: &KeySource<'_>) -> Result<DecodedKey, KeyDecodeError> {
    let Some(&first_byte) = source.bytes.first() else {
        return Err(KeyDecodeError::Empty);
    };

    for strategy in STRATEGIES {
        if !(strategy.applies)(source) {
            continue;
        }
        match (strategy.decode)(source) {
            Ok(Some((key, structure))) => {
                tracing::debug!(
                    strategy = strategy.name,
                    ?structure,
                    len = source.bytes.len(),
                    "decoded private key"
                );
                return Ok(DecodedKey {
                    key,
                    envelope: strategy.envelope,
                    structure,
                });
            }
            Ok(None) => {
                tracing::debug!(strategy = strategy.name, "key strategy did not match");
            }
            Err(err) => {
                tracing::debug!(strategy = strategy.name, error = %err, "key strategy failed");
                return Err(err);
            }
        }
    }

    Err(KeyDecodeError::Unrecognized {
        len: source.bytes.len(),
        first_byte,
    })
}

fn looks_like_pem(source: &KeySource<'_>) -> bool {
    source
        .text()
        .is_some_and(|text| text.contains("-----BEGIN "))
}

const MIN_BARE_BASE64_LEN: usize = 100;

fn looks_like_bare_base64(source: &KeySource<'_>) -> bool {
    let Some(text) = source.text() else {
        return false;
    };
    let trimmed = text.trim();
    trimmed.len() > MIN_BARE_BASE64_LEN
        && trimmed
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=') || b.is_ascii_whitespace())
}

fn looks_like_der_sequence(source: &KeySource<'_>) -> bool {
    source.bytes.first() == Some(&0x30)
}

fn named_like_pkcs12(source: &KeySource<'_>) -> bool {
    source.file_name.is_some_and(|name| {
        let name = name.to_ascii_lowercase();
        name.ends_with(".p12") || name.ends_with(".pfx")
    })
}

fn decode_bare_base64(source: &KeySource<'_>) -> StrategyResult {
    let Some(der) = source.text().and_then(decode_base64_lenient) else {
        return Ok(None);
    };
    if der.first() != Some(&0x30) {
        return Ok(None);
    }
    binary::decode(&der, source.password)
}

fn decode_der(source: &KeySource<'_>) -> StrategyResult {
    binary::decode(source.bytes, source.password)
}

/// Base64 decode ignoring whitespace and tolerating missing padding.
pub(crate) fn decode_base64_lenient(text: &str) -> Option<Vec<u8>> {
    let mut compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if let Ok(bytes) = Base64::decode_vec(&compact) {
        return Some(bytes);
    }
    while compact.ends_with('=') {
        compact.pop();
    }
    while compact.len() % 4 != 0 {
        compact.push('=');
    }
    Base64::decode_vec(&compact).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            decode_private_key(&KeySource::new(b"")),
            Err(KeyDecodeError::Empty)
        ));
    }

    #[test]
    fn unrecognized_input_reports_length_and_leading_byte_only() {
        let err = decode_private_key(&KeySource::new(&[0x04, 0x01, 0x02])).unwrap_err();
        match err {
            KeyDecodeError::Unrecognized { len, first_byte } => {
                assert_eq!(len, 3);
                assert_eq!(first_byte, 0x04);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let message = decode_private_key(&KeySource::new(&[0x30, 0x03, 0x02, 0x01, 0x00]))
            .unwrap_err()
            .to_string();
        assert!(message.contains("5 bytes"), "{message}");
        assert!(message.contains("0x30"), "{message}");
    }

    #[test]
    fn short_base64_text_is_not_treated_as_a_key() {
        let source = KeySource::new(b"TWFuIGlzIGRpc3Rpbmd1aXNoZWQ=");
        assert!(!looks_like_bare_base64(&source));
    }

    #[test]
    fn pkcs12_is_selected_by_file_name() {
        let source = KeySource::new(&[0x30]).with_file_name(Some("Issuer.PFX"));
        assert!(named_like_pkcs12(&source));
        assert!(!named_like_pkcs12(&KeySource::new(&[0x30]).with_file_name(Some("a.key"))));
    }

    #[test]
    fn lenient_base64_accepts_wrapped_and_unpadded_input() {
        assert_eq!(decode_base64_lenient("aGVs\nbG8=").as_deref(), Some(&b"hello"[..]));
        assert_eq!(decode_base64_lenient("aGVsbG8").as_deref(), Some(&b"hello"[..]));
        assert_eq!(decode_base64_lenient("***"), None);
    }

    #[test]
    fn debug_output_redacts_password() {
        let source = KeySource::new(b"secret").with_password(Some("hunter2"));
        let rendered = format!("{source:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redacted"));
    }
}
