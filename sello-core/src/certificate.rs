//! Issuer certificate parsing.
use crate::key::decode_base64_lenient;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use const_oid::ObjectIdentifier;
use rsa::pkcs8::DecodePublicKey;
use rsa::{BigUint, RsaPublicKey};
use thiserror::Error;
use x509_cert::der::asn1::Any;
use x509_cert::der::{Decode, Encode};
use x509_cert::name::Name;
use x509_cert::Certificate;

/// `x500UniqueIdentifier`, where the authority stores the owner's tax id.
const X500_UNIQUE_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.45");

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate is empty")]
    Empty,
    #[error("certificate parse error: {0}")]
    Parse(String),
    #[error("certificate public key is not RSA: {0}")]
    PublicKey(String),
}

/// Parsed signing certificate.
#[derive(Debug, Clone)]
pub struct SigningCertificate {
    certificate: Certificate,
    der: Vec<u8>,
}

impl SigningCertificate {
    /// Parse PEM or raw DER bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CertificateError> {
        if bytes.is_empty() {
            return Err(CertificateError::Empty);
        }
        let der = match std::str::from_utf8(bytes) {
            Ok(text) if text.contains("-----BEGIN") => pem_body(text)?,
            // Some stores hand out the DER as a single base64 line.
            Ok(text) if bytes[0] != 0x30 => decode_base64_lenient(text)
                .ok_or_else(|| CertificateError::Parse("not DER, PEM or base64".into()))?,
            _ => bytes.to_vec(),
        };
        Self::from_der(&der)
    }

    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let certificate =
            Certificate::from_der(der).map_err(|e| CertificateError::Parse(format!("{e:?}")))?;
        let der = certificate
            .to_der()
            .map_err(|e| CertificateError::Parse(format!("{e:?}")))?;
        Ok(Self { certificate, der })
    }

    pub fn inner(&self) -> &Certificate {
        &self.certificate
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// DER bytes as one unwrapped base64 line, the form embedded in documents.
    pub fn der_base64(&self) -> String {
        Base64::encode_string(&self.der)
    }

    /// Certificate serial in the form the authority expects.
    ///
    /// The authority writes its serials as ASCII digits inside the INTEGER
    /// (`0x33 0x30 0x30 …` is "300…"); those are returned as text. Any other
    /// serial is returned as its unsigned decimal value.
    pub fn serial(&self) -> String {
        serial_to_string(self.certificate.tbs_certificate.serial_number.as_bytes())
    }

    pub fn subject(&self) -> String {
        self.certificate.tbs_certificate.subject.to_string()
    }

    pub fn issuer(&self) -> String {
        self.certificate.tbs_certificate.issuer.to_string()
    }

    /// Owner tax identifier from the subject, if one can be found.
    pub fn subject_identity(&self) -> Option<String> {
        subject_identity_from_dn(&self.subject())
            .or_else(|| identity_from_rdns(&self.certificate.tbs_certificate.subject))
    }

    pub fn public_key(&self) -> Result<RsaPublicKey, CertificateError> {
        let spki = self
            .certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| CertificateError::PublicKey(format!("{e:?}")))?;
        RsaPublicKey::from_public_key_der(&spki)
            .map_err(|e| CertificateError::PublicKey(e.to_string()))
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.certificate
            .tbs_certificate
            .validity
            .not_before
            .to_system_time()
            .into()
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.certificate
            .tbs_certificate
            .validity
            .not_after
            .to_system_time()
            .into()
    }

    pub fn is_valid_at(&self, instant: DateTime<Utc>) -> bool {
        self.not_before() <= instant && instant <= self.not_after()
    }
}

fn pem_body(text: &str) -> Result<Vec<u8>, CertificateError> {
    let start = text
        .find("-----BEGIN CERTIFICATE-----")
        .ok_or_else(|| CertificateError::Parse("no CERTIFICATE block".into()))?;
    let body = &text[start + "-----BEGIN CERTIFICATE-----".len()..];
    let body = body
        .find("-----END")
        .map(|end| &body[..end])
        .unwrap_or(body);
    decode_base64_lenient(body)
        .ok_or_else(|| CertificateError::Parse("CERTIFICATE block is not base64".into()))
}

/// ASCII-digit serials are taken as written; anything else is read as a
/// big-endian integer.
pub(crate) fn serial_to_string(bytes: &[u8]) -> String {
    if !bytes.is_empty() && bytes.iter().all(u8::is_ascii_digit) {
        return bytes.iter().map(|&b| b as char).collect();
    }
    BigUint::from_bytes_be(bytes).to_string()
}

/// Pull the owner identifier out of a rendered distinguished name.
///
/// Two renderings occur: the attribute as an OID with a hex-encoded DER value
/// (`2.5.4.45=#130d…`) and a plain `KEY=VALUE` token. The first that yields a
/// value wins. Values shaped `RFC / CURP` keep only the part before the slash.
pub fn subject_identity_from_dn(dn: &str) -> Option<String> {
    let tokens = split_dn(dn);
    hex_oid_identity(&tokens).or_else(|| plain_identity(&tokens))
}

fn hex_oid_identity(tokens: &[String]) -> Option<String> {
    let prefix = format!("{X500_UNIQUE_IDENTIFIER}=#");
    tokens.iter().find_map(|token| {
        let hex_value = token.strip_prefix(&prefix)?;
        let der = hex::decode(hex_value.trim()).ok()?;
        let any = Any::from_der(&der).ok()?;
        let text = std::str::from_utf8(any.value()).ok()?;
        first_identity_part(text)
    })
}

fn plain_identity(tokens: &[String]) -> Option<String> {
    tokens.iter().find_map(|token| {
        let (key, value) = token.split_once('=')?;
        let key = key.trim();
        let matches = key.eq_ignore_ascii_case("x500UniqueIdentifier")
            || key.eq_ignore_ascii_case("UID")
            || key == X500_UNIQUE_IDENTIFIER.to_string();
        if !matches || value.starts_with('#') {
            return None;
        }
        first_identity_part(value)
    })
}

fn identity_from_rdns(name: &Name) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .filter(|atv| atv.oid == X500_UNIQUE_IDENTIFIER)
        .find_map(|atv| std::str::from_utf8(atv.value.value()).ok().and_then(first_identity_part))
}

fn first_identity_part(value: &str) -> Option<String> {
    let first = value.split('/').next().unwrap_or_default().trim();
    let first = first.trim_matches('"');
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

/// Split an RFC 4514 string on unescaped `,` and `+`.
fn split_dn(dn: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = dn.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' | '+' => tokens.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        tokens.push(current.trim().to_string());
    }
    tokens
}
