//! DER structures: PKCS#8, PKCS#1 and encrypted PKCS#8.
use super::{KeyDecodeError, KeyStructure, StrategyResult};
use pkcs8::EncryptedPrivateKeyInfo;
use rsa::pkcs1::der::{asn1::UintRef, Decode};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PrivateKeyParts;
use rsa::{BigUint, RsaPrivateKey};

pub(super) fn decode(der: &[u8], password: Option<&str>) -> StrategyResult {
    if let Some(key) = pkcs8(der) {
        return Ok(Some((key, KeyStructure::Pkcs8)));
    }
    if let Some(key) = pkcs1(der) {
        return Ok(Some((key, KeyStructure::Pkcs1)));
    }
    if EncryptedPrivateKeyInfo::try_from(der).is_err() {
        return Ok(None);
    }
    let password = password.ok_or(KeyDecodeError::PasswordRequired {
        format: "DER PKCS#8",
    })?;
    decrypt_pkcs8(der, password).map(Some)
}

pub(super) fn pkcs8(der: &[u8]) -> Option<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_der(der).ok()
}

/// Rebuild a key from a PKCS#1 `RSAPrivateKey`, field by field.
///
/// The key is reconstructed from the modulus, both exponents and the two
/// primes; the stored CRT exponents and coefficient must then agree with the
/// recomputed ones, otherwise the structure is treated as corrupt.
pub(super) fn pkcs1(der: &[u8]) -> Option<RsaPrivateKey> {
    let raw = rsa::pkcs1::RsaPrivateKey::from_der(der).ok()?;
    if raw.other_prime_infos.is_some() {
        tracing::debug!("multi-prime PKCS#1 key is not supported");
        return None;
    }
    let uint = |value: UintRef<'_>| BigUint::from_bytes_be(value.as_bytes());

    let mut key = RsaPrivateKey::from_components(
        uint(raw.modulus),
        uint(raw.public_exponent),
        uint(raw.private_exponent),
        vec![uint(raw.prime1), uint(raw.prime2)],
    )
    .ok()?;
    key.precompute().ok()?;
    key.validate().ok()?;

    let crt_matches = key.dp() == Some(&uint(raw.exponent1))
        && key.dq() == Some(&uint(raw.exponent2))
        && key.crt_coefficient() == Some(uint(raw.coefficient));
    if !crt_matches {
        tracing::debug!("PKCS#1 CRT parameters disagree with the primes");
        return None;
    }
    Some(key)
}

/// Decrypt an `EncryptedPrivateKeyInfo` and parse the plaintext.
pub(super) fn decrypt_pkcs8(
    der: &[u8],
    password: &str,
) -> Result<(RsaPrivateKey, KeyStructure), KeyDecodeError> {
    let info = EncryptedPrivateKeyInfo::try_from(der).map_err(|_| KeyDecodeError::MalformedPem {
        detail: "encrypted key body is not an EncryptedPrivateKeyInfo".into(),
    })?;
    let plain = info.decrypt(password).map_err(|e| {
        tracing::debug!(error = %e, "PKCS#8 decryption failed");
        KeyDecodeError::Decrypt { format: "PKCS#8" }
    })?;
    pkcs8(plain.as_bytes())
        .or_else(|| pkcs1(plain.as_bytes()))
        .map(|key| (key, KeyStructure::EncryptedPkcs8))
        .ok_or(KeyDecodeError::Decrypt { format: "PKCS#8" })
}
