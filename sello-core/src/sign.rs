//! RSA PKCS#1 v1.5 / SHA-256 signatures over canonical strings.
use base64ct::{Base64, Encoding};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("signature value is not valid base64")]
    Encoding,
    #[error("signature does not verify")]
    Verify,
}

/// Base64 signature value ready to embed in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureValue(String);

impl SignatureValue {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SignError> {
        Base64::decode_vec(&self.0).map_err(|_| SignError::Encoding)
    }
}

impl fmt::Display for SignatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SignatureValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Sign the UTF-8 bytes of `canonical`.
///
/// PKCS#1 v1.5 padding is deterministic, so the same key and string always
/// give the same value.
pub fn sign_canonical(key: &RsaPrivateKey, canonical: &str) -> Result<SignatureValue, SignError> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    let signature: Signature = signing_key
        .try_sign(canonical.as_bytes())
        .map_err(|e| SignError::Sign(e.to_string()))?;
    Ok(SignatureValue(Base64::encode_string(&signature.to_bytes())))
}

pub fn verify_canonical(
    public_key: &RsaPublicKey,
    canonical: &str,
    signature: &SignatureValue,
) -> Result<(), SignError> {
    let bytes = signature.to_bytes()?;
    let signature = Signature::try_from(bytes.as_slice()).map_err(|_| SignError::Encoding)?;
    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(canonical.as_bytes(), &signature)
        .map_err(|_| SignError::Verify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_key() -> RsaPrivateKey {
        let mut rng = StdRng::seed_from_u64(7);
        RsaPrivateKey::new(&mut rng, 1024).expect("generate key")
    }

    #[test]
    fn signatures_are_deterministic_and_verify() {
        let key = small_key();
        let canonical = "||4.0|A|1|2024-01-01T12:00:00|30001000000500003416|100.00||";
        let first = sign_canonical(&key, canonical).unwrap();
        let second = sign_canonical(&key, canonical).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_bytes().unwrap().len(), 128);
        verify_canonical(&key.to_public_key(), canonical, &first).unwrap();
        assert!(matches!(
            verify_canonical(&key.to_public_key(), "||other||", &first),
            Err(SignError::Verify)
        ));
    }

    #[test]
    fn garbage_signature_is_an_encoding_error() {
        let key = small_key();
        let bogus = SignatureValue::from("!!!".to_string());
        assert!(matches!(
            verify_canonical(&key.to_public_key(), "||x||", &bogus),
            Err(SignError::Encoding)
        ));
    }
}
