use super::{binary, decode_base64_lenient, looks_like_bare_base64, KeyDecodeError, KeySource, KeyStructure, StrategyResult};
use p12::PFX;

pub(super) fn decode(source: &KeySource<'_>) -> StrategyResult {
    let decoded;
    let der = if looks_like_bare_base64(source) {
        match source.text().and_then(decode_base64_lenient) {
            Some(bytes) => {
                decoded = bytes;
                decoded.as_slice()
            }
            None => return Ok(None),
        }
    } else {
        source.bytes
    };

    let Ok(pfx) = PFX::parse(der) else {
        return Ok(None);
    };
    // Keystores exported without a password still use the empty one for the MAC.
    let password = source.password.unwrap_or("");
    if !pfx.verify_mac(password) {
        return Err(if source.password.is_none() {
            KeyDecodeError::PasswordRequired { format: "PKCS#12" }
        } else {
            KeyDecodeError::Decrypt { format: "PKCS#12" }
        });
    }
    let bags = pfx
        .key_bags(password)
        .map_err(|_| KeyDecodeError::Decrypt { format: "PKCS#12" })?;
    match bags.as_slice() {
        [only] => Ok(binary::pkcs8(only)
            .or_else(|| binary::pkcs1(only))
            .map(|key| (key, KeyStructure::Pkcs12))),
        other => Err(KeyDecodeError::Pkcs12KeyCount { count: other.len() }),
    }
}
