//! Tolerant PEM envelope handling.
//!
//! Real-world key files come with CRLF line endings, trailing spaces, missing
//! final newlines, RFC 1421 headers and several blocks in one file, so the
//! envelope is taken apart by hand instead of with a strict RFC 7468 decoder.
use super::{binary, decode_base64_lenient, KeyDecodeError, KeySource, KeyStructure, StrategyResult};

const BEGIN: &str = "-----BEGIN ";
const END: &str = "-----END ";
const DASHES: &str = "-----";

#[derive(Debug)]
pub(super) struct PemBlock {
    pub label: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl PemBlock {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn is_legacy_encrypted(&self) -> bool {
        self.header("Proc-Type")
            .is_some_and(|value| value.to_ascii_uppercase().contains("ENCRYPTED"))
    }
}

pub(super) fn decode(source: &KeySource<'_>) -> StrategyResult {
    let Some(text) = source.text() else {
        return Ok(None);
    };
    let blocks = parse_blocks(text)?;
    let Some(block) = blocks
        .iter()
        .find(|block| block.label.ends_with("PRIVATE KEY"))
    else {
        return Err(KeyDecodeError::UnsupportedPemLabel {
            label: blocks
                .first()
                .map(|b| b.label.clone())
                .unwrap_or_default(),
        });
    };

    match block.label.as_str() {
        "PRIVATE KEY" => Ok(binary::pkcs8(&block.body)
            .map(|key| (key, KeyStructure::Pkcs8))
            .or_else(|| binary::pkcs1(&block.body).map(|key| (key, KeyStructure::Pkcs1)))),
        "RSA PRIVATE KEY" => {
            if block.is_legacy_encrypted() {
                return Err(KeyDecodeError::UnsupportedLegacyFormat {
                    detail: format!(
                        "OpenSSL-encrypted RSA PRIVATE KEY ({})",
                        block.header("DEK-Info").unwrap_or("unknown cipher")
                    ),
                });
            }
            if let Some(key) = binary::pkcs1(&block.body) {
                return Ok(Some((key, KeyStructure::Pkcs1)));
            }
            // Some tools write PKCS#8 bodies under the legacy label.
            if let Some(key) = binary::pkcs8(&block.body) {
                return Ok(Some((key, KeyStructure::Pkcs8)));
            }
            Err(KeyDecodeError::UnsupportedLegacyFormat {
                detail: "RSA PRIVATE KEY body is not a PKCS#1 RSAPrivateKey".into(),
            })
        }
        "ENCRYPTED PRIVATE KEY" => {
            let password = source
                .password
                .ok_or(KeyDecodeError::PasswordRequired { format: "PEM PKCS#8" })?;
            binary::decrypt_pkcs8(&block.body, password).map(Some)
        }
        other => Err(KeyDecodeError::UnsupportedPemLabel {
            label: other.to_string(),
        }),
    }
}

pub(super) fn parse_blocks(text: &str) -> Result<Vec<PemBlock>, KeyDecodeError> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(BEGIN) {
        let after_begin = &rest[start + BEGIN.len()..];
        let label_end = after_begin
            .find(DASHES)
            .ok_or_else(|| KeyDecodeError::MalformedPem {
                detail: "unterminated BEGIN line".into(),
            })?;
        let label = after_begin[..label_end].trim().to_string();
        let content = &after_begin[label_end + DASHES.len()..];
        let (inner, remainder) = match content.find(END) {
            Some(end) => {
                let after_end = &content[end + END.len()..];
                let skip = after_end
                    .find(DASHES)
                    .map(|i| i + DASHES.len())
                    .unwrap_or(after_end.len());
                (&content[..end], &after_end[skip..])
            }
            // Truncated files lose their END line more often than anything else.
            None => (content, ""),
        };
        blocks.push(parse_body(label, inner)?);
        rest = remainder;
    }
    if blocks.is_empty() {
        return Err(KeyDecodeError::MalformedPem {
            detail: "no BEGIN line".into(),
        });
    }
    Ok(blocks)
}

fn parse_body(label: String, inner: &str) -> Result<PemBlock, KeyDecodeError> {
    let mut headers = Vec::new();
    let mut encoded = String::new();
    for line in inner.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
            continue;
        }
        encoded.push_str(line);
    }
    let body = decode_base64_lenient(&encoded).ok_or_else(|| KeyDecodeError::MalformedPem {
        detail: format!("body of '{label}' block is not base64"),
    })?;
    Ok(PemBlock {
        label,
        headers,
        body,
    })
}
