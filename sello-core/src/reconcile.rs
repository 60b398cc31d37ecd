//! Keeps the signed bytes and the returned bytes in agreement.
//!
//! Phase A runs before canonicalization: it fixes the certificate serial on
//! the root and snapshots the exact serialization that gets canonicalized.
//! Phase B runs after signing: it appends the certificate and the signature
//! and then proves that nothing other than those two attributes changed.
use crate::document::{collapse_inter_tag_whitespace, AttributeChange, DocumentError, DocumentSnapshot};
use crate::sign::SignatureValue;
use thiserror::Error;

pub const SERIAL_ATTRIBUTE: &str = "NoCertificado";
pub const CERTIFICATE_ATTRIBUTE: &str = "Certificado";
pub const SIGNATURE_ATTRIBUTE: &str = "Sello";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{attribute} value is empty")]
    SignatureValueEmpty { attribute: &'static str },
    #[error("certificate serial changed after canonicalization: expected {expected}, found {found:?}")]
    SerialChanged {
        expected: String,
        found: Option<String>,
    },
    #[error("signed document differs from the canonicalized document beyond the signature attributes")]
    RoundTripMismatch,
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// What phase A fixed: the serial it wrote and the serialization handed to
/// the canonicalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseAReceipt {
    serial: String,
    canonical_input: String,
}

impl PhaseAReceipt {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The exact string to canonicalize.
    pub fn canonical_input(&self) -> &str {
        &self.canonical_input
    }
}

/// Phase A: set the serial (in place if present, appended otherwise) and drop
/// any stale certificate or signature left on the root.
pub fn prepare_for_canonicalization(doc: &mut DocumentSnapshot, serial: &str) -> PhaseAReceipt {
    let root = doc.root_mut();
    match root.attributes.set(SERIAL_ATTRIBUTE, serial) {
        AttributeChange::Replaced { previous } => {
            tracing::debug!(previous = %previous, serial, "replaced certificate serial")
        }
        AttributeChange::Appended => tracing::debug!(serial, "appended certificate serial"),
        AttributeChange::Unchanged => {}
    }
    for stale in [CERTIFICATE_ATTRIBUTE, SIGNATURE_ATTRIBUTE] {
        if root.attributes.remove(stale).is_some() {
            tracing::debug!(attribute = stale, "removed stale attribute before canonicalization");
        }
    }
    PhaseAReceipt {
        serial: serial.to_string(),
        canonical_input: doc.to_xml(),
    }
}

/// Phase B: append certificate then signature, serialize, and verify the
/// round trip. Returns the final document string.
pub fn attach_signature(
    doc: &mut DocumentSnapshot,
    receipt: &PhaseAReceipt,
    certificate_base64: &str,
    signature: &SignatureValue,
) -> Result<String, ReconcileError> {
    if certificate_base64.trim().is_empty() {
        return Err(ReconcileError::SignatureValueEmpty {
            attribute: CERTIFICATE_ATTRIBUTE,
        });
    }
    if signature.as_str().trim().is_empty() {
        return Err(ReconcileError::SignatureValueEmpty {
            attribute: SIGNATURE_ATTRIBUTE,
        });
    }

    let root = doc.root_mut();
    let found = root.attributes.get(SERIAL_ATTRIBUTE);
    if found != Some(receipt.serial()) {
        return Err(ReconcileError::SerialChanged {
            expected: receipt.serial.clone(),
            found: found.map(str::to_string),
        });
    }
    root.attributes.set(CERTIFICATE_ATTRIBUTE, certificate_base64);
    root.attributes.set(SIGNATURE_ATTRIBUTE, signature.as_str());

    let signed = doc.to_xml();
    verify_round_trip(&signed, receipt)?;
    Ok(signed)
}

/// Re-read the final form, drop the two appended attributes and compare with
/// what was canonicalized.
pub fn verify_round_trip(signed: &str, receipt: &PhaseAReceipt) -> Result<(), ReconcileError> {
    let mut reread = DocumentSnapshot::parse(signed)?;
    let root = reread.root_mut();
    root.attributes.remove(CERTIFICATE_ATTRIBUTE);
    root.attributes.remove(SIGNATURE_ATTRIBUTE);

    let stripped = collapse_inter_tag_whitespace(&reread.to_xml());
    let expected = collapse_inter_tag_whitespace(receipt.canonical_input());
    if stripped != expected {
        let at = stripped
            .bytes()
            .zip(expected.bytes())
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| stripped.len().min(expected.len()));
        tracing::error!(
            signed_len = stripped.len(),
            canonicalized_len = expected.len(),
            first_difference = at,
            "round-trip verification failed"
        );
        return Err(ReconcileError::RoundTripMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" Version="4.0" Sello="old" NoCertificado="1" Fecha="2024-05-10T12:00:00" Certificado="old"><cfdi:Emisor Rfc="EKU9003173C9"/></cfdi:Comprobante>"#;

    #[test]
    fn phase_a_replaces_serial_in_place_and_drops_stale_values() {
        let mut doc = DocumentSnapshot::parse(DOC).unwrap();
        let receipt = prepare_for_canonicalization(&mut doc, "30001000000500003416");
        let names: Vec<_> = doc.root().attributes.names().collect();
        assert_eq!(names, ["xmlns:cfdi", "Version", "NoCertificado", "Fecha"]);
        assert!(receipt.canonical_input().contains(r#"NoCertificado="30001000000500003416""#));
        assert_eq!(receipt.canonical_input(), doc.to_xml());
    }

    #[test]
    fn phase_b_appends_certificate_then_signature() {
        let mut doc = DocumentSnapshot::parse(DOC).unwrap();
        let receipt = prepare_for_canonicalization(&mut doc, "30001000000500003416");
        let signed = attach_signature(
            &mut doc,
            &receipt,
            "MIIBCERT",
            &SignatureValue::from("c2lnbmF0dXJl".to_string()),
        )
        .unwrap();
        assert!(signed.contains(
            r#"Fecha="2024-05-10T12:00:00" Certificado="MIIBCERT" Sello="c2lnbmF0dXJl">"#
        ));
    }

    #[test]
    fn empty_values_are_rejected() {
        let mut doc = DocumentSnapshot::parse(DOC).unwrap();
        let receipt = prepare_for_canonicalization(&mut doc, "1");
        let err = attach_signature(&mut doc, &receipt, "CERT", &SignatureValue::from(String::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::SignatureValueEmpty { attribute: "Sello" }
        ));
    }

    #[test]
    fn serial_drift_is_detected() {
        let mut doc = DocumentSnapshot::parse(DOC).unwrap();
        let receipt = prepare_for_canonicalization(&mut doc, "1");
        doc.root_mut().attributes.set(SERIAL_ATTRIBUTE, "2");
        let err = attach_signature(&mut doc, &receipt, "CERT", &SignatureValue::from("s".to_string()))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::SerialChanged { .. }));
    }

    #[test]
    fn mutation_between_phases_fails_round_trip() {
        let mut doc = DocumentSnapshot::parse(DOC).unwrap();
        let receipt = prepare_for_canonicalization(&mut doc, "1");
        doc.root_mut().attributes.set("Fecha", "2024-05-10T12:00:01");
        let err = attach_signature(&mut doc, &receipt, "CERT", &SignatureValue::from("s".to_string()))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::RoundTripMismatch));
    }

    #[test]
    fn indentation_alone_is_not_a_mismatch() {
        let mut doc = DocumentSnapshot::parse(DOC).unwrap();
        let receipt = prepare_for_canonicalization(&mut doc, "1");
        let signed = attach_signature(&mut doc, &receipt, "CERT", &SignatureValue::from("s".to_string()))
            .unwrap();
        let pretty = signed.replace("><", ">\n  <");
        verify_round_trip(&pretty, &receipt).unwrap();
    }
}
