//! End-to-end sealing: normalize, fix the serial, canonicalize, sign,
//! attach, verify.
//!
//! Every failure is caught here and turned into an unsigned outcome that
//! carries the caller's original bytes; partial output never escapes.
use crate::canonical::{CanonicalError, Canonicalizer, Xsltproc};
use crate::clock::{Clock, SystemClock};
use crate::config::SigningConfig;
use crate::diagnostics::DiagnosticsSink;
use crate::document::{DocumentError, DocumentKind, DocumentSnapshot};
use crate::material::{MaterialError, SigningMaterial};
use crate::normalize::{Correction, Normalizer};
use crate::reconcile::{self, ReconcileError};
use crate::sign::{sign_canonical, SignError, SignatureValue};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("signing material unavailable: {0}")]
    MaterialUnavailable(Arc<MaterialError>),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// One document to seal. `signing_enabled` is read on every call.
#[derive(Debug, Clone, Copy)]
pub struct SealRequest<'a> {
    pub xml: &'a str,
    pub kind: DocumentKind,
    pub signing_enabled: bool,
}

impl<'a> SealRequest<'a> {
    pub fn new(xml: &'a str, kind: DocumentKind) -> Self {
        Self {
            xml,
            kind,
            signing_enabled: true,
        }
    }

    pub fn with_signing_enabled(mut self, enabled: bool) -> Self {
        self.signing_enabled = enabled;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SignedDocument {
    pub xml: String,
    pub canonical: String,
    pub serial: String,
    pub signature: SignatureValue,
    pub corrections: Vec<Correction>,
}

#[derive(Debug)]
pub enum SealOutcome {
    /// Signing was switched off for this call; `document` is the input.
    Disabled { document: String },
    Signed(SignedDocument),
    /// Something failed; `document` is the input, untouched.
    Unsigned { document: String, reason: SealError },
}

impl SealOutcome {
    /// The string to hand back to the caller, whatever happened.
    pub fn document(&self) -> &str {
        match self {
            SealOutcome::Disabled { document } | SealOutcome::Unsigned { document, .. } => document,
            SealOutcome::Signed(signed) => &signed.xml,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, SealOutcome::Signed(_))
    }
}

pub struct SealEngine {
    material: Result<Arc<SigningMaterial>, Arc<MaterialError>>,
    canonicalizer: Canonicalizer,
    normalizer: Normalizer,
    clock: Box<dyn Clock>,
    diagnostics: Option<DiagnosticsSink>,
}

impl std::fmt::Debug for SealEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealEngine")
            .field("material", &self.material)
            .field("canonicalizer", &self.canonicalizer)
            .field("normalizer", &self.normalizer)
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}

impl SealEngine {
    /// A failed `material` leaves the engine usable: every sealed call then
    /// returns the input unsigned with the load error as the reason.
    pub fn new(
        material: Result<SigningMaterial, MaterialError>,
        canonicalizer: Canonicalizer,
        normalizer: Normalizer,
    ) -> Self {
        if let Err(e) = &material {
            tracing::error!(error = %e, "signing material failed to load; documents will be returned unsigned");
        }
        Self {
            material: material.map(Arc::new).map_err(Arc::new),
            canonicalizer,
            normalizer,
            clock: Box::new(SystemClock),
            diagnostics: None,
        }
    }

    /// Build an engine from configuration, running stylesheets with the
    /// configured XSLT processor.
    pub fn from_config(config: &SigningConfig) -> Self {
        let material = SigningMaterial::load_files(
            &config.key_path,
            config.key_password.as_deref(),
            &config.certificate_path,
        );
        let canonicalizer = Canonicalizer::new(
            config.stylesheet_resolver(),
            Xsltproc::new(&config.xslt_processor),
            config.canonicalizer_options(),
        );
        let mut engine = Self::new(
            material,
            canonicalizer,
            Normalizer::new(config.normalizer_options()),
        );
        if let Some(dir) = &config.diagnostics_dir {
            engine = engine
                .with_diagnostics(DiagnosticsSink::new(dir).with_offset(config.utc_offset));
        }
        engine
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_diagnostics(mut self, sink: DiagnosticsSink) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn material(&self) -> Result<&SigningMaterial, &MaterialError> {
        self.material.as_deref().map_err(Arc::as_ref)
    }

    pub fn canonicalizer(&self) -> &Canonicalizer {
        &self.canonicalizer
    }

    /// Seal one document.
    ///
    /// # Examples
    /// ```rust,no_run
    /// use sello_core::config::SigningConfig;
    /// use sello_core::document::DocumentKind;
    /// use sello_core::engine::{SealEngine, SealOutcome, SealRequest};
    ///
    /// let config = SigningConfig::from_properties_file("sello.properties".as_ref())?;
    /// let engine = SealEngine::from_config(&config);
    /// let xml = std::fs::read_to_string("invoice.xml")?;
    /// let request = SealRequest::new(&xml, DocumentKind::Invoice)
    ///     .with_signing_enabled(config.signing_enabled);
    /// match engine.seal(&request) {
    ///     SealOutcome::Signed(signed) => println!("{}", signed.xml),
    ///     SealOutcome::Disabled { document } => println!("{document}"),
    ///     SealOutcome::Unsigned { reason, .. } => eprintln!("unsigned: {reason}"),
    /// }
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn seal(&self, request: &SealRequest<'_>) -> SealOutcome {
        let kind = request.kind;
        if !request.signing_enabled {
            tracing::info!(kind = kind.as_str(), "signing disabled; returning document unchanged");
            return SealOutcome::Disabled {
                document: request.xml.to_string(),
            };
        }

        match self.try_seal(request.xml, kind) {
            Ok(signed) => {
                if let Some(sink) = &self.diagnostics {
                    sink.record(kind, self.clock.now_utc(), &signed.canonical, &signed.xml);
                }
                tracing::info!(
                    kind = kind.as_str(),
                    serial = %signed.serial,
                    corrections = signed.corrections.len(),
                    "document sealed"
                );
                SealOutcome::Signed(signed)
            }
            Err(reason) => {
                tracing::warn!(kind = kind.as_str(), error = %reason, "returning document unsigned");
                SealOutcome::Unsigned {
                    document: request.xml.to_string(),
                    reason,
                }
            }
        }
    }

    /// Canonical string the engine would sign for `xml`, without signing.
    pub fn canonical_string(&self, xml: &str, kind: DocumentKind) -> Result<String, SealError> {
        let material = self.loaded_material()?;
        let mut doc = DocumentSnapshot::parse(xml)?;
        self.normalizer.normalize(&mut doc, kind, self.clock.now_utc());
        let receipt = reconcile::prepare_for_canonicalization(&mut doc, material.certificate_serial());
        Ok(self.canonicalizer.canonicalize(&doc, kind, receipt.serial())?)
    }

    fn try_seal(&self, xml: &str, kind: DocumentKind) -> Result<SignedDocument, SealError> {
        let material = self.loaded_material()?;
        let mut doc = DocumentSnapshot::parse(xml)?;

        let corrections = self.normalizer.normalize(&mut doc, kind, self.clock.now_utc());
        let receipt = reconcile::prepare_for_canonicalization(&mut doc, material.certificate_serial());
        let canonical = self.canonicalizer.canonicalize(&doc, kind, receipt.serial())?;
        let signature = sign_canonical(material.private_key(), &canonical)?;
        let xml = reconcile::attach_signature(
            &mut doc,
            &receipt,
            material.certificate_base64(),
            &signature,
        )?;

        Ok(SignedDocument {
            xml,
            canonical,
            serial: receipt.serial().to_string(),
            signature,
            corrections,
        })
    }

    fn loaded_material(&self) -> Result<&SigningMaterial, SealError> {
        self.material
            .as_deref()
            .map_err(|e| SealError::MaterialUnavailable(Arc::clone(e)))
    }
}
