//! Canonical "original string" production.
//!
//! The canonical string is whatever the authority's published stylesheet for
//! the document kind produces; this module only finds, stages and runs that
//! stylesheet, then checks the result has the expected shape. There is no
//! hand-written fallback.
mod resolve;
mod xslt;

pub use resolve::{StagedStylesheet, StylesheetResolver};
pub use xslt::{Transform, Xsltproc};

use crate::config::PolicyParseError;
use crate::document::{DocumentKind, DocumentSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

const SAMPLE_CHARS: usize = 24;

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("canonicalization unavailable for {kind:?}: {detail}")]
    Unavailable { kind: DocumentKind, detail: String },
    #[error("required sub-template {href} of {stylesheet} could not be resolved")]
    MissingSubTemplate { href: String, stylesheet: PathBuf },
    #[error("document namespace {namespace} is not handled by {stylesheet}; unresolved sub-templates: {unresolved}")]
    UncoveredExtension {
        namespace: String,
        stylesheet: PathBuf,
        unresolved: String,
    },
    #[error("canonical string failed integrity check: {detail}")]
    Integrity { detail: String },
}

/// What to do when the canonical string is not shaped `|…||`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelimiterPolicy {
    #[default]
    Reject,
    Warn,
}

impl DelimiterPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelimiterPolicy::Reject => "reject",
            DelimiterPolicy::Warn => "warn",
        }
    }
}

impl FromStr for DelimiterPolicy {
    type Err = PolicyParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(DelimiterPolicy::Reject),
            "warn" => Ok(DelimiterPolicy::Warn),
            _ => Err(PolicyParseError::Invalid {
                policy: "delimiter",
                input: input.to_string(),
            }),
        }
    }
}

/// Stylesheet shipped by the authority for each kind.
pub fn default_stylesheet(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Invoice => "cadenaoriginal_4_0.xslt",
        DocumentKind::PaymentComplement => "cadenaoriginal_4_0_pagos.xslt",
        DocumentKind::Withholding => "retenciones20.xslt",
    }
}

#[derive(Debug, Clone)]
pub struct CanonicalizerOptions {
    pub stylesheets: HashMap<DocumentKind, String>,
    /// Sub-templates that must resolve whatever the document uses.
    pub always_required: Vec<String>,
    pub delimiter_policy: DelimiterPolicy,
    /// Namespaces the main stylesheet handles without a sub-template.
    pub base_namespaces: Vec<String>,
}

/// Base document, schema-instance and stamp namespaces of every kind.
pub const BASE_NAMESPACES: &[&str] = &[
    "http://www.sat.gob.mx/cfd/3",
    "http://www.sat.gob.mx/cfd/4",
    "http://www.sat.gob.mx/esquemas/retencionpago/1",
    "http://www.sat.gob.mx/esquemas/retencionpago/2",
    "http://www.sat.gob.mx/TimbreFiscalDigital",
    "http://www.w3.org/2001/XMLSchema-instance",
    "http://www.w3.org/XML/1998/namespace",
];

impl Default for CanonicalizerOptions {
    fn default() -> Self {
        Self {
            stylesheets: DocumentKind::ALL
                .into_iter()
                .map(|kind| (kind, default_stylesheet(kind).to_string()))
                .collect(),
            always_required: vec!["utilerias.xslt".to_string()],
            delimiter_policy: DelimiterPolicy::default(),
            base_namespaces: BASE_NAMESPACES.iter().map(|ns| ns.to_string()).collect(),
        }
    }
}

impl CanonicalizerOptions {
    pub fn stylesheet(&self, kind: DocumentKind) -> &str {
        self.stylesheets
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| default_stylesheet(kind))
    }
}

/// Produces canonical strings for documents of every kind.
///
/// Staging happens once per kind and is then shared by all callers.
pub struct Canonicalizer {
    resolver: StylesheetResolver,
    transform: Box<dyn Transform>,
    options: CanonicalizerOptions,
    staged: RwLock<HashMap<DocumentKind, Arc<StagedStylesheet>>>,
}

impl std::fmt::Debug for Canonicalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canonicalizer")
            .field("resolver", &self.resolver)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Canonicalizer {
    pub fn new(
        resolver: StylesheetResolver,
        transform: impl Transform + 'static,
        options: CanonicalizerOptions,
    ) -> Self {
        Self {
            resolver,
            transform: Box::new(transform),
            options,
            staged: RwLock::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &CanonicalizerOptions {
        &self.options
    }

    /// Canonical string of `doc` as it is serialized right now.
    ///
    /// `serial` must appear verbatim in the result.
    pub fn canonicalize(
        &self,
        doc: &DocumentSnapshot,
        kind: DocumentKind,
        serial: &str,
    ) -> Result<String, CanonicalError> {
        let staged = self.staged(kind)?;
        self.check_sub_templates(&staged, doc)?;

        let output = self.transform.apply(&staged, &doc.to_xml())?;
        let canonical = output.trim_end_matches(['\r', '\n']).to_string();
        self.check_integrity(&canonical, serial)?;

        tracing::debug!(kind = kind.as_str(), len = canonical.len(), "canonical string produced");
        Ok(canonical)
    }

    /// Staged bundle for `kind`, staging it on first use.
    pub fn staged(&self, kind: DocumentKind) -> Result<Arc<StagedStylesheet>, CanonicalError> {
        if let Some(staged) = self
            .staged
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
        {
            return Ok(Arc::clone(staged));
        }

        let fresh = Arc::new(resolve::stage(
            &self.resolver,
            kind,
            self.options.stylesheet(kind),
        )?);
        let mut cache = self.staged.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(cache.entry(kind).or_insert(fresh)))
    }

    /// A placeholder is only acceptable while nothing in the document needs
    /// it: no always-required or stem-matched `href`, and no document
    /// namespace left without a template in the staged bundle.
    fn check_sub_templates(
        &self,
        staged: &StagedStylesheet,
        doc: &DocumentSnapshot,
    ) -> Result<(), CanonicalError> {
        if staged.placeholders().is_empty() {
            return Ok(());
        }
        let namespaces = doc.namespace_uris();
        for href in staged.placeholders() {
            let file_name = href.rsplit(['/', '\\']).next().unwrap_or(href);
            let always = self
                .options
                .always_required
                .iter()
                .any(|required| required.eq_ignore_ascii_case(file_name));
            if always || resolve::extension_used(href, &namespaces) {
                tracing::error!(
                    href = %href,
                    stylesheet = %staged.source().display(),
                    "required sub-template missing"
                );
                return Err(CanonicalError::MissingSubTemplate {
                    href: href.clone(),
                    stylesheet: staged.source().to_path_buf(),
                });
            }
        }

        let uncovered = namespaces.into_iter().find(|uri| {
            !staged.covers(uri) && !self.options.base_namespaces.iter().any(|base| base == uri)
        });
        if let Some(namespace) = uncovered {
            let unresolved = staged.placeholders().join(", ");
            tracing::error!(
                namespace,
                stylesheet = %staged.source().display(),
                unresolved = %unresolved,
                "document extension has no resolved sub-template"
            );
            return Err(CanonicalError::UncoveredExtension {
                namespace: namespace.to_string(),
                stylesheet: staged.source().to_path_buf(),
                unresolved,
            });
        }
        Ok(())
    }

    fn check_integrity(&self, canonical: &str, serial: &str) -> Result<(), CanonicalError> {
        if !(canonical.starts_with('|') && canonical.ends_with("||")) {
            let prefix: String = canonical.chars().take(SAMPLE_CHARS).collect();
            let suffix: String = {
                let tail: Vec<char> = canonical.chars().rev().take(SAMPLE_CHARS).collect();
                tail.into_iter().rev().collect()
            };
            tracing::warn!(
                len = canonical.len(),
                prefix = %prefix,
                suffix = %suffix,
                policy = self.options.delimiter_policy.as_str(),
                "canonical string is not delimited as |...||"
            );
            if self.options.delimiter_policy == DelimiterPolicy::Reject {
                return Err(CanonicalError::Integrity {
                    detail: format!(
                        "expected |...|| delimiters, got {} bytes starting {prefix:?} ending {suffix:?}",
                        canonical.len()
                    ),
                });
            }
        }
        if serial.is_empty() || !canonical.contains(serial) {
            return Err(CanonicalError::Integrity {
                detail: format!("certificate serial {serial:?} missing from canonical string"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const MAIN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:include href="utilerias.xslt"/>
  <xsl:include href="pagos20.xslt"/>
  <xsl:output method="text"/>
</xsl:stylesheet>
"#;

    fn fixture_dir(with_utilities: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for kind in DocumentKind::ALL {
            fs::write(dir.path().join(default_stylesheet(kind)), MAIN).unwrap();
        }
        if with_utilities {
            fs::write(
                dir.path().join("utilerias.xslt"),
                r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform"/>"#,
            )
            .unwrap();
        }
        dir
    }

    fn canonicalizer(
        dir: &tempfile::TempDir,
        output: &'static str,
        policy: DelimiterPolicy,
    ) -> Canonicalizer {
        Canonicalizer::new(
            StylesheetResolver::new(vec![dir.path().to_path_buf()]),
            move |_: &StagedStylesheet, _: &str| -> Result<String, CanonicalError> {
                Ok(format!("{output}\n"))
            },
            CanonicalizerOptions {
                delimiter_policy: policy,
                ..CanonicalizerOptions::default()
            },
        )
    }

    fn doc(extension: Option<&str>) -> DocumentSnapshot {
        let declaration = extension
            .map(|ns| format!(r#" xmlns:x="{ns}""#))
            .unwrap_or_default();
        DocumentSnapshot::parse(&format!(
            r#"<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"{declaration} NoCertificado="30001000000500003416"/>"#
        ))
        .unwrap()
    }

    #[test]
    fn well_formed_output_is_returned_without_trailing_newline() {
        let dir = fixture_dir(true);
        let c = canonicalizer(&dir, "||4.0|30001000000500003416||", DelimiterPolicy::Reject);
        let out = c
            .canonicalize(&doc(None), DocumentKind::Invoice, "30001000000500003416")
            .unwrap();
        assert_eq!(out, "||4.0|30001000000500003416||");
    }

    #[test]
    fn staging_is_cached_per_kind() {
        let dir = fixture_dir(true);
        let c = canonicalizer(&dir, "||x||", DelimiterPolicy::Reject);
        let first = c.staged(DocumentKind::Invoice).unwrap();
        let second = c.staged(DocumentKind::Invoice).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let other = c.staged(DocumentKind::Withholding).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn unused_extension_gets_placeholder_but_used_one_fails() {
        let dir = fixture_dir(true);
        let c = canonicalizer(&dir, "||1||", DelimiterPolicy::Reject);
        c.canonicalize(&doc(None), DocumentKind::PaymentComplement, "1")
            .unwrap();
        let err = c
            .canonicalize(
                &doc(Some("http://www.sat.gob.mx/Pagos20")),
                DocumentKind::PaymentComplement,
                "1",
            )
            .unwrap_err();
        assert!(matches!(err, CanonicalError::MissingSubTemplate { ref href, .. } if href == "pagos20.xslt"));
    }

    #[test]
    fn extension_whose_file_name_differs_from_its_namespace_still_fails() {
        let dir = fixture_dir(true);
        let c = canonicalizer(&dir, "||1||", DelimiterPolicy::Reject);
        let ecc12 = "http://www.sat.gob.mx/EstadoDeCuentaCombustible12";
        let err = c
            .canonicalize(&doc(Some(ecc12)), DocumentKind::Invoice, "1")
            .unwrap_err();
        match err {
            CanonicalError::UncoveredExtension {
                namespace,
                unresolved,
                ..
            } => {
                assert_eq!(namespace, ecc12);
                assert_eq!(unresolved, "pagos20.xslt");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn extension_handled_by_a_resolved_sub_template_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(default_stylesheet(DocumentKind::Invoice)),
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:include href="utilerias.xslt"/>
  <xsl:include href="ecc12.xslt"/>
  <xsl:include href="implocal.xslt"/>
</xsl:stylesheet>"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("utilerias.xslt"),
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform"/>"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("ecc12.xslt"),
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform" xmlns:ecc12="http://www.sat.gob.mx/EstadoDeCuentaCombustible12">
  <xsl:template match="ecc12:EstadoDeCuentaCombustible"/>
</xsl:stylesheet>"#,
        )
        .unwrap();

        let c = canonicalizer(&dir, "||1||", DelimiterPolicy::Reject);
        let ecc12 = "http://www.sat.gob.mx/EstadoDeCuentaCombustible12";
        assert_eq!(
            c.canonicalize(&doc(Some(ecc12)), DocumentKind::Invoice, "1")
                .unwrap(),
            "||1||"
        );
        let staged = c.staged(DocumentKind::Invoice).unwrap();
        assert_eq!(staged.placeholders(), ["implocal.xslt"]);
    }

    #[test]
    fn always_required_sub_template_fails_loudly() {
        let dir = fixture_dir(false);
        let c = canonicalizer(&dir, "||1||", DelimiterPolicy::Reject);
        let err = c
            .canonicalize(&doc(None), DocumentKind::Invoice, "1")
            .unwrap_err();
        assert!(matches!(err, CanonicalError::MissingSubTemplate { ref href, .. } if href == "utilerias.xslt"));
    }

    #[test]
    fn delimiter_policy_decides_on_malformed_shape() {
        let dir = fixture_dir(true);
        let strict = canonicalizer(&dir, "|1|", DelimiterPolicy::Reject);
        assert!(matches!(
            strict.canonicalize(&doc(None), DocumentKind::Invoice, "1"),
            Err(CanonicalError::Integrity { .. })
        ));
        let lenient = canonicalizer(&dir, "|1|", DelimiterPolicy::Warn);
        assert_eq!(
            lenient
                .canonicalize(&doc(None), DocumentKind::Invoice, "1")
                .unwrap(),
            "|1|"
        );
    }

    #[test]
    fn missing_serial_is_always_an_integrity_error() {
        let dir = fixture_dir(true);
        let lenient = canonicalizer(&dir, "||4.0||", DelimiterPolicy::Warn);
        let err = lenient
            .canonicalize(&doc(None), DocumentKind::Invoice, "30001000000500003416")
            .unwrap_err();
        assert!(matches!(err, CanonicalError::Integrity { .. }));
    }

    #[test]
    fn policies_parse_from_configuration_text() {
        assert_eq!("WARN".parse::<DelimiterPolicy>().unwrap(), DelimiterPolicy::Warn);
        assert!("lax".parse::<DelimiterPolicy>().is_err());
    }
}
