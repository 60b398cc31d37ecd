//! Digital-signature engine for electronic tax documents (CFDI invoices,
//! payment complements and withholding certificates).
//!
//! The pipeline is: normalize business invariants, fix the certificate serial
//! on the root, canonicalize with the authority's stylesheet, sign with
//! RSA/SHA-256, then append the certificate and signature and verify that
//! nothing else moved.
//!
//! # Examples
//! ```rust
//! use sello_core::document::{DocumentKind, DocumentSnapshot};
//! use sello_core::normalize::Normalizer;
//!
//! let mut doc = DocumentSnapshot::parse(r#"<cfdi:Comprobante Fecha="2024-05-10T12:00:00"/>"#)?;
//! let corrections = Normalizer::default().normalize(&mut doc, DocumentKind::Invoice, chrono::Utc::now());
//! # let _ = corrections;
//! # Ok::<(), sello_core::Error>(())
//! ```
pub mod canonical;
pub mod certificate;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod document;
pub mod engine;
pub mod key;
pub mod material;
pub mod normalize;
pub mod reconcile;
pub mod sign;

use thiserror::Error;

pub use canonical::CanonicalError;
pub use certificate::CertificateError;
pub use config::{ConfigError, PolicyParseError};
pub use document::DocumentError;
pub use engine::SealError;
pub use key::KeyDecodeError;
pub use material::MaterialError;
pub use reconcile::ReconcileError;
pub use sign::SignError;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    KeyDecode(#[from] KeyDecodeError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Material(#[from] MaterialError),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Policy(#[from] PolicyParseError),
}
