//! Signing configuration read from a Java-style `.properties` file.
//!
//! Recognised keys (all optional except the key and certificate locations):
//!
//! | key | meaning |
//! |-----|---------|
//! | `sello.key.path` | private key file or `classpath:` resource |
//! | `sello.key.password` | key password; empty means none |
//! | `sello.certificate.path` | certificate file or `classpath:` resource |
//! | `sello.resource.root` | root for `classpath:` resources (default `resources`) |
//! | `sello.signing.enabled` | `true`/`false`, default `true` |
//! | `sello.xslt.roots` | comma-separated stylesheet search roots |
//! | `sello.xslt.invoice`, `sello.xslt.payment_complement`, `sello.xslt.withholding` | stylesheet names |
//! | `sello.xslt.required` | comma-separated sub-templates that must always resolve |
//! | `sello.xslt.processor` | XSLT processor binary (default `xsltproc`) |
//! | `sello.canonical.delimiter_policy` | `reject` or `warn` |
//! | `sello.normalize.strip_policy` | `conservative` or `minimal` |
//! | `sello.normalize.tolerance_seconds` | timestamp tolerance, default 300 |
//! | `sello.normalize.utc_offset` | reference offset, default `-06:00` |
//! | `sello.diagnostics.dir` | optional diagnostics directory |
//!
//! Relative paths are taken relative to the directory holding the file.
use crate::canonical::{CanonicalizerOptions, DelimiterPolicy, StylesheetResolver};
use crate::document::DocumentKind;
use crate::normalize::{NormalizerOptions, StripPolicy};
use chrono::{FixedOffset, TimeDelta};
use java_properties::read;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CLASSPATH_PREFIX: &str = "classpath:";

/// Error returned when parsing a policy enum from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyParseError {
    #[error("invalid {policy} policy: {input}")]
    Invalid { policy: &'static str, input: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse properties from '{path}': {source}")]
    PropertiesRead {
        path: PathBuf,
        #[source]
        source: java_properties::PropertiesError,
    },
    #[error("missing required property '{key}'")]
    MissingProperty { key: &'static str },
    #[error("invalid value {value:?} for '{key}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Policy(#[from] PolicyParseError),
}

/// Everything the engine needs, with paths already resolved.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub key_path: PathBuf,
    pub key_password: Option<String>,
    pub certificate_path: PathBuf,
    pub signing_enabled: bool,
    pub stylesheet_roots: Vec<PathBuf>,
    pub stylesheets: HashMap<DocumentKind, String>,
    pub always_required: Vec<String>,
    pub xslt_processor: PathBuf,
    pub delimiter_policy: DelimiterPolicy,
    pub strip_policy: StripPolicy,
    pub tolerance: TimeDelta,
    pub utc_offset: FixedOffset,
    pub diagnostics_dir: Option<PathBuf>,
}

impl SigningConfig {
    /// Minimal configuration with every optional setting at its default.
    pub fn new(key_path: impl Into<PathBuf>, certificate_path: impl Into<PathBuf>) -> Self {
        let canonical = CanonicalizerOptions::default();
        let normalize = NormalizerOptions::default();
        Self {
            key_path: key_path.into(),
            key_password: None,
            certificate_path: certificate_path.into(),
            signing_enabled: true,
            stylesheet_roots: Vec::new(),
            stylesheets: canonical.stylesheets,
            always_required: canonical.always_required,
            xslt_processor: PathBuf::from("xsltproc"),
            delimiter_policy: canonical.delimiter_policy,
            strip_policy: normalize.strip_policy,
            tolerance: normalize.tolerance,
            utc_offset: normalize.offset,
            diagnostics_dir: None,
        }
    }

    /// Read a `.properties` file.
    ///
    /// # Examples
    /// ```rust,no_run
    /// use sello_core::config::SigningConfig;
    ///
    /// let config = SigningConfig::from_properties_file("sello.properties".as_ref())?;
    /// assert!(config.signing_enabled);
    /// # Ok::<(), sello_core::config::ConfigError>(())
    /// ```
    pub fn from_properties_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let map = read(BufReader::new(file)).map_err(|e| ConfigError::PropertiesRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_map(&map, base_dir)
    }

    pub fn from_map(map: &HashMap<String, String>, base_dir: &Path) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            map.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::MissingProperty { key });
        let relative = |value: &str| base_dir.join(value);

        let resource_root = relative(get("sello.resource.root").unwrap_or("resources"));
        let locate = |value: &str| resolve_resource(value, &resource_root, base_dir);

        let mut config = Self::new(
            locate(required("sello.key.path")?),
            locate(required("sello.certificate.path")?),
        );
        // Passwords are taken verbatim; surrounding spaces may be significant.
        config.key_password = map
            .get("sello.key.password")
            .filter(|p| !p.is_empty())
            .cloned();

        if let Some(value) = get("sello.signing.enabled") {
            config.signing_enabled = parse_bool("sello.signing.enabled", value)?;
        }
        if let Some(value) = get("sello.xslt.roots") {
            config.stylesheet_roots = split_list(value).map(locate).collect();
        }
        for (kind, key) in [
            (DocumentKind::Invoice, "sello.xslt.invoice"),
            (DocumentKind::PaymentComplement, "sello.xslt.payment_complement"),
            (DocumentKind::Withholding, "sello.xslt.withholding"),
        ] {
            if let Some(name) = get(key) {
                config.stylesheets.insert(kind, name.to_string());
            }
        }
        if let Some(value) = get("sello.xslt.required") {
            config.always_required = split_list(value).map(str::to_string).collect();
        }
        if let Some(value) = get("sello.xslt.processor") {
            config.xslt_processor = PathBuf::from(value);
        }
        if let Some(value) = get("sello.canonical.delimiter_policy") {
            config.delimiter_policy = value.parse()?;
        }
        if let Some(value) = get("sello.normalize.strip_policy") {
            config.strip_policy = value.parse()?;
        }
        if let Some(value) = get("sello.normalize.tolerance_seconds") {
            let seconds: i64 = value.parse().map_err(|e| ConfigError::InvalidValue {
                key: "sello.normalize.tolerance_seconds",
                value: value.to_string(),
                reason: format!("{e}"),
            })?;
            if seconds < 0 {
                return Err(ConfigError::InvalidValue {
                    key: "sello.normalize.tolerance_seconds",
                    value: value.to_string(),
                    reason: "must not be negative".to_string(),
                });
            }
            config.tolerance = TimeDelta::seconds(seconds);
        }
        if let Some(value) = get("sello.normalize.utc_offset") {
            config.utc_offset = value.parse().map_err(|e| ConfigError::InvalidValue {
                key: "sello.normalize.utc_offset",
                value: value.to_string(),
                reason: format!("{e}"),
            })?;
        }
        config.diagnostics_dir = get("sello.diagnostics.dir").map(relative);

        tracing::debug!(
            key = %config.key_path.display(),
            certificate = %config.certificate_path.display(),
            signing_enabled = config.signing_enabled,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn stylesheet_resolver(&self) -> StylesheetResolver {
        StylesheetResolver::new(self.stylesheet_roots.clone())
    }

    pub fn canonicalizer_options(&self) -> CanonicalizerOptions {
        CanonicalizerOptions {
            stylesheets: self.stylesheets.clone(),
            always_required: self.always_required.clone(),
            delimiter_policy: self.delimiter_policy,
            ..CanonicalizerOptions::default()
        }
    }

    pub fn normalizer_options(&self) -> NormalizerOptions {
        NormalizerOptions {
            offset: self.utc_offset,
            tolerance: self.tolerance,
            strip_policy: self.strip_policy,
        }
    }
}

/// `classpath:` locations hang off the resource root; anything else is a
/// path, relative to `base_dir` unless absolute.
pub fn resolve_resource(location: &str, resource_root: &Path, base_dir: &Path) -> PathBuf {
    match location.strip_prefix(CLASSPATH_PREFIX) {
        Some(rest) => resource_root.join(rest.trim_start_matches('/')),
        None => base_dir.join(location),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
