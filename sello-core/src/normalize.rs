//! Pre-signature business corrections.
//!
//! Every rule here changes bytes that end up in the canonical string, so the
//! normalizer always runs before canonicalization. Rules are local and
//! idempotent: a second pass over normalized output reports no corrections.
mod codes;

use crate::config::PolicyParseError;
use crate::document::{AttributeChange, DocumentKind, DocumentSnapshot, Element};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeDelta, Timelike, Utc};
use codes::TaxpayerFamily;
use iso_currency::Currency;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Format of the root timestamp: local time, no offset, whole seconds.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

/// How aggressively payment-complement roots are stripped.
///
/// `Conservative` also removes attributes that are only forbidden on payment
/// documents under some readings of the rules (`CondicionesDePago`,
/// `Descuento`); `Minimal` removes only the ones that are always forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StripPolicy {
    #[default]
    Conservative,
    Minimal,
}

impl StripPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StripPolicy::Conservative => "conservative",
            StripPolicy::Minimal => "minimal",
        }
    }
}

impl FromStr for StripPolicy {
    type Err = PolicyParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(StripPolicy::Conservative),
            "minimal" => Ok(StripPolicy::Minimal),
            _ => Err(PolicyParseError::Invalid {
                policy: "strip",
                input: input.to_string(),
            }),
        }
    }
}

/// Which rule produced a [`Correction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    TimestampClamp,
    TimestampFormat,
    PaymentZeroing,
    PaymentStrip,
    UsageCode,
    RegimeCode,
}

/// One attribute change made by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correction {
    pub rule: Rule,
    pub element: String,
    pub attribute: String,
    pub previous: Option<String>,
    pub current: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizerOptions {
    pub offset: FixedOffset,
    pub tolerance: TimeDelta,
    pub strip_policy: StripPolicy,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            offset: crate::clock::default_offset(),
            tolerance: TimeDelta::seconds(DEFAULT_TOLERANCE_SECONDS),
            strip_policy: StripPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    options: NormalizerOptions,
}

const PAYMENT_ZEROED: &[&str] = &["SubTotal", "Total"];
const PAYMENT_STRIPPED: &[&str] = &["TipoCambio", "MetodoPago", "FormaPago"];
const PAYMENT_STRIPPED_CONSERVATIVE: &[&str] = &["CondicionesDePago", "Descuento"];
const PAYMENT_USAGE: &str = "CP01";

impl Normalizer {
    pub fn new(options: NormalizerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &NormalizerOptions {
        &self.options
    }

    /// Apply every rule for `kind`, in order, and report what changed.
    pub fn normalize(
        &self,
        doc: &mut DocumentSnapshot,
        kind: DocumentKind,
        now: DateTime<Utc>,
    ) -> Vec<Correction> {
        let mut corrections = Vec::new();
        let root = doc.root_mut();

        self.clamp_timestamp(root, kind, now, &mut corrections);
        if kind == DocumentKind::PaymentComplement {
            self.zero_payment_root(root, &mut corrections);
        }
        if kind.has_receiver_codes() {
            align_receiver_codes(root, &mut corrections);
        }

        for correction in &corrections {
            tracing::info!(
                rule = ?correction.rule,
                element = %correction.element,
                attribute = %correction.attribute,
                previous = correction.previous.as_deref().unwrap_or("<absent>"),
                current = correction.current.as_deref().unwrap_or("<removed>"),
                "normalized document attribute"
            );
        }
        corrections
    }

    fn clamp_timestamp(
        &self,
        root: &mut Element,
        kind: DocumentKind,
        now: DateTime<Utc>,
        out: &mut Vec<Correction>,
    ) {
        let attribute = kind.timestamp_attribute();
        let now_local = now.with_timezone(&self.options.offset).naive_local();
        let declared = root.attributes.get(attribute).map(str::to_string);
        let parsed = declared
            .as_deref()
            .and_then(|value| parse_timestamp(value, self.options.offset));

        let (value, rule) = match parsed {
            Some(ts) if (now_local - ts).abs() <= self.options.tolerance => {
                (ts.format(TIMESTAMP_FORMAT).to_string(), Rule::TimestampFormat)
            }
            _ => (now_local.format(TIMESTAMP_FORMAT).to_string(), Rule::TimestampClamp),
        };
        record(out, rule, root, attribute, Some(value));
    }

    fn zero_payment_root(&self, root: &mut Element, out: &mut Vec<Correction>) {
        if root.attributes.get("TipoDeComprobante").is_some_and(|t| t != "P") {
            tracing::warn!(
                declared = root.attributes.get("TipoDeComprobante").unwrap_or_default(),
                "payment complement rules applied to a document not declared as type P"
            );
        }
        for &attribute in PAYMENT_ZEROED {
            record(out, Rule::PaymentZeroing, root, attribute, Some("0".to_string()));
        }
        record(
            out,
            Rule::PaymentZeroing,
            root,
            "Moneda",
            Some(Currency::XXX.code().to_string()),
        );

        let stripped = PAYMENT_STRIPPED.iter().chain(
            match self.options.strip_policy {
                StripPolicy::Conservative => PAYMENT_STRIPPED_CONSERVATIVE,
                StripPolicy::Minimal => &[],
            }
            .iter(),
        );
        for &attribute in stripped {
            record(out, Rule::PaymentStrip, root, attribute, None);
        }

        if let Some(receiver) = root.child_mut("Receptor") {
            record(
                out,
                Rule::PaymentZeroing,
                receiver,
                "UsoCFDI",
                Some(PAYMENT_USAGE.to_string()),
            );
        }
    }
}

fn align_receiver_codes(root: &mut Element, out: &mut Vec<Correction>) {
    let Some(receiver) = root.child_mut("Receptor") else {
        return;
    };
    let Some(family) = receiver
        .attributes
        .get("Rfc")
        .and_then(TaxpayerFamily::from_tax_id)
    else {
        return;
    };

    if let Some(usage) = receiver.attributes.get("UsoCFDI") {
        if !family.allows_usage(usage) {
            record(
                out,
                Rule::UsageCode,
                receiver,
                "UsoCFDI",
                Some(family.default_usage().to_string()),
            );
        }
    }
    if let Some(regime) = receiver.attributes.get("RegimenFiscalReceptor") {
        if !family.allows_regime(regime) {
            record(
                out,
                Rule::RegimeCode,
                receiver,
                "RegimenFiscalReceptor",
                Some(family.default_regime().to_string()),
            );
        }
    }
}

/// Set (`Some`) or remove (`None`) an attribute, recording real changes only.
fn record(
    out: &mut Vec<Correction>,
    rule: Rule,
    element: &mut Element,
    attribute: &str,
    value: Option<String>,
) {
    let (previous, current) = match value {
        Some(value) => match element.attributes.set(attribute, value.clone()) {
            AttributeChange::Unchanged => return,
            AttributeChange::Replaced { previous } => (Some(previous), Some(value)),
            AttributeChange::Appended => (None, Some(value)),
        },
        None => match element.attributes.remove(attribute) {
            Some(previous) => (Some(previous), None),
            None => return,
        },
    };
    out.push(Correction {
        rule,
        element: element.local_name().to_string(),
        attribute: attribute.to_string(),
        previous,
        current,
    });
}

/// Parse a declared timestamp into local time in `offset`.
///
/// Values with an explicit offset (or `Z`) are converted; bare values are
/// taken as already local.
pub fn parse_timestamp(value: &str, offset: FixedOffset) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(value) {
        return Some(with_offset.with_timezone(&offset).naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|ts| ts.with_nanosecond(0).unwrap_or(ts))
}
