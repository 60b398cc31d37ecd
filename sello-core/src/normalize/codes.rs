//! Receiver usage and tax-regime code families.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaxpayerFamily {
    Individual,
    Entity,
}

impl TaxpayerFamily {
    /// Individuals carry a 13-character identifier, entities a 12-character one.
    pub(crate) fn from_tax_id(tax_id: &str) -> Option<Self> {
        match tax_id.trim().chars().count() {
            13 => Some(TaxpayerFamily::Individual),
            12 => Some(TaxpayerFamily::Entity),
            _ => None,
        }
    }

    pub(crate) fn default_usage(&self) -> &'static str {
        match self {
            TaxpayerFamily::Individual => "S01",
            TaxpayerFamily::Entity => "G03",
        }
    }

    pub(crate) fn default_regime(&self) -> &'static str {
        match self {
            TaxpayerFamily::Individual => "616",
            TaxpayerFamily::Entity => "601",
        }
    }

    pub(crate) fn allows_usage(&self, code: &str) -> bool {
        let code = code.trim();
        if INDIVIDUAL_ONLY_USAGE.contains(&code) {
            return *self == TaxpayerFamily::Individual;
        }
        SHARED_USAGE.contains(&code)
    }

    pub(crate) fn allows_regime(&self, code: &str) -> bool {
        let table = match self {
            TaxpayerFamily::Individual => INDIVIDUAL_REGIMES,
            TaxpayerFamily::Entity => ENTITY_REGIMES,
        };
        table.contains(&code.trim())
    }
}

const SHARED_USAGE: &[&str] = &[
    "G01", "G02", "G03", "I01", "I02", "I03", "I04", "I05", "I06", "I07", "I08", "S01", "CP01",
];

const INDIVIDUAL_ONLY_USAGE: &[&str] = &[
    "D01", "D02", "D03", "D04", "D05", "D06", "D07", "D08", "D09", "D10", "CN01",
];

const INDIVIDUAL_REGIMES: &[&str] = &[
    "605", "606", "607", "608", "610", "611", "612", "614", "615", "616", "621", "625", "626",
];

const ENTITY_REGIMES: &[&str] = &["601", "603", "610", "620", "622", "623", "624", "626"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_follows_identifier_length() {
        assert_eq!(
            TaxpayerFamily::from_tax_id("XAXX010101000"),
            Some(TaxpayerFamily::Individual)
        );
        assert_eq!(
            TaxpayerFamily::from_tax_id(" EKU9003173C9 "),
            Some(TaxpayerFamily::Entity)
        );
        assert_eq!(TaxpayerFamily::from_tax_id("ABC"), None);
    }

    #[test]
    fn deductions_are_individual_only() {
        assert!(TaxpayerFamily::Individual.allows_usage("D01"));
        assert!(!TaxpayerFamily::Entity.allows_usage("D01"));
        assert!(TaxpayerFamily::Entity.allows_usage("G03"));
        assert!(!TaxpayerFamily::Entity.allows_usage("ZZ9"));
    }

    #[test]
    fn regimes_are_split_by_family() {
        assert!(TaxpayerFamily::Entity.allows_regime("601"));
        assert!(!TaxpayerFamily::Entity.allows_regime("612"));
        assert!(TaxpayerFamily::Individual.allows_regime("612"));
        assert!(TaxpayerFamily::Individual.allows_regime("626"));
        assert!(TaxpayerFamily::Entity.allows_regime("626"));
    }
}
