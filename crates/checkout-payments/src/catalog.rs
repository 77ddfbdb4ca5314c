//! Add-on Catalog and Pricing
//!
//! The base fee is billed monthly through the gateway price; each add-on
//! (a translated edition of the site) is a one-time invoice item on the first
//! invoice. All amounts are minor currency units.

use serde::{Deserialize, Serialize};

/// Default monthly base fee, EUR cents
pub const BASE_FEE: i64 = 3500;

/// Default one-time fee per add-on language, EUR cents
pub const ADDON_FEE: i64 = 7500;

/// Months a new subscription is committed for
pub const COMMITMENT_MONTHS: u32 = 12;

/// Supported add-on languages, ISO 639-1 code and English name
pub const LANGUAGES: &[(&str, &str)] = &[
    ("nl", "Dutch"),
    ("fr", "French"),
    ("de", "German"),
    ("pt", "Portuguese"),
    ("es", "Spanish"),
    ("da", "Danish"),
    ("fi", "Finnish"),
    ("no", "Norwegian"),
    ("sv", "Swedish"),
    ("bg", "Bulgarian"),
    ("cs", "Czech"),
    ("hu", "Hungarian"),
    ("pl", "Polish"),
    ("ro", "Romanian"),
    ("sk", "Slovak"),
    ("uk", "Ukrainian"),
    ("sq", "Albanian"),
    ("bs", "Bosnian"),
    ("hr", "Croatian"),
    ("el", "Greek"),
    ("sr", "Serbian"),
    ("sl", "Slovenian"),
    ("tr", "Turkish"),
    ("ca", "Catalan"),
    ("lv", "Latvian"),
    ("lt", "Lithuanian"),
];

/// Display name for a supported language code
pub fn language_name(code: &str) -> Option<&'static str> {
    LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

pub fn is_supported_language(code: &str) -> bool {
    language_name(code).is_some()
}

/// Codes outside the catalog, in input order, duplicates kept
pub fn validate_language_codes<S: AsRef<str>>(codes: &[S]) -> Vec<String> {
    codes
        .iter()
        .map(AsRef::as_ref)
        .filter(|code| !is_supported_language(code))
        .map(str::to_string)
        .collect()
}

/// Fees applied to an order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub base_fee: i64,
    pub addon_fee: i64,
    pub currency: String,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            base_fee: BASE_FEE,
            addon_fee: ADDON_FEE,
            currency: "EUR".into(),
        }
    }
}

impl Pricing {
    /// Price a set of add-on codes. Unknown codes are reported, not charged.
    pub fn quote<S: AsRef<str>>(&self, codes: &[S]) -> PriceQuote {
        let mut addons = Vec::new();
        let mut invalid_codes = Vec::new();
        for code in codes.iter().map(AsRef::as_ref) {
            match language_name(code) {
                Some(name) => addons.push(LineItem::addon(code, name, self.addon_fee)),
                None => invalid_codes.push(code.to_string()),
            }
        }

        let addon_total = self.addon_fee * i64::try_from(addons.len()).unwrap_or(i64::MAX);
        let mut line_items = Vec::with_capacity(addons.len() + 1);
        line_items.push(LineItem::base(self.base_fee));
        line_items.extend(addons);

        PriceQuote {
            line_items,
            invalid_codes,
            base_fee: self.base_fee,
            addon_total,
            total: self.base_fee.saturating_add(addon_total),
            currency: self.currency.clone(),
        }
    }
}

/// A line on the first invoice
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    /// Add-on language code; `None` for the base subscription
    pub code: Option<String>,
    pub quantity: u32,
    pub unit_amount: i64,
    pub recurring: bool,
}

impl LineItem {
    fn base(amount: i64) -> Self {
        Self {
            description: "Website subscription (monthly)".into(),
            code: None,
            quantity: 1,
            unit_amount: amount,
            recurring: true,
        }
    }

    fn addon(code: &str, name: &str, amount: i64) -> Self {
        Self {
            description: format!("{name} translation"),
            code: Some(code.to_string()),
            quantity: 1,
            unit_amount: amount,
            recurring: false,
        }
    }
}

/// Priced order before discount
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub line_items: Vec<LineItem>,
    pub invalid_codes: Vec<String>,
    pub base_fee: i64,
    pub addon_total: i64,
    pub total: i64,
    pub currency: String,
}

impl PriceQuote {
    /// Add-on lines only
    pub fn addons(&self) -> impl Iterator<Item = &LineItem> {
        self.line_items.iter().filter(|item| !item.recurring)
    }
}

/// How a coupon reduces the price
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DiscountKind {
    /// Percentage of the base fee
    Percent(f64),
    /// Fixed amount, minor units
    Amount(i64),
}

impl DiscountKind {
    /// Reduction against `base`, rounded half away from zero for percentages
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn amount_off(self, base: i64) -> i64 {
        match self {
            Self::Percent(pct) => ((base as f64) * pct / 100.0).round() as i64,
            Self::Amount(amount) => amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_language_codes_preserves_order_and_duplicates() {
        let invalid = validate_language_codes(&["fr", "xx", "", "de", "xx", "EN"]);
        assert_eq!(invalid, vec!["xx", "", "xx", "EN"]);
        assert!(validate_language_codes::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_quote_without_addons_is_base_fee() {
        let quote = Pricing::default().quote::<&str>(&[]);
        assert_eq!(quote.total, BASE_FEE);
        assert_eq!(quote.line_items.len(), 1);
        assert!(quote.line_items[0].recurring);
    }

    #[test]
    fn test_quote_three_addons() {
        let quote = Pricing::default().quote(&["nl", "fr", "de"]);
        assert_eq!(quote.total, BASE_FEE + 3 * ADDON_FEE);
        assert_eq!(quote.addons().count(), 3);
        assert_eq!(quote.line_items[1].description, "Dutch translation");
    }

    #[test]
    fn test_quote_excludes_and_reports_invalid_codes() {
        let pricing = Pricing::default();
        for codes in [vec!["es", "zz"], vec!["zz"], vec!["pl", "pl", "??", "ro"]] {
            let quote = pricing.quote(&codes);
            let valid = codes.iter().filter(|c| is_supported_language(c)).count() as i64;
            assert_eq!(quote.total, BASE_FEE + valid * ADDON_FEE);
            assert_eq!(quote.invalid_codes, validate_language_codes(&codes));
        }
    }

    #[test]
    fn test_discount_amounts() {
        assert_eq!(DiscountKind::Percent(10.0).amount_off(3500), 350);
        assert_eq!(DiscountKind::Percent(15.0).amount_off(3500), 525);
        assert_eq!(DiscountKind::Percent(33.3).amount_off(1000), 333);
        assert_eq!(DiscountKind::Amount(1000).amount_off(3500), 1000);
    }
}
