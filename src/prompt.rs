use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Visual/compositional style applied when building the generation
/// instruction. Closed set; unknown values coming over the wire fall back
/// to `Standard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Template {
    Hero,
    PriceTag,
    UgcStyle,
    Minimalist,
    BoldTypography,
    BenefitFocused,
    #[serde(other)]
    Standard,
}

impl Template {
    pub fn style_direction(&self) -> &'static str {
        match self {
            Template::Hero => {
                "a bold hero-shot advertisement with the product dramatically lit against a clean studio backdrop"
            }
            Template::PriceTag => {
                "a retail promotion advertisement built around a large, unmissable price tag"
            }
            Template::UgcStyle => {
                "a casual user-generated-content style photo advertisement that looks shot on a phone with natural lighting"
            }
            Template::Minimalist => {
                "a minimalist advertisement with generous negative space and a restrained color palette"
            }
            Template::BoldTypography => {
                "a typography-driven advertisement where oversized headline text dominates the composition"
            }
            Template::BenefitFocused => {
                "a benefit-focused advertisement that visually emphasizes what the product does for the customer"
            }
            Template::Standard => {
                "a standard product advertisement with a clean, professional composition"
            }
        }
    }
}

impl FromStr for Template {
    type Err = String;

    // Unknown names degrade to the generic style instead of failing; the
    // template is a presentation affordance, not a correctness input.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "hero" => Template::Hero,
            "price-tag" | "price_tag" | "pricetag" => Template::PriceTag,
            "ugc-style" | "ugc_style" | "ugc" => Template::UgcStyle,
            "minimalist" => Template::Minimalist,
            "bold-typography" | "bold_typography" => Template::BoldTypography,
            "benefit-focused" | "benefit_focused" => Template::BenefitFocused,
            _ => Template::Standard,
        })
    }
}

/// Target aspect ratio for one generated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "4:5")]
    Portrait,
    #[serde(rename = "9:16")]
    Story,
    #[serde(rename = "16:9")]
    Landscape,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 4] = [
        AspectRatio::Square,
        AspectRatio::Portrait,
        AspectRatio::Story,
        AspectRatio::Landscape,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait => "4:5",
            AspectRatio::Story => "9:16",
            AspectRatio::Landscape => "16:9",
        }
    }

    /// Filename-safe form, colon replaced by `x`.
    pub fn file_slug(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1x1",
            AspectRatio::Portrait => "4x5",
            AspectRatio::Story => "9x16",
            AspectRatio::Landscape => "16x9",
        }
    }

    pub fn orientation(&self) -> &'static str {
        match self {
            AspectRatio::Square => "square",
            AspectRatio::Portrait => "vertical portrait",
            AspectRatio::Story => "tall vertical story format",
            AspectRatio::Landscape => "wide landscape",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1:1" | "1x1" => Ok(AspectRatio::Square),
            "4:5" | "4x5" => Ok(AspectRatio::Portrait),
            "9:16" | "9x16" => Ok(AspectRatio::Story),
            "16:9" | "16x9" => Ok(AspectRatio::Landscape),
            other => Err(format!(
                "unsupported aspect ratio {other:?}; expected one of 1:1, 4:5, 9:16, 16:9"
            )),
        }
    }
}

/// Currency code for the price field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Idr,
    Usd,
    Eur,
    Gbp,
}

impl Currency {
    pub fn symbol(&self) -> &'static str {
        match self {
            Currency::Idr => "Rp",
            Currency::Usd => "$",
            Currency::Eur => "€",
            Currency::Gbp => "£",
        }
    }
}

impl Default for Currency {
    fn default() -> Self {
        Currency::Idr
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IDR" => Ok(Currency::Idr),
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            other => Err(format!(
                "unsupported currency {other:?}; expected IDR, USD, EUR or GBP"
            )),
        }
    }
}

/// Output language for generated ad copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "id")]
    Indonesian,
}

impl Language {
    pub fn name(&self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Indonesian => "Indonesian",
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" | "english" => Ok(Language::English),
            "id" | "indonesian" => Ok(Language::Indonesian),
            other => Err(format!("unsupported language {other:?}; expected en or id")),
        }
    }
}

/// The structured ad copy a user fills in. Empty strings mean "unset";
/// unset fields produce no clause in the built instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AdFields {
    pub headline: String,
    pub subheadline: String,
    pub price: String,
    pub discount: String,
    pub cta: String,
    pub currency: Currency,
}

impl AdFields {
    /// Merge a generated suggestion into the copy fields. Only called on a
    /// successful suggestion; a failed request must leave fields untouched.
    pub fn apply_suggestion(&mut self, suggestion: crate::providers::AdCopySuggestion) {
        self.headline = suggestion.headline;
        self.subheadline = suggestion.subheadline;
        self.cta = suggestion.cta;
    }
}

/// `150000` -> `Rp150,000`. Grouping separators in the input are tolerated;
/// anything non-numeric yields no price clause at all.
pub fn format_price(price: &str, currency: Currency) -> Option<String> {
    let cleaned: String = price
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '.' | '_' | ' '))
        .collect();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n: u64 = cleaned.parse().ok()?;
    Some(format!("{}{}", currency.symbol(), group_thousands(n)))
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `"20"` -> `20% OFF`; empty input yields no clause.
pub fn discount_clause(discount: &str) -> Option<String> {
    let d = discount.trim();
    if d.is_empty() {
        None
    } else {
        Some(format!("{d}% OFF"))
    }
}

pub struct PromptContext<'a> {
    pub template: Template,
    pub fields: &'a AdFields,
    pub brand_color: &'a str,
    pub watermark: bool,
    pub ratio: AspectRatio,
    pub has_logo: bool,
}

/// Build the single natural-language instruction sent alongside the image
/// payloads. Pure; every optional field either contributes a full clause or
/// nothing at all.
pub fn build_instruction(ctx: &PromptContext<'_>) -> String {
    let f = ctx.fields;
    let mut parts: Vec<String> = Vec::with_capacity(12);

    parts.push(format!(
        "Create {}, featuring the product from the attached photo as the hero subject.",
        ctx.template.style_direction()
    ));

    let headline = f.headline.trim();
    if !headline.is_empty() {
        parts.push(format!(
            "Overlay the headline text \"{headline}\" prominently."
        ));
    }
    let subheadline = f.subheadline.trim();
    if !subheadline.is_empty() {
        parts.push(format!(
            "Add the supporting subheadline \"{subheadline}\" in a smaller weight."
        ));
    }
    if let Some(price) = format_price(&f.price, f.currency) {
        parts.push(format!("Show a price tag reading \"{price}\"."));
    }
    if let Some(discount) = discount_clause(&f.discount) {
        parts.push(format!("Include a \"{discount}\" promotional badge."));
    }
    let cta = f.cta.trim();
    if !cta.is_empty() {
        parts.push(format!(
            "Render a call-to-action button labeled \"{cta}\"."
        ));
    }

    let color = ctx.brand_color.trim();
    if !color.is_empty() {
        parts.push(format!(
            "Use {color} as the dominant brand accent color."
        ));
    }
    if ctx.watermark {
        parts.push("Add a subtle semi-transparent brand watermark in one corner.".to_string());
    }
    if ctx.has_logo {
        parts.push(
            "Place the provided logo image small and clearly subordinate to the product."
                .to_string(),
        );
    }

    parts.push(format!(
        "The output aspect ratio must be exactly {} ({}).",
        ctx.ratio.as_str(),
        ctx.ratio.orientation()
    ));
    parts.push(
        "Respond with exactly one complete finished image; do not respond with text, code, or a partial render."
            .to_string(),
    );

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(fields: &'a AdFields) -> PromptContext<'a> {
        PromptContext {
            template: Template::Hero,
            fields,
            brand_color: "#1d4ed8",
            watermark: false,
            ratio: AspectRatio::Square,
            has_logo: false,
        }
    }

    #[test]
    fn idr_price_is_symbol_plus_grouped_integer() {
        assert_eq!(
            format_price("150000", Currency::Idr).as_deref(),
            Some("Rp150,000")
        );
        assert_eq!(
            format_price("150.000", Currency::Idr).as_deref(),
            Some("Rp150,000")
        );
        assert_eq!(format_price("999", Currency::Usd).as_deref(), Some("$999"));
        assert_eq!(
            format_price("1234567", Currency::Gbp).as_deref(),
            Some("£1,234,567")
        );
    }

    #[test]
    fn unset_or_garbage_price_yields_no_clause() {
        assert_eq!(format_price("", Currency::Idr), None);
        assert_eq!(format_price("   ", Currency::Idr), None);
        assert_eq!(format_price("cheap", Currency::Idr), None);

        let fields = AdFields {
            headline: "Buy Now".into(),
            ..AdFields::default()
        };
        let instruction = build_instruction(&ctx(&fields));
        assert!(!instruction.contains("price tag"));
    }

    #[test]
    fn discount_clause_only_when_set() {
        assert_eq!(discount_clause(""), None);
        assert_eq!(discount_clause("  "), None);
        assert_eq!(discount_clause("20").as_deref(), Some("20% OFF"));

        let unset = AdFields {
            headline: "Buy Now".into(),
            ..AdFields::default()
        };
        assert!(!build_instruction(&ctx(&unset)).contains("% OFF"));

        let set = AdFields {
            headline: "Buy Now".into(),
            discount: "20".into(),
            ..AdFields::default()
        };
        assert!(build_instruction(&ctx(&set)).contains("20% OFF"));
    }

    #[test]
    fn instruction_states_ratio_and_single_image_contract() {
        let fields = AdFields {
            headline: "Fresh Deal".into(),
            price: "150000".into(),
            ..AdFields::default()
        };
        let mut c = ctx(&fields);
        c.ratio = AspectRatio::Landscape;
        let instruction = build_instruction(&c);
        assert!(instruction.contains("exactly 16:9"));
        assert!(instruction.contains("Rp150,000"));
        assert!(instruction.contains("exactly one complete finished image"));
        assert!(!instruction.contains("logo"));
    }

    #[test]
    fn logo_instruction_present_only_with_logo() {
        let fields = AdFields {
            headline: "Fresh Deal".into(),
            ..AdFields::default()
        };
        let mut c = ctx(&fields);
        c.has_logo = true;
        assert!(build_instruction(&c).contains("subordinate to the product"));
    }

    #[test]
    fn unknown_template_falls_back_to_standard() {
        let t: Template = serde_json::from_str("\"vaporwave\"").unwrap();
        assert_eq!(t, Template::Standard);
        assert_eq!("vaporwave".parse::<Template>().unwrap(), Template::Standard);
        assert!(Template::Standard
            .style_direction()
            .contains("standard product advertisement"));
    }

    #[test]
    fn ratio_round_trips_through_serde_and_fromstr() {
        let r: AspectRatio = serde_json::from_str("\"9:16\"").unwrap();
        assert_eq!(r, AspectRatio::Story);
        assert_eq!(serde_json::to_string(&r).unwrap(), "\"9:16\"");
        assert_eq!("16x9".parse::<AspectRatio>().unwrap(), AspectRatio::Landscape);
        assert!("3:2".parse::<AspectRatio>().is_err());
        assert_eq!(AspectRatio::Portrait.file_slug(), "4x5");
    }
}
