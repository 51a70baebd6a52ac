use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where the currency symbol sits relative to the amount in rendered prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolPlacement {
    Prefix,
    Suffix,
}

/// Amazon storefront a product is priced in.
///
/// Selects currency, upstream regional endpoint and partner tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Us,
    Uk,
    De,
    Fr,
    It,
    Es,
}

impl Market {
    pub fn code(self) -> &'static str {
        match self {
            Market::Us => "us",
            Market::Uk => "uk",
            Market::De => "de",
            Market::Fr => "fr",
            Market::It => "it",
            Market::Es => "es",
        }
    }

    fn tld(self) -> &'static str {
        match self {
            Market::Us => "com",
            Market::Uk => "co.uk",
            Market::De => "de",
            Market::Fr => "fr",
            Market::It => "it",
            Market::Es => "es",
        }
    }

    pub fn currency_code(self) -> &'static str {
        match self {
            Market::Us => "USD",
            Market::Uk => "GBP",
            _ => "EUR",
        }
    }

    pub fn currency(self) -> Currency {
        match self {
            Market::Us => Currency::new('$', SymbolPlacement::Prefix),
            Market::Uk => Currency::new('£', SymbolPlacement::Prefix),
            _ => Currency::new('€', SymbolPlacement::Suffix),
        }
    }

    /// Marketplace host as the Amazon APIs expect it, e.g. `www.amazon.de`.
    pub fn marketplace(self) -> String {
        format!("www.amazon.{}", self.tld())
    }

    /// Keepa numeric domain id.
    pub fn keepa_domain(self) -> u8 {
        match self {
            Market::Us => 1,
            Market::Uk => 2,
            Market::De => 3,
            Market::Fr => 4,
            Market::It => 8,
            Market::Es => 9,
        }
    }

    /// PA-API v5 host for this storefront.
    pub fn paapi_host(self) -> String {
        format!("webservices.amazon.{}", self.tld())
    }

    /// AWS region PA-API v5 requests for this storefront are signed against.
    pub fn paapi_region(self) -> &'static str {
        match self {
            Market::Us => "us-east-1",
            _ => "eu-west-1",
        }
    }

    /// Credential region of the Creators API (tokens are minted per region).
    pub fn creators_region(self) -> &'static str {
        match self {
            Market::Us => "NA",
            _ => "EU",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Market {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "us" | "com" => Ok(Market::Us),
            "uk" | "gb" | "co.uk" => Ok(Market::Uk),
            "de" => Ok(Market::De),
            "fr" => Ok(Market::Fr),
            "it" => Ok(Market::It),
            "es" => Ok(Market::Es),
            other => Err(anyhow!("unknown market '{other}'")),
        }
    }
}

/// Currency symbol plus the site's rendering convention for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Currency {
    pub symbol: char,
    pub placement: SymbolPlacement,
}

impl Currency {
    pub fn new(symbol: char, placement: SymbolPlacement) -> Self {
        Self { symbol, placement }
    }

    /// Render a whole-unit amount using the given placement.
    pub fn format_with(&self, amount: i64, placement: SymbolPlacement) -> String {
        match placement {
            SymbolPlacement::Prefix => format!("{}{}", self.symbol, amount),
            SymbolPlacement::Suffix => format!("{}{}", amount, self.symbol),
        }
    }

    pub fn format(&self, amount: i64) -> String {
        self.format_with(amount, self.placement)
    }
}
