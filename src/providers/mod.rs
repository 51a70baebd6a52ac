//! Upstream price sources.
//!
//! Three interchangeable strategies sit behind [`PriceSource`]; exactly one is
//! selected per run.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::market::Market;
use crate::util::env as env_util;

pub mod creators;
pub mod keepa;
pub mod paapi;

pub use creators::CreatorsSource;
pub use keepa::KeepaSource;
pub use paapi::PaapiSource;

/// Upstream item limit per request for every supported API.
pub const MAX_BATCH_SIZE: usize = 10;

/// Current price per ASIN, in the market's currency. Unquoted items are absent.
pub type PriceMap = HashMap<String, f64>;

#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// One upstream call for up to [`MAX_BATCH_SIZE`] ASINs of one market.
    /// `Err` means the whole batch failed.
    async fn fetch_prices(&self, batch: &[String], market: Market) -> Result<PriceMap>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Keepa,
    Creators,
    Paapi,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Keepa => "keepa",
            SourceKind::Creators => "creators",
            SourceKind::Paapi => "paapi",
        })
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keepa" => Ok(SourceKind::Keepa),
            "creators" | "creators-api" => Ok(SourceKind::Creators),
            "paapi" | "pa-api" | "paapi5" => Ok(SourceKind::Paapi),
            other => Err(anyhow!("unknown price source '{other}'")),
        }
    }
}

/// Build the selected source from environment configuration.
///
/// This is the pre-flight step: missing credentials fail here, before any
/// network or file activity.
pub fn source_from_env(kind: SourceKind, markets: &[Market]) -> Result<Box<dyn PriceSource>> {
    Ok(match kind {
        SourceKind::Keepa => Box::new(KeepaSource::from_env()?),
        SourceKind::Creators => Box::new(CreatorsSource::from_env(markets)?),
        SourceKind::Paapi => Box::new(PaapiSource::from_env(markets)?),
    })
}

pub(crate) fn http_client(user_agent: &str) -> Result<Client> {
    let timeout_secs = env_util::env_parse("PRICE_SYNC_HTTP_TIMEOUT_SECS", 30u64);
    let builder = Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(timeout_secs));
    // tests talk to loopback stubs; keep any ambient HTTP_PROXY out of the way
    #[cfg(test)]
    let builder = builder.no_proxy();
    Ok(builder.build()?)
}


pub(crate) fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

pub(crate) fn value_as_f64(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    if let Some(s) = v.as_str() {
        return s.trim().parse::<f64>().ok();
    }
    None
}

/// Affiliate partner tag per market, resolved once at startup.
///
/// `AMAZON_PARTNER_TAG_<MARKET>` wins over the global `AMAZON_PARTNER_TAG`.
#[derive(Debug, Clone, Default)]
pub struct PartnerTags(HashMap<Market, String>);

impl PartnerTags {
    pub fn from_env(markets: &[Market]) -> Result<Self> {
        let mut tags = HashMap::new();
        let mut missing = Vec::new();
        for &market in markets {
            let specific = format!("AMAZON_PARTNER_TAG_{}", market.code().to_ascii_uppercase());
            match env_util::env_first(&[specific.as_str(), "AMAZON_PARTNER_TAG"]) {
                Some(tag) => {
                    tags.insert(market, tag);
                }
                None => missing.push(specific),
            }
        }
        if !missing.is_empty() {
            return Err(anyhow!(
                "missing partner tag: set AMAZON_PARTNER_TAG or {:?}",
                missing
            ));
        }
        Ok(Self(tags))
    }

    #[cfg(test)]
    pub(crate) fn from_map(tags: HashMap<Market, String>) -> Self {
        Self(tags)
    }

    pub fn get(&self, market: Market) -> Result<&str> {
        self.0
            .get(&market)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("no partner tag for market {market}"))
    }
}

/// Candidate prices for one item, in precedence order.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct OfferPrices {
    pub buy_box: Option<f64>,
    pub direct: Option<f64>,
    pub marketplace: Option<f64>,
}

impl OfferPrices {
    /// Buy-box, then Amazon as seller, then any marketplace offer.
    pub fn best(&self) -> Option<f64> {
        self.buy_box.or(self.direct).or(self.marketplace)
    }

    /// Fold one listing in; the first listing of each kind wins.
    pub fn note_listing(&mut self, amount: f64, is_buy_box: bool, merchant: Option<&str>) {
        if !(amount.is_finite() && amount > 0.0) {
            return;
        }
        if is_buy_box {
            self.buy_box.get_or_insert(amount);
        } else if merchant.is_some_and(is_amazon_merchant) {
            self.direct.get_or_insert(amount);
        } else {
            self.marketplace.get_or_insert(amount);
        }
    }
}

fn is_amazon_merchant(name: &str) -> bool {
    name.trim().to_ascii_lowercase().starts_with("amazon")
}

/// `{code, message}` pairs from an upstream `errors` array; key case varies per API.
pub(crate) fn upstream_errors(body: &Value) -> Vec<(String, String)> {
    let Some(arr) = body
        .get("errors")
        .or_else(|| body.get("Errors"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    arr.iter()
        .map(|e| {
            let field = |lower: &str, upper: &str| {
                e.get(lower)
                    .or_else(|| e.get(upper))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            (field("code", "Code"), field("message", "Message"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn precedence_prefers_buy_box_then_direct() {
        let mut offers = OfferPrices::default();
        offers.note_listing(25.0, false, Some("Some Shop"));
        assert_eq!(offers.best(), Some(25.0));
        offers.note_listing(22.0, false, Some("Amazon.de"));
        assert_eq!(offers.best(), Some(22.0));
        offers.note_listing(23.5, true, Some("Some Shop"));
        assert_eq!(offers.best(), Some(23.5));
    }

    #[test]
    fn ignores_non_positive_amounts() {
        let mut offers = OfferPrices::default();
        offers.note_listing(0.0, true, None);
        offers.note_listing(f64::NAN, false, None);
        assert_eq!(offers.best(), None);
    }

    #[test]
    fn parses_source_names() {
        assert_eq!("Keepa".parse::<SourceKind>().unwrap(), SourceKind::Keepa);
        assert_eq!("pa-api".parse::<SourceKind>().unwrap(), SourceKind::Paapi);
        assert!("scraper".parse::<SourceKind>().is_err());
    }

    #[test]
    fn reads_errors_in_either_case() {
        let body = json!({"Errors": [{"Code": "ItemNotAccessible", "Message": "nope"}]});
        assert_eq!(
            upstream_errors(&body),
            vec![("ItemNotAccessible".to_string(), "nope".to_string())]
        );
        assert!(upstream_errors(&json!({})).is_empty());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = truncate_for_log("€€€".to_string(), 4);
        assert_eq!(s, "€…");
    }
}
