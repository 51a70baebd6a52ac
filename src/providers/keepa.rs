use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use super::{http_client, truncate_for_log, OfferPrices, PriceMap, PriceSource};
use crate::market::Market;
use crate::util::env as env_util;

/// Index of the Amazon-as-seller price in Keepa's `stats.current` array.
const CSV_AMAZON: usize = 0;
/// Lowest new marketplace offer.
const CSV_NEW: usize = 1;
/// Buy box price including shipping.
const CSV_BUY_BOX_SHIPPING: usize = 18;

/// Keepa product API source
/// Public API (base): https://api.keepa.com/
///
/// `GET /product?key=..&domain=..&asin=A,B&stats=1&buybox=1`
///
/// Prices come back as integer cents; `-1`/`-2` mark "no offer" and
/// "no data", so anything non-positive is ignored.
#[derive(Debug, Clone)]
pub struct KeepaSource {
    base_url: String,
    http: Client,
    api_key: String,
}

impl KeepaSource {
    pub fn new(api_key: String, base_url: Option<&str>) -> Result<Self> {
        let base_url = base_url
            .unwrap_or("https://api.keepa.com")
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            base_url,
            http: http_client("price-sync/keepa")?,
            api_key,
        })
    }

    pub fn from_env() -> Result<Self> {
        env_util::preflight_check("keepa", &["KEEPA_API_KEY"], &["KEEPA_BASE_URL"])?;
        let api_key = env_util::env_req("KEEPA_API_KEY")?;
        Self::new(api_key, env_util::env_opt("KEEPA_BASE_URL").as_deref())
    }

    fn cents(v: Option<&Value>) -> Option<f64> {
        v.and_then(Value::as_i64)
            .filter(|c| *c > 0)
            .map(|c| c as f64 / 100.0)
    }

    fn offer_prices(product: &Value) -> OfferPrices {
        let Some(stats) = product.get("stats") else {
            return OfferPrices::default();
        };
        let current = stats.get("current").and_then(Value::as_array);
        let slot = |idx: usize| Self::cents(current.and_then(|c| c.get(idx)));

        OfferPrices {
            buy_box: Self::cents(stats.get("buyBoxPrice")).or_else(|| slot(CSV_BUY_BOX_SHIPPING)),
            direct: slot(CSV_AMAZON),
            marketplace: slot(CSV_NEW),
        }
    }

    /// Map a `/product` response body to prices, skipping malformed entries.
    pub fn parse_products(body: &Value) -> PriceMap {
        let mut out = PriceMap::new();
        let Some(products) = body.get("products").and_then(Value::as_array) else {
            return out;
        };
        for product in products {
            let Some(asin) = product.get("asin").and_then(Value::as_str) else {
                debug!("keepa: product without asin skipped");
                continue;
            };
            match Self::offer_prices(product).best() {
                Some(price) => {
                    out.insert(asin.to_ascii_uppercase(), price);
                }
                None => debug!(asin, "keepa: no current offer"),
            }
        }
        out
    }
}

#[async_trait]
impl PriceSource for KeepaSource {
    fn name(&self) -> &'static str {
        "keepa"
    }

    async fn fetch_prices(&self, batch: &[String], market: Market) -> Result<PriceMap> {
        let url = format!("{}/product", self.base_url);
        let domain = market.keepa_domain().to_string();
        let asins = batch.join(",");

        let resp = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .query(&[
                ("key", self.api_key.as_str()),
                ("domain", domain.as_str()),
                ("asin", asins.as_str()),
                ("stats", "1"),
                ("buybox", "1"),
            ])
            .send()
            .await
            // reqwest errors embed the request URL, and the URL carries the key
            .map_err(reqwest::Error::without_url)
            .context("keepa product request")?;
        let status = resp.status();
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 2000);
            return Err(anyhow!(
                "keepa product request failed: {status} market={market} body={body}"
            ));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .context("decode keepa product response")?;
        if let Some(tokens_left) = body.get("tokensLeft").and_then(Value::as_i64) {
            info!(%market, tokens_left, "keepa: token balance");
        }
        Ok(Self::parse_products(&body))
    }
}
