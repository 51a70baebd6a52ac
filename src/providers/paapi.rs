use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    http_client, truncate_for_log, upstream_errors, value_as_f64, OfferPrices, PartnerTags,
    PriceMap, PriceSource,
};
use crate::auth::{SigV4Signer, SignableRequest};
use crate::market::Market;
use crate::util::env as env_util;

const SERVICE: &str = "ProductAdvertisingAPI";
const PATH: &str = "/paapi5/getitems";
const TARGET: &str = "com.amazon.paapi5.v1.ProductAdvertisingAPIv1.GetItems";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";

const RESOURCES: [&str; 3] = [
    "Offers.Listings.Price",
    "Offers.Listings.IsBuyBoxWinner",
    "Offers.Listings.MerchantInfo",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetItemsRequest<'a> {
    item_ids: &'a [String],
    item_id_type: &'static str,
    partner_tag: &'a str,
    partner_type: &'static str,
    marketplace: String,
    resources: &'static [&'static str],
}

/// Amazon Product Advertising API v5 source
///
/// `POST https://webservices.amazon.<tld>/paapi5/getitems`, signed per
/// request with SigV4 against the storefront's AWS region.
pub struct PaapiSource {
    http: Client,
    access_key: String,
    secret_key: String,
    partner_tags: PartnerTags,
    /// Replaces `https://<market host>` for every market when set.
    base_override: Option<url::Url>,
}

impl PaapiSource {
    pub fn new(
        access_key: String,
        secret_key: String,
        partner_tags: PartnerTags,
        base_override: Option<&str>,
    ) -> Result<Self> {
        let base_override = base_override
            .map(|raw| url::Url::parse(raw).with_context(|| format!("invalid PAAPI_BASE_URL '{raw}'")))
            .transpose()?;
        Ok(Self {
            http: http_client("price-sync/paapi")?,
            access_key,
            secret_key,
            partner_tags,
            base_override,
        })
    }

    pub fn from_env(markets: &[Market]) -> Result<Self> {
        env_util::preflight_check(
            "paapi",
            &["PAAPI_ACCESS_KEY", "PAAPI_SECRET_KEY"],
            &["AMAZON_PARTNER_TAG", "PAAPI_BASE_URL"],
        )?;
        let partner_tags = PartnerTags::from_env(markets)?;
        Self::new(
            env_util::env_req("PAAPI_ACCESS_KEY")?,
            env_util::env_req("PAAPI_SECRET_KEY")?,
            partner_tags,
            env_util::env_opt("PAAPI_BASE_URL").as_deref(),
        )
    }

    /// `(url, host)` for a market's GetItems endpoint.
    fn endpoint(&self, market: Market) -> Result<(String, String)> {
        match &self.base_override {
            Some(base) => {
                let host = base
                    .host_str()
                    .ok_or_else(|| anyhow!("PAAPI_BASE_URL has no host"))?;
                let host = match base.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                let url = format!("{}{}", base.as_str().trim_end_matches('/'), PATH);
                Ok((url, host))
            }
            None => {
                let host = market.paapi_host();
                Ok((format!("https://{host}{PATH}"), host))
            }
        }
    }

    fn offer_prices(item: &Value) -> OfferPrices {
        let mut offers = OfferPrices::default();
        let Some(listings) = item
            .get("Offers")
            .and_then(|o| o.get("Listings"))
            .and_then(Value::as_array)
        else {
            return offers;
        };
        for listing in listings {
            let Some(amount) = listing
                .get("Price")
                .and_then(|p| p.get("Amount"))
                .and_then(value_as_f64)
            else {
                continue;
            };
            let is_buy_box = listing
                .get("IsBuyBoxWinner")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let merchant = listing
                .get("MerchantInfo")
                .and_then(|m| m.get("Name"))
                .and_then(Value::as_str);
            offers.note_listing(amount, is_buy_box, merchant);
        }
        offers
    }

    /// Map a GetItems response body to prices, skipping malformed items.
    pub fn parse_items(body: &Value) -> PriceMap {
        let mut out = PriceMap::new();
        let items = body
            .get("ItemsResult")
            .and_then(|r| r.get("Items"))
            .and_then(Value::as_array);
        for item in items.into_iter().flatten() {
            let Some(asin) = item.get("ASIN").and_then(Value::as_str) else {
                debug!("paapi: item without ASIN skipped");
                continue;
            };
            match Self::offer_prices(item).best() {
                Some(price) => {
                    out.insert(asin.to_ascii_uppercase(), price);
                }
                None => debug!(asin, "paapi: no listing price"),
            }
        }
        out
    }
}

#[async_trait]
impl PriceSource for PaapiSource {
    fn name(&self) -> &'static str {
        "paapi"
    }

    async fn fetch_prices(&self, batch: &[String], market: Market) -> Result<PriceMap> {
        let request = GetItemsRequest {
            item_ids: batch,
            item_id_type: "ASIN",
            partner_tag: self.partner_tags.get(market)?,
            partner_type: "Associates",
            marketplace: market.marketplace(),
            resources: &RESOURCES,
        };
        let body = serde_json::to_vec(&request)?;
        let (url, host) = self.endpoint(market)?;

        let signer = SigV4Signer::new(
            &self.access_key,
            &self.secret_key,
            market.paapi_region(),
            SERVICE,
        );
        let signed = signer.sign(
            &SignableRequest {
                method: "POST",
                host: &host,
                path: PATH,
                headers: vec![
                    ("content-encoding", "amz-1.0"),
                    ("content-type", CONTENT_TYPE),
                    ("x-amz-target", TARGET),
                ],
                body: &body,
            },
            Utc::now(),
        )?;

        let mut req = self.http.post(&url);
        for (name, value) in signed {
            // reqwest derives Host from the URL
            if name != "host" {
                req = req.header(name, value);
            }
        }
        let resp = req.body(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = truncate_for_log(resp.text().await.unwrap_or_default(), 2000);
            return Err(anyhow!(
                "paapi GetItems failed: {status} market={market} body={text}"
            ));
        }

        let body: Value = resp.json().await?;
        for (code, message) in upstream_errors(&body) {
            warn!(%market, code = %code, message = %message, "paapi: item error");
        }
        Ok(Self::parse_items(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::stub;
    use serde_json::json;
    use std::collections::HashMap;

    fn source(base: Option<&str>) -> PaapiSource {
        let tags = PartnerTags::from_map(HashMap::from([(Market::De, "site-21".to_string())]));
        PaapiSource::new("AK".into(), "SK".into(), tags, base).unwrap()
    }

    #[test]
    fn parses_items_with_precedence() {
        let body = json!({
            "ItemsResult": {"Items": [
                {"ASIN": "B0TEST0001", "Offers": {"Listings": [
                    {"Price": {"Amount": 106.40, "Currency": "EUR"}, "IsBuyBoxWinner": true,
                     "MerchantInfo": {"Name": "Amazon.de"}}
                ]}},
                {"ASIN": "B0TEST0002", "Offers": {"Listings": [
                    {"Price": {"Amount": 30.0}, "IsBuyBoxWinner": false, "MerchantInfo": {"Name": "Shop"}},
                    {"Price": {"Amount": 31.0}, "IsBuyBoxWinner": false, "MerchantInfo": {"Name": "Amazon.de"}}
                ]}},
                {"ASIN": "B0TEST0003"},
                {"Offers": {}}
            ]},
            "Errors": [{"Code": "InvalidParameterValue", "Message": "B0BAD is invalid"}]
        });
        let prices = PaapiSource::parse_items(&body);
        assert_eq!(prices.len(), 2);
        assert_eq!(prices["B0TEST0001"], 106.40);
        assert_eq!(prices["B0TEST0002"], 31.0);
    }

    #[test]
    fn request_body_uses_pascal_case() {
        let ids = vec!["B0TEST0001".to_string(), "B0TEST0002".to_string()];
        let req = GetItemsRequest {
            item_ids: &ids,
            item_id_type: "ASIN",
            partner_tag: "site-21",
            partner_type: "Associates",
            marketplace: Market::De.marketplace(),
            resources: &RESOURCES,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["ItemIds"].as_array().unwrap().len(), 2);
        assert_eq!(v["PartnerTag"], "site-21");
        assert_eq!(v["PartnerType"], "Associates");
        assert_eq!(v["Marketplace"], "www.amazon.de");
        assert_eq!(v["Resources"][0], "Offers.Listings.Price");
    }

    #[test]
    fn endpoint_follows_market_or_override() {
        let (url, host) = source(None).endpoint(Market::De).unwrap();
        assert_eq!(url, "https://webservices.amazon.de/paapi5/getitems");
        assert_eq!(host, "webservices.amazon.de");

        let (url, host) = source(Some("http://localhost:8080/")).endpoint(Market::De).unwrap();
        assert_eq!(url, "http://localhost:8080/paapi5/getitems");
        assert_eq!(host, "localhost:8080");
    }

    #[tokio::test]
    async fn missing_partner_tag_fails_the_batch() {
        let err = source(None)
            .fetch_prices(&["B0TEST0001".to_string()], Market::Us)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("partner tag"));
    }

    #[tokio::test]
    async fn get_items_is_signed_with_the_sent_headers() {
        let items = json!({"ItemsResult": {"Items": [
            {"ASIN": "B0TEST0001", "Offers": {"Listings": [
                {"Price": {"Amount": 49.99}, "IsBuyBoxWinner": true, "MerchantInfo": {"Name": "Shop"}}
            ]}}
        ]}});
        let (base, server) = stub::serve_once(200, &items.to_string()).await;
        let prices = source(Some(base.as_str()))
            .fetch_prices(&["B0TEST0001".to_string()], Market::De)
            .await
            .unwrap();
        assert_eq!(prices["B0TEST0001"], 49.99);

        let request = server.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /paapi5/getitems "), "{request}");
        assert!(lower.contains(&format!("x-amz-target: {}", TARGET.to_ascii_lowercase())));
        assert!(lower.contains("content-encoding: amz-1.0"));
        assert!(lower.contains("content-type: application/json; charset=utf-8"));
        assert!(lower.contains("x-amz-date: "));
        assert!(lower.contains(&format!("host: {}", base.trim_start_matches("http://"))));
        assert!(lower.contains("authorization: aws4-hmac-sha256 credential=ak/"));
        assert!(lower.contains("/eu-west-1/productadvertisingapi/aws4_request"));
        assert!(lower.contains(
            "signedheaders=content-encoding;content-type;host;x-amz-date;x-amz-target"
        ));
        assert!(request.contains(r#""PartnerTag":"site-21""#), "{request}");
    }

    #[tokio::test]
    async fn non_success_status_fails_the_batch() {
        let (base, _server) = stub::serve_once(
            429,
            r#"{"Errors":[{"Code":"TooManyRequests","Message":"slow down"}]}"#,
        )
        .await;
        let err = source(Some(base.as_str()))
            .fetch_prices(&["B0TEST0001".to_string()], Market::De)
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("429"), "{err}");
        assert!(err.contains("TooManyRequests"), "{err}");
    }
}
