use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{
    http_client, truncate_for_log, upstream_errors, value_as_f64, OfferPrices, PartnerTags,
    PriceMap, PriceSource,
};
use crate::auth::{ClientCredentials, TokenCache};
use crate::market::Market;
use crate::util::env as env_util;

const DEFAULT_BASE_URL: &str = "https://creatorsapi.amazon";
const DEFAULT_TOKEN_URL_NA: &str = "https://creatorsapi.auth.us-east-1.amazoncognito.com/oauth2/token";
const DEFAULT_TOKEN_URL_EU: &str = "https://creatorsapi.auth.eu-south-2.amazoncognito.com/oauth2/token";

const RESOURCES: [&str; 3] = [
    "offersV2.listings.price",
    "offersV2.listings.isBuyBoxWinner",
    "offersV2.listings.merchantInfo",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetItemsRequest<'a> {
    item_ids: &'a [String],
    item_id_type: &'static str,
    marketplace: String,
    partner_tag: &'a str,
    resources: &'static [&'static str],
}

/// Amazon Creators API source
///
/// OAuth2 client-credentials: a bearer token per market comes from
/// [`TokenCache`], then `POST {base}/catalog/v1/getItems` with up to ten ASINs.
pub struct CreatorsSource {
    base_url: String,
    http: Client,
    api_version: Option<String>,
    tokens: TokenCache,
    partner_tags: PartnerTags,
}

impl CreatorsSource {
    pub fn new(
        base_url: Option<&str>,
        api_version: Option<String>,
        tokens: TokenCache,
        partner_tags: PartnerTags,
    ) -> Result<Self> {
        let base_url = base_url
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            base_url,
            http: http_client("price-sync/creators")?,
            api_version,
            tokens,
            partner_tags,
        })
    }

    pub fn from_env(markets: &[Market]) -> Result<Self> {
        env_util::preflight_check(
            "creators",
            &["CREATORS_CLIENT_ID", "CREATORS_CLIENT_SECRET"],
            &[
                "AMAZON_PARTNER_TAG",
                "CREATORS_BASE_URL",
                "CREATORS_TOKEN_URL_NA",
                "CREATORS_TOKEN_URL_EU",
                "CREATORS_SCOPE",
                "CREATORS_API_VERSION",
            ],
        )?;
        let partner_tags = PartnerTags::from_env(markets)?;

        let credentials = ClientCredentials {
            client_id: env_util::env_req("CREATORS_CLIENT_ID")?,
            client_secret: env_util::env_req("CREATORS_CLIENT_SECRET")?,
            scope: Some(
                env_util::env_opt("CREATORS_SCOPE")
                    .unwrap_or_else(|| "creatorsapi/default".to_string()),
            ),
        };
        let token_urls = HashMap::from([
            (
                "NA".to_string(),
                env_util::env_opt("CREATORS_TOKEN_URL_NA")
                    .unwrap_or_else(|| DEFAULT_TOKEN_URL_NA.to_string()),
            ),
            (
                "EU".to_string(),
                env_util::env_opt("CREATORS_TOKEN_URL_EU")
                    .unwrap_or_else(|| DEFAULT_TOKEN_URL_EU.to_string()),
            ),
        ]);
        let tokens = TokenCache::new(http_client("price-sync/creators")?, credentials, token_urls);

        Self::new(
            env_util::env_opt("CREATORS_BASE_URL").as_deref(),
            env_util::env_opt("CREATORS_API_VERSION"),
            tokens,
            partner_tags,
        )
    }

    fn offer_prices(item: &Value) -> OfferPrices {
        let mut offers = OfferPrices::default();
        let Some(listings) = item
            .get("offersV2")
            .and_then(|o| o.get("listings"))
            .and_then(Value::as_array)
        else {
            return offers;
        };
        for listing in listings {
            let Some(amount) = listing
                .get("price")
                .and_then(|p| p.get("money"))
                .and_then(|m| m.get("amount"))
                .and_then(value_as_f64)
            else {
                continue;
            };
            let is_buy_box = listing
                .get("isBuyBoxWinner")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let merchant = listing
                .get("merchantInfo")
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str);
            offers.note_listing(amount, is_buy_box, merchant);
        }
        offers
    }

    /// Map a `getItems` response body to prices, skipping malformed items.
    pub fn parse_items(body: &Value) -> PriceMap {
        let mut out = PriceMap::new();
        let items = body
            .get("itemsResult")
            .and_then(|r| r.get("items"))
            .and_then(Value::as_array);
        for item in items.into_iter().flatten() {
            let Some(asin) = item.get("asin").and_then(Value::as_str) else {
                debug!("creators: item without asin skipped");
                continue;
            };
            match Self::offer_prices(item).best() {
                Some(price) => {
                    out.insert(asin.to_ascii_uppercase(), price);
                }
                None => debug!(asin, "creators: no listing price"),
            }
        }
        out
    }
}

#[async_trait]
impl PriceSource for CreatorsSource {
    fn name(&self) -> &'static str {
        "creators"
    }

    async fn fetch_prices(&self, batch: &[String], market: Market) -> Result<PriceMap> {
        let token = self
            .tokens
            .obtain_credential(market)
            .await
            .with_context(|| format!("creators: authentication failed for market {market}"))?;
        let authorization = match self.api_version.as_deref() {
            Some(version) => format!("Bearer {token}, Version {version}"),
            None => format!("Bearer {token}"),
        };

        let request = GetItemsRequest {
            item_ids: batch,
            item_id_type: "ASIN",
            marketplace: market.marketplace(),
            partner_tag: self.partner_tags.get(market)?,
            resources: &RESOURCES,
        };
        let url = format!("{}/catalog/v1/getItems", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header("x-marketplace", market.marketplace())
            .json(&request)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 2000);
            return Err(anyhow!(
                "creators getItems failed: {status} market={market} body={body}"
            ));
        }

        let body: Value = resp.json().await?;
        for (code, message) in upstream_errors(&body) {
            warn!(%market, code = %code, message = %message, "creators: item error");
        }
        Ok(Self::parse_items(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CachedToken;
    use crate::providers::stub;
    use serde_json::json;

    fn listing(amount: Value, buy_box: bool, merchant: &str) -> Value {
        json!({
            "price": {"money": {"amount": amount, "currency": "EUR"}},
            "isBuyBoxWinner": buy_box,
            "merchantInfo": {"name": merchant}
        })
    }

    #[test]
    fn parses_listings_with_precedence() {
        let body = json!({
            "itemsResult": {"items": [
                {"asin": "B0TEST0001", "offersV2": {"listings": [
                    listing(json!(99.0), false, "Amazon.de"),
                    listing(json!(106.40), true, "Shop"),
                ]}},
                {"asin": "B0TEST0002", "offersV2": {"listings": [
                    listing(json!("45.50"), false, "Shop"),
                    listing(json!(47.0), false, "Amazon"),
                ]}},
                {"asin": "B0TEST0003", "offersV2": {"listings": [
                    listing(json!(12.0), false, "Shop"),
                ]}}
            ]},
            "errors": [{"code": "ItemNotAccessible", "message": "B0TEST0009 not accessible"}]
        });
        let prices = CreatorsSource::parse_items(&body);
        assert_eq!(prices.len(), 3);
        assert_eq!(prices["B0TEST0001"], 106.40);
        assert_eq!(prices["B0TEST0002"], 47.0);
        assert_eq!(prices["B0TEST0003"], 12.0);
    }

    #[test]
    fn items_without_offers_are_absent() {
        let body = json!({
            "itemsResult": {"items": [
                {"asin": "B0TEST0001"},
                {"asin": "B0TEST0002", "offersV2": {"listings": [{"price": {}}]}},
                {"offersV2": {"listings": [listing(json!(5.0), true, "Amazon")]}}
            ]}
        });
        assert!(CreatorsSource::parse_items(&body).is_empty());
        assert!(CreatorsSource::parse_items(&json!({"errors": []})).is_empty());
    }

    #[test]
    fn request_body_uses_camel_case() {
        let ids = vec!["B0TEST0001".to_string()];
        let req = GetItemsRequest {
            item_ids: &ids,
            item_id_type: "ASIN",
            marketplace: Market::De.marketplace(),
            partner_tag: "site-21",
            resources: &RESOURCES,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["itemIds"][0], "B0TEST0001");
        assert_eq!(v["itemIdType"], "ASIN");
        assert_eq!(v["marketplace"], "www.amazon.de");
        assert_eq!(v["partnerTag"], "site-21");
        assert_eq!(v["resources"].as_array().unwrap().len(), 3);
    }

    fn tokens_at(token_url: &str) -> TokenCache {
        TokenCache::new(
            http_client("price-sync/test").unwrap(),
            ClientCredentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
                scope: Some("creatorsapi/default".into()),
            },
            HashMap::from([("EU".to_string(), token_url.to_string())]),
        )
    }

    fn tags() -> PartnerTags {
        PartnerTags::from_map(HashMap::from([(Market::De, "site-21".to_string())]))
    }

    #[tokio::test]
    async fn get_items_sends_bearer_token_and_marketplace() {
        let (token_base, token_server) = stub::serve_once(
            200,
            r#"{"access_token":"tok-1","expires_in":3600,"token_type":"bearer"}"#,
        )
        .await;
        let items = json!({"itemsResult": {"items": [
            {"asin": "B0TEST0001", "offersV2": {"listings": [listing(json!(106.40), true, "Amazon.de")]}}
        ]}});
        let (api_base, api_server) = stub::serve_once(200, &items.to_string()).await;

        let source = CreatorsSource::new(
            Some(api_base.as_str()),
            Some("2.1".into()),
            tokens_at(&format!("{token_base}/oauth2/token")),
            tags(),
        )
        .unwrap();
        let prices = source
            .fetch_prices(&["B0TEST0001".to_string()], Market::De)
            .await
            .unwrap();
        assert_eq!(prices["B0TEST0001"], 106.40);

        let token_request = token_server.await.unwrap();
        assert!(token_request.contains("grant_type=client_credentials"));

        let request = api_server.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /catalog/v1/getItems "), "{request}");
        assert!(lower.contains("authorization: bearer tok-1, version 2.1"), "{request}");
        assert!(lower.contains("x-marketplace: www.amazon.de"), "{request}");
        assert!(request.contains(r#""itemIds":["B0TEST0001"]"#), "{request}");
        assert!(request.contains(r#""partnerTag":"site-21""#), "{request}");
    }

    #[tokio::test]
    async fn non_success_status_fails_the_batch() {
        let (api_base, _server) = stub::serve_once(503, r#"{"message":"throttled"}"#).await;
        let tokens = tokens_at(&stub::closed_port().await);
        tokens
            .seed(
                Market::De,
                CachedToken {
                    access_token: "tok".into(),
                    expires_at: chrono::Utc::now() + chrono::Duration::seconds(3600),
                },
            )
            .await;
        let source = CreatorsSource::new(Some(api_base.as_str()), None, tokens, tags()).unwrap();
        let err = source
            .fetch_prices(&["B0TEST0001".to_string()], Market::De)
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("503"), "{err}");
        assert!(err.contains("throttled"), "{err}");
    }

    #[tokio::test]
    async fn failed_authentication_fails_the_batch() {
        let tokens = tokens_at(&stub::closed_port().await);
        let source =
            CreatorsSource::new(Some("http://127.0.0.1:1"), None, tokens, tags()).unwrap();
        let err = source
            .fetch_prices(&["B0TEST0001".to_string()], Market::De)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("authentication failed for market de"));
    }
}
