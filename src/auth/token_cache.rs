//! OAuth 2.0 client-credentials token cache
//!
//! Holds one bearer token per market. A cached token is reused until fewer
//! than [`REFRESH_MARGIN_SECS`] seconds of validity remain. Failures are
//! returned to the caller as-is; there is no retry here.
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::market::Market;

pub const REFRESH_MARGIN_SECS: i64 = 60;
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    token_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

pub struct TokenCache {
    http: Client,
    credentials: ClientCredentials,
    /// Token endpoint per credential region (see [`Market::creators_region`]).
    token_urls: HashMap<String, String>,
    tokens: Mutex<HashMap<Market, CachedToken>>,
}

impl TokenCache {
    pub fn new(
        http: Client,
        credentials: ClientCredentials,
        token_urls: HashMap<String, String>,
    ) -> Self {
        Self {
            http,
            credentials,
            token_urls,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Bearer token for `market`, refreshed when close to expiry.
    pub async fn obtain_credential(&self, market: Market) -> Result<String> {
        let mut tokens = self.tokens.lock().await;
        if let Some(cached) = tokens.get(&market) {
            if cached.is_fresh(Utc::now()) {
                return Ok(cached.access_token.clone());
            }
            debug!(%market, "creators: cached token near expiry; refreshing");
        }

        let fresh = self.request_token(market).await?;
        let token = fresh.access_token.clone();
        tokens.insert(market, fresh);
        Ok(token)
    }

    #[cfg(test)]
    pub(crate) async fn seed(&self, market: Market, token: CachedToken) {
        self.tokens.lock().await.insert(market, token);
    }

    async fn request_token(&self, market: Market) -> Result<CachedToken> {
        let region = market.creators_region();
        let url = self
            .token_urls
            .get(region)
            .with_context(|| format!("no token endpoint configured for region {region}"))?;

        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];
        if let Some(scope) = self.credentials.scope.as_deref() {
            params.push(("scope", scope));
        }

        let response = self
            .http
            .post(url)
            .form(&params)
            .send()
            .await
            .with_context(|| format!("send token request for market {market}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("token request failed for market {market}: {status} - {error_text}");
        }

        let token_data = response
            .json::<TokenResponse>()
            .await
            .context("parse token response")?;
        let lifetime = token_data.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

        info!(
            %market,
            token_type = token_data.token_type.as_deref().unwrap_or("bearer"),
            expires_in = lifetime,
            "creators: token acquired"
        );

        Ok(CachedToken {
            access_token: token_data.access_token,
            expires_at: Utc::now() + Duration::seconds(lifetime),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{http_client, stub};

    fn cache_at(base: &str, scope: Option<&str>) -> TokenCache {
        let url = format!("{base}/oauth2/token");
        let urls = HashMap::from([("EU".to_string(), url.clone()), ("NA".to_string(), url)]);
        TokenCache::new(
            http_client("price-sync/test").unwrap(),
            ClientCredentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
                scope: scope.map(str::to_string),
            },
            urls,
        )
    }

    /// Any refresh against this cache fails to connect.
    async fn offline_cache() -> TokenCache {
        cache_at(&stub::closed_port().await, None)
    }

    fn token(access: &str, secs: i64) -> CachedToken {
        CachedToken {
            access_token: access.into(),
            expires_at: Utc::now() + Duration::seconds(secs),
        }
    }

    #[test]
    fn freshness_uses_sixty_second_margin() {
        let now = Utc::now();
        let at = |secs| CachedToken {
            access_token: "t".into(),
            expires_at: now + Duration::seconds(secs),
        };
        assert!(at(61).is_fresh(now));
        assert!(!at(60).is_fresh(now));
        assert!(!at(-5).is_fresh(now));
    }

    #[tokio::test]
    async fn fresh_token_is_served_from_cache() {
        let cache = offline_cache().await;
        cache.seed(Market::De, token("cached", 3600)).await;
        assert_eq!(cache.obtain_credential(Market::De).await.unwrap(), "cached");
    }

    #[tokio::test]
    async fn stale_token_forces_refresh() {
        let cache = offline_cache().await;
        cache.seed(Market::De, token("stale", 30)).await;
        assert!(cache.obtain_credential(Market::De).await.is_err());
    }

    #[tokio::test]
    async fn tokens_are_cached_per_market() {
        let cache = offline_cache().await;
        cache.seed(Market::Us, token("us", 3600)).await;
        assert_eq!(cache.obtain_credential(Market::Us).await.unwrap(), "us");
        assert!(cache.obtain_credential(Market::Fr).await.is_err());
    }

    #[tokio::test]
    async fn requests_token_with_client_credentials_form() {
        let (base, server) = stub::serve_once(
            200,
            r#"{"access_token":"tok-1","expires_in":120,"token_type":"bearer"}"#,
        )
        .await;
        let cache = cache_at(&base, Some("creatorsapi/default"));
        let before = Utc::now();

        assert_eq!(cache.obtain_credential(Market::De).await.unwrap(), "tok-1");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /oauth2/token "), "{request}");
        assert!(request
            .to_ascii_lowercase()
            .contains("content-type: application/x-www-form-urlencoded"));
        for part in [
            "grant_type=client_credentials",
            "client_id=id",
            "client_secret=secret",
            "scope=creatorsapi%2Fdefault",
        ] {
            assert!(request.contains(part), "{part} missing in {request}");
        }

        let expires_at = cache.tokens.lock().await[&Market::De].expires_at;
        assert!(expires_at >= before + Duration::seconds(120));
        assert!(expires_at <= Utc::now() + Duration::seconds(120));

        // 120 s left is above the margin, so no second request (the stub is gone).
        assert_eq!(cache.obtain_credential(Market::De).await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn missing_expires_in_defaults_to_an_hour() {
        let (base, _server) = stub::serve_once(200, r#"{"access_token":"tok-2"}"#).await;
        let cache = cache_at(&base, None);
        let before = Utc::now();
        assert_eq!(cache.obtain_credential(Market::Us).await.unwrap(), "tok-2");
        let expires_at = cache.tokens.lock().await[&Market::Us].expires_at;
        assert!(expires_at >= before + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));
    }

    #[tokio::test]
    async fn short_lived_token_is_refreshed_next_time() {
        let (base, server) =
            stub::serve_once(200, r#"{"access_token":"tok-3","expires_in":30}"#).await;
        let cache = cache_at(&base, None);
        assert_eq!(cache.obtain_credential(Market::De).await.unwrap(), "tok-3");
        server.await.unwrap();
        // Within the refresh margin: goes back to the (now closed) endpoint.
        assert!(cache.obtain_credential(Market::De).await.is_err());
    }

    #[tokio::test]
    async fn rejected_token_request_is_an_error() {
        let (base, _server) = stub::serve_once(401, r#"{"error":"invalid_client"}"#).await;
        let cache = cache_at(&base, None);
        let err = cache.obtain_credential(Market::De).await.unwrap_err().to_string();
        assert!(err.contains("401"), "{err}");
        assert!(err.contains("invalid_client"), "{err}");
    }
}
