//! AWS Signature Version 4 request signing
//!
//! Used by the PA-API v5 source. Stateless: every request is signed from
//! scratch because the signature is bound to the request timestamp.
//!
//! Derivation:
//!   kDate    = HMAC("AWS4" + secret, yyyymmdd)
//!   kRegion  = HMAC(kDate, region)
//!   kService = HMAC(kRegion, service)
//!   kSigning = HMAC(kService, "aws4_request")
//!   signature = hex(HMAC(kSigning, string_to_sign))
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const TERMINATOR: &str = "aws4_request";

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| anyhow!("invalid signing key: {}", e))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub(crate) fn derive_signing_key(
    secret_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date)?;
    let k_region = hmac_sha256(&k_date, region)?;
    let k_service = hmac_sha256(&k_region, service)?;
    hmac_sha256(&k_service, TERMINATOR)
}

/// A request as far as signing is concerned.
#[derive(Debug, Clone)]
pub struct SignableRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    /// Extra headers to sign, besides `host` and `x-amz-date`.
    pub headers: Vec<(&'a str, &'a str)>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(access_key: &str, secret_key: &str, region: &str, service: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            region: region.to_string(),
            service: service.to_string(),
        }
    }

    /// Headers to attach to the outbound request: every signed header plus
    /// `authorization`. Names are lowercase.
    pub fn sign(&self, req: &SignableRequest<'_>, now: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut canonical: BTreeMap<String, String> = req
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        canonical.insert("host".to_string(), req.host.to_string());
        canonical.insert("x-amz-date".to_string(), amz_date.clone());

        let canonical_headers: String = canonical
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        let signed_headers = canonical.keys().cloned().collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            req.method.to_ascii_uppercase(),
            req.path,
            canonical_headers,
            signed_headers,
            sha256_hex(req.body)
        );

        let scope = format!("{}/{}/{}/{}", date, self.region, self.service, TERMINATOR);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(&self.secret_key, &date, &self.region, &self.service)?;
        let signature = hex::encode(hmac_sha256(&signing_key, &string_to_sign)?);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key, scope, signed_headers, signature
        );

        let mut out: Vec<(String, String)> = canonical.into_iter().collect();
        out.push(("authorization".to_string(), authorization));
        Ok(out)
    }
}
