//! SigV4-signed JSON client for the managed compute backends.
//!
//! Both managed backends speak HTTPS + JSON with AWS Signature Version 4
//! request signing: the batch service as REST-JSON (verb paths like
//! `/v1/submitjob`), the task service as JSON-1.1 (`X-Amz-Target` header).
//! The endpoint is overridable so local emulators work over plain HTTP.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use http::{Request, StatusCode};
use http_body_util::Full;
use sha2::{Digest, Sha256};

use crate::error::{ProviderError, ProviderResult};
use crate::httpc::{self, Endpoint};

type HmacSha256 = Hmac<Sha256>;

/// Static credentials for request signing.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// One service endpoint plus the signing context for it.
#[derive(Debug, Clone)]
pub struct AwsClient {
    endpoint: Endpoint,
    region: String,
    service: &'static str,
    credentials: AwsCredentials,
}

impl AwsClient {
    pub fn new(
        service: &'static str,
        region: &str,
        endpoint_override: Option<&str>,
        credentials: AwsCredentials,
    ) -> ProviderResult<Self> {
        let url = match endpoint_override {
            Some(url) => url.to_string(),
            None => format!("https://{service}.{region}.amazonaws.com"),
        };
        Ok(Self {
            endpoint: Endpoint::parse(&url)?,
            region: region.to_string(),
            service,
            credentials,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// POST a JSON body and require a 2xx response.
    pub async fn post_json(
        &self,
        path: &str,
        target: Option<&str>,
        body: &serde_json::Value,
    ) -> ProviderResult<Bytes> {
        let (status, bytes) = self.post_json_raw(path, target, body).await?;
        if !status.is_success() {
            return Err(ProviderError::Backend(format!(
                "{} {}: {status}: {}",
                self.service,
                target.unwrap_or(path),
                String::from_utf8_lossy(&bytes).trim()
            )));
        }
        Ok(bytes)
    }

    /// POST a JSON body, returning the status for the caller to interpret
    /// (teardown calls treat client errors as already-gone).
    pub async fn post_json_raw(
        &self,
        path: &str,
        target: Option<&str>,
        body: &serde_json::Value,
    ) -> ProviderResult<(StatusCode, Bytes)> {
        let payload =
            serde_json::to_vec(body).map_err(|e| ProviderError::Serialize(e.to_string()))?;
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let content_type = if target.is_some() {
            "application/x-amz-json-1.1"
        } else {
            "application/json"
        };

        let mut headers: Vec<(String, String)> = vec![
            ("content-type".to_string(), content_type.to_string()),
            ("host".to_string(), self.endpoint.host_header()),
            ("x-amz-date".to_string(), timestamp.clone()),
        ];
        if let Some(target) = target {
            headers.push(("x-amz-target".to_string(), target.to_string()));
        }
        headers.sort();

        let authorization = authorization_header(
            "POST",
            path,
            "",
            &headers,
            &payload,
            &self.region,
            self.service,
            &self.credentials,
            &timestamp,
        );

        let mut builder = Request::builder().method("POST").uri(path);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let req = builder
            .header("authorization", authorization)
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| ProviderError::Backend(e.to_string()))?;

        httpc::send(&self.endpoint, req).await
    }
}

// ── Signature Version 4 ───────────────────────────────────────────

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Canonical request per the SigV4 specification. `headers` must be
/// lowercase-named, trimmed, and sorted.
fn canonical_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &[(String, String)],
    payload: &[u8],
) -> String {
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = signed_header_names(headers);
    format!(
        "{method}\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\n{}",
        sha256_hex(payload)
    )
}

fn signed_header_names(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";")
}

fn credential_scope(date: &str, region: &str, service: &str) -> String {
    format!("{date}/{region}/{service}/aws4_request")
}

fn string_to_sign(timestamp: &str, scope: &str, canonical: &str) -> String {
    format!(
        "AWS4-HMAC-SHA256\n{timestamp}\n{scope}\n{}",
        sha256_hex(canonical.as_bytes())
    )
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

#[allow(clippy::too_many_arguments)]
fn authorization_header(
    method: &str,
    path: &str,
    query: &str,
    headers: &[(String, String)],
    payload: &[u8],
    region: &str,
    service: &str,
    credentials: &AwsCredentials,
    timestamp: &str,
) -> String {
    let date = &timestamp[..8];
    let scope = credential_scope(date, region, service);
    let canonical = canonical_request(method, path, query, headers, payload);
    let to_sign = string_to_sign(timestamp, &scope, &canonical);
    let key = signing_key(&credentials.secret_access_key, date, region, service);
    let signature = hex::encode(hmac_sha256(&key, to_sign.as_bytes()));
    format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={}, Signature={signature}",
        credentials.access_key_id,
        signed_header_names(headers)
    )
}
