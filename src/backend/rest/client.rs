//! Signed HTTP client for the execution backend API.

use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::backend::{BackendError, Result};
use crate::config::BackendConfig;

/// Default receive window for signed requests in milliseconds.
const DEFAULT_RECEIVE_WINDOW: i64 = 5000;

/// Default HTTP request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for creating a new Client.
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub request_timeout: Duration,
    pub receive_window: i64,
}

impl ClientConfig {
    pub fn from_backend(config: &BackendConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            request_timeout: if config.request_timeout.is_zero() {
                DEFAULT_REQUEST_TIMEOUT
            } else {
                config.request_timeout
            },
            receive_window: DEFAULT_RECEIVE_WINDOW,
        }
    }
}

/// Creates an HMAC-SHA256 signature, base64 encoded.
///
/// Signature format:
/// - GET/DELETE: METHOD\n/endpoint\nparam1=val1&signTimestamp=xxx (sorted by key)
/// - POST: METHOD\n/endpoint\nrequestBody=xxx&signTimestamp=xxx
pub(super) fn sign(
    secret: &str,
    method: &Method,
    endpoint: &str,
    timestamp: i64,
    payload: &str,
) -> Result<String> {
    let sign_payload = if payload.is_empty() {
        format!("{}\n{}\nsignTimestamp={}", method.as_str(), endpoint, timestamp)
    } else if *method == Method::POST {
        format!(
            "{}\n{}\nrequestBody={}&signTimestamp={}",
            method.as_str(),
            endpoint,
            payload,
            timestamp
        )
    } else {
        format!("{}\n{}\n{}", method.as_str(), endpoint, payload)
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| BackendError::Unavailable(format!("invalid api secret: {}", e)))?;
    mac.update(sign_payload.as_bytes());
    let result = mac.finalize();

    Ok(base64::engine::general_purpose::STANDARD.encode(result.into_bytes()))
}

fn header(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| BackendError::Unavailable(format!("invalid header value: {}", e)))
}

/// HTTP client for the execution backend.
/// Handles request signing and error mapping.
pub struct Client {
    config: ClientConfig,
    http_client: HttpClient,
}

impl Client {
    /// Creates a new API client.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Sends a signed GET request and decodes the JSON response.
    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: Vec<(String, String)>,
    ) -> Result<T> {
        let body = self.request(Method::GET, endpoint, params, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Sends a signed POST request with a JSON body.
    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let json_body = serde_json::to_string(body)?;
        let body = self
            .request(Method::POST, endpoint, Vec::new(), Some(json_body))
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Sends a signed DELETE request.
    pub async fn delete<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let body = self
            .request(Method::DELETE, endpoint, Vec::new(), None)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Sends an HTTP request to the backend API with authentication headers.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        mut params: Vec<(String, String)>,
        body: Option<String>,
    ) -> Result<Vec<u8>> {
        let timestamp = chrono::Utc::now().timestamp_millis();

        let (url, payload) = match body {
            Some(ref json_body) => (
                format!("{}{}", self.config.base_url, endpoint),
                json_body.clone(),
            ),
            None => {
                params.push(("signTimestamp".to_string(), timestamp.to_string()));
                // Sort parameters by key for consistent signing
                params.sort_by(|a, b| a.0.cmp(&b.0));

                let payload = params
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                    .collect::<Vec<_>>()
                    .join("&");

                (
                    format!("{}{}?{}", self.config.base_url, endpoint, payload),
                    payload,
                )
            }
        };

        let signature = sign(&self.config.api_secret, &method, endpoint, timestamp, &payload)?;

        let mut headers = HeaderMap::new();
        headers.insert("key", header(&self.config.api_key)?);
        headers.insert("signTimestamp", header(&timestamp.to_string())?);
        headers.insert("signature", header(&signature)?);
        headers.insert("signatureMethod", HeaderValue::from_static("hmacSHA256"));
        headers.insert(
            "recvWindow",
            header(&self.config.receive_window.to_string())?,
        );

        let mut request = self
            .http_client
            .request(method.clone(), &url)
            .headers(headers);

        if let Some(json_body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(json_body);
        }

        debug!(method = %method, endpoint = %endpoint, "sending request");

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if status.is_client_error() || status.is_server_error() {
            return Err(parse_error_response(status, &body));
        }

        Ok(body.to_vec())
    }
}

/// Creates a BackendError from an error response.
fn parse_error_response(status: StatusCode, body: &[u8]) -> BackendError {
    #[derive(Deserialize)]
    struct ErrorResponse {
        code: Option<i64>,
        message: Option<String>,
    }

    let (code, message) = match serde_json::from_slice::<ErrorResponse>(body) {
        Ok(resp) => (
            resp.code.unwrap_or(i64::from(status.as_u16())),
            resp.message
                .unwrap_or_else(|| String::from_utf8_lossy(body).to_string()),
        ),
        Err(_) => (
            i64::from(status.as_u16()),
            String::from_utf8_lossy(body).to_string(),
        ),
    };

    warn!(status = status.as_u16(), code, message = %message, "api error");

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return BackendError::Unavailable(message);
    }

    BackendError::Api { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_deterministic_per_payload() {
        let a = sign("secret", &Method::GET, "/v1/positions", 1700000000000, "").unwrap();
        let b = sign("secret", &Method::GET, "/v1/positions", 1700000000000, "").unwrap();
        let c = sign("secret", &Method::GET, "/v1/positions", 1700000000001, "").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        // base64 of a 32 byte digest
        assert_eq!(a.len(), 44);
    }

    #[test]
    fn test_server_errors_map_to_unavailable() {
        let err = parse_error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            br#"{"code":503,"message":"maintenance"}"#,
        );
        assert!(matches!(err, BackendError::Unavailable(ref m) if m == "maintenance"));

        let err = parse_error_response(StatusCode::BAD_REQUEST, b"bad size");
        assert!(matches!(err, BackendError::Api { code: 400, .. }));
    }
}
