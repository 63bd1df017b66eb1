//! HTTP probe.

use std::time::Duration;

use esm_catalog::CheckStatus;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use tracing::debug;

use super::CheckSpec;

/// Redirect chains longer than this count as failures.
const MAX_REDIRECTS: usize = 10;

/// Response bodies are surfaced as check output up to this many bytes.
const MAX_OUTPUT_BYTES: usize = 4 * 1024;

pub struct HttpProber {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(spec: &CheckSpec) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        for (name, values) in &spec.headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                    headers.append(name.clone(), value);
                }
            }
        }

        let client = reqwest::Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .danger_accept_invalid_certs(spec.tls_skip_verify)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            url: spec.http.clone(),
            timeout: spec.timeout,
        })
    }

    pub async fn probe(&self) -> Option<(CheckStatus, String)> {
        let resp = match self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                debug!(url = %self.url, error = %e, "http probe failed");
                return Some((
                    CheckStatus::Critical,
                    format!("GET {}: {}", self.url, e),
                ));
            }
        };

        let status = resp.status();
        let body = bounded_body(resp).await;

        let check_status = if status.is_success() {
            CheckStatus::Passing
        } else if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::SERVICE_UNAVAILABLE
        {
            CheckStatus::Warning
        } else {
            CheckStatus::Critical
        };

        Some((
            check_status,
            format!("GET {}: {} Output: {}", self.url, status, body),
        ))
    }
}

/// Read at most [`MAX_OUTPUT_BYTES`] of the response body, then hang up.
async fn bounded_body(mut resp: reqwest::Response) -> String {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    while let Ok(Some(chunk)) = resp.chunk().await {
        let remaining = MAX_OUTPUT_BYTES - buf.len();
        buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        if buf.len() >= MAX_OUTPUT_BYTES {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
