//! Thin HTTP request helper for the Consul API.
//!
//! Builds `<address>/v1/...` URLs from escaped path segments, applies the
//! auth token header and per-request timeouts, and hands back the raw
//! status/headers/body triple. Status interpretation belongs to the callers;
//! a non-2xx response is not an error at this layer.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use snafu::ResultExt;
use url::Url;

use crate::error::{self, Result};

/// Applied when the caller does not override the timeout.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Raw response triple handed to the typed clients.
#[derive(Debug)]
pub struct HttpResponse {
    /// HTTP status code; callers inspect it, this layer never rejects.
    pub status: StatusCode,
    /// Response headers, notably `X-Consul-Index`.
    pub headers: HeaderMap,
    /// Unparsed response body.
    pub body: Bytes,
}

/// Shared request helper over a pooled [`reqwest::Client`].
///
/// Cheap to clone; all clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpClient {
    /// Create a helper for the agent at `address` (e.g. `http://localhost:8500`).
    pub fn new(address: &str, token: Option<String>) -> Result<Self> {
        let base = Url::parse(address).context(error::InvalidAddressSnafu { address })?;
        if base.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase)
                .context(error::InvalidAddressSnafu { address });
        }
        let client = reqwest::Client::builder()
            .build()
            .context(error::TransportSnafu)?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    /// Perform one request against `/v1/<segments...>`.
    ///
    /// Query pairs with a `None` value are omitted. `timeout` falls back to
    /// [`DEFAULT_TIMEOUT`]. Transport failures map to [`crate::Error::Transport`];
    /// any response that arrives is returned as-is.
    pub async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, Option<String>)],
        body: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse> {
        let url = build_url(&self.base, segments, query);
        let mut request = self
            .client
            .request(method, url)
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT));
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.context(error::TransportSnafu)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.context(error::TransportSnafu)?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Join `/v1` plus the escaped `segments` onto `base` and append the
/// non-`None` query pairs.
fn build_url(base: &Url, segments: &[&str], query: &[(&str, Option<String>)]) -> Url {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .expect("address validated at construction");
        path.pop_if_empty();
        path.push("v1");
        path.extend(segments);
    }
    if query.iter().any(|(_, value)| value.is_some()) {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            if let Some(value) = value {
                pairs.append_pair(key, value);
            }
        }
    }
    url
}
