//! Typed client for the Consul KV API.
//!
//! Wraps the raw HTTP helper with the verbs the lock protocol needs:
//! `put` with CAS or session-acquire semantics, CAS-guarded `delete`, and
//! `get` in single, prefix, blocking, and consistent variants. Blocking
//! queries surface the `X-Consul-Index` header so callers can long-poll.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::Deserialize;

use crate::error::{self, Error, Result};
use crate::http::{HttpClient, HttpResponse};

const INDEX_HEADER: &str = "X-Consul-Index";

/// Extra timeout margin on top of the `wait` duration of a blocking query.
const BLOCKING_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// One KV record as observed by a read.
///
/// Equality is field-wise over exactly this set, which the watcher relies on
/// to deduplicate unchanged long-poll responses.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    /// Full key path.
    pub key: String,
    /// Decoded value bytes (transported base64-encoded).
    pub value: Vec<u8>,
    /// Index at which the entry was created.
    pub create_index: u64,
    /// Index of the last modification; CAS preconditions compare against this.
    pub modify_index: u64,
    /// Incremented each time a session acquires the entry.
    pub lock_index: u64,
    /// Opaque flags, passed through untouched.
    pub flags: u64,
    /// Session currently holding the entry, if any.
    pub session: Option<String>,
}

/// Wire form of a KV entry as the HTTP API returns it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireKvEntry {
    key: String,
    value: Option<String>,
    create_index: u64,
    modify_index: u64,
    lock_index: u64,
    flags: u64,
    #[serde(default)]
    session: Option<String>,
}

impl WireKvEntry {
    fn decode(self) -> Result<KvEntry> {
        let value = match self.value {
            Some(encoded) => BASE64.decode(encoded.as_bytes()).map_err(|err| {
                Error::MalformedResponse {
                    message: format!("value of '{}' is not base64: {err}", self.key),
                }
            })?,
            None => Vec::new(),
        };
        Ok(KvEntry {
            key: self.key,
            value,
            create_index: self.create_index,
            modify_index: self.modify_index,
            lock_index: self.lock_index,
            flags: self.flags,
            session: self.session.filter(|s| !s.is_empty()),
        })
    }
}

/// Options for [`KvClient::put`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions<'a> {
    /// Compare-and-set against this modify index; `0` means "must not exist".
    pub cas: Option<u64>,
    /// Acquire the entry for this session id.
    pub acquire: Option<&'a str>,
}

/// Options for [`KvClient::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Long-poll for this long before the server answers unchanged.
    pub wait: Option<Duration>,
    /// Block until the server's index for the key(s) passes this value.
    pub index: Option<u64>,
    /// Return every entry under the key treated as a prefix.
    pub prefix: bool,
    /// Force a consistent (leader-verified) read.
    pub consistent: bool,
}

/// Typed KV operations over a shared [`HttpClient`].
#[derive(Debug, Clone)]
pub struct KvClient {
    http: HttpClient,
}

impl KvClient {
    /// Wrap an HTTP helper.
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Write `value` at `key`. Returns whether the precondition held.
    ///
    /// With `cas` the write is atomic against the stored modify index; with
    /// `acquire` the entry becomes session-acquired and the write fails if a
    /// different session already holds it.
    pub async fn put(&self, key: &str, value: &[u8], options: PutOptions<'_>) -> Result<bool> {
        let query = [
            ("cas", options.cas.map(|cas| cas.to_string())),
            ("acquire", options.acquire.map(str::to_string)),
        ];
        let response = self
            .http
            .request(
                Method::PUT,
                &key_segments(key),
                &query,
                Some(value.to_vec()),
                None,
            )
            .await?;
        parse_bool_body(&response)
    }

    /// Delete `key`, optionally guarded by CAS. Returns whether the
    /// precondition held.
    pub async fn delete(&self, key: &str, cas: Option<u64>) -> Result<bool> {
        let query = [("cas", cas.map(|cas| cas.to_string()))];
        let response = self
            .http
            .request(Method::DELETE, &key_segments(key), &query, None, None)
            .await?;
        parse_bool_body(&response)
    }

    /// Read `key` (or the whole prefix). Returns the entries and the
    /// response's blocking-query index.
    ///
    /// An empty vec encodes "no value": a 404 still carries a valid index so
    /// a subsequent blocking query can wait for the key to be created.
    pub async fn get(&self, key: &str, options: GetOptions) -> Result<(Vec<KvEntry>, u64)> {
        let query = [
            ("recurse", options.prefix.then(|| "true".to_string())),
            ("consistent", options.consistent.then(|| "true".to_string())),
            (
                "index",
                options.index.map(|index| index.to_string()),
            ),
            (
                "wait",
                options.wait.map(|wait| format!("{}s", wait.as_secs())),
            ),
        ];
        let timeout = options.wait.map(|wait| wait + BLOCKING_TIMEOUT_MARGIN);
        let response = self
            .http
            .request(Method::GET, &key_segments(key), &query, None, timeout)
            .await?;

        let index = parse_index(&response.headers)?;
        match response.status {
            StatusCode::OK => {
                let wire: Vec<WireKvEntry> =
                    serde_json::from_slice(&response.body).map_err(|err| {
                        Error::MalformedResponse {
                            message: format!("kv read of '{key}': {err}"),
                        }
                    })?;
                let entries = wire
                    .into_iter()
                    .map(WireKvEntry::decode)
                    .collect::<Result<Vec<_>>>()?;
                Ok((entries, index))
            }
            StatusCode::NOT_FOUND => Ok((Vec::new(), index)),
            status => error::UnexpectedStatusSnafu {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            }
            .fail(),
        }
    }
}

/// `kv` plus the key split on `/` so each piece gets escaped individually.
fn key_segments(key: &str) -> Vec<&str> {
    let mut segments = vec!["kv"];
    segments.extend(key.split('/'));
    segments
}

/// Parse the JSON boolean body of a put/delete response.
fn parse_bool_body(response: &HttpResponse) -> Result<bool> {
    if !response.status.is_success() {
        return error::UnexpectedStatusSnafu {
            status: response.status.as_u16(),
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }
        .fail();
    }
    serde_json::from_slice(&response.body).map_err(|_| Error::MalformedResponse {
        message: format!(
            "expected JSON boolean, got '{}'",
            String::from_utf8_lossy(&response.body)
        ),
    })
}

/// Extract `X-Consul-Index`. Zero or an unparsable header is a hard
/// protocol error; stale-index clamping is the watcher's concern.
pub(crate) fn parse_index(headers: &HeaderMap) -> Result<u64> {
    let value = headers
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);
    if value == 0 {
        return error::InvalidIndexSnafu { value }.fail();
    }
    Ok(value)
}
