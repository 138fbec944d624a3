//! In-process mock of the Consul HTTP API surface the crate uses.
//!
//! Implements the KV verbs (with CAS, session-acquire, and blocking-query
//! semantics backed by a real index watch channel) and the session
//! endpoints, plus failure injection: renew 404s, forced index replay, and
//! server-side session expiry.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

const INDEX_HEADER: &str = "X-Consul-Index";

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    create_index: u64,
    modify_index: u64,
    lock_index: u64,
    flags: u64,
    session: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredSession {
    behavior: String,
}

#[derive(Debug, Default)]
struct Inner {
    index: u64,
    entries: BTreeMap<String, StoredEntry>,
    sessions: HashMap<String, StoredSession>,
    renew_fails: bool,
    /// When set, every KV GET reports this index instead of the real one.
    forced_index: Option<u64>,
    /// When set, KV GET responses omit the index header entirely.
    omit_index_header: bool,
}

/// Shared state behind the mock's routes, with test-facing accessors.
pub struct MockConsul {
    inner: Mutex<Inner>,
    index_tx: watch::Sender<u64>,
}

impl MockConsul {
    fn new() -> Arc<Self> {
        let (index_tx, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            index_tx,
        })
    }

    /// Bind to an ephemeral port and serve; returns the running server.
    pub async fn start() -> MockServer {
        let mock = Self::new();
        let router = Router::new()
            .route(
                "/v1/kv/{*key}",
                get(kv_get).put(kv_put).delete(kv_delete),
            )
            .route("/v1/session/create", put(session_create))
            .route("/v1/session/renew/{id}", put(session_renew))
            .route("/v1/session/destroy/{id}", put(session_destroy))
            .with_state(mock.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock consul");
        let address = format!("http://{}", listener.local_addr().expect("local addr"));
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        MockServer {
            mock,
            address,
            task,
        }
    }

    fn bump_index(inner: &mut Inner, index_tx: &watch::Sender<u64>) -> u64 {
        inner.index += 1;
        index_tx.send_replace(inner.index);
        inner.index
    }

    /// Current global modify index.
    pub fn index(&self) -> u64 {
        self.inner.lock().unwrap().index
    }

    /// Value and owning session of a key, if present.
    pub fn entry(&self, key: &str) -> Option<(Vec<u8>, Option<String>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.session.clone()))
    }

    /// All keys with the given prefix.
    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Make `session/renew` answer 404 from now on.
    pub fn set_renew_fails(&self, fails: bool) {
        self.inner.lock().unwrap().renew_fails = fails;
    }

    /// Replay a fixed index in every KV GET response.
    pub fn set_forced_index(&self, index: Option<u64>) {
        self.inner.lock().unwrap().forced_index = index;
    }

    /// Drop the index header from KV GET responses.
    pub fn set_omit_index_header(&self, omit: bool) {
        self.inner.lock().unwrap().omit_index_header = omit;
    }

    /// Server-side session invalidation: drop the session and apply its
    /// end-of-life behavior to acquired entries.
    pub fn expire_session(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(session) = inner.sessions.remove(id) else {
            return;
        };
        apply_session_end(&mut inner, id, &session.behavior);
        Self::bump_index(&mut inner, &self.index_tx);
    }

    /// Write an entry directly, bypassing the HTTP surface.
    pub fn put_raw(&self, key: &str, value: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let index = Self::bump_index(&mut inner, &self.index_tx);
        let create_index = inner
            .entries
            .get(key)
            .map(|entry| entry.create_index)
            .unwrap_or(index);
        inner.entries.insert(
            key.to_string(),
            StoredEntry {
                value: value.to_vec(),
                create_index,
                modify_index: index,
                lock_index: 0,
                flags: 0,
                session: None,
            },
        );
    }
}

fn apply_session_end(inner: &mut Inner, id: &str, behavior: &str) {
    if behavior == "delete" {
        inner
            .entries
            .retain(|_, entry| entry.session.as_deref() != Some(id));
    } else {
        for entry in inner.entries.values_mut() {
            if entry.session.as_deref() == Some(id) {
                entry.session = None;
            }
        }
    }
}

/// A running mock server.
pub struct MockServer {
    pub mock: Arc<MockConsul>,
    pub address: String,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn parse_wait(params: &HashMap<String, String>) -> Duration {
    params
        .get("wait")
        .and_then(|wait| wait.strip_suffix('s'))
        .and_then(|secs| secs.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(20))
}

fn index_headers(index: u64, omit: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if !omit {
        headers.insert(
            INDEX_HEADER,
            HeaderValue::from_str(&index.to_string()).expect("index header"),
        );
    }
    headers
}

fn entry_json(key: &str, entry: &StoredEntry) -> serde_json::Value {
    json!({
        "Key": key,
        "Value": BASE64.encode(&entry.value),
        "CreateIndex": entry.create_index,
        "ModifyIndex": entry.modify_index,
        "LockIndex": entry.lock_index,
        "Flags": entry.flags,
        "Session": entry.session.clone().unwrap_or_default(),
    })
}

async fn kv_get(
    State(mock): State<Arc<MockConsul>>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let recurse = params.contains_key("recurse");
    let block_index = params
        .get("index")
        .and_then(|index| index.parse::<u64>().ok())
        .filter(|index| *index > 0);
    let deadline = tokio::time::Instant::now() + parse_wait(&params);
    let mut index_rx = mock.index_tx.subscribe();
    let mut force_respond = false;

    loop {
        let (body, reported, omit) = {
            let inner = mock.inner.lock().unwrap();
            let reported = inner.forced_index.unwrap_or_else(|| inner.index.max(1));
            let omit = inner.omit_index_header;

            let should_block = !force_respond
                && match block_index {
                    Some(block) => inner.forced_index.is_none() && inner.index <= block,
                    None => false,
                };
            if should_block {
                (None, reported, omit)
            } else {
                let matches: Vec<serde_json::Value> = if recurse {
                    inner
                        .entries
                        .iter()
                        .filter(|(stored_key, _)| stored_key.starts_with(&key))
                        .map(|(stored_key, entry)| entry_json(stored_key, entry))
                        .collect()
                } else {
                    inner
                        .entries
                        .get(&key)
                        .map(|entry| vec![entry_json(&key, entry)])
                        .unwrap_or_default()
                };
                (Some(matches), reported, omit)
            }
        };

        match body {
            Some(matches) if matches.is_empty() => {
                return (
                    StatusCode::NOT_FOUND,
                    index_headers(reported, omit),
                    String::new(),
                )
                    .into_response();
            }
            Some(matches) => {
                return (
                    StatusCode::OK,
                    index_headers(reported, omit),
                    serde_json::to_string(&matches).expect("serialize entries"),
                )
                    .into_response();
            }
            None => {
                // wait timed out: answer with the unchanged result
                force_respond = tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => true,
                    result = index_rx.changed() => result.is_err(),
                };
            }
        }
    }
}

async fn kv_put(
    State(mock): State<Arc<MockConsul>>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    let cas = params.get("cas").and_then(|cas| cas.parse::<u64>().ok());
    let acquire = params.get("acquire").cloned();

    let mut inner = mock.inner.lock().unwrap();

    if let Some(cas) = cas {
        let holds = match inner.entries.get(&key) {
            None => cas == 0,
            Some(entry) => entry.modify_index == cas,
        };
        if !holds {
            return (StatusCode::OK, "false".to_string());
        }
    }

    if let Some(session_id) = &acquire {
        if !inner.sessions.contains_key(session_id) {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("invalid session \"{session_id}\""),
            );
        }
        if let Some(entry) = inner.entries.get(&key) {
            if entry
                .session
                .as_ref()
                .is_some_and(|holder| holder != session_id)
            {
                return (StatusCode::OK, "false".to_string());
            }
        }
    }

    let index = MockConsul::bump_index(&mut inner, &mock.index_tx);
    let previous = inner.entries.get(&key);
    let create_index = previous.map(|entry| entry.create_index).unwrap_or(index);
    let newly_acquired = acquire.is_some()
        && previous.map_or(true, |entry| entry.session.is_none());
    let lock_index = previous.map(|entry| entry.lock_index).unwrap_or(0)
        + u64::from(newly_acquired);
    let session = match &acquire {
        Some(session_id) => Some(session_id.clone()),
        None => previous.and_then(|entry| entry.session.clone()),
    };
    inner.entries.insert(
        key,
        StoredEntry {
            value: body.to_vec(),
            create_index,
            modify_index: index,
            lock_index,
            flags: 0,
            session,
        },
    );
    (StatusCode::OK, "true".to_string())
}

async fn kv_delete(
    State(mock): State<Arc<MockConsul>>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let cas = params.get("cas").and_then(|cas| cas.parse::<u64>().ok());
    let mut inner = mock.inner.lock().unwrap();

    if let Some(cas) = cas {
        if let Some(entry) = inner.entries.get(&key) {
            if entry.modify_index != cas {
                return (StatusCode::OK, "false".to_string());
            }
        }
    }
    if inner.entries.remove(&key).is_some() {
        MockConsul::bump_index(&mut inner, &mock.index_tx);
    }
    (StatusCode::OK, "true".to_string())
}

async fn session_create(
    State(mock): State<Arc<MockConsul>>,
    body: Bytes,
) -> impl IntoResponse {
    let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or(json!({}));
    let behavior = request
        .get("Behavior")
        .and_then(|behavior| behavior.as_str())
        .unwrap_or("release")
        .to_string();
    let id = Uuid::new_v4().to_string();
    mock.inner
        .lock()
        .unwrap()
        .sessions
        .insert(id.clone(), StoredSession { behavior });
    (StatusCode::OK, json!({ "ID": id }).to_string())
}

async fn session_renew(
    State(mock): State<Arc<MockConsul>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let inner = mock.inner.lock().unwrap();
    if inner.renew_fails || !inner.sessions.contains_key(&id) {
        return (StatusCode::NOT_FOUND, String::new());
    }
    (StatusCode::OK, json!([{ "ID": id }]).to_string())
}

async fn session_destroy(
    State(mock): State<Arc<MockConsul>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let mut inner = mock.inner.lock().unwrap();
    if let Some(session) = inner.sessions.remove(&id) {
        apply_session_end(&mut inner, &id, &session.behavior);
        MockConsul::bump_index(&mut inner, &mock.index_tx);
    }
    (StatusCode::OK, "true".to_string())
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, condition: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}
