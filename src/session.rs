//! Consul session lifecycle: create, renew, destroy.
//!
//! A session is the liveness lease behind the lock protocol. The backend
//! invalidates an unrenewed session after its TTL and then releases every
//! KV entry the session acquired; with [`SessionBehavior::Delete`] those
//! entries are deleted outright.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{self, Error, Result};
use crate::http::HttpClient;

/// What the backend does with acquired entries when the session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// Acquired entries are deleted. The only value the lock protocol uses.
    Delete,
    /// Acquired entries are released but kept.
    Release,
}

#[derive(Debug, Serialize)]
struct CreateRequest {
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "Behavior")]
    behavior: SessionBehavior,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "ID")]
    id: String,
}

/// Session API over a shared [`HttpClient`].
#[derive(Debug, Clone)]
pub struct SessionClient {
    http: HttpClient,
}

impl SessionClient {
    /// Wrap an HTTP helper.
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Create a session with the given TTL and end-of-life behavior.
    pub async fn create(
        &self,
        ttl: Duration,
        behavior: SessionBehavior,
    ) -> Result<SessionHandle> {
        let body = serde_json::to_vec(&CreateRequest {
            ttl: format!("{}s", ttl.as_secs()),
            behavior,
        })
        .context(error::EncodeBodySnafu)?;
        let response = self
            .http
            .request(
                Method::PUT,
                &["session", "create"],
                &[],
                Some(body),
                None,
            )
            .await?;
        if response.status != StatusCode::OK {
            return error::UnexpectedStatusSnafu {
                status: response.status.as_u16(),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            }
            .fail();
        }
        let created: CreateResponse =
            serde_json::from_slice(&response.body).map_err(|err| Error::MalformedResponse {
                message: format!("session create response: {err}"),
            })?;
        Ok(SessionHandle {
            client: self.clone(),
            id: created.id,
            ttl,
            behavior,
        })
    }
}

/// A created session. Renewing and destroying go through the handle; the
/// renewer task is expected to be the only caller of either.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    client: SessionClient,
    id: String,
    ttl: Duration,
    behavior: SessionBehavior,
}

impl SessionHandle {
    /// The backend-assigned session id (a UUID).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The TTL the session was created with.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The configured end-of-life behavior.
    pub fn behavior(&self) -> SessionBehavior {
        self.behavior
    }

    /// Extend the lease. `Ok(false)` means the backend already invalidated
    /// the session; any status other than 200/404 is a hard error.
    pub async fn renew(&self) -> Result<bool> {
        let response = self
            .client
            .http
            .request(
                Method::PUT,
                &["session", "renew", &self.id],
                &[],
                None,
                None,
            )
            .await?;
        match response.status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => error::UnexpectedStatusSnafu {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            }
            .fail(),
        }
    }

    /// End the session. True only for a 200 response whose body is `true`.
    pub async fn destroy(&self) -> Result<bool> {
        let response = self
            .client
            .http
            .request(
                Method::PUT,
                &["session", "destroy", &self.id],
                &[],
                None,
                None,
            )
            .await?;
        if response.status != StatusCode::OK {
            return Ok(false);
        }
        Ok(serde_json::from_slice(&response.body).unwrap_or(false))
    }
}
