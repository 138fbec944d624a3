//! Error types for Consul client operations.

use snafu::Snafu;

/// Errors surfaced by the HTTP, KV, and session layers.
///
/// Precondition failures (a CAS or session-acquire that returned `false`)
/// are not errors; those operations return `Ok(false)`. Session loss and
/// cancellation travel through the done token, never through this type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The request never produced a response (timeout, connection reset,
    /// DNS failure). Transient; callers retry.
    #[snafu(display("transport error: {source}"))]
    Transport {
        /// The underlying client error.
        source: reqwest::Error,
    },

    /// The backend answered with a status the operation does not document.
    #[snafu(display("unexpected status {status}: {body}"))]
    UnexpectedStatus {
        /// HTTP status code of the response.
        status: u16,
        /// Response body, for log context.
        body: String,
    },

    /// The response body could not be decoded.
    #[snafu(display("malformed response: {message}"))]
    MalformedResponse {
        /// What failed to decode.
        message: String,
    },

    /// A blocking-query response carried a missing, unparsable, or zero
    /// `X-Consul-Index` header. Protocol invariant violation.
    #[snafu(display("invalid blocking-query index {value}"))]
    InvalidIndex {
        /// The offending index value (0 when the header was absent).
        value: u64,
    },

    /// The configured Consul address is not a usable base URL.
    #[snafu(display("invalid consul address '{address}': {source}"))]
    InvalidAddress {
        /// The address as configured.
        address: String,
        /// The underlying parse error.
        source: url::ParseError,
    },

    /// A request body failed to serialize.
    #[snafu(display("failed to encode request body: {source}"))]
    EncodeBody {
        /// The underlying serialization error.
        source: serde_json::Error,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
