//! Error types for the espalier library.
//!
//! This module provides a unified error type with explicit variants for
//! authentication, rate limiting, HTTP classification, configuration, and
//! transport failures. Every server-originated failure carries the
//! originating URL and the server-provided message text.

use thiserror::Error;

/// The unified error type for espalier operations.
///
/// Variants are explicit so callers can handle specific cases: a
/// [`Error::RateLimitExceeded`] is recoverable by retrying, while
/// [`Error::Http`] and [`Error::Auth`] generally are not.
#[derive(Debug, Error)]
pub enum Error {
    /// The session handshake or refresh was rejected by the server.
    #[error("authentication failed: HTTP {status} from {url}: {message}")]
    Auth {
        /// HTTP status code returned by the session endpoint.
        status: u16,
        /// The session endpoint URL.
        url: String,
        /// Server-provided message text.
        message: String,
    },

    /// The server answered a resource call with HTTP 429.
    ///
    /// Callers are expected to retry; the rate limiter has already been
    /// told about the rejection and will back off on the next admission.
    #[error("rate limit exceeded at {url}: {message}")]
    RateLimitExceeded {
        /// The resource URL that was throttled.
        url: String,
        /// Server-provided message text.
        message: String,
    },

    /// Any other non-success status, including an unexpected 2xx
    /// (e.g. a 200 where a 204 was expected).
    #[error("HTTP {status} from {url}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// The resource URL.
        url: String,
        /// Server-provided message text.
        message: String,
    },

    /// Missing or invalid client-side configuration (credential fields).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network transport errors (DNS, TLS, connection, timeout, decode).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Failed to read a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A base URL that is not absolute, has no host, or uses a
    /// disallowed scheme.
    #[error("invalid base URL '{value}': {reason}")]
    InvalidUrl {
        /// The offending URL string.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The server issued an access token whose payload could not be
    /// decoded to extract the expiry claim.
    #[error("malformed access token: {0}")]
    MalformedToken(String),

    /// A list response was missing the `hasMore` flag or `items` array.
    #[error("unexpected response shape from {endpoint}: {message}")]
    UnexpectedResponse {
        /// The list endpoint that produced the response.
        endpoint: String,
        /// What was missing or malformed.
        message: String,
    },
}

impl Error {
    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Auth { status, .. } | Error::Http { status, .. } => Some(*status),
            Error::RateLimitExceeded { .. } => Some(429),
            _ => None,
        }
    }

    /// Whether this error is a server-side rate-limit rejection.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimitExceeded { .. })
    }
}
