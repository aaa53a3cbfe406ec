//! The authenticated, rate-limited connection to the API.
//!
//! All verbs flow through one pipeline with a fixed ordering:
//! refresh-the-session, then acquire-a-token, then send, then classify
//! the response. The ordering is an explicit contract, not an accident
//! of decorator nesting.

mod paginate;

pub use paginate::{DEFAULT_PAGE_LIMIT, PageOptions, RateLimitPolicy};

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, instrument, trace};

use crate::auth::{Credential, SessionManager};
use crate::error::Error;
use crate::limiter::RateLimiter;
use crate::types::ApiUrl;

/// Query parameters for a request, applied in order.
pub type Query = [(String, String)];

/// Session header carrying the current refresh token.
const SESSION_HEADER: HeaderName = HeaderName::from_static("x-fv-sessionid");

/// Total (connect + transfer) timeout for every request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Grace period after dropping the transport, letting in-flight
/// connections drain instead of resetting them mid-close.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// A single authenticated, rate-limited, pooled channel to the API.
///
/// Construction performs the initial session handshake, so a
/// `ConnectionManager` is always usable once it exists. It is the sole
/// owner of its [`SessionManager`] and (optional) [`RateLimiter`];
/// concurrent requests from the same instance share both.
///
/// # Example
///
/// ```no_run
/// use espalier::{ConnectionManager, Credential, Region};
///
/// # async fn example() -> Result<(), espalier::Error> {
/// let conn = ConnectionManager::connect(
///     Region::UnitedStates.into(),
///     Credential::new("fvpat-key", "fvpat-secret"),
///     None,
///     Some(8.0),
/// )
/// .await?;
///
/// let doc = conn.get("/core/documents/42", None, None).await?;
/// println!("{doc}");
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    base: ApiUrl,
    http: reqwest::Client,
    session: SessionManager,
    limiter: Option<RateLimiter>,
}

impl ConnectionManager {
    /// Open a connection: build the pooled transport, perform the
    /// initial handshake, and set up throttling.
    ///
    /// `max_connections` bounds the transport's connection pool per
    /// host. When `requests_per_second` is `None` no rate limiter is
    /// configured at all — requests are not throttled, rather than
    /// throttled to zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the handshake is rejected and
    /// [`Error::Transport`] if the endpoint is unreachable.
    #[instrument(skip(credential), fields(base = %base))]
    pub async fn connect(
        base: ApiUrl,
        credential: Credential,
        max_connections: Option<usize>,
        requests_per_second: Option<f64>,
    ) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("espalier/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT);
        if let Some(limit) = max_connections {
            builder = builder.pool_max_idle_per_host(limit);
        }
        let http = builder.build()?;

        let session = SessionManager::initialize(http.clone(), credential, &base).await?;
        let limiter = requests_per_second.map(RateLimiter::new);

        debug!(throttled = limiter.is_some(), "connection ready");

        Ok(Self {
            base,
            http,
            session,
            limiter,
        })
    }

    /// GET a resource. Expects HTTP 200 and returns the JSON body.
    ///
    /// Caller-supplied headers are sent as given, except the session
    /// and authorization headers, whose caller-provided values are
    /// ignored in favor of the session's own.
    pub async fn get(
        &self,
        endpoint: &str,
        query: Option<&Query>,
        headers: Option<HeaderMap>,
    ) -> Result<Value, Error> {
        self.execute(Method::GET, endpoint, query, None, headers, StatusCode::OK)
            .await
    }

    /// PATCH a resource with a JSON body. Expects HTTP 200.
    pub async fn patch(
        &self,
        endpoint: &str,
        body: &Value,
        headers: Option<HeaderMap>,
    ) -> Result<Value, Error> {
        self.execute(
            Method::PATCH,
            endpoint,
            None,
            Some(body),
            headers,
            StatusCode::OK,
        )
        .await
    }

    /// POST a resource with a JSON body. Expects HTTP 200.
    pub async fn post(
        &self,
        endpoint: &str,
        body: &Value,
        headers: Option<HeaderMap>,
    ) -> Result<Value, Error> {
        self.execute(
            Method::POST,
            endpoint,
            None,
            Some(body),
            headers,
            StatusCode::OK,
        )
        .await
    }

    /// DELETE a resource. Expects HTTP 204 and returns `Value::Null`.
    ///
    /// Any other status — including a 200 — is a failure: an endpoint
    /// answering 200 to a DELETE did not do what this client asked.
    pub async fn delete(&self, endpoint: &str, headers: Option<HeaderMap>) -> Result<Value, Error> {
        self.execute(
            Method::DELETE,
            endpoint,
            None,
            None,
            headers,
            StatusCode::NO_CONTENT,
        )
        .await
    }

    /// The session manager owned by this connection.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// The rate limiter, if one was configured.
    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    /// The API base URL.
    pub fn base_url(&self) -> &ApiUrl {
        &self.base
    }

    /// Close the connection, waiting a grace period for in-flight
    /// connections to drain.
    pub async fn close(self) {
        drop(self);
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }

    /// The verb pipeline: refresh, throttle, send, classify.
    #[instrument(skip(self, query, body, extra_headers), fields(%method, endpoint))]
    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        query: Option<&Query>,
        body: Option<&Value>,
        extra_headers: Option<HeaderMap>,
        expected: StatusCode,
    ) -> Result<Value, Error> {
        self.session.ensure_fresh().await?;

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let url = self.base.endpoint_url(endpoint);
        let mut request = self.http.request(method, &url);
        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request = request.headers(self.auth_headers(extra_headers).await);

        let response = request.send().await?;
        self.classify(response, expected).await
    }

    /// Session headers for a request, overriding any caller-supplied
    /// values for the two authenticated header names.
    async fn auth_headers(&self, extra: Option<HeaderMap>) -> HeaderMap {
        let (session_id, access_token) = self.session.header_tokens().await;

        let mut headers = extra.unwrap_or_default();
        headers.insert(
            SESSION_HEADER,
            HeaderValue::from_str(&session_id).expect("server-issued token is valid ASCII"),
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}"))
                .expect("server-issued token is valid ASCII"),
        );
        headers
    }

    /// Response classification, one transition per call.
    ///
    /// Only the success and 429 paths touch the rate limiter; every
    /// other status surfaces without notifying it.
    async fn classify(
        &self,
        response: reqwest::Response,
        expected: StatusCode,
    ) -> Result<Value, Error> {
        let status = response.status();
        let url = response.url().to_string();
        trace!(%status, %url, "classifying response");

        if status == expected {
            if let Some(limiter) = &self.limiter {
                limiter.report_outcome(true).await;
            }
            if expected == StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            return Ok(response.json().await?);
        }

        let message = response.text().await.unwrap_or_default();

        if status == StatusCode::TOO_MANY_REQUESTS {
            if let Some(limiter) = &self.limiter {
                limiter.report_outcome(false).await;
            }
            debug!(%url, "server rate limit exceeded");
            return Err(Error::RateLimitExceeded { url, message });
        }

        Err(Error::Http {
            status: status.as_u16(),
            url,
            message,
        })
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("base", &self.base)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}
