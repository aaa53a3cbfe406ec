//! Session lifecycle: handshake, token storage, and proactive refresh.
//!
//! The session endpoint supports two handshake modes. The initial
//! **key** handshake proves possession of the API secret via a keyed
//! hash; the **session** handshake re-proves it and additionally
//! presents the current refresh token to obtain a new token pair
//! without interrupting traffic. Both replace the whole session state
//! on success.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::error::Error;
use crate::types::ApiUrl;

use super::credential::Credential;

/// Refresh the access token this many seconds before it expires.
const REFRESH_WINDOW_SECS: i64 = 90;

/// Settle delay after every handshake round-trip, success or failure.
const HANDSHAKE_SETTLE: Duration = Duration::from_millis(250);

/// Complete session state as issued by the server.
///
/// Replaced wholesale on every handshake; readers never observe a
/// partially updated state.
#[derive(Clone)]
struct SessionState {
    access_token: String,
    access_token_expiry: i64,
    refresh_token: String,
    #[allow(dead_code)]
    refresh_token_expiry: i64,
    #[allow(dead_code)]
    refresh_token_ttl: String,
    user_id: String,
    org_id: i64,
}

/// Body of a session-endpoint handshake.
///
/// The optional fields are present only in session mode. Field names,
/// the timestamp format, and the hash are part of the wire contract.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeRequest<'a> {
    mode: &'static str,
    api_key: &'a str,
    api_hash: &'a str,
    api_timestamp: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    org_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// Successful (HTTP 200) session-endpoint response.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeResponse {
    access_token: String,
    refresh_token: String,
    refresh_token_expiry: i64,
    refresh_token_ttl: String,
    user_id: String,
    org_id: i64,
}

/// Owns the credential and keeps the session tokens fresh.
///
/// One session manager belongs to one connection. Token state lives
/// behind a read/write lock; refreshes are serialized through a gate
/// mutex so concurrent callers trigger at most one handshake.
pub struct SessionManager {
    http: reqwest::Client,
    credential: Credential,
    auth_url: String,
    state: RwLock<SessionState>,
    refresh_gate: Mutex<()>,
}

impl SessionManager {
    /// Perform the initial key-mode handshake and return a manager
    /// holding the resulting session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the server rejects the handshake and
    /// [`Error::Transport`] if the endpoint is unreachable.
    #[instrument(skip(http, credential), fields(base = %base))]
    pub async fn initialize(
        http: reqwest::Client,
        credential: Credential,
        base: &ApiUrl,
    ) -> Result<Self, Error> {
        info!("creating new session");
        let auth_url = base.session_url();

        let timestamp = wire_timestamp();
        let hash = handshake_hash(credential.key(), &timestamp, credential.secret());
        let request = HandshakeRequest {
            mode: "key",
            api_key: credential.key(),
            api_hash: &hash,
            api_timestamp: &timestamp,
            user_id: None,
            org_id: None,
            session_id: None,
        };

        let state = perform_handshake(&http, &auth_url, &request).await?;
        debug!(user_id = %state.user_id, "session created");

        Ok(Self {
            http,
            credential,
            auth_url,
            state: RwLock::new(state),
            refresh_gate: Mutex::new(()),
        })
    }

    /// Perform a session-mode handshake, replacing the whole session
    /// state with the server's new token pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the server rejects the refresh.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), Error> {
        let _gate = self.refresh_gate.lock().await;
        self.refresh_locked().await
    }

    /// Refresh the session if the access token is inside the safety
    /// window before its expiry; no-op otherwise.
    ///
    /// Every outbound request honors this contract before sending.
    pub async fn ensure_fresh(&self) -> Result<(), Error> {
        if !self.needs_refresh().await {
            return Ok(());
        }

        // Re-check under the gate: a concurrent caller may have
        // refreshed while we waited for the lock.
        let _gate = self.refresh_gate.lock().await;
        if self.needs_refresh().await {
            self.refresh_locked().await?;
        }
        Ok(())
    }

    /// The session and bearer tokens for request headers, read from one
    /// consistent state snapshot.
    pub(crate) async fn header_tokens(&self) -> (String, String) {
        let state = self.state.read().await;
        (state.refresh_token.clone(), state.access_token.clone())
    }

    /// Epoch-seconds expiry of the current access token.
    pub async fn access_token_expiry(&self) -> i64 {
        self.state.read().await.access_token_expiry
    }

    /// The authenticated user id.
    pub async fn user_id(&self) -> String {
        self.state.read().await.user_id.clone()
    }

    /// The authenticated org id.
    pub async fn org_id(&self) -> i64 {
        self.state.read().await.org_id
    }

    async fn needs_refresh(&self) -> bool {
        let expiry = self.state.read().await.access_token_expiry;
        within_refresh_window(Utc::now().timestamp(), expiry)
    }

    async fn refresh_locked(&self) -> Result<(), Error> {
        info!("refreshing session");

        // Snapshot what the session-mode body needs, then drop the read
        // lock before the round-trip.
        let (user_id, org_id, session_id) = {
            let state = self.state.read().await;
            (
                state.user_id.clone(),
                state.org_id,
                state.refresh_token.clone(),
            )
        };

        let timestamp = wire_timestamp();
        let hash = handshake_hash(self.credential.key(), &timestamp, self.credential.secret());
        let request = HandshakeRequest {
            mode: "session",
            api_key: self.credential.key(),
            api_hash: &hash,
            api_timestamp: &timestamp,
            user_id: Some(&user_id),
            org_id: Some(org_id),
            session_id: Some(&session_id),
        };

        let new_state = perform_handshake(&self.http, &self.auth_url, &request).await?;

        *self.state.write().await = new_state;
        debug!("session refreshed");
        Ok(())
    }
}

// Custom Debug impl that hides token material
impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("auth_url", &self.auth_url)
            .field("credential", &self.credential)
            .field("state", &"[REDACTED]")
            .finish()
    }
}

/// Whether `now` has entered the proactive-refresh window before
/// `expiry`.
fn within_refresh_window(now: i64, expiry: i64) -> bool {
    now > expiry - REFRESH_WINDOW_SECS
}

/// Current UTC timestamp in the wire format the session endpoint
/// expects: ISO-8601 with millisecond precision and a literal `Z`.
fn wire_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Keyed handshake hash: hex MD5 digest of `key/timestamp/secret`.
///
/// MD5 here is a wire-contract requirement of the session endpoint, not
/// a security choice this client gets to make.
fn handshake_hash(key: &str, timestamp: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{key}/{timestamp}/{secret}"));
    hex::encode(hasher.finalize())
}

/// Extract the `exp` claim from a JWT without verifying the signature.
///
/// The token was just issued by the server we authenticated against, so
/// it is trusted implicitly; this client has no key to verify against
/// and deliberately does not try.
fn access_token_expiry(token: &str) -> Result<i64, Error> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::MalformedToken("missing payload segment".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::MalformedToken(format!("payload is not base64url: {e}")))?;
    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|e| Error::MalformedToken(format!("payload has no usable exp claim: {e}")))?;
    Ok(claims.exp)
}

/// One session-endpoint round-trip, with the fixed settle delay applied
/// whether it succeeded or not.
async fn perform_handshake(
    http: &reqwest::Client,
    auth_url: &str,
    request: &HandshakeRequest<'_>,
) -> Result<SessionState, Error> {
    let result = async {
        let response = http.post(auth_url).json(request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Auth {
                status: status.as_u16(),
                url: auth_url.to_string(),
                message,
            });
        }

        let body: HandshakeResponse = response.json().await?;
        let access_token_expiry = access_token_expiry(&body.access_token)?;

        Ok(SessionState {
            access_token: body.access_token,
            access_token_expiry,
            refresh_token: body.refresh_token,
            refresh_token_expiry: body.refresh_token_expiry,
            refresh_token_ttl: body.refresh_token_ttl,
            user_id: body.user_id,
            org_id: body.org_id,
        })
    }
    .await;

    // Let the endpoint settle before the next call, matching the
    // service's expectations on handshake pacing.
    tokio::time::sleep(HANDSHAKE_SETTLE).await;

    result
}
