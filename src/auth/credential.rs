//! API credential type.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// An API key/secret pair for authenticating with the service.
///
/// Immutable after load; owned by the session manager for the lifetime
/// of the connection.
///
/// # Security
///
/// The secret is never exposed in Debug output to prevent accidental
/// logging.
///
/// # Example
///
/// ```
/// use espalier::Credential;
///
/// let credential = Credential::new("fvpat-abc123", "shhh");
/// assert_eq!(credential.key(), "fvpat-abc123");
/// ```
pub struct Credential {
    key: String,
    secret: String,
}

/// Raw shape of a credentials file; fields validated after parse so a
/// missing key/secret reports a configuration error, not a serde one.
#[derive(Deserialize)]
struct RawCredential {
    key: Option<String>,
    secret: Option<String>,
}

impl Credential {
    /// Create a credential from an in-memory key and secret.
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
        }
    }

    /// Load a credential from a JSON file.
    ///
    /// The file must contain `key` and `secret` as top-level string
    /// fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and
    /// [`Error::Configuration`] if either field is missing or the file
    /// is not valid JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        let raw: RawCredential = serde_json::from_str(&contents)
            .map_err(|e| Error::Configuration(format!("invalid credentials file: {e}")))?;

        match (raw.key, raw.secret) {
            (Some(key), Some(secret)) => Ok(Self { key, secret }),
            _ => Err(Error::Configuration(
                "credentials file must contain 'key' and 'secret' as top-level fields".into(),
            )),
        }
    }

    /// Returns the API key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the API secret.
    ///
    /// # Security
    ///
    /// Use this only when computing the handshake hash. Never log or
    /// display this value.
    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

// Intentionally hide the secret in Debug output
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("key", &self.key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

// Clone is intentionally implemented (not Copy) so credential passing
// stays explicit.
impl Clone for Credential {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            secret: self.secret.clone(),
        }
    }
}
