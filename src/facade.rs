//! Top-level entry point tying credentials, base URL, and connection
//! together.

use std::path::Path;

use tracing::instrument;

use crate::auth::Credential;
use crate::client::ConnectionManager;
use crate::error::Error;
use crate::types::ApiUrl;

/// A scoped, ready-to-use API client.
///
/// Loads credentials from a file and opens a [`ConnectionManager`];
/// request verbs and pagination live on the connection.
///
/// # Example
///
/// ```no_run
/// use espalier::{Espalier, Region};
///
/// # async fn example() -> Result<(), espalier::Error> {
/// let client = Espalier::connect(
///     "credentials.json",
///     Region::UnitedStates.into(),
///     None,
///     Some(8.0),
/// )
/// .await?;
///
/// let me = client.conn().get("/utils/whoami", None, None).await?;
/// println!("{me}");
///
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Espalier {
    conn: ConnectionManager,
}

impl Espalier {
    /// Load credentials from `credentials_file` and open an
    /// authenticated connection to `base`.
    ///
    /// `max_connections` and `requests_per_second` are passed through
    /// to [`ConnectionManager::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] / [`Error::Configuration`] for credential
    /// file problems and [`Error::Auth`] / [`Error::Transport`] for
    /// handshake failures.
    #[instrument(skip(credentials_file), fields(base = %base))]
    pub async fn connect(
        credentials_file: impl AsRef<Path>,
        base: ApiUrl,
        max_connections: Option<usize>,
        requests_per_second: Option<f64>,
    ) -> Result<Self, Error> {
        let credential = Credential::from_file(credentials_file)?;
        let conn =
            ConnectionManager::connect(base, credential, max_connections, requests_per_second)
                .await?;
        Ok(Self { conn })
    }

    /// The underlying connection.
    pub fn conn(&self) -> &ConnectionManager {
        &self.conn
    }

    /// Close the connection, draining in-flight requests.
    pub async fn close(self) {
        self.conn.close().await;
    }
}
