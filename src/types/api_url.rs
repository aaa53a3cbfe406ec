//! API base URL type and regional presets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::Error;

/// A validated API base URL.
///
/// This type ensures the URL is absolute, uses HTTPS (or HTTP for
/// localhost, which the tests rely on), and is normalized for endpoint
/// construction.
///
/// # Example
///
/// ```
/// use espalier::ApiUrl;
///
/// let base = ApiUrl::new("https://api.filevine.io").unwrap();
/// assert_eq!(base.endpoint_url("/core/projects"),
///            "https://api.filevine.io/core/projects");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ApiUrl(Url);

impl ApiUrl {
    /// Create a new API base URL from a string, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not absolute, has no host, or uses
    /// a scheme other than HTTPS (HTTP is allowed only for localhost).
    pub fn new(s: impl AsRef<str>) -> Result<Self, Error> {
        let s = s.as_ref();
        let url = Url::parse(s).map_err(|e| Error::InvalidUrl {
            value: s.to_string(),
            reason: e.to_string(),
        })?;

        Self::validate(&url, s)?;

        Ok(Self(url))
    }

    /// Returns the absolute URL for a resource endpoint.
    ///
    /// The endpoint is expected to start with a slash, e.g.
    /// `/core/projects`.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        // The url crate keeps a trailing slash on root paths.
        let base = self.0.as_str().trim_end_matches('/');
        format!("{}{}", base, endpoint)
    }

    /// Returns the session (authentication) endpoint URL.
    pub fn session_url(&self) -> String {
        self.endpoint_url("/session")
    }

    /// Returns the base URL as a string.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the host string.
    pub fn host(&self) -> Option<&str> {
        self.0.host_str()
    }

    fn validate(url: &Url, original: &str) -> Result<(), Error> {
        if url.cannot_be_a_base() {
            return Err(Error::InvalidUrl {
                value: original.to_string(),
                reason: "must be an absolute URL".to_string(),
            });
        }

        let scheme = url.scheme();
        let is_localhost = url
            .host_str()
            .is_some_and(|h| h == "localhost" || h == "127.0.0.1" || h == "::1");

        if scheme != "https" && !(scheme == "http" && is_localhost) {
            return Err(Error::InvalidUrl {
                value: original.to_string(),
                reason: "must use HTTPS (HTTP allowed only for localhost)".to_string(),
            });
        }

        if url.host_str().is_none() {
            return Err(Error::InvalidUrl {
                value: original.to_string(),
                reason: "must have a host".to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for ApiUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ApiUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for ApiUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for ApiUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ApiUrl::new(&s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<str> for ApiUrl {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

/// Known regional API endpoints.
///
/// A closed set of named presets; arbitrary base URLs go through
/// [`ApiUrl::new`] directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    /// `https://api.filevine.io`
    UnitedStates,
    /// `https://api.filevine.ca`
    Canada,
}

impl Region {
    /// Resolve the preset to its base URL.
    pub fn base_url(self) -> ApiUrl {
        let url = match self {
            Region::UnitedStates => "https://api.filevine.io",
            Region::Canada => "https://api.filevine.ca",
        };
        ApiUrl::new(url).expect("regional endpoint URL is valid")
    }
}

impl From<Region> for ApiUrl {
    fn from(region: Region) -> Self {
        region.base_url()
    }
}
