//! espalier - resilient client core for the Filevine API
//!
//! This library maintains an authenticated session, throttles outbound
//! traffic against the server's rate limit, executes requests with
//! consistent error classification, and transparently pages through
//! list endpoints. All requests flow through a [`ConnectionManager`].
//!
//! # Example
//!
//! ```no_run
//! use espalier::{Espalier, Region};
//! use futures_util::TryStreamExt;
//!
//! # async fn example() -> Result<(), espalier::Error> {
//! let client = Espalier::connect(
//!     "credentials.json",
//!     Region::UnitedStates.into(),
//!     None,
//!     Some(8.0), // requests per second granted by the server
//! )
//! .await?;
//!
//! {
//!     let mut projects = std::pin::pin!(client.conn().list("/core/projects", &[]));
//!     while let Some(project) = projects.try_next().await? {
//!         println!("{}", project["projectId"]);
//!     }
//! }
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod limiter;
pub mod types;

mod facade;

// Re-export primary types at crate root for convenience
pub use auth::{Credential, SessionManager};
pub use client::{ConnectionManager, PageOptions, RateLimitPolicy};
pub use error::Error;
pub use facade::Espalier;
pub use limiter::RateLimiter;
pub use types::{ApiUrl, Region};

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;
