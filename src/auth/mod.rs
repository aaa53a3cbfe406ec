//! Credential handling and session lifecycle management.

mod credential;
mod session;

pub use credential::Credential;
pub use session::SessionManager;
