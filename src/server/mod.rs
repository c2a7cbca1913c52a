//! Server module
//!
//! HTTP surface of the relay: authentication, envelope decryption, route
//! dispatch, and testable startup.

pub mod auth;
pub mod envelope;
pub mod routes;
pub mod startup;

pub use envelope::BinaryPayload;
pub use routes::{build_router, AppState};
pub use startup::{run_server_with_config, ServerConfig, ServerHandle};
