//! drawbridge relay library
//!
//! A trusted relay that accepts large encrypted payloads from authenticated
//! clients, reassembles them from chunks, verifies them, and either pushes
//! them to a managed clone of a GitHub repository or stores them as durable
//! files. The payload is protected by an application-layer envelope
//! independent of the TLS channel.

pub mod config;
pub mod error;
pub mod logging;
pub mod repo;
pub mod server;
pub mod sessions;
pub mod storage;
pub mod transport;
