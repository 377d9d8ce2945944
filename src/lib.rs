/// Server key API
///
/// Resolves, caches and persists the public keys remote federation servers
/// sign their traffic with, and serves them to other components over an
/// internal HTTP API.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod keys;
pub mod metrics;
pub mod server;
