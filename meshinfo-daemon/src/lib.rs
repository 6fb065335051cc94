//! Meshinfo daemon: ordered ingestion around `meshinfo-core`, with an event
//! hub, pluggable persistence and a query service.

pub mod config;
pub mod daemon;
pub mod hub;
pub mod ingest;
pub mod persistence;
pub mod service;
pub mod source;

pub use config::Config;
pub use daemon::Daemon;
pub use hub::{EventHub, HubMessage, Subscription};
pub use ingest::BusRecord;
pub use service::{MeshService, NodeView};
