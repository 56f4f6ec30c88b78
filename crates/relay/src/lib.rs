//! Collaborative document relay: OT submission over a versioned op log,
//! channel fan-out, WebSocket sessions and presence.

pub mod api;
pub mod app;
pub mod collab;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod metrics;
pub mod permissions;
pub mod presence;
pub mod pubsub;
pub mod store;
pub mod sync;
pub mod ws;
