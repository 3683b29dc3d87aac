//! Relay fleet status poller.
//!
//! Polls every relay advertised by a directory service, compensates each
//! relay's cumulative byte counter for restarts, stores one snapshot per cycle
//! in sled, and serves the latest snapshot with fleet totals over HTTP.

pub mod agent;
pub mod config;
pub mod discovery;
pub mod export;
pub mod poller;
pub mod reconcile;
pub mod relay;
pub mod server;
pub mod store;
pub mod view;
