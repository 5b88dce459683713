//! cellgate edge gateway
//!
//! Collects telemetry from machine tools on the shop floor, normalizes it into one canonical
//! event shape and forwards it in batches to the site hub, spooling to disk when the hub is
//! out of reach.

pub mod adapters;
pub mod config;
pub mod gateway;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod normalizer;
pub mod queue;
pub mod uplink;

pub use gateway::{Gateway, GatewayError};
pub use models::{Batch, Execution, MachineEvent};
