//! Offline-capable messaging between agents.
//!
//! Outbound messages are persisted to a local SQLite store, held in a
//! bounded priority queue and delivered to a hosted [`backend::Backend`]
//! with retries, circuit breaking and delivery acknowledgments. When the
//! backend is unreachable messages keep accumulating locally; a single
//! reconnection manager probes for the backend and, once it is back, the
//! queue is reconciled with the store and drained. Vector clocks published
//! alongside each message let clients detect concurrent updates.
//!
//! [`pipeline::Pipeline`] is the entry point.

pub mod ack;
pub mod backend;
pub mod circuit;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod message;
pub mod offline;
pub mod pipeline;
pub mod processing;
pub mod queue;
pub mod reconnect;
pub mod recovery;
pub mod retry;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod utils;

pub use error::{Error, Result};
pub use pipeline::{Pipeline, QueueStatus};
