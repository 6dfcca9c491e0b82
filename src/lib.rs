//! FloodKV - a replicated, eventually consistent key-value store node
//!
//! FloodKV gossips versioned key/value records with a set of peer stores
//! in one or more logically isolated *areas*, converging to a
//! deterministic view under peer churn and transient RPC failures.
//!
//! # Key Features
//!
//! - **Per-area isolation**: Each store holds an independent database per
//!   configured area; keys never cross areas
//! - **Dominance conflict resolution**: The highest (version, originator,
//!   value) record wins - a total order, so merge is delivery-order
//!   independent
//! - **3-way full sync**: New or errored peers are brought to parity by a
//!   hash exchange followed by a differential transfer in both directions
//! - **Loop-free flooding**: Accepted updates propagate incrementally to
//!   initialized peers, with the traversed-node path preventing re-entry
//!   on cyclic topologies
//! - **In-process fan-out**: Accepted publications and lifecycle events
//!   are delivered to an embedded subscriber through a single queue
//! - **Transport-generic**: The store is polymorphic over a client
//!   capability; an HTTP flavor and an in-process flavor ship in the box
//! - **In-memory**: Durability is the embedder's concern - replay from an
//!   authoritative source on restart
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use floodkv::{LocalStoreClient, Store, StoreConfig};
//! use floodkv::types::Value;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = LocalStoreClient::new();
//! let config = StoreConfig::new("node-1", vec!["default".to_string()]);
//! let mut store = Store::new(config, client);
//! store.run().await?;
//!
//! store
//!     .set_key("default", "key", Value::new(1, "node-1", b"value".to_vec()), None)
//!     .await;
//! let record = store.get_key("default", "key").await;
//! assert_eq!(record.unwrap().value.as_deref(), Some(&b"value"[..]));
//! store.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Non-goals
//!
//! FloodKV intentionally does NOT provide:
//! - Strong consistency or a total order of updates across peers
//! - Persistent on-disk storage
//! - Authentication or encryption of the peer channel
//! - Entry expiration (ttl fields are carried but never enforced)

pub mod client;
pub mod config;
pub mod db;
pub mod flood;
pub mod metrics;
pub mod peers;
pub mod queue;
pub mod server;
pub mod store;
pub mod sync;
pub mod types;

pub use client::{HttpStoreClient, LocalStoreClient, StoreClient};
pub use config::StoreConfig;
pub use store::{Store, StoreHandle};

#[cfg(test)]
mod tests;
