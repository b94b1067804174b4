//! Process-wide manager for chunked blob transfers.
//!
//! [`TransferManager`] schedules the chunks of every transfer under one
//! concurrency ceiling, persists each record change through a
//! [`RecordStore`], and pauses or resumes transfers as the network changes.
//! Applications create transfers through a [`BlobClient`].

pub mod client;
pub mod config;
pub mod manager;
pub mod policy;
pub mod reachability;
pub mod store;
pub mod transfer;
pub mod types;

pub use client::BlobClient;
pub use config::{ClientOptions, ConfigError, ManagerConfig, default_config_path};
pub use manager::TransferManager;
pub use policy::{RetryPolicy, TransferNetworkPolicy};
pub use reachability::{Reachability, ReachabilityHandle};
pub use store::{JsonFileStore, MemoryStore, RecordStore, StoreError, default_store_dir};
pub use transfer::Transfer;
pub use types::{ClientRegistration, TransferDelegate, TransferEvent};
