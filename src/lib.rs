//! # chronicle-head
//!
//! Period-rotated, write-ahead-logged in-memory chunk index for
//! multi-tenant time-series heads.
//!
//! ## Features
//!
//! - **Striped series index**: concurrent appends and label-matcher queries per tenant
//! - **Durability**: every append is logged to a checksummed WAL before it is applied
//! - **Crash recovery**: WAL replay repairs torn tails and refuses undecodable records
//! - **Rotation**: one head per period, handed to a durable builder on rollover
//! - **Composition**: `MultiIndex` joins the live head with built periods
//!
//! ## Modules
//!
//! - [`storage`]: Data types, WAL, recovery and on-disk layout
//! - [`index`]: Series index, tenant heads, matchers and multi-index
//! - [`manager`]: Head manager and builder collaborator
//! - [`config`]: TOML and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chronicle_head::*;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let builder = Arc::new(MemoryBuilder::new(DEFAULT_STRIPE_SIZE));
//!     let manager = Arc::new(HeadManager::new(
//!         "index",
//!         "./data",
//!         HeadManagerOptions::default(),
//!         builder.clone(),
//!     ));
//!
//!     // Recover unbuilt WALs and open the current head
//!     manager.start()?;
//!
//!     let labels: LabelSet = r#"{app="api", env="prod"}"#.parse()?;
//!     manager.append("tenant1", &labels, labels.stable_hash(), &[ChunkMeta::new(1, 10, 0)])?;
//!
//!     // Live head plus everything already built
//!     let index = MultiIndex::new(vec![manager.clone() as Arc<dyn ChunkIndex>, builder]);
//!     let matchers = [Matcher::equal("app", "api")];
//!     let query = ChunkQuery::new("tenant1", 0, 100).matchers(&matchers);
//!
//!     let mut refs = Vec::new();
//!     index.get_chunk_refs(&QueryContext::new(), &query, &mut refs)?;
//!     println!("Found {} chunks", refs.len());
//!
//!     manager.stop()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod manager;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    recover_head, ChunkMeta, ChunkRef, Fingerprint, HeadError, HeadResult, HeadWal, LabelSet,
    Period, RecoveryMode, RecoveryReport, StoreLayout, WalOptions, WalRecord, WalSyncMode,
};

pub use index::{
    ChunkFilter, ChunkIndex, ChunkQuery, HeadStats, Matcher, MultiIndex, QueryContext,
    TenantHeads, DEFAULT_STRIPE_SIZE,
};

pub use manager::{HeadManager, HeadManagerOptions, IndexBuilder, ManagerStats, MemoryBuilder};

pub use config::{Config, ConfigError, HeadConfig, LoggingConfig};
