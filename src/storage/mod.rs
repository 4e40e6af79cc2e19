//! Head Storage
//!
//! This module provides the durable side of the head index:
//!
//! - **types**: Core data structures (ChunkMeta, LabelSet, ChunkRef)
//! - **record**: WAL record payloads (series definitions, chunk metas)
//! - **wal**: Segmented write-ahead log with checksummed envelopes
//! - **recovery**: WAL replay with tail-damage repair
//! - **layout**: Directory layout, periods and WAL groups
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   append → WalRecord → WAL segment (flush/fsync) → TenantHeads
//!
//! Recovery Path:
//!   WAL group → segments → envelopes → WalRecord → TenantHeads
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use chronicle_head::storage::{HeadWal, WalOptions, WalRecord, ChunkMeta, LabelSet};
//! use chrono::Utc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let wal = HeadWal::open("./data/index/wal/1700000000", Utc::now(), WalOptions::default())?;
//!
//!     let labels: LabelSet = r#"{app="api"}"#.parse()?;
//!     let fp = labels.stable_hash();
//!     wal.log_all(&[
//!         WalRecord::series("tenant1", fp, &labels),
//!         WalRecord::chunk_metas("tenant1", fp, &[ChunkMeta::new(1, 10, 0)]),
//!     ])?;
//!
//!     wal.stop()?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod layout;
pub mod record;
pub mod recovery;
pub mod types;
pub mod wal;

// Re-export commonly used types
pub use error::{DecodeError, HeadError, HeadResult};
pub use layout::{legacy_wals, list_wals, wal_groups, wals_for_period, Period, StoreLayout, WalGroup, WalIdentifier};
pub use record::{ChunkMetasRecord, SeriesRecord, WalRecord};
pub use recovery::{recover_head, DamageKind, RecoveryMode, RecoveryReport, TailDamage};
pub use types::{ChunkMeta, ChunkRef, Fingerprint, Label, LabelSet};
pub use wal::{list_segments, Envelope, HeadWal, SegmentReader, WalOptions, WalSyncMode};
