//! # PulseDB
//!
//! An embedded, single-file database for agentic AI systems. PulseDB
//! persists *experiences* (text + embedding + metadata), groups them into
//! isolated *collectives*, and answers blended retrieval queries mixing
//! vector similarity, recency, typed relations, derived insights and live
//! agent activity. Consumers link it into their own process; there is no
//! server.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pulsedb::{Config, NewExperience, PulseDb};
//!
//! # fn main() -> pulsedb::Result<()> {
//! let db = PulseDb::open("./pulse.db", Config::default())?;
//! let collective = db.create_collective("my-project")?;
//!
//! let id = db.record_experience(NewExperience {
//!     collective_id: collective,
//!     content: "always validate user input before processing".into(),
//!     embedding: Some(vec![0.1; 384]),
//!     importance: 0.8,
//!     ..Default::default()
//! })?;
//!
//! let hits = db.search_similar(collective, &vec![0.1; 384], 10)?;
//! assert_eq!(hits[0].0.id, id);
//!
//! db.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **KV store**: redb, the transactional source of truth. ACID commits,
//!   MVCC snapshot reads, secondary indexes, the change sequence number.
//! - **Vector indexes**: one HNSW graph per collective for experiences and
//!   one for insights, persisted as rebuildable sidecar files.
//! - **Watch fan-out**: bounded, non-blocking per-subscriber channels plus
//!   a poll-style change feed over the persisted changelog.
//!
//! Writes are serialized (single writer per database, advisory file lock
//! across processes); reads take independent snapshots and never block.
//!
//! ## Thread safety
//!
//! [`PulseDb`] is `Send + Sync`; wrap it in `Arc` to share across threads.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod activity;
mod collective;
mod config;
mod context;
mod db;
mod error;
mod experience;
mod filter;
mod insight;
mod lock;
mod relation;
mod types;
mod watch;

pub mod embedding;
pub mod storage;
pub mod vector;

pub use activity::{Activity, NewActivity};
pub use collective::{Collective, CollectiveStats};
pub use config::{
    Config, EmbeddingDimension, EmbeddingProvider, HnswConfig, Limits, Metric, SyncMode,
    WatchConfig,
};
pub use context::{ContextCandidates, ContextRequest};
pub use db::PulseDb;
pub use error::{NotFoundError, PulseError, Result, StorageError, ValidationError};
pub use experience::{
    Experience, ExperienceType, ExperienceUpdate, NewExperience, Severity,
};
pub use filter::SearchFilter;
pub use insight::{DerivedInsight, InsightType, NewInsight};
pub use relation::{ExperienceRelation, NewRelation, RelationDirection, RelationType};
pub use types::{
    AgentId, CollectiveId, Csn, Embedding, ExperienceId, InsightId, RelationId, TaskId, Timestamp,
};
pub use watch::{WatchEvent, WatchEventKind, WatchFilter, WatchSubscription};

/// Convenient imports for common usage.
///
/// ```rust
/// use pulsedb::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{Config, EmbeddingDimension, SyncMode};
    pub use crate::context::{ContextCandidates, ContextRequest};
    pub use crate::db::PulseDb;
    pub use crate::error::{PulseError, Result};
    pub use crate::experience::{Experience, ExperienceType, NewExperience};
    pub use crate::filter::SearchFilter;
    pub use crate::types::{CollectiveId, Csn, ExperienceId, Timestamp};
}
